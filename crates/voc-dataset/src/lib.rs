//! VOC dataset loading and input transformation.
//!
//! This crate parses the VOC multi-label annotation layout, loads images,
//! and produces transformed (input, label) examples through the
//! sequential provider contract consumed by training and evaluation.

pub mod index;
pub mod loader;
pub mod provider;
pub mod transform;

pub use index::VocIndex;
pub use loader::ImageLoader;
pub use provider::{collect_batch, VocProvider};
pub use transform::CropSampler;
