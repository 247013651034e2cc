//! Core types and utilities for VOC fine-tuning and evaluation.
//!
//! This crate provides the foundational types, configuration, metrics,
//! and execution-context handling shared by the dataset and training
//! crates and by the `train-cls` tool.

pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod types;

pub use config::*;
pub use context::*;
pub use error::{Error, Result};
pub use logging::*;
pub use metrics::*;
pub use types::*;

/// Number of VOC object classes.
pub const NUM_CLASSES: usize = 20;

/// Sentinel label excluded from loss and metric computation.
pub const IGNORE_LABEL: u8 = 255;

/// The VOC object classes, in canonical order.
pub const VOC_CLASSES: [&str; NUM_CLASSES] = [
    "aeroplane",
    "bicycle",
    "bird",
    "boat",
    "bottle",
    "bus",
    "car",
    "cat",
    "chair",
    "cow",
    "diningtable",
    "dog",
    "horse",
    "motorbike",
    "person",
    "pottedplant",
    "sheep",
    "sofa",
    "train",
    "tvmonitor",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_list_is_complete() {
        assert_eq!(VOC_CLASSES.len(), NUM_CLASSES);
        assert_eq!(VOC_CLASSES[0], "aeroplane");
        assert_eq!(VOC_CLASSES[NUM_CLASSES - 1], "tvmonitor");
    }
}
