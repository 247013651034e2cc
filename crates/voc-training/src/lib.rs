//! Training and evaluation infrastructure for VOC fine-tuning.
//!
//! This crate provides:
//! - Network descriptors and materialized networks with named layers
//! - Weight snapshot persistence and name-matched copying
//! - Layer-wise trainability scheduling and random re-initialization
//! - A burn-backed graph executor (forward passes and solver steps)
//! - The training orchestrator and the multi-crop evaluation engine

pub mod evaluator;
pub mod executor;
pub mod network;
pub mod schedule;
pub mod solver;
pub mod weights;

pub use evaluator::MultiCropEvaluator;
pub use executor::{BurnExecutor, GraphExecutor, InferenceBackend, TrainingBackend};
pub use network::{Blob, Layer, LayerKind, LayerSpec, Network, NetworkSpec};
pub use schedule::{random_init, step_lr, LayerPolicy, LayerSchedule, LearningPolicy};
pub use solver::Solver;
pub use weights::{find_snapshot, resolve_eval_weights, WeightSnapshot};
