//! Run configuration for fine-tuning and evaluation.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{Error, Result, NUM_CLASSES};

/// Full configuration for one fine-tuning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Number of output classes
    pub num_classes: usize,
    /// VOC data directory, overridable on the command line
    #[serde(default)]
    pub voc_dir: Option<PathBuf>,
    /// Solver hyper-parameters
    pub solver: SolverParams,
    /// Input transform parameters
    pub transform: TransformParams,
    /// Network surgery parameters
    pub surgery: SurgeryParams,
    /// Random seed for reproducibility
    pub seed: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            num_classes: NUM_CLASSES,
            voc_dir: None,
            solver: SolverParams::default(),
            transform: TransformParams::default(),
            surgery: SurgeryParams::default(),
            seed: 42,
        }
    }
}

impl RunConfig {
    /// Validates the configuration before any stage runs.
    pub fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            return Err(Error::Config("number of classes must be positive".into()));
        }
        if self.solver.batch_size == 0 {
            return Err(Error::Config("batch size must be positive".into()));
        }
        if self.solver.base_lr <= 0.0 {
            return Err(Error::Config("base learning rate must be positive".into()));
        }
        if self.transform.min_scale > self.transform.max_scale {
            return Err(Error::Config(format!(
                "min scale {} exceeds max scale {}",
                self.transform.min_scale, self.transform.max_scale
            )));
        }
        Ok(())
    }
}

/// Solver kind. The update rule itself lives in the graph executor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SolverKind {
    /// Stochastic gradient descent with momentum
    Sgd,
    /// Nesterov accelerated gradient
    Nesterov,
}

impl std::fmt::Display for SolverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SolverKind::Sgd => write!(f, "SGD"),
            SolverKind::Nesterov => write!(f, "Nesterov"),
        }
    }
}

impl std::str::FromStr for SolverKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sgd" => Ok(SolverKind::Sgd),
            "nesterov" => Ok(SolverKind::Nesterov),
            other => Err(Error::Config(format!("unknown solver kind: {other}"))),
        }
    }
}

/// Solver hyper-parameters.
///
/// Defaults match the reference fine-tuning setup; there should be no
/// need to tune them per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverParams {
    /// Solver kind
    pub kind: SolverKind,
    /// Base learning rate
    pub base_lr: f64,
    /// Momentum coefficient
    pub momentum: f64,
    /// L2 weight decay
    pub weight_decay: f64,
    /// Global gradient-norm clip threshold
    pub clip_gradients: f64,
    /// Step LR decay factor
    pub gamma: f64,
    /// Iterations between LR decay steps
    pub stepsize: usize,
    /// Total number of optimization steps
    pub iterations: usize,
    /// Training batch size
    pub batch_size: usize,
    /// Iterations between intermediate weight snapshots
    pub snapshot_every: usize,
    /// Iterations between training-log lines
    pub display_every: usize,
}

impl Default for SolverParams {
    fn default() -> Self {
        Self {
            kind: SolverKind::Sgd,
            base_lr: 0.001,
            momentum: 0.9,
            weight_decay: 1e-6,
            clip_gradients: 10.0,
            gamma: 0.5,
            stepsize: 10_000,
            iterations: 80_000,
            batch_size: 16,
            snapshot_every: 10_000,
            display_every: 20,
        }
    }
}

/// Input transform parameters, applied identically during training and
/// evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformParams {
    /// Per-channel mean values subtracted from the input, in channel order
    pub mean: [f32; 3],
    /// Multiplier applied after mean subtraction
    pub scale: f32,
    /// Lower bound of the random scale augmentation
    pub min_scale: f32,
    /// Upper bound of the random scale augmentation
    pub max_scale: f32,
    /// Random horizontal mirroring
    pub mirror: bool,
    /// Resize images to this edge length before augmentation
    pub resize: Option<u32>,
}

impl Default for TransformParams {
    fn default() -> Self {
        Self {
            mean: DEFAULT_MEAN,
            scale: 1.0,
            min_scale: 0.5,
            max_scale: 2.0,
            mirror: true,
            resize: None,
        }
    }
}

/// Default per-channel mean.
pub const DEFAULT_MEAN: [f32; 3] = [104.0, 117.0, 123.0];

/// Resolves the effective mean from the `--mean-value` / `--no-mean` pair.
///
/// Supplying both is a validation error; a malformed list (length != 3)
/// is a validation error; absent both, the default mean applies.
pub fn resolve_mean(mean_value: Option<&str>, no_mean: bool) -> Result<[f32; 3]> {
    if no_mean {
        if mean_value.is_some() {
            return Err(Error::Config(
                "--mean-value cannot be combined with --no-mean".into(),
            ));
        }
        return Ok([0.0, 0.0, 0.0]);
    }
    match mean_value {
        None => Ok(DEFAULT_MEAN),
        Some(list) => parse_mean_values(list),
    }
}

/// Parses a comma-separated list of exactly three per-channel mean values.
pub fn parse_mean_values(list: &str) -> Result<[f32; 3]> {
    let values: Vec<f32> = list
        .split(',')
        .map(|v| {
            v.trim()
                .parse::<f32>()
                .map_err(|e| Error::Config(format!("invalid mean value {v:?}: {e}")))
        })
        .collect::<Result<_>>()?;
    if values.len() != 3 {
        return Err(Error::Config(format!(
            "mean value list must have exactly 3 entries, got {}",
            values.len()
        )));
    }
    Ok([values[0], values[1], values[2]])
}

/// Network surgery parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SurgeryParams {
    /// Truncate the descriptor after this layer (inclusive)
    pub clip: Option<String>,
    /// Train only this layer and every layer after it
    pub train_from: Option<String>,
    /// Re-initialize this layer and every parameterized layer after it
    pub random_from: Option<String>,
}
