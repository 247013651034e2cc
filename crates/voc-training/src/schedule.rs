//! Layer-wise trainability scheduling and random re-initialization.
//!
//! Both walks visit the descriptor's layers once, in topological order,
//! and flip a boolean exactly once: off until the boundary layer name
//! matches, on from the boundary layer (inclusive) to the end.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use voc_core::{Error, Result};

use crate::network::{Network, NetworkSpec, WEIGHT_INIT_STD};

/// Bias blob value written by the random re-initialization pass.
pub const RANDOM_INIT_BIAS: f32 = 0.1;

/// Learning-rate and decay multipliers for one blob.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LearningPolicy {
    /// Multiplier on the solver's learning rate
    pub lr_mult: f64,
    /// Multiplier on the solver's weight decay
    pub decay_mult: f64,
}

impl LearningPolicy {
    /// Fully frozen: no gradient, no weight decay.
    pub const FROZEN: Self = Self {
        lr_mult: 0.0,
        decay_mult: 0.0,
    };

    /// Whether this blob receives no updates.
    pub fn is_frozen(&self) -> bool {
        self.lr_mult == 0.0 && self.decay_mult == 0.0
    }
}

/// Per-layer policies: one for the weight blob, one for the bias blob.
#[derive(Debug, Clone)]
pub struct LayerPolicy {
    /// Layer name
    pub layer: String,
    /// Policy for blob 0
    pub weight: LearningPolicy,
    /// Policy for blob 1
    pub bias: LearningPolicy,
}

impl LayerPolicy {
    /// Whether any blob of this layer is trainable.
    pub fn is_trainable(&self) -> bool {
        !self.weight.is_frozen() || !self.bias.is_frozen()
    }
}

/// The planned trainability of every layer, in topological order.
#[derive(Debug, Clone)]
pub struct LayerSchedule {
    policies: Vec<LayerPolicy>,
}

impl LayerSchedule {
    /// Plans the schedule with the default multipliers: trainable weights
    /// get (lr 1, decay 1), trainable biases (lr 2, decay 1).
    pub fn plan(spec: &NetworkSpec, train_from: Option<&str>) -> Self {
        Self::plan_with_multipliers(spec, train_from, (1.0, 2.0), (1.0, 1.0))
    }

    /// Plans the schedule with explicit (weight, bias) multiplier pairs.
    ///
    /// Without a boundary every layer is trainable. With one, the walk
    /// activates at the boundary layer itself and stays active; layers
    /// before it are fully frozen. A boundary matching no layer leaves
    /// everything frozen and records a diagnostic, not an error.
    pub fn plan_with_multipliers(
        spec: &NetworkSpec,
        train_from: Option<&str>,
        (w_lr, b_lr): (f64, f64),
        (w_decay, b_decay): (f64, f64),
    ) -> Self {
        let mut active = train_from.is_none();
        let mut policies = Vec::with_capacity(spec.layers.len());

        for layer in &spec.layers {
            if !active {
                active = train_from == Some(layer.name.as_str());
            }
            let (weight, bias) = if active {
                (
                    LearningPolicy {
                        lr_mult: w_lr,
                        decay_mult: w_decay,
                    },
                    LearningPolicy {
                        lr_mult: b_lr,
                        decay_mult: b_decay,
                    },
                )
            } else {
                (LearningPolicy::FROZEN, LearningPolicy::FROZEN)
            };
            policies.push(LayerPolicy {
                layer: layer.name.clone(),
                weight,
                bias,
            });
        }

        if !active {
            tracing::warn!(
                "train-from layer {:?} matched nothing, not training any layers",
                train_from.unwrap_or_default()
            );
        }

        Self { policies }
    }

    /// Number of planned layers.
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Whether the schedule is empty.
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Policy at a layer ordinal.
    pub fn policy(&self, index: usize) -> &LayerPolicy {
        &self.policies[index]
    }

    /// Policy for a named layer.
    pub fn by_name(&self, name: &str) -> Option<&LayerPolicy> {
        self.policies.iter().find(|p| p.layer == name)
    }

    /// Whether any layer trains at all.
    pub fn any_trainable(&self) -> bool {
        self.policies.iter().any(LayerPolicy::is_trainable)
    }
}

/// Re-initializes the parameter tail of a loaded network.
///
/// Walks the layers once; from the boundary layer (inclusive) on, every
/// layer holding blobs gets its first blob overwritten with samples from
/// N(0, `WEIGHT_INIT_STD`) and its second, if present, set to
/// `RANDOM_INIT_BIAS`. Layers without blobs only advance the walk. Runs
/// strictly after pretrained weights are loaded, discarding the loaded
/// values for the tail.
pub fn random_init<R: Rng>(net: &mut Network, boundary: &str, rng: &mut R) -> Result<()> {
    let normal = Normal::new(0.0, WEIGHT_INIT_STD)
        .map_err(|e| Error::Network(format!("invalid init distribution: {e}")))?;

    let mut active = false;
    for layer in &mut net.layers {
        if !active {
            active = layer.name == boundary;
        }
        if active && !layer.blobs.is_empty() {
            for value in &mut layer.blobs[0].data {
                *value = normal.sample(rng) as f32;
            }
            if let Some(bias) = layer.blobs.get_mut(1) {
                bias.data.fill(RANDOM_INIT_BIAS);
            }
        }
    }

    if !active {
        tracing::warn!("random-from layer {boundary:?} matched nothing, weights unchanged");
    }
    Ok(())
}

/// Step learning-rate policy: the base rate decayed by `gamma` once per
/// `stepsize` iterations.
pub fn step_lr(base_lr: f64, gamma: f64, stepsize: usize, iteration: usize) -> f64 {
    base_lr * gamma.powi((iteration / stepsize) as i32)
}
