//! Graph execution on the burn NdArray backend.
//!
//! The executor interprets a materialized [`Network`] with burn's
//! functional tensor ops: plain forward passes for evaluation and
//! autodiff-backed solver steps for training. It presents a synchronous
//! interface; a failed step or pass propagates as an error and is never
//! retried here.

use std::collections::HashMap;

use burn::backend::Autodiff;
use burn::tensor::activation::{log_sigmoid, relu};
use burn::tensor::backend::Backend;
use burn::tensor::module::{conv2d, max_pool2d};
use burn::tensor::ops::ConvOptions;
use burn::tensor::{Distribution, ElementConversion, Tensor, TensorData};
use burn_ndarray::NdArray;
use voc_core::{
    Error, Example, ExecutionContext, Result, SolverKind, SolverParams, IGNORE_LABEL,
};

use crate::network::{Blob, Layer, LayerKind, Network};
use crate::schedule::LayerSchedule;

/// Backend used for forward-only inference.
pub type InferenceBackend = NdArray<f32>;

/// Backend used for solver steps.
pub type TrainingBackend = Autodiff<InferenceBackend>;

/// Synchronous interface to the numeric execution engine.
pub trait GraphExecutor {
    /// Runs one forward pass, returning a class-score row per example.
    fn forward(&self, net: &Network, batch: &[Example]) -> Result<Vec<Vec<f32>>>;

    /// Runs one optimization step in place, returning the batch loss.
    fn train_step(
        &mut self,
        net: &mut Network,
        batch: &[Example],
        lr: f64,
        schedule: &LayerSchedule,
        solver: &SolverParams,
    ) -> Result<f64>;
}

/// Executor over the burn NdArray backend.
pub struct BurnExecutor {
    device: <InferenceBackend as Backend>::Device,
    momentum: HashMap<(String, usize), Vec<f32>>,
}

impl BurnExecutor {
    /// Creates an executor for the given execution context.
    pub fn new(ctx: &ExecutionContext) -> Self {
        tracing::debug!("graph executor on {}", ctx.device);
        Self {
            device: Default::default(),
            momentum: HashMap::new(),
        }
    }
}

impl GraphExecutor for BurnExecutor {
    fn forward(&self, net: &Network, batch: &[Example]) -> Result<Vec<Vec<f32>>> {
        let input = batch_input::<InferenceBackend>(batch, &self.device)?;
        let params = net
            .layers
            .iter()
            .map(|layer| layer_params::<InferenceBackend>(layer, &self.device, false, false))
            .collect::<Result<Vec<_>>>()?;

        let logits = run_layers(&net.layers, &params, input, false, &self.device)?;
        let [_, classes] = logits.dims();
        let values: Vec<f32> = logits
            .into_data()
            .to_vec()
            .map_err(|e| Error::Training(format!("tensor readback failed: {e:?}")))?;

        Ok(values.chunks(classes).map(<[f32]>::to_vec).collect())
    }

    fn train_step(
        &mut self,
        net: &mut Network,
        batch: &[Example],
        lr: f64,
        schedule: &LayerSchedule,
        solver: &SolverParams,
    ) -> Result<f64> {
        if schedule.len() != net.len() {
            return Err(Error::Training(format!(
                "schedule covers {} layers, network has {}",
                schedule.len(),
                net.len()
            )));
        }

        let input = batch_input::<TrainingBackend>(batch, &self.device)?;
        let mut params = Vec::with_capacity(net.len());
        for (index, layer) in net.layers.iter().enumerate() {
            let policy = schedule.policy(index);
            params.push(layer_params::<TrainingBackend>(
                layer,
                &self.device,
                !policy.weight.is_frozen(),
                !policy.bias.is_frozen(),
            )?);
        }

        let logits = run_layers(&net.layers, &params, input, true, &self.device)?;
        let loss = masked_sigmoid_ce(logits, batch, &self.device)?;
        let loss_value: f64 = loss.clone().into_scalar().elem();
        if !loss_value.is_finite() {
            return Err(Error::Training(format!(
                "non-finite loss {loss_value} during optimization step"
            )));
        }

        let grads = loss.backward();

        // Collect gradients, then clip by global L2 norm.
        let mut updates: Vec<(usize, usize, Vec<f32>)> = Vec::new();
        for (index, param) in params.iter().enumerate() {
            match param {
                LayerParams::None => {}
                LayerParams::Conv { weight, bias } => {
                    if let Some(grad) = weight.grad(&grads) {
                        updates.push((index, 0, read_back(grad)?));
                    }
                    if let Some(grad) = bias.grad(&grads) {
                        updates.push((index, 1, read_back(grad)?));
                    }
                }
                LayerParams::Linear { weight, bias } => {
                    if let Some(grad) = weight.grad(&grads) {
                        updates.push((index, 0, read_back(grad)?));
                    }
                    if let Some(grad) = bias.grad(&grads) {
                        updates.push((index, 1, read_back(grad)?));
                    }
                }
            }
        }

        let sq_sum: f64 = updates
            .iter()
            .flat_map(|(_, _, grad)| grad.iter())
            .map(|&g| f64::from(g) * f64::from(g))
            .sum();
        let norm = sq_sum.sqrt();
        let clip_scale = if solver.clip_gradients > 0.0 && norm > solver.clip_gradients {
            solver.clip_gradients / norm
        } else {
            1.0
        };

        for (layer_index, blob_index, grad) in updates {
            let policy = schedule.policy(layer_index);
            let policy = if blob_index == 0 {
                policy.weight
            } else {
                policy.bias
            };
            let local_lr = lr * policy.lr_mult;
            let local_decay = solver.weight_decay * policy.decay_mult;

            let layer = &mut net.layers[layer_index];
            let key = (layer.name.clone(), blob_index);
            let blob = &mut layer.blobs[blob_index];
            let history = self
                .momentum
                .entry(key)
                .or_insert_with(|| vec![0.0; blob.len()]);

            for ((value, &g), v) in blob.data.iter_mut().zip(grad.iter()).zip(history.iter_mut())
            {
                let step = clip_scale * f64::from(g) + local_decay * f64::from(*value);
                let velocity = solver.momentum * f64::from(*v) + local_lr * step;
                *v = velocity as f32;
                let delta = match solver.kind {
                    SolverKind::Sgd => velocity,
                    SolverKind::Nesterov => solver.momentum * velocity + local_lr * step,
                };
                *value -= delta as f32;
            }
        }

        Ok(loss_value)
    }
}

/// Parameter tensors for one layer.
enum LayerParams<B: Backend> {
    None,
    Conv {
        weight: Tensor<B, 4>,
        bias: Tensor<B, 1>,
    },
    Linear {
        weight: Tensor<B, 2>,
        bias: Tensor<B, 1>,
    },
}

/// An intermediate activation, spatial or flattened.
enum Activation<B: Backend> {
    Spatial(Tensor<B, 4>),
    Flat(Tensor<B, 2>),
}

fn require_spatial<B: Backend>(activation: Activation<B>, layer: &str) -> Result<Tensor<B, 4>> {
    match activation {
        Activation::Spatial(x) => Ok(x),
        Activation::Flat(_) => Err(Error::Network(format!(
            "layer {layer:?} needs a spatial input"
        ))),
    }
}

fn batch_input<B: Backend>(batch: &[Example], device: &B::Device) -> Result<Tensor<B, 4>> {
    let first = batch
        .first()
        .ok_or_else(|| Error::Training("empty batch".into()))?;
    let (channels, height, width) = (
        first.image.channels,
        first.image.height,
        first.image.width,
    );

    let mut data = Vec::with_capacity(batch.len() * channels * height * width);
    for example in batch {
        let image = &example.image;
        if image.channels != channels || image.height != height || image.width != width {
            return Err(Error::Training(format!(
                "inconsistent batch image shapes: {}x{}x{} vs {channels}x{height}x{width}",
                image.channels, image.height, image.width
            )));
        }
        data.extend_from_slice(&image.data);
    }

    Ok(Tensor::from_data(
        TensorData::new(data, [batch.len(), channels, height, width]),
        device,
    ))
}

fn tensor_from_blob<B: Backend, const D: usize>(
    blob: &Blob,
    device: &B::Device,
    requires_grad: bool,
) -> Result<Tensor<B, D>> {
    if blob.shape.len() != D {
        return Err(Error::Network(format!(
            "expected rank-{D} blob, got shape {:?}",
            blob.shape
        )));
    }
    let tensor = Tensor::from_data(
        TensorData::new(blob.data.clone(), blob.shape.clone()),
        device,
    );
    Ok(if requires_grad {
        tensor.require_grad()
    } else {
        tensor
    })
}

fn layer_params<B: Backend>(
    layer: &Layer,
    device: &B::Device,
    weight_grad: bool,
    bias_grad: bool,
) -> Result<LayerParams<B>> {
    if !layer.kind.has_blobs() {
        return Ok(LayerParams::None);
    }
    if layer.blobs.len() != 2 {
        return Err(Error::Network(format!(
            "layer {:?} expects weight and bias blobs, found {}",
            layer.name,
            layer.blobs.len()
        )));
    }
    match layer.kind {
        LayerKind::Conv { .. } => Ok(LayerParams::Conv {
            weight: tensor_from_blob(&layer.blobs[0], device, weight_grad)?,
            bias: tensor_from_blob(&layer.blobs[1], device, bias_grad)?,
        }),
        LayerKind::InnerProduct { .. } => Ok(LayerParams::Linear {
            weight: tensor_from_blob(&layer.blobs[0], device, weight_grad)?,
            bias: tensor_from_blob(&layer.blobs[1], device, bias_grad)?,
        }),
        _ => Ok(LayerParams::None),
    }
}

fn run_layers<B: Backend>(
    layers: &[Layer],
    params: &[LayerParams<B>],
    input: Tensor<B, 4>,
    train: bool,
    device: &B::Device,
) -> Result<Tensor<B, 2>> {
    let mut activation = Activation::Spatial(input);

    for (layer, param) in layers.iter().zip(params.iter()) {
        activation = match (&layer.kind, param) {
            (LayerKind::Conv { stride, pad, .. }, LayerParams::Conv { weight, bias }) => {
                let x = require_spatial(activation, &layer.name)?;
                Activation::Spatial(conv2d(
                    x,
                    weight.clone(),
                    Some(bias.clone()),
                    ConvOptions::new([*stride, *stride], [*pad, *pad], [1, 1], 1),
                ))
            }
            (LayerKind::Pool { kernel, stride }, _) => {
                let x = require_spatial(activation, &layer.name)?;
                Activation::Spatial(max_pool2d(
                    x,
                    [*kernel, *kernel],
                    [*stride, *stride],
                    [0, 0],
                    [1, 1],
                ))
            }
            (LayerKind::Relu, _) => match activation {
                Activation::Spatial(x) => Activation::Spatial(relu(x)),
                Activation::Flat(x) => Activation::Flat(relu(x)),
            },
            (LayerKind::Dropout { ratio }, _) => {
                if train && *ratio > 0.0 {
                    let keep = 1.0 - ratio;
                    let rescale = (1.0 / keep) as f32;
                    match activation {
                        Activation::Spatial(x) => {
                            let mask =
                                Tensor::random(x.dims(), Distribution::Bernoulli(keep), device);
                            Activation::Spatial(x.mul(mask).mul_scalar(rescale))
                        }
                        Activation::Flat(x) => {
                            let mask =
                                Tensor::random(x.dims(), Distribution::Bernoulli(keep), device);
                            Activation::Flat(x.mul(mask).mul_scalar(rescale))
                        }
                    }
                } else {
                    activation
                }
            }
            (LayerKind::InnerProduct { .. }, LayerParams::Linear { weight, bias }) => {
                let x = match activation {
                    Activation::Spatial(x) => {
                        let [batch, channels, height, width] = x.dims();
                        x.reshape([batch, channels * height * width])
                    }
                    Activation::Flat(x) => x,
                };
                Activation::Flat(
                    x.matmul(weight.clone().transpose()) + bias.clone().unsqueeze::<2>(),
                )
            }
            _ => {
                return Err(Error::Network(format!(
                    "layer {:?} has mismatched parameters",
                    layer.name
                )))
            }
        };
    }

    match activation {
        Activation::Flat(logits) => Ok(logits),
        Activation::Spatial(_) => Err(Error::Network(
            "network must end in a fully connected layer".into(),
        )),
    }
}

/// Sigmoid cross-entropy over class logits, masking ignore-label entries
/// out of both the numerator and the normalizer.
fn masked_sigmoid_ce<B: Backend>(
    logits: Tensor<B, 2>,
    batch: &[Example],
    device: &B::Device,
) -> Result<Tensor<B, 1>> {
    let [rows, classes] = logits.dims();
    if rows != batch.len() {
        return Err(Error::Training(format!(
            "{} logit rows for {} examples",
            rows,
            batch.len()
        )));
    }

    let mut targets = Vec::with_capacity(rows * classes);
    let mut mask = Vec::with_capacity(rows * classes);
    for example in batch {
        if example.labels.len() != classes {
            return Err(Error::Training(format!(
                "label vector has {} entries, network outputs {}",
                example.labels.len(),
                classes
            )));
        }
        for &label in &example.labels {
            targets.push(if label == 1 { 1.0f32 } else { 0.0 });
            mask.push(if label == IGNORE_LABEL { 0.0f32 } else { 1.0 });
        }
    }

    let targets = Tensor::<B, 2>::from_data(TensorData::new(targets, [rows, classes]), device);
    let mask = Tensor::<B, 2>::from_data(TensorData::new(mask, [rows, classes]), device);

    let log_pos = log_sigmoid(logits.clone());
    let log_neg = log_sigmoid(logits.neg());
    let per_entry =
        (targets.clone() * log_pos + (targets.ones_like() - targets) * log_neg).neg() * mask.clone();

    let valid = mask.sum().clamp_min(1.0);
    Ok(per_entry.sum() / valid)
}

fn read_back<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .to_vec()
        .map_err(|e| Error::Training(format!("gradient readback failed: {e:?}")))
}
