//! Network descriptors and materialized networks.
//!
//! A [`NetworkSpec`] is the serialized architecture descriptor: an input
//! shape plus named layers in topological order. Materializing it yields
//! a [`Network`] whose parameterized layers carry concrete blobs, sized
//! by shape inference over the descriptor and freshly initialized from a
//! zero-mean Gaussian.

use std::path::Path;

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use voc_core::{Error, Result};

/// Standard deviation for fresh weight initialization.
pub const WEIGHT_INIT_STD: f64 = 0.01;

/// Name given to the appended classifier layer.
pub const CLASSIFIER_LAYER: &str = "fc8_cls";

/// Layer operation kinds understood by the executor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum LayerKind {
    /// 2D convolution
    Conv {
        num_output: usize,
        kernel: usize,
        stride: usize,
        pad: usize,
    },
    /// 2D max pooling
    Pool { kernel: usize, stride: usize },
    /// Rectified linear activation
    Relu,
    /// Dropout with the given drop ratio
    Dropout { ratio: f64 },
    /// Fully connected layer
    InnerProduct { num_output: usize },
}

impl LayerKind {
    /// Whether layers of this kind carry parameter blobs.
    pub fn has_blobs(&self) -> bool {
        matches!(
            self,
            LayerKind::Conv { .. } | LayerKind::InnerProduct { .. }
        )
    }
}

/// One named layer in a descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerSpec {
    /// Unique layer name
    pub name: String,
    /// Layer operation
    pub kind: LayerKind,
}

/// Serialized architecture descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Network name
    pub name: String,
    /// Input shape as (batch, channels, height, width)
    pub input_dim: [usize; 4],
    /// Layers in topological order
    pub layers: Vec<LayerSpec>,
}

impl NetworkSpec {
    /// Loads a descriptor from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Network(format!("failed to read descriptor {}: {e}", path.display()))
        })?;
        let spec: NetworkSpec = serde_json::from_str(&content)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Persists the descriptor as JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Checks structural validity: nonzero input dims, unique layer names.
    pub fn validate(&self) -> Result<()> {
        if self.input_dim.iter().any(|&d| d == 0) {
            return Err(Error::Network(format!(
                "input dimensions must be positive, got {:?}",
                self.input_dim
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for layer in &self.layers {
            if !seen.insert(layer.name.as_str()) {
                return Err(Error::Network(format!(
                    "duplicate layer name {:?}",
                    layer.name
                )));
            }
        }
        Ok(())
    }

    /// Side length of the network input, used as the crop size.
    pub fn crop_size(&self) -> usize {
        self.input_dim[3]
    }

    /// Truncates the descriptor after the named layer (inclusive).
    ///
    /// `None` keeps every layer; a name not present in the descriptor is
    /// a configuration error.
    pub fn clipped(&self, at: Option<&str>) -> Result<Self> {
        let Some(at) = at else {
            return Ok(self.clone());
        };
        let position = self
            .layers
            .iter()
            .position(|l| l.name == at)
            .ok_or_else(|| Error::Config(format!("clip layer {at:?} not in descriptor")))?;

        let mut clipped = self.clone();
        clipped.layers.truncate(position + 1);
        Ok(clipped)
    }

    /// Appends the classifier head producing `num_classes` outputs.
    pub fn with_classifier_head(mut self, num_classes: usize) -> Self {
        self.layers.push(LayerSpec {
            name: CLASSIFIER_LAYER.to_string(),
            kind: LayerKind::InnerProduct {
                num_output: num_classes,
            },
        });
        self
    }
}

/// A parameter tensor: shape plus dense data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blob {
    /// Tensor shape
    pub shape: Vec<usize>,
    /// Dense values, row-major
    pub data: Vec<f32>,
}

impl Blob {
    /// Creates a zero-filled blob.
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    /// Number of scalar entries.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the blob holds no data.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A materialized layer: name, operation, and 0-2 parameter blobs
/// (weight first, then bias).
#[derive(Debug, Clone)]
pub struct Layer {
    /// Unique layer name
    pub name: String,
    /// Layer operation
    pub kind: LayerKind,
    /// Parameter blobs
    pub blobs: Vec<Blob>,
}

/// A materialized network with named layers in topological order.
#[derive(Debug, Clone)]
pub struct Network {
    /// The descriptor this network was built from
    pub spec: NetworkSpec,
    /// Materialized layers, aligned with `spec.layers`
    pub layers: Vec<Layer>,
}

impl Network {
    /// Materializes a descriptor, sizing blobs by shape inference.
    ///
    /// Weights are sampled from N(0, `WEIGHT_INIT_STD`), biases start at
    /// zero.
    pub fn from_spec<R: Rng>(spec: &NetworkSpec, rng: &mut R) -> Result<Self> {
        spec.validate()?;
        let normal = Normal::new(0.0, WEIGHT_INIT_STD)
            .map_err(|e| Error::Network(format!("invalid init distribution: {e}")))?;

        let [_, mut channels, mut height, mut width] = spec.input_dim;
        let mut flat: Option<usize> = None;
        let mut layers = Vec::with_capacity(spec.layers.len());

        for layer in &spec.layers {
            let mut blobs = Vec::new();
            match layer.kind {
                LayerKind::Conv {
                    num_output,
                    kernel,
                    stride,
                    pad,
                } => {
                    if flat.is_some() {
                        return Err(Error::Network(format!(
                            "conv layer {:?} follows a fully connected layer",
                            layer.name
                        )));
                    }
                    let padded_h = height + 2 * pad;
                    let padded_w = width + 2 * pad;
                    if kernel > padded_h || kernel > padded_w {
                        return Err(Error::Network(format!(
                            "kernel {kernel} of {:?} exceeds input {padded_h}x{padded_w}",
                            layer.name
                        )));
                    }
                    let mut weight = Blob::zeros(vec![num_output, channels, kernel, kernel]);
                    fill_gaussian(&mut weight, &normal, rng);
                    blobs.push(weight);
                    blobs.push(Blob::zeros(vec![num_output]));

                    height = (padded_h - kernel) / stride + 1;
                    width = (padded_w - kernel) / stride + 1;
                    channels = num_output;
                }
                LayerKind::Pool { kernel, stride } => {
                    if flat.is_some() {
                        return Err(Error::Network(format!(
                            "pool layer {:?} follows a fully connected layer",
                            layer.name
                        )));
                    }
                    if kernel > height || kernel > width {
                        return Err(Error::Network(format!(
                            "kernel {kernel} of {:?} exceeds input {height}x{width}",
                            layer.name
                        )));
                    }
                    // Floor arithmetic, matching the executor's pooling op.
                    height = (height - kernel) / stride + 1;
                    width = (width - kernel) / stride + 1;
                }
                LayerKind::Relu | LayerKind::Dropout { .. } => {}
                LayerKind::InnerProduct { num_output } => {
                    let inputs = flat.unwrap_or(channels * height * width);
                    let mut weight = Blob::zeros(vec![num_output, inputs]);
                    fill_gaussian(&mut weight, &normal, rng);
                    blobs.push(weight);
                    blobs.push(Blob::zeros(vec![num_output]));
                    flat = Some(num_output);
                }
            }

            layers.push(Layer {
                name: layer.name.clone(),
                kind: layer.kind,
                blobs,
            });
        }

        Ok(Self {
            spec: spec.clone(),
            layers,
        })
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the network has no layers.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Looks up a layer by name.
    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.name == name)
    }

    /// Looks up a layer mutably by name.
    pub fn layer_mut(&mut self, name: &str) -> Option<&mut Layer> {
        self.layers.iter_mut().find(|l| l.name == name)
    }

    /// Total number of parameters across all blobs.
    pub fn num_parameters(&self) -> usize {
        self.layers
            .iter()
            .flat_map(|l| l.blobs.iter())
            .map(Blob::len)
            .sum()
    }
}

fn fill_gaussian<R: Rng>(blob: &mut Blob, normal: &Normal<f64>, rng: &mut R) {
    for value in &mut blob.data {
        *value = normal.sample(rng) as f32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn small_spec() -> NetworkSpec {
        NetworkSpec {
            name: "smallnet".to_string(),
            input_dim: [1, 3, 16, 16],
            layers: vec![
                LayerSpec {
                    name: "conv1".to_string(),
                    kind: LayerKind::Conv {
                        num_output: 4,
                        kernel: 3,
                        stride: 1,
                        pad: 1,
                    },
                },
                LayerSpec {
                    name: "relu1".to_string(),
                    kind: LayerKind::Relu,
                },
                LayerSpec {
                    name: "pool1".to_string(),
                    kind: LayerKind::Pool {
                        kernel: 2,
                        stride: 2,
                    },
                },
                LayerSpec {
                    name: "fc6".to_string(),
                    kind: LayerKind::InnerProduct { num_output: 10 },
                },
                LayerSpec {
                    name: "drop6".to_string(),
                    kind: LayerKind::Dropout { ratio: 0.5 },
                },
            ],
        }
    }

    #[test]
    fn test_shape_inference() {
        let spec = small_spec();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let net = Network::from_spec(&spec, &mut rng).unwrap();

        let conv = net.layer("conv1").unwrap();
        assert_eq!(conv.blobs[0].shape, vec![4, 3, 3, 3]);
        assert_eq!(conv.blobs[1].shape, vec![4]);

        // 16x16 conv(pad 1) -> 16x16, pool(2,2) -> 8x8, 4 channels.
        let fc = net.layer("fc6").unwrap();
        assert_eq!(fc.blobs[0].shape, vec![10, 4 * 8 * 8]);

        let relu = net.layer("relu1").unwrap();
        assert!(relu.blobs.is_empty());
    }

    #[test]
    fn test_fresh_weights_are_gaussian_biases_zero() {
        let spec = small_spec();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let net = Network::from_spec(&spec, &mut rng).unwrap();

        let conv = net.layer("conv1").unwrap();
        assert!(conv.blobs[0].data.iter().any(|&v| v != 0.0));
        assert!(conv.blobs[0].data.iter().all(|&v| v.abs() < 0.1));
        assert!(conv.blobs[1].data.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_clip_and_head() {
        let spec = small_spec();
        let clipped = spec.clipped(Some("pool1")).unwrap();
        assert_eq!(clipped.layers.len(), 3);
        assert_eq!(clipped.layers.last().unwrap().name, "pool1");

        let with_head = clipped.with_classifier_head(20);
        let last = with_head.layers.last().unwrap();
        assert_eq!(last.name, CLASSIFIER_LAYER);
        assert_eq!(last.kind, LayerKind::InnerProduct { num_output: 20 });

        assert!(spec.clipped(Some("nonexistent")).is_err());
        assert_eq!(spec.clipped(None).unwrap().layers.len(), 5);
    }

    #[test]
    fn test_spec_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.json");
        let spec = small_spec();
        spec.save(&path).unwrap();

        let loaded = NetworkSpec::load(&path).unwrap();
        assert_eq!(loaded.name, spec.name);
        assert_eq!(loaded.layers.len(), spec.layers.len());
        assert_eq!(loaded.crop_size(), 16);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut spec = small_spec();
        spec.layers[1].name = "conv1".to_string();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_conv_after_fc_rejected() {
        let mut spec = small_spec();
        spec.layers.push(LayerSpec {
            name: "conv_bad".to_string(),
            kind: LayerKind::Conv {
                num_output: 2,
                kernel: 1,
                stride: 1,
                pad: 0,
            },
        });
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        assert!(Network::from_spec(&spec, &mut rng).is_err());
    }
}
