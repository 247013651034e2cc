//! Shared type definitions for the VOC fine-tuning workspace.

use serde::{Deserialize, Serialize};

use crate::Result;

/// Evaluation split. `Test` is the primary split, `Train` the secondary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Split {
    /// Held-out test images
    Test,
    /// Training images, evaluated to measure fit
    Train,
}

impl Split {
    /// Both splits, in the order they are evaluated.
    pub const ALL: [Split; 2] = [Split::Test, Split::Train];
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Split::Test => write!(f, "test"),
            Split::Train => write!(f, "train"),
        }
    }
}

/// A dense image tensor in CHW layout.
#[derive(Debug, Clone)]
pub struct ImageTensor {
    /// Pixel data, channel-major (`channels * height * width` entries)
    pub data: Vec<f32>,
    /// Number of channels
    pub channels: usize,
    /// Height in pixels
    pub height: usize,
    /// Width in pixels
    pub width: usize,
}

impl ImageTensor {
    /// Creates a zero-filled tensor with the given dimensions.
    pub fn zeros(channels: usize, height: usize, width: usize) -> Self {
        Self {
            data: vec![0.0; channels * height * width],
            channels,
            height,
            width,
        }
    }

    /// Total number of scalar entries.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the tensor holds no data.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One (input, label) pair as produced by a dataset provider.
///
/// Labels hold one entry per class, each in {0, 1, 255}; 255 marks an
/// entry ignored by both the training loss and the evaluation metrics.
#[derive(Debug, Clone)]
pub struct Example {
    /// Transformed input image
    pub image: ImageTensor,
    /// Per-class ground-truth vector
    pub labels: Vec<u8>,
}

/// Sequential source of (input, label) pairs.
///
/// The provider cycles through its split: pass `p` visits example
/// `p % num_examples()`, so the first `num_examples()` calls enumerate the
/// distinct examples in a stable order, and every later block revisits
/// them in that same order under a freshly sampled augmentation. Ground
/// truth for a given example is identical across visits.
pub trait ExampleSource {
    /// Number of distinct examples in the split.
    fn num_examples(&self) -> usize;

    /// Produces the next example in pass order.
    fn next_example(&mut self) -> Result<Example>;
}

/// Pulls a fixed-size batch from a source.
pub fn collect_batch<S: ExampleSource>(source: &mut S, batch_size: usize) -> Result<Vec<Example>> {
    let mut batch = Vec::with_capacity(batch_size);
    for _ in 0..batch_size {
        batch.push(source.next_example()?);
    }
    Ok(batch)
}
