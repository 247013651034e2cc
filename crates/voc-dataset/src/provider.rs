//! Sequential example provider over the VOC layout.

use std::path::Path;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use voc_core::{Example, ExampleSource, Result, Split, TransformParams};

pub use voc_core::collect_batch;

use crate::{CropSampler, ImageLoader, VocIndex};

/// Cycles through one VOC split in index order, sampling a fresh
/// transform on every visit.
///
/// Pass `p` yields example `p % len`, so the first `len` calls enumerate
/// the split in a stable order and every later block revisits the same
/// examples under new augmentation samples. Ground truth comes straight
/// from the index and never changes across visits.
pub struct VocProvider {
    index: VocIndex,
    loader: ImageLoader,
    sampler: CropSampler,
    rng: ChaCha8Rng,
    cursor: usize,
}

impl VocProvider {
    /// Opens a provider for one split.
    pub fn new(
        voc_dir: &Path,
        split: Split,
        crop_size: u32,
        transform: TransformParams,
        seed: u64,
    ) -> Result<Self> {
        let index = VocIndex::load(voc_dir, split)?;
        tracing::debug!("{} split: {} images", split, index.len());
        Ok(Self {
            index,
            loader: ImageLoader::new(voc_dir),
            sampler: CropSampler::new(crop_size, transform),
            rng: ChaCha8Rng::seed_from_u64(seed),
            cursor: 0,
        })
    }
}

impl ExampleSource for VocProvider {
    fn num_examples(&self) -> usize {
        self.index.len()
    }

    fn next_example(&mut self) -> Result<Example> {
        let position = self.cursor % self.index.len();
        self.cursor += 1;

        let image = self.loader.load(self.index.id(position))?;
        Ok(Example {
            image: self.sampler.sample(&image, &mut self.rng),
            labels: self.index.labels(position).to_vec(),
        })
    }
}
