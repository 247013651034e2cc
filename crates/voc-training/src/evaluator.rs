//! Multi-crop evaluation engine.
//!
//! Runs exactly `crop_depth * n` forward passes over a split: pass `p`
//! visits example `p % n` under crop repetition `p / n`. The first block
//! of `n` passes initializes one score accumulator per example and
//! captures its ground truth; every later block adds fresh crop scores
//! into the accumulator. Per-class AP is computed once all passes have
//! contributed.

use tracing::info;
use voc_core::{class_average_precision, ApReport, Error, ExampleSource, Result};

use crate::executor::GraphExecutor;
use crate::network::Network;

/// Evaluates a network over repeated crop passes.
pub struct MultiCropEvaluator {
    crop_depth: usize,
    num_classes: usize,
}

impl MultiCropEvaluator {
    /// Creates an evaluator for a crop depth and class count.
    pub fn new(crop_depth: usize, num_classes: usize) -> Self {
        Self {
            crop_depth,
            num_classes,
        }
    }

    /// Total number of forward passes for a split of `n` examples.
    pub fn total_passes(&self, n: usize) -> usize {
        self.crop_depth * n
    }

    /// Runs the evaluation and reports per-class AP and mAP.
    ///
    /// `tick` is invoked after every pass with the number of completed
    /// passes, for progress display.
    pub fn run<E, S, F>(
        &self,
        net: &Network,
        executor: &E,
        source: &mut S,
        mut tick: F,
    ) -> Result<ApReport>
    where
        E: GraphExecutor,
        S: ExampleSource,
        F: FnMut(u64),
    {
        let n = source.num_examples();
        if n == 0 {
            return Err(Error::Dataset("cannot evaluate an empty split".into()));
        }

        let mut scores: Vec<Vec<f32>> = Vec::with_capacity(n);
        let mut truths: Vec<Vec<u8>> = Vec::with_capacity(n);

        for pass in 0..self.total_passes(n) {
            let example = source.next_example()?;
            let output = executor.forward(net, std::slice::from_ref(&example))?;
            let row = output
                .into_iter()
                .next()
                .ok_or_else(|| Error::Training("forward pass produced no scores".into()))?;
            if row.len() != self.num_classes {
                return Err(Error::Network(format!(
                    "network produced {} scores, expected {}",
                    row.len(),
                    self.num_classes
                )));
            }

            if pass < n {
                scores.push(row);
                truths.push(example.labels);
            } else {
                for (accumulated, value) in scores[pass % n].iter_mut().zip(row) {
                    *accumulated += value;
                }
            }
            tick(pass as u64 + 1);
        }

        let per_class = (0..self.num_classes)
            .map(|class| {
                let labels: Vec<u8> = truths.iter().map(|t| t[class]).collect();
                let class_scores: Vec<f32> = scores.iter().map(|s| s[class]).collect();
                class_average_precision(&labels, &class_scores)
            })
            .collect();

        let report = ApReport::from_per_class(per_class);
        info!(
            "evaluated {} examples x {} crops: mAP {:.4}",
            n, self.crop_depth, report.mean
        );
        Ok(report)
    }
}
