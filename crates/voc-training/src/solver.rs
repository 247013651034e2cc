//! The training orchestrator.
//!
//! A [`Solver`] owns one training run: it persists the resolved graph
//! definition, copies pretrained weights into the network, applies the
//! random re-initialization pass, drives the configured number of
//! optimization steps with no early stopping, and snapshots weights to
//! the output directory. A step failure aborts the run; nothing here
//! retries.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use rand::Rng;
use tracing::info;
use voc_core::{collect_batch, ExampleSource, Result, SolverParams};

use crate::executor::GraphExecutor;
use crate::network::{Network, NetworkSpec};
use crate::schedule::{random_init, step_lr, LayerSchedule};
use crate::weights::{WeightSnapshot, SNAPSHOT_SUFFIX};

/// File name of the persisted training graph definition.
pub const GRAPH_DEF_FILE: &str = "trainval.json";

/// File name of the plain-text training log.
pub const TRAIN_LOG_FILE: &str = "log.txt";

/// Path of the final weight snapshot inside an output directory.
pub fn final_snapshot_path(output_dir: &Path) -> PathBuf {
    output_dir.join(format!("final{SNAPSHOT_SUFFIX}"))
}

/// Path of the periodic weight snapshot inside an output directory.
pub fn intermediate_snapshot_path(output_dir: &Path) -> PathBuf {
    output_dir.join(format!("snap{SNAPSHOT_SUFFIX}"))
}

/// Plain-text training log, one line per displayed step.
struct TrainLog {
    writer: BufWriter<File>,
}

impl TrainLog {
    fn create(path: &Path) -> Result<Self> {
        Ok(Self {
            writer: BufWriter::new(File::create(path)?),
        })
    }

    fn record(&mut self, iteration: usize, loss: f64, lr: f64) -> Result<()> {
        writeln!(self.writer, "iteration {iteration} loss {loss:.6} lr {lr:.6}")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Drives a fixed-length training run against an output directory.
pub struct Solver {
    params: SolverParams,
    output_dir: PathBuf,
}

impl Solver {
    /// Creates a solver writing its artifacts under `output_dir`.
    pub fn new(params: SolverParams, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            params,
            output_dir: output_dir.into(),
        }
    }

    /// Solver hyper-parameters.
    pub fn params(&self) -> &SolverParams {
        &self.params
    }

    /// Runs the full training sequence.
    ///
    /// Pretrained weights are copied by layer-name matching before the
    /// optional random re-initialization of the tail; both happen before
    /// the first step. Exactly `params.iterations` steps run; any step
    /// error propagates immediately.
    #[allow(clippy::too_many_arguments)]
    pub fn run<E, S, R>(
        &self,
        spec: &NetworkSpec,
        net: &mut Network,
        executor: &mut E,
        source: &mut S,
        schedule: &LayerSchedule,
        pretrained: &Path,
        random_from: Option<&str>,
        rng: &mut R,
    ) -> Result<()>
    where
        E: GraphExecutor,
        S: ExampleSource,
        R: Rng,
    {
        std::fs::create_dir_all(&self.output_dir)?;
        spec.save(&self.output_dir.join(GRAPH_DEF_FILE))?;

        let snapshot = WeightSnapshot::load(pretrained)?;
        let copied = snapshot.copy_into(net)?;
        info!(
            "loaded pretrained weights from {}: {copied} of {} layers matched",
            pretrained.display(),
            snapshot.layers.len()
        );

        if let Some(boundary) = random_from {
            random_init(net, boundary, rng)?;
            info!("re-initialized parameters from layer {boundary:?}");
        }

        let mut log = TrainLog::create(&self.output_dir.join(TRAIN_LOG_FILE))?;
        info!(
            "running {} iterations of {} (batch size {})",
            self.params.iterations, self.params.kind, self.params.batch_size
        );

        for iteration in 0..self.params.iterations {
            let lr = step_lr(
                self.params.base_lr,
                self.params.gamma,
                self.params.stepsize,
                iteration,
            );
            let batch = collect_batch(source, self.params.batch_size)?;
            let loss = executor.train_step(net, &batch, lr, schedule, &self.params)?;

            if iteration % self.params.display_every == 0 {
                log.record(iteration, loss, lr)?;
                tracing::debug!("iteration {iteration}: loss {loss:.6}, lr {lr:.6}");
            }
            if self.params.snapshot_every > 0
                && (iteration + 1) % self.params.snapshot_every == 0
                && iteration + 1 < self.params.iterations
            {
                WeightSnapshot::from_network(net, iteration + 1)
                    .save(&intermediate_snapshot_path(&self.output_dir))?;
            }
        }

        WeightSnapshot::from_network(net, self.params.iterations)
            .save(&final_snapshot_path(&self.output_dir))?;
        info!(
            "training finished, final snapshot at {}",
            final_snapshot_path(&self.output_dir).display()
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::BurnExecutor;
    use crate::network::{LayerKind, LayerSpec};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use voc_core::{Example, ExecutionContext, ImageTensor};

    struct CyclingSource {
        examples: Vec<Example>,
        cursor: usize,
    }

    impl ExampleSource for CyclingSource {
        fn num_examples(&self) -> usize {
            self.examples.len()
        }

        fn next_example(&mut self) -> Result<Example> {
            let example = self.examples[self.cursor % self.examples.len()].clone();
            self.cursor += 1;
            Ok(example)
        }
    }

    fn tiny_spec() -> NetworkSpec {
        NetworkSpec {
            name: "tiny".to_string(),
            input_dim: [1, 3, 1, 1],
            layers: vec![
                LayerSpec {
                    name: "fc6".to_string(),
                    kind: LayerKind::InnerProduct { num_output: 4 },
                },
                LayerSpec {
                    name: "fc8_cls".to_string(),
                    kind: LayerKind::InnerProduct { num_output: 2 },
                },
            ],
        }
    }

    fn tiny_source() -> CyclingSource {
        let make = |v: f32, labels: Vec<u8>| Example {
            image: ImageTensor {
                data: vec![v, -v, 0.5 * v],
                channels: 3,
                height: 1,
                width: 1,
            },
            labels,
        };
        CyclingSource {
            examples: vec![make(1.0, vec![1, 0]), make(-1.0, vec![0, 1])],
            cursor: 0,
        }
    }

    fn quick_params(iterations: usize) -> SolverParams {
        SolverParams {
            iterations,
            batch_size: 2,
            snapshot_every: 2,
            display_every: 1,
            ..SolverParams::default()
        }
    }

    #[test]
    fn test_run_persists_artifacts_and_weights() {
        let dir = tempfile::tempdir().unwrap();
        let spec = tiny_spec();
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        // Pretrained weights come from an independently initialized net.
        let pretrained_net = Network::from_spec(&spec, &mut rng).unwrap();
        let pretrained_path = dir.path().join(format!("pretrained{SNAPSHOT_SUFFIX}"));
        WeightSnapshot::from_network(&pretrained_net, 0)
            .save(&pretrained_path)
            .unwrap();

        let output_dir = dir.path().join("run");
        let mut net = Network::from_spec(&spec, &mut rng).unwrap();
        let schedule = LayerSchedule::plan(&spec, None);
        let mut executor = BurnExecutor::new(&ExecutionContext::resolve(None));
        let mut source = tiny_source();

        let solver = Solver::new(quick_params(3), &output_dir);
        solver
            .run(
                &spec,
                &mut net,
                &mut executor,
                &mut source,
                &schedule,
                &pretrained_path,
                None,
                &mut rng,
            )
            .unwrap();

        assert!(output_dir.join(GRAPH_DEF_FILE).exists());
        assert!(output_dir.join(TRAIN_LOG_FILE).exists());
        assert!(final_snapshot_path(&output_dir).exists());
        assert!(intermediate_snapshot_path(&output_dir).exists());

        let log = std::fs::read_to_string(output_dir.join(TRAIN_LOG_FILE)).unwrap();
        assert_eq!(log.lines().count(), 3);
        assert!(log.starts_with("iteration 0 loss"));

        let final_snapshot =
            WeightSnapshot::load(&final_snapshot_path(&output_dir)).unwrap();
        assert_eq!(final_snapshot.iteration, 3);
        assert_eq!(final_snapshot.layers.len(), 2);
    }

    #[test]
    fn test_random_from_discards_loaded_tail() {
        let dir = tempfile::tempdir().unwrap();
        let spec = tiny_spec();
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let pretrained_net = Network::from_spec(&spec, &mut rng).unwrap();
        let pretrained_path = dir.path().join(format!("pretrained{SNAPSHOT_SUFFIX}"));
        WeightSnapshot::from_network(&pretrained_net, 0)
            .save(&pretrained_path)
            .unwrap();

        let mut net = Network::from_spec(&spec, &mut rng).unwrap();
        // Freeze everything so only loading and re-init move weights.
        let schedule = LayerSchedule::plan(&spec, Some("absent"));
        let mut executor = BurnExecutor::new(&ExecutionContext::resolve(None));
        let mut source = tiny_source();

        let solver = Solver::new(quick_params(1), dir.path().join("run2"));
        solver
            .run(
                &spec,
                &mut net,
                &mut executor,
                &mut source,
                &schedule,
                &pretrained_path,
                Some("fc8_cls"),
                &mut rng,
            )
            .unwrap();

        // fc6 keeps the pretrained values, fc8_cls was re-initialized.
        assert_eq!(
            net.layer("fc6").unwrap().blobs[0].data,
            pretrained_net.layer("fc6").unwrap().blobs[0].data
        );
        assert_ne!(
            net.layer("fc8_cls").unwrap().blobs[0].data,
            pretrained_net.layer("fc8_cls").unwrap().blobs[0].data
        );
        assert!(net.layer("fc8_cls").unwrap().blobs[1]
            .data
            .iter()
            .all(|&v| v == crate::schedule::RANDOM_INIT_BIAS));
    }

    #[test]
    fn test_missing_pretrained_weights_fail_before_training() {
        let dir = tempfile::tempdir().unwrap();
        let spec = tiny_spec();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let mut net = Network::from_spec(&spec, &mut rng).unwrap();
        let schedule = LayerSchedule::plan(&spec, None);
        let mut executor = BurnExecutor::new(&ExecutionContext::resolve(None));
        let mut source = tiny_source();

        let solver = Solver::new(quick_params(1), dir.path().join("run3"));
        let result = solver.run(
            &spec,
            &mut net,
            &mut executor,
            &mut source,
            &schedule,
            &dir.path().join("missing.weights.json"),
            None,
            &mut rng,
        );
        assert!(result.is_err());
    }
}
