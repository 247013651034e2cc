//! Fine-tuning CLI tool.
//!
//! Fine-tunes a pretrained classification model on VOC and reports
//! multi-crop mAP on both splits. With an iteration count of zero the
//! training stage is skipped entirely and the supplied pretrained
//! weights are evaluated as-is.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::info;

use voc_core::{
    load_toml_config, resolve_mean, setup_logging, ApReport, ExampleSource, ExecutionContext,
    RunConfig, Split,
};
use voc_dataset::VocProvider;
use voc_training::{
    resolve_eval_weights, BurnExecutor, LayerSchedule, MultiCropEvaluator, Network, NetworkSpec,
    Solver,
};

/// Crop depths evaluated for every split, in order.
const CROP_DEPTHS: [usize; 2] = [1, 10];

/// Fine-tune and evaluate a classification model on VOC
#[derive(Parser, Debug)]
#[command(
    name = "train-cls",
    about = "Fine-tune and evaluate a classification model on VOC",
    long_about = "Fine-tune a pretrained classification model on the VOC multi-label \
                  dataset, then report multi-crop average-precision metrics for both \
                  splits. Defaults follow the reference fine-tuning setup."
)]
struct Args {
    /// Network descriptor of the model to fine-tune (JSON)
    #[arg(value_name = "MODEL")]
    model: PathBuf,

    /// Pretrained weight snapshot for the model
    #[arg(value_name = "WEIGHTS")]
    weights: PathBuf,

    /// Keep run artifacts in this directory instead of a private
    /// temporary one
    #[arg(short, long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// VOC data directory
    #[arg(long, value_name = "DIR")]
    voc_dir: Option<PathBuf>,

    /// GPU index to run on
    #[arg(long, value_name = "ID")]
    gpu: Option<usize>,

    /// Solver kind (SGD or Nesterov)
    #[arg(long, value_name = "KIND")]
    solver: Option<String>,

    /// Base learning rate
    #[arg(long, value_name = "LR")]
    lr: Option<f64>,

    /// Training batch size
    #[arg(short, long, value_name = "SIZE")]
    batch_size: Option<usize>,

    /// Number of training iterations (0 skips training)
    #[arg(short = 'n', long, value_name = "N")]
    iterations: Option<usize>,

    /// Comma-separated per-channel mean values to subtract
    #[arg(long, value_name = "A,B,C")]
    mean_value: Option<String>,

    /// Do not mean-center the input
    #[arg(long)]
    no_mean: bool,

    /// Clip the network at this layer
    #[arg(long, value_name = "LAYER")]
    clip: Option<String>,

    /// Train only this layer and the layers after it
    #[arg(long, value_name = "LAYER")]
    train_from: Option<String>,

    /// Randomly re-initialize this layer and the layers after it
    #[arg(long, value_name = "LAYER")]
    random_from: Option<String>,

    /// Scale factor applied to the input data
    #[arg(long, value_name = "FACTOR")]
    scale: Option<f32>,

    /// Minimum scale augmentation
    #[arg(long, value_name = "FACTOR")]
    min_scale: Option<f32>,

    /// Maximum scale augmentation
    #[arg(long, value_name = "FACTOR")]
    max_scale: Option<f32>,

    /// Resize images before augmentation
    #[arg(long, value_name = "PX")]
    resize: Option<u32>,

    /// Base configuration file (TOML), overridden by the flags above
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Random seed
    #[arg(long, value_name = "SEED")]
    seed: Option<u64>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Run output directory: user-provided directories are preserved, the
/// private fallback is removed when dropped, whatever happened above it.
enum OutputDir {
    User(PathBuf),
    Temp(tempfile::TempDir),
}

impl OutputDir {
    fn resolve(requested: Option<&Path>) -> Result<Self> {
        match requested {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
                Ok(OutputDir::User(dir.to_path_buf()))
            }
            None => Ok(OutputDir::Temp(
                tempfile::tempdir().context("failed to create temporary output directory")?,
            )),
        }
    }

    fn path(&self) -> &Path {
        match self {
            OutputDir::User(dir) => dir,
            OutputDir::Temp(dir) => dir.path(),
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose)?;
    run(args)
}

fn run(args: Args) -> Result<()> {
    info!("VOC classification fine-tuning");

    let config = build_config(&args)?;
    let voc_dir = config
        .voc_dir
        .clone()
        .context("VOC data directory is required (--voc-dir or config value)")?;
    if !voc_dir.is_dir() {
        bail!("VOC data directory does not exist: {}", voc_dir.display());
    }

    let output = OutputDir::resolve(args.output_dir.as_deref())?;
    std::fs::write(
        output.path().join("config.toml"),
        toml::to_string_pretty(&config)?,
    )
    .context("failed to save resolved configuration")?;
    info!("run artifacts under {}", output.path().display());

    let ctx = ExecutionContext::resolve(args.gpu);
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);

    // Resolve the model: clip the descriptor, then append the classifier.
    let base_spec = NetworkSpec::load(&args.model)?;
    let spec = base_spec
        .clipped(config.surgery.clip.as_deref())?
        .with_classifier_head(config.num_classes);
    let crop_size = u32::try_from(spec.crop_size()).context("crop size out of range")?;

    let mut executor = BurnExecutor::new(&ctx);

    if config.solver.iterations > 0 {
        let mut net = Network::from_spec(&spec, &mut rng)?;
        info!(
            "training network {:?}: {} layers, {} parameters",
            spec.name,
            net.len(),
            net.num_parameters()
        );
        let schedule = LayerSchedule::plan(&spec, config.surgery.train_from.as_deref());
        let mut source = VocProvider::new(
            &voc_dir,
            Split::Train,
            crop_size,
            config.transform.clone(),
            config.seed,
        )?;

        let solver = Solver::new(config.solver.clone(), output.path());
        solver.run(
            &spec,
            &mut net,
            &mut executor,
            &mut source,
            &schedule,
            &args.weights,
            config.surgery.random_from.as_deref(),
            &mut rng,
        )?;
    } else {
        info!("iteration count is 0, skipping the training stage");
    }

    // Fixed evaluation order: crop depth outer, split inner.
    for crop_depth in CROP_DEPTHS {
        for split in Split::ALL {
            let report = run_evaluation(
                &spec,
                &config,
                &executor,
                &voc_dir,
                split,
                crop_depth,
                output.path(),
                &args.weights,
                &mut rng,
            )?;
            println!("{}", report.summary_line());
        }
    }

    Ok(())
}

fn build_config(args: &Args) -> Result<RunConfig> {
    let mut config = match &args.config {
        Some(path) => load_toml_config::<RunConfig>(path)?,
        None => RunConfig::default(),
    };

    if let Some(kind) = &args.solver {
        config.solver.kind = kind.parse()?;
    }
    if let Some(lr) = args.lr {
        config.solver.base_lr = lr;
    }
    if let Some(batch_size) = args.batch_size {
        config.solver.batch_size = batch_size;
    }
    if let Some(iterations) = args.iterations {
        config.solver.iterations = iterations;
    }
    if args.mean_value.is_some() || args.no_mean {
        config.transform.mean = resolve_mean(args.mean_value.as_deref(), args.no_mean)?;
    }
    if let Some(scale) = args.scale {
        config.transform.scale = scale;
    }
    if let Some(min_scale) = args.min_scale {
        config.transform.min_scale = min_scale;
    }
    if let Some(max_scale) = args.max_scale {
        config.transform.max_scale = max_scale;
    }
    if args.resize.is_some() {
        config.transform.resize = args.resize;
    }
    if args.clip.is_some() {
        config.surgery.clip = args.clip.clone();
    }
    if args.train_from.is_some() {
        config.surgery.train_from = args.train_from.clone();
    }
    if args.random_from.is_some() {
        config.surgery.random_from = args.random_from.clone();
    }
    if args.voc_dir.is_some() {
        config.voc_dir = args.voc_dir.clone();
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }

    config.validate()?;
    Ok(config)
}

#[allow(clippy::too_many_arguments)]
fn run_evaluation(
    spec: &NetworkSpec,
    config: &RunConfig,
    executor: &BurnExecutor,
    voc_dir: &Path,
    split: Split,
    crop_depth: usize,
    output_dir: &Path,
    pretrained: &Path,
    rng: &mut ChaCha8Rng,
) -> Result<ApReport> {
    let mut net = Network::from_spec(spec, rng)?;
    if let Some(snapshot) = resolve_eval_weights(output_dir, pretrained)? {
        snapshot.copy_into(&mut net)?;
    }

    let crop_size = u32::try_from(spec.crop_size()).context("crop size out of range")?;
    let mut source = VocProvider::new(
        voc_dir,
        split,
        crop_size,
        config.transform.clone(),
        config.seed,
    )?;

    let evaluator = MultiCropEvaluator::new(crop_depth, config.num_classes);
    let total = evaluator.total_passes(source.num_examples());

    let progress = ProgressBar::new(total as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} passes ({eta})")
            .unwrap()
            .progress_chars("=>-"),
    );
    progress.set_prefix(format!("{split:<10} {crop_depth:>2}"));

    let report = evaluator.run(&net, executor, &mut source, |pass| {
        progress.set_position(pass);
    })?;
    progress.finish_and_clear();

    info!(
        "{split} split, {crop_depth} crops: mAP {:.4}",
        report.mean
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["train-cls", "model.json", "weights.json"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_defaults_match_reference_setup() {
        let config = build_config(&args(&[])).unwrap();
        assert_eq!(config.solver.base_lr, 0.001);
        assert_eq!(config.solver.batch_size, 16);
        assert_eq!(config.solver.iterations, 80_000);
        assert_eq!(config.transform.mean, [104.0, 117.0, 123.0]);
        assert_eq!(config.transform.min_scale, 0.5);
        assert_eq!(config.transform.max_scale, 2.0);
    }

    #[test]
    fn test_flag_overrides() {
        let config = build_config(&args(&[
            "--lr",
            "0.01",
            "-n",
            "0",
            "--train-from",
            "fc6",
            "--no-mean",
        ]))
        .unwrap();
        assert_eq!(config.solver.base_lr, 0.01);
        assert_eq!(config.solver.iterations, 0);
        assert_eq!(config.surgery.train_from.as_deref(), Some("fc6"));
        assert_eq!(config.transform.mean, [0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_mean_value_with_no_mean_is_rejected() {
        let result = build_config(&args(&["--mean-value", "1,2,3", "--no-mean"]));
        assert!(result.is_err());
    }

    #[test]
    fn test_malformed_mean_value_is_rejected() {
        let result = build_config(&args(&["--mean-value", "1,2"]));
        assert!(result.is_err());
    }

    fn write_voc_dir(voc_dir: &Path, ids: &[&str]) {
        use voc_core::VOC_CLASSES;

        let main = voc_dir.join("ImageSets").join("Main");
        let images = voc_dir.join("JPEGImages");
        std::fs::create_dir_all(&main).unwrap();
        std::fs::create_dir_all(&images).unwrap();

        for split in ["test", "train"] {
            for (class_idx, class) in VOC_CLASSES.iter().enumerate() {
                let mut content = String::new();
                for (i, id) in ids.iter().enumerate() {
                    let flag = if class_idx == i { 1 } else { -1 };
                    content.push_str(&format!("{id} {flag}\n"));
                }
                std::fs::write(main.join(format!("{class}_{split}.txt")), content).unwrap();
            }
        }

        for id in ids {
            image::RgbImage::new(8, 8)
                .save(images.join(format!("{id}.jpg")))
                .unwrap();
        }
    }

    #[test]
    fn test_zero_iterations_skips_training_and_evaluates_pretrained() {
        use voc_training::{find_snapshot, LayerKind, LayerSpec, WeightSnapshot};

        let base = tempfile::tempdir().unwrap();
        let voc_dir = base.path().join("voc");
        write_voc_dir(&voc_dir, &["000001", "000002"]);

        let descriptor = NetworkSpec {
            name: "tinynet".to_string(),
            input_dim: [1, 3, 4, 4],
            layers: vec![LayerSpec {
                name: "fc6".to_string(),
                kind: LayerKind::InnerProduct { num_output: 8 },
            }],
        };
        let model_path = base.path().join("model.json");
        descriptor.save(&model_path).unwrap();

        // Pretrained weights for the resolved model (descriptor + head).
        let resolved = descriptor
            .clone()
            .with_classifier_head(voc_core::NUM_CLASSES);
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let pretrained_net = Network::from_spec(&resolved, &mut rng).unwrap();
        let weights_path = base.path().join("pre.weights.json");
        WeightSnapshot::from_network(&pretrained_net, 0)
            .save(&weights_path)
            .unwrap();

        let output_dir = base.path().join("run");
        let args = Args::parse_from([
            "train-cls",
            model_path.to_str().unwrap(),
            weights_path.to_str().unwrap(),
            "--voc-dir",
            voc_dir.to_str().unwrap(),
            "--output-dir",
            output_dir.to_str().unwrap(),
            "-n",
            "0",
        ]);
        run(args).unwrap();

        // The training stage performed no work: no graph definition, no
        // training log, no snapshot. Evaluation ran on the supplied
        // pretrained weights.
        assert!(!output_dir.join("trainval.json").exists());
        assert!(!output_dir.join("log.txt").exists());
        assert!(find_snapshot(&output_dir).unwrap().is_none());
        assert!(output_dir.join("config.toml").exists());

        // The supplied weights are left untouched.
        let after = WeightSnapshot::load(&weights_path).unwrap();
        assert_eq!(after.iteration, 0);
        assert_eq!(
            after.layers[0].blobs[0].data,
            pretrained_net.layers[0].blobs[0].data
        );
    }

    #[test]
    fn test_output_dir_modes() {
        let temp = OutputDir::resolve(None).unwrap();
        let temp_path = temp.path().to_path_buf();
        assert!(temp_path.is_dir());
        drop(temp);
        assert!(!temp_path.exists());

        let base = tempfile::tempdir().unwrap();
        let user_dir = base.path().join("run");
        let user = OutputDir::resolve(Some(&user_dir)).unwrap();
        assert!(user.path().is_dir());
        drop(user);
        assert!(user_dir.is_dir());
    }
}
