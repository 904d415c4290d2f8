use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use ferrite_derm::data::split_records;
use ferrite_derm::inference::{self, InferenceService, ProportionalFaceLayout, SeverityStrategy, ServeConfig};
use ferrite_derm::labels::{analyze_distribution, Condition, LabelStore};
use ferrite_derm::logging::{init_logging, LogConfig, LogLevel};
use ferrite_derm::metrics::EvaluationMetrics;
use ferrite_derm::network::Architecture;
use ferrite_derm::train::{
    evaluate_records, evaluate_test, train_loop, Device, EpochStats, ModelCheckpoint, TrainConfig,
    TrainingSession,
};
use ferrite_derm::{ImageTensor, Result};

#[derive(Parser, Debug)]
#[command(name = "ferrite-derm", version, about = "Train and serve a multi-label skin condition classifier.")]
struct Cli {
    /// trace, debug, info, warn or error; overrides --verbose / --quiet
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Debug output with module targets and thread ids.
    #[arg(long, short, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Errors only.
    #[arg(long, short, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a classifier on an annotated corpus.
    Train(TrainArgs),
    /// Evaluate a checkpoint on one split of the corpus.
    Evaluate(EvaluateArgs),
    /// Predict a single image.
    Predict(PredictArgs),
    /// Serve predictions over HTTP.
    Serve(ServeArgs),
    /// Print the label distribution of a corpus.
    Stats(StatsArgs),
}

#[derive(clap::Args, Debug)]
struct TrainArgs {
    /// Corpus root laid out as <condition>/<severity>/*.png.
    #[arg(long)]
    data: PathBuf,
    /// JSON config; command-line flags override it.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Continue a run from this checkpoint. Its stored config is used, so
    /// hyperparameter flags are refused alongside it.
    #[arg(long, conflicts_with = "config")]
    resume: Option<PathBuf>,
    #[arg(long, conflicts_with = "resume")]
    architecture: Option<Architecture>,
    #[arg(long, conflicts_with = "resume")]
    epochs: Option<usize>,
    #[arg(long, conflicts_with = "resume")]
    batch_size: Option<usize>,
    #[arg(long, conflicts_with = "resume")]
    learning_rate: Option<f64>,
    #[arg(long, conflicts_with = "resume")]
    image_size: Option<usize>,
    #[arg(long, conflicts_with = "resume")]
    device: Option<Device>,
    #[arg(long, conflicts_with = "resume")]
    checkpoint_dir: Option<PathBuf>,
    #[arg(long, conflicts_with = "resume")]
    seed: Option<u64>,
    #[arg(long, conflicts_with = "resume")]
    workers: Option<usize>,
    /// Use plain binary cross-entropy instead of focal loss.
    #[arg(long, conflicts_with = "resume")]
    no_focal: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SplitChoice {
    Train,
    Val,
    Test,
    All,
}

#[derive(clap::Args, Debug)]
struct EvaluateArgs {
    #[arg(long)]
    data: PathBuf,
    #[arg(long)]
    checkpoint: PathBuf,
    #[arg(long, value_enum, default_value = "test")]
    split: SplitChoice,
}

#[derive(clap::Args, Debug)]
struct PredictArgs {
    #[arg(long)]
    checkpoint: PathBuf,
    image: PathBuf,
    /// threshold or trained_head
    #[arg(long, default_value = "threshold")]
    strategy: SeverityStrategy,
    /// Also analyse face regions.
    #[arg(long)]
    regions: bool,
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Defaults to $MODEL_CHECKPOINT or checkpoints/best_model.json.
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    /// Defaults to $PORT or 8000.
    #[arg(long)]
    port: Option<u16>,
    #[arg(long, default_value = "threshold")]
    strategy: SeverityStrategy,
    #[arg(long)]
    no_regions: bool,
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
    /// Refuse to start unless the checkpoint holds this architecture.
    #[arg(long)]
    architecture: Option<Architecture>,
}

#[derive(clap::Args, Debug)]
struct StatsArgs {
    #[arg(long)]
    data: PathBuf,
    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_logging(&log_config(&cli)) {
        eprintln!("{}", e);
    }

    let result = match cli.command {
        Command::Train(args) => run_train(args),
        Command::Evaluate(args) => run_evaluate(args),
        Command::Predict(args) => run_predict(args),
        Command::Serve(args) => run_serve(args),
        Command::Stats(args) => run_stats(args),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn log_config(cli: &Cli) -> LogConfig {
    let mut config = if cli.verbose {
        LogConfig::verbose()
    } else if cli.quiet {
        LogConfig::quiet()
    } else {
        LogConfig::default()
    };
    if let Some(level) = cli.log_level {
        config.level = level;
    }
    config
}

fn train_config(args: &TrainArgs) -> Result<TrainConfig> {
    let mut config = match &args.config {
        Some(path) => TrainConfig::load_json(path)?,
        None => TrainConfig::default(),
    };
    if let Some(v) = args.architecture { config.architecture = v; }
    if let Some(v) = args.epochs { config.epochs = v; }
    if let Some(v) = args.batch_size { config.batch_size = v; }
    if let Some(v) = args.learning_rate { config.learning_rate = v; }
    if let Some(v) = args.image_size { config.image_size = v; }
    if let Some(v) = args.device { config.device = v; }
    if let Some(v) = &args.checkpoint_dir { config.checkpoint_dir = v.clone(); }
    if let Some(v) = args.seed { config.seed = v; }
    if let Some(v) = args.workers { config.num_workers = v; }
    if args.no_focal { config.use_focal_loss = false; }
    config.validate()?;
    Ok(config)
}

fn run_train(args: TrainArgs) -> Result<()> {
    let mut session = match &args.resume {
        Some(path) => TrainingSession::resume(path)?,
        None => TrainingSession::new(train_config(&args)?)?,
    };

    let (records, report) = LabelStore::new(&args.data).load_records()?;
    println!(
        "Loaded {} images ({} skipped, {} severities ignored)",
        report.loaded, report.skipped(), report.unknown_severity
    );
    let splits = split_records(records, session.config.split_fractions(), session.config.seed)?;
    let (train_n, val_n, test_n) = splits.sizes();
    println!("Split: {} train / {} val / {} test", train_n, val_n, test_n);

    let (tx, rx) = mpsc::channel::<EpochStats>();
    let printer = thread::spawn(move || {
        for s in rx {
            println!(
                "Epoch {:>3}/{} | loss {:.4} / {:.4} | F1 {:.4} / {:.4} | lr {:.2e} | {} ms{}",
                s.epoch, s.total_epochs, s.train_loss.total, s.val_loss.total,
                s.train_macro_f1, s.val_macro_f1, s.learning_rate, s.elapsed_ms,
                if s.is_best { "  (best)" } else { "" }
            );
        }
    });
    let outcome = train_loop(&mut session, &splits, Some(&tx));
    drop(tx);
    let _ = printer.join();
    let outcome = outcome?;

    println!("Stopped: {:?} after {} epochs", outcome.stop_reason, outcome.epochs_completed);
    if let (Some(f1), Some(epoch)) = (outcome.best_val_f1, outcome.best_epoch) {
        println!("Best validation macro-F1 {:.4} at epoch {}", f1, epoch);
    }
    if !splits.test.is_empty() {
        let (_, metrics) = evaluate_test(&session, &splits)?;
        print_metrics("Test", &metrics);
    }
    println!("Final checkpoint: {}", outcome.final_checkpoint.display());
    Ok(())
}

fn run_evaluate(args: EvaluateArgs) -> Result<()> {
    let checkpoint = ModelCheckpoint::load(&args.checkpoint)?;
    let config = checkpoint.config.clone();
    let (records, _) = LabelStore::new(&args.data).load_records()?;
    let splits = split_records(records.clone(), config.split_fractions(), config.seed)?;
    let selected = match args.split {
        SplitChoice::Train => splits.train,
        SplitChoice::Val => splits.val,
        SplitChoice::Test => splits.test,
        SplitChoice::All => records,
    };
    let (loss, metrics) = evaluate_records(&checkpoint.model, &config.loss(), &selected, &config)?;
    println!("Loss {:.4} (presence {:.4}, severity {:.4})", loss.total, loss.presence, loss.severity);
    print_metrics(&format!("{:?}", args.split), &metrics);
    Ok(())
}

fn run_predict(args: PredictArgs) -> Result<()> {
    let mut service = InferenceService::load(&args.checkpoint, None)?.with_strategy(args.strategy);
    if args.regions {
        service = service.with_region_locator(Box::new(ProportionalFaceLayout));
    }
    let image = ImageTensor::open(&args.image)?;
    let response = service.predict_image(&image)?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn run_serve(args: ServeArgs) -> Result<()> {
    let mut config = ServeConfig::from_env()?;
    if let Some(path) = args.checkpoint { config.checkpoint = path; }
    if let Some(host) = args.host { config.host = host; }
    if let Some(port) = args.port { config.port = port; }
    config.strategy = args.strategy;
    config.regions = !args.no_regions;
    config.request_timeout = Duration::from_secs(args.timeout_secs);
    config.expected_architecture = args.architecture;

    let mut service = InferenceService::load(&config.checkpoint, config.expected_architecture)?
        .with_strategy(config.strategy);
    if config.regions {
        service = service.with_region_locator(Box::new(ProportionalFaceLayout));
    }
    println!("Listening on http://{}  (GET /health, POST /infer)", config.address());
    inference::serve(service, &config)
}

fn run_stats(args: StatsArgs) -> Result<()> {
    let (records, report) = LabelStore::new(&args.data).load_records()?;
    let dist = analyze_distribution(&records);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&dist)?);
        return Ok(());
    }
    println!("Total samples: {} ({} skipped)", dist.total_samples, report.skipped());
    println!("\nCondition distribution:");
    for condition in Condition::ALL {
        println!(
            "  {:<22} {:>6} ({:.1}%)",
            condition.as_str(), dist.condition_counts[condition], dist.condition_percentages[condition]
        );
    }
    println!("\nSeverity distribution:");
    for (level, count) in dist.severity_counts.iter().filter(|entry| *entry.1 > 0) {
        println!("  {:<22} {:>6}", level.as_str(), count);
    }
    Ok(())
}

fn print_metrics(label: &str, m: &EvaluationMetrics) {
    println!(
        "{}: macro-F1 {:.4}  precision {:.4}  recall {:.4}  accuracy {:.4}  ({} samples)",
        label, m.macro_f1, m.macro_precision, m.macro_recall, m.accuracy, m.samples
    );
    if let Some(acc) = m.severity_accuracy {
        println!("  severity accuracy {:.4}", acc);
    }
    for condition in Condition::ALL {
        let c = &m.per_condition[condition];
        println!(
            "  {:<22} P {:.3}  R {:.3}  F1 {:.3}  support {}",
            condition.as_str(), c.precision, c.recall, c.f1, c.support
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> std::result::Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("ferrite-derm").chain(args.iter().copied()))
    }

    #[test]
    fn resume_refuses_hyperparameter_overrides() {
        let err = parse(&["train", "--data", "d", "--resume", "c.json", "--epochs", "5"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
        assert!(parse(&["train", "--data", "d", "--resume", "c.json", "--checkpoint-dir", "x"]).is_err());
        assert!(parse(&["train", "--data", "d", "--resume", "c.json"]).is_ok());
        assert!(parse(&["train", "--data", "d", "--epochs", "5"]).is_ok());
    }

    #[test]
    fn verbosity_flags_select_log_presets() {
        let cli = parse(&["--verbose", "stats", "--data", "d"]).unwrap();
        assert_eq!(log_config(&cli).level, LogLevel::Debug);
        assert!(log_config(&cli).include_thread_ids);

        let cli = parse(&["stats", "--data", "d", "-q"]).unwrap();
        assert_eq!(log_config(&cli).level, LogLevel::Error);

        let cli = parse(&["-v", "--log-level", "warn", "stats", "--data", "d"]).unwrap();
        assert_eq!(log_config(&cli).level, LogLevel::Warn);

        assert!(parse(&["-v", "-q", "stats", "--data", "d"]).is_err());
        assert_eq!(log_config(&parse(&["stats", "--data", "d"]).unwrap()).level, LogLevel::Info);
    }
}
