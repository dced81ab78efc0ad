use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use ndarray::Array2;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use atrain_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use atrain_core::dataset::ATrainDataset;
use atrain_core::interp::interpolate_output;
use atrain_core::loader::{BatchLoader, LoaderOptions};
use atrain_core::logging::{self, LoggingOptions, LoggingSetup, DEFAULT_LOG_FILTER};
use atrain_core::metrics::{parse_metric_list, MetricsReport};
use atrain_core::transforms::{NormalizationStats, Normalize, TransformPipeline};

#[derive(Parser)]
#[command(name = "atrain", about = "A-Train cloud dataset tooling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "Config file (default: <data-dir>/config.toml)")]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Split to use, e.g. train or val")]
    mode: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load one instance and print its shapes and recipe statistics.
    Inspect(InspectArgs),
    /// Stream the split through the batch loader.
    Scan(ScanArgs),
    /// Score predictions against the split's labels.
    Evaluate(EvaluateArgs),
}

#[derive(Args)]
struct InspectArgs {
    instance_id: u32,
}

#[derive(Args)]
struct ScanArgs {
    #[arg(long, help = "Stop after this many batches")]
    limit: Option<usize>,
    #[arg(long, help = "Apply the mode's normalization and flip transforms")]
    augment: bool,
}

#[derive(Args)]
struct EvaluateArgs {
    #[arg(long, help = "JSON object mapping instance id to a points x bins array")]
    predictions: PathBuf,
    #[arg(long, default_value = "all", help = "Comma-separated metric names")]
    metrics: String,
    #[arg(short = 'o', long, help = "Write the JSON report here instead of stdout")]
    output: Option<PathBuf>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let config = load_config(
        &resolved_data_dir,
        cli.config.as_deref(),
        cli.mode.as_deref(),
    );
    let logging_config = config
        .as_ref()
        .map(|config| config.logging.clone())
        .unwrap_or_default();
    init_logging(
        LoggingOptions::from_config(&logging_config, Some(resolved_data_dir.as_path()))
            .with_cli(cli.verbose, cli.log_filter.as_deref())
            .with_env(std::env::var("RUST_LOG").ok()),
    );
    log_startup_metadata(&resolved_data_dir);
    let config = config?;

    match cli.command {
        Commands::Inspect(args) => run_inspect(&config, args.instance_id).await,
        Commands::Scan(args) => run_scan(&config, args).await,
        Commands::Evaluate(args) => run_evaluate(&config, args).await,
    }
}

fn load_config(
    data_dir: &Path,
    explicit: Option<&Path>,
    mode_override: Option<&str>,
) -> Result<AppConfig> {
    let cfg_path = match explicit {
        Some(path) => {
            if !path.exists() {
                bail!("Config file does not exist: {}", path.display());
            }
            path.to_path_buf()
        }
        None => {
            if let Err(e) = initialize_data_dir(data_dir) {
                eprintln!("Warning: failed to initialize data directory: {e:#}");
            }
            config_path(data_dir)
        }
    };

    let mut config = AppConfig::load_from_path(&cfg_path)?.resolve_paths(data_dir);
    if let Some(mode) = mode_override {
        config.dataset.mode = mode.to_string();
    }
    Ok(config)
}

fn init_logging(options: LoggingOptions) {
    let LoggingSetup { filter, file_sink } = logging::plan_logging(&options);
    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter_or_default(&filter.directive));

    let (installed, sink_error) = match file_sink {
        Ok(sink) => {
            let file = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(sink.appender)
                .with_filter(env_filter_or_default(&filter.directive));
            let subscriber = tracing_subscriber::registry().with(console).with(file);
            (tracing::subscriber::set_global_default(subscriber), None)
        }
        Err(error) => {
            let subscriber = tracing_subscriber::registry().with(console);
            (tracing::subscriber::set_global_default(subscriber), Some(error))
        }
    };

    if let Err(error) = installed {
        eprintln!("Failed to install tracing subscriber: {error}. Continuing without logs.");
        return;
    }

    info!(filter = %filter.directive, source = %filter.source, "Log filter selected");
    if let Some(error) = sink_error {
        let attempted = error
            .attempted_dir()
            .map(|dir| dir.display().to_string())
            .unwrap_or_else(|| "<none>".to_string());
        warn!(
            attempted_log_dir = %attempted,
            reason = %error,
            "File logging unavailable; logging to console only"
        );
    }
}

fn env_filter_or_default(directive: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(directive).unwrap_or_else(|error| {
        eprintln!("Invalid log filter '{directive}': {error}. Using '{DEFAULT_LOG_FILTER}'.");
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

async fn open_dataset(config: &AppConfig) -> Result<Arc<ATrainDataset>> {
    let dataset_config = config.dataset.clone();
    let dataset = tokio::task::spawn_blocking(move || ATrainDataset::from_config(&dataset_config))
        .await
        .context("dataset open task panicked")?
        .with_context(|| format!("failed to open dataset at {}", config.dataset.root.display()))?;
    Ok(Arc::new(dataset))
}

async fn run_inspect(config: &AppConfig, instance_id: u32) -> Result<()> {
    let dataset = open_dataset(config).await?;
    let loader = Arc::clone(&dataset);
    let record = tokio::task::spawn_blocking(move || loader.load_instance(instance_id))
        .await
        .context("instance load task panicked")??;

    let (channels, height, width) = record.sensor_input.dim();
    let sums = record.recipe.weight_sums();
    println!("instance:        {}", record.instance_id);
    println!("channels:        {channels}");
    println!("patch:           {height} x {width}");
    println!("points:          {}", record.num_points());
    println!("bins:            {}", record.cloud_scenario.ncols());
    if !sums.is_empty() {
        let min = sums.iter().copied().fold(f32::INFINITY, f32::min);
        let max = sums.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        println!(
            "weight sums:     min {min:.4} max {max:.4} mean {:.4}",
            sums.mean().unwrap_or(f32::NAN)
        );
        let off_unit = sums.iter().filter(|sum| (*sum - 1.0).abs() > 1e-4).count();
        println!("non-unit sums:   {off_unit}");
    }
    if let Some(nondir) = &record.nondirectional {
        let names: Vec<&str> = nondir.fields.keys().map(String::as_str).collect();
        println!("non-directional: {}", names.join(", "));
    }
    if let Some(flags) = &record.cloud_scenario_flags {
        let names: Vec<&str> = flags.keys().map(String::as_str).collect();
        println!("flags:           {}", names.join(", "));
    }
    Ok(())
}

async fn run_scan(config: &AppConfig, args: ScanArgs) -> Result<()> {
    let dataset = open_dataset(config).await?;
    let loader = BatchLoader::new(
        Arc::clone(&dataset),
        LoaderOptions::from_config(&config.loader),
    );

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping after the current batch");
            let _ = cancel_tx.send(true);
        }
    });

    let mut stream = loader.stream(0, cancel_rx);
    if args.augment {
        stream = stream.with_transforms(build_transforms(config, &dataset)?);
    }

    let start = Instant::now();
    let total_batches = args
        .limit
        .map_or(loader.num_batches(), |limit| limit.min(loader.num_batches()));
    let mut summary = ScanSummary::default();
    while let Some(batch) = stream.next().await {
        let batch = batch?;
        let predictions = interpolate_output(&batch, batch.sensor_input.view())
            .with_context(|| format!("interpolation failed for instances {:?}", batch.instance_ids))?;
        let non_finite = predictions.iter().filter(|v| !v.is_finite()).count();

        summary.batches += 1;
        summary.instances += batch.len();
        summary.points += batch.num_points();
        summary.non_finite += non_finite;

        info!(
            batch = summary.batches,
            of = total_batches,
            instances = batch.len(),
            points = batch.num_points(),
            non_finite,
            "Scanned batch"
        );
        if non_finite > 0 {
            warn!(instances = ?batch.instance_ids, non_finite, "Non-finite interpolated values");
        }
        if args.limit.is_some_and(|limit| summary.batches >= limit) {
            break;
        }
    }

    println!("{}", summary.describe(start.elapsed().as_secs_f64()));
    Ok(())
}

fn build_transforms(config: &AppConfig, dataset: &ATrainDataset) -> Result<TransformPipeline> {
    let normalize = match &config.dataset.normalization_path {
        Some(path) => {
            let stats = NormalizationStats::load(path)?;
            Some(Normalize::new(&stats, dataset.layout())?)
        }
        None => {
            warn!("No normalization statistics configured; skipping normalization");
            None
        }
    };
    Ok(TransformPipeline::for_mode(
        &config.dataset.mode,
        normalize,
        config.loader.seed,
    ))
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ScanSummary {
    batches: usize,
    instances: usize,
    points: usize,
    non_finite: usize,
}

impl ScanSummary {
    fn describe(&self, elapsed_secs: f64) -> String {
        format!(
            "Scanned {} batches ({} instances, {} points, {} non-finite values) in {}",
            self.batches,
            self.instances,
            self.points,
            self.non_finite,
            format_duration(elapsed_secs)
        )
    }
}

async fn run_evaluate(config: &AppConfig, args: EvaluateArgs) -> Result<()> {
    let metrics = parse_metric_list(&args.metrics)?;
    let predictions = load_predictions(&args.predictions)?;
    info!(
        predictions = predictions.len(),
        metrics = ?metrics,
        "Loaded predictions"
    );

    let dataset = open_dataset(config).await?;
    let report = tokio::task::spawn_blocking(move || dataset.evaluate(&predictions, &metrics))
        .await
        .context("evaluation task panicked")??;

    for (kind, mean) in report.summary() {
        info!(metric = %kind, mean, "Split mean");
    }

    let encoded = render_report(&report)?;
    match args.output {
        Some(path) => {
            std::fs::write(&path, encoded)
                .with_context(|| format!("Failed to write report: {}", path.display()))?;
            info!(path = %path.display(), "Wrote evaluation report");
        }
        None => println!("{encoded}"),
    }
    Ok(())
}

/// Read `{"<instance id>": [[...], ...]}`.
fn load_predictions(path: &Path) -> Result<HashMap<u32, Array2<f32>>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read predictions: {}", path.display()))?;
    let parsed: HashMap<u32, Vec<Vec<f32>>> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse predictions JSON: {}", path.display()))?;

    parsed
        .into_iter()
        .map(|(instance_id, rows)| {
            let points = rows.len();
            let width = rows.first().map_or(0, Vec::len);
            if rows.iter().any(|row| row.len() != width) {
                bail!("ragged prediction rows for instance {instance_id}");
            }
            let flat: Vec<f32> = rows.into_iter().flatten().collect();
            let array = Array2::from_shape_vec((points, width), flat)
                .with_context(|| format!("bad prediction shape for instance {instance_id}"))?;
            Ok((instance_id, array))
        })
        .collect()
}

fn render_report(report: &MetricsReport) -> Result<String> {
    serde_json::to_string_pretty(report).context("Failed to serialize evaluation report")
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from([
            "atrain", "scan", "--limit", "3", "-vv", "--mode", "val", "--augment",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.mode.as_deref(), Some("val"));
        match cli.command {
            Commands::Scan(args) => {
                assert_eq!(args.limit, Some(3));
                assert!(args.augment);
            }
            _ => panic!("expected scan"),
        }
    }

    #[test]
    fn evaluate_defaults_to_all_metrics() {
        let cli =
            Cli::try_parse_from(["atrain", "evaluate", "--predictions", "p.json"]).unwrap();
        match cli.command {
            Commands::Evaluate(args) => {
                assert_eq!(args.metrics, "all");
                assert_eq!(args.predictions, PathBuf::from("p.json"));
                assert!(args.output.is_none());
            }
            _ => panic!("expected evaluate"),
        }
    }

    #[test]
    fn inspect_requires_numeric_id() {
        assert!(Cli::try_parse_from(["atrain", "inspect", "abc"]).is_err());
        assert!(Cli::try_parse_from(["atrain", "inspect", "12"]).is_ok());
    }
}
