use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

use voxeval_core::case_io::NiftiCaseSource;
use voxeval_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, EvalConfig,
};
use voxeval_core::crash;
use voxeval_core::driver::{read_case_list, CaseDriver, EvaluationReport};
use voxeval_core::logging::{self, FilterSource, LogFilters, DEFAULT_LOG_FILTER};
use voxeval_core::onnx::OnnxPatchModel;
use voxeval_core::runtime;

#[derive(Parser)]
#[command(
    name = "voxeval",
    about = "Sliding-window evaluation of 3D segmentation models"
)]
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
}

#[derive(Subcommand)]
enum Commands {
    /// Segment every listed case and report the averaged metrics.
    Evaluate(EvaluateArgs),
    /// Write a default config.toml into the data directory.
    Init,
}

#[derive(Args)]
struct EvaluateArgs {
    #[arg(long, help = "File listing one case directory per line")]
    cases: PathBuf,
    #[arg(long, help = "Config file (defaults to <data-dir>/config.toml)")]
    config: Option<PathBuf>,
    #[arg(long, help = "Override the ONNX model path")]
    model: Option<PathBuf>,
    #[arg(long, help = "Write prediction, image and ground-truth volumes")]
    persist: bool,
    #[arg(long, value_name = "DIR", help = "Directory for persisted volumes")]
    output_dir: Option<PathBuf>,
    #[arg(long, help = "Keep only the largest connected foreground component")]
    largest_component: bool,
    #[arg(long, help = "Print the report as JSON")]
    json: bool,
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(&resolved_data_dir, cli.verbose, cli.log_filter.as_deref());
    log_startup_metadata(&resolved_data_dir);

    match cli.command {
        Commands::Evaluate(args) => run_evaluate(args, &resolved_data_dir),
        Commands::Init => run_init(&resolved_data_dir),
    }
}

fn init_logging(data_dir: &Path, verbose: u8, cli_log_filter: Option<&str>) {
    let rust_log = std::env::var("RUST_LOG").ok();
    let source = FilterSource::select(cli_log_filter, verbose, rust_log.as_deref());
    let filters = LogFilters::for_source(&source);

    let (file_layer, file_error) = match logging::open_log_file(data_dir) {
        Ok(appender) => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(appender)
                    .with_filter(env_filter_or_default(&filters.file, "file")),
            ),
            None,
        ),
        Err(error) => (None, Some(error)),
    };
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter_or_default(&filters.console, "console"));

    if let Err(error) = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
    {
        eprintln!("Failed to initialize tracing: {error}. Continuing without structured logs.");
    }
    if let Some(error) = file_error {
        warn!(error = %format!("{error:#}"), "Log file unavailable; logging to the console only");
    }

    let crash_dir = logging::log_dir(data_dir).join(crash::CRASH_DIR_NAME);
    match crash::install_crash_reporter(&crash_dir) {
        Ok(dir) => debug!(crash_dir = %dir.display(), "Crash reports enabled"),
        Err(error) => warn!(
            error = %format!("{error:#}"),
            "Crash reports disabled; panics will only reach stderr"
        ),
    }
}

fn env_filter_or_default(filter: &str, sink: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!("Invalid {sink} log filter '{filter}': {error}. Using '{DEFAULT_LOG_FILTER}'.");
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn run_init(data_dir: &Path) -> Result<()> {
    let cfg_path = config_path(data_dir);
    if initialize_data_dir(data_dir)? {
        info!(path = %cfg_path.display(), "Wrote default config");
    } else {
        info!(path = %cfg_path.display(), "Config already exists; leaving it untouched");
    }
    Ok(())
}

/// Load the config and fold command-line overrides into it.
///
/// Paths from the config file resolve against the data directory; paths given
/// on the command line are used as-is.
fn resolve_config(args: &EvaluateArgs, data_dir: &Path) -> Result<EvalConfig> {
    let cfg_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_path(data_dir));
    if args.config.is_some() && !cfg_path.is_file() {
        bail!("config file does not exist: {}", cfg_path.display());
    }
    let mut config = EvalConfig::load_from_path(&cfg_path)?;

    config.model.path = match &args.model {
        Some(path) => path.clone(),
        None => resolve_relative_to(data_dir, &config.model.path),
    };
    config.model.trt_cache_dir = resolve_relative_to(data_dir, &config.model.trt_cache_dir);
    config.output.output_directory = match &args.output_dir {
        Some(dir) => dir.clone(),
        None => resolve_relative_to(data_dir, &config.output.output_directory),
    };
    if args.persist || args.output_dir.is_some() {
        config.output.persist_outputs = true;
    }
    if args.largest_component {
        config.postprocess.apply_largest_component_filter = true;
    }

    config
        .validate()
        .with_context(|| format!("invalid configuration in {}", cfg_path.display()))?;
    Ok(config)
}

fn run_evaluate(args: EvaluateArgs, data_dir: &Path) -> Result<()> {
    let config = resolve_config(&args, data_dir)?;

    let cases = read_case_list(&args.cases)?;
    if cases.is_empty() {
        bail!("case list is empty: {}", args.cases.display());
    }

    let runtime_report = runtime::setup_runtime_libs(config.model.backend.uses_gpu());
    runtime::log_runtime_lib_status(&runtime_report);

    let mut model = OnnxPatchModel::load(&config.model)?;
    // Entries from read_case_list are already resolved against the list file.
    let driver = CaseDriver::from_config(&config, Box::new(NiftiCaseSource))?;

    let report = driver.evaluate(&cases, &mut model)?;
    if report.evaluated() == 0 {
        warn!(skipped = report.skipped.len(), "No case could be evaluated");
    }

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to serialize report")?
        );
    } else {
        print!("{}", format_report(&report));
    }
    Ok(())
}

fn format_report(report: &EvaluationReport) -> String {
    let mut out = String::new();
    for case in &report.cases {
        out.push_str(&format!(
            "{:<24} {}  ({} patches, {:.1}s)\n",
            case.id, case.metrics, case.patches, case.elapsed_secs
        ));
    }
    for skipped in &report.skipped {
        out.push_str(&format!(
            "{:<24} skipped: {}\n",
            skipped.path.display(),
            skipped.reason
        ));
    }
    out.push_str(&format!(
        "average over {} case(s): {}\n",
        report.evaluated(),
        report.average
    ));
    out
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;
    use voxeval_core::driver::{CaseOutcome, SkippedCase};
    use voxeval_core::metrics::CaseMetrics;

    use super::*;

    fn evaluate_args(cases: &str) -> EvaluateArgs {
        EvaluateArgs {
            cases: PathBuf::from(cases),
            config: None,
            model: None,
            persist: false,
            output_dir: None,
            largest_component: false,
            json: false,
        }
    }

    #[test]
    fn cli_parses_evaluate_flags() {
        let cli = Cli::try_parse_from([
            "voxeval",
            "-vv",
            "evaluate",
            "--cases",
            "val.txt",
            "--largest-component",
            "--output-dir",
            "out",
            "--json",
        ])
        .expect("parse cli");
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Evaluate(args) => {
                assert_eq!(args.cases, PathBuf::from("val.txt"));
                assert!(args.largest_component);
                assert!(args.json);
                assert!(!args.persist);
                assert_eq!(args.output_dir, Some(PathBuf::from("out")));
            }
            Commands::Init => panic!("expected evaluate"),
        }
    }

    #[test]
    fn evaluate_requires_a_case_list() {
        assert!(Cli::try_parse_from(["voxeval", "evaluate"]).is_err());
    }

    #[test]
    fn config_paths_resolve_against_data_dir() {
        let data = tempdir().expect("tempdir");
        let config = resolve_config(&evaluate_args("cases.txt"), data.path()).expect("config");
        assert_eq!(config.model.path, data.path().join("models/segmentation.onnx"));
        assert_eq!(config.output.output_directory, data.path().join("predictions"));
        assert!(!config.output.persist_outputs);
    }

    #[test]
    fn cli_overrides_take_precedence() {
        let data = tempdir().expect("tempdir");
        fs::write(
            data.path().join("config.toml"),
            "[postprocess]\nconnectivity = 6\n",
        )
        .expect("write config");
        let args = EvaluateArgs {
            model: Some(PathBuf::from("/models/unet.onnx")),
            output_dir: Some(PathBuf::from("runs/a")),
            largest_component: true,
            ..evaluate_args("cases.txt")
        };
        let config = resolve_config(&args, data.path()).expect("config");
        assert_eq!(config.model.path, PathBuf::from("/models/unet.onnx"));
        assert_eq!(config.output.output_directory, PathBuf::from("runs/a"));
        assert!(config.output.persist_outputs);
        assert!(config.postprocess.apply_largest_component_filter);
        assert_eq!(
            config.postprocess.connectivity,
            voxeval_core::components::Connectivity::Six
        );
    }

    #[test]
    fn explicit_missing_config_is_an_error() {
        let data = tempdir().expect("tempdir");
        let args = EvaluateArgs {
            config: Some(data.path().join("nope.toml")),
            ..evaluate_args("cases.txt")
        };
        assert!(resolve_config(&args, data.path()).is_err());
    }

    #[test]
    fn report_lists_cases_skips_and_average() {
        let metrics = CaseMetrics {
            dice: 0.5,
            jaccard: 1.0 / 3.0,
            hd95: 2.0,
            asd: 1.0,
        };
        let report = EvaluationReport {
            average: metrics,
            cases: vec![CaseOutcome {
                id: "case_001".to_string(),
                metrics,
                foreground_voxels: 10,
                patches: 8,
                elapsed_secs: 1.25,
            }],
            skipped: vec![SkippedCase {
                path: PathBuf::from("case_002"),
                reason: "failed to load case".to_string(),
            }],
        };
        let text = format_report(&report);
        assert!(text.contains("case_001"));
        assert!(text.contains("8 patches"));
        assert!(text.contains("case_002"));
        assert!(text.contains("skipped: failed to load case"));
        assert!(text.contains("average over 1 case(s): dice=0.5000"));
    }
}
