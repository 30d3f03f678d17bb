//! Bedside CLI - Command-line interface for Bedside Flux
//!
//! Commands:
//! - run: Stream a sensor log through the live vitals and presence pipeline
//! - replay: Recompute smoothed vitals for one side over a time range
//! - sleep: Build sleep sessions for one side over a time range
//! - calibrate: Find and store the empty-bed capacitance baseline
//! - doctor: Diagnose configuration, baselines and input
//! - config: Print the default configuration as TOML

use clap::{Args, Parser, Subcommand};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::DateTime;
use log::{info, warn};
use serde::Serialize;
use tokio::sync::watch;

use bedside_flux::baseline::{BaselineStore, JsonFileBaselineStore};
use bedside_flux::config::EngineConfig;
use bedside_flux::context::EngineContext;
use bedside_flux::error::EngineError;
use bedside_flux::pipeline::{analyze_sleep, calibrate, LivePipeline};
use bedside_flux::replay::replay_vitals;
use bedside_flux::sinks::{NdjsonSleepSink, NdjsonVitalsSink};
use bedside_flux::source::{self, read_all, NdjsonFrameSource};
use bedside_flux::types::{SensorFrame, Side};
use bedside_flux::{FLUX_VERSION, PRODUCER_NAME};

/// Bedside - vitals and sleep sessions from an in-bed sensing pad
#[derive(Parser)]
#[command(name = "bedside")]
#[command(author = "Synheart AI Inc")]
#[command(version = FLUX_VERSION)]
#[command(about = "Turn piezo and capacitance pad data into vitals and sleep sessions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream a sensor log through the live pipeline
    Run {
        /// NDJSON sensor log
        #[arg(short, long)]
        input: PathBuf,

        /// Keep reading as the log grows; stop with Ctrl-C
        #[arg(long)]
        follow: bool,

        #[command(flatten)]
        store: StoreArgs,
    },

    /// Recompute smoothed vitals for one side over a time range
    Replay {
        #[command(flatten)]
        range: RangeArgs,

        #[command(flatten)]
        store: StoreArgs,
    },

    /// Build sleep sessions for one side over a time range
    Sleep {
        #[command(flatten)]
        range: RangeArgs,

        #[command(flatten)]
        store: StoreArgs,
    },

    /// Find and store the empty-bed capacitance baseline for one side
    Calibrate {
        #[command(flatten)]
        range: RangeArgs,

        #[command(flatten)]
        store: StoreArgs,
    },

    /// Diagnose configuration, baselines and input
    Doctor {
        /// Sensor log to check
        #[arg(short, long)]
        input: Option<PathBuf>,

        #[command(flatten)]
        store: StoreArgs,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the default configuration as TOML
    Config,
}

/// Configuration and persistence locations shared by every command
#[derive(Args)]
struct StoreArgs {
    /// Engine configuration (TOML); defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding `{side}_cap_baseline.json` files
    #[arg(long, default_value = "baselines")]
    baseline_dir: PathBuf,

    /// Vitals output (NDJSON, appended)
    #[arg(long, default_value = "vitals.ndjson")]
    vitals_out: PathBuf,

    /// Sleep session output (NDJSON, appended)
    #[arg(long, default_value = "sleep.ndjson")]
    sleep_out: PathBuf,
}

/// A bounded slice of a recorded sensor log for one side
#[derive(Args)]
struct RangeArgs {
    /// NDJSON sensor log
    #[arg(short, long)]
    input: PathBuf,

    /// Bed side (left or right)
    #[arg(long)]
    side: Side,

    /// Range start (epoch seconds or RFC 3339)
    #[arg(long, value_parser = parse_time)]
    start: i64,

    /// Range end (epoch seconds or RFC 3339)
    #[arg(long, value_parser = parse_time)]
    end: i64,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string()));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), BedsideCliError> {
    match cli.command {
        Commands::Run { input, follow, store } => cmd_run(&input, follow, &store),
        Commands::Replay { range, store } => cmd_replay(&range, &store),
        Commands::Sleep { range, store } => cmd_sleep(&range, &store),
        Commands::Calibrate { range, store } => cmd_calibrate(&range, &store),
        Commands::Doctor { input, store, json } => cmd_doctor(input.as_deref(), &store, json),
        Commands::Config => cmd_config(),
    }
}

fn cmd_run(input: &Path, follow: bool, store: &StoreArgs) -> Result<(), BedsideCliError> {
    let context = build_context(store)?;
    let source = NdjsonFrameSource::open(input, follow)?;
    let pipeline = LivePipeline::new(context);

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let summary = runtime.block_on(async move {
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, stopping");
                let _ = stop_tx.send(true);
            }
        });
        pipeline.run(source, stop_rx).await
    })?;

    print_json(&summary)
}

fn cmd_replay(range: &RangeArgs, store: &StoreArgs) -> Result<(), BedsideCliError> {
    let context = build_context(store)?;
    let frames = read_range(range)?;
    let output = replay_vitals(&context, range.side, &frames)?;

    print_json(&ReplayReport {
        side: range.side,
        records: output.records.len(),
        stats: output.stats,
    })
}

fn cmd_sleep(range: &RangeArgs, store: &StoreArgs) -> Result<(), BedsideCliError> {
    let context = build_context(store)?;
    let frames = read_range(range)?;
    let records = analyze_sleep(&context, range.side, &frames)?;
    if records.is_empty() {
        warn!("{} side: no sleep sessions in range", range.side);
    }
    print_json(&records)
}

fn cmd_calibrate(range: &RangeArgs, store: &StoreArgs) -> Result<(), BedsideCliError> {
    let context = build_context(store)?;
    let frames = read_range(range)?;
    let baseline = calibrate(&context, range.side, &frames)?;
    info!(
        "{} side baseline saved to {}",
        range.side,
        JsonFileBaselineStore::new(&store.baseline_dir).path_for(range.side).display()
    );
    print_json(&baseline)
}

fn cmd_doctor(input: Option<&Path>, store: &StoreArgs, json: bool) -> Result<(), BedsideCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "flux_version".to_string(),
        status: CheckStatus::Ok,
        message: format!("Bedside Flux version {}", FLUX_VERSION),
    });

    checks.push(match load_config(store.config.as_deref()) {
        Ok(_) => DoctorCheck {
            name: "config".to_string(),
            status: CheckStatus::Ok,
            message: match &store.config {
                Some(path) => format!("{} is valid", path.display()),
                None => "Using default configuration".to_string(),
            },
        },
        Err(e) => DoctorCheck {
            name: "config".to_string(),
            status: CheckStatus::Error,
            message: e.to_string(),
        },
    });

    let baselines = JsonFileBaselineStore::new(&store.baseline_dir);
    for side in Side::ALL {
        let name = format!("{}_baseline", side);
        checks.push(match baselines.load(side) {
            Ok(baseline) => DoctorCheck {
                name,
                status: CheckStatus::Ok,
                message: format!(
                    "out {:.1}, cen {:.1}, in {:.1}",
                    baseline.out.mean, baseline.cen.mean, baseline.inner.mean
                ),
            },
            Err(EngineError::CalibrationNotFound(_)) => DoctorCheck {
                name,
                status: CheckStatus::Warning,
                message: format!("{} does not exist", baselines.path_for(side).display()),
            },
            Err(e) => DoctorCheck {
                name,
                status: CheckStatus::Error,
                message: e.to_string(),
            },
        });
    }

    if let Some(path) = input {
        checks.push(match NdjsonFrameSource::open(path, false) {
            Ok(mut source) => match read_all(&mut source) {
                Ok(frames) if frames.is_empty() => DoctorCheck {
                    name: "input".to_string(),
                    status: CheckStatus::Warning,
                    message: format!("No sensor frames in {}", path.display()),
                },
                Ok(frames) => DoctorCheck {
                    name: "input".to_string(),
                    status: CheckStatus::Ok,
                    message: format!(
                        "{} frames from {} to {} ({} lines skipped)",
                        frames.len(),
                        frames.first().map(SensorFrame::ts).unwrap_or_default(),
                        frames.last().map(SensorFrame::ts).unwrap_or_default(),
                        source.skipped()
                    ),
                },
                Err(e) => DoctorCheck {
                    name: "input".to_string(),
                    status: CheckStatus::Error,
                    message: e.to_string(),
                },
            },
            Err(e) => DoctorCheck {
                name: "input".to_string(),
                status: CheckStatus::Error,
                message: format!("Cannot open {}: {}", path.display(), e),
            },
        });
    }

    let stdout_check = if atty::is(atty::Stream::Stdout) {
        DoctorCheck {
            name: "stdout".to_string(),
            status: CheckStatus::Ok,
            message: "stdout is a TTY (reports are pretty-printed)".to_string(),
        }
    } else {
        DoctorCheck {
            name: "stdout".to_string(),
            status: CheckStatus::Ok,
            message: "stdout is a pipe (reports are compact JSON)".to_string(),
        }
    };
    checks.push(stdout_check);

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: FLUX_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Bedside Doctor Report");
        println!("=====================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report.checks.iter().any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(BedsideCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

fn cmd_config() -> Result<(), BedsideCliError> {
    print!("{}", EngineConfig::default().to_toml_string()?);
    Ok(())
}

// Helper functions

fn load_config(path: Option<&Path>) -> Result<EngineConfig, EngineError> {
    match path {
        Some(path) => EngineConfig::load(path),
        None => Ok(EngineConfig::default()),
    }
}

fn build_context(store: &StoreArgs) -> Result<EngineContext, BedsideCliError> {
    let config = load_config(store.config.as_deref())?;
    Ok(EngineContext::new(
        config,
        Arc::new(JsonFileBaselineStore::new(&store.baseline_dir)),
        Arc::new(NdjsonVitalsSink::open(&store.vitals_out)?),
        Arc::new(NdjsonSleepSink::open(&store.sleep_out)?),
    ))
}

fn read_range(range: &RangeArgs) -> Result<Vec<SensorFrame>, BedsideCliError> {
    let log = NdjsonFrameSource::open(&range.input, false)?;
    let frames = source::read_range(log, range.start, range.end)?;
    info!("read {} frames between {} and {}", frames.len(), range.start, range.end);
    Ok(frames)
}

fn parse_time(value: &str) -> Result<i64, String> {
    if let Ok(epoch) = value.parse::<i64>() {
        return Ok(epoch);
    }
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.timestamp())
        .map_err(|e| format!("expected epoch seconds or RFC 3339 time: {}", e))
}

fn print_json<T: Serialize>(value: &T) -> Result<(), BedsideCliError> {
    let rendered = if atty::is(atty::Stream::Stdout) {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{}", rendered);
    Ok(())
}

// Error types

#[derive(Debug)]
enum BedsideCliError {
    Io(io::Error),
    Engine(EngineError),
    Json(serde_json::Error),
    DoctorFailed,
}

impl From<io::Error> for BedsideCliError {
    fn from(e: io::Error) -> Self {
        BedsideCliError::Io(e)
    }
}

impl From<EngineError> for BedsideCliError {
    fn from(e: EngineError) -> Self {
        BedsideCliError::Engine(e)
    }
}

impl From<serde_json::Error> for BedsideCliError {
    fn from(e: serde_json::Error) -> Self {
        BedsideCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<BedsideCliError> for CliError {
    fn from(e: BedsideCliError) -> Self {
        match e {
            BedsideCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            BedsideCliError::Engine(e) => engine_error(e),
            BedsideCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            BedsideCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
        }
    }
}

fn engine_error(e: EngineError) -> CliError {
    let (code, hint) = match &e {
        EngineError::CalibrationNotFound(side) => (
            "CALIBRATION_NOT_FOUND",
            Some(format!("Run 'bedside calibrate --side {}' over an empty-bed range", side)),
        ),
        EngineError::SourceExhausted => (
            "NO_FRAMES",
            Some("Check --start/--end against the log's timestamps with 'bedside doctor --input'".to_string()),
        ),
        EngineError::InvalidRange(_) => ("INVALID_RANGE", Some("--start must be earlier than --end".to_string())),
        EngineError::Config(_) | EngineError::ConfigRender(_) => (
            "CONFIG_ERROR",
            Some("Run 'bedside config' for a valid starting point".to_string()),
        ),
        EngineError::Io(_) => ("IO_ERROR", Some("Check file paths and permissions".to_string())),
        EngineError::Json(_) => ("JSON_ERROR", None),
        EngineError::Sink(_) => ("SINK_ERROR", Some("Check the vitals and sleep output files".to_string())),
        _ => ("ENGINE_ERROR", None),
    };
    CliError {
        code: code.to_string(),
        message: e.to_string(),
        hint,
    }
}

// Report types

#[derive(serde::Serialize)]
struct ReplayReport {
    side: Side,
    records: usize,
    stats: bedside_flux::replay::ReplayStats,
}

#[derive(serde::Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
