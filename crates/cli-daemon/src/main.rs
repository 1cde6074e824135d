//! CLI entry point for RecodeX
//!
//! Parses command line arguments, sets up logging and dispatches to the
//! daemon, a one-shot transcode or one of the inspection commands.

use clap::{Parser, Subcommand};
use recodex::config::ConfigError;
use recodex::daemon::ffmpeg_backend;
use recodex::startup::detect_hw_accel;
use recodex::{
    run_startup_checks, Config, Daemon, DaemonError, FfprobeProber, FileJobStore, JobFilter,
    JobState, JobStore, MemoryJobStore, StatsAggregator, StatsSnapshot, StoreError,
    SubmitOutcome,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// RecodeX - watch folders and transcode media to encoding profiles
#[derive(Parser, Debug)]
#[command(name = "recodex")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon: scan watch folders, process jobs, serve the HTTP API
    Run {
        /// Skip startup checks (ffmpeg, ffprobe). For testing only.
        #[arg(long, default_value = "false")]
        skip_checks: bool,
    },
    /// Transcode a single file and wait for the result
    Transcode {
        input: PathBuf,
        /// Profile key or display name
        profile: String,
        /// Output directory (defaults to the input's directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Log the ffmpeg command instead of running it
        #[arg(long)]
        dry_run: bool,
    },
    /// List persisted jobs
    Jobs {
        /// Comma-separated states, e.g. `pending,failed`
        #[arg(long)]
        state: Option<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Print statistics over finished jobs
    Stats {
        /// Print JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
    /// Inspect or create configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run the startup checks and report detected hardware
    Check,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write the default configuration to the `--config` path
    Init {
        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug)]
enum CliError {
    Daemon(DaemonError),
    Usage(String),
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Daemon(e) => write!(f, "{}", e),
            CliError::Usage(msg) => write!(f, "{}", msg),
        }
    }
}

impl From<DaemonError> for CliError {
    fn from(e: DaemonError) -> Self {
        CliError::Daemon(e)
    }
}

impl From<StoreError> for CliError {
    fn from(e: StoreError) -> Self {
        CliError::Daemon(DaemonError::Store(e))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Runs before loading so a broken file can be replaced with --force.
    if let Command::Config {
        action: ConfigAction::Init { force },
    } = args.command
    {
        return init_config(&args.config, force);
    }

    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.logging.level);

    let result = match args.command {
        Command::Run { skip_checks } => run_daemon(config, skip_checks).await,
        Command::Transcode {
            input,
            profile,
            output,
            dry_run,
        } => transcode(config, &input, &profile, output.as_deref(), dry_run).await,
        Command::Jobs { state, json } => list_jobs(&config, state.as_deref(), json),
        Command::Stats { json } => print_stats(&config, json),
        Command::Config { action } => match action {
            ConfigAction::Show => print_json(&config),
            ConfigAction::Init { force } => init_config_result(&args.config, force),
        },
        Command::Check => check(),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Load `path` when it exists, otherwise start from the built-in defaults.
fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if path.exists() {
        return Config::load(path);
    }
    let mut config = Config::parse_toml("")?;
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

fn init_config(path: &Path, force: bool) -> ExitCode {
    match init_config_result(path, force) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_config_result(path: &Path, force: bool) -> Result<ExitCode, CliError> {
    Config::write_default(path, force).map_err(|e| CliError::Usage(e.to_string()))?;
    println!("Wrote default configuration to {}", path.display());
    Ok(ExitCode::SUCCESS)
}

/// RUST_LOG wins over the configured level.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_daemon(config: Config, skip_checks: bool) -> Result<ExitCode, CliError> {
    let daemon = if skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
        let store: Arc<dyn JobStore> = Arc::new(FileJobStore::open(&config.worker.state_dir)?);
        let backend = Arc::new(ffmpeg_backend(&config));
        Daemon::with_components(
            config,
            store,
            backend,
            Arc::new(FfprobeProber),
            recodex::HwAccel::None,
        )
    } else {
        Daemon::with_config(config).await?
    };

    if daemon.config.server.enabled {
        info!(bind = %daemon.config.server.bind, "Serving HTTP API");
    }
    daemon.run().await?;
    Ok(ExitCode::SUCCESS)
}

async fn transcode(
    config: Config,
    input: &Path,
    profile: &str,
    output: Option<&Path>,
    dry_run: bool,
) -> Result<ExitCode, CliError> {
    let hw_accel = if dry_run {
        detect_hw_accel()
    } else {
        run_startup_checks()
            .map_err(DaemonError::from)?
            .hw_accel
    };
    let backend = Arc::new(ffmpeg_backend(&config));
    let daemon = Daemon::with_components(
        config,
        Arc::new(MemoryJobStore::new()),
        backend,
        Arc::new(FfprobeProber),
        hw_accel,
    );
    daemon.start()?;

    let outcome = daemon.submit(input, profile, output, dry_run).await;
    let job_id = match outcome {
        Ok(SubmitOutcome::Queued { job_id }) => job_id,
        Ok(SubmitOutcome::Skipped { reason }) => {
            println!("Skipped {}: {}", input.display(), reason);
            daemon.shutdown().await;
            return Ok(ExitCode::SUCCESS);
        }
        Err(e) => {
            daemon.shutdown().await;
            return Err(CliError::Daemon(e));
        }
    };

    let job = daemon.wait_for_job(&job_id).await;
    daemon.shutdown().await;
    let job = job?;

    print_json(&job)?;
    if job.state == JobState::Completed {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn list_jobs(config: &Config, states: Option<&str>, json: bool) -> Result<ExitCode, CliError> {
    let filter = match states {
        None => JobFilter::all(),
        Some(states) => {
            let states = states
                .split(',')
                .map(str::parse::<JobState>)
                .collect::<Result<Vec<_>, _>>()
                .map_err(CliError::Usage)?;
            JobFilter::states(&states)
        }
    };
    let store = FileJobStore::open(&config.worker.state_dir)?;
    let jobs = store.list(&filter)?;

    if json {
        return print_json(&jobs);
    }
    for job in &jobs {
        println!(
            "{}  {:<9}  {}/{}  {:<12}  {}",
            job.id,
            job.state.to_string(),
            job.attempts,
            job.max_attempts,
            job.profile,
            job.source_path.display()
        );
    }
    println!("{} job(s)", jobs.len());
    Ok(ExitCode::SUCCESS)
}

fn print_stats(config: &Config, json: bool) -> Result<ExitCode, CliError> {
    let store: Arc<dyn JobStore> = Arc::new(FileJobStore::open(&config.worker.state_dir)?);
    let snapshot = StatsAggregator::new(store).snapshot()?;
    if json {
        return print_json(&snapshot);
    }
    print!("{}", render_stats(&snapshot));
    Ok(ExitCode::SUCCESS)
}

fn render_stats(stats: &StatsSnapshot) -> String {
    let mut out = format!(
        "completed {}  failed {}  cancelled {}  dry-run {}\n\
         saved {} bytes ({:.1}%)  avg ratio {:.2}  avg time {:.0} ms\n",
        stats.completed,
        stats.failed,
        stats.cancelled,
        stats.dry_run,
        stats.bytes_saved,
        stats.space_saved_percent,
        stats.avg_compression_ratio,
        stats.avg_processing_ms,
    );
    if !stats.profiles.is_empty() {
        out.push_str("\nprofiles:\n");
        for (name, profile) in &stats.profiles {
            out.push_str(&format!(
                "  {:<12}  {:>5} done  {:>14} -> {:<14}  {:.0} ms\n",
                name, profile.completed, profile.bytes_in, profile.bytes_out, profile.avg_processing_ms
            ));
        }
    }
    if !stats.codecs.is_empty() {
        out.push_str("\ncodecs:\n");
        for (codec, codec_stats) in &stats.codecs {
            out.push_str(&format!(
                "  {:<12}  {:>5} done  {:.0} ms\n",
                codec, codec_stats.completed, codec_stats.avg_processing_ms
            ));
        }
    }
    if !stats.top_space_savers.is_empty() {
        out.push_str("\ntop space savers:\n");
        for saver in &stats.top_space_savers {
            out.push_str(&format!(
                "  {:>14}  {}  {}\n",
                saver.bytes_saved,
                saver.job_id,
                saver.source_path.display()
            ));
        }
    }
    out
}

fn check() -> Result<ExitCode, CliError> {
    let report = run_startup_checks().map_err(DaemonError::from)?;
    print_json(&report)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<ExitCode, CliError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| CliError::Usage(format!("Failed to serialize output: {}", e)))?;
    println!("{}", text);
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_transcode_args() {
        let args = Args::parse_from([
            "recodex",
            "transcode",
            "/m/a.mkv",
            "balanced",
            "--output",
            "/out",
            "--dry-run",
        ]);
        match args.command {
            Command::Transcode {
                input,
                profile,
                output,
                dry_run,
            } => {
                assert_eq!(input, PathBuf::from("/m/a.mkv"));
                assert_eq!(profile, "balanced");
                assert_eq!(output, Some(PathBuf::from("/out")));
                assert!(dry_run);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_global_config_flag() {
        let args = Args::parse_from(["recodex", "jobs", "--state", "failed", "-c", "/etc/recodex.toml"]);
        assert_eq!(args.config, PathBuf::from("/etc/recodex.toml"));
        assert!(matches!(args.command, Command::Jobs { state: Some(_), json: false }));
    }

    #[test]
    fn test_config_init_args() {
        let args = Args::parse_from(["recodex", "config", "init", "--force", "-c", "/tmp/r.toml"]);
        assert!(matches!(
            args.command,
            Command::Config {
                action: ConfigAction::Init { force: true }
            }
        ));
        assert_eq!(args.config, PathBuf::from("/tmp/r.toml"));
    }

    #[test]
    fn test_config_init_writes_loadable_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recodex.toml");

        init_config_result(&path, false).unwrap();
        let config = load_config(&path).unwrap();
        assert!(config.profiles.contains_key("balanced"));

        assert!(init_config_result(&path, false).is_err());
        assert!(init_config_result(&path, true).is_ok());
    }

    #[test]
    fn test_render_stats_lists_savers_and_codecs() {
        let stats = StatsSnapshot {
            completed: 2,
            bytes_saved: 600,
            codecs: [(
                "hevc".to_string(),
                recodex::CodecStats {
                    completed: 2,
                    avg_processing_ms: 1500.0,
                },
            )]
            .into_iter()
            .collect(),
            top_space_savers: vec![recodex::SpaceSaver {
                job_id: "job-1".to_string(),
                source_path: PathBuf::from("/m/big.mkv"),
                profile: "archive".to_string(),
                bytes_saved: 400,
            }],
            ..StatsSnapshot::default()
        };

        let text = render_stats(&stats);
        assert!(text.contains("completed 2"));
        assert!(text.contains("codecs:"));
        assert!(text.contains("hevc"));
        assert!(text.contains("/m/big.mkv"));
        assert!(!text.contains("profiles:"));
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let config = load_config(Path::new("/nonexistent/recodex.toml")).unwrap();
        assert!(config.profiles.contains_key("balanced"));
    }
}
