use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use streamtest_core::{
    load_tester_config, RunMode, RunOutcome, RunnerStatus, SimulationReport, TesterApp,
    TesterConfig, TesterError,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod commands;
mod server;

pub use commands::check::{ConfigCheckArgs, ConfigReport};
pub use commands::geo::{GeoRankArgs, GeoRanking};
pub use server::{metrics_router, serve_metrics};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] streamtest_core::ConfigError),
    #[error("{0}")]
    Tester(#[from] TesterError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed to initialise logging: {0}")]
    Logging(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Synthetic end-to-end tester for the media platform", long_about = None)]
pub struct Cli {
    /// Path to streamtest.toml
    #[arg(long, global = true, default_value = "configs/streamtest.toml")]
    pub config: PathBuf,
    /// Overrides api.server
    #[arg(long, global = true, env = "STREAMTEST_API_SERVER")]
    pub api_server: Option<String>,
    /// Overrides api.access_token
    #[arg(long, global = true, env = "STREAMTEST_API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,
    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs the enabled sessions; loops when continuous.enabled is set
    Run(RunArgs),
    /// Loops test cycles with alerting and metrics until the duration passes
    Continuous(ContinuousArgs),
    /// Node selection helpers
    #[command(subcommand)]
    Geo(GeoCommands),
    /// Configuration helpers
    #[command(subcommand)]
    Config(ConfigCommands),
    /// Prints shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Single pass even if continuous.enabled is set
    #[arg(long)]
    pub once: bool,
    /// Load test: starts this many live-record sessions, staggered by 3-7s
    #[arg(long, value_name = "STREAMS", conflicts_with = "once")]
    pub sim: Option<usize>,
}

/// What a tester run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workload {
    Mode(RunMode),
    Simulate(usize),
}

impl RunArgs {
    pub fn workload(&self, config: &TesterConfig) -> Workload {
        match self.sim {
            Some(streams) if streams > 1 => Workload::Simulate(streams),
            _ if config.continuous.enabled && !self.once && self.sim.is_none() => {
                Workload::Mode(RunMode::Continuous)
            }
            _ => Workload::Mode(RunMode::Single),
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct ContinuousArgs {
    /// Overrides continuous.total_duration_seconds
    #[arg(long, value_name = "SECONDS")]
    pub duration: Option<u64>,
    /// Overrides continuous.pause_seconds
    #[arg(long, value_name = "SECONDS")]
    pub pause: Option<u64>,
    /// Overrides metrics.bind
    #[arg(long, value_name = "ADDR")]
    pub metrics_bind: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum GeoCommands {
    /// Ranks candidate nodes by distance from an origin
    Rank(GeoRankArgs),
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Loads and validates the configuration, printing it with secrets masked
    Check(ConfigCheckArgs),
}

/// Runs the parsed command and returns the process exit code.
pub fn run(cli: Cli) -> Result<i32> {
    if let Commands::Completions { shell } = &cli.command {
        let mut command = Cli::command();
        let name = command.get_name().to_string();
        clap_complete::generate(*shell, &mut command, name, &mut io::stdout());
        return Ok(0);
    }
    init_logging(&cli.log_level, cli.log_json)?;

    match &cli.command {
        Commands::Run(args) => {
            let config = load_config(&cli)?;
            let workload = args.workload(&config);
            run_tester(config, workload, cli.format)
        }
        Commands::Continuous(args) => {
            let mut config = load_config(&cli)?;
            apply_continuous_args(&mut config, args);
            run_tester(config, Workload::Mode(RunMode::Continuous), cli.format)
        }
        Commands::Geo(GeoCommands::Rank(args)) => {
            let runtime = current_thread_runtime()?;
            let ranking = runtime.block_on(commands::geo::rank(args))?;
            render(&ranking, cli.format)?;
            Ok(0)
        }
        Commands::Config(ConfigCommands::Check(args)) => {
            let config = load_config(&cli)?;
            let report = commands::check::check(cli.config.clone(), &config, args);
            render(&report, cli.format)?;
            Ok(if report.is_valid() { 0 } else { 1 })
        }
        Commands::Completions { .. } => Ok(0),
    }
}

fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .map_err(|err| AppError::InvalidArgument(format!("log level {level}: {err}")))?,
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|err| AppError::Logging(err.to_string()))
}

/// Loads the config file and applies the flag overrides.
pub fn load_config(cli: &Cli) -> Result<TesterConfig> {
    let mut config = load_tester_config(&cli.config)?;
    apply_overrides(&mut config, cli);
    Ok(config)
}

fn apply_overrides(config: &mut TesterConfig, cli: &Cli) {
    if let Some(server) = &cli.api_server {
        config.api.server = server.clone();
    }
    if let Some(token) = &cli.api_token {
        config.api.access_token = Some(token.clone());
    }
}

fn apply_continuous_args(config: &mut TesterConfig, args: &ContinuousArgs) {
    config.continuous.enabled = true;
    if let Some(duration) = args.duration {
        config.continuous.total_duration_seconds = Some(duration);
    }
    if let Some(pause) = args.pause {
        config.continuous.pause_seconds = pause;
    }
    if let Some(bind) = &args.metrics_bind {
        config.metrics.enabled = true;
        config.metrics.bind = bind.clone();
    }
}

fn current_thread_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}

fn run_tester(config: TesterConfig, workload: Workload, format: OutputFormat) -> Result<i32> {
    let mode = match workload {
        Workload::Mode(mode) => mode,
        Workload::Simulate(_) => RunMode::Single,
    };
    config.validate(mode)?;
    let metrics_addr = if mode == RunMode::Continuous && config.metrics.enabled {
        let addr = config.metrics.bind.parse::<SocketAddr>().map_err(|err| {
            AppError::InvalidArgument(format!("metrics.bind {}: {err}", config.metrics.bind))
        })?;
        Some(addr)
    } else {
        None
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(async move {
        let app = TesterApp::from_config(config)?;
        let cancel = app.cancellation_token();
        let signals = tokio::spawn(watch_signals(cancel.clone()));
        let server = match (metrics_addr, app.metrics()) {
            (Some(addr), Some(metrics)) => Some(tokio::spawn(serve_metrics(
                addr,
                metrics.clone(),
                cancel.clone(),
            ))),
            _ => None,
        };

        let (outcome, simulation) = match workload {
            Workload::Mode(mode) => (app.start(mode).await, None),
            Workload::Simulate(streams) => {
                let report = app.simulate(streams).await;
                (report.outcome.clone(), Some(report))
            }
        };
        let interrupted = cancel.is_cancelled();
        app.cancel();
        app.done().await;
        signals.abort();
        if let Some(server) = server {
            match server.await {
                Ok(Err(err)) => warn!(error = %err, "metrics server failed"),
                Err(err) => warn!(error = %err, "metrics server task failed"),
                Ok(Ok(())) => {}
            }
        }
        let mut report = RunReport::new(mode, outcome, interrupted, app.status());
        report.simulation = simulation;
        Ok::<_, AppError>(report)
    })?;

    render(&report, format)?;
    Ok(report.exit_code)
}

/// Cancels `cancel` on ctrl-c or SIGTERM.
async fn watch_signals(cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(error = %err, "failed to listen for interrupt");
                return;
            }
            info!("interrupt received, shutting down");
            cancel.cancel();
        }
        _ = terminate() => {
            info!("terminate received, shutting down");
            cancel.cancel();
        }
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(err) => {
            warn!(error = %err, "failed to listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub mode: RunMode,
    pub exit_code: i32,
    pub interrupted: bool,
    pub error: Option<TesterError>,
    pub runners: Vec<RunnerStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulation: Option<SimulationReport>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn new(
        mode: RunMode,
        outcome: RunOutcome,
        interrupted: bool,
        runners: Vec<RunnerStatus>,
    ) -> Self {
        Self {
            mode,
            exit_code: outcome.exit_code,
            interrupted,
            error: outcome.error,
            runners,
            simulation: None,
            finished_at: Utc::now(),
        }
    }
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

pub(crate) trait DisplayFallback {
    fn display(&self) -> String;
}

impl DisplayFallback for RunReport {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        for runner in &self.runners {
            let last = runner
                .last
                .as_ref()
                .map(|cycle| format!("cycle {} exit={}", cycle.cycle, cycle.exit_code))
                .unwrap_or_else(|| "no cycles".to_string());
            lines.push(format!(
                "{}: {:?} cycles={} failures={} last={}",
                runner.tester, runner.state, runner.cycles, runner.failures, last
            ));
        }
        if let Some(simulation) = &self.simulation {
            lines.push(format!(
                "{} streams ended in {:.1}s, {}/{} succeeded ({:.1}%)",
                simulation.streams,
                simulation.elapsed_ms as f64 / 1000.0,
                simulation.succeeded,
                simulation.streams,
                simulation.success_percent()
            ));
        }
        let verdict = match (&self.error, self.interrupted) {
            (Some(err), _) => format!("FAILED {err}"),
            (None, true) => "INTERRUPTED".to_string(),
            (None, false) => "PASSED".to_string(),
        };
        lines.push(format!("{:?} run {verdict} (exit {})", self.mode, self.exit_code));
        lines.join("\n")
    }
}
