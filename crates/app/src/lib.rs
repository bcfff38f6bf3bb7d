use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use facebatch_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use facebatch_core::image_ops::{self, MergeOptions, OutputFormat, DEFAULT_QUALITY};
use facebatch_core::logging::{
    self, LogFilters, DEFAULT_LOG_FILTER, DEFAULT_LOG_RETENTION_FILES,
};
use facebatch_core::server::{app_router, app_state_with_config};

#[derive(Parser)]
#[command(
    name = "facebatch",
    about = "Batch face-swap server backed by a ReActor-compatible inference service",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

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

    #[arg(
        long = "log-retention",
        value_name = "FILES",
        global = true,
        default_value_t = DEFAULT_LOG_RETENTION_FILES,
        help = "Number of daily log files to keep"
    )]
    log_retention: usize,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Combine the left half of one image with the right half of another.
    Merge(MergeArgs),
}

#[derive(Args)]
struct MergeArgs {
    #[arg(help = "Image whose left half is kept")]
    left: PathBuf,
    #[arg(help = "Image whose right half is kept")]
    right: PathBuf,
    #[arg(short = 'o', long, help = "Output file")]
    output: PathBuf,
    #[arg(long, help = "Keep the left half unmirrored")]
    no_mirror: bool,
    #[arg(
        long,
        value_name = "jpeg|png",
        help = "Output encoding (defaults to the output file extension)"
    )]
    format: Option<String>,
    #[arg(long, default_value_t = i64::from(DEFAULT_QUALITY), help = "JPEG quality, 1-100")]
    quality: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Server,
    Merge,
}

impl RunMode {
    fn name(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Merge => "merge",
        }
    }
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = match cli.command {
        Some(Commands::Merge(_)) => RunMode::Merge,
        None => RunMode::Server,
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        &resolved_data_dir,
        cli.verbose,
        cli.log_filter.as_deref(),
        cli.log_retention,
    );
    log_startup_metadata(mode, &resolved_data_dir);

    match cli.command {
        Some(Commands::Merge(merge)) => run_merge(merge).await,
        None => run_server(cli.port, cli.host, resolved_data_dir).await,
    }
}

fn init_logging(data_dir: &Path, verbose: u8, cli_log_filter: Option<&str>, retention: usize) {
    let crash_hook = logging::install_panic_hook(data_dir);
    if let Err(error) = &crash_hook {
        eprintln!(
            "Warning: panic crash artifacts unavailable under '{}': {error}.",
            data_dir.display()
        );
    }

    let rust_log = std::env::var("RUST_LOG").ok();
    let filters = LogFilters::select(cli_log_filter, verbose, rust_log.as_deref());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console, "console"));

    let (file_layer, file_error) = match logging::rolling_log_file(data_dir, retention) {
        Ok(appender) => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(logging::scrubbed(appender))
                    .with_filter(parse_env_filter_with_fallback(&filters.file, "file")),
            ),
            None,
        ),
        Err(error) => (None, Some(error)),
    };

    if let Err(error) = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
    {
        eprintln!(
            "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
        );
        return;
    }

    if let Some(error) = file_error {
        warn!(
            error = %format!("{error:#}"),
            "Persistent file logging unavailable; continuing with console-only logging"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(mode: RunMode, data_dir: &Path) {
    info!(
        mode = mode.name(),
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    if let Err(e) = initialize_data_dir(&data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let cfg_path = config_path(&data_dir);
    let mut config = match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };

    if let Some(port) =
        port_override.or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
    {
        config.server.port = port;
    }
    if let Some(host) = host_override {
        config.server.host = host;
    }
    let addr = format!("{}:{}", config.server.host, config.server.port);

    info!(
        endpoint = %config.inference.endpoint,
        output_dir = %config.output_dir(&data_dir).display(),
        queue_capacity = config.processing.queue_capacity,
        "Loaded configuration"
    );

    let state = app_state_with_config(config, data_dir)?;
    let app = app_router(state);

    info!(%addr, "Starting facebatch server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// `--format` when given, else inferred from the output extension.
fn merge_format_for(output: &Path, explicit: Option<&str>) -> OutputFormat {
    let requested = explicit.map(ToString::to_string).or_else(|| {
        output
            .extension()
            .map(|ext| ext.to_string_lossy().into_owned())
    });
    requested
        .as_deref()
        .map(OutputFormat::from_str_lossy)
        .unwrap_or_default()
}

async fn run_merge(args: MergeArgs) -> Result<()> {
    let left = tokio::fs::read(&args.left)
        .await
        .with_context(|| format!("failed to read {}", args.left.display()))?;
    let right = tokio::fs::read(&args.right)
        .await
        .with_context(|| format!("failed to read {}", args.right.display()))?;

    let options = MergeOptions {
        mirror_left: !args.no_mirror,
        format: merge_format_for(&args.output, args.format.as_deref()),
        quality: image_ops::clamp_quality(args.quality),
    };
    info!(
        left = %args.left.display(),
        right = %args.right.display(),
        format = %options.format,
        mirror_left = options.mirror_left,
        "Merging images"
    );

    let merged =
        tokio::task::spawn_blocking(move || image_ops::merge_pair(&left, &right, options))
            .await
            .context("merge task panicked")?
            .context("failed to merge images")?;

    tokio::fs::write(&args.output, &merged)
        .await
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    info!(output = %args.output.display(), bytes = merged.len(), "Merged image written");
    Ok(())
}
