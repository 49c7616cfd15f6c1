use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tunneled_fetch::{
    MemoryPressureWarmer, NotificationContent, NotificationSink, ProcessEngine, ProxiedHttpClient,
    ProxyMode, ResultSink, SessionOptions, TextSink, TunnelLifecycleController,
};
use tunneled_fetch_common::FileConfigProvider;
use tunneled_fetch_common::constants::{
    DATA_ROOT_DIR_NAME, DEFAULT_TARGET_URL, INTERACTIVE_DEADLINE_SECS, NOTIFICATION_DEADLINE_SECS,
    REQUEST_TIMEOUT_SECS,
};
use tunneled_fetch_common::validation::validate_target_url;

/// CLI arguments for the tunneled fetcher
#[derive(Parser, Debug)]
#[command(name = "tfetch")]
#[command(about = "Fetch a URL through a local tunnel proxy under a hard deadline", long_about = None)]
#[command(version)]
struct Args {
    /// Tunnel config JSON file
    #[arg(
        short,
        long,
        env = "TFETCH_CONFIG",
        global = true,
        default_value = "tunnel-config.json"
    )]
    config: PathBuf,

    /// Embedded server entries file; enables embedded servers when set
    #[arg(long, env = "TFETCH_SERVER_ENTRIES", global = true)]
    server_entries: Option<PathBuf>,

    /// Directory the tunnel engine may write to
    #[arg(long, env = "TFETCH_DATA_ROOT", global = true)]
    data_root: Option<PathBuf>,

    /// Tunnel engine executable
    #[arg(long, env = "TFETCH_ENGINE", global = true, default_value = "tunnel-core")]
    engine: PathBuf,

    /// Extra argument for the tunnel engine (repeatable)
    #[arg(long = "engine-arg", global = true, allow_hyphen_values = true)]
    engine_args: Vec<String>,

    /// URL to fetch through the tunnel
    #[arg(short, long, global = true, default_value = DEFAULT_TARGET_URL)]
    url: String,

    /// How the request is routed through the tunnel
    #[arg(short, long, value_enum, global = true, default_value = "url-proxy")]
    mode: ProxyMode,

    /// Session deadline in seconds [default: 30 for notify, 600 for fetch]
    #[arg(long, global = true)]
    deadline: Option<u64>,

    /// Request timeout in seconds
    #[arg(long, global = true, default_value_t = REQUEST_TIMEOUT_SECS)]
    request_timeout: u64,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Rewrite a push notification with the fetch outcome
    Notify {
        /// Notification payload JSON file; read from stdin when omitted
        #[arg(short, long)]
        payload: Option<PathBuf>,

        /// Do not reserve memory before starting the tunnel
        #[arg(long)]
        no_reserve_memory: bool,
    },

    /// Print the fetch outcome
    Fetch,
}

/// Configuration for one run
#[derive(Debug, Clone)]
pub struct Config {
    /// Tunnel config JSON file
    pub config_path: PathBuf,

    /// Embedded server entries file, if any
    pub server_entries_path: Option<PathBuf>,

    /// Engine data root directory
    pub data_root: PathBuf,

    /// Tunnel engine executable and extra arguments
    pub engine_program: PathBuf,
    pub engine_args: Vec<String>,

    /// Timeout for the tunneled request itself
    pub request_timeout: Duration,

    pub session: SessionOptions,
}

impl Config {
    fn from_args(args: &Args) -> Result<Self> {
        // Checked only; the outcome names the URL exactly as given
        validate_target_url(&args.url)
            .with_context(|| format!("invalid target URL {:?}", args.url))?;

        let default_deadline = match args.command {
            Command::Notify { .. } => NOTIFICATION_DEADLINE_SECS,
            Command::Fetch => INTERACTIVE_DEADLINE_SECS,
        };

        let data_root = args
            .data_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(DATA_ROOT_DIR_NAME));

        Ok(Self {
            config_path: args.config.clone(),
            server_entries_path: args.server_entries.clone(),
            data_root,
            engine_program: args.engine.clone(),
            engine_args: args.engine_args.clone(),
            request_timeout: Duration::from_secs(args.request_timeout),
            session: SessionOptions {
                target_url: args.url.clone(),
                mode: args.mode,
                deadline: Duration::from_secs(args.deadline.unwrap_or(default_deadline)),
                use_embedded_servers: args.server_entries.is_some(),
            },
        })
    }
}

/// Run one session against the configured engine and deliver to `sink`
async fn run_session(config: &Config, sink: Arc<dyn ResultSink>) -> Result<()> {
    let provider = Arc::new(FileConfigProvider::new(
        config.config_path.clone(),
        config.server_entries_path.clone(),
        config.data_root.clone(),
    ));
    let engine = Box::new(ProcessEngine::new(
        config.engine_program.clone(),
        config.engine_args.clone(),
    ));
    let fetcher = Arc::new(ProxiedHttpClient::new(config.request_timeout));

    let controller =
        TunnelLifecycleController::new(config.session.clone(), engine, provider, fetcher, sink);

    // Ctrl-C stands in for the host announcing imminent termination
    let deadline = controller.deadline().clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl-C, expiring the session deadline");
            deadline.expire_now();
        }
    });

    let report = controller.start().await?;
    interrupt.abort();

    info!(
        "Session {} ended in state {} after {:?}",
        report.session_id, report.final_state, report.elapsed
    );
    Ok(())
}

async fn run_notify(config: &Config, payload: Option<&Path>, reserve_memory: bool) -> Result<()> {
    let raw = read_payload(payload).await?;
    let content =
        NotificationContent::from_payload(&raw).context("invalid notification payload")?;
    let sink = Arc::new(NotificationSink::new(content, std::io::stdout()));

    // Held until the process exits
    let warmer = MemoryPressureWarmer::default();
    if reserve_memory {
        match warmer.warm_up() {
            Ok(status) => info!("Memory reservation: {:?}", status),
            Err(e) => {
                error!("Memory reservation failed: {}", e);
                sink.deliver("Failed to allocate memory");
                return Ok(());
            }
        }
    } else {
        info!("Did not reserve memory");
    }

    run_session(config, sink).await?;
    info!("Held {} bytes of reserved memory", warmer.reserved_bytes());
    Ok(())
}

async fn run_fetch(config: &Config) -> Result<()> {
    let sink = Arc::new(TextSink::new(std::io::stdout()));
    run_session(config, sink).await
}

async fn read_payload(path: Option<&Path>) -> Result<Vec<u8>> {
    match path {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read payload {}", path.display())),
        None => {
            let mut raw = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut raw)
                .await
                .context("failed to read payload from stdin")?;
            Ok(raw)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Outcomes go to stdout; logs stay on stderr
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    info!("Tunneled fetch v{}", env!("CARGO_PKG_VERSION"));
    info!("Target URL: {} ({:?})", args.url, args.mode);

    let config = Config::from_args(&args)?;

    match &args.command {
        Command::Notify {
            payload,
            no_reserve_memory,
        } => run_notify(&config, payload.as_deref(), !no_reserve_memory).await,
        Command::Fetch => run_fetch(&config).await,
    }
}
