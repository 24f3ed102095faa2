//! `modelmuxd` entry point.
//!
//! Bootstraps the process-group scheduler and HTTP proxy:
//! - Configuration loading
//! - HTTP listener setup
//! - Config hot-reload watcher
//! - Signal handling for graceful shutdown
//!
//! ## CLI Subcommands
//!
//! - `modelmuxd serve` - run the router (default)
//! - `modelmuxd health` - query a running instance's health (exit 0/1)
//! - `modelmuxd status` - print a running instance's model listing
//! - `modelmuxd version` - print the build version

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use modelmux::config::{Config, ConfigWatcher};
use modelmux::logs::LogFanout;
use modelmux::manager::Manager;

const DEFAULT_LISTEN: &str = "127.0.0.1:8080";
const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(1);
const CONFIG_DEBOUNCE: Duration = Duration::from_millis(300);

#[derive(Parser)]
#[command(name = "modelmuxd", version, about = "Process-group scheduler and HTTP proxy for on-demand inference backends")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the router (default if no subcommand given).
    Serve(ServeArgs),
    /// Check whether a running instance is answering requests.
    Health(RemoteArgs),
    /// Print a running instance's model listing.
    Status(RemoteArgs),
    /// Print the build version.
    Version,
}

#[derive(clap::Args)]
struct ServeArgs {
    /// Path to the YAML config file.
    #[arg(long, env = "MODELMUX_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Address the HTTP proxy listens on.
    #[arg(long, env = "MODELMUX_LISTEN", default_value = DEFAULT_LISTEN)]
    listen: SocketAddr,

    /// Disable the config file watcher (reload only via restart).
    #[arg(long)]
    no_watch: bool,
}

#[derive(clap::Args)]
struct RemoteArgs {
    /// Base URL of the running instance.
    #[arg(long, env = "MODELMUX_URL", default_value = "http://127.0.0.1:8080")]
    url: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve(ServeArgs {
        config: PathBuf::from("config.yaml"),
        listen: DEFAULT_LISTEN.parse().expect("valid default listen address"),
        no_watch: false,
    })) {
        Command::Serve(args) => run_serve(args).await,
        Command::Health(args) => run_health(args).await,
        Command::Status(args) => run_status(args).await,
        Command::Version => {
            println!("modelmuxd {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

async fn run_serve(args: ServeArgs) -> ExitCode {
    init_tracing();

    let yaml = match tokio::fs::read_to_string(&args.config).await {
        Ok(yaml) => yaml,
        Err(e) => {
            error!(path = %args.config.display(), error = %e, "failed to read config file");
            return ExitCode::FAILURE;
        }
    };

    let config = match Config::from_yaml(&yaml) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to parse config file");
            return ExitCode::FAILURE;
        }
    };

    let shared_log = Arc::new(LogFanout::new());
    let http_client = match reqwest::Client::builder().build() {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "failed to build HTTP client");
            return ExitCode::FAILURE;
        }
    };

    let manager = Manager::new(config, shared_log, http_client);

    let listener = match TcpListener::bind(args.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %args.listen, error = %e, "failed to bind listen address");
            return ExitCode::FAILURE;
        }
    };
    info!(addr = %args.listen, config = %args.config.display(), "modelmuxd listening");

    let router = modelmux::http::router(Arc::clone(&manager));

    let mut watcher_handle = None;
    if !args.no_watch {
        let watcher = ConfigWatcher::new(args.config.clone(), CONFIG_POLL_INTERVAL, CONFIG_DEBOUNCE);
        let watcher_manager = Arc::clone(&manager);
        watcher_handle = Some(tokio::spawn(async move {
            watcher
                .run(move |yaml| {
                    let manager = Arc::clone(&watcher_manager);
                    async move {
                        match manager.reload(&yaml).await {
                            Ok(()) => info!("config reload applied"),
                            Err(e) => error!(error = %e, "config reload rejected, keeping previous config"),
                        }
                    }
                })
                .await;
        }));
    }

    let serve_result = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    if let Some(handle) = watcher_handle {
        handle.abort();
    }

    manager.shutdown().await;

    match serve_result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server error");
            ExitCode::FAILURE
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

async fn run_health(args: RemoteArgs) -> ExitCode {
    let client = reqwest::Client::new();
    match client.get(format!("{}/v1/models", args.url)).send().await {
        Ok(resp) if resp.status().is_success() => {
            println!("ok");
            ExitCode::SUCCESS
        }
        Ok(resp) => {
            eprintln!("unhealthy: HTTP {}", resp.status());
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("unreachable: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_status(args: RemoteArgs) -> ExitCode {
    let client = reqwest::Client::new();
    match client.get(format!("{}/v1/models", args.url)).send().await {
        Ok(resp) if resp.status().is_success() => match resp.text().await {
            Ok(body) => {
                println!("{body}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("failed to read response body: {e}");
                ExitCode::FAILURE
            }
        },
        Ok(resp) => {
            eprintln!("HTTP {}", resp.status());
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("unreachable: {e}");
            ExitCode::FAILURE
        }
    }
}
