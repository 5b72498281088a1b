//! Tapwire - intercepting TCP relay.
//!
//! Listens for one local client, connects it to a remote service, and prints
//! every relayed chunk as a hex dump while recording it to a CSV traffic log.

mod console;
mod error;
mod hexdump;
mod traffic_log;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use directories::ProjectDirs;
use tapwire_core::{RelayConfig, RelayEvent, RelayOrchestrator, Severity};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::console::Console;
use crate::traffic_log::TrafficLog;

/// Tapwire - intercepting TCP relay
#[derive(Parser, Debug)]
#[command(name = "tapwire", version, about)]
struct Args {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host the local listener binds to
    #[arg(long)]
    listen_host: Option<String>,

    /// Port the local listener binds to
    #[arg(long)]
    listen_port: Option<u16>,

    /// Remote service host
    #[arg(long)]
    remote_host: Option<String>,

    /// Remote service port
    #[arg(long)]
    remote_port: Option<u16>,

    /// Maximum bytes per received chunk
    #[arg(long)]
    recv_buffer: Option<usize>,

    /// Outbound connect timeout in milliseconds
    #[arg(long)]
    connect_timeout_ms: Option<u64>,

    /// CSV traffic log path (defaults to the documents directory)
    #[arg(long)]
    traffic_log: Option<PathBuf>,

    /// Do not write a traffic log
    #[arg(long)]
    no_traffic_log: bool,

    /// Do not connect to the remote service when the local client connects
    #[arg(long)]
    no_auto_sender: bool,

    /// Hide informational notifications
    #[arg(long, short)]
    quiet: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Loads the config file (if any) and applies command line overrides.
    fn relay_config(&self) -> error::Result<RelayConfig> {
        let mut config = match &self.config {
            Some(path) => RelayConfig::from_file(path)?,
            None => RelayConfig::default(),
        };

        if let Some(host) = &self.listen_host {
            config.listener_host = host.clone();
        }
        if let Some(port) = self.listen_port {
            config.listener_port = port;
        }
        if let Some(host) = &self.remote_host {
            config.sender_host = host.clone();
        }
        if let Some(port) = self.remote_port {
            config.sender_port = port;
        }
        if let Some(size) = self.recv_buffer {
            config = config.with_recv_buffer_size(size);
        }
        if let Some(ms) = self.connect_timeout_ms {
            config = config.with_connect_timeout(Duration::from_millis(ms));
        }
        if let Some(path) = &self.traffic_log {
            config = config.with_traffic_log(path);
        }
        if self.no_auto_sender {
            config = config.without_auto_start();
        }

        config.validate()?;
        Ok(config)
    }
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "tapwire", "Tapwire").map(|dirs| dirs.data_dir().join("logs"))
}

impl Args {
    /// Level for the `tapwire` targets. `--debug` wins over `--quiet`, which
    /// wins over `--log-level`.
    fn effective_log_level(&self) -> &str {
        if self.debug {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            &self.log_level
        }
    }
}

/// Opens the daily rolling log file, or `None` if the logs directory is
/// unusable.
fn file_writer() -> Option<(NonBlocking, WorkerGuard)> {
    let log_dir = logs_dir()?;
    std::fs::create_dir_all(&log_dir).ok()?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(5)
        .filename_prefix("tapwire")
        .filename_suffix("log")
        .build(&log_dir)
        .ok()?;
    Some(tracing_appender::non_blocking(appender))
}

/// Installs the global subscriber.
///
/// The console already prints relay notifications, so tracing reaches stderr
/// only with `--debug` or when no log file could be opened.
fn init_logging(args: &Args) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("tapwire={},warn", args.effective_log_level()))
    });

    let (file, guard) = match file_writer() {
        Some((writer, guard)) => (Some(writer), Some(guard)),
        None => (None, None),
    };
    let to_stderr = args.debug || file.is_none();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(to_stderr.then(|| fmt::layer().with_writer(std::io::stderr)))
        .with(file.map(|writer| fmt::layer().with_writer(writer).with_ansi(false)))
        .init();

    match logs_dir() {
        Some(dir) if guard.is_some() => tracing::debug!("Logging to {:?}", dir),
        _ => tracing::warn!("No log file, tracing to stderr"),
    }
    guard
}

/// Opens the traffic log unless disabled.
fn open_traffic_log(args: &Args, config: &RelayConfig) -> error::Result<Option<TrafficLog>> {
    if args.no_traffic_log {
        return Ok(None);
    }
    let path = match &config.traffic_log {
        Some(path) => path.clone(),
        None => traffic_log::default_path()?,
    };
    TrafficLog::create(&path).map(Some)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args);

    tracing::info!("Starting tapwire v{}", env!("CARGO_PKG_VERSION"));

    let config = args.relay_config()?;

    let mut console = Console::new(std::io::stdout());
    if args.quiet {
        console = console.quiet();
    }
    match open_traffic_log(&args, &config) {
        Ok(Some(log)) => console = console.with_traffic_log(log),
        Ok(None) => {}
        Err(e) => tracing::warn!("Traffic log disabled: {}", e),
    }

    let relay = RelayOrchestrator::from_config(&config);
    let mut events = relay.subscribe();

    relay.start_listener(&config.listener_host, config.listener_port);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut fatal = None;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };

                if event == RelayEvent::LocalConnected(false) {
                    let dropped = relay.remote().clear_pending();
                    if dropped > 0 {
                        tracing::info!("Discarded {} Bytes queued for the previous client", dropped);
                    }
                }
                if config.auto_start_sender && event == RelayEvent::LocalConnected(true) {
                    relay.start_sender(&config.sender_host, config.sender_port);
                }
                if let RelayEvent::Notification(n) = &event {
                    if n.severity == Severity::Fatal {
                        fatal = Some(n.message.clone());
                    }
                }

                console.handle(&event)?;

                if fatal.is_some() {
                    break;
                }
            }
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for Ctrl-C: {}", e);
                }
                tracing::info!("Interrupted, shutting down");
                break;
            }
        }
    }

    relay.stop_listener();
    relay.stop_sender();
    relay.shutdown();

    let stats = relay.stats();
    tracing::info!(
        "Relayed {} bytes local -> remote, {} bytes remote -> local",
        stats.local_bytes,
        stats.remote_bytes
    );
    if let Some(records) = console.traffic_records() {
        tracing::info!("Wrote {} traffic log records", records);
    }

    match fatal {
        Some(message) => Err(anyhow::anyhow!(message)),
        None => Ok(()),
    }
}
