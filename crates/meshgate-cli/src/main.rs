//! `meshgate` – ZigBee/XBee mesh gateway daemon.
//!
//! This binary wires the whole gateway together:
//!
//! 1. Loads `~/.meshgate/config.toml` (defaults when absent), applies
//!    `MESHGATE_*` environment overrides and command-line flags.
//! 2. Opens the radio through the **device worker** and waits for its
//!    startup handshake. A failed startup exits non-zero before any port is
//!    opened.
//! 3. Starts the **request server** and the **notify server**.
//! 4. Drops the user into the interactive **console** (unless
//!    `--no-console`), which queues commands like any network client.
//! 5. Exits on `quit`, end of input or **Ctrl-C**.

mod config;
mod console;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tracing::{error, info, warn};

use config::Config;
use meshgate_middleware::{CommandQueue, command_queue, notify_queue};
use meshgate_runtime::{DeviceWorker, SessionState, WorkerConfig};
use meshgate_server::{NotifyServer, RequestServer, ServerError};

#[derive(Debug, Parser)]
#[command(name = "meshgate", version, about = "ZigBee/XBee mesh network gateway")]
struct Cli {
    /// Config file (default: ~/.meshgate/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Radio link: sim, serial:<path> or tcp:<host:port>.
    #[arg(long)]
    link: Option<String>,

    /// Address both servers bind to.
    #[arg(long)]
    bind: Option<String>,

    #[arg(long)]
    request_port: Option<u16>,

    #[arg(long)]
    notify_port: Option<u16>,

    /// Serve network clients only; no interactive console.
    #[arg(long)]
    no_console: bool,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Write the default configuration file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    fn apply_overrides(&self, cfg: &mut Config) {
        if let Some(link) = &self.link {
            cfg.link = link.clone();
        }
        if let Some(bind) = &self.bind {
            cfg.bind = bind.clone();
        }
        if let Some(port) = self.request_port {
            cfg.request_port = port;
        }
        if let Some(port) = self.notify_port {
            cfg.notify_port = port;
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(config::config_path);

    if let Some(CliCommand::InitConfig { force }) = &cli.command {
        return init_config(&config_path, *force);
    }

    // Held for the whole process; dropping it flushes exported spans.
    let _telemetry = meshgate_runtime::init_tracing("meshgate");

    let mut cfg = match config::resolve(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            return ExitCode::from(2);
        }
    };
    cli.apply_overrides(&mut cfg);
    if let Err(e) = cfg.validate() {
        eprintln!("{}: {}", "Config error".red(), e);
        return ExitCode::from(2);
    }

    print_banner(&cfg);

    let runtime = match Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "cannot start the async runtime");
            return ExitCode::FAILURE;
        }
    };

    let queue = match runtime.block_on(start_gateway(&cfg)) {
        Ok(queue) => queue,
        Err(e) => {
            error!(error = %e, "gateway startup failed");
            eprintln!("{}: {}", "Startup failed".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    // ── Shutdown wiring ───────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
    let flag = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
        let _ = stop_tx.send(());
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler");
    }

    if cli.no_console {
        println!("  Press {} to stop.", "Ctrl-C".bold());
        let _ = stop_rx.recv();
    } else {
        println!("  Type {} for a list of commands.\n", "help".bold().cyan());
        console::run(
            queue,
            cfg.response_timeout(),
            runtime.handle().clone(),
            Arc::clone(&shutdown),
        );
    }

    println!("{}", "  Shutting down meshgate.".yellow());
    info!("shutting down");
    runtime.shutdown_timeout(Duration::from_secs(1));
    ExitCode::SUCCESS
}

/// Bring the radio up, then open both servers. Returns a queue handle for
/// the console.
async fn start_gateway(cfg: &Config) -> Result<CommandQueue, String> {
    let link = cfg.link_spec()?;
    let (queue, commands) = command_queue();
    let (notify, events) = notify_queue();

    info!(%link, "opening radio");
    let radio = link.build(cfg.frame_timeout());
    let (mut status, _worker) = DeviceWorker::new(radio, commands, notify)
        .with_config(WorkerConfig {
            device_timeout: cfg.device_timeout(),
        })
        .spawn();

    match status.wait_finished().await {
        SessionState::Ready => {}
        state => return Err(format!("radio on {link} did not come up ({state:?})")),
    }

    let requests = RequestServer::new(queue.clone())
        .with_address(cfg.request_address()?)
        .with_response_timeout(cfg.response_timeout());
    let notifications = NotifyServer::new(events)
        .with_address(cfg.notify_address()?)
        .with_write_timeout(cfg.write_timeout());

    let request_listener = bind(requests.address()).await?;
    let notify_listener = bind(notifications.address()).await?;
    println!(
        "  {} requests on {}, notifications on {}",
        "✓".green().bold(),
        requests.address().to_string().bold(),
        notifications.address().to_string().bold()
    );

    tokio::spawn(requests.serve(request_listener));
    tokio::spawn(notifications.serve(notify_listener));
    Ok(queue)
}

async fn bind(address: std::net::SocketAddr) -> Result<TcpListener, String> {
    TcpListener::bind(address)
        .await
        .map_err(|source| ServerError::Bind { address, source }.to_string())
}

fn init_config(path: &std::path::Path, force: bool) -> ExitCode {
    match write_default_config(path, force) {
        Ok(()) => {
            println!(
                "  {} Config saved to {}",
                "✓".green().bold(),
                path.display().to_string().bold()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}: {}", "Error saving config".red(), e);
            ExitCode::FAILURE
        }
    }
}

fn write_default_config(path: &std::path::Path, force: bool) -> Result<(), String> {
    if path.exists() && !force {
        return Err(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ));
    }
    config::save_to(&Config::default(), path)
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner(cfg: &Config) {
    println!();
    println!(
        "  {} {}",
        "meshgate".bold().cyan(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  ZigBee mesh gateway");
    println!("  Radio link: {}", cfg.link.bold());
    println!();
}
