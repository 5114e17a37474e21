//! clibridge daemon - interactive AI CLIs over HTTPS and Server-Sent Events
//!
//! This binary runs as a background daemon, supervising CLI tool sessions
//! and streaming their output to authenticated remote clients.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! CLIBRIDGE_API_KEY=secret clibridged start
//!
//! # Start the daemon (background/daemonized)
//! clibridged start -d
//!
//! # Stop the daemon
//! clibridged stop
//!
//! # Check daemon status
//! clibridged status
//!
//! # Inspect or rotate the TLS certificate
//! clibridged cert show
//! clibridged cert regenerate
//! clibridged cert revoke
//!
//! # Enable debug logging
//! RUST_LOG=clibridged=debug clibridged start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown (all sessions are terminated)
//! - SIGHUP: Reload the TLS certificate from disk

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use clibridged::certs::{CertificateManager, CertificateMaterial};
use clibridged::config::{state_dir, BridgeConfig, API_KEY_VAR};
use clibridged::gateway::{spawn_certificate_watcher, AppState, GatewayServer};
use clibridged::registry::spawn_registry;

/// clibridge daemon - remote bridge for interactive AI CLIs
#[derive(Parser, Debug)]
#[command(name = "clibridged", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
    /// Manage the TLS certificate
    Cert {
        #[command(subcommand)]
        action: CertAction,
    },
}

#[derive(Subcommand, Debug)]
enum CertAction {
    /// Print fingerprint, validity and names of the active certificate
    Show,
    /// Back up the self-signed certificate and generate a new one
    Regenerate,
    /// Delete the persisted self-signed certificate
    Revoke,
}

fn pid_file_path() -> PathBuf {
    state_dir().join("clibridged.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("clibridged.log")
}

fn read_pid() -> Option<u32> {
    let path = pid_file_path();
    let mut file = File::open(&path).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file();
    }
    None
}

fn send_signal(pid: u32, signal: libc::c_int) -> Result<()> {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        bail!("PID {pid} out of range");
    };
    // SAFETY: kill(2) has no memory-safety preconditions
    let result = unsafe { libc::kill(pid, signal) };
    if result != 0 {
        bail!("Failed to send signal {signal} to process {pid}");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start { daemon: false });

    match command {
        Command::Start { daemon } => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'clibridged stop' to stop it first.");
                process::exit(1);
            }

            // Fail before forking so configuration errors reach the terminal
            let config = BridgeConfig::from_env().context("Invalid configuration")?;

            if daemon {
                daemonize()?;
            }

            write_pid()?;

            let result = run_daemon(config);

            remove_pid_file();

            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping daemon (PID {pid})...");
                send_signal(pid, libc::SIGTERM)?;

                // Sessions get their grace period before the process exits
                for _ in 0..100 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 10 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status => {
            if let Some(pid) = is_daemon_running() {
                println!("Daemon is running (PID {pid})");
                if let Ok(config) = cli_config() {
                    let scheme = if config.tls_enabled { "https" } else { "http" };
                    println!("Listening: {scheme}://{}", config.bind_addr());
                }
                Ok(())
            } else {
                println!("Daemon is not running.");
                process::exit(1);
            }
        }
        Command::Cert { action } => run_cert_command(action),
    }
}

/// Configuration for commands that never serve requests.
fn cli_config() -> Result<BridgeConfig> {
    let _ = dotenvy::dotenv();
    BridgeConfig::from_lookup(|key| match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ if key == API_KEY_VAR => Some("unused".to_string()),
        _ => None,
    })
    .context("Invalid configuration")
}

fn run_cert_command(action: CertAction) -> Result<()> {
    let config = cli_config()?;
    let manager = CertificateManager::new(config.certificate_config());

    match action {
        CertAction::Show => {
            manager.ensure().context("Failed to load certificate")?;
            let Some(info) = manager.info() else {
                bail!("No certificate available");
            };
            println!("Fingerprint: {}", info.fingerprint);
            println!("Provenance:  {}", info.provenance.as_str());
            println!("Valid from:  {}", info.not_before);
            println!("Valid until: {}", info.not_after);
            println!("Names:       {}", info.subject_alt_names.join(", "));
            if info.fallback {
                println!("Note: external certificate unusable, serving self-signed fallback");
            }
            Ok(())
        }
        CertAction::Regenerate => {
            let outcome = manager.regenerate().context("Failed to regenerate certificate")?;
            if let Some(previous) = &outcome.previous {
                println!("Previous:    {previous}");
            }
            println!("Fingerprint: {}", outcome.current);
            notify_daemon_reload()
        }
        CertAction::Revoke => {
            if manager.revoke().context("Failed to revoke certificate")? {
                println!("Self-signed certificate removed.");
                println!("A new one is generated on the next start or reload.");
            } else {
                println!("No self-signed certificate on disk.");
            }
            Ok(())
        }
    }
}

fn notify_daemon_reload() -> Result<()> {
    if let Some(pid) = is_daemon_running() {
        send_signal(pid, libc::SIGHUP)?;
        println!("Asked running daemon (PID {pid}) to reload.");
    }
    Ok(())
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout.try_clone().context("Failed to open log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

#[tokio::main]
async fn run_daemon(config: BridgeConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("clibridged=info".parse()?)
                .add_directive("clibridge_core=info".parse()?)
                .add_directive("clibridge_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "clibridge daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let certs = Arc::new(CertificateManager::new(config.certificate_config()));
    let material = certs.ensure().context("Failed to prepare TLS certificate")?;

    let registry = spawn_registry(config.registry_config());
    info!(max_sessions = config.max_sessions, "Session registry started");

    let state = AppState::new(registry.clone(), config.gateway_config(), Arc::clone(&certs));
    let _watcher = spawn_certificate_watcher(state.hub.clone(), &certs, cancel_token.clone());

    let server = GatewayServer::bind(
        config.bind_addr(),
        state,
        config.tls_enabled,
        cancel_token.clone(),
    )
    .await?;

    log_banner(&config, &material);

    let signal_token = cancel_token.clone();
    let signal_certs = Arc::clone(&certs);
    tokio::spawn(async move {
        if let Err(e) = handle_signals(signal_certs).await {
            error!(error = %e, "Error waiting for signals");
        }
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    let result = server.run().await;

    let terminated = registry.shutdown().await;
    info!(terminated, "Sessions terminated");

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("clibridge daemon stopped");
    Ok(())
}

fn log_banner(config: &BridgeConfig, material: &CertificateMaterial) {
    let scheme = if config.tls_enabled { "https" } else { "http" };
    let host = if config.listen_addr.is_unspecified() {
        config.hostname.clone()
    } else {
        config.listen_addr.to_string()
    };

    info!(
        url = %format!("{scheme}://{host}:{}", config.port),
        fingerprint = %material.fingerprint,
        provenance = material.provenance.as_str(),
        not_after = %material.not_after,
        discovery = config.discovery_enabled,
        "Gateway ready"
    );

    if !config.tls_enabled {
        warn!("TLS disabled, traffic including the API key is unencrypted");
    }
}

/// Reloads the certificate on SIGHUP; returns on SIGTERM or SIGINT.
async fn handle_signals(certs: Arc<CertificateManager>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                return Ok(());
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
                return Ok(());
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading certificate");
                let certs = Arc::clone(&certs);
                match tokio::task::spawn_blocking(move || certs.reload()).await {
                    Ok(Ok(outcome)) => info!(
                        fingerprint = %outcome.current,
                        changed = outcome.changed,
                        "Certificate reloaded"
                    ),
                    Ok(Err(e)) => error!(error = %e, "Certificate reload failed, keeping current"),
                    Err(e) => error!(error = %e, "Certificate reload task failed"),
                }
            }
        }
    }
}
