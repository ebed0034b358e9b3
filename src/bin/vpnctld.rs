//! IPsec VPN Driver Daemon (vpnctld)
//!
//! Supervises local keying daemons and the remote appliance on behalf of the
//! orchestrator. Requests arrive one JSON object per line on stdin:
//!
//! ```text
//! {"method": "create_router", "args": {"process_id": "<router id>"}}
//! ```
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (requires root/sudo)
//! sudo vpnctld --config /etc/vpnctl/vpnctl.toml
//!
//! # Validate a configuration file and exit
//! vpnctld --config ./vpnctl.toml --check-config
//!
//! # Print the built-in defaults
//! vpnctld --print-default-config
//! ```

use clap::Parser;
use libvpnctl::config::AgentConfig;
use libvpnctl::driver::IpsecDriver;
use libvpnctl::error::{VpnError, VpnResult};
use libvpnctl::rpc::DriverRequest;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// IPsec VPN Driver Daemon
#[derive(Parser, Debug)]
#[command(name = "vpnctld")]
#[command(author = "vpnctl contributors")]
#[command(version)]
#[command(about = "IPsec VPN Driver Daemon - provisions and supervises site-to-site tunnels", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "/etc/vpnctl/vpnctl.toml")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,

    /// Print the default configuration and exit
    #[arg(long)]
    print_default_config: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> VpnResult<()> {
    let args = Args::parse();

    if args.print_default_config {
        print!("{}", AgentConfig::default().to_toml()?);
        return Ok(());
    }

    init_logging(&args);

    let config = AgentConfig::load(&args.config)?;
    if args.check_config {
        println!("Configuration OK: {}", args.config.display());
        print!("{}", config.redacted().to_toml()?);
        return Ok(());
    }

    info!("Starting IPsec VPN Driver Daemon (vpnctld)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Check if running as root
    #[cfg(target_os = "linux")]
    {
        let uid = unsafe { libc::getuid() };
        if uid != 0 {
            warn!("Not running as root - namespace and daemon operations may fail");
        }
    }

    config.ensure_directories()?;
    let driver = IpsecDriver::from_config(&config)?;
    info!(
        "Driver ready on host {} ({} backend)",
        driver.host(),
        if driver.provisioner().is_some() { "appliance" } else { "local" }
    );

    if let Err(e) = driver.sync(&[]).await {
        warn!("Initial sync failed: {}", e);
    }

    run(&driver, Duration::from_secs(config.ipsec.status_check_interval)).await?;

    info!("IPsec VPN Driver Daemon stopped");
    Ok(())
}

/// Main loop: periodic status reports, inbound requests and signals
async fn run(driver: &IpsecDriver, interval: Duration) -> VpnResult<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| VpnError::ServiceError(format!("Failed to register SIGTERM handler: {}", e)))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| VpnError::ServiceError(format!("Failed to register SIGINT handler: {}", e)))?;
    let mut sighup = signal(SignalKind::hangup())
        .map_err(|e| VpnError::ServiceError(format!("Failed to register SIGHUP handler: {}", e)))?;

    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately
    ticker.tick().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                break;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, resyncing with orchestrator");
                driver.vpnservice_updated().await;
            }
            _ = ticker.tick() => {
                if let Err(e) = driver.report_status().await {
                    debug!("Status report deferred: {}", e);
                }
            }
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => handle_request(driver, &line).await,
                    Ok(None) => {
                        info!("Request stream closed");
                        stdin_open = false;
                    }
                    Err(e) => {
                        error!("Failed to read request: {}", e);
                        stdin_open = false;
                    }
                }
            }
        }
    }

    Ok(())
}

async fn handle_request(driver: &IpsecDriver, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match serde_json::from_str::<DriverRequest>(line) {
        Ok(request) => driver.dispatch(request).await,
        Err(e) => error!("Malformed request: {}", e),
    }
}

/// Initialize logging based on command-line arguments
fn init_logging(args: &Args) {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            EnvFilter::new(format!("vpnctld={},libvpnctl={}", log_level, log_level))
        });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(atty::is(atty::Stream::Stdout))
        .init();
}
