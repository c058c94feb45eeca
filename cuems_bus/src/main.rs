/// CUEMS Bus Service
///
/// Runs one bus hub as a coordinator (listener) or a playback node (dialer).
/// JSON objects read line by line from stdin are sent to the bus; every
/// received message is printed to stdout as one JSON line.
use anyhow::{bail, Context, Result};
use clap::Parser;
use cuems_core::communication::bus::{BusHub, Mode, DEFAULT_ACTIVITY_TIMEOUT};
use cuems_core::communication::config::{CuemsConfig, HubConfig};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

const DEFAULT_STATUS_INTERVAL_SECS: f64 = 10.0;
const DEFAULT_INACTIVITY_SECS: f64 = 5.0;

#[derive(Parser, Debug)]
#[command(name = "cuems_bus")]
#[command(about = "CUEMS bus coordinator / node", long_about = None)]
struct Args {
    /// Bus address (tcp://host:port or ipc://path)
    address: Option<String>,

    /// Load the hub definition from a config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Hub name inside the config file (searched in standard locations without --config)
    #[arg(long)]
    hub: Option<String>,

    /// listener|controller or dialer|node
    #[arg(short, long)]
    mode: Option<String>,

    /// Enable auto-ping with this check interval in seconds
    #[arg(long)]
    auto_ping: Option<f64>,

    /// Outbound silence in seconds before auto-ping sends a ping
    #[arg(long, default_value_t = DEFAULT_INACTIVITY_SECS)]
    inactivity: f64,

    /// Do not answer pings
    #[arg(long)]
    no_auto_pong: bool,

    /// Seconds between connection/health status reports
    #[arg(long, default_value_t = DEFAULT_STATUS_INTERVAL_SECS)]
    status_interval: f64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn secs(value: f64, flag: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .with_context(|| format!("invalid --{} value {}", flag, value))
}

/// Resolve the hub definition from the config file and/or flags; flags win
fn hub_config(args: &Args) -> Result<HubConfig> {
    let mut config = match (&args.config, &args.hub) {
        (Some(path), hub) => {
            let file = CuemsConfig::from_file(path)?;
            match hub {
                Some(name) => file.get_hub(name)?.clone(),
                None if file.hubs.len() == 1 => {
                    file.hubs.into_values().next().context("empty config")?
                }
                None => bail!("{} defines several hubs, pick one with --hub", path.display()),
            }
        }
        (None, Some(name)) => CuemsConfig::find_and_load()?.get_hub(name)?.clone(),
        (None, None) => {
            let address = args
                .address
                .clone()
                .context("an address is required without --config/--hub")?;
            HubConfig::new("cuems_bus", address)
        }
    };

    if let (Some(address), true) = (&args.address, args.config.is_some() || args.hub.is_some()) {
        config.address = Some(address.clone());
    }
    if let Some(mode) = &args.mode {
        config.mode = Some(mode.clone());
    }
    if let Some(interval) = args.auto_ping {
        config.auto_ping = Some(cuems_core::communication::config::AutoPingConfig {
            interval_secs: interval,
            inactivity_threshold_secs: args.inactivity,
        });
    }
    if args.no_auto_pong {
        config.auto_pong = false;
    }
    Ok(config)
}

fn log_status(hub: &BusHub, health_timeout: Duration) {
    let connections = hub.get_active_connections();
    info!("{} active connection(s)", connections.len());
    for connection in &connections {
        info!(
            "  pipe {} from {} since {}",
            connection.pipe_id,
            connection.sender,
            connection.connected_at.format("%H:%M:%S")
        );
    }

    let health = hub.get_connection_health_info(health_timeout);
    let stats = hub.heartbeat_stats();
    info!(
        "healthy={} received={} sent={} idle={} pings={} pongs_sent={} pongs_received={}",
        health.is_healthy,
        health.messages_received,
        health.messages_sent,
        health
            .seconds_since_activity
            .map(|s| format!("{:.1}s", s))
            .unwrap_or_else(|| "never".to_string()),
        stats.ping_count,
        stats.pong_count,
        stats.pongs_received,
    );
}

/// Forward stdin JSON lines to the bus until EOF
async fn forward_stdin(hub: BusHub) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value) => {
                if let Err(e) = hub.send_message(value) {
                    warn!("Not sent: {}", e);
                }
            }
            Err(e) => warn!("Ignoring line that is not JSON: {}", e),
        }
    }
    info!("stdin closed, no more outgoing messages");
    Ok(())
}

/// Print received messages as JSON lines
async fn print_messages(hub: BusHub) -> Result<()> {
    loop {
        let message = hub.get_message().await?;
        println!("{}", json!({"sender": message.sender.to_string(), "data": message.data}));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = if args.verbose {
        "cuems_bus=debug,cuems_core=debug"
    } else {
        "cuems_bus=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = hub_config(&args)?;
    let health_timeout = config.health_timeout().unwrap_or(DEFAULT_ACTIVITY_TIMEOUT);
    let status_interval = secs(args.status_interval, "status-interval")?;
    if status_interval.is_zero() {
        bail!("--status-interval must be greater than zero");
    }

    let hub = BusHub::from_config(&config)?;
    hub.open()
        .await
        .with_context(|| format!("failed to open {}", hub.address()))?;
    let role = match hub.mode() {
        Mode::Listener => "coordinator",
        Mode::Dialer => "node",
    };
    info!(
        "CUEMS bus {} '{}' on {}",
        role,
        config.name,
        hub.local_address().unwrap_or_else(|| hub.address().to_string())
    );

    let runner = hub.clone();
    let mut run = tokio::spawn(async move { runner.run().await });
    tokio::spawn(forward_stdin(hub.clone()));
    tokio::spawn(print_messages(hub.clone()));

    let mut status = tokio::time::interval(status_interval);
    status.tick().await;

    loop {
        tokio::select! {
            _ = status.tick() => log_status(&hub, health_timeout),
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                hub.stop().await;
                break;
            }
            finished = &mut run => {
                return match finished {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => {
                        error!("Hub stopped: {}", e);
                        Err(e.into())
                    }
                    Err(e) => Err(e.into()),
                };
            }
        }
    }

    run.await??;
    info!("Bus stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::parse_from(std::iter::once("cuems_bus").chain(argv.iter().copied()))
    }

    #[test]
    fn test_address_and_flags() {
        let args = parse(&[
            "tcp://127.0.0.1:9092",
            "--mode",
            "node",
            "--auto-ping",
            "2",
            "--no-auto-pong",
        ]);
        let config = hub_config(&args).unwrap();
        assert_eq!(config.address().unwrap(), "tcp://127.0.0.1:9092");
        assert_eq!(config.mode().unwrap(), Mode::Dialer);
        let auto_ping = config.auto_ping.unwrap();
        assert_eq!(auto_ping.interval_secs, 2.0);
        assert_eq!(auto_ping.inactivity_threshold_secs, DEFAULT_INACTIVITY_SECS);
        assert!(!config.auto_pong);
    }

    #[test]
    fn test_address_required() {
        let args = parse(&[]);
        assert!(hub_config(&args).is_err());
    }

    #[test]
    fn test_config_file_with_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cuems.toml");
        std::fs::write(
            &path,
            "[hubs.coordinator]\nname = \"coordinator\"\naddress = \"tcp://0.0.0.0:9092\"\n",
        )
        .unwrap();

        let path_arg = path.to_string_lossy().to_string();
        let args = parse(&["--config", &path_arg, "--mode", "dialer"]);
        let config = hub_config(&args).unwrap();
        assert_eq!(config.name, "coordinator");
        assert_eq!(config.mode().unwrap(), Mode::Dialer);

        let args = parse(&["tcp://10.0.0.1:9000", "--config", &path_arg]);
        assert_eq!(hub_config(&args).unwrap().address().unwrap(), "tcp://10.0.0.1:9000");
    }

    #[test]
    fn test_zero_duration_flag() {
        assert!(secs(0.0, "status-interval").unwrap().is_zero());
        assert!(secs(-1.0, "status-interval").is_err());
    }
}
