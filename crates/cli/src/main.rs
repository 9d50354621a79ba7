// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Engine Contributors

// VPN Engine - CLI Client
// Command-line front end for the engine daemon

mod config;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;

use vpn_engine_common::{
    cleanup, connect, connect_with_events, create_daemon_client, disconnect, fetch_status,
    ConnectRequest, ConnectionMode, EngineEvent, EngineEventHandler, EngineStatus, EventListener,
    Protocol, TunnelState,
};

use config::CliConfig;

#[derive(Parser)]
#[command(name = "vpnctl")]
#[command(about = "VPN Engine CLI", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect using a request file (TOML)
    Connect {
        /// Path to the connect request
        request: PathBuf,

        /// Force one protocol instead of automatic fallback
        #[arg(short, long)]
        protocol: Option<Protocol>,

        /// Port for the forced protocol
        #[arg(short = 'P', long, requires = "protocol")]
        port: Option<u16>,

        /// Return as soon as the daemon accepted the request
        #[arg(long)]
        no_wait: bool,

        /// Seconds to wait for the tunnel
        #[arg(long, default_value = "300")]
        timeout: u64,
    },

    /// Disconnect the current session
    Disconnect,

    /// Show engine status
    Status {
        /// Output as JSON for scripting
        #[arg(short, long)]
        json: bool,
    },

    /// Follow engine events
    Watch,

    /// Remove leftovers of a crashed session
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = CliConfig::load()?;

    match cli.command {
        Commands::Connect {
            request,
            protocol,
            port,
            no_wait,
            timeout,
        } => connect_command(&config, request, protocol, port, no_wait, timeout).await,
        Commands::Disconnect => disconnect_command(&config).await,
        Commands::Status { json } => status_command(&config, json).await,
        Commands::Watch => watch_events(&config).await,
        Commands::Cleanup => cleanup_command(&config).await,
    }
}

/// Prints progress while `connect` waits
struct ProgressPrinter;

impl EngineEventHandler for ProgressPrinter {
    fn on_event(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::StateChanged { state, .. } => {
                println!("{}", format!("  {}", state).dimmed());
            }
            EngineEvent::AttemptFailed {
                protocol, error, ..
            } => {
                println!("{}", format!("  {} failed: {}", protocol, error).yellow());
            }
            _ => {}
        }
    }
}

fn load_request(
    path: &Path,
    protocol: Option<Protocol>,
    port: Option<u16>,
) -> Result<ConnectRequest> {
    let mut request = ConnectRequest::load(path)
        .with_context(|| format!("Failed to load connect request {}", path.display()))?;

    if let Some(protocol) = protocol {
        let port = match port {
            Some(port) => port,
            None => request
                .port_map
                .find(protocol)
                .and_then(|entry| entry.ports.first().copied())
                .ok_or_else(|| {
                    anyhow::anyhow!("No port given and {} is not in the port map", protocol)
                })?,
        };
        request.mode = ConnectionMode::Manual { protocol, port };
        request.validate()?;
    }
    Ok(request)
}

async fn connect_command(
    config: &CliConfig,
    path: PathBuf,
    protocol: Option<Protocol>,
    port: Option<u16>,
    no_wait: bool,
    timeout: u64,
) -> Result<()> {
    let request = load_request(&path, protocol, port)?;
    let client = create_daemon_client(&config.daemon_config)?;

    println!(
        "{}",
        format!("Connecting to {}...", request.location.id).cyan()
    );

    if no_wait {
        connect(&client, &config.daemon_config, &request).await?;
        println!("{}", "✓ Connect request accepted".green());
        return Ok(());
    }

    let mut printer = ProgressPrinter;
    connect_with_events(
        &client,
        &config.daemon_config,
        &request,
        &mut printer,
        Duration::from_secs(timeout),
    )
    .await?;

    let status = fetch_status(&client, &config.daemon_config).await?;
    println!("{}", "✓ Connected".green().bold());
    print_status(&status);
    Ok(())
}

async fn disconnect_command(config: &CliConfig) -> Result<()> {
    let client = create_daemon_client(&config.daemon_config)?;
    disconnect(&client, &config.daemon_config).await?;
    println!("{}", "✓ Disconnected".green().bold());
    Ok(())
}

async fn cleanup_command(config: &CliConfig) -> Result<()> {
    let client = create_daemon_client(&config.daemon_config)?;
    cleanup(&client, &config.daemon_config).await?;
    println!("{}", "✓ Cleanup complete".green().bold());
    Ok(())
}

async fn status_command(config: &CliConfig, json: bool) -> Result<()> {
    let client = create_daemon_client(&config.daemon_config)?;
    let status = fetch_status(&client, &config.daemon_config).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status(&status);
    }
    Ok(())
}

fn colored_state(state: TunnelState) -> colored::ColoredString {
    let text = state.to_string();
    match state {
        TunnelState::Connected => text.green().bold(),
        TunnelState::Failed => text.red().bold(),
        TunnelState::Idle => text.normal(),
        _ => text.yellow(),
    }
}

fn print_status(status: &EngineStatus) {
    println!("{:<12} {}", "State:".bold(), colored_state(status.state));

    if let Some(protocol) = status.protocol {
        let port = status.port.map(|p| p.to_string()).unwrap_or_default();
        println!("{:<12} {} {}", "Protocol:".bold(), protocol, port);
    }
    if let Some(ip) = &status.tunnel_ip {
        println!("{:<12} {}", "Public IP:".bold(), ip);
    }
    if let Some(since) = status.connected_since {
        let elapsed = Utc::now().signed_duration_since(since);
        println!(
            "{:<12} {} ({}m {}s)",
            "Since:".bold(),
            since.format("%Y-%m-%d %H:%M:%S UTC"),
            elapsed.num_minutes(),
            elapsed.num_seconds() % 60
        );
    }
    if status.state.is_active() {
        println!(
            "{:<12} {} in / {} out",
            "Traffic:".bold(),
            format_bytes(status.bytes_in),
            format_bytes(status.bytes_out)
        );
    }
    if let Some(error) = &status.last_error {
        println!("{:<12} {}", "Last error:".bold(), error.to_string().red());
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

async fn watch_events(config: &CliConfig) -> Result<()> {
    let listener = EventListener::new(config.daemon_config.clone());
    let mut events = listener.listen().await?;

    println!(
        "{}",
        "Connected to event stream. Press Ctrl+C to stop.".dimmed()
    );

    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::StateChanged { state, timestamp } => {
                println!("[{}] state {}", timestamp.format("%H:%M:%S"), colored_state(state));
            }
            EngineEvent::Connected {
                protocol,
                port,
                tunnel_ip,
                timestamp,
                ..
            } => {
                println!(
                    "[{}] {}",
                    timestamp.format("%H:%M:%S"),
                    format!("connected via {} {} ({})", protocol, port, tunnel_ip).green()
                );
            }
            EngineEvent::Statistics {
                bytes_in,
                bytes_out,
                timestamp,
            } => {
                println!(
                    "[{}] {}",
                    timestamp.format("%H:%M:%S"),
                    format!(
                        "traffic {} in / {} out",
                        format_bytes(bytes_in),
                        format_bytes(bytes_out)
                    )
                    .dimmed()
                );
            }
            EngineEvent::AttemptFailed {
                protocol,
                error,
                timestamp,
            } => {
                println!(
                    "[{}] {}",
                    timestamp.format("%H:%M:%S"),
                    format!("{} attempt failed: {}", protocol, error).yellow()
                );
            }
            EngineEvent::Error { error, timestamp } => {
                eprintln!(
                    "[{}] {}",
                    timestamp.format("%H:%M:%S"),
                    format!("error: {}", error).red()
                );
            }
            EngineEvent::Disconnected { reason, timestamp } => {
                println!(
                    "[{}] {}",
                    timestamp.format("%H:%M:%S"),
                    format!("disconnected: {}", reason).cyan()
                );
            }
            EngineEvent::Heartbeat { .. } => {}
        }
    }

    Ok(())
}
