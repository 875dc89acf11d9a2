use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use fleet_gateway::db::{self, CommandRepo, CommandStatus, DeviceRepo};
use fleet_gateway::{Config, Daemon};

/// Fleet gateway - device connection and command dispatch service
#[derive(Parser)]
#[command(name = "fleetd", version, about)]
struct Cli {
    /// Port to listen on
    #[arg(long, env = "FLEET_PORT")]
    port: Option<u16>,

    /// Data directory (database lives here)
    #[arg(long, env = "FLEET_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// List registered devices
    Devices,
    /// List commands, newest first
    Commands {
        /// Filter by status (PENDING, QUEUED, PROCESSING, COMPLETED, FAILED, CANCELLED)
        #[arg(short, long)]
        status: Option<String>,
        /// Maximum number of rows
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,fleet_gateway=info",
        1 => "info,fleet_gateway=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::Devices => cmd_devices(&config),
            Command::Commands { status, limit } => cmd_commands(&config, status.as_deref(), limit),
        };
    }

    tracing::info!(port = config.server.port, "starting fleet gateway");
    let daemon = Daemon::new(config)?;
    daemon.run().await?;

    Ok(())
}

/// Print registered devices
fn cmd_devices(config: &Config) -> anyhow::Result<()> {
    let pool = db::init(config.data_dir.join("fleet.db"))?;
    let devices = DeviceRepo::new(pool).list_all()?;

    if devices.is_empty() {
        println!("No devices registered");
        return Ok(());
    }

    for device in devices {
        let heartbeat = device
            .last_heartbeat
            .map_or_else(|| "never".to_string(), |ts| ts.to_rfc3339());
        println!(
            "{}  {:8}  {}  last heartbeat: {heartbeat}",
            device.id,
            device.status.as_str(),
            device.name,
        );
    }

    Ok(())
}

/// Print recent commands
fn cmd_commands(config: &Config, status: Option<&str>, limit: usize) -> anyhow::Result<()> {
    let status = status.map(str::parse::<CommandStatus>).transpose()?;

    let pool = db::init(config.data_dir.join("fleet.db"))?;
    let commands = CommandRepo::new(pool).list(status, limit)?;

    if commands.is_empty() {
        println!("No commands found");
        return Ok(());
    }

    for command in commands {
        println!(
            "{}  {:10}  {:9}  {}  created {}",
            command.id,
            command.status.as_str(),
            command.kind.as_str(),
            command.command_name,
            command.created_at.to_rfc3339(),
        );
    }

    Ok(())
}
