use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

use scp_hub::daemon::{self, CommandTransport, WorkerOptions};
use scp_hub::{Config, Daemon};

/// SCP hub - tool registry, command queue and result store for lab devices
#[derive(Parser)]
#[command(name = "scp-hub", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/scp-hub/config.toml)
    #[arg(short, long, env = "SCP_HUB_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the hub HTTP API (default)
    Serve {
        /// Port to listen on
        #[arg(long, env = "SCP_API_PORT")]
        port: Option<u16>,
    },
    /// Consume device commands from the queue
    Consume {
        /// Device name this worker answers for
        #[arg(short, long)]
        device: String,
        /// Also serve the device's tools on this port and register with the hub
        #[arg(long)]
        tools_port: Option<u16>,
        /// Address the hub uses to reach the tool endpoint
        #[arg(long, default_value = "http://127.0.0.1")]
        advertise_url: String,
    },
    /// Publish a single command
    Send {
        #[arg(short, long)]
        device: String,
        #[arg(short, long)]
        action: String,
        /// Action parameters as a JSON object
        #[arg(short, long)]
        params: Option<String>,
        /// Seconds to wait for the result
        #[arg(short, long)]
        wait: Option<u64>,
        /// Where to publish the command
        #[arg(long, value_enum, default_value_t = Via::Queue)]
        via: Via,
    },
    /// Print stored results for a request
    Result {
        request_id: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Via {
    Queue,
    Mqtt,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,scp_hub=info",
        1 => "info,scp_hub=debug",
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
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    tracing::debug!(?config, "loaded configuration");

    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::Serve { port } => {
            if let Some(port) = port {
                config.api_server.port = port;
            }
            tracing::info!(port = config.api_server.port, "starting scp hub");
            Daemon::new(config).run().await?;
        }
        Command::Consume {
            device,
            tools_port,
            advertise_url,
        } => {
            tracing::info!(device = %device, queue = %config.amqp.queue, "starting consumer");
            daemon::run_worker(
                &config,
                WorkerOptions {
                    device,
                    tools_port,
                    advertise_url,
                },
            )
            .await?;
        }
        Command::Send {
            device,
            action,
            params,
            wait,
            via,
        } => {
            let params = parse_params(params.as_deref())?;
            let transport = match via {
                Via::Queue => CommandTransport::Queue,
                Via::Mqtt => CommandTransport::Control,
            };
            let (request_id, result) = daemon::send_command(
                &config,
                transport,
                &device,
                &action,
                params,
                wait.map(Duration::from_secs),
            )
            .await?;

            println!("{request_id}");
            match (wait, result) {
                (Some(_), Some(result)) => println!("{}", serde_json::to_string_pretty(&result)?),
                (Some(secs), None) => anyhow::bail!("no result for {request_id} within {secs}s"),
                (None, _) => {}
            }
        }
        Command::Result { request_id } => match daemon::fetch_result(&config, &request_id).await? {
            Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
            None => anyhow::bail!("no result stored for {request_id}"),
        },
    }

    Ok(())
}

fn parse_params(raw: Option<&str>) -> anyhow::Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str(raw)? {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("params must be a JSON object, got {other}"),
    }
}
