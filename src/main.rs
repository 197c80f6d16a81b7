use clap::{Parser, Subcommand};
use futures::StreamExt;
use relay::{build_relay, BusinessError, MemoryTransport, Relay, RelayConfig};
use serde_json::Value;
use std::path::PathBuf;

/// CLI arguments for the relay
#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(about = "Pattern-addressed RPC over publish/subscribe")]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Reply timeout in milliseconds for calls without `timeout$`
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the patterns registered by the bundled services
    List,

    /// Run one call against the bundled services and print every reply
    Act {
        /// Pattern as a JSON object, e.g. '{"topic":"math","cmd":"add","a":1,"b":2}'
        pattern: String,
    },
}

fn load_config(args: &Args) -> anyhow::Result<RelayConfig> {
    let config = match &args.config {
        Some(path) => RelayConfig::load(path)?,
        None => RelayConfig::default(),
    };
    let mut config = config.with_env()?;
    if let Some(ms) = args.timeout_ms {
        config.request_timeout_ms = Some(ms);
    }
    Ok(config)
}

async fn act(relay: &Relay, pattern: &str) -> anyhow::Result<()> {
    let pattern: Value = serde_json::from_str(pattern)?;
    let mut replies = relay.act_stream(pattern).await?;

    loop {
        tokio::select! {
            reply = replies.next() => match reply {
                Some(Ok(value)) => println!("{}", serde_json::to_string(&value)?),
                Some(Err(err)) => {
                    let error = BusinessError::from(err);
                    println!("{}", serde_json::to_string(&error)?);
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (silently ignore if not found)
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("relay=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    tracing::info!(name = %config.name, "starting relay");

    let relay = build_relay(MemoryTransport::new(), config).await?;
    for (plugin, state) in relay.plugins() {
        tracing::info!("  plugin {} ({:?})", plugin.name, state);
    }

    match &args.command {
        Command::List => {
            for method in relay.list_patterns() {
                println!("{}", method);
            }
        }
        Command::Act { pattern } => act(&relay, pattern).await?,
    }

    relay.close();
    Ok(())
}
