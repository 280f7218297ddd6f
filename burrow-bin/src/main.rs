use anyhow::{Context, Result};
use clap::Parser;

use burrow_core::{logging, Client, Config, Server};

/// A tunneling proxy that hides SOCKS5 inside ordinary-looking protocols.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Validate the configuration and exit
    #[arg(short, long)]
    test_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let content = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading configuration {} failed", args.config))?;
    let config: Config = serde_yaml::from_str(&content)
        .with_context(|| format!("parsing configuration {} failed", args.config))?;
    config.validate()?;

    if args.test_config {
        println!("Configuration test passed!");
        return Ok(());
    }

    logging::init(config.log_level)?;

    tokio::select! {
        result = run(config) => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted, shutting down");
            Ok(())
        }
    }
}

async fn run(config: Config) -> Result<()> {
    if let Some(client) = config.client {
        Client::new(client)?.serve().await?;
    } else if let Some(server) = config.server {
        Server::new(server)?.serve().await?;
    }
    Ok(())
}
