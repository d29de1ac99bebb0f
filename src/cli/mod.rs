use crate::config::load_config;
use crate::gateway::Gateway;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "toolgate", version, about = "Unified tool-execution gateway")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "toolgate.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the registered tool catalog as JSON.
    Catalog,
    /// List loaded secret key names (values are never shown).
    Secrets,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let gateway = Gateway::new(&config)?;

    match cli.command {
        Command::Catalog => {
            let catalog = gateway.dispatcher.registry().catalog();
            println!("{}", serde_json::to_string_pretty(&catalog)?);
        }
        Command::Secrets => {
            for key in gateway.secrets.list_keys() {
                println!("{}", key);
            }
            eprintln!("{} secrets loaded", gateway.secrets.count());
        }
    }
    Ok(())
}
