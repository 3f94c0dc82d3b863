//! kvbridge: run Lua scripts that see remote key-value stores as plain tables.

mod cmd;
mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cmd::{cmd_check, cmd_run, cmd_serve};

#[derive(Parser)]
#[command(name = "kvbridge")]
#[command(author, version, about = "Expose remote key-value stores to Lua scripts", long_about = None)]
struct Cli {
  /// Enable debug logging
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Bind every configured bucket, then run a Lua script
  Run {
    /// Path to the Lua script
    script: PathBuf,

    /// Bucket configuration (.toml or .json)
    #[arg(short, long, env = "KVBRIDGE_CONFIG")]
    config: PathBuf,
  },

  /// Host in-memory stores over the bridge protocol until Ctrl-C
  Serve {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:7420")]
    listen: String,

    /// Store to host (repeatable)
    #[arg(short = 's', long = "store", required = true)]
    stores: Vec<String>,

    /// Token clients must present in their handshake
    #[arg(long, env = "KVBRIDGE_TOKEN")]
    token: Option<String>,
  },

  /// Connect every configured bucket and report which ones work
  Check {
    /// Bucket configuration (.toml or .json)
    #[arg(short, long, env = "KVBRIDGE_CONFIG")]
    config: PathBuf,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let level = if cli.verbose { "debug" } else { "info" };
  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(format!("kvbridge={level},kvbridge_lib={level}")));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  match cli.command {
    Commands::Run { script, config } => cmd_run(&script, &config),
    Commands::Serve { listen, stores, token } => cmd_serve(&listen, stores, token),
    Commands::Check { config } => cmd_check(&config),
  }
}
