use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use std::time::Duration;

use kibble::{config, harness, logging};

#[derive(Parser, Debug)]
#[command(name = "kibble")]
#[command(about = "Exercise the cache-first sync core against a simulated backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/kibble/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Pet the scripted screens load data for
  #[arg(short, long, default_value = "pet-1")]
  scope: String,

  /// How long the scripted run lasts
  #[arg(short, long, default_value_t = 20)]
  duration_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.logging)?;

  harness::run(&config, &args.scope, Duration::from_secs(args.duration_secs)).await?;

  Ok(())
}
