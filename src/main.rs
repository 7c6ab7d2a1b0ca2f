use anyhow::{bail, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod simulate;

use cli::{Cli, Commands};

// Single-threaded so the simulated clock can be paused
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Simulate(args) => {
            if !args.realtime {
                tokio::time::pause();
            }
            let summary = simulate::run(&args).await?;
            simulate::print_summary(&summary);
            if summary.owners.len() > 1 {
                bail!("{} participants ended up owning the resource", summary.owners.len());
            }
        }
        Commands::CheckConfig { path } => {
            let config = arbiter::ArbiterConfig::from_json_file(&path)?;
            println!("{}: ok", path.display());
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }
    Ok(())
}
