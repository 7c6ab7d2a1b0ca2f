use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "baton", version, about, long_about = None)]
pub struct Cli {
    /// Verbose mode (-v, -vv, -vvv)
    #[arg(short, action = ArgAction::Count, global = true)]
    pub verbosity: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Races participants for one resource against a simulated store
    #[command(alias = "sim")]
    Simulate(SimulateArgs),
    /// Loads a JSON arbiter config and reports whether it is valid
    CheckConfig { path: PathBuf },
}

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Number of competing participants
    #[arg(short = 'n', long, default_value_t = 3)]
    pub participants: usize,

    /// How long a new token stays invisible to readers
    #[arg(long, default_value_t = 0)]
    pub propagation_delay_ms: u64,

    /// JSON arbiter config; the flags below override its fields
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Resource to contest, unless the config file names one
    #[arg(long)]
    pub resource: Option<String>,

    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    #[arg(long)]
    pub settle_delay_ms: Option<u64>,

    #[arg(long)]
    pub renewal_interval_ms: Option<u64>,

    #[arg(long)]
    pub lease_extension_ms: Option<u64>,

    /// Relative timer variability, in [0, 1)
    #[arg(long)]
    pub jitter: Option<f64>,

    /// Simulated time to run for
    #[arg(long, default_value_t = 30_000)]
    pub duration_ms: u64,

    /// Drops the current owner without releasing, at this point in time
    #[arg(long)]
    pub crash_owner_at_ms: Option<u64>,

    /// Run on the wall clock instead of a virtual one
    #[arg(long)]
    pub realtime: bool,
}
