use std::path::PathBuf;

use clap::Parser;

/// supervisor — a declarative process supervisor.
#[derive(Parser)]
#[command(name = "supervisor", version, about, long_about = None)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short = 'c', long = "config-file")]
    pub config_file: PathBuf,

    /// Increase log verbosity (-v, -vv).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
