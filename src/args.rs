use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "limbo-wrapper")]
#[command(version)]
#[command(about = "Keeps game-server instances running and up to date", long_about = None)]
pub(crate) struct Cli {
    /// Path to the wrapper configuration file
    #[arg(short, long, global = true, default_value = limbo_wrapper::config::DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Default, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Commands {
    /// Run the supervisor (default)
    #[default]
    Run,

    /// Download the server binary if it is missing, then exit
    Fetch,
}
