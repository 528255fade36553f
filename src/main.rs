mod args;

use args::{Cli, Commands};
use clap::Parser;
use limbo_wrapper::runtime;
use std::process::ExitCode;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let result = match cli.command.unwrap_or_default() {
        Commands::Run => runtime::run(&cli.config).await,
        Commands::Fetch => runtime::fetch(&cli.config)
            .await
            .map(|path| info!("Binary available at {}", path.display())),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            debug!("{:?}", e);
            ExitCode::FAILURE
        }
    }
}
