use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::config::WrapperConfig;
use crate::console::{spawn_stdin_reader, Console};
use crate::context::SupervisorContext;
use crate::platform::Platform;
use crate::provision::{BinaryLayout, BinaryProvisioner};
use crate::release::ReleaseFetcher;
use crate::supervisor::{Supervisor, SupervisorSettings};
use crate::update::{UpdateOrchestrator, UpdateSettings};

struct Prepared {
    config: WrapperConfig,
    layout: BinaryLayout,
    source: ReleaseFetcher,
    binary: PathBuf,
}

async fn prepare(config_path: &Path) -> Result<Prepared> {
    let config = WrapperConfig::load(config_path)?;

    let platform = Platform::detect(&config.release.binary_name)?;
    info!("Detected platform: {}", platform);

    let layout = BinaryLayout::new(&config.binaries_dir, platform);
    let source = ReleaseFetcher::new(&config.release)?;
    let binary = BinaryProvisioner::new(&layout, &source)
        .ensure_binary()
        .await
        .context("Could not provision the server binary")?;

    Ok(Prepared {
        config,
        layout,
        source,
        binary,
    })
}

/// Make sure the server binary is present, then return its path.
pub async fn fetch(config_path: &Path) -> Result<PathBuf> {
    Ok(prepare(config_path).await?.binary)
}

/// Run the supervisor until an operator or signal-initiated shutdown.
pub async fn run(config_path: &Path) -> Result<()> {
    info!("limbo-wrapper v{} starting...", env!("CARGO_PKG_VERSION"));

    let Prepared {
        config,
        layout,
        source,
        binary,
    } = prepare(config_path).await?;

    let specs = config.instance_specs();
    config.validate_instances(&specs)?;
    if config.is_legacy_mode() {
        info!("Running in single-instance mode");
    } else {
        info!("Managing {} instance(s)", specs.len());
    }

    let ctx = Arc::new(SupervisorContext::new());
    let supervisor = Supervisor::new(
        binary,
        specs,
        Arc::clone(&ctx),
        SupervisorSettings::default(),
    );
    supervisor.launch_autostart().await;

    spawn_signal_listener(Arc::clone(&ctx))?;

    let orchestrator = Arc::new(UpdateOrchestrator::new(
        Arc::clone(&supervisor),
        layout,
        source,
        UpdateSettings::default(),
    ));
    let console = Console::new(orchestrator);
    tokio::spawn(async move {
        console.run(spawn_stdin_reader()).await;
    });

    info!("Ready. Type 'help' for available commands");
    ctx.shutdown_requested().await;

    if ctx.is_updating() {
        info!("Waiting for the running update to finish...");
        ctx.wait_for_update_idle().await;
    }

    info!("Stopping all instances...");
    supervisor.stop_all().await;
    info!("Shutdown complete");
    Ok(())
}

fn spawn_signal_listener(ctx: Arc<SupervisorContext>) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
            ctx.request_shutdown();
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            info!("Received Ctrl+C");
            ctx.request_shutdown();
        });
    }

    Ok(())
}
