//! Live binary replacement.
//!
//! An update downloads the latest release, stops the instances that were
//! running, swaps the binary, verifies that the new one actually starts and
//! then brings the instances back. Any failure after the instances were
//! stopped restores the previous binary before relaunching them.

mod probe;

pub use probe::verify;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{Result, WrapperError};
use crate::platform;
use crate::provision::{extract_blocking, BinaryLayout};
use crate::release::ArchiveSource;
use crate::supervisor::Supervisor;

#[derive(Debug, Clone)]
pub struct UpdateSettings {
    /// Pause after stopping instances so file handles are released
    pub settle_delay: Duration,
    pub probe_interval: Duration,
    pub probe_attempts: u32,
    /// Output substring that marks a healthy start
    pub ready_marker: String,
    pub probe_grace: Duration,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(500),
            probe_interval: Duration::from_millis(100),
            probe_attempts: 50,
            ready_marker: "Listening on:".to_string(),
            probe_grace: Duration::from_secs(5),
        }
    }
}

/// Phases in the order an update walks through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UpdatePhase {
    Idle,
    Downloading,
    Extracting,
    StoppingInstances,
    Backup,
    Installing,
    Verifying,
    RestartingOnSuccess,
    RollingBack,
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpdatePhase::Idle => "idle",
            UpdatePhase::Downloading => "downloading",
            UpdatePhase::Extracting => "extracting",
            UpdatePhase::StoppingInstances => "stopping instances",
            UpdatePhase::Backup => "backing up",
            UpdatePhase::Installing => "installing",
            UpdatePhase::Verifying => "verifying",
            UpdatePhase::RestartingOnSuccess => "restarting instances",
            UpdatePhase::RollingBack => "rolling back",
        };
        write!(f, "{}", s)
    }
}

/// State carried through one update attempt.
#[derive(Debug)]
pub struct UpdateSession {
    pub archive_name: String,
    pub extracted_binary: Option<PathBuf>,
    pub backup: Option<PathBuf>,
    /// Instances that were running when the update began
    pub snapshot: Vec<String>,
    pub instances_stopped: bool,
    pub phase: UpdatePhase,
}

impl UpdateSession {
    fn new(archive_name: impl Into<String>, snapshot: Vec<String>) -> Self {
        Self {
            archive_name: archive_name.into(),
            extracted_binary: None,
            backup: None,
            snapshot,
            instances_stopped: false,
            phase: UpdatePhase::Idle,
        }
    }

    fn enter(&mut self, phase: UpdatePhase) {
        debug!("Update phase: {} -> {}", self.phase, phase);
        self.phase = phase;
    }
}

pub struct UpdateOrchestrator<S> {
    supervisor: Arc<Supervisor>,
    layout: BinaryLayout,
    source: S,
    settings: UpdateSettings,
}

impl<S: ArchiveSource> UpdateOrchestrator<S> {
    pub fn new(
        supervisor: Arc<Supervisor>,
        layout: BinaryLayout,
        source: S,
        settings: UpdateSettings,
    ) -> Self {
        Self {
            supervisor,
            layout,
            source,
            settings,
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn layout(&self) -> &BinaryLayout {
        &self.layout
    }

    /// Replace the live binary with the latest release.
    ///
    /// Returns `Ok(())` once the new binary is verified and live. On failure
    /// the previous binary has been restored by the time the error is returned.
    pub async fn handle_update(&self) -> Result<()> {
        let ctx = Arc::clone(self.supervisor.context());
        let Some(_guard) = ctx.try_begin_update() else {
            warn!("An update is already in progress");
            return Err(WrapperError::UpdateInProgress);
        };

        let snapshot = self.supervisor.running_instances().await;
        let mut session = UpdateSession::new(&self.layout.platform().archive_name, snapshot);
        info!(
            "Starting update ({} running instance(s): {})",
            session.snapshot.len(),
            session.snapshot.join(", ")
        );

        let result = self.apply(&mut session).await;
        self.cleanup().await;

        match result {
            Ok(()) => {
                session.enter(UpdatePhase::Idle);
                info!("Update completed successfully");
                Ok(())
            }
            Err(e) => {
                error!("Update failed while {}: {}", session.phase, e);
                debug!("Update failure detail: {:?}", e);
                self.roll_back(&mut session).await;
                session.enter(UpdatePhase::Idle);
                Err(e)
            }
        }
    }

    async fn apply(&self, session: &mut UpdateSession) -> Result<()> {
        let dir = self.layout.dir();
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| WrapperError::path_io(dir, e))?;

        session.enter(UpdatePhase::Downloading);
        let archive = self.layout.archive_path();
        self.source.fetch(&session.archive_name, &archive).await?;

        session.enter(UpdatePhase::Extracting);
        let temp = self.layout.temp_dir();
        remove_dir_if_exists(&temp).await?;
        tokio::fs::create_dir_all(&temp)
            .await
            .map_err(|e| WrapperError::path_io(&temp, e))?;
        extract_blocking(archive, temp.clone()).await?;

        let extracted = temp.join(&self.layout.platform().binary_file_name);
        if !extracted.exists() {
            return Err(WrapperError::ExtractedBinaryMissing(extracted));
        }
        self.mark_executable(&extracted)?;
        session.extracted_binary = Some(extracted.clone());

        session.enter(UpdatePhase::StoppingInstances);
        session.instances_stopped = true;
        for name in &session.snapshot {
            if let Err(e) = self.supervisor.stop(name, false).await {
                warn!("Failed to stop instance '{}': {}", name, e);
            }
        }
        tokio::time::sleep(self.settings.settle_delay).await;

        session.enter(UpdatePhase::Backup);
        let live = self.layout.binary_path();
        let backup = self.layout.backup_path();
        remove_file_if_exists(&backup).await?;
        if live.exists() {
            info!("Backing up current binary to {}", backup.display());
            tokio::fs::rename(&live, &backup)
                .await
                .map_err(|e| WrapperError::path_io(&live, e))?;
            session.backup = Some(backup.clone());
        }

        session.enter(UpdatePhase::Installing);
        info!("Installing new binary...");
        install(&extracted, &live).await?;
        self.mark_executable(&live)?;
        self.cleanup().await;

        session.enter(UpdatePhase::Verifying);
        verify(&live, &self.settings).await?;

        session.enter(UpdatePhase::RestartingOnSuccess);
        if let Err(e) = remove_file_if_exists(&backup).await {
            warn!("Failed to remove backup: {}", e);
        }
        session.backup = None;
        self.relaunch(&session.snapshot).await;
        Ok(())
    }

    async fn roll_back(&self, session: &mut UpdateSession) {
        let failed_at = session.phase;
        session.enter(UpdatePhase::RollingBack);

        match session.backup.take().filter(|b| b.exists()) {
            Some(backup) => {
                warn!("Restoring previous binary...");
                let live = self.layout.binary_path();
                if let Err(e) = remove_file_if_exists(&live).await {
                    warn!("Failed to remove new binary: {}", e);
                }
                if let Err(e) = install(&backup, &live).await {
                    error!("Failed to restore previous binary: {}", e);
                    return;
                }
                if let Err(e) = self.mark_executable(&live) {
                    warn!("{}", e);
                }
                info!("Previous binary restored");
                self.relaunch(&session.snapshot).await;
            }
            None if !session.instances_stopped => {
                debug!("No instances were stopped, nothing to roll back")
            }
            None if failed_at < UpdatePhase::Installing => {
                info!("Binary was not replaced, relaunching instances");
                self.relaunch(&session.snapshot).await;
            }
            None => error!(
                "No previous binary to restore, leaving {} instance(s) stopped",
                session.snapshot.len()
            ),
        }
    }

    async fn relaunch(&self, names: &[String]) {
        for name in names {
            info!("Relaunching instance '{}'", name);
            if let Err(e) = self.supervisor.resume(name).await {
                error!("{}", e);
            }
        }
    }

    fn mark_executable(&self, path: &Path) -> Result<()> {
        if self.layout.platform().is_windows() {
            return Ok(());
        }
        platform::set_executable(path).map_err(|e| WrapperError::path_io(path, e))
    }

    /// Remove the extraction directory and downloaded archive.
    async fn cleanup(&self) {
        if let Err(e) = remove_dir_if_exists(&self.layout.temp_dir()).await {
            warn!("Failed to clean up: {}", e);
        }
        if let Err(e) = remove_file_if_exists(&self.layout.archive_path()).await {
            warn!("Failed to clean up: {}", e);
        }
    }
}

/// Move `from` to `to`, copying and deleting when a rename is not possible.
async fn install(from: &Path, to: &Path) -> Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!("Rename failed ({}), falling back to copy", e);
            copy_then_remove(from, to).await
        }
    }
}

/// The source is only removed once the copy has succeeded.
async fn copy_then_remove(from: &Path, to: &Path) -> Result<()> {
    tokio::fs::copy(from, to)
        .await
        .map_err(|e| WrapperError::path_io(to, e))?;
    tokio::fs::remove_file(from)
        .await
        .map_err(|e| WrapperError::path_io(from, e))
}

async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(WrapperError::path_io(path, e)),
        _ => Ok(()),
    }
}

async fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(WrapperError::path_io(path, e)),
        _ => Ok(()),
    }
}
