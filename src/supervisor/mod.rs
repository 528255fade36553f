//! Instance supervision.
//!
//! The [`Supervisor`] owns every configured instance, launches and stops
//! their processes and relaunches them after crashes. Operations on the same
//! instance are serialized through that instance's mutex.

mod instance;
mod policy;
mod state;

pub use instance::ManagedInstance;
pub use policy::InstanceEvent;
pub use state::{InstanceInfo, InstanceState};

use console::style;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, MutexGuard, RwLock};
use tracing::{error, info, warn};

use crate::config::InstanceSpec;
use crate::context::SupervisorContext;
use crate::error::{Result, WrapperError};
use crate::process;

/// Supervisor tunables.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Crash relaunches allowed before auto-restart is switched off
    pub max_restarts: u32,
    pub restart_backoff: Duration,
    /// Time between SIGTERM and a forced kill
    pub stop_grace: Duration,
    /// Pause between stop and launch in `restart`
    pub restart_settle: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            restart_backoff: Duration::from_secs(1),
            stop_grace: Duration::from_secs(5),
            restart_settle: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LaunchReason {
    /// Console command, autostart or update resume. Resets the restart counter.
    Operator,
    CrashRecovery,
}

type Slot = Arc<Mutex<ManagedInstance>>;

pub struct Supervisor {
    binary: PathBuf,
    instances: RwLock<HashMap<String, Slot>>,
    ctx: Arc<SupervisorContext>,
    settings: SupervisorSettings,
    events: mpsc::UnboundedSender<InstanceEvent>,
}

impl Supervisor {
    /// Build the supervisor and start its restart-policy evaluator.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        binary: impl Into<PathBuf>,
        specs: Vec<InstanceSpec>,
        ctx: Arc<SupervisorContext>,
        settings: SupervisorSettings,
    ) -> Arc<Self> {
        let instances = specs
            .into_iter()
            .map(|spec| (spec.name.clone(), Arc::new(Mutex::new(ManagedInstance::new(spec)))))
            .collect();

        let (events, rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Self {
            binary: binary.into(),
            instances: RwLock::new(instances),
            ctx,
            settings,
            events,
        });

        tokio::spawn(policy::run(Arc::downgrade(&supervisor), rx));
        supervisor
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn context(&self) -> &Arc<SupervisorContext> {
        &self.ctx
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    async fn slot(&self, name: &str) -> Result<Slot> {
        self.instances
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| WrapperError::NotFound(name.to_string()))
    }

    async fn slots(&self) -> Vec<Slot> {
        self.instances.read().await.values().cloned().collect()
    }

    /// Registered instance names, sorted.
    pub async fn instance_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.instances.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Launch an instance, waiting for any running update to finish first.
    pub async fn launch(&self, name: &str) -> Result<()> {
        let slot = self.slot(name).await?;
        let mut instance = self.lock_when_idle(&slot).await;
        self.launch_locked(&mut instance, LaunchReason::Operator)
    }

    /// Launch without waiting for the update gate. Only the update itself
    /// calls this while it holds the gate.
    pub(crate) async fn resume(&self, name: &str) -> Result<()> {
        let slot = self.slot(name).await?;
        let mut instance = slot.lock().await;
        self.launch_locked(&mut instance, LaunchReason::Operator)
    }

    /// Lock a slot once no update is running.
    ///
    /// The flag is checked again under the lock: an update takes its snapshot
    /// through the same locks, so whatever is launched here is either seen by
    /// that snapshot or waits for the update to end.
    async fn lock_when_idle<'a>(&self, slot: &'a Slot) -> MutexGuard<'a, ManagedInstance> {
        loop {
            self.ctx.wait_for_update_idle().await;
            let instance = slot.lock().await;
            if !self.ctx.is_updating() {
                return instance;
            }
        }
    }

    fn launch_locked(&self, instance: &mut ManagedInstance, reason: LaunchReason) -> Result<()> {
        let name = instance.name().to_string();
        if instance.is_running() {
            warn!("Instance '{}' is already running", name);
            return Ok(());
        }

        instance.generation += 1;
        let generation = instance.generation;

        let prefix = style(format!("[{}]", name)).cyan().to_string();
        let events = self.events.clone();
        let exit_name = name.clone();

        info!("Starting instance '{}'...", name);
        let handle = process::spawn(
            &self.binary,
            instance.args(),
            move |line| println!("{} {}", prefix, line),
            move |exit| {
                let _ = events.send(InstanceEvent::Exited {
                    name: exit_name,
                    generation,
                    exit,
                });
            },
        )
        .map_err(|source| WrapperError::Launch {
            name: name.clone(),
            source,
        })?;

        info!("Instance '{}' started (PID {:?})", name, handle.pid());
        instance.process = Some(handle);
        instance.started_at = Some(Instant::now());
        instance.should_restart = true;
        if reason == LaunchReason::Operator {
            instance.restarts = 0;
        }
        Ok(())
    }

    /// Stop an instance. `restart_intent` becomes its auto-restart flag.
    pub async fn stop(&self, name: &str, restart_intent: bool) -> Result<()> {
        let slot = self.slot(name).await?;
        let mut instance = slot.lock().await;
        self.stop_locked(&mut instance, restart_intent).await;
        Ok(())
    }

    async fn stop_locked(&self, instance: &mut ManagedInstance, restart_intent: bool) {
        instance.should_restart = restart_intent;

        if !instance.is_running() {
            warn!("Instance '{}' is not running", instance.name());
            return;
        }
        let Some(handle) = instance.process.take() else {
            return;
        };

        info!("Stopping instance '{}'...", instance.name());
        if !handle.terminate(self.settings.stop_grace).await {
            warn!(
                "Instance '{}' did not stop within {:?}, killed",
                instance.name(),
                self.settings.stop_grace
            );
        }

        instance.last_exit_code = handle.wait().await.code;
        instance.started_at = None;
        info!("Instance '{}' stopped", instance.name());
    }

    pub async fn restart(&self, name: &str) -> Result<()> {
        let slot = self.slot(name).await?;
        let mut instance = self.lock_when_idle(&slot).await;

        if instance.is_running() {
            info!("Restarting instance '{}'...", name);
            self.stop_locked(&mut instance, false).await;
            tokio::time::sleep(self.settings.restart_settle).await;
        }

        instance.should_restart = true;
        self.launch_locked(&mut instance, LaunchReason::Operator)
    }

    /// Status of every instance, sorted by name.
    pub async fn status(&self) -> Vec<InstanceInfo> {
        let mut infos = Vec::new();
        for slot in self.slots().await {
            infos.push(slot.lock().await.to_info());
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub async fn is_running(&self, name: &str) -> Result<bool> {
        let slot = self.slot(name).await?;
        let running = slot.lock().await.is_running();
        Ok(running)
    }

    /// Names of running instances, sorted.
    pub async fn running_instances(&self) -> Vec<String> {
        self.status()
            .await
            .into_iter()
            .filter(|info| info.state.is_running())
            .map(|info| info.name)
            .collect()
    }

    pub async fn launch_autostart(&self) {
        for slot in self.slots().await {
            let mut instance = slot.lock().await;
            if !instance.spec.auto_start {
                info!("Instance '{}' has auto_start disabled", instance.name());
                continue;
            }
            if let Err(e) = self.launch_locked(&mut instance, LaunchReason::Operator) {
                error!("{}", e);
            }
        }
    }

    /// Stop every running instance without restart intent.
    pub async fn stop_all(&self) {
        for name in self.running_instances().await {
            if let Err(e) = self.stop(&name, false).await {
                warn!("Failed to stop instance '{}': {}", name, e);
            }
        }
    }
}
