//! Crash-restart policy.
//!
//! Process exits arrive as [`InstanceEvent`]s. A single evaluator task reads
//! them and hands each one to its own task so a backoff on one instance never
//! delays the others.

use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{LaunchReason, Supervisor};
use crate::process::Exit;

#[derive(Debug, Clone)]
pub enum InstanceEvent {
    Exited {
        name: String,
        generation: u64,
        exit: Exit,
    },
}

pub(super) async fn run(supervisor: Weak<Supervisor>, mut events: mpsc::UnboundedReceiver<InstanceEvent>) {
    while let Some(event) = events.recv().await {
        let Some(supervisor) = supervisor.upgrade() else {
            break;
        };
        tokio::spawn(async move { supervisor.handle_event(event).await });
    }
    debug!("Restart policy evaluator stopped");
}

impl Supervisor {
    async fn handle_event(self: Arc<Self>, event: InstanceEvent) {
        match event {
            InstanceEvent::Exited {
                name,
                generation,
                exit,
            } => self.handle_exit(&name, generation, exit).await,
        }
    }

    async fn handle_exit(&self, name: &str, generation: u64, exit: Exit) {
        let Ok(slot) = self.slot(name).await else {
            return;
        };

        {
            let mut instance = slot.lock().await;
            if instance.generation != generation {
                debug!("Ignoring stale exit of instance '{}'", name);
                return;
            }

            instance.process = None;
            instance.started_at = None;
            instance.last_exit_code = exit.code;

            if !instance.should_restart || self.ctx.is_shutdown_requested() {
                info!("Instance '{}' exited (code: {:?})", name, exit.code);
                return;
            }

            warn!("Instance '{}' exited unexpectedly (code: {:?})", name, exit.code);

            if instance.restarts >= self.settings.max_restarts {
                error!(
                    "Instance '{}': max restart attempts ({}) reached, giving up",
                    name, self.settings.max_restarts
                );
                instance.should_restart = false;
                return;
            }

            instance.restarts += 1;
            info!(
                "Restarting instance '{}' in {:?} (attempt {}/{})",
                name, self.settings.restart_backoff, instance.restarts, self.settings.max_restarts
            );
        }

        tokio::time::sleep(self.settings.restart_backoff).await;

        let mut instance = self.lock_when_idle(&slot).await;
        if self.ctx.is_shutdown_requested() {
            debug!("Shutdown requested, not relaunching '{}'", name);
            return;
        }
        if instance.generation != generation || !instance.should_restart || instance.is_running() {
            debug!("Instance '{}' changed during backoff, skipping relaunch", name);
            return;
        }

        if let Err(e) = self.launch_locked(&mut instance, LaunchReason::CrashRecovery) {
            error!("{}", e);
        }
        if instance.restarts >= self.settings.max_restarts {
            warn!(
                "Instance '{}': max restart attempts ({}) reached, auto-restart disabled",
                name, self.settings.max_restarts
            );
            instance.should_restart = false;
        }
    }
}
