//! Process-wide flags shared by the supervisor, the update orchestrator and
//! the console.

use tokio::sync::watch;

#[derive(Debug)]
pub struct SupervisorContext {
    shutdown: watch::Sender<bool>,
    updating: watch::Sender<bool>,
}

impl SupervisorContext {
    pub fn new() -> Self {
        Self {
            shutdown: watch::Sender::new(false),
            updating: watch::Sender::new(false),
        }
    }

    /// Set the shutdown flag. It is never cleared.
    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolve once shutdown has been requested.
    pub async fn shutdown_requested(&self) {
        let mut rx = self.shutdown.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|requested| *requested).await;
    }

    pub fn is_updating(&self) -> bool {
        *self.updating.borrow()
    }

    /// Atomically claim the update slot. `None` if an update is already running.
    pub fn try_begin_update(&self) -> Option<UpdateGuard<'_>> {
        let claimed = self.updating.send_if_modified(|updating| {
            if *updating {
                false
            } else {
                *updating = true;
                true
            }
        });

        claimed.then_some(UpdateGuard { ctx: self })
    }

    /// Resolve once no update is in progress.
    pub async fn wait_for_update_idle(&self) {
        let mut rx = self.updating.subscribe();
        let _ = rx.wait_for(|updating| !*updating).await;
    }
}

impl Default for SupervisorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds the update-in-progress flag; dropping it clears the flag and wakes waiters.
#[derive(Debug)]
pub struct UpdateGuard<'a> {
    ctx: &'a SupervisorContext,
}

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        self.ctx.updating.send_replace(false);
    }
}
