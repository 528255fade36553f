//! Self-test of a freshly installed binary.

use console::style;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use super::UpdateSettings;
use crate::error::{Result, WrapperError};
use crate::process::{self, ProcessHandle};

/// Run `binary` without arguments and wait for it to print the ready marker.
///
/// The probe process is always terminated before returning.
pub async fn verify(binary: &Path, settings: &UpdateSettings) -> Result<()> {
    info!("Verifying new binary...");

    let seen = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&seen);
    let marker = settings.ready_marker.clone();
    let prefix = style("[verify]").yellow().to_string();

    let handle = process::spawn(
        binary,
        std::iter::empty::<&str>(),
        move |line| {
            println!("{} {}", prefix, line);
            if line.contains(&marker) {
                flag.store(true, Ordering::SeqCst);
            }
        },
        |_| {},
    )
    .map_err(|e| WrapperError::path_io(binary, e))?;

    let outcome = poll(&handle, &seen, settings).await;

    if !handle.terminate(settings.probe_grace).await {
        warn!("Verification process had to be killed");
    }

    if outcome.is_ok() {
        info!("Verification successful");
    }
    outcome
}

async fn poll(handle: &ProcessHandle, seen: &AtomicBool, settings: &UpdateSettings) -> Result<()> {
    for _ in 0..settings.probe_attempts {
        if seen.load(Ordering::SeqCst) {
            return Ok(());
        }
        if !handle.is_alive() {
            // Output is fully forwarded before the exit is published.
            if seen.load(Ordering::SeqCst) {
                return Ok(());
            }
            return Err(WrapperError::VerificationCrashed {
                code: handle.wait().await.code,
            });
        }
        tokio::time::sleep(settings.probe_interval).await;
    }

    if seen.load(Ordering::SeqCst) {
        return Ok(());
    }

    let waited = settings.probe_interval * settings.probe_attempts;
    Err(WrapperError::VerificationTimeout {
        marker: settings.ready_marker.clone(),
        waited_ms: waited.as_millis() as u64,
    })
}
