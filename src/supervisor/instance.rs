use std::ffi::OsString;
use std::time::Instant;

use super::state::{InstanceInfo, InstanceState};
use crate::config::InstanceSpec;
use crate::process::ProcessHandle;

/// One supervised process slot.
#[derive(Debug)]
pub struct ManagedInstance {
    pub spec: InstanceSpec,
    pub process: Option<ProcessHandle>,
    /// Bumped on every launch so exit events from older processes can be told apart.
    pub generation: u64,
    /// Crash relaunches since the last operator launch
    pub restarts: u32,
    pub should_restart: bool,
    pub started_at: Option<Instant>,
    pub last_exit_code: Option<i32>,
}

impl ManagedInstance {
    pub fn new(spec: InstanceSpec) -> Self {
        Self {
            spec,
            process: None,
            generation: 0,
            restarts: 0,
            should_restart: false,
            started_at: None,
            last_exit_code: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn is_running(&self) -> bool {
        self.process.as_ref().is_some_and(ProcessHandle::is_alive)
    }

    pub fn pid(&self) -> Option<u32> {
        self.process
            .as_ref()
            .filter(|p| p.is_alive())
            .and_then(ProcessHandle::pid)
    }

    pub fn uptime_secs(&self) -> Option<u64> {
        if !self.is_running() {
            return None;
        }
        self.started_at.map(|t| t.elapsed().as_secs())
    }

    /// Command-line arguments for the server binary.
    pub fn args(&self) -> Vec<OsString> {
        match &self.spec.config_path {
            Some(path) => vec![OsString::from("-c"), path.clone().into_os_string()],
            None => Vec::new(),
        }
    }

    pub fn to_info(&self) -> InstanceInfo {
        InstanceInfo {
            name: self.spec.name.clone(),
            state: if self.is_running() {
                InstanceState::Running
            } else {
                InstanceState::Stopped
            },
            pid: self.pid(),
            config_path: self.spec.config_path.clone(),
            restarts: self.restarts,
            auto_restart: self.should_restart,
            uptime_secs: self.uptime_secs(),
            last_exit_code: self.last_exit_code,
        }
    }
}
