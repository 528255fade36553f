use console::style;
use std::fmt;
use std::path::PathBuf;

/// Run state of a supervised instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Running,
    Stopped,
}

impl InstanceState {
    pub fn is_running(&self) -> bool {
        matches!(self, InstanceState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Running => "RUNNING",
            InstanceState::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceState::Running => write!(f, "{}", style(self.as_str()).green()),
            InstanceState::Stopped => write!(f, "{}", style(self.as_str()).red()),
        }
    }
}

/// Point-in-time status of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub name: String,
    pub state: InstanceState,
    pub pid: Option<u32>,
    pub config_path: Option<PathBuf>,
    /// Crash relaunches since the last operator launch
    pub restarts: u32,
    pub auto_restart: bool,
    pub uptime_secs: Option<u64>,
    pub last_exit_code: Option<i32>,
}

impl InstanceInfo {
    /// Single status line for the operator console.
    pub fn summary(&self) -> String {
        let config = self
            .config_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<none>".to_string());

        let mut line = format!(
            "{}: {} (config: {}, restarts: {}",
            self.name, self.state, config, self.restarts
        );
        if let Some(pid) = self.pid {
            line.push_str(&format!(", pid: {}", pid));
        }
        if let Some(uptime) = self.uptime_secs {
            line.push_str(&format!(", uptime: {}s", uptime));
        }
        if !self.state.is_running() {
            if let Some(code) = self.last_exit_code {
                line.push_str(&format!(", last exit: {}", code));
            }
            if !self.auto_restart {
                line.push_str(", auto-restart off");
            }
        }
        line.push(')');
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(state: InstanceState) -> InstanceInfo {
        InstanceInfo {
            name: "lobby".into(),
            state,
            pid: None,
            config_path: Some("configs/lobby.toml".into()),
            restarts: 2,
            auto_restart: true,
            uptime_secs: None,
            last_exit_code: None,
        }
    }

    #[test]
    fn test_state() {
        assert!(InstanceState::Running.is_running());
        assert!(!InstanceState::Stopped.is_running());
        assert_eq!(InstanceState::Stopped.as_str(), "STOPPED");
    }

    #[test]
    fn test_summary_running() {
        console::set_colors_enabled(false);
        let info = InstanceInfo {
            pid: Some(4242),
            uptime_secs: Some(12),
            ..info(InstanceState::Running)
        };
        assert_eq!(
            info.summary(),
            "lobby: RUNNING (config: configs/lobby.toml, restarts: 2, pid: 4242, uptime: 12s)"
        );
    }

    #[test]
    fn test_summary_stopped() {
        console::set_colors_enabled(false);
        let info = InstanceInfo {
            config_path: None,
            auto_restart: false,
            last_exit_code: Some(1),
            ..info(InstanceState::Stopped)
        };
        assert_eq!(
            info.summary(),
            "lobby: STOPPED (config: <none>, restarts: 2, last exit: 1, auto-restart off)"
        );
    }
}
