//! Operator command console.

use console::style;
use std::io::BufRead;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::WrapperError;
use crate::release::ArchiveSource;
use crate::supervisor::Supervisor;
use crate::update::UpdateOrchestrator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Stop every instance and exit
    Shutdown,
    Stop(String),
    Start(String),
    Restart(String),
    Status,
    Update,
    Help,
    Unknown(String),
}

impl ConsoleCommand {
    /// Parse one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let (word, arg) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, Some(rest.trim()).filter(|a| !a.is_empty())),
            None => (line, None),
        };

        let command = match (word.to_lowercase().as_str(), arg) {
            ("stop" | "exit" | "quit" | "end", None) => Self::Shutdown,
            ("stop" | "exit" | "quit" | "end", Some(name)) => Self::Stop(name.to_string()),
            ("start", Some(name)) => Self::Start(name.to_string()),
            ("restart", Some(name)) => Self::Restart(name.to_string()),
            ("status", _) => Self::Status,
            ("update" | "reload", _) => Self::Update,
            ("help", _) => Self::Help,
            _ => Self::Unknown(line.to_string()),
        };
        Some(command)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Shutdown,
}

pub struct Console<S> {
    orchestrator: Arc<UpdateOrchestrator<S>>,
}

impl<S: ArchiveSource + 'static> Console<S> {
    pub fn new(orchestrator: Arc<UpdateOrchestrator<S>>) -> Self {
        Self { orchestrator }
    }

    fn supervisor(&self) -> &Arc<Supervisor> {
        self.orchestrator.supervisor()
    }

    /// Process input lines until a shutdown command or the end of input.
    pub async fn run(&self, mut lines: mpsc::UnboundedReceiver<String>) {
        while let Some(line) = lines.recv().await {
            let Some(command) = ConsoleCommand::parse(&line) else {
                continue;
            };
            if self.execute(command).await == Flow::Shutdown {
                return;
            }
        }
        debug!("Console input closed");
    }

    pub async fn execute(&self, command: ConsoleCommand) -> Flow {
        let supervisor = self.supervisor();
        let ctx = supervisor.context();

        match command {
            ConsoleCommand::Shutdown => {
                info!("Shutdown requested");
                ctx.request_shutdown();
                return Flow::Shutdown;
            }
            ConsoleCommand::Stop(name) => {
                if let Err(e) = supervisor.stop(&name, false).await {
                    error!("{}", e);
                }
            }
            ConsoleCommand::Start(name) => {
                wait_for_update(ctx).await;
                if let Err(e) = supervisor.launch(&name).await {
                    error!("{}", e);
                }
            }
            ConsoleCommand::Restart(name) => {
                wait_for_update(ctx).await;
                if let Err(e) = supervisor.restart(&name).await {
                    error!("{}", e);
                }
            }
            ConsoleCommand::Status => {
                println!("Instance status:");
                for info in supervisor.status().await {
                    println!("  {}", info.summary());
                }
            }
            ConsoleCommand::Update => self.start_update(),
            ConsoleCommand::Help => print_help(),
            ConsoleCommand::Unknown(input) => {
                warn!("Unknown command: {} (type 'help' for available commands)", input);
            }
        }
        Flow::Continue
    }

    fn start_update(&self) {
        if self.supervisor().context().is_updating() {
            warn!("An update is already in progress");
            return;
        }

        let orchestrator = Arc::clone(&self.orchestrator);
        tokio::spawn(async move {
            match orchestrator.handle_update().await {
                Ok(()) => {}
                Err(WrapperError::UpdateInProgress) => {}
                Err(e) if e.is_update_scoped() => {
                    warn!("Update aborted, the previous binary is still in use")
                }
                Err(e) => error!("Update aborted: {}", e),
            }
        });
    }
}

async fn wait_for_update(ctx: &crate::context::SupervisorContext) {
    if ctx.is_updating() {
        info!("Waiting for the update to finish...");
        ctx.wait_for_update_idle().await;
    }
}

fn print_help() {
    let commands = [
        ("stop | exit | quit | end", "Stop all instances and exit"),
        ("stop <name>", "Stop one instance"),
        ("start <name>", "Start an instance"),
        ("restart <name>", "Restart an instance"),
        ("status", "Show instance status"),
        ("update | reload", "Download and install the latest release"),
        ("help", "Show this help"),
    ];

    println!("Available commands:");
    for (usage, description) in commands {
        println!("  {:<26} {}", style(usage).cyan(), description);
    }
}

/// Forward stdin lines to the console from a dedicated thread.
///
/// A plain thread keeps a pending read from holding up runtime shutdown.
pub fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}
