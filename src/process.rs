//! Child process ownership.
//!
//! Every spawned child is owned by a single task. The task forwards merged
//! stdout/stderr lines, applies termination requests, and publishes the exit
//! status once the child has been reaped. Everything else talks to it through
//! a [`ProcessHandle`].

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

/// How long to keep forwarding buffered output after the child has exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit {
    /// `None` when the child was killed by a signal.
    pub code: Option<i32>,
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    control: mpsc::UnboundedSender<Signal>,
    exit: watch::Receiver<Option<Exit>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    /// Wait for the child to be reaped.
    pub async fn wait(&self) -> Exit {
        let mut rx = self.exit.clone();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => *exit,
            Err(_) => *self.exit.borrow(),
        };
        exit.unwrap_or(Exit { code: None })
    }

    /// Ask the child to exit, escalating to a kill after `grace`.
    ///
    /// Returns `false` when the kill was needed.
    pub async fn terminate(&self, grace: Duration) -> bool {
        if !self.is_alive() {
            return true;
        }

        let _ = self.control.send(Signal::Terminate);
        if tokio::time::timeout(grace, self.wait()).await.is_ok() {
            return true;
        }

        warn!(
            "Process {:?} did not exit within {:?}, killing it",
            self.pid, grace
        );
        let _ = self.control.send(Signal::Kill);
        self.wait().await;
        false
    }
}

/// Spawn `program` with merged output.
///
/// `on_line` receives every output line in order; `on_exit` runs once after
/// the child has been reaped and all of its output forwarded.
pub fn spawn<I, A, L, E>(program: &Path, args: I, on_line: L, on_exit: E) -> std::io::Result<ProcessHandle>
where
    I: IntoIterator<Item = A>,
    A: AsRef<OsStr>,
    L: FnMut(&str) + Send + 'static,
    E: FnOnce(Exit) + Send + 'static,
{
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let pid = child.id();
    debug!("Spawned {} with PID {:?}", program.display(), pid);

    let (line_tx, line_rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        spawn_line_reader(stdout, line_tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_reader(stderr, line_tx);
    }

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (exit_tx, exit_rx) = watch::channel(None);

    tokio::spawn(own_process(child, pid, control_rx, line_rx, exit_tx, on_line, on_exit));

    Ok(ProcessHandle {
        pid,
        control: control_tx,
        exit: exit_rx,
    })
}

fn spawn_line_reader<R>(stream: R, lines: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\r', '\n']).to_string();
                    if lines.send(line).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

async fn own_process<L, E>(
    mut child: Child,
    pid: Option<u32>,
    mut control: mpsc::UnboundedReceiver<Signal>,
    mut lines: mpsc::UnboundedReceiver<String>,
    exit_tx: watch::Sender<Option<Exit>>,
    mut on_line: L,
    on_exit: E,
) where
    L: FnMut(&str) + Send + 'static,
    E: FnOnce(Exit) + Send + 'static,
{
    let mut control_open = true;
    let mut lines_open = true;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            line = lines.recv(), if lines_open => match line {
                Some(line) => on_line(&line),
                None => lines_open = false,
            },
            signal = control.recv(), if control_open => match signal {
                Some(Signal::Terminate) => send_terminate(&mut child, pid),
                Some(Signal::Kill) => {
                    if let Err(e) = child.start_kill() {
                        debug!("Kill of PID {:?} failed: {}", pid, e);
                    }
                }
                None => control_open = false,
            },
        }
    };

    if lines_open {
        let drain = async {
            while let Some(line) = lines.recv().await {
                on_line(&line);
            }
        };
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drain).await.is_err() {
            trace!("Output of PID {:?} still open after exit", pid);
        }
    }

    let exit = Exit {
        code: match status {
            Ok(status) => status.code(),
            Err(e) => {
                warn!("Failed to wait for PID {:?}: {}", pid, e);
                None
            }
        },
    };
    debug!("PID {:?} exited with code {:?}", pid, exit.code);

    exit_tx.send_replace(Some(exit));
    on_exit(exit);
}

fn send_terminate(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            // The child has not been reaped yet, so the PID still belongs to it.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            return;
        }
    }

    #[cfg(not(unix))]
    let _ = pid;

    if let Err(e) = child.start_kill() {
        debug!("Kill failed: {}", e);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn sh() -> &'static Path {
        Path::new("/bin/sh")
    }

    fn collector() -> (Arc<Mutex<Vec<String>>>, impl FnMut(&str) + Send + 'static) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        (lines, move |line: &str| sink.lock().unwrap().push(line.to_string()))
    }

    #[tokio::test]
    async fn test_merged_output_and_exit_code() {
        let (lines, on_line) = collector();
        let (exit_tx, exit_rx) = tokio::sync::oneshot::channel();

        let handle = spawn(
            sh(),
            ["-c", "echo out; echo err 1>&2; exit 3"],
            on_line,
            move |exit| {
                let _ = exit_tx.send(exit);
            },
        )
        .unwrap();

        assert_eq!(handle.wait().await, Exit { code: Some(3) });
        assert_eq!(exit_rx.await.unwrap(), Exit { code: Some(3) });
        assert!(!handle.is_alive());

        let mut lines = lines.lock().unwrap().clone();
        lines.sort();
        assert_eq!(lines, vec!["err".to_string(), "out".to_string()]);
    }

    #[tokio::test]
    async fn test_graceful_terminate() {
        let handle = spawn(sh(), ["-c", "exec sleep 30"], |_| {}, |_| {}).unwrap();
        assert!(handle.is_alive());
        assert!(handle.pid().is_some());

        assert!(handle.terminate(Duration::from_secs(5)).await);
        assert!(!handle.is_alive());
        assert_eq!(handle.wait().await.code, None);
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let handle = spawn(
            sh(),
            ["-c", "trap '' TERM; echo ready; while true; do sleep 1; done"],
            |_| {},
            |_| {},
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let graceful = handle.terminate(Duration::from_millis(300)).await;

        assert!(!graceful);
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_terminate_after_exit_is_noop() {
        let handle = spawn(sh(), ["-c", "exit 0"], |_| {}, |_| {}).unwrap();
        handle.wait().await;
        assert!(handle.terminate(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let result = spawn(Path::new("/nonexistent/pico_limbo"), ["-c", "x"], |_| {}, |_| {});
        assert!(result.is_err());
    }
}
