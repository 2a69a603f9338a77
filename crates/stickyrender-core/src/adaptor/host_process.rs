//! Hosted application process
//!
//! A supervisor task owns the child. It publishes the exit status on a watch
//! channel and serves termination requests, whether they come from the
//! adaptor or from the output monitor's [`ProcessControl`].

use crate::error::AdaptorError;
use crate::monitor::{ControlRequest, OutputMonitor, OutputStream};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Time allowed for the output readers to drain after the child exits
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Program, arguments and environment of the hosted application
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl HostCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// How the hosted process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostExit {
    /// Exit code; `None` when killed by a signal or the status was lost
    pub code: Option<i32>,
}

impl HostExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug)]
enum SupervisorRequest {
    Terminate { grace: Duration },
}

pub struct HostProcess {
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<HostExit>>,
    requests: mpsc::UnboundedSender<SupervisorRequest>,
    supervisor: Option<JoinHandle<()>>,
}

impl HostProcess {
    /// Spawn the hosted application and start supervising it.
    ///
    /// Output goes through `monitor`; termination requests from `control_rx`
    /// are served with `terminate_grace`.
    pub fn spawn(
        command: &HostCommand,
        monitor: Arc<OutputMonitor>,
        control_rx: mpsc::UnboundedReceiver<ControlRequest>,
        terminate_grace: Duration,
    ) -> Result<Self, AdaptorError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| AdaptorError::SpawnFailed(format!("{}: {}", command.program, e)))?;
        let pid = child.id();
        info!("Started hosted application '{}' (pid {:?})", command.program, pid);

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(monitor.spawn_reader(OutputStream::Stdout, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(monitor.spawn_reader(OutputStream::Stderr, stderr));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (requests, request_rx) = mpsc::unbounded_channel();
        let supervisor = tokio::spawn(supervise(child, readers, exit_tx, request_rx, control_rx, terminate_grace));

        Ok(Self {
            pid,
            exit_rx,
            requests,
            supervisor: Some(supervisor),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    pub fn exit(&self) -> Option<HostExit> {
        *self.exit_rx.borrow()
    }

    /// Watch that flips to `Some` when the process has exited
    pub fn exit_watch(&self) -> watch::Receiver<Option<HostExit>> {
        self.exit_rx.clone()
    }

    /// Wait for the process to exit
    pub async fn wait(&self) -> HostExit {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(exit) = *rx.borrow_and_update() {
                return exit;
            }
            if rx.changed().await.is_err() {
                return (*rx.borrow()).unwrap_or(HostExit { code: None });
            }
        }
    }

    pub async fn wait_timeout(&self, timeout: Duration) -> Option<HostExit> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }

    /// Ask the process to stop: SIGTERM, then kill once `grace` elapses.
    /// A zero grace kills immediately.
    pub fn terminate(&self, grace: Duration) {
        if !self.is_running() {
            return;
        }
        if self.requests.send(SupervisorRequest::Terminate { grace }).is_err() {
            debug!("Supervisor already finished");
        }
    }

    /// Cloneable handle that can terminate the process from elsewhere
    pub fn terminator(&self) -> HostTerminator {
        HostTerminator {
            requests: self.requests.clone(),
            exit_rx: self.exit_rx.clone(),
        }
    }

    /// Terminate and wait for the supervisor to finish
    pub async fn shutdown(&mut self, grace: Duration) -> HostExit {
        self.terminate(grace);
        let exit = self.wait().await;
        if let Some(handle) = self.supervisor.take() {
            if let Err(e) = handle.await {
                warn!("Host supervisor task failed: {}", e);
            }
        }
        exit
    }
}

/// Terminates a [`HostProcess`] without owning it
#[derive(Clone)]
pub struct HostTerminator {
    requests: mpsc::UnboundedSender<SupervisorRequest>,
    exit_rx: watch::Receiver<Option<HostExit>>,
}

impl HostTerminator {
    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    pub fn terminate(&self, grace: Duration) {
        if self.is_running() && self.requests.send(SupervisorRequest::Terminate { grace }).is_err() {
            debug!("Supervisor already finished");
        }
    }
}

impl Drop for HostProcess {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.requests.send(SupervisorRequest::Terminate { grace: Duration::ZERO });
        }
    }
}

async fn supervise(
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    exit_tx: watch::Sender<Option<HostExit>>,
    mut requests: mpsc::UnboundedReceiver<SupervisorRequest>,
    mut control: mpsc::UnboundedReceiver<ControlRequest>,
    monitor_grace: Duration,
) {
    let mut kill_at: Option<Instant> = None;
    let mut requests_open = true;
    let mut control_open = true;

    let status = loop {
        let grace = tokio::select! {
            status = child.wait() => break status,
            request = requests.recv(), if requests_open => match request {
                Some(SupervisorRequest::Terminate { grace }) => grace,
                None => {
                    requests_open = false;
                    continue;
                }
            },
            request = control.recv(), if control_open => match request {
                Some(ControlRequest::Terminate { reason }) => {
                    info!("Terminating hosted application: {}", reason);
                    monitor_grace
                }
                None => {
                    control_open = false;
                    continue;
                }
            },
            _ = sleep_until(kill_at) => {
                warn!("Hosted application ignored SIGTERM; killing it");
                if let Err(e) = child.start_kill() {
                    error!("Failed to kill hosted application: {}", e);
                }
                kill_at = None;
                continue;
            }
        };

        if grace.is_zero() {
            if let Err(e) = child.start_kill() {
                debug!("Kill failed: {}", e);
            }
        } else {
            send_sigterm(&mut child);
            let deadline = Instant::now() + grace;
            kill_at = Some(kill_at.map_or(deadline, |at| at.min(deadline)));
        }
    };

    let exit = match status {
        Ok(status) => {
            info!("Hosted application exited with {}", status);
            HostExit { code: status.code() }
        }
        Err(e) => {
            error!("Failed to wait for hosted application: {}", e);
            HostExit { code: None }
        }
    };

    for reader in readers {
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
            warn!("Hosted application output did not drain in time");
        }
    }
    let _ = exit_tx.send(Some(exit));
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
fn send_sigterm(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    debug!("Sending SIGTERM to {}", pid);
    // SAFETY: plain syscall on a pid we spawned and have not yet reaped.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        warn!("Failed to send SIGTERM to {}: {}", pid, std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!("Kill failed: {}", e);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::monitor::{MonitorEvent, ProcessControl, RuleSet};

    fn monitor() -> (Arc<OutputMonitor>, mpsc::UnboundedReceiver<ControlRequest>, ProcessControl) {
        let (control, control_rx) = ProcessControl::new();
        let (tx, _rx) = mpsc::unbounded_channel::<MonitorEvent>();
        let monitor = OutputMonitor::new(RuleSet::new(), control.clone(), Arc::new(tx), 10);
        (Arc::new(monitor), control_rx, control)
    }

    fn sh(script: &str) -> HostCommand {
        HostCommand::new("/bin/sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_exit_code_and_output_are_captured() {
        let (monitor, control_rx, _control) = monitor();
        let recent = monitor.recent();
        let host = HostProcess::spawn(&sh("echo hello; echo oops >&2; exit 3"), monitor, control_rx, Duration::from_secs(1))
            .unwrap();

        let exit = host.wait().await;
        assert_eq!(exit.code, Some(3));
        assert!(!host.is_running());
        let lines = recent.snapshot();
        assert!(lines.contains(&"hello".to_string()));
        assert!(lines.contains(&"oops".to_string()));
    }

    #[tokio::test]
    async fn test_terminate_stops_sleeping_process() {
        let (monitor, control_rx, _control) = monitor();
        let mut host = HostProcess::spawn(&sh("exec sleep 30"), monitor, control_rx, Duration::from_secs(1)).unwrap();
        assert!(host.is_running());
        let exit = tokio::time::timeout(Duration::from_secs(10), host.shutdown(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(!exit.success());
    }

    #[tokio::test]
    async fn test_kill_after_grace_when_sigterm_is_ignored() {
        let (monitor, control_rx, _control) = monitor();
        let host = HostProcess::spawn(
            &sh("trap '' TERM; echo ready; exec sleep 30"),
            monitor.clone(),
            control_rx,
            Duration::from_millis(200),
        )
        .unwrap();
        while !monitor.recent().snapshot().iter().any(|l| l == "ready") {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        host.terminate(Duration::from_millis(200));
        let exit = host.wait_timeout(Duration::from_secs(10)).await.unwrap();
        assert_eq!(exit.code, None);
    }

    #[tokio::test]
    async fn test_monitor_control_request_terminates() {
        let (monitor, control_rx, control) = monitor();
        let host = HostProcess::spawn(&sh("exec sleep 30"), monitor, control_rx, Duration::from_millis(100)).unwrap();
        control.request_termination("fatal output");
        assert!(host.wait_timeout(Duration::from_secs(10)).await.is_some());
    }

    #[tokio::test]
    async fn test_terminator_kills_without_owning() {
        let (monitor, control_rx, _control) = monitor();
        let host = HostProcess::spawn(&sh("exec sleep 30"), monitor, control_rx, Duration::from_secs(1)).unwrap();
        let terminator = host.terminator();
        assert!(terminator.is_running());
        terminator.terminate(Duration::ZERO);
        let exit = host.wait_timeout(Duration::from_secs(10)).await.unwrap();
        assert_eq!(exit.code, None);
        assert!(!terminator.is_running());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let (monitor, control_rx, _control) = monitor();
        let result = HostProcess::spawn(&HostCommand::new("/definitely/not/a/program"), monitor, control_rx, Duration::ZERO);
        assert!(matches!(result, Err(AdaptorError::SpawnFailed(_))));
    }
}
