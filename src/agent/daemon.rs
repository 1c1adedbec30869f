//! Daemon Supervisor
//!
//! One task owns the child process. Callers talk to it over a command
//! channel, so an ensure-running racing a reload can never start a second
//! instance. An exited daemon is started again after a cool-down; it is not
//! started until the first command arrives.

use crate::config::{AgentConfig, DaemonConfig, ReloadMode};
use crate::util::time::format_duration;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("supervisor has stopped")]
    Stopped,

    #[error("failed to signal pid {pid}: {reason}")]
    Signal { pid: u32, reason: String },
}

/// What to run and how to treat it
#[derive(Debug, Clone)]
pub struct DaemonSpec {
    /// Used in log lines only
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub reload: ReloadMode,
    pub restart_delay: Duration,
    pub stop_timeout: Duration,
}

impl DaemonSpec {
    pub fn from_config(name: &str, daemon: &DaemonConfig, agent: &AgentConfig) -> Self {
        Self {
            name: name.to_string(),
            program: daemon.program.clone(),
            args: daemon.args.clone(),
            reload: daemon.reload,
            restart_delay: agent.restart_delay(),
            stop_timeout: agent.stop_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    NotRunning,
    Starting,
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub state: DaemonState,
    pub pid: Option<u32>,
    /// Processes started so far
    pub starts: u64,
}

type Reply = oneshot::Sender<Result<(), SupervisorError>>;

enum Request {
    EnsureRunning(Reply),
    Reload(Reply),
}

/// Handle to a supervised daemon
pub struct Supervisor {
    tx: mpsc::Sender<Request>,
    status: watch::Receiver<Status>,
    task: JoinHandle<()>,
}

impl Supervisor {
    /// Spawn the supervising task; the daemon itself is not started yet
    pub fn spawn(spec: DaemonSpec, shutdown: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(16);
        let (status_tx, status) = watch::channel(Status {
            state: DaemonState::NotRunning,
            pid: None,
            starts: 0,
        });
        let runner = Runner {
            spec,
            child: None,
            restart_at: None,
            status: status_tx,
        };
        let task = tokio::spawn(runner.run(rx, shutdown));
        Self { tx, status, task }
    }

    async fn request(&self, make: fn(Reply) -> Request) -> Result<(), SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SupervisorError::Stopped)?;
        rx.await.map_err(|_| SupervisorError::Stopped)?
    }

    /// Start the daemon unless it is already running
    pub async fn ensure_running(&self) -> Result<(), SupervisorError> {
        self.request(Request::EnsureRunning).await
    }

    /// Make the daemon re-read its configuration, starting it if needed
    pub async fn reload(&self) -> Result<(), SupervisorError> {
        self.request(Request::Reload).await
    }

    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status.clone()
    }

    /// Wait for the supervising task to finish (after shutdown)
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            error!("Supervisor task failed: {}", e);
        }
    }
}

struct Runner {
    spec: DaemonSpec,
    child: Option<Child>,
    restart_at: Option<Instant>,
    status: watch::Sender<Status>,
}

impl Runner {
    async fn run(mut self, mut rx: mpsc::Receiver<Request>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                request = rx.recv() => match request {
                    Some(Request::EnsureRunning(reply)) => {
                        let result = self.ensure_running();
                        let _ = reply.send(result);
                    },
                    Some(Request::Reload(reply)) => {
                        let result = self.reload().await;
                        let _ = reply.send(result);
                    },
                    None => break,
                },
                exit = wait_exit(&mut self.child) => {
                    self.child = None;
                    match exit {
                        Ok(status) => warn!("{} exited with {}", self.spec.name, status),
                        Err(e) => error!("Failed to wait for {}: {}", self.spec.name, e),
                    }
                    self.set_state(DaemonState::NotRunning, None);
                    self.restart_at = Some(Instant::now() + self.spec.restart_delay);
                    info!(
                        "Restarting {} in {}",
                        self.spec.name,
                        format_duration(self.spec.restart_delay)
                    );
                },
                _ = sleep_until(self.restart_at) => {
                    self.restart_at = None;
                    if let Err(e) = self.ensure_running() {
                        error!("{}", e);
                        self.restart_at = Some(Instant::now() + self.spec.restart_delay);
                    }
                },
            }
        }

        self.terminate().await;
        debug!("{} supervisor stopped", self.spec.name);
    }

    fn set_state(&self, state: DaemonState, pid: Option<u32>) {
        self.status.send_modify(|status| {
            status.state = state;
            status.pid = pid;
        });
    }

    /// Drop a child that already exited without us noticing
    fn reap(&mut self) {
        let exited = match self.child.as_mut().map(|c| c.try_wait()) {
            Some(Ok(Some(status))) => {
                warn!("{} exited with {}", self.spec.name, status);
                true
            },
            Some(Err(e)) => {
                warn!("Failed to poll {}: {}", self.spec.name, e);
                false
            },
            _ => false,
        };
        if exited {
            self.child = None;
            self.set_state(DaemonState::NotRunning, None);
        }
    }

    fn ensure_running(&mut self) -> Result<(), SupervisorError> {
        self.reap();
        if self.child.is_some() {
            return Ok(());
        }
        self.start()
    }

    fn start(&mut self) -> Result<(), SupervisorError> {
        self.set_state(DaemonState::Starting, None);
        info!(
            "Starting {}: {} {}",
            self.spec.name,
            self.spec.program,
            self.spec.args.join(" ")
        );

        let spawned = Command::new(&self.spec.program)
            .args(&self.spec.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let child = match spawned {
            Ok(child) => child,
            Err(source) => {
                self.set_state(DaemonState::NotRunning, None);
                return Err(SupervisorError::Spawn {
                    program: self.spec.program.clone(),
                    source,
                });
            },
        };

        let pid = child.id();
        self.child = Some(child);
        self.restart_at = None;
        self.status.send_modify(|status| {
            status.state = DaemonState::Running;
            status.pid = pid;
            status.starts += 1;
        });
        info!("{} running (pid {:?})", self.spec.name, pid);
        Ok(())
    }

    async fn reload(&mut self) -> Result<(), SupervisorError> {
        self.reap();
        let Some(pid) = self.child.as_ref().and_then(|c| c.id()) else {
            return self.start();
        };

        match self.spec.reload {
            ReloadMode::Signal => {
                info!("Reloading {} (pid {})", self.spec.name, pid);
                send_hangup(pid)
            },
            ReloadMode::Restart => {
                info!("Restarting {} to reload (pid {})", self.spec.name, pid);
                self.terminate().await;
                self.start()
            },
        }
    }

    /// SIGTERM, then SIGKILL once the grace period is over
    async fn terminate(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                // SAFETY: plain syscall on a pid we own and have not reaped yet
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
        }

        match tokio::time::timeout(self.spec.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => debug!("{} stopped with {}", self.spec.name, status),
            Ok(Err(e)) => warn!("Failed to wait for {}: {}", self.spec.name, e),
            Err(_) => {
                warn!(
                    "{} did not stop within {:?}, killing it",
                    self.spec.name, self.spec.stop_timeout
                );
                if let Err(e) = child.kill().await {
                    error!("Failed to kill {}: {}", self.spec.name, e);
                }
            },
        }
        self.set_state(DaemonState::NotRunning, None);
    }
}

async fn wait_exit(child: &mut Option<Child>) -> io::Result<ExitStatus> {
    match child {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
fn send_hangup(pid: u32) -> Result<(), SupervisorError> {
    // SAFETY: plain syscall on a pid we own
    let rc = unsafe { libc::kill(pid as i32, libc::SIGHUP) };
    if rc != 0 {
        return Err(SupervisorError::Signal {
            pid,
            reason: io::Error::last_os_error().to_string(),
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_hangup(pid: u32) -> Result<(), SupervisorError> {
    Err(SupervisorError::Signal {
        pid,
        reason: "signals are not supported on this platform".to_string(),
    })
}
