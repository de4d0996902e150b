use crate::environment::Environment;
use crate::Result;
use eyre::eyre;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{getpgid, Pid};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Configuration for a managed child process
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Command to execute
    pub command: String,
    /// Arguments for the command
    pub args: Vec<String>,
    /// Timeout for graceful shutdown before SIGKILL
    pub graceful_shutdown_timeout: Duration,
    /// Working directory for the process
    pub working_directory: Option<PathBuf>,
    /// Variables added on top of the inherited environment
    pub environment: Environment,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            graceful_shutdown_timeout: Duration::from_secs(5),
            working_directory: None,
            environment: Environment::new(),
        }
    }
}

/// State of a managed process
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessState {
    /// Process is starting
    Starting,
    /// Process is running
    Running,
    /// Process is stopping (graceful shutdown)
    Stopping,
    /// Process has stopped
    Stopped,
    /// Waiting on the process failed
    Failed,
}

/// Information about a managed process
#[derive(Debug)]
pub struct ProcessInfo {
    pub state: ProcessState,
    pub pid: Option<Pid>,
    pub start_time: Instant,
    pub exit_status: Option<ExitStatus>,
}

/// Owns one child process running in its own process group.
///
/// Signals go to the whole group so helper processes the child forks are
/// cleaned up with it.
pub struct ProcessManager {
    config: ProcessConfig,
    process_info: ProcessInfo,
    child: Option<Child>,
}

impl ProcessManager {
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            process_info: ProcessInfo {
                state: ProcessState::Stopped,
                pid: None,
                start_time: Instant::now(),
                exit_status: None,
            },
            config,
            child: None,
        }
    }

    /// Spawns the configured command.
    ///
    /// Fails if a process is already running.
    pub async fn spawn_process(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Err(eyre!(
                "Process {} is already running",
                self.config.command
            ));
        }

        self.process_info.state = ProcessState::Starting;
        info!("Spawning process: {} {:?}", self.config.command, self.config.args);

        let mut command = Command::new(&self.config.command);
        command.args(&self.config.args);

        // process_group(0) makes the child the leader of a new group
        command.process_group(0);
        command.kill_on_drop(true);
        command.stdin(Stdio::null());
        command.stdout(Stdio::inherit());
        command.stderr(Stdio::inherit());

        if let Some(ref work_dir) = self.config.working_directory {
            command.current_dir(work_dir);
        }
        command.envs(self.config.environment.iter());

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.process_info.state = ProcessState::Failed;
                return Err(eyre!("Failed to spawn {}: {}", self.config.command, e));
            }
        };

        let pid = match child.id() {
            Some(pid) => Pid::from_raw(pid.try_into()?),
            None => return Err(eyre!("Failed to get process ID")),
        };

        self.process_info.pid = Some(pid);
        self.process_info.state = ProcessState::Running;
        self.process_info.start_time = Instant::now();
        self.process_info.exit_status = None;
        self.child = Some(child);

        info!("Process spawned with PID: {}", pid);
        Ok(())
    }

    /// Waits for the current process to exit.
    ///
    /// Returns `None` if there is no process.
    pub async fn wait_for_exit(&mut self) -> Result<Option<ExitStatus>> {
        if let Some(ref mut child) = self.child {
            match child.wait().await {
                Ok(status) => {
                    self.mark_exited(status);
                    info!("Process exited with status: {:?}", status);
                    Ok(Some(status))
                }
                Err(e) => {
                    error!("Error waiting for process: {}", e);
                    self.process_info.state = ProcessState::Failed;
                    self.child = None;
                    Err(e.into())
                }
            }
        } else {
            Ok(None)
        }
    }

    /// Exit status if the process has already exited, without blocking.
    pub fn try_exit_status(&mut self) -> Result<Option<ExitStatus>> {
        let status = match self.child {
            Some(ref mut child) => child.try_wait()?,
            None => return Ok(self.process_info.exit_status),
        };
        if let Some(status) = status {
            self.mark_exited(status);
        }
        Ok(status)
    }

    /// Sends SIGTERM and waits for the process to exit, falling back to
    /// SIGKILL after the graceful shutdown timeout.
    pub async fn graceful_shutdown(&mut self) -> Result<()> {
        if self.child.is_none() {
            return Ok(());
        }
        let Some(pid) = self.process_info.pid else {
            return Ok(());
        };

        self.process_info.state = ProcessState::Stopping;
        info!("Initiating graceful shutdown of process {}", pid);

        if let Err(e) = self.forward_signal(Signal::SIGTERM) {
            warn!("Failed to send SIGTERM: {}", e);
        }

        match timeout(self.config.graceful_shutdown_timeout, self.wait_for_exit()).await {
            Ok(Ok(_)) => {
                info!("Process exited gracefully");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("Error during graceful shutdown: {}", e);
                self.force_kill().await
            }
            Err(_) => {
                warn!("Graceful shutdown timeout, forcing kill");
                self.force_kill().await
            }
        }
    }

    /// Sends SIGKILL to the process group and reaps the child.
    pub async fn force_kill(&mut self) -> Result<()> {
        if self.child.is_none() {
            return Ok(());
        }
        let Some(pid) = self.process_info.pid else {
            return Ok(());
        };
        info!("Force killing process {}", pid);

        if let Err(e) = self.forward_signal(Signal::SIGKILL) {
            warn!("Failed to send SIGKILL: {}", e);
        }

        if let Some(ref mut child) = self.child {
            // SIGKILL cannot be ignored, so this wait is bounded
            match timeout(Duration::from_secs(1), child.wait()).await {
                Ok(Ok(status)) => {
                    self.mark_exited(status);
                    info!("Process killed, exit status: {:?}", status);
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(eyre!("Process {} did not exit after SIGKILL", pid)),
            }
        }
        Ok(())
    }

    /// Forwards a signal to the current process group.
    pub fn forward_signal(&self, signal: Signal) -> Result<()> {
        self.send_signal_to_group(signal)
    }

    /// Sends a signal to the process group (synchronous, usable from Drop).
    pub fn send_signal_to_group(&self, signal: Signal) -> Result<()> {
        if let Some(pid) = self.process_info.pid {
            let pgid = getpgid(Some(pid))?;
            debug!("Sending signal {:?} to process group {}", signal, pgid);
            kill(Pid::from_raw(-pgid.as_raw()), signal)?;
            Ok(())
        } else {
            Err(eyre!("No process to send signal to"))
        }
    }

    pub fn process_info(&self) -> &ProcessInfo {
        &self.process_info
    }

    pub fn state(&self) -> ProcessState {
        self.process_info.state.clone()
    }

    pub fn is_running(&self) -> bool {
        self.process_info.state == ProcessState::Running
    }

    fn mark_exited(&mut self, status: ExitStatus) {
        self.process_info.exit_status = Some(status);
        self.process_info.state = ProcessState::Stopped;
        self.child = None;
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        // Only a child that was never reaped needs emergency cleanup
        if self.child.is_none() {
            return;
        }
        if let Some(pid) = self.process_info.pid {
            eprintln!("ProcessManager dropped with running child (PID: {}), emergency cleanup", pid);
            if let Err(e) = self.send_signal_to_group(Signal::SIGKILL) {
                match e.downcast_ref::<nix::Error>() {
                    // Already gone
                    Some(nix::Error::ESRCH) => {}
                    _ => eprintln!(
                        "Failed to send SIGKILL to process group during emergency cleanup: {}",
                        e
                    ),
                }
            }
        }
    }
}
