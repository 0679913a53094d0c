use super::command_line::SplitCommand;
use super::types::{Priority, StopOutcome};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::libc::{self, pid_t};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, instrument, warn};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("File {0} not found.")]
    NotFound(String),
    #[error("An error happened during process activation of {executable}: {source}")]
    Spawn {
        executable: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum StopError {
    #[error("failed to signal process: {0}")]
    Signal(#[from] Errno),
    #[error("failed to reap process: {0}")]
    Wait(#[from] io::Error),
}

/// Launches children.
pub trait ProcessControl: Send + Sync {
    fn launch(&self, command: &SplitCommand) -> Result<Box<dyn ChildHandle>, LaunchError>;
}

/// A launched child, owned by the entry that started it.
#[async_trait]
pub trait ChildHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// Name the OS reports for the process.
    fn name(&self) -> String;

    fn has_exited(&mut self) -> bool;

    fn set_priority(&self, priority: Priority) -> io::Result<()>;

    /// Asks the child to exit, force-terminating it if it does not.
    async fn close(&mut self) -> Result<StopOutcome, StopError>;
}

#[derive(Debug, Clone)]
pub struct OsProcessControl {
    close_timeout: Duration,
}

impl OsProcessControl {
    pub fn new(close_timeout: Duration) -> Self {
        Self { close_timeout }
    }
}

impl ProcessControl for OsProcessControl {
    #[instrument(skip(self))]
    fn launch(&self, command: &SplitCommand) -> Result<Box<dyn ChildHandle>, LaunchError> {
        let argv = command.argv();
        // Own process group, so terminal signals aimed at us skip the children
        let child = Command::new(&command.executable)
            .args(&argv)
            .stdin(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|source| match source.kind() {
                io::ErrorKind::NotFound => LaunchError::NotFound(command.executable.clone()),
                _ => LaunchError::Spawn {
                    executable: command.executable.clone(),
                    source,
                },
            })?;

        let pid = child.id();
        let name = resolve_name(pid, &command.executable);
        debug!(?pid, name, "Child spawned");
        Ok(Box::new(OsChild {
            child,
            pid,
            name,
            close_timeout: self.close_timeout,
        }))
    }
}

struct OsChild {
    child: Child,
    pid: Option<u32>,
    name: String,
    close_timeout: Duration,
}

#[async_trait]
impl ChildHandle for OsChild {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(err) => {
                warn!(?err, pid = self.pid, "Unable to query child state");
                true
            }
        }
    }

    fn set_priority(&self, priority: Priority) -> io::Result<()> {
        let pid = self
            .pid
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "child has no pid"))?;
        let result =
            unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, priority.nice()) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<StopOutcome, StopError> {
        if self.child.try_wait()?.is_some() {
            return Ok(StopOutcome::AlreadyExited);
        }
        let Some(pid) = self.pid else {
            return Ok(StopOutcome::AlreadyExited);
        };

        match kill(Pid::from_raw(pid as pid_t), Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                self.child.wait().await?;
                return Ok(StopOutcome::AlreadyExited);
            }
            Err(err) => return Err(err.into()),
        }

        if let Ok(status) = tokio::time::timeout(self.close_timeout, self.child.wait()).await {
            let code = status?.code();
            debug!(pid, ?code, "Child closed");
            return Ok(StopOutcome::Closed);
        }

        warn!(pid, "Close timeout reached");
        self.child.kill().await?;
        Ok(StopOutcome::Killed)
    }
}

const NAME_ATTEMPTS: u32 = 50;

fn resolve_name(pid: Option<u32>, executable: &str) -> String {
    let spawner = read_comm("/proc/thread-self/comm");
    pid.and_then(|pid| exec_name(pid, spawner.as_deref()))
        .unwrap_or_else(|| {
            Path::new(executable)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| executable.to_string())
        })
}

/// Until exec completes the child still carries the spawning thread's name.
fn exec_name(pid: u32, spawner: Option<&str>) -> Option<String> {
    let path = format!("/proc/{pid}/comm");
    for _ in 0..NAME_ATTEMPTS {
        let comm = read_comm(&path)?;
        if spawner != Some(comm.as_str()) {
            return Some(comm);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    None
}

fn read_comm(path: &str) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|comm| comm.trim().to_string())
        .filter(|comm| !comm.is_empty())
}
