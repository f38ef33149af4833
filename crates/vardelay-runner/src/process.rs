//! Handles to the run's long-lived child processes and the signal/reap layer
//! the supervisor drives them through.

use std::io;
use std::process::{Child, ChildStderr, Command, ExitStatus, Stdio};

use tracing::debug;

use crate::error::{Result, RunError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
    Kill,
}

impl Signal {
    fn raw(self) -> libc::c_int {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Signal::Interrupt => "INT",
            Signal::Terminate => "TERM",
            Signal::Kill => "KILL",
        }
    }
}

/// Whether a signal goes to the process alone or to its whole group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalTarget {
    Process,
    Group,
}

/// A spawned child. Children are started in their own process group, so the
/// pid doubles as the group id.
#[derive(Debug)]
pub struct ProcessHandle {
    label: String,
    pid: u32,
    child: Option<Child>,
}

impl ProcessHandle {
    /// Spawn `cmd` with stdin and stdout detached.
    pub fn spawn(mut cmd: Command, label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|source| RunError::Spawn {
                what: label.clone(),
                source,
            })?;
        debug!(%label, pid = child.id(), "spawned");
        Ok(Self {
            label,
            pid: child.id(),
            child: Some(child),
        })
    }

    /// A handle with no child behind it, for exercising the process layer.
    #[cfg(test)]
    pub(crate) fn detached(label: &str, pid: u32) -> Self {
        Self {
            label: label.to_string(),
            pid,
            child: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.as_mut().and_then(|c| c.stderr.take())
    }
}

/// Signals and reaps processes. The supervisor only talks to processes
/// through this trait.
pub trait ProcessOps {
    /// A target that no longer exists fails with `io::ErrorKind::NotFound`.
    fn signal(&mut self, handle: &ProcessHandle, target: SignalTarget, signal: Signal)
        -> io::Result<()>;

    /// Wait for `handle` to exit.
    fn reap(&mut self, handle: &mut ProcessHandle) -> io::Result<Option<ExitStatus>>;
}

/// The real process layer: `kill(2)`/`killpg(2)` and `waitpid(2)`.
///
/// Children running under `sudo` belong to root; when a plain `kill` is
/// refused the signal is resent through `sudo kill`.
#[derive(Debug, Default)]
pub struct SystemProcesses;

impl ProcessOps for SystemProcesses {
    fn signal(
        &mut self,
        handle: &ProcessHandle,
        target: SignalTarget,
        signal: Signal,
    ) -> io::Result<()> {
        let pid = handle.pid as libc::pid_t;
        // SAFETY: kill/killpg only take plain integers.
        let rc = unsafe {
            match target {
                SignalTarget::Process => libc::kill(pid, signal.raw()),
                SignalTarget::Group => libc::killpg(pid, signal.raw()),
            }
        };
        if rc == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => Err(io::Error::new(io::ErrorKind::NotFound, err)),
            Some(libc::EPERM) => sudo_kill(handle.pid, target, signal),
            _ => Err(err),
        }
    }

    fn reap(&mut self, handle: &mut ProcessHandle) -> io::Result<Option<ExitStatus>> {
        match handle.child.as_mut() {
            Some(child) => child.wait().map(Some),
            None => Ok(None),
        }
    }
}

fn sudo_kill(pid: u32, target: SignalTarget, signal: Signal) -> io::Result<()> {
    let target = match target {
        SignalTarget::Process => pid.to_string(),
        SignalTarget::Group => format!("-{pid}"),
    };
    let output = Command::new("sudo")
        .args(["kill", "-s", signal.name(), "--", &target])
        .output()?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("No such process") {
        Err(io::Error::new(io::ErrorKind::NotFound, stderr.trim().to_string()))
    } else {
        Err(io::Error::other(stderr.trim().to_string()))
    }
}
