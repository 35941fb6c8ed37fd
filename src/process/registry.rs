//! Tracking of background processes spawned for a test.
//!
//! Processes started inside a terminal multiplexer are not our children,
//! so liveness is probed with signal 0 rather than a native child wait.

use std::thread;
use std::time::Duration;

use crate::core::errors::{MtbError, Result};

/// PIDs of background processes owned by the current walk.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessRegistry {
    pids: Vec<u32>,
}

impl ProcessRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `pid`. Adding the same PID twice is a no-op.
    pub fn add(&mut self, pid: u32) {
        if !self.pids.contains(&pid) {
            self.pids.push(pid);
        }
    }

    /// Stop tracking `pid` without signalling it.
    pub fn remove(&mut self, pid: u32) {
        self.pids.retain(|p| *p != pid);
    }

    #[must_use]
    pub fn contains(&self, pid: u32) -> bool {
        self.pids.contains(&pid)
    }

    #[must_use]
    pub fn pids(&self) -> &[u32] {
        &self.pids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }

    /// Terminate every tracked process and clear the registry. Processes
    /// that already exited are ignored. Returns how many were signalled.
    pub fn kill_all(&mut self) -> usize {
        let mut signalled = 0;
        for pid in self.pids.drain(..) {
            match terminate(pid) {
                Ok(true) => signalled += 1,
                Ok(false) => {}
                Err(err) => tracing::warn!(pid, error = %err, "failed to terminate process"),
            }
        }
        signalled
    }
}

/// Send SIGTERM to `pid`. `Ok(false)` when the process no longer exists.
///
/// A PID that leads its own process group has the whole group signalled,
/// so commands forked by a wrapping shell go down with it.
#[cfg(unix)]
pub fn terminate(pid: u32) -> Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill, killpg};

    let target = to_pid(pid)?;
    match killpg(target, Signal::SIGTERM) {
        Ok(()) => {
            tracing::debug!(pid, "sent SIGTERM to process group");
            return Ok(true);
        }
        // Not a group leader, or a member we may not signal.
        Err(Errno::ESRCH | Errno::EPERM) => {}
        Err(errno) => {
            return Err(MtbError::Process {
                context: "terminate",
                details: format!("killpg({pid}, SIGTERM): {errno}"),
            });
        }
    }
    match kill(target, Signal::SIGTERM) {
        Ok(()) => {
            tracing::debug!(pid, "sent SIGTERM");
            Ok(true)
        }
        Err(Errno::ESRCH) => Ok(false),
        Err(errno) => Err(MtbError::Process {
            context: "terminate",
            details: format!("kill({pid}, SIGTERM): {errno}"),
        }),
    }
}

#[cfg(not(unix))]
pub fn terminate(pid: u32) -> Result<bool> {
    Err(MtbError::Process {
        context: "terminate",
        details: format!("signalling pid {pid} is only supported on unix"),
    })
}

/// Whether `pid` refers to a live process.
///
/// A direct child that already exited is reaped here, so a zombie does
/// not count as running.
#[cfg(unix)]
#[must_use]
pub fn is_running(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};

    let Ok(target) = to_pid(pid) else {
        return false;
    };
    match waitpid(target, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => return true,
        Ok(_) => return false,
        // Not our child: fall through to the signal-0 probe.
        Err(_) => {}
    }
    match kill(target, None) {
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

/// An orphan that exited but was not reaped yet still answers signal 0.
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            stat.rsplit_once(") ")
                .map(|(_, rest)| rest.starts_with('Z'))
        })
        .unwrap_or(false)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

#[cfg(not(unix))]
#[must_use]
pub fn is_running(_pid: u32) -> bool {
    false
}

/// Block until `pid` is gone, polling every `poll`.
pub fn wait_for(pid: u32, poll: Duration) {
    while is_running(pid) {
        thread::sleep(poll);
    }
}

/// PID 0 and negative PIDs address process groups rather than a process.
#[cfg(unix)]
fn to_pid(pid: u32) -> Result<nix::unistd::Pid> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(nix::unistd::Pid::from_raw(raw)),
        _ => Err(MtbError::Process {
            context: "pid",
            details: format!("pid {pid} does not name a single process"),
        }),
    }
}
