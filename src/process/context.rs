//! Per-run orchestrator state and the termination-signal watcher.
//!
//! The context owns the process registry, the currently active capture
//! PID and the exiting flag. Signals are observed on a watcher thread,
//! which is why the registry sits behind a mutex.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use signal_hook::consts::{SIGINT, SIGTERM};

use crate::core::errors::{MtbError, Result};
use crate::process::registry::{self, ProcessRegistry};

/// Exit status used when a run is aborted by a signal.
pub const EXIT_CANCELLED: i32 = 130;

#[derive(Debug, Default)]
struct Tracked {
    registry: ProcessRegistry,
    capture: Option<u32>,
}

/// What happened in response to a termination signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// Only the active capture was stopped; the current test finishes.
    CaptureTerminated { pid: u32 },
    /// No capture was running; everything was killed and the run must end.
    ExitNow { killed: usize },
}

/// Shared state of one orchestrator run.
#[derive(Debug, Default)]
pub struct OrchestratorContext {
    tracked: Mutex<Tracked>,
    exiting: AtomicBool,
}

impl OrchestratorContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a background process.
    pub fn register(&self, pid: u32) {
        self.tracked.lock().registry.add(pid);
    }

    pub fn unregister(&self, pid: u32) {
        self.tracked.lock().registry.remove(pid);
    }

    /// Snapshot of the tracked PIDs.
    #[must_use]
    pub fn registered(&self) -> Vec<u32> {
        self.tracked.lock().registry.pids().to_vec()
    }

    /// Mark `pid` as the running capture process and track it.
    pub fn set_capture(&self, pid: u32) {
        let mut tracked = self.tracked.lock();
        tracked.registry.add(pid);
        tracked.capture = Some(pid);
    }

    /// Forget the active capture, e.g. after it exited.
    pub fn clear_capture(&self) {
        let mut tracked = self.tracked.lock();
        if let Some(pid) = tracked.capture.take() {
            tracked.registry.remove(pid);
        }
    }

    #[must_use]
    pub fn capture(&self) -> Option<u32> {
        self.tracked.lock().capture
    }

    /// Terminate all tracked processes and clear the registry.
    pub fn kill_all(&self) -> usize {
        let mut tracked = self.tracked.lock();
        tracked.capture = None;
        tracked.registry.kill_all()
    }

    #[must_use]
    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    pub fn mark_exiting(&self) {
        self.exiting.store(true, Ordering::SeqCst);
    }

    /// Fail with [`MtbError::Cancelled`] once the exiting flag is set.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_exiting() {
            Err(MtbError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// React to SIGINT/SIGTERM.
    ///
    /// With a capture running, only the capture is stopped and the flag is
    /// set so the test in progress can still finish. Otherwise all tracked
    /// processes are killed and the caller must end the process.
    pub fn on_termination_signal(&self) -> SignalOutcome {
        let mut tracked = self.tracked.lock();
        if let Some(pid) = tracked.capture {
            self.exiting.store(true, Ordering::SeqCst);
            if let Err(err) = registry::terminate(pid) {
                tracing::warn!(pid, error = %err, "failed to stop capture process");
            }
            return SignalOutcome::CaptureTerminated { pid };
        }
        self.exiting.store(true, Ordering::SeqCst);
        tracked.capture = None;
        let killed = tracked.registry.kill_all();
        SignalOutcome::ExitNow { killed }
    }
}

// ──────────────────── signal watcher ────────────────────

/// Background thread turning SIGINT/SIGTERM into context transitions.
///
/// Stops polling when dropped.
pub struct SignalWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SignalWatcher {
    /// Register the signal hooks and start watching.
    ///
    /// `on_exit` runs before the process exits on an [`SignalOutcome::ExitNow`].
    pub fn install<F>(ctx: Arc<OrchestratorContext>, poll: Duration, on_exit: F) -> Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let pending = Arc::new(AtomicBool::new(false));
        for signal in [SIGINT, SIGTERM] {
            signal_hook::flag::register(signal, Arc::clone(&pending)).map_err(|err| {
                MtbError::Process {
                    context: "signal registration",
                    details: format!("signal {signal}: {err}"),
                }
            })?;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("mtb-signals".to_string())
            .spawn(move || {
                while !thread_stop.load(Ordering::Relaxed) {
                    if pending.swap(false, Ordering::Relaxed) {
                        match ctx.on_termination_signal() {
                            SignalOutcome::CaptureTerminated { pid } => {
                                tracing::warn!(
                                    pid,
                                    "interrupted: stopped capture, finishing current test before exit"
                                );
                            }
                            SignalOutcome::ExitNow { killed } => {
                                tracing::error!(killed, "interrupted: killed tracked processes, exiting");
                                on_exit();
                                std::process::exit(EXIT_CANCELLED);
                            }
                        }
                    }
                    thread::sleep(poll);
                }
            })
            .map_err(|err| MtbError::Process {
                context: "signal watcher",
                details: err.to_string(),
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for SignalWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::process::ExitStatusExt;
    use std::process::{Child, Command, Stdio};

    use super::*;

    fn sleeper() -> Child {
        Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .unwrap()
    }

    #[test]
    fn signal_during_capture_stops_only_capture() {
        let ctx = OrchestratorContext::new();
        let mut capture = sleeper();
        let mut traffic = sleeper();
        ctx.set_capture(capture.id());
        ctx.register(traffic.id());

        let outcome = ctx.on_termination_signal();
        assert_eq!(outcome, SignalOutcome::CaptureTerminated { pid: capture.id() });
        assert!(ctx.is_exiting());
        assert_eq!(capture.wait().unwrap().signal(), Some(15));
        assert_eq!(traffic.try_wait().unwrap(), None);

        ctx.clear_capture();
        assert_eq!(ctx.registered(), [traffic.id()]);
        assert_eq!(ctx.kill_all(), 1);
        assert!(ctx.registered().is_empty());
        traffic.wait().unwrap();
    }

    #[test]
    fn signal_without_capture_kills_everything() {
        let ctx = OrchestratorContext::new();
        let mut a = sleeper();
        let mut b = sleeper();
        ctx.register(a.id());
        ctx.register(b.id());

        assert_eq!(ctx.on_termination_signal(), SignalOutcome::ExitNow { killed: 2 });
        assert!(ctx.registered().is_empty());
        assert_eq!(a.wait().unwrap().signal(), Some(15));
        assert_eq!(b.wait().unwrap().signal(), Some(15));
    }

    #[test]
    fn check_cancelled_follows_flag() {
        let ctx = OrchestratorContext::new();
        assert!(ctx.check_cancelled().is_ok());
        ctx.mark_exiting();
        assert_eq!(ctx.check_cancelled().unwrap_err().code(), "MTB-3901");
    }
}
