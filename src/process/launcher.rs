//! Starting background and monitor processes.
//!
//! [`ShellLauncher`] runs commands as detached children of the
//! orchestrator. [`TmuxLauncher`] runs them in panes of the surrounding
//! tmux session so an operator can watch them; the returned PID is then
//! the pane's shell, which is not our child.

use std::env;
use std::process::{Child, Command, Stdio};

use parking_lot::Mutex;

use crate::core::errors::{MtbError, Result};

/// Something that can start shell commands and hand back a PID.
pub trait Launcher {
    /// Start `cmd` in the background with no terminal attached.
    fn run_bg(&self, cmd: &str) -> Result<u32>;

    /// Start `cmd` where the operator can see it.
    fn run_fg(&self, cmd: &str) -> Result<u32>;

    /// Release terminal resources left by finished commands.
    fn cleanup(&self);
}

/// Runs commands through `<shell> -c`.
#[derive(Debug)]
pub struct ShellLauncher {
    shell: String,
    children: Mutex<Vec<Child>>,
}

impl ShellLauncher {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            children: Mutex::new(Vec::new()),
        }
    }

    fn spawn(&self, cmd: &str, quiet: bool) -> Result<u32> {
        let mut command = Command::new(&self.shell);
        command.arg("-c").arg(cmd).stdin(Stdio::null());
        // Own group: terminal signals stay with the orchestrator, and
        // terminating the PID reaches everything the shell forked.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        if quiet {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
        let child = command.spawn().map_err(|err| MtbError::Process {
            context: "spawn",
            details: format!("{} -c {cmd:?}: {err}", self.shell),
        })?;
        let pid = child.id();
        tracing::trace!(pid, cmd, "spawned");
        self.children.lock().push(child);
        Ok(pid)
    }
}

impl Launcher for ShellLauncher {
    fn run_bg(&self, cmd: &str) -> Result<u32> {
        self.spawn(cmd, true)
    }

    fn run_fg(&self, cmd: &str) -> Result<u32> {
        self.spawn(cmd, false)
    }

    fn cleanup(&self) {
        // Reap finished children; a child already reaped elsewhere reports
        // an error here and is dropped as well.
        self.children
            .lock()
            .retain_mut(|child| matches!(child.try_wait(), Ok(None)));
    }
}

/// Runs commands in panes of the current tmux session.
#[derive(Debug)]
pub struct TmuxLauncher {
    window: String,
    session: String,
    bg_window: Mutex<Option<String>>,
}

impl TmuxLauncher {
    /// Attach to the tmux session this process runs in.
    pub fn from_env() -> Result<Self> {
        let pane = env::var("TMUX_PANE")
            .ok()
            .filter(|_| env::var_os("TMUX").is_some())
            .ok_or_else(|| MtbError::Process {
                context: "tmux",
                details: "interactive mode must run inside a tmux session".to_string(),
            })?;
        let window = tmux(&["display-message", "-p", "-t", &pane, "#{window_id}"])?;
        let session = tmux(&["display-message", "-p", "-t", &pane, "#{session_id}"])?;
        tmux(&["set-window-option", "-t", &window, "remain-on-exit", "on"])?;
        let launcher = Self {
            window,
            session,
            bg_window: Mutex::new(None),
        };
        launcher.cleanup();
        Ok(launcher)
    }

    fn first_pane(window: &str) -> Result<String> {
        let panes = tmux(&["list-panes", "-a", "-F", "#{window_id} #{pane_id}"])?;
        panes
            .lines()
            .filter_map(|line| line.split_once(' '))
            .find(|(win, _)| *win == window)
            .map(|(_, pane)| pane.to_string())
            .ok_or_else(|| MtbError::Process {
                context: "tmux",
                details: format!("no pane found in window {window}"),
            })
    }

    fn window_exists(window: &str) -> bool {
        tmux(&["list-windows", "-a", "-F", "#{window_id}"])
            .is_ok_and(|out| out.lines().any(|line| line == window))
    }

    fn split(window: &str, cmd: &str) -> Result<u32> {
        let pane = Self::first_pane(window)?;
        let pid = tmux(&["split-window", "-d", "-P", "-t", &pane, "-F", "#{pane_pid}", cmd])?;
        tmux(&["select-layout", "-t", window, "tiled"])?;
        parse_pid(&pid)
    }
}

impl Launcher for TmuxLauncher {
    fn run_bg(&self, cmd: &str) -> Result<u32> {
        let mut bg = self.bg_window.lock();
        if let Some(window) = bg.as_deref()
            && Self::window_exists(window)
        {
            let pid = Self::split(window, cmd)?;
            tracing::trace!(pid, cmd, "spawned in tmux background window");
            return Ok(pid);
        }

        let out = tmux(&[
            "new-window",
            "-a",
            "-d",
            "-P",
            "-t",
            &self.window,
            "-F",
            "#{window_id} #{pane_pid}",
            cmd,
        ])?;
        let (window, pid) = out.split_once(' ').ok_or_else(|| MtbError::Process {
            context: "tmux",
            details: format!("unexpected new-window output {out:?}"),
        })?;
        tmux(&["set-window-option", "-t", window, "remain-on-exit", "on"])?;
        *bg = Some(window.to_string());
        let pid = parse_pid(pid)?;
        tracing::trace!(pid, cmd, "spawned in new tmux background window");
        Ok(pid)
    }

    fn run_fg(&self, cmd: &str) -> Result<u32> {
        let pid = Self::split(&self.window, cmd)?;
        tracing::trace!(pid, cmd, "spawned in tmux pane");
        Ok(pid)
    }

    fn cleanup(&self) {
        let Ok(panes) = tmux(&["list-panes", "-s", "-t", &self.session, "-F", "#{pane_dead} #{pane_id}"])
        else {
            return;
        };
        for pane in panes
            .lines()
            .filter_map(|line| line.strip_prefix("1 "))
        {
            if let Err(err) = tmux(&["kill-pane", "-t", pane]) {
                tracing::debug!(pane, error = %err, "failed to kill dead pane");
            }
        }
    }
}

fn tmux(args: &[&str]) -> Result<String> {
    let output = Command::new("tmux")
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|err| MtbError::Process {
            context: "tmux",
            details: err.to_string(),
        })?;
    if !output.status.success() {
        return Err(MtbError::Process {
            context: "tmux",
            details: format!(
                "tmux {} exited with {}: {}",
                args.first().unwrap_or(&""),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn parse_pid(raw: &str) -> Result<u32> {
    raw.trim().parse().map_err(|_| MtbError::Process {
        context: "tmux",
        details: format!("invalid pane pid {raw:?}"),
    })
}
