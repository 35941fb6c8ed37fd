//! Collaborators and knobs shared by every test of a walk.

use std::time::Duration;

use crate::core::config::{CaptureConfig, RunConfig};
use crate::process::context::OrchestratorContext;
use crate::process::launcher::Launcher;
use crate::testbed::capture::Analysis;
use crate::testbed::environment::Environment;

/// Walk behavior resolved from `[run]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub interactive: bool,
    pub ask_confirmation: bool,
    /// Rerun tests that already collected data.
    pub retest: bool,
    /// Analyze again tests that were already analyzed.
    pub reanalyze: bool,
    pub grace_period: Duration,
    pub cooldown: bool,
    pub poll_interval: Duration,
    pub monitor_interval: Duration,
}

impl RunOptions {
    #[must_use]
    pub fn from_config(cfg: &RunConfig) -> Self {
        Self {
            interactive: cfg.interactive,
            ask_confirmation: cfg.ask_confirmation,
            retest: cfg.retest,
            reanalyze: cfg.reanalyze,
            grace_period: cfg.grace_period(),
            cooldown: cfg.cooldown,
            poll_interval: cfg.poll_interval(),
            monitor_interval: Duration::from_millis(cfg.monitor_interval_ms),
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from_config(&RunConfig::default())
    }
}

/// Everything a test needs besides its own folder and testbed.
pub struct Runtime<'a> {
    pub ctx: &'a OrchestratorContext,
    pub environment: &'a dyn Environment,
    pub launcher: &'a dyn Launcher,
    pub capture: &'a CaptureConfig,
    pub analysis: Option<&'a dyn Analysis>,
    pub options: RunOptions,
}
