//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{MtbError, Result};
use crate::testbed::model::Testbed;

/// Full runner configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Initial testbed state every plan walk starts from.
    pub testbed: Testbed,
    pub environment: EnvironmentConfig,
    pub capture: CaptureConfig,
    pub analysis: AnalysisConfig,
    pub run: RunConfig,
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
}

/// How the testbed reset/setup scripts are invoked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub shell: String,
    /// Script sourced before calling its reset/setup functions.
    pub testbed_script: String,
}

/// Capture collaborator invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CaptureConfig {
    pub analyzer: PathBuf,
    pub interface: String,
    pub use_sudo: bool,
    /// Address on the client subnet (last octet is masked).
    pub client_addr: String,
    pub servera_addr: String,
    pub serverb_addr: String,
}

/// External analysis collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Command template; `{folder}` and `{skip}` are substituted.
    pub command: Option<String>,
}

/// Walk behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunConfig {
    pub interactive: bool,
    pub ask_confirmation: bool,
    pub retest: bool,
    pub reanalyze: bool,
    /// Window after a cancelled test during which a second signal discards it.
    pub grace_period_ms: u64,
    /// Sleep after each test so emulated queues drain.
    pub cooldown: bool,
    pub poll_interval_ms: u64,
    /// Speedometer refresh in interactive mode.
    pub monitor_interval_ms: u64,
}

/// Logging knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

/// Filesystem paths used by mtb.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub journal: PathBuf,
    pub journal_fallback: Option<PathBuf>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            shell: "bash".to_string(),
            testbed_script: "aqmt-testbed.sh".to_string(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            analyzer: PathBuf::from("ta/analyzer"),
            interface: "eth0".to_string(),
            use_sudo: true,
            client_addr: "10.25.1.1".to_string(),
            servera_addr: "10.25.2.1".to_string(),
            serverb_addr: "10.25.3.1".to_string(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            interactive: false,
            ask_confirmation: true,
            retest: false,
            reanalyze: false,
            grace_period_ms: 5_000,
            cooldown: true,
            poll_interval_ms: 300,
            monitor_interval_ms: 50,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!(
                    "[MTB-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths"
                );
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        let cfg = home_dir.join(".config").join("mtb").join("config.toml");
        let data = home_dir.join(".local").join("share").join("mtb");
        Self {
            config_file: cfg,
            journal: data.join("runs.jsonl"),
            journal_fallback: Some(PathBuf::from("/dev/shm/mtb.jsonl")),
        }
    }
}

impl RunConfig {
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| MtbError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(MtbError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("MTB_INTERACTIVE") {
            self.run.interactive = parse_env_bool("MTB_INTERACTIVE", &raw)?;
        }

        // Skipping the prompt is the only thing this variable can express.
        if let Some(raw) = lookup("MTB_NO_ASK")
            && parse_env_bool("MTB_NO_ASK", &raw)?
        {
            self.run.ask_confirmation = false;
        }

        if let Some(raw) = lookup("MTB_RETEST") {
            self.run.retest = parse_env_bool("MTB_RETEST", &raw)?;
        }

        if let Some(raw) = lookup("MTB_REANALYZE") {
            self.run.reanalyze = parse_env_bool("MTB_REANALYZE", &raw)?;
        }

        if let Some(raw) = lookup("MTB_LOG_LEVEL") {
            self.logging.level = raw.trim().to_ascii_lowercase();
        }

        if let Some(raw) = lookup("MTB_JOURNAL") {
            self.paths.journal = PathBuf::from(raw);
        }

        if let Some(raw) = lookup("MTB_CAPTURE_INTERFACE") {
            self.capture.interface = raw;
        }

        if let Some(raw) = lookup("MTB_TESTBED_SCRIPT") {
            self.environment.testbed_script = raw;
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.testbed.capture_interval_ms == 0 {
            return Err(MtbError::InvalidConfig {
                details: "testbed.capture_interval_ms must be >= 1".to_string(),
            });
        }
        if self.testbed.capture_samples == 0 {
            return Err(MtbError::InvalidConfig {
                details: "testbed.capture_samples must be >= 1".to_string(),
            });
        }
        if let Some(idle) = self.testbed.capture_idle
            && !(idle.is_finite() && idle >= 0.0)
        {
            return Err(MtbError::InvalidConfig {
                details: format!("testbed.capture_idle must be a non-negative number, got {idle}"),
            });
        }
        if self.run.poll_interval_ms == 0 {
            return Err(MtbError::InvalidConfig {
                details: "run.poll_interval_ms must be >= 1".to_string(),
            });
        }
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(MtbError::InvalidConfig {
                details: format!(
                    "logging.level must be one of {LOG_LEVELS:?}, got {:?}",
                    self.logging.level
                ),
            });
        }
        if self.environment.shell.trim().is_empty() {
            return Err(MtbError::InvalidConfig {
                details: "environment.shell must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(MtbError::ConfigParse {
            context: "env",
            details: format!("{name}={other:?}: expected a boolean"),
        }),
    }
}
