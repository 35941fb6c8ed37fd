//! Capture and analysis collaborators.
//!
//! The capture binary records per-sample queue statistics for the traffic
//! between the client subnet and the two server subnets. Analysis is an
//! external command run over a finished test folder.

use std::path::Path;
use std::process::{Command, Stdio};

use regex::Regex;

use crate::core::config::{AnalysisConfig, CaptureConfig};
use crate::core::errors::{MtbError, Result};
use crate::testbed::environment::quote;
use crate::testbed::model::Testbed;

/// `/24` network of an IPv4 address, e.g. `10.25.1.7` -> `10.25.1.0`.
pub fn subnet_of(addr: &str) -> Result<String> {
    let pattern = Regex::new(r"^(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.\d{1,3}$").map_err(|err| {
        MtbError::InvalidConfig {
            details: format!("address pattern: {err}"),
        }
    })?;
    let caps = pattern
        .captures(addr.trim())
        .ok_or_else(|| MtbError::InvalidConfig {
            details: format!("capture address {addr:?} is not an IPv4 address"),
        })?;
    for octet in [&caps[1], &caps[2], &caps[3]] {
        if octet.parse::<u16>().map_or(true, |v| v > 255) {
            return Err(MtbError::InvalidConfig {
                details: format!("capture address {addr:?} has an octet out of range"),
            });
        }
    }
    Ok(format!("{}.{}.{}.0", &caps[1], &caps[2], &caps[3]))
}

/// Packet filter selecting server-to-client traffic.
pub fn capture_filter(cfg: &CaptureConfig) -> Result<String> {
    let client = subnet_of(&cfg.client_addr)?;
    let servera = subnet_of(&cfg.servera_addr)?;
    let serverb = subnet_of(&cfg.serverb_addr)?;
    Ok(format!(
        "ip and dst net {client}/24 and (src net {servera}/24 or src net {serverb}/24) and (tcp or udp)"
    ))
}

/// Shell command that records one test's samples into `<test>/ta`.
///
/// The analyzer replaces the wrapping shell, so the launcher's PID is the
/// capture itself.
pub fn capture_command(cfg: &CaptureConfig, test_folder: &Path, tb: &Testbed) -> Result<String> {
    let filter = capture_filter(cfg)?;
    let out_dir = test_folder.join("ta");
    let out_dir = quote(&out_dir.to_string_lossy());
    let sudo = if cfg.use_sudo { "sudo " } else { "" };
    Ok(format!(
        "mkdir -p {out_dir} && exec {sudo}{} {} {} {out_dir} {} {}",
        quote(&cfg.analyzer.to_string_lossy()),
        quote(&cfg.interface),
        quote(&filter),
        tb.capture_interval_ms,
        tb.total_capture_samples()
    ))
}

/// Post-processing of a finished test.
pub trait Analysis {
    /// Analyze the data in `test_folder`, discarding the first
    /// `samples_to_skip` samples.
    fn analyze(&self, test_folder: &Path, samples_to_skip: u64) -> Result<()>;
}

/// Runs a command template with `{folder}` and `{skip}` substituted.
#[derive(Debug, Clone)]
pub struct CommandAnalysis {
    shell: String,
    template: String,
}

impl CommandAnalysis {
    pub fn new(shell: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            template: template.into(),
        }
    }

    /// Build from config; `None` when no analysis command is configured.
    pub fn from_config(shell: &str, cfg: &AnalysisConfig) -> Option<Self> {
        cfg.command
            .as_deref()
            .filter(|cmd| !cmd.trim().is_empty())
            .map(|cmd| Self::new(shell, cmd))
    }

    #[must_use]
    pub fn render(&self, test_folder: &Path, samples_to_skip: u64) -> String {
        self.template
            .replace("{folder}", &quote(&test_folder.to_string_lossy()))
            .replace("{skip}", &samples_to_skip.to_string())
    }
}

impl Analysis for CommandAnalysis {
    fn analyze(&self, test_folder: &Path, samples_to_skip: u64) -> Result<()> {
        let cmd = self.render(test_folder, samples_to_skip);
        tracing::debug!(cmd, "analysis command");
        let status = Command::new(&self.shell)
            .arg("-c")
            .arg(&cmd)
            .stdin(Stdio::null())
            .status()
            .map_err(|err| MtbError::Process {
                context: "analysis",
                details: format!("failed to start {}: {err}", self.shell),
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(MtbError::Process {
                context: "analysis",
                details: format!("{cmd} exited with {status}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn capture_cfg() -> CaptureConfig {
        CaptureConfig {
            analyzer: PathBuf::from("/opt/aqmt/ta/analyzer"),
            interface: "eth1".to_string(),
            use_sudo: true,
            client_addr: "10.25.1.7".to_string(),
            servera_addr: "10.25.2.21".to_string(),
            serverb_addr: "10.25.3.1".to_string(),
        }
    }

    #[test]
    fn subnet_masks_last_octet() {
        assert_eq!(subnet_of("192.168.4.200").unwrap(), "192.168.4.0");
        assert!(subnet_of("fe80::1").is_err());
        assert!(subnet_of("300.1.1.1").is_err());
    }

    #[test]
    fn filter_selects_servers_to_clients() {
        assert_eq!(
            capture_filter(&capture_cfg()).unwrap(),
            "ip and dst net 10.25.1.0/24 and (src net 10.25.2.0/24 or src net 10.25.3.0/24) and (tcp or udp)"
        );
    }

    #[test]
    fn command_records_skip_plus_samples() {
        let tb = Testbed {
            capture_idle: Some(3.0),
            capture_samples: 100,
            ..Testbed::default()
        };
        let cmd = capture_command(&capture_cfg(), Path::new("/results/rtt-10/test"), &tb).unwrap();
        assert!(cmd.starts_with("mkdir -p /results/rtt-10/test/ta && exec sudo /opt/aqmt/ta/analyzer eth1 'ip and"));
        assert!(cmd.ends_with("/results/rtt-10/test/ta 1000 103"));
    }

    #[test]
    fn command_without_sudo() {
        let cfg = CaptureConfig {
            use_sudo: false,
            ..capture_cfg()
        };
        let cmd = capture_command(&cfg, Path::new("/r/test"), &Testbed::default()).unwrap();
        assert!(!cmd.contains("sudo"));
    }

    #[test]
    fn analysis_template_substitution() {
        let analysis = CommandAnalysis::new("sh", "analyze {folder} --skip {skip}");
        assert_eq!(
            analysis.render(Path::new("/r/my test"), 8),
            "analyze '/r/my test' --skip 8"
        );
        let none = CommandAnalysis::from_config("sh", &AnalysisConfig { command: None });
        assert!(none.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn analysis_runs_command() {
        let dir = tempfile::tempdir().unwrap();
        let analysis = CommandAnalysis::new("sh", "echo {skip} > {folder}/skipped");
        analysis.analyze(dir.path(), 12).unwrap();
        let written = std::fs::read_to_string(dir.path().join("skipped")).unwrap();
        assert_eq!(written.trim(), "12");

        let failing = CommandAnalysis::new("sh", "exit 4");
        assert_eq!(failing.analyze(dir.path(), 0).unwrap_err().code(), "MTB-3001");
    }
}
