//! Applying a [`Testbed`] to the network.
//!
//! The actual rate limiting, delay emulation and congestion-control
//! changes live in a shell function library. This module only composes
//! calls into it.

use std::fmt::Write as _;
use std::process::{Command, Stdio};

use crate::core::errors::{MtbError, Result};
use crate::testbed::model::Testbed;

/// Reset/setup interface of the physical testbed.
pub trait Environment {
    /// Return the testbed to a neutral state. Idempotent.
    fn reset(&self, dry_run: bool) -> Result<()>;

    /// Apply `testbed` to the network.
    fn setup(&self, testbed: &Testbed, dry_run: bool) -> Result<()>;

    /// Kernel view of the options of the named queue discipline.
    fn aqm_options(&self, aqm_name: &str) -> Result<String>;

    /// Human-readable description of the configured testbed.
    fn describe(&self, testbed: &Testbed) -> Result<String> {
        let mut out = testbed.summary();
        if !testbed.aqm_name.is_empty() {
            let _ = write!(out, "\n  aqm options: {}", self.aqm_options(&testbed.aqm_name)?);
        }
        Ok(out)
    }
}

const RESET_FUNCTIONS: [&str; 5] = [
    "kill_all_traffic",
    "reset_aqm_client_edge",
    "reset_aqm_server_edge",
    "reset_all_hosts_edge",
    "reset_all_hosts_cc",
];

const HOSTS: [&str; 4] = ["CLIENTA", "CLIENTB", "SERVERA", "SERVERB"];

/// Runs the testbed function library through a shell.
#[derive(Debug, Clone)]
pub struct ShellEnvironment {
    shell: String,
    script: String,
}

impl ShellEnvironment {
    pub fn new(shell: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            script: script.into(),
        }
    }

    fn prelude(&self) -> String {
        format!("set -e\nsource {}\n", quote(&self.script))
    }

    /// Script run by [`Environment::reset`].
    #[must_use]
    pub fn reset_script(&self) -> String {
        let mut script = self.prelude();
        for function in RESET_FUNCTIONS {
            script.push_str(function);
            script.push('\n');
        }
        script
    }

    /// Script run by [`Environment::setup`].
    #[must_use]
    pub fn setup_script(&self, tb: &Testbed) -> String {
        let mut s = self.prelude();
        s.push_str("set_offloading off\n");
        let _ = writeln!(
            s,
            "configure_clients_edge {} {} {} {} {}",
            tb.bitrate,
            tb.rtt_clients,
            quote(&tb.aqm_name),
            quote(&tb.aqm_params),
            quote(&tb.netem_clients_params)
        );
        let _ = writeln!(
            s,
            "configure_server_edge $IP_SERVERA_MGMT $IP_AQM_SA $IFACE_SERVERA $IFACE_ON_SERVERA {} {}",
            tb.rtt_servera,
            quote(&tb.netem_servera_params)
        );
        let _ = writeln!(
            s,
            "configure_server_edge $IP_SERVERB_MGMT $IP_AQM_SB $IFACE_SERVERB $IFACE_ON_SERVERB {} {}",
            tb.rtt_serverb,
            quote(&tb.netem_serverb_params)
        );
        for (host, cc, ecn) in [
            ("CLIENTA", &tb.cc_a, tb.ecn_a),
            ("SERVERA", &tb.cc_a, tb.ecn_a),
            ("CLIENTB", &tb.cc_b, tb.ecn_b),
            ("SERVERB", &tb.cc_b, tb.ecn_b),
        ] {
            let _ = writeln!(
                s,
                "configure_host_cc $IP_{host}_MGMT {} {}",
                quote(cc),
                ecn.as_sysctl()
            );
        }
        s
    }

    fn execute(&self, action: &'static str, script: &str, dry_run: bool) -> Result<()> {
        tracing::debug!(action, shell = %self.shell, script, "testbed command");
        if dry_run {
            return Ok(());
        }
        let status = Command::new(&self.shell)
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .status()
            .map_err(|err| MtbError::Environment {
                action,
                details: format!("failed to start {}: {err}", self.shell),
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(MtbError::Environment {
                action,
                details: format!("script exited with {status}"),
            })
        }
    }

    fn capture(&self, action: &'static str, script: &str) -> Result<String> {
        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| MtbError::Environment {
                action,
                details: format!("failed to start {}: {err}", self.shell),
            })?;
        if !output.status.success() {
            return Err(MtbError::Environment {
                action,
                details: format!(
                    "script exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Environment for ShellEnvironment {
    fn reset(&self, dry_run: bool) -> Result<()> {
        self.execute("reset", &self.reset_script(), dry_run)
    }

    fn setup(&self, testbed: &Testbed, dry_run: bool) -> Result<()> {
        self.execute("setup", &self.setup_script(testbed), dry_run)
    }

    fn aqm_options(&self, aqm_name: &str) -> Result<String> {
        let script = format!("{}get_aqm_options {}\n", self.prelude(), quote(aqm_name));
        self.capture("aqm query", &script)
    }

    fn describe(&self, testbed: &Testbed) -> Result<String> {
        let mut out = testbed.summary();
        if !testbed.aqm_name.is_empty() {
            let _ = write!(out, "\n       ({})", self.aqm_options(&testbed.aqm_name)?);
        }
        for host in HOSTS {
            let script = format!("{}get_host_cc \"$IP_{host}_MGMT\"\n", self.prelude());
            let cc = self.capture("cc query", &script)?;
            let _ = write!(
                out,
                "\n  {}: {}",
                host.to_lowercase(),
                cc.split_whitespace().collect::<Vec<_>>().join(" ")
            );
        }
        Ok(out)
    }
}

/// Quote `raw` as a single shell word.
#[must_use]
pub fn quote(raw: &str) -> String {
    if !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return raw.to_string();
    }
    format!("'{}'", raw.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testbed::model::{EcnMode, NodePair};

    #[test]
    fn quoting() {
        assert_eq!(quote("pie"), "pie");
        assert_eq!(quote(""), "''");
        assert_eq!(quote("limit 1000"), "'limit 1000'");
        assert_eq!(quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn reset_script_runs_every_reset_function_in_order() {
        let env = ShellEnvironment::new("bash", "aqmt-testbed.sh");
        let script = env.reset_script();
        assert!(script.starts_with("set -e\nsource aqmt-testbed.sh\n"));
        let positions: Vec<_> = RESET_FUNCTIONS
            .iter()
            .map(|f| script.find(f).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn setup_script_carries_testbed_values() {
        let env = ShellEnvironment::new("bash", "aqmt-testbed.sh");
        let mut tb = Testbed::default();
        tb.set_aqm("pie", "ecn");
        tb.set_rtt(20, Some(40), 5);
        tb.set_cc(NodePair::B, "dctcp", EcnMode::Initiate);
        let script = env.setup_script(&tb);

        assert!(script.contains("set_offloading off\n"));
        assert!(script.contains("configure_clients_edge 1000000 5 pie ecn ''"));
        assert!(script.contains("$IFACE_ON_SERVERA 20 ''"));
        assert!(script.contains("$IFACE_ON_SERVERB 40 ''"));
        assert!(script.contains("configure_host_cc $IP_SERVERA_MGMT cubic 2"));
        assert!(script.contains("configure_host_cc $IP_CLIENTB_MGMT dctcp 1"));
        assert_eq!(script.matches("configure_host_cc").count(), 4);
    }

    #[cfg(unix)]
    #[test]
    fn failing_script_is_environment_error() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("lib.sh");
        std::fs::write(&lib, "kill_all_traffic() { return 3; }\n").unwrap();
        let env = ShellEnvironment::new("bash", lib.to_string_lossy());

        let err = env.reset(false).unwrap_err();
        assert_eq!(err.code(), "MTB-2001");
        assert!(err.is_branch_local());
        assert!(env.reset(true).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn aqm_options_reads_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("lib.sh");
        std::fs::write(&lib, "get_aqm_options() { echo \"limit 1000 $1\"; }\n").unwrap();
        let env = ShellEnvironment::new("bash", lib.to_string_lossy());
        assert_eq!(env.aqm_options("pie").unwrap(), "limit 1000 pie");
    }
}
