//! Desired physical testbed configuration.
//!
//! A `Testbed` is mutated in place by steps as the plan walk proceeds and is
//! applied to the real network by the [`Environment`](super::environment::Environment)
//! collaborator right before each test.

#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bits per megabit, as used by link-rate axes.
pub const MBIT: u64 = 1_000_000;

/// ECN mode configured on an endpoint pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EcnMode {
    Disabled,
    Initiate,
    Allow,
}

impl EcnMode {
    /// Numeric value understood by the testbed scripts.
    #[must_use]
    pub const fn as_sysctl(self) -> u8 {
        match self {
            Self::Disabled => 0,
            Self::Initiate => 1,
            Self::Allow => 2,
        }
    }
}

/// Endpoint pair selector for congestion-control settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodePair {
    A,
    B,
}

impl fmt::Display for NodePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => f.write_str("a"),
            Self::B => f.write_str("b"),
        }
    }
}

/// Testbed configuration threaded through one plan walk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Testbed {
    /// Link rate applied from router to clients, in bit/s.
    pub bitrate: u64,
    /// Emulated RTT between clients and router (ms).
    pub rtt_clients: u32,
    /// Emulated RTT between server A and router (ms).
    pub rtt_servera: u32,
    /// Emulated RTT between server B and router (ms).
    pub rtt_serverb: u32,
    pub netem_clients_params: String,
    pub netem_servera_params: String,
    pub netem_serverb_params: String,
    pub aqm_name: String,
    pub aqm_params: String,
    pub cc_a: String,
    pub ecn_a: EcnMode,
    pub cc_b: String,
    pub ecn_b: EcnMode,
    /// Seconds of initial capture to discard. `None` derives it from RTT.
    pub capture_idle: Option<f64>,
    /// Capture sampling interval (ms).
    pub capture_interval_ms: u64,
    /// Number of samples kept after the idle period.
    pub capture_samples: u64,
    /// Next port handed out to traffic generators.
    pub traffic_port: u16,
}

impl Default for Testbed {
    fn default() -> Self {
        Self {
            bitrate: MBIT,
            rtt_clients: 0,
            rtt_servera: 0,
            rtt_serverb: 0,
            netem_clients_params: String::new(),
            netem_servera_params: String::new(),
            netem_serverb_params: String::new(),
            // The instrumented pfifo is needed to observe queue delay at all.
            aqm_name: "pfifo_aqmt".to_string(),
            aqm_params: String::new(),
            cc_a: "cubic".to_string(),
            ecn_a: EcnMode::Allow,
            cc_b: "cubic".to_string(),
            ecn_b: EcnMode::Allow,
            capture_idle: None,
            capture_interval_ms: 1_000,
            capture_samples: 250,
            traffic_port: 5_500,
        }
    }
}

impl Testbed {
    /// Select the queue discipline. `pfifo` maps to the instrumented variant.
    pub fn set_aqm(&mut self, name: &str, params: &str) {
        self.aqm_name = if name == "pfifo" {
            "pfifo_aqmt".to_string()
        } else {
            name.to_string()
        };
        self.aqm_params = params.to_string();
    }

    /// Configure congestion control and ECN for one endpoint pair.
    pub fn set_cc(&mut self, pair: NodePair, cc: &str, ecn: EcnMode) {
        match pair {
            NodePair::A => {
                self.cc_a = cc.to_string();
                self.ecn_a = ecn;
            }
            NodePair::B => {
                self.cc_b = cc.to_string();
                self.ecn_b = ecn;
            }
        }
    }

    /// Set the server RTTs (B defaults to A) and the client-side RTT.
    pub fn set_rtt(&mut self, servera: u32, serverb: Option<u32>, clients: u32) {
        self.rtt_servera = servera;
        self.rtt_serverb = serverb.unwrap_or(servera);
        self.rtt_clients = clients;
    }

    /// Largest emulated RTT across all configured paths (ms).
    #[must_use]
    pub fn max_rtt_ms(&self) -> u32 {
        self.rtt_clients.max(self.rtt_servera).max(self.rtt_serverb)
    }

    /// Seconds of initial capture discarded while flows ramp up.
    #[must_use]
    pub fn idle_secs(&self) -> f64 {
        self.capture_idle
            .unwrap_or_else(|| f64::from(self.max_rtt_ms()) / 1000.0 * 40.0 + 4.0)
    }

    /// Number of initial capture samples to discard before aggregating.
    #[must_use]
    pub fn samples_to_skip(&self) -> u64 {
        let idle_secs = self.idle_secs();
        let interval = self.capture_interval_ms.max(1) as f64;
        (idle_secs * 1000.0 / interval).ceil().max(0.0) as u64
    }

    /// Total samples the capture process is asked to record.
    #[must_use]
    pub fn total_capture_samples(&self) -> u64 {
        self.capture_samples + self.samples_to_skip()
    }

    /// Cooldown after a test so in-flight emulated delay drains.
    #[must_use]
    pub fn post_wait_time(&self) -> Duration {
        Duration::from_secs_f64(f64::from(self.max_rtt_ms()) / 1000.0 * 5.0 + 2.0)
    }

    /// Advisory run time for one test. Excludes time spent in hooks.
    #[must_use]
    pub fn estimated_run_time(&self) -> Duration {
        let capture_ms = self.total_capture_samples() * self.capture_interval_ms;
        Duration::from_millis(capture_ms) + self.post_wait_time() + Duration::from_secs(1)
    }

    /// Hand out the next traffic port.
    pub fn next_traffic_port(&mut self) -> u16 {
        let port = self.traffic_port;
        self.traffic_port = self.traffic_port.wrapping_add(1);
        port
    }

    /// Metadata lines describing the physical configuration of a test.
    ///
    /// `aqm_full` is the kernel's view of the AQM options; it is unknown
    /// during a dry run.
    #[must_use]
    pub fn hint_lines(&self, aqm_full: Option<&str>) -> Vec<String> {
        vec![
            format!("testbed_rtt_clients {}", self.rtt_clients),
            format!("testbed_rtt_servera {}", self.rtt_servera),
            format!("testbed_rtt_serverb {}", self.rtt_serverb),
            format!("testbed_cc_a {} {}", self.cc_a, self.ecn_a.as_sysctl()),
            format!("testbed_cc_b {} {}", self.cc_b, self.ecn_b.as_sysctl()),
            format!("testbed_aqm {}", self.aqm_name),
            format!("testbed_aqm_params {}", self.aqm_params),
            format!(
                "testbed_aqm_params_full {}",
                aqm_full.unwrap_or("UNKNOWN IN DRY RUN")
            ),
            format!("testbed_rate {}", self.bitrate),
        ]
    }

    /// Human-readable summary logged before each real test.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = String::from("Configured testbed:\n");
        out.push_str(&format!(
            "  rate: {} (applied from router to clients)\n",
            self.bitrate
        ));
        out.push_str("  rtt to router:\n");
        out.push_str(&format!("    - clients: {} ms\n", self.rtt_clients));
        out.push_str(&format!("    - servera: {} ms\n", self.rtt_servera));
        out.push_str(&format!("    - serverb: {} ms\n", self.rtt_serverb));
        if self.aqm_name.is_empty() {
            out.push_str("  no aqm\n");
        } else if self.aqm_params.is_empty() {
            out.push_str(&format!("  aqm: {}\n", self.aqm_name));
        } else {
            out.push_str(&format!("  aqm: {} ({})\n", self.aqm_name, self.aqm_params));
        }
        out.push_str(&format!(
            "  cc a: {} (ecn {})\n",
            self.cc_a,
            self.ecn_a.as_sysctl()
        ));
        out.push_str(&format!(
            "  cc b: {} (ecn {})",
            self.cc_b,
            self.ecn_b.as_sysctl()
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pfifo_maps_to_instrumented_variant() {
        let mut tb = Testbed::default();
        tb.set_aqm("pfifo", "");
        assert_eq!(tb.aqm_name, "pfifo_aqmt");
        tb.set_aqm("pie", "ecn");
        assert_eq!(tb.aqm_name, "pie");
        assert_eq!(tb.aqm_params, "ecn");
    }

    #[test]
    fn samples_to_skip_derives_from_max_rtt() {
        let mut tb = Testbed::default();
        tb.set_rtt(50, Some(100), 0);
        // 100 ms * 40 + 4 s = 8 s at 1 s interval
        assert_eq!(tb.samples_to_skip(), 8);
        tb.capture_interval_ms = 250;
        assert_eq!(tb.samples_to_skip(), 32);
    }

    #[test]
    fn explicit_idle_overrides_rtt_derivation() {
        let tb = Testbed {
            capture_idle: Some(2.5),
            rtt_servera: 500,
            ..Testbed::default()
        };
        assert_eq!(tb.samples_to_skip(), 3);
    }

    #[test]
    fn cooldown_scales_with_max_rtt() {
        let mut tb = Testbed::default();
        assert_eq!(tb.post_wait_time(), Duration::from_secs(2));
        tb.rtt_clients = 200;
        assert_eq!(tb.post_wait_time(), Duration::from_secs(3));
    }

    #[test]
    fn estimated_run_time_includes_capture_and_cooldown() {
        let tb = Testbed {
            capture_samples: 10,
            capture_idle: Some(0.0),
            ..Testbed::default()
        };
        // 10 samples * 1 s + 2 s cooldown + 1 s slack
        assert_eq!(tb.estimated_run_time(), Duration::from_secs(13));
    }

    #[test]
    fn traffic_ports_increase() {
        let mut tb = Testbed::default();
        assert_eq!(tb.next_traffic_port(), 5_500);
        assert_eq!(tb.next_traffic_port(), 5_501);
    }

    #[test]
    fn hint_lines_mark_dry_run_aqm() {
        let tb = Testbed::default();
        let hints = tb.hint_lines(None);
        assert!(hints.contains(&"testbed_aqm_params_full UNKNOWN IN DRY RUN".to_string()));
        assert!(hints.contains(&"testbed_cc_a cubic 2".to_string()));
        assert_eq!(hints.last().map(String::as_str), Some("testbed_rate 1000000"));
    }
}
