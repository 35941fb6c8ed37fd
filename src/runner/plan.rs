//! TOML plan files.
//!
//! ```toml
//! folder = "results/rtt-sweep"
//! title = "RTT sweep"
//!
//! [[steps]]
//! kind = "sched"
//! values = [{ tag = "pie", name = "pie" }, { tag = "fq", name = "fq_codel" }]
//!
//! [[steps]]
//! kind = "rtt"
//! values = [10, 50, 100]
//!
//! [leaf]
//! traffic = ["greedy {port} {rtt}"]
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use regex::{Captures, Regex};
use serde::Deserialize;

use crate::core::errors::{MtbError, Result};
use crate::runner::steps::{
    self, CcSetting, RunIf, Sched, Step, TestDef, VAR_SCHED, VAR_UDP_RATE,
};
use crate::runner::testcase::{TestFn, TestRun};
use crate::runner::walker::TestPlan;
use crate::testbed::model::{EcnMode, MBIT, NodePair, Testbed};

const PLACEHOLDER: &str = r"\{([a-z_]+)\}";

/// Parsed plan file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanFile {
    pub folder: PathBuf,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub subtitle: Option<String>,
    /// Replaces the configured `[testbed]` when present.
    #[serde(default)]
    pub testbed: Option<Testbed>,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    pub leaf: LeafSpec,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepSpec {
    Sched {
        values: Vec<SchedSpec>,
        #[serde(default)]
        titlelabel: Option<String>,
    },
    Rtt {
        values: Vec<u32>,
        #[serde(default)]
        titlelabel: Option<String>,
    },
    Bitrate {
        values: Vec<u64>,
        #[serde(default)]
        titlelabel: Option<String>,
    },
    Repeat {
        count: usize,
        #[serde(default)]
        titlelabel: Option<String>,
    },
    UdpRate {
        values: Vec<f64>,
        #[serde(default)]
        titlelabel: Option<String>,
    },
    Cc {
        pair: NodePair,
        values: Vec<CcSpec>,
        #[serde(default)]
        titlelabel: Option<String>,
    },
    SkipIf {
        when: ConditionSpec,
    },
    RunIf {
        checks: Vec<CheckSpec>,
        #[serde(default)]
        titlelabel: Option<String>,
    },
    HtmlIndex {
        #[serde(default)]
        level_order: Vec<usize>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedSpec {
    pub tag: String,
    #[serde(default)]
    pub title: Option<String>,
    pub name: String,
    #[serde(default)]
    pub params: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CcSpec {
    pub tag: String,
    #[serde(default)]
    pub title: Option<String>,
    pub cc: String,
    #[serde(default = "default_ecn")]
    pub ecn: EcnMode,
}

const fn default_ecn() -> EcnMode {
    EcnMode::Allow
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckSpec {
    pub tag: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub when: ConditionSpec,
}

/// Criteria over the testbed; all that are set must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConditionSpec {
    /// Largest configured RTT (ms) strictly above.
    pub rtt_above: Option<u32>,
    pub rtt_below: Option<u32>,
    pub bitrate_above_mbit: Option<u64>,
    pub bitrate_below_mbit: Option<u64>,
    pub aqm_in: Option<Vec<String>>,
}

impl ConditionSpec {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.rtt_above.is_none()
            && self.rtt_below.is_none()
            && self.bitrate_above_mbit.is_none()
            && self.bitrate_below_mbit.is_none()
            && self.aqm_in.is_none()
    }

    /// Whether `tb` meets every set criterion. Vacuously true when empty.
    #[must_use]
    pub fn holds(&self, tb: &Testbed) -> bool {
        let rtt = tb.max_rtt_ms();
        self.rtt_above.is_none_or(|v| rtt > v)
            && self.rtt_below.is_none_or(|v| rtt < v)
            && self.bitrate_above_mbit.is_none_or(|v| tb.bitrate > v.saturating_mul(MBIT))
            && self.bitrate_below_mbit.is_none_or(|v| tb.bitrate < v.saturating_mul(MBIT))
            && self
                .aqm_in
                .as_ref()
                .is_none_or(|names| names.iter().any(|n| *n == tb.aqm_name))
    }
}

/// Traffic started by every test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LeafSpec {
    /// Command templates, started in the background in order.
    #[serde(default)]
    pub traffic: Vec<String>,
}

impl PlanFile {
    /// Read and parse a plan file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|source| MtbError::io(path, source))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Build the executable plan. `base` is used when the file carries no
    /// `[testbed]` table.
    pub fn compile(self, base: &Testbed) -> Result<TestPlan> {
        let has_udp_rate = self
            .steps
            .iter()
            .any(|s| matches!(s, StepSpec::UdpRate { .. }));
        let has_sched = self
            .steps
            .iter()
            .any(|s| matches!(s, StepSpec::Sched { .. }));

        let placeholder = Regex::new(PLACEHOLDER)
            .map_err(|err| MtbError::configuration(format!("placeholder pattern: {err}")))?;
        for template in &self.leaf.traffic {
            for caps in placeholder.captures_iter(template) {
                let name = &caps[1];
                let ok = match name {
                    "port" | "rtt" | "bitrate" | "folder" => true,
                    VAR_UDP_RATE => has_udp_rate,
                    VAR_SCHED => has_sched,
                    _ => false,
                };
                if !ok {
                    return Err(MtbError::configuration(format!(
                        "traffic template {template:?} uses {{{name}}} which no step provides"
                    )));
                }
            }
        }

        let steps = self
            .steps
            .into_iter()
            .map(compile_step)
            .collect::<Result<Vec<_>>>()?;
        let templates = self.leaf.traffic;
        let leaf: TestFn = Rc::new(move |run: &mut TestRun<'_>| -> Result<()> {
            for template in &templates {
                let cmd = render_for(&placeholder, template, run);
                run.start_traffic(&cmd)?;
            }
            Ok(())
        });

        Ok(TestPlan {
            folder: self.folder,
            title: self.title,
            subtitle: self.subtitle,
            testbed: self.testbed.unwrap_or_else(|| base.clone()),
            steps,
            leaf,
        })
    }
}

fn compile_step(spec: StepSpec) -> Result<Box<dyn Step>> {
    let step: Box<dyn Step> = match spec {
        StepSpec::Sched { values, titlelabel } => {
            let scheds = values
                .into_iter()
                .map(|s| {
                    let title = s.title.unwrap_or_else(|| s.tag.clone());
                    Sched::new(s.tag, title, s.name, s.params)
                })
                .collect();
            relabel(steps::branch_sched(scheds), titlelabel)
        }
        StepSpec::Rtt { values, titlelabel } => relabel(steps::branch_rtt(values), titlelabel),
        StepSpec::Bitrate { values, titlelabel } => {
            relabel(steps::branch_bitrate(values), titlelabel)
        }
        StepSpec::Repeat { count, titlelabel } => relabel(steps::branch_repeat(count), titlelabel),
        StepSpec::UdpRate { values, titlelabel } => {
            relabel(steps::branch_udp_rate(values), titlelabel)
        }
        StepSpec::Cc {
            pair,
            values,
            titlelabel,
        } => {
            let settings = values
                .into_iter()
                .map(|c| CcSetting {
                    title: c.title.unwrap_or_else(|| c.cc.clone()),
                    tag: c.tag,
                    cc: c.cc,
                    ecn: c.ecn,
                })
                .collect();
            relabel(steps::branch_cc(pair, settings), titlelabel)
        }
        StepSpec::SkipIf { when } => {
            if when.is_empty() {
                return Err(MtbError::configuration(
                    "skip_if needs at least one criterion",
                ));
            }
            Box::new(steps::skip_if(move |def: &TestDef| when.holds(&def.testbed)))
        }
        StepSpec::RunIf { checks, titlelabel } => {
            let checks = checks
                .into_iter()
                .map(|c| {
                    let when = c.when;
                    RunIf {
                        title: c.title.unwrap_or_else(|| c.tag.clone()),
                        tag: c.tag,
                        check: Rc::new(move |def: &TestDef| when.holds(&def.testbed)),
                    }
                })
                .collect();
            let step = steps::branch_runif(checks);
            match titlelabel {
                Some(label) => Box::new(step.with_titlelabel(label)),
                None => Box::new(step),
            }
        }
        StepSpec::HtmlIndex { level_order } => Box::new(steps::html_index(level_order)),
    };
    Ok(step)
}

fn relabel<V: 'static>(step: steps::AxisStep<V>, titlelabel: Option<String>) -> Box<dyn Step> {
    match titlelabel {
        Some(label) => Box::new(step.with_titlelabel(label)),
        None => Box::new(step),
    }
}

fn render_for(placeholder: &Regex, template: &str, run: &mut TestRun<'_>) -> String {
    let mut values = BTreeMap::new();
    values.insert("rtt", run.testbed().rtt_servera.to_string());
    values.insert("bitrate", run.testbed().bitrate.to_string());
    values.insert("folder", run.folder().display().to_string());
    for name in [VAR_UDP_RATE, VAR_SCHED] {
        if let Some(value) = run.var(name) {
            values.insert(name, value.to_string());
        }
    }
    render(placeholder, template, &values, &mut || run.next_port())
}

/// Substitute `{name}` placeholders. Every `{port}` draws a fresh port.
fn render(
    placeholder: &Regex,
    template: &str,
    values: &BTreeMap<&str, String>,
    next_port: &mut dyn FnMut() -> u16,
) -> String {
    placeholder
        .replace_all(template, |caps: &Captures<'_>| {
            let name = &caps[1];
            if name == "port" {
                return next_port().to_string();
            }
            values
                .get(name)
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}
