//! Plan steps.
//!
//! A [`Step`] turns the current [`TestDef`] into a sequence of
//! [`BranchEvent`]s. The walker recurses into the remaining steps once per
//! event, then calls [`StepRun::leave`] so the step can restore whatever it
//! overrode for that subtree. [`StepRun::finish`] runs after the last event.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use crate::core::errors::{MtbError, Result};
use crate::runner::testcase::{TestFn, TestRun};
use crate::testbed::model::{EcnMode, MBIT, NodePair, Testbed};
use crate::tree::collection::{BranchDescriptor, NodeId};
use crate::tree::metadata::metadata_path;
use crate::tree::node::{CollectionNode, build_html_index};
use crate::tree::permute::reorder_levels;

/// Variable holding the UDP rate selected by [`branch_udp_rate`].
pub const VAR_UDP_RATE: &str = "udp_rate";
/// Variable holding the scheduler tag selected by [`branch_sched`].
pub const VAR_SCHED: &str = "sched";

/// Mutable state threaded through a walk.
#[derive(Clone)]
pub struct TestDef {
    pub testbed: Testbed,
    pub dry_run: bool,
    /// Tests reached while set are classified as skipped.
    pub skip_test: bool,
    /// Number of branches between the root and the current node.
    pub level: usize,
    pub node: NodeId,
    /// Folder of the current collection.
    pub folder: PathBuf,
    pub pre_hook: Option<TestFn>,
    pub post_hook: Option<TestFn>,
    pub vars: BTreeMap<String, String>,
}

impl TestDef {
    #[must_use]
    pub fn new(testbed: Testbed, node: NodeId, folder: PathBuf, dry_run: bool) -> Self {
        Self {
            testbed,
            dry_run,
            skip_test: false,
            level: 0,
            node,
            folder,
            pre_hook: None,
            post_hook: None,
            vars: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }
}

/// One item produced by a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchEvent {
    /// Recurse into the remaining steps without a new collection.
    Continue,
    /// Recurse below a new child collection.
    Branch(BranchDescriptor),
}

/// A factory for one pass over a step's events.
pub trait Step {
    fn start(&self, def: &TestDef) -> Box<dyn StepRun + '_>;
}

/// One pass over a step's events.
pub trait StepRun {
    /// Produce the next event, updating `def` for the nested walk.
    fn next(&mut self, def: &mut TestDef) -> Option<BranchEvent>;

    /// Called once the subtree of the last event has been walked.
    fn leave(&mut self, _def: &mut TestDef) {}

    /// Called after the last event, still inside the current collection.
    fn finish(&mut self, _def: &mut TestDef) -> Result<()> {
        Ok(())
    }
}

// ──────────────────── axis steps ────────────────────

type ApplyFn<V> = Box<dyn Fn(&mut TestDef, &V)>;
type LabelFn<V> = Box<dyn Fn(&V, usize) -> String>;

/// Branch once per value along a configuration axis.
pub struct AxisStep<V> {
    values: Vec<V>,
    apply: ApplyFn<V>,
    tag: LabelFn<V>,
    title: LabelFn<V>,
    titlelabel: String,
}

impl<V> AxisStep<V> {
    pub fn new(
        values: Vec<V>,
        titlelabel: impl Into<String>,
        tag: impl Fn(&V, usize) -> String + 'static,
        title: impl Fn(&V, usize) -> String + 'static,
        apply: impl Fn(&mut TestDef, &V) + 'static,
    ) -> Self {
        Self {
            values,
            apply: Box::new(apply),
            tag: Box::new(tag),
            title: Box::new(title),
            titlelabel: titlelabel.into(),
        }
    }

    #[must_use]
    pub fn with_titlelabel(mut self, titlelabel: impl Into<String>) -> Self {
        self.titlelabel = titlelabel.into();
        self
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Fn(&V, usize) -> String + 'static) -> Self {
        self.title = Box::new(title);
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Fn(&V, usize) -> String + 'static) -> Self {
        self.tag = Box::new(tag);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<V> Step for AxisStep<V> {
    fn start(&self, _def: &TestDef) -> Box<dyn StepRun + '_> {
        Box::new(AxisRun {
            step: self,
            index: 0,
        })
    }
}

struct AxisRun<'s, V> {
    step: &'s AxisStep<V>,
    index: usize,
}

impl<V> StepRun for AxisRun<'_, V> {
    fn next(&mut self, def: &mut TestDef) -> Option<BranchEvent> {
        let index = self.index;
        let value = self.step.values.get(index)?;
        self.index += 1;
        (self.step.apply)(def, value);
        Some(BranchEvent::Branch(BranchDescriptor::new(
            (self.step.tag)(value, index),
            (self.step.title)(value, index),
            self.step.titlelabel.clone(),
        )))
    }
}

fn shown<V: Display>(value: &V, _index: usize) -> String {
    value.to_string()
}

/// Branch on the RTT of both servers (ms).
#[must_use]
pub fn branch_rtt(rtts: Vec<u32>) -> AxisStep<u32> {
    AxisStep::new(
        rtts,
        "RTT",
        |rtt, _| format!("rtt-{rtt}"),
        shown,
        |def, rtt| {
            let clients = def.testbed.rtt_clients;
            def.testbed.set_rtt(*rtt, None, clients);
        },
    )
}

/// Branch on the link rate (Mb/s).
#[must_use]
pub fn branch_bitrate(rates_mbit: Vec<u64>) -> AxisStep<u64> {
    AxisStep::new(
        rates_mbit,
        "Linkrate [Mb/s]",
        |rate, _| format!("linkrate-{rate}"),
        shown,
        |def, rate| def.testbed.bitrate = rate * MBIT,
    )
}

/// Repeat the nested plan `count` times.
#[must_use]
pub fn branch_repeat(count: usize) -> AxisStep<usize> {
    AxisStep::new(
        (0..count).collect(),
        "Test #",
        |i, _| format!("repeat-{i}"),
        |i, _| (i + 1).to_string(),
        |_, _| {},
    )
}

/// A queue discipline to branch on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sched {
    pub tag: String,
    pub title: String,
    pub name: String,
    pub params: String,
}

impl Sched {
    pub fn new(
        tag: impl Into<String>,
        title: impl Into<String>,
        name: impl Into<String>,
        params: impl Into<String>,
    ) -> Self {
        Self {
            tag: tag.into(),
            title: title.into(),
            name: name.into(),
            params: params.into(),
        }
    }
}

/// Branch on the AQM scheduler.
#[must_use]
pub fn branch_sched(scheds: Vec<Sched>) -> AxisStep<Sched> {
    AxisStep::new(
        scheds,
        "Scheduler",
        |s, _| format!("sched-{}", s.tag),
        |s, _| s.title.clone(),
        |def, s| {
            def.testbed.set_aqm(&s.name, &s.params);
            def.vars.insert(VAR_SCHED.to_string(), s.tag.clone());
        },
    )
}

/// Branch on a UDP rate (Mb/s) made available to traffic as a variable.
#[must_use]
pub fn branch_udp_rate(rates: Vec<f64>) -> AxisStep<f64> {
    AxisStep::new(
        rates,
        "UDP Rate [Mb/s]",
        |rate, _| format!("udp-rate-{rate}"),
        shown,
        |def, rate| {
            def.vars.insert(VAR_UDP_RATE.to_string(), rate.to_string());
        },
    )
}

/// A congestion control setting for one node pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CcSetting {
    pub tag: String,
    pub title: String,
    pub cc: String,
    pub ecn: EcnMode,
}

/// Branch on the congestion control of one node pair.
#[must_use]
pub fn branch_cc(pair: NodePair, settings: Vec<CcSetting>) -> AxisStep<CcSetting> {
    AxisStep::new(
        settings,
        format!("CC {pair}"),
        move |s, _| format!("cc-{}-{}", pair.to_string().to_lowercase(), s.tag),
        |s, _| s.title.clone(),
        move |def, s| def.testbed.set_cc(pair, &s.cc, s.ecn),
    )
}

/// A free-form branch.
pub struct CustomBranch {
    pub tag: String,
    pub title: String,
    pub apply: Rc<dyn Fn(&mut TestDef)>,
}

/// Branch on arbitrary changes to the test definition.
#[must_use]
pub fn branch_custom(titlelabel: &str, branches: Vec<CustomBranch>) -> AxisStep<CustomBranch> {
    AxisStep::new(
        branches,
        titlelabel,
        |b, _| format!("custom-{}", b.tag),
        |b, _| b.title.clone(),
        |def, b| (b.apply)(def),
    )
}

// ──────────────────── bracketing steps ────────────────────

/// Predicate over the current test definition.
pub type Condition = Rc<dyn Fn(&TestDef) -> bool>;

/// One conditional branch of [`branch_runif`].
pub struct RunIf {
    pub tag: String,
    pub title: String,
    pub check: Condition,
}

/// Branch per check; tests below a failing check are skipped.
pub struct RunIfStep {
    checks: Vec<RunIf>,
    titlelabel: String,
}

/// Branch once per check, skipping the tests of branches whose check fails.
#[must_use]
pub fn branch_runif(checks: Vec<RunIf>) -> RunIfStep {
    RunIfStep {
        checks,
        titlelabel: "Run if".to_string(),
    }
}

impl RunIfStep {
    #[must_use]
    pub fn with_titlelabel(mut self, titlelabel: impl Into<String>) -> Self {
        self.titlelabel = titlelabel.into();
        self
    }
}

impl Step for RunIfStep {
    fn start(&self, _def: &TestDef) -> Box<dyn StepRun + '_> {
        Box::new(RunIfRun {
            step: self,
            index: 0,
            saved: None,
        })
    }
}

struct RunIfRun<'s> {
    step: &'s RunIfStep,
    index: usize,
    saved: Option<bool>,
}

impl StepRun for RunIfRun<'_> {
    fn next(&mut self, def: &mut TestDef) -> Option<BranchEvent> {
        let check = self.step.checks.get(self.index)?;
        self.index += 1;
        self.saved = Some(def.skip_test);
        def.skip_test = !(check.check)(def);
        Some(BranchEvent::Branch(BranchDescriptor::new(
            format!("runif-{}", check.tag),
            check.title.clone(),
            self.step.titlelabel.clone(),
        )))
    }

    fn leave(&mut self, def: &mut TestDef) {
        if let Some(saved) = self.saved.take() {
            def.skip_test = saved;
        }
    }
}

/// Skip nested tests while the condition holds.
pub struct SkipIf {
    condition: Condition,
}

#[must_use]
pub fn skip_if(condition: impl Fn(&TestDef) -> bool + 'static) -> SkipIf {
    SkipIf {
        condition: Rc::new(condition),
    }
}

impl Step for SkipIf {
    fn start(&self, _def: &TestDef) -> Box<dyn StepRun + '_> {
        Box::new(OnceRun::new(|def: &mut TestDef| {
            let saved = def.skip_test;
            def.skip_test = (self.condition)(def);
            saved
        }, |def: &mut TestDef, saved| def.skip_test = saved))
    }
}

/// Which hook slot a [`HookStep`] extends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookSlot {
    Pre,
    Post,
}

/// Chain a hook after any existing one for the nested tests.
pub struct HookStep {
    slot: HookSlot,
    hook: TestFn,
}

#[must_use]
pub fn add_pre_hook(hook: impl Fn(&mut TestRun<'_>) -> Result<()> + 'static) -> HookStep {
    HookStep {
        slot: HookSlot::Pre,
        hook: Rc::new(hook),
    }
}

#[must_use]
pub fn add_post_hook(hook: impl Fn(&mut TestRun<'_>) -> Result<()> + 'static) -> HookStep {
    HookStep {
        slot: HookSlot::Post,
        hook: Rc::new(hook),
    }
}

fn chain(first: Option<TestFn>, then: TestFn) -> TestFn {
    match first {
        None => then,
        Some(first) => Rc::new(move |run: &mut TestRun<'_>| -> Result<()> {
            first(run)?;
            then(run)
        }),
    }
}

impl Step for HookStep {
    fn start(&self, _def: &TestDef) -> Box<dyn StepRun + '_> {
        let slot = self.slot;
        Box::new(OnceRun::new(
            move |def: &mut TestDef| {
                let target = match slot {
                    HookSlot::Pre => &mut def.pre_hook,
                    HookSlot::Post => &mut def.post_hook,
                };
                let saved = target.clone();
                *target = Some(chain(saved.clone(), Rc::clone(&self.hook)));
                saved
            },
            move |def: &mut TestDef, saved| match slot {
                HookSlot::Pre => def.pre_hook = saved,
                HookSlot::Post => def.post_hook = saved,
            },
        ))
    }
}

/// Continue exactly once with an override applied, restoring it on leave.
struct OnceRun<S, E, R> {
    enter: E,
    restore: R,
    state: Option<S>,
    done: bool,
}

impl<S, E, R> OnceRun<S, E, R>
where
    E: FnMut(&mut TestDef) -> S,
    R: FnMut(&mut TestDef, S),
{
    const fn new(enter: E, restore: R) -> Self {
        Self {
            enter,
            restore,
            state: None,
            done: false,
        }
    }
}

impl<S, E, R> StepRun for OnceRun<S, E, R>
where
    E: FnMut(&mut TestDef) -> S,
    R: FnMut(&mut TestDef, S),
{
    fn next(&mut self, def: &mut TestDef) -> Option<BranchEvent> {
        if self.done {
            return None;
        }
        self.done = true;
        self.state = Some((self.enter)(def));
        Some(BranchEvent::Continue)
    }

    fn leave(&mut self, def: &mut TestDef) {
        if let Some(state) = self.state.take() {
            (self.restore)(def, state);
        }
    }
}

// ──────────────────── html index ────────────────────

/// After the nested walk, write `index.html` for the current collection.
pub struct HtmlIndex {
    level_order: Vec<usize>,
}

#[must_use]
pub fn html_index(level_order: Vec<usize>) -> HtmlIndex {
    HtmlIndex { level_order }
}

impl Step for HtmlIndex {
    fn start(&self, _def: &TestDef) -> Box<dyn StepRun + '_> {
        Box::new(HtmlIndexRun {
            level_order: &self.level_order,
            done: false,
        })
    }
}

struct HtmlIndexRun<'s> {
    level_order: &'s [usize],
    done: bool,
}

impl StepRun for HtmlIndexRun<'_> {
    fn next(&mut self, _def: &mut TestDef) -> Option<BranchEvent> {
        if self.done {
            return None;
        }
        self.done = true;
        Some(BranchEvent::Continue)
    }

    fn finish(&mut self, def: &mut TestDef) -> Result<()> {
        // Nothing below this collection succeeded.
        if def.dry_run || !metadata_path(&def.folder).is_file() {
            return Ok(());
        }
        let tree = CollectionNode::load(&def.folder)?;
        let tree = reorder_levels(tree, self.level_order)?;
        let path = def.folder.join("index.html");
        fs::write(&path, build_html_index(&tree, &def.folder))
            .map_err(|source| MtbError::io(&path, source))?;
        tracing::info!(path = %path.display(), "wrote html index");
        Ok(())
    }
}
