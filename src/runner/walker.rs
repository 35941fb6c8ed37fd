//! Plan walker.
//!
//! A walk enumerates every branch combination of a plan depth-first. It
//! always runs twice: a dry pass that only classifies tests and estimates
//! the run time, then (once confirmed) a real pass that rebuilds the result
//! tree from scratch. Both passes start from the same initial state so they
//! visit the same branches in the same order.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::core::errors::{MtbError, Result};
use crate::logger::jsonl::{EventType, JsonlWriter, LogEntry, Severity};
use crate::runner::runtime::Runtime;
use crate::runner::steps::{BranchEvent, Step, TestDef};
use crate::runner::testcase::{TestActions, TestCase, TestFn, TestState};
use crate::testbed::model::Testbed;
use crate::tree::collection::{ResultTree, TEST_FOLDER};

/// A compiled plan: ordered steps followed by the traffic action.
pub struct TestPlan {
    /// Root collection folder.
    pub folder: PathBuf,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    /// Initial testbed configuration, cloned for every pass.
    pub testbed: Testbed,
    pub steps: Vec<Box<dyn Step>>,
    pub leaf: TestFn,
}

/// Aggregate of a dry pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DryRunSummary {
    pub will_run: u64,
    pub skipped: u64,
    pub total: u64,
    #[serde(serialize_with = "serialize_secs")]
    pub estimated: Duration,
    /// Every test folder in walk order.
    pub tests: Vec<PathBuf>,
}

impl DryRunSummary {
    fn record(&mut self, case: &TestCase, testbed: &Testbed) {
        self.total += 1;
        if case.will_run() {
            self.will_run += 1;
        } else {
            self.skipped += 1;
        }
        self.estimated += case.estimated_time(testbed);
        self.tests.push(case.folder().to_path_buf());
    }

    /// Average estimated time per test that will run.
    #[must_use]
    pub fn average(&self) -> Duration {
        u32::try_from(self.will_run)
            .ok()
            .filter(|n| *n > 0)
            .map_or(Duration::ZERO, |n| self.estimated / n)
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn serialize_secs<S: serde::Serializer>(value: &Duration, ser: S) -> std::result::Result<S::Ok, S::Error> {
    ser.serialize_u64(value.as_secs())
}

/// Outcome of a real pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WalkReport {
    /// Tests that collected fresh data.
    pub collected: u64,
    /// Tests whose earlier data was reused.
    pub reused: u64,
    pub skipped: u64,
    /// Tests lost to environment or directory errors.
    pub failed: u64,
    pub analyzed: u64,
    /// Every test folder in walk order.
    pub tests: Vec<PathBuf>,
}

#[derive(Default)]
struct Tally {
    summary: DryRunSummary,
    report: WalkReport,
}

/// Drives plans against a runtime.
pub struct Walker<'a> {
    rt: Runtime<'a>,
    journal: Option<JsonlWriter>,
}

impl<'a> Walker<'a> {
    #[must_use]
    pub const fn new(rt: Runtime<'a>) -> Self {
        Self { rt, journal: None }
    }

    /// Record walk events to `journal`.
    #[must_use]
    pub fn with_journal(mut self, journal: JsonlWriter) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Dry pass only.
    pub fn estimate(&mut self, plan: &TestPlan) -> Result<DryRunSummary> {
        let mut tally = Tally::default();
        self.pass(plan, true, &mut tally)?;
        Ok(tally.summary)
    }

    /// Real pass only.
    pub fn execute(&mut self, plan: &TestPlan) -> Result<WalkReport> {
        let mut tally = Tally::default();
        let result = self.pass(plan, false, &mut tally);
        if let Err(err) = &result {
            self.on_abort(err);
        }
        result?;
        self.journal(
            LogEntry::new(EventType::WalkComplete, Severity::Info)
                .folder(&plan.folder)
                .details(format!(
                    "collected={} reused={} skipped={} failed={} analyzed={}",
                    tally.report.collected,
                    tally.report.reused,
                    tally.report.skipped,
                    tally.report.failed,
                    tally.report.analyzed
                )),
        );
        Ok(tally.report)
    }

    /// Dry pass, confirmation, then the real pass. Returns `None` when the
    /// real pass was declined.
    pub fn run_plan(
        &mut self,
        plan: &TestPlan,
        confirm: &mut dyn FnMut(&DryRunSummary) -> bool,
    ) -> Result<Option<WalkReport>> {
        let summary = self.estimate(plan)?;
        tracing::info!(
            "Estimated time: {} s for {} tests ({} skipped, {} s on average)",
            summary.estimated.as_secs(),
            summary.will_run,
            summary.skipped,
            summary.average().as_secs()
        );
        let mut entry = LogEntry::new(EventType::PlanEstimated, Severity::Info).folder(&plan.folder);
        entry.tests_run = Some(summary.will_run);
        entry.tests_skipped = Some(summary.skipped);
        entry.tests_total = Some(summary.total);
        entry.estimated_secs = Some(summary.estimated.as_secs_f64());
        self.journal(entry);

        if self.rt.options.ask_confirmation && !confirm(&summary) {
            tracing::info!("Aborting");
            return Ok(None);
        }
        self.execute(plan).map(Some)
    }

    fn pass(&mut self, plan: &TestPlan, dry_run: bool, tally: &mut Tally) -> Result<()> {
        let mut tree = ResultTree::new(
            plan.folder.clone(),
            plan.title.as_deref(),
            plan.subtitle.as_deref(),
        );
        let mut def = TestDef::new(plan.testbed.clone(), tree.root(), plan.folder.clone(), dry_run);
        self.walk(plan, &plan.steps, &mut def, &mut tree, tally)
    }

    fn walk(
        &mut self,
        plan: &TestPlan,
        steps: &[Box<dyn Step>],
        def: &mut TestDef,
        tree: &mut ResultTree,
        tally: &mut Tally,
    ) -> Result<()> {
        let Some((step, rest)) = steps.split_first() else {
            return self.leaf(plan, def, tree, tally);
        };

        let (node, folder, level) = (def.node, def.folder.clone(), def.level);
        let mut run = step.start(def);
        while let Some(event) = run.next(def) {
            if let BranchEvent::Branch(branch) = event {
                let child = tree.add_collection(node, &branch)?;
                def.node = child;
                def.folder = tree.folder(child).to_path_buf();
                def.level = level + 1;
            }
            let result = self.walk(plan, rest, def, tree, tally);
            def.node = node;
            def.folder.clone_from(&folder);
            def.level = level;
            run.leave(def);
            result?;
        }
        run.finish(def)
    }

    fn leaf(
        &mut self,
        plan: &TestPlan,
        def: &mut TestDef,
        tree: &mut ResultTree,
        tally: &mut Tally,
    ) -> Result<()> {
        let folder = tree.claim_test(def.node)?;
        let mut case = TestCase::open(&folder, self.rt.options.retest, def.skip_test)?;
        if def.dry_run {
            tally.summary.record(&case, &def.testbed);
            return Ok(());
        }
        tally.report.tests.push(folder);

        tracing::info!("{}", case.header());
        let mut fresh = false;
        match case.state() {
            TestState::DirectoryError => {
                tracing::warn!(folder = %case.folder().display(), "unrecognized test directory left untouched");
                tally.report.failed += 1;
                self.journal(
                    LogEntry::new(EventType::DirectoryError, Severity::Warning).folder(case.folder()),
                );
            }
            TestState::Skipped => {
                tally.report.skipped += 1;
                self.journal(
                    LogEntry::new(EventType::TestSkipped, Severity::Info).folder(case.folder()),
                );
            }
            TestState::AlreadyExists => tally.report.reused += 1,
            TestState::Pending => {
                self.journal(
                    LogEntry::new(EventType::TestStarted, Severity::Info).folder(case.folder()),
                );
                let started = Instant::now();
                let actions = TestActions {
                    traffic: &plan.leaf,
                    pre_hook: def.pre_hook.as_ref(),
                    post_hook: def.post_hook.as_ref(),
                };
                match case.run(&self.rt, &mut def.testbed, &def.vars, &actions, false) {
                    Ok(()) => {
                        fresh = true;
                        tally.report.collected += 1;
                        let mut entry = LogEntry::new(EventType::DataCollected, Severity::Info)
                            .folder(case.folder());
                        entry.duration_ms =
                            Some(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX));
                        entry.ok = Some(true);
                        self.journal(entry);
                    }
                    Err(err) if err.is_branch_local() => {
                        tracing::error!(error = %err, "test aborted, continuing with the next branch");
                        tally.report.failed += 1;
                        self.journal(
                            LogEntry::new(EventType::EnvironmentError, Severity::Error)
                                .folder(case.folder())
                                .error(&err),
                        );
                    }
                    Err(err) => return Err(err),
                }
            }
            TestState::Running | TestState::DataCollected => {}
        }

        if case.has_valid_data() {
            self.analyze(&case, &def.testbed, fresh, tally);
            tree.add_child(def.node, TEST_FOLDER)?;
        }
        self.rt.ctx.check_cancelled()
    }

    fn analyze(&mut self, case: &TestCase, testbed: &Testbed, fresh: bool, tally: &mut Tally) {
        let Some(analysis) = self.rt.analysis else {
            return;
        };
        let needed = self.rt.options.reanalyze
            || fresh
            || !case.is_analyzed().unwrap_or(false);
        if !needed {
            return;
        }
        match case.analyze(analysis, testbed) {
            Ok(skipped) => {
                tally.report.analyzed += 1;
                let mut entry =
                    LogEntry::new(EventType::TestAnalyzed, Severity::Info).folder(case.folder());
                entry.samples_skipped = Some(skipped);
                entry.ok = Some(true);
                self.journal(entry);
            }
            Err(err) => {
                tracing::warn!(folder = %case.folder().display(), error = %err, "analysis failed");
                self.journal(
                    LogEntry::new(EventType::TestAnalyzed, Severity::Warning)
                        .folder(case.folder())
                        .error(&err),
                );
            }
        }
    }

    fn on_abort(&mut self, err: &MtbError) {
        let killed = self.rt.ctx.kill_all();
        if matches!(err, MtbError::Cancelled) {
            tracing::warn!(killed, "walk cancelled");
            self.journal(LogEntry::new(EventType::Cancelled, Severity::Warning).error(err));
        }
        self.rt.launcher.cleanup();
    }

    fn journal(&mut self, entry: LogEntry) {
        if let Some(journal) = self.journal.as_mut() {
            journal.write_entry(&entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_ignores_skipped_tests() {
        let summary = DryRunSummary {
            will_run: 4,
            skipped: 3,
            total: 7,
            estimated: Duration::from_secs(100),
            tests: Vec::new(),
        };
        assert_eq!(summary.average(), Duration::from_secs(25));
        assert_eq!(DryRunSummary::default().average(), Duration::ZERO);
    }

    #[test]
    fn summary_serializes_seconds() {
        let summary = DryRunSummary {
            estimated: Duration::from_millis(61_500),
            ..DryRunSummary::default()
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["estimated"], 61);
    }
}
