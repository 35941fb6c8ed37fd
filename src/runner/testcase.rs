//! Lifecycle of a single experiment.
//!
//! A [`TestCase`] classifies its folder once when opened. Only a pending
//! test can be run, and only once: reset and set up the testbed, record the
//! configuration, start the capture, hand over to the traffic action, wait
//! for the capture to finish, then mark the data as collected.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use crate::core::errors::{MtbError, Result};
use crate::process::context::OrchestratorContext;
use crate::process::launcher::Launcher;
use crate::process::registry::wait_for;
use crate::runner::runtime::Runtime;
use crate::testbed::capture::{Analysis, capture_command};
use crate::testbed::model::Testbed;
use crate::tree::metadata::{
    self, ANALYZED_SKIPPED, DATA_ANALYZED, DATA_COLLECTED, Metadata, metadata_path,
};

/// Traffic action or hook run against a test in progress.
pub type TestFn = Rc<dyn Fn(&mut TestRun<'_>) -> Result<()>>;

/// Classification and progress of a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestState {
    /// Folder exists but holds no metadata; never touched.
    DirectoryError,
    /// Data from an earlier run is reused.
    AlreadyExists,
    /// Skipped by the plan's skip flag.
    Skipped,
    Pending,
    Running,
    DataCollected,
}

impl fmt::Display for TestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DirectoryError => "directory_error",
            Self::AlreadyExists => "already_exists",
            Self::Skipped => "skipped",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::DataCollected => "data_collected",
        })
    }
}

/// The traffic action plus optional hooks around it.
pub struct TestActions<'a> {
    pub traffic: &'a TestFn,
    pub pre_hook: Option<&'a TestFn>,
    pub post_hook: Option<&'a TestFn>,
}

/// One concrete experiment.
#[derive(Debug)]
pub struct TestCase {
    folder: PathBuf,
    state: TestState,
    note: Option<&'static str>,
}

impl TestCase {
    /// Classify `folder`. Reads the metadata file if present; writes
    /// nothing.
    pub fn open(folder: &Path, retest: bool, skip: bool) -> Result<Self> {
        let mut case = Self {
            folder: folder.to_path_buf(),
            state: TestState::Pending,
            note: None,
        };

        if folder.exists() {
            if !metadata_path(folder).is_file() {
                case.state = TestState::DirectoryError;
                case.note = Some("Skipping existing and UNRECOGNIZED testcase directory");
                return Ok(case);
            }
            if retest {
                case.note = Some("Repeating existing test");
            } else if Metadata::read(folder)?.contains(DATA_COLLECTED) {
                case.state = TestState::AlreadyExists;
                case.note = Some("Using existing data");
                return Ok(case);
            } else {
                case.note = Some("Rerunning incomplete test");
            }
        }

        if skip {
            case.state = TestState::Skipped;
            case.note = Some("Skipping testcase because environment tells us to");
        }
        Ok(case)
    }

    #[must_use]
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    #[must_use]
    pub const fn state(&self) -> TestState {
        self.state
    }

    /// Classification note shown in the header.
    #[must_use]
    pub const fn note(&self) -> Option<&'static str> {
        self.note
    }

    /// Whether a run would actually execute this test.
    #[must_use]
    pub fn will_run(&self) -> bool {
        self.state == TestState::Pending
    }

    /// Whether the folder holds data that belongs in the result tree.
    #[must_use]
    pub fn has_valid_data(&self) -> bool {
        matches!(self.state, TestState::AlreadyExists | TestState::DataCollected)
    }

    /// Whether an earlier analysis completed.
    pub fn is_analyzed(&self) -> Result<bool> {
        metadata::has_marker(&self.folder, DATA_ANALYZED)
    }

    /// Advisory duration of this test; zero when it will not run.
    #[must_use]
    pub fn estimated_time(&self, testbed: &Testbed) -> Duration {
        if self.will_run() {
            testbed.estimated_run_time()
        } else {
            Duration::ZERO
        }
    }

    /// Banner logged before a test is handled.
    #[must_use]
    pub fn header(&self) -> String {
        let h1 = format!("TESTCASE {}", self.folder.display());
        let (rule, title) = match self.note {
            Some(h2) => (
                format!("{} {}", "=".repeat(h1.len()), "-".repeat(h2.len())),
                format!("{h1} {h2}"),
            ),
            None => ("=".repeat(h1.len()), h1),
        };
        format!(
            "{rule}\n{title}\n{rule}\n{}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        )
    }

    /// Execute the experiment. Environment failures leave the test
    /// without a completion marker and are reported as branch-local.
    pub fn run(
        &mut self,
        rt: &Runtime<'_>,
        testbed: &mut Testbed,
        vars: &BTreeMap<String, String>,
        actions: &TestActions<'_>,
        dry_run: bool,
    ) -> Result<()> {
        match self.state {
            TestState::Pending => {}
            TestState::DirectoryError => {
                return Err(MtbError::DirectoryState {
                    path: self.folder.clone(),
                    reason: "cannot run a test with an unrecognized directory".to_string(),
                });
            }
            other => {
                return Err(MtbError::InvalidTransition {
                    path: self.folder.clone(),
                    details: format!("cannot run a test in state {other}"),
                });
            }
        }
        self.state = TestState::Running;

        if !dry_run {
            if self.folder.exists() {
                fs::remove_dir_all(&self.folder)
                    .map_err(|source| MtbError::io(&self.folder, source))?;
            }
            fs::create_dir_all(&self.folder).map_err(|source| MtbError::io(&self.folder, source))?;
        }

        let mut run = TestRun {
            folder: &self.folder,
            testbed,
            vars,
            dry_run,
            ctx: rt.ctx,
            launcher: rt.launcher,
            poll_interval: rt.options.poll_interval,
        };
        let result = execute(rt, &mut run, actions);
        if result.is_err() {
            rt.ctx.kill_all();
            rt.launcher.cleanup();
            return result;
        }
        self.state = TestState::DataCollected;
        finish(rt, testbed, dry_run);
        Ok(())
    }

    /// Post-process collected data, replacing any earlier analysis markers.
    /// Returns the number of samples discarded.
    pub fn analyze(&self, analysis: &dyn Analysis, testbed: &Testbed) -> Result<u64> {
        let samples_to_skip = testbed.samples_to_skip();
        metadata::remove_keys(&self.folder, &[DATA_ANALYZED, ANALYZED_SKIPPED])?;
        analysis.analyze(&self.folder, samples_to_skip)?;
        metadata::append_line(&self.folder, DATA_ANALYZED)?;
        metadata::append_line(
            &self.folder,
            &format!("{ANALYZED_SKIPPED} {samples_to_skip}"),
        )?;
        Ok(samples_to_skip)
    }
}

fn execute(rt: &Runtime<'_>, run: &mut TestRun<'_>, actions: &TestActions<'_>) -> Result<()> {
    let start = Instant::now();
    let dry_run = run.dry_run;
    run.save_hint("type test")?;

    rt.environment.reset(dry_run)?;
    tracing::info!("{:.2} s: Testbed reset", start.elapsed().as_secs_f64());

    rt.environment.setup(run.testbed, dry_run)?;
    if !dry_run {
        match rt.environment.describe(run.testbed) {
            Ok(setup) => tracing::info!("{setup}"),
            Err(err) => tracing::warn!(error = %err, "could not describe testbed"),
        }
    }

    if !dry_run && let Some(pre) = actions.pre_hook {
        pre(run)?;
    }

    tracing::info!(
        "{:.2} s: Testbed initialized, starting test. Estimated time to finish: {} s",
        start.elapsed().as_secs_f64(),
        run.testbed.estimated_run_time().as_secs()
    );

    let tb = run.testbed.clone();
    run.save_hint(&format!("ta_idle {}", tb.idle_secs()))?;
    run.save_hint(&format!("ta_delay {}", tb.capture_interval_ms))?;
    run.save_hint(&format!("ta_samples {}", tb.capture_samples))?;
    run.save_hint(&format!("ta_samples_pre {}", tb.samples_to_skip()))?;
    let aqm_full = if dry_run {
        None
    } else {
        Some(rt.environment.aqm_options(&tb.aqm_name)?)
    };
    for line in tb.hint_lines(aqm_full.as_deref()) {
        run.save_hint(&line)?;
    }

    let capture_cmd = capture_command(rt.capture, run.folder, &tb)?;
    tracing::debug!(cmd = %capture_cmd, "capture command");
    let capture_pid = if dry_run {
        None
    } else {
        let pid = if rt.options.interactive {
            rt.launcher.run_fg(&capture_cmd)?
        } else {
            rt.launcher.run_bg(&capture_cmd)?
        };
        rt.ctx.set_capture(pid);
        Some(pid)
    };

    if rt.options.interactive && !dry_run {
        start_monitors(rt, &tb)?;
    }

    (actions.traffic)(run)?;

    if let Some(pid) = capture_pid {
        wait_for(pid, rt.options.poll_interval);
    }
    rt.ctx.clear_capture();
    tracing::info!("{:.2} s: Data collection finished", start.elapsed().as_secs_f64());

    if !dry_run && let Some(post) = actions.post_hook {
        post(run)?;
    }

    rt.ctx.kill_all();

    if rt.ctx.is_exiting() {
        tracing::warn!(
            "You have aborted an active test. In {} s its results will be stored; \
             press Ctrl+C again now to discard them",
            rt.options.grace_period.as_secs_f64()
        );
        thread::sleep(rt.options.grace_period);
    }

    run.save_hint(DATA_COLLECTED)
}

fn finish(rt: &Runtime<'_>, testbed: &Testbed, dry_run: bool) {
    if let Err(err) = rt.environment.reset(dry_run) {
        tracing::warn!(error = %err, "testbed reset after test failed");
    }
    let wait = testbed.post_wait_time();
    if rt.options.cooldown && !dry_run {
        tracing::info!("Testbed reset, waiting {:.2} s for cooldown period", wait.as_secs_f64());
        thread::sleep(wait);
    }
    rt.launcher.cleanup();
}

fn start_monitors(rt: &Runtime<'_>, tb: &Testbed) -> Result<()> {
    let iface = &rt.capture.interface;
    let monitor = format!("watch -n .2 ./views/show_setup.sh -v {iface}");
    tracing::info!(cmd = %monitor, "setup monitor");
    rt.ctx.register(rt.launcher.run_fg(&monitor)?);

    // Speedometer scale in bytes/s, with headroom above the link rate.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let max_bytes = (tb.bitrate as f64 * 1.1 / 8.0) as u64;
    let speedometer = format!(
        "speedometer -s -i {} -l -t {iface} -m {max_bytes}",
        rt.options.monitor_interval.as_secs_f64()
    );
    tracing::debug!(cmd = %speedometer, "speedometer");
    rt.ctx.register(rt.launcher.run_fg(&speedometer)?);
    Ok(())
}

/// Handle given to traffic actions and hooks while a test runs.
pub struct TestRun<'a> {
    folder: &'a Path,
    testbed: &'a mut Testbed,
    vars: &'a BTreeMap<String, String>,
    dry_run: bool,
    ctx: &'a OrchestratorContext,
    launcher: &'a dyn Launcher,
    poll_interval: Duration,
}

impl TestRun<'_> {
    #[must_use]
    pub fn folder(&self) -> &Path {
        self.folder
    }

    #[must_use]
    pub fn testbed(&self) -> &Testbed {
        self.testbed
    }

    /// Plan variable set by a step, e.g. `udp_rate`.
    #[must_use]
    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    #[must_use]
    pub const fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Next free traffic port.
    pub fn next_port(&mut self) -> u16 {
        self.testbed.next_traffic_port()
    }

    /// Append a metadata line to the test folder.
    pub fn save_hint(&self, text: &str) -> Result<()> {
        tracing::debug!("hint(test): {text}");
        if self.dry_run {
            return Ok(());
        }
        metadata::append_line(self.folder, text)
    }

    /// Start `cmd` in the background and track it. `None` in a dry run.
    pub fn spawn_background(&self, cmd: &str) -> Result<Option<u32>> {
        tracing::debug!(cmd, "background command");
        if self.dry_run {
            return Ok(None);
        }
        let pid = self.launcher.run_bg(cmd)?;
        self.ctx.register(pid);
        Ok(Some(pid))
    }

    /// Record `cmd` as a traffic hint and start it in the background.
    pub fn start_traffic(&self, cmd: &str) -> Result<Option<u32>> {
        self.save_hint(&format!("traffic {cmd}"))?;
        self.spawn_background(cmd)
    }

    /// Block until `pid` exits.
    pub fn wait(&self, pid: u32) {
        if !self.dry_run {
            wait_for(pid, self.poll_interval);
        }
    }

    /// Terminate a tracked process early.
    pub fn kill(&self, pid: u32) -> Result<()> {
        self.ctx.unregister(pid);
        crate::process::registry::terminate(pid).map(|_| ())
    }
}

/// Drop the completion marker of a test so the next run repeats it.
/// Returns whether a marker was present.
pub fn retest(folder: &Path) -> Result<bool> {
    let meta = Metadata::read(folder)?;
    if meta.get("type") != Some("test") {
        return Err(MtbError::Metadata {
            path: folder.to_path_buf(),
            details: "not a test folder".to_string(),
        });
    }
    let had_marker = meta.contains(DATA_COLLECTED);
    metadata::remove_keys(folder, &[DATA_COLLECTED])?;
    Ok(had_marker)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::core::config::CaptureConfig;
    use crate::process::launcher::ShellLauncher;
    use crate::runner::runtime::RunOptions;
    use crate::testbed::environment::Environment;

    #[derive(Default)]
    struct FakeEnv {
        calls: RefCell<Vec<String>>,
        fail_setup: bool,
    }

    impl Environment for FakeEnv {
        fn reset(&self, dry_run: bool) -> Result<()> {
            self.calls.borrow_mut().push(format!("reset dry={dry_run}"));
            Ok(())
        }

        fn setup(&self, testbed: &Testbed, dry_run: bool) -> Result<()> {
            self.calls
                .borrow_mut()
                .push(format!("setup rtt={} dry={dry_run}", testbed.rtt_servera));
            if self.fail_setup {
                return Err(MtbError::Environment {
                    action: "setup",
                    details: "exit status 1".to_string(),
                });
            }
            Ok(())
        }

        fn aqm_options(&self, aqm_name: &str) -> Result<String> {
            Ok(format!("{aqm_name} limit 1000"))
        }
    }

    fn capture_cfg() -> CaptureConfig {
        CaptureConfig {
            analyzer: PathBuf::from("true"),
            use_sudo: false,
            ..CaptureConfig::default()
        }
    }

    fn options() -> RunOptions {
        RunOptions {
            cooldown: false,
            poll_interval: Duration::from_millis(10),
            grace_period: Duration::from_millis(10),
            ..RunOptions::default()
        }
    }

    fn noop() -> TestFn {
        Rc::new(|_run: &mut TestRun<'_>| -> Result<()> { Ok(()) })
    }

    #[test]
    fn classification_of_folders() {
        let dir = tempfile::tempdir().unwrap();
        let fresh = dir.path().join("fresh");
        assert_eq!(TestCase::open(&fresh, false, false).unwrap().state(), TestState::Pending);
        assert_eq!(TestCase::open(&fresh, false, true).unwrap().state(), TestState::Skipped);

        let unknown = dir.path().join("unknown");
        fs::create_dir_all(&unknown).unwrap();
        let case = TestCase::open(&unknown, false, false).unwrap();
        assert_eq!(case.state(), TestState::DirectoryError);
        assert!(!case.will_run());

        let done = dir.path().join("done");
        metadata::append_line(&done, "type test").unwrap();
        metadata::append_line(&done, DATA_COLLECTED).unwrap();
        let case = TestCase::open(&done, false, true).unwrap();
        assert_eq!(case.state(), TestState::AlreadyExists);
        assert!(case.has_valid_data());
        assert_eq!(case.note(), Some("Using existing data"));
        assert_eq!(TestCase::open(&done, true, false).unwrap().state(), TestState::Pending);

        let partial = dir.path().join("partial");
        metadata::append_line(&partial, "type test").unwrap();
        let case = TestCase::open(&partial, false, false).unwrap();
        assert_eq!(case.state(), TestState::Pending);
        assert_eq!(case.note(), Some("Rerunning incomplete test"));
    }

    #[test]
    fn estimate_is_zero_when_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let tb = Testbed::default();
        let skipped = TestCase::open(&dir.path().join("t"), false, true).unwrap();
        assert_eq!(skipped.estimated_time(&tb), Duration::ZERO);
        let pending = TestCase::open(&dir.path().join("t"), false, false).unwrap();
        assert_eq!(pending.estimated_time(&tb), tb.estimated_run_time());
    }

    #[test]
    fn header_contains_folder_and_note() {
        let dir = tempfile::tempdir().unwrap();
        let case = TestCase::open(&dir.path().join("t"), false, true).unwrap();
        let header = case.header();
        assert!(header.contains("TESTCASE "));
        assert!(header.contains("Skipping testcase because environment tells us to"));
        assert!(header.starts_with("====="));
    }

    #[cfg(unix)]
    #[test]
    fn run_writes_hints_and_marker() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("rtt-10").join("test");
        let env = FakeEnv::default();
        let ctx = OrchestratorContext::new();
        let launcher = ShellLauncher::new("sh");
        let capture = capture_cfg();
        let rt = Runtime {
            ctx: &ctx,
            environment: &env,
            launcher: &launcher,
            capture: &capture,
            analysis: None,
            options: options(),
        };
        let mut tb = Testbed::default();
        tb.set_rtt(10, None, 0);
        let traffic: TestFn = Rc::new(|run: &mut TestRun<'_>| -> Result<()> {
            let port = run.next_port();
            run.start_traffic(&format!("sleep 30 # port {port}"))?;
            Ok(())
        });
        let actions = TestActions {
            traffic: &traffic,
            pre_hook: None,
            post_hook: None,
        };

        let mut case = TestCase::open(&folder, false, false).unwrap();
        case.run(&rt, &mut tb, &BTreeMap::new(), &actions, false).unwrap();

        assert_eq!(case.state(), TestState::DataCollected);
        assert!(ctx.registered().is_empty());
        assert_eq!(ctx.capture(), None);
        let meta = Metadata::read(&folder).unwrap();
        assert_eq!(meta.lines()[0], ("type".to_string(), "test".to_string()));
        assert_eq!(meta.get("testbed_rtt_servera"), Some("10"));
        assert_eq!(meta.get("testbed_aqm_params_full"), Some("pfifo_aqmt limit 1000"));
        assert_eq!(meta.get("traffic"), Some("sleep 30 # port 5500"));
        assert!(meta.contains(DATA_COLLECTED));
        assert_eq!(tb.traffic_port, 5501);
        assert_eq!(
            *env.calls.borrow(),
            ["reset dry=false", "setup rtt=10 dry=false", "reset dry=false"]
        );

        let err = case
            .run(&rt, &mut tb, &BTreeMap::new(), &actions, false)
            .unwrap_err();
        assert_eq!(err.code(), "MTB-2003");
    }

    #[test]
    fn setup_failure_is_branch_local_and_leaves_no_marker() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("test");
        let env = FakeEnv {
            fail_setup: true,
            ..FakeEnv::default()
        };
        let ctx = OrchestratorContext::new();
        let launcher = ShellLauncher::new("sh");
        let capture = capture_cfg();
        let rt = Runtime {
            ctx: &ctx,
            environment: &env,
            launcher: &launcher,
            capture: &capture,
            analysis: None,
            options: options(),
        };
        let traffic = noop();
        let actions = TestActions {
            traffic: &traffic,
            pre_hook: None,
            post_hook: None,
        };
        let mut case = TestCase::open(&folder, false, false).unwrap();
        let err = case
            .run(&rt, &mut Testbed::default(), &BTreeMap::new(), &actions, false)
            .unwrap_err();
        assert!(err.is_branch_local());
        assert!(!metadata::has_marker(&folder, DATA_COLLECTED).unwrap());
    }

    #[test]
    fn dry_run_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("test");
        let env = FakeEnv::default();
        let ctx = OrchestratorContext::new();
        let launcher = ShellLauncher::new("/nonexistent/shell");
        let capture = capture_cfg();
        let rt = Runtime {
            ctx: &ctx,
            environment: &env,
            launcher: &launcher,
            capture: &capture,
            analysis: None,
            options: options(),
        };
        let traffic: TestFn = Rc::new(|run: &mut TestRun<'_>| -> Result<()> {
            assert!(run.start_traffic("iperf").unwrap().is_none());
            Ok(())
        });
        let actions = TestActions {
            traffic: &traffic,
            pre_hook: None,
            post_hook: None,
        };
        let mut case = TestCase::open(&folder, false, false).unwrap();
        case.run(&rt, &mut Testbed::default(), &BTreeMap::new(), &actions, true)
            .unwrap();
        assert!(!folder.exists());
        assert_eq!(env.calls.borrow()[0], "reset dry=true");
    }

    #[test]
    fn directory_error_cannot_run() {
        let dir = tempfile::tempdir().unwrap();
        let env = FakeEnv::default();
        let ctx = OrchestratorContext::new();
        let launcher = ShellLauncher::new("sh");
        let capture = capture_cfg();
        let rt = Runtime {
            ctx: &ctx,
            environment: &env,
            launcher: &launcher,
            capture: &capture,
            analysis: None,
            options: options(),
        };
        let traffic = noop();
        let actions = TestActions {
            traffic: &traffic,
            pre_hook: None,
            post_hook: None,
        };
        let mut case = TestCase::open(dir.path(), false, false).unwrap();
        let err = case
            .run(&rt, &mut Testbed::default(), &BTreeMap::new(), &actions, false)
            .unwrap_err();
        assert_eq!(err.code(), "MTB-2002");
        assert!(dir.path().exists());
        assert!(env.calls.borrow().is_empty());
    }

    #[test]
    fn analyze_replaces_markers() {
        struct Recording(RefCell<Vec<u64>>);
        impl Analysis for Recording {
            fn analyze(&self, _folder: &Path, samples_to_skip: u64) -> Result<()> {
                self.0.borrow_mut().push(samples_to_skip);
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        for line in ["type test", DATA_COLLECTED, DATA_ANALYZED, "analyzed_aggregated_samples_skipped 99"] {
            metadata::append_line(dir.path(), line).unwrap();
        }
        let case = TestCase::open(dir.path(), false, false).unwrap();
        let analysis = Recording(RefCell::new(Vec::new()));
        let tb = Testbed {
            capture_idle: Some(4.0),
            ..Testbed::default()
        };
        assert_eq!(case.analyze(&analysis, &tb).unwrap(), 4);
        assert_eq!(*analysis.0.borrow(), [4]);

        let meta = Metadata::read(dir.path()).unwrap();
        assert_eq!(meta.values(DATA_ANALYZED).count(), 1);
        assert_eq!(meta.get(ANALYZED_SKIPPED), Some("4"));
        assert!(case.is_analyzed().unwrap());
    }

    #[test]
    fn retest_drops_completion_marker() {
        let dir = tempfile::tempdir().unwrap();
        metadata::append_line(dir.path(), "type test").unwrap();
        metadata::append_line(dir.path(), DATA_COLLECTED).unwrap();
        assert!(retest(dir.path()).unwrap());
        assert!(!retest(dir.path()).unwrap());
        assert_eq!(TestCase::open(dir.path(), false, false).unwrap().state(), TestState::Pending);

        let coll = tempfile::tempdir().unwrap();
        metadata::append_line(coll.path(), "type collection").unwrap();
        assert!(retest(coll.path()).is_err());
    }
}
