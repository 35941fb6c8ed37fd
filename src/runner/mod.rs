//! Plan execution: the step DSL, the two-pass walker, per-test lifecycle
//! and TOML plan files.

pub mod plan;
pub mod runtime;
pub mod steps;
pub mod testcase;
pub mod walker;

pub use plan::PlanFile;
pub use runtime::{RunOptions, Runtime};
pub use steps::{
    AxisStep, BranchEvent, CcSetting, CustomBranch, RunIf, Sched, Step, StepRun, TestDef,
    add_post_hook, add_pre_hook, branch_bitrate, branch_cc, branch_custom, branch_repeat,
    branch_rtt, branch_runif, branch_sched, branch_udp_rate, html_index, skip_if,
};
pub use testcase::{TestActions, TestCase, TestFn, TestRun, TestState, retest};
pub use walker::{DryRunSummary, TestPlan, WalkReport, Walker};
