//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use matrix_testbed::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{MtbError, Result};

// Processes
pub use crate::process::context::{OrchestratorContext, SignalWatcher};
pub use crate::process::launcher::{Launcher, ShellLauncher, TmuxLauncher};

// Testbed
pub use crate::testbed::capture::{Analysis, CommandAnalysis};
pub use crate::testbed::environment::{Environment, ShellEnvironment};
pub use crate::testbed::model::{EcnMode, NodePair, Testbed};

// Tree
pub use crate::tree::node::{CollectionNode, Node, build_html_index};
pub use crate::tree::permute::reorder_levels;

// Runner
pub use crate::runner::plan::PlanFile;
pub use crate::runner::runtime::{RunOptions, Runtime};
pub use crate::runner::steps::{Step, TestDef};
pub use crate::runner::testcase::{TestFn, TestRun};
pub use crate::runner::walker::{DryRunSummary, TestPlan, WalkReport, Walker};
