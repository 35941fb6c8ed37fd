#![forbid(unsafe_code)]

//! Matrix testbed (mtb): declarative test-matrix runner for AQM networking
//! testbeds.
//!
//! A plan is an ordered list of steps, each branching over one axis of the
//! configuration (scheduler, RTT, link rate, repetitions, ...), ending in a
//! traffic action. The walker enumerates every combination depth-first,
//! runs each as an isolated experiment in its own folder and records the
//! grouping as a tree of metadata files that can later be regrouped.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use matrix_testbed::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use matrix_testbed::core::config::Config;
//! use matrix_testbed::runner::walker::{TestPlan, Walker};
//! ```

pub mod prelude;

pub mod core;
pub mod logger;
pub mod process;
pub mod runner;
pub mod testbed;
pub mod tree;
