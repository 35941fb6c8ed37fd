//! Testbed configuration and the collaborators that act on it.

pub mod capture;
pub mod environment;
pub mod model;

pub use capture::{Analysis, CommandAnalysis, capture_command, capture_filter};
pub use environment::{Environment, ShellEnvironment};
pub use model::{EcnMode, MBIT, NodePair, Testbed};
