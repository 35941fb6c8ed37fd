//! Background process management: registry, orchestrator context with
//! signal handling, and launchers.

pub mod context;
pub mod launcher;
pub mod registry;

pub use context::{EXIT_CANCELLED, OrchestratorContext, SignalOutcome, SignalWatcher};
pub use launcher::{Launcher, ShellLauncher, TmuxLauncher};
pub use registry::{ProcessRegistry, is_running, terminate, wait_for};
