//! Logging: human-readable tracing output on stderr plus the JSONL run
//! journal.

pub mod jsonl;

use tracing_subscriber::EnvFilter;

use crate::core::config::{Config, LoggingConfig};
use crate::logger::jsonl::{JsonlConfig, JsonlWriter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when set. Calling this twice
/// is harmless; the second subscriber is ignored.
pub fn init_tracing(cfg: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Open the run journal configured in `cfg`.
pub fn open_journal(cfg: &Config) -> JsonlWriter {
    JsonlWriter::open(JsonlConfig {
        path: cfg.paths.journal.clone(),
        fallback_path: cfg.paths.journal_fallback.clone(),
        ..JsonlConfig::default()
    })
}
