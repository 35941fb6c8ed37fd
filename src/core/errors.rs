//! MTB-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, MtbError>;

/// Top-level error type for the matrix testbed runner.
#[derive(Debug, Error)]
pub enum MtbError {
    #[error("[MTB-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[MTB-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[MTB-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    /// Test plan or tree construction problem; raised before any side effect.
    #[error("[MTB-1101] test plan configuration error: {details}")]
    Configuration { details: String },

    /// Testbed reset/setup exited non-zero. Only the current test is lost.
    #[error("[MTB-2001] testbed {action} failed: {details}")]
    Environment {
        action: &'static str,
        details: String,
    },

    #[error("[MTB-2002] unrecognized test directory {path}: {reason}")]
    DirectoryState { path: PathBuf, reason: String },

    #[error("[MTB-2003] invalid test state transition for {path}: {details}")]
    InvalidTransition { path: PathBuf, details: String },

    #[error("[MTB-2101] malformed metadata in {path}: {details}")]
    Metadata { path: PathBuf, details: String },

    #[error("[MTB-3001] process failure ({context}): {details}")]
    Process {
        context: &'static str,
        details: String,
    },

    #[error("[MTB-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[MTB-3003] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[MTB-3901] walk cancelled by signal")]
    Cancelled,
}

impl MtbError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "MTB-1001",
            Self::MissingConfig { .. } => "MTB-1002",
            Self::ConfigParse { .. } => "MTB-1003",
            Self::Configuration { .. } => "MTB-1101",
            Self::Environment { .. } => "MTB-2001",
            Self::DirectoryState { .. } => "MTB-2002",
            Self::InvalidTransition { .. } => "MTB-2003",
            Self::Metadata { .. } => "MTB-2101",
            Self::Process { .. } => "MTB-3001",
            Self::Io { .. } => "MTB-3002",
            Self::Serialization { .. } => "MTB-3003",
            Self::Cancelled => "MTB-3901",
        }
    }

    /// Whether the walker may log this error and move on to the next branch.
    ///
    /// Everything else aborts the whole walk.
    #[must_use]
    pub const fn is_branch_local(&self) -> bool {
        matches!(self, Self::Environment { .. })
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Convenience constructor for plan/tree configuration errors.
    #[must_use]
    pub fn configuration(details: impl Into<String>) -> Self {
        Self::Configuration {
            details: details.into(),
        }
    }
}

impl From<serde_json::Error> for MtbError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for MtbError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
