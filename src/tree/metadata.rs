//! Append-only `details` metadata files.
//!
//! One record per line: `key value...`, value possibly empty. Keys may
//! repeat; [`Metadata::get`] returns the last value while
//! [`Metadata::values`] keeps all of them in file order.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::core::errors::{MtbError, Result};

/// File name of the metadata file inside every node directory.
pub const METADATA_FILE: &str = "details";

/// Durable marker: the test finished collecting data.
pub const DATA_COLLECTED: &str = "data_collected";
/// Durable marker: the test's data was post-processed.
pub const DATA_ANALYZED: &str = "data_analyzed";
/// Number of initial samples discarded by the last analysis.
pub const ANALYZED_SKIPPED: &str = "analyzed_aggregated_samples_skipped";

/// Path of the metadata file for a node directory.
#[must_use]
pub fn metadata_path(folder: &Path) -> PathBuf {
    folder.join(METADATA_FILE)
}

/// Parsed metadata file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    lines: Vec<(String, String)>,
}

impl Metadata {
    /// Read the metadata file of `folder`.
    pub fn read(folder: &Path) -> Result<Self> {
        let path = metadata_path(folder);
        if !path.is_file() {
            return Err(MtbError::Metadata {
                path,
                details: "missing metadata file".to_string(),
            });
        }
        let raw = fs::read_to_string(&path).map_err(|source| MtbError::io(&path, source))?;
        Ok(Self::parse(&raw))
    }

    /// Parse metadata text. Blank lines are ignored.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let lines = raw
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                if line.is_empty() {
                    return None;
                }
                let (key, value) = line
                    .split_once(char::is_whitespace)
                    .map_or((line, ""), |(k, v)| (k, v.trim()));
                Some((key.to_string(), value.to_string()))
            })
            .collect();
        Self { lines }
    }

    /// Last value recorded for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Every value recorded for `key`, in file order.
    pub fn values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.lines
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Whether any line has `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.lines.iter().any(|(k, _)| k == key)
    }

    /// All records in file order.
    #[must_use]
    pub fn lines(&self) -> &[(String, String)] {
        &self.lines
    }
}

/// Append one record line to the metadata file of `folder`, creating the
/// folder if needed.
pub fn append_line(folder: &Path, text: &str) -> Result<()> {
    fs::create_dir_all(folder).map_err(|source| MtbError::io(folder, source))?;
    let path = metadata_path(folder);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|source| MtbError::io(&path, source))?;
    // One write per line so a concurrent tail never sees half a record.
    let line = format!("{text}\n");
    file.write_all(line.as_bytes())
        .map_err(|source| MtbError::io(&path, source))
}

/// Whether the metadata file of `folder` records `key`. A missing file
/// counts as "no".
pub fn has_marker(folder: &Path, key: &str) -> Result<bool> {
    if !metadata_path(folder).is_file() {
        return Ok(false);
    }
    Ok(Metadata::read(folder)?.contains(key))
}

/// Delete the metadata file of `folder` if present.
pub fn remove_all(folder: &Path) -> Result<()> {
    let path = metadata_path(folder);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(MtbError::io(&path, source)),
    }
}

/// Drop every line whose key is in `keys`, keeping the rest in order.
pub fn remove_keys(folder: &Path, keys: &[&str]) -> Result<()> {
    let path = metadata_path(folder);
    if !path.is_file() {
        return Ok(());
    }
    let raw = fs::read_to_string(&path).map_err(|source| MtbError::io(&path, source))?;
    let kept: String = raw
        .lines()
        .filter(|line| {
            line.split_whitespace()
                .next()
                .is_none_or(|key| !keys.contains(&key))
        })
        .map(|line| format!("{line}\n"))
        .collect();
    fs::write(&path, kept).map_err(|source| MtbError::io(&path, source))
}
