//! Walk-time result tree.
//!
//! Collections are created eagerly while a plan is walked, but nothing is
//! written for them until a test underneath actually produced data: the
//! first [`ResultTree::add_child`] on a node writes its own metadata and
//! then registers the node with its parent, once, all the way up. Branches
//! that failed or were skipped therefore leave no trace on disk.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{MtbError, Result};
use crate::core::paths::is_valid_tag;
use crate::tree::metadata;

/// Folder name of the single test inside a leaf collection.
pub const TEST_FOLDER: &str = "test";

/// One concrete branch along a configuration axis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchDescriptor {
    /// Child directory name; unique among siblings.
    pub tag: String,
    pub title: String,
    pub titlelabel: String,
}

impl BranchDescriptor {
    pub fn new(
        tag: impl Into<String>,
        title: impl Into<String>,
        titlelabel: impl Into<String>,
    ) -> Self {
        Self {
            tag: tag.into(),
            title: title.into(),
            titlelabel: titlelabel.into(),
        }
    }
}

/// Handle to a collection inside a [`ResultTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug)]
struct CollectionState {
    folder: PathBuf,
    title: Option<String>,
    subtitle: Option<String>,
    titlelabel: Option<String>,
    parent: Option<NodeId>,
    tags_used: Vec<String>,
    registered: Vec<String>,
    metadata_written: bool,
    told_parent: bool,
    test_claimed: bool,
}

impl CollectionState {
    fn new(folder: PathBuf, parent: Option<NodeId>) -> Self {
        Self {
            folder,
            title: None,
            subtitle: None,
            titlelabel: None,
            parent,
            tags_used: Vec::new(),
            registered: Vec::new(),
            metadata_written: false,
            told_parent: false,
            test_claimed: false,
        }
    }
}

/// Arena of collections built during one pass of a plan walk.
#[derive(Debug)]
pub struct ResultTree {
    nodes: Vec<CollectionState>,
}

impl ResultTree {
    /// Start a tree rooted at `folder`.
    pub fn new(folder: impl Into<PathBuf>, title: Option<&str>, subtitle: Option<&str>) -> Self {
        let mut root = CollectionState::new(folder.into(), None);
        root.title = title.map(str::to_string);
        root.subtitle = subtitle.map(str::to_string);
        Self { nodes: vec![root] }
    }

    #[must_use]
    pub const fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Folder of a collection.
    #[must_use]
    pub fn folder(&self, node: NodeId) -> &Path {
        &self.nodes[node.0].folder
    }

    #[must_use]
    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes[node.0].parent
    }

    /// Whether the collection's metadata has been written to disk.
    #[must_use]
    pub fn is_materialized(&self, node: NodeId) -> bool {
        self.nodes[node.0].metadata_written
    }

    /// Child directory names registered so far, in order.
    #[must_use]
    pub fn registered_children(&self, node: NodeId) -> &[String] {
        &self.nodes[node.0].registered
    }

    /// Number of collections in the arena, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Record `tag` as used under `node`. Fails on a duplicate.
    pub fn check_and_add_tag(&mut self, node: NodeId, tag: &str) -> Result<()> {
        if !is_valid_tag(tag) {
            return Err(MtbError::configuration(format!(
                "tag {tag:?} is not a valid folder name"
            )));
        }
        let state = &mut self.nodes[node.0];
        if state.tags_used.iter().any(|used| used == tag) {
            return Err(MtbError::configuration(format!(
                "tag must be unique inside the same collection (tag: {tag}, collection: {})",
                state.folder.display()
            )));
        }
        state.tags_used.push(tag.to_string());
        Ok(())
    }

    /// Create a child collection for `branch` under `parent`. No disk
    /// access happens here.
    pub fn add_collection(&mut self, parent: NodeId, branch: &BranchDescriptor) -> Result<NodeId> {
        let state = &self.nodes[parent.0];
        if state.test_claimed {
            return Err(MtbError::configuration(format!(
                "a collection cannot contain both a test and sub-collections ({}, tag: {})",
                state.folder.display(),
                branch.tag
            )));
        }
        self.check_and_add_tag(parent, &branch.tag)?;
        let folder = self.nodes[parent.0].folder.join(&branch.tag);
        let mut state = CollectionState::new(folder, Some(parent));
        state.title = Some(branch.title.clone());
        state.titlelabel = Some(branch.titlelabel.clone());
        self.nodes.push(state);
        Ok(NodeId(self.nodes.len() - 1))
    }

    /// Reserve the single test slot of a leaf collection and return the
    /// test's folder.
    pub fn claim_test(&mut self, node: NodeId) -> Result<PathBuf> {
        let state = &mut self.nodes[node.0];
        if state.test_claimed {
            return Err(MtbError::configuration(format!(
                "a collection cannot contain multiple tests ({})",
                state.folder.display()
            )));
        }
        if !state.tags_used.is_empty() {
            return Err(MtbError::configuration(format!(
                "a collection cannot contain both a test and sub-collections ({})",
                state.folder.display()
            )));
        }
        state.test_claimed = true;
        Ok(state.folder.join(TEST_FOLDER))
    }

    /// Register `child_dir` as holding data under `node`, materializing
    /// `node` and its ancestors on first use.
    pub fn add_child(&mut self, node: NodeId, child_dir: &str) -> Result<()> {
        let mut current = node;
        let mut child = child_dir.to_string();
        loop {
            let state = &mut self.nodes[current.0];
            if !state.metadata_written {
                write_collection_header(state)?;
                state.metadata_written = true;
            }
            metadata::append_line(&state.folder, &format!("sub {child}"))?;
            state.registered.push(child);

            match state.parent {
                Some(parent) if !state.told_parent => {
                    state.told_parent = true;
                    child = state
                        .folder
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    current = parent;
                }
                _ => return Ok(()),
            }
        }
    }
}

fn write_collection_header(state: &CollectionState) -> Result<()> {
    // A stale file from an earlier run would duplicate `sub` lines.
    metadata::remove_all(&state.folder)?;
    metadata::append_line(&state.folder, "type collection")?;
    if let Some(title) = &state.title {
        metadata::append_line(&state.folder, &format!("title {title}"))?;
    }
    if let Some(subtitle) = &state.subtitle {
        metadata::append_line(&state.folder, &format!("subtitle {subtitle}"))?;
    }
    if let Some(titlelabel) = &state.titlelabel {
        metadata::append_line(&state.folder, &format!("titlelabel {titlelabel}"))?;
    }
    Ok(())
}
