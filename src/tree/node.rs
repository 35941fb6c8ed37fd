//! Materialized result tree, rebuilt from metadata files on disk.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::core::errors::{MtbError, Result};
use crate::core::paths::relative_within;
use crate::tree::metadata::Metadata;

/// A node of the materialized tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Node {
    Collection(CollectionNode),
    Leaf(LeafNode),
}

/// A grouping level. Children are either all collections or exactly one
/// leaf.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectionNode {
    pub title: String,
    pub subtitle: String,
    pub titlelabel: String,
    pub children: Vec<Node>,
}

/// A single test folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeafNode {
    pub testcase: PathBuf,
}

impl Node {
    /// Rebuild the subtree rooted at `folder`.
    pub fn load(folder: &Path) -> Result<Self> {
        let meta = Metadata::read(folder)?;
        match meta.get("type") {
            Some("test") => Ok(Self::Leaf(LeafNode {
                testcase: folder.to_path_buf(),
            })),
            Some("collection") => {
                let mut children = Vec::new();
                for sub in meta.values("sub") {
                    children.push(Self::load(&folder.join(sub))?);
                }
                let node = CollectionNode {
                    title: meta.get("title").unwrap_or_default().to_string(),
                    subtitle: meta.get("subtitle").unwrap_or_default().to_string(),
                    titlelabel: meta.get("titlelabel").unwrap_or_default().to_string(),
                    children,
                };
                node.check_shape(folder)?;
                Ok(Self::Collection(node))
            }
            other => Err(MtbError::Metadata {
                path: folder.to_path_buf(),
                details: format!("unknown node type {other:?}"),
            }),
        }
    }

    /// Tests below this node in depth-first order.
    #[must_use]
    pub fn leaves(&self) -> Vec<&Path> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Path>) {
        match self {
            Self::Leaf(leaf) => out.push(&leaf.testcase),
            Self::Collection(collection) => {
                for child in &collection.children {
                    child.collect_leaves(out);
                }
            }
        }
    }
}

impl CollectionNode {
    /// Load a tree whose root must be a collection.
    pub fn load(folder: &Path) -> Result<Self> {
        match Node::load(folder)? {
            Node::Collection(root) => Ok(root),
            Node::Leaf(_) => Err(MtbError::Metadata {
                path: folder.to_path_buf(),
                details: "expected a collection, found a test".to_string(),
            }),
        }
    }

    /// Whether this collection wraps a single test.
    #[must_use]
    pub fn is_leaf_collection(&self) -> bool {
        matches!(self.children.as_slice(), [Node::Leaf(_)])
    }

    /// Number of grouping levels below this node, not counting leaf tests.
    #[must_use]
    pub fn depth(&self) -> usize {
        if self.is_leaf_collection() {
            return 0;
        }
        self.children
            .iter()
            .filter_map(|child| match child {
                Node::Collection(c) => Some(c.depth() + 1),
                Node::Leaf(_) => None,
            })
            .max()
            .unwrap_or(0)
    }

    /// Tests below this collection in depth-first order.
    #[must_use]
    pub fn leaves(&self) -> Vec<&Path> {
        let mut out = Vec::new();
        for child in &self.children {
            child.collect_leaves(&mut out);
        }
        out
    }

    /// Collections directly below, skipping a wrapped test.
    pub fn collections(&self) -> impl Iterator<Item = &Self> {
        self.children.iter().filter_map(|child| match child {
            Node::Collection(c) => Some(c),
            Node::Leaf(_) => None,
        })
    }

    fn check_shape(&self, folder: &Path) -> Result<()> {
        let leaves = self
            .children
            .iter()
            .filter(|child| matches!(child, Node::Leaf(_)))
            .count();
        if leaves > 0 && self.children.len() > 1 {
            return Err(MtbError::Metadata {
                path: folder.to_path_buf(),
                details: "a collection holding a test cannot hold anything else".to_string(),
            });
        }
        Ok(())
    }
}

/// Render a nested HTML list linking every test's outputs.
///
/// Links are relative to `root_folder` so the page can live next to the
/// results.
#[must_use]
pub fn build_html_index(tree: &CollectionNode, root_folder: &Path) -> String {
    let mut body = String::new();
    render_collection(tree, root_folder, &mut body);

    let mut out = String::from("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
    let _ = writeln!(out, "<title>{}</title>", escape_html(&tree.title));
    out.push_str("</head>\n<body>\n");
    if !tree.title.is_empty() {
        let _ = writeln!(out, "<h1>{}</h1>", escape_html(&tree.title));
    }
    if !tree.subtitle.is_empty() {
        let _ = writeln!(out, "<p>{}</p>", escape_html(&tree.subtitle));
    }
    out.push_str(&body);
    out.push_str("</body>\n</html>\n");
    out
}

fn render_collection(node: &CollectionNode, root_folder: &Path, out: &mut String) {
    out.push_str("<ul>\n");
    for child in node.collections() {
        out.push_str("<li>");
        if !child.titlelabel.is_empty() {
            let _ = write!(out, "{}: ", escape_html(&child.titlelabel));
        }
        let _ = write!(out, "<b>{}</b>", escape_html(&child.title));
        match child.children.as_slice() {
            [Node::Leaf(leaf)] => {
                let rel = relative_within(root_folder, &leaf.testcase);
                let rel = escape_html(&rel.to_string_lossy());
                if leaf.testcase.join("analysis.pdf").is_file() {
                    let _ = write!(out, ": <a href=\"{rel}/analysis.pdf\">{rel}</a>");
                } else {
                    out.push_str(": (no pdf)");
                }
                let _ = writeln!(out, " <a href=\"{rel}/details\">setup</a></li>");
            }
            _ => {
                out.push('\n');
                render_collection(child, root_folder, out);
                out.push_str("</li>\n");
            }
        }
    }
    out.push_str("</ul>\n");
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}
