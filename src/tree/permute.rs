//! Reordering the grouping levels of a materialized tree.
//!
//! A requested level order is decomposed into adjacent-level pivots, the
//! same way a bubble sort decomposes a permutation into adjacent swaps.
//! Each pivot swaps the grouping precedence of two neighbouring levels and
//! never adds, drops or reorders tests within a group.

use crate::core::errors::{MtbError, Result};
use crate::tree::node::{CollectionNode, Node};

/// Validate a requested level order against a tree of `depth` levels and
/// append the omitted levels in their original relative order.
pub fn complete_level_order(level_order: &[usize], depth: usize) -> Result<Vec<usize>> {
    let mut order = Vec::with_capacity(depth);
    for &level in level_order {
        if level >= depth {
            return Err(MtbError::configuration(format!(
                "level {level} out of bounds, tree only has {depth} levels"
            )));
        }
        if order.contains(&level) {
            return Err(MtbError::configuration(format!(
                "duplicate level {level} in level order"
            )));
        }
        order.push(level);
    }
    for level in 0..depth {
        if !order.contains(&level) {
            order.push(level);
        }
    }
    Ok(order)
}

/// Adjacent pivots that turn the identity order into `order`.
///
/// `order` must be a permutation of `0..order.len()`.
#[must_use]
pub fn build_pivot_list(order: &[usize]) -> Vec<usize> {
    let mut pivots = Vec::new();
    let mut remaining: Vec<usize> = (0..order.len()).collect();
    for (i, target) in order.iter().enumerate() {
        let Some(offset) = remaining.iter().position(|level| level == target) else {
            continue;
        };
        // Walk the target up one level at a time until it sits at `i`.
        for step in 0..offset {
            pivots.push(i + offset - step - 1);
        }
        remaining.remove(offset);
    }
    pivots
}

/// Swap the grouping of the levels `level` and `level + 1`.
///
/// Level 0 is the root's immediate children. Nodes at `level + 1` are
/// grouped by title in first-seen order; each group receives copies of the
/// level-`level` nodes that contained it, holding the moved node's former
/// children.
pub fn pivot(tree: CollectionNode, level: usize) -> Result<CollectionNode> {
    if level > 0 {
        let CollectionNode {
            title,
            subtitle,
            titlelabel,
            children,
        } = tree;
        let children = children
            .into_iter()
            .map(|child| match child {
                Node::Collection(c) if !c.is_leaf_collection() => {
                    pivot(c, level - 1).map(Node::Collection)
                }
                other => Err(beyond_depth(level, &other)),
            })
            .collect::<Result<Vec<_>>>()?;
        return Ok(CollectionNode {
            title,
            subtitle,
            titlelabel,
            children,
        });
    }

    let CollectionNode {
        title,
        subtitle,
        titlelabel,
        children,
    } = tree;
    let mut groups: Vec<CollectionNode> = Vec::new();
    for outer in children {
        let outer = match outer {
            Node::Collection(c) if !c.is_leaf_collection() => c,
            other => return Err(beyond_depth(level, &other)),
        };
        for inner in outer.children {
            let Node::Collection(inner) = inner else {
                return Err(MtbError::configuration(
                    "cannot pivot a level that directly holds tests",
                ));
            };
            let moved = CollectionNode {
                title: outer.title.clone(),
                subtitle: outer.subtitle.clone(),
                titlelabel: outer.titlelabel.clone(),
                children: inner.children,
            };
            if let Some(group) = groups.iter_mut().find(|g| g.title == inner.title) {
                group.children.push(Node::Collection(moved));
            } else {
                groups.push(CollectionNode {
                    title: inner.title,
                    subtitle: inner.subtitle,
                    titlelabel: inner.titlelabel,
                    children: vec![Node::Collection(moved)],
                });
            }
        }
    }

    Ok(CollectionNode {
        title,
        subtitle,
        titlelabel,
        children: groups.into_iter().map(Node::Collection).collect(),
    })
}

fn beyond_depth(level: usize, node: &Node) -> MtbError {
    let what = match node {
        Node::Leaf(_) => "a test",
        Node::Collection(_) => "a collection of tests",
    };
    MtbError::configuration(format!("pivot at level {level} reaches {what}"))
}

/// Reorder the levels of `tree` so that old level `level_order[i]` ends up
/// at position `i`.
pub fn reorder_levels(tree: CollectionNode, level_order: &[usize]) -> Result<CollectionNode> {
    if level_order.is_empty() {
        return Ok(tree);
    }
    let depth = tree.depth();
    let order = complete_level_order(level_order, depth)?;
    let pivots = build_pivot_list(&order);
    if let Some(&max) = pivots.iter().max()
        && max + 1 >= depth
    {
        return Err(MtbError::configuration(format!(
            "pivot at level {max} needs {} levels, tree only has {depth}",
            max + 2
        )));
    }
    pivots.into_iter().try_fold(tree, pivot)
}
