//! Result tree: metadata files, walk-time collections, the materialized
//! tree and level permutation.

pub mod collection;
pub mod metadata;
pub mod node;
pub mod permute;

pub use collection::{BranchDescriptor, NodeId, ResultTree, TEST_FOLDER};
pub use node::{CollectionNode, LeafNode, Node, build_html_index};
pub use permute::{build_pivot_list, complete_level_order, pivot, reorder_levels};
