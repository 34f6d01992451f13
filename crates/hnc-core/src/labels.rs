//! Label synchronizer.
//!
//! Computes the depth labels a namespace should carry and merges them into its
//! current label set. A depth label maps an ancestor name to the number of
//! parent links between the namespace and that ancestor; every participating
//! namespace carries its own label at depth `0`.
//!
//! Externally-managed namespaces are roots whose own depth labels are trusted
//! input. When the walk from a namespace reaches one, the external labels are
//! merged in, offset by the distance already walked.
//!
//! Cycle members carry only their own label. A namespace hanging off a cycle
//! keeps labels up to and including the first cycle member on its chain.
//!
//! Excluded namespaces have no hierarchy, so they carry no depth labels at
//! all, not even their own.

use std::collections::BTreeMap;

use crate::api::{LABEL_INCLUDED_NAMESPACE, is_tree_label, tree_label_key};
use crate::cycle::find_cycle;
use crate::forest::Forest;

/// Computes the ancestor depths of `name`, keyed by ancestor name.
///
/// The result always contains `name` at depth `0`.
#[must_use]
pub fn compute_tree_depths(forest: &Forest, name: &str) -> BTreeMap<String, u32> {
    let mut depths = BTreeMap::new();
    let Some(node) = forest.get(name) else {
        depths.insert(name.to_string(), 0);
        return depths;
    };

    if node.is_managed_externally() {
        depths.clone_from(node.external_tree_labels());
        depths.insert(name.to_string(), 0);
        return depths;
    }
    depths.insert(name.to_string(), 0);

    let entry = match find_cycle(forest, name) {
        Some(cycle) if cycle.first().is_some_and(|first| first == name) => return depths,
        Some(mut cycle) if !cycle.is_empty() => Some(cycle.swap_remove(0)),
        _ => None,
    };

    let mut depth: u32 = 0;
    for ancestor in forest.ancestors(name) {
        depth = depth.saturating_add(1);
        depths.insert(ancestor.to_string(), depth);

        if let Some(node) = forest.get(ancestor).filter(|n| n.is_managed_externally()) {
            for (external, external_depth) in node.external_tree_labels() {
                depths
                    .entry(external.clone())
                    .or_insert_with(|| external_depth.saturating_add(depth));
            }
            break;
        }
        if entry.as_deref() == Some(ancestor) {
            break;
        }
    }
    depths
}

/// What [`sync_labels`] should enforce on one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelPlan {
    /// The complete set of depth labels to carry. Any other depth label is
    /// removed.
    pub tree: BTreeMap<String, u32>,
    /// Whether the namespace takes part in the hierarchy.
    pub included: bool,
}

impl LabelPlan {
    /// Plan for a participating namespace.
    #[must_use]
    pub const fn included(tree: BTreeMap<String, u32>) -> Self {
        Self {
            tree,
            included: true,
        }
    }

    /// Plan for an excluded namespace: no depth labels and no marker.
    #[must_use]
    pub const fn excluded() -> Self {
        Self {
            tree: BTreeMap::new(),
            included: false,
        }
    }
}

/// Returns `current` with hierarchy-owned labels replaced according to `plan`.
///
/// Labels that are not depth labels or the inclusion marker pass through
/// unchanged. Stale depth labels are removed, not merged.
#[must_use]
pub fn sync_labels(
    current: &BTreeMap<String, String>,
    plan: &LabelPlan,
) -> BTreeMap<String, String> {
    let mut labels = current.clone();

    labels.retain(|key, _| !is_tree_label(key));
    for (ancestor, depth) in &plan.tree {
        labels.insert(tree_label_key(ancestor), depth.to_string());
    }

    if plan.included {
        labels.insert(LABEL_INCLUDED_NAMESPACE.to_string(), "true".to_string());
    } else {
        labels.remove(LABEL_INCLUDED_NAMESPACE);
    }
    labels
}
