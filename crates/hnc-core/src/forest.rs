//! The forest: an in-memory directed graph of namespaces keyed by name.
//!
//! Each [`Node`] holds the inputs observed for one namespace (declared and
//! honored parent, management mode, external depth labels, exclusion) plus
//! the conditions last derived for it. Edges point from child to parent by
//! name, never by reference, so a parent that does not exist is a legal,
//! meaningful state ("parent missing").
//!
//! The forest also maintains a children index keyed by parent name. The index
//! is updated on every parent change and is independent of whether the parent
//! node itself exists, so children waiting on a missing parent can be found
//! the moment it appears.
//!
//! # Invariants
//!
//! - [INV-FOREST-001] `children(p)` is exactly `{n : n.parent == Some(p)}`.
//! - [INV-FOREST-002] [`Forest::ancestors`] yields at most `len()` names and
//!   stops at the first repeated name or the first name with no node.
//!
//! # Contracts
//!
//! - [CTR-FOREST-001] Nothing here blocks or performs I/O; callers provide the
//!   locking.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use crate::api::Condition;

// =============================================================================
// Node
// =============================================================================

/// Observed inputs for one namespace, replaced wholesale on every upsert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInputs {
    /// Parent requested by the declared-hierarchy object.
    pub declared_parent: Option<String>,
    /// Parent edge actually honored in the graph.
    ///
    /// Differs from `declared_parent` when the edge is illegal (excluded
    /// parent, externally-managed or excluded child).
    pub parent: Option<String>,
    /// Whether an actor outside this system owns the hierarchy metadata.
    pub managed_externally: bool,
    /// Depth labels supplied by the external manager.
    pub external_tree_labels: BTreeMap<String, u32>,
    /// Whether the namespace is excluded from the hierarchy.
    pub excluded: bool,
}

impl NodeInputs {
    /// Inputs for an internally-managed namespace with a legal parent.
    #[must_use]
    pub fn with_parent(parent: impl Into<String>) -> Self {
        let parent = parent.into();
        Self {
            declared_parent: Some(parent.clone()),
            parent: Some(parent),
            ..Self::default()
        }
    }

    /// Inputs for an externally-managed namespace.
    #[must_use]
    pub fn external(external_tree_labels: BTreeMap<String, u32>) -> Self {
        Self {
            managed_externally: true,
            external_tree_labels,
            ..Self::default()
        }
    }

    /// Inputs for an excluded namespace.
    #[must_use]
    pub fn excluded() -> Self {
        Self {
            excluded: true,
            ..Self::default()
        }
    }
}

/// One namespace known to the forest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    name: String,
    inputs: NodeInputs,
    conditions: Vec<Condition>,
}

impl Node {
    /// Namespace name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Honored parent edge, which may dangle.
    #[must_use]
    pub fn parent(&self) -> Option<&str> {
        self.inputs.parent.as_deref()
    }

    /// Parent as declared, whether or not it is honored.
    #[must_use]
    pub fn declared_parent(&self) -> Option<&str> {
        self.inputs.declared_parent.as_deref()
    }

    /// Whether the hierarchy metadata is owned externally.
    #[must_use]
    pub const fn is_managed_externally(&self) -> bool {
        self.inputs.managed_externally
    }

    /// Depth labels supplied by the external manager.
    #[must_use]
    pub const fn external_tree_labels(&self) -> &BTreeMap<String, u32> {
        &self.inputs.external_tree_labels
    }

    /// Whether the namespace is excluded.
    #[must_use]
    pub const fn is_excluded(&self) -> bool {
        self.inputs.excluded
    }

    /// Conditions recorded by the last reconciliation.
    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }
}

/// Result of [`Forest::upsert_node`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Upsert {
    /// Names whose children set changed: the old and the new parent.
    pub relinked: BTreeSet<String>,
    /// The node did not exist before this call.
    pub created: bool,
    /// Any input differs from what was stored before.
    pub changed: bool,
}

// =============================================================================
// Forest
// =============================================================================

/// In-memory hierarchy of namespaces.
#[derive(Debug, Clone, Default)]
pub struct Forest {
    nodes: HashMap<String, Node>,
    children: HashMap<String, BTreeSet<String>>,
}

impl Forest {
    /// Creates an empty forest.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of known namespaces.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if no namespace is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns `true` if `name` is a known namespace.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Looks up a node.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    /// Sorted names of every known namespace.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Honored parent of `name`, if the node exists and has one.
    #[must_use]
    pub fn parent_of(&self, name: &str) -> Option<&str> {
        self.nodes.get(name).and_then(Node::parent)
    }

    /// Replaces the inputs of `name`, creating the node if needed.
    ///
    /// Conditions recorded on an existing node are kept until the next
    /// [`Forest::set_conditions`].
    pub fn upsert_node(&mut self, name: &str, inputs: NodeInputs) -> Upsert {
        let mut upsert = Upsert::default();

        let old_parent = match self.nodes.get_mut(name) {
            Some(node) => {
                if node.inputs == inputs {
                    return upsert;
                }
                let old = std::mem::replace(&mut node.inputs, inputs);
                upsert.changed = true;
                old.parent
            },
            None => {
                self.nodes.insert(
                    name.to_string(),
                    Node {
                        name: name.to_string(),
                        inputs,
                        conditions: Vec::new(),
                    },
                );
                upsert.created = true;
                upsert.changed = true;
                None
            },
        };

        let new_parent = self.nodes.get(name).and_then(|n| n.inputs.parent.clone());
        if old_parent != new_parent {
            if let Some(old) = old_parent {
                self.unlink(name, &old);
                upsert.relinked.insert(old);
            }
            if let Some(new) = new_parent {
                self.children
                    .entry(new.clone())
                    .or_default()
                    .insert(name.to_string());
                upsert.relinked.insert(new);
            }
        }
        upsert
    }

    /// Deletes `name`, returning the removed node.
    ///
    /// Children keep pointing at `name` by value; their edge now dangles and
    /// resolves to "parent missing" on their next reconciliation.
    pub fn remove_node(&mut self, name: &str) -> Option<Node> {
        let node = self.nodes.remove(name)?;
        if let Some(parent) = node.parent() {
            self.unlink(name, parent);
        }
        Some(node)
    }

    /// Records the conditions derived for `name`. No-op for unknown names.
    pub fn set_conditions(&mut self, name: &str, conditions: Vec<Condition>) {
        if let Some(node) = self.nodes.get_mut(name) {
            node.conditions = conditions;
        }
    }

    /// Sorted names whose honored parent is `name`.
    pub fn children(&self, name: &str) -> impl Iterator<Item = &str> + '_ {
        self.children
            .get(name)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    /// Lazily walks parent links from `name`, excluding `name` itself.
    ///
    /// The walk yields only names that resolve to nodes and stops at the first
    /// repeated name, so it terminates on cycles.
    #[must_use]
    pub fn ancestors(&self, name: &str) -> Ancestors<'_> {
        let start = self.nodes.get(name);
        let mut seen = HashSet::new();
        if let Some(node) = start {
            seen.insert(node.name.as_str());
        }
        Ancestors {
            forest: self,
            next: start.and_then(Node::parent),
            seen,
            remaining: self.nodes.len(),
        }
    }

    /// Transitive closure of [`Forest::children`] in breadth-first order,
    /// excluding `name`.
    ///
    /// Tracks visited names so a cycle through `name` does not loop.
    #[must_use]
    pub fn descendants(&self, name: &str) -> Vec<String> {
        let mut visited: HashSet<&str> = HashSet::new();
        visited.insert(name);
        let mut order = Vec::new();
        let mut frontier: VecDeque<&str> = self.children(name).collect();
        while let Some(current) = frontier.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            order.push(current.to_string());
            frontier.extend(self.children(current));
        }
        order
    }

    fn unlink(&mut self, child: &str, parent: &str) {
        if let Some(set) = self.children.get_mut(parent) {
            set.remove(child);
            if set.is_empty() {
                self.children.remove(parent);
            }
        }
    }
}

/// Iterator returned by [`Forest::ancestors`].
#[derive(Debug)]
pub struct Ancestors<'a> {
    forest: &'a Forest,
    next: Option<&'a str>,
    seen: HashSet<&'a str>,
    remaining: usize,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let current = self.next.take()?;
        if self.remaining == 0 || !self.seen.insert(current) {
            return None;
        }
        let node = self.forest.nodes.get(current)?;
        self.remaining -= 1;
        self.next = node.parent();
        Some(node.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn chain(forest: &mut Forest, edges: &[(&str, Option<&str>)]) {
        for (name, parent) in edges {
            let inputs = parent.map_or_else(NodeInputs::default, NodeInputs::with_parent);
            forest.upsert_node(name, inputs);
        }
    }

    fn names<'a>(iter: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
        iter.collect()
    }

    #[test]
    fn upsert_reports_old_and_new_parent() {
        let mut forest = Forest::new();
        chain(&mut forest, &[("a", None), ("b", None), ("c", Some("a"))]);

        let upsert = forest.upsert_node("c", NodeInputs::with_parent("b"));
        assert!(upsert.changed);
        assert!(!upsert.created);
        assert_eq!(upsert.relinked, BTreeSet::from(["a".to_string(), "b".to_string()]));
        assert!(forest.children("a").next().is_none());
        assert_eq!(names(forest.children("b")), vec!["c"]);
    }

    #[test]
    fn identical_upsert_is_a_no_op() {
        let mut forest = Forest::new();
        let first = forest.upsert_node("a", NodeInputs::with_parent("p"));
        assert!(first.created);
        assert_eq!(first.relinked, BTreeSet::from(["p".to_string()]));

        let second = forest.upsert_node("a", NodeInputs::with_parent("p"));
        assert_eq!(second, Upsert::default());
    }

    #[test]
    fn children_of_missing_parent_are_indexed() {
        let mut forest = Forest::new();
        chain(&mut forest, &[("kid", Some("ghost"))]);
        assert!(!forest.contains("ghost"));
        assert_eq!(names(forest.children("ghost")), vec!["kid"]);
        assert!(forest.ancestors("kid").next().is_none());
    }

    #[test]
    fn remove_node_leaves_children_dangling() {
        let mut forest = Forest::new();
        chain(&mut forest, &[("root", None), ("mid", Some("root")), ("leaf", Some("mid"))]);

        let removed = forest.remove_node("mid").unwrap();
        assert_eq!(removed.parent(), Some("root"));
        assert!(forest.children("root").next().is_none());
        assert_eq!(names(forest.children("mid")), vec!["leaf"]);
        assert_eq!(forest.parent_of("leaf"), Some("mid"));
        assert!(forest.ancestors("leaf").next().is_none());
        assert!(forest.remove_node("mid").is_none());
    }

    #[test]
    fn ancestors_walk_in_order() {
        let mut forest = Forest::new();
        chain(
            &mut forest,
            &[("a", None), ("b", Some("a")), ("d", Some("b")), ("f", Some("d"))],
        );
        assert_eq!(names(forest.ancestors("f")), vec!["d", "b", "a"]);
        assert!(forest.ancestors("a").next().is_none());
        assert!(forest.ancestors("unknown").next().is_none());
    }

    #[test]
    fn ancestors_stop_at_cycle_boundary() {
        let mut forest = Forest::new();
        chain(
            &mut forest,
            &[("a", Some("d")), ("b", Some("a")), ("d", Some("b")), ("f", Some("d"))],
        );
        assert_eq!(names(forest.ancestors("f")), vec!["d", "b", "a"]);
        assert_eq!(names(forest.ancestors("a")), vec!["d", "b"]);

        forest.upsert_node("self", NodeInputs::with_parent("self"));
        assert!(forest.ancestors("self").next().is_none());
    }

    #[test]
    fn descendants_terminate_on_cycles() {
        let mut forest = Forest::new();
        chain(
            &mut forest,
            &[("a", Some("d")), ("b", Some("a")), ("d", Some("b")), ("f", Some("d"))],
        );
        let mut descendants = forest.descendants("a");
        descendants.sort();
        assert_eq!(descendants, vec!["b", "d", "f"]);
    }

    #[test]
    fn excluded_inputs_drop_the_edge() {
        let mut forest = Forest::new();
        chain(&mut forest, &[("p", None), ("x", Some("p"))]);
        let upsert = forest.upsert_node("x", NodeInputs::excluded());
        assert_eq!(upsert.relinked, BTreeSet::from(["p".to_string()]));
        assert!(forest.get("x").unwrap().is_excluded());
        assert!(forest.children("p").next().is_none());
    }

    #[test]
    fn conditions_survive_input_updates() {
        let mut forest = Forest::new();
        forest.upsert_node("a", NodeInputs::default());
        let condition = Condition::activities_halted(crate::ConditionReason::InCycle, "x");
        forest.set_conditions("a", vec![condition.clone()]);
        forest.upsert_node("a", NodeInputs::with_parent("b"));
        assert_eq!(forest.get("a").unwrap().conditions(), &[condition]);
    }

    // =========================================================================
    // Property Tests
    // =========================================================================

    const NAMES: [&str; 6] = ["n0", "n1", "n2", "n3", "n4", "n5"];

    fn arb_ops() -> impl Strategy<Value = Vec<(usize, Option<usize>, bool)>> {
        prop::collection::vec(
            (0..NAMES.len(), prop::option::of(0..NAMES.len()), any::<bool>()),
            1..40,
        )
    }

    fn apply(ops: &[(usize, Option<usize>, bool)]) -> Forest {
        let mut forest = Forest::new();
        for (name, parent, remove) in ops {
            if *remove {
                forest.remove_node(NAMES[*name]);
            } else {
                let inputs = parent.map_or_else(NodeInputs::default, |p| {
                    NodeInputs::with_parent(NAMES[p])
                });
                forest.upsert_node(NAMES[*name], inputs);
            }
        }
        forest
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Property: the children index is the inverse of the parent map.
        #[test]
        fn prop_children_index_matches_parents(ops in arb_ops()) {
            let forest = apply(&ops);
            for parent in NAMES {
                let indexed: BTreeSet<&str> = forest.children(parent).collect();
                let derived: BTreeSet<&str> = NAMES
                    .iter()
                    .copied()
                    .filter(|n| forest.parent_of(n) == Some(parent))
                    .collect();
                prop_assert_eq!(indexed, derived);
            }
        }

        /// Property: ancestor walks are bounded and never repeat a name.
        #[test]
        fn prop_ancestors_are_bounded(ops in arb_ops()) {
            let forest = apply(&ops);
            for name in NAMES {
                let walked: Vec<&str> = forest.ancestors(name).collect();
                prop_assert!(walked.len() <= forest.len());
                let unique: HashSet<&str> = walked.iter().copied().collect();
                prop_assert_eq!(unique.len(), walked.len());
                prop_assert!(!walked.contains(&name));
            }
        }
    }
}
