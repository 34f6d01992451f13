//! Condition engine.
//!
//! Derives the `ActivitiesHalted` conditions of a namespace from forest
//! topology alone. Conditions are recomputed from scratch on every call; a
//! condition absent from the new result is simply gone.
//!
//! | Reason                   | Trigger                                                   |
//! |--------------------------|-----------------------------------------------------------|
//! | `IllegalParent`          | declared parent is excluded, or the node is external      |
//! | `ParentMissing`          | declared parent is not a known node                       |
//! | `InCycle`                | node can reach itself through parent links                |
//! | `AncestorHaltActivities` | some strict ancestor has any of the reasons above         |
//!
//! `IllegalParent` and `ParentMissing` describe the same edge and never appear
//! together; `IllegalParent` wins. The ancestor walk never crosses a cycle
//! boundary or a dangling parent.

use crate::api::{Condition, ConditionReason};
use crate::cycle::{cycle_membership, describe_cycle, find_cycle};
use crate::exclusion::ExclusionSet;
use crate::forest::Forest;

/// Conditions caused by `name`'s own edge and cycle membership, ignoring its
/// ancestors.
///
/// Excluded and unknown namespaces have no conditions.
#[must_use]
pub fn local_conditions(forest: &Forest, exclusions: &ExclusionSet, name: &str) -> Vec<Condition> {
    let Some(node) = forest.get(name) else {
        return Vec::new();
    };
    if node.is_excluded() {
        return Vec::new();
    }

    let mut conditions = Vec::new();
    if let Some(parent) = node.declared_parent() {
        if exclusions.is_excluded(parent) {
            conditions.push(Condition::activities_halted(
                ConditionReason::IllegalParent,
                format!("The parent {parent} is an excluded namespace"),
            ));
        } else if node.is_managed_externally() {
            conditions.push(Condition::activities_halted(
                ConditionReason::IllegalParent,
                format!(
                    "Namespace {name} is managed by an external system and cannot have the \
                     parent {parent}"
                ),
            ));
        } else if !forest.contains(parent) {
            conditions.push(Condition::activities_halted(
                ConditionReason::ParentMissing,
                format!("The parent {parent} does not exist"),
            ));
        }
    }

    if let Some(cycle) = cycle_membership(forest, name) {
        conditions.push(Condition::activities_halted(
            ConditionReason::InCycle,
            format!("Namespace {name} is in a cycle: {}", describe_cycle(&cycle)),
        ));
    }
    conditions
}

/// Returns the nearest strict ancestor of `name` that has local conditions.
///
/// Returns `None` for cycle members: their halted state is reported as
/// `InCycle` and every other member would otherwise count as an ancestor.
/// For other nodes the walk stops after the first cycle member reached.
#[must_use]
pub fn halted_ancestor<'a>(
    forest: &'a Forest,
    exclusions: &ExclusionSet,
    name: &str,
) -> Option<&'a str> {
    let cycle = find_cycle(forest, name);
    let entry = match &cycle {
        Some(cycle) if cycle.first().is_some_and(|first| first == name) => return None,
        Some(cycle) => cycle.first().map(String::as_str),
        None => None,
    };

    for ancestor in forest.ancestors(name) {
        if !local_conditions(forest, exclusions, ancestor).is_empty() {
            return Some(ancestor);
        }
        if entry == Some(ancestor) {
            break;
        }
    }
    None
}

/// Computes the full, sorted condition set of `name`.
#[must_use]
pub fn compute_conditions(
    forest: &Forest,
    exclusions: &ExclusionSet,
    name: &str,
) -> Vec<Condition> {
    let mut conditions = local_conditions(forest, exclusions, name);
    if forest.get(name).is_some_and(|n| !n.is_excluded()) {
        if let Some(ancestor) = halted_ancestor(forest, exclusions, name) {
            conditions.push(Condition::activities_halted(
                ConditionReason::AncestorHaltActivities,
                format!("Activities are halted in the ancestor namespace {ancestor}"),
            ));
        }
    }
    conditions.sort();
    conditions
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::forest::NodeInputs;

    fn forest(edges: &[(&str, Option<&str>)]) -> Forest {
        let mut forest = Forest::new();
        for (name, parent) in edges {
            let inputs = parent.map_or_else(NodeInputs::default, NodeInputs::with_parent);
            forest.upsert_node(name, inputs);
        }
        forest
    }

    fn reasons(conditions: &[Condition]) -> Vec<ConditionReason> {
        conditions.iter().map(|c| c.reason).collect()
    }

    #[test]
    fn healthy_tree_has_no_conditions() {
        let f = forest(&[("a", None), ("b", Some("a"))]);
        let none = ExclusionSet::empty();
        assert!(compute_conditions(&f, &none, "a").is_empty());
        assert!(compute_conditions(&f, &none, "b").is_empty());
    }

    #[test]
    fn missing_parent() {
        let f = forest(&[("bar", Some("brumpf"))]);
        let conditions = compute_conditions(&f, &ExclusionSet::empty(), "bar");
        assert_eq!(reasons(&conditions), vec![ConditionReason::ParentMissing]);
        assert!(conditions[0].message.contains("brumpf"));
    }

    #[test]
    fn excluded_parent_is_illegal_not_missing() {
        let f = forest(&[("bar", Some("kube-system"))]);
        let conditions = compute_conditions(&f, &ExclusionSet::defaults(), "bar");
        assert_eq!(reasons(&conditions), vec![ConditionReason::IllegalParent]);
    }

    #[test]
    fn external_namespace_with_parent_is_illegal() {
        let mut f = forest(&[("p", None)]);
        let mut inputs = NodeInputs::external(BTreeMap::new());
        inputs.declared_parent = Some("p".to_string());
        f.upsert_node("ext", inputs);
        let conditions = compute_conditions(&f, &ExclusionSet::empty(), "ext");
        assert_eq!(reasons(&conditions), vec![ConditionReason::IllegalParent]);
    }

    #[test]
    fn self_cycle() {
        let f = forest(&[("foo", Some("foo"))]);
        let conditions = compute_conditions(&f, &ExclusionSet::empty(), "foo");
        assert_eq!(reasons(&conditions), vec![ConditionReason::InCycle]);
        assert!(conditions[0].message.contains("foo -> foo"));
    }

    #[test]
    fn cycle_members_do_not_report_halted_ancestors() {
        let f = forest(&[("foo", Some("bar")), ("bar", Some("foo")), ("kid", Some("foo"))]);
        let none = ExclusionSet::empty();
        assert_eq!(reasons(&compute_conditions(&f, &none, "foo")), vec![ConditionReason::InCycle]);
        assert_eq!(reasons(&compute_conditions(&f, &none, "bar")), vec![ConditionReason::InCycle]);
        assert_eq!(
            reasons(&compute_conditions(&f, &none, "kid")),
            vec![ConditionReason::AncestorHaltActivities]
        );
    }

    #[test]
    fn halted_ancestor_is_transitive() {
        let f = forest(&[("bar", Some("brumpf")), ("foo", Some("bar")), ("baz", Some("foo"))]);
        let none = ExclusionSet::empty();
        assert_eq!(halted_ancestor(&f, &none, "baz"), Some("bar"));
        let conditions = compute_conditions(&f, &none, "baz");
        assert_eq!(reasons(&conditions), vec![ConditionReason::AncestorHaltActivities]);
        assert!(conditions[0].message.contains("bar"));
    }

    #[test]
    fn clearing_the_root_cause_clears_descendants() {
        let mut f = forest(&[("bar", Some("brumpf")), ("foo", Some("bar"))]);
        let none = ExclusionSet::empty();
        assert!(!compute_conditions(&f, &none, "foo").is_empty());

        f.upsert_node("brumpf", NodeInputs::default());
        assert!(compute_conditions(&f, &none, "bar").is_empty());
        assert!(compute_conditions(&f, &none, "foo").is_empty());
    }

    #[test]
    fn excluded_node_has_no_conditions() {
        let mut f = Forest::new();
        f.upsert_node("kube-system", NodeInputs::excluded());
        assert!(compute_conditions(&f, &ExclusionSet::defaults(), "kube-system").is_empty());
    }

    #[test]
    fn descendant_of_cycle_stops_at_entry_member() {
        // a -> d -> b -> a, with f hanging off d.
        let f = forest(&[
            ("a", Some("d")),
            ("b", Some("a")),
            ("d", Some("b")),
            ("f", Some("d")),
        ]);
        assert_eq!(halted_ancestor(&f, &ExclusionSet::empty(), "f"), Some("d"));
        assert_eq!(halted_ancestor(&f, &ExclusionSet::empty(), "a"), None);
    }
}
