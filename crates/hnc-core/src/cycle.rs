//! Cycle detection over the forest.
//!
//! Detection is local: it walks parent links from one node, recording
//! visited names, until it reaches a root or a dangling parent (no cycle) or
//! revisits a name (cycle). Only nodes whose ancestry changed ever need a
//! walk, so whole-forest detection is never required.
//!
//! Cost is O(depth) per walk and the walk is capped at `forest.len() + 1`
//! steps regardless of graph shape.

use std::collections::HashMap;

use crate::forest::Forest;

/// Walks parent links from `name` and returns the cycle reached, if any.
///
/// The returned names start at the first repeated name (the point where the
/// walk entered the cycle) and follow parent links around the cycle once.
/// `name` itself is a member only if it is the first element.
#[must_use]
pub fn find_cycle(forest: &Forest, name: &str) -> Option<Vec<String>> {
    let mut path: Vec<&str> = Vec::new();
    let mut position: HashMap<&str, usize> = HashMap::new();
    let mut current = forest.get(name)?.name();

    for _ in 0..=forest.len() {
        if let Some(&start) = position.get(current) {
            return Some(path[start..].iter().map(|n| (*n).to_string()).collect());
        }
        position.insert(current, path.len());
        path.push(current);

        let parent = forest.parent_of(current)?;
        current = forest.get(parent)?.name();
    }
    None
}

/// Returns the cycle `name` belongs to, starting at `name`, if any.
#[must_use]
pub fn cycle_membership(forest: &Forest, name: &str) -> Option<Vec<String>> {
    find_cycle(forest, name).filter(|cycle| cycle.first().is_some_and(|first| first == name))
}

/// Returns `true` if `name` can reach itself through parent links.
#[must_use]
pub fn is_in_cycle(forest: &Forest, name: &str) -> bool {
    cycle_membership(forest, name).is_some()
}

/// Formats a cycle as `a -> b -> c -> a` (child to parent) for condition
/// messages.
#[must_use]
pub fn describe_cycle(cycle: &[String]) -> String {
    let mut rendered = cycle.join(" -> ");
    if let Some(first) = cycle.first() {
        rendered.push_str(" -> ");
        rendered.push_str(first);
    }
    rendered
}
