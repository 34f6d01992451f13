//! # hnc-core
//!
//! In-memory model of a namespace hierarchy and the pure derivations computed
//! from it.
//!
//! Every namespace may declare a single parent. This crate keeps those
//! declarations in a [`Forest`] and derives, from the forest alone, what each
//! namespace should look like from the outside:
//!
//! - [`cycle`]: which namespaces are reachable from themselves
//! - [`conditions`]: the `ActivitiesHalted` conditions of a namespace
//!   (`ParentMissing`, `IllegalParent`, `InCycle`, `AncestorHaltActivities`)
//! - [`labels`]: the ancestor depth labels projected onto a namespace,
//!   including depths contributed by externally-managed ancestors
//! - [`exclusion`]: which namespaces never take part in the hierarchy
//!
//! Nothing in this crate performs I/O, blocks or awaits. The reconciler in
//! `hnc-daemon` owns the forest, feeds it observed state and persists what
//! these functions return.
//!
//! ## Example
//!
//! ```rust
//! use hnc_core::{ExclusionSet, Forest, NodeInputs, conditions, labels};
//!
//! let mut forest = Forest::new();
//! forest.upsert_node("root", NodeInputs::default());
//! forest.upsert_node("team", NodeInputs::with_parent("root"));
//!
//! let depths = labels::compute_tree_depths(&forest, "team");
//! assert_eq!(depths.get("root"), Some(&1));
//! assert_eq!(depths.get("team"), Some(&0));
//!
//! let exclusions = ExclusionSet::empty();
//! assert!(conditions::compute_conditions(&forest, &exclusions, "team").is_empty());
//! ```
//!
//! ## Invariants
//!
//! - [INV-FOREST-001] The children of a name are exactly the nodes whose
//!   honored parent is that name.
//! - [INV-FOREST-002] Every walk over parent links is bounded by the number of
//!   known nodes and stops at the first repeated name.
//! - [INV-FOREST-003] Derived values (conditions, depths) are recomputed from
//!   the forest on every call; nothing is patched incrementally.

#![warn(missing_docs)]

pub mod api;
pub mod conditions;
pub mod config;
pub mod cycle;
pub mod exclusion;
pub mod forest;
pub mod labels;
pub mod retry;

pub use api::{
    Condition, ConditionReason, HierarchyConfiguration, HierarchySpec, HierarchyStatus, Namespace,
};
pub use config::{ConfigError, HncConfig};
pub use exclusion::{ExclusionPolicy, ExclusionSet};
pub use forest::{Forest, Node, NodeInputs, Upsert};
pub use retry::BackoffConfig;
