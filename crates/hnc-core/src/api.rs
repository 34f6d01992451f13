//! Wire-level object model.
//!
//! Two objects carry hierarchy state: the [`Namespace`] itself (labels and
//! annotations) and its optional [`HierarchyConfiguration`], through which a
//! parent is declared and computed conditions are exposed.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

// =============================================================================
// Constants
// =============================================================================

/// Suffix appended to an ancestor's name to form its depth label key.
pub const LABEL_TREE_DEPTH_SUFFIX: &str = ".tree.hnc.x-k8s.io/depth";

/// Annotation naming the actor that manages a namespace's hierarchy metadata.
pub const ANNOTATION_MANAGED_BY: &str = "hnc.x-k8s.io/managed-by";

/// Value of [`ANNOTATION_MANAGED_BY`] that means "managed by this system".
pub const MANAGER_NAME: &str = "hnc.x-k8s.io";

/// Label forced to `"true"` on every non-excluded namespace.
pub const LABEL_INCLUDED_NAMESPACE: &str = "hnc.x-k8s.io/included-namespace";

/// Umbrella condition type shared by every hierarchy condition.
pub const CONDITION_ACTIVITIES_HALTED: &str = "ActivitiesHalted";

/// Returns the depth label key for `ancestor`.
#[must_use]
pub fn tree_label_key(ancestor: &str) -> String {
    format!("{ancestor}{LABEL_TREE_DEPTH_SUFFIX}")
}

/// Returns the ancestor named by a depth label key, if `key` is one.
#[must_use]
pub fn tree_label_ancestor(key: &str) -> Option<&str> {
    key.strip_suffix(LABEL_TREE_DEPTH_SUFFIX)
        .filter(|ancestor| !ancestor.is_empty())
}

/// Returns `true` if `key` is a depth label owned by the hierarchy.
#[must_use]
pub fn is_tree_label(key: &str) -> bool {
    tree_label_ancestor(key).is_some()
}

// =============================================================================
// Conditions
// =============================================================================

/// Reason attached to an `ActivitiesHalted` condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConditionReason {
    /// The declared parent does not exist.
    ParentMissing,
    /// The declared parent may not be used as a parent.
    IllegalParent,
    /// The namespace is a member of a cycle.
    InCycle,
    /// Some ancestor carries an `ActivitiesHalted` condition.
    AncestorHaltActivities,
}

impl ConditionReason {
    /// Returns the wire spelling of the reason.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ParentMissing => "ParentMissing",
            Self::IllegalParent => "IllegalParent",
            Self::InCycle => "InCycle",
            Self::AncestorHaltActivities => "AncestorHaltActivities",
        }
    }
}

impl fmt::Display for ConditionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status condition on a [`HierarchyConfiguration`].
///
/// Ordering is by type, then reason, so sorted condition lists are stable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Condition {
    /// Condition type; always [`CONDITION_ACTIVITIES_HALTED`] today.
    #[serde(rename = "type")]
    pub type_: String,
    /// Machine-readable reason.
    pub reason: ConditionReason,
    /// Human-readable explanation.
    pub message: String,
}

impl Condition {
    /// Creates an `ActivitiesHalted` condition.
    #[must_use]
    pub fn activities_halted(reason: ConditionReason, message: impl Into<String>) -> Self {
        Self {
            type_: CONDITION_ACTIVITIES_HALTED.to_string(),
            reason,
            message: message.into(),
        }
    }
}

// =============================================================================
// Namespace
// =============================================================================

/// A cluster-scoped namespace as seen by the hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    /// Unique name.
    pub name: String,
    /// Labels, both hierarchy-owned and user-owned.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Namespace {
    /// Creates a namespace with no labels or annotations.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    /// Adds a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Adds an annotation.
    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Returns `true` if an actor other than this system owns the namespace's
    /// hierarchy metadata.
    #[must_use]
    pub fn is_managed_externally(&self) -> bool {
        self.annotations
            .get(ANNOTATION_MANAGED_BY)
            .is_some_and(|manager| !manager.is_empty() && manager != MANAGER_NAME)
    }

    /// Parses the depth labels present on the namespace.
    ///
    /// Only meaningful for externally-managed namespaces, whose depth labels
    /// are trusted input rather than derived output. Values that are not
    /// non-negative integers are skipped.
    #[must_use]
    pub fn external_tree_labels(&self) -> BTreeMap<String, u32> {
        let mut depths = BTreeMap::new();
        for (key, value) in &self.labels {
            let Some(ancestor) = tree_label_ancestor(key) else {
                continue;
            };
            match value.parse::<u32>() {
                Ok(depth) => {
                    depths.insert(ancestor.to_string(), depth);
                },
                Err(e) => {
                    warn!(
                        namespace = %self.name,
                        label = %key,
                        value = %value,
                        error = %e,
                        "Ignoring unparseable external tree label"
                    );
                },
            }
        }
        depths
    }

    /// Returns the value of a label, if present.
    #[must_use]
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

// =============================================================================
// HierarchyConfiguration
// =============================================================================

/// Declared half of a [`HierarchyConfiguration`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchySpec {
    /// Requested parent; `None` or empty means "root".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

/// Computed half of a [`HierarchyConfiguration`]; written only by the
/// reconciler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyStatus {
    /// Sorted names of namespaces whose parent is this namespace.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
    /// Sorted conditions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl HierarchyStatus {
    /// Returns `true` if the status carries neither children nor conditions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty() && self.conditions.is_empty()
    }

    /// Returns `true` if a condition with `reason` is present.
    #[must_use]
    pub fn has_condition(&self, reason: ConditionReason) -> bool {
        self.conditions
            .iter()
            .any(|c| c.type_ == CONDITION_ACTIVITIES_HALTED && c.reason == reason)
    }

    /// Returns `true` if `child` is listed.
    #[must_use]
    pub fn has_child(&self, child: &str) -> bool {
        self.children.iter().any(|c| c == child)
    }
}

/// The per-namespace declared-hierarchy object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyConfiguration {
    /// Namespace this object belongs to.
    pub namespace: String,
    /// Declared parent.
    #[serde(default)]
    pub spec: HierarchySpec,
    /// Computed status.
    #[serde(default, skip_serializing_if = "HierarchyStatus::is_empty")]
    pub status: HierarchyStatus,
}

impl HierarchyConfiguration {
    /// Creates an object with no parent and an empty status.
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            spec: HierarchySpec::default(),
            status: HierarchyStatus::default(),
        }
    }

    /// Sets the declared parent.
    #[must_use]
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.spec.parent = Some(parent.into());
        self
    }

    /// Returns the declared parent, treating the empty string as none.
    #[must_use]
    pub fn declared_parent(&self) -> Option<&str> {
        self.spec.parent.as_deref().filter(|p| !p.is_empty())
    }
}
