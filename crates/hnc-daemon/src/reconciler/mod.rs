//! Per-namespace hierarchy reconciler.
//!
//! One call to [`HierarchyReconciler::reconcile`] moves a namespace through
//! the phases of [`ReconcilePhase`]:
//!
//! ```text
//! Observed -> ForestUpdated -> ConditionsRecomputed -> LabelsRecomputed -> Persisted
//! ```
//!
//! Everything between `Observed` and `Persisted` is a pure derivation from the
//! forest, done while holding the forest lock and without awaiting. Reads and
//! the single combined write happen outside the lock.
//!
//! The reconciler never recurses into other namespaces. It returns the set of
//! names whose derived output may now be stale and leaves scheduling to the
//! caller. That set is accumulated per namespace across failed attempts and
//! handed out only after a successful write, so a retry that finds the forest
//! already updated does not lose the re-schedule of, say, the old parent.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hnc_core::conditions::compute_conditions;
use hnc_core::labels::{LabelPlan, compute_tree_depths, sync_labels};
use hnc_core::{
    ExclusionPolicy, ExclusionSet, Forest, HierarchyConfiguration, HierarchyStatus, Namespace,
    NodeInputs,
};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::store::{HierarchyWrite, ObjectStore, StoreError};

#[cfg(test)]
mod tests;

// =============================================================================
// Error Types
// =============================================================================

/// Step of a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconcilePhase {
    /// Namespace and declared-hierarchy object read from the store.
    Observed,
    /// Forest edge and inputs updated.
    ForestUpdated,
    /// Conditions recomputed.
    ConditionsRecomputed,
    /// Depth and inclusion labels recomputed.
    LabelsRecomputed,
    /// Labels and status written back.
    Persisted,
}

impl fmt::Display for ReconcilePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Observed => "observing",
            Self::ForestUpdated => "updating the forest",
            Self::ConditionsRecomputed => "recomputing conditions",
            Self::LabelsRecomputed => "recomputing labels",
            Self::Persisted => "persisting",
        };
        f.write_str(name)
    }
}

/// Errors that abort a reconciliation pass. Structural problems in the
/// hierarchy are never errors; they surface as conditions.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReconcileError {
    /// A store call failed.
    #[error("reconcile of {namespace} failed while {phase}: {source}")]
    Store {
        /// Namespace being reconciled.
        namespace: String,
        /// Phase that failed.
        phase: ReconcilePhase,
        /// Underlying failure.
        #[source]
        source: StoreError,
    },
}

impl ReconcileError {
    fn store(namespace: &str, phase: ReconcilePhase, source: StoreError) -> Self {
        Self::Store {
            namespace: namespace.to_string(),
            phase,
            source,
        }
    }

    /// Returns `true` if a retry may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Store { source, .. } => source.is_transient(),
        }
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// Result of a successful reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Other namespaces to re-schedule.
    pub enqueue: BTreeSet<String>,
    /// Whether anything was written to the store.
    pub wrote: bool,
}

// =============================================================================
// HierarchyReconciler
// =============================================================================

/// Owns the forest and reconciles one namespace at a time against it.
///
/// Safe to share between workers. The caller must not reconcile the same
/// name concurrently; the work queue guarantees this.
pub struct HierarchyReconciler {
    store: Arc<dyn ObjectStore>,
    forest: Mutex<Forest>,
    policy: ExclusionPolicy,
    pending: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl fmt::Debug for HierarchyReconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HierarchyReconciler")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl HierarchyReconciler {
    /// Creates a reconciler with an empty forest.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, policy: ExclusionPolicy) -> Self {
        Self {
            store,
            forest: Mutex::new(Forest::new()),
            policy,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// The exclusion policy consulted at the start of every pass.
    #[must_use]
    pub const fn policy(&self) -> &ExclusionPolicy {
        &self.policy
    }

    /// Runs `f` against the forest under its lock.
    pub fn with_forest<R>(&self, f: impl FnOnce(&Forest) -> R) -> R {
        f(&self.lock_forest())
    }

    /// Names of every namespace in the forest.
    #[must_use]
    pub fn known_namespaces(&self) -> Vec<String> {
        self.lock_forest().names()
    }

    /// Brings the forest and the store in line for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Store`] if a read or the write fails. Nothing
    /// is considered persisted in that case and the pass should be retried.
    pub async fn reconcile(&self, name: &str) -> Result<ReconcileOutcome, ReconcileError> {
        let exclusions = self.policy.snapshot();

        let observed = self
            .store
            .get_namespace(name)
            .await
            .map_err(|e| ReconcileError::store(name, ReconcilePhase::Observed, e))?;
        let Some(namespace) = observed else {
            return Ok(self.forget(name));
        };
        let hierarchy = self
            .store
            .get_hierarchy(name)
            .await
            .map_err(|e| ReconcileError::store(name, ReconcilePhase::Observed, e))?;
        trace!(namespace = %name, phase = %ReconcilePhase::Observed, "Reconcile phase");

        if exclusions.is_excluded(name) {
            return self
                .reconcile_excluded(name, &namespace, hierarchy.is_some())
                .await;
        }

        let write = self.recompute(name, &namespace, hierarchy.as_ref(), &exclusions);
        self.persist(name, write).await
    }

    /// Updates the forest for one included namespace and returns the write
    /// that brings the store in line with it.
    fn recompute(
        &self,
        name: &str,
        namespace: &Namespace,
        hierarchy: Option<&HierarchyConfiguration>,
        exclusions: &ExclusionSet,
    ) -> HierarchyWrite {
        let declared = hierarchy
            .and_then(HierarchyConfiguration::declared_parent)
            .map(str::to_string);
        let external = namespace.is_managed_externally();
        let honored = declared
            .clone()
            .filter(|parent| !external && !exclusions.is_excluded(parent));
        let inputs = NodeInputs {
            declared_parent: declared,
            parent: honored.clone(),
            managed_externally: external,
            external_tree_labels: if external {
                namespace.external_tree_labels()
            } else {
                BTreeMap::new()
            },
            excluded: false,
        };

        let mut forest = self.lock_forest();
        let upsert = forest.upsert_node(name, inputs);
        trace!(namespace = %name, phase = %ReconcilePhase::ForestUpdated, "Reconcile phase");
        if !upsert.relinked.is_empty() {
            info!(namespace = %name, parent = ?honored, "Parent edge updated");
        }

        let conditions = compute_conditions(&forest, exclusions, name);
        let previous = forest
            .get(name)
            .map(|node| node.conditions().to_vec())
            .unwrap_or_default();
        let conditions_changed = previous != conditions;
        if conditions_changed {
            info!(
                namespace = %name,
                conditions = ?conditions.iter().map(|c| c.reason.as_str()).collect::<Vec<_>>(),
                "Conditions changed"
            );
        }
        forest.set_conditions(name, conditions.clone());
        trace!(namespace = %name, phase = %ReconcilePhase::ConditionsRecomputed, "Reconcile phase");

        let plan = LabelPlan::included(compute_tree_depths(&forest, name));
        let labels_changed = sync_labels(&namespace.labels, &plan) != namespace.labels;
        trace!(namespace = %name, phase = %ReconcilePhase::LabelsRecomputed, "Reconcile phase");

        let status = HierarchyStatus {
            children: forest.children(name).map(str::to_string).collect(),
            conditions,
        };

        let status_changed = match hierarchy {
            Some(hc) => hc.status != status,
            None => !status.is_empty(),
        };

        let mut fan_out: BTreeSet<String> = upsert.relinked;
        if upsert.changed || conditions_changed || labels_changed {
            fan_out.extend(forest.descendants(name));
        }
        drop(forest);
        self.stash(name, fan_out);

        HierarchyWrite {
            labels: labels_changed.then_some(plan),
            status: status_changed.then_some(status),
        }
    }

    async fn reconcile_excluded(
        &self,
        name: &str,
        namespace: &Namespace,
        has_hierarchy: bool,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        {
            let mut forest = self.lock_forest();
            let upsert = forest.upsert_node(name, NodeInputs::excluded());
            forest.set_conditions(name, Vec::new());
            let mut fan_out = upsert.relinked;
            if upsert.changed {
                info!(namespace = %name, "Namespace is excluded from the hierarchy");
                fan_out.extend(forest.descendants(name));
            }
            drop(forest);
            self.stash(name, fan_out);
        }

        let mut wrote = false;
        if has_hierarchy {
            let deleted = self
                .store
                .delete_hierarchy(name)
                .await
                .map_err(|e| ReconcileError::store(name, ReconcilePhase::Persisted, e))?;
            if deleted {
                info!(namespace = %name, "Deleted hierarchy configuration of excluded namespace");
                wrote = true;
            }
        }

        let plan = LabelPlan::excluded();
        let write = HierarchyWrite {
            labels: (sync_labels(&namespace.labels, &plan) != namespace.labels).then_some(plan),
            status: None,
        };
        let outcome = self.persist(name, write).await?;
        Ok(ReconcileOutcome {
            wrote: wrote || outcome.wrote,
            ..outcome
        })
    }

    async fn persist(
        &self,
        name: &str,
        write: HierarchyWrite,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let wrote = !write.is_empty();
        if wrote {
            match self.store.write_hierarchy_state(name, write).await {
                Ok(()) => {},
                Err(StoreError::NamespaceNotFound { .. }) => {
                    debug!(namespace = %name, "Namespace vanished before write");
                    return Ok(self.forget(name));
                },
                Err(e) => {
                    warn!(namespace = %name, error = %e, "Failed to persist hierarchy state");
                    return Err(ReconcileError::store(name, ReconcilePhase::Persisted, e));
                },
            }
        }
        trace!(namespace = %name, phase = %ReconcilePhase::Persisted, wrote, "Reconcile phase");

        Ok(ReconcileOutcome {
            enqueue: self.take_pending(name),
            wrote,
        })
    }

    /// Drops a deleted namespace from the forest.
    ///
    /// Its children keep a dangling edge and are re-scheduled so they pick up
    /// `ParentMissing`.
    fn forget(&self, name: &str) -> ReconcileOutcome {
        let mut fan_out = {
            let mut forest = self.lock_forest();
            match forest.remove_node(name) {
                Some(node) => {
                    info!(namespace = %name, "Namespace removed from the hierarchy");
                    let mut fan_out: BTreeSet<String> =
                        forest.descendants(name).into_iter().collect();
                    fan_out.extend(node.parent().map(str::to_string));
                    fan_out
                },
                None => BTreeSet::new(),
            }
        };
        fan_out.extend(self.take_pending(name));
        fan_out.remove(name);
        ReconcileOutcome {
            enqueue: fan_out,
            wrote: false,
        }
    }

    fn stash(&self, name: &str, fan_out: BTreeSet<String>) {
        if fan_out.is_empty() {
            return;
        }
        self.lock_pending()
            .entry(name.to_string())
            .or_default()
            .extend(fan_out);
    }

    fn take_pending(&self, name: &str) -> BTreeSet<String> {
        let mut names = self.lock_pending().remove(name).unwrap_or_default();
        names.remove(name);
        names
    }

    fn lock_forest(&self) -> MutexGuard<'_, Forest> {
        self.forest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<String, BTreeSet<String>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
