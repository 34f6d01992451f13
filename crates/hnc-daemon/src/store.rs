//! Object store collaborator.
//!
//! The reconciler never talks to a cluster directly. It reads namespaces and
//! declared-hierarchy objects, writes computed labels and status, and deletes
//! declared-hierarchy objects of excluded namespaces, all through the
//! [`ObjectStore`] trait. Every call may fail transiently.
//!
//! [`MemoryStore`] is the in-process implementation used by the binary and
//! the tests. Besides the trait it exposes the "user side" of the store
//! (creating namespaces, declaring parents) and fault injection.
//!
//! # Notifications
//!
//! Each store broadcasts a [`WatchEvent`] for every object that actually
//! changed. Writes that leave an object as it was are silent, so a converged
//! hierarchy produces no further events.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use hnc_core::labels::{LabelPlan, sync_labels};
use hnc_core::{HierarchyConfiguration, HierarchyStatus, Namespace};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the notification channel. A subscriber that falls further
/// behind than this observes a lag and must resync.
pub const WATCH_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Notifications
// =============================================================================

/// Which object a [`WatchEvent`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// The namespace itself.
    Namespace,
    /// The namespace's declared-hierarchy object.
    Hierarchy,
}

/// What happened to the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchAction {
    /// Created or updated.
    Upserted,
    /// Deleted.
    Deleted,
}

/// A change notification, identified by namespace name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchEvent {
    /// Object kind.
    pub kind: ObjectKind,
    /// Change kind.
    pub action: WatchAction,
    /// Namespace the object belongs to.
    pub name: String,
}

// =============================================================================
// Error Types
// =============================================================================

/// Errors returned by an [`ObjectStore`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreError {
    /// The call failed for a reason expected to go away on retry.
    #[error("transient store failure during {operation}: {reason}")]
    Transient {
        /// Store operation that failed.
        operation: &'static str,
        /// Failure description.
        reason: String,
    },

    /// The namespace a write targets no longer exists.
    #[error("namespace not found: {name}")]
    NamespaceNotFound {
        /// Missing namespace.
        name: String,
    },
}

impl StoreError {
    /// Returns `true` if retrying the same call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

// =============================================================================
// ObjectStore Trait (Async)
// =============================================================================

/// Hierarchy-owned state written for one namespace in a single call.
///
/// Labels and status are applied together or not at all. `None` leaves the
/// corresponding part untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HierarchyWrite {
    /// Hierarchy-owned labels to enforce.
    ///
    /// The store applies the plan over the labels it holds at write time, so
    /// only depth labels and the inclusion marker change. Labels edited by
    /// others since the reconciler's read are kept.
    pub labels: Option<LabelPlan>,
    /// Replacement status for the declared-hierarchy object.
    ///
    /// If the object does not exist it is created only when the status is
    /// non-empty.
    pub status: Option<HierarchyStatus>,
}

impl HierarchyWrite {
    /// Returns `true` if the write would change nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.labels.is_none() && self.status.is_none()
    }
}

/// Storage and notification interface consumed by the reconciler.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Names of every existing namespace.
    async fn list_namespaces(&self) -> Result<Vec<String>, StoreError>;

    /// Reads a namespace; `Ok(None)` if it does not exist.
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, StoreError>;

    /// Reads a declared-hierarchy object; `Ok(None)` if it does not exist.
    async fn get_hierarchy(
        &self,
        name: &str,
    ) -> Result<Option<HierarchyConfiguration>, StoreError>;

    /// Atomically applies hierarchy-owned labels and status.
    ///
    /// The label plan is merged into the namespace's labels as they are at
    /// write time, never into the copy the caller read.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NamespaceNotFound`] if the namespace is gone.
    async fn write_hierarchy_state(
        &self,
        name: &str,
        write: HierarchyWrite,
    ) -> Result<(), StoreError>;

    /// Deletes a declared-hierarchy object, returning whether it existed.
    async fn delete_hierarchy(&self, name: &str) -> Result<bool, StoreError>;

    /// Subscribes to change notifications from this point on.
    fn subscribe(&self) -> broadcast::Receiver<WatchEvent>;
}

// =============================================================================
// ClusterSnapshot
// =============================================================================

/// Serializable contents of a [`MemoryStore`], used for fixtures and output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    /// Namespaces, sorted by name.
    #[serde(default)]
    pub namespaces: Vec<Namespace>,
    /// Declared-hierarchy objects, sorted by namespace.
    #[serde(default)]
    pub hierarchies: Vec<HierarchyConfiguration>,
}

// =============================================================================
// MemoryStore
// =============================================================================

#[derive(Debug, Default)]
struct State {
    namespaces: BTreeMap<String, Namespace>,
    hierarchies: BTreeMap<String, HierarchyConfiguration>,
    failing_reads: u32,
    failing_writes: u32,
}

impl State {
    fn take_read_failure(&mut self, operation: &'static str) -> Result<(), StoreError> {
        if self.failing_reads == 0 {
            return Ok(());
        }
        self.failing_reads -= 1;
        Err(StoreError::Transient {
            operation,
            reason: "injected read failure".to_string(),
        })
    }

    fn take_write_failure(&mut self, operation: &'static str) -> Result<(), StoreError> {
        if self.failing_writes == 0 {
            return Ok(());
        }
        self.failing_writes -= 1;
        Err(StoreError::Transient {
            operation,
            reason: "injected write failure".to_string(),
        })
    }
}

/// In-memory [`ObjectStore`].
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            events,
        }
    }

    /// Creates a store holding the objects in `snapshot`.
    ///
    /// Declared-hierarchy objects whose namespace is absent are dropped.
    #[must_use]
    pub fn from_snapshot(snapshot: ClusterSnapshot) -> Self {
        let store = Self::new();
        {
            let mut state = store.lock();
            for ns in snapshot.namespaces {
                state.namespaces.insert(ns.name.clone(), ns);
            }
            for hc in snapshot.hierarchies {
                if state.namespaces.contains_key(&hc.namespace) {
                    state.hierarchies.insert(hc.namespace.clone(), hc);
                }
            }
        }
        store
    }

    /// Returns every stored object.
    #[must_use]
    pub fn snapshot(&self) -> ClusterSnapshot {
        let state = self.lock();
        ClusterSnapshot {
            namespaces: state.namespaces.values().cloned().collect(),
            hierarchies: state.hierarchies.values().cloned().collect(),
        }
    }

    // -------------------------------------------------------------------------
    // User-side mutations
    // -------------------------------------------------------------------------

    /// Creates or replaces a namespace.
    pub fn apply_namespace(&self, namespace: Namespace) {
        let name = namespace.name.clone();
        let changed = {
            let mut state = self.lock();
            if state.namespaces.get(&name) == Some(&namespace) {
                false
            } else {
                state.namespaces.insert(name.clone(), namespace);
                true
            }
        };
        if changed {
            self.emit(ObjectKind::Namespace, WatchAction::Upserted, &name);
        }
    }

    /// Deletes a namespace and its declared-hierarchy object.
    pub fn delete_namespace(&self, name: &str) -> bool {
        let (namespace, hierarchy) = {
            let mut state = self.lock();
            (state.namespaces.remove(name), state.hierarchies.remove(name))
        };
        if hierarchy.is_some() {
            self.emit(ObjectKind::Hierarchy, WatchAction::Deleted, name);
        }
        if namespace.is_some() {
            self.emit(ObjectKind::Namespace, WatchAction::Deleted, name);
        }
        namespace.is_some()
    }

    /// Declares (or with `None`, clears) the parent of `name`, creating the
    /// declared-hierarchy object if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NamespaceNotFound`] if `name` does not exist.
    pub fn set_parent(&self, name: &str, parent: Option<&str>) -> Result<(), StoreError> {
        let changed = {
            let mut state = self.lock();
            if !state.namespaces.contains_key(name) {
                return Err(StoreError::NamespaceNotFound {
                    name: name.to_string(),
                });
            }
            let hc = state
                .hierarchies
                .entry(name.to_string())
                .or_insert_with(|| HierarchyConfiguration::new(name));
            let parent = parent.map(str::to_string);
            let changed = hc.spec.parent != parent;
            hc.spec.parent = parent;
            changed
        };
        if changed {
            self.emit(ObjectKind::Hierarchy, WatchAction::Upserted, name);
        }
        Ok(())
    }

    /// Creates or replaces a declared-hierarchy object as a client would,
    /// including whatever status the client supplies.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NamespaceNotFound`] if its namespace does not
    /// exist.
    pub fn apply_hierarchy(&self, hierarchy: HierarchyConfiguration) -> Result<(), StoreError> {
        let name = hierarchy.namespace.clone();
        let changed = {
            let mut state = self.lock();
            if !state.namespaces.contains_key(&name) {
                return Err(StoreError::NamespaceNotFound { name });
            }
            let changed = state.hierarchies.get(&name) != Some(&hierarchy);
            state.hierarchies.insert(name.clone(), hierarchy);
            changed
        };
        if changed {
            self.emit(ObjectKind::Hierarchy, WatchAction::Upserted, &name);
        }
        Ok(())
    }

    /// Returns a copy of a namespace.
    #[must_use]
    pub fn namespace(&self, name: &str) -> Option<Namespace> {
        self.lock().namespaces.get(name).cloned()
    }

    /// Returns a copy of a declared-hierarchy object.
    #[must_use]
    pub fn hierarchy(&self, name: &str) -> Option<HierarchyConfiguration> {
        self.lock().hierarchies.get(name).cloned()
    }

    /// Returns the value of one label, or `None` if either the namespace or
    /// the label is absent.
    #[must_use]
    pub fn label(&self, name: &str, key: &str) -> Option<String> {
        self.lock()
            .namespaces
            .get(name)
            .and_then(|ns| ns.label(key).map(str::to_string))
    }

    // -------------------------------------------------------------------------
    // Fault injection
    // -------------------------------------------------------------------------

    /// Makes the next `count` reads fail transiently.
    pub fn fail_next_reads(&self, count: u32) {
        self.lock().failing_reads = count;
    }

    /// Makes the next `count` writes or deletes fail transiently.
    pub fn fail_next_writes(&self, count: u32) {
        self.lock().failing_writes = count;
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, kind: ObjectKind, action: WatchAction, name: &str) {
        debug!(namespace = %name, ?kind, ?action, "Store change");
        // No subscribers is not an error.
        let _ = self.events.send(WatchEvent {
            kind,
            action,
            name: name.to_string(),
        });
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_namespaces(&self) -> Result<Vec<String>, StoreError> {
        let mut state = self.lock();
        state.take_read_failure("list_namespaces")?;
        Ok(state.namespaces.keys().cloned().collect())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, StoreError> {
        let mut state = self.lock();
        state.take_read_failure("get_namespace")?;
        Ok(state.namespaces.get(name).cloned())
    }

    async fn get_hierarchy(
        &self,
        name: &str,
    ) -> Result<Option<HierarchyConfiguration>, StoreError> {
        let mut state = self.lock();
        state.take_read_failure("get_hierarchy")?;
        Ok(state.hierarchies.get(name).cloned())
    }

    async fn write_hierarchy_state(
        &self,
        name: &str,
        write: HierarchyWrite,
    ) -> Result<(), StoreError> {
        let (namespace_changed, hierarchy_changed) = {
            let mut state = self.lock();
            state.take_write_failure("write_hierarchy_state")?;
            if !state.namespaces.contains_key(name) {
                return Err(StoreError::NamespaceNotFound {
                    name: name.to_string(),
                });
            }

            let mut namespace_changed = false;
            if let Some(plan) = write.labels {
                if let Some(ns) = state.namespaces.get_mut(name) {
                    let labels = sync_labels(&ns.labels, &plan);
                    namespace_changed = ns.labels != labels;
                    ns.labels = labels;
                }
            }

            let mut hierarchy_changed = false;
            if let Some(status) = write.status {
                match state.hierarchies.get_mut(name) {
                    Some(hc) => {
                        hierarchy_changed = hc.status != status;
                        hc.status = status;
                    },
                    None if !status.is_empty() => {
                        let mut hc = HierarchyConfiguration::new(name);
                        hc.status = status;
                        state.hierarchies.insert(name.to_string(), hc);
                        hierarchy_changed = true;
                    },
                    None => {},
                }
            }
            (namespace_changed, hierarchy_changed)
        };

        if namespace_changed {
            self.emit(ObjectKind::Namespace, WatchAction::Upserted, name);
        }
        if hierarchy_changed {
            self.emit(ObjectKind::Hierarchy, WatchAction::Upserted, name);
        }
        Ok(())
    }

    async fn delete_hierarchy(&self, name: &str) -> Result<bool, StoreError> {
        let existed = {
            let mut state = self.lock();
            state.take_write_failure("delete_hierarchy")?;
            state.hierarchies.remove(name).is_some()
        };
        if existed {
            self.emit(ObjectKind::Hierarchy, WatchAction::Deleted, name);
        }
        Ok(existed)
    }

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}
