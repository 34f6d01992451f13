//! Reconciler tests driven without the work queue.
//!
//! [`Harness::settle`] plays the part of the controller: it feeds store
//! notifications and returned fan-out back into the reconciler until nothing
//! is left to do.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use hnc_core::api::{
    ANNOTATION_MANAGED_BY, LABEL_INCLUDED_NAMESPACE, is_tree_label, tree_label_key,
};
use hnc_core::{ConditionReason, ExclusionSet};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

use super::*;
use crate::store::{MemoryStore, WatchEvent};

const SETTLE_LIMIT: usize = 1_000;

struct Harness {
    store: Arc<MemoryStore>,
    reconciler: HierarchyReconciler,
    events: broadcast::Receiver<WatchEvent>,
}

impl Harness {
    fn new(exclusions: ExclusionSet) -> Self {
        let store = Arc::new(MemoryStore::new());
        let events = store.subscribe();
        let reconciler = HierarchyReconciler::new(
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            ExclusionPolicy::new(exclusions),
        );
        Self {
            store,
            reconciler,
            events,
        }
    }

    fn with_namespaces(names: &[&str]) -> Self {
        let harness = Self::new(ExclusionSet::defaults());
        for name in names {
            harness.store.apply_namespace(Namespace::new(*name));
        }
        harness
    }

    /// Reconciles until no notification or fan-out is outstanding. Returns the
    /// number of passes.
    async fn settle(&mut self) -> usize {
        let mut work: VecDeque<String> = VecDeque::new();
        let mut passes = 0;
        loop {
            loop {
                match self.events.try_recv() {
                    Ok(event) => work.push_back(event.name),
                    Err(TryRecvError::Lagged(_)) => {
                        work.extend(self.reconciler.known_namespaces());
                    },
                    Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                }
            }
            let Some(name) = work.pop_front() else {
                return passes;
            };
            passes += 1;
            assert!(passes < SETTLE_LIMIT, "reconciliation did not settle");
            let outcome = self.reconciler.reconcile(&name).await.unwrap();
            work.extend(outcome.enqueue);
        }
    }

    fn depth(&self, namespace: &str, ancestor: &str) -> Option<String> {
        self.store.label(namespace, &tree_label_key(ancestor))
    }

    fn has(&self, namespace: &str, reason: ConditionReason) -> bool {
        self.store
            .hierarchy(namespace)
            .is_some_and(|hc| hc.status.has_condition(reason))
    }
}

#[tokio::test]
async fn child_appears_in_parent_status() {
    let mut h = Harness::with_namespaces(&["foo", "bar"]);
    h.store.set_parent("bar", Some("foo")).unwrap();
    h.settle().await;

    assert!(h.store.hierarchy("foo").unwrap().status.has_child("bar"));
    assert_eq!(h.depth("bar", "foo").as_deref(), Some("1"));
    assert_eq!(h.depth("bar", "bar").as_deref(), Some("0"));
    assert_eq!(h.depth("foo", "foo").as_deref(), Some("0"));
}

#[tokio::test]
async fn converged_state_is_quiet() {
    let mut h = Harness::with_namespaces(&["foo", "bar"]);
    h.store.set_parent("bar", Some("foo")).unwrap();
    h.settle().await;

    let outcome = h.reconciler.reconcile("bar").await.unwrap();
    assert!(!outcome.wrote);
    assert!(outcome.enqueue.is_empty());
    assert_eq!(h.settle().await, 0);
}

#[tokio::test]
async fn missing_parent_then_created() {
    let mut h = Harness::with_namespaces(&["bar"]);
    h.store.set_parent("bar", Some("brumpf")).unwrap();
    h.settle().await;
    assert!(h.has("bar", ConditionReason::ParentMissing));

    h.store.apply_namespace(Namespace::new("brumpf"));
    h.settle().await;
    assert!(!h.has("bar", ConditionReason::ParentMissing));
    assert!(h.store.hierarchy("brumpf").unwrap().status.has_child("bar"));
    assert_eq!(h.depth("bar", "brumpf").as_deref(), Some("1"));
}

#[tokio::test]
async fn transient_write_failure_keeps_fan_out() {
    let mut h = Harness::with_namespaces(&["a", "b", "kid"]);
    h.store.set_parent("kid", Some("a")).unwrap();
    h.settle().await;
    assert!(h.store.hierarchy("a").unwrap().status.has_child("kid"));

    h.store.set_parent("kid", Some("b")).unwrap();
    h.store.fail_next_writes(1);
    let err = h.reconciler.reconcile("kid").await.unwrap_err();
    assert!(err.is_transient());
    assert!(matches!(err, ReconcileError::Store {
        phase: ReconcilePhase::Persisted,
        ..
    }));

    // The forest already moved; the retry must still re-schedule both parents.
    let outcome = h.reconciler.reconcile("kid").await.unwrap();
    assert!(outcome.wrote);
    assert!(outcome.enqueue.contains("a"));
    assert!(outcome.enqueue.contains("b"));

    h.settle().await;
    assert!(!h.store.hierarchy("a").unwrap().status.has_child("kid"));
    assert!(h.store.hierarchy("b").unwrap().status.has_child("kid"));
}

#[tokio::test]
async fn transient_read_failure_is_reported_as_observed() {
    let h = Harness::with_namespaces(&["a"]);
    h.store.fail_next_reads(1);
    let err = h.reconciler.reconcile("a").await.unwrap_err();
    assert!(matches!(err, ReconcileError::Store {
        phase: ReconcilePhase::Observed,
        ..
    }));
    assert!(h.reconciler.known_namespaces().is_empty());
}

#[tokio::test]
async fn deleted_namespace_leaves_children_with_missing_parent() {
    let mut h = Harness::with_namespaces(&["root", "mid", "leaf"]);
    h.store.set_parent("mid", Some("root")).unwrap();
    h.store.set_parent("leaf", Some("mid")).unwrap();
    h.settle().await;
    assert_eq!(h.depth("leaf", "root").as_deref(), Some("2"));

    h.store.delete_namespace("mid");
    h.settle().await;

    assert!(h.has("leaf", ConditionReason::ParentMissing));
    assert_eq!(h.depth("leaf", "root"), None);
    assert_eq!(h.depth("leaf", "mid"), None);
    assert!(!h.store.hierarchy("root").is_some_and(|hc| hc.status.has_child("mid")));
    assert!(!h.reconciler.with_forest(|f| f.contains("mid")));
}

#[tokio::test]
async fn excluded_namespace_loses_hierarchy_and_marker() {
    let mut h = Harness::with_namespaces(&["kube-system", "foo"]);
    h.store.apply_namespace(
        Namespace::new("kube-system")
            .with_label(LABEL_INCLUDED_NAMESPACE, "true")
            .with_label("other", "other"),
    );
    h.store.set_parent("kube-system", Some("foo")).unwrap();
    h.settle().await;

    assert!(h.store.hierarchy("kube-system").is_none());
    assert_eq!(h.store.label("kube-system", LABEL_INCLUDED_NAMESPACE), None);
    assert_eq!(h.store.label("kube-system", "other").as_deref(), Some("other"));
    assert!(!h.store.hierarchy("foo").is_some_and(|hc| hc.status.has_child("kube-system")));
}

#[tokio::test]
async fn included_namespace_marker_is_forced_true() {
    let mut h = Harness::with_namespaces(&[]);
    h.store
        .apply_namespace(Namespace::new("foo").with_label(LABEL_INCLUDED_NAMESPACE, "false"));
    h.settle().await;
    assert_eq!(h.store.label("foo", LABEL_INCLUDED_NAMESPACE).as_deref(), Some("true"));
}

#[tokio::test]
async fn excluded_parent_is_illegal() {
    let mut h = Harness::with_namespaces(&["kube-system", "bar"]);
    h.store.set_parent("bar", Some("kube-system")).unwrap();
    h.settle().await;

    assert!(h.has("bar", ConditionReason::IllegalParent));
    assert!(!h.has("bar", ConditionReason::ParentMissing));
    assert_eq!(h.depth("bar", "kube-system"), None);
}

#[tokio::test]
async fn external_namespace_with_parent_is_illegal() {
    let mut h = Harness::with_namespaces(&["foo"]);
    h.store
        .apply_namespace(Namespace::new("ext").with_annotation(ANNOTATION_MANAGED_BY, "others"));
    h.store.set_parent("ext", Some("foo")).unwrap();
    h.settle().await;

    assert!(h.has("ext", ConditionReason::IllegalParent));
    assert_eq!(h.depth("ext", "foo"), None);
    assert!(!h.store.hierarchy("foo").is_some_and(|hc| hc.status.has_child("ext")));
}

#[tokio::test]
async fn replaced_exclusions_apply_to_later_passes() {
    let mut h = Harness::with_namespaces(&["foo", "bar"]);
    h.store.set_parent("bar", Some("foo")).unwrap();
    h.settle().await;

    h.reconciler.policy().replace(ExclusionSet::new(["foo"]));
    for name in h.reconciler.known_namespaces() {
        h.reconciler.reconcile(&name).await.unwrap();
    }
    h.settle().await;

    assert!(h.store.hierarchy("foo").is_none());

    assert!(h.has("bar", ConditionReason::IllegalParent));
    assert_eq!(h.store.label("foo", LABEL_INCLUDED_NAMESPACE), None);
    let foo = h.store.namespace("foo").unwrap();
    assert!(
        !foo.labels.keys().any(|key| is_tree_label(key)),
        "excluded namespace kept depth labels: {:?}",
        foo.labels
    );
    assert_eq!(h.depth("bar", "bar").as_deref(), Some("0"));
    assert_eq!(h.depth("bar", "foo"), None);
}

/// Store whose namespace gains a user label right after the first read of it,
/// as if another client edited it while a pass was in flight.
struct EditAfterRead {
    inner: Arc<MemoryStore>,
    target: &'static str,
    edited: AtomicBool,
}

#[async_trait]
impl ObjectStore for EditAfterRead {
    async fn list_namespaces(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_namespaces().await
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, StoreError> {
        let namespace = self.inner.get_namespace(name).await?;
        if name == self.target && !self.edited.swap(true, Ordering::SeqCst) {
            if let Some(ns) = &namespace {
                self.inner.apply_namespace(ns.clone().with_label("team", "infra"));
            }
        }
        Ok(namespace)
    }

    async fn get_hierarchy(
        &self,
        name: &str,
    ) -> Result<Option<HierarchyConfiguration>, StoreError> {
        self.inner.get_hierarchy(name).await
    }

    async fn write_hierarchy_state(
        &self,
        name: &str,
        write: HierarchyWrite,
    ) -> Result<(), StoreError> {
        self.inner.write_hierarchy_state(name, write).await
    }

    async fn delete_hierarchy(&self, name: &str) -> Result<bool, StoreError> {
        self.inner.delete_hierarchy(name).await
    }

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.inner.subscribe()
    }
}

#[tokio::test]
async fn concurrent_user_label_edit_survives_the_write() {
    let inner = Arc::new(MemoryStore::new());
    inner.apply_namespace(Namespace::new("foo"));
    let store = Arc::new(EditAfterRead {
        inner: Arc::clone(&inner),
        target: "foo",
        edited: AtomicBool::new(false),
    });
    let reconciler = HierarchyReconciler::new(store, ExclusionPolicy::new(ExclusionSet::empty()));

    let outcome = reconciler.reconcile("foo").await.unwrap();
    assert!(outcome.wrote);
    reconciler.reconcile("foo").await.unwrap();

    assert_eq!(inner.label("foo", "team").as_deref(), Some("infra"));
    assert_eq!(inner.label("foo", &tree_label_key("foo")).as_deref(), Some("0"));
    assert_eq!(inner.label("foo", LABEL_INCLUDED_NAMESPACE).as_deref(), Some("true"));
}
