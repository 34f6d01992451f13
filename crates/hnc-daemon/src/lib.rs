//! # hnc-daemon
//!
//! Runtime half of the namespace hierarchy controller.
//!
//! - [`store`]: the [`ObjectStore`] collaborator interface and the in-memory
//!   [`MemoryStore`]
//! - [`queue`]: coalescing, rate-limited work queue of namespace names
//! - [`reconciler`]: per-namespace reconciliation against the shared forest
//! - [`controller`]: watch loop, worker pool and drain driver
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use hnc_core::{ExclusionPolicy, Namespace};
//! use hnc_daemon::{Controller, ControllerConfig, MemoryStore, ObjectStore};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = Arc::new(MemoryStore::new());
//! store.apply_namespace(Namespace::new("root"));
//! store.apply_namespace(Namespace::new("team"));
//! store.set_parent("team", Some("root")).unwrap();
//!
//! let controller = Controller::new(
//!     Arc::clone(&store) as Arc<dyn ObjectStore>,
//!     ExclusionPolicy::default(),
//!     ControllerConfig::default(),
//! );
//! let mut events = controller.subscribe();
//! controller.resync().await.unwrap();
//! controller.run_until_idle(&mut events).await.unwrap();
//!
//! let root = store.hierarchy("root").unwrap();
//! assert!(root.status.has_child("team"));
//! # }
//! ```

#![warn(missing_docs)]

pub mod controller;
pub mod queue;
pub mod reconciler;
pub mod store;

pub use controller::{Controller, ControllerConfig, ControllerError};
pub use queue::WorkQueue;
pub use reconciler::{HierarchyReconciler, ReconcileError, ReconcileOutcome, ReconcilePhase};
pub use store::{
    ClusterSnapshot, HierarchyWrite, MemoryStore, ObjectKind, ObjectStore, StoreError,
    WatchAction, WatchEvent,
};
