//! Identity map, resource cache and record lifecycle for ResModel.
//!
//! This crate owns the canonical data of a store:
//!
//! - [`IdentifierRegistry`] - one [`ResourceKey`](resmodel_core::ResourceKey) per resource
//! - [`ResourceCache`] - normalized attributes and relationships per key
//! - [`MutationOverlay`] - uncommitted and in-flight writes of editable records
//! - [`LifecycleTable`] - per-key [`RecordState`] machine
//!
//! None of these types lock; the store wraps them in a single `RwLock`.

pub mod cache;
pub mod change_tracker;
pub mod identity_map;
pub mod lifecycle;

pub use cache::{CacheEntry, RelationshipData, RelationshipState, ResourceCache, ResourceData};
pub use change_tracker::{FieldOverlay, MutationOverlay};
pub use identity_map::{IdAssignment, IdentifierRegistry};
pub use lifecycle::{
    CommitPhase, DeletePhase, ErrorPhase, LifecycleEvent, LifecycleTable, RecordState,
};
