//! Caller-facing handle on a live collection.

use crate::record::SchemaRecord;
use crate::store::{StoreInner, record_for, upgrade};
use resmodel_core::{ResourceKey, Result};
use resmodel_query::{LiveArray, LiveArrayKind};
use serde_json::Value;
use std::sync::{Arc, RwLock, Weak};

/// Membership of a live collection, kept current by the store.
///
/// The store only holds weak references to the underlying array; it stops
/// being maintained once every handle is dropped.
#[derive(Clone)]
pub struct LiveCollection {
    store: Weak<RwLock<StoreInner>>,
    array: Arc<LiveArray>,
}

impl std::fmt::Debug for LiveCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveCollection")
            .field("id", &self.array.id())
            .field("type_name", &self.array.type_name())
            .field("members", &self.array.len())
            .finish_non_exhaustive()
    }
}

impl LiveCollection {
    pub(crate) fn new(store: Weak<RwLock<StoreInner>>, array: Arc<LiveArray>) -> Self {
        Self { store, array }
    }

    pub(crate) fn array(&self) -> &Arc<LiveArray> {
        &self.array
    }

    pub fn type_name(&self) -> &str {
        self.array.type_name()
    }

    pub fn kind(&self) -> &LiveArrayKind {
        self.array.kind()
    }

    pub fn len(&self) -> usize {
        self.array.len()
    }

    pub fn is_empty(&self) -> bool {
        self.array.is_empty()
    }

    pub fn keys(&self) -> Vec<ResourceKey> {
        self.array.members()
    }

    /// Immutable projections of the current members.
    pub fn records(&self) -> Result<Vec<Arc<SchemaRecord>>> {
        let shared = upgrade(&self.store)?;
        Ok(self
            .array
            .members()
            .iter()
            .map(|key| record_for(&shared, key, false))
            .collect())
    }

    pub fn contains(&self, record: &SchemaRecord) -> bool {
        self.array.contains(record.key())
    }

    /// False for a query collection until its first load completes.
    pub fn is_loaded(&self) -> bool {
        self.array.is_loaded()
    }

    pub fn is_updating(&self) -> bool {
        self.array.is_updating()
    }

    pub fn meta(&self) -> Option<Value> {
        self.array.meta()
    }

    /// Bumped on every membership change.
    pub fn revision(&self) -> u64 {
        self.array.revision()
    }

    /// Whether both handles observe the same collection.
    pub fn ptr_eq(&self, other: &LiveCollection) -> bool {
        Arc::ptr_eq(&self.array, &other.array)
    }
}
