//! The store: entry point for pushing, reading, mutating and committing records.
//!
//! A [`Store`] owns one lock around all canonical state (identifier registry,
//! resource cache, mutation overlay, lifecycle table, live collections and the
//! find coalescer). Locks are held only for the synchronous part of an
//! operation; adapter calls, derivations and filter predicates always run
//! with the lock released.
//!
//! # Example
//!
//! ```ignore
//! let store = Store::new(adapter);
//! store.register_resource(
//!     ResourceSchema::resource("user")
//!         .field(FieldSchema::field("name"))
//!         .field(FieldSchema::has_many("friends", "user").options(
//!             FieldOptions::new().inverse("friends"),
//!         )),
//! )?;
//!
//! let user = store.push_value(json!({
//!     "data": { "type": "user", "id": "1", "attributes": { "name": "Chris" } }
//! }))?.one().unwrap();
//!
//! let editable = store.checkout(&cx, &user).await.unwrap();
//! editable.set("name", json!("Wes"))?;
//! assert_eq!(user.get("name")?, json!("Chris"));
//! store.save_record(&cx, &editable).await.unwrap();
//! assert_eq!(user.get("name")?, json!("Wes"));
//! ```

use crate::containers::{Container, ContainerKey, ManyArray};
use crate::live::LiveCollection;
use crate::record::SchemaRecord;
use crate::relationships::{self, Layer};
use asupersync::{Cx, Outcome};
use resmodel_cache::{
    CacheEntry, DeletePhase, ErrorPhase, FieldOverlay, IdAssignment, IdentifierRegistry, LifecycleEvent,
    LifecycleTable, MutationOverlay, RecordState, RelationshipData, RelationshipState,
    ResourceCache, ResourceData,
};
use resmodel_core::{
    Adapter, Document, Error, FieldKind, FieldSchema, Identity, InvalidRecordError, Linkage,
    LinksModeError, LinksModeErrorKind, NullAdapter, PrimaryData, RelationshipPayload,
    ResourceError, ResourceIdentifier, ResourceKey, ResourceObject, ResourceSchema, Result,
    StateError,
};
use resmodel_query::{FetchBatch, FetchTicket, FilterPredicate, FindCoalescer, LiveArrayKind, LiveIndex};
use resmodel_schema::{Derivation, HashFn, SchemaRegistry, Transformation};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for store behavior.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Batch finds of one type issued in the same flush into one request.
    pub coalesce_find_requests: bool,
    /// Maximum ids per coalesced request.
    pub max_batch_size: usize,
    /// Prefix for generated local identifiers.
    pub lid_prefix: String,
    /// Remove records from live collections as soon as they are deleted.
    pub remove_deleted_from_live_arrays: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            coalesce_find_requests: true,
            max_batch_size: 50,
            lid_prefix: "@lid".to_string(),
            remove_deleted_from_live_arrays: true,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn coalesce_find_requests(mut self, value: bool) -> Self {
        self.coalesce_find_requests = value;
        self
    }

    #[must_use]
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    #[must_use]
    pub fn lid_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.lid_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn remove_deleted_from_live_arrays(mut self, value: bool) -> Self {
        self.remove_deleted_from_live_arrays = value;
        self
    }
}

/// Options for [`Store::create_record`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateOptions {
    /// Client-chosen local identifier for the new record.
    pub lid: Option<String>,
}

impl CreateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn lid(mut self, lid: impl Into<String>) -> Self {
        self.lid = Some(lid.into());
        self
    }
}

/// Records produced by [`Store::push`], shaped like the pushed document.
#[derive(Debug, Clone)]
pub enum PushResult {
    /// The document's primary data was a single resource (or null).
    Single(Option<Arc<SchemaRecord>>),
    /// The document's primary data was a collection.
    Many(Vec<Arc<SchemaRecord>>),
}

impl PushResult {
    /// The single record, or the first of a collection.
    pub fn one(self) -> Option<Arc<SchemaRecord>> {
        match self {
            PushResult::Single(record) => record,
            PushResult::Many(records) => records.into_iter().next(),
        }
    }

    pub fn records(self) -> Vec<Arc<SchemaRecord>> {
        match self {
            PushResult::Single(record) => record.into_iter().collect(),
            PushResult::Many(records) => records,
        }
    }
}

/// Debug information about store state.
#[derive(Debug, Clone, Default)]
pub struct StoreDebugInfo {
    /// Number of live resource keys.
    pub identifiers: usize,
    /// Number of cache entries.
    pub cached: usize,
    /// Number of materialized record projections.
    pub records: usize,
    /// Keys with uncommitted local writes.
    pub dirty: usize,
    /// Live collections still referenced by callers.
    pub live_arrays: usize,
    /// Finds queued for the next flush.
    pub pending_finds: usize,
    /// Keys per lifecycle state path.
    pub states: BTreeMap<String, usize>,
}

// ============================================================================
// Shared state
// ============================================================================

pub(crate) type Shared = Arc<RwLock<StoreInner>>;

pub(crate) fn read_inner(shared: &Shared) -> RwLockReadGuard<'_, StoreInner> {
    shared.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_inner(shared: &Shared) -> RwLockWriteGuard<'_, StoreInner> {
    shared.write().unwrap_or_else(PoisonError::into_inner)
}

/// Reach the store from a record or container handle.
pub(crate) fn upgrade(store: &Weak<RwLock<StoreInner>>) -> Result<Shared> {
    store.upgrade().ok_or(Error::StoreDropped)
}

/// What a commit sends to the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitOperation {
    Create,
    Update,
    Delete,
}

/// Everything `save_record` needs once the lock is released.
struct PreparedCommit {
    key: ResourceKey,
    generation: u64,
    operation: CommitOperation,
    snapshot: ResourceObject,
}

/// Primary keys and changed keys of one push.
pub(crate) struct PushOutcome {
    pub primary: Vec<ResourceKey>,
    pub single: bool,
    pub changed: BTreeSet<ResourceKey>,
}

/// All canonical and derived state of a store, guarded by one lock.
pub(crate) struct StoreInner {
    pub config: StoreConfig,
    pub schemas: SchemaRegistry,
    pub registry: IdentifierRegistry,
    pub cache: ResourceCache,
    pub overlay: MutationOverlay,
    pub lifecycle: LifecycleTable,
    pub errors: HashMap<ResourceKey, InvalidRecordError>,
    pub live: LiveIndex,
    pub coalescer: FindCoalescer,
    pub records: HashMap<(ResourceKey, bool), Arc<SchemaRecord>>,
    pub containers: HashMap<ContainerKey, Container>,
}

impl StoreInner {
    fn new(config: StoreConfig) -> Self {
        Self {
            registry: IdentifierRegistry::new(config.lid_prefix.clone()),
            config,
            schemas: SchemaRegistry::with_builtins(),
            cache: ResourceCache::new(),
            overlay: MutationOverlay::new(),
            lifecycle: LifecycleTable::new(),
            errors: HashMap::new(),
            live: LiveIndex::new(),
            coalescer: FindCoalescer::new(),
            records: HashMap::new(),
            containers: HashMap::new(),
        }
    }

    /// The live key for `key`, following merge redirects.
    pub(crate) fn canonical_key(&self, key: &ResourceKey) -> ResourceKey {
        self.registry
            .peek_lid(key.lid())
            .unwrap_or_else(|| key.clone())
    }

    /// Whether canonical data for the key has arrived.
    pub(crate) fn has_data(&self, key: &ResourceKey) -> bool {
        let state = self.lifecycle.state(key);
        state.is_loaded() && state != RecordState::Error(ErrorPhase::Loading)
    }

    /// Whether the key belongs in live collections.
    pub(crate) fn is_present(&self, key: &ResourceKey) -> bool {
        self.registry.contains(key)
            && self.cache.contains(key)
            && self.has_data(key)
            && !(self.config.remove_deleted_from_live_arrays && self.cache.is_deleted(key))
    }

    pub(crate) fn raw_attr(&self, key: &ResourceKey, editable: bool, storage: &str) -> Option<Value> {
        let overlaid = if editable {
            self.overlay.attr(key, storage)
        } else {
            None
        };
        overlaid
            .or_else(|| self.cache.get_attr(key, storage))
            .cloned()
    }

    /// Revision pair used to invalidate materialized containers.
    pub(crate) fn field_revision(&self, key: &ResourceKey, editable: bool, storage: &str) -> (u64, u64) {
        let local = if editable {
            self.overlay.revision(key, storage)
        } else {
            0
        };
        (self.cache.revision(key, storage), local)
    }

    /// Apply a lifecycle event if it is legal in the current state.
    fn soft_event(&mut self, key: &ResourceKey, event: LifecycleEvent) {
        let state = self.lifecycle.state(key);
        match state.next(event) {
            Some(next) if next != state => self.lifecycle.set(key, next),
            Some(_) => {}
            None => tracing::trace!(
                lid = key.lid(),
                state = state.as_str(),
                event = event.as_str(),
                "Ignoring lifecycle event"
            ),
        }
    }

    /// Move the key between clean and dirty after an overlay write.
    pub(crate) fn sync_dirty_state(&mut self, key: &ResourceKey) {
        let event = if self.overlay.has_local_changes(key) {
            LifecycleEvent::BecomeDirty
        } else {
            LifecycleEvent::BecomeClean
        };
        self.soft_event(key, event);
    }

    fn ensure_writable(&self, key: &ResourceKey, event: &str) -> Result<()> {
        let state = self.lifecycle.state(key);
        if !self.cache.contains(key) || matches!(state, RecordState::Empty | RecordState::Loading) {
            return Err(unknown_resource(key));
        }
        if matches!(
            state,
            RecordState::Deleted(DeletePhase::InFlight | DeletePhase::Saved)
        ) {
            return Err(Error::InvalidState(StateError {
                lid: key.lid().to_string(),
                state: state.as_str().to_string(),
                event: event.to_string(),
                message: "the record is deleted".to_string(),
            }));
        }
        Ok(())
    }

    /// Write an attribute to the overlay of an editable record.
    pub(crate) fn write_attr(
        &mut self,
        key: &ResourceKey,
        field: &str,
        storage: &str,
        value: Value,
        replace_container: bool,
    ) -> Result<()> {
        self.ensure_writable(key, "set")?;
        let canonical = self.cache.get_attr(key, storage).cloned();
        let changed = self
            .overlay
            .set_attr(key, storage, value, canonical.as_ref());
        self.clear_field_error(key, field);
        if changed {
            self.sync_dirty_state(key);
        }
        if replace_container {
            self.containers
                .remove(&ContainerKey::new(key, true, field));
        }
        tracing::trace!(lid = key.lid(), field, changed, "Wrote attribute");
        Ok(())
    }

    /// Replace relationship membership of an editable record.
    pub(crate) fn write_relationship(
        &mut self,
        key: &ResourceKey,
        field: &FieldSchema,
        data: RelationshipData,
    ) -> Result<()> {
        self.ensure_writable(key, "set")?;
        let touched = relationships::replace_relationship(self, Layer::Local, key, field, data)?;
        self.clear_field_error(key, &field.name);
        for touched_key in &touched {
            self.sync_dirty_state(touched_key);
        }
        tracing::trace!(lid = key.lid(), field = %field.name, touched = touched.len(), "Wrote relationship");
        Ok(())
    }

    fn clear_field_error(&mut self, key: &ResourceKey, field: &str) {
        let Some(bag) = self.errors.get_mut(key) else {
            return;
        };
        if bag.remove_field(field) && bag.is_empty() {
            self.errors.remove(key);
            self.soft_event(key, LifecycleEvent::BecameValid);
        }
    }

    /// Resolve an identifier to its key, merging a lid-only key that just
    /// learned its id. Merge side effects land in `touched`.
    fn resolve_identifier(
        &mut self,
        identifier: &ResourceIdentifier,
        touched: &mut BTreeSet<ResourceKey>,
    ) -> Result<ResourceKey> {
        let known = identifier
            .lid
            .as_deref()
            .and_then(|lid| self.registry.peek_lid(lid));
        let key = match (known, identifier.id.as_deref()) {
            (Some(key), Some(id)) if key.id().is_none() => {
                if let IdAssignment::Merged { abandoned } =
                    self.registry.merge_on_id_assignment(&key, id)?
                {
                    self.handle_merge(&key, &abandoned, touched)?;
                }
                key
            }
            _ => self.registry.get_or_create(
                &identifier.type_name,
                identifier.id.as_deref(),
                identifier.lid.as_deref(),
            )?,
        };
        self.cache.insert_empty(&key);
        Ok(key)
    }

    /// Fold everything known about `abandoned` into `kept`.
    fn handle_merge(
        &mut self,
        kept: &ResourceKey,
        abandoned: &ResourceKey,
        touched: &mut BTreeSet<ResourceKey>,
    ) -> Result<()> {
        touched.extend(self.cache.merge(kept, abandoned)?);
        for array in self.live.arrays_for(kept.type_name()) {
            array.replace_key(abandoned, kept);
        }
        self.records.retain(|(key, _), _| key != abandoned);
        self.containers.retain(|container, _| container.key() != abandoned);
        let abandoned_state = self.lifecycle.remove(abandoned);
        if self.lifecycle.state(kept).is_empty() && !abandoned_state.is_empty() {
            self.lifecycle.set(kept, abandoned_state);
        }
        self.overlay.forget(abandoned);
        self.errors.remove(abandoned);
        touched.insert(kept.clone());
        tracing::debug!(kept = %kept, abandoned = abandoned.lid(), "Merged resource keys");
        Ok(())
    }

    fn linkage_to_data(
        &mut self,
        linkage: Option<&Linkage>,
        many: bool,
        touched: &mut BTreeSet<ResourceKey>,
    ) -> Result<RelationshipData> {
        let data = match linkage {
            None => RelationshipData::empty(many),
            Some(Linkage::One(identifier)) => {
                let key = self.resolve_identifier(identifier, touched)?;
                if many {
                    RelationshipData::Many(vec![key])
                } else {
                    RelationshipData::One(Some(key))
                }
            }
            Some(Linkage::Many(identifiers)) => {
                let mut keys = Vec::with_capacity(identifiers.len());
                for identifier in identifiers {
                    let key = self.resolve_identifier(identifier, touched)?;
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
                RelationshipData::Many(keys)
            }
        };
        Ok(data)
    }

    /// Relationship linkage from a JSON identifier, array of identifiers, or null.
    pub(crate) fn data_from_json(
        &mut self,
        field: &FieldSchema,
        value: &Value,
        touched: &mut BTreeSet<ResourceKey>,
    ) -> Result<RelationshipData> {
        let many = field.kind == FieldKind::HasMany;
        let linkage = match value {
            Value::Null => None,
            Value::Array(items) => Some(Linkage::Many(
                items
                    .iter()
                    .map(|item| serde_json::from_value(item.clone()))
                    .collect::<std::result::Result<Vec<ResourceIdentifier>, _>>()?,
            )),
            other => Some(Linkage::One(serde_json::from_value(other.clone())?)),
        };
        self.linkage_to_data(linkage.as_ref(), many, touched)
    }

    /// Apply one resource object's data to the cache.
    fn apply_resource(&mut self, key: &ResourceKey, resource: &ResourceObject) -> Result<BTreeSet<ResourceKey>> {
        let schema = self.schemas.resource(key.type_name())?;
        let mut touched = BTreeSet::new();
        let mut data = ResourceData {
            attributes: resource.attributes.clone(),
            relationships: BTreeMap::new(),
        };
        let mut synchronized = Vec::new();

        for (name, payload) in &resource.relationships {
            let field = schema
                .get_field(name)
                .filter(|field| field.kind.is_relationship());
            let many = field.map_or_else(
                || matches!(payload.data, Some(Some(Linkage::Many(_)))),
                |field| field.kind == FieldKind::HasMany,
            );
            let linkage = match &payload.data {
                Some(linkage) => Some(self.linkage_to_data(linkage.as_ref(), many, &mut touched)?),
                None => None,
            };
            let state = RelationshipState {
                data: None,
                links: payload.links.clone(),
                meta: payload.meta.clone(),
            };
            match (field, linkage) {
                (Some(field), Some(linkage)) => {
                    synchronized.push((field.clone(), linkage));
                    data.relationships.insert(name.clone(), state);
                }
                (_, linkage) => {
                    data.relationships
                        .insert(name.clone(), RelationshipState { data: linkage, ..state });
                }
            }
        }

        if !self.cache.upsert(key, data)?.is_empty() {
            touched.insert(key.clone());
        }
        for (field, linkage) in synchronized {
            touched.extend(relationships::replace_relationship(
                self,
                Layer::Canonical,
                key,
                &field,
                linkage,
            )?);
        }
        Ok(touched)
    }

    /// Normalize a document into the cache.
    #[tracing::instrument(level = "debug", skip_all)]
    pub(crate) fn push_locked(&mut self, document: &Document) -> Result<PushOutcome> {
        let primary = document.primary();
        let mut changed = BTreeSet::new();
        let mut resolved = Vec::with_capacity(primary.len() + document.included.len());

        for resource in primary.iter().copied().chain(document.included.iter()) {
            if !self.schemas.has_resource(&resource.type_name) {
                return Err(Error::unknown_type(&resource.type_name));
            }
            let key = self.resolve_identifier(&resource.identifier(), &mut changed)?;
            resolved.push((key, resource));
        }

        for (key, resource) in &resolved {
            changed.extend(self.apply_resource(key, resource)?);
            self.soft_event(key, LifecycleEvent::Loaded);
        }

        self.prune_overlays(&changed);
        let primary_keys = resolved
            .iter()
            .take(primary.len())
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        tracing::debug!(
            resources = resolved.len(),
            changed = changed.len(),
            "Pushed document"
        );
        Ok(PushOutcome {
            primary: primary_keys,
            single: !document.is_collection(),
            changed,
        })
    }

    /// Drop overlay entries of `keys` that now equal canonical data.
    fn prune_overlays(&mut self, keys: &BTreeSet<ResourceKey>) {
        for key in keys {
            let Some(local) = self.overlay.local(key) else {
                continue;
            };
            let attributes = local.attributes.keys().cloned().collect::<Vec<_>>();
            let linkages = local.relationships.keys().cloned().collect::<Vec<_>>();
            for field in attributes {
                self.overlay
                    .prune_attr(key, &field, self.cache.get_attr(key, &field));
            }
            for field in linkages {
                self.overlay
                    .prune_relationship(key, &field, self.cache.relationship_data(key, &field));
            }
            self.sync_dirty_state(key);
        }
    }

    /// Register a locally created record with its initial values.
    fn create_locked(
        &mut self,
        type_name: &str,
        initial: &Value,
        options: &CreateOptions,
    ) -> Result<(ResourceKey, BTreeSet<ResourceKey>)> {
        let schema = self.schemas.resource(type_name)?;
        let empty = Map::new();
        let values = match initial {
            Value::Null => &empty,
            Value::Object(values) => values,
            _ => {
                return Err(Error::Custom(format!(
                    "initial values for '{type_name}' must be an object"
                )));
            }
        };
        let id_field = match &schema.identity {
            Identity::Id(field) => Some(field.as_str()),
            _ => None,
        };

        // Validate and serialize everything before registering the key.
        let mut attributes = Map::new();
        let mut linkages = Vec::new();
        let mut id = None;
        for (name, value) in values {
            if Some(name.as_str()) == id_field {
                id = id_value(value);
                continue;
            }
            let field = resolve_alias(&schema, name)?;
            match field.kind {
                FieldKind::Field => {
                    let serialized = match &field.type_ {
                        Some(transform) => self
                            .schemas
                            .transformation(transform, &format!("{type_name}.{}", field.name))?
                            .serialize(value, &field.options)?,
                        None => value.clone(),
                    };
                    attributes.insert(field.storage_key().to_string(), serialized);
                }
                FieldKind::Array | FieldKind::Object | FieldKind::SchemaObject | FieldKind::SchemaArray => {
                    attributes.insert(field.storage_key().to_string(), value.clone());
                }
                FieldKind::BelongsTo | FieldKind::HasMany | FieldKind::Resource => {
                    linkages.push((field.clone(), value.clone()));
                }
                FieldKind::Derived | FieldKind::Alias => {
                    return Err(Error::not_editable(type_name, name));
                }
            }
        }

        let key = self
            .registry
            .create(type_name, id.as_deref(), options.lid.as_deref())?;
        self.cache.insert_empty(&key);
        self.lifecycle.send(&key, LifecycleEvent::Create)?;

        let mut changed = BTreeSet::from([key.clone()]);
        self.cache.upsert(
            &key,
            ResourceData {
                attributes,
                relationships: BTreeMap::new(),
            },
        )?;
        for (field, value) in linkages {
            let data = self.data_from_json(&field, &value, &mut changed)?;
            changed.extend(relationships::replace_relationship(
                self,
                Layer::Canonical,
                &key,
                &field,
                data,
            )?);
        }
        tracing::debug!(lid = key.lid(), id = ?key.id(), "Created record");
        Ok((key, changed))
    }

    /// Drop `key` from the inverse side of each of its relationships in `layer`.
    fn detach_inverses(
        &mut self,
        layer: Layer,
        key: &ResourceKey,
        touched: &mut BTreeSet<ResourceKey>,
    ) -> Result<()> {
        let Ok(schema) = self.schemas.resource(key.type_name()) else {
            return Ok(());
        };
        for field in schema.relationships() {
            let Some(inverse) = field.inverse().filter(|_| field.kind != FieldKind::Resource) else {
                continue;
            };
            let members = relationships::read(self, layer, key, &field.name)
                .map(|data| data.keys())
                .unwrap_or_default();
            for member in members {
                relationships::remove_member(self, layer, &member, inverse, key, touched)?;
            }
        }
        Ok(())
    }

    /// Detach a destroyed record from every inverse, canonical and local.
    fn detach_destroyed(&mut self, key: &ResourceKey) -> Result<BTreeSet<ResourceKey>> {
        let mut touched = BTreeSet::new();
        self.detach_inverses(Layer::Canonical, key, &mut touched)?;
        self.detach_inverses(Layer::Local, key, &mut touched)?;
        touched.remove(key);
        for other in &touched {
            self.sync_dirty_state(other);
        }
        tracing::debug!(lid = key.lid(), detached = touched.len(), "Detached destroyed record");
        Ok(touched)
    }

    /// Remove a key and every trace of it, detaching canonical inverses.
    fn remove_entry(&mut self, key: &ResourceKey) -> Result<BTreeSet<ResourceKey>> {
        let mut touched = BTreeSet::new();
        self.detach_inverses(Layer::Canonical, key, &mut touched)?;
        self.cache.remove(key);
        self.registry.forget(key);
        self.overlay.forget(key);
        self.lifecycle.remove(key);
        self.errors.remove(key);
        self.records.retain(|(record_key, _), _| record_key != key);
        self.containers.retain(|container, _| container.key() != key);
        touched.insert(key.clone());
        Ok(touched)
    }

    /// Unload a clean record.
    fn unload_locked(&mut self, key: &ResourceKey) -> Result<BTreeSet<ResourceKey>> {
        self.lifecycle.send(key, LifecycleEvent::Unload)?;
        let touched = self.remove_entry(key)?;
        tracing::debug!(lid = key.lid(), "Unloaded record");
        Ok(touched)
    }

    fn delete_locked(&mut self, key: &ResourceKey) -> Result<BTreeSet<ResourceKey>> {
        let state = self.lifecycle.send(key, LifecycleEvent::Delete)?;
        self.cache.mark_deleted(key, true)?;
        tracing::debug!(lid = key.lid(), state = state.as_str(), "Marked record deleted");
        let mut changed = BTreeSet::from([key.clone()]);
        // A never-committed record is destroyed without a round trip.
        if state == RecordState::Deleted(DeletePhase::Saved) {
            changed.extend(self.detach_destroyed(key)?);
        }
        Ok(changed)
    }

    /// Discard local writes, restoring canonical membership of inverses.
    pub(crate) fn rollback_locked(&mut self, key: &ResourceKey) -> Result<BTreeSet<ResourceKey>> {
        let before = self.lifecycle.state(key);
        let after = self.lifecycle.send(key, LifecycleEvent::Rollback)?;
        let schema = self.schemas.resource(key.type_name())?;
        let mut touched = BTreeSet::new();

        let mut overlaid = self
            .overlay
            .inflight(key)
            .map(|o| o.relationships.keys().cloned().collect::<BTreeSet<_>>())
            .unwrap_or_default();
        if let Some(local) = self.overlay.local(key) {
            overlaid.extend(local.relationships.keys().cloned());
        }
        for name in overlaid {
            let Some(field) = schema.get_field(&name) else {
                continue;
            };
            let canonical = self
                .cache
                .relationship_data(key, &name)
                .cloned()
                .unwrap_or_else(|| RelationshipData::empty(field.kind == FieldKind::HasMany));
            touched.extend(relationships::replace_relationship(
                self,
                Layer::Local,
                key,
                field,
                canonical,
            )?);
        }

        self.overlay.rollback(key);
        self.errors.remove(key);
        for other in touched.iter().filter(|other| *other != key) {
            self.sync_dirty_state(other);
        }
        if before.is_deleted() {
            self.cache.mark_deleted(key, false)?;
        }
        if after.is_empty() {
            // A rolled back created record never existed.
            touched.extend(self.remove_entry(key)?);
        }
        touched.insert(key.clone());
        tracing::debug!(lid = key.lid(), from = before.as_str(), to = after.as_str(), "Rolled back record");
        Ok(touched)
    }

    /// Serialize the editable view of a record.
    pub(crate) fn serialize_key(&self, key: &ResourceKey) -> Result<ResourceObject> {
        let schema = self.schemas.resource(key.type_name())?;
        let entry = self.cache.peek(key).ok_or_else(|| unknown_resource(key))?;
        let mut object = ResourceObject::new(key.type_name(), key.id().map(str::to_string));
        object.lid = Some(key.lid().to_string());
        object.attributes = entry.attributes().clone();
        for overlay in [self.overlay.inflight(key), self.overlay.local(key)]
            .into_iter()
            .flatten()
        {
            for (field, value) in &overlay.attributes {
                object.attributes.insert(field.clone(), value.clone());
            }
        }
        for field in schema.relationships() {
            let Some(data) = relationships::read(self, Layer::Local, key, &field.name) else {
                continue;
            };
            let payload = match data {
                RelationshipData::One(related) => {
                    RelationshipPayload::to_one(related.map(|related| related.identifier()))
                }
                RelationshipData::Many(related) => RelationshipPayload::to_many(
                    related.iter().map(ResourceKey::identifier).collect(),
                ),
            };
            object.relationships.insert(field.name.clone(), payload);
        }
        Ok(object)
    }

    fn begin_commit(&mut self, key: &ResourceKey) -> Result<Option<PreparedCommit>> {
        let key = self.canonical_key(key);
        let state = self.lifecycle.state(&key);
        let operation = if state.is_deleted() || state == RecordState::Error(ErrorPhase::Deleted) {
            CommitOperation::Delete
        } else if state.is_new() {
            CommitOperation::Create
        } else {
            CommitOperation::Update
        };
        if matches!(state, RecordState::LoadedSaved | RecordState::Deleted(DeletePhase::Saved)) {
            tracing::debug!(lid = key.lid(), state = state.as_str(), "Nothing to commit");
            return Ok(None);
        }
        self.lifecycle.send(&key, LifecycleEvent::WillCommit)?;
        let (generation, _) = self.overlay.begin_commit(&key);
        let snapshot = self.serialize_key(&key)?;
        Ok(Some(PreparedCommit {
            key,
            generation,
            operation,
            snapshot,
        }))
    }

    fn finish_commit(
        &mut self,
        prepared: &PreparedCommit,
        result: Outcome<Option<Document>, Error>,
    ) -> (Outcome<(), Error>, BTreeSet<ResourceKey>) {
        let key = &prepared.key;
        if !self.overlay.is_current(key, prepared.generation) {
            tracing::warn!(lid = key.lid(), "Ignoring result of a superseded commit");
            return (Outcome::Ok(()), BTreeSet::new());
        }
        match result {
            Outcome::Ok(document) => match self.commit_succeeded(prepared, document) {
                Ok(changed) => (Outcome::Ok(()), changed),
                Err(e) => (Outcome::Err(e), BTreeSet::new()),
            },
            Outcome::Err(Error::Invalid(errors)) => {
                self.overlay.restore_inflight(key, prepared.generation);
                self.errors.insert(key.clone(), errors.clone());
                self.soft_event(key, LifecycleEvent::BecameInvalid);
                tracing::debug!(lid = key.lid(), errors = errors.len(), "Commit rejected as invalid");
                (Outcome::Err(Error::Invalid(errors)), BTreeSet::new())
            }
            Outcome::Err(e) => {
                self.commit_failed(prepared, &e);
                (Outcome::Err(e), BTreeSet::new())
            }
            Outcome::Cancelled(reason) => {
                self.commit_failed(prepared, &reason);
                (Outcome::Cancelled(reason), BTreeSet::new())
            }
            Outcome::Panicked(payload) => {
                self.commit_failed(prepared, &payload);
                (Outcome::Panicked(payload), BTreeSet::new())
            }
        }
    }

    fn commit_failed(&mut self, prepared: &PreparedCommit, cause: &dyn std::fmt::Debug) {
        self.overlay
            .restore_inflight(&prepared.key, prepared.generation);
        self.soft_event(&prepared.key, LifecycleEvent::BecameError);
        tracing::warn!(lid = prepared.key.lid(), cause = ?cause, "Commit failed");
    }

    fn commit_succeeded(
        &mut self,
        prepared: &PreparedCommit,
        document: Option<Document>,
    ) -> Result<BTreeSet<ResourceKey>> {
        let key = &prepared.key;
        let applied = self
            .overlay
            .complete_commit(key, prepared.generation)
            .unwrap_or_default();
        let mut changed = BTreeSet::new();

        if prepared.operation == CommitOperation::Create {
            let server_id = document
                .as_ref()
                .and_then(|document| document.primary().first().and_then(|r| r.id.clone()));
            match server_id {
                Some(id) => {
                    if let IdAssignment::Merged { abandoned } =
                        self.registry.merge_on_id_assignment(key, &id)?
                    {
                        self.handle_merge(key, &abandoned, &mut changed)?;
                    }
                }
                None if key.id().is_none() => {
                    tracing::warn!(lid = key.lid(), "Created record was accepted without an id");
                }
                None => {}
            }
        }

        changed.extend(self.apply_commit(key, applied)?);
        self.lifecycle.send(key, LifecycleEvent::DidCommit)?;
        self.errors.remove(key);
        if prepared.operation == CommitOperation::Delete {
            changed.extend(self.detach_destroyed(key)?);
        }

        if let Some(mut document) = document {
            if let Some(PrimaryData::One(resource)) = document.data.as_mut() {
                if resource.lid.is_none() && resource.type_name == key.type_name() {
                    resource.lid = Some(key.lid().to_string());
                }
            }
            changed.extend(self.push_locked(&document)?.changed);
        }
        self.prune_overlays(&changed);
        self.sync_dirty_state(key);
        changed.insert(key.clone());
        tracing::debug!(lid = key.lid(), id = ?key.id(), operation = ?prepared.operation, "Commit succeeded");
        Ok(changed)
    }

    /// Promote committed overlay values to canonical data.
    fn apply_commit(&mut self, key: &ResourceKey, applied: FieldOverlay) -> Result<BTreeSet<ResourceKey>> {
        let schema = self.schemas.resource(key.type_name())?;
        let mut touched = BTreeSet::new();
        for (storage, value) in applied.attributes {
            if self.cache.set_attr(key, &storage, value)? {
                touched.insert(key.clone());
            }
        }
        for (name, data) in applied.relationships {
            match schema.get_field(&name) {
                Some(field) => touched.extend(relationships::replace_relationship(
                    self,
                    Layer::Canonical,
                    key,
                    field,
                    data,
                )?),
                None => {
                    if self.cache.set_relationship(key, &name, Some(data))? {
                        touched.insert(key.clone());
                    }
                }
            }
        }
        Ok(touched)
    }

    /// Register the keys of a batch and mark them loading.
    fn start_batch(&mut self, batch: &FetchBatch) {
        for id in &batch.ids {
            if let Ok(key) = self.registry.get_or_create(&batch.type_name, Some(id), None) {
                self.cache.insert_empty(&key);
                self.soft_event(&key, LifecycleEvent::StartLoading);
            }
        }
    }

    /// Push a find result, settling each ticket of the batch.
    fn apply_find_batch(&mut self, batch: &FetchBatch, document: &Document) -> BTreeSet<ResourceKey> {
        let mut changed = BTreeSet::new();
        let mut found = HashSet::new();

        for resource in document.primary() {
            let Some(id) = resource.id.as_deref() else {
                continue;
            };
            let ticket = batch
                .ticket(id)
                .filter(|_| resource.type_name == batch.type_name);
            if let Some(ticket) = ticket {
                found.insert(id.to_string());
                if self.settle_stale(ticket) {
                    continue;
                }
            }
            let single = Document::single(resource.clone());
            match self.push_locked(&single) {
                Ok(pushed) => {
                    changed.extend(pushed.changed);
                    if let (Some(ticket), Some(key)) = (ticket, pushed.primary.into_iter().next()) {
                        self.coalescer.settle(ticket, Ok(key));
                    }
                }
                Err(e) => {
                    if let Some(ticket) = ticket {
                        self.coalescer.settle(ticket, Err(e));
                    }
                }
            }
        }

        if !document.included.is_empty() {
            let included = Document {
                data: None,
                included: document.included.clone(),
                meta: None,
                links: None,
            };
            match self.push_locked(&included) {
                Ok(pushed) => changed.extend(pushed.changed),
                Err(e) => tracing::warn!(error = %e, "Failed to push included resources"),
            }
        }

        for ticket in &batch.tickets {
            if found.contains(ticket.id()) || ticket.is_settled() || self.settle_stale(ticket) {
                continue;
            }
            if let Some(key) = self.registry.peek(ticket.type_name(), ticket.id()) {
                self.soft_event(&key, LifecycleEvent::LoadFailed);
            }
            self.coalescer
                .settle(ticket, Err(not_found(ticket.type_name(), ticket.id())));
        }
        changed
    }

    /// Settle a superseded ticket without applying its result.
    ///
    /// The ticket waits for its replacement, or resolves to the registry entry
    /// when the replacement has already landed. Returns false for current
    /// tickets.
    fn settle_stale(&mut self, ticket: &Arc<FetchTicket>) -> bool {
        if self.coalescer.is_current(ticket) {
            return false;
        }
        tracing::debug!(type_name = ticket.type_name(), id = ticket.id(), "Discarding stale find result");
        if !self.coalescer.defer(ticket) {
            let existing = self.registry.peek(ticket.type_name(), ticket.id());
            let result = existing.ok_or_else(|| not_found(ticket.type_name(), ticket.id()));
            self.coalescer.settle(ticket, result);
        }
        true
    }

    fn reject_batch(&mut self, batch: &FetchBatch, error: &Error) {
        for ticket in &batch.tickets {
            if self.settle_stale(ticket) {
                continue;
            }
            if let Some(key) = self.registry.peek(ticket.type_name(), ticket.id()) {
                self.soft_event(&key, LifecycleEvent::LoadFailed);
            }
            self.coalescer.settle(ticket, Err(error.clone()));
        }
        tracing::warn!(type_name = %batch.type_name, ids = ?batch.ids, error = %error, "Find request failed");
    }

    /// Replace relationship membership with the result of a related-link fetch.
    fn apply_related(
        &mut self,
        key: &ResourceKey,
        field: &FieldSchema,
        document: &Document,
    ) -> Result<BTreeSet<ResourceKey>> {
        let pushed = self.push_locked(document)?;
        let mut changed = pushed.changed;
        let data = if field.kind == FieldKind::HasMany {
            RelationshipData::Many(pushed.primary)
        } else {
            RelationshipData::One(pushed.primary.into_iter().next())
        };
        changed.extend(relationships::replace_relationship(
            self,
            Layer::Canonical,
            key,
            field,
            data,
        )?);
        self.prune_overlays(&changed);
        Ok(changed)
    }

    fn debug_info(&self) -> StoreDebugInfo {
        StoreDebugInfo {
            identifiers: self.registry.len(),
            cached: self.cache.len(),
            records: self.records.len(),
            dirty: self.overlay.dirty_keys().len(),
            live_arrays: self.live.len(),
            pending_finds: self.coalescer.pending(),
            states: self
                .lifecycle
                .counts()
                .into_iter()
                .map(|(state, count)| (state.to_string(), count))
                .collect(),
        }
    }
}

fn unknown_resource(key: &ResourceKey) -> Error {
    Error::UnknownResource(ResourceError {
        type_name: key.type_name().to_string(),
        id: key.id().map(str::to_string),
        lid: Some(key.lid().to_string()),
    })
}

fn not_found(type_name: &str, id: &str) -> Error {
    Error::NotFound(ResourceError {
        type_name: type_name.to_string(),
        id: Some(id.to_string()),
        lid: None,
    })
}

fn id_value(value: &Value) -> Option<String> {
    match value {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Follow an alias to the field it forwards to.
pub(crate) fn resolve_alias(schema: &ResourceSchema, name: &str) -> Result<FieldSchema> {
    let field = schema
        .get_field(name)
        .ok_or_else(|| Error::unknown_field(&schema.type_name, name))?;
    if field.kind != FieldKind::Alias {
        return Ok(field.clone());
    }
    field
        .options
        .alias_of
        .as_deref()
        .and_then(|target| schema.get_field(target))
        .cloned()
        .ok_or_else(|| Error::unknown_field(&schema.type_name, name))
}

/// Materialize (or reuse) the projection of a key in one mode.
pub(crate) fn record_for(shared: &Shared, key: &ResourceKey, editable: bool) -> Arc<SchemaRecord> {
    {
        let inner = read_inner(shared);
        let key = inner.canonical_key(key);
        if let Some(record) = inner.records.get(&(key, editable)) {
            return Arc::clone(record);
        }
    }
    let mut inner = write_inner(shared);
    let key = inner.canonical_key(key);
    let record = inner
        .records
        .entry((key.clone(), editable))
        .or_insert_with(|| Arc::new(SchemaRecord::new(Arc::downgrade(shared), key, editable)));
    Arc::clone(record)
}

/// Re-evaluate live collections for the keys a mutation changed.
///
/// Predicates run with the lock released.
pub(crate) fn notify_live(shared: &Shared, changed: &BTreeSet<ResourceKey>) {
    if changed.is_empty() {
        return;
    }
    let jobs = {
        let mut inner = write_inner(shared);
        changed
            .iter()
            .filter_map(|key| {
                let arrays = inner.live.arrays_for(key.type_name());
                if arrays.is_empty() {
                    return None;
                }
                let present = inner.is_present(key);
                Some((key.clone(), present, arrays))
            })
            .collect::<Vec<_>>()
    };

    for (key, present, arrays) in jobs {
        let reader = (present && arrays.iter().any(|array| array.needs_reader()))
            .then(|| record_for(shared, &key, false));
        for array in arrays {
            let matches = reader
                .as_deref()
                .and_then(|record| array.evaluate(record));
            if array.apply(&key, present, matches) {
                tracing::trace!(array = array.id(), lid = key.lid(), present, "Live collection updated");
            }
        }
    }
}

// ============================================================================
// Store
// ============================================================================

/// A normalized resource cache with schema-driven record projections.
pub struct Store<A: Adapter = NullAdapter> {
    inner: Shared,
    adapter: A,
}

impl Default for Store<NullAdapter> {
    fn default() -> Self {
        Self::new(NullAdapter)
    }
}

impl<A: Adapter> std::fmt::Debug for Store<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("state", &self.debug_state())
            .finish_non_exhaustive()
    }
}

impl<A: Adapter> Store<A> {
    /// Create a store with default configuration and the built-in extensions.
    pub fn new(adapter: A) -> Self {
        Self::with_config(adapter, StoreConfig::default())
    }

    pub fn with_config(adapter: A, config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner::new(config))),
            adapter,
        }
    }

    pub fn config(&self) -> StoreConfig {
        self.read().config.clone()
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        read_inner(&self.inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        write_inner(&self.inner)
    }

    // ========================================================================
    // Schema registration
    // ========================================================================

    pub fn register_resource(&self, schema: ResourceSchema) -> Result<()> {
        self.write().schemas.register_resource(schema)
    }

    pub fn register_transformation(
        &self,
        name: impl Into<String>,
        transformation: impl Transformation + 'static,
    ) {
        self.write()
            .schemas
            .register_transformation(name, transformation);
    }

    pub fn register_derivation(&self, name: impl Into<String>, derivation: impl Derivation + 'static) {
        self.write().schemas.register_derivation(name, derivation);
    }

    pub fn register_hash_fn(&self, name: impl Into<String>, hash_fn: impl HashFn + 'static) {
        self.write().schemas.register_hash_fn(name, hash_fn);
    }

    // ========================================================================
    // Push and peek
    // ========================================================================

    /// Normalize a document into the cache and return its primary records.
    ///
    /// Pushing the same document twice changes nothing and returns the same
    /// record instances.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn push(&self, document: Document) -> Result<PushResult> {
        let outcome = self.write().push_locked(&document)?;
        notify_live(&self.inner, &outcome.changed);
        let records = outcome
            .primary
            .iter()
            .map(|key| record_for(&self.inner, key, false))
            .collect::<Vec<_>>();
        Ok(if outcome.single {
            PushResult::Single(records.into_iter().next())
        } else {
            PushResult::Many(records)
        })
    }

    /// Push a JSON:API-shaped document.
    pub fn push_value(&self, document: Value) -> Result<PushResult> {
        self.push(Document::from_value(document)?)
    }

    /// The record for `(type, id)` if its data is loaded.
    pub fn peek_record(&self, type_name: &str, id: &str) -> Option<Arc<SchemaRecord>> {
        let key = {
            let inner = self.read();
            inner
                .registry
                .peek(type_name, id)
                .filter(|key| inner.has_data(key))?
        };
        Some(record_for(&self.inner, &key, false))
    }

    /// The record for a local identifier if its data is loaded.
    pub fn peek_record_by_lid(&self, lid: &str) -> Option<Arc<SchemaRecord>> {
        let key = {
            let inner = self.read();
            inner.registry.peek_lid(lid).filter(|key| inner.has_data(key))?
        };
        Some(record_for(&self.inner, &key, false))
    }

    /// The canonical key for `(type, id)`, if registered.
    pub fn identifier(&self, type_name: &str, id: &str) -> Option<ResourceKey> {
        self.read().registry.peek(type_name, id)
    }

    /// Live collection of every loaded record of a type.
    ///
    /// Repeated calls return the same underlying collection.
    pub fn peek_all(&self, type_name: &str) -> LiveCollection {
        let mut inner = self.write();
        let seed = inner
            .cache
            .keys_of_type(type_name)
            .into_iter()
            .filter(|key| inner.is_present(key))
            .collect::<Vec<_>>();
        let array = inner.live.all(type_name, || seed);
        LiveCollection::new(Arc::downgrade(&self.inner), array)
    }

    /// Live collection of loaded records of a type matching `predicate`.
    #[tracing::instrument(level = "debug", skip(self, predicate), fields(predicate = predicate.description()))]
    pub fn filter(&self, type_name: &str, predicate: FilterPredicate) -> LiveCollection {
        let (array, candidates) = {
            let mut inner = self.write();
            let array = inner.live.filter(type_name, predicate);
            let candidates = inner
                .cache
                .keys_of_type(type_name)
                .into_iter()
                .filter(|key| inner.is_present(key))
                .collect::<Vec<_>>();
            (array, candidates)
        };
        for key in candidates {
            let record = record_for(&self.inner, &key, false);
            let matches = array.evaluate(record.as_ref());
            array.apply(&key, true, matches);
        }
        tracing::debug!(members = array.len(), "Created filtered collection");
        LiveCollection::new(Arc::downgrade(&self.inner), array)
    }

    // ========================================================================
    // Local mutations
    // ========================================================================

    /// Create a new record seeded with `initial` field values.
    ///
    /// An `id` that is already registered fails immediately with
    /// `DuplicateIdentity`.
    #[tracing::instrument(level = "debug", skip(self, initial, options))]
    pub fn create_record(
        &self,
        type_name: &str,
        initial: Value,
        options: CreateOptions,
    ) -> Result<Arc<SchemaRecord>> {
        let (key, changed) = self
            .write()
            .create_locked(type_name, &initial, &options)?;
        notify_live(&self.inner, &changed);
        Ok(record_for(&self.inner, &key, false))
    }

    /// Mark a record deleted. The deletion is sent by [`save_record`](Self::save_record).
    #[tracing::instrument(level = "debug", skip(self, record), fields(key = %record.key()))]
    pub fn delete_record(&self, record: &SchemaRecord) -> Result<()> {
        let changed = {
            let mut inner = self.write();
            let key = inner.canonical_key(record.key());
            inner.delete_locked(&key)?
        };
        notify_live(&self.inner, &changed);
        Ok(())
    }

    /// Remove a clean record from the store.
    ///
    /// Dirty records must be rolled back or committed first.
    #[tracing::instrument(level = "debug", skip(self, record), fields(key = %record.key()))]
    pub fn unload_record(&self, record: &SchemaRecord) -> Result<()> {
        let changed = {
            let mut inner = self.write();
            let key = inner.canonical_key(record.key());
            inner.unload_locked(&key)?
        };
        notify_live(&self.inner, &changed);
        Ok(())
    }

    /// Discard local changes of a record.
    pub fn rollback_record(&self, record: &SchemaRecord) -> Result<()> {
        record.rollback()
    }

    /// Clear validation errors and return an invalid record to uncommitted.
    pub fn mark_valid(&self, record: &SchemaRecord) -> Result<()> {
        let mut inner = self.write();
        let key = inner.canonical_key(record.key());
        inner.errors.remove(&key);
        inner.lifecycle.send(&key, LifecycleEvent::BecameValid)?;
        Ok(())
    }

    // ========================================================================
    // Editable projections and commits
    // ========================================================================

    /// Obtain the editable projection of a record.
    pub async fn checkout(&self, cx: &Cx, record: &SchemaRecord) -> Outcome<Arc<SchemaRecord>, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let key = {
            let inner = self.read();
            let key = inner.canonical_key(record.key());
            if !inner.cache.contains(&key) {
                return Outcome::Err(unknown_resource(&key));
            }
            key
        };
        Outcome::Ok(record_for(&self.inner, &key, true))
    }

    /// Send a record's pending create, update or delete to the adapter.
    ///
    /// Writes made while the commit is in flight stay local and keep the
    /// record dirty. A commit superseded by rollback is ignored when it
    /// settles.
    #[tracing::instrument(level = "debug", skip(self, cx, record), fields(key = %record.key()))]
    pub async fn save_record(&self, cx: &Cx, record: &SchemaRecord) -> Outcome<(), Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }

        let prepared = match self.write().begin_commit(record.key()) {
            Ok(Some(prepared)) => prepared,
            Ok(None) => return Outcome::Ok(()),
            Err(e) => return Outcome::Err(e),
        };
        tracing::debug!(operation = ?prepared.operation, generation = prepared.generation, "Committing record");

        let result = match prepared.operation {
            CommitOperation::Create => self.adapter.create_record(cx, &prepared.snapshot).await,
            CommitOperation::Update => self.adapter.update_record(cx, &prepared.snapshot).await,
            CommitOperation::Delete => self.adapter.delete_record(cx, &prepared.snapshot).await,
        };

        let (outcome, changed) = self.write().finish_commit(&prepared, result);
        notify_live(&self.inner, &changed);
        outcome
    }

    // ========================================================================
    // Fetching
    // ========================================================================

    /// Find a record, fetching it when its data is not loaded.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn find_record(&self, cx: &Cx, type_name: &str, id: &str) -> Outcome<Arc<SchemaRecord>, Error> {
        if let Some(record) = self.peek_record(type_name, id) {
            tracing::trace!("Found loaded record");
            return Outcome::Ok(record);
        }
        let ticket = self.write().coalescer.find(type_name, id);
        // A superseded ticket settles once its replacement is flushed.
        while !ticket.is_settled() {
            match self.flush_finds(cx).await {
                Outcome::Ok(0) => break,
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        match self.ticket_record(&ticket) {
            Ok(record) => Outcome::Ok(record),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Queue finds and send them together on [`Finder::flush`].
    pub fn finder(&self) -> Finder<'_, A> {
        Finder { store: self }
    }

    /// The record a settled ticket resolved to.
    pub fn ticket_record(&self, ticket: &FetchTicket) -> Result<Arc<SchemaRecord>> {
        match ticket.result() {
            Some(Ok(key)) => Ok(record_for(&self.inner, &key, false)),
            Some(Err(e)) => Err(e),
            None => Err(Error::Custom(format!(
                "find for {}:{} has not been flushed",
                ticket.type_name(),
                ticket.id()
            ))),
        }
    }

    /// Send every queued find, one request per batch.
    ///
    /// Returns the number of adapter requests made. A failed request rejects
    /// the tickets of its batch only.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn flush_finds(&self, cx: &Cx) -> Outcome<usize, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let coalesce = self.adapter.coalesce_find_requests();
        let batches = {
            let mut inner = self.write();
            let max = if coalesce && inner.config.coalesce_find_requests {
                inner.config.max_batch_size
            } else {
                1
            };
            let batches = inner.coalescer.take_batches(max);
            for batch in &batches {
                inner.start_batch(batch);
            }
            batches
        };
        if batches.is_empty() {
            return Outcome::Ok(0);
        }
        tracing::debug!(batches = batches.len(), "Flushing queued finds");

        let mut requests = 0;
        let mut remaining = batches.into_iter();
        while let Some(batch) = remaining.next() {
            if let Some(reason) = cx.cancel_reason() {
                self.reject_all(std::iter::once(batch).chain(remaining), "find cancelled");
                return Outcome::Cancelled(reason);
            }
            requests += 1;
            let outcome = if let [id] = batch.ids.as_slice() {
                self.adapter.find_record(cx, &batch.type_name, id).await
            } else {
                self.adapter
                    .find_many(cx, &batch.type_name, &batch.ids)
                    .await
            };
            match outcome {
                Outcome::Ok(document) => {
                    let changed = self.write().apply_find_batch(&batch, &document);
                    notify_live(&self.inner, &changed);
                }
                Outcome::Err(e) => self.write().reject_batch(&batch, &e),
                Outcome::Cancelled(reason) => {
                    self.reject_all(std::iter::once(batch).chain(remaining), "find cancelled");
                    return Outcome::Cancelled(reason);
                }
                Outcome::Panicked(payload) => {
                    self.reject_all(std::iter::once(batch).chain(remaining), "find panicked");
                    return Outcome::Panicked(payload);
                }
            }
        }
        Outcome::Ok(requests)
    }

    fn reject_all(&self, batches: impl Iterator<Item = FetchBatch>, message: &str) {
        let mut inner = self.write();
        for batch in batches {
            inner.reject_batch(&batch, &Error::Custom(message.to_string()));
        }
    }

    /// Fetch unloaded members of a to-many relationship.
    ///
    /// Members are batched with every other queued find. A relationship whose
    /// data is absent but which carries `links.related` is fetched through the
    /// link instead.
    #[tracing::instrument(level = "debug", skip(self, cx, record), fields(key = %record.key()))]
    pub async fn load_has_many(&self, cx: &Cx, record: &SchemaRecord, field: &str) -> Outcome<Arc<ManyArray>, Error> {
        let (needs_link, queued) = {
            let mut inner = self.write();
            let key = inner.canonical_key(record.key());
            let schema = match inner.schemas.field(key.type_name(), field) {
                Ok(schema) => schema,
                Err(e) => return Outcome::Err(e),
            };
            if schema.kind != FieldKind::HasMany {
                return Outcome::Err(Error::Custom(format!(
                    "'{}.{field}' is not a hasMany relationship",
                    key.type_name()
                )));
            }
            let data = relationships::read(&inner, Layer::for_mode(record.is_editable()), &key, field);
            let has_link = inner
                .cache
                .relationship(&key, field)
                .and_then(|state| state.links.as_ref())
                .and_then(|links| links.related_href())
                .is_some();
            match data {
                None if has_link => (true, 0),
                data => {
                    let unloaded = data
                        .map(|data| data.keys())
                        .unwrap_or_default()
                        .into_iter()
                        .filter(|member| !inner.has_data(member))
                        .filter_map(|member| member.id().map(|id| (member.type_name().to_string(), id.to_string())))
                        .collect::<Vec<_>>();
                    for (type_name, id) in &unloaded {
                        inner.coalescer.find(type_name, id);
                    }
                    (false, unloaded.len())
                }
            }
        };

        if needs_link {
            match self.reload_relationship(cx, record, field).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        } else if queued > 0 {
            tracing::debug!(members = queued, "Loading hasMany members");
            match self.flush_finds(cx).await {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        match record.has_many(field) {
            Ok(many) => Outcome::Ok(many),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Refetch a relationship through its `links.related` URL.
    ///
    /// Materialized containers and member records keep their identity.
    #[tracing::instrument(level = "debug", skip(self, cx, record), fields(key = %record.key()))]
    pub async fn reload_relationship(&self, cx: &Cx, record: &SchemaRecord, field: &str) -> Outcome<(), Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let prepared = {
            let inner = self.read();
            let key = inner.canonical_key(record.key());
            inner
                .schemas
                .field(key.type_name(), field)
                .and_then(|schema| {
                    if !schema.kind.is_relationship() {
                        return Err(Error::Custom(format!(
                            "'{}.{field}' is not a relationship",
                            key.type_name()
                        )));
                    }
                    let link = inner
                        .cache
                        .relationship(&key, field)
                        .and_then(|state| state.links.as_ref())
                        .and_then(|links| links.related_href())
                        .map(str::to_string)
                        .ok_or_else(|| {
                            Error::LinksModeAssertion(LinksModeError {
                                kind: LinksModeErrorKind::MissingRelatedLink,
                                type_name: key.type_name().to_string(),
                                field: field.to_string(),
                                related: None,
                            })
                        })?;
                    Ok((key, schema, link))
                })
        };
        let (key, schema, link) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return Outcome::Err(e),
        };

        tracing::debug!(link = %link, "Fetching related resources");
        let document = match self
            .adapter
            .find_related(cx, &key.identifier(), field, &link)
            .await
        {
            Outcome::Ok(document) => document,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let changed = match self.write().apply_related(&key, &schema, &document) {
            Ok(changed) => changed,
            Err(e) => return Outcome::Err(e),
        };
        notify_live(&self.inner, &changed);
        Outcome::Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// A server-query collection. It stays unloaded until [`load_query`](Self::load_query).
    pub fn query_collection(&self, type_name: &str, query: Value) -> LiveCollection {
        let array = self.write().live.query(type_name, query);
        LiveCollection::new(Arc::downgrade(&self.inner), array)
    }

    /// Run (or rerun) the query behind a collection and replace its members.
    #[tracing::instrument(level = "debug", skip(self, cx, collection), fields(type_name = collection.type_name()))]
    pub async fn load_query(&self, cx: &Cx, collection: &LiveCollection) -> Outcome<(), Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let array = collection.array();
        let LiveArrayKind::Query(query) = array.kind() else {
            return Outcome::Err(Error::Custom(format!(
                "collection of '{}' is not a query collection",
                array.type_name()
            )));
        };

        array.set_updating(true);
        let document = match self.adapter.query(cx, array.type_name(), query).await {
            Outcome::Ok(document) => document,
            Outcome::Err(e) => {
                array.set_updating(false);
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                array.set_updating(false);
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                array.set_updating(false);
                return Outcome::Panicked(p);
            }
        };

        let pushed = {
            let mut inner = self.write();
            inner.push_locked(&document).map(|pushed| {
                let members = pushed
                    .primary
                    .iter()
                    .filter(|key| inner.is_present(key))
                    .cloned()
                    .collect::<Vec<_>>();
                (members, pushed.changed)
            })
        };
        array.set_updating(false);
        let (members, changed) = match pushed {
            Ok(pushed) => pushed,
            Err(e) => return Outcome::Err(e),
        };
        array.replace_members(members);
        array.set_meta(document.meta.clone());
        array.mark_loaded();
        notify_live(&self.inner, &changed);
        tracing::debug!(members = array.len(), "Query loaded");
        Outcome::Ok(())
    }

    // ========================================================================
    // Cache inspection
    // ========================================================================

    /// Canonical cache entry of a key.
    pub fn cache_peek(&self, key: &ResourceKey) -> Option<CacheEntry> {
        let inner = self.read();
        let key = inner.canonical_key(key);
        inner.cache.peek(&key).cloned()
    }

    /// Canonical raw attribute value.
    pub fn cache_get_attr(&self, key: &ResourceKey, field: &str) -> Option<Value> {
        let inner = self.read();
        let key = inner.canonical_key(key);
        inner.cache.get_attr(&key, field).cloned()
    }

    pub fn cache_is_deleted(&self, key: &ResourceKey) -> bool {
        let inner = self.read();
        let key = inner.canonical_key(key);
        inner.cache.is_deleted(&key)
    }

    /// Serialize the editable view of a record (canonical data plus local writes).
    pub fn serialize_record(&self, record: &SchemaRecord) -> Result<ResourceObject> {
        let inner = self.read();
        let key = inner.canonical_key(record.key());
        inner.serialize_key(&key)
    }

    /// Get debug information about store state.
    pub fn debug_state(&self) -> StoreDebugInfo {
        self.read().debug_info()
    }
}

/// Queues finds so that lookups issued together share requests.
///
/// ```ignore
/// let finder = store.finder();
/// let tickets = ["1", "2", "3"].map(|id| finder.find("post", id));
/// finder.flush(&cx).await; // one find_many("post", ["1", "2", "3"])
/// let post = finder.record(&tickets[0])?;
/// ```
pub struct Finder<'a, A: Adapter> {
    store: &'a Store<A>,
}

impl<A: Adapter> Finder<'_, A> {
    /// Queue a find, joining an identical one already in flight.
    pub fn find(&self, type_name: &str, id: &str) -> Arc<FetchTicket> {
        self.store.write().coalescer.find(type_name, id)
    }

    /// Queue a refetch. An older in-flight result for the same id becomes stale.
    pub fn reload(&self, type_name: &str, id: &str) -> Arc<FetchTicket> {
        self.store.write().coalescer.reload(type_name, id)
    }

    pub fn pending(&self) -> usize {
        self.store.read().coalescer.pending()
    }

    pub async fn flush(&self, cx: &Cx) -> Outcome<usize, Error> {
        self.store.flush_finds(cx).await
    }

    pub fn record(&self, ticket: &FetchTicket) -> Result<Arc<SchemaRecord>> {
        self.store.ticket_record(ticket)
    }
}
