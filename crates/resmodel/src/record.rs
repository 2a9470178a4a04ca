//! Schema-driven record projections.
//!
//! A [`SchemaRecord`] is a thin handle bound to one `(key, mode)` pair. It
//! holds no field data: every read resolves the field through the resource
//! schema and reads the cache (plus the mutation overlay in editable mode).
//! The store hands out one `Arc<SchemaRecord>` per pair, so two reads of the
//! same record through any path return the same instance.

use crate::containers::{
    self, ManagedArray, ManyArray, SchemaArray, SchemaObject,
};
use crate::relationships;
use crate::store::{Shared, StoreInner, notify_live, read_inner, record_for, resolve_alias, upgrade, write_inner};
use resmodel_cache::{RecordState, RelationshipData};
use resmodel_core::{
    Error, FieldKind, FieldOptions, FieldReader, FieldSchema, InvalidRecordError, ResourceKey,
    Result,
};
use resmodel_schema::Transformation;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock, Weak};

/// The materialized value of one field.
#[derive(Debug, Clone)]
pub enum FieldValue {
    /// `field`, `object` and `derived` values.
    Value(Value),
    Array(Arc<ManagedArray>),
    Object(Option<Arc<SchemaObject>>),
    SchemaArray(Arc<SchemaArray>),
    /// `belongsTo` and `resource` references.
    Record(Option<Arc<SchemaRecord>>),
    Many(Arc<ManyArray>),
}

impl FieldValue {
    /// Plain JSON rendering. Relationships render as resource identifiers.
    pub fn into_json(self) -> Result<Value> {
        match self {
            FieldValue::Value(value) => Ok(value),
            FieldValue::Array(array) => array.to_value(),
            FieldValue::Object(Some(object)) => object.to_value(),
            FieldValue::Object(None) | FieldValue::Record(None) => Ok(Value::Null),
            FieldValue::SchemaArray(array) => array.to_value(),
            FieldValue::Record(Some(record)) => Ok(serde_json::to_value(record.key().identifier())?),
            FieldValue::Many(many) => many
                .keys()?
                .iter()
                .map(|key| serde_json::to_value(key.identifier()).map_err(Error::from))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
        }
    }
}

/// Apply a transformation (and any `defaultValue` option) to a raw value.
pub(crate) fn hydrate_value(
    raw: Option<Value>,
    transform: Option<Arc<dyn Transformation>>,
    options: &FieldOptions,
) -> Result<Value> {
    let raw = raw.or_else(|| options.extra.get("defaultValue").cloned());
    match (transform, raw) {
        (Some(transform), Some(raw)) => transform.hydrate(Some(&raw), options),
        (Some(transform), None) => match transform.default_value(options) {
            Some(value) => Ok(value),
            None => transform.hydrate(None, options),
        },
        (None, raw) => Ok(raw.unwrap_or(Value::Null)),
    }
}

/// What a field read needs from the registry, looked up under one lock.
struct ResolvedField {
    key: ResourceKey,
    field: FieldSchema,
    path: String,
}

/// One record seen through one mode.
pub struct SchemaRecord {
    store: Weak<RwLock<StoreInner>>,
    key: ResourceKey,
    editable: bool,
}

impl std::fmt::Debug for SchemaRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRecord")
            .field("key", &self.key)
            .field("editable", &self.editable)
            .finish_non_exhaustive()
    }
}

impl SchemaRecord {
    pub(crate) fn new(store: Weak<RwLock<StoreInner>>, key: ResourceKey, editable: bool) -> Self {
        Self {
            store,
            key,
            editable,
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn type_name(&self) -> &str {
        self.key.type_name()
    }

    /// Server id, once known.
    pub fn id(&self) -> Option<&str> {
        self.key.id()
    }

    pub fn lid(&self) -> &str {
        self.key.lid()
    }

    pub fn is_editable(&self) -> bool {
        self.editable
    }

    fn shared(&self) -> Result<Shared> {
        upgrade(&self.store)
    }

    fn resolve(&self, inner: &StoreInner, name: &str) -> Result<ResolvedField> {
        let key = inner.canonical_key(&self.key);
        let schema = inner.schemas.resource(key.type_name())?;
        let field = resolve_alias(&schema, name)?;
        let path = format!("{}.{name}", key.type_name());
        Ok(ResolvedField { key, field, path })
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Materialize a field.
    pub fn field(&self, name: &str) -> Result<FieldValue> {
        let shared = self.shared()?;
        let (resolved, scalar, transform) = {
            let inner = read_inner(&shared);
            let resolved = self.resolve(&inner, name)?;
            let field = &resolved.field;
            let scalar = matches!(field.kind, FieldKind::Field | FieldKind::Object)
                .then(|| inner.raw_attr(&resolved.key, self.editable, field.storage_key()))
                .flatten();
            let transform = match (field.kind, &field.type_) {
                (FieldKind::Field, Some(name)) => {
                    Some(inner.schemas.transformation(name, &resolved.path)?)
                }
                _ => None,
            };
            (resolved, scalar, transform)
        };
        let ResolvedField { key, field, path } = resolved;

        match field.kind {
            FieldKind::Field => {
                hydrate_value(scalar, transform, &field.options).map(FieldValue::Value)
            }
            FieldKind::Object => Ok(FieldValue::Value(scalar.unwrap_or(Value::Null))),
            FieldKind::Array => Ok(FieldValue::Array(containers::managed_array(
                &shared,
                &key,
                self.editable,
                &field,
            ))),
            FieldKind::SchemaObject => {
                containers::schema_object(&shared, &key, self.editable, &field).map(FieldValue::Object)
            }
            FieldKind::SchemaArray => Ok(FieldValue::SchemaArray(containers::schema_array(
                &shared,
                &key,
                self.editable,
                &field,
            ))),
            FieldKind::BelongsTo | FieldKind::Resource => {
                let related = {
                    let inner = read_inner(&shared);
                    relationships::resolve_for_read(&inner, &key, self.editable, &field)?
                        .keys()
                        .into_iter()
                        .next()
                };
                Ok(FieldValue::Record(
                    related.map(|related| record_for(&shared, &related, self.editable)),
                ))
            }
            FieldKind::HasMany => {
                relationships::resolve_for_read(&read_inner(&shared), &key, self.editable, &field)?;
                Ok(FieldValue::Many(containers::many_array(
                    &shared,
                    &key,
                    self.editable,
                    &field,
                )))
            }
            FieldKind::Derived => {
                let derivation = {
                    let name = field
                        .type_
                        .as_deref()
                        .ok_or_else(|| Error::unknown_field(key.type_name(), &field.name))?;
                    read_inner(&shared).schemas.derivation(name, &path)?
                };
                derivation
                    .derive(self, &field.options, &field.name)
                    .map(FieldValue::Value)
            }
            FieldKind::Alias => Err(Error::unknown_field(key.type_name(), name)),
        }
    }

    /// Plain JSON value of a field.
    pub fn get(&self, name: &str) -> Result<Value> {
        self.field(name)?.into_json()
    }

    pub fn array(&self, name: &str) -> Result<Arc<ManagedArray>> {
        match self.field(name)? {
            FieldValue::Array(array) => Ok(array),
            _ => Err(self.wrong_kind(name, FieldKind::Array)),
        }
    }

    pub fn schema_object(&self, name: &str) -> Result<Option<Arc<SchemaObject>>> {
        match self.field(name)? {
            FieldValue::Object(object) => Ok(object),
            _ => Err(self.wrong_kind(name, FieldKind::SchemaObject)),
        }
    }

    pub fn schema_array(&self, name: &str) -> Result<Arc<SchemaArray>> {
        match self.field(name)? {
            FieldValue::SchemaArray(array) => Ok(array),
            _ => Err(self.wrong_kind(name, FieldKind::SchemaArray)),
        }
    }

    /// Related record of a to-one relationship.
    pub fn belongs_to(&self, name: &str) -> Result<Option<Arc<SchemaRecord>>> {
        match self.field(name)? {
            FieldValue::Record(record) => Ok(record),
            _ => Err(self.wrong_kind(name, FieldKind::BelongsTo)),
        }
    }

    /// Members of a to-many relationship.
    pub fn has_many(&self, name: &str) -> Result<Arc<ManyArray>> {
        match self.field(name)? {
            FieldValue::Many(many) => Ok(many),
            _ => Err(self.wrong_kind(name, FieldKind::HasMany)),
        }
    }

    fn wrong_kind(&self, name: &str, expected: FieldKind) -> Error {
        Error::Custom(format!(
            "'{}.{name}' is not a {} field",
            self.type_name(),
            expected.as_str()
        ))
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Write a field through the editable projection.
    ///
    /// Relationship fields take resource identifiers (`{"type", "id"}`), an
    /// array of them, or null.
    #[tracing::instrument(level = "trace", skip(self, value), fields(key = %self.key))]
    pub fn set(&self, name: &str, value: Value) -> Result<()> {
        if !self.editable {
            return Err(Error::not_editable(self.type_name(), name));
        }
        let shared = self.shared()?;
        let mut touched = BTreeSet::new();
        {
            let mut inner = write_inner(&shared);
            let ResolvedField { key, field, path } = self.resolve(&inner, name)?;
            let storage = field.storage_key();
            match field.kind {
                FieldKind::Derived | FieldKind::Alias => {
                    return Err(Error::not_editable(key.type_name(), name));
                }
                FieldKind::Field => {
                    let serialized = match &field.type_ {
                        Some(transform) => inner
                            .schemas
                            .transformation(transform, &path)?
                            .serialize(&value, &field.options)?,
                        None => value,
                    };
                    inner.write_attr(&key, &field.name, storage, serialized, false)?;
                }
                FieldKind::Array => inner.write_attr(&key, &field.name, storage, value, true)?,
                FieldKind::Object | FieldKind::SchemaObject | FieldKind::SchemaArray => {
                    inner.write_attr(&key, &field.name, storage, value, false)?;
                }
                FieldKind::BelongsTo | FieldKind::Resource | FieldKind::HasMany => {
                    let data = inner.data_from_json(&field, &value, &mut touched)?;
                    check_members(&key, &field, &data)?;
                    inner.write_relationship(&key, &field, data)?;
                }
            }
        }
        notify_live(&shared, &touched);
        Ok(())
    }

    /// Point a to-one relationship at `related`, or clear it.
    pub fn set_belongs_to(&self, name: &str, related: Option<&SchemaRecord>) -> Result<()> {
        if !self.editable {
            return Err(Error::not_editable(self.type_name(), name));
        }
        let shared = self.shared()?;
        let mut inner = write_inner(&shared);
        let ResolvedField { key, field, .. } = self.resolve(&inner, name)?;
        if !matches!(field.kind, FieldKind::BelongsTo | FieldKind::Resource) {
            return Err(self.wrong_kind(name, FieldKind::BelongsTo));
        }
        let data = RelationshipData::One(related.map(|record| inner.canonical_key(record.key())));
        check_members(&key, &field, &data)?;
        inner.write_relationship(&key, &field, data)
    }

    // ========================================================================
    // State
    // ========================================================================

    /// Current lifecycle state. A dropped store reports `Empty`.
    pub fn state(&self) -> RecordState {
        let Ok(shared) = self.shared() else {
            return RecordState::Empty;
        };
        let inner = read_inner(&shared);
        let key = inner.canonical_key(&self.key);
        inner.lifecycle.state(&key)
    }

    pub fn is_new(&self) -> bool {
        self.state().is_new()
    }

    pub fn is_dirty(&self) -> bool {
        self.state().is_dirty()
    }

    pub fn is_deleted(&self) -> bool {
        self.state().is_deleted()
    }

    pub fn is_valid(&self) -> bool {
        self.state().is_valid()
    }

    pub fn is_saving(&self) -> bool {
        self.state().is_saving()
    }

    pub fn is_loaded(&self) -> bool {
        self.state().is_loaded()
    }

    /// Attributes whose uncommitted value differs from the saved one, as
    /// `(saved, current)` pairs keyed by field name.
    ///
    /// A record that was never committed reports every attribute against null.
    pub fn changed_attributes(&self) -> Result<BTreeMap<String, (Value, Value)>> {
        let shared = self.shared()?;
        let inner = read_inner(&shared);
        let key = inner.canonical_key(&self.key);
        let schema = inner.schemas.resource(key.type_name())?;
        let is_new = inner.lifecycle.state(&key).is_new();

        let mut changed = BTreeMap::new();
        for field in schema.attributes() {
            let storage = field.storage_key();
            let overlaid = inner
                .overlay
                .local(&key)
                .and_then(|local| local.attributes.get(storage))
                .or_else(|| {
                    inner
                        .overlay
                        .inflight(&key)
                        .and_then(|inflight| inflight.attributes.get(storage))
                });
            let saved = inner.cache.get_attr(&key, storage);
            let entry = match (is_new, overlaid) {
                (true, current) => current
                    .or(saved)
                    .map(|current| (Value::Null, current.clone())),
                (false, Some(current)) if Some(current) != saved => {
                    Some((saved.cloned().unwrap_or(Value::Null), current.clone()))
                }
                (false, _) => None,
            };
            if let Some(entry) = entry {
                changed.insert(field.name.clone(), entry);
            }
        }
        Ok(changed)
    }

    /// Discard local and in-flight changes. A record that was never committed
    /// is removed from the store.
    #[tracing::instrument(level = "debug", skip(self), fields(key = %self.key))]
    pub fn rollback(&self) -> Result<()> {
        let shared = self.shared()?;
        let changed = {
            let mut inner = write_inner(&shared);
            let key = inner.canonical_key(&self.key);
            inner.rollback_locked(&key)?
        };
        notify_live(&shared, &changed);
        Ok(())
    }

    /// Validation errors reported by the last failed commit.
    pub fn errors(&self) -> InvalidRecordError {
        let Ok(shared) = self.shared() else {
            return InvalidRecordError::new();
        };
        let inner = read_inner(&shared);
        let key = inner.canonical_key(&self.key);
        inner.errors.get(&key).cloned().unwrap_or_default()
    }

    pub fn errors_for(&self, field: &str) -> Vec<String> {
        self.errors()
            .for_field(field)
            .into_iter()
            .map(str::to_string)
            .collect()
    }
}

impl FieldReader for SchemaRecord {
    fn key(&self) -> &ResourceKey {
        &self.key
    }

    fn read_field(&self, field: &str) -> Result<Value> {
        self.get(field)
    }
}

fn check_members(owner: &ResourceKey, field: &FieldSchema, data: &RelationshipData) -> Result<()> {
    let Some(expected) = field.type_.as_deref().filter(|_| !field.options.polymorphic) else {
        return Ok(());
    };
    match data.keys().into_iter().find(|key| key.type_name() != expected) {
        Some(member) => Err(Error::Custom(format!(
            "cannot relate '{member}' through '{}.{}', which holds '{expected}'",
            owner.type_name(),
            field.name
        ))),
        None => Ok(()),
    }
}
