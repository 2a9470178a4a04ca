//! Materialized field containers.
//!
//! Containers are cached per `(record, mode, field)` so that repeated reads
//! of the same field return the same instance:
//!
//! - [`ManagedArray`] - plain array attribute
//! - [`SchemaObject`] - object attribute projected through an object schema
//! - [`SchemaArray`] - array of schema objects; elements keep their identity
//!   across updates when their resolved type and hash are unchanged
//! - [`ManyArray`] - to-many relationship members
//!
//! Containers read through the store on every access. Schema objects keep a
//! snapshot of their raw value that is patched in place on reconciliation.

use crate::record::{SchemaRecord, hydrate_value};
use crate::relationships::{self, Layer};
use crate::store::{Shared, StoreInner, read_inner, record_for, resolve_alias, upgrade, write_inner};
use resmodel_cache::RelationshipData;
use resmodel_core::{
    Error, FieldKind, FieldReader, FieldSchema, Identity, ResourceKey, Result,
};
use resmodel_schema::HashFn;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

/// Cache slot of one materialized field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ContainerKey {
    key: ResourceKey,
    editable: bool,
    field: String,
}

impl ContainerKey {
    pub(crate) fn new(key: &ResourceKey, editable: bool, field: &str) -> Self {
        Self {
            key: key.clone(),
            editable,
            field: field.to_string(),
        }
    }

    pub(crate) fn key(&self) -> &ResourceKey {
        &self.key
    }
}

pub(crate) enum Container {
    Array(Arc<ManagedArray>),
    Object(ObjectSlot),
    SchemaArray(Arc<SchemaArray>),
    Many(Arc<ManyArray>),
}

impl Container {
    fn as_array(&self) -> Option<&Arc<ManagedArray>> {
        match self {
            Container::Array(array) => Some(array),
            _ => None,
        }
    }

    fn as_schema_array(&self) -> Option<&Arc<SchemaArray>> {
        match self {
            Container::SchemaArray(array) => Some(array),
            _ => None,
        }
    }

    fn as_many(&self) -> Option<&Arc<ManyArray>> {
        match self {
            Container::Many(many) => Some(many),
            _ => None,
        }
    }
}

/// A schema-object field: the current object and the identity it was built for.
pub(crate) struct ObjectSlot {
    revision: (u64, u64),
    present: bool,
    identity: Option<ElementIdentity>,
    object: Option<Arc<SchemaObject>>,
}

/// Identity of an embedded object. A change of resolved type always breaks it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum ElementIdentity {
    Hashed { type_name: String, hash: String },
    Positional { type_name: String, index: usize },
}

impl ElementIdentity {
    fn type_name(&self) -> &str {
        match self {
            ElementIdentity::Hashed { type_name, .. }
            | ElementIdentity::Positional { type_name, .. } => type_name,
        }
    }
}

fn get_or_insert<T>(
    shared: &Shared,
    slot: ContainerKey,
    extract: fn(&Container) -> Option<&Arc<T>>,
    wrap: fn(Arc<T>) -> Container,
    create: impl FnOnce() -> Arc<T>,
) -> Arc<T> {
    let mut inner = write_inner(shared);
    if let Some(existing) = inner.containers.get(&slot).and_then(extract) {
        return Arc::clone(existing);
    }
    let created = create();
    inner.containers.insert(slot, wrap(Arc::clone(&created)));
    created
}

pub(crate) fn managed_array(
    shared: &Shared,
    key: &ResourceKey,
    editable: bool,
    field: &FieldSchema,
) -> Arc<ManagedArray> {
    get_or_insert(
        shared,
        ContainerKey::new(key, editable, &field.name),
        Container::as_array,
        Container::Array,
        || {
            Arc::new(ManagedArray {
                store: Arc::downgrade(shared),
                key: key.clone(),
                editable,
                field: field.name.clone(),
                storage: field.storage_key().to_string(),
            })
        },
    )
}

pub(crate) fn schema_array(
    shared: &Shared,
    key: &ResourceKey,
    editable: bool,
    field: &FieldSchema,
) -> Arc<SchemaArray> {
    get_or_insert(
        shared,
        ContainerKey::new(key, editable, &field.name),
        Container::as_schema_array,
        Container::SchemaArray,
        || SchemaArray::new(Arc::downgrade(shared), key.clone(), editable, field.clone()),
    )
}

pub(crate) fn many_array(
    shared: &Shared,
    key: &ResourceKey,
    editable: bool,
    field: &FieldSchema,
) -> Arc<ManyArray> {
    get_or_insert(
        shared,
        ContainerKey::new(key, editable, &field.name),
        Container::as_many,
        Container::Many,
        || {
            Arc::new(ManyArray {
                store: Arc::downgrade(shared),
                owner: key.clone(),
                editable,
                field: field.clone(),
            })
        },
    )
}

/// The schema object of a field, reusing the previous instance while the
/// value's identity is unchanged.
pub(crate) fn schema_object(
    shared: &Shared,
    key: &ResourceKey,
    editable: bool,
    field: &FieldSchema,
) -> Result<Option<Arc<SchemaObject>>> {
    let slot = ContainerKey::new(key, editable, &field.name);
    let storage = field.storage_key();
    let (revision, raw) = {
        let inner = read_inner(shared);
        let revision = inner.field_revision(key, editable, storage);
        if let Some(Container::Object(cached)) = inner.containers.get(&slot) {
            if cached.revision == revision {
                return Ok(cached.object.clone().filter(|_| cached.present));
            }
        }
        (revision, inner.raw_attr(key, editable, storage))
    };

    let value = raw.unwrap_or(Value::Null);
    let identity = if value.is_null() {
        None
    } else {
        compute_identities(shared, field, key.type_name(), std::slice::from_ref(&value))?
            .into_iter()
            .next()
    };

    let mut inner = write_inner(shared);
    let Some(identity) = identity else {
        // The last object stays in the slot so a transient null keeps its identity.
        match inner.containers.get_mut(&slot) {
            Some(Container::Object(cached)) => {
                cached.revision = revision;
                cached.present = false;
            }
            _ => {
                inner.containers.insert(
                    slot,
                    Container::Object(ObjectSlot {
                        revision,
                        present: false,
                        identity: None,
                        object: None,
                    }),
                );
            }
        }
        return Ok(None);
    };

    let reuse = match inner.containers.get(&slot) {
        Some(Container::Object(cached)) if cached.identity.as_ref() == Some(&identity) => {
            cached.object.clone()
        }
        _ => None,
    };
    let object = match reuse {
        Some(object) => {
            object.patch(value, 0);
            object
        }
        None => Arc::new(SchemaObject::new(
            Arc::downgrade(shared),
            key.clone(),
            editable,
            field.clone(),
            identity.type_name().to_string(),
            Parent::Field,
            value,
        )),
    };
    inner.containers.insert(
        slot,
        Container::Object(ObjectSlot {
            revision,
            present: true,
            identity: Some(identity),
            object: Some(Arc::clone(&object)),
        }),
    );
    Ok(Some(object))
}

fn element_type(field: &FieldSchema, value: &Value, path: &str) -> Result<String> {
    if field.options.polymorphic {
        let type_key = field.options.type_key.as_deref().unwrap_or("type");
        if let Some(type_name) = value.get(type_key).and_then(Value::as_str) {
            return Ok(type_name.to_string());
        }
    }
    field
        .type_
        .clone()
        .ok_or_else(|| Error::Custom(format!("cannot resolve the object type of '{path}'")))
}

/// Identity of every element of an embedded object list.
///
/// `options.key` wins: `@index` is positional, `@identity` hashes the whole
/// value and any other name hashes that member. Otherwise the object schema's
/// hash function decides, falling back to position.
fn compute_identities(
    shared: &Shared,
    field: &FieldSchema,
    owner_type: &str,
    values: &[Value],
) -> Result<Vec<ElementIdentity>> {
    let path = format!("{owner_type}.{}", field.name);
    let types = values
        .iter()
        .map(|value| element_type(field, value, &path))
        .collect::<Result<Vec<_>>>()?;

    let mut hashers: HashMap<String, Option<Arc<dyn HashFn>>> = HashMap::new();
    if field.options.key.is_none() {
        let inner = read_inner(shared);
        for type_name in &types {
            if hashers.contains_key(type_name) {
                continue;
            }
            let schema = inner.schemas.resource(type_name)?;
            let hasher = match &schema.identity {
                Identity::Hash(name) => Some(inner.schemas.hash_fn(name, &path)?),
                _ => None,
            };
            hashers.insert(type_name.clone(), hasher);
        }
    }

    values
        .iter()
        .zip(types)
        .enumerate()
        .map(|(index, (value, type_name))| {
            let hash = match field.options.key.as_deref() {
                Some("@index") => None,
                Some("@identity") => Some(value.to_string()),
                Some(member) => value
                    .get(member)
                    .filter(|member| !member.is_null())
                    .map(|member| member.as_str().map_or_else(|| member.to_string(), str::to_string)),
                None => match hashers.get(&type_name).and_then(Option::as_ref) {
                    Some(hasher) => hasher.hash(value, &field.options, &field.name)?,
                    None => None,
                },
            };
            Ok(match hash {
                Some(hash) => ElementIdentity::Hashed { type_name, hash },
                None => ElementIdentity::Positional { type_name, index },
            })
        })
        .collect()
}

fn array_items(raw: Option<Value>) -> Vec<Value> {
    match raw {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => Vec::new(),
        Some(other) => vec![other],
    }
}

fn raw_field(
    store: &Weak<RwLock<StoreInner>>,
    owner: &ResourceKey,
    editable: bool,
    storage: &str,
) -> Result<Option<Value>> {
    let shared = upgrade(store)?;
    let inner = read_inner(&shared);
    let key = inner.canonical_key(owner);
    Ok(inner.raw_attr(&key, editable, storage))
}

// ============================================================================
// ManagedArray
// ============================================================================

/// A plain array attribute.
#[derive(Debug)]
pub struct ManagedArray {
    store: Weak<RwLock<StoreInner>>,
    key: ResourceKey,
    editable: bool,
    field: String,
    storage: String,
}

impl ManagedArray {
    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn is_editable(&self) -> bool {
        self.editable
    }

    pub fn to_vec(&self) -> Result<Vec<Value>> {
        raw_field(&self.store, &self.key, self.editable, &self.storage).map(array_items)
    }

    pub fn to_value(&self) -> Result<Value> {
        self.to_vec().map(Value::Array)
    }

    pub fn len(&self) -> Result<usize> {
        self.to_vec().map(|items| items.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|len| len == 0)
    }

    pub fn get(&self, index: usize) -> Result<Option<Value>> {
        Ok(self.to_vec()?.into_iter().nth(index))
    }

    pub fn push(&self, value: Value) -> Result<()> {
        self.mutate(|items| {
            items.push(value);
            Ok(())
        })
    }

    /// Insert at `index`, clamped to the end of the array.
    pub fn insert(&self, index: usize, value: Value) -> Result<()> {
        self.mutate(|items| {
            items.insert(index.min(items.len()), value);
            Ok(())
        })
    }

    pub fn set(&self, index: usize, value: Value) -> Result<()> {
        let field = self.field.clone();
        self.mutate(|items| match items.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(Error::Custom(format!(
                "index {index} is out of bounds for '{field}'"
            ))),
        })
    }

    pub fn remove(&self, index: usize) -> Result<Option<Value>> {
        self.mutate(|items| Ok((index < items.len()).then(|| items.remove(index))))
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut Vec<Value>) -> Result<R>) -> Result<R> {
        if !self.editable {
            return Err(Error::not_editable(self.key.type_name(), &self.field));
        }
        let shared = upgrade(&self.store)?;
        let mut inner = write_inner(&shared);
        let key = inner.canonical_key(&self.key);
        let mut items = array_items(inner.raw_attr(&key, true, &self.storage));
        let result = f(&mut items)?;
        inner.write_attr(&key, &self.field, &self.storage, Value::Array(items), false)?;
        Ok(result)
    }
}

// ============================================================================
// SchemaObject
// ============================================================================

#[derive(Debug)]
enum Parent {
    /// The whole value of a schema-object field.
    Field,
    /// One element of a schema array.
    Element {
        array: Weak<SchemaArray>,
        index: AtomicUsize,
    },
}

/// An embedded object projected through its object schema.
#[derive(Debug)]
pub struct SchemaObject {
    store: Weak<RwLock<StoreInner>>,
    owner: ResourceKey,
    editable: bool,
    field: FieldSchema,
    object_type: String,
    parent: Parent,
    value: RwLock<Value>,
}

impl SchemaObject {
    fn new(
        store: Weak<RwLock<StoreInner>>,
        owner: ResourceKey,
        editable: bool,
        field: FieldSchema,
        object_type: String,
        parent: Parent,
        value: Value,
    ) -> Self {
        Self {
            store,
            owner,
            editable,
            field,
            object_type,
            parent,
            value: RwLock::new(value),
        }
    }

    /// Resolved object schema type.
    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    /// Record that owns the field this object lives in.
    pub fn owner(&self) -> &ResourceKey {
        &self.owner
    }

    pub fn is_editable(&self) -> bool {
        self.editable
    }

    /// Current raw value.
    pub fn to_value(&self) -> Result<Value> {
        self.refresh()?;
        Ok(self.snapshot())
    }

    fn snapshot(&self) -> Value {
        self.value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Update the raw value in place after reconciliation.
    fn patch(&self, value: Value, index: usize) {
        *self.value.write().unwrap_or_else(PoisonError::into_inner) = value;
        if let Parent::Element { index: slot, .. } = &self.parent {
            slot.store(index, Ordering::Release);
        }
    }

    fn refresh(&self) -> Result<()> {
        match &self.parent {
            Parent::Field => {
                let raw = raw_field(&self.store, &self.owner, self.editable, self.field.storage_key())?;
                *self.value.write().unwrap_or_else(PoisonError::into_inner) =
                    raw.unwrap_or(Value::Null);
                Ok(())
            }
            Parent::Element { array, .. } => match array.upgrade() {
                Some(array) => array.sync(),
                None => Ok(()),
            },
        }
    }

    /// Read a field of the object schema.
    pub fn get(&self, name: &str) -> Result<Value> {
        self.refresh()?;
        let shared = upgrade(&self.store)?;
        let path = format!("{}.{name}", self.object_type);
        let (field, transform, derivation) = {
            let inner = read_inner(&shared);
            let schema = inner.schemas.resource(&self.object_type)?;
            let field = resolve_alias(&schema, name)?;
            let transform = match (field.kind, &field.type_) {
                (FieldKind::Field, Some(name)) => Some(inner.schemas.transformation(name, &path)?),
                _ => None,
            };
            let derivation = match (field.kind, &field.type_) {
                (FieldKind::Derived, Some(name)) => Some(inner.schemas.derivation(name, &path)?),
                _ => None,
            };
            (field, transform, derivation)
        };

        if let Some(derivation) = derivation {
            return derivation.derive(self, &field.options, &field.name);
        }
        let raw = self.snapshot().get(field.storage_key()).cloned();
        match field.kind {
            FieldKind::Field => hydrate_value(raw, transform, &field.options),
            _ => Ok(raw.unwrap_or(Value::Null)),
        }
    }

    /// Write a field of the object schema into the owner's overlay.
    pub fn set(&self, name: &str, value: Value) -> Result<()> {
        if !self.editable {
            return Err(Error::not_editable(&self.object_type, name));
        }
        self.refresh()?;
        let shared = upgrade(&self.store)?;
        let path = format!("{}.{name}", self.object_type);
        let (storage, serialized) = {
            let inner = read_inner(&shared);
            let schema = inner.schemas.resource(&self.object_type)?;
            let field = resolve_alias(&schema, name)?;
            let serialized = match (field.kind, &field.type_) {
                (FieldKind::Derived, _) => return Err(Error::not_editable(&self.object_type, name)),
                (FieldKind::Field, Some(transform)) => inner
                    .schemas
                    .transformation(transform, &path)?
                    .serialize(&value, &field.options)?,
                _ => value,
            };
            (field.storage_key().to_string(), serialized)
        };

        let mut next = match self.snapshot() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        next.insert(storage, serialized);
        let next = Value::Object(next);

        {
            let mut inner = write_inner(&shared);
            let key = inner.canonical_key(&self.owner);
            let storage = self.field.storage_key();
            let raw = match &self.parent {
                Parent::Field => next.clone(),
                Parent::Element { index, .. } => {
                    let index = index.load(Ordering::Acquire);
                    let mut items = array_items(inner.raw_attr(&key, true, storage));
                    let Some(slot) = items.get_mut(index) else {
                        return Err(Error::Custom(format!(
                            "element {index} of '{}.{}' no longer exists",
                            key.type_name(),
                            self.field.name
                        )));
                    };
                    *slot = next.clone();
                    Value::Array(items)
                }
            };
            inner.write_attr(&key, &self.field.name, storage, raw, false)?;
        }
        *self.value.write().unwrap_or_else(PoisonError::into_inner) = next;
        Ok(())
    }
}

impl FieldReader for SchemaObject {
    fn key(&self) -> &ResourceKey {
        &self.owner
    }

    fn read_field(&self, field: &str) -> Result<Value> {
        self.get(field)
    }
}

// ============================================================================
// SchemaArray
// ============================================================================

#[derive(Debug, Default)]
struct ArrayState {
    revision: Option<(u64, u64)>,
    elements: Vec<Arc<SchemaObject>>,
    identities: Vec<ElementIdentity>,
    is_null: bool,
}

/// An array of embedded objects with identity-preserving reconciliation.
#[derive(Debug)]
pub struct SchemaArray {
    this: Weak<SchemaArray>,
    store: Weak<RwLock<StoreInner>>,
    owner: ResourceKey,
    editable: bool,
    field: FieldSchema,
    state: RwLock<ArrayState>,
}

impl SchemaArray {
    fn new(
        store: Weak<RwLock<StoreInner>>,
        owner: ResourceKey,
        editable: bool,
        field: FieldSchema,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            store,
            owner,
            editable,
            field,
            state: RwLock::new(ArrayState::default()),
        })
    }

    pub fn field(&self) -> &str {
        &self.field.name
    }

    pub fn is_editable(&self) -> bool {
        self.editable
    }

    /// Reconcile elements with the current raw array.
    ///
    /// An element whose `(type, hash)` matches a previous element reuses that
    /// instance and has its value patched; anything else is built fresh.
    pub(crate) fn sync(&self) -> Result<()> {
        let shared = upgrade(&self.store)?;
        let storage = self.field.storage_key();
        let (revision, raw) = {
            let inner = read_inner(&shared);
            let key = inner.canonical_key(&self.owner);
            (
                inner.field_revision(&key, self.editable, storage),
                inner.raw_attr(&key, self.editable, storage),
            )
        };
        let current = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .revision;
        if current == Some(revision) {
            return Ok(());
        }

        let is_null = matches!(raw, None | Some(Value::Null));
        let values = array_items(raw);
        let identities = compute_identities(&shared, &self.field, self.owner.type_name(), &values)?;

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let old_identities = std::mem::take(&mut state.identities);
        let old_elements = std::mem::take(&mut state.elements);
        let mut previous = old_identities
            .into_iter()
            .zip(old_elements)
            .collect::<HashMap<_, _>>();

        let mut reused = 0;
        let mut elements = Vec::with_capacity(values.len());
        for (index, (value, identity)) in values.into_iter().zip(&identities).enumerate() {
            let element = match previous.remove(identity) {
                Some(element) => {
                    reused += 1;
                    element.patch(value, index);
                    element
                }
                None => Arc::new(SchemaObject::new(
                    self.store.clone(),
                    self.owner.clone(),
                    self.editable,
                    self.field.clone(),
                    identity.type_name().to_string(),
                    Parent::Element {
                        array: self.this.clone(),
                        index: AtomicUsize::new(index),
                    },
                    value,
                )),
            };
            elements.push(element);
        }
        tracing::trace!(
            field = %self.field.name,
            elements = elements.len(),
            reused,
            "Reconciled schema array"
        );

        state.elements = elements;
        state.identities = identities;
        state.revision = Some(revision);
        state.is_null = is_null;
        Ok(())
    }

    pub fn elements(&self) -> Result<Vec<Arc<SchemaObject>>> {
        self.sync()?;
        Ok(self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .elements
            .clone())
    }

    pub fn get(&self, index: usize) -> Result<Option<Arc<SchemaObject>>> {
        Ok(self.elements()?.into_iter().nth(index))
    }

    pub fn len(&self) -> Result<usize> {
        self.elements().map(|elements| elements.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|len| len == 0)
    }

    /// Whether the raw value is null or absent rather than an empty array.
    pub fn is_null(&self) -> Result<bool> {
        self.sync()?;
        Ok(self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_null)
    }

    pub fn to_value(&self) -> Result<Value> {
        let raw = raw_field(&self.store, &self.owner, self.editable, self.field.storage_key())?;
        Ok(raw.unwrap_or(Value::Null))
    }

    pub fn push(&self, value: Value) -> Result<()> {
        self.mutate(|items| items.push(value))
    }

    pub fn remove(&self, index: usize) -> Result<Option<Value>> {
        self.mutate(|items| (index < items.len()).then(|| items.remove(index)))
    }

    /// Replace every element. Elements with unchanged identity keep their instance.
    pub fn replace(&self, values: Vec<Value>) -> Result<()> {
        self.mutate(|items| *items = values)
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut Vec<Value>) -> R) -> Result<R> {
        if !self.editable {
            return Err(Error::not_editable(self.owner.type_name(), &self.field.name));
        }
        let shared = upgrade(&self.store)?;
        let mut inner = write_inner(&shared);
        let key = inner.canonical_key(&self.owner);
        let storage = self.field.storage_key();
        let mut items = array_items(inner.raw_attr(&key, true, storage));
        let result = f(&mut items);
        inner.write_attr(&key, &self.field.name, storage, Value::Array(items), false)?;
        Ok(result)
    }
}

// ============================================================================
// ManyArray
// ============================================================================

/// Members of a to-many relationship.
///
/// Mutations require an editable owner and keep inverses in step.
#[derive(Debug)]
pub struct ManyArray {
    store: Weak<RwLock<StoreInner>>,
    owner: ResourceKey,
    editable: bool,
    field: FieldSchema,
}

impl ManyArray {
    pub fn field(&self) -> &str {
        &self.field.name
    }

    pub fn owner(&self) -> &ResourceKey {
        &self.owner
    }

    pub fn is_editable(&self) -> bool {
        self.editable
    }

    /// Member keys in order.
    pub fn keys(&self) -> Result<Vec<ResourceKey>> {
        let shared = upgrade(&self.store)?;
        let inner = read_inner(&shared);
        let owner = inner.canonical_key(&self.owner);
        Ok(relationships::resolve_for_read(&inner, &owner, self.editable, &self.field)?.keys())
    }

    /// Member records, in the same mode as the owner.
    pub fn records(&self) -> Result<Vec<Arc<SchemaRecord>>> {
        let shared = upgrade(&self.store)?;
        let keys = self.keys()?;
        Ok(keys
            .iter()
            .map(|key| record_for(&shared, key, self.editable))
            .collect())
    }

    pub fn get(&self, index: usize) -> Result<Option<Arc<SchemaRecord>>> {
        let shared = upgrade(&self.store)?;
        Ok(self
            .keys()?
            .get(index)
            .map(|key| record_for(&shared, key, self.editable)))
    }

    pub fn len(&self) -> Result<usize> {
        self.keys().map(|keys| keys.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|len| len == 0)
    }

    pub fn contains(&self, record: &SchemaRecord) -> Result<bool> {
        Ok(self.keys()?.contains(record.key()))
    }

    /// Append a member. Existing members keep their position.
    pub fn push(&self, record: &SchemaRecord) -> Result<()> {
        self.mutate(&[record], |keys, members| keys.extend(members))
    }

    /// Same as [`push`](Self::push).
    pub fn add_object(&self, record: &SchemaRecord) -> Result<()> {
        self.push(record)
    }

    /// Prepend a member, moving it to the front if already present.
    pub fn unshift(&self, record: &SchemaRecord) -> Result<()> {
        self.mutate(&[record], |keys, mut members| {
            members.append(keys);
            *keys = members;
        })
    }

    /// Remove `delete_count` members at `start` and insert `records` there.
    ///
    /// Returns the removed keys.
    pub fn splice(
        &self,
        start: usize,
        delete_count: usize,
        records: &[&SchemaRecord],
    ) -> Result<Vec<ResourceKey>> {
        self.mutate(records, |keys, members| {
            let start = start.min(keys.len());
            let end = start.saturating_add(delete_count).min(keys.len());
            keys.splice(start..end, members).collect()
        })
    }

    pub fn remove_object(&self, record: &SchemaRecord) -> Result<()> {
        self.mutate(&[record], |keys, members| {
            keys.retain(|key| !members.contains(key));
        })
    }

    /// Replace the whole membership.
    pub fn replace(&self, records: &[&SchemaRecord]) -> Result<()> {
        self.mutate(records, |keys, members| *keys = members)
    }

    fn check_member(&self, member: &ResourceKey) -> Result<()> {
        match self.field.type_.as_deref() {
            Some(expected) if !self.field.options.polymorphic && expected != member.type_name() => {
                Err(Error::Custom(format!(
                    "cannot add '{}' to '{}.{}', which holds '{expected}'",
                    member,
                    self.owner.type_name(),
                    self.field.name
                )))
            }
            _ => Ok(()),
        }
    }

    fn mutate<R>(
        &self,
        records: &[&SchemaRecord],
        f: impl FnOnce(&mut Vec<ResourceKey>, Vec<ResourceKey>) -> R,
    ) -> Result<R> {
        if !self.editable {
            return Err(Error::not_editable(self.owner.type_name(), &self.field.name));
        }
        let shared = upgrade(&self.store)?;
        let mut inner = write_inner(&shared);
        let owner = inner.canonical_key(&self.owner);
        let members = records
            .iter()
            .map(|record| {
                let key = inner.canonical_key(record.key());
                self.check_member(&key).map(|()| key)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut keys = relationships::read(&inner, Layer::Local, &owner, &self.field.name)
            .map(|data| data.keys())
            .unwrap_or_default();
        let result = f(&mut keys, members);
        inner.write_relationship(&owner, &self.field, RelationshipData::Many(keys))?;
        Ok(result)
    }
}
