//! The resource cache: normalized attribute and relationship data per key.
//!
//! The cache is the single source of truth for canonical (committed or
//! server-provided) data. Relationships are stored as key references, never as
//! record pointers, so cyclic graphs need no ownership tricks.
//!
//! Every field carries a revision number taken from a cache-wide clock. A
//! field's revision changes only when its stored value changes, which lets
//! materialized projections invalidate lazily and precisely.

use resmodel_core::{Error, Links, ResourceError, ResourceKey, Result, Value};
use serde_json::Map;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Resolved relationship linkage.
#[derive(Debug, Clone, PartialEq)]
pub enum RelationshipData {
    One(Option<ResourceKey>),
    Many(Vec<ResourceKey>),
}

impl RelationshipData {
    /// Empty linkage of the given cardinality.
    pub fn empty(many: bool) -> Self {
        if many {
            RelationshipData::Many(Vec::new())
        } else {
            RelationshipData::One(None)
        }
    }

    pub fn is_many(&self) -> bool {
        matches!(self, RelationshipData::Many(_))
    }

    /// Member keys in order.
    pub fn keys(&self) -> Vec<ResourceKey> {
        match self {
            RelationshipData::One(key) => key.iter().cloned().collect(),
            RelationshipData::Many(keys) => keys.clone(),
        }
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        match self {
            RelationshipData::One(Some(k)) => k == key,
            RelationshipData::One(None) => false,
            RelationshipData::Many(keys) => keys.contains(key),
        }
    }

    /// Swap every reference to `from` for `to`, dropping duplicates.
    pub fn replace_key(&mut self, from: &ResourceKey, to: &ResourceKey) -> bool {
        match self {
            RelationshipData::One(slot) => {
                if slot.as_ref() == Some(from) {
                    *slot = Some(to.clone());
                    true
                } else {
                    false
                }
            }
            RelationshipData::Many(keys) => {
                if !keys.contains(from) {
                    return false;
                }
                let already_present = keys.contains(to);
                let mut replaced = Vec::with_capacity(keys.len());
                for key in keys.drain(..) {
                    if key == *from {
                        if !already_present && !replaced.contains(to) {
                            replaced.push(to.clone());
                        }
                    } else {
                        replaced.push(key);
                    }
                }
                *keys = replaced;
                true
            }
        }
    }
}

/// Stored relationship payload. `data == None` means "not provided".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationshipState {
    pub data: Option<RelationshipData>,
    pub links: Option<Links>,
    pub meta: Option<Value>,
}

impl RelationshipState {
    pub fn with_data(data: RelationshipData) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }
}

/// Partial resource data applied by [`ResourceCache::upsert`].
///
/// Members not present are left untouched in the cache.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceData {
    pub attributes: Map<String, Value>,
    pub relationships: BTreeMap<String, RelationshipState>,
}

/// Cache entry for one resource key.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    key: ResourceKey,
    seq: u64,
    attributes: Map<String, Value>,
    relationships: BTreeMap<String, RelationshipState>,
    revisions: HashMap<String, u64>,
    deleted: bool,
}

impl CacheEntry {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    pub fn relationships(&self) -> &BTreeMap<String, RelationshipState> {
        &self.relationships
    }

    pub fn attr(&self, field: &str) -> Option<&Value> {
        self.attributes.get(field)
    }

    pub fn relationship(&self, field: &str) -> Option<&RelationshipState> {
        self.relationships.get(field)
    }

    /// Revision of a stored field; 0 if never written.
    pub fn revision(&self, field: &str) -> u64 {
        self.revisions.get(field).copied().unwrap_or(0)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// True if no attribute or relationship data has been stored.
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty() && self.relationships.is_empty()
    }
}

/// Arena of cache entries keyed by [`ResourceKey`].
#[derive(Debug, Default)]
pub struct ResourceCache {
    entries: HashMap<ResourceKey, CacheEntry>,
    clock: u64,
    next_seq: u64,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Current value of the cache-wide revision clock.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn entry_mut(&mut self, key: &ResourceKey) -> Result<&mut CacheEntry> {
        self.entries
            .get_mut(key)
            .ok_or_else(|| unknown_resource(key))
    }

    /// Register an empty entry for a freshly created key.
    pub fn insert_empty(&mut self, key: &ResourceKey) -> bool {
        if self.entries.contains_key(key) {
            return false;
        }
        self.next_seq += 1;
        self.entries.insert(
            key.clone(),
            CacheEntry {
                key: key.clone(),
                seq: self.next_seq,
                attributes: Map::new(),
                relationships: BTreeMap::new(),
                revisions: HashMap::new(),
                deleted: false,
            },
        );
        true
    }

    /// Apply partial resource data, returning the names of fields whose stored
    /// value actually changed. Re-applying identical data changes nothing.
    #[tracing::instrument(level = "trace", skip(self, key, data), fields(key = %key))]
    pub fn upsert(&mut self, key: &ResourceKey, data: ResourceData) -> Result<BTreeSet<String>> {
        if !self.entries.contains_key(key) {
            return Err(unknown_resource(key));
        }
        let mut changed = BTreeSet::new();

        for (field, value) in data.attributes {
            if self.set_attr(key, &field, value)? {
                changed.insert(field);
            }
        }

        for (field, incoming) in data.relationships {
            let current = self
                .entries
                .get(key)
                .and_then(|entry| entry.relationships.get(&field))
                .cloned()
                .unwrap_or_default();
            let next = RelationshipState {
                data: incoming.data.or_else(|| current.data.clone()),
                links: incoming.links.or_else(|| current.links.clone()),
                meta: incoming.meta.or_else(|| current.meta.clone()),
            };
            if next != current {
                let revision = self.tick();
                let entry = self.entry_mut(key)?;
                entry.relationships.insert(field.clone(), next);
                entry.revisions.insert(field.clone(), revision);
                changed.insert(field);
            }
        }

        if !changed.is_empty() {
            tracing::trace!(changed = ?changed, "Upserted resource data");
        }
        Ok(changed)
    }

    pub fn peek(&self, key: &ResourceKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn get_attr(&self, key: &ResourceKey, field: &str) -> Option<&Value> {
        self.entries.get(key).and_then(|entry| entry.attr(field))
    }

    pub fn relationship(&self, key: &ResourceKey, field: &str) -> Option<&RelationshipState> {
        self.entries.get(key).and_then(|entry| entry.relationship(field))
    }

    /// Stored linkage of a relationship, if provided.
    pub fn relationship_data(&self, key: &ResourceKey, field: &str) -> Option<&RelationshipData> {
        self.relationship(key, field)
            .and_then(|state| state.data.as_ref())
    }

    pub fn revision(&self, key: &ResourceKey, field: &str) -> u64 {
        self.entries.get(key).map_or(0, |entry| entry.revision(field))
    }

    pub fn is_deleted(&self, key: &ResourceKey) -> bool {
        self.entries.get(key).is_some_and(CacheEntry::is_deleted)
    }

    pub fn mark_deleted(&mut self, key: &ResourceKey, deleted: bool) -> Result<()> {
        self.entry_mut(key)?.deleted = deleted;
        Ok(())
    }

    /// Write one attribute. Returns whether the stored value changed.
    pub fn set_attr(&mut self, key: &ResourceKey, field: &str, value: Value) -> Result<bool> {
        let entry = self.entry_mut(key)?;
        if entry.attributes.get(field) == Some(&value) {
            return Ok(false);
        }
        entry.attributes.insert(field.to_string(), value);
        let revision = self.tick();
        self.entry_mut(key)?
            .revisions
            .insert(field.to_string(), revision);
        Ok(true)
    }

    /// Write relationship linkage, keeping links and meta.
    pub fn set_relationship(
        &mut self,
        key: &ResourceKey,
        field: &str,
        data: Option<RelationshipData>,
    ) -> Result<bool> {
        let entry = self.entry_mut(key)?;
        let state = entry.relationships.entry(field.to_string()).or_default();
        if state.data == data {
            return Ok(false);
        }
        state.data = data;
        let revision = self.tick();
        self.entry_mut(key)?
            .revisions
            .insert(field.to_string(), revision);
        Ok(true)
    }

    /// Fold the abandoned entry of a merge into the kept entry.
    ///
    /// Fields the kept entry lacks are filled from the abandoned one, and
    /// every relationship reference to the abandoned key is rewritten. Returns
    /// the keys whose stored data changed.
    #[tracing::instrument(level = "debug", skip_all, fields(kept = %kept, abandoned = %abandoned))]
    pub fn merge(
        &mut self,
        kept: &ResourceKey,
        abandoned: &ResourceKey,
    ) -> Result<BTreeSet<ResourceKey>> {
        let mut touched = BTreeSet::new();
        let Some(old) = self.entries.remove(abandoned) else {
            return Ok(touched);
        };
        self.insert_empty(kept);

        let mut fill = ResourceData::default();
        if let Some(entry) = self.entries.get(kept) {
            for (field, value) in old.attributes {
                if !entry.attributes.contains_key(&field) {
                    fill.attributes.insert(field, value);
                }
            }
            for (field, state) in old.relationships {
                let missing = entry
                    .relationships
                    .get(&field)
                    .is_none_or(|current| current.data.is_none());
                if missing {
                    fill.relationships.insert(field, state);
                }
            }
        }
        if !self.upsert(kept, fill)?.is_empty() {
            touched.insert(kept.clone());
        }

        let clock = &mut self.clock;
        for entry in self.entries.values_mut() {
            let mut rewritten = Vec::new();
            for (field, state) in &mut entry.relationships {
                if let Some(data) = state.data.as_mut() {
                    if data.replace_key(abandoned, kept) {
                        rewritten.push(field.clone());
                    }
                }
            }
            for field in rewritten {
                *clock += 1;
                entry.revisions.insert(field, *clock);
                touched.insert(entry.key.clone());
            }
        }
        Ok(touched)
    }

    /// Remove an entry entirely.
    pub fn remove(&mut self, key: &ResourceKey) -> Option<CacheEntry> {
        self.entries.remove(key)
    }

    /// Keys of one type in insertion order.
    pub fn keys_of_type(&self, type_name: &str) -> Vec<ResourceKey> {
        let mut entries: Vec<&CacheEntry> = self
            .entries
            .values()
            .filter(|entry| entry.key.type_name() == type_name)
            .collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| entry.key.clone()).collect()
    }
}

fn unknown_resource(key: &ResourceKey) -> Error {
    Error::UnknownResource(ResourceError {
        type_name: key.type_name().to_string(),
        id: key.id().map(str::to_string),
        lid: Some(key.lid().to_string()),
    })
}
