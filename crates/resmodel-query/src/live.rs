//! Live arrays: collections whose membership follows the cache.
//!
//! A [`LiveArray`] never rescans the cache. The store reports each changed
//! key once per mutation and the array updates membership for that key only.
//! The [`LiveIndex`] holds the "all records of a type" arrays strongly and
//! every other array weakly, so dropping a filtered collection unsubscribes it.

use regex::Regex;
use resmodel_core::{FieldReader, ResourceKey, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, Weak};

type PredicateFn = dyn Fn(&dyn FieldReader) -> bool + Send + Sync;

/// Membership test for filtered live arrays.
#[derive(Clone)]
pub struct FilterPredicate {
    test: Arc<PredicateFn>,
    description: String,
}

impl fmt::Debug for FilterPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FilterPredicate")
            .field(&self.description)
            .finish()
    }
}

impl FilterPredicate {
    /// Predicate from a closure.
    pub fn new<F>(test: F) -> Self
    where
        F: Fn(&dyn FieldReader) -> bool + Send + Sync + 'static,
    {
        Self {
            test: Arc::new(test),
            description: "custom".to_string(),
        }
    }

    /// String field matches `pattern`. Non-string values never match.
    pub fn field_matches(field: impl Into<String>, pattern: Regex) -> Self {
        let field = field.into();
        let description = format!("{field} =~ /{}/", pattern.as_str());
        Self {
            test: Arc::new(move |record: &dyn FieldReader| {
                record
                    .read_str(&field)
                    .ok()
                    .flatten()
                    .is_some_and(|value| pattern.is_match(&value))
            }),
            description,
        }
    }

    /// Field equals `expected`.
    pub fn field_equals(field: impl Into<String>, expected: Value) -> Self {
        let field = field.into();
        let description = format!("{field} == {expected}");
        Self {
            test: Arc::new(move |record: &dyn FieldReader| {
                record.read_field(&field).is_ok_and(|value| value == expected)
            }),
            description,
        }
    }

    pub fn matches(&self, record: &dyn FieldReader) -> bool {
        (self.test)(record)
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// What drives a live array's membership.
#[derive(Debug, Clone)]
pub enum LiveArrayKind {
    /// Every non-deleted record of the type.
    All,
    /// Records of the type matching a predicate.
    Filter(FilterPredicate),
    /// Membership set by an adapter query; records only ever leave it.
    Query(Value),
}

#[derive(Debug, Default)]
struct LiveState {
    members: Vec<ResourceKey>,
    /// Same keys as `members`, for constant-time membership checks.
    index: HashSet<ResourceKey>,
    is_loaded: bool,
    is_updating: bool,
    revision: u64,
    meta: Option<Value>,
}

/// A collection of keys kept current by the store.
#[derive(Debug)]
pub struct LiveArray {
    id: u64,
    type_name: String,
    kind: LiveArrayKind,
    state: RwLock<LiveState>,
}

impl LiveArray {
    fn new(id: u64, type_name: &str, kind: LiveArrayKind) -> Self {
        let is_loaded = !matches!(kind, LiveArrayKind::Query(_));
        Self {
            id,
            type_name: type_name.to_string(),
            kind,
            state: RwLock::new(LiveState {
                is_loaded,
                ..LiveState::default()
            }),
        }
    }

    fn read<R>(&self, f: impl FnOnce(&LiveState) -> R) -> R {
        let guard = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn write<R>(&self, f: impl FnOnce(&mut LiveState) -> R) -> R {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn kind(&self) -> &LiveArrayKind {
        &self.kind
    }

    /// Whether membership depends on record field values.
    pub fn needs_reader(&self) -> bool {
        matches!(self.kind, LiveArrayKind::Filter(_))
    }

    pub fn members(&self) -> Vec<ResourceKey> {
        self.read(|s| s.members.clone())
    }

    pub fn len(&self) -> usize {
        self.read(|s| s.members.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.read(|s| s.index.contains(key))
    }

    pub fn is_loaded(&self) -> bool {
        self.read(|s| s.is_loaded)
    }

    pub fn is_updating(&self) -> bool {
        self.read(|s| s.is_updating)
    }

    /// Bumped on every membership change.
    pub fn revision(&self) -> u64 {
        self.read(|s| s.revision)
    }

    pub fn meta(&self) -> Option<Value> {
        self.read(|s| s.meta.clone())
    }

    /// Re-evaluate one key.
    ///
    /// `present` is false once the record is deleted or unloaded; `matches`
    /// is the predicate result for filtered arrays. Returns whether
    /// membership changed.
    pub fn apply(&self, key: &ResourceKey, present: bool, matches: Option<bool>) -> bool {
        if key.type_name() != self.type_name {
            return false;
        }
        let wanted = match &self.kind {
            LiveArrayKind::All => Some(present),
            LiveArrayKind::Filter(_) => Some(present && matches.unwrap_or(false)),
            LiveArrayKind::Query(_) => (!present).then_some(false),
        };
        let Some(wanted) = wanted else {
            return false;
        };
        self.write(|s| {
            let changed = match (wanted, s.index.contains(key)) {
                (true, false) => {
                    s.index.insert(key.clone());
                    s.members.push(key.clone());
                    true
                }
                (false, true) => {
                    s.index.remove(key);
                    if let Some(idx) = s.members.iter().position(|k| k == key) {
                        s.members.remove(idx);
                    }
                    true
                }
                _ => false,
            };
            if changed {
                s.revision += 1;
            }
            changed
        })
    }

    /// Evaluate the array's predicate against a record.
    pub fn evaluate(&self, record: &dyn FieldReader) -> Option<bool> {
        match &self.kind {
            LiveArrayKind::Filter(predicate) => Some(predicate.matches(record)),
            _ => None,
        }
    }

    /// Replace membership wholesale, as a query result does.
    pub fn replace_members(&self, keys: Vec<ResourceKey>) {
        self.write(|s| {
            if s.members != keys {
                s.index = keys.iter().cloned().collect();
                s.members = keys;
                s.revision += 1;
            }
        });
    }

    /// Point members at the surviving key of a merge.
    pub fn replace_key(&self, from: &ResourceKey, to: &ResourceKey) {
        self.write(|s| {
            if !s.index.remove(from) {
                return;
            }
            if s.index.insert(to.clone()) {
                for key in &mut s.members {
                    if key == from {
                        *key = to.clone();
                    }
                }
            } else {
                s.members.retain(|k| k != from);
            }
            s.revision += 1;
        });
    }

    pub fn set_updating(&self, updating: bool) {
        self.write(|s| s.is_updating = updating);
    }

    pub fn set_meta(&self, meta: Option<Value>) {
        self.write(|s| s.meta = meta);
    }

    /// Flip `is_loaded` to true. Returns true only the first time.
    pub fn mark_loaded(&self) -> bool {
        self.write(|s| !std::mem::replace(&mut s.is_loaded, true))
    }
}

/// Registry of live arrays by resource type.
#[derive(Debug, Default)]
pub struct LiveIndex {
    next_id: u64,
    all: HashMap<String, Arc<LiveArray>>,
    tracked: HashMap<String, Vec<Weak<LiveArray>>>,
}

impl LiveIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self, type_name: &str, kind: LiveArrayKind) -> Arc<LiveArray> {
        self.next_id += 1;
        Arc::new(LiveArray::new(self.next_id, type_name, kind))
    }

    /// The shared "all records" array for a type, created with `seed` members.
    pub fn all(
        &mut self,
        type_name: &str,
        seed: impl FnOnce() -> Vec<ResourceKey>,
    ) -> Arc<LiveArray> {
        if let Some(existing) = self.all.get(type_name) {
            return Arc::clone(existing);
        }
        let array = self.allocate(type_name, LiveArrayKind::All);
        array.replace_members(seed());
        self.all.insert(type_name.to_string(), Arc::clone(&array));
        array
    }

    /// Track a new filtered array. The caller seeds its membership.
    pub fn filter(&mut self, type_name: &str, predicate: FilterPredicate) -> Arc<LiveArray> {
        let array = self.allocate(type_name, LiveArrayKind::Filter(predicate));
        self.track(&array);
        array
    }

    /// Track a new query-backed array; it starts empty and not loaded.
    pub fn query(&mut self, type_name: &str, query: Value) -> Arc<LiveArray> {
        let array = self.allocate(type_name, LiveArrayKind::Query(query));
        self.track(&array);
        array
    }

    fn track(&mut self, array: &Arc<LiveArray>) {
        self.tracked
            .entry(array.type_name().to_string())
            .or_default()
            .push(Arc::downgrade(array));
    }

    /// Live arrays of a type, dropping arrays nobody holds anymore.
    pub fn arrays_for(&mut self, type_name: &str) -> Vec<Arc<LiveArray>> {
        let mut arrays: Vec<Arc<LiveArray>> = self.all.get(type_name).cloned().into_iter().collect();
        if let Some(tracked) = self.tracked.get_mut(type_name) {
            tracked.retain(|weak| weak.strong_count() > 0);
            arrays.extend(tracked.iter().filter_map(Weak::upgrade));
        }
        arrays
    }

    /// Number of live arrays still referenced.
    pub fn len(&self) -> usize {
        self.all.len()
            + self
                .tracked
                .values()
                .flatten()
                .filter(|weak| weak.strong_count() > 0)
                .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
