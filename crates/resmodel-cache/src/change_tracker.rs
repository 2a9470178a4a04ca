//! Mutation overlay and dirty tracking for editable records.
//!
//! Editable projections never write to the cache directly. Their writes land
//! in a per-key overlay with two layers:
//!
//! - **local**: uncommitted writes
//! - **in-flight**: writes handed to the adapter by a pending commit
//!
//! Editable reads resolve `local`, then `in-flight`, then the canonical cache
//! entry. A write that restores the value underneath it removes the overlay
//! entry, so an overlay is empty exactly when the record is clean.

use crate::cache::RelationshipData;
use resmodel_core::{ResourceKey, Value};
use serde_json::Map;
use std::collections::{BTreeMap, HashMap};

/// Overlaid field values for one key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldOverlay {
    pub attributes: Map<String, Value>,
    pub relationships: BTreeMap<String, RelationshipData>,
}

impl FieldOverlay {
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty() && self.relationships.is_empty()
    }

    /// Field names present in the overlay.
    pub fn field_names(&self) -> Vec<String> {
        self.attributes
            .keys()
            .chain(self.relationships.keys())
            .cloned()
            .collect()
    }

    /// Layer `newer` on top of `self`; entries of `newer` win.
    fn absorb(&mut self, newer: FieldOverlay) {
        self.attributes.extend(newer.attributes);
        self.relationships.extend(newer.relationships);
    }
}

/// Tracks uncommitted and in-flight writes for every checked-out key.
#[derive(Debug, Default)]
pub struct MutationOverlay {
    local: HashMap<ResourceKey, FieldOverlay>,
    inflight: HashMap<ResourceKey, FieldOverlay>,
    /// Commit generation per key; a result is applied only for the current one.
    generations: HashMap<ResourceKey, u64>,
    revisions: HashMap<ResourceKey, HashMap<String, u64>>,
    clock: u64,
}

impl MutationOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&mut self, key: &ResourceKey, field: &str) {
        self.clock += 1;
        self.revisions
            .entry(key.clone())
            .or_default()
            .insert(field.to_string(), self.clock);
    }

    /// Overlay revision of a field; changes whenever the overlaid value does.
    pub fn revision(&self, key: &ResourceKey, field: &str) -> u64 {
        self.revisions
            .get(key)
            .and_then(|fields| fields.get(field))
            .copied()
            .unwrap_or(0)
    }

    /// Overlaid attribute value, if any layer holds one.
    pub fn attr(&self, key: &ResourceKey, field: &str) -> Option<&Value> {
        self.local
            .get(key)
            .and_then(|o| o.attributes.get(field))
            .or_else(|| self.inflight.get(key).and_then(|o| o.attributes.get(field)))
    }

    /// Overlaid relationship linkage, if any layer holds one.
    pub fn relationship(&self, key: &ResourceKey, field: &str) -> Option<&RelationshipData> {
        self.local
            .get(key)
            .and_then(|o| o.relationships.get(field))
            .or_else(|| {
                self.inflight
                    .get(key)
                    .and_then(|o| o.relationships.get(field))
            })
    }

    /// Write an attribute. `canonical` is the cache value underneath.
    ///
    /// Returns whether the overlay changed.
    pub fn set_attr(
        &mut self,
        key: &ResourceKey,
        field: &str,
        value: Value,
        canonical: Option<&Value>,
    ) -> bool {
        let base = self
            .inflight
            .get(key)
            .and_then(|o| o.attributes.get(field))
            .or(canonical);
        let restores_base = match base {
            Some(base) => *base == value,
            None => value.is_null(),
        };

        let changed = if restores_base {
            self.remove_local(key, |o| o.attributes.remove(field).is_some())
        } else {
            let layer = self.local.entry(key.clone()).or_default();
            layer.attributes.insert(field.to_string(), value.clone()) != Some(value)
        };
        if changed {
            self.bump(key, field);
        }
        changed
    }

    /// Write relationship linkage. `canonical` is the cache linkage underneath.
    pub fn set_relationship(
        &mut self,
        key: &ResourceKey,
        field: &str,
        data: RelationshipData,
        canonical: Option<&RelationshipData>,
    ) -> bool {
        let base = self
            .inflight
            .get(key)
            .and_then(|o| o.relationships.get(field))
            .or(canonical);
        let restores_base = match base {
            Some(base) => *base == data,
            None => data.keys().is_empty(),
        };

        let changed = if restores_base {
            self.remove_local(key, |o| o.relationships.remove(field).is_some())
        } else {
            let layer = self.local.entry(key.clone()).or_default();
            layer.relationships.insert(field.to_string(), data.clone()) != Some(data)
        };
        if changed {
            self.bump(key, field);
        }
        changed
    }

    fn remove_local(&mut self, key: &ResourceKey, remove: impl FnOnce(&mut FieldOverlay) -> bool) -> bool {
        let Some(layer) = self.local.get_mut(key) else {
            return false;
        };
        let removed = remove(layer);
        if layer.is_empty() {
            self.local.remove(key);
        }
        removed
    }

    /// Uncommitted writes for a key.
    pub fn local(&self, key: &ResourceKey) -> Option<&FieldOverlay> {
        self.local.get(key)
    }

    /// Writes currently handed to the adapter for a key.
    pub fn inflight(&self, key: &ResourceKey) -> Option<&FieldOverlay> {
        self.inflight.get(key)
    }

    /// Whether the key has uncommitted writes.
    pub fn has_local_changes(&self, key: &ResourceKey) -> bool {
        self.local.get(key).is_some_and(|o| !o.is_empty())
    }

    /// Whether the key has uncommitted or in-flight writes.
    pub fn is_dirty(&self, key: &ResourceKey) -> bool {
        self.has_local_changes(key) || self.inflight.contains_key(key)
    }

    /// Keys with uncommitted writes.
    pub fn dirty_keys(&self) -> Vec<ResourceKey> {
        self.local.keys().cloned().collect()
    }

    /// Current commit generation for a key.
    pub fn generation(&self, key: &ResourceKey) -> u64 {
        self.generations.get(key).copied().unwrap_or(0)
    }

    pub fn is_current(&self, key: &ResourceKey, generation: u64) -> bool {
        self.generation(key) == generation
    }

    fn next_generation(&mut self, key: &ResourceKey) -> u64 {
        let generation = self.generations.entry(key.clone()).or_insert(0);
        *generation += 1;
        *generation
    }

    /// Move local writes into the in-flight layer.
    ///
    /// Returns the new commit generation and the full in-flight overlay.
    #[tracing::instrument(level = "trace", skip_all, fields(key = %key))]
    pub fn begin_commit(&mut self, key: &ResourceKey) -> (u64, FieldOverlay) {
        let local = self.local.remove(key).unwrap_or_default();
        let inflight = self.inflight.entry(key.clone()).or_default();
        inflight.absorb(local);
        let snapshot = inflight.clone();
        let generation = self.next_generation(key);
        tracing::trace!(generation, fields = ?snapshot.field_names(), "Commit started");
        (generation, snapshot)
    }

    /// Take the in-flight layer after a successful commit.
    ///
    /// Returns `None` when the commit was superseded by rollback or unload.
    pub fn complete_commit(&mut self, key: &ResourceKey, generation: u64) -> Option<FieldOverlay> {
        if !self.is_current(key, generation) {
            return None;
        }
        let applied = self.inflight.remove(key).unwrap_or_default();
        for field in applied.field_names() {
            self.bump(key, &field);
        }
        Some(applied)
    }

    /// Return in-flight writes to the local layer after a failed commit.
    ///
    /// Writes made while the commit was in flight take precedence.
    pub fn restore_inflight(&mut self, key: &ResourceKey, generation: u64) -> bool {
        if !self.is_current(key, generation) {
            return false;
        }
        let Some(mut restored) = self.inflight.remove(key) else {
            return false;
        };
        if let Some(newer) = self.local.remove(key) {
            restored.absorb(newer);
        }
        if !restored.is_empty() {
            self.local.insert(key.clone(), restored);
        }
        true
    }

    /// Discard every overlaid write and invalidate a pending commit.
    ///
    /// Returns the discarded writes, local entries winning over in-flight ones.
    #[tracing::instrument(level = "trace", skip_all, fields(key = %key))]
    pub fn rollback(&mut self, key: &ResourceKey) -> FieldOverlay {
        let mut discarded = self.inflight.remove(key).unwrap_or_default();
        if let Some(local) = self.local.remove(key) {
            discarded.absorb(local);
        }
        self.next_generation(key);
        for field in discarded.field_names() {
            self.bump(key, &field);
        }
        discarded
    }

    /// Drop a local attribute entry that now equals the canonical value.
    pub fn prune_attr(&mut self, key: &ResourceKey, field: &str, canonical: Option<&Value>) -> bool {
        let equal = self
            .local
            .get(key)
            .and_then(|o| o.attributes.get(field))
            .is_some_and(|value| Some(value) == canonical);
        if equal && self.remove_local(key, |o| o.attributes.remove(field).is_some()) {
            self.bump(key, field);
            return true;
        }
        false
    }

    /// Drop a local relationship entry that now equals the canonical linkage.
    pub fn prune_relationship(
        &mut self,
        key: &ResourceKey,
        field: &str,
        canonical: Option<&RelationshipData>,
    ) -> bool {
        let equal = self
            .local
            .get(key)
            .and_then(|o| o.relationships.get(field))
            .is_some_and(|data| Some(data) == canonical);
        if equal && self.remove_local(key, |o| o.relationships.remove(field).is_some()) {
            self.bump(key, field);
            return true;
        }
        false
    }

    /// Forget everything about a key.
    pub fn forget(&mut self, key: &ResourceKey) {
        self.local.remove(key);
        self.inflight.remove(key);
        self.generations.remove(key);
        self.revisions.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> ResourceKey {
        ResourceKey::new("person", "@lid:person-1", Some("1".into()))
    }

    #[test]
    fn resetting_to_canonical_clears_dirty_state() {
        let mut overlay = MutationOverlay::new();
        let person = key();
        let saved = json!("Tom");

        assert!(overlay.set_attr(&person, "name", json!("Tomster"), Some(&saved)));
        assert!(overlay.is_dirty(&person));
        assert_eq!(overlay.attr(&person, "name"), Some(&json!("Tomster")));

        assert!(overlay.set_attr(&person, "name", json!("Tom"), Some(&saved)));
        assert!(!overlay.is_dirty(&person));
        assert!(overlay.local(&person).is_none());
    }

    #[test]
    fn setting_null_over_missing_value_is_clean() {
        let mut overlay = MutationOverlay::new();
        assert!(!overlay.set_attr(&key(), "nickname", Value::Null, None));
        assert!(!overlay.is_dirty(&key()));
    }

    #[test]
    fn revision_moves_only_on_change() {
        let mut overlay = MutationOverlay::new();
        let person = key();
        overlay.set_attr(&person, "name", json!("A"), None);
        let rev = overlay.revision(&person, "name");
        assert!(!overlay.set_attr(&person, "name", json!("A"), None));
        assert_eq!(overlay.revision(&person, "name"), rev);
        assert_eq!(overlay.revision(&person, "age"), 0);
    }

    #[test]
    fn commit_moves_local_to_inflight_and_completes() {
        let mut overlay = MutationOverlay::new();
        let person = key();
        overlay.set_attr(&person, "name", json!("Tomster"), Some(&json!("Tom")));

        let (generation, sent) = overlay.begin_commit(&person);
        assert_eq!(sent.attributes["name"], json!("Tomster"));
        assert!(!overlay.has_local_changes(&person));
        assert!(overlay.is_dirty(&person));
        assert_eq!(overlay.attr(&person, "name"), Some(&json!("Tomster")));

        let applied = overlay.complete_commit(&person, generation).unwrap();
        assert_eq!(applied.attributes["name"], json!("Tomster"));
        assert!(!overlay.is_dirty(&person));
    }

    #[test]
    fn failed_commit_restores_and_newer_writes_win() {
        let mut overlay = MutationOverlay::new();
        let person = key();
        overlay.set_attr(&person, "name", json!("First"), None);
        overlay.set_attr(&person, "age", json!(3), None);
        let (generation, _) = overlay.begin_commit(&person);

        overlay.set_attr(&person, "name", json!("Second"), None);
        assert!(overlay.restore_inflight(&person, generation));
        let local = overlay.local(&person).unwrap();
        assert_eq!(local.attributes["name"], json!("Second"));
        assert_eq!(local.attributes["age"], json!(3));
    }

    #[test]
    fn rollback_invalidates_pending_commit() {
        let mut overlay = MutationOverlay::new();
        let person = key();
        overlay.set_attr(&person, "name", json!("Late"), None);
        let (generation, _) = overlay.begin_commit(&person);

        let discarded = overlay.rollback(&person);
        assert_eq!(discarded.attributes["name"], json!("Late"));
        assert!(!overlay.is_current(&person, generation));
        assert!(overlay.complete_commit(&person, generation).is_none());
        assert!(!overlay.restore_inflight(&person, generation));
        assert!(!overlay.is_dirty(&person));
    }

    #[test]
    fn relationship_overlay_prunes_against_canonical() {
        let mut overlay = MutationOverlay::new();
        let person = key();
        let kidney = ResourceKey::new("kidney", "@lid:kidney-1", None);
        let canonical = RelationshipData::Many(vec![]);

        let next = RelationshipData::Many(vec![kidney.clone()]);
        assert!(overlay.set_relationship(&person, "kidneys", next.clone(), Some(&canonical)));
        assert_eq!(overlay.relationship(&person, "kidneys"), Some(&next));

        assert!(!overlay.prune_relationship(&person, "kidneys", Some(&canonical)));
        assert!(overlay.prune_relationship(&person, "kidneys", Some(&next)));
        assert!(!overlay.is_dirty(&person));
    }
}
