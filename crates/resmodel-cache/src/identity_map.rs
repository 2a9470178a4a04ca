//! Identifier registry: one canonical [`ResourceKey`] per logical resource.
//!
//! The registry guarantees that looking up the same `(type, id)` or the same
//! `lid` always yields the same key. It provides:
//!
//! - **Uniqueness**: no two live keys share a non-null `(type, id)`
//! - **Stability**: a key's `lid` never changes, even after id assignment
//! - **Merging**: assigning an id that another key already holds folds the two
//!   keys into one; the abandoned `lid` keeps resolving through a redirect
//!
//! # Example
//!
//! ```ignore
//! let mut registry = IdentifierRegistry::new("@lid");
//! let tom = registry.create("person", None, None)?;
//! let fetched = registry.get_or_create("person", Some("1"), None)?;
//!
//! // Server confirms tom's id while a fetch already produced a key for it
//! let outcome = registry.merge_on_id_assignment(&tom, "1")?;
//! assert!(matches!(outcome, IdAssignment::Merged { .. }));
//! assert!(registry.peek("person", "1").unwrap().ptr_eq(&tom));
//! assert!(registry.peek_lid(fetched.lid()).unwrap().ptr_eq(&tom));
//! ```

use resmodel_core::{Error, IdentityError, ResourceKey, Result};
use std::collections::HashMap;

/// Result of assigning a server id to a key.
#[derive(Debug, Clone)]
pub enum IdAssignment {
    /// The key already carried this id.
    Unchanged,
    /// The id was new to the registry and is now bound to the key.
    Assigned,
    /// Another key held the id; it was abandoned in favour of the assigned key.
    Merged { abandoned: ResourceKey },
}

/// Canonicalizes `(type, id)` and `lid` lookups to a single [`ResourceKey`].
#[derive(Debug)]
pub struct IdentifierRegistry {
    prefix: String,
    next_lid: u64,
    by_lid: HashMap<String, ResourceKey>,
    by_id: HashMap<(String, String), ResourceKey>,
    /// Lids of abandoned keys, pointing at the key they were merged into.
    redirects: HashMap<String, ResourceKey>,
}

impl Default for IdentifierRegistry {
    fn default() -> Self {
        Self::new("@lid")
    }
}

impl IdentifierRegistry {
    /// Create an empty registry generating lids as `<prefix>:<type>-<n>`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next_lid: 0,
            by_lid: HashMap::new(),
            by_id: HashMap::new(),
            redirects: HashMap::new(),
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.by_lid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_lid.is_empty()
    }

    /// Whether `key` is live (not forgotten and not abandoned by a merge).
    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.by_lid
            .get(key.lid())
            .is_some_and(|live| live.ptr_eq(key))
    }

    /// Look up a key by `(type, id)`.
    pub fn peek(&self, type_name: &str, id: &str) -> Option<ResourceKey> {
        self.by_id
            .get(&(type_name.to_string(), id.to_string()))
            .cloned()
    }

    /// Look up a key by lid, following merge redirects.
    pub fn peek_lid(&self, lid: &str) -> Option<ResourceKey> {
        self.by_lid
            .get(lid)
            .or_else(|| self.redirects.get(lid))
            .cloned()
    }

    /// Resolve an identifier to its key, creating the key on first reference.
    ///
    /// A known `lid` wins over `id`. This never assigns an id to an existing
    /// key; callers that learn an id for a lid-only key use
    /// [`merge_on_id_assignment`](Self::merge_on_id_assignment).
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn get_or_create(
        &mut self,
        type_name: &str,
        id: Option<&str>,
        lid: Option<&str>,
    ) -> Result<ResourceKey> {
        if let Some(key) = lid.and_then(|lid| self.peek_lid(lid)) {
            if let (Some(id), Some(existing)) = (id, key.id()) {
                if id != existing {
                    return Err(conflict(type_name, id, &key, "lid is bound to another id"));
                }
            }
            return Ok(key);
        }

        if let Some(key) = id.and_then(|id| self.peek(type_name, id)) {
            // A document may introduce its own lid for a resource we already know.
            if let Some(lid) = lid {
                self.redirects.insert(lid.to_string(), key.clone());
            }
            return Ok(key);
        }

        Ok(self.insert(type_name, id, lid))
    }

    /// Create a key, failing if the identity is already registered.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn create(
        &mut self,
        type_name: &str,
        id: Option<&str>,
        lid: Option<&str>,
    ) -> Result<ResourceKey> {
        if let Some(id) = id {
            if let Some(existing) = self.peek(type_name, id) {
                return Err(conflict(
                    type_name,
                    id,
                    &existing,
                    "a record with this id is already registered",
                ));
            }
        }
        if let Some(lid) = lid {
            if let Some(existing) = self.peek_lid(lid) {
                return Err(conflict(type_name, lid, &existing, "lid is already registered"));
            }
        }
        Ok(self.insert(type_name, id, lid))
    }

    fn insert(&mut self, type_name: &str, id: Option<&str>, lid: Option<&str>) -> ResourceKey {
        let lid = match lid {
            Some(lid) => lid.to_string(),
            None => {
                self.next_lid += 1;
                format!("{}:{}-{}", self.prefix, type_name, self.next_lid)
            }
        };
        let key = ResourceKey::new(type_name, lid.clone(), id.map(str::to_string));
        if let Some(id) = id {
            self.by_id
                .insert((type_name.to_string(), id.to_string()), key.clone());
        }
        self.by_lid.insert(lid, key.clone());
        tracing::trace!(key = %key, lid = key.lid(), "Registered resource key");
        key
    }

    /// Bind a server id to `key`.
    ///
    /// If a different key already holds `(type, id)`, that key is abandoned:
    /// it is removed from the registry and its lid redirects to `key`. The
    /// caller is responsible for merging cache data of the abandoned key.
    #[tracing::instrument(level = "debug", skip(self, key), fields(key = %key))]
    pub fn merge_on_id_assignment(&mut self, key: &ResourceKey, id: &str) -> Result<IdAssignment> {
        match key.id() {
            Some(existing) if existing == id => return Ok(IdAssignment::Unchanged),
            Some(_) => {
                return Err(conflict(
                    key.type_name(),
                    id,
                    key,
                    "key already carries a different id",
                ));
            }
            None => {}
        }

        let id_key = (key.type_name().to_string(), id.to_string());
        let abandoned = self.by_id.remove(&id_key).filter(|other| !other.ptr_eq(key));

        key.assign_id(id);
        self.by_id.insert(id_key, key.clone());

        let Some(abandoned) = abandoned else {
            tracing::debug!(lid = key.lid(), id, "Assigned id");
            return Ok(IdAssignment::Assigned);
        };

        self.by_lid.remove(abandoned.lid());
        for target in self.redirects.values_mut() {
            if target.ptr_eq(&abandoned) {
                *target = key.clone();
            }
        }
        self.redirects
            .insert(abandoned.lid().to_string(), key.clone());

        tracing::debug!(
            kept = key.lid(),
            abandoned = abandoned.lid(),
            id,
            "Merged duplicate keys on id assignment"
        );
        Ok(IdAssignment::Merged { abandoned })
    }

    /// Drop a key and every redirect pointing at it.
    pub fn forget(&mut self, key: &ResourceKey) -> bool {
        let removed = self
            .by_lid
            .remove(key.lid())
            .is_some_and(|live| live.ptr_eq(key));
        if let Some(id) = key.id() {
            let id_key = (key.type_name().to_string(), id.to_string());
            if self.by_id.get(&id_key).is_some_and(|k| k.ptr_eq(key)) {
                self.by_id.remove(&id_key);
            }
        }
        self.redirects.retain(|_, target| !target.ptr_eq(key));
        removed
    }
}

fn conflict(type_name: &str, id: &str, existing: &ResourceKey, message: &str) -> Error {
    Error::DuplicateIdentity(IdentityError {
        type_name: type_name.to_string(),
        id: id.to_string(),
        existing_lid: existing.lid().to_string(),
        message: message.to_string(),
    })
}
