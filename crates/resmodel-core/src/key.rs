//! Canonical resource identifiers.
//!
//! A [`ResourceKey`] is the single long-lived handle for one logical resource.
//! The `lid` is assigned on first reference and never changes; it is the true
//! primary key. The server `id` may be unknown for client-created resources and
//! is set at most once, so every clone of the key observes the assignment.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

#[derive(Debug)]
struct KeyInner {
    type_name: String,
    lid: String,
    id: OnceLock<String>,
}

/// Shared handle identifying one resource. Equality and hashing use the lid.
#[derive(Clone)]
pub struct ResourceKey {
    inner: Arc<KeyInner>,
}

impl ResourceKey {
    /// Create a key. Only the identifier registry should call this.
    pub fn new(type_name: impl Into<String>, lid: impl Into<String>, id: Option<String>) -> Self {
        let cell = OnceLock::new();
        if let Some(id) = id {
            let _ = cell.set(id);
        }
        Self {
            inner: Arc::new(KeyInner {
                type_name: type_name.into(),
                lid: lid.into(),
                id: cell,
            }),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.inner.type_name
    }

    pub fn lid(&self) -> &str {
        &self.inner.lid
    }

    pub fn id(&self) -> Option<&str> {
        self.inner.id.get().map(String::as_str)
    }

    /// Record the server id. Returns false if an id was already present.
    pub fn assign_id(&self, id: impl Into<String>) -> bool {
        self.inner.id.set(id.into()).is_ok()
    }

    /// True if both handles share the same allocation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Identifier pair used in documents.
    pub fn identifier(&self) -> crate::document::ResourceIdentifier {
        crate::document::ResourceIdentifier {
            type_name: self.type_name().to_string(),
            id: self.id().map(str::to_string),
            lid: Some(self.lid().to_string()),
        }
    }
}

impl PartialEq for ResourceKey {
    fn eq(&self, other: &Self) -> bool {
        self.inner.lid == other.inner.lid
    }
}

impl Eq for ResourceKey {}

impl Hash for ResourceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.lid.hash(state);
    }
}

impl PartialOrd for ResourceKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResourceKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.inner.lid.cmp(&other.inner.lid)
    }
}

impl fmt::Debug for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceKey")
            .field("type", &self.inner.type_name)
            .field("id", &self.id())
            .field("lid", &self.inner.lid)
            .finish()
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id() {
            Some(id) => write!(f, "{}:{}", self.inner.type_name, id),
            None => write!(f, "{}({})", self.inner.type_name, self.inner.lid),
        }
    }
}
