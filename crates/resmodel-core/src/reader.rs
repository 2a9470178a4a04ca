//! Read access to a materialized record, used by derivations and live-collection
//! predicates that must not depend on the concrete record type.

use crate::Result;
use crate::key::ResourceKey;
use serde_json::Value;

/// Anything that can resolve a field name to its current value.
pub trait FieldReader {
    /// Key of the record being read.
    fn key(&self) -> &ResourceKey;

    /// Current value of `field`, after transforms, aliases and derivations.
    fn read_field(&self, field: &str) -> Result<Value>;

    /// Convenience accessor for string-valued fields.
    fn read_str(&self, field: &str) -> Result<Option<String>> {
        Ok(self.read_field(field)?.as_str().map(str::to_string))
    }
}
