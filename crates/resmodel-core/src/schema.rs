//! Field and resource schema declarations.
//!
//! Schemas are plain data. The registry in `resmodel-schema` validates them and
//! builds lookup tables once per registration; the materializer dispatches on
//! [`FieldKind`] for every read.

use serde_json::{Map, Value};
use std::collections::HashMap;

/// The kind of a declared field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// Scalar attribute, optionally passed through a transformation.
    Field,
    /// Plain array attribute with index-stable slots.
    Array,
    /// Plain object attribute.
    Object,
    /// Object attribute projected through an object schema.
    SchemaObject,
    /// Array of objects projected through an object schema.
    SchemaArray,
    /// To-one relationship.
    BelongsTo,
    /// To-many relationship.
    HasMany,
    /// Forwards to another field; never stored under its own name.
    Alias,
    /// Read-only value computed from other fields of the record.
    Derived,
    /// To-one reference without inverse bookkeeping.
    Resource,
}

impl FieldKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Field => "field",
            FieldKind::Array => "array",
            FieldKind::Object => "object",
            FieldKind::SchemaObject => "schema-object",
            FieldKind::SchemaArray => "schema-array",
            FieldKind::BelongsTo => "belongsTo",
            FieldKind::HasMany => "hasMany",
            FieldKind::Alias => "alias",
            FieldKind::Derived => "derived",
            FieldKind::Resource => "resource",
        }
    }

    /// Relationship kinds live in the cache's relationship map.
    pub const fn is_relationship(&self) -> bool {
        matches!(
            self,
            FieldKind::BelongsTo | FieldKind::HasMany | FieldKind::Resource
        )
    }

    /// Kinds backed by an attribute in the cache.
    pub const fn is_attribute(&self) -> bool {
        matches!(
            self,
            FieldKind::Field
                | FieldKind::Array
                | FieldKind::Object
                | FieldKind::SchemaObject
                | FieldKind::SchemaArray
        )
    }
}

/// Options attached to a field declaration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldOptions {
    /// Inverse relationship field on the related type.
    pub inverse: Option<String>,
    /// Related data is loaded on demand rather than required up front.
    pub is_async: bool,
    /// Relationship requires `links.related` and included data.
    pub links_mode: bool,
    /// Element type is resolved per value.
    pub polymorphic: bool,
    /// Element identity strategy for schema arrays: `@index`, `@identity`, or a field name.
    pub key: Option<String>,
    /// Member holding the resolved type of a polymorphic value (default `type`).
    pub type_key: Option<String>,
    /// Target field of an alias.
    pub alias_of: Option<String>,
    /// Transformation/derivation/hash options.
    pub extra: Map<String, Value>,
}

impl FieldOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn inverse(mut self, inverse: impl Into<String>) -> Self {
        self.inverse = Some(inverse.into());
        self
    }

    #[must_use]
    pub fn is_async(mut self, value: bool) -> Self {
        self.is_async = value;
        self
    }

    #[must_use]
    pub fn links_mode(mut self, value: bool) -> Self {
        self.links_mode = value;
        self
    }

    #[must_use]
    pub fn polymorphic(mut self, value: bool) -> Self {
        self.polymorphic = value;
        self
    }

    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn type_key(mut self, key: impl Into<String>) -> Self {
        self.type_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn extra(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extra.insert(name.into(), value);
        self
    }
}

/// A single field declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSchema {
    pub name: String,
    pub kind: FieldKind,
    /// Transformation, derivation, object schema, or related resource type.
    pub type_: Option<String>,
    /// Raw attribute key when it differs from `name`.
    pub source_key: Option<String>,
    pub options: FieldOptions,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            type_: None,
            source_key: None,
            options: FieldOptions::default(),
        }
    }

    /// Untransformed scalar attribute.
    pub fn field(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Field)
    }

    pub fn array(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Array)
    }

    pub fn object(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Object)
    }

    pub fn schema_object(name: impl Into<String>, object_type: impl Into<String>) -> Self {
        Self::new(name, FieldKind::SchemaObject).with_type(object_type)
    }

    pub fn schema_array(name: impl Into<String>, object_type: impl Into<String>) -> Self {
        Self::new(name, FieldKind::SchemaArray).with_type(object_type)
    }

    pub fn belongs_to(name: impl Into<String>, related: impl Into<String>) -> Self {
        Self::new(name, FieldKind::BelongsTo).with_type(related)
    }

    pub fn has_many(name: impl Into<String>, related: impl Into<String>) -> Self {
        Self::new(name, FieldKind::HasMany).with_type(related)
    }

    pub fn resource(name: impl Into<String>, related: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Resource).with_type(related)
    }

    pub fn derived(name: impl Into<String>, derivation: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Derived).with_type(derivation)
    }

    pub fn alias(name: impl Into<String>, target: impl Into<String>) -> Self {
        let mut field = Self::new(name, FieldKind::Alias);
        field.options.alias_of = Some(target.into());
        field
    }

    #[must_use]
    pub fn with_type(mut self, type_: impl Into<String>) -> Self {
        self.type_ = Some(type_.into());
        self
    }

    #[must_use]
    pub fn source_key(mut self, key: impl Into<String>) -> Self {
        self.source_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn options(mut self, options: FieldOptions) -> Self {
        self.options = options;
        self
    }

    /// Key under which the raw value is stored in the cache.
    pub fn storage_key(&self) -> &str {
        self.source_key.as_deref().unwrap_or(&self.name)
    }

    pub fn inverse(&self) -> Option<&str> {
        self.options.inverse.as_deref()
    }
}

/// How instances of a schema are identified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// Resources: identified by the named id field.
    Id(String),
    /// Embedded objects: identified by a registered hash function.
    Hash(String),
    /// No identity; embedded objects are stable by position only.
    None,
}

/// A resource or object schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSchema {
    pub type_name: String,
    pub identity: Identity,
    fields: Vec<FieldSchema>,
    index: HashMap<String, usize>,
}

impl ResourceSchema {
    /// Resource schema identified by `id`.
    pub fn resource(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            identity: Identity::Id("id".to_string()),
            fields: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Embedded object schema.
    pub fn object(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            identity: Identity::None,
            fields: Vec::new(),
            index: HashMap::new(),
        }
    }

    #[must_use]
    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    /// Append a field. Duplicate names are rejected at registration.
    #[must_use]
    pub fn field(mut self, field: FieldSchema) -> Self {
        self.index.entry(field.name.clone()).or_insert(self.fields.len());
        self.fields.push(field);
        self
    }

    pub fn fields(&self) -> &[FieldSchema] {
        &self.fields
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldSchema> {
        self.index.get(name).map(|idx| &self.fields[*idx])
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Names declared more than once, in declaration order.
    pub fn duplicate_fields(&self) -> Vec<&str> {
        let mut seen = std::collections::HashSet::new();
        self.fields
            .iter()
            .filter(|f| !seen.insert(f.name.as_str()))
            .map(|f| f.name.as_str())
            .collect()
    }

    /// Relationship fields in declaration order.
    pub fn relationships(&self) -> impl Iterator<Item = &FieldSchema> {
        self.fields.iter().filter(|f| f.kind.is_relationship())
    }

    /// Attribute-backed fields in declaration order.
    pub fn attributes(&self) -> impl Iterator<Item = &FieldSchema> {
        self.fields.iter().filter(|f| f.kind.is_attribute())
    }
}
