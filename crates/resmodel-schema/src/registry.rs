//! Per-store schema registry.
//!
//! Holds resource and object schemas plus the named transformations,
//! derivations and hash functions their fields refer to. Every store owns its
//! own registry, so independent stores can coexist with different schemas.

use crate::builtins::{BooleanTransform, ConcatDerivation, NumberTransform, StringTransform};
use crate::traits::{Derivation, HashFn, Transformation};
use resmodel_core::{
    Error, FieldKind, FieldSchema, RegistryError, RegistryKind, ResourceSchema, Result,
    SchemaError, SchemaErrorKind,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Registered schemas and extension points.
#[derive(Default)]
pub struct SchemaRegistry {
    resources: HashMap<String, Arc<ResourceSchema>>,
    transformations: HashMap<String, Arc<dyn Transformation>>,
    derivations: HashMap<String, Arc<dyn Derivation>>,
    hash_fns: HashMap<String, Arc<dyn HashFn>>,
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut resources: Vec<&String> = self.resources.keys().collect();
        resources.sort();
        f.debug_struct("SchemaRegistry")
            .field("resources", &resources)
            .field("transformations", &self.transformations.len())
            .field("derivations", &self.derivations.len())
            .field("hash_fns", &self.hash_fns.len())
            .finish()
    }
}

impl SchemaRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in transformations and derivations.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_transformation("string", StringTransform);
        registry.register_transformation("number", NumberTransform);
        registry.register_transformation("boolean", BooleanTransform);
        registry.register_derivation("concat", ConcatDerivation);
        registry
    }

    /// Register (or replace) a resource or object schema.
    ///
    /// Fails on duplicate field names and on fields whose declaration is
    /// incomplete. Transformation names are resolved lazily on first read.
    #[tracing::instrument(level = "debug", skip_all, fields(type_name = %schema.type_name))]
    pub fn register_resource(&mut self, schema: ResourceSchema) -> Result<()> {
        if let Some(name) = schema.duplicate_fields().first() {
            return Err(schema_error(
                &schema.type_name,
                SchemaErrorKind::DuplicateField,
                format!("field '{name}' is declared more than once"),
            ));
        }

        for field in schema.fields() {
            validate_field(&schema, field)?;
        }

        tracing::debug!(fields = schema.fields().len(), "Registered resource schema");
        self.resources
            .insert(schema.type_name.clone(), Arc::new(schema));
        Ok(())
    }

    pub fn register_transformation(
        &mut self,
        name: impl Into<String>,
        transformation: impl Transformation + 'static,
    ) {
        self.transformations
            .insert(name.into(), Arc::new(transformation));
    }

    pub fn register_derivation(&mut self, name: impl Into<String>, derivation: impl Derivation + 'static) {
        self.derivations.insert(name.into(), Arc::new(derivation));
    }

    pub fn register_hash_fn(&mut self, name: impl Into<String>, hash_fn: impl HashFn + 'static) {
        self.hash_fns.insert(name.into(), Arc::new(hash_fn));
    }

    pub fn has_resource(&self, type_name: &str) -> bool {
        self.resources.contains_key(type_name)
    }

    /// Registered type names, sorted.
    pub fn resource_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.resources.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn resource(&self, type_name: &str) -> Result<Arc<ResourceSchema>> {
        self.resources
            .get(type_name)
            .cloned()
            .ok_or_else(|| Error::unknown_type(type_name))
    }

    /// Field declaration, failing with `UnknownField` if undeclared.
    pub fn field(&self, type_name: &str, field: &str) -> Result<FieldSchema> {
        self.resource(type_name)?
            .get_field(field)
            .cloned()
            .ok_or_else(|| Error::unknown_field(type_name, field))
    }

    pub fn transformation(&self, name: &str, referenced_by: &str) -> Result<Arc<dyn Transformation>> {
        self.transformations
            .get(name)
            .cloned()
            .ok_or_else(|| unregistered(RegistryKind::Transformation, name, referenced_by))
    }

    pub fn derivation(&self, name: &str, referenced_by: &str) -> Result<Arc<dyn Derivation>> {
        self.derivations
            .get(name)
            .cloned()
            .ok_or_else(|| unregistered(RegistryKind::Derivation, name, referenced_by))
    }

    pub fn hash_fn(&self, name: &str, referenced_by: &str) -> Result<Arc<dyn HashFn>> {
        self.hash_fns
            .get(name)
            .cloned()
            .ok_or_else(|| unregistered(RegistryKind::HashFn, name, referenced_by))
    }
}

fn validate_field(schema: &ResourceSchema, field: &FieldSchema) -> Result<()> {
    let needs_type = matches!(
        field.kind,
        FieldKind::SchemaObject
            | FieldKind::SchemaArray
            | FieldKind::BelongsTo
            | FieldKind::HasMany
            | FieldKind::Resource
            | FieldKind::Derived
    );
    if needs_type && field.type_.is_none() {
        return Err(schema_error(
            &schema.type_name,
            SchemaErrorKind::InvalidField,
            format!("{} field '{}' requires a type", field.kind.as_str(), field.name),
        ));
    }

    if field.kind == FieldKind::Alias {
        let Some(target) = field.options.alias_of.as_deref() else {
            return Err(schema_error(
                &schema.type_name,
                SchemaErrorKind::InvalidField,
                format!("alias '{}' has no target", field.name),
            ));
        };
        match schema.get_field(target) {
            Some(t) if t.kind != FieldKind::Alias => {}
            Some(_) => {
                return Err(schema_error(
                    &schema.type_name,
                    SchemaErrorKind::InvalidField,
                    format!("alias '{}' cannot target another alias '{}'", field.name, target),
                ));
            }
            None => {
                return Err(schema_error(
                    &schema.type_name,
                    SchemaErrorKind::InvalidField,
                    format!("alias '{}' targets undeclared field '{}'", field.name, target),
                ));
            }
        }
    }
    Ok(())
}

fn schema_error(type_name: &str, kind: SchemaErrorKind, message: String) -> Error {
    Error::Schema(SchemaError {
        kind,
        type_name: type_name.to_string(),
        message,
    })
}

fn unregistered(kind: RegistryKind, name: &str, referenced_by: &str) -> Error {
    Error::UnregisteredTransform(RegistryError {
        kind,
        name: name.to_string(),
        referenced_by: (!referenced_by.is_empty()).then(|| referenced_by.to_string()),
    })
}
