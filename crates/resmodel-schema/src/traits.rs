//! Extension points resolved by name from a resource schema.

use resmodel_core::{FieldOptions, FieldReader, Result, Value};

/// Converts between the raw cached value and the value a record exposes.
pub trait Transformation: Send + Sync {
    /// Raw cache value (or `None` if absent) to record value.
    fn hydrate(&self, raw: Option<&Value>, options: &FieldOptions) -> Result<Value>;

    /// Record value to raw cache value.
    fn serialize(&self, value: &Value, options: &FieldOptions) -> Result<Value>;

    /// Value reported when nothing is cached for the field.
    fn default_value(&self, _options: &FieldOptions) -> Option<Value> {
        None
    }
}

/// Computes a read-only field from other fields of the same record.
pub trait Derivation: Send + Sync {
    fn derive(&self, record: &dyn FieldReader, options: &FieldOptions, field: &str)
    -> Result<Value>;
}

/// Computes the identity of an embedded object.
///
/// `Ok(None)` means the value carries no identity and falls back to its
/// position in the containing array.
pub trait HashFn: Send + Sync {
    fn hash(&self, value: &Value, options: &FieldOptions, field: &str) -> Result<Option<String>>;
}

type HydrateFn = dyn Fn(Option<&Value>, &FieldOptions) -> Result<Value> + Send + Sync;
type SerializeFn = dyn Fn(&Value, &FieldOptions) -> Result<Value> + Send + Sync;

/// Transformation assembled from closures.
pub struct FnTransformation {
    hydrate: Box<HydrateFn>,
    serialize: Box<SerializeFn>,
    default_value: Option<Value>,
}

impl FnTransformation {
    pub fn new<H, S>(hydrate: H, serialize: S) -> Self
    where
        H: Fn(Option<&Value>, &FieldOptions) -> Result<Value> + Send + Sync + 'static,
        S: Fn(&Value, &FieldOptions) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            hydrate: Box::new(hydrate),
            serialize: Box::new(serialize),
            default_value: None,
        }
    }

    #[must_use]
    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }
}

impl Transformation for FnTransformation {
    fn hydrate(&self, raw: Option<&Value>, options: &FieldOptions) -> Result<Value> {
        (self.hydrate)(raw, options)
    }

    fn serialize(&self, value: &Value, options: &FieldOptions) -> Result<Value> {
        (self.serialize)(value, options)
    }

    fn default_value(&self, _options: &FieldOptions) -> Option<Value> {
        self.default_value.clone()
    }
}

/// Derivation backed by a closure.
pub struct FnDerivation<F>(F);

/// Wrap a closure as a [`Derivation`].
pub fn derivation_fn<F>(f: F) -> FnDerivation<F>
where
    F: Fn(&dyn FieldReader, &FieldOptions) -> Result<Value> + Send + Sync,
{
    FnDerivation(f)
}

impl<F> Derivation for FnDerivation<F>
where
    F: Fn(&dyn FieldReader, &FieldOptions) -> Result<Value> + Send + Sync,
{
    fn derive(
        &self,
        record: &dyn FieldReader,
        options: &FieldOptions,
        _field: &str,
    ) -> Result<Value> {
        (self.0)(record, options)
    }
}

/// Hash function backed by a closure.
pub struct FnHashFn<F>(F);

/// Wrap a closure as a [`HashFn`].
pub fn hash_fn<F>(f: F) -> FnHashFn<F>
where
    F: Fn(&Value, &FieldOptions) -> Result<Option<String>> + Send + Sync,
{
    FnHashFn(f)
}

impl<F> HashFn for FnHashFn<F>
where
    F: Fn(&Value, &FieldOptions) -> Result<Option<String>> + Send + Sync,
{
    fn hash(&self, value: &Value, options: &FieldOptions, _field: &str) -> Result<Option<String>> {
        (self.0)(value, options)
    }
}
