//! Schema registry for ResModel.
//!
//! - [`SchemaRegistry`] - resource/object schemas and named extension points
//! - [`Transformation`], [`Derivation`], [`HashFn`] - the extension traits
//! - built-in `string`, `number` and `boolean` transformations and a
//!   `concat` derivation, installed by [`SchemaRegistry::with_builtins`]

pub mod builtins;
pub mod registry;
pub mod traits;

pub use builtins::{BooleanTransform, ConcatDerivation, NumberTransform, StringTransform};
pub use registry::SchemaRegistry;
pub use traits::{
    Derivation, FnDerivation, FnHashFn, FnTransformation, HashFn, Transformation, derivation_fn,
    hash_fn,
};
