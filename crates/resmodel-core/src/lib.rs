//! Core types and traits for ResModel.
//!
//! This crate provides the foundational abstractions shared by every layer:
//!
//! - [`ResourceKey`] canonical resource handles
//! - [`Document`] and friends, the normalized inbound/outbound shape
//! - [`ResourceSchema`]/[`FieldSchema`] declarations
//! - [`Adapter`] trait for fetching and committing resources
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod adapter;
pub mod document;
pub mod error;
pub mod key;
pub mod reader;
pub mod schema;

pub use adapter::{Adapter, NullAdapter};
pub use document::{
    Document, Link, Linkage, Links, PrimaryData, RelationshipPayload, ResourceIdentifier,
    ResourceObject,
};
pub use error::{
    Error, FieldError, FieldValidationError, IdentityError, InvalidRecordError, LinksModeError,
    LinksModeErrorKind, RegistryError, RegistryKind, ResourceError, Result, SchemaError,
    SchemaErrorKind, ServerError, StateError,
};
pub use key::ResourceKey;
pub use reader::FieldReader;
pub use schema::{FieldKind, FieldOptions, FieldSchema, Identity, ResourceSchema};
pub use serde_json::Value;
