//! ResModel - a normalized, schema-driven client resource cache.
//!
//! ResModel keeps one canonical copy of every resource a client has seen and
//! projects it through declarative schemas:
//!
//! - One [`ResourceKey`] per logical resource, stable across id assignment
//! - Immutable and editable projections over the same cache entry
//! - Relationships whose inverses stay consistent on every write
//! - Live collections that re-evaluate only the records that changed
//! - Coalesced finds, one adapter request per type and flush
//!
//! # Quick Start
//!
//! ```ignore
//! use resmodel::prelude::*;
//!
//! let store = Store::new(adapter);
//! store.register_resource(
//!     ResourceSchema::resource("person")
//!         .field(FieldSchema::field("name").with_type("string"))
//!         .field(FieldSchema::has_many("pets", "pet").options(FieldOptions::new().inverse("owner"))),
//! )?;
//! store.register_resource(
//!     ResourceSchema::resource("pet")
//!         .field(FieldSchema::field("name"))
//!         .field(FieldSchema::belongs_to("owner", "person").options(FieldOptions::new().inverse("pets"))),
//! )?;
//!
//! let people = store.peek_all("person");
//! let tom = store.create_record("person", json!({ "name": "Tom Dale" }), CreateOptions::new())?;
//! assert!(people.contains(&tom));
//!
//! store.save_record(&cx, &tom).await;
//! assert!(store.peek_record("person", tom.id().unwrap()).is_some());
//! ```
//!
//! # Features
//!
//! - **Identity**: `peek_record` returns the same `Arc` until the record is unloaded
//! - **Structured concurrency**: adapter calls are asupersync `Cx`/`Outcome` futures
//!   and never hold the store lock
//! - **Rollback**: discards local and in-flight writes, including relationship edits
//! - **Extensible schemas**: named transformations, derivations and hash functions

mod containers;
mod live;
mod record;
mod relationships;
mod store;

pub use containers::{ManagedArray, ManyArray, SchemaArray, SchemaObject};
pub use live::LiveCollection;
pub use record::{FieldValue, SchemaRecord};
pub use store::{CreateOptions, Finder, PushResult, Store, StoreConfig, StoreDebugInfo};

pub use resmodel_core::{
    Adapter, Cx, Document, Error, FieldKind, FieldOptions, FieldReader, FieldSchema, Identity,
    InvalidRecordError, Linkage, Links, LinksModeError, LinksModeErrorKind, NullAdapter, Outcome,
    PrimaryData, RelationshipPayload, ResourceIdentifier, ResourceKey, ResourceObject,
    ResourceSchema, Result, Value,
};

pub use resmodel_cache::{
    CacheEntry, CommitPhase, DeletePhase, ErrorPhase, RecordState, RelationshipData,
};

pub use resmodel_query::{FetchTicket, FilterPredicate, LiveArrayKind};

pub use resmodel_schema::{
    Derivation, FnTransformation, HashFn, Transformation, derivation_fn, hash_fn,
};

/// Everything needed to declare schemas and drive a store.
pub mod prelude {
    pub use crate::{
        Adapter, CreateOptions, Cx, Document, Error, FieldKind, FieldOptions, FieldSchema,
        FieldValue, FilterPredicate, Identity, LiveCollection, Outcome, ResourceKey,
        ResourceSchema, Result, SchemaRecord, Store, StoreConfig,
    };
    pub use serde_json::json;
}
