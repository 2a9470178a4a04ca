//! The adapter boundary.
//!
//! Transport and wire serialization live outside the store. An [`Adapter`]
//! turns requests into normalized [`Document`]s; the store hands every result
//! to the same synchronous push path used by local mutations.
//!
//! All operations are async and take a `Cx` context for cancellation support,
//! matching the rest of the asupersync-based stack.

use crate::document::{Document, ResourceIdentifier, ResourceObject};
use crate::error::Error;
use asupersync::{Cx, Outcome};
use serde_json::Value;
use std::future::Future;

/// Source of resource documents and sink for record commits.
pub trait Adapter: Send + Sync {
    /// Fetch a single resource by id.
    fn find_record(
        &self,
        cx: &Cx,
        type_name: &str,
        id: &str,
    ) -> impl Future<Output = Outcome<Document, Error>> + Send;

    /// Fetch several resources of one type in one request.
    ///
    /// Ids absent from the returned document are rejected individually.
    fn find_many(
        &self,
        cx: &Cx,
        type_name: &str,
        ids: &[String],
    ) -> impl Future<Output = Outcome<Document, Error>> + Send;

    /// Fetch the members of a relationship from its `links.related` URL.
    fn find_related(
        &self,
        cx: &Cx,
        owner: &ResourceIdentifier,
        field: &str,
        link: &str,
    ) -> impl Future<Output = Outcome<Document, Error>> + Send;

    /// Run a server-side query for a collection of one type.
    fn query(
        &self,
        cx: &Cx,
        type_name: &str,
        query: &Value,
    ) -> impl Future<Output = Outcome<Document, Error>> + Send;

    /// Persist a client-created record. `None` means "accepted as sent".
    fn create_record(
        &self,
        cx: &Cx,
        snapshot: &ResourceObject,
    ) -> impl Future<Output = Outcome<Option<Document>, Error>> + Send;

    /// Persist changes to an existing record.
    fn update_record(
        &self,
        cx: &Cx,
        snapshot: &ResourceObject,
    ) -> impl Future<Output = Outcome<Option<Document>, Error>> + Send;

    /// Delete a record on the server.
    fn delete_record(
        &self,
        cx: &Cx,
        snapshot: &ResourceObject,
    ) -> impl Future<Output = Outcome<Option<Document>, Error>> + Send;

    /// Whether concurrent finds of one type may be batched into `find_many`.
    fn coalesce_find_requests(&self) -> bool {
        true
    }
}

/// Adapter for stores that only ever receive pushed data.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAdapter;

fn unsupported(operation: &str) -> Error {
    Error::Custom(format!("no adapter configured for '{operation}'"))
}

impl Adapter for NullAdapter {
    fn find_record(
        &self,
        _cx: &Cx,
        _type_name: &str,
        _id: &str,
    ) -> impl Future<Output = Outcome<Document, Error>> + Send {
        async { Outcome::Err(unsupported("find_record")) }
    }

    fn find_many(
        &self,
        _cx: &Cx,
        _type_name: &str,
        _ids: &[String],
    ) -> impl Future<Output = Outcome<Document, Error>> + Send {
        async { Outcome::Err(unsupported("find_many")) }
    }

    fn find_related(
        &self,
        _cx: &Cx,
        _owner: &ResourceIdentifier,
        _field: &str,
        _link: &str,
    ) -> impl Future<Output = Outcome<Document, Error>> + Send {
        async { Outcome::Err(unsupported("find_related")) }
    }

    fn query(
        &self,
        _cx: &Cx,
        _type_name: &str,
        _query: &Value,
    ) -> impl Future<Output = Outcome<Document, Error>> + Send {
        async { Outcome::Err(unsupported("query")) }
    }

    fn create_record(
        &self,
        _cx: &Cx,
        _snapshot: &ResourceObject,
    ) -> impl Future<Output = Outcome<Option<Document>, Error>> + Send {
        async { Outcome::Ok(None) }
    }

    fn update_record(
        &self,
        _cx: &Cx,
        _snapshot: &ResourceObject,
    ) -> impl Future<Output = Outcome<Option<Document>, Error>> + Send {
        async { Outcome::Ok(None) }
    }

    fn delete_record(
        &self,
        _cx: &Cx,
        _snapshot: &ResourceObject,
    ) -> impl Future<Output = Outcome<Option<Document>, Error>> + Send {
        async { Outcome::Ok(None) }
    }

    fn coalesce_find_requests(&self) -> bool {
        false
    }
}
