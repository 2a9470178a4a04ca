//! Shared fixtures for the integration tests: a scripted adapter and the
//! schemas the scenarios use.

#![allow(dead_code)]

use resmodel::{
    Adapter, Cx, Document, Error, FieldOptions, FieldSchema, Outcome, ResourceIdentifier,
    ResourceObject, ResourceSchema, Store,
};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

/// The error of a failed outcome.
pub fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        Outcome::Ok(_) => panic!("expected an error, got Ok"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

/// Callback the adapter runs while its request is outstanding, after the
/// response has been built.
pub struct Hook(Box<dyn FnOnce() + Send>);

impl Hook {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    fn run(self) {
        (self.0)();
    }
}

impl std::fmt::Debug for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Hook")
    }
}

#[derive(Debug, Default)]
pub struct MockState {
    /// Server-side resources by `(type, id)`.
    pub resources: BTreeMap<(String, String), ResourceObject>,
    /// Documents served for `links.related` URLs.
    pub related: BTreeMap<String, Document>,
    /// Document returned by `query`.
    pub query_result: Option<Document>,
    /// Errors returned by the next commits, oldest first.
    pub commit_errors: VecDeque<Error>,
    pub next_id: u64,
    /// Run by the next `find_record` / `find_many` calls.
    pub find_hooks: VecDeque<Hook>,
    /// Run by the next `update_record` calls.
    pub commit_hooks: VecDeque<Hook>,

    pub find_record_calls: Vec<(String, String)>,
    pub find_many_calls: Vec<(String, Vec<String>)>,
    pub related_calls: Vec<String>,
    pub query_calls: Vec<(String, Value)>,
    pub created: Vec<ResourceObject>,
    pub updated: Vec<ResourceObject>,
    pub deleted: Vec<ResourceObject>,
}

impl MockState {
    pub fn serve(&mut self, resource: Value) {
        let resource: ResourceObject =
            serde_json::from_value(resource).expect("valid resource object");
        let id = resource.id.clone().expect("served resources carry an id");
        self.resources
            .insert((resource.type_name.clone(), id), resource);
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockAdapter {
    pub state: Arc<Mutex<MockState>>,
}

impl MockAdapter {
    pub fn new(state: Arc<Mutex<MockState>>) -> Self {
        Self { state }
    }
}

impl Adapter for MockAdapter {
    fn find_record(
        &self,
        _cx: &Cx,
        type_name: &str,
        id: &str,
    ) -> impl Future<Output = Outcome<Document, Error>> + Send {
        let state = Arc::clone(&self.state);
        let key = (type_name.to_string(), id.to_string());
        async move {
            let (outcome, hook) = {
                let mut guard = state.lock().expect("lock poisoned");
                guard.find_record_calls.push(key.clone());
                let outcome = match guard.resources.get(&key) {
                    Some(resource) => Outcome::Ok(Document::single(resource.clone())),
                    None => Outcome::Err(Error::server(Some(404), format!("{}:{} not found", key.0, key.1))),
                };
                (outcome, guard.find_hooks.pop_front())
            };
            if let Some(hook) = hook {
                hook.run();
            }
            outcome
        }
    }

    fn find_many(
        &self,
        _cx: &Cx,
        type_name: &str,
        ids: &[String],
    ) -> impl Future<Output = Outcome<Document, Error>> + Send {
        let state = Arc::clone(&self.state);
        let type_name = type_name.to_string();
        let ids = ids.to_vec();
        async move {
            let (found, hook) = {
                let mut guard = state.lock().expect("lock poisoned");
                guard.find_many_calls.push((type_name.clone(), ids.clone()));
                let found = ids
                    .iter()
                    .filter_map(|id| guard.resources.get(&(type_name.clone(), id.clone())).cloned())
                    .collect();
                (found, guard.find_hooks.pop_front())
            };
            if let Some(hook) = hook {
                hook.run();
            }
            Outcome::Ok(Document::many(found))
        }
    }

    fn find_related(
        &self,
        _cx: &Cx,
        _owner: &ResourceIdentifier,
        _field: &str,
        link: &str,
    ) -> impl Future<Output = Outcome<Document, Error>> + Send {
        let state = Arc::clone(&self.state);
        let link = link.to_string();
        async move {
            let mut guard = state.lock().expect("lock poisoned");
            guard.related_calls.push(link.clone());
            match guard.related.get(&link) {
                Some(document) => Outcome::Ok(document.clone()),
                None => Outcome::Err(Error::server(Some(404), link)),
            }
        }
    }

    fn query(
        &self,
        _cx: &Cx,
        type_name: &str,
        query: &Value,
    ) -> impl Future<Output = Outcome<Document, Error>> + Send {
        let state = Arc::clone(&self.state);
        let call = (type_name.to_string(), query.clone());
        async move {
            let mut guard = state.lock().expect("lock poisoned");
            guard.query_calls.push(call);
            Outcome::Ok(guard.query_result.clone().unwrap_or_else(|| Document::many(Vec::new())))
        }
    }

    fn create_record(
        &self,
        _cx: &Cx,
        snapshot: &ResourceObject,
    ) -> impl Future<Output = Outcome<Option<Document>, Error>> + Send {
        let state = Arc::clone(&self.state);
        let snapshot = snapshot.clone();
        async move {
            let mut guard = state.lock().expect("lock poisoned");
            guard.created.push(snapshot.clone());
            if let Some(error) = guard.commit_errors.pop_front() {
                return Outcome::Err(error);
            }
            guard.next_id += 1;
            let mut saved = ResourceObject::new(&snapshot.type_name, Some(guard.next_id.to_string()));
            saved.attributes = snapshot.attributes.clone();
            Outcome::Ok(Some(Document::single(saved)))
        }
    }

    fn update_record(
        &self,
        _cx: &Cx,
        snapshot: &ResourceObject,
    ) -> impl Future<Output = Outcome<Option<Document>, Error>> + Send {
        let state = Arc::clone(&self.state);
        let snapshot = snapshot.clone();
        async move {
            let (outcome, hook) = {
                let mut guard = state.lock().expect("lock poisoned");
                guard.updated.push(snapshot);
                let outcome = match guard.commit_errors.pop_front() {
                    Some(error) => Outcome::Err(error),
                    None => Outcome::Ok(None),
                };
                (outcome, guard.commit_hooks.pop_front())
            };
            if let Some(hook) = hook {
                hook.run();
            }
            outcome
        }
    }

    fn delete_record(
        &self,
        _cx: &Cx,
        snapshot: &ResourceObject,
    ) -> impl Future<Output = Outcome<Option<Document>, Error>> + Send {
        let state = Arc::clone(&self.state);
        let snapshot = snapshot.clone();
        async move {
            let mut guard = state.lock().expect("lock poisoned");
            guard.deleted.push(snapshot);
            match guard.commit_errors.pop_front() {
                Some(error) => Outcome::Err(error),
                None => Outcome::Ok(None),
            }
        }
    }
}

/// `person` owns `pet`s and has one `heart`; `user` has links-mode friends;
/// `post` has non-links comments.
pub fn register_schemas<A: Adapter>(store: &Store<A>) {
    store
        .register_resource(
            ResourceSchema::resource("person")
                .field(FieldSchema::field("name").with_type("string"))
                .field(FieldSchema::alias("fullName", "name"))
                .field(
                    FieldSchema::has_many("pets", "pet")
                        .options(FieldOptions::new().inverse("owner")),
                )
                .field(
                    FieldSchema::belongs_to("heart", "heart")
                        .options(FieldOptions::new().inverse("person")),
                ),
        )
        .expect("register person");
    store
        .register_resource(
            ResourceSchema::resource("pet")
                .field(FieldSchema::field("name"))
                .field(
                    FieldSchema::belongs_to("owner", "person")
                        .options(FieldOptions::new().inverse("pets")),
                ),
        )
        .expect("register pet");
    store
        .register_resource(
            ResourceSchema::resource("heart")
                .field(FieldSchema::field("beats").with_type("number"))
                .field(
                    FieldSchema::belongs_to("person", "person")
                        .options(FieldOptions::new().inverse("heart")),
                ),
        )
        .expect("register heart");
    store
        .register_resource(
            ResourceSchema::resource("user")
                .field(FieldSchema::field("name"))
                .field(
                    FieldSchema::has_many("friends", "user")
                        .options(FieldOptions::new().inverse("friends").links_mode(true)),
                )
                .field(
                    FieldSchema::belongs_to("bestFriend", "user")
                        .options(FieldOptions::new().links_mode(true)),
                ),
        )
        .expect("register user");
    store
        .register_resource(
            ResourceSchema::resource("post")
                .field(FieldSchema::field("title"))
                .field(
                    FieldSchema::has_many("comments", "comment")
                        .options(FieldOptions::new().inverse("post")),
                ),
        )
        .expect("register post");
    store
        .register_resource(
            ResourceSchema::resource("comment")
                .field(FieldSchema::field("body"))
                .field(
                    FieldSchema::belongs_to("post", "post")
                        .options(FieldOptions::new().inverse("comments")),
                ),
        )
        .expect("register comment");
}

/// A store with every test schema registered.
pub fn store_with(state: &Arc<Mutex<MockState>>) -> Store<MockAdapter> {
    let store = Store::new(MockAdapter::new(Arc::clone(state)));
    register_schemas(&store);
    store
}
