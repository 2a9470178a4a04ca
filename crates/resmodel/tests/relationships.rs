mod common;

use asupersync::runtime::RuntimeBuilder;
use common::{MockAdapter, MockState, expect_err, store_with, unwrap_outcome};
use resmodel::{
    CommitPhase, Cx, DeletePhase, Document, Error, FieldOptions, FieldSchema, LinksModeErrorKind,
    RecordState, ResourceSchema, Store,
};
use serde_json::json;
use std::sync::{Arc, Mutex};

fn ids(records: &[Arc<resmodel::SchemaRecord>]) -> Vec<String> {
    records
        .iter()
        .map(|record| record.id().unwrap_or_default().to_string())
        .collect()
}

fn push_owner_and_pets(store: &resmodel::Store<common::MockAdapter>) {
    store
        .push_value(json!({
            "data": {
                "type": "person",
                "id": "1",
                "attributes": { "name": "Tom" },
                "relationships": {
                    "pets": { "data": [{ "type": "pet", "id": "1" }] }
                }
            },
            "included": [
                { "type": "pet", "id": "1", "attributes": { "name": "Shiro" } },
                { "type": "pet", "id": "2", "attributes": { "name": "Rex" } }
            ]
        }))
        .unwrap();
}

#[test]
fn belongs_to_push_fills_the_inverse_has_many() {
    let state = Arc::new(Mutex::new(MockState::default()));
    let store = store_with(&state);
    store
        .push_value(json!({ "data": { "type": "person", "id": "1", "attributes": { "name": "Tom" } } }))
        .unwrap();
    store
        .push_value(json!({
            "data": {
                "type": "pet",
                "id": "1",
                "attributes": { "name": "Shiro" },
                "relationships": { "owner": { "data": { "type": "person", "id": "1" } } }
            }
        }))
        .unwrap();

    let person = store.peek_record("person", "1").unwrap();
    let pets = person.has_many("pets").unwrap();
    assert_eq!(ids(&pets.records().unwrap()), vec!["1"]);

    let pet = store.peek_record("pet", "1").unwrap();
    let owner = pet.belongs_to("owner").unwrap().unwrap();
    assert!(Arc::ptr_eq(&owner, &person));
}

#[test]
fn has_many_push_fills_every_inverse() {
    let state = Arc::new(Mutex::new(MockState::default()));
    let store = store_with(&state);
    push_owner_and_pets(&store);

    let shiro = store.peek_record("pet", "1").unwrap();
    let rex = store.peek_record("pet", "2").unwrap();
    assert_eq!(shiro.belongs_to("owner").unwrap().unwrap().id(), Some("1"));
    assert!(rex.belongs_to("owner").unwrap().is_none());

    // Moving the pet list removes the dropped member's inverse.
    store
        .push_value(json!({
            "data": {
                "type": "person",
                "id": "1",
                "relationships": { "pets": { "data": [{ "type": "pet", "id": "2" }] } }
            }
        }))
        .unwrap();
    assert!(shiro.belongs_to("owner").unwrap().is_none());
    assert_eq!(rex.belongs_to("owner").unwrap().unwrap().id(), Some("1"));
}

#[test]
fn one_to_one_moves_release_the_previous_owner() {
    let state = Arc::new(Mutex::new(MockState::default()));
    let store = store_with(&state);
    store
        .push_value(json!({
            "data": [
                {
                    "type": "person",
                    "id": "1",
                    "relationships": { "heart": { "data": { "type": "heart", "id": "1" } } }
                },
                { "type": "person", "id": "2" }
            ],
            "included": [{ "type": "heart", "id": "1", "attributes": { "beats": 60 } }]
        }))
        .unwrap();

    let heart = store.peek_record("heart", "1").unwrap();
    assert_eq!(heart.belongs_to("person").unwrap().unwrap().id(), Some("1"));
    assert_eq!(heart.get("beats").unwrap(), json!(60));

    store
        .push_value(json!({
            "data": {
                "type": "person",
                "id": "2",
                "relationships": { "heart": { "data": { "type": "heart", "id": "1" } } }
            }
        }))
        .unwrap();

    let first = store.peek_record("person", "1").unwrap();
    let second = store.peek_record("person", "2").unwrap();
    assert!(first.belongs_to("heart").unwrap().is_none());
    assert_eq!(second.belongs_to("heart").unwrap().unwrap().id(), Some("1"));
    assert_eq!(heart.belongs_to("person").unwrap().unwrap().id(), Some("2"));
}

#[test]
fn editable_writes_stay_local_until_saved() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let state = Arc::new(Mutex::new(MockState::default()));
    let store = store_with(&state);
    push_owner_and_pets(&store);

    rt.block_on(async {
        let person = store.peek_record("person", "1").unwrap();
        let rex = store.peek_record("pet", "2").unwrap();
        let rex_edit = unwrap_outcome(store.checkout(&cx, &rex).await);
        let person_edit = unwrap_outcome(store.checkout(&cx, &person).await);

        rex_edit.set_belongs_to("owner", Some(&person)).unwrap();

        assert_eq!(ids(&person_edit.has_many("pets").unwrap().records().unwrap()), vec!["1", "2"]);
        assert_eq!(ids(&person.has_many("pets").unwrap().records().unwrap()), vec!["1"]);
        assert!(person.is_dirty(), "inverse write dirties the owner");
        assert_eq!(rex.state(), RecordState::LoadedUpdated(CommitPhase::Uncommitted));

        let sent = store.serialize_record(&rex).unwrap();
        let owner = sent.relationships.get("owner").unwrap();
        assert_eq!(
            owner.data,
            Some(Some(resmodel::Linkage::One(store.identifier("person", "1").unwrap().identifier())))
        );

        unwrap_outcome(store.save_record(&cx, &rex_edit).await);

        assert_eq!(ids(&person.has_many("pets").unwrap().records().unwrap()), vec!["1", "2"]);
        assert_eq!(rex.state(), RecordState::LoadedSaved);
        assert_eq!(person.state(), RecordState::LoadedSaved);
        assert_eq!(state.lock().expect("lock poisoned").updated.len(), 1);
    });
}

#[test]
fn remove_object_and_rollback_restore_membership() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let state = Arc::new(Mutex::new(MockState::default()));
    let store = store_with(&state);
    push_owner_and_pets(&store);

    rt.block_on(async {
        let person = store.peek_record("person", "1").unwrap();
        let shiro = store.peek_record("pet", "1").unwrap();
        let person_edit = unwrap_outcome(store.checkout(&cx, &person).await);
        let shiro_edit = unwrap_outcome(store.checkout(&cx, &shiro).await);

        let pets = person_edit.has_many("pets").unwrap();
        pets.remove_object(&shiro).unwrap();
        assert!(pets.is_empty().unwrap());
        assert!(shiro_edit.belongs_to("owner").unwrap().is_none());
        assert!(shiro.belongs_to("owner").unwrap().is_some());

        person_edit.rollback().unwrap();
        assert_eq!(pets.len().unwrap(), 1);
        let owner = shiro_edit.belongs_to("owner").unwrap().unwrap();
        assert_eq!(owner.id(), Some("1"));
        assert!(owner.is_editable(), "members follow the owner's mode");
        assert_eq!(shiro.state(), RecordState::LoadedSaved);
        assert_eq!(person.state(), RecordState::LoadedSaved);
    });
}

#[test]
fn many_array_mutations_keep_order_and_reject_wrong_types() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let state = Arc::new(Mutex::new(MockState::default()));
    let store = store_with(&state);
    push_owner_and_pets(&store);
    store
        .push_value(json!({ "data": { "type": "pet", "id": "3" } }))
        .unwrap();

    rt.block_on(async {
        let person = unwrap_outcome(store.checkout(&cx, &store.peek_record("person", "1").unwrap()).await);
        let rex = store.peek_record("pet", "2").unwrap();
        let third = store.peek_record("pet", "3").unwrap();
        let pets = person.has_many("pets").unwrap();

        pets.unshift(&rex).unwrap();
        pets.push(&third).unwrap();
        pets.push(&third).unwrap();
        assert_eq!(ids(&pets.records().unwrap()), vec!["2", "1", "3"]);

        let removed = pets.splice(1, 1, &[]).unwrap();
        assert_eq!(removed.iter().map(|k| k.id().unwrap()).collect::<Vec<_>>(), vec!["1"]);
        assert_eq!(ids(&pets.records().unwrap()), vec!["2", "3"]);

        let err = pets.push(&person).unwrap_err();
        assert!(matches!(err, Error::Custom(_)), "got {err:?}");
        assert_eq!(pets.len().unwrap(), 2);
    });
}

#[test]
fn immutable_projections_reject_writes() {
    let state = Arc::new(Mutex::new(MockState::default()));
    let store = store_with(&state);
    push_owner_and_pets(&store);
    let person = store.peek_record("person", "1").unwrap();
    let shiro = store.peek_record("pet", "1").unwrap();

    let err = person.set("name", json!("Other")).unwrap_err();
    assert!(matches!(err, Error::NotEditable(_)), "got {err:?}");

    let err = person.has_many("pets").unwrap().remove_object(&shiro).unwrap_err();
    assert!(matches!(err, Error::NotEditable(_)), "got {err:?}");

    let err = shiro.set_belongs_to("owner", None).unwrap_err();
    assert!(matches!(err, Error::NotEditable(_)), "got {err:?}");
    assert_eq!(person.get("name").unwrap(), json!("Tom"));
}

#[test]
fn set_accepts_identifier_json_for_relationships() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let state = Arc::new(Mutex::new(MockState::default()));
    let store = store_with(&state);
    push_owner_and_pets(&store);

    rt.block_on(async {
        let person = unwrap_outcome(store.checkout(&cx, &store.peek_record("person", "1").unwrap()).await);
        person
            .set("pets", json!([{ "type": "pet", "id": "2" }]))
            .unwrap();
        assert_eq!(ids(&person.has_many("pets").unwrap().records().unwrap()), vec!["2"]);
        assert_eq!(
            person.get("pets").unwrap(),
            json!([{ "type": "pet", "id": "2", "lid": store.identifier("pet", "2").unwrap().lid() }])
        );
    });
}

#[test]
fn unresolvable_inverse_leaves_the_owner_untouched() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let state = Arc::new(Mutex::new(MockState::default()));
    let store = Store::new(MockAdapter::new(Arc::clone(&state)));
    store
        .register_resource(
            ResourceSchema::resource("person").field(
                FieldSchema::has_many("pets", "pet").options(FieldOptions::new().inverse("owner")),
            ),
        )
        .unwrap();
    store
        .register_resource(ResourceSchema::resource("pet").field(FieldSchema::field("name")))
        .unwrap();
    store
        .push_value(json!({
            "data": { "type": "person", "id": "1" },
            "included": [{ "type": "pet", "id": "1", "attributes": { "name": "Shiro" } }]
        }))
        .unwrap();

    rt.block_on(async {
        let person = unwrap_outcome(store.checkout(&cx, &store.peek_record("person", "1").unwrap()).await);
        let err = person
            .set("pets", json!([{ "type": "pet", "id": "1" }]))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownField(_)), "got {err:?}");
        assert_eq!(person.has_many("pets").unwrap().len().unwrap(), 0);
        assert!(!person.is_dirty());
        assert_eq!(person.state(), RecordState::LoadedSaved);
    });
}

#[test]
fn committed_delete_detaches_every_inverse() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let state = Arc::new(Mutex::new(MockState::default()));
    let store = store_with(&state);
    store
        .push_value(json!({
            "data": {
                "type": "person",
                "id": "1",
                "attributes": { "name": "Tom" },
                "relationships": {
                    "pets": { "data": [{ "type": "pet", "id": "9" }, { "type": "pet", "id": "10" }] },
                    "heart": { "data": { "type": "heart", "id": "1" } }
                }
            },
            "included": [
                { "type": "pet", "id": "9", "attributes": { "name": "Rex" } },
                { "type": "pet", "id": "10", "attributes": { "name": "Shiro" } },
                { "type": "heart", "id": "1", "attributes": { "beats": 60 } }
            ]
        }))
        .unwrap();

    rt.block_on(async {
        let person = store.peek_record("person", "1").unwrap();
        let rex = store.peek_record("pet", "9").unwrap();
        store.delete_record(&rex).unwrap();
        unwrap_outcome(store.save_record(&cx, &rex).await);

        assert_eq!(rex.state(), RecordState::Deleted(DeletePhase::Saved));
        assert_eq!(ids(&person.has_many("pets").unwrap().records().unwrap()), vec!["10"]);
        assert_eq!(person.has_many("pets").unwrap().len().unwrap(), 1);
        assert_eq!(person.state(), RecordState::LoadedSaved);

        let heart = store.peek_record("heart", "1").unwrap();
        store.delete_record(&heart).unwrap();
        unwrap_outcome(store.save_record(&cx, &heart).await);
        assert!(person.belongs_to("heart").unwrap().is_none());

        assert_eq!(state.lock().expect("lock poisoned").deleted.len(), 2);
    });
}

// ============================================================================
// Links mode
// ============================================================================

#[test]
fn links_mode_requires_related_link_data_and_included_members() {
    let state = Arc::new(Mutex::new(MockState::default()));
    let store = store_with(&state);

    let no_link = store
        .push_value(json!({
            "data": {
                "type": "user",
                "id": "1",
                "relationships": { "friends": { "data": [] } }
            }
        }))
        .unwrap()
        .one()
        .unwrap();
    match no_link.has_many("friends").unwrap_err() {
        Error::LinksModeAssertion(err) => assert_eq!(err.kind, LinksModeErrorKind::MissingRelatedLink),
        other => panic!("unexpected error: {other:?}"),
    }

    let no_data = store
        .push_value(json!({
            "data": {
                "type": "user",
                "id": "2",
                "relationships": { "friends": { "links": { "related": "/users/2/friends" } } }
            }
        }))
        .unwrap()
        .one()
        .unwrap();
    match no_data.has_many("friends").unwrap_err() {
        Error::LinksModeAssertion(err) => assert_eq!(err.kind, LinksModeErrorKind::UndefinedData),
        other => panic!("unexpected error: {other:?}"),
    }

    let not_included = store
        .push_value(json!({
            "data": {
                "type": "user",
                "id": "3",
                "relationships": {
                    "bestFriend": {
                        "links": { "related": "/users/3/best-friend" },
                        "data": { "type": "user", "id": "99" }
                    }
                }
            }
        }))
        .unwrap()
        .one()
        .unwrap();
    match not_included.belongs_to("bestFriend").unwrap_err() {
        Error::LinksModeAssertion(err) => {
            assert_eq!(err.kind, LinksModeErrorKind::MissingIncluded);
            assert!(err.related.is_some());
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn links_mode_self_inverse_reads_both_sides() {
    let state = Arc::new(Mutex::new(MockState::default()));
    let store = store_with(&state);
    store
        .push_value(json!({
            "data": {
                "type": "user",
                "id": "1",
                "attributes": { "name": "Chris" },
                "relationships": {
                    "friends": {
                        "links": { "related": "/users/1/friends" },
                        "data": [{ "type": "user", "id": "2" }]
                    }
                }
            },
            "included": [{
                "type": "user",
                "id": "2",
                "attributes": { "name": "Wes" },
                "relationships": {
                    "friends": {
                        "links": { "related": "/users/2/friends" },
                        "data": [{ "type": "user", "id": "1" }]
                    }
                }
            }]
        }))
        .unwrap();

    let chris = store.peek_record("user", "1").unwrap();
    let wes = store.peek_record("user", "2").unwrap();
    let friends = chris.has_many("friends").unwrap().records().unwrap();
    assert_eq!(friends.len(), 1);
    assert!(Arc::ptr_eq(&friends[0], &wes));
    assert_eq!(ids(&wes.has_many("friends").unwrap().records().unwrap()), vec!["1"]);
}

#[test]
fn reload_relationship_fetches_through_the_related_link() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let state = Arc::new(Mutex::new(MockState::default()));
    {
        let mut guard = state.lock().expect("lock poisoned");
        let related = serde_json::from_value::<Document>(json!({
            "data": [
                {
                    "type": "user",
                    "id": "2",
                    "relationships": { "friends": { "links": { "related": "/users/2/friends" } } }
                },
                {
                    "type": "user",
                    "id": "3",
                    "relationships": { "friends": { "links": { "related": "/users/3/friends" } } }
                }
            ]
        }))
        .expect("valid document");
        guard.related.insert("/users/1/friends".to_string(), related);
    }
    let store = store_with(&state);

    rt.block_on(async {
        let chris = store
            .push_value(json!({
                "data": {
                    "type": "user",
                    "id": "1",
                    "relationships": {
                        "friends": { "links": { "related": "/users/1/friends" }, "data": [] }
                    }
                }
            }))
            .unwrap()
            .one()
            .unwrap();
        let friends = chris.has_many("friends").unwrap();
        assert!(friends.is_empty().unwrap());

        unwrap_outcome(store.reload_relationship(&cx, &chris, "friends").await);

        assert!(Arc::ptr_eq(&friends, &chris.has_many("friends").unwrap()));
        assert_eq!(ids(&friends.records().unwrap()), vec!["2", "3"]);
        let wes = store.peek_record("user", "2").unwrap();
        assert_eq!(ids(&wes.has_many("friends").unwrap().records().unwrap()), vec!["1"]);
        assert_eq!(
            state.lock().expect("lock poisoned").related_calls,
            vec!["/users/1/friends".to_string()]
        );

        let missing = store
            .push_value(json!({ "data": { "type": "post", "id": "1" } }))
            .unwrap()
            .one()
            .unwrap();
        let err = expect_err(store.reload_relationship(&cx, &missing, "comments").await);
        assert!(matches!(err, Error::LinksModeAssertion(_)), "got {err:?}");
    });
}

#[test]
fn load_has_many_batches_unloaded_members() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let state = Arc::new(Mutex::new(MockState::default()));
    {
        let mut guard = state.lock().expect("lock poisoned");
        guard.serve(json!({ "type": "comment", "id": "1", "attributes": { "body": "first" } }));
        guard.serve(json!({ "type": "comment", "id": "2", "attributes": { "body": "second" } }));
    }
    let store = store_with(&state);

    rt.block_on(async {
        let post = store
            .push_value(json!({
                "data": {
                    "type": "post",
                    "id": "1",
                    "relationships": {
                        "comments": { "data": [{ "type": "comment", "id": "1" }, { "type": "comment", "id": "2" }] }
                    }
                }
            }))
            .unwrap()
            .one()
            .unwrap();

        assert!(store.peek_record("comment", "1").is_none());
        let comments = unwrap_outcome(store.load_has_many(&cx, &post, "comments").await);
        let records = comments.records().unwrap();
        assert_eq!(ids(&records), vec!["1", "2"]);
        assert_eq!(records[1].get("body").unwrap(), json!("second"));
        assert_eq!(records[0].belongs_to("post").unwrap().unwrap().id(), Some("1"));

        let guard = state.lock().expect("lock poisoned");
        assert_eq!(guard.find_many_calls.len(), 1);
        let (type_name, mut requested) = guard.find_many_calls[0].clone();
        requested.sort();
        assert_eq!(type_name, "comment");
        assert_eq!(requested, vec!["1", "2"]);
        drop(guard);

        unwrap_outcome(store.load_has_many(&cx, &post, "comments").await);
        assert_eq!(state.lock().expect("lock poisoned").find_many_calls.len(), 1);
    });
}
