mod common;

use asupersync::runtime::RuntimeBuilder;
use common::{Hook, MockState, expect_err, store_with, unwrap_outcome};
use resmodel::{
    CommitPhase, CreateOptions, Cx, DeletePhase, Error, ErrorPhase, InvalidRecordError,
    RecordState,
};
use serde_json::json;
use std::sync::{Arc, Mutex};

fn push_person(store: &resmodel::Store<common::MockAdapter>, id: &str, name: &str) -> Arc<resmodel::SchemaRecord> {
    store
        .push_value(json!({ "data": { "type": "person", "id": id, "attributes": { "name": name } } }))
        .unwrap()
        .one()
        .unwrap()
}

#[test]
fn rollback_restores_the_saved_view() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let state = Arc::new(Mutex::new(MockState::default()));
    let store = store_with(&state);
    let person = push_person(&store, "1", "Tom");

    rt.block_on(async {
        let editable = unwrap_outcome(store.checkout(&cx, &person).await);
        assert!(Arc::ptr_eq(&editable, &unwrap_outcome(store.checkout(&cx, &person).await)));

        editable.set("name", json!("Wes")).unwrap();
        assert_eq!(editable.get("name").unwrap(), json!("Wes"));
        assert_eq!(person.get("name").unwrap(), json!("Tom"));
        assert_eq!(person.state(), RecordState::LoadedUpdated(CommitPhase::Uncommitted));
        assert_eq!(
            editable.changed_attributes().unwrap().get("name"),
            Some(&(json!("Tom"), json!("Wes")))
        );

        editable.rollback().unwrap();
        assert_eq!(editable.get("name").unwrap(), json!("Tom"));
        assert!(editable.changed_attributes().unwrap().is_empty());
        assert_eq!(person.state(), RecordState::LoadedSaved);
    });
}

#[test]
fn writing_the_saved_value_back_makes_the_record_clean() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let state = Arc::new(Mutex::new(MockState::default()));
    let store = store_with(&state);
    let person = push_person(&store, "1", "Tom");

    rt.block_on(async {
        let editable = unwrap_outcome(store.checkout(&cx, &person).await);
        editable.set("name", json!("Wes")).unwrap();
        assert!(person.is_dirty());
        editable.set("name", json!("Tom")).unwrap();
        assert!(!person.is_dirty());

        // Nothing to send for a clean record.
        unwrap_outcome(store.save_record(&cx, &editable).await);
        assert!(state.lock().expect("lock poisoned").updated.is_empty());
    });
}

#[test]
fn saved_changes_become_canonical() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let state = Arc::new(Mutex::new(MockState::default()));
    let store = store_with(&state);
    let person = push_person(&store, "1", "Tom");

    rt.block_on(async {
        let editable = unwrap_outcome(store.checkout(&cx, &person).await);
        editable.set("name", json!("Wes")).unwrap();
        unwrap_outcome(store.save_record(&cx, &editable).await);

        assert_eq!(person.get("name").unwrap(), json!("Wes"));
        assert_eq!(store.cache_get_attr(person.key(), "name"), Some(json!("Wes")));
        assert_eq!(person.state(), RecordState::LoadedSaved);
        let guard = state.lock().expect("lock poisoned");
        assert_eq!(guard.updated.len(), 1);
        assert_eq!(guard.updated[0].id.as_deref(), Some("1"));
        assert_eq!(guard.updated[0].attributes.get("name"), Some(&json!("Wes")));
    });
}

#[test]
fn late_commit_result_after_rollback_is_ignored() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let state = Arc::new(Mutex::new(MockState::default()));
    let store = store_with(&state);
    let person = push_person(&store, "1", "Tom");

    rt.block_on(async {
        let editable = unwrap_outcome(store.checkout(&cx, &person).await);
        editable.set("name", json!("Wes")).unwrap();

        // The edit is rolled back while the update is outstanding.
        let rolled_back = Arc::clone(&editable);
        state
            .lock()
            .expect("lock poisoned")
            .commit_hooks
            .push_back(Hook::new(move || rolled_back.rollback().expect("rollback in flight")));
        unwrap_outcome(store.save_record(&cx, &editable).await);

        assert_eq!(person.get("name").unwrap(), json!("Tom"));
        assert_eq!(editable.get("name").unwrap(), json!("Tom"));
        assert_eq!(store.cache_get_attr(person.key(), "name"), Some(json!("Tom")));
        assert_eq!(person.state(), RecordState::LoadedSaved);
        assert!(!editable.is_dirty());

        // The late failure of a second superseded commit is ignored as well.
        editable.set("name", json!("Zoe")).unwrap();
        let rolled_back = Arc::clone(&editable);
        {
            let mut guard = state.lock().expect("lock poisoned");
            guard.commit_errors.push_back(Error::server(Some(500), "down"));
            guard
                .commit_hooks
                .push_back(Hook::new(move || rolled_back.rollback().expect("rollback in flight")));
        }
        unwrap_outcome(store.save_record(&cx, &editable).await);
        assert_eq!(person.state(), RecordState::LoadedSaved);
        assert_eq!(editable.get("name").unwrap(), json!("Tom"));
        assert_eq!(state.lock().expect("lock poisoned").updated.len(), 2);
    });
}

#[test]
fn invalid_commit_keeps_changes_and_recovers_on_edit() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let state = Arc::new(Mutex::new(MockState::default()));
    state
        .lock()
        .expect("lock poisoned")
        .commit_errors
        .push_back(Error::Invalid(InvalidRecordError::new().with("name", "is taken")));
    let store = store_with(&state);
    let person = push_person(&store, "1", "Tom");

    rt.block_on(async {
        let editable = unwrap_outcome(store.checkout(&cx, &person).await);
        editable.set("name", json!("Wes")).unwrap();

        let err = expect_err(store.save_record(&cx, &editable).await);
        assert!(matches!(err, Error::Invalid(_)), "got {err:?}");
        assert!(err.is_recoverable());
        assert_eq!(person.state(), RecordState::LoadedUpdated(CommitPhase::Invalid));
        assert!(!person.is_valid());
        assert_eq!(person.errors_for("name"), vec!["is taken".to_string()]);
        assert_eq!(editable.get("name").unwrap(), json!("Wes"));
        assert_eq!(person.get("name").unwrap(), json!("Tom"));

        editable.set("name", json!("Wesley")).unwrap();
        assert!(person.is_valid());
        assert!(person.errors().is_empty());
        assert_eq!(person.state(), RecordState::LoadedUpdated(CommitPhase::Uncommitted));

        unwrap_outcome(store.save_record(&cx, &editable).await);
        assert_eq!(person.get("name").unwrap(), json!("Wesley"));
        assert_eq!(person.state(), RecordState::LoadedSaved);
    });
}

#[test]
fn mark_valid_clears_errors_without_editing() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let state = Arc::new(Mutex::new(MockState::default()));
    state
        .lock()
        .expect("lock poisoned")
        .commit_errors
        .push_back(Error::Invalid(InvalidRecordError::new().with("name", "is too short")));
    let store = store_with(&state);
    let person = push_person(&store, "1", "Tom");

    rt.block_on(async {
        let editable = unwrap_outcome(store.checkout(&cx, &person).await);
        editable.set("name", json!("W")).unwrap();
        expect_err(store.save_record(&cx, &editable).await);

        store.mark_valid(&person).unwrap();
        assert!(person.errors().is_empty());
        assert_eq!(person.state(), RecordState::LoadedUpdated(CommitPhase::Uncommitted));
        assert_eq!(editable.get("name").unwrap(), json!("W"));
    });
}

#[test]
fn server_error_leaves_a_retryable_record() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let state = Arc::new(Mutex::new(MockState::default()));
    state
        .lock()
        .expect("lock poisoned")
        .commit_errors
        .push_back(Error::server(Some(503), "unavailable"));
    let store = store_with(&state);
    let person = push_person(&store, "1", "Tom");

    rt.block_on(async {
        let editable = unwrap_outcome(store.checkout(&cx, &person).await);
        editable.set("name", json!("Wes")).unwrap();

        let err = expect_err(store.save_record(&cx, &editable).await);
        assert!(matches!(err, Error::Server(_)), "got {err:?}");
        assert_eq!(person.state(), RecordState::Error(ErrorPhase::Updated));
        assert!(person.is_dirty());
        assert_eq!(editable.get("name").unwrap(), json!("Wes"));

        unwrap_outcome(store.save_record(&cx, &editable).await);
        assert_eq!(person.state(), RecordState::LoadedSaved);
        assert_eq!(person.get("name").unwrap(), json!("Wes"));
        assert_eq!(state.lock().expect("lock poisoned").updated.len(), 2);
    });
}

#[test]
fn dirty_records_cannot_be_unloaded() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let state = Arc::new(Mutex::new(MockState::default()));
    let store = store_with(&state);
    let person = push_person(&store, "1", "Tom");

    rt.block_on(async {
        let editable = unwrap_outcome(store.checkout(&cx, &person).await);
        editable.set("name", json!("Wes")).unwrap();

        let err = store.unload_record(&person).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)), "got {err:?}");
        assert!(store.peek_record("person", "1").is_some());

        editable.rollback().unwrap();
        store.unload_record(&person).unwrap();
        assert!(store.peek_record("person", "1").is_none());
        assert_eq!(person.state(), RecordState::Empty);
    });
}

#[test]
fn deleted_records_leave_live_collections_until_rolled_back() {
    let state = Arc::new(Mutex::new(MockState::default()));
    let store = store_with(&state);
    let people = store.peek_all("person");
    let person = push_person(&store, "1", "Tom");
    assert!(people.contains(&person));

    store.delete_record(&person).unwrap();
    assert_eq!(person.state(), RecordState::Deleted(DeletePhase::Uncommitted));
    assert!(person.is_deleted());
    assert!(store.cache_is_deleted(person.key()));
    assert!(!people.contains(&person));

    store.rollback_record(&person).unwrap();
    assert_eq!(person.state(), RecordState::LoadedSaved);
    assert!(!store.cache_is_deleted(person.key()));
    assert!(people.contains(&person));
}

#[test]
fn committed_delete_can_be_unloaded() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let state = Arc::new(Mutex::new(MockState::default()));
    let store = store_with(&state);
    let person = push_person(&store, "1", "Tom");

    rt.block_on(async {
        let editable = unwrap_outcome(store.checkout(&cx, &person).await);
        store.delete_record(&person).unwrap();
        unwrap_outcome(store.save_record(&cx, &person).await);

        assert_eq!(person.state(), RecordState::Deleted(DeletePhase::Saved));
        assert_eq!(state.lock().expect("lock poisoned").deleted.len(), 1);

        let err = editable.set("name", json!("Ghost")).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)), "got {err:?}");

        store.unload_record(&person).unwrap();
        assert!(store.identifier("person", "1").is_none());
    });
}

#[test]
fn deleting_an_unsaved_record_never_reaches_the_adapter() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let state = Arc::new(Mutex::new(MockState::default()));
    let store = store_with(&state);

    rt.block_on(async {
        let draft = store
            .create_record("person", json!({ "name": "Draft" }), CreateOptions::new())
            .unwrap();
        store.delete_record(&draft).unwrap();
        assert_eq!(draft.state(), RecordState::Deleted(DeletePhase::Saved));

        unwrap_outcome(store.save_record(&cx, &draft).await);
        let guard = state.lock().expect("lock poisoned");
        assert!(guard.created.is_empty());
        assert!(guard.deleted.is_empty());
    });
}

#[test]
fn rolling_back_a_created_record_removes_it() {
    let state = Arc::new(Mutex::new(MockState::default()));
    let store = store_with(&state);
    let people = store.peek_all("person");

    let draft = store
        .create_record("person", json!({ "name": "Draft" }), CreateOptions::new())
        .unwrap();
    assert_eq!(
        draft.changed_attributes().unwrap().get("name"),
        Some(&(serde_json::Value::Null, json!("Draft")))
    );
    assert!(people.contains(&draft));

    draft.rollback().unwrap();
    assert!(!people.contains(&draft));
    assert!(store.peek_record_by_lid(draft.lid()).is_none());
    assert_eq!(draft.state(), RecordState::Empty);
    assert_eq!(store.debug_state().cached, 0);
}

#[test]
fn failed_create_keeps_the_record_new() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let state = Arc::new(Mutex::new(MockState::default()));
    state
        .lock()
        .expect("lock poisoned")
        .commit_errors
        .push_back(Error::server(Some(500), "boom"));
    let store = store_with(&state);

    rt.block_on(async {
        let draft = store
            .create_record("person", json!({ "name": "Draft" }), CreateOptions::new())
            .unwrap();
        expect_err(store.save_record(&cx, &draft).await);
        assert_eq!(draft.state(), RecordState::Error(ErrorPhase::Created));
        assert!(draft.is_new());
        assert!(draft.id().is_none());

        unwrap_outcome(store.save_record(&cx, &draft).await);
        assert_eq!(draft.id(), Some("1"));
        assert_eq!(draft.state(), RecordState::LoadedSaved);
    });
}
