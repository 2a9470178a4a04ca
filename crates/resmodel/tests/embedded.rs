mod common;

use asupersync::runtime::RuntimeBuilder;
use common::{MockAdapter, MockState, unwrap_outcome};
use resmodel::{
    Cx, Error, FieldOptions, FieldSchema, FnTransformation, Identity, ResourceSchema, Store,
    hash_fn,
};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};

fn customer_store(state: &Arc<Mutex<MockState>>) -> Store<MockAdapter> {
    let store = Store::new(MockAdapter::new(Arc::clone(state)));
    store.register_hash_fn(
        "by-street",
        hash_fn(|value: &Value, _: &FieldOptions| {
            Ok(value.get("street").and_then(Value::as_str).map(str::to_string))
        }),
    );
    store.register_transformation(
        "upper",
        FnTransformation::new(
            |raw: Option<&Value>, _: &FieldOptions| {
                Ok(raw
                    .and_then(Value::as_str)
                    .map_or(Value::Null, |s| Value::String(s.to_uppercase())))
            },
            |value: &Value, _: &FieldOptions| {
                Ok(value
                    .as_str()
                    .map_or(Value::Null, |s| Value::String(s.to_lowercase())))
            },
        ),
    );
    store
        .register_resource(
            ResourceSchema::object("address")
                .identity(Identity::Hash("by-street".to_string()))
                .field(FieldSchema::field("street"))
                .field(FieldSchema::field("city").with_type("upper"))
                .field(FieldSchema::derived("label", "concat").options(
                    FieldOptions::new()
                        .extra("fields", json!(["street", "city"]))
                        .extra("separator", json!(", ")),
                )),
        )
        .unwrap();
    store
        .register_resource(
            ResourceSchema::object("preferences")
                .field(FieldSchema::field("theme"))
                .field(FieldSchema::field("emails").with_type("boolean")),
        )
        .unwrap();
    store
        .register_resource(
            ResourceSchema::resource("customer")
                .field(FieldSchema::field("firstName"))
                .field(FieldSchema::field("lastName"))
                .field(FieldSchema::field("tier").options(
                    FieldOptions::new().extra("defaultValue", json!("standard")),
                ))
                .field(FieldSchema::field("visits").with_type("number"))
                .field(FieldSchema::field("nickname").with_type("missing"))
                .field(FieldSchema::field("displayName").source_key("display_name"))
                .field(FieldSchema::array("tags"))
                .field(FieldSchema::object("settings"))
                .field(FieldSchema::schema_object("address", "address"))
                .field(FieldSchema::schema_object("preferences", "preferences"))
                .field(FieldSchema::schema_array("addresses", "address"))
                .field(
                    FieldSchema::schema_array("history", "address")
                        .options(FieldOptions::new().key("@index")),
                )
                .field(FieldSchema::derived("fullName", "concat").options(
                    FieldOptions::new().extra("fields", json!(["firstName", "lastName"])),
                )),
        )
        .unwrap();
    store
}

fn push_customer(store: &Store<MockAdapter>, attributes: Value) -> Arc<resmodel::SchemaRecord> {
    store
        .push_value(json!({ "data": { "type": "customer", "id": "1", "attributes": attributes } }))
        .unwrap()
        .one()
        .unwrap()
}

#[test]
fn scalar_fields_hydrate_through_transforms_and_defaults() {
    let state = Arc::new(Mutex::new(MockState::default()));
    let store = customer_store(&state);
    let customer = push_customer(
        &store,
        json!({
            "firstName": "Chris",
            "lastName": "Thoburn",
            "visits": "12",
            "display_name": "runspired",
            "settings": { "compact": true }
        }),
    );

    assert_eq!(customer.get("fullName").unwrap(), json!("Chris Thoburn"));
    assert_eq!(customer.get("tier").unwrap(), json!("standard"));
    assert_eq!(customer.get("visits").unwrap(), json!(12));
    assert_eq!(customer.get("displayName").unwrap(), json!("runspired"));
    assert_eq!(customer.get("settings").unwrap(), json!({ "compact": true }));

    let err = customer.get("nickname").unwrap_err();
    assert!(matches!(err, Error::UnregisteredTransform(_)), "got {err:?}");

    push_customer(&store, json!({ "tier": null }));
    assert_eq!(customer.get("tier").unwrap(), Value::Null, "explicit null is kept");
}

#[test]
fn derived_fields_are_read_only() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let state = Arc::new(Mutex::new(MockState::default()));
    let store = customer_store(&state);
    let customer = push_customer(&store, json!({ "firstName": "Chris", "lastName": "Thoburn" }));

    rt.block_on(async {
        let editable = unwrap_outcome(store.checkout(&cx, &customer).await);
        let err = editable.set("fullName", json!("Someone Else")).unwrap_err();
        assert!(matches!(err, Error::NotEditable(_)), "got {err:?}");

        editable.set("firstName", json!("Wes")).unwrap();
        assert_eq!(editable.get("fullName").unwrap(), json!("Wes Thoburn"));
        assert_eq!(customer.get("fullName").unwrap(), json!("Chris Thoburn"));

        editable.set("displayName", json!("wes")).unwrap();
        let sent = store.serialize_record(&editable).unwrap();
        assert_eq!(sent.attributes.get("display_name"), Some(&json!("wes")));
    });
}

#[test]
fn managed_arrays_write_through_the_editable_view() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let state = Arc::new(Mutex::new(MockState::default()));
    let store = customer_store(&state);
    let customer = push_customer(&store, json!({ "tags": ["vip"] }));

    rt.block_on(async {
        let tags = customer.array("tags").unwrap();
        assert!(Arc::ptr_eq(&tags, &customer.array("tags").unwrap()));
        let err = tags.push(json!("new")).unwrap_err();
        assert!(matches!(err, Error::NotEditable(_)), "got {err:?}");

        let editable = unwrap_outcome(store.checkout(&cx, &customer).await);
        let editable_tags = editable.array("tags").unwrap();
        editable_tags.push(json!("beta")).unwrap();
        editable_tags.insert(0, json!("first")).unwrap();
        assert_eq!(editable_tags.to_vec().unwrap(), vec![json!("first"), json!("vip"), json!("beta")]);
        assert_eq!(editable_tags.remove(1).unwrap(), Some(json!("vip")));
        assert!(editable_tags.set(9, json!("x")).is_err());

        assert_eq!(tags.to_value().unwrap(), json!(["vip"]));
        assert!(customer.is_dirty());
        assert_eq!(
            editable.changed_attributes().unwrap().get("tags"),
            Some(&(json!(["vip"]), json!(["first", "beta"])))
        );
    });
}

#[test]
fn schema_object_keeps_identity_while_its_hash_is_stable() {
    let state = Arc::new(Mutex::new(MockState::default()));
    let store = customer_store(&state);
    let customer = push_customer(
        &store,
        json!({ "address": { "street": "1 Main St", "city": "portland" } }),
    );

    let address = customer.schema_object("address").unwrap().unwrap();
    assert_eq!(address.object_type(), "address");
    assert_eq!(address.get("city").unwrap(), json!("PORTLAND"));
    assert_eq!(address.get("label").unwrap(), json!("1 Main St, PORTLAND"));

    push_customer(&store, json!({ "address": { "street": "1 Main St", "city": "seattle" } }));
    let same = customer.schema_object("address").unwrap().unwrap();
    assert!(Arc::ptr_eq(&address, &same));
    assert_eq!(address.get("city").unwrap(), json!("SEATTLE"));

    push_customer(&store, json!({ "address": null }));
    assert!(customer.schema_object("address").unwrap().is_none());

    push_customer(&store, json!({ "address": { "street": "1 Main St", "city": "seattle" } }));
    let back = customer.schema_object("address").unwrap().unwrap();
    assert!(Arc::ptr_eq(&address, &back), "a transient null keeps identity");

    push_customer(&store, json!({ "address": { "street": "9 Elm St", "city": "seattle" } }));
    let moved = customer.schema_object("address").unwrap().unwrap();
    assert!(!Arc::ptr_eq(&address, &moved));
}

#[test]
fn schema_object_writes_serialize_into_the_owner() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let state = Arc::new(Mutex::new(MockState::default()));
    let store = customer_store(&state);
    let customer = push_customer(
        &store,
        json!({
            "address": { "street": "1 Main St", "city": "portland" },
            "preferences": { "theme": "dark", "emails": true }
        }),
    );

    rt.block_on(async {
        let readonly = customer.schema_object("preferences").unwrap().unwrap();
        let err = readonly.set("theme", json!("light")).unwrap_err();
        assert!(matches!(err, Error::NotEditable(_)), "got {err:?}");

        let editable = unwrap_outcome(store.checkout(&cx, &customer).await);
        let address = editable.schema_object("address").unwrap().unwrap();
        address.set("city", json!("Boston")).unwrap();
        assert_eq!(address.get("city").unwrap(), json!("BOSTON"));
        assert_eq!(
            editable.get("address").unwrap(),
            json!({ "street": "1 Main St", "city": "boston" })
        );
        assert_eq!(
            customer.get("address").unwrap(),
            json!({ "street": "1 Main St", "city": "portland" })
        );

        let err = address.set("label", json!("nope")).unwrap_err();
        assert!(matches!(err, Error::NotEditable(_)), "got {err:?}");

        let preferences = editable.schema_object("preferences").unwrap().unwrap();
        assert_eq!(preferences.get("emails").unwrap(), json!(true));
        preferences.set("theme", json!("light")).unwrap();
        assert_eq!(preferences.get("theme").unwrap(), json!("light"));
        assert!(Arc::ptr_eq(
            &preferences,
            &editable.schema_object("preferences").unwrap().unwrap()
        ));
    });
}

#[test]
fn schema_array_reuses_elements_by_hash() {
    let state = Arc::new(Mutex::new(MockState::default()));
    let store = customer_store(&state);
    let customer = push_customer(
        &store,
        json!({
            "addresses": [
                { "street": "1 Main St", "city": "portland" },
                { "street": "9 Elm St", "city": "seattle" }
            ]
        }),
    );

    let addresses = customer.schema_array("addresses").unwrap();
    let before = addresses.elements().unwrap();
    assert_eq!(before.len(), 2);
    assert!(!addresses.is_null().unwrap());

    push_customer(
        &store,
        json!({
            "addresses": [
                { "street": "9 Elm St", "city": "seattle" },
                { "street": "5 Oak Ave", "city": "austin" },
                { "street": "1 Main St", "city": "salem" }
            ]
        }),
    );
    let after = addresses.elements().unwrap();
    assert_eq!(after.len(), 3);
    assert!(Arc::ptr_eq(&after[0], &before[1]));
    assert!(Arc::ptr_eq(&after[2], &before[0]));
    assert_eq!(after[2].get("city").unwrap(), json!("SALEM"));
    assert!(!Arc::ptr_eq(&after[1], &before[0]) && !Arc::ptr_eq(&after[1], &before[1]));

    push_customer(&store, json!({ "addresses": null }));
    assert!(addresses.is_null().unwrap());
    assert!(addresses.is_empty().unwrap());
}

#[test]
fn positional_schema_array_keys_by_index() {
    let state = Arc::new(Mutex::new(MockState::default()));
    let store = customer_store(&state);
    let customer = push_customer(
        &store,
        json!({ "history": [{ "street": "1 Main St" }, { "street": "9 Elm St" }] }),
    );
    let history = customer.schema_array("history").unwrap();
    let before = history.elements().unwrap();

    push_customer(
        &store,
        json!({ "history": [{ "street": "9 Elm St" }, { "street": "1 Main St" }] }),
    );
    let after = history.elements().unwrap();
    assert!(Arc::ptr_eq(&after[0], &before[0]));
    assert_eq!(after[0].get("street").unwrap(), json!("9 Elm St"));
}

#[test]
fn schema_array_element_writes_target_their_slot() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let state = Arc::new(Mutex::new(MockState::default()));
    let store = customer_store(&state);
    let customer = push_customer(
        &store,
        json!({
            "addresses": [
                { "street": "1 Main St", "city": "portland" },
                { "street": "9 Elm St", "city": "seattle" }
            ]
        }),
    );

    rt.block_on(async {
        let editable = unwrap_outcome(store.checkout(&cx, &customer).await);
        let addresses = editable.schema_array("addresses").unwrap();
        let elm = addresses.get(1).unwrap().unwrap();

        addresses.remove(0).unwrap();
        let elements = addresses.elements().unwrap();
        assert_eq!(elements.len(), 1);
        assert!(Arc::ptr_eq(&elements[0], &elm));

        elm.set("city", json!("Tacoma")).unwrap();
        assert_eq!(
            addresses.to_value().unwrap(),
            json!([{ "street": "9 Elm St", "city": "tacoma" }])
        );

        addresses.push(json!({ "street": "5 Oak Ave", "city": "austin" })).unwrap();
        assert_eq!(addresses.len().unwrap(), 2);
        assert_eq!(customer.schema_array("addresses").unwrap().len().unwrap(), 2, "saved view unchanged");
    });
}

fn payment_store(state: &Arc<Mutex<MockState>>) -> Store<MockAdapter> {
    let store = Store::new(MockAdapter::new(Arc::clone(state)));
    store
        .register_resource(
            ResourceSchema::object("card")
                .field(FieldSchema::field("slug"))
                .field(FieldSchema::field("last4")),
        )
        .unwrap();
    store
        .register_resource(
            ResourceSchema::object("bank")
                .field(FieldSchema::field("slug"))
                .field(FieldSchema::field("routing")),
        )
        .unwrap();
    store
        .register_resource(
            ResourceSchema::resource("wallet")
                .field(
                    FieldSchema::schema_array("methods", "card")
                        .options(FieldOptions::new().polymorphic(true).key("slug")),
                )
                .field(FieldSchema::schema_object("primary", "card").options(
                    FieldOptions::new().polymorphic(true).type_key("kind").key("slug"),
                )),
        )
        .unwrap();
    store
}

#[test]
fn polymorphic_elements_are_replaced_when_their_type_changes() {
    let state = Arc::new(Mutex::new(MockState::default()));
    let store = payment_store(&state);
    let push = |attributes: Value| {
        store
            .push_value(json!({ "data": { "type": "wallet", "id": "1", "attributes": attributes } }))
            .unwrap()
            .one()
            .unwrap()
    };
    let wallet = push(json!({
        "methods": [{ "type": "card", "slug": "a", "last4": "4242" }],
        "primary": { "kind": "card", "slug": "a", "last4": "4242" }
    }));

    let methods = wallet.schema_array("methods").unwrap();
    let card = methods.elements().unwrap().remove(0);
    let primary = wallet.schema_object("primary").unwrap().unwrap();
    assert_eq!(card.object_type(), "card");
    assert_eq!(primary.object_type(), "card");

    push(json!({
        "methods": [{ "type": "card", "slug": "a", "last4": "1881" }],
        "primary": { "kind": "card", "slug": "a", "last4": "1881" }
    }));
    assert!(Arc::ptr_eq(&card, &methods.elements().unwrap()[0]));
    assert!(Arc::ptr_eq(&primary, &wallet.schema_object("primary").unwrap().unwrap()));
    assert_eq!(card.get("last4").unwrap(), json!("1881"));

    // Same slug, new type.
    push(json!({
        "methods": [{ "type": "bank", "slug": "a", "routing": "011000015" }],
        "primary": { "kind": "bank", "slug": "a", "routing": "011000015" }
    }));
    let bank = methods.elements().unwrap().remove(0);
    assert!(!Arc::ptr_eq(&card, &bank));
    assert_eq!(bank.object_type(), "bank");
    assert_eq!(bank.get("routing").unwrap(), json!("011000015"));

    let switched = wallet.schema_object("primary").unwrap().unwrap();
    assert!(!Arc::ptr_eq(&primary, &switched));
    assert_eq!(switched.object_type(), "bank");
    assert_eq!(card.object_type(), "card");
}
