//! Entity mutation engine scenarios through the public facade

use std::sync::Arc;

use entidb::{
    schema_evolution_proposals, AssociatedDataSchema, AttributeKey, AttributeMutation,
    AttributeSchema, Currency, Entity, EntityBuilder, EntitySchema, EntityScope, Error,
    EvolutionMode, LocalMutation, Locale, PriceKey, PriceSpec, ReferenceKey, ReferenceSchema,
    SchemaMutation, Value, ValueKind, Versioned,
};
use rust_decimal::Decimal;

fn czk() -> Currency {
    Currency::new("CZK").unwrap()
}

fn english() -> Locale {
    Locale::new("en").unwrap()
}

fn product_schema() -> EntitySchema {
    EntitySchema::new("Product")
        .with_locale(english())
        .with_currency(czk())
        .with_price_list("basic")
        .with_attribute(AttributeSchema::new("code", ValueKind::String))
        .with_attribute(AttributeSchema::new("name", ValueKind::String).localized())
        .with_attribute(AttributeSchema::new("stock", ValueKind::Int))
        .with_associated_data(AssociatedDataSchema::new("labels", ValueKind::Object))
        .with_reference(ReferenceSchema::new("brand", "Brand"))
}

#[test]
fn noop_mutation_list_returns_the_base_entity_instance() {
    let schema = product_schema();
    let mut builder = EntityBuilder::new(&schema, Some(1));
    builder.set_attribute("code", "TV-123").unwrap();
    builder.set_parent(10);
    let base = builder.build().unwrap();

    // every mutation re-states current state: the engine must hand back
    // the very same instance, not an equal copy
    let mut builder = EntityBuilder::from_entity(&schema, Arc::clone(&base));
    builder.set_attribute("code", "TV-123").unwrap();
    builder.set_parent(10);
    builder.set_scope(EntityScope::Live);
    let next = builder.build().unwrap();

    assert!(Arc::ptr_eq(&base, &next));
    assert_eq!(next.version(), 1);
}

#[test]
fn effective_change_mints_the_next_version() {
    let schema = product_schema();
    let mut builder = EntityBuilder::new(&schema, Some(1));
    builder.set_attribute("code", "TV-123").unwrap();
    let v1 = builder.build().unwrap();

    let mut builder = EntityBuilder::from_entity(&schema, Arc::clone(&v1));
    builder.set_attribute("code", "TV-456").unwrap();
    let v2 = builder.build().unwrap();

    assert_eq!(v1.version(), 1);
    assert_eq!(v2.version(), 2);
    assert_eq!(v2.attribute("code"), Some(&Value::from("TV-456")));

    let code = AttributeKey::global("code");
    let value_v1 = v1.attributes().attribute_value(&code).unwrap();
    let value_v2 = v2.attributes().attribute_value(&code).unwrap();
    assert_eq!(value_v1.version(), 1);
    assert_eq!(value_v2.version(), 2);
}

#[test]
fn attribute_version_never_resets_while_reachable() {
    let schema = product_schema();
    let code = AttributeKey::global("code");

    let mut entity = {
        let mut builder = EntityBuilder::new(&schema, Some(1));
        builder.set_attribute("code", "A").unwrap();
        builder.build().unwrap()
    };

    let mut last_version = 1;
    for step in ["B", "C", "B", "D"] {
        let mut builder = EntityBuilder::from_entity(&schema, Arc::clone(&entity));
        builder.set_attribute("code", step).unwrap();
        entity = builder.build().unwrap();
        let version = entity.attributes().attribute_value(&code).unwrap().version();
        assert!(version > last_version, "version must strictly increase");
        last_version = version;
    }

    // removal keeps the tombstone reachable and bumps once more
    let mut builder = EntityBuilder::from_entity(&schema, Arc::clone(&entity));
    builder.remove_attribute("code");
    let entity = builder.build().unwrap();
    assert_eq!(entity.attribute("code"), None);
}

#[test]
fn unmodified_containers_are_reused_verbatim() {
    let schema = product_schema();
    let mut builder = EntityBuilder::new(&schema, Some(1));
    builder.set_attribute("code", "A").unwrap();
    builder.insert_reference("brand", 5).unwrap();
    builder
        .set_price(
            PriceKey::new(1, "basic", czk()),
            PriceSpec::new(Decimal::from(100), Decimal::from(21), Decimal::from(121)),
        )
        .unwrap();
    let base = builder.build().unwrap();

    let mut builder = EntityBuilder::from_entity(&schema, Arc::clone(&base));
    builder.set_attribute("code", "B").unwrap();
    let next = builder.build().unwrap();

    assert!(Arc::ptr_eq(base.associated_data(), next.associated_data()));
    assert!(Arc::ptr_eq(base.prices(), next.prices()));
    assert!(Arc::ptr_eq(
        base.reference_bundle("brand").unwrap(),
        next.reference_bundle("brand").unwrap()
    ));
    assert!(!Arc::ptr_eq(base.attributes(), next.attributes()));
}

#[test]
fn delta_mutation_is_not_an_implicit_insert() {
    let schema = product_schema();
    let err = Entity::mutate(
        &schema,
        None,
        &[LocalMutation::Attribute(AttributeMutation::ApplyDelta {
            key: AttributeKey::global("stock"),
            delta: Value::Int(5),
        })],
    )
    .unwrap_err();
    assert!(matches!(err, Error::MissingValueForDelta { .. }));
}

#[test]
fn schema_violations_surface_at_mutation_time() {
    let schema = product_schema();
    let mut builder = EntityBuilder::new(&schema, None);

    let err = builder.set_attribute("ean", "123").unwrap_err();
    assert!(matches!(err, Error::AttributeNotInSchema { .. }));

    let err = builder.set_attribute("stock", "high").unwrap_err();
    assert!(matches!(err, Error::InvalidValueType { .. }));

    let czech = Locale::new("cs").unwrap();
    let err = builder
        .set_localized_attribute("name", czech, "Televize")
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedLocale { .. }));

    let eur = Currency::new("EUR").unwrap();
    let err = builder
        .set_price(
            PriceKey::new(1, "basic", eur),
            PriceSpec::new(Decimal::from(4), Decimal::from(21), Decimal::from(5)),
        )
        .unwrap_err();
    assert!(matches!(err, Error::CurrencyNotInSchema { .. }));
}

#[test]
fn evolution_proposals_make_rejected_mutations_legal() {
    let schema = product_schema();
    let mutations = vec![LocalMutation::Attribute(AttributeMutation::Upsert {
        key: AttributeKey::global("ean"),
        value: Value::from("8595121"),
    })];

    // without the evolution mode the analysis rejects the list outright
    assert!(schema_evolution_proposals(&schema, &mutations).is_err());

    let evolving = product_schema().with_evolution(EvolutionMode::AddingAttributes);
    let proposals = schema_evolution_proposals(&evolving, &mutations).unwrap();
    assert_eq!(proposals.len(), 1);
    assert!(matches!(
        &proposals[0],
        SchemaMutation::CreateAttribute { reference: None, schema }
            if schema.name() == "ean" && schema.value_type() == ValueKind::String
    ));

    // the engine accepts the same list under the same evolution mode
    let entity = Entity::mutate(&evolving, None, &mutations).unwrap();
    assert_eq!(entity.attribute("ean"), Some(&Value::from("8595121")));
}

#[test]
fn upsert_mutation_is_absent_for_unchanged_entities() {
    let schema = product_schema();
    let mut builder = EntityBuilder::new(&schema, Some(7));
    builder.set_attribute("code", "A").unwrap();
    builder.set_associated_data("labels", {
        let mut map = std::collections::BTreeMap::new();
        map.insert("color".to_string(), Value::from("black"));
        Value::Object(map)
    })
    .unwrap();
    let mutation = builder.to_mutation_if_changed().unwrap().unwrap();
    assert_eq!(mutation.primary_key, Some(7));
    let base = builder.build().unwrap();

    let mut builder = EntityBuilder::from_entity(&schema, Arc::clone(&base));
    builder.set_attribute("code", "A").unwrap();
    assert!(
        builder.to_mutation_if_changed().unwrap().is_none(),
        "nothing to persist for a no-op rebuild"
    );
}

#[test]
fn archived_entities_keep_their_data() {
    let schema = product_schema();
    let mut builder = EntityBuilder::new(&schema, Some(1));
    builder.set_attribute("code", "A").unwrap();
    let live = builder.build().unwrap();

    let mut builder = EntityBuilder::from_entity(&schema, Arc::clone(&live));
    builder.set_scope(EntityScope::Archived);
    let archived = builder.build().unwrap();

    assert_eq!(archived.scope(), EntityScope::Archived);
    assert_eq!(archived.version(), 2);
    assert_eq!(archived.attribute("code"), Some(&Value::from("A")));
    assert!(Arc::ptr_eq(live.attributes(), archived.attributes()));
}

#[test]
fn localized_values_extend_the_entity_locale_set() {
    let schema = product_schema();
    let mut builder = EntityBuilder::new(&schema, Some(1));
    builder.set_attribute("code", "A").unwrap();
    let base = builder.build().unwrap();
    assert_eq!(base.locales().count(), 0);

    let mut builder = EntityBuilder::from_entity(&schema, Arc::clone(&base));
    builder
        .set_localized_attribute("name", english(), "Telly")
        .unwrap();
    let next = builder.build().unwrap();
    let locales: Vec<_> = next.locales().collect();
    assert_eq!(locales, vec![&english()]);
}

#[test]
fn reference_lifecycle_through_the_builder() {
    let schema = product_schema();
    let key = ReferenceKey::new("brand", 5);

    let mut builder = EntityBuilder::new(&schema, Some(1));
    builder.insert_reference("brand", 5).unwrap();
    builder.set_reference_group(key.clone(), Some("BrandGroup"), 77);
    let base = builder.build().unwrap();

    let reference = base.reference(&key).unwrap();
    assert_eq!(reference.group().unwrap().primary_key(), 77);

    let mut builder = EntityBuilder::from_entity(&schema, Arc::clone(&base));
    builder.remove_reference_group(key.clone());
    let next = builder.build().unwrap();
    assert!(next.reference(&key).unwrap().group().is_none());
    assert_eq!(next.version(), 2);

    let mut builder = EntityBuilder::from_entity(&schema, Arc::clone(&next));
    builder.remove_reference(key.clone());
    let last = builder.build().unwrap();
    assert!(last.reference(&key).is_none());
}
