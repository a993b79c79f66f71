//! Entity aggregate and the mutation-application engine
//!
//! [`Entity`] composes one attribute container, one associated-data
//! container, an optional parent link, the relationship-name →
//! reference-bundle map and one price container. Instances are immutable;
//! [`Entity::mutate`] is the single place where all container-level
//! mutations are ordered and applied, threading the evolving intermediate
//! state and producing either a new version or - when nothing observable
//! changed - the very same base instance (pointer equality). That
//! identity-preserving no-op is load-bearing for upstream change
//! detection: the storage layer skips persisting a version it got back
//! unchanged.
//!
//! Schema evolution is analyzed separately by
//! [`schema_evolution_proposals`], a pure function returning the schema
//! mutations the caller must apply for a mutation list to become fully
//! schema-legal. The engine itself accepts whatever the schema's
//! evolution modes permit but never mutates schema state.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use entidb_core::schema::{
    verify_associated_data, verify_attribute, verify_price, verify_reference, EntitySchema,
    ReferenceSchema, SchemaMutation,
};
use entidb_core::{
    Droppable, Error, Locale, Result, Value, Version, Versioned, INITIAL_VERSION,
};

use crate::associated_data::{AssociatedData, AssociatedDataKey, AssociatedDataValue};
use crate::attributes::{Attributes, AttributesBuilder, AttributeKey, AttributeValue};
use crate::bundle::ReferenceBundle;
use crate::mutation::{
    AssociatedDataMutation, AttributeMutation, EntityUpsertMutation, LocalMutation, PriceMutation,
    ReferenceMutation,
};
use crate::price::{Price, PriceInnerRecordHandling, PriceKey, PriceSpec};
use crate::prices::Prices;
use crate::reference::{Reference, ReferenceGroup, ReferenceKey};

/// Scope the entity lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EntityScope {
    /// Regular, queryable entity
    #[default]
    Live,
    /// Archived entity, excluded from regular queries
    Archived,
}

/// One immutable version of a business entity
///
/// ## Invariants
///
/// - `version` starts at 1 and increments by exactly one per effective
///   mutation batch
/// - Sub-containers are structurally shared: an unmodified container is
///   reused verbatim by the next version rather than copied
/// - `locales` is the union of attribute and associated-data locales
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    entity_type: String,
    primary_key: Option<u64>,
    version: Version,
    scope: EntityScope,
    parent: Option<u64>,
    locales: BTreeSet<Locale>,
    attributes: Arc<Attributes>,
    associated_data: Arc<AssociatedData>,
    references: BTreeMap<String, Arc<ReferenceBundle>>,
    prices: Arc<Prices>,
}

impl Versioned for Entity {
    fn version(&self) -> Version {
        self.version
    }
}

impl Entity {
    fn empty(entity_type: &str, primary_key: Option<u64>) -> Entity {
        Entity {
            entity_type: entity_type.to_string(),
            primary_key,
            version: INITIAL_VERSION,
            scope: EntityScope::default(),
            parent: None,
            locales: BTreeSet::new(),
            attributes: Arc::new(Attributes::empty()),
            associated_data: Arc::new(AssociatedData::empty()),
            references: BTreeMap::new(),
            prices: Arc::new(Prices::empty(PriceInnerRecordHandling::default())),
        }
    }

    /// Entity type the entity belongs to
    #[inline]
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Primary key, absent until assigned
    #[inline]
    pub fn primary_key(&self) -> Option<u64> {
        self.primary_key
    }

    /// Scope the entity lives in
    #[inline]
    pub fn scope(&self) -> EntityScope {
        self.scope
    }

    /// Primary key of the hierarchical parent, if any
    #[inline]
    pub fn parent(&self) -> Option<u64> {
        self.parent
    }

    /// Locales used by localized attribute and associated-data values
    pub fn locales(&self) -> impl Iterator<Item = &Locale> {
        self.locales.iter()
    }

    /// Attribute container
    #[inline]
    pub fn attributes(&self) -> &Arc<Attributes> {
        &self.attributes
    }

    /// Live payload of a non-localized attribute
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.attribute(name)
    }

    /// Live payload of a localized attribute
    pub fn attribute_localized(&self, name: &str, locale: &Locale) -> Option<&Value> {
        self.attributes.attribute_localized(name, locale)
    }

    /// Associated data container
    #[inline]
    pub fn associated_data(&self) -> &Arc<AssociatedData> {
        &self.associated_data
    }

    /// Reference bundle of one relationship
    pub fn reference_bundle(&self, name: &str) -> Option<&Arc<ReferenceBundle>> {
        self.references.get(name)
    }

    /// All reference bundles
    pub fn reference_bundles(&self) -> impl Iterator<Item = &Arc<ReferenceBundle>> {
        self.references.values()
    }

    /// One live reference by key
    pub fn reference(&self, key: &ReferenceKey) -> Option<&Reference> {
        self.references
            .get(key.name())
            .and_then(|bundle| bundle.get(key))
            .filter(|reference| reference.exists())
    }

    /// Price container
    #[inline]
    pub fn prices(&self) -> &Arc<Prices> {
        &self.prices
    }

    /// Apply an ordered sequence of local mutations on top of a base
    /// entity (or none, for a brand-new entity)
    ///
    /// Returns the base instance unchanged - pointer-equal - when no
    /// mutation changed observable state, including when
    /// semantically-equivalent-but-textually-different mutations were
    /// applied (e.g. re-setting an attribute to its current value).
    /// Otherwise builds a new entity with `version = base.version + 1`
    /// (or 1 without a base), structurally sharing every unmodified
    /// sub-container.
    pub fn mutate(
        schema: &EntitySchema,
        base: Option<&Arc<Entity>>,
        mutations: &[LocalMutation],
    ) -> Result<Arc<Entity>> {
        Self::mutate_with_key(schema, base, mutations, base.and_then(|entity| entity.primary_key))
    }

    pub(crate) fn mutate_with_key(
        schema: &EntitySchema,
        base: Option<&Arc<Entity>>,
        mutations: &[LocalMutation],
        primary_key: Option<u64>,
    ) -> Result<Arc<Entity>> {
        tracing::debug!(
            entity_type = schema.name(),
            mutations = mutations.len(),
            "applying local mutations"
        );

        let mut new_parent: Option<Option<u64>> = None;
        let mut new_scope: Option<EntityScope> = None;
        let mut new_handling: Option<PriceInnerRecordHandling> = None;
        let mut new_attributes: BTreeMap<AttributeKey, AttributeValue> = BTreeMap::new();
        let mut new_associated_data: BTreeMap<AssociatedDataKey, AssociatedDataValue> =
            BTreeMap::new();
        let mut new_prices: BTreeMap<PriceKey, Price> = BTreeMap::new();
        let mut work_bundles: BTreeMap<String, ReferenceBundle> = BTreeMap::new();
        let mut changed_bundles: BTreeSet<String> = BTreeSet::new();

        for mutation in mutations {
            match mutation {
                LocalMutation::Attribute(mutation) => {
                    if let AttributeMutation::Upsert { key, value } = mutation {
                        verify_attribute(schema, None, key.name(), value.kind(), key.locale())?;
                    }
                    let existing = new_attributes.get(mutation.key()).or_else(|| {
                        base.and_then(|entity| {
                            entity
                                .attributes
                                .attribute_value_including_dropped(mutation.key())
                        })
                    });
                    let applied = mutation.apply(existing)?;
                    let effective = match existing {
                        None => true,
                        Some(existing) => applied.version() > existing.version(),
                    };
                    if effective {
                        new_attributes.insert(mutation.key().clone(), applied);
                    }
                }

                LocalMutation::AssociatedData(mutation) => {
                    if let AssociatedDataMutation::Upsert { key, value } = mutation {
                        verify_associated_data(schema, key.name(), value.kind(), key.locale())?;
                    }
                    let existing = new_associated_data.get(mutation.key()).or_else(|| {
                        base.and_then(|entity| {
                            entity
                                .associated_data
                                .value_including_dropped(mutation.key())
                        })
                    });
                    let applied = mutation.apply(existing)?;
                    let effective = match existing {
                        None => true,
                        Some(existing) => applied.version() > existing.version(),
                    };
                    if effective {
                        new_associated_data.insert(mutation.key().clone(), applied);
                    }
                }

                LocalMutation::Reference(mutation) => {
                    let name = mutation.key().name().to_string();
                    if !work_bundles.contains_key(&name) {
                        if let Some(bundle) =
                            base.and_then(|entity| entity.references.get(&name))
                        {
                            work_bundles.insert(name.clone(), (**bundle).clone());
                        }
                    }
                    let changed = apply_reference_mutation(
                        schema,
                        &mut work_bundles,
                        &name,
                        mutation,
                    )?;
                    if changed {
                        changed_bundles.insert(name);
                    }
                }

                LocalMutation::Price(mutation) => {
                    if let PriceMutation::Upsert { key, .. } = mutation {
                        verify_price(schema, key.price_list(), key.currency())?;
                    }
                    let existing = new_prices.get(mutation.key()).or_else(|| {
                        base.and_then(|entity| {
                            entity.prices.price_including_dropped(mutation.key())
                        })
                    });
                    let applied = mutation.apply(existing)?;
                    let effective = match existing {
                        None => true,
                        Some(existing) => applied.version() > existing.version(),
                    };
                    if effective {
                        new_prices.insert(mutation.key().clone(), applied);
                    }
                }

                LocalMutation::SetPriceInnerRecordHandling { handling } => {
                    let current = base
                        .map(|entity| entity.prices.inner_record_handling())
                        .unwrap_or_default();
                    new_handling = (*handling != current).then_some(*handling);
                }

                LocalMutation::SetParent { parent } => {
                    let current = base.and_then(|entity| entity.parent);
                    new_parent = (current != Some(*parent)).then_some(Some(*parent));
                }

                LocalMutation::RemoveParent => {
                    let current = base.and_then(|entity| entity.parent);
                    new_parent = current.is_some().then_some(None);
                }

                LocalMutation::SetScope { scope } => {
                    let current = base.map(|entity| entity.scope).unwrap_or_default();
                    new_scope = (*scope != current).then_some(*scope);
                }
            }
        }

        let changed = new_parent.is_some()
            || new_scope.is_some()
            || new_handling.is_some()
            || !new_attributes.is_empty()
            || !new_associated_data.is_empty()
            || !new_prices.is_empty()
            || !changed_bundles.is_empty();

        if !changed {
            return Ok(match base {
                Some(entity) => Arc::clone(entity),
                None => Arc::new(Entity::empty(schema.name(), primary_key)),
            });
        }

        // create or reuse the attribute container
        let attributes = if new_attributes.is_empty() {
            base.map(|entity| Arc::clone(&entity.attributes))
                .unwrap_or_else(|| Arc::new(Attributes::empty()))
        } else {
            let merged = base
                .iter()
                .flat_map(|entity| entity.attributes.all_values())
                .filter(|value| !new_attributes.contains_key(value.key()))
                .cloned()
                .collect::<Vec<_>>()
                .into_iter()
                .chain(new_attributes.into_values());
            Arc::new(Attributes::from_values(merged))
        };

        // create or reuse the associated data container
        let associated_data = if new_associated_data.is_empty() {
            base.map(|entity| Arc::clone(&entity.associated_data))
                .unwrap_or_else(|| Arc::new(AssociatedData::empty()))
        } else {
            let merged = base
                .iter()
                .flat_map(|entity| entity.associated_data.all_values())
                .filter(|value| !new_associated_data.contains_key(value.key()))
                .cloned()
                .collect::<Vec<_>>()
                .into_iter()
                .chain(new_associated_data.into_values());
            Arc::new(AssociatedData::from_values(merged))
        };

        // create or reuse reference bundles
        let mut references: BTreeMap<String, Arc<ReferenceBundle>> = base
            .map(|entity| entity.references.clone())
            .unwrap_or_default();
        for name in &changed_bundles {
            if let Some(bundle) = work_bundles.remove(name) {
                references.insert(name.clone(), Arc::new(bundle));
            }
        }

        // create or reuse the price container
        let prices = if new_prices.is_empty() && new_handling.is_none() {
            base.map(|entity| Arc::clone(&entity.prices))
                .unwrap_or_else(|| Arc::new(Prices::empty(PriceInnerRecordHandling::default())))
        } else {
            let handling = new_handling.unwrap_or_else(|| {
                base.map(|entity| entity.prices.inner_record_handling())
                    .unwrap_or_default()
            });
            let version = base
                .map(|entity| entity.prices.version() + 1)
                .unwrap_or(INITIAL_VERSION);
            let merged = base
                .iter()
                .flat_map(|entity| entity.prices.all_prices())
                .filter(|price| !new_prices.contains_key(price.key()))
                .cloned()
                .collect::<Vec<_>>()
                .into_iter()
                .chain(new_prices.into_values());
            let container = Prices::new(version, merged, handling);
            container.validate_unambiguous()?;
            Arc::new(container)
        };

        // aggregate entity locales
        let locales: BTreeSet<Locale> = attributes
            .attribute_locales()
            .into_iter()
            .cloned()
            .chain(
                associated_data
                    .associated_data_locales()
                    .into_iter()
                    .cloned(),
            )
            .collect();

        Ok(Arc::new(Entity {
            entity_type: base
                .map(|entity| entity.entity_type.clone())
                .unwrap_or_else(|| schema.name().to_string()),
            primary_key,
            version: base
                .map(|entity| entity.version + 1)
                .unwrap_or(INITIAL_VERSION),
            scope: new_scope
                .unwrap_or_else(|| base.map(|entity| entity.scope).unwrap_or_default()),
            parent: new_parent.unwrap_or_else(|| base.and_then(|entity| entity.parent)),
            locales,
            attributes,
            associated_data,
            references,
            prices,
        }))
    }
}

fn apply_reference_mutation(
    schema: &EntitySchema,
    work_bundles: &mut BTreeMap<String, ReferenceBundle>,
    name: &str,
    mutation: &ReferenceMutation,
) -> Result<bool> {
    match mutation {
        ReferenceMutation::Insert { key, attributes } => {
            verify_reference(schema, name)?;
            let implicit_schema;
            let reference_schema = match schema.reference(name) {
                Some(existing) => existing,
                None => {
                    implicit_schema = ReferenceSchema::new(name, name);
                    &implicit_schema
                }
            };
            match work_bundles.get_mut(name) {
                Some(bundle) => bundle.upsert_with_duplicate_conversion(
                    key,
                    Some(reference_schema),
                    |stored| build_reference(schema, reference_schema, key, attributes, stored),
                ),
                None => {
                    let reference =
                        build_reference(schema, reference_schema, key, attributes, None)?;
                    work_bundles
                        .insert(name.to_string(), ReferenceBundle::non_duplicate(reference)?);
                    Ok(true)
                }
            }
        }

        ReferenceMutation::Remove { key } => {
            let bundle = work_bundles
                .get_mut(name)
                .ok_or_else(|| Error::ReferenceNotPresent {
                    key: key.to_string(),
                })?;
            bundle.remove(key)?;
            Ok(true)
        }

        ReferenceMutation::SetGroup {
            key,
            group_type,
            primary_key,
        } => {
            let fallback = schema
                .reference(name)
                .and_then(|reference| reference.group_type().map(str::to_string));
            let group_type = group_type
                .clone()
                .or(fallback)
                .unwrap_or_else(|| name.to_string());
            let bundle = work_bundles
                .get_mut(name)
                .ok_or_else(|| Error::ReferenceNotPresent {
                    key: key.to_string(),
                })?;
            bundle.update_reference(key, |stored| {
                let group = match stored.group_including_dropped() {
                    Some(group)
                        if group.exists()
                            && group.group_type() == group_type
                            && group.primary_key() == *primary_key =>
                    {
                        group.clone()
                    }
                    Some(group) => ReferenceGroup::from_parts(
                        group_type.clone(),
                        *primary_key,
                        group.version() + 1,
                        false,
                    ),
                    None => ReferenceGroup::new(group_type.clone(), *primary_key),
                };
                let mut updated = stored.clone();
                updated.group = Some(group);
                Ok(updated)
            })
        }

        ReferenceMutation::RemoveGroup { key } => {
            let bundle = work_bundles
                .get_mut(name)
                .ok_or_else(|| Error::ReferenceNotPresent {
                    key: key.to_string(),
                })?;
            bundle.update_reference(key, |stored| match stored.group_including_dropped() {
                Some(group) if group.exists() => {
                    let mut updated = stored.clone();
                    updated.group = Some(ReferenceGroup::from_parts(
                        group.group_type().to_string(),
                        group.primary_key(),
                        group.version() + 1,
                        true,
                    ));
                    Ok(updated)
                }
                _ => Err(Error::MissingValueForRemoval {
                    key: format!("group of {key}"),
                }),
            })
        }

        ReferenceMutation::Attribute { key, mutation } => {
            let implicit_schema;
            let reference_schema = match schema.reference(name) {
                Some(existing) => existing,
                None => {
                    implicit_schema = ReferenceSchema::new(name, name);
                    &implicit_schema
                }
            };
            let bundle = work_bundles
                .get_mut(name)
                .ok_or_else(|| Error::ReferenceNotPresent {
                    key: key.to_string(),
                })?;
            bundle.update_reference(key, |stored| {
                let mut builder = AttributesBuilder::new(
                    schema,
                    Some(reference_schema),
                    Some(Arc::clone(stored.attributes())),
                );
                builder.mutate(mutation.clone())?;
                let attributes = builder.build()?;
                let mut updated = stored.clone();
                updated.attributes = attributes;
                Ok(updated)
            })
        }
    }
}

fn build_reference(
    schema: &EntitySchema,
    reference_schema: &ReferenceSchema,
    key: &ReferenceKey,
    attribute_mutations: &[AttributeMutation],
    base: Option<&Reference>,
) -> Result<Reference> {
    let mut builder = AttributesBuilder::new(
        schema,
        Some(reference_schema),
        base.map(|reference| Arc::clone(reference.attributes())),
    );
    for mutation in attribute_mutations {
        builder.mutate(mutation.clone())?;
    }
    let attributes = builder.build()?;
    Ok(match base {
        Some(stored) => {
            let mut updated = stored.clone();
            updated.attributes = attributes;
            updated.dropped = false;
            updated
        }
        None => Reference::new(key.clone(), attributes),
    })
}

/// Compute the schema mutations a mutation list requires
///
/// Pure analysis of the same evolution rules the mutation engine applies:
/// every unknown item an enabled evolution mode would auto-declare is
/// returned as a proposed [`SchemaMutation`] (deduplicated, in first-use
/// order) for the caller to apply explicitly; an item no evolution mode
/// can legalize is an error.
pub fn schema_evolution_proposals(
    schema: &EntitySchema,
    mutations: &[LocalMutation],
) -> Result<Vec<SchemaMutation>> {
    let mut proposals: Vec<SchemaMutation> = Vec::new();
    for mutation in mutations {
        match mutation {
            LocalMutation::Attribute(AttributeMutation::Upsert { key, value }) => {
                absorb(
                    &mut proposals,
                    verify_attribute(schema, None, key.name(), value.kind(), key.locale())?,
                );
            }
            LocalMutation::AssociatedData(AssociatedDataMutation::Upsert { key, value }) => {
                absorb(
                    &mut proposals,
                    verify_associated_data(schema, key.name(), value.kind(), key.locale())?,
                );
            }
            LocalMutation::Reference(reference_mutation) => {
                let name = reference_mutation.key().name();
                absorb(&mut proposals, verify_reference(schema, name)?);
                let implicit_schema;
                let reference_schema = match schema.reference(name) {
                    Some(existing) => existing,
                    None => {
                        implicit_schema = ReferenceSchema::new(name, name);
                        &implicit_schema
                    }
                };
                let attribute_mutations: Vec<&AttributeMutation> = match reference_mutation {
                    ReferenceMutation::Insert { attributes, .. } => attributes.iter().collect(),
                    ReferenceMutation::Attribute { mutation, .. } => vec![mutation],
                    _ => Vec::new(),
                };
                for attribute_mutation in attribute_mutations {
                    if let AttributeMutation::Upsert { key, value } = attribute_mutation {
                        absorb(
                            &mut proposals,
                            verify_attribute(
                                schema,
                                Some(reference_schema),
                                key.name(),
                                value.kind(),
                                key.locale(),
                            )?,
                        );
                    }
                }
            }
            LocalMutation::Price(PriceMutation::Upsert { key, .. }) => {
                absorb(
                    &mut proposals,
                    verify_price(schema, key.price_list(), key.currency())?,
                );
            }
            _ => {}
        }
    }
    Ok(proposals)
}

fn absorb(proposals: &mut Vec<SchemaMutation>, additions: Vec<SchemaMutation>) {
    for addition in additions {
        if !proposals.contains(&addition) {
            proposals.push(addition);
        }
    }
}

/// Fluent convenience over [`LocalMutation`] values
///
/// Covers both brand-new entities ([`EntityBuilder::new`]) and rebuilds
/// of an existing snapshot ([`EntityBuilder::from_entity`]). Mutations
/// are validated at call time so invalid ones fail fast;
/// [`EntityBuilder::build`] delegates to [`Entity::mutate`] and inherits
/// its identity-preserving no-op guarantee.
#[derive(Debug)]
pub struct EntityBuilder<'a> {
    schema: &'a EntitySchema,
    base: Option<Arc<Entity>>,
    primary_key: Option<u64>,
    mutations: Vec<LocalMutation>,
}

impl<'a> EntityBuilder<'a> {
    /// Builder for a brand-new entity
    pub fn new(schema: &'a EntitySchema, primary_key: Option<u64>) -> Self {
        EntityBuilder {
            schema,
            base: None,
            primary_key,
            mutations: Vec::new(),
        }
    }

    /// Builder wrapping a prior immutable snapshot
    pub fn from_entity(schema: &'a EntitySchema, base: Arc<Entity>) -> Self {
        EntityBuilder {
            schema,
            primary_key: base.primary_key(),
            base: Some(base),
            mutations: Vec::new(),
        }
    }

    /// Register a raw local mutation without builder-side validation
    pub fn mutate(&mut self, mutation: LocalMutation) -> &mut Self {
        self.mutations.push(mutation);
        self
    }

    /// Set a non-localized attribute
    pub fn set_attribute(&mut self, name: &str, value: impl Into<Value>) -> Result<&mut Self> {
        let value = value.into();
        verify_attribute(self.schema, None, name, value.kind(), None)?;
        self.mutations
            .push(LocalMutation::Attribute(AttributeMutation::Upsert {
                key: AttributeKey::global(name),
                value,
            }));
        Ok(self)
    }

    /// Set a localized attribute
    pub fn set_localized_attribute(
        &mut self,
        name: &str,
        locale: Locale,
        value: impl Into<Value>,
    ) -> Result<&mut Self> {
        let value = value.into();
        verify_attribute(self.schema, None, name, value.kind(), Some(&locale))?;
        self.mutations
            .push(LocalMutation::Attribute(AttributeMutation::Upsert {
                key: AttributeKey::localized(name, locale),
                value,
            }));
        Ok(self)
    }

    /// Remove a non-localized attribute
    pub fn remove_attribute(&mut self, name: &str) -> &mut Self {
        self.mutations
            .push(LocalMutation::Attribute(AttributeMutation::Remove {
                key: AttributeKey::global(name),
            }));
        self
    }

    /// Apply a numeric delta to an existing attribute
    pub fn apply_attribute_delta(&mut self, name: &str, delta: Value) -> &mut Self {
        self.mutations
            .push(LocalMutation::Attribute(AttributeMutation::ApplyDelta {
                key: AttributeKey::global(name),
                delta,
            }));
        self
    }

    /// Set a non-localized associated data item
    pub fn set_associated_data(
        &mut self,
        name: &str,
        value: impl Into<Value>,
    ) -> Result<&mut Self> {
        let value = value.into();
        verify_associated_data(self.schema, name, value.kind(), None)?;
        self.mutations
            .push(LocalMutation::AssociatedData(AssociatedDataMutation::Upsert {
                key: AssociatedDataKey::global(name),
                value,
            }));
        Ok(self)
    }

    /// Set a localized associated data item
    pub fn set_localized_associated_data(
        &mut self,
        name: &str,
        locale: Locale,
        value: impl Into<Value>,
    ) -> Result<&mut Self> {
        let value = value.into();
        verify_associated_data(self.schema, name, value.kind(), Some(&locale))?;
        self.mutations
            .push(LocalMutation::AssociatedData(AssociatedDataMutation::Upsert {
                key: AssociatedDataKey::localized(name, locale),
                value,
            }));
        Ok(self)
    }

    /// Remove a non-localized associated data item
    pub fn remove_associated_data(&mut self, name: &str) -> &mut Self {
        self.mutations
            .push(LocalMutation::AssociatedData(AssociatedDataMutation::Remove {
                key: AssociatedDataKey::global(name),
            }));
        self
    }

    /// Insert (or update) a reference without reference attributes
    pub fn insert_reference(&mut self, name: &str, primary_key: u64) -> Result<&mut Self> {
        self.insert_reference_with_attributes(name, primary_key, Vec::new())
    }

    /// Insert (or update) a reference with initial reference attributes
    pub fn insert_reference_with_attributes(
        &mut self,
        name: &str,
        primary_key: u64,
        attributes: Vec<(&str, Value)>,
    ) -> Result<&mut Self> {
        verify_reference(self.schema, name)?;
        let attributes = attributes
            .into_iter()
            .map(|(attribute, value)| AttributeMutation::Upsert {
                key: AttributeKey::global(attribute),
                value,
            })
            .collect();
        self.mutations
            .push(LocalMutation::Reference(ReferenceMutation::Insert {
                key: ReferenceKey::new(name, primary_key),
                attributes,
            }));
        Ok(self)
    }

    /// Soft-remove a reference
    pub fn remove_reference(&mut self, key: ReferenceKey) -> &mut Self {
        self.mutations
            .push(LocalMutation::Reference(ReferenceMutation::Remove { key }));
        self
    }

    /// Set or replace the group of a reference
    pub fn set_reference_group(
        &mut self,
        key: ReferenceKey,
        group_type: Option<&str>,
        primary_key: u64,
    ) -> &mut Self {
        self.mutations
            .push(LocalMutation::Reference(ReferenceMutation::SetGroup {
                key,
                group_type: group_type.map(str::to_string),
                primary_key,
            }));
        self
    }

    /// Remove the group of a reference
    pub fn remove_reference_group(&mut self, key: ReferenceKey) -> &mut Self {
        self.mutations
            .push(LocalMutation::Reference(ReferenceMutation::RemoveGroup { key }));
        self
    }

    /// Mutate a reference-scoped attribute
    pub fn set_reference_attribute(
        &mut self,
        key: ReferenceKey,
        name: &str,
        value: impl Into<Value>,
    ) -> Result<&mut Self> {
        let value = value.into();
        let implicit_schema;
        let reference_schema = match self.schema.reference(key.name()) {
            Some(existing) => existing,
            None => {
                implicit_schema = ReferenceSchema::new(key.name(), key.name());
                &implicit_schema
            }
        };
        verify_attribute(self.schema, Some(reference_schema), name, value.kind(), None)?;
        self.mutations
            .push(LocalMutation::Reference(ReferenceMutation::Attribute {
                key,
                mutation: AttributeMutation::Upsert {
                    key: AttributeKey::global(name),
                    value,
                },
            }));
        Ok(self)
    }

    /// Set a price
    pub fn set_price(&mut self, key: PriceKey, spec: PriceSpec) -> Result<&mut Self> {
        verify_price(self.schema, key.price_list(), key.currency())?;
        self.mutations
            .push(LocalMutation::Price(PriceMutation::Upsert { key, spec }));
        Ok(self)
    }

    /// Soft-remove a price
    pub fn remove_price(&mut self, key: PriceKey) -> &mut Self {
        self.mutations
            .push(LocalMutation::Price(PriceMutation::Remove { key }));
        self
    }

    /// Switch the inner-record handling strategy
    pub fn set_price_inner_record_handling(
        &mut self,
        handling: PriceInnerRecordHandling,
    ) -> &mut Self {
        self.mutations
            .push(LocalMutation::SetPriceInnerRecordHandling { handling });
        self
    }

    /// Set the hierarchical parent
    pub fn set_parent(&mut self, parent: u64) -> &mut Self {
        self.mutations.push(LocalMutation::SetParent { parent });
        self
    }

    /// Remove the hierarchical parent
    pub fn remove_parent(&mut self) -> &mut Self {
        self.mutations.push(LocalMutation::RemoveParent);
        self
    }

    /// Move the entity between scopes
    pub fn set_scope(&mut self, scope: EntityScope) -> &mut Self {
        self.mutations.push(LocalMutation::SetScope { scope });
        self
    }

    /// The mutations registered so far
    pub fn mutations(&self) -> &[LocalMutation] {
        &self.mutations
    }

    /// The upsert mutation to persist, absent when nothing would change
    ///
    /// Creating a brand-new entity is always a change; for an existing
    /// base the registered mutations are applied to probe whether they
    /// net out to the identity-preserving no-op.
    pub fn to_mutation_if_changed(&self) -> Result<Option<EntityUpsertMutation>> {
        if let Some(base) = &self.base {
            let probe =
                Entity::mutate_with_key(self.schema, Some(base), &self.mutations, self.primary_key)?;
            if Arc::ptr_eq(base, &probe) {
                return Ok(None);
            }
        }
        Ok(Some(EntityUpsertMutation {
            entity_type: self.schema.name().to_string(),
            primary_key: self.primary_key,
            mutations: self.mutations.clone(),
        }))
    }

    /// Apply the registered mutations
    pub fn build(&self) -> Result<Arc<Entity>> {
        Entity::mutate_with_key(
            self.schema,
            self.base.as_ref(),
            &self.mutations,
            self.primary_key,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::price::PriceSpec;
    use entidb_core::schema::{AssociatedDataSchema, AttributeSchema, EvolutionMode};
    use entidb_core::{Currency, ValueKind};
    use rust_decimal::Decimal;

    fn czk() -> Currency {
        Currency::new("CZK").unwrap()
    }

    fn english() -> Locale {
        Locale::new("en").unwrap()
    }

    fn schema() -> EntitySchema {
        EntitySchema::new("Product")
            .with_locale(english())
            .with_currency(czk())
            .with_price_list("basic")
            .with_price_list("vip")
            .with_attribute(AttributeSchema::new("code", ValueKind::String))
            .with_attribute(AttributeSchema::new("name", ValueKind::String).localized())
            .with_attribute(AttributeSchema::new("stock", ValueKind::Int))
            .with_associated_data(AssociatedDataSchema::new("note", ValueKind::String))
            .with_reference(
                ReferenceSchema::new("brand", "Brand").with_group_type("BrandGroup"),
            )
            .with_reference(
                ReferenceSchema::new("parameters", "Parameter").with_attribute(
                    AttributeSchema::new("variant", ValueKind::String).representative(),
                ),
            )
    }

    fn upsert_attribute(name: &str, value: impl Into<Value>) -> LocalMutation {
        LocalMutation::Attribute(AttributeMutation::Upsert {
            key: AttributeKey::global(name),
            value: value.into(),
        })
    }

    #[test]
    fn test_new_entity_starts_at_version_one() {
        let schema = schema();
        let entity = Entity::mutate(&schema, None, &[upsert_attribute("code", "A")]).unwrap();
        assert_eq!(entity.version(), 1);
        assert_eq!(entity.attribute("code"), Some(&Value::from("A")));
        assert_eq!(entity.entity_type(), "Product");
        assert_eq!(entity.scope(), EntityScope::Live);
    }

    #[test]
    fn test_noop_mutation_returns_base_instance() {
        let schema = schema();
        let base = Entity::mutate(&schema, None, &[upsert_attribute("code", "A")]).unwrap();
        // semantically equivalent re-set: textually a mutation, but no
        // observable change
        let next =
            Entity::mutate(&schema, Some(&base), &[upsert_attribute("code", "A")]).unwrap();
        assert!(Arc::ptr_eq(&base, &next));
        assert_eq!(next.version(), 1);
    }

    #[test]
    fn test_effective_mutation_bumps_entity_version() {
        let schema = schema();
        let base = Entity::mutate(&schema, None, &[upsert_attribute("code", "A")]).unwrap();
        let next =
            Entity::mutate(&schema, Some(&base), &[upsert_attribute("code", "B")]).unwrap();
        assert_eq!(next.version(), 2);
        assert_eq!(next.attribute("code"), Some(&Value::from("B")));
        // the base snapshot is untouched
        assert_eq!(base.attribute("code"), Some(&Value::from("A")));
    }

    #[test]
    fn test_unmodified_containers_are_structurally_shared() {
        let schema = schema();
        let base = Entity::mutate(
            &schema,
            None,
            &[
                upsert_attribute("code", "A"),
                LocalMutation::AssociatedData(AssociatedDataMutation::Upsert {
                    key: AssociatedDataKey::global("note"),
                    value: Value::from("keep"),
                }),
            ],
        )
        .unwrap();
        let next =
            Entity::mutate(&schema, Some(&base), &[upsert_attribute("code", "B")]).unwrap();
        // associated data was untouched - the very same container instance
        // is reused by the new version
        assert!(Arc::ptr_eq(base.associated_data(), next.associated_data()));
        assert!(Arc::ptr_eq(base.prices(), next.prices()));
        assert!(!Arc::ptr_eq(base.attributes(), next.attributes()));
    }

    #[test]
    fn test_mutations_thread_intermediate_state() {
        let schema = schema();
        let entity = Entity::mutate(
            &schema,
            None,
            &[
                upsert_attribute("stock", 10i64),
                LocalMutation::Attribute(AttributeMutation::ApplyDelta {
                    key: AttributeKey::global("stock"),
                    delta: Value::Int(-3),
                }),
            ],
        )
        .unwrap();
        assert_eq!(entity.attribute("stock"), Some(&Value::Int(7)));
    }

    #[test]
    fn test_parent_and_scope_mutations() {
        let schema = schema();
        let base = Entity::mutate(
            &schema,
            None,
            &[
                LocalMutation::SetParent { parent: 42 },
                LocalMutation::SetScope {
                    scope: EntityScope::Archived,
                },
            ],
        )
        .unwrap();
        assert_eq!(base.parent(), Some(42));
        assert_eq!(base.scope(), EntityScope::Archived);

        // re-setting identical values is a no-op
        let next = Entity::mutate(
            &schema,
            Some(&base),
            &[
                LocalMutation::SetParent { parent: 42 },
                LocalMutation::SetScope {
                    scope: EntityScope::Archived,
                },
            ],
        )
        .unwrap();
        assert!(Arc::ptr_eq(&base, &next));

        let next = Entity::mutate(&schema, Some(&base), &[LocalMutation::RemoveParent]).unwrap();
        assert_eq!(next.parent(), None);
        assert_eq!(next.version(), 2);
    }

    #[test]
    fn test_set_then_remove_parent_nets_to_noop() {
        let schema = schema();
        let base = Entity::mutate(&schema, None, &[upsert_attribute("code", "A")]).unwrap();
        let next = Entity::mutate(
            &schema,
            Some(&base),
            &[
                LocalMutation::SetParent { parent: 7 },
                LocalMutation::RemoveParent,
            ],
        )
        .unwrap();
        assert!(Arc::ptr_eq(&base, &next));
    }

    #[test]
    fn test_reference_insert_and_group() {
        let schema = schema();
        let key = ReferenceKey::new("brand", 5);
        let entity = Entity::mutate(
            &schema,
            None,
            &[
                LocalMutation::Reference(ReferenceMutation::Insert {
                    key: key.clone(),
                    attributes: Vec::new(),
                }),
                LocalMutation::Reference(ReferenceMutation::SetGroup {
                    key: key.clone(),
                    group_type: None,
                    primary_key: 9,
                }),
            ],
        )
        .unwrap();
        let reference = entity.reference(&key).unwrap();
        let group = reference.group().unwrap();
        // the schema's group type is used as the fallback
        assert_eq!(group.group_type(), "BrandGroup");
        assert_eq!(group.primary_key(), 9);
    }

    #[test]
    fn test_reference_noop_insert_is_identity_preserving() {
        let schema = schema();
        let key = ReferenceKey::new("brand", 5);
        let insert = LocalMutation::Reference(ReferenceMutation::Insert {
            key: key.clone(),
            attributes: Vec::new(),
        });
        let base = Entity::mutate(&schema, None, &[insert.clone()]).unwrap();
        let next = Entity::mutate(&schema, Some(&base), &[insert]).unwrap();
        assert!(Arc::ptr_eq(&base, &next));
    }

    #[test]
    fn test_duplicate_reference_flow_through_engine() {
        let schema = schema();
        let insert = |target: u64, variant: &str| {
            LocalMutation::Reference(ReferenceMutation::Insert {
                key: ReferenceKey::new("parameters", target),
                attributes: vec![AttributeMutation::Upsert {
                    key: AttributeKey::global("variant"),
                    value: Value::from(variant),
                }],
            })
        };

        let base = Entity::mutate(&schema, None, &[insert(3, "red")]).unwrap();

        // same target: an in-place update, the bundle stays non-duplicate
        let updated = Entity::mutate(&schema, Some(&base), &[insert(3, "crimson")]).unwrap();
        let bundle = updated.reference_bundle("parameters").unwrap();
        assert_eq!(bundle.mode(), crate::bundle::BundleMode::NonDuplicate);
        assert_eq!(bundle.count(), 1);

        // different target: the bundle converts to duplicate mode
        // transparently
        let converted =
            Entity::mutate(&schema, Some(&updated), &[insert(7, "blue")]).unwrap();
        let bundle = converted.reference_bundle("parameters").unwrap();
        assert_eq!(bundle.mode(), crate::bundle::BundleMode::Duplicate);
        assert_eq!(bundle.count(), 2);

        // a fresh representative tuple for an already-linked target mints
        // a third duplicate member
        let grown =
            Entity::mutate(&schema, Some(&converted), &[insert(3, "green")]).unwrap();
        assert_eq!(grown.reference_bundle("parameters").unwrap().count(), 3);
        assert_eq!(grown.version(), 4);
    }

    #[test]
    fn test_remove_reference_through_engine() {
        let schema = schema();
        let key = ReferenceKey::new("brand", 5);
        let base = Entity::mutate(
            &schema,
            None,
            &[LocalMutation::Reference(ReferenceMutation::Insert {
                key: key.clone(),
                attributes: Vec::new(),
            })],
        )
        .unwrap();
        let next = Entity::mutate(
            &schema,
            Some(&base),
            &[LocalMutation::Reference(ReferenceMutation::Remove {
                key: key.clone(),
            })],
        )
        .unwrap();
        assert!(next.reference(&key).is_none());
        // history is kept: the bundle still holds the dropped link
        let bundle = next.reference_bundle("brand").unwrap();
        assert_eq!(bundle.count(), 0);
        assert_eq!(bundle.references().count(), 1);

        let err = Entity::mutate(
            &schema,
            Some(&next),
            &[LocalMutation::Reference(ReferenceMutation::Remove { key })],
        )
        .unwrap_err();
        assert!(matches!(err, Error::ReferenceNotPresent { .. }));
    }

    #[test]
    fn test_price_mutations_through_engine() {
        let schema = schema();
        let key = PriceKey::new(1, "basic", czk());
        let spec = PriceSpec::new(
            Decimal::from(100),
            Decimal::from(21),
            Decimal::from(121),
        );
        let base = Entity::mutate(
            &schema,
            None,
            &[LocalMutation::Price(PriceMutation::Upsert {
                key: key.clone(),
                spec: spec.clone(),
            })],
        )
        .unwrap();
        assert_eq!(base.prices().count(), 1);

        // identical upsert nets to nothing
        let next = Entity::mutate(
            &schema,
            Some(&base),
            &[LocalMutation::Price(PriceMutation::Upsert {
                key: key.clone(),
                spec,
            })],
        )
        .unwrap();
        assert!(Arc::ptr_eq(&base, &next));

        let next = Entity::mutate(
            &schema,
            Some(&base),
            &[LocalMutation::SetPriceInnerRecordHandling {
                handling: PriceInnerRecordHandling::Sum,
            }],
        )
        .unwrap();
        assert_eq!(
            next.prices().inner_record_handling(),
            PriceInnerRecordHandling::Sum
        );
        assert_eq!(next.prices().version(), 2);
        // attribute container was untouched
        assert!(Arc::ptr_eq(base.attributes(), next.attributes()));
    }

    #[test]
    fn test_ambiguous_prices_rejected_when_entity_is_built() {
        let schema = schema();
        let err = Entity::mutate(
            &schema,
            None,
            &[
                LocalMutation::Price(PriceMutation::Upsert {
                    key: PriceKey::new(1, "basic", czk()),
                    spec: PriceSpec::new(
                        Decimal::from(100),
                        Decimal::from(21),
                        Decimal::from(121),
                    ),
                }),
                LocalMutation::Price(PriceMutation::Upsert {
                    key: PriceKey::new(2, "basic", czk()),
                    spec: PriceSpec::new(
                        Decimal::from(90),
                        Decimal::from(21),
                        Decimal::from(109),
                    ),
                }),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, Error::AmbiguousPrices { .. }));
    }

    #[test]
    fn test_locales_aggregate_from_containers() {
        let schema = schema();
        let entity = Entity::mutate(
            &schema,
            None,
            &[LocalMutation::Attribute(AttributeMutation::Upsert {
                key: AttributeKey::localized("name", english()),
                value: Value::from("Widget"),
            })],
        )
        .unwrap();
        let locales: Vec<_> = entity.locales().collect();
        assert_eq!(locales, vec![&english()]);
    }

    #[test]
    fn test_schema_violation_propagates_from_engine() {
        let schema = schema();
        let err = Entity::mutate(&schema, None, &[upsert_attribute("ean", "x")]).unwrap_err();
        assert!(matches!(err, Error::AttributeNotInSchema { .. }));
    }

    #[test]
    fn test_schema_evolution_proposals_pure_analysis() {
        let schema = schema()
            .with_evolution(EvolutionMode::AddingAttributes)
            .with_evolution(EvolutionMode::AddingLocales);
        let czech = Locale::new("cs").unwrap();
        let mutations = vec![
            upsert_attribute("ean", "123"),
            // the same attribute twice must propose once
            upsert_attribute("ean", "456"),
            LocalMutation::Attribute(AttributeMutation::Upsert {
                key: AttributeKey::localized("name", czech.clone()),
                value: Value::from("Widget"),
            }),
        ];
        let proposals = schema_evolution_proposals(&schema, &mutations).unwrap();
        assert_eq!(proposals.len(), 2);
        assert!(matches!(
            &proposals[0],
            SchemaMutation::CreateAttribute { schema, .. } if schema.name() == "ean"
        ));
        assert!(matches!(
            &proposals[1],
            SchemaMutation::AllowLocale { locale } if locale == &czech
        ));
        // analysis never touches the schema - applying the mutations
        // against the unchanged schema still fails where evolution is off
        let strict = self::schema();
        assert!(schema_evolution_proposals(&strict, &mutations).is_err());
    }

    #[test]
    fn test_builder_to_mutation_if_changed() {
        let schema = schema();
        let mut builder = EntityBuilder::new(&schema, Some(1));
        builder.set_attribute("code", "A").unwrap();
        let mutation = builder.to_mutation_if_changed().unwrap().unwrap();
        assert_eq!(mutation.entity_type, "Product");
        assert_eq!(mutation.primary_key, Some(1));
        assert_eq!(mutation.mutations.len(), 1);

        let base = builder.build().unwrap();
        assert_eq!(base.primary_key(), Some(1));

        // re-setting the current value nets to no change
        let mut builder = EntityBuilder::from_entity(&schema, Arc::clone(&base));
        builder.set_attribute("code", "A").unwrap();
        assert!(builder.to_mutation_if_changed().unwrap().is_none());

        builder.set_attribute("code", "B").unwrap();
        let mutation = builder.to_mutation_if_changed().unwrap().unwrap();
        assert_eq!(mutation.mutations.len(), 2);
    }

    #[test]
    fn test_builder_fluent_flow() {
        let schema = schema();
        let mut builder = EntityBuilder::new(&schema, Some(10));
        builder.set_attribute("code", "A").unwrap();
        builder
            .set_localized_attribute("name", english(), "Widget")
            .unwrap();
        builder.set_associated_data("note", "fragile").unwrap();
        builder.insert_reference("brand", 5).unwrap();
        builder
            .set_price(
                PriceKey::new(1, "basic", czk()),
                PriceSpec::new(Decimal::from(100), Decimal::from(21), Decimal::from(121)),
            )
            .unwrap();
        builder.set_parent(99);
        let entity = builder.build().unwrap();

        assert_eq!(entity.version(), 1);
        assert_eq!(entity.primary_key(), Some(10));
        assert_eq!(entity.parent(), Some(99));
        assert_eq!(entity.attribute("code"), Some(&Value::from("A")));
        assert_eq!(
            entity.attribute_localized("name", &english()),
            Some(&Value::from("Widget"))
        );
        assert_eq!(
            entity.associated_data().associated_data("note"),
            Some(&Value::from("fragile"))
        );
        assert!(entity.reference(&ReferenceKey::new("brand", 5)).is_some());
        assert_eq!(entity.prices().count(), 1);
    }

    #[test]
    fn test_builder_rejects_invalid_mutations_at_call_time() {
        let schema = schema();
        let mut builder = EntityBuilder::new(&schema, None);
        assert!(builder.set_attribute("unknown", "x").is_err());
        assert!(builder.set_attribute("code", 1i64).is_err());
        assert!(builder
            .set_localized_attribute("code", english(), "x")
            .is_err());
        assert!(builder.insert_reference("supplier", 1).is_err());
        // nothing was registered by the failed calls
        assert!(builder.mutations().is_empty());
    }
}
