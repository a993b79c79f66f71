//! Attribute container and its copy-on-write builder
//!
//! Attributes are the typed, optionally localized key/value data of an
//! entity (or of a single reference). The immutable [`Attributes`]
//! container holds every [`AttributeValue`] ever written - dropped values
//! included - while all live reads filter on [`Droppable::exists`].
//!
//! [`AttributesBuilder`] is the mutable scratch object: it accumulates
//! [`AttributeMutation`]s, validates them against the schema at mutation
//! time (fail fast), and finally rebuilds the container. A build that
//! changes nothing observable returns the base container `Arc` untouched,
//! so upstream change detection can rely on pointer identity.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use entidb_core::schema::{verify_attribute, EntitySchema, ReferenceSchema, SchemaMutation};
use entidb_core::{Droppable, Error, Locale, Result, Value, Version, Versioned, INITIAL_VERSION};

use crate::mutation::AttributeMutation;

/// Key identifying a single attribute value within one container
///
/// At most one value exists per key; localized attributes hold one value
/// per (name, locale) pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttributeKey {
    name: String,
    locale: Option<Locale>,
}

impl AttributeKey {
    /// Key of a non-localized attribute
    pub fn global(name: impl Into<String>) -> Self {
        AttributeKey {
            name: name.into(),
            locale: None,
        }
    }

    /// Key of a localized attribute
    pub fn localized(name: impl Into<String>, locale: Locale) -> Self {
        AttributeKey {
            name: name.into(),
            locale: Some(locale),
        }
    }

    /// Attribute name
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Locale of the value, absent for non-localized attributes
    #[inline]
    pub fn locale(&self) -> Option<&Locale> {
        self.locale.as_ref()
    }

    /// True when the key carries a locale
    #[inline]
    pub fn is_localized(&self) -> bool {
        self.locale.is_some()
    }

    /// The same key stripped of its locale
    pub fn as_global(&self) -> AttributeKey {
        AttributeKey::global(self.name.clone())
    }
}

impl fmt::Display for AttributeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.locale {
            Some(locale) => write!(f, "{}:{}", self.name, locale),
            None => f.write_str(&self.name),
        }
    }
}

/// One versioned attribute value
///
/// ## Invariants
///
/// - `version` starts at 1 and strictly increases on every effective change
/// - Removal never deletes the value - it sets `dropped` and bumps the
///   version, keeping the history reachable for change detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeValue {
    key: AttributeKey,
    version: Version,
    value: Value,
    dropped: bool,
}

impl AttributeValue {
    /// Create the first version of an attribute value
    pub fn new(key: AttributeKey, value: Value) -> Self {
        AttributeValue {
            key,
            version: INITIAL_VERSION,
            value,
            dropped: false,
        }
    }

    pub(crate) fn from_parts(key: AttributeKey, version: Version, value: Value, dropped: bool) -> Self {
        AttributeValue {
            key,
            version,
            value,
            dropped,
        }
    }

    /// Key of this value
    #[inline]
    pub fn key(&self) -> &AttributeKey {
        &self.key
    }

    /// The payload
    #[inline]
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// True when the observable state of `self` differs from `other`
    ///
    /// Versions are deliberately ignored - two values differ when their
    /// payload or liveness differs.
    pub fn differs_from(&self, other: Option<&AttributeValue>) -> bool {
        match other {
            None => true,
            Some(other) => self.value != other.value || self.dropped != other.dropped,
        }
    }
}

impl Versioned for AttributeValue {
    fn version(&self) -> Version {
        self.version
    }
}

impl Droppable for AttributeValue {
    fn dropped(&self) -> bool {
        self.dropped
    }
}

/// Immutable attribute container
///
/// Safe to share freely across threads once built; builders never mutate
/// an existing container, they produce a new one (or return the original
/// on a no-op rebuild).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Attributes {
    #[serde(with = "value_map_serde")]
    values: BTreeMap<AttributeKey, AttributeValue>,
}

mod value_map_serde {
    //! Attribute values are keyed by a composite key, which
    //! self-describing formats cannot express as map keys; the map
    //! travels as a sequence of values carrying their keys.

    use super::{AttributeKey, AttributeValue};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        values: &BTreeMap<AttributeKey, AttributeValue>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let values: Vec<&AttributeValue> = values.values().collect();
        values.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<AttributeKey, AttributeValue>, D::Error> {
        let values: Vec<AttributeValue> = Vec::deserialize(deserializer)?;
        Ok(values
            .into_iter()
            .map(|value| (value.key().clone(), value))
            .collect())
    }
}

impl Attributes {
    /// Create an empty container
    pub fn empty() -> Self {
        Attributes {
            values: BTreeMap::new(),
        }
    }

    /// Create a container from pre-built values, dropped ones included
    pub fn from_values(values: impl IntoIterator<Item = AttributeValue>) -> Self {
        Attributes {
            values: values
                .into_iter()
                .map(|value| (value.key.clone(), value))
                .collect(),
        }
    }

    /// Live value for the exact key, falling back to the non-localized
    /// key when a localized lookup misses
    pub fn attribute_value(&self, key: &AttributeKey) -> Option<&AttributeValue> {
        self.values
            .get(key)
            .filter(|value| value.exists())
            .or_else(|| {
                if key.is_localized() {
                    self.values
                        .get(&key.as_global())
                        .filter(|value| value.exists())
                } else {
                    None
                }
            })
    }

    /// Live payload of a non-localized attribute
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attribute_value(&AttributeKey::global(name))
            .map(AttributeValue::value)
    }

    /// Live payload of a localized attribute (with non-localized fallback)
    pub fn attribute_localized(&self, name: &str, locale: &Locale) -> Option<&Value> {
        self.attribute_value(&AttributeKey::localized(name, locale.clone()))
            .map(AttributeValue::value)
    }

    /// Value for the exact key, dropped values included
    pub(crate) fn attribute_value_including_dropped(
        &self,
        key: &AttributeKey,
    ) -> Option<&AttributeValue> {
        self.values.get(key)
    }

    /// All live values
    pub fn attribute_values(&self) -> impl Iterator<Item = &AttributeValue> {
        self.values.values().filter(|value| value.exists())
    }

    /// Every stored value, dropped ones included
    pub(crate) fn all_values(&self) -> impl Iterator<Item = &AttributeValue> {
        self.values.values()
    }

    /// Names of all live attributes
    pub fn attribute_names(&self) -> BTreeSet<&str> {
        self.attribute_values()
            .map(|value| value.key.name())
            .collect()
    }

    /// Keys of all live attributes
    pub fn attribute_keys(&self) -> impl Iterator<Item = &AttributeKey> {
        self.attribute_values().map(AttributeValue::key)
    }

    /// Locales used by live localized values
    pub fn attribute_locales(&self) -> BTreeSet<&Locale> {
        self.attribute_values()
            .filter_map(|value| value.key.locale())
            .collect()
    }

    /// Number of live values
    pub fn count(&self) -> usize {
        self.attribute_values().count()
    }
}

/// Copy-on-write builder over an optional base [`Attributes`] container
///
/// One builder type covers both cases: a fresh container (`base` absent)
/// and the rebuild of an existing snapshot. Schema validation runs at
/// mutation time; schema-evolution proposals accumulate in the builder
/// and are surfaced through [`AttributesBuilder::schema_mutations`].
#[derive(Debug)]
pub struct AttributesBuilder<'a> {
    entity_schema: &'a EntitySchema,
    reference_schema: Option<&'a ReferenceSchema>,
    base: Option<Arc<Attributes>>,
    mutations: BTreeMap<AttributeKey, AttributeMutation>,
    proposals: Vec<SchemaMutation>,
}

impl<'a> AttributesBuilder<'a> {
    /// Create a builder
    ///
    /// `reference_schema` scopes validation to reference attributes;
    /// `base` is the snapshot being rebuilt, absent for a brand-new
    /// container.
    pub fn new(
        entity_schema: &'a EntitySchema,
        reference_schema: Option<&'a ReferenceSchema>,
        base: Option<Arc<Attributes>>,
    ) -> Self {
        AttributesBuilder {
            entity_schema,
            reference_schema,
            base,
            mutations: BTreeMap::new(),
            proposals: Vec::new(),
        }
    }

    /// Set a non-localized attribute
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<&mut Self> {
        self.upsert(AttributeKey::global(name), value.into())
    }

    /// Set a localized attribute
    pub fn set_localized(
        &mut self,
        name: &str,
        locale: Locale,
        value: impl Into<Value>,
    ) -> Result<&mut Self> {
        self.upsert(AttributeKey::localized(name, locale), value.into())
    }

    /// Remove a non-localized attribute
    pub fn remove(&mut self, name: &str) -> Result<&mut Self> {
        self.remove_key(AttributeKey::global(name))
    }

    /// Remove a localized attribute
    pub fn remove_localized(&mut self, name: &str, locale: Locale) -> Result<&mut Self> {
        self.remove_key(AttributeKey::localized(name, locale))
    }

    /// Register an arbitrary attribute mutation
    pub fn mutate(&mut self, mutation: AttributeMutation) -> Result<&mut Self> {
        match mutation {
            AttributeMutation::Upsert { key, value } => self.upsert(key, value),
            AttributeMutation::Remove { key } => self.remove_key(key),
            AttributeMutation::ApplyDelta { key, delta } => self.apply_delta(key, delta),
        }
    }

    fn upsert(&mut self, key: AttributeKey, value: Value) -> Result<&mut Self> {
        let proposals = verify_attribute(
            self.entity_schema,
            self.reference_schema,
            key.name(),
            value.kind(),
            key.locale(),
        )?;
        self.absorb_proposals(proposals);
        self.mutations
            .insert(key.clone(), AttributeMutation::Upsert { key, value });
        Ok(self)
    }

    fn remove_key(&mut self, key: AttributeKey) -> Result<&mut Self> {
        let exists_in_base = self
            .base
            .as_ref()
            .and_then(|base| base.attribute_value_including_dropped(&key))
            .map(|value| value.exists())
            .unwrap_or(false);
        let pending_upsert = matches!(
            self.mutations.get(&key),
            Some(AttributeMutation::Upsert { .. })
        );
        if !exists_in_base && !pending_upsert {
            return Err(Error::MissingValueForRemoval {
                key: key.to_string(),
            });
        }
        if exists_in_base {
            self.mutations
                .insert(key.clone(), AttributeMutation::Remove { key });
        } else {
            // the value only ever existed as a pending upsert; cancel it
            self.mutations.remove(&key);
        }
        Ok(self)
    }

    fn apply_delta(&mut self, key: AttributeKey, delta: Value) -> Result<&mut Self> {
        let current = self.value_view(&key);
        match current {
            None => Err(Error::MissingValueForDelta {
                key: key.to_string(),
            }),
            Some(current) => {
                let delta_mutation = AttributeMutation::ApplyDelta {
                    key: key.clone(),
                    delta,
                };
                let updated = delta_mutation.apply(Some(&current))?;
                if self.mutations.contains_key(&key) {
                    // fold the delta into the pending mutation
                    self.mutations.insert(
                        key.clone(),
                        AttributeMutation::Upsert {
                            key,
                            value: updated.value().clone(),
                        },
                    );
                } else {
                    self.mutations.insert(key, delta_mutation);
                }
                Ok(self)
            }
        }
    }

    /// Live payload of a non-localized attribute as the builder sees it
    pub fn get(&self, name: &str) -> Option<Value> {
        self.value_view(&AttributeKey::global(name))
            .filter(|value| value.exists())
            .map(|value| value.value().clone())
    }

    /// Live payload of a localized attribute as the builder sees it
    pub fn get_localized(&self, name: &str, locale: &Locale) -> Option<Value> {
        self.value_view(&AttributeKey::localized(name, locale.clone()))
            .filter(|value| value.exists())
            .map(|value| value.value().clone())
    }

    /// Schema mutations proposed by the mutations registered so far
    pub fn schema_mutations(&self) -> &[SchemaMutation] {
        &self.proposals
    }

    /// Net effective mutations relative to the base snapshot
    ///
    /// Mutations that would not change the observable state of their key
    /// are omitted. Deterministic key order.
    pub fn build_change_set(&self) -> Vec<AttributeMutation> {
        self.mutations
            .iter()
            .filter(|(key, mutation)| {
                let existing = self
                    .base
                    .as_ref()
                    .and_then(|base| base.attribute_value_including_dropped(key));
                match mutation.apply(existing) {
                    Ok(applied) => applied.differs_from(existing),
                    Err(_) => false,
                }
            })
            .map(|(_, mutation)| mutation.clone())
            .collect()
    }

    /// True when the given container is not the builder's base snapshot
    ///
    /// Pass the output of [`AttributesBuilder::build`] to learn whether
    /// anything was changed.
    pub fn differs(&self, built: &Arc<Attributes>) -> bool {
        match &self.base {
            Some(base) => !Arc::ptr_eq(base, built),
            None => true,
        }
    }

    /// Build the immutable container
    ///
    /// Returns the base `Arc` untouched when no registered mutation
    /// changes observable state.
    pub fn build(self) -> Result<Arc<Attributes>> {
        let mut effective: BTreeMap<AttributeKey, AttributeValue> = BTreeMap::new();
        for (key, mutation) in &self.mutations {
            let existing = self
                .base
                .as_ref()
                .and_then(|base| base.attribute_value_including_dropped(key));
            let applied = mutation.apply(existing)?;
            if applied.differs_from(existing) {
                effective.insert(key.clone(), applied);
            }
        }

        if effective.is_empty() {
            return Ok(match self.base {
                Some(base) => base,
                None => Arc::new(Attributes::empty()),
            });
        }

        tracing::debug!(
            changed = effective.len(),
            "rebuilding attribute container"
        );
        let merged = self
            .base
            .iter()
            .flat_map(|base| base.all_values())
            .filter(|value| !effective.contains_key(value.key()))
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .chain(effective.into_values());
        Ok(Arc::new(Attributes::from_values(merged)))
    }

    fn value_view(&self, key: &AttributeKey) -> Option<AttributeValue> {
        let existing = self
            .base
            .as_ref()
            .and_then(|base| base.attribute_value_including_dropped(key));
        match self.mutations.get(key) {
            Some(mutation) => mutation.apply(existing).ok(),
            None => existing.cloned(),
        }
    }

    fn absorb_proposals(&mut self, proposals: Vec<SchemaMutation>) {
        for proposal in proposals {
            if !self.proposals.contains(&proposal) {
                self.proposals.push(proposal);
            }
        }
    }
}
