//! Associated data container and builder
//!
//! Structural twin of [`crate::attributes`] for the entity's associated
//! data: values follow the same versioning, drop-marker and
//! copy-on-write rules, but payloads may be arbitrarily complex
//! ([`Value::Object`] composites) because associated data is never
//! indexed. Only entities carry associated data - references do not.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use entidb_core::schema::{verify_associated_data, EntitySchema, SchemaMutation};
use entidb_core::{Droppable, Error, Locale, Result, Value, Version, Versioned, INITIAL_VERSION};

use crate::mutation::AssociatedDataMutation;

/// Key identifying a single associated data value
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AssociatedDataKey {
    name: String,
    locale: Option<Locale>,
}

impl AssociatedDataKey {
    /// Key of a non-localized associated data item
    pub fn global(name: impl Into<String>) -> Self {
        AssociatedDataKey {
            name: name.into(),
            locale: None,
        }
    }

    /// Key of a localized associated data item
    pub fn localized(name: impl Into<String>, locale: Locale) -> Self {
        AssociatedDataKey {
            name: name.into(),
            locale: Some(locale),
        }
    }

    /// Associated data name
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Locale of the value, absent for non-localized items
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
    pub fn as_global(&self) -> AssociatedDataKey {
        AssociatedDataKey::global(self.name.clone())
    }
}

impl fmt::Display for AssociatedDataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.locale {
            Some(locale) => write!(f, "{}:{}", self.name, locale),
            None => f.write_str(&self.name),
        }
    }
}

/// One versioned associated data value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociatedDataValue {
    key: AssociatedDataKey,
    version: Version,
    value: Value,
    dropped: bool,
}

impl AssociatedDataValue {
    /// Create the first version of an associated data value
    pub fn new(key: AssociatedDataKey, value: Value) -> Self {
        AssociatedDataValue {
            key,
            version: INITIAL_VERSION,
            value,
            dropped: false,
        }
    }

    pub(crate) fn from_parts(
        key: AssociatedDataKey,
        version: Version,
        value: Value,
        dropped: bool,
    ) -> Self {
        AssociatedDataValue {
            key,
            version,
            value,
            dropped,
        }
    }

    /// Key of this value
    #[inline]
    pub fn key(&self) -> &AssociatedDataKey {
        &self.key
    }

    /// The payload
    #[inline]
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// True when the observable state differs (version is ignored)
    pub fn differs_from(&self, other: Option<&AssociatedDataValue>) -> bool {
        match other {
            None => true,
            Some(other) => self.value != other.value || self.dropped != other.dropped,
        }
    }
}

impl Versioned for AssociatedDataValue {
    fn version(&self) -> Version {
        self.version
    }
}

impl Droppable for AssociatedDataValue {
    fn dropped(&self) -> bool {
        self.dropped
    }
}

/// Immutable associated data container
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AssociatedData {
    #[serde(with = "value_map_serde")]
    values: BTreeMap<AssociatedDataKey, AssociatedDataValue>,
}

mod value_map_serde {
    //! Same sequence-of-values representation as the attribute container.

    use super::{AssociatedDataKey, AssociatedDataValue};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        values: &BTreeMap<AssociatedDataKey, AssociatedDataValue>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let values: Vec<&AssociatedDataValue> = values.values().collect();
        values.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<AssociatedDataKey, AssociatedDataValue>, D::Error> {
        let values: Vec<AssociatedDataValue> = Vec::deserialize(deserializer)?;
        Ok(values
            .into_iter()
            .map(|value| (value.key().clone(), value))
            .collect())
    }
}

impl AssociatedData {
    /// Create an empty container
    pub fn empty() -> Self {
        AssociatedData {
            values: BTreeMap::new(),
        }
    }

    /// Create a container from pre-built values, dropped ones included
    pub fn from_values(values: impl IntoIterator<Item = AssociatedDataValue>) -> Self {
        AssociatedData {
            values: values
                .into_iter()
                .map(|value| (value.key.clone(), value))
                .collect(),
        }
    }

    /// Live value for the exact key, with non-localized fallback
    pub fn associated_data_value(&self, key: &AssociatedDataKey) -> Option<&AssociatedDataValue> {
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

    /// Live payload of a non-localized item
    pub fn associated_data(&self, name: &str) -> Option<&Value> {
        self.associated_data_value(&AssociatedDataKey::global(name))
            .map(AssociatedDataValue::value)
    }

    /// Live payload of a localized item (with non-localized fallback)
    pub fn associated_data_localized(&self, name: &str, locale: &Locale) -> Option<&Value> {
        self.associated_data_value(&AssociatedDataKey::localized(name, locale.clone()))
            .map(AssociatedDataValue::value)
    }

    pub(crate) fn value_including_dropped(
        &self,
        key: &AssociatedDataKey,
    ) -> Option<&AssociatedDataValue> {
        self.values.get(key)
    }

    /// All live values
    pub fn associated_data_values(&self) -> impl Iterator<Item = &AssociatedDataValue> {
        self.values.values().filter(|value| value.exists())
    }

    pub(crate) fn all_values(&self) -> impl Iterator<Item = &AssociatedDataValue> {
        self.values.values()
    }

    /// Names of all live items
    pub fn associated_data_names(&self) -> BTreeSet<&str> {
        self.associated_data_values()
            .map(|value| value.key.name())
            .collect()
    }

    /// Locales used by live localized values
    pub fn associated_data_locales(&self) -> BTreeSet<&Locale> {
        self.associated_data_values()
            .filter_map(|value| value.key.locale())
            .collect()
    }

    /// Number of live values
    pub fn count(&self) -> usize {
        self.associated_data_values().count()
    }
}

/// Copy-on-write builder over an optional base [`AssociatedData`]
#[derive(Debug)]
pub struct AssociatedDataBuilder<'a> {
    schema: &'a EntitySchema,
    base: Option<Arc<AssociatedData>>,
    mutations: BTreeMap<AssociatedDataKey, AssociatedDataMutation>,
    proposals: Vec<SchemaMutation>,
}

impl<'a> AssociatedDataBuilder<'a> {
    /// Create a builder; `base` absent builds a brand-new container
    pub fn new(schema: &'a EntitySchema, base: Option<Arc<AssociatedData>>) -> Self {
        AssociatedDataBuilder {
            schema,
            base,
            mutations: BTreeMap::new(),
            proposals: Vec::new(),
        }
    }

    /// Set a non-localized item
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<&mut Self> {
        self.upsert(AssociatedDataKey::global(name), value.into())
    }

    /// Set a localized item
    pub fn set_localized(
        &mut self,
        name: &str,
        locale: Locale,
        value: impl Into<Value>,
    ) -> Result<&mut Self> {
        self.upsert(AssociatedDataKey::localized(name, locale), value.into())
    }

    /// Remove a non-localized item
    pub fn remove(&mut self, name: &str) -> Result<&mut Self> {
        self.remove_key(AssociatedDataKey::global(name))
    }

    /// Remove a localized item
    pub fn remove_localized(&mut self, name: &str, locale: Locale) -> Result<&mut Self> {
        self.remove_key(AssociatedDataKey::localized(name, locale))
    }

    /// Register an arbitrary associated data mutation
    pub fn mutate(&mut self, mutation: AssociatedDataMutation) -> Result<&mut Self> {
        match mutation {
            AssociatedDataMutation::Upsert { key, value } => self.upsert(key, value),
            AssociatedDataMutation::Remove { key } => self.remove_key(key),
        }
    }

    fn upsert(&mut self, key: AssociatedDataKey, value: Value) -> Result<&mut Self> {
        let proposals =
            verify_associated_data(self.schema, key.name(), value.kind(), key.locale())?;
        for proposal in proposals {
            if !self.proposals.contains(&proposal) {
                self.proposals.push(proposal);
            }
        }
        self.mutations
            .insert(key.clone(), AssociatedDataMutation::Upsert { key, value });
        Ok(self)
    }

    fn remove_key(&mut self, key: AssociatedDataKey) -> Result<&mut Self> {
        let exists_in_base = self
            .base
            .as_ref()
            .and_then(|base| base.value_including_dropped(&key))
            .map(|value| value.exists())
            .unwrap_or(false);
        let pending_upsert = matches!(
            self.mutations.get(&key),
            Some(AssociatedDataMutation::Upsert { .. })
        );
        if !exists_in_base && !pending_upsert {
            return Err(Error::MissingValueForRemoval {
                key: key.to_string(),
            });
        }
        if exists_in_base {
            self.mutations
                .insert(key.clone(), AssociatedDataMutation::Remove { key });
        } else {
            self.mutations.remove(&key);
        }
        Ok(self)
    }

    /// Live payload of a non-localized item as the builder sees it
    pub fn get(&self, name: &str) -> Option<Value> {
        let key = AssociatedDataKey::global(name);
        let existing = self
            .base
            .as_ref()
            .and_then(|base| base.value_including_dropped(&key));
        match self.mutations.get(&key) {
            Some(mutation) => mutation
                .apply(existing)
                .ok()
                .filter(|value| value.exists())
                .map(|value| value.value().clone()),
            None => existing
                .filter(|value| value.exists())
                .map(|value| value.value().clone()),
        }
    }

    /// Schema mutations proposed by the mutations registered so far
    pub fn schema_mutations(&self) -> &[SchemaMutation] {
        &self.proposals
    }

    /// Net effective mutations relative to the base snapshot
    pub fn build_change_set(&self) -> Vec<AssociatedDataMutation> {
        self.mutations
            .iter()
            .filter(|(key, mutation)| {
                let existing = self
                    .base
                    .as_ref()
                    .and_then(|base| base.value_including_dropped(key));
                match mutation.apply(existing) {
                    Ok(applied) => applied.differs_from(existing),
                    Err(_) => false,
                }
            })
            .map(|(_, mutation)| mutation.clone())
            .collect()
    }

    /// Build the immutable container; identity-preserving on no-op
    pub fn build(self) -> Result<Arc<AssociatedData>> {
        let mut effective: BTreeMap<AssociatedDataKey, AssociatedDataValue> = BTreeMap::new();
        for (key, mutation) in &self.mutations {
            let existing = self
                .base
                .as_ref()
                .and_then(|base| base.value_including_dropped(key));
            let applied = mutation.apply(existing)?;
            if applied.differs_from(existing) {
                effective.insert(key.clone(), applied);
            }
        }

        if effective.is_empty() {
            return Ok(match self.base {
                Some(base) => base,
                None => Arc::new(AssociatedData::empty()),
            });
        }

        let merged = self
            .base
            .iter()
            .flat_map(|base| base.all_values())
            .filter(|value| !effective.contains_key(value.key()))
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .chain(effective.into_values());
        Ok(Arc::new(AssociatedData::from_values(merged)))
    }
}
