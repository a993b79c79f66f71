//! Closed hierarchy of local entity mutations
//!
//! Every change to an entity is expressed as a [`LocalMutation`] value.
//! The mutation-application engine in [`crate::entity`] is a single
//! exhaustive match over this enum, which makes "did I handle every
//! mutation kind" a compiler-enforced property.
//!
//! Mutation application follows one rule everywhere: applying a mutation
//! to a value it would not observably change yields the existing value
//! with its version untouched; an effective change yields a new value
//! with the version bumped by one. The engine then filters on the version
//! to decide what actually changed.

use serde::{Deserialize, Serialize};

use entidb_core::{Droppable, Error, Result, Value, Versioned};

use crate::associated_data::{AssociatedDataKey, AssociatedDataValue};
use crate::attributes::{AttributeKey, AttributeValue};
use crate::entity::EntityScope;
use crate::price::{Price, PriceInnerRecordHandling, PriceKey, PriceSpec};
use crate::reference::ReferenceKey;

/// Mutation of a single attribute value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeMutation {
    /// Set the value, creating it when absent
    Upsert {
        /// Key of the attribute
        key: AttributeKey,
        /// New payload
        value: Value,
    },
    /// Soft-remove the value
    Remove {
        /// Key of the attribute
        key: AttributeKey,
    },
    /// Numeric increment/decrement of an existing value
    ///
    /// A delta is not an implicit insert - it fails when no prior live
    /// value exists for the key.
    ApplyDelta {
        /// Key of the attribute
        key: AttributeKey,
        /// Signed delta, same kind as the existing value
        delta: Value,
    },
}

impl AttributeMutation {
    /// Key the mutation targets
    pub fn key(&self) -> &AttributeKey {
        match self {
            AttributeMutation::Upsert { key, .. }
            | AttributeMutation::Remove { key }
            | AttributeMutation::ApplyDelta { key, .. } => key,
        }
    }

    /// Apply the mutation to the existing value (dropped values included)
    pub fn apply(&self, existing: Option<&AttributeValue>) -> Result<AttributeValue> {
        match self {
            AttributeMutation::Upsert { key, value } => match existing {
                None => Ok(AttributeValue::new(key.clone(), value.clone())),
                Some(current) if current.exists() && current.value() == value => {
                    Ok(current.clone())
                }
                Some(current) => Ok(AttributeValue::from_parts(
                    key.clone(),
                    current.version() + 1,
                    value.clone(),
                    false,
                )),
            },
            AttributeMutation::Remove { key } => match existing {
                Some(current) if current.exists() => Ok(AttributeValue::from_parts(
                    key.clone(),
                    current.version() + 1,
                    current.value().clone(),
                    true,
                )),
                _ => Err(Error::MissingValueForRemoval {
                    key: key.to_string(),
                }),
            },
            AttributeMutation::ApplyDelta { key, delta } => match existing {
                Some(current) if current.exists() => {
                    let updated = match (current.value(), delta) {
                        (Value::Int(base), Value::Int(delta)) => Value::Int(base + delta),
                        (Value::Decimal(base), Value::Decimal(delta)) => {
                            Value::Decimal(base + delta)
                        }
                        (base, delta) => {
                            return Err(Error::InvalidValueType {
                                name: key.name().to_string(),
                                expected: base.kind(),
                                actual: delta.kind(),
                            })
                        }
                    };
                    if &updated == current.value() {
                        Ok(current.clone())
                    } else {
                        Ok(AttributeValue::from_parts(
                            key.clone(),
                            current.version() + 1,
                            updated,
                            false,
                        ))
                    }
                }
                _ => Err(Error::MissingValueForDelta {
                    key: key.to_string(),
                }),
            },
        }
    }
}

/// Mutation of a single associated data value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssociatedDataMutation {
    /// Set the value, creating it when absent
    Upsert {
        /// Key of the associated data
        key: AssociatedDataKey,
        /// New payload, composites allowed
        value: Value,
    },
    /// Soft-remove the value
    Remove {
        /// Key of the associated data
        key: AssociatedDataKey,
    },
}

impl AssociatedDataMutation {
    /// Key the mutation targets
    pub fn key(&self) -> &AssociatedDataKey {
        match self {
            AssociatedDataMutation::Upsert { key, .. } | AssociatedDataMutation::Remove { key } => {
                key
            }
        }
    }

    /// Apply the mutation to the existing value (dropped values included)
    pub fn apply(&self, existing: Option<&AssociatedDataValue>) -> Result<AssociatedDataValue> {
        match self {
            AssociatedDataMutation::Upsert { key, value } => match existing {
                None => Ok(AssociatedDataValue::new(key.clone(), value.clone())),
                Some(current) if current.exists() && current.value() == value => {
                    Ok(current.clone())
                }
                Some(current) => Ok(AssociatedDataValue::from_parts(
                    key.clone(),
                    current.version() + 1,
                    value.clone(),
                    false,
                )),
            },
            AssociatedDataMutation::Remove { key } => match existing {
                Some(current) if current.exists() => Ok(AssociatedDataValue::from_parts(
                    key.clone(),
                    current.version() + 1,
                    current.value().clone(),
                    true,
                )),
                _ => Err(Error::MissingValueForRemoval {
                    key: key.to_string(),
                }),
            },
        }
    }
}

/// Mutation of a single reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceMutation {
    /// Insert a reference, or update the one already pointing at the same
    /// target
    ///
    /// Carries the initial reference-scoped attribute mutations so the
    /// representative attribute tuple is known at insertion time - the
    /// reference bundle needs it to distinguish duplicates.
    Insert {
        /// Key of the reference
        key: ReferenceKey,
        /// Reference-scoped attribute mutations applied on insert
        attributes: Vec<AttributeMutation>,
    },
    /// Soft-remove a reference
    Remove {
        /// Key of the reference
        key: ReferenceKey,
    },
    /// Set or replace the group of a reference
    SetGroup {
        /// Key of the reference
        key: ReferenceKey,
        /// Group entity type; falls back to the schema's group type
        group_type: Option<String>,
        /// Primary key of the group entity
        primary_key: u64,
    },
    /// Remove the group of a reference
    RemoveGroup {
        /// Key of the reference
        key: ReferenceKey,
    },
    /// Mutate a reference-scoped attribute
    Attribute {
        /// Key of the reference
        key: ReferenceKey,
        /// The attribute mutation to apply
        mutation: AttributeMutation,
    },
}

impl ReferenceMutation {
    /// Key the mutation targets
    pub fn key(&self) -> &ReferenceKey {
        match self {
            ReferenceMutation::Insert { key, .. }
            | ReferenceMutation::Remove { key }
            | ReferenceMutation::SetGroup { key, .. }
            | ReferenceMutation::RemoveGroup { key }
            | ReferenceMutation::Attribute { key, .. } => key,
        }
    }
}

/// Mutation of a single price
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceMutation {
    /// Set the price, creating it when absent
    Upsert {
        /// Key of the price
        key: PriceKey,
        /// All non-key price data
        spec: PriceSpec,
    },
    /// Soft-remove the price
    Remove {
        /// Key of the price
        key: PriceKey,
    },
}

impl PriceMutation {
    /// Key the mutation targets
    pub fn key(&self) -> &PriceKey {
        match self {
            PriceMutation::Upsert { key, .. } | PriceMutation::Remove { key } => key,
        }
    }

    /// Apply the mutation to the existing price (dropped prices included)
    pub fn apply(&self, existing: Option<&Price>) -> Result<Price> {
        match self {
            PriceMutation::Upsert { key, spec } => match existing {
                None => Ok(Price::new(key.clone(), spec.clone())),
                Some(current) if current.exists() && current.matches_spec(spec) => {
                    Ok(current.clone())
                }
                Some(current) => Ok(Price::from_parts(
                    key.clone(),
                    spec.clone(),
                    current.version() + 1,
                    false,
                )),
            },
            PriceMutation::Remove { key } => match existing {
                Some(current) if current.exists() => Ok(Price::from_parts(
                    key.clone(),
                    current.spec().clone(),
                    current.version() + 1,
                    true,
                )),
                _ => Err(Error::MissingValueForRemoval {
                    key: key.to_string(),
                }),
            },
        }
    }
}

/// One local mutation of an entity
///
/// The closed set of changes [`crate::entity::Entity::mutate`] understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalMutation {
    /// Entity-level attribute mutation
    Attribute(AttributeMutation),
    /// Associated data mutation
    AssociatedData(AssociatedDataMutation),
    /// Reference mutation
    Reference(ReferenceMutation),
    /// Price mutation
    Price(PriceMutation),
    /// Switch the inner-record handling strategy of the price container
    SetPriceInnerRecordHandling {
        /// The new strategy
        handling: PriceInnerRecordHandling,
    },
    /// Set the hierarchical parent of the entity
    SetParent {
        /// Primary key of the parent entity
        parent: u64,
    },
    /// Remove the hierarchical parent of the entity
    RemoveParent,
    /// Move the entity between the live and archived scopes
    SetScope {
        /// The new scope
        scope: EntityScope,
    },
}

/// The upsert mutation the storage layer persists for a changed entity
///
/// Produced by [`crate::entity::EntityBuilder::to_mutation_if_changed`];
/// absent when the builder's mutations net out to no observable change,
/// which the storage layer treats as "nothing to persist".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityUpsertMutation {
    /// Entity type the mutation belongs to
    pub entity_type: String,
    /// Primary key of the entity, absent until assigned
    pub primary_key: Option<u64>,
    /// The ordered local mutations to apply
    pub mutations: Vec<LocalMutation>,
}
