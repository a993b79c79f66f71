//! Schema contract consulted by the data model
//!
//! The core never owns schema evolution - it consults a read-only
//! [`EntitySchema`] snapshot provided by the surrounding engine and, where
//! the schema's evolution modes permit an on-demand extension, it returns
//! *proposed* [`SchemaMutation`] commands for the caller to apply
//! explicitly. Validation never mutates shared schema state.
//!
//! ## Module Structure
//!
//! - [`EntitySchema`]: the per-entity-type schema snapshot (definitions,
//!   whitelists, evolution modes)
//! - [`AttributeSchema`] / [`AssociatedDataSchema`] / [`ReferenceSchema`]:
//!   per-item definitions
//! - [`EvolutionMode`]: which unknown items may be auto-declared
//! - [`SchemaMutation`]: proposed schema changes returned by verification
//! - `verify_*`: pure verification helpers used at mutation time

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::ident::{Currency, Locale};
use crate::value::ValueKind;

/// Evolution modes governing which unknown items the schema accepts
///
/// When a mutation touches an item the schema does not know, the matching
/// evolution mode decides between rejection and an auto-declaration
/// proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EvolutionMode {
    /// Unknown attribute names may be auto-declared
    AddingAttributes,
    /// Unknown associated data names may be auto-declared
    AddingAssociatedData,
    /// Unknown relationship names may be auto-declared
    AddingReferences,
    /// Unknown price lists may be whitelisted
    AddingPrices,
    /// Unknown locales may be whitelisted
    AddingLocales,
    /// Unknown currencies may be whitelisted
    AddingCurrencies,
}

/// Definition of a single attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSchema {
    name: String,
    value_type: ValueKind,
    localized: bool,
    nullable: bool,
    representative: bool,
}

impl AttributeSchema {
    /// Create a non-localized, non-representative attribute definition
    pub fn new(name: impl Into<String>, value_type: ValueKind) -> Self {
        AttributeSchema {
            name: name.into(),
            value_type,
            localized: false,
            nullable: true,
            representative: false,
        }
    }

    /// Definition created on the fly for an unknown attribute accepted
    /// through the `AddingAttributes` evolution mode
    pub fn implicit(name: impl Into<String>, value_type: ValueKind, localized: bool) -> Self {
        AttributeSchema {
            name: name.into(),
            value_type,
            localized,
            nullable: true,
            representative: false,
        }
    }

    /// Mark the attribute as localized
    pub fn localized(mut self) -> Self {
        self.localized = true;
        self
    }

    /// Mark the attribute as non-nullable
    pub fn non_nullable(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Mark the attribute as identity-relevant for duplicate references
    pub fn representative(mut self) -> Self {
        self.representative = true;
        self
    }

    /// Attribute name
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared value type
    #[inline]
    pub fn value_type(&self) -> ValueKind {
        self.value_type
    }

    /// True when values of this attribute are keyed by locale
    #[inline]
    pub fn is_localized(&self) -> bool {
        self.localized
    }

    /// True when the attribute may be absent
    #[inline]
    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// True when the attribute distinguishes duplicate references
    #[inline]
    pub fn is_representative(&self) -> bool {
        self.representative
    }
}

/// Definition of a single associated data item
///
/// Unlike attributes, associated data may hold composite
/// ([`ValueKind::Object`]) payloads - it is never indexed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociatedDataSchema {
    name: String,
    value_type: ValueKind,
    localized: bool,
    nullable: bool,
}

impl AssociatedDataSchema {
    /// Create a non-localized associated data definition
    pub fn new(name: impl Into<String>, value_type: ValueKind) -> Self {
        AssociatedDataSchema {
            name: name.into(),
            value_type,
            localized: false,
            nullable: true,
        }
    }

    /// Definition created on the fly through `AddingAssociatedData`
    pub fn implicit(name: impl Into<String>, value_type: ValueKind, localized: bool) -> Self {
        AssociatedDataSchema {
            name: name.into(),
            value_type,
            localized,
            nullable: true,
        }
    }

    /// Mark the associated data as localized
    pub fn localized(mut self) -> Self {
        self.localized = true;
        self
    }

    /// Associated data name
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared value type
    #[inline]
    pub fn value_type(&self) -> ValueKind {
        self.value_type
    }

    /// True when values are keyed by locale
    #[inline]
    pub fn is_localized(&self) -> bool {
        self.localized
    }
}

/// Definition of a single relationship
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSchema {
    name: String,
    referenced_entity_type: String,
    group_type: Option<String>,
    attributes: BTreeMap<String, AttributeSchema>,
}

impl ReferenceSchema {
    /// Create a relationship definition without reference attributes
    pub fn new(name: impl Into<String>, referenced_entity_type: impl Into<String>) -> Self {
        ReferenceSchema {
            name: name.into(),
            referenced_entity_type: referenced_entity_type.into(),
            group_type: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Set the entity type of the optional reference group
    pub fn with_group_type(mut self, group_type: impl Into<String>) -> Self {
        self.group_type = Some(group_type.into());
        self
    }

    /// Add a reference-scoped attribute definition
    pub fn with_attribute(mut self, attribute: AttributeSchema) -> Self {
        self.attributes.insert(attribute.name().to_string(), attribute);
        self
    }

    /// Relationship name
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entity type the relationship points at
    #[inline]
    pub fn referenced_entity_type(&self) -> &str {
        &self.referenced_entity_type
    }

    /// Entity type of the optional reference group
    #[inline]
    pub fn group_type(&self) -> Option<&str> {
        self.group_type.as_deref()
    }

    /// Look up a reference-scoped attribute definition
    pub fn attribute(&self, name: &str) -> Option<&AttributeSchema> {
        self.attributes.get(name)
    }

    /// All reference-scoped attribute definitions
    pub fn attributes(&self) -> impl Iterator<Item = &AttributeSchema> {
        self.attributes.values()
    }

    /// Names of the attributes marked identity-relevant for duplicate
    /// references, in deterministic (lexicographic) order
    pub fn representative_attributes(&self) -> Vec<&str> {
        self.attributes
            .values()
            .filter(|schema| schema.is_representative())
            .map(AttributeSchema::name)
            .collect()
    }
}

/// Read-only schema snapshot for one entity type
///
/// ## Invariants
///
/// - Definitions, whitelists and evolution modes never change through the
///   data model - schema evolution happens in the surrounding engine by
///   applying [`SchemaMutation`] proposals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    name: String,
    locales: BTreeSet<Locale>,
    currencies: BTreeSet<Currency>,
    price_lists: BTreeSet<String>,
    evolution: BTreeSet<EvolutionMode>,
    attributes: BTreeMap<String, AttributeSchema>,
    associated_data: BTreeMap<String, AssociatedDataSchema>,
    references: BTreeMap<String, ReferenceSchema>,
}

impl EntitySchema {
    /// Create an empty schema for the given entity type
    pub fn new(name: impl Into<String>) -> Self {
        EntitySchema {
            name: name.into(),
            locales: BTreeSet::new(),
            currencies: BTreeSet::new(),
            price_lists: BTreeSet::new(),
            evolution: BTreeSet::new(),
            attributes: BTreeMap::new(),
            associated_data: BTreeMap::new(),
            references: BTreeMap::new(),
        }
    }

    /// Whitelist a locale
    pub fn with_locale(mut self, locale: Locale) -> Self {
        self.locales.insert(locale);
        self
    }

    /// Whitelist a currency
    pub fn with_currency(mut self, currency: Currency) -> Self {
        self.currencies.insert(currency);
        self
    }

    /// Whitelist a price list
    pub fn with_price_list(mut self, price_list: impl Into<String>) -> Self {
        self.price_lists.insert(price_list.into());
        self
    }

    /// Enable an evolution mode
    pub fn with_evolution(mut self, mode: EvolutionMode) -> Self {
        self.evolution.insert(mode);
        self
    }

    /// Add an attribute definition
    pub fn with_attribute(mut self, attribute: AttributeSchema) -> Self {
        self.attributes.insert(attribute.name().to_string(), attribute);
        self
    }

    /// Add an associated data definition
    pub fn with_associated_data(mut self, associated_data: AssociatedDataSchema) -> Self {
        self.associated_data
            .insert(associated_data.name().to_string(), associated_data);
        self
    }

    /// Add a relationship definition
    pub fn with_reference(mut self, reference: ReferenceSchema) -> Self {
        self.references.insert(reference.name().to_string(), reference);
        self
    }

    /// Entity type name
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check whether an evolution mode is enabled
    pub fn allows(&self, mode: EvolutionMode) -> bool {
        self.evolution.contains(&mode)
    }

    /// Check whether a locale is whitelisted
    pub fn supports_locale(&self, locale: &Locale) -> bool {
        self.locales.contains(locale)
    }

    /// Check whether a currency is whitelisted
    pub fn supports_currency(&self, currency: &Currency) -> bool {
        self.currencies.contains(currency)
    }

    /// Check whether a price list is whitelisted
    pub fn knows_price_list(&self, price_list: &str) -> bool {
        self.price_lists.contains(price_list)
    }

    /// Whitelisted locales
    pub fn locales(&self) -> impl Iterator<Item = &Locale> {
        self.locales.iter()
    }

    /// Whitelisted currencies
    pub fn currencies(&self) -> impl Iterator<Item = &Currency> {
        self.currencies.iter()
    }

    /// Look up an attribute definition
    pub fn attribute(&self, name: &str) -> Option<&AttributeSchema> {
        self.attributes.get(name)
    }

    /// Look up an associated data definition
    pub fn associated_data(&self, name: &str) -> Option<&AssociatedDataSchema> {
        self.associated_data.get(name)
    }

    /// Look up a relationship definition
    pub fn reference(&self, name: &str) -> Option<&ReferenceSchema> {
        self.references.get(name)
    }
}

/// Proposed schema change returned by verification
///
/// The core never applies these - the caller decides whether and when the
/// schema evolves, which keeps evolution auditable and testable in
/// isolation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaMutation {
    /// Declare a new attribute, either on the entity or on a reference
    CreateAttribute {
        /// Relationship the attribute is scoped to, entity-level when absent
        reference: Option<String>,
        /// The implied definition
        schema: AttributeSchema,
    },
    /// Declare a new associated data item
    CreateAssociatedData {
        /// The implied definition
        schema: AssociatedDataSchema,
    },
    /// Declare a new relationship
    CreateReference {
        /// The implied definition
        schema: ReferenceSchema,
    },
    /// Whitelist a locale
    AllowLocale {
        /// Locale to whitelist
        locale: Locale,
    },
    /// Whitelist a currency
    AllowCurrency {
        /// Currency to whitelist
        currency: Currency,
    },
    /// Whitelist a price list
    AllowPriceList {
        /// Price list to whitelist
        price_list: String,
    },
}

// ============================================================================
// Verification helpers
// ============================================================================

/// Verify an attribute mutation against the schema
///
/// `reference` scopes the lookup to reference attributes when present.
/// On success returns the schema mutations that would make the mutation
/// fully schema-legal (empty when it already is).
pub fn verify_attribute(
    schema: &EntitySchema,
    reference: Option<&ReferenceSchema>,
    name: &str,
    kind: ValueKind,
    locale: Option<&Locale>,
) -> Result<Vec<SchemaMutation>> {
    if kind == ValueKind::Object {
        return Err(Error::CompositeAttributeValue {
            name: name.to_string(),
        });
    }

    let mut proposals = Vec::new();
    let definition = match reference {
        Some(reference_schema) => reference_schema.attribute(name),
        None => schema.attribute(name),
    };
    match definition {
        Some(definition) => {
            if definition.value_type() != kind {
                return Err(Error::InvalidValueType {
                    name: name.to_string(),
                    expected: definition.value_type(),
                    actual: kind,
                });
            }
            match locale {
                None if definition.is_localized() => {
                    return Err(Error::ExpectedLocalizedValue {
                        name: name.to_string(),
                    });
                }
                Some(_) if !definition.is_localized() => {
                    return Err(Error::UnexpectedLocalizedValue {
                        name: name.to_string(),
                    });
                }
                _ => {}
            }
        }
        None => {
            if !schema.allows(EvolutionMode::AddingAttributes) {
                return Err(Error::AttributeNotInSchema {
                    name: name.to_string(),
                    entity_type: schema.name().to_string(),
                });
            }
            proposals.push(SchemaMutation::CreateAttribute {
                reference: reference.map(|r| r.name().to_string()),
                schema: AttributeSchema::implicit(name, kind, locale.is_some()),
            });
        }
    }

    if let Some(locale) = locale {
        verify_locale(schema, locale, &mut proposals)?;
    }
    Ok(proposals)
}

/// Verify an associated data mutation against the schema
pub fn verify_associated_data(
    schema: &EntitySchema,
    name: &str,
    kind: ValueKind,
    locale: Option<&Locale>,
) -> Result<Vec<SchemaMutation>> {
    let mut proposals = Vec::new();
    match schema.associated_data(name) {
        Some(definition) => {
            if definition.value_type() != kind {
                return Err(Error::InvalidValueType {
                    name: name.to_string(),
                    expected: definition.value_type(),
                    actual: kind,
                });
            }
            match locale {
                None if definition.is_localized() => {
                    return Err(Error::ExpectedLocalizedValue {
                        name: name.to_string(),
                    });
                }
                Some(_) if !definition.is_localized() => {
                    return Err(Error::UnexpectedLocalizedValue {
                        name: name.to_string(),
                    });
                }
                _ => {}
            }
        }
        None => {
            if !schema.allows(EvolutionMode::AddingAssociatedData) {
                return Err(Error::AssociatedDataNotInSchema {
                    name: name.to_string(),
                    entity_type: schema.name().to_string(),
                });
            }
            proposals.push(SchemaMutation::CreateAssociatedData {
                schema: AssociatedDataSchema::implicit(name, kind, locale.is_some()),
            });
        }
    }

    if let Some(locale) = locale {
        verify_locale(schema, locale, &mut proposals)?;
    }
    Ok(proposals)
}

/// Verify a relationship name against the schema
pub fn verify_reference(schema: &EntitySchema, name: &str) -> Result<Vec<SchemaMutation>> {
    if schema.reference(name).is_some() {
        Ok(Vec::new())
    } else if schema.allows(EvolutionMode::AddingReferences) {
        Ok(vec![SchemaMutation::CreateReference {
            schema: ReferenceSchema::new(name, name),
        }])
    } else {
        Err(Error::ReferenceNotInSchema {
            name: name.to_string(),
            entity_type: schema.name().to_string(),
        })
    }
}

/// Verify a price list and currency pair against the schema whitelists
pub fn verify_price(
    schema: &EntitySchema,
    price_list: &str,
    currency: &Currency,
) -> Result<Vec<SchemaMutation>> {
    let mut proposals = Vec::new();
    if !schema.knows_price_list(price_list) {
        if !schema.allows(EvolutionMode::AddingPrices) {
            return Err(Error::PriceListNotInSchema {
                price_list: price_list.to_string(),
                entity_type: schema.name().to_string(),
            });
        }
        proposals.push(SchemaMutation::AllowPriceList {
            price_list: price_list.to_string(),
        });
    }
    if !schema.supports_currency(currency) {
        if !schema.allows(EvolutionMode::AddingCurrencies) {
            return Err(Error::CurrencyNotInSchema {
                currency: currency.to_string(),
                entity_type: schema.name().to_string(),
            });
        }
        proposals.push(SchemaMutation::AllowCurrency {
            currency: currency.clone(),
        });
    }
    Ok(proposals)
}

fn verify_locale(
    schema: &EntitySchema,
    locale: &Locale,
    proposals: &mut Vec<SchemaMutation>,
) -> Result<()> {
    if schema.supports_locale(locale) {
        return Ok(());
    }
    if schema.allows(EvolutionMode::AddingLocales) {
        proposals.push(SchemaMutation::AllowLocale {
            locale: locale.clone(),
        });
        Ok(())
    } else {
        Err(Error::UnsupportedLocale {
            locale: locale.to_string(),
            entity_type: schema.name().to_string(),
        })
    }
}
