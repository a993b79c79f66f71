//! Error types for the entity data model
//!
//! This module defines all failure conditions raised by the core. We use
//! `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! ## Taxonomy
//!
//! Every variant belongs to exactly one [`ErrorCategory`]:
//!
//! - **SchemaViolation**: the mutation conflicts with the schema contract;
//!   recoverable by the caller (e.g. retried after applying the proposed
//!   schema mutations). Raised synchronously at mutation time.
//! - **Ambiguity**: the built state would contain indistinguishable data
//!   (overlapping sellable prices, colliding duplicate references).
//!   Raised at build time — intermediate builder states may transiently
//!   hold ambiguous data.
//! - **InternalConsistency**: a caller-side invariant breach (wrong bundle
//!   mode, stale anchor, removal of an absent reference). Never
//!   recoverable; the core does not attempt to self-heal.
//! - **ContextMissing**: a sale-context-dependent price query was invoked
//!   without any resolution context ever being established. Distinct from
//!   "no price found", which is a valid empty result.
//!
//! The core performs no logging, no retries and no fallback substitution;
//! every condition propagates to the surrounding storage/API layer as a
//! distinct named variant.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::value::ValueKind;

/// Result type alias for entity data model operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of [`Error`] variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Mutation conflicts with the schema contract; recoverable
    SchemaViolation,
    /// Built state would contain indistinguishable data
    Ambiguity,
    /// Caller-side invariant breach; unrecoverable
    InternalConsistency,
    /// Sale-context-dependent query without an established context
    ContextMissing,
}

/// Error types for the entity data model
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    // ------------------------------------------------------------------
    // Schema violations
    // ------------------------------------------------------------------
    /// Attribute name is not defined by the schema and evolution is off
    #[error("attribute `{name}` is not defined in entity `{entity_type}` schema and automatic evolution is not enabled for attributes")]
    AttributeNotInSchema {
        /// Offending attribute name
        name: String,
        /// Entity type whose schema was consulted
        entity_type: String,
    },

    /// Associated data name is not defined by the schema
    #[error("associated data `{name}` is not defined in entity `{entity_type}` schema and automatic evolution is not enabled for associated data")]
    AssociatedDataNotInSchema {
        /// Offending associated data name
        name: String,
        /// Entity type whose schema was consulted
        entity_type: String,
    },

    /// Reference name is not defined by the schema
    #[error("reference `{name}` is not defined in entity `{entity_type}` schema and automatic evolution is not enabled for references")]
    ReferenceNotInSchema {
        /// Offending relationship name
        name: String,
        /// Entity type whose schema was consulted
        entity_type: String,
    },

    /// Price list is not whitelisted by the schema
    #[error("price list `{price_list}` is not defined in entity `{entity_type}` schema and automatic evolution is not enabled for prices")]
    PriceListNotInSchema {
        /// Offending price list name
        price_list: String,
        /// Entity type whose schema was consulted
        entity_type: String,
    },

    /// Currency is not whitelisted by the schema
    #[error("currency `{currency}` is not supported by entity `{entity_type}` schema and automatic evolution is not enabled for currencies")]
    CurrencyNotInSchema {
        /// Offending currency code
        currency: String,
        /// Entity type whose schema was consulted
        entity_type: String,
    },

    /// Value type does not match the schema definition
    #[error("value of `{name}` accepts only type {expected} - supplied type is {actual}")]
    InvalidValueType {
        /// Name of the attribute or associated data
        name: String,
        /// Type declared by the schema
        expected: ValueKind,
        /// Type of the supplied value
        actual: ValueKind,
    },

    /// Localized value supplied for a non-localized definition
    #[error("`{name}` is not localized and does not accept localized values")]
    UnexpectedLocalizedValue {
        /// Name of the attribute or associated data
        name: String,
    },

    /// Non-localized value supplied for a localized definition
    #[error("`{name}` is localized and does not accept non-localized values")]
    ExpectedLocalizedValue {
        /// Name of the attribute or associated data
        name: String,
    },

    /// Locale is not whitelisted by the schema
    #[error("locale `{locale}` is not supported by entity `{entity_type}` schema and automatic evolution is not enabled for locales")]
    UnsupportedLocale {
        /// Offending locale tag
        locale: String,
        /// Entity type whose schema was consulted
        entity_type: String,
    },

    /// Composite value supplied for an attribute
    #[error("attribute `{name}` cannot hold composite values - use associated data instead")]
    CompositeAttributeValue {
        /// Offending attribute name
        name: String,
    },

    /// Delta mutation applied to a key with no prior value
    #[error("cannot apply delta to `{key}`: no previous value exists")]
    MissingValueForDelta {
        /// Formatted key the delta targeted
        key: String,
    },

    /// Removal of a key that holds no live value
    #[error("cannot remove `{key}`: no value exists")]
    MissingValueForRemoval {
        /// Formatted key the removal targeted
        key: String,
    },

    /// Malformed locale tag
    #[error("invalid locale tag `{tag}`")]
    InvalidLocaleTag {
        /// The rejected tag
        tag: String,
    },

    /// Malformed currency code
    #[error("invalid currency code `{code}` (expected three uppercase letters)")]
    InvalidCurrencyCode {
        /// The rejected code
        code: String,
    },

    // ------------------------------------------------------------------
    // Ambiguity
    // ------------------------------------------------------------------
    /// Two sellable prices with overlapping validity share one selection slot
    #[error("ambiguous prices in price list `{price_list}` ({currency}): two sellable prices with overlapping validity share inner record {inner_record_id:?}")]
    AmbiguousPrices {
        /// Price list of the conflicting prices
        price_list: String,
        /// Currency of the conflicting prices
        currency: String,
        /// Inner record shared by the conflicting prices
        inner_record_id: Option<u64>,
    },

    /// Two duplicate references share representative attributes but target
    /// different keys
    #[error("cannot add duplicate reference `{name}` with representative attributes {representative} - it would be indistinguishable from an existing reference")]
    DuplicateReferenceCollision {
        /// Relationship name
        name: String,
        /// Formatted representative attribute tuple
        representative: String,
    },

    /// SUM strategy contributions carry different tax rates
    #[error("prices have to share one tax rate to compute a cumulative selling price (found {first} and {second})")]
    MixedTaxRates {
        /// Tax rate of the first contribution
        first: Decimal,
        /// Conflicting tax rate
        second: Decimal,
    },

    /// More than one price matched a single-price lookup
    #[error("expected a single price for price list `{price_list}` ({currency}) but found {count}")]
    TooManyPrices {
        /// Requested price list
        price_list: String,
        /// Requested currency
        currency: String,
        /// Number of matches found
        count: usize,
    },

    // ------------------------------------------------------------------
    // Internal consistency violations
    // ------------------------------------------------------------------
    /// Second distinct target inserted into a non-duplicate bundle
    #[error("reference {key} is not expected to be duplicate")]
    UnexpectedDuplicateReference {
        /// Formatted reference key
        key: String,
    },

    /// Reference missing from the bundle's current bookkeeping
    #[error("reference {key} is not present in the bundle")]
    ReferenceNotPresent {
        /// Formatted reference key
        key: String,
    },

    /// Duplicate conversion anchored on a reference that is not the one stored
    #[error("conversion to duplicate mode was anchored on a stale reference {key}")]
    StaleDuplicateAnchor {
        /// Formatted reference key of the stale anchor
        key: String,
    },

    /// Mode-specific bundle operation invoked in the other mode
    #[error("operation `{operation}` on reference bundle `{name}` is not valid in its current mode")]
    WrongBundleMode {
        /// Relationship name
        name: String,
        /// Name of the rejected operation
        operation: &'static str,
    },

    /// Bundle bookkeeping reached a state that should be unreachable
    #[error("inconsistent reference bundle state: {detail}")]
    InconsistentBundle {
        /// Description of the breached invariant
        detail: String,
    },

    // ------------------------------------------------------------------
    // Context missing
    // ------------------------------------------------------------------
    /// Sale-context-dependent query without an established context
    #[error("no price-for-sale context was established - provide currency and price list priority first")]
    ContextMissing,
}

impl Error {
    /// Classify this error into the four-way taxonomy
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::AttributeNotInSchema { .. }
            | Error::AssociatedDataNotInSchema { .. }
            | Error::ReferenceNotInSchema { .. }
            | Error::PriceListNotInSchema { .. }
            | Error::CurrencyNotInSchema { .. }
            | Error::InvalidValueType { .. }
            | Error::UnexpectedLocalizedValue { .. }
            | Error::ExpectedLocalizedValue { .. }
            | Error::UnsupportedLocale { .. }
            | Error::CompositeAttributeValue { .. }
            | Error::MissingValueForDelta { .. }
            | Error::MissingValueForRemoval { .. }
            | Error::InvalidLocaleTag { .. }
            | Error::InvalidCurrencyCode { .. } => ErrorCategory::SchemaViolation,

            Error::AmbiguousPrices { .. }
            | Error::DuplicateReferenceCollision { .. }
            | Error::MixedTaxRates { .. }
            | Error::TooManyPrices { .. } => ErrorCategory::Ambiguity,

            Error::UnexpectedDuplicateReference { .. }
            | Error::ReferenceNotPresent { .. }
            | Error::StaleDuplicateAnchor { .. }
            | Error::WrongBundleMode { .. }
            | Error::InconsistentBundle { .. } => ErrorCategory::InternalConsistency,

            Error::ContextMissing => ErrorCategory::ContextMissing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_violation_category() {
        let err = Error::AttributeNotInSchema {
            name: "code".to_string(),
            entity_type: "Product".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::SchemaViolation);
        assert!(err.to_string().contains("code"));
        assert!(err.to_string().contains("Product"));
    }

    #[test]
    fn test_ambiguity_category() {
        let err = Error::AmbiguousPrices {
            price_list: "basic".to_string(),
            currency: "CZK".to_string(),
            inner_record_id: None,
        };
        assert_eq!(err.category(), ErrorCategory::Ambiguity);
        assert!(err.to_string().contains("basic"));
    }

    #[test]
    fn test_internal_consistency_category() {
        let err = Error::StaleDuplicateAnchor {
            key: "brands:5".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::InternalConsistency);
    }

    #[test]
    fn test_context_missing_category() {
        assert_eq!(Error::ContextMissing.category(), ErrorCategory::ContextMissing);
    }

    #[test]
    fn test_display_invalid_value_type() {
        let err = Error::InvalidValueType {
            name: "weight".to_string(),
            expected: ValueKind::Decimal,
            actual: ValueKind::String,
        };
        let msg = err.to_string();
        assert!(msg.contains("Decimal"));
        assert!(msg.contains("String"));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_error() -> Result<i32> {
            Err(Error::ContextMissing)
        }
        assert!(returns_error().is_err());
    }
}
