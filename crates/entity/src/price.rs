//! Price value types
//!
//! A price is identified by its business key - price id, price list and
//! currency - and carries exact decimal amounts, an optional validity
//! window, an optional inner-record id and the sellable flag. Amounts use
//! [`rust_decimal::Decimal`]; the price model never touches floating
//! point.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use entidb_core::{Currency, DateTimeRange, Droppable, Version, Versioned, INITIAL_VERSION};

/// Business key of one price
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PriceKey {
    price_id: u64,
    price_list: String,
    currency: Currency,
}

impl PriceKey {
    /// Create a price key
    pub fn new(price_id: u64, price_list: impl Into<String>, currency: Currency) -> Self {
        PriceKey {
            price_id,
            price_list: price_list.into(),
            currency,
        }
    }

    /// Identification of the price in the external system
    #[inline]
    pub fn price_id(&self) -> u64 {
        self.price_id
    }

    /// Price list the price belongs to
    #[inline]
    pub fn price_list(&self) -> &str {
        &self.price_list
    }

    /// Currency of the price
    #[inline]
    pub fn currency(&self) -> &Currency {
        &self.currency
    }
}

impl fmt::Display for PriceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.price_id, self.price_list, self.currency)
    }
}

/// All non-key data of a price
///
/// Split out of [`Price`] so upsert mutations can carry the full payload
/// without duplicating the versioning fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceSpec {
    /// Sub-variant of the sellable item the price belongs to
    pub inner_record_id: Option<u64>,
    /// Net amount
    pub price_without_tax: Decimal,
    /// Tax rate in percent
    pub tax_rate: Decimal,
    /// Gross amount
    pub price_with_tax: Decimal,
    /// Validity window, always valid when absent
    pub validity: Option<DateTimeRange>,
    /// True when the price participates in price-for-sale resolution
    pub sellable: bool,
}

impl PriceSpec {
    /// Create a spec without inner record and validity restrictions
    pub fn new(price_without_tax: Decimal, tax_rate: Decimal, price_with_tax: Decimal) -> Self {
        PriceSpec {
            inner_record_id: None,
            price_without_tax,
            tax_rate,
            price_with_tax,
            validity: None,
            sellable: true,
        }
    }

    /// Attach an inner record id
    pub fn with_inner_record(mut self, inner_record_id: u64) -> Self {
        self.inner_record_id = Some(inner_record_id);
        self
    }

    /// Attach a validity window
    pub fn with_validity(mut self, validity: DateTimeRange) -> Self {
        self.validity = Some(validity);
        self
    }

    /// Mark the price as not sellable
    pub fn not_sellable(mut self) -> Self {
        self.sellable = false;
        self
    }
}

/// One versioned price of an entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    key: PriceKey,
    spec: PriceSpec,
    version: Version,
    dropped: bool,
}

impl Price {
    /// Create the first version of a price
    pub fn new(key: PriceKey, spec: PriceSpec) -> Self {
        Price {
            key,
            spec,
            version: INITIAL_VERSION,
            dropped: false,
        }
    }

    pub(crate) fn from_parts(key: PriceKey, spec: PriceSpec, version: Version, dropped: bool) -> Self {
        Price {
            key,
            spec,
            version,
            dropped,
        }
    }

    /// Business key of the price
    #[inline]
    pub fn key(&self) -> &PriceKey {
        &self.key
    }

    /// Full non-key payload
    #[inline]
    pub fn spec(&self) -> &PriceSpec {
        &self.spec
    }

    /// Identification of the price in the external system
    #[inline]
    pub fn price_id(&self) -> u64 {
        self.key.price_id()
    }

    /// Price list the price belongs to
    #[inline]
    pub fn price_list(&self) -> &str {
        self.key.price_list()
    }

    /// Currency of the price
    #[inline]
    pub fn currency(&self) -> &Currency {
        self.key.currency()
    }

    /// Sub-variant of the sellable item the price belongs to
    #[inline]
    pub fn inner_record_id(&self) -> Option<u64> {
        self.spec.inner_record_id
    }

    /// Net amount
    #[inline]
    pub fn price_without_tax(&self) -> Decimal {
        self.spec.price_without_tax
    }

    /// Tax rate in percent
    #[inline]
    pub fn tax_rate(&self) -> Decimal {
        self.spec.tax_rate
    }

    /// Gross amount
    #[inline]
    pub fn price_with_tax(&self) -> Decimal {
        self.spec.price_with_tax
    }

    /// Validity window, always valid when absent
    #[inline]
    pub fn validity(&self) -> Option<&DateTimeRange> {
        self.spec.validity.as_ref()
    }

    /// True when the price participates in price-for-sale resolution
    #[inline]
    pub fn sellable(&self) -> bool {
        self.spec.sellable
    }

    /// True when the payload equals the given spec
    pub(crate) fn matches_spec(&self, spec: &PriceSpec) -> bool {
        &self.spec == spec
    }

    /// True when the observable state differs (version is ignored)
    pub fn differs_from(&self, other: Option<&Price>) -> bool {
        match other {
            None => true,
            Some(other) => self.spec != other.spec || self.dropped != other.dropped,
        }
    }
}

impl Versioned for Price {
    fn version(&self) -> Version {
        self.version
    }
}

impl Droppable for Price {
    fn dropped(&self) -> bool {
        self.dropped
    }
}

/// Strategy merging multiple inner records into one price for sale
///
/// Entity-scoped; decides how prices sharing the same entity but
/// belonging to different inner records aggregate during resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PriceInnerRecordHandling {
    /// Every price is independently sellable
    #[default]
    None,
    /// One candidate per inner record, the cheapest one wins
    LowestPrice,
    /// One candidate per inner record, summed into a cumulative price
    Sum,
}

/// Controls whether resolution compares amounts with or without tax
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryPriceMode {
    /// Compare gross amounts
    WithTax,
    /// Compare net amounts
    WithoutTax,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn czk() -> Currency {
        Currency::new("CZK").unwrap()
    }

    fn spec(net: i64) -> PriceSpec {
        PriceSpec::new(
            Decimal::from(net),
            Decimal::from(21),
            Decimal::from(net) * Decimal::from(121) / Decimal::from(100),
        )
    }

    #[test]
    fn test_price_starts_live_at_version_one() {
        let price = Price::new(PriceKey::new(1, "basic", czk()), spec(100));
        assert_eq!(price.version(), 1);
        assert!(price.exists());
        assert!(price.sellable());
        assert_eq!(price.price_without_tax(), Decimal::from(100));
    }

    #[test]
    fn test_differs_from_ignores_version() {
        let a = Price::new(PriceKey::new(1, "basic", czk()), spec(100));
        let b = Price::from_parts(PriceKey::new(1, "basic", czk()), spec(100), 5, false);
        assert!(!a.differs_from(Some(&b)));

        let c = Price::from_parts(PriceKey::new(1, "basic", czk()), spec(90), 5, false);
        assert!(a.differs_from(Some(&c)));
        assert!(a.differs_from(None));
    }

    #[test]
    fn test_key_display() {
        let key = PriceKey::new(42, "vip", czk());
        assert_eq!(key.to_string(), "42@vip/CZK");
    }

    #[test]
    fn test_default_inner_record_handling() {
        assert_eq!(
            PriceInnerRecordHandling::default(),
            PriceInnerRecordHandling::None
        );
    }

    #[test]
    fn test_price_serialization_roundtrip() {
        let price = Price::new(
            PriceKey::new(1, "basic", czk()),
            spec(100).with_inner_record(7),
        );
        let json = serde_json::to_string(&price).unwrap();
        let restored: Price = serde_json::from_str(&json).unwrap();
        assert_eq!(price, restored);
    }
}
