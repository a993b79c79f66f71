//! Price container, price-for-sale resolution and the context cache
//!
//! [`Prices`] owns every candidate price of one entity together with the
//! configured [`PriceInnerRecordHandling`] strategy. Resolution selects
//! the single "price for sale" (and optionally a set of named
//! accompanying prices) out of the currency-matching, validity-matching,
//! sellable candidates, honoring the requested price-list priority order.
//!
//! ## Strategies
//!
//! - `None`: first price found in price-list priority order wins
//! - `LowestPrice`: one candidate per inner-record group by the same
//!   priority rule, the lowest net amount across groups wins
//! - `Sum`: one candidate per group, summed into a synthesized cumulative
//!   price that retains the per-group contributions
//!
//! Absence of a resolvable price is a valid empty result. Invoking a
//! sale-context-dependent operation without ever establishing a context
//! is a programming error and fails with [`Error::ContextMissing`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use entidb_core::schema::{verify_price, EntitySchema, SchemaMutation};
use entidb_core::{Currency, Droppable, Error, Result, Version, Versioned, INITIAL_VERSION};

use crate::mutation::PriceMutation;
use crate::price::{Price, PriceInnerRecordHandling, PriceKey, PriceSpec, QueryPriceMode};

/// The resolved price for sale
///
/// `contributions` lists the per-inner-record-group prices the selection
/// was based on: the selected price itself for the `None` and
/// `LowestPrice` strategies, every contributing group representative for
/// `Sum`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceForSale {
    /// The selected (or synthesized) price
    pub price: Price,
    /// Per-group contributions behind the selection
    pub contributions: Vec<Price>,
}

impl PriceForSale {
    /// Inner-record groups the selection was based on
    pub fn groups(&self) -> BTreeSet<Option<u64>> {
        self.contributions
            .iter()
            .map(Price::inner_record_id)
            .collect()
    }
}

/// Specification of one named accompanying price
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccompanyingPriceSpec {
    /// Result name the accompanying price is published under
    pub name: String,
    /// Price-list priority order for this accompanying price
    pub price_lists: Vec<String>,
}

impl AccompanyingPriceSpec {
    /// Create a specification
    pub fn new(name: impl Into<String>, price_lists: &[&str]) -> Self {
        AccompanyingPriceSpec {
            name: name.into(),
            price_lists: price_lists.iter().map(|list| list.to_string()).collect(),
        }
    }
}

/// Full resolution context: currency, moment, priority and accompanying
/// price specifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceForSaleContext {
    /// Requested currency
    pub currency: Currency,
    /// Evaluation moment, absent for "ignore concrete validity moments"
    pub moment: Option<DateTime<Utc>>,
    /// Price-list priority order, earliest entry wins
    pub price_lists: Vec<String>,
    /// Named accompanying price specifications
    pub accompanying: Vec<AccompanyingPriceSpec>,
}

impl PriceForSaleContext {
    /// Create a context without accompanying prices
    pub fn new(currency: Currency, moment: Option<DateTime<Utc>>, price_lists: &[&str]) -> Self {
        PriceForSaleContext {
            currency,
            moment,
            price_lists: price_lists.iter().map(|list| list.to_string()).collect(),
            accompanying: Vec::new(),
        }
    }

    /// Add an accompanying price specification
    pub fn with_accompanying(mut self, spec: AccompanyingPriceSpec) -> Self {
        self.accompanying.push(spec);
        self
    }
}

/// Resolution result including accompanying prices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceForSaleWithAccompanying {
    /// The main price for sale
    pub price_for_sale: PriceForSale,
    /// Accompanying prices by result name; `None` when a specification
    /// matched nothing within the main price's inner-record groups
    pub accompanying: BTreeMap<String, Option<Price>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CachedResolution {
    context: PriceForSaleContext,
    result: Option<PriceForSaleWithAccompanying>,
}

#[derive(Debug, Default)]
struct CacheSlot {
    resolution: Option<CachedResolution>,
    // diagnostic counter exercised by the cache unit tests
    accompanying_computations: u64,
}

/// Immutable set of candidate prices of one entity
///
/// The container itself is versioned - any observable change to the price
/// set or the inner-record handling bumps its version. The embedded
/// resolution cache is interior-mutable behind a lock and never
/// participates in equality or serialization.
#[derive(Debug, Serialize, Deserialize)]
pub struct Prices {
    version: Version,
    #[serde(with = "price_map_serde")]
    prices: BTreeMap<PriceKey, Price>,
    inner_record_handling: PriceInnerRecordHandling,
    #[serde(skip, default)]
    cache: Mutex<CacheSlot>,
}

impl Clone for Prices {
    fn clone(&self) -> Self {
        Prices {
            version: self.version,
            prices: self.prices.clone(),
            inner_record_handling: self.inner_record_handling,
            cache: Mutex::new(CacheSlot::default()),
        }
    }
}

impl PartialEq for Prices {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.inner_record_handling == other.inner_record_handling
            && self.prices == other.prices
    }
}

impl Eq for Prices {}

impl Versioned for Prices {
    fn version(&self) -> Version {
        self.version
    }
}

impl Prices {
    /// Create an empty container with the given strategy
    pub fn empty(inner_record_handling: PriceInnerRecordHandling) -> Self {
        Prices {
            version: INITIAL_VERSION,
            prices: BTreeMap::new(),
            inner_record_handling,
            cache: Mutex::new(CacheSlot::default()),
        }
    }

    /// Create a container from pre-built prices, dropped ones included
    pub fn new(
        version: Version,
        prices: impl IntoIterator<Item = Price>,
        inner_record_handling: PriceInnerRecordHandling,
    ) -> Self {
        Prices {
            version,
            prices: prices
                .into_iter()
                .map(|price| (price.key().clone(), price))
                .collect(),
            inner_record_handling,
            cache: Mutex::new(CacheSlot::default()),
        }
    }

    /// The configured inner-record handling strategy
    #[inline]
    pub fn inner_record_handling(&self) -> PriceInnerRecordHandling {
        self.inner_record_handling
    }

    /// Live price by its business key
    pub fn price(&self, key: &PriceKey) -> Option<&Price> {
        self.prices.get(key).filter(|price| price.exists())
    }

    /// Live price by the parts of its business key
    pub fn price_by_parts(
        &self,
        price_id: u64,
        price_list: &str,
        currency: &Currency,
    ) -> Option<&Price> {
        self.price(&PriceKey::new(price_id, price_list, currency.clone()))
    }

    pub(crate) fn price_including_dropped(&self, key: &PriceKey) -> Option<&Price> {
        self.prices.get(key)
    }

    /// All live prices
    pub fn prices(&self) -> impl Iterator<Item = &Price> {
        self.prices.values().filter(|price| price.exists())
    }

    pub(crate) fn all_prices(&self) -> impl Iterator<Item = &Price> {
        self.prices.values()
    }

    /// Live prices of one price list
    pub fn prices_in_list(&self, price_list: &str) -> Vec<&Price> {
        self.prices()
            .filter(|price| price.price_list() == price_list)
            .collect()
    }

    /// Live prices of one currency
    pub fn prices_in_currency(&self, currency: &Currency) -> Vec<&Price> {
        self.prices()
            .filter(|price| price.currency() == currency)
            .collect()
    }

    /// The single live price of a price list and currency
    ///
    /// Errors when more than one price matches.
    pub fn single_price(&self, price_list: &str, currency: &Currency) -> Result<Option<&Price>> {
        let mut matches = self
            .prices()
            .filter(|price| price.price_list() == price_list && price.currency() == currency);
        let first = matches.next();
        let surplus = matches.count();
        if surplus > 0 {
            return Err(Error::TooManyPrices {
                price_list: price_list.to_string(),
                currency: currency.to_string(),
                count: surplus + 1,
            });
        }
        Ok(first)
    }

    /// Number of live prices
    pub fn count(&self) -> usize {
        self.prices().count()
    }

    /// True when any live price (or the strategy) differs between the two
    /// containers
    pub fn differs_from(&self, other: &Prices) -> bool {
        if self.inner_record_handling != other.inner_record_handling {
            return true;
        }
        if self.prices().count() != other.prices().count() {
            return true;
        }
        self.prices().any(|price| {
            other
                .price(price.key())
                .map(|counterpart| price.differs_from(Some(counterpart)))
                .unwrap_or(true)
        })
    }

    // ------------------------------------------------------------------
    // Price-for-sale resolution
    // ------------------------------------------------------------------

    /// Resolve the price for sale for the given context parameters
    pub fn price_for_sale(
        &self,
        currency: &Currency,
        moment: Option<DateTime<Utc>>,
        price_lists: &[&str],
    ) -> Result<Option<PriceForSale>> {
        let index = priority_index(price_lists);
        let pool: Vec<&Price> = self
            .sellable_candidates(Some(currency), moment)
            .filter(|price| index.contains_key(price.price_list()))
            .collect();
        self.select_price_for_sale(&pool, &index)
    }

    /// All prices the entity could be sold for
    ///
    /// With an empty priority list every matching candidate is returned;
    /// otherwise the `None` strategy yields at most one winner while the
    /// grouping strategies yield one winner per inner-record group.
    pub fn all_prices_for_sale(
        &self,
        currency: Option<&Currency>,
        moment: Option<DateTime<Utc>>,
        price_lists: &[&str],
    ) -> Vec<Price> {
        let index = priority_index(price_lists);
        let pool: Vec<&Price> = self
            .sellable_candidates(currency, moment)
            .filter(|price| index.is_empty() || index.contains_key(price.price_list()))
            .collect();
        if index.is_empty() {
            return pool.into_iter().cloned().collect();
        }
        match self.inner_record_handling {
            PriceInnerRecordHandling::None => pool
                .iter()
                .min_by_key(|price| (index[price.price_list()], price.price_id()))
                .map(|price| vec![(*price).clone()])
                .unwrap_or_default(),
            PriceInnerRecordHandling::LowestPrice | PriceInnerRecordHandling::Sum => {
                group_representatives(&pool, &index)
                    .into_values()
                    .map(Price::clone)
                    .collect()
            }
        }
    }

    /// Check whether the resolved price for sale falls into the interval
    ///
    /// Bounds are inclusive. For the `LowestPrice` strategy any
    /// inner-record group winner inside the interval satisfies the check.
    pub fn has_price_in_interval(
        &self,
        from: Decimal,
        to: Decimal,
        mode: QueryPriceMode,
        currency: &Currency,
        moment: Option<DateTime<Utc>>,
        price_lists: &[&str],
    ) -> Result<bool> {
        match self.inner_record_handling {
            PriceInnerRecordHandling::None | PriceInnerRecordHandling::Sum => Ok(self
                .price_for_sale(currency, moment, price_lists)?
                .map(|sale| in_interval(amount(&sale.price, mode), from, to))
                .unwrap_or(false)),
            PriceInnerRecordHandling::LowestPrice => {
                let index = priority_index(price_lists);
                let pool: Vec<&Price> = self
                    .sellable_candidates(Some(currency), moment)
                    .filter(|price| index.contains_key(price.price_list()))
                    .collect();
                Ok(group_representatives(&pool, &index)
                    .values()
                    .any(|price| in_interval(amount(price, mode), from, to)))
            }
        }
    }

    /// Resolve the price for sale together with its accompanying prices,
    /// establishing (and caching) the resolution context
    ///
    /// A repeated call with an identical context returns the cached
    /// result; a call that reuses only some of the cached
    /// accompanying-price specifications recomputes just the missing
    /// ones. Any other context change invalidates the cache.
    pub fn resolve(
        &self,
        context: PriceForSaleContext,
    ) -> Result<Option<PriceForSaleWithAccompanying>> {
        let mut slot = self.cache.lock();

        if let Some(cached) = &slot.resolution {
            if cached.context == context {
                tracing::trace!("price-for-sale context cache hit");
                return Ok(cached.result.clone());
            }
        }

        let same_base = slot
            .resolution
            .as_ref()
            .map(|cached| {
                cached.context.currency == context.currency
                    && cached.context.moment == context.moment
                    && cached.context.price_lists == context.price_lists
            })
            .unwrap_or(false);

        let main = if same_base {
            slot.resolution
                .as_ref()
                .and_then(|cached| cached.result.as_ref())
                .map(|result| result.price_for_sale.clone())
        } else {
            let price_lists: Vec<&str> =
                context.price_lists.iter().map(String::as_str).collect();
            self.price_for_sale(&context.currency, context.moment, &price_lists)?
        };

        let result = match main {
            None => None,
            Some(price_for_sale) => {
                let groups = price_for_sale.groups();
                let mut accompanying = BTreeMap::new();
                for spec in &context.accompanying {
                    let reusable = if same_base {
                        slot.resolution.as_ref().and_then(|cached| {
                            let known = cached
                                .context
                                .accompanying
                                .iter()
                                .any(|cached_spec| cached_spec == spec);
                            if known {
                                cached
                                    .result
                                    .as_ref()
                                    .and_then(|result| result.accompanying.get(&spec.name))
                                    .cloned()
                            } else {
                                None
                            }
                        })
                    } else {
                        None
                    };
                    let price = match reusable {
                        Some(price) => price,
                        None => {
                            slot.accompanying_computations += 1;
                            let lists: Vec<&str> =
                                spec.price_lists.iter().map(String::as_str).collect();
                            self.accompanying_price(
                                &groups,
                                &context.currency,
                                context.moment,
                                &lists,
                            )?
                        }
                    };
                    accompanying.insert(spec.name.clone(), price);
                }
                Some(PriceForSaleWithAccompanying {
                    price_for_sale,
                    accompanying,
                })
            }
        };

        slot.resolution = Some(CachedResolution {
            context,
            result: result.clone(),
        });
        Ok(result)
    }

    /// True when a resolution context was established on this container
    pub fn price_for_sale_context_available(&self) -> bool {
        self.cache.lock().resolution.is_some()
    }

    /// Price for sale of the established resolution context
    ///
    /// Errors with [`Error::ContextMissing`] when no context was ever
    /// established through [`Prices::resolve`].
    pub fn price_for_sale_in_context(&self) -> Result<Option<PriceForSale>> {
        let slot = self.cache.lock();
        match &slot.resolution {
            Some(cached) => Ok(cached
                .result
                .as_ref()
                .map(|result| result.price_for_sale.clone())),
            None => Err(Error::ContextMissing),
        }
    }

    /// Interval check against the established resolution context
    pub fn has_price_in_interval_in_context(
        &self,
        from: Decimal,
        to: Decimal,
        mode: QueryPriceMode,
    ) -> Result<bool> {
        let context = {
            let slot = self.cache.lock();
            match &slot.resolution {
                Some(cached) => cached.context.clone(),
                None => return Err(Error::ContextMissing),
            }
        };
        let price_lists: Vec<&str> = context.price_lists.iter().map(String::as_str).collect();
        self.has_price_in_interval(
            from,
            to,
            mode,
            &context.currency,
            context.moment,
            &price_lists,
        )
    }

    #[cfg(test)]
    pub(crate) fn accompanying_computations(&self) -> u64 {
        self.cache.lock().accompanying_computations
    }

    // ------------------------------------------------------------------
    // Ambiguity detection
    // ------------------------------------------------------------------

    /// Verify that no two sellable prices are mutually ambiguous
    ///
    /// Two live sellable prices sharing price list, currency and
    /// inner-record id with overlapping validity windows (a missing
    /// window overlaps everything) cannot be told apart during
    /// resolution; this is rejected when the container is finalized, not
    /// when the prices are inserted.
    pub fn validate_unambiguous(&self) -> Result<()> {
        let mut groups: BTreeMap<(&str, &Currency, Option<u64>), Vec<&Price>> = BTreeMap::new();
        for price in self.prices().filter(|price| price.sellable()) {
            groups
                .entry((price.price_list(), price.currency(), price.inner_record_id()))
                .or_default()
                .push(price);
        }
        for ((price_list, currency, inner_record_id), members) in groups {
            for (position, first) in members.iter().enumerate() {
                for second in &members[position + 1..] {
                    let overlapping = match (first.validity(), second.validity()) {
                        (Some(first_range), Some(second_range)) => {
                            first_range.overlaps(second_range)
                        }
                        _ => true,
                    };
                    if overlapping {
                        return Err(Error::AmbiguousPrices {
                            price_list: price_list.to_string(),
                            currency: currency.to_string(),
                            inner_record_id,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn sellable_candidates<'a>(
        &'a self,
        currency: Option<&'a Currency>,
        moment: Option<DateTime<Utc>>,
    ) -> impl Iterator<Item = &'a Price> {
        self.candidates(currency, moment)
            .filter(|price| price.sellable())
    }

    fn candidates<'a>(
        &'a self,
        currency: Option<&'a Currency>,
        moment: Option<DateTime<Utc>>,
    ) -> impl Iterator<Item = &'a Price> {
        self.prices()
            .filter(move |price| currency.map_or(true, |currency| price.currency() == currency))
            .filter(move |price| match (price.validity(), moment) {
                (None, _) => true,
                (Some(validity), Some(moment)) => validity.is_valid_at(moment),
                // no evaluation moment: only permanently valid or
                // open-ended windows qualify
                (Some(validity), None) => validity.is_open_ended(),
            })
    }

    fn select_price_for_sale(
        &self,
        pool: &[&Price],
        index: &FxHashMap<&str, usize>,
    ) -> Result<Option<PriceForSale>> {
        match self.inner_record_handling {
            PriceInnerRecordHandling::None => Ok(pool
                .iter()
                .min_by_key(|price| (index[price.price_list()], price.price_id()))
                .map(|price| PriceForSale {
                    price: (*price).clone(),
                    contributions: vec![(*price).clone()],
                })),
            PriceInnerRecordHandling::LowestPrice => Ok(group_representatives(pool, index)
                .into_values()
                .min_by_key(|price| (price.price_without_tax(), price.price_id()))
                .map(|price| PriceForSale {
                    contributions: vec![price.clone()],
                    price: price.clone(),
                })),
            PriceInnerRecordHandling::Sum => {
                let contributions: Vec<Price> = group_representatives(pool, index)
                    .into_values()
                    .map(Price::clone)
                    .collect();
                match contributions.first() {
                    None => Ok(None),
                    Some(first) => {
                        let tax_rate = first.tax_rate();
                        for contribution in &contributions[1..] {
                            if contribution.tax_rate() != tax_rate {
                                return Err(Error::MixedTaxRates {
                                    first: tax_rate,
                                    second: contribution.tax_rate(),
                                });
                            }
                        }
                        let net: Decimal =
                            contributions.iter().map(Price::price_without_tax).sum();
                        let gross: Decimal =
                            contributions.iter().map(Price::price_with_tax).sum();
                        // the synthesized cumulative price has no validity
                        // and no inner record of its own
                        let price = Price::new(
                            first.key().clone(),
                            PriceSpec::new(net, tax_rate, gross),
                        );
                        Ok(Some(PriceForSale {
                            price,
                            contributions,
                        }))
                    }
                }
            }
        }
    }

    /// Resolve one accompanying price constrained to the main selection's
    /// inner-record groups
    ///
    /// Unlike the main price for sale, accompanying candidates are not
    /// required to be sellable - the typical accompanying price (a
    /// crossed-out "reference" price) deliberately is not.
    fn accompanying_price(
        &self,
        groups: &BTreeSet<Option<u64>>,
        currency: &Currency,
        moment: Option<DateTime<Utc>>,
        price_lists: &[&str],
    ) -> Result<Option<Price>> {
        let index = priority_index(price_lists);
        let pool: Vec<&Price> = self
            .candidates(Some(currency), moment)
            .filter(|price| index.contains_key(price.price_list()))
            .filter(|price| groups.contains(&price.inner_record_id()))
            .collect();
        match self.inner_record_handling {
            PriceInnerRecordHandling::None | PriceInnerRecordHandling::LowestPrice => Ok(pool
                .iter()
                .min_by_key(|price| (index[price.price_list()], price.price_id()))
                .map(|price| (*price).clone())),
            PriceInnerRecordHandling::Sum => {
                let contributions: Vec<Price> = group_representatives(&pool, &index)
                    .into_values()
                    .map(Price::clone)
                    .collect();
                match contributions.first() {
                    None => Ok(None),
                    Some(first) => {
                        let tax_rate = first.tax_rate();
                        for contribution in &contributions[1..] {
                            if contribution.tax_rate() != tax_rate {
                                return Err(Error::MixedTaxRates {
                                    first: tax_rate,
                                    second: contribution.tax_rate(),
                                });
                            }
                        }
                        let net: Decimal =
                            contributions.iter().map(Price::price_without_tax).sum();
                        let gross: Decimal =
                            contributions.iter().map(Price::price_with_tax).sum();
                        Ok(Some(Price::new(
                            first.key().clone(),
                            PriceSpec::new(net, tax_rate, gross),
                        )))
                    }
                }
            }
        }
    }
}

/// Earliest-priority-list index: price list name → position
fn priority_index<'a>(price_lists: &[&'a str]) -> FxHashMap<&'a str, usize> {
    price_lists
        .iter()
        .enumerate()
        .map(|(position, list)| (*list, position))
        .collect()
}

/// One winner per inner-record group by the earliest-priority-list rule,
/// price id ascending as the deterministic tie-break
fn group_representatives<'a>(
    pool: &[&'a Price],
    index: &FxHashMap<&str, usize>,
) -> BTreeMap<Option<u64>, &'a Price> {
    let mut groups: BTreeMap<Option<u64>, &'a Price> = BTreeMap::new();
    for price in pool {
        groups
            .entry(price.inner_record_id())
            .and_modify(|current| {
                let current_rank = (index[current.price_list()], current.price_id());
                let candidate_rank = (index[price.price_list()], price.price_id());
                if candidate_rank < current_rank {
                    *current = price;
                }
            })
            .or_insert(price);
    }
    groups
}

fn amount(price: &Price, mode: QueryPriceMode) -> Decimal {
    match mode {
        QueryPriceMode::WithTax => price.price_with_tax(),
        QueryPriceMode::WithoutTax => price.price_without_tax(),
    }
}

fn in_interval(amount: Decimal, from: Decimal, to: Decimal) -> bool {
    from <= amount && amount <= to
}

mod price_map_serde {
    //! Prices are keyed by a composite business key, which self-describing
    //! formats cannot express as map keys; the map travels as a sequence.

    use super::{Price, PriceKey};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        prices: &BTreeMap<PriceKey, Price>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let values: Vec<&Price> = prices.values().collect();
        values.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<PriceKey, Price>, D::Error> {
        let values: Vec<Price> = Vec::deserialize(deserializer)?;
        Ok(values
            .into_iter()
            .map(|price| (price.key().clone(), price))
            .collect())
    }
}

/// Copy-on-write builder over an optional base [`Prices`] container
///
/// Accumulates price mutations and the requested strategy switch,
/// validates price lists and currencies against the schema whitelists at
/// mutation time, and rejects mutually ambiguous sellable prices when
/// the container is finalized.
#[derive(Debug)]
pub struct PricesBuilder<'a> {
    schema: &'a EntitySchema,
    base: Option<Arc<Prices>>,
    mutations: BTreeMap<PriceKey, PriceMutation>,
    new_handling: Option<PriceInnerRecordHandling>,
    proposals: Vec<SchemaMutation>,
}

impl<'a> PricesBuilder<'a> {
    /// Create a builder; `base` absent builds a brand-new container
    pub fn new(schema: &'a EntitySchema, base: Option<Arc<Prices>>) -> Self {
        PricesBuilder {
            schema,
            base,
            mutations: BTreeMap::new(),
            new_handling: None,
            proposals: Vec::new(),
        }
    }

    /// Set a price, creating it when absent
    pub fn upsert(&mut self, key: PriceKey, spec: PriceSpec) -> Result<&mut Self> {
        let proposals = verify_price(self.schema, key.price_list(), key.currency())?;
        for proposal in proposals {
            if !self.proposals.contains(&proposal) {
                self.proposals.push(proposal);
            }
        }
        self.mutations
            .insert(key.clone(), PriceMutation::Upsert { key, spec });
        Ok(self)
    }

    /// Soft-remove a price
    pub fn remove(&mut self, key: PriceKey) -> Result<&mut Self> {
        let exists_in_base = self
            .base
            .as_ref()
            .and_then(|base| base.price_including_dropped(&key))
            .map(|price| price.exists())
            .unwrap_or(false);
        let pending_upsert = matches!(self.mutations.get(&key), Some(PriceMutation::Upsert { .. }));
        if !exists_in_base && !pending_upsert {
            return Err(Error::MissingValueForRemoval {
                key: key.to_string(),
            });
        }
        if exists_in_base {
            self.mutations
                .insert(key.clone(), PriceMutation::Remove { key });
        } else {
            self.mutations.remove(&key);
        }
        Ok(self)
    }

    /// Switch the inner-record handling strategy
    pub fn set_inner_record_handling(
        &mut self,
        handling: PriceInnerRecordHandling,
    ) -> &mut Self {
        self.new_handling = Some(handling);
        self
    }

    /// Live price as the builder sees it
    pub fn price(&self, key: &PriceKey) -> Option<Price> {
        let existing = self
            .base
            .as_ref()
            .and_then(|base| base.price_including_dropped(key));
        match self.mutations.get(key) {
            Some(mutation) => mutation.apply(existing).ok().filter(|price| price.exists()),
            None => existing.filter(|price| price.exists()).cloned(),
        }
    }

    /// Schema mutations proposed by the mutations registered so far
    pub fn schema_mutations(&self) -> &[SchemaMutation] {
        &self.proposals
    }

    /// Net effective price mutations relative to the base snapshot
    pub fn build_change_set(&self) -> Vec<PriceMutation> {
        self.mutations
            .iter()
            .filter(|(key, mutation)| {
                let existing = self
                    .base
                    .as_ref()
                    .and_then(|base| base.price_including_dropped(key));
                match mutation.apply(existing) {
                    Ok(applied) => applied.differs_from(existing),
                    Err(_) => false,
                }
            })
            .map(|(_, mutation)| mutation.clone())
            .collect()
    }

    /// The strategy switch, when it actually changes the base strategy
    pub fn handling_change(&self) -> Option<PriceInnerRecordHandling> {
        let current = self
            .base
            .as_ref()
            .map(|base| base.inner_record_handling())
            .unwrap_or_default();
        self.new_handling.filter(|handling| *handling != current)
    }

    /// Build the immutable container; identity-preserving on no-op
    ///
    /// Ambiguous sellable prices are rejected here, not at insert time,
    /// so intermediate builder states may transiently hold ambiguous
    /// data.
    pub fn build(self) -> Result<Arc<Prices>> {
        let mut effective: BTreeMap<PriceKey, Price> = BTreeMap::new();
        for (key, mutation) in &self.mutations {
            let existing = self
                .base
                .as_ref()
                .and_then(|base| base.price_including_dropped(key));
            let applied = mutation.apply(existing)?;
            if applied.differs_from(existing) {
                effective.insert(key.clone(), applied);
            }
        }
        let handling_change = self.handling_change();

        if effective.is_empty() && handling_change.is_none() {
            return Ok(match self.base {
                Some(base) => base,
                None => Arc::new(Prices::empty(
                    self.new_handling.unwrap_or_default(),
                )),
            });
        }

        let handling = handling_change
            .or_else(|| self.base.as_ref().map(|base| base.inner_record_handling()))
            .or(self.new_handling)
            .unwrap_or_default();
        let version = self
            .base
            .as_ref()
            .map(|base| base.version() + 1)
            .unwrap_or(INITIAL_VERSION);
        let merged = self
            .base
            .iter()
            .flat_map(|base| base.all_prices())
            .filter(|price| !effective.contains_key(price.key()))
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .chain(effective.into_values());
        let container = Prices::new(version, merged, handling);
        container.validate_unambiguous()?;
        Ok(Arc::new(container))
    }
}
