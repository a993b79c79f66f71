//! End-to-end price-for-sale resolution scenarios
//!
//! Exercises the resolution engine through the public facade with the
//! standard catalog price set: basic 100 CZK, loggedOnly 80 CZK, vip
//! 60 CZK valid only 2010-2012, reference 140 CZK not sellable.

use chrono::{DateTime, TimeZone, Utc};
use entidb::{
    AccompanyingPriceSpec, Currency, DateTimeRange, Error, Price, PriceForSaleContext,
    PriceInnerRecordHandling, PriceKey, PriceSpec, Prices, QueryPriceMode,
};
use rust_decimal::Decimal;

const BASIC: &str = "basic";
const LOGGED_ONLY: &str = "loggedOnly";
const VIP: &str = "vip";
const REFERENCE: &str = "reference";
const PRIORITY: &[&str] = &[REFERENCE, VIP, LOGGED_ONLY, BASIC];

fn czk() -> Currency {
    Currency::new("CZK").unwrap()
}

fn dec(value: &str) -> Decimal {
    value.parse().unwrap()
}

fn moment(year: i32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, 6, 15, 12, 0, 0).unwrap()
}

fn combine(inner: Option<u64>, id: u64) -> u64 {
    inner.map(|inner| inner * 1_000_000 + id).unwrap_or(id)
}

fn standard_prices(inner: Option<u64>, multiplier: &str) -> Vec<Price> {
    let multiplier = dec(multiplier);
    let vip_validity = DateTimeRange::between(
        Utc.with_ymd_and_hms(2010, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2012, 12, 31, 23, 59, 59).unwrap(),
    );
    let price = |id: u64, list: &str, net: &str, gross: &str, validity: Option<DateTimeRange>, sellable: bool| {
        Price::new(
            PriceKey::new(combine(inner, id), list, czk()),
            PriceSpec {
                inner_record_id: inner,
                price_without_tax: dec(net) * multiplier,
                tax_rate: dec("21"),
                price_with_tax: dec(gross) * multiplier,
                validity,
                sellable,
            },
        )
    };
    vec![
        price(1, BASIC, "100", "121", None, true),
        price(2, LOGGED_ONLY, "80", "96.8", None, true),
        price(3, VIP, "60", "72.6", Some(vip_validity), true),
        price(4, REFERENCE, "140", "169.4", None, false),
    ]
}

#[test]
fn none_strategy_returns_logged_only_in_2020() {
    let prices = Prices::new(1, standard_prices(None, "1"), PriceInnerRecordHandling::None);

    // reference is not sellable and vip is outside its validity window,
    // so loggedOnly is the first match in the priority order
    let sale = prices
        .price_for_sale(&czk(), Some(moment(2020)), PRIORITY)
        .unwrap()
        .unwrap();
    assert_eq!(sale.price.price_list(), LOGGED_ONLY);
    assert_eq!(sale.price.price_without_tax(), dec("80"));
}

#[test]
fn none_strategy_returns_vip_in_2011() {
    let prices = Prices::new(1, standard_prices(None, "1"), PriceInnerRecordHandling::None);

    let sale = prices
        .price_for_sale(&czk(), Some(moment(2011)), PRIORITY)
        .unwrap()
        .unwrap();
    assert_eq!(sale.price.price_list(), VIP);
    assert_eq!(sale.price.price_without_tax(), dec("60"));
}

#[test]
fn absent_price_is_an_empty_result_not_an_error() {
    let prices = Prices::new(1, standard_prices(None, "1"), PriceInnerRecordHandling::None);
    let resolved = prices
        .price_for_sale(&czk(), Some(moment(2020)), &[REFERENCE, VIP])
        .unwrap();
    assert!(resolved.is_none());
}

#[test]
fn sum_strategy_accumulates_three_inner_records() {
    let mut pool = standard_prices(Some(1), "1");
    pool.extend(standard_prices(Some(2), "2"));
    pool.extend(standard_prices(Some(3), "0.5"));
    let prices = Prices::new(1, pool, PriceInnerRecordHandling::Sum);

    // 80 + 160 + 40 = 280
    let sale = prices
        .price_for_sale(&czk(), Some(moment(2020)), PRIORITY)
        .unwrap()
        .unwrap();
    assert_eq!(sale.price.price_without_tax(), dec("280.0"));
    assert_eq!(sale.contributions.len(), 3);
    assert!(sale.price.sellable());
}

#[test]
fn lowest_price_strategy_selects_cheapest_variant() {
    let mut pool = standard_prices(Some(1), "1");
    pool.extend(standard_prices(Some(2), "2"));
    pool.extend(standard_prices(Some(3), "0.5"));
    let prices = Prices::new(1, pool, PriceInnerRecordHandling::LowestPrice);

    let sale = prices
        .price_for_sale(&czk(), Some(moment(2020)), PRIORITY)
        .unwrap()
        .unwrap();
    assert_eq!(sale.price.inner_record_id(), Some(3));
    assert_eq!(sale.price.price_without_tax(), dec("40.0"));

    let winners = prices.all_prices_for_sale(Some(&czk()), Some(moment(2020)), PRIORITY);
    assert_eq!(winners.len(), 3, "one winner per inner-record group");
}

#[test]
fn interval_check_follows_the_selected_price() {
    let prices = Prices::new(1, standard_prices(None, "1"), PriceInnerRecordHandling::None);
    assert!(prices
        .has_price_in_interval(
            dec("75"),
            dec("85"),
            QueryPriceMode::WithoutTax,
            &czk(),
            Some(moment(2020)),
            PRIORITY,
        )
        .unwrap());
    assert!(!prices
        .has_price_in_interval(
            dec("85"),
            dec("200"),
            QueryPriceMode::WithoutTax,
            &czk(),
            Some(moment(2020)),
            PRIORITY,
        )
        .unwrap());
    assert!(prices
        .has_price_in_interval(
            dec("90"),
            dec("100"),
            QueryPriceMode::WithTax,
            &czk(),
            Some(moment(2020)),
            PRIORITY,
        )
        .unwrap());
}

#[test]
fn context_dependent_queries_fail_loudly_without_context() {
    let prices = Prices::new(1, standard_prices(None, "1"), PriceInnerRecordHandling::None);
    assert!(matches!(
        prices.price_for_sale_in_context().unwrap_err(),
        Error::ContextMissing
    ));

    // after a resolution the context sticks
    prices
        .resolve(PriceForSaleContext::new(czk(), Some(moment(2020)), PRIORITY))
        .unwrap();
    let sale = prices.price_for_sale_in_context().unwrap().unwrap();
    assert_eq!(sale.price.price_list(), LOGGED_ONLY);
    assert!(prices
        .has_price_in_interval_in_context(dec("75"), dec("85"), QueryPriceMode::WithoutTax)
        .unwrap());
}

#[test]
fn accompanying_prices_describe_the_same_variant() {
    let mut pool = standard_prices(Some(1), "1");
    pool.extend(standard_prices(Some(2), "2"));
    pool.extend(standard_prices(Some(3), "0.5"));
    let prices = Prices::new(1, pool, PriceInnerRecordHandling::LowestPrice);

    let context = PriceForSaleContext::new(czk(), Some(moment(2020)), PRIORITY)
        .with_accompanying(AccompanyingPriceSpec::new("reference", &[REFERENCE]));
    let resolved = prices.resolve(context.clone()).unwrap().unwrap();

    // the winning variant is inner record 3; the accompanying reference
    // price must describe the same variant even though it is not sellable
    assert_eq!(resolved.price_for_sale.price.inner_record_id(), Some(3));
    let reference = resolved
        .accompanying
        .get("reference")
        .unwrap()
        .as_ref()
        .unwrap();
    assert_eq!(reference.inner_record_id(), Some(3));
    assert_eq!(reference.price_without_tax(), dec("70.0"));

    // an identical context resolves to an identical (cached) result
    let again = prices.resolve(context).unwrap().unwrap();
    assert_eq!(resolved, again);
}

#[test]
fn repeated_resolution_with_extra_spec_keeps_previous_names() {
    let prices = Prices::new(1, standard_prices(None, "1"), PriceInnerRecordHandling::None);

    let base = PriceForSaleContext::new(czk(), Some(moment(2020)), PRIORITY)
        .with_accompanying(AccompanyingPriceSpec::new("p", &[REFERENCE]));
    let first = prices.resolve(base.clone()).unwrap().unwrap();

    let extended = base.with_accompanying(AccompanyingPriceSpec::new("q", &[VIP]));
    let second = prices.resolve(extended).unwrap().unwrap();

    assert_eq!(
        first.accompanying.get("p"),
        second.accompanying.get("p"),
        "previously resolved accompanying prices are kept"
    );
    assert!(second.accompanying.contains_key("q"));
    // vip is outside its validity window in 2020
    assert!(second.accompanying.get("q").unwrap().is_none());
}

#[test]
fn overlapping_sellable_prices_are_mutually_ambiguous() {
    let make = |id: u64, inner: Option<u64>| {
        Price::new(
            PriceKey::new(id, BASIC, czk()),
            PriceSpec {
                inner_record_id: inner,
                price_without_tax: dec("100"),
                tax_rate: dec("21"),
                price_with_tax: dec("121"),
                validity: None,
                sellable: true,
            },
        )
    };

    let ambiguous = Prices::new(1, vec![make(1, None), make(2, None)], PriceInnerRecordHandling::None);
    assert!(matches!(
        ambiguous.validate_unambiguous().unwrap_err(),
        Error::AmbiguousPrices { .. }
    ));

    let distinct = Prices::new(
        1,
        vec![make(1, Some(1)), make(2, Some(2))],
        PriceInnerRecordHandling::None,
    );
    assert!(distinct.validate_unambiguous().is_ok());
}
