//! Locale and currency identifiers
//!
//! Localized attribute values are keyed by a locale tag; prices are keyed
//! by an ISO-4217 currency code. Both are validated newtypes so malformed
//! identifiers are rejected at the boundary instead of leaking into
//! container keys.
//!
//! ## Validation
//!
//! Locale tags:
//! - Lowercase language subtag, 2-8 ASCII letters (`en`, `cs`)
//! - Optional region subtag after a dash: 2 uppercase letters (`cs-CZ`)
//!
//! Currency codes:
//! - Exactly 3 uppercase ASCII letters (`CZK`, `EUR`)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Locale tag identifying the language (and optionally region) of a
/// localized value
///
/// ## Examples
///
/// Valid tags: `en`, `cs`, `cs-CZ`, `pt-BR`
///
/// Invalid tags: `""`, `EN`, `cs_CZ`, `c`, `cs-cz`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Locale(String);

impl Locale {
    /// Create a new locale, validating the tag
    pub fn new(tag: impl Into<String>) -> Result<Self> {
        let tag = tag.into();
        Self::validate(&tag)?;
        Ok(Locale(tag))
    }

    /// Get the tag as a string slice
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Language subtag of the locale
    pub fn language(&self) -> &str {
        self.0.split('-').next().unwrap_or(&self.0)
    }

    /// Region subtag of the locale, if any
    pub fn region(&self) -> Option<&str> {
        self.0.split('-').nth(1)
    }

    fn validate(tag: &str) -> Result<()> {
        let mut parts = tag.split('-');
        let language = parts.next().unwrap_or("");
        let valid_language = (2..=8).contains(&language.len())
            && language.bytes().all(|b| b.is_ascii_lowercase());
        let valid_region = match parts.next() {
            None => true,
            Some(region) => region.len() == 2 && region.bytes().all(|b| b.is_ascii_uppercase()),
        };
        if valid_language && valid_region && parts.next().is_none() {
            Ok(())
        } else {
            Err(Error::InvalidLocaleTag {
                tag: tag.to_string(),
            })
        }
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Locale {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Locale::new(s)
    }
}

/// ISO-4217 currency code
///
/// Three-letter uppercase form, e.g. `CZK`, `EUR`, `USD`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Currency(String);

impl Currency {
    /// Create a new currency, validating the code
    pub fn new(code: impl Into<String>) -> Result<Self> {
        let code = code.into();
        if code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase()) {
            Ok(Currency(code))
        } else {
            Err(Error::InvalidCurrencyCode { code })
        }
    }

    /// Get the code as a string slice
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Currency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Currency::new(s)
    }
}
