//! Reference value types
//!
//! A reference is one hierarchical link from an entity to a target entity
//! under a named relationship. It carries an optional group reference and
//! its own reference-scoped attribute container.
//!
//! ## Keys and discriminators
//!
//! [`ReferenceKey`] combines the relationship name, the referenced
//! primary key and an internal discriminator. The discriminator is 0 for
//! ordinary single links; once a relationship enters duplicate mode the
//! bundle mints synthetic positive discriminators to tell multiple links
//! to the same (or different) targets apart.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use entidb_core::{Droppable, Value, Version, Versioned, INITIAL_VERSION};

use crate::attributes::Attributes;

/// Synthetic integer distinguishing duplicate references
pub type Discriminator = u32;

/// Key of one reference within an entity
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReferenceKey {
    name: String,
    primary_key: u64,
    discriminator: Discriminator,
}

impl ReferenceKey {
    /// Key of an ordinary single link (discriminator 0)
    pub fn new(name: impl Into<String>, primary_key: u64) -> Self {
        ReferenceKey {
            name: name.into(),
            primary_key,
            discriminator: 0,
        }
    }

    /// Key carrying an explicit duplicate discriminator
    pub fn with_discriminator(
        name: impl Into<String>,
        primary_key: u64,
        discriminator: Discriminator,
    ) -> Self {
        ReferenceKey {
            name: name.into(),
            primary_key,
            discriminator,
        }
    }

    /// Relationship name
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Primary key of the referenced entity
    #[inline]
    pub fn primary_key(&self) -> u64 {
        self.primary_key
    }

    /// Internal discriminator, 0 for ordinary single links
    #[inline]
    pub fn discriminator(&self) -> Discriminator {
        self.discriminator
    }

    /// True when the key carries no duplicate discriminator
    #[inline]
    pub fn is_generic(&self) -> bool {
        self.discriminator == 0
    }

    /// The same key with the discriminator stripped
    pub fn as_generic(&self) -> ReferenceKey {
        ReferenceKey::new(self.name.clone(), self.primary_key)
    }

    pub(crate) fn rekeyed(&self, discriminator: Discriminator) -> ReferenceKey {
        ReferenceKey {
            name: self.name.clone(),
            primary_key: self.primary_key,
            discriminator,
        }
    }
}

impl fmt::Display for ReferenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.discriminator == 0 {
            write!(f, "{}:{}", self.name, self.primary_key)
        } else {
            write!(f, "{}:{}#{}", self.name, self.primary_key, self.discriminator)
        }
    }
}

/// Versioned link from a reference to its group entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceGroup {
    group_type: String,
    primary_key: u64,
    version: Version,
    dropped: bool,
}

impl ReferenceGroup {
    /// Create the first version of a group link
    pub fn new(group_type: impl Into<String>, primary_key: u64) -> Self {
        ReferenceGroup {
            group_type: group_type.into(),
            primary_key,
            version: INITIAL_VERSION,
            dropped: false,
        }
    }

    pub(crate) fn from_parts(
        group_type: String,
        primary_key: u64,
        version: Version,
        dropped: bool,
    ) -> Self {
        ReferenceGroup {
            group_type,
            primary_key,
            version,
            dropped,
        }
    }

    /// Entity type of the group
    #[inline]
    pub fn group_type(&self) -> &str {
        &self.group_type
    }

    /// Primary key of the group entity
    #[inline]
    pub fn primary_key(&self) -> u64 {
        self.primary_key
    }

    /// True when the observable state differs (version is ignored)
    pub fn differs_from(&self, other: Option<&ReferenceGroup>) -> bool {
        match other {
            None => true,
            Some(other) => {
                self.group_type != other.group_type
                    || self.primary_key != other.primary_key
                    || self.dropped != other.dropped
            }
        }
    }
}

impl Versioned for ReferenceGroup {
    fn version(&self) -> Version {
        self.version
    }
}

impl Droppable for ReferenceGroup {
    fn dropped(&self) -> bool {
        self.dropped
    }
}

/// One reference link of an entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub(crate) key: ReferenceKey,
    pub(crate) group: Option<ReferenceGroup>,
    pub(crate) attributes: Arc<Attributes>,
    pub(crate) version: Version,
    pub(crate) dropped: bool,
}

impl Reference {
    /// Create the first version of a reference
    pub fn new(key: ReferenceKey, attributes: Arc<Attributes>) -> Self {
        Reference {
            key,
            group: None,
            attributes,
            version: INITIAL_VERSION,
            dropped: false,
        }
    }

    /// Create a reference from all parts
    pub fn from_parts(
        key: ReferenceKey,
        group: Option<ReferenceGroup>,
        attributes: Arc<Attributes>,
        version: Version,
        dropped: bool,
    ) -> Self {
        Reference {
            key,
            group,
            attributes,
            version,
            dropped,
        }
    }

    /// Key of this reference
    #[inline]
    pub fn key(&self) -> &ReferenceKey {
        &self.key
    }

    /// Live group link, if any
    pub fn group(&self) -> Option<&ReferenceGroup> {
        self.group.as_ref().filter(|group| group.exists())
    }

    pub(crate) fn group_including_dropped(&self) -> Option<&ReferenceGroup> {
        self.group.as_ref()
    }

    /// Reference-scoped attribute container
    #[inline]
    pub fn attributes(&self) -> &Arc<Attributes> {
        &self.attributes
    }

    /// Live payload of a non-localized reference attribute
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.attribute(name)
    }

    /// True when the observable state differs (version is ignored)
    pub fn differs_from(&self, other: &Reference) -> bool {
        self.dropped != other.dropped
            || self.group != other.group
            || !(Arc::ptr_eq(&self.attributes, &other.attributes)
                || self.attributes == other.attributes)
    }

    /// Representative attribute tuple of this reference
    ///
    /// Values are looked up by the given attribute names in order;
    /// missing attributes yield `None` slots so partially filled tuples
    /// stay comparable.
    pub fn representative_tuple(&self, representative: &[String]) -> Vec<Option<Value>> {
        representative
            .iter()
            .map(|name| self.attributes.attribute(name).cloned())
            .collect()
    }
}

impl Versioned for Reference {
    fn version(&self) -> Version {
        self.version
    }
}

impl Droppable for Reference {
    fn dropped(&self) -> bool {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_key_roundtrip() {
        let key = ReferenceKey::new("brand", 5);
        assert!(key.is_generic());
        assert_eq!(key.to_string(), "brand:5");

        let dup = ReferenceKey::with_discriminator("brand", 5, 2);
        assert!(!dup.is_generic());
        assert_eq!(dup.to_string(), "brand:5#2");
        assert_eq!(dup.as_generic(), key);
    }

    #[test]
    fn test_reference_starts_live_at_version_one() {
        let reference = Reference::new(
            ReferenceKey::new("brand", 5),
            Arc::new(Attributes::empty()),
        );
        assert_eq!(reference.version(), 1);
        assert!(reference.exists());
        assert!(reference.group().is_none());
    }

    #[test]
    fn test_differs_from_ignores_version() {
        let attributes = Arc::new(Attributes::empty());
        let a = Reference::new(ReferenceKey::new("brand", 5), Arc::clone(&attributes));
        let mut b = a.clone();
        b.version = 7;
        assert!(!a.differs_from(&b));

        b.dropped = true;
        assert!(a.differs_from(&b));
    }

    #[test]
    fn test_group_drop_is_observable() {
        let attributes = Arc::new(Attributes::empty());
        let mut a = Reference::new(ReferenceKey::new("brand", 5), Arc::clone(&attributes));
        a.group = Some(ReferenceGroup::new("BrandGroup", 9));
        let mut b = a.clone();
        b.group = Some(ReferenceGroup::from_parts("BrandGroup".into(), 9, 2, true));
        assert!(a.differs_from(&b));
        assert!(b.group().is_none());
        assert!(b.group_including_dropped().is_some());
    }

    #[test]
    fn test_representative_tuple_missing_slots() {
        let reference = Reference::new(
            ReferenceKey::new("parameters", 3),
            Arc::new(Attributes::empty()),
        );
        let tuple = reference.representative_tuple(&["channel".to_string(), "variant".to_string()]);
        assert_eq!(tuple, vec![None, None]);
    }
}
