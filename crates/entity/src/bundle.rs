//! Reference deduplication bundle
//!
//! One bundle owns every reference of a single relationship name on a
//! single entity. Relationships with cardinality zero-or-one must reject
//! accidental duplicates cheaply, while cardinality-many relationships
//! need identity tracking keyed by business-meaningful attributes - so
//! the bundle defers the heavier bookkeeping until it is actually needed:
//!
//! - **Non-duplicate mode** (initial): a single link; inserting a second
//!   distinct target is a fatal internal-consistency error - the caller
//!   is expected to convert to duplicate mode first.
//! - **Duplicate mode**: many links identified by the tuple of their
//!   *representative* attribute values (the reference attributes the
//!   schema marks identity-relevant). Each member gets a synthetic
//!   positive discriminator; an incoming reference whose representative
//!   tuple matches an existing member updates that member in place,
//!   anything else mints a fresh discriminator. Two live members with
//!   identical tuples but different targets are a contract violation.
//!
//! The two modes are the two variants of an internal sum type, so every
//! operation is an exhaustive match and the fatal-vs-recoverable
//! transitions are compile-time-checked cases.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use entidb_core::schema::ReferenceSchema;
use entidb_core::{Droppable, Error, Result, Value, Versioned, INITIAL_VERSION};

use crate::reference::{Discriminator, Reference, ReferenceKey};

/// Tuple of representative attribute values identifying one duplicate
///
/// Missing attributes yield `None` slots so partially filled tuples stay
/// comparable; `None` orders before any present value.
pub type RepresentativeTuple = Vec<Option<Value>>;

/// Operating mode of a [`ReferenceBundle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BundleMode {
    /// At most one live link per target primary key
    NonDuplicate,
    /// Many links identified by representative attribute tuples
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum BundleState {
    Single {
        reference: Reference,
    },
    Duplicate {
        references: BTreeMap<Discriminator, Reference>,
        #[serde(with = "tuple_index_serde")]
        index: BTreeMap<RepresentativeTuple, Discriminator>,
        representative: Vec<String>,
        next_discriminator: Discriminator,
    },
}

/// Per (entity, relationship-name) collection of references
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceBundle {
    name: String,
    state: BundleState,
}

impl ReferenceBundle {
    /// Create a bundle in non-duplicate mode anchored at the first link
    pub fn non_duplicate(reference: Reference) -> Result<Self> {
        if !reference.key().is_generic() {
            return Err(Error::InconsistentBundle {
                detail: format!(
                    "non-duplicate bundle cannot be created from discriminated key {}",
                    reference.key()
                ),
            });
        }
        Ok(ReferenceBundle {
            name: reference.key().name().to_string(),
            state: BundleState::Single { reference },
        })
    }

    /// Relationship name the bundle belongs to
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current operating mode
    pub fn mode(&self) -> BundleMode {
        match &self.state {
            BundleState::Single { .. } => BundleMode::NonDuplicate,
            BundleState::Duplicate { .. } => BundleMode::Duplicate,
        }
    }

    /// Representative attribute names, empty outside duplicate mode
    pub fn representative_attributes(&self) -> &[String] {
        match &self.state {
            BundleState::Single { .. } => &[],
            BundleState::Duplicate { representative, .. } => representative,
        }
    }

    /// Number of live references
    pub fn count(&self) -> usize {
        self.live_references().count()
    }

    /// True when the key names a tracked duplicate member
    pub fn is_duplicate(&self, key: &ReferenceKey) -> bool {
        match &self.state {
            BundleState::Single { .. } => false,
            BundleState::Duplicate { references, .. } => {
                key.discriminator() > 0
                    && references
                        .get(&key.discriminator())
                        .map(|stored| stored.key() == key)
                        .unwrap_or(false)
            }
        }
    }

    /// Reference stored under the key, dropped ones included
    pub fn get(&self, key: &ReferenceKey) -> Option<&Reference> {
        match &self.state {
            BundleState::Single { reference } => {
                (key.is_generic() && reference.key().primary_key() == key.primary_key())
                    .then_some(reference)
            }
            BundleState::Duplicate { references, .. } => references
                .get(&key.discriminator())
                .filter(|stored| stored.key().primary_key() == key.primary_key()),
        }
    }

    /// Every stored reference, dropped ones included
    pub fn references(&self) -> Box<dyn Iterator<Item = &Reference> + '_> {
        match &self.state {
            BundleState::Single { reference } => Box::new(std::iter::once(reference)),
            BundleState::Duplicate { references, .. } => Box::new(references.values()),
        }
    }

    /// Live references only
    pub fn live_references(&self) -> impl Iterator<Item = &Reference> {
        self.references().filter(|reference| reference.exists())
    }

    // ------------------------------------------------------------------
    // Non-duplicate operations
    // ------------------------------------------------------------------

    /// Insert or update the single link of a non-duplicate bundle
    ///
    /// The candidate's version is disregarded - the bundle assigns it.
    /// Returns whether observable state changed. Inserting a second
    /// distinct target while a live link is present is a fatal
    /// internal-consistency error.
    pub fn upsert_non_duplicate(&mut self, candidate: Reference) -> Result<bool> {
        if !candidate.key().is_generic() {
            return Err(Error::InconsistentBundle {
                detail: format!(
                    "non-duplicate upsert with discriminated key {}",
                    candidate.key()
                ),
            });
        }
        match &mut self.state {
            BundleState::Duplicate { .. } => Err(Error::WrongBundleMode {
                name: self.name.clone(),
                operation: "upsert_non_duplicate",
            }),
            BundleState::Single { reference } => {
                if reference.key().primary_key() == candidate.key().primary_key() {
                    if reference.exists() && !candidate.differs_from(reference) {
                        return Ok(false);
                    }
                    let mut updated = candidate;
                    updated.key = reference.key().clone();
                    updated.version = reference.version() + 1;
                    updated.dropped = false;
                    *reference = updated;
                    Ok(true)
                } else if reference.exists() {
                    Err(Error::UnexpectedDuplicateReference {
                        key: candidate.key().to_string(),
                    })
                } else {
                    // the previous link was dropped; the relationship now
                    // points at a brand-new target
                    let mut fresh = candidate;
                    fresh.version = INITIAL_VERSION;
                    fresh.dropped = false;
                    *reference = fresh;
                    Ok(true)
                }
            }
        }
    }

    /// Soft-remove the single link of a non-duplicate bundle
    pub fn remove_non_duplicate(&mut self, key: &ReferenceKey) -> Result<()> {
        match &mut self.state {
            BundleState::Duplicate { .. } => Err(Error::WrongBundleMode {
                name: self.name.clone(),
                operation: "remove_non_duplicate",
            }),
            BundleState::Single { reference } => {
                if !key.is_generic()
                    || reference.key().primary_key() != key.primary_key()
                    || !reference.exists()
                {
                    return Err(Error::ReferenceNotPresent {
                        key: key.to_string(),
                    });
                }
                reference.version += 1;
                reference.dropped = true;
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Mode transition
    // ------------------------------------------------------------------

    /// Move the bundle into duplicate mode
    ///
    /// `previous` is the caller's view of the currently anchored link; it
    /// must match what the bundle actually stores, both by key and by
    /// representative attribute tuple - a mismatch means the caller holds
    /// a stale anchor and is a validation error. The anchored link
    /// becomes the first duplicate member, `next` the second.
    pub fn convert_to_duplicate(
        &mut self,
        next: Reference,
        previous: &Reference,
        schema: Option<&ReferenceSchema>,
    ) -> Result<()> {
        let representative: Vec<String> = schema
            .map(|schema| {
                schema
                    .representative_attributes()
                    .into_iter()
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        match &self.state {
            BundleState::Duplicate { .. } => Err(Error::WrongBundleMode {
                name: self.name.clone(),
                operation: "convert_to_duplicate",
            }),
            BundleState::Single { reference } => {
                if !reference.exists() {
                    return Err(Error::ReferenceNotPresent {
                        key: reference.key().to_string(),
                    });
                }
                let stored_tuple = reference.representative_tuple(&representative);
                if previous.key() != reference.key()
                    || previous.representative_tuple(&representative) != stored_tuple
                {
                    return Err(Error::StaleDuplicateAnchor {
                        key: previous.key().to_string(),
                    });
                }
                let next_tuple = next.representative_tuple(&representative);
                if next_tuple == stored_tuple {
                    if next.key().primary_key() == reference.key().primary_key() {
                        return Err(Error::InconsistentBundle {
                            detail: format!(
                                "conversion of `{}` should produce a duplicate but the new reference matches the anchor",
                                self.name
                            ),
                        });
                    }
                    return Err(Error::DuplicateReferenceCollision {
                        name: self.name.clone(),
                        representative: format_tuple(&next_tuple),
                    });
                }

                let mut anchor = reference.clone();
                anchor.key = anchor.key.rekeyed(1);
                let mut second = next;
                second.key = second.key.rekeyed(2);
                second.version = INITIAL_VERSION;
                second.dropped = false;

                let mut references = BTreeMap::new();
                let mut index = BTreeMap::new();
                index.insert(stored_tuple, 1);
                index.insert(next_tuple, 2);
                references.insert(1, anchor);
                references.insert(2, second);
                self.state = BundleState::Duplicate {
                    references,
                    index,
                    representative,
                    next_discriminator: 3,
                };
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Duplicate operations
    // ------------------------------------------------------------------

    /// Insert or update a member of a duplicate bundle
    ///
    /// A candidate whose representative tuple matches an existing member
    /// updates that member in place (same discriminator, size unchanged)
    /// provided the targets agree - identical tuples with different
    /// targets are a validation error. An unseen tuple mints a fresh
    /// discriminator. Returns whether observable state changed.
    pub fn upsert_duplicate(&mut self, candidate: Reference) -> Result<bool> {
        let name = self.name.clone();
        match &mut self.state {
            BundleState::Single { .. } => Err(Error::WrongBundleMode {
                name,
                operation: "upsert_duplicate",
            }),
            BundleState::Duplicate {
                references,
                index,
                representative,
                next_discriminator,
            } => {
                let tuple = candidate.representative_tuple(representative);
                let target = if candidate.key().discriminator() > 0 {
                    match references.get(&candidate.key().discriminator()) {
                        Some(stored)
                            if stored.key().primary_key() == candidate.key().primary_key() =>
                        {
                            Some(candidate.key().discriminator())
                        }
                        _ => {
                            return Err(Error::ReferenceNotPresent {
                                key: candidate.key().to_string(),
                            })
                        }
                    }
                } else {
                    index.get(&tuple).copied()
                };

                match target {
                    Some(discriminator) => {
                        let stored = match references.get(&discriminator) {
                            Some(stored) => stored,
                            None => {
                                return Err(Error::InconsistentBundle {
                                    detail: format!(
                                        "tuple index of `{name}` points at a missing member {discriminator}"
                                    ),
                                })
                            }
                        };
                        if stored.key().primary_key() != candidate.key().primary_key() {
                            return Err(Error::DuplicateReferenceCollision {
                                name,
                                representative: format_tuple(&tuple),
                            });
                        }
                        if let Some(&other) = index.get(&tuple) {
                            if other != discriminator {
                                return Err(Error::DuplicateReferenceCollision {
                                    name,
                                    representative: format_tuple(&tuple),
                                });
                            }
                        }
                        if stored.exists() && !candidate.differs_from(stored) {
                            return Ok(false);
                        }
                        let old_tuple = stored.representative_tuple(representative);
                        let mut updated = candidate;
                        updated.key = stored.key().clone();
                        updated.version = stored.version() + 1;
                        updated.dropped = false;
                        if index.get(&old_tuple) == Some(&discriminator) {
                            index.remove(&old_tuple);
                        }
                        index.insert(tuple, discriminator);
                        references.insert(discriminator, updated);
                        Ok(true)
                    }
                    None => {
                        let discriminator = *next_discriminator;
                        *next_discriminator += 1;
                        let mut fresh = candidate;
                        fresh.key = fresh.key.rekeyed(discriminator);
                        fresh.version = INITIAL_VERSION;
                        fresh.dropped = false;
                        index.insert(tuple, discriminator);
                        references.insert(discriminator, fresh);
                        Ok(true)
                    }
                }
            }
        }
    }

    /// Soft-remove a member of a duplicate bundle
    pub fn remove_duplicate(&mut self, key: &ReferenceKey) -> Result<()> {
        let name = self.name.clone();
        match &mut self.state {
            BundleState::Single { .. } => Err(Error::WrongBundleMode {
                name,
                operation: "remove_duplicate",
            }),
            BundleState::Duplicate {
                references,
                index,
                representative,
                ..
            } => {
                let stored = match references.get_mut(&key.discriminator()) {
                    Some(stored)
                        if key.discriminator() > 0
                            && stored.key().primary_key() == key.primary_key()
                            && stored.exists() =>
                    {
                        stored
                    }
                    _ => {
                        return Err(Error::ReferenceNotPresent {
                            key: key.to_string(),
                        })
                    }
                };
                stored.version += 1;
                stored.dropped = true;
                let tuple = stored.representative_tuple(representative);
                if index.get(&tuple) == Some(&key.discriminator()) {
                    index.remove(&tuple);
                }
                Ok(())
            }
        }
    }

    /// Collapse a duplicate bundle with exactly one live member back to
    /// non-duplicate mode, re-anchored at `anchor`
    pub fn discard_duplicates(&mut self, anchor: &ReferenceKey) -> Result<()> {
        match &self.state {
            BundleState::Single { .. } => Err(Error::WrongBundleMode {
                name: self.name.clone(),
                operation: "discard_duplicates",
            }),
            BundleState::Duplicate { references, .. } => {
                let live: Vec<&Reference> = references
                    .values()
                    .filter(|reference| reference.exists())
                    .collect();
                if live.len() != 1 {
                    return Err(Error::InconsistentBundle {
                        detail: format!(
                            "cannot discard duplicates of `{}` while {} live references remain",
                            self.name,
                            live.len()
                        ),
                    });
                }
                let survivor = live[0];
                if survivor.key() != anchor {
                    return Err(Error::ReferenceNotPresent {
                        key: anchor.to_string(),
                    });
                }
                let mut reference = survivor.clone();
                reference.key = reference.key.rekeyed(0);
                self.state = BundleState::Single { reference };
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Mode-agnostic entry points used by the mutation engine
    // ------------------------------------------------------------------

    /// Insert or update a reference without knowing the bundle mode
    ///
    /// `build` receives the currently stored reference for the same
    /// identity (when one exists) and produces the candidate - typically
    /// by merging attribute mutations into the stored state. When the
    /// incoming target collides with a live link to a different target,
    /// the bundle transparently converts itself to duplicate mode.
    /// Returns whether observable state changed.
    pub fn upsert_with_duplicate_conversion(
        &mut self,
        key: &ReferenceKey,
        schema: Option<&ReferenceSchema>,
        mut build: impl FnMut(Option<&Reference>) -> Result<Reference>,
    ) -> Result<bool> {
        match &self.state {
            BundleState::Single { reference } => {
                if reference.key().primary_key() == key.primary_key() || !reference.exists() {
                    let base = (reference.key().primary_key() == key.primary_key())
                        .then(|| reference.clone());
                    let candidate = build(base.as_ref())?;
                    self.upsert_non_duplicate(candidate)
                } else {
                    let previous = reference.clone();
                    let candidate = build(None)?;
                    self.convert_to_duplicate(candidate, &previous, schema)?;
                    Ok(true)
                }
            }
            BundleState::Duplicate {
                references,
                index,
                representative,
                ..
            } => {
                let base = if key.discriminator() > 0 {
                    references.get(&key.discriminator()).cloned()
                } else {
                    let probe = build(None)?;
                    let tuple = probe.representative_tuple(representative);
                    index
                        .get(&tuple)
                        .and_then(|discriminator| references.get(discriminator))
                        .cloned()
                };
                let candidate = match &base {
                    Some(stored) => {
                        let mut candidate = build(Some(stored))?;
                        candidate.key = stored.key().clone();
                        candidate
                    }
                    None => build(None)?,
                };
                self.upsert_duplicate(candidate)
            }
        }
    }

    /// Soft-remove a reference, dispatching on the current mode
    pub fn remove(&mut self, key: &ReferenceKey) -> Result<()> {
        match &self.state {
            BundleState::Single { .. } => self.remove_non_duplicate(key),
            BundleState::Duplicate { .. } => self.remove_duplicate(key),
        }
    }

    /// Rebuild a stored reference in place
    ///
    /// Used for group and reference-attribute mutations. `build` receives
    /// the stored reference and returns the rebuilt one; an identical
    /// result is a no-op. In duplicate mode a representative tuple change
    /// is re-indexed and collision-checked. Returns whether observable
    /// state changed.
    pub fn update_reference(
        &mut self,
        key: &ReferenceKey,
        build: impl FnOnce(&Reference) -> Result<Reference>,
    ) -> Result<bool> {
        let name = self.name.clone();
        match &mut self.state {
            BundleState::Single { reference } => {
                if !key.is_generic()
                    || reference.key().primary_key() != key.primary_key()
                    || !reference.exists()
                {
                    return Err(Error::ReferenceNotPresent {
                        key: key.to_string(),
                    });
                }
                let candidate = build(reference)?;
                if !candidate.differs_from(reference) {
                    return Ok(false);
                }
                let mut updated = candidate;
                updated.key = reference.key().clone();
                updated.version = reference.version() + 1;
                updated.dropped = false;
                *reference = updated;
                Ok(true)
            }
            BundleState::Duplicate {
                references,
                index,
                representative,
                ..
            } => {
                let stored = match references.get(&key.discriminator()) {
                    Some(stored)
                        if key.discriminator() > 0
                            && stored.key().primary_key() == key.primary_key()
                            && stored.exists() =>
                    {
                        stored.clone()
                    }
                    _ => {
                        return Err(Error::ReferenceNotPresent {
                            key: key.to_string(),
                        })
                    }
                };
                let candidate = build(&stored)?;
                if !candidate.differs_from(&stored) {
                    return Ok(false);
                }
                let old_tuple = stored.representative_tuple(representative);
                let new_tuple = candidate.representative_tuple(representative);
                if new_tuple != old_tuple {
                    if let Some(&other) = index.get(&new_tuple) {
                        if other != key.discriminator() {
                            return Err(Error::DuplicateReferenceCollision {
                                name,
                                representative: format_tuple(&new_tuple),
                            });
                        }
                    }
                }
                let mut updated = candidate;
                updated.key = stored.key().clone();
                updated.version = stored.version() + 1;
                updated.dropped = false;
                if index.get(&old_tuple) == Some(&key.discriminator()) {
                    index.remove(&old_tuple);
                }
                index.insert(new_tuple, key.discriminator());
                references.insert(key.discriminator(), updated);
                Ok(true)
            }
        }
    }
}

fn format_tuple(tuple: &RepresentativeTuple) -> String {
    let parts: Vec<String> = tuple
        .iter()
        .map(|value| match value {
            Some(value) => format!("{value:?}"),
            None => "<none>".to_string(),
        })
        .collect();
    format!("[{}]", parts.join(", "))
}

mod tuple_index_serde {
    //! The tuple index is keyed by value tuples, which common
    //! self-describing formats cannot express as map keys; it travels as
    //! a sequence of pairs instead.

    use super::{Discriminator, RepresentativeTuple};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        index: &BTreeMap<RepresentativeTuple, Discriminator>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let entries: Vec<(&RepresentativeTuple, &Discriminator)> = index.iter().collect();
        entries.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<RepresentativeTuple, Discriminator>, D::Error> {
        let entries: Vec<(RepresentativeTuple, Discriminator)> =
            Vec::deserialize(deserializer)?;
        Ok(entries.into_iter().collect())
    }
}
