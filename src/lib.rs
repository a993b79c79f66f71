//! entidb - in-memory entity data model for a document-oriented catalog
//! database
//!
//! entidb is the core data model of a catalog engine: one versioned
//! business entity with its attributes, associated data, hierarchical
//! reference links and sellable prices, the engine applying ordered
//! mutation commands to produce new immutable versions, and the engine
//! resolving "the price for sale" from candidate prices.
//!
//! # Quick Start
//!
//! ```
//! use entidb::{AttributeSchema, EntityBuilder, EntitySchema, ValueKind};
//!
//! let schema = EntitySchema::new("Product")
//!     .with_attribute(AttributeSchema::new("code", ValueKind::String));
//!
//! let mut builder = EntityBuilder::new(&schema, Some(1));
//! builder.set_attribute("code", "TV-123")?;
//! let entity = builder.build()?;
//!
//! assert_eq!(entity.attribute("code").and_then(|v| v.as_str()), Some("TV-123"));
//! # Ok::<(), entidb::Error>(())
//! ```
//!
//! # Architecture
//!
//! The surrounding storage/transaction engine feeds ordered
//! [`LocalMutation`] lists into [`Entity::mutate`] and persists the
//! result - unless the identity-preserving no-op handed the base entity
//! back unchanged, which signals that no new version needs to be
//! written. The API-facing layer only ever uses the same read accessors
//! any other consumer uses.
//!
//! The core performs no I/O and knows no wire protocol; durability,
//! querying, indexing and transport all live in the surrounding layers.

// Re-export the public API of the member crates
pub use entidb_core::*;
pub use entidb_entity::*;
