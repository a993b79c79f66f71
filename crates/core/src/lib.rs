//! Core types for the entity data model
//!
//! This crate defines the foundational types used throughout the system:
//! - Value / ValueKind: Unified payload enum and its type tags
//! - Locale / Currency: Validated identifier newtypes
//! - DateTimeRange: Validity windows for time-bounded data
//! - Version / Versioned / Droppable: Versioning and soft-removal contract
//! - Error / ErrorCategory: Failure taxonomy
//! - schema: Read-only schema contract, evolution modes and proposed
//!   schema mutations

#![warn(missing_docs)]
#![warn(clippy::all)]

// Module declarations
pub mod error;
pub mod ident;
pub mod range;
pub mod schema;
pub mod value;
pub mod versioned;

// Re-export commonly used types at the crate root
pub use error::{Error, ErrorCategory, Result};
pub use ident::{Currency, Locale};
pub use range::DateTimeRange;
pub use schema::{
    verify_associated_data, verify_attribute, verify_price, verify_reference,
    AssociatedDataSchema, AttributeSchema, EntitySchema, EvolutionMode, ReferenceSchema,
    SchemaMutation,
};
pub use value::{Value, ValueKind};
pub use versioned::{Droppable, Version, Versioned, INITIAL_VERSION};
