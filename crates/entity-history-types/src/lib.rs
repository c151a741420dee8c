//! Shared type definitions for entity relationship activation history.
//!
//! This crate is the single source of truth for the types that flow between
//! the in-process engine (`entity-history-log`), the `PostgreSQL` backend
//! (`entity-history-db`), and the command-line tool.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe wrappers for entity references and event sequence numbers
//! - [`structs`] -- Relationship rows and activation events
//! - [`filter`] -- Row and event filters used by bulk deletes and history queries
//!
//! # Data Model
//!
//! A directed relationship `(sub_entity, super_entity)` is active exactly
//! while its [`RelationshipRow`] exists. Creating the row is an activation,
//! removing it is a deactivation. Every transition is recorded as one
//! immutable [`ActivationEvent`], ordered by `(time, id)`.

pub mod filter;
pub mod ids;
pub mod structs;

// Re-export all public types at crate root for convenience.
pub use filter::{EventFilter, RowFilter};
pub use ids::{EntityId, EventSeq};
pub use structs::{ActivationEvent, PendingEvent, RelationshipRow, Transition};
