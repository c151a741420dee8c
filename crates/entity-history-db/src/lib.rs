//! `PostgreSQL` backend for entity relationship activation history.
//!
//! Persists the two logical tables (`entity_relationship` and
//! `entity_relationship_activation_event`) and routes every write to the
//! relationship table through a single gateway that appends the matching
//! events inside the same database transaction.
//!
//! # Architecture
//!
//! ```text
//! caller
//!     |
//!     +-- PostgresPool::gateway().begin() --> GatewayTransaction
//!     |       |-- create / create_many     INSERT ... RETURNING
//!     |       |-- delete / delete_where    DELETE ... RETURNING
//!     |       |-- save                     INSERT ... ON CONFLICT DO NOTHING
//!     |       +-- commit                   clock_timestamp(), UNNEST events, COMMIT
//!     |
//!     +-- ActivationEventStore            (time, id)-ordered streams
//! ```
//!
//! # Modules
//!
//! - [`postgres`] -- `PostgreSQL` connection pool, configuration, migrations, schema check
//! - [`gateway`] -- Transactional write gateway for relationship rows
//! - [`event_store`] -- Read-only, paginated event queries
//! - [`error`] -- Shared error types

pub mod error;
pub mod event_store;
pub mod gateway;
pub mod postgres;

// Re-export primary types for convenience.
pub use error::DbError;
pub use event_store::{ActivationEventRow, ActivationEventStore};
pub use gateway::{GatewayTransaction, RelationshipGateway};
pub use postgres::{PostgresConfig, PostgresPool};
