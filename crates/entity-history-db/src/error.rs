//! Error types for the `PostgreSQL` backend.
//!
//! All errors are propagated via [`DbError`], which wraps the underlying
//! [`sqlx`] errors and the write-path errors shared with the in-process
//! engine.

use entity_history_log::HistoryError;

/// Errors that can occur in the `PostgreSQL` backend.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A `PostgreSQL` operation failed.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A `PostgreSQL` migration failed.
    #[error("PostgreSQL migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The write path rejected a statement (duplicate pair, malformed row,
    /// unknown entity, or an already aborted transaction).
    #[error(transparent)]
    History(#[from] HistoryError),

    /// A stored event id does not fit an event sequence number.
    #[error("event id {0} is out of range")]
    SequenceOutOfRange(i64),

    /// A table the gateway needs does not exist; run the migrations first.
    #[error("table {table} is missing; run `entity-history migrate`")]
    SchemaMissing {
        /// The first missing table.
        table: String,
    },

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
