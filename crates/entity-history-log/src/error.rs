//! Error types for the relationship store and event log.
//!
//! Every failure inside a transaction aborts it: no row mutation and no
//! event from that transaction is ever made visible.

use entity_history_types::{EntityId, RelationshipRow};

/// Errors that can occur while writing relationships or appending events.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    /// The pair is already active; relationship rows are unique per pair.
    #[error("relationship {row} already exists")]
    UniqueViolation {
        /// The duplicate pair.
        row: RelationshipRow,
    },

    /// The interceptor rejected a row it cannot record.
    #[error("malformed relationship {row}: {reason}")]
    MalformedRow {
        /// The rejected pair.
        row: RelationshipRow,
        /// Why the row was rejected.
        reason: &'static str,
    },

    /// An entity reference is unknown to the configured entity catalog.
    #[error("entity {entity} is not in the catalog")]
    MissingEntity {
        /// The unknown reference.
        entity: EntityId,
    },

    /// The event log has no room for the transaction's events.
    #[error("event log is full (capacity {capacity})")]
    LogFull {
        /// The configured capacity.
        capacity: usize,
    },

    /// The event sequence counter would overflow.
    #[error("event sequence exhausted")]
    SequenceExhausted,

    /// Another open transaction is writing the same pair.
    #[error("relationship {row} is locked by another transaction")]
    RowLocked {
        /// The contended pair.
        row: RelationshipRow,
    },

    /// An earlier statement failed; the transaction can only be rolled back.
    #[error("transaction aborted by an earlier failure")]
    TransactionAborted,
}
