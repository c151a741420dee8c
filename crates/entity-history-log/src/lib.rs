//! Transactional relationship store with an append-only activation log.
//!
//! Every write to the relationship store passes through a single gateway
//! (the [`Transaction`]). The gateway hands every affected row to the
//! [`TriggerEngine`], which runs the transition detector and appends one
//! [`ActivationEvent`](entity_history_types::ActivationEvent) per row to the
//! [`EventLog`] inside the same commit. Row mutations and their events
//! become visible together or not at all.
//!
//! # Architecture
//!
//! ```text
//! caller
//!   |
//!   +-- EntityHistory::begin() --> Transaction (create / create_many /
//!   |                                delete / delete_where / save)
//!   |        |
//!   |        +-- TriggerEngine::intercept()   validate + stage rows
//!   |
//!   +-- Transaction::commit()
//!            |-- EventLog::stamp(Clock::now()) commit timestamp
//!            |-- TriggerEngine::fire()         transition::detect per row
//!            |-- EventLog::sequence()          capacity + id range (atomics)
//!            +-- per pair: RelationshipStore::apply_with()
//!                   +-- EventLog::publish()    event and row change together
//! ```
//!
//! # Modules
//!
//! - [`clock`] -- Time source for commit timestamps
//! - [`transition`] -- Pure mapping from row operations to events
//! - [`event_log`] -- Append-only, queryable event log
//! - [`trigger`] -- Per-transaction write interceptor
//! - [`catalog`] -- Optional entity catalog consulted on inserts
//! - [`store`] -- Current relationship rows and per-pair row locks
//! - [`transaction`] -- The write gateway
//! - [`history`] -- Composition root tying the pieces together
//! - [`error`] -- Shared error type
//!
//! # Usage
//!
//! ```
//! use entity_history_log::EntityHistory;
//! use entity_history_types::{EntityId, EventFilter, RelationshipRow};
//!
//! let history = EntityHistory::new();
//! let row = RelationshipRow::new(EntityId::new(), EntityId::new());
//!
//! history.create(row).ok();
//! history.delete(row).ok();
//!
//! let flags: Vec<bool> = history
//!     .events()
//!     .query(EventFilter::for_pair(&row))
//!     .iter()
//!     .map(|e| e.was_activated)
//!     .collect();
//! assert_eq!(flags, vec![true, false]);
//! ```

pub mod catalog;
pub mod clock;
pub mod error;
pub mod event_log;
pub mod history;
pub mod store;
pub mod transaction;
pub mod transition;
pub mod trigger;

// Re-export primary types at crate root.
pub use catalog::{EntityCatalog, InMemoryCatalog};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::HistoryError;
pub use event_log::{EventIter, EventLog, EventQuery};
pub use history::{EntityHistory, EntityHistoryBuilder};
pub use store::RelationshipStore;
pub use transaction::{CommitReceipt, Transaction};
pub use transition::RowOp;
pub use trigger::{StagedWrite, TriggerEngine};
