//! Composition root.
//!
//! An [`EntityHistory`] owns the relationship store, the event log and the
//! clock, and is the only place a [`Transaction`] can be opened. There is no
//! way to reach the store's write path without going through the
//! interceptor, so the wiring cannot be forgotten or done out of order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use entity_history_types::{RelationshipRow, RowFilter};

use crate::HistoryError;
use crate::catalog::EntityCatalog;
use crate::clock::{Clock, SystemClock};
use crate::event_log::EventLog;
use crate::store::{RelationshipStore, TxnId};
use crate::transaction::{CommitReceipt, Transaction};
use crate::trigger::TriggerEngine;

/// Configures and builds an [`EntityHistory`].
#[derive(Debug, Default)]
pub struct EntityHistoryBuilder {
    clock: Option<Arc<dyn Clock>>,
    catalog: Option<Arc<dyn EntityCatalog>>,
    event_capacity: Option<usize>,
    page_size: Option<usize>,
}

impl EntityHistoryBuilder {
    /// Use `clock` for commit timestamps instead of the system clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Check every activated entity reference against `catalog`.
    #[must_use]
    pub fn catalog(mut self, catalog: Arc<dyn EntityCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Refuse commits that would grow the event log past `capacity` events.
    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }

    /// Events scanned per lock acquisition when iterating a query.
    #[must_use]
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Build the store, already wrapped by the interceptor.
    pub fn build(self) -> EntityHistory {
        let mut log = EventLog::with_capacity_limit(self.event_capacity);
        if let Some(page_size) = self.page_size {
            log = log.with_page_size(page_size);
        }
        debug!(
            capacity = ?self.event_capacity,
            catalog = self.catalog.is_some(),
            "entity history initialized"
        );
        EntityHistory {
            rows: RelationshipStore::new(),
            log,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            catalog: self.catalog,
            next_txn: AtomicU64::new(1),
        }
    }
}

/// A relationship store paired with its activation event log.
#[derive(Debug)]
pub struct EntityHistory {
    rows: RelationshipStore,
    log: EventLog,
    clock: Arc<dyn Clock>,
    catalog: Option<Arc<dyn EntityCatalog>>,
    next_txn: AtomicU64,
}

impl EntityHistory {
    /// An unbounded history on the system clock, with no catalog.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start configuring a history.
    pub fn builder() -> EntityHistoryBuilder {
        EntityHistoryBuilder::default()
    }

    /// Open a transaction.
    pub fn begin(&self) -> Transaction<'_> {
        let id = TxnId(self.next_txn.fetch_add(1, Ordering::Relaxed));
        Transaction::new(self, id)
    }

    /// Run `body` in a transaction, committing on `Ok` and rolling back on
    /// `Err`.
    pub fn atomic<T, E>(
        &self,
        body: impl FnOnce(&mut Transaction<'_>) -> Result<T, E>,
    ) -> Result<(T, CommitReceipt), E>
    where
        E: From<HistoryError>,
    {
        let mut tx = self.begin();
        match body(&mut tx) {
            Ok(value) => Ok((value, tx.commit()?)),
            Err(err) => {
                tx.rollback();
                Err(err)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Autocommit writes
    // -----------------------------------------------------------------------

    /// Activate one relationship in its own transaction.
    pub fn create(&self, row: RelationshipRow) -> Result<CommitReceipt, HistoryError> {
        self.atomic(|tx| tx.create(row)).map(|(_, receipt)| receipt)
    }

    /// Activate a batch of relationships in one transaction.
    pub fn create_many(&self, rows: &[RelationshipRow]) -> Result<CommitReceipt, HistoryError> {
        self.atomic(|tx| tx.create_many(rows))
            .map(|(_, receipt)| receipt)
    }

    /// Deactivate one relationship in its own transaction.
    ///
    /// The receipt is empty if the pair was not active.
    pub fn delete(&self, row: RelationshipRow) -> Result<CommitReceipt, HistoryError> {
        self.atomic(|tx| tx.delete(row)).map(|(_, receipt)| receipt)
    }

    /// Deactivate every relationship matching `filter` in one transaction.
    pub fn delete_where(&self, filter: &RowFilter) -> Result<CommitReceipt, HistoryError> {
        self.atomic(|tx| tx.delete_where(filter))
            .map(|(_, receipt)| receipt)
    }

    /// Save one relationship in its own transaction.
    ///
    /// The receipt is empty if the pair was already active.
    pub fn save(&self, row: RelationshipRow) -> Result<CommitReceipt, HistoryError> {
        self.atomic(|tx| tx.save(row)).map(|(_, receipt)| receipt)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Whether `row` is active in committed state.
    pub fn is_active(&self, row: &RelationshipRow) -> bool {
        self.rows.contains(row)
    }

    /// Committed rows matching `filter`.
    pub fn rows(&self, filter: &RowFilter) -> Vec<RelationshipRow> {
        self.rows.select(filter)
    }

    /// Number of active relationships.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no relationship is active.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Read access to the event log.
    pub const fn events(&self) -> &EventLog {
        &self.log
    }

    /// Read access to the relationship store.
    pub const fn relationships(&self) -> &RelationshipStore {
        &self.rows
    }

    // -----------------------------------------------------------------------
    // Commit path
    // -----------------------------------------------------------------------

    pub(crate) fn trigger(&self) -> TriggerEngine {
        TriggerEngine::new(self.catalog.clone())
    }

    /// Stamp, sequence and apply one transaction's staged writes.
    ///
    /// No lock is held while the clock is read. Each pair's event and row
    /// change are published together under that pair's slot; the caller's
    /// row locks keep other writers of those pairs out until this returns.
    pub(crate) fn publish(&self, trigger: &TriggerEngine) -> Result<CommitReceipt, HistoryError> {
        let committed_at = self.log.stamp(self.clock.now());
        let events = self.log.sequence(trigger.fire(committed_at))?;
        for (write, event) in trigger.staged().iter().zip(&events) {
            self.rows.apply_with(write, || self.log.publish(*event));
        }
        Ok(CommitReceipt {
            committed_at,
            events,
        })
    }
}

impl Default for EntityHistory {
    fn default() -> Self {
        Self::new()
    }
}
