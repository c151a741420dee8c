//! The write gateway.
//!
//! A [`Transaction`] is the only way to mutate the relationship store. Every
//! statement locks the pairs it touches, checks them against the rows the
//! transaction can see, and hands the affected rows to the transaction's
//! [`TriggerEngine`]. Nothing is visible to other readers until
//! [`Transaction::commit`] publishes the staged rows and their events in one
//! step.
//!
//! A failed statement aborts the whole transaction. Later statements and
//! `commit` return [`HistoryError::TransactionAborted`], and dropping the
//! transaction discards everything it staged.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use entity_history_types::{ActivationEvent, RelationshipRow, RowFilter};

use crate::HistoryError;
use crate::history::EntityHistory;
use crate::store::TxnId;
use crate::transition::RowOp;
use crate::trigger::TriggerEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Active,
    Aborted,
    Finished,
}

/// What a successful commit published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    /// The timestamp every event of the transaction carries.
    pub committed_at: DateTime<Utc>,
    /// The appended events, in sequence order.
    pub events: Vec<ActivationEvent>,
}

impl CommitReceipt {
    /// Number of activation events.
    pub fn activations(&self) -> usize {
        self.events.iter().filter(|e| e.was_activated).count()
    }

    /// Number of deactivation events.
    pub fn deactivations(&self) -> usize {
        self.events.iter().filter(|e| !e.was_activated).count()
    }

    /// Whether the transaction changed nothing.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// An open unit of work against an [`EntityHistory`].
#[derive(Debug)]
pub struct Transaction<'h> {
    history: &'h EntityHistory,
    id: TxnId,
    trigger: TriggerEngine,
    /// Presence of every pair this transaction has written, as it will be
    /// after commit.
    overlay: BTreeMap<RelationshipRow, bool>,
    locked: BTreeSet<RelationshipRow>,
    state: TxnState,
}

impl<'h> Transaction<'h> {
    pub(crate) fn new(history: &'h EntityHistory, id: TxnId) -> Self {
        Self {
            history,
            id,
            trigger: history.trigger(),
            overlay: BTreeMap::new(),
            locked: BTreeSet::new(),
            state: TxnState::Active,
        }
    }

    /// This transaction's identifier.
    pub const fn id(&self) -> TxnId {
        self.id
    }

    /// Whether a failed statement has aborted this transaction.
    pub fn is_aborted(&self) -> bool {
        self.state == TxnState::Aborted
    }

    /// Number of row writes staged so far.
    pub fn staged_writes(&self) -> usize {
        self.trigger.len()
    }

    /// Whether `row` is active as seen from inside this transaction.
    pub fn is_active(&self, row: &RelationshipRow) -> bool {
        self.overlay
            .get(row)
            .copied()
            .unwrap_or_else(|| self.history.relationships().contains(row))
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    /// Activate one relationship.
    ///
    /// # Errors
    ///
    /// [`HistoryError::UniqueViolation`] if the pair is already active, or
    /// any interceptor or lock failure. The transaction is aborted on error.
    pub fn create(&mut self, row: RelationshipRow) -> Result<(), HistoryError> {
        self.create_many(&[row]).map(|_| ())
    }

    /// Activate every row in `rows`, in order, as one statement.
    ///
    /// Either every row is staged or none is. Returns the number of rows
    /// activated.
    pub fn create_many(&mut self, rows: &[RelationshipRow]) -> Result<usize, HistoryError> {
        self.statement(|tx| {
            let mut seen = BTreeSet::new();
            for row in rows {
                tx.lock(*row)?;
                if !seen.insert(*row) || tx.is_active(row) {
                    return Err(HistoryError::UniqueViolation { row: *row });
                }
            }
            tx.trigger.intercept(RowOp::Insert, rows)?;
            tx.overlay.extend(rows.iter().map(|row| (*row, true)));
            Ok(rows.len())
        })
    }

    /// Deactivate one relationship.
    ///
    /// Returns `false`, and records nothing, if the pair was not active.
    pub fn delete(&mut self, row: RelationshipRow) -> Result<bool, HistoryError> {
        self.statement(|tx| {
            tx.lock(row)?;
            if !tx.is_active(&row) {
                return Ok(false);
            }
            tx.trigger.intercept(RowOp::Remove, &[row])?;
            tx.overlay.insert(row, false);
            Ok(true)
        })
    }

    /// Deactivate every active relationship matching `filter`.
    ///
    /// Matching rows are processed in pair order. Returns the number of rows
    /// deactivated.
    pub fn delete_where(&mut self, filter: &RowFilter) -> Result<usize, HistoryError> {
        self.statement(|tx| {
            let mut candidates: BTreeSet<RelationshipRow> = tx
                .history
                .relationships()
                .select(filter)
                .into_iter()
                .collect();
            candidates.extend(
                tx.overlay
                    .iter()
                    .filter(|(row, active)| **active && filter.matches(row))
                    .map(|(row, _)| *row),
            );

            let mut doomed = Vec::with_capacity(candidates.len());
            for row in candidates {
                tx.lock(row)?;
                // Another transaction may have removed it before we locked.
                if tx.is_active(&row) {
                    doomed.push(row);
                }
            }

            tx.trigger.intercept(RowOp::Remove, &doomed)?;
            tx.overlay.extend(doomed.iter().map(|row| (*row, false)));
            Ok(doomed.len())
        })
    }

    /// Persist `row`, creating it only if it is not already active.
    ///
    /// Saving an active row is a no-op and records no event. Returns whether
    /// the row was created.
    pub fn save(&mut self, row: RelationshipRow) -> Result<bool, HistoryError> {
        self.statement(|tx| {
            tx.lock(row)?;
            if tx.is_active(&row) {
                return Ok(false);
            }
            tx.trigger.intercept(RowOp::Insert, &[row])?;
            tx.overlay.insert(row, true);
            Ok(true)
        })
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    /// Publish every staged row write together with its events.
    ///
    /// # Errors
    ///
    /// [`HistoryError::TransactionAborted`] if a statement failed earlier,
    /// or the event log's failure. Either way nothing is published.
    pub fn commit(mut self) -> Result<CommitReceipt, HistoryError> {
        if self.state != TxnState::Active {
            debug!(txn = %self.id, "discarding aborted transaction");
            return Err(HistoryError::TransactionAborted);
        }

        match self.history.publish(&self.trigger) {
            Ok(receipt) => {
                self.state = TxnState::Finished;
                debug!(
                    txn = %self.id,
                    rows = self.trigger.len(),
                    activations = receipt.activations(),
                    deactivations = receipt.deactivations(),
                    "transaction committed"
                );
                Ok(receipt)
            }
            Err(err) => {
                self.state = TxnState::Aborted;
                warn!(txn = %self.id, error = %err, "commit failed, rolling back");
                Err(err)
            }
        }
    }

    /// Discard everything staged so far.
    pub fn rollback(mut self) {
        self.trigger.discard();
        self.state = TxnState::Finished;
        debug!(txn = %self.id, "transaction rolled back");
    }

    /// Run one statement, aborting the transaction if it fails.
    fn statement<T>(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<T, HistoryError>,
    ) -> Result<T, HistoryError> {
        if self.state != TxnState::Active {
            return Err(HistoryError::TransactionAborted);
        }
        let result = body(self);
        if let Err(err) = &result {
            warn!(txn = %self.id, error = %err, "statement failed, transaction aborted");
            self.state = TxnState::Aborted;
            self.trigger.discard();
        }
        result
    }

    fn lock(&mut self, row: RelationshipRow) -> Result<(), HistoryError> {
        self.history.relationships().lock_row(row, self.id)?;
        self.locked.insert(row);
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.history
            .relationships()
            .unlock_rows(&self.locked, self.id);
    }
}

#[cfg(test)]
mod tests {
    use entity_history_types::EntityId;

    use super::*;

    fn row() -> RelationshipRow {
        RelationshipRow::new(EntityId::new(), EntityId::new())
    }

    #[test]
    fn reads_own_writes_before_commit() -> Result<(), HistoryError> {
        let history = EntityHistory::new();
        let r = row();
        let mut tx = history.begin();
        tx.create(r)?;
        assert!(tx.is_active(&r));
        assert!(!history.is_active(&r));
        assert!(tx.delete(r)?);
        assert!(!tx.is_active(&r));
        tx.commit()?;
        Ok(())
    }

    #[test]
    fn duplicate_within_batch_is_rejected() {
        let history = EntityHistory::new();
        let r = row();
        let mut tx = history.begin();
        let result = tx.create_many(&[r, row(), r]);
        assert_eq!(result, Err(HistoryError::UniqueViolation { row: r }));
        assert!(tx.is_aborted());
        assert_eq!(tx.staged_writes(), 0);
    }

    #[test]
    fn aborted_transaction_refuses_further_work() {
        let history = EntityHistory::new();
        let r = row();
        let mut tx = history.begin();
        assert!(tx.create_many(&[r, r]).is_err());
        assert_eq!(tx.create(row()), Err(HistoryError::TransactionAborted));
        assert_eq!(tx.commit(), Err(HistoryError::TransactionAborted));
        assert!(history.events().is_empty());
    }

    #[test]
    fn delete_of_missing_row_is_silent() -> Result<(), HistoryError> {
        let history = EntityHistory::new();
        let mut tx = history.begin();
        assert!(!tx.delete(row())?);
        let receipt = tx.commit()?;
        assert!(receipt.is_empty());
        Ok(())
    }

    #[test]
    fn delete_where_sees_rows_created_in_same_transaction() -> Result<(), HistoryError> {
        let history = EntityHistory::new();
        let parent = EntityId::new();
        let committed = RelationshipRow::new(EntityId::new(), parent);
        history.create(committed)?;

        let mut tx = history.begin();
        tx.create(RelationshipRow::new(EntityId::new(), parent))?;
        tx.create(row())?;
        assert_eq!(tx.delete_where(&RowFilter::all().super_entity(parent))?, 2);
        let receipt = tx.commit()?;
        assert_eq!(receipt.activations(), 2);
        assert_eq!(receipt.deactivations(), 2);
        assert_eq!(history.len(), 1);
        Ok(())
    }

    #[test]
    fn locks_released_on_drop() -> Result<(), HistoryError> {
        let history = EntityHistory::new();
        let r = row();
        {
            let mut tx = history.begin();
            tx.create(r)?;
            assert_eq!(history.relationships().locked_rows(), 1);
        }
        assert_eq!(history.relationships().locked_rows(), 0);
        assert!(history.events().is_empty());
        Ok(())
    }
}
