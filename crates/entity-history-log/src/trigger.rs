//! The write interceptor attached to every relationship transaction.
//!
//! Each [`Transaction`](crate::Transaction) owns one [`TriggerEngine`].
//! Every statement hands its batch of affected rows to
//! [`TriggerEngine::intercept`], which validates the whole batch before
//! staging any of it. At commit, [`TriggerEngine::fire`] runs the
//! transition detector over the staged rows, in the order they were
//! processed, with the commit timestamp.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use entity_history_types::{PendingEvent, RelationshipRow};

use crate::catalog::EntityCatalog;
use crate::transition::{self, RowOp};
use crate::HistoryError;

/// One row mutation staged inside an open transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedWrite {
    /// Whether the row was inserted or removed.
    pub op: RowOp,
    /// The affected row.
    pub row: RelationshipRow,
}

/// Per-transaction interceptor that stages row writes and turns them into
/// events.
#[derive(Debug, Default)]
pub struct TriggerEngine {
    catalog: Option<Arc<dyn EntityCatalog>>,
    staged: Vec<StagedWrite>,
}

impl TriggerEngine {
    /// Create an interceptor, optionally checking inserts against `catalog`.
    pub fn new(catalog: Option<Arc<dyn EntityCatalog>>) -> Self {
        Self {
            catalog,
            staged: Vec::new(),
        }
    }

    /// Validate and stage one statement's affected rows.
    ///
    /// Nothing is staged unless every row passes.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::MalformedRow`] for a nil reference, or
    /// [`HistoryError::MissingEntity`] when an inserted row names an entity
    /// the catalog does not know.
    pub fn intercept(&mut self, op: RowOp, rows: &[RelationshipRow]) -> Result<(), HistoryError> {
        self.validate(op, rows)?;
        self.staged
            .extend(rows.iter().map(|&row| StagedWrite { op, row }));
        Ok(())
    }

    /// Check `rows` without staging them.
    ///
    /// Used by backends that must reject a row before the store sees it.
    pub fn validate(&self, op: RowOp, rows: &[RelationshipRow]) -> Result<(), HistoryError> {
        rows.iter().try_for_each(|row| self.check_row(op, row))
    }

    fn check_row(&self, op: RowOp, row: &RelationshipRow) -> Result<(), HistoryError> {
        if row.has_nil_reference() {
            return Err(HistoryError::MalformedRow {
                row: *row,
                reason: "nil entity reference",
            });
        }

        // Removals are always recorded, even after the catalog has dropped
        // the entity.
        let Some(catalog) = self.catalog.as_ref().filter(|_| op == RowOp::Insert) else {
            return Ok(());
        };
        for entity in [row.sub_entity, row.super_entity] {
            if !catalog.contains(entity) {
                return Err(HistoryError::MissingEntity { entity });
            }
        }
        Ok(())
    }

    /// Every staged write, in processing order.
    pub fn staged(&self) -> &[StagedWrite] {
        &self.staged
    }

    /// Number of staged writes.
    pub fn len(&self) -> usize {
        self.staged.len()
    }

    /// Whether nothing has been staged.
    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Run the transition detector over every staged write.
    pub fn fire(&self, time: DateTime<Utc>) -> Vec<PendingEvent> {
        self.staged
            .iter()
            .map(|w| transition::detect(w.op, &w.row, time))
            .collect()
    }

    /// Drop everything staged so far.
    pub fn discard(&mut self) {
        self.staged.clear();
    }
}

#[cfg(test)]
mod tests {
    use entity_history_types::EntityId;
    use uuid::Uuid;

    use super::*;
    use crate::catalog::InMemoryCatalog;

    fn row() -> RelationshipRow {
        RelationshipRow::new(EntityId::new(), EntityId::new())
    }

    #[test]
    fn fire_preserves_processing_order() -> Result<(), HistoryError> {
        let mut trigger = TriggerEngine::new(None);
        let rows = [row(), row(), row()];
        trigger.intercept(RowOp::Insert, &rows)?;
        trigger.intercept(RowOp::Remove, &rows[..1])?;

        let now = Utc::now();
        let events = trigger.fire(now);
        assert_eq!(events.len(), 4);
        let pairs: Vec<_> = events.iter().map(|e| (e.sub_entity, e.was_activated)).collect();
        assert_eq!(
            pairs,
            vec![
                (rows[0].sub_entity, true),
                (rows[1].sub_entity, true),
                (rows[2].sub_entity, true),
                (rows[0].sub_entity, false),
            ]
        );
        assert!(events.iter().all(|e| e.time == now));
        Ok(())
    }

    #[test]
    fn nil_reference_rejects_whole_batch() {
        let mut trigger = TriggerEngine::new(None);
        let bad = RelationshipRow::new(EntityId::from(Uuid::nil()), EntityId::new());
        let result = trigger.intercept(RowOp::Insert, &[row(), bad]);
        assert!(matches!(result, Err(HistoryError::MalformedRow { .. })));
        assert!(trigger.is_empty());
    }

    #[test]
    fn catalog_checked_on_insert_only() {
        let known = EntityId::new();
        let unknown = EntityId::new();
        let catalog: Arc<dyn EntityCatalog> = Arc::new(InMemoryCatalog::from_iter([known]));
        let mut trigger = TriggerEngine::new(Some(catalog));
        let r = RelationshipRow::new(known, unknown);

        assert_eq!(
            trigger.intercept(RowOp::Insert, &[r]),
            Err(HistoryError::MissingEntity { entity: unknown })
        );
        assert_eq!(trigger.intercept(RowOp::Remove, &[r]), Ok(()));
        assert_eq!(trigger.len(), 1);
    }
}
