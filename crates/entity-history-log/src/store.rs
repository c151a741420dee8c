//! Current relationship rows and per-pair row locks.
//!
//! The store is only reachable for writes through a
//! [`Transaction`](crate::Transaction); its public surface is read-only.
//!
//! Every pair owns one slot in a sharded map: whether the row is active and
//! which open transaction holds its row lock. Work on one pair touches only
//! that pair's shard, and only for the length of a single map operation.
//! Nothing is held while a clock is read or another pair is written.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use entity_history_types::{RelationshipRow, RowFilter};

use crate::HistoryError;
use crate::transition::RowOp;
use crate::trigger::StagedWrite;

/// Identifier of an open transaction, used as a row-lock owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnId(pub u64);

impl core::fmt::Display for TxnId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PairSlot {
    active: bool,
    holder: Option<TxnId>,
}

impl PairSlot {
    const fn is_vacant(self) -> bool {
        !self.active && self.holder.is_none()
    }
}

/// The set of active relationships.
#[derive(Debug, Default)]
pub struct RelationshipStore {
    pairs: DashMap<RelationshipRow, PairSlot>,
}

impl RelationshipStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Whether `row` is currently active.
    pub fn contains(&self, row: &RelationshipRow) -> bool {
        self.pairs.get(row).is_some_and(|slot| slot.active)
    }

    /// Every active row matching `filter`, in pair order.
    pub fn select(&self, filter: &RowFilter) -> Vec<RelationshipRow> {
        let mut rows: Vec<RelationshipRow> = self
            .pairs
            .iter()
            .filter(|entry| entry.value().active && filter.matches(entry.key()))
            .map(|entry| *entry.key())
            .collect();
        rows.sort_unstable();
        rows
    }

    /// Number of active rows.
    pub fn len(&self) -> usize {
        self.pairs.iter().filter(|entry| entry.value().active).count()
    }

    /// Whether no relationship is active.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the lock on `row` for `owner`. Re-locking one's own row is a
    /// no-op.
    pub(crate) fn lock_row(&self, row: RelationshipRow, owner: TxnId) -> Result<(), HistoryError> {
        let mut slot = self.pairs.entry(row).or_default();
        match slot.holder {
            Some(holder) if holder != owner => Err(HistoryError::RowLocked { row }),
            _ => {
                slot.holder = Some(owner);
                Ok(())
            }
        }
    }

    /// Release every lock in `rows` held by `owner`.
    pub(crate) fn unlock_rows<'a>(
        &self,
        rows: impl IntoIterator<Item = &'a RelationshipRow>,
        owner: TxnId,
    ) {
        for row in rows {
            let Entry::Occupied(mut slot) = self.pairs.entry(*row) else {
                continue;
            };
            if slot.get().holder != Some(owner) {
                continue;
            }
            let released = PairSlot {
                holder: None,
                ..*slot.get()
            };
            if released.is_vacant() {
                slot.remove();
            } else {
                *slot.get_mut() = released;
            }
        }
    }

    /// Number of rows currently locked by open transactions.
    pub fn locked_rows(&self) -> usize {
        self.pairs
            .iter()
            .filter(|entry| entry.value().holder.is_some())
            .count()
    }

    /// Apply one committed row write, running `publish` while the pair's
    /// slot is held.
    ///
    /// Readers of the pair therefore see its event and its row change
    /// together.
    pub(crate) fn apply_with(&self, write: &StagedWrite, publish: impl FnOnce()) {
        let mut slot = self.pairs.entry(write.row).or_default();
        publish();
        slot.active = write.op == RowOp::Insert;
    }
}
