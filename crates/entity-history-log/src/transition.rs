//! Transition detection: row operations to activation events.
//!
//! A relationship's activation state is binary and derives only from row
//! presence, so there are exactly two transitions. A write that leaves an
//! existing row in place produces nothing.

use chrono::{DateTime, Utc};

use entity_history_types::{PendingEvent, RelationshipRow, Transition};

/// A row-level write operation on the relationship store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowOp {
    /// A row was created.
    Insert,
    /// A row was removed.
    Remove,
}

impl RowOp {
    /// The transition this operation implies.
    pub const fn transition(self) -> Transition {
        match self {
            Self::Insert => Transition::Activated,
            Self::Remove => Transition::Deactivated,
        }
    }
}

/// Map one row operation to the event it implies.
///
/// The entity references are copied out of the row so the event outlives
/// it.
pub const fn detect(op: RowOp, row: &RelationshipRow, time: DateTime<Utc>) -> PendingEvent {
    PendingEvent {
        sub_entity: row.sub_entity,
        super_entity: row.super_entity,
        was_activated: op.transition().was_activated(),
        time,
    }
}

#[cfg(test)]
mod tests {
    use entity_history_types::EntityId;

    use super::*;

    #[test]
    fn insert_is_activation() {
        let row = RelationshipRow::new(EntityId::new(), EntityId::new());
        let now = Utc::now();
        let event = detect(RowOp::Insert, &row, now);
        assert!(event.was_activated);
        assert_eq!(event.sub_entity, row.sub_entity);
        assert_eq!(event.super_entity, row.super_entity);
        assert_eq!(event.time, now);
    }

    #[test]
    fn remove_is_deactivation() {
        let row = RelationshipRow::new(EntityId::new(), EntityId::new());
        let event = detect(RowOp::Remove, &row, Utc::now());
        assert!(!event.was_activated);
        assert_eq!(event.sub_entity, row.sub_entity);
        assert_eq!(event.super_entity, row.super_entity);
    }
}
