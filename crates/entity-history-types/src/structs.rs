//! Relationship rows and activation events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{EntityId, EventSeq};

// ---------------------------------------------------------------------------
// RelationshipRow
// ---------------------------------------------------------------------------

/// A directed relationship between two entities.
///
/// The row has no activation flag: its existence in the relationship store
/// *is* the active state. Rows are keyed uniquely by the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationshipRow {
    /// The contained (child) entity.
    pub sub_entity: EntityId,
    /// The containing (parent) entity.
    pub super_entity: EntityId,
}

impl RelationshipRow {
    /// Build a row for the directed pair `sub_entity -> super_entity`.
    pub const fn new(sub_entity: EntityId, super_entity: EntityId) -> Self {
        Self {
            sub_entity,
            super_entity,
        }
    }

    /// Whether either side holds the nil reference.
    pub const fn has_nil_reference(&self) -> bool {
        self.sub_entity.is_nil() || self.super_entity.is_nil()
    }

    /// Whether `entity` appears on either side of the pair.
    pub fn involves(&self, entity: EntityId) -> bool {
        self.sub_entity == entity || self.super_entity == entity
    }
}

impl core::fmt::Display for RelationshipRow {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} -> {}", self.sub_entity, self.super_entity)
    }
}

// ---------------------------------------------------------------------------
// Transition
// ---------------------------------------------------------------------------

/// Polarity of an activation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// The relationship row was created.
    Activated,
    /// The relationship row was removed.
    Deactivated,
}

impl Transition {
    /// Map the stored `was_activated` flag to a transition.
    pub const fn from_flag(was_activated: bool) -> Self {
        if was_activated {
            Self::Activated
        } else {
            Self::Deactivated
        }
    }

    /// The stored `was_activated` flag for this transition.
    pub const fn was_activated(self) -> bool {
        matches!(self, Self::Activated)
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// An event produced by the transition detector that has not yet been
/// assigned a sequence number by the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEvent {
    /// Copy of the row's sub entity at transition time.
    pub sub_entity: EntityId,
    /// Copy of the row's super entity at transition time.
    pub super_entity: EntityId,
    /// `true` for a creation, `false` for a removal.
    pub was_activated: bool,
    /// Timestamp of the transaction that performed the transition.
    pub time: DateTime<Utc>,
}

impl PendingEvent {
    /// Attach the sequence number assigned by the event log.
    pub const fn with_id(self, id: EventSeq) -> ActivationEvent {
        ActivationEvent {
            id,
            sub_entity: self.sub_entity,
            super_entity: self.super_entity,
            was_activated: self.was_activated,
            time: self.time,
        }
    }
}

/// One immutable entry of the activation audit log.
///
/// The entity references are copies, not links: a deactivation event stays
/// fully populated after its relationship row is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationEvent {
    /// Monotonic sequence number; tie-break for equal timestamps.
    pub id: EventSeq,
    /// The relationship's sub entity.
    pub sub_entity: EntityId,
    /// The relationship's super entity.
    pub super_entity: EntityId,
    /// `true` for an activation, `false` for a deactivation.
    pub was_activated: bool,
    /// Timestamp of the transaction that performed the transition.
    pub time: DateTime<Utc>,
}

impl ActivationEvent {
    /// The relationship pair this event describes.
    pub const fn row(&self) -> RelationshipRow {
        RelationshipRow::new(self.sub_entity, self.super_entity)
    }

    /// The event's polarity.
    pub const fn transition(&self) -> Transition {
        Transition::from_flag(self.was_activated)
    }

    /// The `(time, id)` ordering key.
    pub const fn order_key(&self) -> (DateTime<Utc>, EventSeq) {
        (self.time, self.id)
    }
}
