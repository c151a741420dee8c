//! Type-safe identifiers.
//!
//! Entity references are opaque [`Uuid`] values handed to us by the entity
//! catalog; this crate never interprets them, only compares and carries
//! them. Event identifiers are monotonically assigned sequence numbers used
//! to break ties between events that share a timestamp.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, comparable reference to an entity in the external catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub Uuid);

impl EntityId {
    /// Create a fresh entity reference using UUID v7 (time-ordered).
    ///
    /// Real references come from the entity catalog; this exists for tests
    /// and seed data.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Return the inner [`Uuid`] value.
    pub const fn into_inner(self) -> Uuid {
        self.0
    }

    /// Whether this is the nil reference, which never names a real entity.
    pub const fn is_nil(self) -> bool {
        self.0.is_nil()
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for EntityId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EntityId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl From<EntityId> for Uuid {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

/// Monotonically assigned event sequence number.
///
/// Within one transaction, events receive strictly increasing sequence
/// numbers in the order their rows were processed. Gaps are allowed (the
/// `PostgreSQL` backend draws from a `BIGSERIAL`), reuse is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventSeq(pub u64);

impl EventSeq {
    /// The first sequence number handed out by an empty log.
    pub const FIRST: Self = Self(1);

    /// Return the raw sequence value.
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The sequence number after this one, or `None` on overflow.
    pub const fn next(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl core::fmt::Display for EventSeq {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_entity_ids_are_distinct() {
        let a = EntityId::new();
        let b = EntityId::new();
        assert_ne!(a, b);
        assert!(!a.is_nil());
    }

    #[test]
    fn nil_entity_is_detected() {
        assert!(EntityId::from(Uuid::nil()).is_nil());
    }

    #[test]
    fn entity_id_serializes_as_bare_uuid() {
        let id = EntityId::new();
        let json = serde_json::to_string(&id).ok();
        assert_eq!(json, Some(format!("\"{}\"", id.into_inner())));
    }

    #[test]
    fn event_seq_next_is_strictly_greater() {
        let first = EventSeq::FIRST;
        assert_eq!(first.next(), Some(EventSeq(2)));
        assert_eq!(EventSeq(u64::MAX).next(), None);
    }
}
