//! Filters for bulk deletes and history queries.
//!
//! Both filters are plain data so that the in-process engine can evaluate
//! them with [`RowFilter::matches`] / [`EventFilter::matches`] while the
//! `PostgreSQL` backend translates the same fields into a `WHERE` clause.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::EntityId;
use crate::structs::{ActivationEvent, RelationshipRow};

/// Selects relationship rows for a bulk delete.
///
/// An empty filter matches every row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFilter {
    /// Only rows with this sub entity.
    pub sub_entity: Option<EntityId>,
    /// Only rows with this super entity.
    pub super_entity: Option<EntityId>,
}

impl RowFilter {
    /// A filter matching every row.
    pub const fn all() -> Self {
        Self {
            sub_entity: None,
            super_entity: None,
        }
    }

    /// Restrict to rows whose sub entity is `entity`.
    #[must_use]
    pub const fn sub_entity(mut self, entity: EntityId) -> Self {
        self.sub_entity = Some(entity);
        self
    }

    /// Restrict to rows whose super entity is `entity`.
    #[must_use]
    pub const fn super_entity(mut self, entity: EntityId) -> Self {
        self.super_entity = Some(entity);
        self
    }

    /// Whether `row` is selected by this filter.
    pub fn matches(&self, row: &RelationshipRow) -> bool {
        self.sub_entity.is_none_or(|e| e == row.sub_entity)
            && self.super_entity.is_none_or(|e| e == row.super_entity)
    }
}

/// Selects activation events for a history query.
///
/// Time bounds are inclusive on both ends. An empty filter matches every
/// event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Only events whose sub entity is this reference.
    pub sub_entity: Option<EntityId>,
    /// Only events whose super entity is this reference.
    pub super_entity: Option<EntityId>,
    /// Only events where this reference appears on either side.
    pub involving: Option<EntityId>,
    /// Only events at or after this time.
    pub since: Option<DateTime<Utc>>,
    /// Only events at or before this time.
    pub until: Option<DateTime<Utc>>,
    /// Only activations (`true`) or only deactivations (`false`).
    pub was_activated: Option<bool>,
}

impl EventFilter {
    /// A filter matching every event.
    pub const fn all() -> Self {
        Self {
            sub_entity: None,
            super_entity: None,
            involving: None,
            since: None,
            until: None,
            was_activated: None,
        }
    }

    /// The activation history of exactly one directed pair.
    pub const fn for_pair(row: &RelationshipRow) -> Self {
        Self::all()
            .sub_entity(row.sub_entity)
            .super_entity(row.super_entity)
    }

    /// Restrict to events whose sub entity is `entity`.
    #[must_use]
    pub const fn sub_entity(mut self, entity: EntityId) -> Self {
        self.sub_entity = Some(entity);
        self
    }

    /// Restrict to events whose super entity is `entity`.
    #[must_use]
    pub const fn super_entity(mut self, entity: EntityId) -> Self {
        self.super_entity = Some(entity);
        self
    }

    /// Restrict to events that mention `entity` on either side.
    #[must_use]
    pub const fn involving(mut self, entity: EntityId) -> Self {
        self.involving = Some(entity);
        self
    }

    /// Restrict to events at or after `time`.
    #[must_use]
    pub const fn since(mut self, time: DateTime<Utc>) -> Self {
        self.since = Some(time);
        self
    }

    /// Restrict to events at or before `time`.
    #[must_use]
    pub const fn until(mut self, time: DateTime<Utc>) -> Self {
        self.until = Some(time);
        self
    }

    /// Restrict to one polarity.
    #[must_use]
    pub const fn was_activated(mut self, was_activated: bool) -> Self {
        self.was_activated = Some(was_activated);
        self
    }

    /// Whether `event` is selected by this filter.
    pub fn matches(&self, event: &ActivationEvent) -> bool {
        self.sub_entity.is_none_or(|e| e == event.sub_entity)
            && self.super_entity.is_none_or(|e| e == event.super_entity)
            && self.involving.is_none_or(|e| event.row().involves(e))
            && self.since.is_none_or(|t| event.time >= t)
            && self.until.is_none_or(|t| event.time <= t)
            && self.was_activated.is_none_or(|w| w == event.was_activated)
    }
}
