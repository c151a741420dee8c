//! The activation event log: an append-only record of every transition.
//!
//! # Design
//!
//! - **Append-only**: events are never modified or deleted. Only the commit
//!   path inside this crate may append; consumers get read access.
//! - **Partitioned by pair**: each directed pair's events live in their own
//!   partition of a sharded map, so commits on unrelated pairs append
//!   without meeting. A partition is always in `(time, id)` order because
//!   writers of one pair are serialized by its row lock.
//! - **Sequenced up front**: a commit reserves capacity and a contiguous id
//!   range with two atomic updates before any of its events is visible, so
//!   a rejected commit leaves no trace.
//! - **Queries sort**: a pass orders events by `(time, id)` itself, one page
//!   at a time, resuming after the last key it returned.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use entity_history_types::{ActivationEvent, EventFilter, EventSeq, PendingEvent, RelationshipRow};

use crate::HistoryError;

/// Default number of events returned per page when iterating.
const DEFAULT_PAGE_SIZE: usize = 256;

/// The `(time, id)` key events are ordered by.
type OrderKey = (DateTime<Utc>, EventSeq);

/// Append-only, queryable log of activation events.
#[derive(Debug)]
pub struct EventLog {
    partitions: DashMap<RelationshipRow, Vec<ActivationEvent>>,
    /// The id the next sequenced event receives.
    next_id: AtomicU64,
    /// Events sequenced so far, published or about to be.
    reserved: AtomicUsize,
    /// Newest commit timestamp handed out, in microseconds.
    latest_micros: AtomicI64,
    capacity: Option<usize>,
    page_size: usize,
}

impl EventLog {
    /// Create an empty, unbounded log.
    pub fn new() -> Self {
        Self::with_capacity_limit(None)
    }

    /// Create an empty log that refuses to grow past `capacity` events.
    ///
    /// `None` means unbounded.
    pub fn with_capacity_limit(capacity: Option<usize>) -> Self {
        Self {
            partitions: DashMap::new(),
            next_id: AtomicU64::new(EventSeq::FIRST.value()),
            reserved: AtomicUsize::new(0),
            latest_micros: AtomicI64::new(i64::MIN),
            capacity,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Set how many events an iterator fetches per page.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    // -----------------------------------------------------------------------
    // Commit path
    // -----------------------------------------------------------------------

    /// The commit timestamp for a clock reading of `now`.
    ///
    /// Truncated to microseconds and never earlier than any timestamp handed
    /// out before, so a pair's later transaction never sorts before its
    /// earlier one.
    pub(crate) fn stamp(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let micros = now.timestamp_micros();
        let previous = self.latest_micros.fetch_max(micros, Ordering::AcqRel);
        DateTime::<Utc>::from_timestamp_micros(previous.max(micros)).unwrap_or(now)
    }

    /// Reserve room and ids for one transaction's events, all or nothing.
    ///
    /// Ids are contiguous and assigned in input order. The returned events
    /// are not visible until each is handed to [`EventLog::publish`].
    pub(crate) fn sequence(
        &self,
        batch: Vec<PendingEvent>,
    ) -> Result<Vec<ActivationEvent>, HistoryError> {
        let count = batch.len();
        self.reserve(count)?;
        let ids = match self.allocate_ids(count) {
            Ok(ids) => ids,
            Err(err) => {
                self.reserved.fetch_sub(count, Ordering::AcqRel);
                return Err(err);
            }
        };
        Ok(batch
            .into_iter()
            .zip(ids)
            .map(|(pending, id)| pending.with_id(EventSeq(id)))
            .collect())
    }

    /// Make a sequenced event visible.
    pub(crate) fn publish(&self, event: ActivationEvent) {
        self.partitions.entry(event.row()).or_default().push(event);
    }

    fn reserve(&self, count: usize) -> Result<(), HistoryError> {
        let capacity = self.capacity;
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| {
                held.checked_add(count)
                    .filter(|total| capacity.is_none_or(|limit| *total <= limit))
            })
            .map(|_| ())
            .map_err(|_| HistoryError::LogFull {
                capacity: capacity.unwrap_or(usize::MAX),
            })
    }

    fn allocate_ids(&self, count: usize) -> Result<Range<u64>, HistoryError> {
        let count = u64::try_from(count).map_err(|_| HistoryError::SequenceExhausted)?;
        let first = self
            .next_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                next.checked_add(count)
            })
            .map_err(|_| HistoryError::SequenceExhausted)?;
        let end = first
            .checked_add(count)
            .ok_or(HistoryError::SequenceExhausted)?;
        Ok(first..end)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Number of visible events.
    pub fn len(&self) -> usize {
        self.partitions.iter().map(|entry| entry.value().len()).sum()
    }

    /// Whether no event is visible.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Timestamp of the most recent visible event, if any.
    pub fn last_time(&self) -> Option<DateTime<Utc>> {
        self.partitions
            .iter()
            .filter_map(|entry| entry.value().last().map(|e| e.time))
            .max()
    }

    /// Build a lazy query over the events matching `filter`, ordered by
    /// `(time, id)`.
    pub const fn query(&self, filter: EventFilter) -> EventQuery<'_> {
        EventQuery { log: self, filter }
    }

    /// The full activation history of one directed pair.
    pub fn history(&self, row: &RelationshipRow) -> Vec<ActivationEvent> {
        self.query(EventFilter::for_pair(row)).to_vec()
    }

    /// Whether `row` was active at `time`, according to the log.
    ///
    /// A pair is active at `time` when its latest event at or before `time`
    /// is an activation.
    pub fn was_active_at(&self, row: &RelationshipRow, time: DateTime<Utc>) -> bool {
        self.query(EventFilter::for_pair(row).until(time))
            .iter()
            .last()
            .is_some_and(|e| e.was_activated)
    }

    /// Up to `limit` matching events with ids below `bound` and keys after
    /// `after`, smallest `(time, id)` first.
    fn page(
        &self,
        filter: &EventFilter,
        after: Option<OrderKey>,
        bound: EventSeq,
        limit: usize,
    ) -> Vec<ActivationEvent> {
        let wanted = |event: &&ActivationEvent| {
            event.id < bound
                && after.is_none_or(|key| event.order_key() > key)
                && filter.matches(event)
        };
        let pinned = filter
            .sub_entity
            .zip(filter.super_entity)
            .map(|(sub, sup)| RelationshipRow::new(sub, sup));

        let mut found: Vec<ActivationEvent> = match pinned {
            Some(row) => self
                .partitions
                .get(&row)
                .map(|events| events.iter().filter(&wanted).copied().collect())
                .unwrap_or_default(),
            None => self
                .partitions
                .iter()
                .flat_map(|entry| {
                    entry
                        .value()
                        .iter()
                        .filter(&wanted)
                        .copied()
                        .collect::<Vec<_>>()
                })
                .collect(),
        };
        found.sort_unstable_by_key(ActivationEvent::order_key);
        found.truncate(limit);
        found
    }

    /// One past the newest id sequenced so far.
    fn bound(&self) -> EventSeq {
        EventSeq(self.next_id.load(Ordering::Acquire))
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// A restartable query over the event log.
///
/// Nothing is read until [`EventQuery::iter`] is called. Each call starts a
/// fresh pass from the oldest event.
#[derive(Debug, Clone, Copy)]
pub struct EventQuery<'a> {
    log: &'a EventLog,
    filter: EventFilter,
}

impl<'a> EventQuery<'a> {
    /// The filter this query applies.
    pub const fn filter(&self) -> &EventFilter {
        &self.filter
    }

    /// Start a new pass over the matching events.
    ///
    /// The pass is finite: it never returns events sequenced after it
    /// began, even if they are appended meanwhile.
    pub fn iter(&self) -> EventIter<'a> {
        EventIter {
            log: self.log,
            filter: self.filter,
            bound: self.log.bound(),
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Collect every matching event.
    pub fn to_vec(&self) -> Vec<ActivationEvent> {
        self.iter().collect()
    }

    /// Count the matching events.
    pub fn count(&self) -> usize {
        self.iter().count()
    }
}

impl<'a> IntoIterator for &EventQuery<'a> {
    type Item = ActivationEvent;
    type IntoIter = EventIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// One pass over an [`EventQuery`], reading the log a page at a time.
#[derive(Debug)]
pub struct EventIter<'a> {
    log: &'a EventLog,
    filter: EventFilter,
    bound: EventSeq,
    after: Option<OrderKey>,
    buffer: VecDeque<ActivationEvent>,
    exhausted: bool,
}

impl Iterator for EventIter<'_> {
    type Item = ActivationEvent;

    fn next(&mut self) -> Option<Self::Item> {
        while self.buffer.is_empty() && !self.exhausted {
            let limit = self.log.page_size;
            let page = self.log.page(&self.filter, self.after, self.bound, limit);
            self.exhausted = page.len() < limit;
            self.after = page.last().map(ActivationEvent::order_key).or(self.after);
            self.buffer.extend(page);
        }
        self.buffer.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use entity_history_types::EntityId;

    use super::*;

    fn pending(row: RelationshipRow, was_activated: bool, time: DateTime<Utc>) -> PendingEvent {
        PendingEvent {
            sub_entity: row.sub_entity,
            super_entity: row.super_entity,
            was_activated,
            time,
        }
    }

    fn row() -> RelationshipRow {
        RelationshipRow::new(EntityId::new(), EntityId::new())
    }

    fn append(
        log: &EventLog,
        batch: Vec<PendingEvent>,
    ) -> Result<Vec<ActivationEvent>, HistoryError> {
        let events = log.sequence(batch)?;
        events.iter().for_each(|event| log.publish(*event));
        Ok(events)
    }

    #[test]
    fn ids_strictly_increase_within_and_across_batches() -> Result<(), HistoryError> {
        let log = EventLog::new();
        let now = Utc::now();
        let first = append(&log, vec![pending(row(), true, now), pending(row(), true, now)])?;
        let second = append(&log, vec![pending(row(), true, now)])?;

        let ids: Vec<u64> = first.iter().chain(&second).map(|e| e.id.value()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(log.len(), 3);
        Ok(())
    }

    #[test]
    fn capacity_is_all_or_nothing() -> Result<(), HistoryError> {
        let log = EventLog::with_capacity_limit(Some(2));
        let now = Utc::now();
        append(&log, vec![pending(row(), true, now)])?;

        let result = log.sequence(vec![pending(row(), true, now), pending(row(), true, now)]);
        assert_eq!(result, Err(HistoryError::LogFull { capacity: 2 }));
        assert_eq!(log.len(), 1);

        // The rejected batch held no room and burned no ids.
        let last = append(&log, vec![pending(row(), true, now)])?;
        assert_eq!(last.iter().map(|e| e.id.value()).collect::<Vec<_>>(), vec![2]);
        Ok(())
    }

    #[test]
    fn stamp_never_goes_backwards() {
        let log = EventLog::new();
        let now = Utc::now();
        let first = log.stamp(now);
        let second = log.stamp(now - Duration::seconds(30));
        assert_eq!(first, second);
        assert_eq!(first.timestamp_micros(), now.timestamp_micros());
        assert!(log.stamp(now + Duration::seconds(1)) > first);
    }

    #[test]
    fn query_orders_by_time_then_id_across_pairs() -> Result<(), HistoryError> {
        let log = EventLog::new().with_page_size(1);
        let now = Utc::now();
        let late = log.sequence(vec![pending(row(), true, now + Duration::seconds(1))])?;
        let early = log.sequence(vec![pending(row(), true, now), pending(row(), false, now)])?;
        // Publish out of id order: visibility order must not matter.
        late.iter().chain(&early).for_each(|event| log.publish(*event));

        let ids: Vec<u64> = log
            .query(EventFilter::all())
            .iter()
            .map(|e| e.id.value())
            .collect();
        assert_eq!(ids, vec![2, 3, 1]);
        Ok(())
    }

    #[test]
    fn query_is_lazy_and_restartable() -> Result<(), HistoryError> {
        let log = EventLog::new().with_page_size(1);
        let r = row();
        let now = Utc::now();
        append(&log, vec![pending(r, true, now)])?;
        append(&log, vec![pending(row(), true, now)])?;
        append(&log, vec![pending(r, false, now + Duration::seconds(1))])?;

        let query = log.query(EventFilter::for_pair(&r));
        let first_pass: Vec<bool> = query.iter().map(|e| e.was_activated).collect();
        let second_pass: Vec<bool> = query.iter().map(|e| e.was_activated).collect();
        assert_eq!(first_pass, vec![true, false]);
        assert_eq!(first_pass, second_pass);
        Ok(())
    }

    #[test]
    fn iteration_ignores_events_sequenced_after_it_began() -> Result<(), HistoryError> {
        let log = EventLog::new().with_page_size(1);
        let now = Utc::now();
        append(&log, vec![pending(row(), true, now)])?;

        let query = log.query(EventFilter::all());
        let mut iter = query.iter();
        append(&log, vec![pending(row(), true, now)])?;

        assert!(iter.next().is_some());
        assert!(iter.next().is_none());
        assert_eq!(query.count(), 2);
        Ok(())
    }

    #[test]
    fn empty_log_yields_nothing() {
        let log = EventLog::new();
        assert!(log.is_empty());
        assert_eq!(log.query(EventFilter::all()).count(), 0);
        assert_eq!(log.last_time(), None);
    }

    #[test]
    fn was_active_at_follows_latest_event() -> Result<(), HistoryError> {
        let log = EventLog::new();
        let r = row();
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(10);
        append(&log, vec![pending(r, true, t0)])?;
        append(&log, vec![pending(r, false, t1)])?;

        assert!(!log.was_active_at(&r, t0 - Duration::seconds(1)));
        assert!(log.was_active_at(&r, t0));
        assert!(log.was_active_at(&r, t1 - Duration::seconds(1)));
        assert!(!log.was_active_at(&r, t1));
        assert_eq!(log.last_time(), Some(t1));
        Ok(())
    }

    #[test]
    fn time_range_query() -> Result<(), HistoryError> {
        let log = EventLog::new();
        let t0 = Utc::now();
        for offset in 0..5 {
            append(&log, vec![pending(row(), true, t0 + Duration::seconds(offset))])?;
        }
        let window = log.query(
            EventFilter::all()
                .since(t0 + Duration::seconds(1))
                .until(t0 + Duration::seconds(3)),
        );
        assert_eq!(window.count(), 3);
        Ok(())
    }
}
