//! Read access to the `entity_relationship_activation_event` table.
//!
//! Queries are ordered by `(time, id)` and read lazily with keyset
//! pagination: each page continues strictly after the last `(time, id)` of
//! the previous one, so a stream never holds a cursor open across pages and
//! can be restarted by calling [`ActivationEventStore::stream`] again.
//!
//! There is no update or delete here. The migration also refuses both at
//! the table level.

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use entity_history_types::{
    ActivationEvent, EntityId, EventFilter, EventSeq, RelationshipRow,
};

use crate::error::DbError;

/// Default number of events fetched per page.
const DEFAULT_PAGE_SIZE: usize = 500;

/// Columns selected for every event query, in [`ActivationEventRow`] order.
const EVENT_COLUMNS: &str = "id, sub_entity_id, super_entity_id, was_activated, time";

/// Position after which the next page starts.
type PageCursor = (DateTime<Utc>, i64);

/// Read-only operations on the activation event table.
#[derive(Debug, Clone, Copy)]
pub struct ActivationEventStore<'a> {
    pool: &'a PgPool,
    page_size: usize,
}

impl<'a> ActivationEventStore<'a> {
    /// Create an event store bound to a connection pool.
    pub const fn new(pool: &'a PgPool) -> Self {
        Self {
            pool,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Set how many events each page fetches.
    #[must_use]
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    /// Stream every event matching `filter`, ordered by `(time, id)`.
    ///
    /// Nothing is fetched until the stream is polled. The stream ends after
    /// the first short page.
    pub fn stream(&self, filter: EventFilter) -> BoxStream<'a, Result<ActivationEvent, DbError>> {
        let pool = self.pool;
        let page_size = self.page_size;

        stream::try_unfold(Some(None), move |cursor: Option<Option<PageCursor>>| async move {
            let Some(after) = cursor else {
                return Ok(None);
            };
            let page = fetch_page(pool, &filter, after, page_size).await?;
            let next = match page.last() {
                Some(last) if page.len() >= page_size => {
                    let id = i64::try_from(last.id.value()).unwrap_or(i64::MAX);
                    Some(Some((last.time, id)))
                }
                _ => None,
            };
            Ok::<_, DbError>(Some((page, next)))
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, DbError>)))
        .try_flatten()
        .boxed()
    }

    /// Collect every event matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if a query fails.
    pub async fn fetch_all(&self, filter: EventFilter) -> Result<Vec<ActivationEvent>, DbError> {
        self.stream(filter).try_collect().await
    }

    /// The full activation history of one directed pair.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if a query fails.
    pub async fn history(&self, row: &RelationshipRow) -> Result<Vec<ActivationEvent>, DbError> {
        self.fetch_all(EventFilter::for_pair(row)).await
    }

    /// Whether `row` was active at `time`, according to the log.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn was_active_at(
        &self,
        row: &RelationshipRow,
        time: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let latest: Option<bool> = sqlx::query_scalar(
            r"SELECT was_activated
              FROM entity_relationship_activation_event
              WHERE sub_entity_id = $1 AND super_entity_id = $2 AND time <= $3
              ORDER BY time DESC, id DESC
              LIMIT 1",
        )
        .bind(row.sub_entity.into_inner())
        .bind(row.super_entity.into_inner())
        .bind(time)
        .fetch_optional(self.pool)
        .await?;

        Ok(latest.unwrap_or(false))
    }

    /// Count the events matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn count(&self, filter: EventFilter) -> Result<u64, DbError> {
        let mut query = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM entity_relationship_activation_event WHERE TRUE",
        );
        push_event_filter(&mut query, &filter);
        let count: i64 = query.build_query_scalar().fetch_one(self.pool).await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

async fn fetch_page(
    pool: &PgPool,
    filter: &EventFilter,
    after: Option<PageCursor>,
    page_size: usize,
) -> Result<Vec<ActivationEvent>, DbError> {
    let rows: Vec<ActivationEventRow> = page_query(filter, after, page_size)
        .build_query_as()
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(ActivationEvent::try_from).collect()
}

/// Build one page of the `(time, id)`-ordered event query.
fn page_query(
    filter: &EventFilter,
    after: Option<PageCursor>,
    page_size: usize,
) -> QueryBuilder<'static, Postgres> {
    let mut query = QueryBuilder::new(format!(
        "SELECT {EVENT_COLUMNS} FROM entity_relationship_activation_event WHERE TRUE"
    ));
    push_event_filter(&mut query, filter);
    if let Some((time, id)) = after {
        query.push(" AND (time, id) > (");
        query.push_bind(time);
        query.push(", ");
        query.push_bind(id);
        query.push(")");
    }
    query.push(" ORDER BY time, id LIMIT ");
    query.push_bind(i64::try_from(page_size).unwrap_or(i64::MAX));
    query
}

/// Append one `AND` clause per set field of `filter`.
pub(crate) fn push_event_filter(query: &mut QueryBuilder<'static, Postgres>, filter: &EventFilter) {
    if let Some(entity) = filter.sub_entity {
        query.push(" AND sub_entity_id = ");
        query.push_bind(entity.into_inner());
    }
    if let Some(entity) = filter.super_entity {
        query.push(" AND super_entity_id = ");
        query.push_bind(entity.into_inner());
    }
    if let Some(entity) = filter.involving {
        query.push(" AND (sub_entity_id = ");
        query.push_bind(entity.into_inner());
        query.push(" OR super_entity_id = ");
        query.push_bind(entity.into_inner());
        query.push(")");
    }
    if let Some(since) = filter.since {
        query.push(" AND time >= ");
        query.push_bind(since);
    }
    if let Some(until) = filter.until {
        query.push(" AND time <= ");
        query.push_bind(until);
    }
    if let Some(was_activated) = filter.was_activated {
        query.push(" AND was_activated = ");
        query.push_bind(was_activated);
    }
}

/// A row from the `entity_relationship_activation_event` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ActivationEventRow {
    /// Auto-incremented event ID.
    pub id: i64,
    /// The sub-entity of the pair.
    pub sub_entity_id: Uuid,
    /// The super-entity of the pair.
    pub super_entity_id: Uuid,
    /// `true` for an activation, `false` for a deactivation.
    pub was_activated: bool,
    /// Timestamp of the transaction that made the transition.
    pub time: DateTime<Utc>,
}

impl TryFrom<ActivationEventRow> for ActivationEvent {
    type Error = DbError;

    fn try_from(row: ActivationEventRow) -> Result<Self, Self::Error> {
        let id = u64::try_from(row.id)
            .ok()
            .map(EventSeq)
            .ok_or(DbError::SequenceOutOfRange(row.id))?;
        Ok(Self {
            id,
            sub_entity: EntityId::from(row.sub_entity_id),
            super_entity: EntityId::from(row.super_entity_id),
            was_activated: row.was_activated,
            time: row.time,
        })
    }
}
