//! The `PostgreSQL` write gateway for `entity_relationship`.
//!
//! Every write to the relationship table goes through a
//! [`GatewayTransaction`], which wraps one sqlx transaction. Each statement
//! mutates rows with `RETURNING`, so the exact set of affected rows is known,
//! and hands them to the same [`TriggerEngine`] the in-process engine uses.
//! At commit the staged writes are turned into events by the transition
//! detector and appended with one `UNNEST ... WITH ORDINALITY` insert before
//! `COMMIT`, so `BIGSERIAL` ids follow processing order and the row changes
//! and their events land in the same transaction.
//!
//! Event time is `clock_timestamp()` read at commit, after every statement
//! has run. By then the pair's row lock has ordered this transaction after
//! any other writer of the same pair, so a pair's history sorts in commit
//! order. Every event of the transaction shares that timestamp.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, warn};
use uuid::Uuid;

use entity_history_log::{CommitReceipt, EntityCatalog, HistoryError, RowOp, TriggerEngine};
use entity_history_types::{ActivationEvent, EntityId, RelationshipRow, RowFilter};

use crate::error::DbError;
use crate::event_store::{ActivationEventRow, ActivationEventStore};
use crate::postgres::PostgresPool;

/// Opens write transactions against the relationship table.
#[derive(Debug, Clone)]
pub struct RelationshipGateway {
    pool: PgPool,
    catalog: Option<Arc<dyn EntityCatalog>>,
}

impl RelationshipGateway {
    /// Create a gateway over `pool`.
    pub fn new(pool: &PostgresPool) -> Self {
        Self {
            pool: pool.pool().clone(),
            catalog: None,
        }
    }

    /// Check every activated entity reference against `catalog`.
    #[must_use]
    pub fn with_catalog(mut self, catalog: Arc<dyn EntityCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Open a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if `BEGIN` fails.
    pub async fn begin(&self) -> Result<GatewayTransaction, DbError> {
        let tx = self.pool.begin().await?;
        Ok(GatewayTransaction {
            tx,
            trigger: TriggerEngine::new(self.catalog.clone()),
            aborted: false,
        })
    }

    // -----------------------------------------------------------------------
    // Autocommit writes
    // -----------------------------------------------------------------------

    /// Activate one relationship in its own transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the statement or the commit fails.
    pub async fn create(&self, row: RelationshipRow) -> Result<CommitReceipt, DbError> {
        let mut tx = self.begin().await?;
        tx.create(row).await?;
        tx.commit().await
    }

    /// Activate a batch of relationships in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the statement or the commit fails.
    pub async fn create_many(&self, rows: &[RelationshipRow]) -> Result<CommitReceipt, DbError> {
        let mut tx = self.begin().await?;
        tx.create_many(rows).await?;
        tx.commit().await
    }

    /// Deactivate one relationship in its own transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the statement or the commit fails.
    pub async fn delete(&self, row: RelationshipRow) -> Result<CommitReceipt, DbError> {
        let mut tx = self.begin().await?;
        tx.delete(row).await?;
        tx.commit().await
    }

    /// Deactivate every relationship matching `filter` in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the statement or the commit fails.
    pub async fn delete_where(&self, filter: &RowFilter) -> Result<CommitReceipt, DbError> {
        let mut tx = self.begin().await?;
        tx.delete_where(filter).await?;
        tx.commit().await
    }

    /// Save one relationship in its own transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the statement or the commit fails.
    pub async fn save(&self, row: RelationshipRow) -> Result<CommitReceipt, DbError> {
        let mut tx = self.begin().await?;
        tx.save(row).await?;
        tx.commit().await
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Whether `row` is active in committed state.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn is_active(&self, row: &RelationshipRow) -> Result<bool, DbError> {
        Ok(sqlx::query_scalar(
            r"SELECT EXISTS (
                  SELECT 1 FROM entity_relationship
                  WHERE sub_entity_id = $1 AND super_entity_id = $2
              )",
        )
        .bind(row.sub_entity.into_inner())
        .bind(row.super_entity.into_inner())
        .fetch_one(&self.pool)
        .await?)
    }

    /// Committed rows matching `filter`, in pair order.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn rows(&self, filter: &RowFilter) -> Result<Vec<RelationshipRow>, DbError> {
        let mut query = QueryBuilder::new(
            "SELECT sub_entity_id, super_entity_id FROM entity_relationship WHERE TRUE",
        );
        push_row_filter(&mut query, filter);
        query.push(" ORDER BY sub_entity_id, super_entity_id");
        let rows: Vec<(Uuid, Uuid)> = query.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(pair_from_columns).collect())
    }

    /// Read access to the activation event log.
    pub const fn events(&self) -> ActivationEventStore<'_> {
        ActivationEventStore::new(&self.pool)
    }
}

/// One open `PostgreSQL` transaction on the relationship table.
///
/// Dropping it without committing rolls everything back.
#[derive(Debug)]
pub struct GatewayTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
    trigger: TriggerEngine,
    aborted: bool,
}

impl GatewayTransaction {
    /// Whether a failed statement has aborted this transaction.
    pub const fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Whether `row` is active as seen from inside this transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn is_active(&mut self, row: &RelationshipRow) -> Result<bool, DbError> {
        self.ensure_open()?;
        let result = sqlx::query_scalar(
            r"SELECT EXISTS (
                  SELECT 1 FROM entity_relationship
                  WHERE sub_entity_id = $1 AND super_entity_id = $2
              )",
        )
        .bind(row.sub_entity.into_inner())
        .bind(row.super_entity.into_inner())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(DbError::from);
        self.track(result)
    }

    /// Activate one relationship.
    ///
    /// # Errors
    ///
    /// [`HistoryError::UniqueViolation`] if the pair is already active, or
    /// any interceptor or database failure. The transaction is aborted on
    /// error.
    pub async fn create(&mut self, row: RelationshipRow) -> Result<(), DbError> {
        self.create_many(&[row]).await.map(|_| ())
    }

    /// Activate every row in `rows`, in order, as one statement.
    ///
    /// # Errors
    ///
    /// See [`GatewayTransaction::create`].
    pub async fn create_many(&mut self, rows: &[RelationshipRow]) -> Result<usize, DbError> {
        self.ensure_open()?;
        let result = self.insert_rows(rows).await;
        self.track(result)
    }

    /// Deactivate one relationship. Returns `false` if it was not active.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on a database failure.
    pub async fn delete(&mut self, row: RelationshipRow) -> Result<bool, DbError> {
        let filter = RowFilter::all()
            .sub_entity(row.sub_entity)
            .super_entity(row.super_entity);
        self.delete_where(&filter).await.map(|removed| removed > 0)
    }

    /// Deactivate every active relationship matching `filter`.
    ///
    /// Removed rows are recorded in pair order.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on a database failure.
    pub async fn delete_where(&mut self, filter: &RowFilter) -> Result<usize, DbError> {
        self.ensure_open()?;
        let result = self.remove_rows(filter).await;
        self.track(result)
    }

    /// Persist `row`, creating it only if it is not already active.
    ///
    /// Returns whether the row was created.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on an interceptor or database failure.
    pub async fn save(&mut self, row: RelationshipRow) -> Result<bool, DbError> {
        self.ensure_open()?;
        let result = self.upsert_row(row).await;
        self.track(result)
    }

    /// Append the staged events and commit.
    ///
    /// # Errors
    ///
    /// [`HistoryError::TransactionAborted`] if a statement failed earlier,
    /// or the database failure. Either way nothing is committed.
    pub async fn commit(mut self) -> Result<CommitReceipt, DbError> {
        if self.aborted {
            self.tx.rollback().await?;
            return Err(HistoryError::TransactionAborted.into());
        }

        let (committed_at, events) = match self.append_events().await {
            Ok(appended) => appended,
            Err(err) => {
                warn!(error = %err, "event append failed, rolling back");
                self.tx.rollback().await?;
                return Err(err);
            }
        };
        self.tx.commit().await?;

        let receipt = CommitReceipt {
            committed_at,
            events,
        };
        debug!(
            rows = self.trigger.len(),
            activations = receipt.activations(),
            deactivations = receipt.deactivations(),
            "transaction committed"
        );
        Ok(receipt)
    }

    /// Roll back everything done so far.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if `ROLLBACK` fails.
    pub async fn rollback(self) -> Result<(), DbError> {
        self.tx.rollback().await?;
        debug!("transaction rolled back");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Statement bodies
    // -----------------------------------------------------------------------

    async fn insert_rows(&mut self, rows: &[RelationshipRow]) -> Result<usize, DbError> {
        let mut seen = BTreeSet::new();
        if let Some(row) = rows.iter().find(|row| !seen.insert(**row)) {
            return Err(HistoryError::UniqueViolation { row: *row }.into());
        }
        self.trigger.validate(RowOp::Insert, rows)?;

        let (subs, supers) = columns(rows);
        let inserted: Vec<(Uuid, Uuid)> = sqlx::query_as(
            r"INSERT INTO entity_relationship (sub_entity_id, super_entity_id)
              SELECT sub, sup
              FROM UNNEST($1::UUID[], $2::UUID[]) WITH ORDINALITY AS t(sub, sup, ord)
              ORDER BY ord
              ON CONFLICT DO NOTHING
              RETURNING sub_entity_id, super_entity_id",
        )
        .bind(&subs)
        .bind(&supers)
        .fetch_all(&mut *self.tx)
        .await?;

        // Rows skipped by ON CONFLICT were already active.
        let inserted: BTreeSet<RelationshipRow> =
            inserted.into_iter().map(pair_from_columns).collect();
        if let Some(row) = rows.iter().find(|row| !inserted.contains(row)) {
            return Err(HistoryError::UniqueViolation { row: *row }.into());
        }

        self.trigger.intercept(RowOp::Insert, rows)?;
        Ok(rows.len())
    }

    async fn remove_rows(&mut self, filter: &RowFilter) -> Result<usize, DbError> {
        let mut query = QueryBuilder::new("DELETE FROM entity_relationship WHERE TRUE");
        push_row_filter(&mut query, filter);
        query.push(" RETURNING sub_entity_id, super_entity_id");
        let removed: Vec<(Uuid, Uuid)> = query.build_query_as().fetch_all(&mut *self.tx).await?;

        let mut removed: Vec<RelationshipRow> =
            removed.into_iter().map(pair_from_columns).collect();
        removed.sort_unstable();

        self.trigger.intercept(RowOp::Remove, &removed)?;
        Ok(removed.len())
    }

    async fn upsert_row(&mut self, row: RelationshipRow) -> Result<bool, DbError> {
        self.trigger.validate(RowOp::Insert, &[row])?;
        let result = sqlx::query(
            r"INSERT INTO entity_relationship (sub_entity_id, super_entity_id)
              VALUES ($1, $2)
              ON CONFLICT DO NOTHING",
        )
        .bind(row.sub_entity.into_inner())
        .bind(row.super_entity.into_inner())
        .execute(&mut *self.tx)
        .await?;

        let created = result.rows_affected() > 0;
        if created {
            self.trigger.intercept(RowOp::Insert, &[row])?;
        }
        Ok(created)
    }

    /// Stamp the staged writes with the commit time and insert their events.
    async fn append_events(&mut self) -> Result<(DateTime<Utc>, Vec<ActivationEvent>), DbError> {
        let committed_at: DateTime<Utc> = sqlx::query_scalar("SELECT clock_timestamp()")
            .fetch_one(&mut *self.tx)
            .await?;
        let pending = self.trigger.fire(committed_at);
        if pending.is_empty() {
            return Ok((committed_at, Vec::new()));
        }

        let len = pending.len();
        let mut subs = Vec::with_capacity(len);
        let mut supers = Vec::with_capacity(len);
        let mut flags = Vec::with_capacity(len);
        let mut times = Vec::with_capacity(len);
        for event in &pending {
            subs.push(event.sub_entity.into_inner());
            supers.push(event.super_entity.into_inner());
            flags.push(event.was_activated);
            times.push(event.time);
        }

        let rows: Vec<ActivationEventRow> = sqlx::query_as(
            r"INSERT INTO entity_relationship_activation_event
                  (sub_entity_id, super_entity_id, was_activated, time)
              SELECT sub, sup, act, ts
              FROM UNNEST($1::UUID[], $2::UUID[], $3::BOOLEAN[], $4::TIMESTAMPTZ[])
                  WITH ORDINALITY AS t(sub, sup, act, ts, ord)
              ORDER BY ord
              RETURNING id, sub_entity_id, super_entity_id, was_activated, time",
        )
        .bind(&subs)
        .bind(&supers)
        .bind(&flags)
        .bind(&times)
        .fetch_all(&mut *self.tx)
        .await?;

        let mut events = rows
            .into_iter()
            .map(ActivationEvent::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        events.sort_unstable_by_key(|e| e.id);
        Ok((committed_at, events))
    }

    // -----------------------------------------------------------------------
    // Abort tracking
    // -----------------------------------------------------------------------

    fn ensure_open(&self) -> Result<(), DbError> {
        if self.aborted {
            return Err(HistoryError::TransactionAborted.into());
        }
        Ok(())
    }

    fn track<T>(&mut self, result: Result<T, DbError>) -> Result<T, DbError> {
        if let Err(err) = &result {
            warn!(error = %err, "statement failed, transaction aborted");
            self.aborted = true;
            self.trigger.discard();
        }
        result
    }
}

/// Append one `AND` clause per set field of `filter`.
fn push_row_filter(query: &mut QueryBuilder<'static, Postgres>, filter: &RowFilter) {
    if let Some(entity) = filter.sub_entity {
        query.push(" AND sub_entity_id = ");
        query.push_bind(entity.into_inner());
    }
    if let Some(entity) = filter.super_entity {
        query.push(" AND super_entity_id = ");
        query.push_bind(entity.into_inner());
    }
}

fn columns(rows: &[RelationshipRow]) -> (Vec<Uuid>, Vec<Uuid>) {
    rows.iter()
        .map(|row| (row.sub_entity.into_inner(), row.super_entity.into_inner()))
        .unzip()
}

fn pair_from_columns((sub, sup): (Uuid, Uuid)) -> RelationshipRow {
    RelationshipRow::new(EntityId::from(sub), EntityId::from(sup))
}
