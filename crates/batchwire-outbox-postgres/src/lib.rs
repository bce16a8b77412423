//! PostgreSQL outbox ledger for Batchwire.
//!
//! This crate provides the production implementation of the `OutboxStore`
//! trait from `batchwire-outbox`.
//!
//! # Features
//!
//! - Transactional writes through [`PgOutboxStore::insert_in_tx`]
//! - Concurrent relays via `FOR UPDATE SKIP LOCKED` and a short claim lease
//! - Retry bookkeeping with `retry_count` / `max_retries`
//! - Maintenance helpers for exhausted events
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE outbox_events (
//!     id UUID PRIMARY KEY,
//!     entity_type TEXT NOT NULL,
//!     entity_id TEXT NOT NULL,
//!     topic TEXT NOT NULL,
//!     event_type TEXT NOT NULL,
//!     payload JSONB NOT NULL,
//!
//!     -- Retries
//!     retry_count INTEGER NOT NULL DEFAULT 0,
//!     max_retries INTEGER NOT NULL DEFAULT 5,
//!     last_error TEXT,
//!
//!     -- Relay claim
//!     locked_until TIMESTAMPTZ,
//!
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE INDEX idx_outbox_events_pending ON outbox_events (created_at)
//!     WHERE retry_count < max_retries;
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use batchwire_outbox::{OutboxDispatcher, OutboxEvent};
//! use batchwire_outbox_postgres::PgOutboxStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/mydb").await?;
//!
//! // Write path: same transaction as the mutation
//! let mut tx = pool.begin().await?;
//! sqlx::query("UPDATE todos SET done = true WHERE id = $1").bind(id).execute(&mut *tx).await?;
//! PgOutboxStore::insert_in_tx(&mut tx, &OutboxEvent::from_envelope("todo", id, "todos", &envelope)?).await?;
//! tx.commit().await?;
//!
//! // Relay side
//! let dispatcher = OutboxDispatcher::new(PgOutboxStore::new(pool), publisher);
//! ```

use async_trait::async_trait;
use batchwire_outbox::{OutboxError, OutboxEvent, OutboxStore, RetryState};
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

const EVENT_COLUMNS: &str = "id, entity_type, entity_id, topic, event_type, payload, \
                             retry_count, max_retries, last_error, created_at";

/// PostgreSQL outbox ledger.
#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
    claim_lease_ms: i64,
}

impl PgOutboxStore {
    /// Create a new PostgreSQL outbox store.
    ///
    /// # Default Settings
    ///
    /// - Claim lease: 30 seconds
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            claim_lease_ms: 30_000,
        }
    }

    /// Create a store with a custom claim lease.
    ///
    /// Fetched events are hidden from other relays for this long. A relay
    /// that dies mid-dispatch leaves its events to be picked up once the
    /// lease runs out.
    pub fn with_claim_lease(pool: PgPool, lease_ms: i64) -> Self {
        Self {
            pool,
            claim_lease_ms: lease_ms.max(1),
        }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Store an event inside the caller's transaction.
    ///
    /// The event becomes visible to relays only when the transaction
    /// commits, and disappears with it on rollback.
    pub async fn insert_in_tx(
        conn: &mut PgConnection,
        event: &OutboxEvent,
    ) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            INSERT INTO outbox_events
                (id, entity_type, entity_id, topic, event_type, payload,
                 retry_count, max_retries, last_error, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(event.id)
        .bind(&event.entity_type)
        .bind(&event.entity_id)
        .bind(&event.topic)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.retry_count)
        .bind(event.max_retries)
        .bind(&event.last_error)
        .bind(event.created_at)
        .execute(conn)
        .await
        .map_err(OutboxError::backend)?;

        Ok(())
    }
}

fn event_from_row(row: &PgRow) -> Result<OutboxEvent, sqlx::Error> {
    Ok(OutboxEvent {
        id: row.try_get("id")?,
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        topic: row.try_get("topic")?,
        event_type: row.try_get("event_type")?,
        payload: row.try_get::<serde_json::Value, _>("payload")?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn insert(&self, event: OutboxEvent) -> Result<(), OutboxError> {
        let mut conn = self.pool.acquire().await.map_err(OutboxError::backend)?;
        Self::insert_in_tx(&mut conn, &event).await
    }

    /// Claim the oldest pending events.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` so concurrent relays never claim the
    /// same row, then stamps a lease so the claim survives the statement.
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxError> {
        let locked_until = Utc::now() + Duration::milliseconds(self.claim_lease_ms);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = sqlx::query(&format!(
            r#"
            WITH claimable AS (
                SELECT id
                FROM outbox_events
                WHERE retry_count < max_retries
                  AND (locked_until IS NULL OR locked_until < NOW())
                ORDER BY created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_events
            SET locked_until = $2
            WHERE id IN (SELECT id FROM claimable)
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(limit)
        .bind(locked_until)
        .fetch_all(&self.pool)
        .await
        .map_err(OutboxError::backend)?;

        // RETURNING does not preserve the CTE's order.
        let mut events = rows
            .iter()
            .map(event_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(OutboxError::backend)?;
        events.sort_by_key(|event| event.created_at);
        Ok(events)
    }

    async fn delete(&self, id: Uuid) -> Result<(), OutboxError> {
        let result = sqlx::query("DELETE FROM outbox_events WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(OutboxError::backend)?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::NotFound(id));
        }
        Ok(())
    }

    /// Bump the retry count and release the claim so the next tick retries.
    async fn record_failure(&self, id: Uuid, error: &str) -> Result<RetryState, OutboxError> {
        let row = sqlx::query(
            r#"
            UPDATE outbox_events
            SET retry_count = retry_count + 1,
                last_error = $1,
                locked_until = NULL
            WHERE id = $2
            RETURNING retry_count, max_retries
            "#,
        )
        .bind(error)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(OutboxError::backend)?
        .ok_or(OutboxError::NotFound(id))?;

        let retry_count: i32 = row.try_get("retry_count").map_err(OutboxError::backend)?;
        let max_retries: i32 = row.try_get("max_retries").map_err(OutboxError::backend)?;

        Ok(if retry_count >= max_retries {
            RetryState::Exhausted { retry_count }
        } else {
            RetryState::Retrying { retry_count }
        })
    }
}

/// Maintenance helpers.
impl PgOutboxStore {
    /// Events that ran out of retries, oldest first, for operators to inspect.
    pub async fn exhausted(&self, limit: i64) -> Result<Vec<OutboxEvent>, OutboxError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM outbox_events
            WHERE retry_count >= max_retries
            ORDER BY created_at ASC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(OutboxError::backend)?;

        rows.iter()
            .map(event_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(OutboxError::backend)
    }

    /// Give exhausted events a fresh set of retries.
    pub async fn requeue_exhausted(&self) -> Result<u64, OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET retry_count = 0,
                locked_until = NULL
            WHERE retry_count >= max_retries
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(OutboxError::backend)?;

        tracing::info!(requeued = result.rows_affected(), "requeued exhausted outbox events");
        Ok(result.rows_affected())
    }

    /// Delete exhausted events created before `older_than`.
    pub async fn purge_exhausted(&self, older_than: DateTime<Utc>) -> Result<u64, OutboxError> {
        let result = sqlx::query(
            r#"
            DELETE FROM outbox_events
            WHERE retry_count >= max_retries
              AND created_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(OutboxError::backend)?;

        Ok(result.rows_affected())
    }

    /// Get statistics about ledger health.
    pub async fn stats(&self) -> Result<OutboxStats, OutboxError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE retry_count < max_retries
                                   AND (locked_until IS NULL OR locked_until < NOW())) as pending,
                COUNT(*) FILTER (WHERE retry_count < max_retries
                                   AND locked_until >= NOW()) as claimed,
                COUNT(*) FILTER (WHERE retry_count > 0 AND retry_count < max_retries) as retrying,
                COUNT(*) FILTER (WHERE retry_count >= max_retries) as exhausted
            FROM outbox_events
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(OutboxError::backend)?;

        let count = |column: &str| -> Result<i64, OutboxError> {
            row.try_get(column).map_err(OutboxError::backend)
        };
        Ok(OutboxStats {
            pending: count("pending")?,
            claimed: count("claimed")?,
            retrying: count("retrying")?,
            exhausted: count("exhausted")?,
        })
    }
}

/// Outbox ledger statistics.
#[derive(Debug, Clone, Copy)]
pub struct OutboxStats {
    /// Publishable now.
    pub pending: i64,
    /// Held by a relay's claim lease.
    pub claimed: i64,
    /// Failed at least once, attempts left.
    pub retrying: i64,
    /// Out of retries; no longer fetched.
    pub exhausted: i64,
}
