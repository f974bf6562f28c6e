//! Postgres-backed event store implementation.
//!
//! Events live in a single `events` table keyed by `id`. A `BIGSERIAL`
//! `seq` column records insertion order and breaks timestamp ties, so
//! `get_events` is `ORDER BY timestamp, seq`. Duplicate ids are rejected by
//! the primary key and surface as `EventStoreError::Duplicate`.
//!
//! ## Thread Safety
//!
//! `PostgresEventStore` is `Send + Sync` and cheap to clone; all operations
//! go through the SQLx connection pool.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use tracing::{info, instrument, Span};

use tidemark_core::{Event, TimeRange};

use crate::config::DbSettings;

use super::r#trait::{aggregate_context, event_context, EventStore, EventStoreError};
use super::sql::{event_from_row, map_sqlx_error};

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY,
        seq BIGSERIAL NOT NULL,
        aggregate_id TEXT NOT NULL,
        "type" TEXT NOT NULL,
        data TEXT NOT NULL,
        "timestamp" BIGINT NOT NULL
    )
"#;

const CREATE_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS events_aggregate_order_idx
        ON events (aggregate_id, "timestamp", seq)
"#;

/// Postgres-backed append-only event store.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Create a store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool from validated settings.
    pub async fn connect(settings: &DbSettings) -> Result<Self, EventStoreError> {
        let options = PgConnectOptions::new()
            .host(&settings.host)
            .port(settings.port)
            .username(&settings.user)
            .password(&settings.password)
            .database(&settings.database);

        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", format!("postgres {}", settings.host), None, e))?;

        info!(host = %settings.host, database = %settings.database, "connected to postgres");
        Ok(Self::new(pool))
    }

    /// Open a pool from a connection URL.
    pub async fn connect_url(url: &str) -> Result<Self, EventStoreError> {
        let pool = PgPoolOptions::new()
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", "postgres".to_string(), None, e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `events` table and its ordering index if missing.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        for statement in [CREATE_TABLE, CREATE_INDEX] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", "events table".to_string(), None, e))?;
        }
        Ok(())
    }

    async fn fetch_events(
        &self,
        operation: &'static str,
        aggregate_id: &str,
        range: TimeRange,
    ) -> Result<Vec<Event>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, aggregate_id, "type", data, "timestamp"
            FROM events
            WHERE aggregate_id = $1
              AND ($2::BIGINT IS NULL OR "timestamp" >= $2)
              AND ($3::BIGINT IS NULL OR "timestamp" < $3)
            ORDER BY "timestamp" ASC, seq ASC
            "#,
        )
        .bind(aggregate_id)
        .bind(range.from)
        .bind(range.to)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(operation, aggregate_context(aggregate_id), None, e))?;

        let events = rows
            .iter()
            .map(event_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_sqlx_error(operation, aggregate_context(aggregate_id), None, e))?;

        Span::current().record("event_count", events.len());
        Ok(events)
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(
        skip(self, event),
        fields(aggregate_id = %event.aggregate_id, event_id = %event.id, event_type = %event.event_type),
        err
    )]
    async fn save_event(&self, event: &Event) -> Result<(), EventStoreError> {
        event.validate()?;

        sqlx::query(
            r#"
            INSERT INTO events (id, aggregate_id, "type", data, "timestamp")
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&event.id)
        .bind(&event.aggregate_id)
        .bind(&event.event_type)
        .bind(&event.data)
        .bind(event.timestamp)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            map_sqlx_error(
                "save_event",
                aggregate_context(&event.aggregate_id),
                Some(&event.id),
                e,
            )
        })?;

        Ok(())
    }

    #[instrument(skip(self), fields(event_count = tracing::field::Empty), err)]
    async fn get_events(&self, aggregate_id: &str) -> Result<Vec<Event>, EventStoreError> {
        self.fetch_events("get_events", aggregate_id, TimeRange::all()).await
    }

    #[instrument(skip(self), fields(event_count = tracing::field::Empty), err)]
    async fn get_events_between(
        &self,
        aggregate_id: &str,
        range: TimeRange,
    ) -> Result<Vec<Event>, EventStoreError> {
        self.fetch_events("get_events_between", aggregate_id, range).await
    }

    #[instrument(skip(self), err)]
    async fn get_event(&self, id: &str) -> Result<Option<Event>, EventStoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, aggregate_id, "type", data, "timestamp"
            FROM events
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_event", event_context(id), None, e))?;

        row.as_ref()
            .map(event_from_row)
            .transpose()
            .map_err(|e| map_sqlx_error("get_event", event_context(id), None, e))
    }

    #[instrument(skip(self), err)]
    async fn aggregate_ids(&self) -> Result<Vec<String>, EventStoreError> {
        sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT aggregate_id FROM events ORDER BY aggregate_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("aggregate_ids", "all aggregates".to_string(), None, e))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::conformance;

    async fn store() -> PostgresEventStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a Postgres database");
        let store = PostgresEventStore::connect_url(&url).await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn conforms() {
        conformance::run_all(&store().await).await;
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn migrate_is_idempotent() {
        let store = store().await;
        store.migrate().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn closed_pool_reports_unavailable() {
        let store = store().await;
        store.close().await;
        assert!(matches!(
            store.get_events("a1").await,
            Err(EventStoreError::Unavailable { operation: "get_events", .. })
        ));
    }
}
