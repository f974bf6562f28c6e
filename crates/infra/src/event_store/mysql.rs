//! MySQL-backed event store implementation.
//!
//! Same logical layout as the Postgres store: `id` is unique, an
//! `AUTO_INCREMENT` `seq` records insertion order, and reads are ordered by
//! `(timestamp, seq)`.

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::MySqlPool;
use tracing::{info, instrument};

use tidemark_core::{Event, TimeRange};

use crate::config::DbSettings;

use super::r#trait::{aggregate_context, event_context, EventStore, EventStoreError};
use super::sql::{event_from_row, map_sqlx_error};

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS events (
        seq BIGINT NOT NULL AUTO_INCREMENT,
        id VARCHAR(191) NOT NULL,
        aggregate_id VARCHAR(191) NOT NULL,
        `type` VARCHAR(191) NOT NULL,
        data LONGTEXT NOT NULL,
        `timestamp` BIGINT NOT NULL,
        PRIMARY KEY (seq),
        UNIQUE KEY events_id_uq (id),
        KEY events_aggregate_order_idx (aggregate_id, `timestamp`, seq)
    )
"#;

#[derive(Debug, Clone)]
pub struct MySqlEventStore {
    pool: MySqlPool,
}

impl MySqlEventStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub async fn connect(settings: &DbSettings) -> Result<Self, EventStoreError> {
        let options = MySqlConnectOptions::new()
            .host(&settings.host)
            .port(settings.port)
            .username(&settings.user)
            .password(&settings.password)
            .database(&settings.database);

        let pool = MySqlPoolOptions::new()
            .max_connections(settings.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", format!("mysql {}", settings.host), None, e))?;

        info!(host = %settings.host, database = %settings.database, "connected to mysql");
        Ok(Self::new(pool))
    }

    pub async fn connect_url(url: &str) -> Result<Self, EventStoreError> {
        let pool = MySqlPoolOptions::new()
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", "mysql".to_string(), None, e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", "events table".to_string(), None, e))?;
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
            SELECT id, aggregate_id, `type`, data, `timestamp`
            FROM events
            WHERE aggregate_id = ?
              AND (? IS NULL OR `timestamp` >= ?)
              AND (? IS NULL OR `timestamp` < ?)
            ORDER BY `timestamp` ASC, seq ASC
            "#,
        )
        .bind(aggregate_id)
        .bind(range.from)
        .bind(range.from)
        .bind(range.to)
        .bind(range.to)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(operation, aggregate_context(aggregate_id), None, e))?;

        rows.iter()
            .map(event_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_sqlx_error(operation, aggregate_context(aggregate_id), None, e))
    }
}

#[async_trait]
impl EventStore for MySqlEventStore {
    #[instrument(
        skip(self, event),
        fields(aggregate_id = %event.aggregate_id, event_id = %event.id),
        err
    )]
    async fn save_event(&self, event: &Event) -> Result<(), EventStoreError> {
        event.validate()?;

        sqlx::query(
            "INSERT INTO events (id, aggregate_id, `type`, data, `timestamp`) VALUES (?, ?, ?, ?, ?)",
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

    #[instrument(skip(self), err)]
    async fn get_events(&self, aggregate_id: &str) -> Result<Vec<Event>, EventStoreError> {
        self.fetch_events("get_events", aggregate_id, TimeRange::all()).await
    }

    #[instrument(skip(self), err)]
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
            "SELECT id, aggregate_id, `type`, data, `timestamp` FROM events WHERE id = ?",
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
