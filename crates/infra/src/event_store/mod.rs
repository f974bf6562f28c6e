//! Append-only event store boundary.
//!
//! The trait lives in [`r#trait`]; backends are an in-memory store for
//! tests/dev and SQLx-backed Postgres and MySQL stores.

pub mod in_memory;
pub mod mysql;
pub mod postgres;
mod sql;
pub mod r#trait;

#[cfg(test)]
pub(crate) mod conformance;

use std::sync::Arc;

use tracing::info;

pub use in_memory::InMemoryEventStore;
pub use mysql::MySqlEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{EventStore, EventStoreError};

use crate::config::StoreConfig;

/// Open the store described by `config`, creating the schema when `migrate`
/// is set.
pub async fn open_event_store(
    config: &StoreConfig,
    migrate: bool,
) -> Result<Arc<dyn EventStore>, EventStoreError> {
    let store: Arc<dyn EventStore> = match config {
        StoreConfig::Memory => Arc::new(InMemoryEventStore::new()),
        StoreConfig::Postgres(db) => {
            let store = PostgresEventStore::connect(db).await?;
            if migrate {
                store.migrate().await?;
            }
            Arc::new(store)
        }
        StoreConfig::MySql(db) => {
            let store = MySqlEventStore::connect(db).await?;
            if migrate {
                store.migrate().await?;
            }
            Arc::new(store)
        }
    };

    info!(backend = config.backend(), "event store ready");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use tidemark_core::Event;

    use super::*;

    #[tokio::test]
    async fn memory_config_opens_an_in_memory_store() {
        let store = open_event_store(&StoreConfig::Memory, true).await.unwrap();
        store.save_event(&Event::new("a1", "t", "x")).await.unwrap();
        assert_eq!(store.get_events("a1").await.unwrap().len(), 1);
    }
}
