//! Pieces shared by the SQL-backed stores.
//!
//! ## Error Mapping
//!
//! | SQLx error | EventStoreError | Scenario |
//! |------------|-----------------|----------|
//! | Database, unique violation (`23505` / MySQL `1062`) | `Duplicate` | id already appended |
//! | Database, other | `Rejected` | constraint, syntax or permission failures |
//! | PoolClosed, PoolTimedOut, Io, Tls | `Unavailable` | storage unreachable |
//! | Other | `Rejected` | decode failures, protocol errors |

use sqlx::{ColumnIndex, Decode, Row, Type};

use tidemark_core::Event;

use super::r#trait::EventStoreError;

/// Map a SQLx error. `duplicate_id` is the id to report when the error is a
/// unique violation on append.
pub(crate) fn map_sqlx_error(
    operation: &'static str,
    context: String,
    duplicate_id: Option<&str>,
    err: sqlx::Error,
) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            if db_err.is_unique_violation() {
                if let Some(id) = duplicate_id {
                    return EventStoreError::Duplicate { id: id.to_string() };
                }
            }

            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            EventStoreError::rejected(
                operation,
                context,
                format!("database error {code}: {}", db_err.message()),
            )
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::unavailable(operation, context, "connection pool closed")
        }
        sqlx::Error::PoolTimedOut => {
            EventStoreError::unavailable(operation, context, "timed out waiting for a connection")
        }
        sqlx::Error::Io(e) => EventStoreError::unavailable(operation, context, e),
        sqlx::Error::Tls(e) => EventStoreError::unavailable(operation, context, e),
        other => EventStoreError::rejected(operation, context, other),
    }
}

/// Decode a row selecting `id, aggregate_id, type, data, timestamp`.
pub(crate) fn event_from_row<'r, R>(row: &'r R) -> Result<Event, sqlx::Error>
where
    R: Row,
    &'static str: ColumnIndex<R>,
    String: Decode<'r, R::Database> + Type<R::Database>,
    i64: Decode<'r, R::Database> + Type<R::Database>,
{
    Ok(Event {
        id: row.try_get("id")?,
        aggregate_id: row.try_get("aggregate_id")?,
        event_type: row.try_get("type")?,
        data: row.try_get("data")?,
        timestamp: row.try_get("timestamp")?,
    })
}
