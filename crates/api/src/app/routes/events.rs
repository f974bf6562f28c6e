//! Event ingress and history reads.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::debug;

use tidemark_core::{Event, TimeRange};
use tidemark_events::Projection;

use crate::app::{errors, services::AppServices};

// ─────────────────────────────────────────────────────────────────────────────
// Query Parameters
// ─────────────────────────────────────────────────────────────────────────────

/// Optional `[from, to)` timestamp window.
#[derive(Debug, Default, Deserialize)]
pub struct WindowQuery {
    pub from: Option<i64>,
    pub to: Option<i64>,
}

impl WindowQuery {
    pub fn range(&self) -> Option<TimeRange> {
        if self.from.is_none() && self.to.is_none() {
            return None;
        }
        Some(TimeRange {
            from: self.from,
            to: self.to,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

pub fn router() -> Router {
    Router::new()
        .route("/", post(append_event))
        .route("/:aggregate_id", get(get_aggregate_events))
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// POST /events
///
/// Append one event, then apply it to the live projection. A missing id or
/// timestamp is assigned here.
pub async fn append_event(
    Extension(services): Extension<Arc<AppServices>>,
    payload: Result<Json<Event>, JsonRejection>,
) -> axum::response::Response {
    let Json(mut event) = match payload {
        Ok(body) => body,
        Err(rejection) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_json", rejection.body_text());
        }
    };

    event.fill_defaults();
    if let Err(e) = services.store.save_event(&event).await {
        return errors::store_error_to_response(e);
    }

    debug!(event_id = %event.id, aggregate_id = %event.aggregate_id, "event appended");
    services.projection.handle_event(&event);

    (StatusCode::CREATED, Json(event)).into_response()
}

/// GET /events/:aggregate_id?from=X&to=Y
///
/// The aggregate's history in timestamp order, optionally restricted to a
/// window.
pub async fn get_aggregate_events(
    Extension(services): Extension<Arc<AppServices>>,
    Path(aggregate_id): Path<String>,
    Query(window): Query<WindowQuery>,
) -> axum::response::Response {
    let result = match window.range() {
        Some(range) => services.store.get_events_between(&aggregate_id, range).await,
        None => services.store.get_events(&aggregate_id).await,
    };

    match result {
        Ok(events) => Json(events).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
