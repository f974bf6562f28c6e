//! Read access to the aggregate state projection.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use tidemark_events::Projection;

use crate::app::{errors, services::AppServices};

pub fn router() -> Router {
    Router::new()
        .route("/", get(get_state))
        .route("/:aggregate_id", get(get_aggregate))
}

/// GET /projection
pub async fn get_state(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    Json(services.projection.get_state()).into_response()
}

/// GET /projection/:aggregate_id
pub async fn get_aggregate(
    Extension(services): Extension<Arc<AppServices>>,
    Path(aggregate_id): Path<String>,
) -> axum::response::Response {
    match services.projection.get(&aggregate_id) {
        Some(view) => Json(view).into_response(),
        None => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no state for aggregate '{aggregate_id}'"),
        ),
    }
}
