use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use tidemark_infra::event_store::EventStoreError;
use tidemark_infra::projections::ReplayError;

pub fn store_error_to_response(err: EventStoreError) -> axum::response::Response {
    match err {
        EventStoreError::InvalidEvent(e) => {
            json_error(StatusCode::BAD_REQUEST, "invalid_event", e.to_string())
        }
        EventStoreError::Duplicate { id } => json_error(
            StatusCode::CONFLICT,
            "duplicate_event",
            format!("event '{id}' already exists"),
        ),
        other => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            other.to_string(),
        ),
    }
}

pub fn replay_error_to_response(err: ReplayError) -> axum::response::Response {
    match err {
        ReplayError::EventStore(e) => store_error_to_response(e),
        ReplayError::Cancelled => json_error(StatusCode::CONFLICT, "cancelled", "replay cancelled"),
        ReplayError::Failed(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "replay_failed", msg),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
