//! Projection replay endpoints for rebuilding read models.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use tidemark_infra::projections::{
    replay_all, replay_events, replay_window, spawn_rebuild, RebuildHandle, ReplayProgress,
};

use crate::app::routes::events::WindowQuery;
use crate::app::{errors, services::AppServices};

// ─────────────────────────────────────────────────────────────────────────────
// Job Store
// ─────────────────────────────────────────────────────────────────────────────

/// How long a finished rebuild stays queryable.
pub const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(15 * 60);

struct RebuildJob {
    handle: RebuildHandle,
    finished_at: Option<Instant>,
}

/// In-memory registry of background rebuilds. Finished jobs are dropped once
/// they have been complete for longer than the retention period; pruning
/// happens on insert and list.
#[derive(Clone)]
pub struct RebuildJobs {
    jobs: Arc<RwLock<HashMap<Uuid, RebuildJob>>>,
    retention: Duration,
}

impl Default for RebuildJobs {
    fn default() -> Self {
        Self::with_retention(DEFAULT_JOB_RETENTION)
    }
}

impl RebuildJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            retention,
        }
    }

    pub async fn insert(&self, job_id: Uuid, handle: RebuildHandle) {
        self.prune().await;
        self.jobs.write().await.insert(
            job_id,
            RebuildJob {
                handle,
                finished_at: None,
            },
        );
    }

    pub async fn get(&self, job_id: &Uuid) -> Option<RebuildHandle> {
        self.jobs.read().await.get(job_id).map(|job| job.handle.clone())
    }

    pub async fn list(&self) -> Vec<Uuid> {
        self.prune().await;
        let mut ids: Vec<Uuid> = self.jobs.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    async fn prune(&self) {
        let now = Instant::now();
        let mut jobs = self.jobs.write().await;
        for job in jobs.values_mut() {
            if job.finished_at.is_none() && job.handle.progress().await.is_complete {
                job.finished_at = Some(now);
            }
        }
        let before = jobs.len();
        jobs.retain(|_, job| {
            job.finished_at
                .is_none_or(|at| now.duration_since(at) < self.retention)
        });
        let expired = before - jobs.len();
        if expired > 0 {
            debug!(expired, "expired finished rebuild jobs");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Response Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ReplayedResponse {
    pub aggregate_id: String,
    pub events: usize,
}

#[derive(Debug, Serialize)]
pub struct RebuildStartedResponse {
    pub job_id: String,
}

#[derive(Debug, Serialize)]
pub struct RebuildStatusResponse {
    pub job_id: String,
    pub progress: ReplayProgress,
}

// ─────────────────────────────────────────────────────────────────────────────
// Routers
// ─────────────────────────────────────────────────────────────────────────────

pub fn router() -> Router {
    Router::new()
        .route("/", post(replay_everything))
        .route("/:aggregate_id", post(replay_aggregate))
}

pub fn rebuild_router() -> Router {
    Router::new()
        .route("/", post(start_rebuild).get(list_rebuilds))
        .route("/:job_id", get(get_rebuild_status).delete(cancel_rebuild))
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// POST /replay/:aggregate_id?from=X&to=Y
///
/// Re-apply one aggregate's history (or a window of it) to the live
/// projection.
pub async fn replay_aggregate(
    Extension(services): Extension<Arc<AppServices>>,
    Path(aggregate_id): Path<String>,
    Query(window): Query<WindowQuery>,
) -> axum::response::Response {
    let store = services.store.as_ref();
    let projection = services.projection.as_ref();
    let result = match window.range() {
        Some(range) => replay_window(store, projection, &aggregate_id, range).await,
        None => replay_events(store, projection, &aggregate_id).await,
    };

    match result {
        Ok(events) => Json(ReplayedResponse { aggregate_id, events }).into_response(),
        Err(e) => errors::replay_error_to_response(e),
    }
}

/// POST /replay
///
/// Rebuild the projection from the whole store before responding.
pub async fn replay_everything(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    match replay_all(services.store.as_ref(), services.projection.as_ref()).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => errors::replay_error_to_response(e),
    }
}

/// POST /rebuilds
///
/// Start a full rebuild on a background task.
pub async fn start_rebuild(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(jobs): Extension<RebuildJobs>,
) -> axum::response::Response {
    let job_id = Uuid::now_v7();
    let handle = spawn_rebuild(services.store.clone(), services.projection.clone());
    jobs.insert(job_id, handle).await;

    (
        StatusCode::ACCEPTED,
        Json(RebuildStartedResponse {
            job_id: job_id.to_string(),
        }),
    )
        .into_response()
}

/// GET /rebuilds
pub async fn list_rebuilds(Extension(jobs): Extension<RebuildJobs>) -> axum::response::Response {
    let job_ids = jobs.list().await;
    Json(serde_json::json!({
        "jobs": job_ids.iter().map(|id| id.to_string()).collect::<Vec<_>>()
    }))
    .into_response()
}

/// GET /rebuilds/:job_id
pub async fn get_rebuild_status(
    Extension(jobs): Extension<RebuildJobs>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = match job_id.parse::<Uuid>() {
        Ok(id) => id,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"),
    };

    match jobs.get(&job_id).await {
        Some(handle) => Json(RebuildStatusResponse {
            job_id: job_id.to_string(),
            progress: handle.progress().await,
        })
        .into_response(),
        None => errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
    }
}

/// DELETE /rebuilds/:job_id
///
/// Request cancellation; the job stops at its next checkpoint.
pub async fn cancel_rebuild(
    Extension(jobs): Extension<RebuildJobs>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = match job_id.parse::<Uuid>() {
        Ok(id) => id,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"),
    };

    match jobs.get(&job_id).await {
        Some(handle) => {
            handle.cancel();
            Json(serde_json::json!({
                "job_id": job_id.to_string(),
                "message": "rebuild cancelled"
            }))
            .into_response()
        }
        None => errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
    }
}

#[cfg(test)]
mod tests {
    use tidemark_infra::config::ProjectionSettings;
    use tidemark_infra::event_store::InMemoryEventStore;
    use tidemark_infra::projections::AggregateProjection;

    use super::*;

    async fn finished_rebuild() -> RebuildHandle {
        let handle = spawn_rebuild(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(AggregateProjection::from_settings(&ProjectionSettings::default())),
        );
        handle.wait_for_completion().await.unwrap();
        handle
    }

    #[tokio::test]
    async fn finished_jobs_expire_after_retention() {
        let jobs = RebuildJobs::with_retention(Duration::ZERO);
        let id = Uuid::now_v7();
        jobs.insert(id, finished_rebuild().await).await;
        assert!(jobs.get(&id).await.is_some());

        assert!(jobs.list().await.is_empty());
        assert!(jobs.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn finished_jobs_stay_listed_within_retention() {
        let jobs = RebuildJobs::new();
        let id = Uuid::now_v7();
        jobs.insert(id, finished_rebuild().await).await;

        assert_eq!(jobs.list().await, vec![id]);
        assert!(jobs.get(&id).await.is_some());
    }
}
