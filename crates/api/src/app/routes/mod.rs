use axum::Router;

pub mod events;
pub mod projection;
pub mod replay;
pub mod system;

/// Router for every endpoint except `/health`.
pub fn router() -> Router {
    Router::new()
        .nest("/events", events::router())
        .nest("/projection", projection::router())
        .nest("/replay", replay::router())
        .nest("/rebuilds", replay::rebuild_router())
}
