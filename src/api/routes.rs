//! Route table (§10.6).

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::handlers::{self, ServerState};

pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/api/projects",
            get(handlers::list_projects).post(handlers::register_project),
        )
        .route(
            "/api/projects/{id}",
            get(handlers::get_project_snapshot).delete(handlers::remove_project),
        )
        .route("/api/projects/{id}/wake", post(handlers::wake_now))
        .route("/api/projects/{id}/pause", post(handlers::pause))
        .route("/api/projects/{id}/resume", post(handlers::resume))
        .route(
            "/api/projects/{id}/milestones/{milestone_id}/cancel",
            post(handlers::cancel_milestone),
        )
        .route(
            "/api/projects/{id}/milestones/{milestone_id}/approve",
            post(handlers::approve_milestone),
        )
        .route(
            "/api/projects/{id}/milestones/{milestone_id}/reject",
            post(handlers::reject_milestone),
        )
        .route("/api/projects/{id}/guidance", post(handlers::provide_guidance))
        .route("/api/events", get(handlers::subscribe_events_all))
        .route("/api/projects/{id}/events", get(handlers::subscribe_events_project))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
