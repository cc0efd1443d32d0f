//! Router configuration for the check-in server.

use super::health::{health_check, metrics};
use super::state::AppState;
use crate::api::{audit, sessions};
use axum::{
    Router,
    routing::{delete, get, post, put},
};
use tower_http::trace::TraceLayer;

/// Build the complete Axum router.
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/sessions", post(sessions::start_session))
        .route("/sessions/:id", get(sessions::get_session))
        .route("/sessions/:id", delete(sessions::end_session))
        .route("/sessions/:id/scans", post(sessions::submit_scan))
        .route("/sessions/:id/overrides", post(sessions::open_override))
        .route(
            "/sessions/:id/overrides/confirm",
            post(sessions::confirm_override),
        )
        .route("/sessions/:id/tally", get(sessions::get_tally))
        .route("/sessions/:id/feed", put(sessions::set_feed))
        .route(
            "/sessions/:id/decoder-signals",
            post(sessions::report_decoder_signal),
        )
        .route(
            "/events/:event_id/tickets/:code/checkins",
            get(audit::ticket_checkins),
        );

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
