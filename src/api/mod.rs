//! API layer -- axum routes and handlers.
//!
//! `/health` stays unversioned so monitoring probes are unaffected by API
//! revisions; everything else lives under `/api/v1`.

mod routes;
pub mod state;

use self::state::AppState;
use axum::routing::get;
use axum::Router;

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .nest("/api/v1", routes::api_routes())
        .fallback(fallback)
        .with_state(state)
}

async fn fallback() -> (axum::http::StatusCode, &'static str) {
    (axum::http::StatusCode::NOT_FOUND, "not found")
}
