//! Web API router construction.

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::web::{status, trigger};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Creates the web server router
pub fn create_router(app_state: AppState) -> Router {
    let api_router = Router::new()
        .route("/health", get(status::health))
        .route("/update-status", get(status::update_status))
        .route("/data-freshness", get(status::data_freshness))
        .route("/trigger-update", post(trigger::trigger_update))
        .with_state(app_state);

    with_middleware(Router::new().nest("/api", api_router), REQUEST_TIMEOUT)
}

fn with_middleware(router: Router, timeout: Duration) -> Router {
    router.layer((
        TraceLayer::new_for_http(),
        TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout),
    ))
}
