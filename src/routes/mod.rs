//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! The JSON API lives under `/api`, static pages are served from the website
//! directory as the fallback, and the route guard wraps all of it so page
//! navigation gets the login redirects. API handlers take `AuthUser`, which
//! answers 401 instead of redirecting.

pub mod auth;
pub mod records;

use std::path::Path;
use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::guard::route_guard;
use crate::state::AppState;
use crate::store::StoreError;

/// JSON API routes.
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/auth/me", get(auth::me))
        .route("/api/drivers", get(records::list_drivers))
        .route("/api/drivers/{id}", get(records::get_driver))
        .route("/api/vehicles", get(records::list_vehicles))
        .route("/api/gatepasses", post(records::create_gatepass))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Wrap `router` in the route guard.
pub fn with_guard(router: Router, state: &AppState) -> Router {
    router.layer(middleware::from_fn_with_state(Arc::clone(&state.guard), route_guard))
}

/// Full application: API, static site fallback, guard, request tracing.
pub fn app(state: AppState, website_dir: &Path) -> Router {
    let website = ServeDir::new(website_dir).append_index_html_on_directories(true);
    let router = api_routes(state.clone()).fallback_service(website);
    with_guard(router, &state).layer(TraceLayer::new_for_http())
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

pub(crate) fn store_error_to_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        StoreError::InvalidCredentials => StatusCode::UNAUTHORIZED,
        StoreError::Response { status: 400, .. } => StatusCode::BAD_REQUEST,
        StoreError::Response { status: 401 | 403, .. } => StatusCode::FORBIDDEN,
        StoreError::Response { status: 404, .. } => StatusCode::NOT_FOUND,
        StoreError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        StoreError::Request(_) | StoreError::Realtime(_) | StoreError::Response { .. } | StoreError::Parse(_) => {
            StatusCode::BAD_GATEWAY
        }
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
