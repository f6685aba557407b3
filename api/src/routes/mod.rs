//! HTTP route entry point for `/api/...`.
//!
//! - `/health` → liveness probe
//! - `/attendance/validate` → the authoritative scan-claim check
//! - `/sessions` → session lifecycle (start, rotate, end, manual sign-in)
//! - `/courses/{code}/sessions/active` → the course's current session

use crate::routes::{
    attendance::attendance_routes, courses::course_routes, health::health_routes,
    sessions::session_routes,
};
use crate::state::AppState;
use axum::Router;

pub mod attendance;
pub mod common;
pub mod courses;
pub mod health;
pub mod sessions;

/// Builds the complete application router for all HTTP endpoints.
pub fn routes(app_state: AppState) -> Router {
    Router::new()
        .nest("/health", health_routes())
        .nest("/attendance", attendance_routes())
        .nest("/sessions", session_routes())
        .nest("/courses", course_routes())
        .with_state(app_state)
}
