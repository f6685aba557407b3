use crate::state::AppState;
use axum::{Router, routing::get};

mod get;

pub use get::get_active_session;

pub fn course_routes() -> Router<AppState> {
    Router::new().route("/{course_code}/sessions/active", get(get_active_session))
}
