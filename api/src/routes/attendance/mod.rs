use crate::state::AppState;
use axum::{Router, routing::post};

mod post;

pub use post::validate_claim;

pub fn attendance_routes() -> Router<AppState> {
    Router::new().route("/validate", post(validate_claim))
}
