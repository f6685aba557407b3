use crate::state::AppState;
use axum::{Router, routing::post};

mod common;
mod post;

pub use common::{CreateSessionReq, ManualSignInReq};
pub use post::{create_session, end_session, manual_sign_in, rotate_key};

pub fn session_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_session))
        .route("/{session_id}/rotate", post(rotate_key))
        .route("/{session_id}/end", post(end_session))
        .route("/{session_id}/sign-in", post(manual_sign_in))
}
