//! REST surface: conversation management, history and the online snapshot.

pub mod conversations;
pub mod error;
pub mod middleware;
pub mod presence;
pub mod state;

use axum::{
    Router, middleware as axum_middleware,
    routing::{delete, get, post},
};

use crate::middleware::require_auth;
use crate::state::AppState;

/// Authenticated routes. The caller merges them with the public ones.
pub fn protected_routes(state: AppState) -> Router {
    Router::new()
        .route("/conversations", get(conversations::list_conversations))
        .route("/conversations/groups", post(conversations::create_group))
        .route("/conversations/{conversation_id}/messages", get(conversations::get_history))
        .route("/conversations/{conversation_id}/members", post(conversations::add_member))
        .route(
            "/conversations/{conversation_id}/members/{user_id}",
            delete(conversations::remove_member),
        )
        .route("/presence", get(presence::online_users))
        .layer(axum_middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state)
}
