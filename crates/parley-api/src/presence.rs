use axum::{Extension, Json, extract::State};

use parley_types::api::OnlineUser;
use parley_types::models::Identity;

use crate::state::AppState;

/// Who is online right now, longest-connected first.
pub async fn online_users(
    State(state): State<AppState>,
    Extension(_identity): Extension<Identity>,
) -> Json<Vec<OnlineUser>> {
    let mut users = state.gateway.online_users().await;
    users.sort_by_key(|u| u.since);
    Json(users)
}
