use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use parley_types::api::{AddMemberRequest, CreateGroupRequest, HistoryQuery, MembershipResponse};
use parley_types::models::{Conversation, Identity, Message};

use crate::error::ApiError;
use crate::state::AppState;

pub async fn create_group(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation = state
        .gateway
        .router()
        .create_group(&identity, &req.name, req.participants)
        .await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

/// The caller's conversations, most recently active first.
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Vec<Conversation>>, ApiError> {
    Ok(Json(state.gateway.router().conversations(&identity).await?))
}

/// A page of history, newest first. Pass the `created_at` of the oldest
/// message seen as `before` to page further back.
pub async fn get_history(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let messages = state
        .gateway
        .router()
        .history(&identity, conversation_id, query.before, query.limit)
        .await?;
    Ok(Json(messages))
}

pub async fn add_member(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<AddMemberRequest>,
) -> Result<Json<MembershipResponse>, ApiError> {
    let changed = state
        .gateway
        .router()
        .add_member(&identity, conversation_id, req.user_id)
        .await?;
    if changed {
        info!("{} added {} to {}", identity.user_id, req.user_id, conversation_id);
    }
    Ok(Json(MembershipResponse {
        conversation_id,
        user_id: req.user_id,
        changed,
    }))
}

pub async fn remove_member(
    State(state): State<AppState>,
    Path((conversation_id, user_id)): Path<(Uuid, Uuid)>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<MembershipResponse>, ApiError> {
    let changed = state
        .gateway
        .router()
        .remove_member(&identity, conversation_id, user_id)
        .await?;
    if changed {
        info!("{} removed {} from {}", identity.user_id, user_id, conversation_id);
    }
    Ok(Json(MembershipResponse {
        conversation_id,
        user_id,
        changed,
    }))
}
