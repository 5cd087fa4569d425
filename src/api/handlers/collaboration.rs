use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::api::auth::CurrentUser;
use crate::api::handlers::AppState;
use crate::api::middleware::AppError;
use crate::models::{InviteMemberRequest, MemberView, UpdateMemberRequest};

pub async fn list_members(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let db = state.registry.resolve_accessible(&user, &name).await?;
    let members = state.collaboration.list_members(&user, &db).await?;
    Ok(Json(serde_json::json!({
        "owner_id": db.owner_id,
        "members": members
    })))
}

/// Invite an existing user by email
pub async fn add_member(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(name): Path<String>,
    Json(payload): Json<InviteMemberRequest>,
) -> Result<(StatusCode, Json<MemberView>), AppError> {
    let db = state.registry.resolve_accessible(&user, &name).await?;
    let member = state
        .collaboration
        .add_member(&user, &db, &payload.email, payload.role)
        .await?;
    Ok((StatusCode::CREATED, Json(member)))
}

pub async fn update_member(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path((name, member_id)): Path<(String, String)>,
    Json(payload): Json<UpdateMemberRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let db = state.registry.resolve_accessible(&user, &name).await?;
    state
        .collaboration
        .update_member_role(&user, &db, &member_id, payload.role)
        .await?;
    Ok(Json(serde_json::json!({
        "user_id": member_id,
        "role": payload.role
    })))
}

pub async fn remove_member(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path((name, member_id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    let db = state.registry.resolve_accessible(&user, &name).await?;
    state.collaboration.remove_member(&user, &db, &member_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
