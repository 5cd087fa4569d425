use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::api::auth::CurrentUser;
use crate::api::handlers::AppState;
use crate::api::middleware::AppError;
use crate::models::{CreateVirtualDatabaseRequest, RenameVirtualDatabaseRequest, Role, VirtualDatabaseView};

/// List databases the caller owns or is a member of
pub async fn list_databases(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let databases = state.registry.list_accessible(&user).await?;
    Ok(Json(serde_json::json!({
        "databases": databases
    })))
}

pub async fn create_database(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(payload): Json<CreateVirtualDatabaseRequest>,
) -> Result<(StatusCode, Json<VirtualDatabaseView>), AppError> {
    let db = state.registry.create(&user, &payload.virtual_name).await?;
    Ok((StatusCode::CREATED, Json(VirtualDatabaseView::new(db, Role::Owner))))
}

pub async fn rename_database(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(name): Path<String>,
    Json(payload): Json<RenameVirtualDatabaseRequest>,
) -> Result<Json<VirtualDatabaseView>, AppError> {
    let db = state.registry.rename(&user, &name, &payload.new_name).await?;
    Ok(Json(VirtualDatabaseView::new(db, Role::Owner)))
}

pub async fn delete_database(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    let db = state.registry.resolve_accessible(&user, &name).await?;
    state.registry.delete(&user, &db).await?;
    Ok(StatusCode::NO_CONTENT)
}
