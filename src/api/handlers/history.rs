use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crate::api::auth::CurrentUser;
use crate::api::handlers::AppState;
use crate::api::middleware::AppError;
use crate::services::DEFAULT_HISTORY_LIMIT;

const MAX_HISTORY_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// The caller's most recent commands, newest first
pub async fn list_history(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT);
    let history = state.history.list(&user, limit).await?;
    Ok(Json(serde_json::json!({
        "history": history
    })))
}
