use axum::{extract::State, http::HeaderMap, http::StatusCode, Json};

use crate::api::auth::CurrentUser;
use crate::api::handlers::{required_header, AppState, TARGET_DATABASE_HEADER, TRANSACTION_ID_HEADER};
use crate::api::middleware::AppError;
use crate::models::{CommandResponse, TransactionStarted};

/// Open a transaction on the target database. Later commands join it by
/// sending the returned id in `X-Transaction-ID`.
pub async fn begin_transaction(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<TransactionStarted>), AppError> {
    let target = required_header(&headers, TARGET_DATABASE_HEADER)?;
    let transaction_id = state.commands.begin_transaction(&user, target).await?;
    Ok((StatusCode::CREATED, Json(TransactionStarted { transaction_id })))
}

pub async fn commit_transaction(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    headers: HeaderMap,
) -> Result<Json<CommandResponse>, AppError> {
    let token = required_header(&headers, TRANSACTION_ID_HEADER)?;
    state.commands.end_transaction(&user, token, true).await?;
    Ok(Json(CommandResponse::message("Transaction committed successfully.")))
}

pub async fn rollback_transaction(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    headers: HeaderMap,
) -> Result<Json<CommandResponse>, AppError> {
    let token = required_header(&headers, TRANSACTION_ID_HEADER)?;
    state.commands.end_transaction(&user, token, false).await?;
    Ok(Json(CommandResponse::message("Transaction rolled back successfully.")))
}
