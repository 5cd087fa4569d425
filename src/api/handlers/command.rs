use axum::{extract::State, http::HeaderMap, Json};

use crate::api::auth::CurrentUser;
use crate::api::handlers::{
    optional_header, required_header, AppState, TARGET_DATABASE_HEADER, TRANSACTION_ID_HEADER,
};
use crate::api::middleware::AppError;
use crate::models::{CommandRequest, CommandResponse, Params};
use crate::services::GeneratedSql;
use crate::validation::fill_prompt;

fn ensure_command(payload: &CommandRequest) -> Result<(), AppError> {
    if payload.command.trim().is_empty() {
        return Err(AppError::Validation("Command cannot be empty".to_string()));
    }
    Ok(())
}

/// Execute raw SQL or a natural-language command against the target database
pub async fn execute_command(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    headers: HeaderMap,
    Json(payload): Json<CommandRequest>,
) -> Result<Json<CommandResponse>, AppError> {
    ensure_command(&payload)?;
    let target = required_header(&headers, TARGET_DATABASE_HEADER)?;
    let tx_token = optional_header(&headers, TRANSACTION_ID_HEADER);

    tracing::info!(
        "Executing command for user {} on '{}'{}",
        user.id,
        target,
        tx_token.map(|t| format!(" in transaction {}", t)).unwrap_or_default()
    );

    let response = state
        .commands
        .execute_command(&user, target, tx_token, &payload)
        .await?;
    Ok(Json(response))
}

/// Generate SQL for a natural-language command without running it
pub async fn translate_command(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    headers: HeaderMap,
    Json(payload): Json<CommandRequest>,
) -> Result<Json<GeneratedSql>, AppError> {
    ensure_command(&payload)?;
    let target = required_header(&headers, TARGET_DATABASE_HEADER)?;

    let empty = Params::new();
    let prompt = fill_prompt(&payload.command, payload.params().unwrap_or(&empty));
    let generated = state.commands.generate(&user, target, &prompt).await?;
    Ok(Json(generated))
}
