use axum::{extract::FromRequestParts, http::request::Parts};
use sha2::{Digest, Sha256};

use crate::api::handlers::AppState;
use crate::api::middleware::AppError;
use crate::models::User;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Hex sha256 of an API key, the form stored in `users.api_key_hash`
pub fn hash_api_key(api_key: &str) -> String {
    hex::encode(Sha256::digest(api_key.as_bytes()))
}

/// The caller, resolved from the `X-API-Key` header
#[derive(Debug, Clone)]
pub struct CurrentUser(pub User);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let api_key = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::Unauthorized("Missing X-API-Key header".to_string()))?;

        let user = state
            .storage
            .get_user_by_api_key_hash(&hash_api_key(api_key))
            .await?
            .ok_or_else(|| AppError::Unauthorized("Invalid API key".to_string()))?;

        Ok(CurrentUser(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_api_key_is_hex_sha256() {
        let hash = hash_api_key("secret");
        assert_eq!(hash.len(), 64);
        assert_eq!(
            hash,
            "2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b"
        );
        assert_ne!(hash, hash_api_key("secret2"));
    }
}
