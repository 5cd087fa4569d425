//! Identifier validation and quoting.
//!
//! Values are always bound as parameters. Identifiers (database, table and
//! column names) are the only things ever interpolated into SQL text, and
//! they must pass through this module first.

use crate::api::middleware::AppError;

/// PostgreSQL truncates identifiers longer than this many bytes
pub const MAX_IDENTIFIER_BYTES: usize = 63;

const VIRTUAL_NAME_MIN: usize = 3;
const VIRTUAL_NAME_MAX: usize = 50;

/// Validate a user supplied virtual database name and return its canonical (lower-case) form
pub fn validate_virtual_name(name: &str) -> Result<String, AppError> {
    let trimmed = name.trim().trim_matches('"');
    let len = trimmed.chars().count();
    if !(VIRTUAL_NAME_MIN..=VIRTUAL_NAME_MAX).contains(&len) {
        return Err(AppError::Validation(format!(
            "Database name must be between {} and {} characters, got '{}'",
            VIRTUAL_NAME_MIN, VIRTUAL_NAME_MAX, trimmed
        )));
    }
    if !trimmed.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(AppError::Validation(format!(
            "Database name '{}' may only contain letters, digits and underscores",
            trimmed
        )));
    }
    Ok(trimmed.to_ascii_lowercase())
}

/// Check that `name` is a syntactically valid SQL identifier
pub fn validate_identifier(name: &str) -> Result<(), AppError> {
    if name.is_empty() {
        return Err(AppError::Validation("Identifier cannot be empty".to_string()));
    }
    if name.len() > MAX_IDENTIFIER_BYTES {
        return Err(AppError::Validation(format!(
            "Identifier '{}' exceeds {} bytes",
            name, MAX_IDENTIFIER_BYTES
        )));
    }
    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$') {
        return Err(AppError::Validation(format!("Invalid identifier '{}'", name)));
    }
    Ok(())
}

/// Double-quote an identifier, escaping embedded quotes
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Validate then quote
pub fn quoted(name: &str) -> Result<String, AppError> {
    validate_identifier(name)?;
    Ok(quote_identifier(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_name_canonical_form() {
        assert_eq!(validate_virtual_name("Sales_2024").unwrap(), "sales_2024");
        assert_eq!(validate_virtual_name("\"sales\"").unwrap(), "sales");
    }

    #[test]
    fn test_virtual_name_rejects_bad_input() {
        assert!(validate_virtual_name("ab").is_err());
        assert!(validate_virtual_name("sales-db").is_err());
        assert!(validate_virtual_name("sales; DROP").is_err());
        assert!(validate_virtual_name(&"x".repeat(51)).is_err());
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("orders").is_ok());
        assert!(validate_identifier("_tmp$1").is_ok());
        assert!(validate_identifier("1orders").is_err());
        assert!(validate_identifier("ord ers").is_err());
        assert!(validate_identifier(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_quote_identifier_escapes_quotes() {
        assert_eq!(quote_identifier("orders"), "\"orders\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
        assert!(quoted("bad name").is_err());
    }
}
