use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A previously derived parameterized SQL statement for one prompt shape of one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryTemplate {
    /// sha256 of `user_id:normalized_prompt`
    pub id: String,
    pub user_id: String,
    pub normalized_prompt: String,
    /// SQL with `:param_N` placeholders
    pub sql_template: String,
    /// Original placeholder names, position N names `:param_N`
    pub original_param_map: Vec<String>,
    pub created_at: DateTime<Utc>,
}
