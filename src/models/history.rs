use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Success,
    Error,
}

impl HistoryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HistoryStatus::Success => "success",
            HistoryStatus::Error => "error",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "success" => HistoryStatus::Success,
            _ => HistoryStatus::Error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryHistory {
    pub id: i64,
    pub user_id: String,
    pub command_text: String,
    pub generated_sql: String,
    pub status: HistoryStatus,
    pub query_type: String,
    pub executed_at: DateTime<Utc>,
}
