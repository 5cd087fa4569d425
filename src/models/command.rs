use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Named parameter values supplied with a command
pub type Params = Map<String, Value>;

/// A command routed to one virtual database: raw SQL or natural language
#[derive(Debug, Clone, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub params: Option<Params>,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            params: None,
        }
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = Some(params);
        self
    }

    /// Parameters, treating an empty map the same as none
    pub fn params(&self) -> Option<&Params> {
        self.params.as_ref().filter(|p| !p.is_empty())
    }
}

/// Tabular statement output: column names plus one JSON object per row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryResultData {
    pub columns: Vec<String>,
    pub data: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<QueryResultData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_sql: Option<String>,
}

impl CommandResponse {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            result: None,
            generated_sql: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionStarted {
    pub transaction_id: String,
}
