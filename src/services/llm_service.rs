use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use crate::api::middleware::AppError;
use crate::config::LlmConfig;
use crate::services::EngineManager;
use crate::validation::split_statements;

const SYSTEM_PROMPT: &str = r#"You are an expert SQL generator for PostgreSQL. Convert the user's request into SQL for the database described by the schema.

Rules:
1. Respond with a single JSON object and nothing else.
2. Generate PostgreSQL only. Use the table and column names from the schema.
3. Use every concrete value the user mentions (names, numbers, dates, conditions) as literals in the SQL.
4. Database names are lowercase, unquoted identifiers.
5. For simple DDL requests apply sensible defaults: primary keys, NOT NULL where obvious, VARCHAR lengths.
6. If the request cannot be expressed as SQL, set "query_type" to "ERROR" and explain why.

Response format:
{
    "sql": "the complete statement, or several separated by semicolons",
    "query_type": "SELECT, INSERT, UPDATE, DELETE, CREATE, ALTER, DROP, OTHER or ERROR",
    "tables_referenced": ["tables"],
    "explanation": "one sentence describing what the SQL does"
}"#;

/// SQL produced for a natural-language command
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedSql {
    pub statements: Vec<String>,
    pub query_type: String,
    pub explanation: String,
    pub tables_referenced: Vec<String>,
}

impl GeneratedSql {
    /// Statements joined back into one script for display and history
    pub fn script(&self) -> String {
        format!("{};", self.statements.join(";\n"))
    }
}

/// Outcome of a generation request. Failures never surface as errors.
#[derive(Debug, Clone, PartialEq)]
pub enum NlpResponse {
    Generated(GeneratedSql),
    Error { explanation: String },
}

impl NlpResponse {
    fn error(explanation: impl Into<String>) -> Self {
        NlpResponse::Error {
            explanation: explanation.into(),
        }
    }
}

/// Natural language to SQL
#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate(&self, command: &str, schema: &str) -> NlpResponse;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSql {
    One(String),
    Many(Vec<String>),
}

#[derive(Deserialize)]
struct RawGeneration {
    sql: Option<RawSql>,
    #[serde(default)]
    query_type: String,
    #[serde(default)]
    explanation: String,
    #[serde(default)]
    tables_referenced: Vec<String>,
}

/// Interpret the JSON content of a model reply
pub fn parse_generation(content: &str) -> NlpResponse {
    let cleaned = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let raw: RawGeneration = match serde_json::from_str(cleaned) {
        Ok(raw) => raw,
        Err(e) => return NlpResponse::error(format!("Model reply is not valid JSON: {}", e)),
    };

    if raw.query_type.eq_ignore_ascii_case("ERROR") {
        let explanation = if raw.explanation.is_empty() {
            "The request could not be converted to SQL".to_string()
        } else {
            raw.explanation
        };
        return NlpResponse::error(explanation);
    }

    let statements: Vec<String> = match raw.sql {
        Some(RawSql::One(sql)) => split_statements(&sql),
        Some(RawSql::Many(list)) => list.iter().flat_map(|s| split_statements(s)).collect(),
        None => Vec::new(),
    };
    if statements.is_empty() {
        return NlpResponse::error("The model did not return any SQL");
    }

    NlpResponse::Generated(GeneratedSql {
        statements,
        query_type: raw.query_type.to_uppercase(),
        explanation: raw.explanation,
        tables_referenced: raw.tables_referenced,
    })
}

/// OpenAI-compatible chat completions client
pub struct LlmService {
    base_url: String,
    api_key: Option<String>,
    model: String,
    http_client: HttpClient,
}

impl LlmService {
    pub fn new(config: &LlmConfig) -> Result<Self, AppError> {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::LlmService(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            model: config.model.clone(),
            http_client,
        })
    }

    async fn call_llm_api(&self, user_prompt: &str) -> Result<String, String> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| "LLM_API_KEY is not configured".to_string())?;

        let response = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": SYSTEM_PROMPT},
                    {"role": "user", "content": user_prompt},
                ],
                "temperature": 0.0,
                "max_tokens": 2048,
                "response_format": {"type": "json_object"},
            }))
            .send()
            .await
            .map_err(|e| format!("LLM API call failed: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(format!("LLM API error ({}): {}", status, error_text));
        }

        let result: serde_json::Value = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse LLM response: {}", e))?;

        result["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| "LLM response does not contain a message".to_string())
    }
}

#[async_trait]
impl SqlGenerator for LlmService {
    async fn generate(&self, command: &str, schema: &str) -> NlpResponse {
        let user_prompt = format!(
            "User command: \"{}\"\n\nCurrent database schema:\n{}\n\nGenerate the PostgreSQL for this command following the response format.",
            command, schema
        );

        match self.call_llm_api(&user_prompt).await {
            Ok(content) => parse_generation(&content),
            Err(e) => {
                tracing::error!("SQL generation failed: {}", e);
                NlpResponse::error(e)
            }
        }
    }
}

/// One column of a user table, as listed in `information_schema.columns`
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub schema: String,
    pub table: String,
    pub column: String,
    pub data_type: String,
    pub nullable: bool,
}

/// Plain-text schema description used as model context
pub fn render_schema(columns: &[ColumnInfo]) -> String {
    if columns.is_empty() {
        return "The database has no tables yet.\n".to_string();
    }

    let mut context = String::from("Tables:\n");
    let mut current: Option<(&str, &str)> = None;
    for col in columns {
        if current != Some((col.schema.as_str(), col.table.as_str())) {
            context.push_str(&format!("  - {}.{}\n", col.schema, col.table));
            current = Some((col.schema.as_str(), col.table.as_str()));
        }
        context.push_str(&format!("      * {} ({})", col.column, col.data_type));
        if !col.nullable {
            context.push_str(" [NOT NULL]");
        }
        context.push('\n');
    }
    context
}

/// Source of the schema text handed to the SQL generator
#[async_trait]
pub trait SchemaReader: Send + Sync {
    async fn describe(&self, physical_name: &str) -> Result<String, AppError>;
}

#[async_trait]
impl SchemaReader for EngineManager {
    async fn describe(&self, physical_name: &str) -> Result<String, AppError> {
        let engine = self.get_engine(physical_name).await?;
        let client = engine.get().await?;
        describe_schema(&client).await
    }
}

/// Describe every user table of the database `client` is connected to
pub async fn describe_schema(client: &tokio_postgres::Client) -> Result<String, AppError> {
    let rows = client
        .query(
            r#"
            SELECT table_schema, table_name, column_name, data_type, is_nullable
            FROM information_schema.columns
            WHERE table_schema NOT IN ('pg_catalog', 'information_schema')
            ORDER BY table_schema, table_name, ordinal_position
            "#,
            &[],
        )
        .await
        .map_err(|e| AppError::Execution(format!("Failed to read schema: {}", e)))?;

    let columns: Vec<ColumnInfo> = rows
        .iter()
        .map(|row| ColumnInfo {
            schema: row.get(0),
            table: row.get(1),
            column: row.get(2),
            data_type: row.get(3),
            nullable: row.get::<_, String>(4) == "YES",
        })
        .collect();

    Ok(render_schema(&columns))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns a fixed response and counts calls
    pub(crate) struct StaticGenerator {
        pub response: NlpResponse,
        pub calls: AtomicUsize,
    }

    impl StaticGenerator {
        pub fn sql(sql: &str) -> Self {
            Self {
                response: parse_generation(&json!({"sql": sql, "query_type": "SELECT"}).to_string()),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    /// Fixed schema text, no database needed
    pub(crate) struct StaticSchema(pub &'static str);

    #[async_trait]
    impl SchemaReader for StaticSchema {
        async fn describe(&self, _physical_name: &str) -> Result<String, AppError> {
            Ok(self.0.to_string())
        }
    }

    #[async_trait]
    impl SqlGenerator for StaticGenerator {
        async fn generate(&self, _command: &str, _schema: &str) -> NlpResponse {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.response.clone()
        }
    }

    #[test]
    fn test_parse_generation_splits_statements() {
        let reply = json!({
            "sql": "CREATE TABLE t (id int); INSERT INTO t VALUES (1);",
            "query_type": "create",
            "explanation": "Creates t",
        })
        .to_string();
        match parse_generation(&reply) {
            NlpResponse::Generated(g) => {
                assert_eq!(g.statements.len(), 2);
                assert_eq!(g.query_type, "CREATE");
                assert_eq!(g.script(), "CREATE TABLE t (id int);\nINSERT INTO t VALUES (1);");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_generation_accepts_list_and_fences() {
        let reply = format!(
            "```json\n{}\n```",
            json!({"sql": ["SELECT 1", "SELECT 2;"], "query_type": "SELECT"})
        );
        match parse_generation(&reply) {
            NlpResponse::Generated(g) => assert_eq!(g.statements, vec!["SELECT 1", "SELECT 2"]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_generation_errors() {
        assert!(matches!(parse_generation("not json"), NlpResponse::Error { .. }));
        assert!(matches!(
            parse_generation(&json!({"sql": "", "query_type": "SELECT"}).to_string()),
            NlpResponse::Error { .. }
        ));
        assert_eq!(
            parse_generation(&json!({"query_type": "ERROR", "explanation": "no such table"}).to_string()),
            NlpResponse::Error {
                explanation: "no such table".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_missing_api_key_becomes_error_variant() {
        let service = LlmService::new(&LlmConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            api_key: None,
            model: "test".to_string(),
            timeout_secs: 1,
        })
        .unwrap();
        assert!(matches!(
            service.generate("list orders", "").await,
            NlpResponse::Error { .. }
        ));
    }

    #[test]
    fn test_render_schema_groups_by_table() {
        let col = |table: &str, column: &str, nullable: bool| ColumnInfo {
            schema: "public".into(),
            table: table.into(),
            column: column.into(),
            data_type: "integer".into(),
            nullable,
        };
        let text = render_schema(&[col("orders", "id", false), col("orders", "total", true), col("users", "id", false)]);
        assert_eq!(text.matches("  - public.orders").count(), 1);
        assert!(text.contains("      * id (integer) [NOT NULL]"));
        assert!(text.contains("  - public.users"));
        assert_eq!(render_schema(&[]), "The database has no tables yet.\n");
    }
}
