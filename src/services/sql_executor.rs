// Single-statement execution with named parameters against a physical database
use bytes::{BufMut, BytesMut};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use std::error::Error;
use std::fmt;
use tokio_postgres::types::{FromSql, IsNull, ToSql, Type};
use tokio_postgres::{Client, Row};

use crate::api::middleware::AppError;
use crate::models::{Params, QueryResultData};
use crate::validation::bind_named_parameters;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    TableNotFound,
    ColumnNotFound,
    SqlSyntaxError,
    PermissionDenied,
    ConstraintViolation,
    MissingParameter,
    Connection,
    QueryExecutionError,
}

impl FailureKind {
    pub fn code(self) -> &'static str {
        match self {
            FailureKind::TableNotFound => "TABLE_NOT_FOUND",
            FailureKind::ColumnNotFound => "COLUMN_NOT_FOUND",
            FailureKind::SqlSyntaxError => "SQL_SYNTAX_ERROR",
            FailureKind::PermissionDenied => "PERMISSION_DENIED",
            FailureKind::ConstraintViolation => "CONSTRAINT_VIOLATION",
            FailureKind::MissingParameter => "MISSING_PARAMETER",
            FailureKind::Connection => "CONNECTION_ERROR",
            FailureKind::QueryExecutionError => "QUERY_EXECUTION_ERROR",
        }
    }

    /// Map a SQLSTATE to a failure kind
    fn from_sqlstate(code: &str) -> Self {
        match code {
            "42P01" => FailureKind::TableNotFound,
            "42703" => FailureKind::ColumnNotFound,
            "42601" => FailureKind::SqlSyntaxError,
            "42501" => FailureKind::PermissionDenied,
            c if c.starts_with("23") => FailureKind::ConstraintViolation,
            c if c.starts_with("08") => FailureKind::Connection,
            _ => FailureKind::QueryExecutionError,
        }
    }
}

/// A statement failure as a value, so callers decide whether to abort
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ExecutionFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn from_driver(err: tokio_postgres::Error) -> Self {
        if let Some(db) = err.as_db_error() {
            let mut message = db.message().to_string();
            if let Some(detail) = db.detail() {
                message.push_str(&format!(" ({})", detail));
            }
            if let Some(hint) = db.hint() {
                message.push_str(&format!(" Hint: {}", hint));
            }
            return Self::new(FailureKind::from_sqlstate(db.code().code()), message);
        }
        if err.is_closed() {
            return Self::new(FailureKind::Connection, format!("Connection closed: {}", err));
        }
        Self::new(FailureKind::QueryExecutionError, err.to_string())
    }
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.code(), self.message)
    }
}

impl From<ExecutionFailure> for AppError {
    fn from(failure: ExecutionFailure) -> Self {
        AppError::Execution(failure.to_string())
    }
}

/// What one statement produced
#[derive(Debug, Clone, PartialEq)]
pub enum StatementOutput {
    Rows(QueryResultData),
    Affected(u64),
}

/// A JSON value bound as a text-format parameter.
///
/// The server parses the text for whatever type it inferred for the
/// placeholder, so numerics, dates and uuids need no client-side conversion.
#[derive(Debug)]
struct JsonParam<'a>(&'a Value);

impl JsonParam<'_> {
    fn text(&self) -> Option<String> {
        match self.0 {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            other => Some(other.to_string()),
        }
    }
}

impl ToSql for JsonParam<'_> {
    fn to_sql(&self, _ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self.text() {
            Some(text) => {
                out.put_slice(text.as_bytes());
                Ok(IsNull::No)
            }
            None => Ok(IsNull::Yes),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn encode_format(&self, _ty: &Type) -> tokio_postgres::types::Format {
        tokio_postgres::types::Format::Text
    }

    tokio_postgres::types::to_sql_checked!();
}

/// NUMERIC as a JSON number when it fits one, otherwise as its decimal text
fn numeric_json(value: Decimal) -> Value {
    let text = value.normalize().to_string();
    serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text))
}

fn cell<'a, T: FromSql<'a>>(row: &'a Row, idx: usize, f: impl FnOnce(T) -> Value) -> Value {
    match row.try_get::<_, Option<T>>(idx) {
        Ok(Some(v)) => f(v),
        Ok(None) => Value::Null,
        Err(_) => json!(format!("<{}>", row.columns()[idx].type_().name())),
    }
}

fn row_to_json(row: &Row) -> Value {
    let mut object = serde_json::Map::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = match *column.type_() {
            Type::BOOL => cell::<bool>(row, idx, |v| json!(v)),
            Type::INT2 => cell::<i16>(row, idx, |v| json!(v)),
            Type::INT4 => cell::<i32>(row, idx, |v| json!(v)),
            Type::INT8 => cell::<i64>(row, idx, |v| json!(v)),
            Type::OID => cell::<u32>(row, idx, |v| json!(v)),
            Type::FLOAT4 => cell::<f32>(row, idx, |v| json!(v)),
            Type::FLOAT8 => cell::<f64>(row, idx, |v| json!(v)),
            Type::NUMERIC => cell::<Decimal>(row, idx, numeric_json),
            Type::JSON | Type::JSONB => cell::<Value>(row, idx, |v| v),
            Type::UUID => cell::<uuid::Uuid>(row, idx, |v| json!(v.to_string())),
            Type::DATE => cell::<chrono::NaiveDate>(row, idx, |v| json!(v.to_string())),
            Type::TIME => cell::<chrono::NaiveTime>(row, idx, |v| json!(v.to_string())),
            Type::TIMESTAMP => cell::<chrono::NaiveDateTime>(row, idx, |v| json!(v.to_string())),
            Type::TIMESTAMPTZ => {
                cell::<chrono::DateTime<chrono::Utc>>(row, idx, |v| json!(v.to_rfc3339()))
            }
            _ => cell::<String>(row, idx, |v| json!(v)),
        };
        object.insert(column.name().to_string(), value);
    }
    Value::Object(object)
}

/// Run exactly one statement. `:name` placeholders are bound from `params`;
/// values never reach the SQL text. Driver errors come back as `ExecutionFailure`.
pub async fn execute(
    client: &Client,
    sql: &str,
    params: &Params,
) -> Result<StatementOutput, ExecutionFailure> {
    let bound = bind_named_parameters(sql, params).map_err(|name| {
        ExecutionFailure::new(
            FailureKind::MissingParameter,
            format!("No value supplied for parameter ':{}'", name),
        )
    })?;

    let statement = client
        .prepare(&bound.sql)
        .await
        .map_err(ExecutionFailure::from_driver)?;

    let args: Vec<JsonParam<'_>> = bound.values.iter().map(JsonParam).collect();
    let refs: Vec<&(dyn ToSql + Sync)> = args.iter().map(|a| a as &(dyn ToSql + Sync)).collect();

    if statement.columns().is_empty() {
        let affected = client
            .execute(&statement, &refs)
            .await
            .map_err(ExecutionFailure::from_driver)?;
        return Ok(StatementOutput::Affected(affected));
    }

    let rows = client
        .query(&statement, &refs)
        .await
        .map_err(ExecutionFailure::from_driver)?;
    let columns = statement
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    Ok(StatementOutput::Rows(QueryResultData {
        columns,
        data: rows.iter().map(row_to_json).collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric(ndigits: u16, weight: i16, sign: u16, dscale: u16, digits: &[u16]) -> Vec<u8> {
        let mut raw = Vec::new();
        for word in [ndigits, weight as u16, sign, dscale] {
            raw.extend_from_slice(&word.to_be_bytes());
        }
        for d in digits {
            raw.extend_from_slice(&d.to_be_bytes());
        }
        raw
    }

    #[test]
    fn test_numeric_cells() {
        let price = Decimal::from_sql(&Type::NUMERIC, &numeric(2, 0, 0, 2, &[123, 4500])).unwrap();
        assert_eq!(numeric_json(price), json!(123.45));
        let refund = Decimal::from_sql(&Type::NUMERIC, &numeric(1, 0, 0x4000, 1, &[7])).unwrap();
        assert_eq!(numeric_json(refund), json!(-7));
        assert_eq!(numeric_json(Decimal::new(500, 4)), json!(0.05));
        assert!(Decimal::from_sql(&Type::NUMERIC, &[0, 1]).is_err());
    }

    #[test]
    fn test_param_text_rendering() {
        assert_eq!(JsonParam(&json!("Alice")).text().as_deref(), Some("Alice"));
        assert_eq!(JsonParam(&json!(100)).text().as_deref(), Some("100"));
        assert_eq!(JsonParam(&json!(true)).text().as_deref(), Some("true"));
        assert_eq!(JsonParam(&Value::Null).text(), None);
        assert_eq!(JsonParam(&json!({"a": 1})).text().as_deref(), Some("{\"a\":1}"));
    }

    #[test]
    fn test_sqlstate_mapping() {
        assert_eq!(FailureKind::from_sqlstate("42P01"), FailureKind::TableNotFound);
        assert_eq!(FailureKind::from_sqlstate("42703"), FailureKind::ColumnNotFound);
        assert_eq!(FailureKind::from_sqlstate("23505"), FailureKind::ConstraintViolation);
        assert_eq!(FailureKind::from_sqlstate("57014"), FailureKind::QueryExecutionError);
    }

    #[test]
    fn test_failure_lifts_into_execution_error() {
        let failure = ExecutionFailure::new(FailureKind::TableNotFound, "relation \"orders\" does not exist");
        let err: AppError = failure.into();
        assert!(matches!(err, AppError::Execution(ref m) if m.contains("TABLE_NOT_FOUND")));
    }
}
