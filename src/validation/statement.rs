//! Lexical helpers for routing SQL text: splitting, classification and
//! named-parameter binding. None of this is a parser; it only needs to know
//! which characters are code and which sit inside literals or comments.

use regex::Regex;
use serde_json::Value;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::api::middleware::AppError;
use crate::models::Params;

/// Leading keywords (after whitespace normalisation) that mark a statement as a write
const WRITE_PREFIXES: &[&str] = &[
    "INSERT",
    "UPDATE",
    "DELETE",
    "CREATE TABLE",
    "DROP TABLE",
    "ALTER TABLE",
    "TRUNCATE",
    "MERGE",
    "COPY",
    "GRANT",
    "REVOKE",
    "COMMENT",
];

/// First words that make a command a candidate for raw SQL
const SQL_KEYWORDS: &[&str] = &[
    "SELECT", "INSERT", "UPDATE", "DELETE", "MERGE", "CALL", "EXPLAIN", "WITH", "CREATE",
    "DROP", "ALTER", "TRUNCATE", "COMMENT", "GRANT", "REVOKE", "BEGIN", "COMMIT", "ROLLBACK",
    "SAVEPOINT", "SET", "VALUES", "TABLE",
];

/// Database-level statements that are routed to the registry instead of being executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    CreateDatabase { name: String },
    DropDatabase { name: String },
    RenameDatabase { from: String, to: String },
}

/// Marks every char of `chars` with whether it is plain code (true) or part of
/// a string literal, quoted identifier, dollar-quoted body or comment (false).
fn code_mask(chars: &[char]) -> Vec<bool> {
    let n = chars.len();
    let mut mask = vec![true; n];
    let mut i = 0;

    while i < n {
        match chars[i] {
            quote @ ('\'' | '"') => {
                let mut j = i + 1;
                while j < n {
                    if chars[j] == quote {
                        // doubled quote is an escaped quote
                        if j + 1 < n && chars[j + 1] == quote {
                            j += 2;
                            continue;
                        }
                        break;
                    }
                    j += 1;
                }
                blank(&mut mask, i, j + 1);
                i = j + 1;
            }
            '-' if i + 1 < n && chars[i + 1] == '-' => {
                let mut j = i;
                while j < n && chars[j] != '\n' {
                    j += 1;
                }
                blank(&mut mask, i, j);
                i = j;
            }
            '/' if i + 1 < n && chars[i + 1] == '*' => {
                let mut j = i + 2;
                while j + 1 < n && !(chars[j] == '*' && chars[j + 1] == '/') {
                    j += 1;
                }
                blank(&mut mask, i, j + 2);
                i = j + 2;
            }
            '$' => match dollar_tag(chars, i) {
                Some(tag_len) => {
                    let tag = &chars[i..i + tag_len];
                    let mut j = i + tag_len;
                    while j + tag_len <= n && &chars[j..j + tag_len] != tag {
                        j += 1;
                    }
                    let end = if j + tag_len <= n { j + tag_len } else { n };
                    blank(&mut mask, i, end);
                    i = end;
                }
                None => i += 1,
            },
            _ => i += 1,
        }
    }
    mask
}

fn blank(mask: &mut [bool], from: usize, to: usize) {
    let to = to.min(mask.len());
    for m in mask.iter_mut().take(to).skip(from) {
        *m = false;
    }
}

/// Length of a `$tag$` opener starting at `start`, if there is one. `$1` style
/// positional parameters are not tags.
fn dollar_tag(chars: &[char], start: usize) -> Option<usize> {
    let mut j = start + 1;
    if j < chars.len() && chars[j].is_ascii_digit() {
        return None;
    }
    while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
        j += 1;
    }
    (j < chars.len() && chars[j] == '$').then_some(j - start + 1)
}

/// Per-byte version of the code mask: true where the byte belongs to plain code
pub fn code_byte_mask(sql: &str) -> Vec<bool> {
    let chars: Vec<char> = sql.chars().collect();
    let mask = code_mask(&chars);
    let mut bytes = Vec::with_capacity(sql.len());
    for (c, is_code) in chars.iter().zip(mask) {
        bytes.extend(std::iter::repeat(is_code).take(c.len_utf8()));
    }
    bytes
}

/// Split a script into individual statements on semicolons that are not inside
/// literals or comments. Empty statements are dropped.
pub fn split_statements(sql: &str) -> Vec<String> {
    let chars: Vec<char> = sql.chars().collect();
    let mask = code_mask(&chars);
    let mut statements = Vec::new();
    let mut current = String::new();

    for (c, is_code) in chars.iter().zip(mask.iter()) {
        if *c == ';' && *is_code {
            push_statement(&mut statements, &current);
            current.clear();
        } else {
            current.push(*c);
        }
    }
    push_statement(&mut statements, &current);
    statements
}

fn push_statement(statements: &mut Vec<String>, text: &str) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
}

/// Skip whitespace and any comments in front of the first keyword
fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, tail)| tail).unwrap_or("").trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, tail)| tail).unwrap_or("").trim_start();
        } else {
            return rest;
        }
    }
}

/// Upper-cased leading words of a statement separated by single spaces
fn normalized_head(sql: &str, words: usize) -> String {
    strip_leading_comments(sql)
        .split_whitespace()
        .take(words)
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// The first keyword of a statement, upper-cased (e.g. `SELECT`)
pub fn leading_keyword(sql: &str) -> String {
    strip_leading_comments(sql)
        .trim_start_matches('(')
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_uppercase()
}

/// Whether a statement modifies data or schema and therefore needs at least the editor role
pub fn is_write_statement(sql: &str) -> bool {
    let head = normalized_head(sql, 3);
    if WRITE_PREFIXES.iter().any(|p| head.starts_with(p)) {
        return true;
    }
    // Other object DDL (indexes, views, sequences...) is a write as well; database DDL is not
    // classified here because it is owner-only and handled by the registry.
    let keyword = leading_keyword(sql);
    match keyword.as_str() {
        "WITH" => has_data_modifying_clause(sql) || has_code_keyword(sql, "INTO"),
        "SELECT" => has_code_keyword(sql, "INTO"),
        "CALL" | "DO" => true,
        "EXPLAIN" => explain_target(sql).is_some_and(is_write_statement),
        "CREATE" | "DROP" | "ALTER" => !head.contains("DATABASE"),
        _ => false,
    }
}

/// `SELECT ... INTO new_table` creates a table
fn has_code_keyword(sql: &str, keyword: &str) -> bool {
    let code = code_byte_mask(sql);
    let upper = sql.to_ascii_uppercase();
    upper.match_indices(keyword).any(|(start, _)| {
        let end = start + keyword.len();
        let bounded = |c: Option<char>| !c.is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
        code.get(start).copied().unwrap_or(false)
            && bounded(upper[..start].chars().next_back())
            && bounded(upper[end..].chars().next())
    })
}

/// The statement an `EXPLAIN ANALYZE` runs. Plain `EXPLAIN` only plans, so it has none.
fn explain_target(sql: &str) -> Option<&str> {
    let mut rest = strip_leading_comments(sql).get("EXPLAIN".len()..)?.trim_start();
    let mut analyze = false;

    if let Some(options) = rest.strip_prefix('(') {
        let (inner, tail) = options.split_once(')')?;
        analyze = inner.split(',').any(|option| {
            let mut words = option.split_whitespace().map(str::to_ascii_uppercase);
            let name = words.next().unwrap_or_default();
            let setting = words.next();
            matches!(name.as_str(), "ANALYZE" | "ANALYSE")
                && !matches!(setting.as_deref(), Some("FALSE" | "OFF" | "0"))
        });
        rest = tail.trim_start();
    } else {
        loop {
            let word: String = rest.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
            match word.to_ascii_uppercase().as_str() {
                "ANALYZE" | "ANALYSE" => analyze = true,
                "VERBOSE" => {}
                _ => break,
            }
            rest = rest[word.len()..].trim_start();
        }
    }
    analyze.then_some(rest)
}

fn data_modifying_keyword() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(FOR\s+(?:NO\s+KEY\s+)?)?(INSERT|UPDATE|DELETE|MERGE)\b").expect("valid regex")
    })
}

/// `WITH` statements write when any CTE or the main statement modifies data.
/// `FOR UPDATE` row locks do not count.
fn has_data_modifying_clause(sql: &str) -> bool {
    let code = code_byte_mask(sql);
    data_modifying_keyword().captures_iter(sql).any(|caps| {
        let row_lock = caps.get(1).is_some();
        !row_lock && caps.get(2).is_some_and(|m| code.get(m.start()).copied().unwrap_or(false))
    })
}

/// Whether a statement controls the session transaction itself
pub fn is_transaction_control(sql: &str) -> bool {
    matches!(
        leading_keyword(sql).as_str(),
        "BEGIN" | "START" | "COMMIT" | "END" | "ROLLBACK" | "ABORT" | "SAVEPOINT" | "RELEASE"
            | "PREPARE"
    )
}

/// Whether a statement is database-level DDL
pub fn is_admin_statement(sql: &str) -> bool {
    let head = normalized_head(sql, 2);
    head == "CREATE DATABASE" || head == "DROP DATABASE" || head == "ALTER DATABASE"
}

fn admin_patterns() -> &'static (Regex, Regex, Regex) {
    static PATTERNS: OnceLock<(Regex, Regex, Regex)> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        (
            Regex::new(r#"(?is)^CREATE\s+DATABASE\s+"?(\w+)"?\s*;?\s*$"#).expect("valid regex"),
            Regex::new(r#"(?is)^DROP\s+DATABASE\s+(?:IF\s+EXISTS\s+)?"?(\w+)"?\s*;?\s*$"#)
                .expect("valid regex"),
            Regex::new(r#"(?is)^ALTER\s+DATABASE\s+"?(\w+)"?\s+RENAME\s+TO\s+"?(\w+)"?\s*;?\s*$"#)
                .expect("valid regex"),
        )
    })
}

/// Parse a database-level statement. Returns `Ok(None)` for ordinary statements and a
/// validation error for database DDL the registry cannot express.
pub fn parse_admin_command(sql: &str) -> Result<Option<AdminCommand>, AppError> {
    if !is_admin_statement(sql) {
        return Ok(None);
    }
    let (create, drop, rename) = admin_patterns();
    let sql = sql.trim();

    if let Some(caps) = create.captures(sql) {
        return Ok(Some(AdminCommand::CreateDatabase { name: caps[1].to_string() }));
    }
    if let Some(caps) = drop.captures(sql) {
        return Ok(Some(AdminCommand::DropDatabase { name: caps[1].to_string() }));
    }
    if let Some(caps) = rename.captures(sql) {
        return Ok(Some(AdminCommand::RenameDatabase {
            from: caps[1].to_string(),
            to: caps[2].to_string(),
        }));
    }
    Err(AppError::Validation(format!(
        "Unsupported database command: {}. Supported forms are CREATE DATABASE name, DROP DATABASE name and ALTER DATABASE name RENAME TO new_name",
        sql
    )))
}

/// Heuristic used to route a command: raw SQL when the first word is a SQL keyword
/// and the text is either `;`-terminated or parses as PostgreSQL.
pub fn looks_like_sql(command: &str) -> bool {
    let command = command.trim();
    if command.is_empty() {
        return false;
    }
    let first = leading_keyword(command);
    if !SQL_KEYWORDS.contains(&first.as_str()) {
        return false;
    }
    if command.ends_with(';') {
        return true;
    }
    Parser::parse_sql(&PostgreSqlDialect {}, command).is_ok()
}

fn brace_placeholder() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{(\w+)\}").expect("valid regex"))
}

/// Rewrite `{name}` placeholders in raw SQL into `:name` bind parameters
pub fn braces_to_named_binds(sql: &str) -> String {
    brace_placeholder().replace_all(sql, ":$1").into_owned()
}

/// Substitute `{name}` placeholders with display values for a natural-language prompt.
/// Only used for text sent to the NLP collaborator, never for SQL.
pub fn fill_prompt(prompt: &str, params: &Params) -> String {
    brace_placeholder()
        .replace_all(prompt, |caps: &regex::Captures| match params.get(&caps[1]) {
            Some(Value::String(s)) => format!("\"{}\"", s),
            Some(other) => format!("\"{}\"", other),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Statement text rewritten for positional binding
#[derive(Debug, Clone, PartialEq)]
pub struct BoundStatement {
    pub sql: String,
    /// Value for `$1`, `$2`, ...
    pub values: Vec<Value>,
}

/// Rewrite `:name` placeholders outside literals into `$n` and collect the values
/// in positional order. A name used twice shares one position. `::type` casts are
/// left untouched. Returns the missing name if a placeholder has no value.
pub fn bind_named_parameters(sql: &str, params: &Params) -> Result<BoundStatement, String> {
    let chars: Vec<char> = sql.chars().collect();
    let mask = code_mask(&chars);
    let mut out = String::with_capacity(sql.len());
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut values = Vec::new();
    // inside `[...]` a colon is an array slice bound
    let mut bracket_depth = 0usize;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if mask[i] {
            match c {
                '[' => bracket_depth += 1,
                ']' => bracket_depth = bracket_depth.saturating_sub(1),
                _ => {}
            }
        }
        if c == ':' && mask[i] && bracket_depth == 0 {
            if i + 1 < chars.len() && chars[i + 1] == ':' {
                out.push_str("::");
                i += 2;
                continue;
            }
            let starts_ident = i + 1 < chars.len()
                && (chars[i + 1].is_ascii_alphabetic() || chars[i + 1] == '_');
            if starts_ident {
                let mut j = i + 1;
                while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
                    j += 1;
                }
                let name: String = chars[i + 1..j].iter().collect();
                let position = match positions.get(&name) {
                    Some(p) => *p,
                    None => {
                        let value = params.get(&name).ok_or_else(|| name.clone())?;
                        values.push(value.clone());
                        positions.insert(name, values.len());
                        values.len()
                    }
                };
                out.push('$');
                out.push_str(&position.to_string());
                i = j;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }

    Ok(BoundStatement { sql: out, values })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Params {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_split_respects_literals_and_comments() {
        let sql = "INSERT INTO t VALUES ('a;b'); -- trailing; comment\nSELECT \"x;y\" FROM t; /* ; */ SELECT $$;$$";
        let statements = split_statements(sql);
        assert_eq!(statements.len(), 3);
        assert_eq!(statements[0], "INSERT INTO t VALUES ('a;b')");
        assert!(statements[1].ends_with("SELECT \"x;y\" FROM t"));
        assert!(statements[2].ends_with("SELECT $$;$$"));
    }

    #[test]
    fn test_split_drops_empty_statements() {
        assert_eq!(split_statements("SELECT 1;;  ;"), vec!["SELECT 1".to_string()]);
        assert!(split_statements("   ").is_empty());
    }

    #[test]
    fn test_write_classification() {
        assert!(is_write_statement("insert into orders values (1)"));
        assert!(is_write_statement("CREATE   TABLE t (id int)"));
        assert!(is_write_statement("create index idx on t(id)"));
        assert!(is_write_statement("TRUNCATE orders"));
        assert!(!is_write_statement("SELECT * FROM orders"));
        assert!(!is_write_statement("CREATE DATABASE sales"));
        assert!(!is_write_statement("WITH x AS (SELECT 1) SELECT * FROM x"));
        assert!(is_write_statement("WITH gone AS (DELETE FROM orders RETURNING id) SELECT count(*) FROM gone"));
        assert!(!is_write_statement("WITH x AS (SELECT 'delete' AS op) SELECT * FROM x FOR UPDATE"));
        assert!(is_write_statement("-- cleanup\n/* nightly */ DELETE FROM orders"));
    }

    #[test]
    fn test_statements_that_write_through_reads() {
        assert!(is_write_statement("EXPLAIN ANALYZE DELETE FROM orders"));
        assert!(is_write_statement("explain analyze verbose update orders set total = 0"));
        assert!(is_write_statement("EXPLAIN (ANALYZE, BUFFERS) INSERT INTO orders VALUES (1)"));
        assert!(!is_write_statement("EXPLAIN DELETE FROM orders"));
        assert!(!is_write_statement("EXPLAIN (ANALYZE false) DELETE FROM orders"));
        assert!(!is_write_statement("EXPLAIN ANALYZE SELECT * FROM orders"));

        assert!(is_write_statement("SELECT * INTO stolen FROM orders"));
        assert!(is_write_statement("WITH x AS (SELECT 1) SELECT * INTO copy FROM x"));
        assert!(!is_write_statement("SELECT 'into' AS word, intonation FROM orders"));

        assert!(is_write_statement("CALL purge_orders()"));
        assert!(is_write_statement("DO $$ BEGIN DELETE FROM orders; END $$"));
        for sql in ["EXPLAIN ANALYZE DELETE FROM orders", "SELECT * INTO stolen FROM orders", "CALL purge_orders()"] {
            assert!(looks_like_sql(sql), "{}", sql);
        }
    }

    #[test]
    fn test_transaction_control_detection() {
        assert!(is_transaction_control("COMMIT"));
        assert!(is_transaction_control("  begin;"));
        assert!(is_transaction_control("rollback to savepoint a"));
        assert!(!is_transaction_control("SELECT 1"));
    }

    #[test]
    fn test_code_byte_mask_covers_multibyte_literals() {
        let sql = "SELECT 'é' FROM t";
        let mask = code_byte_mask(sql);
        assert_eq!(mask.len(), sql.len());
        let quote = sql.find('\'').unwrap();
        assert!(mask[0]);
        assert!(!mask[quote + 1]);
        assert!(mask[sql.find("FROM").unwrap()]);
    }

    #[test]
    fn test_parse_admin_commands() {
        assert_eq!(
            parse_admin_command("CREATE DATABASE sales;").unwrap(),
            Some(AdminCommand::CreateDatabase { name: "sales".into() })
        );
        assert_eq!(
            parse_admin_command("drop database if exists \"sales\"").unwrap(),
            Some(AdminCommand::DropDatabase { name: "sales".into() })
        );
        assert_eq!(
            parse_admin_command("ALTER DATABASE sales RENAME TO revenue").unwrap(),
            Some(AdminCommand::RenameDatabase { from: "sales".into(), to: "revenue".into() })
        );
        assert_eq!(parse_admin_command("SELECT 1").unwrap(), None);
        assert!(matches!(
            parse_admin_command("ALTER DATABASE sales OWNER TO bob"),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_looks_like_sql() {
        assert!(looks_like_sql("SELECT * FROM orders"));
        assert!(looks_like_sql("insert into t values ({name});"));
        assert!(!looks_like_sql("show me all orders from last week"));
        assert!(!looks_like_sql("select the three biggest customers"));
        assert!(!looks_like_sql(""));
    }

    #[test]
    fn test_bind_named_parameters() {
        let p = params(json!({"param_0": "Alice", "param_1": 100}));
        let bound = bind_named_parameters(
            "SELECT * FROM orders WHERE customer = :param_0 AND total > :param_1 AND note = ':param_0' AND id::text <> :param_0",
            &p,
        )
        .unwrap();
        assert_eq!(
            bound.sql,
            "SELECT * FROM orders WHERE customer = $1 AND total > $2 AND note = ':param_0' AND id::text <> $1"
        );
        assert_eq!(bound.values, vec![json!("Alice"), json!(100)]);
    }

    #[test]
    fn test_bind_skips_array_slices() {
        let p = params(json!({"lo": 1, "hi": 3}));
        let bound = bind_named_parameters("SELECT tags[1:2], tags[:lo] FROM t WHERE n > :hi", &p).unwrap();
        assert_eq!(bound.sql, "SELECT tags[1:2], tags[:lo] FROM t WHERE n > $1");
        assert_eq!(bound.values, vec![json!(3)]);
    }

    #[test]
    fn test_bind_reports_missing_parameter() {
        let p = params(json!({"a": 1}));
        assert_eq!(
            bind_named_parameters("SELECT :a, :b", &p).unwrap_err(),
            "b".to_string()
        );
    }

    #[test]
    fn test_braces_and_prompt_fill() {
        assert_eq!(
            braces_to_named_binds("SELECT * FROM t WHERE a = {name}"),
            "SELECT * FROM t WHERE a = :name"
        );
        let p = params(json!({"name": "Alice", "amount": 100}));
        assert_eq!(
            fill_prompt("Show {name} orders over {amount} in {city}", &p),
            "Show \"Alice\" orders over \"100\" in {city}"
        );
    }
}
