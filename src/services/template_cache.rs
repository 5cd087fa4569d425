//! Per-user cache of parameterized SQL derived from natural-language prompts.
//!
//! A prompt such as `Show {name} orders over {amount}` is reduced to its shape
//! (`Show {param_0} orders over {param_1}`). The first time a shape is seen the
//! generated SQL is turned into a template by replacing the literal parameter
//! values with `:param_N` binds; later requests with the same shape replay the
//! template with their own values and never reach the SQL generator.
//!
//! Templates are not invalidated when the schema of the target database
//! changes.

use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::api::middleware::AppError;
use crate::models::{Params, QueryTemplate, User};
use crate::storage::SqliteStorage;
use crate::validation::code_byte_mask;

/// A prompt reduced to its shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedPrompt {
    pub text: String,
    /// Original placeholder names in first-seen order; index N is `param_N`
    pub names: Vec<String>,
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{(\w+)\}").expect("valid regex"))
}

/// Replace each `{name}` with `{param_N}` in first-seen order. A repeated name keeps its position.
pub fn normalize(prompt: &str) -> NormalizedPrompt {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut names = Vec::new();

    let text = placeholder_pattern()
        .replace_all(prompt, |caps: &regex::Captures| {
            let name = &caps[1];
            let position = *positions.entry(name.to_string()).or_insert_with(|| {
                names.push(name.to_string());
                names.len() - 1
            });
            format!("{{param_{}}}", position)
        })
        .into_owned();

    NormalizedPrompt { text, names }
}

/// Cache key: hex sha256 of `user_id:normalized_text`
pub fn template_id(user_id: &str, normalized_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", user_id, normalized_text).as_bytes());
    hex::encode(hasher.finalize())
}

/// How a parameter value is written in SQL text, if it can appear there at all
fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn is_word_char(c: Option<char>) -> bool {
    c.is_some_and(|c| c.is_alphanumeric() || c == '_')
}

/// Either a whole string literal holding the value, optionally wrapped in LIKE
/// wildcards, or the bare value on word boundaries.
fn value_pattern(text: &str) -> Result<Regex, regex::Error> {
    let escaped = regex::escape(text);
    let lead = if is_word_char(text.chars().next()) { r"\b" } else { "" };
    let trail = if is_word_char(text.chars().last()) { r"\b" } else { "" };
    Regex::new(&format!(
        r"'(?P<leading>[%_]*){escaped}(?P<trailing>[%_]*)'|{lead}(?P<bare>{escaped}){trail}"
    ))
}

/// Whether `sql[start..end]` is only part of a decimal number such as `100.00`
fn inside_number(sql: &str, start: usize, end: usize) -> bool {
    fn dot_then_digit(mut chars: impl Iterator<Item = char>) -> bool {
        chars.next() == Some('.') && chars.next().is_some_and(|c| c.is_ascii_digit())
    }
    dot_then_digit(sql[end..].chars()) || dot_then_digit(sql[..start].chars().rev())
}

fn literal_replacement(leading: &str, trailing: &str, placeholder: &str) -> String {
    match (leading.is_empty(), trailing.is_empty()) {
        (true, true) => placeholder.to_string(),
        (false, true) => format!("'{}' || {}", leading, placeholder),
        (true, false) => format!("{} || '{}'", placeholder, trailing),
        (false, false) => format!("'{}' || {} || '{}'", leading, placeholder, trailing),
    }
}

/// Generated SQL with parameter values replaced by `:param_N`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deconstructed {
    pub sql: String,
    /// Names whose value could be substituted but was not found in the SQL
    pub unplaced: Vec<String>,
}

impl Deconstructed {
    /// Safe to cache: replaying it cannot silently reuse a literal from this request
    pub fn is_complete(&self) -> bool {
        self.unplaced.is_empty()
    }
}

/// Turn generated SQL into a template by replacing parameter values with `:param_N`.
///
/// Values are matched longest first against the original text and every match
/// claims its span, so a short value can never match inside a longer value or
/// inside an inserted placeholder. Bare matches inside string literals are ignored.
pub fn deconstruct(sql: &str, params: &Params, names: &[String]) -> Deconstructed {
    let code = code_byte_mask(sql);
    let is_code = |i: usize| code.get(i).copied().unwrap_or(true);

    let mut candidates: Vec<(usize, String)> = names
        .iter()
        .enumerate()
        .filter_map(|(i, name)| params.get(name).and_then(value_text).map(|t| (i, t)))
        .collect();
    candidates.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

    let mut claimed: Vec<(usize, usize, String)> = Vec::new();
    let mut unplaced = Vec::new();
    for (position, text) in candidates {
        let claimed_before = claimed.len();
        let placeholder = format!(":param_{}", position);
        let pattern = match value_pattern(&text) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Skipping parameter {} in template: {}", position, e);
                unplaced.push(names[position].clone());
                continue;
            }
        };

        for caps in pattern.captures_iter(sql) {
            let Some(whole) = caps.get(0) else { continue };
            let (start, end) = (whole.start(), whole.end());
            if claimed.iter().any(|(s, e, _)| start < *e && *s < end) {
                continue;
            }

            let replacement = match caps.name("bare") {
                Some(bare) => {
                    if !is_code(bare.start()) || inside_number(sql, bare.start(), bare.end()) {
                        continue;
                    }
                    placeholder.clone()
                }
                None => {
                    // the quotes must delimit one whole literal
                    let opens_literal = start == 0 || is_code(start - 1);
                    let closes_literal = end == sql.len() || is_code(end);
                    if !opens_literal || !closes_literal {
                        continue;
                    }
                    literal_replacement(
                        caps.name("leading").map_or("", |m| m.as_str()),
                        caps.name("trailing").map_or("", |m| m.as_str()),
                        &placeholder,
                    )
                }
            };
            claimed.push((start, end, replacement));
        }
        if claimed.len() == claimed_before {
            unplaced.push(names[position].clone());
        }
    }

    claimed.sort_by_key(|(start, _, _)| *start);
    let mut template = String::with_capacity(sql.len());
    let mut cursor = 0;
    for (start, end, replacement) in claimed {
        template.push_str(&sql[cursor..start]);
        template.push_str(&replacement);
        cursor = end;
    }
    template.push_str(&sql[cursor..]);
    Deconstructed {
        sql: template,
        unplaced,
    }
}

/// Bind values for a replayed template: `param_N` takes the value of the Nth
/// placeholder name of the current prompt.
pub fn replay_params(names: &[String], params: &Params) -> Result<Params, AppError> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            params
                .get(name)
                .cloned()
                .map(|value| (format!("param_{}", i), value))
                .ok_or_else(|| {
                    AppError::Cache(format!("Missing required parameter '{}' in your request", name))
                })
        })
        .collect()
}

pub struct TemplateCache {
    storage: Arc<SqliteStorage>,
}

impl TemplateCache {
    pub fn new(storage: Arc<SqliteStorage>) -> Self {
        Self { storage }
    }

    /// Find the template for this prompt's shape. The ordered names of the
    /// current prompt are returned on hit and on miss.
    pub async fn lookup(
        &self,
        user: &User,
        prompt: &str,
    ) -> Result<(Option<QueryTemplate>, Vec<String>), AppError> {
        let normalized = normalize(prompt);
        let id = template_id(&user.id, &normalized.text);
        let template = self.storage.get_template(&id).await?;
        match &template {
            Some(_) => tracing::debug!("Template cache hit for user {}: {}", user.id, normalized.text),
            None => tracing::debug!("Template cache miss for user {}: {}", user.id, normalized.text),
        }
        Ok((template, normalized.names))
    }

    pub async fn store(
        &self,
        user: &User,
        prompt: &str,
        sql_template: &str,
        names: &[String],
    ) -> Result<QueryTemplate, AppError> {
        let normalized = normalize(prompt);
        let template = QueryTemplate {
            id: template_id(&user.id, &normalized.text),
            user_id: user.id.clone(),
            normalized_prompt: normalized.text,
            sql_template: sql_template.to_string(),
            original_param_map: names.to_vec(),
            created_at: Utc::now(),
        };
        self.storage.upsert_template(&template).await?;
        Ok(template)
    }
}
