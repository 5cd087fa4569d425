use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult, Row};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::models::{
    DatabaseMember, HistoryStatus, MemberView, QueryHistory, QueryTemplate, Role, User,
    VirtualDatabase,
};

/// SQLite metadata store for users, virtual databases, memberships, templates and history
/// Uses tokio::Mutex for async-friendly locking
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

fn parse_timestamp(idx: usize, raw: String) -> SqliteResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_role(idx: usize, raw: String) -> SqliteResult<Role> {
    Role::parse(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
        )
    })
}

fn virtual_database_from_row(row: &Row<'_>) -> SqliteResult<VirtualDatabase> {
    Ok(VirtualDatabase {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        virtual_name: row.get(2)?,
        physical_name: row.get(3)?,
        created_at: parse_timestamp(4, row.get(4)?)?,
    })
}

fn user_from_row(row: &Row<'_>) -> SqliteResult<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        name: row.get(2)?,
    })
}

fn history_from_row(row: &Row<'_>) -> SqliteResult<QueryHistory> {
    Ok(QueryHistory {
        id: row.get(0)?,
        user_id: row.get(1)?,
        command_text: row.get(2)?,
        generated_sql: row.get(3)?,
        status: HistoryStatus::from_db(&row.get::<_, String>(4)?),
        query_type: row.get(5)?,
        executed_at: parse_timestamp(6, row.get(6)?)?,
    })
}

const VDB_COLUMNS: &str = "id, owner_id, virtual_name, physical_name, created_at";
const HISTORY_COLUMNS: &str =
    "id, user_id, command_text, generated_sql, status, query_type, executed_at";

/// Whether an error is a UNIQUE / PRIMARY KEY violation
pub fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub async fn new<P: AsRef<Path>>(db_path: P) -> SqliteResult<Self> {
        // Handle SQLite URL format (sqlite:./path or sqlite://path)
        let path_str = db_path.as_ref().to_string_lossy();
        let clean_path: &str = if path_str.starts_with("sqlite:") {
            path_str.trim_start_matches("sqlite:").trim_start_matches("//")
        } else {
            path_str.as_ref()
        };

        let conn = Connection::open(clean_path)?;
        Self::from_connection(conn).await
    }

    /// In-memory store, used by tests and one-off tooling
    pub async fn in_memory() -> SqliteResult<Self> {
        Self::from_connection(Connection::open_in_memory()?).await
    }

    async fn from_connection(conn: Connection) -> SqliteResult<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Initialize database schema
    async fn init_schema(&self) -> SqliteResult<()> {
        let conn = self.conn.lock().await;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT UNIQUE NOT NULL,
                name TEXT NOT NULL,
                api_key_hash TEXT UNIQUE
            );

            CREATE TABLE IF NOT EXISTS virtual_databases (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                virtual_name TEXT NOT NULL,
                physical_name TEXT UNIQUE NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (owner_id) REFERENCES users(id) ON DELETE CASCADE,
                UNIQUE(owner_id, virtual_name)
            );

            CREATE TABLE IF NOT EXISTS database_members (
                user_id TEXT NOT NULL,
                database_id TEXT NOT NULL,
                role TEXT NOT NULL CHECK (role IN ('editor', 'viewer')),
                PRIMARY KEY (user_id, database_id),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (database_id) REFERENCES virtual_databases(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS query_templates (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                normalized_prompt TEXT NOT NULL,
                sql_template TEXT NOT NULL,
                original_param_map TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS query_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                command_text TEXT NOT NULL,
                generated_sql TEXT NOT NULL,
                status TEXT NOT NULL,
                query_type TEXT NOT NULL,
                executed_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_virtual_databases_owner ON virtual_databases(owner_id);
            CREATE INDEX IF NOT EXISTS idx_members_database ON database_members(database_id);
            CREATE INDEX IF NOT EXISTS idx_templates_user ON query_templates(user_id);
            CREATE INDEX IF NOT EXISTS idx_history_user ON query_history(user_id, executed_at DESC);
            "#,
        )?;

        Ok(())
    }

    // ==================== Users ====================

    /// Register a user together with the hash of its API key
    pub async fn save_user(&self, user: &User, api_key_hash: Option<&str>) -> SqliteResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO users (id, email, name, api_key_hash) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![user.id, user.email, user.name, api_key_hash],
        )?;
        Ok(())
    }

    pub async fn get_user_by_email(&self, email: &str) -> SqliteResult<Option<User>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, email, name FROM users WHERE lower(email) = lower(?1)",
            rusqlite::params![email],
            user_from_row,
        )
        .optional()
    }

    pub async fn get_user_by_api_key_hash(&self, hash: &str) -> SqliteResult<Option<User>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, email, name FROM users WHERE api_key_hash = ?1",
            rusqlite::params![hash],
            user_from_row,
        )
        .optional()
    }

    // ==================== Virtual databases ====================

    pub async fn insert_virtual_database(&self, db: &VirtualDatabase) -> SqliteResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!("INSERT INTO virtual_databases ({}) VALUES (?1, ?2, ?3, ?4, ?5)", VDB_COLUMNS),
            rusqlite::params![
                db.id,
                db.owner_id,
                db.virtual_name,
                db.physical_name,
                db.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_virtual_database(&self, id: &str) -> SqliteResult<Option<VirtualDatabase>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {} FROM virtual_databases WHERE id = ?1", VDB_COLUMNS),
            rusqlite::params![id],
            virtual_database_from_row,
        )
        .optional()
    }

    /// Look up a database by its owner-scoped name
    pub async fn get_owned_database(
        &self,
        owner_id: &str,
        virtual_name: &str,
    ) -> SqliteResult<Option<VirtualDatabase>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!(
                "SELECT {} FROM virtual_databases WHERE owner_id = ?1 AND virtual_name = ?2",
                VDB_COLUMNS
            ),
            rusqlite::params![owner_id, virtual_name],
            virtual_database_from_row,
        )
        .optional()
    }

    /// Databases named `virtual_name` that `user_id` owns or is a member of.
    /// Owned rows sort first; shared rows in creation order.
    pub async fn find_accessible_databases(
        &self,
        user_id: &str,
        virtual_name: &str,
    ) -> SqliteResult<Vec<VirtualDatabase>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT v.id, v.owner_id, v.virtual_name, v.physical_name, v.created_at
            FROM virtual_databases v
            LEFT JOIN database_members m ON m.database_id = v.id AND m.user_id = ?1
            WHERE v.virtual_name = ?2 AND (v.owner_id = ?1 OR m.user_id IS NOT NULL)
            ORDER BY CASE WHEN v.owner_id = ?1 THEN 0 ELSE 1 END, v.created_at
            "#,
        )?;
        let rows = stmt.query_map(rusqlite::params![user_id, virtual_name], virtual_database_from_row)?;
        rows.collect()
    }

    /// Every database a user owns or has been invited to, with the user's role
    pub async fn list_accessible_databases(
        &self,
        user_id: &str,
    ) -> SqliteResult<Vec<(VirtualDatabase, Role)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT v.id, v.owner_id, v.virtual_name, v.physical_name, v.created_at,
                   CASE WHEN v.owner_id = ?1 THEN 'owner' ELSE m.role END
            FROM virtual_databases v
            LEFT JOIN database_members m ON m.database_id = v.id AND m.user_id = ?1
            WHERE v.owner_id = ?1 OR m.user_id IS NOT NULL
            ORDER BY v.created_at DESC
            "#,
        )?;
        let rows = stmt.query_map(rusqlite::params![user_id], |row| {
            Ok((virtual_database_from_row(row)?, parse_role(5, row.get(5)?)?))
        })?;
        rows.collect()
    }

    /// Rename in place: both names change together
    pub async fn update_database_names(
        &self,
        id: &str,
        virtual_name: &str,
        physical_name: &str,
    ) -> SqliteResult<bool> {
        let conn = self.conn.lock().await;
        let affected = conn.execute(
            "UPDATE virtual_databases SET virtual_name = ?1, physical_name = ?2 WHERE id = ?3",
            rusqlite::params![virtual_name, physical_name, id],
        )?;
        Ok(affected > 0)
    }

    pub async fn delete_virtual_database(&self, id: &str) -> SqliteResult<bool> {
        let conn = self.conn.lock().await;
        let affected = conn.execute("DELETE FROM virtual_databases WHERE id = ?1", rusqlite::params![id])?;
        Ok(affected > 0)
    }

    // ==================== Members ====================

    pub async fn insert_member(&self, member: &DatabaseMember) -> SqliteResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO database_members (user_id, database_id, role) VALUES (?1, ?2, ?3)",
            rusqlite::params![member.user_id, member.database_id, member.role.as_str()],
        )?;
        Ok(())
    }

    pub async fn get_member_role(&self, user_id: &str, database_id: &str) -> SqliteResult<Option<Role>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT role FROM database_members WHERE user_id = ?1 AND database_id = ?2",
            rusqlite::params![user_id, database_id],
            |row| parse_role(0, row.get(0)?),
        )
        .optional()
    }

    pub async fn update_member_role(&self, user_id: &str, database_id: &str, role: Role) -> SqliteResult<bool> {
        let conn = self.conn.lock().await;
        let affected = conn.execute(
            "UPDATE database_members SET role = ?1 WHERE user_id = ?2 AND database_id = ?3",
            rusqlite::params![role.as_str(), user_id, database_id],
        )?;
        Ok(affected > 0)
    }

    pub async fn delete_member(&self, user_id: &str, database_id: &str) -> SqliteResult<bool> {
        let conn = self.conn.lock().await;
        let affected = conn.execute(
            "DELETE FROM database_members WHERE user_id = ?1 AND database_id = ?2",
            rusqlite::params![user_id, database_id],
        )?;
        Ok(affected > 0)
    }

    pub async fn list_members(&self, database_id: &str) -> SqliteResult<Vec<MemberView>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT u.id, u.name, u.email, m.role
            FROM database_members m
            JOIN users u ON u.id = m.user_id
            WHERE m.database_id = ?1
            ORDER BY u.email
            "#,
        )?;
        let rows = stmt.query_map(rusqlite::params![database_id], |row| {
            Ok(MemberView {
                user_id: row.get(0)?,
                name: row.get(1)?,
                email: row.get(2)?,
                role: parse_role(3, row.get(3)?)?,
            })
        })?;
        rows.collect()
    }

    // ==================== Query templates ====================

    /// Insert or replace a template keyed by its content hash
    pub async fn upsert_template(&self, template: &QueryTemplate) -> SqliteResult<()> {
        let param_map = serde_json::to_string(&template.original_param_map)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO query_templates
            (id, user_id, normalized_prompt, sql_template, original_param_map, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            rusqlite::params![
                template.id,
                template.user_id,
                template.normalized_prompt,
                template.sql_template,
                param_map,
                template.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_template(&self, id: &str) -> SqliteResult<Option<QueryTemplate>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, user_id, normalized_prompt, sql_template, original_param_map, created_at FROM query_templates WHERE id = ?1",
            rusqlite::params![id],
            |row| {
                let raw_map: String = row.get(4)?;
                let original_param_map = serde_json::from_str(&raw_map).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
                })?;
                Ok(QueryTemplate {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    normalized_prompt: row.get(2)?,
                    sql_template: row.get(3)?,
                    original_param_map,
                    created_at: parse_timestamp(5, row.get(5)?)?,
                })
            },
        )
        .optional()
    }

    // ==================== Query history ====================

    /// Record an execution, replacing an older entry for the same user and SQL
    pub async fn add_history(
        &self,
        user_id: &str,
        command_text: &str,
        generated_sql: &str,
        status: HistoryStatus,
        query_type: &str,
    ) -> SqliteResult<i64> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM query_history WHERE user_id = ?1 AND generated_sql = ?2",
            rusqlite::params![user_id, generated_sql],
        )?;
        tx.execute(
            r#"
            INSERT INTO query_history (user_id, command_text, generated_sql, status, query_type, executed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            rusqlite::params![
                user_id,
                command_text,
                generated_sql,
                status.as_str(),
                query_type,
                Utc::now().to_rfc3339(),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    /// Most recent successful entry for exactly this command text
    pub async fn find_successful_history(
        &self,
        user_id: &str,
        command_text: &str,
    ) -> SqliteResult<Option<QueryHistory>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!(
                "SELECT {} FROM query_history WHERE user_id = ?1 AND command_text = ?2 AND status = 'success' ORDER BY executed_at DESC, id DESC LIMIT 1",
                HISTORY_COLUMNS
            ),
            rusqlite::params![user_id, command_text],
            history_from_row,
        )
        .optional()
    }

    pub async fn list_history(&self, user_id: &str, limit: usize) -> SqliteResult<Vec<QueryHistory>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM query_history WHERE user_id = ?1 ORDER BY executed_at DESC, id DESC LIMIT ?2",
            HISTORY_COLUMNS
        ))?;
        let rows = stmt.query_map(rusqlite::params![user_id, limit as i64], history_from_row)?;
        rows.collect()
    }
}
