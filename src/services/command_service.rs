use deadpool_postgres::Object;
use std::sync::Arc;
use tokio_postgres::Client;

use crate::api::middleware::AppError;
use crate::models::{CommandRequest, CommandResponse, HistoryStatus, Params, Role, User, VirtualDatabase};
use crate::services::authorization::{get_role, require_role};
use crate::services::llm_service::{GeneratedSql, NlpResponse, SchemaReader, SqlGenerator};
use crate::services::sql_executor::{self, ExecutionFailure, StatementOutput};
use crate::services::template_cache::{deconstruct, replay_params, TemplateCache};
use crate::services::transaction::{TransactionCoordinator, TransactionalConnection};
use crate::services::{EngineManager, HistoryService, VirtualDatabaseRegistry};
use crate::storage::SqliteStorage;
use crate::validation::{
    braces_to_named_binds, fill_prompt, is_transaction_control, is_write_statement,
    looks_like_sql, parse_admin_command, split_statements, AdminCommand,
};

/// Where the statements of a command came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSource {
    RawSql,
    Template,
    History,
    Generated,
}

/// Statements ready to run, with their bind values
#[derive(Debug, Clone)]
pub struct CommandPlan {
    pub statements: Vec<String>,
    pub bind: Params,
    pub source: CommandSource,
}

impl CommandPlan {
    pub fn script(&self) -> String {
        format!("{};", self.statements.join(";\n"))
    }
}

/// Autocommit-path connection with an open transaction.
///
/// If the scope is dropped before commit or rollback completed (request
/// cancelled, commit failed) the connection is detached from its pool and
/// closed instead of being handed to the next caller mid-transaction.
struct TransactionScope {
    conn: Option<Object>,
}

impl TransactionScope {
    async fn begin(mut conn: Object) -> Result<Self, AppError> {
        conn.begin().await?;
        Ok(Self { conn: Some(conn) })
    }

    fn conn(&self) -> Result<&Object, AppError> {
        self.conn
            .as_ref()
            .ok_or_else(|| AppError::Internal("Transaction scope already closed".to_string()))
    }

    async fn finish(mut self, commit: bool) -> Result<(), AppError> {
        let result = match self.conn.as_mut() {
            Some(conn) if commit => conn.commit().await,
            Some(conn) => conn.rollback().await,
            None => return Err(AppError::Internal("Transaction scope already closed".to_string())),
        };
        if result.is_ok() {
            // back to the pool
            self.conn.take();
        }
        result
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::warn!("Discarding connection left inside an unfinished transaction");
            drop(Object::take(conn));
        }
    }
}

/// Run statements in order on one connection, stopping at the first failure
async fn run_statements(
    client: &Client,
    statements: &[String],
    params: &Params,
) -> Result<StatementOutput, ExecutionFailure> {
    let mut last = StatementOutput::Affected(0);
    for statement in statements {
        last = sql_executor::execute(client, statement, params).await.map_err(|failure| {
            tracing::error!("Statement failed: {} -- {}", statement, failure);
            failure
        })?;
    }
    Ok(last)
}

fn respond(output: StatementOutput) -> CommandResponse {
    match output {
        StatementOutput::Rows(data) => CommandResponse {
            success: true,
            message: format!("Query executed successfully. {} rows returned.", data.data.len()),
            result: Some(data),
            generated_sql: None,
        },
        StatementOutput::Affected(n) => {
            CommandResponse::message(format!("Query executed successfully. {} rows affected.", n))
        }
    }
}

/// Routes one command from text to result: caches, SQL generation,
/// authorization, database-level commands and execution.
pub struct CommandService {
    storage: Arc<SqliteStorage>,
    engines: Arc<EngineManager>,
    registry: Arc<VirtualDatabaseRegistry>,
    coordinator: Arc<TransactionCoordinator>,
    templates: TemplateCache,
    history: Arc<HistoryService>,
    generator: Arc<dyn SqlGenerator>,
    schemas: Arc<dyn SchemaReader>,
}

impl CommandService {
    pub fn new(
        engines: Arc<EngineManager>,
        registry: Arc<VirtualDatabaseRegistry>,
        coordinator: Arc<TransactionCoordinator>,
        history: Arc<HistoryService>,
        generator: Arc<dyn SqlGenerator>,
    ) -> Self {
        let storage = engines.metadata();
        Self {
            templates: TemplateCache::new(storage.clone()),
            storage,
            schemas: engines.clone(),
            engines,
            registry,
            coordinator,
            history,
            generator,
        }
    }

    /// Read schemas for the SQL generator from somewhere other than the live engines
    pub fn with_schema_reader(mut self, schemas: Arc<dyn SchemaReader>) -> Self {
        self.schemas = schemas;
        self
    }

    /// Execute a command against `target`, inside the transaction `tx_token` if given
    pub async fn execute_command(
        &self,
        user: &User,
        target: &str,
        tx_token: Option<&str>,
        request: &CommandRequest,
    ) -> Result<CommandResponse, AppError> {
        let empty = Params::new();
        let params = request.params().unwrap_or(&empty);

        let plan = self.plan(user, target, &request.command, params).await?;
        let script = plan.script();
        let outcome = self.run_plan(user, target, tx_token, &plan).await;

        // Replays are not logged; their SQL still holds placeholders
        if plan.source != CommandSource::Template {
            let status = if outcome.is_ok() {
                HistoryStatus::Success
            } else {
                HistoryStatus::Error
            };
            let command = fill_prompt(&request.command, params);
            if let Err(e) = self.history.log(user, &command, &script, status).await {
                tracing::warn!("Failed to record history for user {}: {}", user.id, e);
            }
        }

        let mut response = outcome?;
        response.generated_sql = Some(script);
        Ok(response)
    }

    /// Turn command text into statements: raw SQL as-is, otherwise the
    /// template cache, the history cache, then the SQL generator.
    pub async fn plan(
        &self,
        user: &User,
        target: &str,
        command: &str,
        params: &Params,
    ) -> Result<CommandPlan, AppError> {
        let plan = if looks_like_sql(command) {
            CommandPlan {
                statements: split_statements(&braces_to_named_binds(command)),
                bind: params.clone(),
                source: CommandSource::RawSql,
            }
        } else if !params.is_empty() {
            let (template, names) = self.templates.lookup(user, command).await?;
            match template {
                Some(template) => {
                    tracing::info!("Template cache hit for user {}", user.id);
                    CommandPlan {
                        statements: split_statements(&template.sql_template),
                        bind: replay_params(&names, params)?,
                        source: CommandSource::Template,
                    }
                }
                None => {
                    let generated = self
                        .generate(user, target, &fill_prompt(command, params))
                        .await?;
                    let template = deconstruct(&generated.script(), params, &names);
                    if template.is_complete() {
                        self.templates
                            .store(user, command, &template.sql, &names)
                            .await?;
                    } else {
                        tracing::debug!(
                            "Not caching template for user {}: {:?} not found in generated SQL",
                            user.id,
                            template.unplaced
                        );
                    }
                    CommandPlan {
                        statements: generated.statements,
                        bind: Params::new(),
                        source: CommandSource::Generated,
                    }
                }
            }
        } else {
            match self.history.find_cached(user, command).await? {
                Some(entry) => CommandPlan {
                    statements: split_statements(&entry.generated_sql),
                    bind: Params::new(),
                    source: CommandSource::History,
                },
                None => CommandPlan {
                    statements: self.generate(user, target, command).await?.statements,
                    bind: Params::new(),
                    source: CommandSource::Generated,
                },
            }
        };

        if plan.statements.is_empty() {
            return Err(AppError::Validation("No SQL command to execute".to_string()));
        }
        Ok(plan)
    }

    /// Ask the SQL generator, giving it the schema of the target database
    pub async fn generate(
        &self,
        user: &User,
        target: &str,
        prompt: &str,
    ) -> Result<GeneratedSql, AppError> {
        let db = self.registry.resolve_accessible(user, target).await?;
        let schema = self.schemas.describe(&db.physical_name).await?;

        tracing::info!("Generating SQL for user {} on '{}'", user.id, db.virtual_name);
        match self.generator.generate(prompt, &schema).await {
            NlpResponse::Generated(generated) => Ok(generated),
            NlpResponse::Error { explanation } => {
                Err(AppError::LlmService(format!("NLP Error: {}", explanation)))
            }
        }
    }

    async fn run_plan(
        &self,
        user: &User,
        target: &str,
        tx_token: Option<&str>,
        plan: &CommandPlan,
    ) -> Result<CommandResponse, AppError> {
        let statements = &plan.statements;

        if let Some(AdminCommand::CreateDatabase { name }) = parse_admin_command(&statements[0])? {
            return self
                .create_and_populate(user, &name, &statements[1..], &plan.bind)
                .await;
        }

        let mut admin = Vec::new();
        for statement in statements {
            if let Some(command) = parse_admin_command(statement)? {
                admin.push(command);
            }
        }
        if let Some(command) = admin.into_iter().next() {
            if statements.len() > 1 {
                return Err(AppError::Validation(
                    "Administrative commands (DROP/ALTER DATABASE) cannot be mixed with other queries"
                        .to_string(),
                ));
            }
            return self.run_admin(user, command).await;
        }

        if statements.iter().any(|s| is_transaction_control(s)) {
            return Err(AppError::Validation(
                "Transaction control statements are not accepted; use the transaction endpoints"
                    .to_string(),
            ));
        }

        let db = self.registry.resolve_accessible(user, target).await?;
        let role = get_role(&self.storage, user, &db).await?;
        if statements.iter().any(|s| is_write_statement(s)) {
            require_role(role, Role::Editor, "modify this database")?;
        } else {
            require_role(role, Role::Viewer, "query this database")?;
        }

        let output = match tx_token {
            Some(token) => self.run_in_transaction(user, &db, token, statements, &plan.bind).await?,
            None => self.run_autocommit(&db.physical_name, statements, &plan.bind).await?,
        };
        Ok(respond(output))
    }

    async fn run_admin(&self, user: &User, command: AdminCommand) -> Result<CommandResponse, AppError> {
        match command {
            AdminCommand::CreateDatabase { name } => {
                self.create_and_populate(user, &name, &[], &Params::new()).await
            }
            AdminCommand::DropDatabase { name } => {
                let db = self.registry.resolve_accessible(user, &name).await?;
                self.registry.delete(user, &db).await?;
                Ok(CommandResponse::message(format!(
                    "Database '{}' dropped successfully.",
                    db.virtual_name
                )))
            }
            AdminCommand::RenameDatabase { from, to } => {
                let db = self.registry.rename(user, &from, &to).await?;
                Ok(CommandResponse::message(format!(
                    "Database '{}' renamed to '{}' successfully.",
                    from, db.virtual_name
                )))
            }
        }
    }

    /// `CREATE DATABASE x` optionally followed by statements that populate `x`
    /// in one transaction. A failed population leaves the new database in place.
    async fn create_and_populate(
        &self,
        user: &User,
        name: &str,
        rest: &[String],
        params: &Params,
    ) -> Result<CommandResponse, AppError> {
        for statement in rest {
            if parse_admin_command(statement)?.is_some() || is_transaction_control(statement) {
                return Err(AppError::Validation(format!(
                    "Statement not allowed while populating a new database: {}",
                    statement
                )));
            }
        }

        let db = self.registry.create(user, name).await?;
        if rest.is_empty() {
            return Ok(CommandResponse::message(format!(
                "Database '{}' created successfully.",
                db.virtual_name
            )));
        }

        tracing::info!("Populating newly created database '{}'", db.virtual_name);
        let output = self.run_autocommit(&db.physical_name, rest, params).await?;
        let mut response = respond(output);
        response.message = format!("Database '{}' created and populated successfully.", db.virtual_name);
        Ok(response)
    }

    /// Statements on a scoped pooled connection, wrapped in one transaction
    async fn run_autocommit(
        &self,
        physical_name: &str,
        statements: &[String],
        params: &Params,
    ) -> Result<StatementOutput, AppError> {
        let engine = self.engines.get_engine(physical_name).await?;
        let scope = TransactionScope::begin(engine.get().await?).await?;

        let outcome = run_statements(scope.conn()?, statements, params).await;
        match outcome {
            Ok(output) => {
                scope.finish(true).await?;
                Ok(output)
            }
            Err(failure) => {
                if let Err(e) = scope.finish(false).await {
                    tracing::warn!("Rollback after failure did not complete: {}", e);
                }
                Err(failure.into())
            }
        }
    }

    /// Statements on the connection leased to `token`. A failure rolls the whole transaction back.
    async fn run_in_transaction(
        &self,
        user: &User,
        db: &VirtualDatabase,
        token: &str,
        statements: &[String],
        params: &Params,
    ) -> Result<StatementOutput, AppError> {
        let lease = self.coordinator.get(token).await?;
        if lease.user_id() != user.id {
            return Err(AppError::PermissionDenied(
                "The transaction belongs to another user".to_string(),
            ));
        }
        if lease.physical_name() != db.physical_name {
            return Err(AppError::Validation(format!(
                "Transaction {} was opened on a different database than '{}'",
                token, db.virtual_name
            )));
        }

        let outcome = {
            let conn = lease.connection().await?;
            run_statements(&conn, statements, params).await
        };
        drop(lease);

        match outcome {
            Ok(output) => Ok(output),
            Err(failure) => {
                tracing::warn!("Statement failed inside transaction {}, rolling back", token);
                if let Err(e) = self.coordinator.end(token, false).await {
                    tracing::debug!("Transaction {} already closed: {}", token, e);
                }
                Err(failure.into())
            }
        }
    }

    /// Open a transaction on `target` and return its token
    pub async fn begin_transaction(&self, user: &User, target: &str) -> Result<String, AppError> {
        let db = self.registry.resolve_accessible(user, target).await?;
        let role = get_role(&self.storage, user, &db).await?;
        require_role(role, Role::Viewer, "open a transaction on this database")?;

        let engine = self.engines.get_engine(&db.physical_name).await?;
        let conn = engine.get().await?;
        self.coordinator.begin(conn, &db.physical_name, &user.id).await
    }

    /// Commit or roll back a transaction opened by `user`
    pub async fn end_transaction(&self, user: &User, token: &str, commit: bool) -> Result<(), AppError> {
        self.coordinator.end_as(token, &user.id, commit).await
    }
}
