//! Runs against a real PostgreSQL cluster. Skipped unless both
//! VDB_TEST_POSTGRES_URL and VDB_TEST_POSTGRES_SUPERUSER_URL are set.

use serde_json::json;
use tempfile::TempDir;

use vdb_router::api::{AppError, AppState};
use vdb_router::build_state;
use vdb_router::config::Config;
use vdb_router::models::{CommandRequest, CommandResponse, Role, User};

async fn state() -> Option<(AppState, TempDir)> {
    let url = std::env::var("VDB_TEST_POSTGRES_URL").ok()?;
    let superuser_url = std::env::var("VDB_TEST_POSTGRES_SUPERUSER_URL").ok()?;

    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::from_env().unwrap();
    config.postgres.url = url;
    config.postgres.superuser_url = superuser_url;
    config.metadata.url = dir.path().join("metadata.db").to_string_lossy().into_owned();

    Some((build_state(config).await.unwrap(), dir))
}

async fn user(state: &AppState, email: &str) -> User {
    let user = User::new(email, email);
    state.storage.save_user(&user, None).await.unwrap();
    user
}

async fn run(
    state: &AppState,
    user: &User,
    target: &str,
    tx: Option<&str>,
    sql: &str,
) -> Result<CommandResponse, AppError> {
    state
        .commands
        .execute_command(user, target, tx, &CommandRequest::new(sql))
        .await
}

#[tokio::test]
async fn test_shared_database_roles() {
    let Some((state, _dir)) = state().await else {
        eprintln!("skipping: PostgreSQL test URLs not set");
        return;
    };
    let alice = user(&state, "alice@example.com").await;
    let bob = user(&state, "bob@example.com").await;

    let db = state.registry.create(&alice, "shop").await.unwrap();
    run(&state, &alice, "shop", None, "CREATE TABLE orders (id int PRIMARY KEY, customer text, total numeric);")
        .await
        .unwrap();

    state
        .collaboration
        .add_member(&alice, &db, &bob.email, Role::Viewer)
        .await
        .unwrap();
    let denied = run(&state, &bob, "shop", None, "INSERT INTO orders VALUES (1, 'Ann', 10.5);").await;
    assert!(matches!(denied, Err(AppError::PermissionDenied(_))));

    state
        .collaboration
        .update_member_role(&alice, &db, &bob.id, Role::Editor)
        .await
        .unwrap();
    let inserted = run(&state, &bob, "shop", None, "INSERT INTO orders VALUES (1, 'Ann', 10.5);")
        .await
        .unwrap();
    assert_eq!(inserted.message, "Query executed successfully. 1 rows affected.");

    let request = CommandRequest::new("SELECT customer FROM orders WHERE customer = {name};")
        .with_params(json!({"name": "Ann"}).as_object().cloned().unwrap());
    let selected = state
        .commands
        .execute_command(&alice, "shop", None, &request)
        .await
        .unwrap();
    let result = selected.result.unwrap();
    assert_eq!(result.columns, vec!["customer".to_string()]);
    assert_eq!(result.data, vec![json!({"customer": "Ann"})]);

    let missing = run(&state, &alice, "shop", None, "SELECT * FROM no_such_table;").await;
    match missing {
        Err(AppError::Execution(message)) => assert!(message.starts_with("[TABLE_NOT_FOUND]")),
        other => panic!("unexpected {:?}", other.map(|r| r.message)),
    }

    state.registry.delete(&alice, &db).await.unwrap();
}

#[tokio::test]
async fn test_rolled_back_transaction_leaves_no_effects() {
    let Some((state, _dir)) = state().await else {
        eprintln!("skipping: PostgreSQL test URLs not set");
        return;
    };
    let alice = user(&state, "carol@example.com").await;
    let db = state.registry.create(&alice, "ledger").await.unwrap();
    run(&state, &alice, "ledger", None, "CREATE TABLE entries (id int);")
        .await
        .unwrap();

    let token = state.commands.begin_transaction(&alice, "ledger").await.unwrap();
    for sql in ["INSERT INTO entries VALUES (1);", "INSERT INTO entries VALUES (2);"] {
        run(&state, &alice, "ledger", Some(&token), sql).await.unwrap();
    }
    let inside = run(&state, &alice, "ledger", Some(&token), "SELECT count(*) AS n FROM entries;")
        .await
        .unwrap();
    assert_eq!(inside.result.unwrap().data, vec![json!({"n": 2})]);

    state.commands.end_transaction(&alice, &token, false).await.unwrap();
    assert!(matches!(
        state.commands.end_transaction(&alice, &token, true).await,
        Err(AppError::TransactionNotFound(_))
    ));

    let after = run(&state, &alice, "ledger", None, "SELECT count(*) AS n FROM entries;")
        .await
        .unwrap();
    assert_eq!(after.result.unwrap().data, vec![json!({"n": 0})]);

    state.registry.delete(&alice, &db).await.unwrap();
}
