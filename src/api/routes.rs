use axum::{
    routing::{get, patch, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::handlers::{collaboration, command, history, transaction, virtual_database, AppState};

/// Create router with application state
pub fn create_router_with_state(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/query", post(command::execute_command))
        .route("/api/query/nl", post(command::translate_command))
        .route("/api/transactions/begin", post(transaction::begin_transaction))
        .route("/api/transactions/commit", post(transaction::commit_transaction))
        .route("/api/transactions/rollback", post(transaction::rollback_transaction))
        .route(
            "/api/databases",
            get(virtual_database::list_databases).post(virtual_database::create_database),
        )
        .route(
            "/api/databases/{name}",
            patch(virtual_database::rename_database).delete(virtual_database::delete_database),
        )
        .route(
            "/api/databases/{name}/members",
            get(collaboration::list_members).post(collaboration::add_member),
        )
        .route(
            "/api/databases/{name}/members/{user_id}",
            patch(collaboration::update_member).delete(collaboration::remove_member),
        )
        .route("/api/history", get(history::list_history))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    use crate::api::auth::hash_api_key;
    use crate::config::Config;
    use crate::models::User;
    use crate::services::engine_pool::tests::test_manager;
    use crate::services::llm_service::tests::StaticGenerator;
    use crate::services::provisioner::fake::FakeProvisioner;

    async fn app() -> (Router, AppState) {
        let engines = test_manager(8).await;
        let state = AppState::new(
            Config::from_env().unwrap(),
            engines,
            Arc::new(FakeProvisioner::default()),
            Arc::new(StaticGenerator::sql("SELECT 1")),
        );
        let alice = User::new("alice@example.com", "Alice");
        state
            .storage
            .save_user(&alice, Some(&hash_api_key("alice-key")))
            .await
            .unwrap();
        (create_router_with_state(state.clone()), state)
    }

    fn get(uri: &str, api_key: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("X-API-Key", api_key)
            .body(Body::empty())
            .unwrap()
    }

    fn post(uri: &str, api_key: &str, headers: &[(&str, &str)], payload: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("X-API-Key", api_key);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        match payload {
            Some(payload) => builder
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app().await;
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_requests_need_a_valid_api_key() {
        let (app, _) = app().await;
        let missing = Request::builder().uri("/api/databases").body(Body::empty()).unwrap();
        let (status, body) = send(&app, missing).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "UNAUTHORIZED");

        let (status, _) = send(&app, get("/api/databases", "wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_create_and_list_databases() {
        let (app, _) = app().await;
        let payload = json!({"virtual_name": "Sales"});

        let (status, body) = send(&app, post("/api/databases", "alice-key", &[], Some(payload.clone()))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["virtual_name"], "sales");
        assert_eq!(body["current_user_role"], "owner");

        let (status, body) = send(&app, get("/api/databases", "alice-key")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["databases"].as_array().unwrap().len(), 1);

        let (status, body) = send(&app, post("/api/databases", "alice-key", &[], Some(payload))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "CONFLICT");
    }

    #[tokio::test]
    async fn test_query_requires_target_header() {
        let (app, _) = app().await;
        let payload = json!({"command": "SELECT 1;"});
        let (status, body) = send(&app, post("/api/query", "alice-key", &[], Some(payload))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_query_routes_create_database() {
        let (app, state) = app().await;
        let payload = json!({"command": "CREATE DATABASE shop;"});
        let (status, body) = send(
            &app,
            post("/api/query", "alice-key", &[("X-Target-Database", "postgres")], Some(payload)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["generated_sql"], "CREATE DATABASE shop;");

        let (_, body) = send(&app, get("/api/history?limit=5", "alice-key")).await;
        assert_eq!(body["history"].as_array().unwrap().len(), 1);
        assert_eq!(body["history"][0]["status"], "success");
        assert_eq!(state.engines.engine_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_transaction_is_not_found() {
        let (app, _) = app().await;
        let (status, body) = send(
            &app,
            post("/api/transactions/commit", "alice-key", &[("X-Transaction-ID", "missing")], None),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "TRANSACTION_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_members_of_unknown_database() {
        let (app, _) = app().await;
        let (status, body) = send(&app, get("/api/databases/nothing/members", "alice-key")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }
}
