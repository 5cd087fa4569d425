pub mod auth;
pub mod handlers;
pub mod middleware;
pub mod routes;

pub use auth::{hash_api_key, CurrentUser};
pub use handlers::AppState;
pub use middleware::AppError;
