use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An already-authenticated caller.
///
/// Credentials are issued and verified elsewhere; the metadata store only keeps
/// a hash of the API key so requests can be mapped back to a user id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
}

impl User {
    pub fn new(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            email: email.into(),
            name: name.into(),
        }
    }
}
