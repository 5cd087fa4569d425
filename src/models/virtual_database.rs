use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Role;

/// A user-facing database name bound to a globally unique physical database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VirtualDatabase {
    pub id: String,
    pub owner_id: String,
    /// Unique per owner only
    pub virtual_name: String,
    /// Unique across the whole cluster, never shown to collaborators as an address
    pub physical_name: String,
    pub created_at: DateTime<Utc>,
}

impl VirtualDatabase {
    pub fn new(owner_id: String, virtual_name: String, physical_name: String) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            owner_id,
            virtual_name,
            physical_name,
            created_at: Utc::now(),
        }
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.owner_id == user_id
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateVirtualDatabaseRequest {
    pub virtual_name: String,
}

#[derive(Debug, Deserialize)]
pub struct RenameVirtualDatabaseRequest {
    pub new_name: String,
}

/// A database as seen by one particular user
#[derive(Debug, Clone, Serialize)]
pub struct VirtualDatabaseView {
    pub id: String,
    pub virtual_name: String,
    pub physical_name: String,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub current_user_role: Role,
}

impl VirtualDatabaseView {
    pub fn new(db: VirtualDatabase, role: Role) -> Self {
        Self {
            id: db.id,
            virtual_name: db.virtual_name,
            physical_name: db.physical_name,
            owner_id: db.owner_id,
            created_at: db.created_at,
            current_user_role: role,
        }
    }
}
