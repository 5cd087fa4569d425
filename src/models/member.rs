use serde::{Deserialize, Serialize};
use std::fmt;

use crate::api::middleware::AppError;

/// Permission level on a virtual database.
///
/// Variants are declared lowest first so the derived ordering is the role
/// hierarchy: viewer < editor < owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Editor,
    Owner,
}

impl Role {
    pub fn rank(self) -> u8 {
        match self {
            Role::Viewer => 1,
            Role::Editor => 2,
            Role::Owner => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Editor => "editor",
            Role::Owner => "owner",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s.to_lowercase().as_str() {
            "viewer" => Ok(Role::Viewer),
            "editor" => Ok(Role::Editor),
            "owner" => Ok(Role::Owner),
            other => Err(AppError::Validation(format!("Unknown role: {}", other))),
        }
    }

    /// Roles that may be stored on a membership row. Ownership is never a membership.
    pub fn ensure_assignable(self) -> Result<Self, AppError> {
        match self {
            Role::Owner => Err(AppError::Validation(
                "Ownership cannot be granted through membership".to_string(),
            )),
            role => Ok(role),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseMember {
    pub user_id: String,
    pub database_id: String,
    pub role: Role,
}

/// Membership joined with the member's profile for listings
#[derive(Debug, Clone, Serialize)]
pub struct MemberView {
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub role: Role,
}

fn default_member_role() -> Role {
    Role::Editor
}

#[derive(Debug, Deserialize)]
pub struct InviteMemberRequest {
    pub email: String,
    #[serde(default = "default_member_role")]
    pub role: Role,
}

#[derive(Debug, Deserialize)]
pub struct UpdateMemberRequest {
    pub role: Role,
}
