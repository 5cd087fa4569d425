use std::sync::Arc;

use crate::api::middleware::AppError;
use crate::models::{DatabaseMember, MemberView, Role, User, VirtualDatabase};
use crate::services::authorization::{get_role, require_role};
use crate::storage::{is_constraint_violation, SqliteStorage};

/// Sharing a virtual database with other users. Only the owner manages members.
pub struct CollaborationService {
    storage: Arc<SqliteStorage>,
}

impl CollaborationService {
    pub fn new(storage: Arc<SqliteStorage>) -> Self {
        Self { storage }
    }

    fn ensure_owner(actor: &User, db: &VirtualDatabase) -> Result<(), AppError> {
        if db.is_owned_by(&actor.id) {
            Ok(())
        } else {
            Err(AppError::PermissionDenied(
                "Only the database owner can manage members".to_string(),
            ))
        }
    }

    pub async fn add_member(
        &self,
        inviter: &User,
        db: &VirtualDatabase,
        invitee_email: &str,
        role: Role,
    ) -> Result<MemberView, AppError> {
        Self::ensure_owner(inviter, db)?;
        let role = role.ensure_assignable()?;

        let invitee = self
            .storage
            .get_user_by_email(invitee_email.trim())
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User '{}' not found", invitee_email)))?;

        if db.is_owned_by(&invitee.id) {
            return Err(AppError::Validation(
                "The owner cannot be invited to their own database".to_string(),
            ));
        }

        let member = DatabaseMember {
            user_id: invitee.id.clone(),
            database_id: db.id.clone(),
            role,
        };
        self.storage.insert_member(&member).await.map_err(|e| {
            if is_constraint_violation(&e) {
                AppError::Conflict(format!(
                    "'{}' is already a member of '{}'",
                    invitee.email, db.virtual_name
                ))
            } else {
                AppError::from(e)
            }
        })?;

        tracing::info!(
            "Granted {} on '{}' to {}",
            role,
            db.virtual_name,
            invitee.email
        );
        Ok(MemberView {
            user_id: invitee.id,
            name: invitee.name,
            email: invitee.email,
            role,
        })
    }

    pub async fn update_member_role(
        &self,
        actor: &User,
        db: &VirtualDatabase,
        member_user_id: &str,
        role: Role,
    ) -> Result<(), AppError> {
        Self::ensure_owner(actor, db)?;
        let role = role.ensure_assignable()?;

        if !self
            .storage
            .update_member_role(member_user_id, &db.id, role)
            .await?
        {
            return Err(AppError::NotFound(format!(
                "User {} is not a member of '{}'",
                member_user_id, db.virtual_name
            )));
        }
        tracing::info!("Changed role of {} on '{}' to {}", member_user_id, db.virtual_name, role);
        Ok(())
    }

    pub async fn remove_member(
        &self,
        actor: &User,
        db: &VirtualDatabase,
        member_user_id: &str,
    ) -> Result<(), AppError> {
        Self::ensure_owner(actor, db)?;

        if !self.storage.delete_member(member_user_id, &db.id).await? {
            return Err(AppError::NotFound(format!(
                "User {} is not a member of '{}'",
                member_user_id, db.virtual_name
            )));
        }
        tracing::info!("Removed {} from '{}'", member_user_id, db.virtual_name);
        Ok(())
    }

    /// Members of a database; visible to anyone with access to it
    pub async fn list_members(
        &self,
        actor: &User,
        db: &VirtualDatabase,
    ) -> Result<Vec<MemberView>, AppError> {
        let role = get_role(&self.storage, actor, db).await?;
        require_role(role, Role::Viewer, "list members")?;
        Ok(self.storage.list_members(&db.id).await?)
    }
}
