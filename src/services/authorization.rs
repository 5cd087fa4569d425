use crate::api::middleware::AppError;
use crate::models::{Role, User, VirtualDatabase};
use crate::storage::SqliteStorage;

/// Effective role of `user` on `db`: owner by ownership, otherwise the membership role
pub async fn get_role(
    storage: &SqliteStorage,
    user: &User,
    db: &VirtualDatabase,
) -> Result<Option<Role>, AppError> {
    if db.is_owned_by(&user.id) {
        return Ok(Some(Role::Owner));
    }
    Ok(storage.get_member_role(&user.id, &db.id).await?)
}

/// Whether `role` satisfies `required`. No role never satisfies anything.
pub fn has_at_least(role: Option<Role>, required: Role) -> bool {
    role.map(|r| r.rank() >= required.rank()).unwrap_or(false)
}

/// Fail with `PermissionDenied` unless `role` reaches `required`
pub fn require_role(role: Option<Role>, required: Role, action: &str) -> Result<Role, AppError> {
    match role {
        Some(r) if has_at_least(role, required) => Ok(r),
        Some(r) => Err(AppError::PermissionDenied(format!(
            "Role '{}' cannot {}; '{}' or higher is required",
            r, action, required
        ))),
        None => Err(AppError::PermissionDenied(format!(
            "You have no access to {}",
            action
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DatabaseMember;

    #[test]
    fn test_role_hierarchy() {
        assert!(!has_at_least(Some(Role::Viewer), Role::Editor));
        assert!(has_at_least(Some(Role::Owner), Role::Viewer));
        assert!(has_at_least(Some(Role::Editor), Role::Editor));
        assert!(!has_at_least(None, Role::Viewer));
    }

    #[test]
    fn test_require_role() {
        assert_eq!(require_role(Some(Role::Owner), Role::Editor, "write").unwrap(), Role::Owner);
        assert!(matches!(
            require_role(Some(Role::Viewer), Role::Editor, "write"),
            Err(AppError::PermissionDenied(_))
        ));
        assert!(matches!(
            require_role(None, Role::Viewer, "read"),
            Err(AppError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_get_role_from_ownership_and_membership() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let alice = User::new("alice@example.com", "Alice");
        let bob = User::new("bob@example.com", "Bob");
        let carol = User::new("carol@example.com", "Carol");
        for u in [&alice, &bob, &carol] {
            storage.save_user(u, None).await.unwrap();
        }
        let db = VirtualDatabase::new(alice.id.clone(), "sales".into(), "user_a_sales_1".into());
        storage.insert_virtual_database(&db).await.unwrap();
        storage
            .insert_member(&DatabaseMember {
                user_id: bob.id.clone(),
                database_id: db.id.clone(),
                role: Role::Editor,
            })
            .await
            .unwrap();

        assert_eq!(get_role(&storage, &alice, &db).await.unwrap(), Some(Role::Owner));
        assert_eq!(get_role(&storage, &bob, &db).await.unwrap(), Some(Role::Editor));
        assert_eq!(get_role(&storage, &carol, &db).await.unwrap(), None);
    }
}
