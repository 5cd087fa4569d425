use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::api::middleware::AppError;
use crate::models::{User, VirtualDatabase, VirtualDatabaseView};
use crate::services::{DatabaseProvisioner, EngineManager};
use crate::storage::{is_constraint_violation, SqliteStorage};
use crate::validation::validate_virtual_name;

/// Build a globally unique physical name such as `user_a1b2c3d4_sales_9f8e7d`.
///
/// The owner prefix and random suffix keep two owners reusing one virtual name apart.
pub fn generate_physical_name(owner_id: &str, virtual_name: &str) -> String {
    let owner: String = owner_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect();
    let name: String = virtual_name.chars().take(20).collect();
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(6).collect();
    format!("user_{}_{}_{}", owner, name, suffix).to_ascii_lowercase()
}

/// Maps owner-scoped virtual names onto physical databases and owns their lifecycle.
///
/// Create, rename and delete are serialized per physical name. Backend
/// termination happens before the DDL, but a new ordinary connection can still
/// slip in between the two; the DDL then fails and the operation has to be retried.
pub struct VirtualDatabaseRegistry {
    storage: Arc<SqliteStorage>,
    provisioner: Arc<dyn DatabaseProvisioner>,
    engines: Arc<EngineManager>,
    ddl_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl VirtualDatabaseRegistry {
    pub fn new(
        storage: Arc<SqliteStorage>,
        provisioner: Arc<dyn DatabaseProvisioner>,
        engines: Arc<EngineManager>,
    ) -> Self {
        Self {
            storage,
            provisioner,
            engines,
            ddl_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn ddl_lock(&self, physical_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.ddl_locks.lock().await;
        locks
            .entry(physical_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the map entry once no other task holds or waits on `lock`
    async fn release_lock(&self, physical_name: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.ddl_locks.lock().await;
        // one reference in the map and ours
        if Arc::strong_count(&lock) == 2 {
            locks.remove(physical_name);
        }
    }

    /// Re-read `db` under its DDL lock. An operation that waited behind a
    /// delete or rename of the same database finds it gone.
    async fn reload(&self, db: &VirtualDatabase) -> Result<VirtualDatabase, AppError> {
        self.storage
            .get_virtual_database(&db.id)
            .await?
            .filter(|current| current.physical_name == db.physical_name)
            .ok_or_else(|| AppError::NotFound(format!("Database '{}' not found", db.virtual_name)))
    }

    /// Resolve a virtual name the user owns or has been invited to.
    /// Owned databases win over shared ones with the same name.
    pub async fn resolve_accessible(
        &self,
        user: &User,
        virtual_name: &str,
    ) -> Result<VirtualDatabase, AppError> {
        let name = virtual_name.trim().trim_matches('"').to_ascii_lowercase();
        self.storage
            .find_accessible_databases(&user.id, &name)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound(format!("Database '{}' not found", virtual_name)))
    }

    /// Every database the user can reach, with the user's role on each
    pub async fn list_accessible(&self, user: &User) -> Result<Vec<VirtualDatabaseView>, AppError> {
        let rows = self.storage.list_accessible_databases(&user.id).await?;
        Ok(rows
            .into_iter()
            .map(|(db, role)| VirtualDatabaseView::new(db, role))
            .collect())
    }

    /// Provision a new physical database and record it under `owner`
    pub async fn create(&self, owner: &User, virtual_name: &str) -> Result<VirtualDatabase, AppError> {
        let virtual_name = validate_virtual_name(virtual_name)?;

        if self
            .storage
            .get_owned_database(&owner.id, &virtual_name)
            .await?
            .is_some()
        {
            return Err(AppError::Conflict(format!(
                "You already have a database named '{}'",
                virtual_name
            )));
        }

        let physical_name = generate_physical_name(&owner.id, &virtual_name);
        let lock = self.ddl_lock(&physical_name).await;
        let result = {
            let _guard = lock.lock().await;
            self.create_locked(owner, &virtual_name, &physical_name).await
        };
        self.release_lock(&physical_name, lock).await;
        result
    }

    async fn create_locked(
        &self,
        owner: &User,
        virtual_name: &str,
        physical_name: &str,
    ) -> Result<VirtualDatabase, AppError> {
        self.provisioner.create_database(physical_name).await?;

        let db = VirtualDatabase::new(owner.id.clone(), virtual_name.to_string(), physical_name.to_string());
        if let Err(e) = self.storage.insert_virtual_database(&db).await {
            // Nothing has connected to the new database yet
            tracing::warn!(
                "Metadata insert failed for '{}', dropping physical database {}: {}",
                virtual_name,
                physical_name,
                e
            );
            if let Err(drop_err) = self.provisioner.drop_database(physical_name).await {
                tracing::error!("Orphaned physical database {}: {}", physical_name, drop_err);
            }
            return Err(if is_constraint_violation(&e) {
                AppError::Conflict(format!("You already have a database named '{}'", virtual_name))
            } else {
                AppError::from(e)
            });
        }

        tracing::info!(
            "Created database '{}' for user {} as {}",
            virtual_name,
            owner.id,
            physical_name
        );
        Ok(db)
    }

    /// Terminate backends, drop the physical database, then delete the metadata row
    pub async fn delete(&self, actor: &User, db: &VirtualDatabase) -> Result<(), AppError> {
        if !db.is_owned_by(&actor.id) {
            return Err(AppError::PermissionDenied(
                "Only the database owner can drop a database".to_string(),
            ));
        }

        let lock = self.ddl_lock(&db.physical_name).await;
        let result = {
            let _guard = lock.lock().await;
            self.delete_locked(db).await
        };
        self.release_lock(&db.physical_name, lock).await;
        result?;

        tracing::info!("Dropped database '{}' ({})", db.virtual_name, db.physical_name);
        Ok(())
    }

    async fn delete_locked(&self, db: &VirtualDatabase) -> Result<(), AppError> {
        let db = self.reload(db).await?;
        self.engines.remove_engine(&db.physical_name).await;
        let terminated = self.provisioner.terminate_backends(&db.physical_name).await?;
        tracing::debug!("Terminated {} backends on {}", terminated, db.physical_name);
        self.provisioner.drop_database(&db.physical_name).await?;
        self.storage.delete_virtual_database(&db.id).await?;
        Ok(())
    }

    /// Rename a virtual database. The physical database is renamed to a freshly
    /// generated name derived from the new virtual name.
    pub async fn rename(
        &self,
        actor: &User,
        old_name: &str,
        new_name: &str,
    ) -> Result<VirtualDatabase, AppError> {
        let new_name = validate_virtual_name(new_name)?;
        let db = self.resolve_accessible(actor, old_name).await?;

        if !db.is_owned_by(&actor.id) {
            return Err(AppError::PermissionDenied(
                "Only the database owner can rename a database".to_string(),
            ));
        }
        if self
            .storage
            .get_owned_database(&actor.id, &new_name)
            .await?
            .is_some()
        {
            return Err(AppError::Conflict(format!(
                "You already have a database named '{}'",
                new_name
            )));
        }

        let new_physical = generate_physical_name(&actor.id, &new_name);
        let lock = self.ddl_lock(&db.physical_name).await;
        let result = {
            let _guard = lock.lock().await;
            self.rename_locked(&db, &new_name, &new_physical).await
        };
        self.release_lock(&db.physical_name, lock).await;
        let renamed = result?;

        tracing::info!(
            "Renamed database '{}' to '{}' ({} -> {})",
            db.virtual_name,
            renamed.virtual_name,
            db.physical_name,
            renamed.physical_name
        );
        Ok(renamed)
    }

    async fn rename_locked(
        &self,
        db: &VirtualDatabase,
        new_name: &str,
        new_physical: &str,
    ) -> Result<VirtualDatabase, AppError> {
        let db = self.reload(db).await?;
        self.engines.remove_engine(&db.physical_name).await;
        self.provisioner.terminate_backends(&db.physical_name).await?;
        self.provisioner
            .rename_database(&db.physical_name, new_physical)
            .await?;

        if let Err(e) = self
            .storage
            .update_database_names(&db.id, new_name, new_physical)
            .await
        {
            tracing::error!(
                "Physical database {} renamed to {} but metadata update failed: {}",
                db.physical_name,
                new_physical,
                e
            );
            return Err(AppError::from(e));
        }

        Ok(VirtualDatabase {
            virtual_name: new_name.to_string(),
            physical_name: new_physical.to_string(),
            ..db
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DatabaseMember, Role};
    use crate::services::engine_pool::tests::test_manager;
    use crate::services::provisioner::fake::FakeProvisioner;

    struct Fixture {
        registry: VirtualDatabaseRegistry,
        storage: Arc<SqliteStorage>,
        provisioner: Arc<FakeProvisioner>,
        alice: User,
        bob: User,
    }

    async fn fixture_with(provisioner: FakeProvisioner) -> Fixture {
        let engines = test_manager(8).await;
        let storage = engines.metadata();
        let alice = User::new("alice@example.com", "Alice");
        let bob = User::new("bob@example.com", "Bob");
        storage.save_user(&alice, None).await.unwrap();
        storage.save_user(&bob, None).await.unwrap();
        let provisioner = Arc::new(provisioner);
        let registry = VirtualDatabaseRegistry::new(storage.clone(), provisioner.clone(), engines);
        Fixture {
            registry,
            storage,
            provisioner,
            alice,
            bob,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(FakeProvisioner::default()).await
    }

    #[test]
    fn test_physical_name_shape() {
        let name = generate_physical_name("A1B2C3D4E5F6", "sales");
        assert!(name.starts_with("user_a1b2c3d4_sales_"));
        assert_eq!(name.len(), "user_a1b2c3d4_sales_".len() + 6);
        assert_ne!(name, generate_physical_name("A1B2C3D4E5F6", "sales"));

        let long = generate_physical_name("owner", &"x".repeat(50));
        assert!(long.len() <= crate::validation::MAX_IDENTIFIER_BYTES);
    }

    #[tokio::test]
    async fn test_create_and_resolve() {
        let f = fixture().await;
        let db = f.registry.create(&f.alice, "Sales").await.unwrap();
        assert_eq!(db.virtual_name, "sales");
        assert!(f.provisioner.exists(&db.physical_name));

        let resolved = f.registry.resolve_accessible(&f.alice, "sales").await.unwrap();
        assert_eq!(resolved.id, db.id);
    }

    #[tokio::test]
    async fn test_create_duplicate_name_conflicts() {
        let f = fixture().await;
        f.registry.create(&f.alice, "sales").await.unwrap();
        let err = f.registry.create(&f.alice, "sales").await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_same_virtual_name_for_two_owners() {
        let f = fixture().await;
        let a = f.registry.create(&f.alice, "sales").await.unwrap();
        let b = f.registry.create(&f.bob, "sales").await.unwrap();
        assert_ne!(a.physical_name, b.physical_name);

        let resolved = f.registry.resolve_accessible(&f.bob, "sales").await.unwrap();
        assert_eq!(resolved.id, b.id);
    }

    #[tokio::test]
    async fn test_non_member_cannot_resolve() {
        let f = fixture().await;
        let db = f.registry.create(&f.alice, "sales").await.unwrap();

        let err = f.registry.resolve_accessible(&f.bob, "sales").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        f.storage
            .insert_member(&DatabaseMember {
                user_id: f.bob.id.clone(),
                database_id: db.id.clone(),
                role: Role::Viewer,
            })
            .await
            .unwrap();
        let resolved = f.registry.resolve_accessible(&f.bob, "sales").await.unwrap();
        assert_eq!(resolved.physical_name, db.physical_name);
    }

    #[tokio::test]
    async fn test_delete_requires_owner_and_drops_physical() {
        let f = fixture().await;
        let db = f.registry.create(&f.alice, "sales").await.unwrap();

        let err = f.registry.delete(&f.bob, &db).await.unwrap_err();
        assert!(matches!(err, AppError::PermissionDenied(_)));

        f.registry.delete(&f.alice, &db).await.unwrap();
        assert!(!f.provisioner.exists(&db.physical_name));
        assert!(f.registry.resolve_accessible(&f.alice, "sales").await.is_err());

        let calls = f.provisioner.calls();
        let terminate = calls.iter().position(|c| c.starts_with("terminate")).unwrap();
        let drop = calls.iter().position(|c| c.starts_with("drop")).unwrap();
        assert!(terminate < drop);
    }

    #[tokio::test]
    async fn test_rename_regenerates_physical_name() {
        let f = fixture().await;
        let db = f.registry.create(&f.alice, "sales").await.unwrap();

        let renamed = f.registry.rename(&f.alice, "sales", "revenue").await.unwrap();
        assert_eq!(renamed.id, db.id);
        assert_eq!(renamed.virtual_name, "revenue");
        assert!(renamed.physical_name.contains("_revenue_"));
        assert!(!f.provisioner.exists(&db.physical_name));
        assert!(f.provisioner.exists(&renamed.physical_name));

        assert!(f.registry.resolve_accessible(&f.alice, "sales").await.is_err());
        let resolved = f.registry.resolve_accessible(&f.alice, "revenue").await.unwrap();
        assert_eq!(resolved.physical_name, renamed.physical_name);
    }

    #[tokio::test]
    async fn test_rename_by_member_is_denied() {
        let f = fixture().await;
        let db = f.registry.create(&f.alice, "sales").await.unwrap();
        f.storage
            .insert_member(&DatabaseMember {
                user_id: f.bob.id.clone(),
                database_id: db.id.clone(),
                role: Role::Editor,
            })
            .await
            .unwrap();

        let err = f.registry.rename(&f.bob, "sales", "revenue").await.unwrap_err();
        assert!(matches!(err, AppError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_rename_onto_taken_name_conflicts() {
        let f = fixture().await;
        f.registry.create(&f.alice, "sales").await.unwrap();
        f.registry.create(&f.alice, "revenue").await.unwrap();
        let err = f.registry.rename(&f.alice, "sales", "revenue").await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_failed_rename_keeps_metadata() {
        let f = fixture_with(FakeProvisioner {
            fail_rename: true,
            ..Default::default()
        })
        .await;
        let db = f.registry.create(&f.alice, "sales").await.unwrap();
        assert!(f.registry.rename(&f.alice, "sales", "revenue").await.is_err());

        let resolved = f.registry.resolve_accessible(&f.alice, "sales").await.unwrap();
        assert_eq!(resolved.physical_name, db.physical_name);
    }

    #[tokio::test]
    async fn test_rename_queued_behind_delete_finds_nothing() {
        let f = fixture().await;
        let db = f.registry.create(&f.alice, "sales").await.unwrap();

        let lock = f.registry.ddl_lock(&db.physical_name).await;
        let held = lock.clone().lock_owned().await;
        drop(lock);

        let (deleted, renamed, _) = tokio::join!(
            f.registry.delete(&f.alice, &db),
            f.registry.rename(&f.alice, "sales", "revenue"),
            async {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                drop(held);
            }
        );

        let outcomes = [deleted.is_ok(), renamed.is_ok()];
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
        assert!(matches!(deleted, Ok(()) | Err(AppError::NotFound(_))));
        assert!(matches!(renamed, Ok(_) | Err(AppError::NotFound(_))));
        assert!(f.registry.ddl_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_lock_entry_kept_while_another_task_waits() {
        let f = fixture().await;
        let first = f.registry.ddl_lock("user_x_sales_abcdef").await;
        let waiting = f.registry.ddl_lock("user_x_sales_abcdef").await;
        assert!(Arc::ptr_eq(&first, &waiting));

        f.registry.release_lock("user_x_sales_abcdef", first).await;
        let again = f.registry.ddl_lock("user_x_sales_abcdef").await;
        assert!(Arc::ptr_eq(&again, &waiting));

        drop(again);
        f.registry.release_lock("user_x_sales_abcdef", waiting).await;
        assert!(f.registry.ddl_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_list_accessible_includes_shared() {
        let f = fixture().await;
        let db = f.registry.create(&f.alice, "sales").await.unwrap();
        f.registry.create(&f.bob, "inventory").await.unwrap();
        f.storage
            .insert_member(&DatabaseMember {
                user_id: f.bob.id.clone(),
                database_id: db.id.clone(),
                role: Role::Viewer,
            })
            .await
            .unwrap();

        let listed = f.registry.list_accessible(&f.bob).await.unwrap();
        assert_eq!(listed.len(), 2);
        let shared = listed.iter().find(|v| v.virtual_name == "sales").unwrap();
        assert_eq!(shared.current_user_role, Role::Viewer);
        let owned = listed.iter().find(|v| v.virtual_name == "inventory").unwrap();
        assert_eq!(owned.current_user_role, Role::Owner);
    }
}
