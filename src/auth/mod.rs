//! Identity and authorization
//!
//! Persistent user catalog with bcrypt-hashed passwords, a role per user
//! and per-space permissions. The store is a JSON object keyed by
//! username. Admins implicitly hold read and write on every space; `write`
//! permission satisfies `read`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{DbError, Result};

/// Server-wide role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

/// Per-space permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
}

/// A stored user record; `password` holds the bcrypt hash
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub password: String,
    pub role: Role,
    #[serde(default)]
    pub permissions: HashMap<String, Permission>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Persistent user store and access checks
pub struct AuthManager {
    path: PathBuf,
    cost: u32,
    users: RwLock<HashMap<String, User>>,
}

impl AuthManager {
    /// Open the store, loading existing users when the file is present
    pub fn open(path: impl AsRef<Path>, cost: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let users = match std::fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            cost,
            users: RwLock::new(users),
        })
    }

    /// True once at least one user exists
    pub fn has_users(&self) -> bool {
        !self.users.read().is_empty()
    }

    /// Seed the first admin on an empty store
    pub fn bootstrap_admin(&self, username: &str, password: &str) -> Result<()> {
        if self.has_users() {
            return Err(DbError::conflict("user store is already provisioned"));
        }
        self.create_user(username, password, Role::Admin, HashMap::new())?;
        tracing::info!(username, "initial admin created");
        Ok(())
    }

    /// Verify credentials; failures are reported generically
    pub fn authenticate(&self, username: &str, password: &str) -> Result<User> {
        let users = self.users.read();
        let user = users.get(username).ok_or(DbError::Unauthorized)?;

        let valid =
            bcrypt::verify(password, &user.password).map_err(|_| DbError::Unauthorized)?;
        if !valid {
            return Err(DbError::Unauthorized);
        }
        Ok(user.clone())
    }

    /// Check whether `user` holds `required` on `space`
    pub fn has_role(&self, user: &User, space: &str, required: Permission) -> bool {
        if user.is_admin() {
            return true;
        }
        match user.permissions.get(space) {
            Some(Permission::Write) => true,
            Some(Permission::Read) => required == Permission::Read,
            None => false,
        }
    }

    pub fn get_user(&self, username: &str) -> Result<User> {
        self.users
            .read()
            .get(username)
            .cloned()
            .ok_or_else(|| DbError::not_found("user not found"))
    }

    pub fn create_user(
        &self,
        username: &str,
        password: &str,
        role: Role,
        permissions: HashMap<String, Permission>,
    ) -> Result<()> {
        let mut users = self.users.write();
        if users.contains_key(username) {
            return Err(DbError::conflict("user already exists"));
        }

        let hash = bcrypt::hash(password, self.cost)
            .map_err(|e| DbError::validation(format!("password hashing failed: {e}")))?;

        users.insert(
            username.to_string(),
            User {
                username: username.to_string(),
                password: hash,
                role,
                permissions,
            },
        );
        self.save(&users)
    }

    pub fn update_password(&self, username: &str, password: &str) -> Result<()> {
        let mut users = self.users.write();
        let user = users
            .get_mut(username)
            .ok_or_else(|| DbError::not_found("user not found"))?;

        user.password = bcrypt::hash(password, self.cost)
            .map_err(|e| DbError::validation(format!("password hashing failed: {e}")))?;
        self.save(&users)
    }

    pub fn update_role(&self, username: &str, role: Role) -> Result<()> {
        let mut users = self.users.write();
        let user = users
            .get_mut(username)
            .ok_or_else(|| DbError::not_found("user not found"))?;
        user.role = role;
        self.save(&users)
    }

    pub fn update_permissions(
        &self,
        username: &str,
        permissions: HashMap<String, Permission>,
    ) -> Result<()> {
        let mut users = self.users.write();
        let user = users
            .get_mut(username)
            .ok_or_else(|| DbError::not_found("user not found"))?;
        user.permissions = permissions;
        self.save(&users)
    }

    pub fn delete_user(&self, username: &str) -> Result<()> {
        let mut users = self.users.write();
        if users.remove(username).is_none() {
            return Err(DbError::not_found("user not found"));
        }
        self.save(&users)
    }

    fn save(&self, users: &HashMap<String, User>) -> Result<()> {
        let data = serde_json::to_vec_pretty(users)?;
        std::fs::write(&self.path, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Cost 4 keeps the hashing fast; production uses cost 12
    const TEST_COST: u32 = 4;

    fn open_store(dir: &Path) -> AuthManager {
        AuthManager::open(dir.join("users.json"), TEST_COST).unwrap()
    }

    #[test]
    fn test_bootstrap_and_authenticate() {
        let dir = tempfile::tempdir().unwrap();
        let auth = open_store(dir.path());

        assert!(!auth.has_users());
        auth.bootstrap_admin("root", "hunter2").unwrap();
        assert!(auth.has_users());

        let user = auth.authenticate("root", "hunter2").unwrap();
        assert!(user.is_admin());

        assert!(matches!(
            auth.authenticate("root", "wrong"),
            Err(DbError::Unauthorized)
        ));
        assert!(matches!(
            auth.authenticate("ghost", "hunter2"),
            Err(DbError::Unauthorized)
        ));
    }

    #[test]
    fn test_bootstrap_twice_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let auth = open_store(dir.path());

        auth.bootstrap_admin("root", "pw").unwrap();
        assert!(auth.bootstrap_admin("other", "pw").is_err());
    }

    #[test]
    fn test_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let auth = open_store(dir.path());
            auth.bootstrap_admin("root", "pw").unwrap();
            auth.create_user(
                "reader",
                "secret",
                Role::User,
                HashMap::from([("ts1".to_string(), Permission::Read)]),
            )
            .unwrap();
        }

        let auth = open_store(dir.path());
        let user = auth.authenticate("reader", "secret").unwrap();
        assert_eq!(user.role, Role::User);
        assert_eq!(user.permissions.get("ts1"), Some(&Permission::Read));
    }

    #[test]
    fn test_has_role_matrix() {
        let dir = tempfile::tempdir().unwrap();
        let auth = open_store(dir.path());
        auth.bootstrap_admin("root", "pw").unwrap();
        auth.create_user(
            "worker",
            "pw",
            Role::User,
            HashMap::from([
                ("readable".to_string(), Permission::Read),
                ("writable".to_string(), Permission::Write),
            ]),
        )
        .unwrap();

        let admin = auth.get_user("root").unwrap();
        let worker = auth.get_user("worker").unwrap();

        // Admin satisfies every check
        assert!(auth.has_role(&admin, "anything", Permission::Write));

        // write satisfies write and read
        assert!(auth.has_role(&worker, "writable", Permission::Write));
        assert!(auth.has_role(&worker, "writable", Permission::Read));

        // read satisfies only read
        assert!(auth.has_role(&worker, "readable", Permission::Read));
        assert!(!auth.has_role(&worker, "readable", Permission::Write));

        // no grant, no access
        assert!(!auth.has_role(&worker, "other", Permission::Read));
    }

    #[test]
    fn test_user_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let auth = open_store(dir.path());
        auth.bootstrap_admin("root", "pw").unwrap();
        auth.create_user("u", "old", Role::User, HashMap::new()).unwrap();

        assert!(matches!(
            auth.create_user("u", "x", Role::User, HashMap::new()),
            Err(DbError::Conflict(_))
        ));

        auth.update_password("u", "new").unwrap();
        assert!(auth.authenticate("u", "old").is_err());
        assert!(auth.authenticate("u", "new").is_ok());

        auth.update_role("u", Role::Admin).unwrap();
        assert!(auth.get_user("u").unwrap().is_admin());

        auth.update_permissions("u", HashMap::from([("s".to_string(), Permission::Write)]))
            .unwrap();
        assert_eq!(
            auth.get_user("u").unwrap().permissions.get("s"),
            Some(&Permission::Write)
        );

        auth.delete_user("u").unwrap();
        assert!(matches!(auth.get_user("u"), Err(DbError::NotFound(_))));
        assert!(matches!(auth.delete_user("u"), Err(DbError::NotFound(_))));
    }
}
