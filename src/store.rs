//! Flat-file JSON persistence for user accounts and the active model.
//!
//! Both documents are read and written whole. Every mutation re-reads the
//! file under the store's mutex, edits the map and writes it back. Writes go
//! to a sibling temp file that is renamed into place, so unguarded readers
//! never see a half-written document.

use crate::config::{self, remove_if_exists, Paths};
use crate::error::{DashboardError, Result};
use crate::metadata::ClassNames;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Operator,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Admin => f.write_str("admin"),
            Role::Operator => f.write_str("operator"),
        }
    }
}

impl FromStr for Role {
    type Err = DashboardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "operator" => Ok(Role::Operator),
            other => Err(DashboardError::Input(format!("Unknown role '{other}'"))),
        }
    }
}

/// On-disk value for one account; the username is the map key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// SHA-256 hex digest of the password.
    pub password: String,
    pub role: Role,
}

pub type Users = BTreeMap<String, UserRecord>;

pub fn hash_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn admin_count(users: &Users) -> usize {
    users.values().filter(|u| u.role == Role::Admin).count()
}

fn lock(mutex: &Mutex<()>) -> MutexGuard<'_, ()> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, text)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub struct UserStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl UserStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all accounts, seeding the default admin on first run.
    pub fn load_users(&self) -> Result<Users> {
        if !self.path.exists() {
            let mut users = Users::new();
            users.insert(
                config::DEFAULT_ADMIN_USER.to_string(),
                UserRecord {
                    password: hash_password(config::DEFAULT_ADMIN_PASSWORD),
                    role: Role::Admin,
                },
            );
            self.save_users(&users)?;
            tracing::warn!(
                path = %self.path.display(),
                "created default admin account; change its password"
            );
            return Ok(users);
        }
        let text = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Replace the whole document. Mutations call this with the guard held.
    pub fn save_users(&self, users: &Users) -> Result<()> {
        write_json(&self.path, users)
    }

    pub fn list_users(&self) -> Result<Vec<(String, Role)>> {
        Ok(self
            .load_users()?
            .into_iter()
            .map(|(name, record)| (name, record.role))
            .collect())
    }

    /// Returns the account's role when the credentials match.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<Option<Role>> {
        let users = self.load_users()?;
        let hashed = hash_password(password);
        Ok(users
            .get(username)
            .filter(|record| record.password == hashed)
            .map(|record| record.role))
    }

    /// Current role of `username`, or `None` once the account is gone.
    pub fn role_of(&self, username: &str) -> Result<Option<Role>> {
        Ok(self.load_users()?.get(username).map(|record| record.role))
    }

    pub fn add_user(&self, username: &str, password: &str, role: Role) -> Result<()> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(DashboardError::Input(
                "Username and password must not be empty.".to_string(),
            ));
        }

        let _held = lock(&self.guard);
        let mut users = self.load_users()?;
        if users.contains_key(username) {
            return Err(DashboardError::Integrity(format!(
                "Username '{username}' already exists."
            )));
        }
        users.insert(
            username.to_string(),
            UserRecord {
                password: hash_password(password),
                role,
            },
        );
        self.save_users(&users)?;
        tracing::info!(user = username, %role, "user added");
        Ok(())
    }

    /// Rename, re-password and/or re-role `selected`. Empty `new_username` or
    /// `new_password` leave the field unchanged, as does `new_role = None`.
    /// Returns the final username.
    pub fn update_user(
        &self,
        selected: &str,
        new_username: Option<&str>,
        new_password: Option<&str>,
        new_role: Option<Role>,
    ) -> Result<String> {
        if selected.is_empty() {
            return Err(DashboardError::Input(
                "Select a user to update.".to_string(),
            ));
        }

        let _held = lock(&self.guard);
        let mut users = self.load_users()?;
        let current = users
            .get(selected)
            .cloned()
            .ok_or_else(|| DashboardError::Integrity(format!("Unknown user '{selected}'.")))?;

        let final_name = match new_username.map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => selected.to_string(),
        };
        if final_name != selected && users.contains_key(&final_name) {
            return Err(DashboardError::Integrity(format!(
                "Username '{final_name}' already exists."
            )));
        }

        let role = new_role.unwrap_or(current.role);
        if current.role == Role::Admin && role != Role::Admin && admin_count(&users) <= 1 {
            return Err(DashboardError::Integrity(
                "Cannot demote the last admin.".to_string(),
            ));
        }

        let password = match new_password {
            Some(pw) if !pw.is_empty() => hash_password(pw),
            _ => current.password,
        };

        users.remove(selected);
        users.insert(final_name.clone(), UserRecord { password, role });
        self.save_users(&users)?;
        tracing::info!(user = selected, renamed_to = %final_name, %role, "user updated");
        Ok(final_name)
    }

    pub fn delete_user(&self, username: &str) -> Result<()> {
        if username.is_empty() {
            return Err(DashboardError::Input(
                "Select a user to delete.".to_string(),
            ));
        }

        let _held = lock(&self.guard);
        let mut users = self.load_users()?;
        let record = users
            .get(username)
            .ok_or_else(|| DashboardError::Integrity(format!("Unknown user '{username}'.")))?;
        if record.role == Role::Admin && admin_count(&users) <= 1 {
            return Err(DashboardError::Integrity(
                "Cannot delete the last admin.".to_string(),
            ));
        }

        users.remove(username);
        self.save_users(&users)?;
        tracing::info!(user = username, "user deleted");
        Ok(())
    }
}

/// Paths of the active model artifacts; both `None` until an admin uploads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub weights_path: Option<PathBuf>,
    pub yaml_path: Option<PathBuf>,
}

impl ModelConfig {
    /// Both paths, when configured.
    pub fn paths(&self) -> Option<(&Path, &Path)> {
        match (&self.weights_path, &self.yaml_path) {
            (Some(w), Some(y)) => Some((w.as_path(), y.as_path())),
            _ => None,
        }
    }
}

/// One uploaded model artifact.
pub struct Upload<'a> {
    pub file_name: &'a str,
    pub bytes: &'a [u8],
}

pub struct ModelStore {
    config_path: PathBuf,
    model_dir: PathBuf,
    guard: Mutex<()>,
}

impl ModelStore {
    pub fn new(paths: &Paths) -> Self {
        Self {
            config_path: paths.model_config_file(),
            model_dir: paths.model_dir(),
            guard: Mutex::new(()),
        }
    }

    pub fn load_config(&self) -> Result<ModelConfig> {
        if !self.config_path.exists() {
            return Ok(ModelConfig::default());
        }
        let text = fs::read_to_string(&self.config_path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save_config(&self, config: &ModelConfig) -> Result<()> {
        write_json(&self.config_path, config)
    }

    /// Delete the current artifacts, store the uploads under `models/` and
    /// point the config at them. Returns the new weights path.
    pub fn replace_model(&self, weights: Upload<'_>, metadata: Upload<'_>) -> Result<PathBuf> {
        let weights_name = base_name(weights.file_name)?;
        let yaml_name = base_name(metadata.file_name)?;
        if weights.bytes.is_empty() || metadata.bytes.is_empty() {
            return Err(DashboardError::Input(
                "Please upload both files.".to_string(),
            ));
        }
        // Reject unusable metadata before the current model is deleted.
        ClassNames::parse(&String::from_utf8_lossy(metadata.bytes))?;

        let _held = lock(&self.guard);
        let previous = self.load_config()?;
        for old in [&previous.weights_path, &previous.yaml_path].into_iter().flatten() {
            remove_if_exists(old)?;
        }

        fs::create_dir_all(&self.model_dir)?;
        let weights_dest = self.model_dir.join(weights_name);
        let yaml_dest = self.model_dir.join(yaml_name);
        fs::write(&weights_dest, weights.bytes)?;
        fs::write(&yaml_dest, metadata.bytes)?;

        let config = ModelConfig {
            weights_path: Some(weights_dest.clone()),
            yaml_path: Some(yaml_dest),
        };
        self.save_config(&config)?;
        tracing::info!(weights = %weights_dest.display(), "model replaced");
        Ok(weights_dest)
    }
}

fn base_name(file_name: &str) -> Result<&str> {
    Path::new(file_name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| DashboardError::Input("Please upload both files.".to_string()))
}
