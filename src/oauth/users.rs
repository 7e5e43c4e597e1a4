//! Resource owners who sign in at the login step.

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::errors::StorageError;

/// Opaque user identity; nothing beyond these claims is known about the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub name: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: bool,
    pub picture: Option<String>,
}

/// Bootstrap file entry
#[derive(Debug, Clone, Deserialize)]
pub struct UserSeed {
    #[serde(default)]
    pub id: Option<String>,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default)]
    pub picture: Option<String>,
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Check a username/password pair.
    async fn authenticate(&self, username: &str, password: &str) -> Result<Option<User>, StorageError>;

    async fn get(&self, user_id: &str) -> Result<Option<User>, StorageError>;
}

struct UserEntry {
    user: User,
    password_hash: String,
}

/// In-process directory with Argon2id password hashes.
///
/// Unknown usernames are checked against a throwaway hash so both outcomes cost one
/// Argon2 verification.
#[derive(Default)]
pub struct MemoryUserDirectory {
    by_username: DashMap<String, UserEntry>,
    usernames_by_id: DashMap<String, String>,
    dummy_hash: OnceLock<String>,
}

fn hash_password(password: &str) -> Result<String, StorageError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| StorageError::InvalidData(format!("password hashing failed: {}", e)))
}

fn verify_password(password: &str, hash: &str) -> Result<bool, StorageError> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| StorageError::InvalidData(format!("stored password hash: {}", e)))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, seed: UserSeed) -> Result<User, StorageError> {
        let password_hash = hash_password(&seed.password)?;

        let user = User {
            id: seed
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            username: seed.username,
            name: seed.name,
            email: seed.email,
            email_verified: seed.email_verified,
            picture: seed.picture,
        };

        self.usernames_by_id
            .insert(user.id.clone(), user.username.clone());
        self.by_username.insert(
            user.username.clone(),
            UserEntry {
                user: user.clone(),
                password_hash,
            },
        );
        Ok(user)
    }

    fn dummy_hash(&self) -> Result<&str, StorageError> {
        if let Some(hash) = self.dummy_hash.get() {
            return Ok(hash.as_str());
        }
        let hash = hash_password(&uuid::Uuid::new_v4().to_string())?;
        Ok(self.dummy_hash.get_or_init(|| hash).as_str())
    }

    pub fn len(&self) -> usize {
        self.by_username.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_username.is_empty()
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn authenticate(&self, username: &str, password: &str) -> Result<Option<User>, StorageError> {
        let Some(entry) = self.by_username.get(username) else {
            verify_password(password, self.dummy_hash()?)?;
            return Ok(None);
        };
        let verified = verify_password(password, &entry.password_hash)?;
        Ok(verified.then(|| entry.user.clone()))
    }

    async fn get(&self, user_id: &str) -> Result<Option<User>, StorageError> {
        let Some(username) = self.usernames_by_id.get(user_id).map(|u| u.clone()) else {
            return Ok(None);
        };
        Ok(self.by_username.get(&username).map(|entry| entry.user.clone()))
    }
}
