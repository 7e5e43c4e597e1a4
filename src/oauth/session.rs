//! Browser login sessions held in the [`Store`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::clock::SharedClock;
use crate::errors::StorageError;
use crate::oauth::types::{AuthorizeRequest, generate_token};
use crate::storage::{Store, StoreExt};

fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    pub user_id: String,
    pub username: String,
    pub authenticated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user: Option<SessionUser>,
    /// Double-submit token echoed by every form and the CSRF cookie
    pub csrf_token: String,
    /// Authorization request waiting for the login step to finish
    pub oauth_params: Option<AuthorizeRequest>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }
}

/// Creates, loads and rotates sessions.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn Store>,
    clock: SharedClock,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(store: Arc<dyn Store>, clock: SharedClock, ttl: Duration) -> Self {
        Self { store, clock, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn create(&self) -> Result<Session, StorageError> {
        let session = Session {
            id: generate_token(),
            user: None,
            csrf_token: generate_token(),
            oauth_params: None,
            created_at: self.clock.now(),
        };
        self.save(&session).await?;
        Ok(session)
    }

    pub async fn load(&self, session_id: &str) -> Result<Option<Session>, StorageError> {
        self.store.get_json(&session_key(session_id)).await
    }

    /// Load the session named by the cookie, or start a new one.
    pub async fn load_or_create(&self, session_id: Option<&str>) -> Result<Session, StorageError> {
        if let Some(session_id) = session_id {
            if let Some(session) = self.load(session_id).await? {
                return Ok(session);
            }
        }
        self.create().await
    }

    /// Persist the session and extend its lifetime.
    pub async fn save(&self, session: &Session) -> Result<(), StorageError> {
        self.store
            .set_json(&session_key(&session.id), session, Some(self.ttl))
            .await
    }

    pub async fn destroy(&self, session_id: &str) -> Result<bool, StorageError> {
        self.store.delete(&session_key(session_id)).await
    }

    /// Record a successful login and move the session to a fresh id.
    pub async fn sign_in(
        &self,
        mut session: Session,
        user_id: &str,
        username: &str,
    ) -> Result<Session, StorageError> {
        session.user = Some(SessionUser {
            user_id: user_id.to_string(),
            username: username.to_string(),
            authenticated_at: self.clock.now(),
        });
        self.regenerate(session).await
    }

    /// Move session state under a fresh id and CSRF token, discarding the old id.
    pub async fn regenerate(&self, mut session: Session) -> Result<Session, StorageError> {
        self.destroy(&session.id).await?;
        session.id = generate_token();
        session.csrf_token = generate_token();
        self.save(&session).await?;
        Ok(session)
    }
}

/// Double-submit check: the form field, the cookie and the session must all agree.
pub fn verify_csrf(session: &Session, form_token: Option<&str>, cookie_token: Option<&str>) -> bool {
    let (Some(form_token), Some(cookie_token)) = (form_token, cookie_token) else {
        return false;
    };
    let expected = session.csrf_token.as_bytes();
    let form_matches: bool = form_token.as_bytes().ct_eq(expected).into();
    let cookie_matches: bool = cookie_token.as_bytes().ct_eq(expected).into();
    form_matches && cookie_matches
}
