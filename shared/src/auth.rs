//! Process-wide session state.
//!
//! The context is the only writer of credentials. Login sets it, the API
//! client's refresh path updates the tokens, logout and terminal auth
//! failures clear it. Every write is mirrored to durable storage through
//! key-value effects, requested before anything that depends on the new state.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::fmt;
use tracing::{info, warn};

use crate::capabilities::{Capabilities, KvKey, StorageSnapshot};
use crate::model::{Role, User, UserId};

pub struct Session {
    pub user: User,
    access_token: SecretString,
    refresh_token: Option<SecretString>,
}

impl Session {
    #[must_use]
    pub fn new(user: User, access_token: String, refresh_token: Option<String>) -> Self {
        Self {
            user,
            access_token: SecretString::new(access_token),
            refresh_token: refresh_token
                .filter(|t| !t.is_empty())
                .map(SecretString::new),
        }
    }

    #[must_use]
    pub fn access_token(&self) -> &str {
        self.access_token.expose_secret()
    }

    #[must_use]
    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_ref().map(|t| t.expose_secret().as_str())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user", &self.user)
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// Body of a successful `POST /login`.
#[derive(Deserialize)]
pub struct LoginResponse {
    pub id: UserId,
    pub name: String,
    pub email: String,
    #[serde(rename = "type", alias = "role")]
    pub role: Role,
    #[serde(alias = "accessToken")]
    pub access_token: String,
    #[serde(alias = "refreshToken", default)]
    pub refresh_token: Option<String>,
}

impl LoginResponse {
    #[must_use]
    pub fn into_session(self) -> Session {
        let user = User {
            id: self.id,
            name: self.name,
            email: self.email,
            role: self.role,
        };
        Session::new(user, self.access_token, self.refresh_token)
    }
}

/// Body of a successful `POST /refresh`.
#[derive(Deserialize)]
pub struct RefreshResponse {
    #[serde(alias = "accessToken")]
    pub access_token: String,
    #[serde(alias = "refreshToken", default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Default)]
pub struct AuthContext {
    session: Option<Session>,
    generation: u64,
}

impl AuthContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }

    #[must_use]
    pub fn user(&self) -> Option<&User> {
        self.session.as_ref().map(|s| &s.user)
    }

    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        self.session.as_ref().map(Session::access_token)
    }

    #[must_use]
    pub fn refresh_token(&self) -> Option<&str> {
        self.session.as_ref().and_then(Session::refresh_token)
    }

    /// Bumped whenever the access token changes. Requests remember the
    /// generation they were signed with.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    pub fn set(&mut self, session: Session, caps: &Capabilities) {
        match serde_json::to_string(&session.user) {
            Ok(user_json) => KvKey::UserData.set(user_json, &caps.kv),
            Err(e) => warn!(error = %e, "failed to serialize user for storage"),
        }
        KvKey::AccessToken.set(session.access_token(), &caps.kv);
        match session.refresh_token() {
            Some(token) => KvKey::RefreshToken.set(token, &caps.kv),
            None => KvKey::RefreshToken.delete(&caps.kv),
        }

        info!(user_id = %session.user.id, role = session.user.role.as_str(), "session started");
        self.session = Some(session);
        self.generation += 1;
    }

    /// Refresh writer. A missing refresh token in the response keeps the
    /// current one.
    pub fn update_tokens(
        &mut self,
        access_token: String,
        refresh_token: Option<String>,
        caps: &Capabilities,
    ) -> bool {
        let Some(session) = self.session.as_mut() else {
            warn!("token refresh completed without a session, ignoring");
            return false;
        };

        KvKey::AccessToken.set(access_token.as_str(), &caps.kv);
        session.access_token = SecretString::new(access_token);

        if let Some(refresh) = refresh_token.filter(|t| !t.is_empty()) {
            KvKey::RefreshToken.set(refresh.as_str(), &caps.kv);
            session.refresh_token = Some(SecretString::new(refresh));
        }

        self.generation += 1;
        info!(generation = self.generation, "access token refreshed");
        true
    }

    /// Forget the session and delete every key the core owns, including the
    /// driver's online preference.
    pub fn clear(&mut self, caps: &Capabilities) {
        for key in KvKey::ALL {
            key.delete(&caps.kv);
        }
        if self.session.take().is_some() {
            info!("session cleared");
        }
        self.generation += 1;
    }

    /// Rebuild the session from storage on start-up. Nothing is written back.
    pub fn restore(&mut self, snapshot: &StorageSnapshot) -> bool {
        let (Some(user_json), Some(access)) = (
            snapshot.get(KvKey::UserData),
            snapshot.get(KvKey::AccessToken),
        ) else {
            return false;
        };

        let user: User = match serde_json::from_str(user_json) {
            Ok(user) => user,
            Err(e) => {
                warn!(error = %e, "stored user data is unreadable, ignoring session");
                return false;
            }
        };

        let refresh = snapshot.get(KvKey::RefreshToken).map(str::to_string);
        info!(user_id = %user.id, "session restored from storage");
        self.session = Some(Session::new(user, access.to_string(), refresh));
        self.generation += 1;
        true
    }
}
