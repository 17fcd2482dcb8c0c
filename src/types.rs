use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use time::OffsetDateTime;

/// Role value that unlocks the admin panel.
pub const ADMIN_ROLE: &str = "admin";

/// Identity-provider user identifier (Supabase `auth.users.id`).
///
/// The same value keys the `profiles` table, so it is the only link between
/// a [`Session`] and its [`Profile`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// User attributes carried inside a [`Session`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct SessionUser {
    pub id: UserId,
    #[serde(default)]
    pub email: Option<String>,
    /// Any other attribute the identity provider returns.
    #[serde(flatten)]
    pub attributes: Map<String, JsonValue>,
}

impl SessionUser {
    #[must_use]
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            email: None,
            attributes: Map::new(),
        }
    }
}

/// Token bundle issued by the identity provider.
///
/// The coordinator stores and forwards it; only [`Session::user_id`] is ever
/// inspected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Session {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Expiry as unix seconds.
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub user: SessionUser,
}

fn default_token_type() -> String {
    "bearer".into()
}

impl Session {
    /// Create a session with only the required access token and user.
    #[must_use]
    pub fn new(access_token: impl Into<String>, user: SessionUser) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: default_token_type(),
            expires_in: None,
            expires_at: None,
            refresh_token: None,
            user,
        }
    }

    /// Set the refresh token.
    #[must_use]
    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    /// Set the absolute expiry (unix seconds).
    #[must_use]
    pub fn with_expires_at(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user.id
    }

    /// Fill `expires_at` from `expires_in` when the server only sent the latter.
    pub(crate) fn stamp_expiry(&mut self, now: OffsetDateTime) {
        if let (None, Some(secs)) = (self.expires_at, self.expires_in) {
            let secs = i64::try_from(secs).unwrap_or(i64::MAX);
            self.expires_at = Some(now.unix_timestamp().saturating_add(secs));
        }
    }

    /// Whether the access token expires within `margin` of `now`.
    ///
    /// Sessions without an expiry never expire.
    #[must_use]
    pub fn expires_within(&self, now: OffsetDateTime, margin: time::Duration) -> bool {
        self.expires_at
            .is_some_and(|at| at <= (now + margin).unix_timestamp())
    }
}

/// Application-level user record from the `profiles` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Profile {
    pub id: UserId,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub needs_password_change: Option<bool>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
    /// Columns this crate does not model, passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl Profile {
    /// Create a profile with only the required `id`.
    #[must_use]
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            email: None,
            display_name: None,
            phone: None,
            role: None,
            client_id: None,
            needs_password_change: None,
            updated_at: None,
            extra: Map::new(),
        }
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    #[must_use]
    pub fn with_needs_password_change(mut self, value: bool) -> Self {
        self.needs_password_change = Some(value);
        self
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.role.as_deref() == Some(ADMIN_ROLE)
    }

    /// Whether the user is still on a temporary password.
    #[must_use]
    pub fn must_change_password(&self) -> bool {
        self.needs_password_change.unwrap_or(false)
    }
}

/// Kind of an identity-provider state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthChangeEvent {
    #[display("INITIAL_SESSION")]
    InitialSession,
    #[display("SIGNED_IN")]
    SignedIn,
    #[display("TOKEN_REFRESHED")]
    TokenRefreshed,
    #[display("SIGNED_OUT")]
    SignedOut,
    #[display("USER_UPDATED")]
    UserUpdated,
}

/// One delivery from the identity provider's event stream.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthStateChange {
    pub event: AuthChangeEvent,
    pub session: Option<Session>,
}

impl AuthStateChange {
    #[must_use]
    pub fn new(event: AuthChangeEvent, session: Option<Session>) -> Self {
        Self { event, session }
    }
}
