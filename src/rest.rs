use std::future::Future;
use std::sync::Arc;

use reqwest::RequestBuilder;
use serde::Serialize;
use time::OffsetDateTime;

use crate::config::SupabaseConfig;
use crate::coordinator::ProfileStore;
use crate::error::{BoxError, Error};
use crate::gotrue::ensure_success;
use crate::identity::SupabaseIdentity;
use crate::storage::SessionStore;
use crate::types::{Profile, UserId};

/// PostgREST media type that makes a filtered read return one object,
/// and fail unless exactly one row matches.
const SINGLE_OBJECT: &str = "application/vnd.pgrst.object+json";

/// Supplies the bearer token for row-level-security checks.
///
/// Awaited before every request, so an implementation may refresh an
/// expiring token first.
pub trait AccessTokenSource: Send + Sync + 'static {
    /// Current access token, or `None` to fall back to the anon key.
    fn access_token(&self) -> impl Future<Output = Option<String>> + Send;
}

/// Anonymous access: always the anon key.
impl AccessTokenSource for () {
    async fn access_token(&self) -> Option<String> {
        None
    }
}

impl<S: SessionStore> AccessTokenSource for SupabaseIdentity<S> {
    async fn access_token(&self) -> Option<String> {
        self.fresh_access_token().await
    }
}

impl<T: AccessTokenSource> AccessTokenSource for Arc<T> {
    fn access_token(&self) -> impl Future<Output = Option<String>> + Send {
        (**self).access_token()
    }
}

#[derive(Serialize)]
struct PasswordChangeFlag {
    needs_password_change: bool,
    #[serde(with = "time::serde::rfc3339")]
    updated_at: OffsetDateTime,
}

/// Reads and updates rows of the profiles table over PostgREST.
#[derive(Clone)]
pub struct ProfileClient<T = ()> {
    config: SupabaseConfig,
    tokens: T,
    http: reqwest::Client,
}

impl<T: AccessTokenSource> ProfileClient<T> {
    #[must_use]
    pub fn new(config: SupabaseConfig, tokens: T) -> Self {
        Self {
            config,
            tokens,
            http: reqwest::Client::new(),
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// Fetch the profile row keyed by `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Api`] when no row (or more than one) matches or the
    /// row is hidden by row-level security, or [`Error::Http`] on transport
    /// or decoding failure.
    pub async fn fetch_profile(&self, id: &UserId) -> Result<Profile, Error> {
        let response = self
            .authorized(self.http.get(self.table_url()))
            .await
            .query(&[("id", format!("eq.{id}")), ("select", "*".to_owned())])
            .header(reqwest::header::ACCEPT, SINGLE_OBJECT)
            .send()
            .await?;
        let response = ensure_success(response, "profile lookup").await?;
        response.json::<Profile>().await.map_err(Into::into)
    }

    /// Set or clear the forced-password-change flag and bump `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Api`] if the update is rejected.
    pub async fn set_needs_password_change(&self, id: &UserId, value: bool) -> Result<(), Error> {
        let body = PasswordChangeFlag {
            needs_password_change: value,
            updated_at: OffsetDateTime::now_utc(),
        };
        let response = self
            .authorized(self.http.patch(self.table_url()))
            .await
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=minimal")
            .json(&body)
            .send()
            .await?;
        ensure_success(response, "profile update").await?;
        tracing::debug!(user_id = %id, needs_password_change = value, "Profile flag updated");
        Ok(())
    }

    fn table_url(&self) -> url::Url {
        self.config.rest_endpoint(&self.config.profiles_table)
    }

    async fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let token = self
            .tokens
            .access_token()
            .await
            .unwrap_or_else(|| self.config.anon_key.clone());
        request
            .header("apikey", &self.config.anon_key)
            .bearer_auth(token)
    }
}

impl<T: AccessTokenSource> ProfileStore for ProfileClient<T> {
    async fn fetch_profile_by_id(&self, id: &UserId) -> Result<Profile, BoxError> {
        Ok(self.fetch_profile(id).await?)
    }
}
