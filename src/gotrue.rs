use reqwest::RequestBuilder;
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;

use crate::config::SupabaseConfig;
use crate::error::Error;
use crate::types::{Session, SessionUser};

/// Supabase Auth (GoTrue) REST client.
///
/// Stateless: every call takes the tokens it needs. Session bookkeeping and
/// event fan-out live in [`SupabaseIdentity`](crate::SupabaseIdentity).
#[derive(Clone)]
pub struct AuthClient {
    config: SupabaseConfig,
    http: reqwest::Client,
}

impl AuthClient {
    #[must_use]
    pub fn new(config: SupabaseConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    #[must_use]
    pub fn config(&self) -> &SupabaseConfig {
        &self.config
    }

    /// Exchange email + password for a session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Api`] with status 400 when the credentials are rejected,
    /// or [`Error::Http`] on network failure.
    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, Error> {
        let request = self
            .post("token")
            .query(&[("grant_type", "password")])
            .json(&json!({ "email": email, "password": password }));
        self.send_for_session(request, "password sign-in").await
    }

    /// Trade a refresh token for a fresh session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Api`] if the refresh token is revoked or expired.
    pub async fn refresh_session(&self, refresh_token: &str) -> Result<Session, Error> {
        let request = self
            .post("token")
            .query(&[("grant_type", "refresh_token")])
            .json(&json!({ "refresh_token": refresh_token }));
        self.send_for_session(request, "token refresh").await
    }

    /// Exchange an emailed auth code for a session using the stored PKCE verifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Api`] if the code is invalid or does not match the verifier.
    pub async fn exchange_code_for_session(
        &self,
        auth_code: &str,
        code_verifier: &str,
    ) -> Result<Session, Error> {
        let request = self
            .post("token")
            .query(&[("grant_type", "pkce")])
            .json(&json!({ "auth_code": auth_code, "code_verifier": code_verifier }));
        self.send_for_session(request, "code exchange").await
    }

    /// Revoke the session server-side.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Api`] or [`Error::Http`]; callers treat both as best-effort.
    pub async fn sign_out(&self, access_token: &str) -> Result<(), Error> {
        let response = self.post("logout").bearer_auth(access_token).send().await?;
        ensure_success(response, "sign-out").await?;
        Ok(())
    }

    /// Fetch the identity-provider user behind an access token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Api`] with status 401 when the token is no longer valid.
    pub async fn get_user(&self, access_token: &str) -> Result<SessionUser, Error> {
        let response = self
            .http
            .get(self.config.auth_endpoint("user"))
            .header("apikey", &self.config.anon_key)
            .bearer_auth(access_token)
            .send()
            .await?;
        let response = ensure_success(response, "user lookup").await?;
        response.json::<SessionUser>().await.map_err(Into::into)
    }

    /// Set a new password for the signed-in user.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Api`] when GoTrue rejects the password (e.g. unchanged or too weak).
    pub async fn update_password(
        &self,
        access_token: &str,
        password: &str,
    ) -> Result<SessionUser, Error> {
        let response = self
            .http
            .put(self.config.auth_endpoint("user"))
            .header("apikey", &self.config.anon_key)
            .bearer_auth(access_token)
            .json(&json!({ "password": password }))
            .send()
            .await?;
        let response = ensure_success(response, "password update").await?;
        response.json::<SessionUser>().await.map_err(Into::into)
    }

    /// Email a one-time sign-in code to an existing user. Never creates accounts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Api`] if the address is unknown or rate-limited.
    pub async fn send_email_otp(&self, email: &str) -> Result<(), Error> {
        let response = self
            .post("otp")
            .json(&json!({ "email": email, "create_user": false }))
            .send()
            .await?;
        ensure_success(response, "one-time code request").await?;
        Ok(())
    }

    /// Verify an emailed one-time code and receive a session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Api`] when the code is wrong or expired.
    pub async fn verify_email_otp(&self, email: &str, token: &str) -> Result<Session, Error> {
        let request = self
            .post("verify")
            .json(&json!({ "email": email, "token": token, "type": "email" }));
        self.send_for_session(request, "one-time code verification").await
    }

    /// Send a password-reset email carrying a PKCE-bound code.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Api`] or [`Error::Http`] on failure.
    pub async fn reset_password_for_email(
        &self,
        email: &str,
        code_challenge: &str,
    ) -> Result<(), Error> {
        let mut request = self.post("recover");
        if let Some(redirect) = &self.config.reset_redirect {
            request = request.query(&[("redirect_to", redirect.as_str())]);
        }
        let response = request
            .json(&json!({
                "email": email,
                "code_challenge": code_challenge,
                "code_challenge_method": "s256",
            }))
            .send()
            .await?;
        ensure_success(response, "password reset request").await?;
        Ok(())
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.http
            .post(self.config.auth_endpoint(path))
            .header("apikey", &self.config.anon_key)
            .bearer_auth(&self.config.anon_key)
    }

    async fn send_for_session(
        &self,
        request: RequestBuilder,
        operation: &'static str,
    ) -> Result<Session, Error> {
        let response = ensure_success(request.send().await?, operation).await?;
        let mut session = response.json::<Session>().await?;
        session.stamp_expiry(OffsetDateTime::now_utc());
        Ok(session)
    }
}

#[derive(Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Pull the human-readable message out of a GoTrue or PostgREST error body.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.error_description.or(b.msg).or(b.message).or(b.error))
        .unwrap_or_else(|| body.to_owned())
}

/// Checks HTTP response status; returns the response on success or an error with details.
pub(crate) async fn ensure_success(
    response: reqwest::Response,
    operation: &'static str,
) -> Result<reqwest::Response, Error> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(Error::Api {
        operation,
        status: Some(status),
        detail: error_detail(&body),
    })
}
