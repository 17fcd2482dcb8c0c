use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::{Mutex as AsyncMutex, OnceCell, mpsc};

use crate::coordinator::{AuthEvents, IdentityProvider};
use crate::error::{BoxError, Error};
use crate::gotrue::AuthClient;
use crate::pkce::PkcePair;
use crate::storage::{MemorySessionStore, SessionStore};
use crate::types::{AuthChangeEvent, AuthStateChange, Session};

const DEFAULT_REFRESH_MARGIN: time::Duration = time::Duration::seconds(60);

/// Subscriber list plus the flag that says `INITIAL_SESSION` went out.
#[derive(Default)]
struct Fanout {
    subscribers: Vec<mpsc::UnboundedSender<AuthStateChange>>,
    ready: bool,
}

impl Fanout {
    fn broadcast(&mut self, event: AuthChangeEvent, session: Option<&Session>) {
        self.subscribers
            .retain(|tx| tx.send(AuthStateChange::new(event, session.cloned())).is_ok());
    }
}

/// Supabase-backed [`IdentityProvider`].
///
/// Holds the current session, persists it through a [`SessionStore`] and
/// pushes every change to all subscribers in the order it happened. The
/// persisted session is restored lazily on first use.
///
/// ```rust,ignore
/// let client = AuthClient::new(SupabaseConfig::from_env()?);
/// let identity = SupabaseIdentity::new(client, FileSessionStore::new(path));
/// let coordinator = SessionCoordinator::start(Arc::new(identity), profiles, config);
/// ```
pub struct SupabaseIdentity<S = MemorySessionStore> {
    client: AuthClient,
    store: S,
    /// Locked after `fanout` when both are needed.
    current: Mutex<Option<Session>>,
    fanout: Mutex<Fanout>,
    restored: OnceCell<()>,
    /// Serializes automatic refreshes.
    refreshing: AsyncMutex<()>,
    /// Verifier of the last password-reset request.
    pending_verifier: Mutex<Option<String>>,
    refresh_margin: time::Duration,
}

impl SupabaseIdentity<MemorySessionStore> {
    /// Identity whose session only lives as long as the process.
    #[must_use]
    pub fn in_memory(client: AuthClient) -> Self {
        Self::new(client, MemorySessionStore::new())
    }
}

impl<S: SessionStore> SupabaseIdentity<S> {
    #[must_use]
    pub fn new(client: AuthClient, store: S) -> Self {
        Self {
            client,
            store,
            current: Mutex::new(None),
            fanout: Mutex::new(Fanout::default()),
            restored: OnceCell::new(),
            refreshing: AsyncMutex::new(()),
            pending_verifier: Mutex::new(None),
            refresh_margin: DEFAULT_REFRESH_MARGIN,
        }
    }

    /// Refresh a session that expires within `margin` (default: 60s).
    ///
    /// Applies to the restored session and to every
    /// [`fresh_access_token`](Self::fresh_access_token) call.
    #[must_use]
    pub fn with_refresh_margin(mut self, margin: time::Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    #[must_use]
    pub fn client(&self) -> &AuthClient {
        &self.client
    }

    /// Session held right now, without waiting for the restore.
    #[must_use]
    pub fn current_session(&self) -> Option<Session> {
        self.current.lock().clone()
    }

    /// Access token of the current session.
    #[must_use]
    pub fn access_token(&self) -> Option<String> {
        self.current
            .lock()
            .as_ref()
            .map(|s| s.access_token.clone())
    }

    /// Access token, refreshed first if it expires within the refresh margin.
    ///
    /// Concurrent callers share one refresh, which emits `TOKEN_REFRESHED`.
    /// A failed refresh is logged and the current token returned.
    pub async fn fresh_access_token(&self) -> Option<String> {
        self.restore().await;
        if self.needs_refresh() {
            let _refreshing = self.refreshing.lock().await;
            // Someone else may have refreshed while we waited.
            if self.needs_refresh() {
                if let Err(e) = self.refresh_session().await {
                    tracing::warn!(error = %e, "Automatic token refresh failed");
                }
            }
        }
        self.access_token()
    }

    fn needs_refresh(&self) -> bool {
        self.current.lock().as_ref().is_some_and(|s| {
            s.refresh_token.is_some()
                && s.expires_within(OffsetDateTime::now_utc(), self.refresh_margin)
        })
    }

    /// Restored session, loading it on the first call.
    pub async fn session(&self) -> Option<Session> {
        self.restore().await;
        self.current_session()
    }

    /// # Errors
    ///
    /// Returns [`Error::Api`] when the credentials are rejected, or
    /// [`Error::Storage`] when the new session cannot be persisted.
    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, Error> {
        self.restore().await;
        let session = self.client.sign_in_with_password(email, password).await?;
        self.accept(AuthChangeEvent::SignedIn, session).await
    }

    /// Trade the current refresh token for a new session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAuthenticated`] without a refresh token, or the
    /// server's rejection.
    pub async fn refresh_session(&self) -> Result<Session, Error> {
        self.restore().await;
        let refresh_token = self
            .current
            .lock()
            .as_ref()
            .and_then(|s| s.refresh_token.clone())
            .ok_or(Error::NotAuthenticated)?;
        let session = self.client.refresh_session(&refresh_token).await?;
        self.accept(AuthChangeEvent::TokenRefreshed, session).await
    }

    /// Set a new password for the signed-in user.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAuthenticated`] without a session, or the server's
    /// rejection (e.g. the password is unchanged).
    pub async fn update_password(&self, password: &str) -> Result<Session, Error> {
        self.restore().await;
        let access_token = self
            .fresh_access_token()
            .await
            .ok_or(Error::NotAuthenticated)?;
        let user = self.client.update_password(&access_token, password).await?;

        let mut session = self.current_session().ok_or(Error::NotAuthenticated)?;
        session.user = user;
        self.accept(AuthChangeEvent::UserUpdated, session).await
    }

    /// Email a one-time sign-in code.
    ///
    /// # Errors
    ///
    /// Returns the server's rejection (unknown address, rate limit).
    pub async fn send_email_otp(&self, email: &str) -> Result<(), Error> {
        self.client.send_email_otp(email).await
    }

    /// Sign in with an emailed one-time code.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Api`] when the code is wrong or expired.
    pub async fn verify_email_otp(&self, email: &str, code: &str) -> Result<Session, Error> {
        self.restore().await;
        let session = self.client.verify_email_otp(email, code).await?;
        self.accept(AuthChangeEvent::SignedIn, session).await
    }

    /// Request a password-reset email.
    ///
    /// A fresh PKCE verifier is kept for the matching
    /// [`exchange_code_for_session`](Self::exchange_code_for_session); a
    /// second request replaces it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Api`] or [`Error::Http`] on failure.
    pub async fn reset_password_for_email(&self, email: &str) -> Result<(), Error> {
        let pkce = PkcePair::generate();
        self.client
            .reset_password_for_email(email, &pkce.challenge)
            .await?;
        *self.pending_verifier.lock() = Some(pkce.verifier);
        tracing::info!("Password reset email requested");
        Ok(())
    }

    /// Complete a password reset by exchanging the emailed code.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingVerifier`] if no reset was requested by this
    /// client, or the server's rejection of the code.
    pub async fn exchange_code_for_session(&self, code: &str) -> Result<Session, Error> {
        self.restore().await;
        let verifier = self
            .pending_verifier
            .lock()
            .take()
            .ok_or(Error::MissingVerifier)?;
        let session = self.client.exchange_code_for_session(code, &verifier).await?;
        self.accept(AuthChangeEvent::SignedIn, session).await
    }

    /// Sign out remotely and locally.
    ///
    /// The local and persisted session are cleared and `SIGNED_OUT` is
    /// emitted whatever the server says.
    ///
    /// # Errors
    ///
    /// Returns the remote failure after local cleanup.
    pub async fn sign_out(&self) -> Result<(), Error> {
        self.restore().await;
        let remote = match self.access_token() {
            Some(token) => self.client.sign_out(&token).await,
            None => Ok(()),
        };

        self.publish(AuthChangeEvent::SignedOut, None);
        if let Err(e) = self.store.clear().await {
            tracing::warn!(error = %e, "Failed to clear persisted session");
        }
        remote
    }

    /// Load the persisted session once, refreshing it if it is about to expire.
    async fn restore(&self) {
        self.restored
            .get_or_init(|| async {
                let session = self.load_persisted().await;
                let mut fanout = self.fanout.lock();
                fanout.ready = true;
                *self.current.lock() = session.clone();
                fanout.broadcast(AuthChangeEvent::InitialSession, session.as_ref());
            })
            .await;
    }

    async fn load_persisted(&self) -> Option<Session> {
        let session = match self.store.load().await {
            Ok(session) => session?,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load persisted session");
                return None;
            }
        };
        if !session.expires_within(OffsetDateTime::now_utc(), self.refresh_margin) {
            return Some(session);
        }

        let refreshed = match &session.refresh_token {
            Some(token) => self.client.refresh_session(token).await,
            None => Err(Error::NotAuthenticated),
        };
        match refreshed {
            Ok(session) => {
                tracing::debug!(user_id = %session.user_id(), "Refreshed restored session");
                if let Err(e) = self.store.save(&session).await {
                    tracing::warn!(error = %e, "Failed to persist refreshed session");
                }
                Some(session)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Discarding expired session");
                if let Err(e) = self.store.clear().await {
                    tracing::warn!(error = %e, "Failed to clear persisted session");
                }
                None
            }
        }
    }

    /// Persist `session`, make it current and announce it.
    async fn accept(&self, event: AuthChangeEvent, session: Session) -> Result<Session, Error> {
        self.store
            .save(&session)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        self.publish(event, Some(&session));
        tracing::debug!(%event, user_id = %session.user_id(), "Session updated");
        Ok(session)
    }

    fn publish(&self, event: AuthChangeEvent, session: Option<&Session>) {
        let mut fanout = self.fanout.lock();
        *self.current.lock() = session.cloned();
        fanout.broadcast(event, session);
    }
}

impl<S: SessionStore> IdentityProvider for SupabaseIdentity<S> {
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, BoxError> {
        Ok(Self::sign_in_with_password(self, email, password).await?)
    }

    async fn sign_out(&self) -> Result<(), BoxError> {
        Ok(Self::sign_out(self).await?)
    }

    async fn get_session(&self) -> Result<Option<Session>, BoxError> {
        Ok(self.session().await)
    }

    fn subscribe(&self) -> AuthEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut fanout = self.fanout.lock();
        if fanout.ready {
            let session = self.current.lock().clone();
            // The receiver is still in scope, so this cannot fail.
            let _ = tx.send(AuthStateChange::new(AuthChangeEvent::InitialSession, session));
        }
        fanout.subscribers.push(tx);
        rx
    }
}
