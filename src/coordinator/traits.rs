use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::BoxError;
use crate::types::{AuthStateChange, Profile, Session, UserId};

/// Receiving half of an identity event subscription. Dropping it unsubscribes.
pub type AuthEvents = mpsc::UnboundedReceiver<AuthStateChange>;

/// Authentication service the coordinator listens to.
///
/// The provider is the single source of truth for the session: a successful
/// [`sign_in_with_password`](IdentityProvider::sign_in_with_password) must be
/// followed by a `SIGNED_IN` delivery on every subscription, and
/// [`sign_out`](IdentityProvider::sign_out) by a `SIGNED_OUT` one.
///
/// # Example
///
/// ```rust,ignore
/// impl IdentityProvider for MyAuth {
///     async fn sign_in_with_password(&self, email: &str, password: &str)
///         -> Result<Session, BoxError>
///     {
///         let session = self.api.password_grant(email, password).await?;
///         self.broadcast(AuthChangeEvent::SignedIn, Some(session.clone()));
///         Ok(session)
///     }
///     // ...
/// }
/// ```
pub trait IdentityProvider: Send + Sync + 'static {
    /// Exchange credentials for a session.
    fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> impl Future<Output = Result<Session, BoxError>> + Send;

    /// End the current session.
    fn sign_out(&self) -> impl Future<Output = Result<(), BoxError>> + Send;

    /// The session restored at startup, if any.
    fn get_session(&self) -> impl Future<Output = Result<Option<Session>, BoxError>> + Send;

    /// Subscribe to state changes. Deliveries arrive in emission order.
    fn subscribe(&self) -> AuthEvents;
}

/// Single-row profile lookup.
pub trait ProfileStore: Send + Sync + 'static {
    /// Fetch the profile whose primary key is `id`.
    ///
    /// Fails when no row exists or the transport fails.
    fn fetch_profile_by_id(
        &self,
        id: &UserId,
    ) -> impl Future<Output = Result<Profile, BoxError>> + Send;
}

impl<T: IdentityProvider> IdentityProvider for Arc<T> {
    fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> impl Future<Output = Result<Session, BoxError>> + Send {
        (**self).sign_in_with_password(email, password)
    }

    fn sign_out(&self) -> impl Future<Output = Result<(), BoxError>> + Send {
        (**self).sign_out()
    }

    fn get_session(&self) -> impl Future<Output = Result<Option<Session>, BoxError>> + Send {
        (**self).get_session()
    }

    fn subscribe(&self) -> AuthEvents {
        (**self).subscribe()
    }
}

impl<T: ProfileStore> ProfileStore for Arc<T> {
    fn fetch_profile_by_id(
        &self,
        id: &UserId,
    ) -> impl Future<Output = Result<Profile, BoxError>> + Send {
        (**self).fetch_profile_by_id(id)
    }
}
