use std::time::Duration;

/// Errors surfaced by the session coordinator.
///
/// Only [`AuthError::Authentication`] and [`AuthError::Stopped`] are ever
/// returned to callers; profile failures are recorded into
/// [`CoordinatorState::profile_fetch_error`](super::CoordinatorState::profile_fetch_error)
/// as their display string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// Credentials rejected by the identity provider.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Profile lookup failed.
    #[error("Profile fetch failed: {0}")]
    ProfileFetch(String),

    /// Profile lookup did not settle in time.
    #[error("Profile fetch timed out after {}ms", .0.as_millis())]
    ProfileTimeout(Duration),

    /// The coordinator was stopped.
    #[error("Session coordinator stopped")]
    Stopped,

    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}
