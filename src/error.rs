#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A Supabase endpoint answered with a non-success status.
    #[error("{operation} failed{}: {detail}", status_suffix(.status))]
    Api {
        operation: &'static str,
        status: Option<u16>,
        detail: String,
    },
    #[cfg(feature = "supabase")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Session storage error: {0}")]
    Storage(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Not authenticated")]
    NotAuthenticated,
    #[error("No pending password reset for this client")]
    MissingVerifier,
}

impl Error {
    /// HTTP status of an [`Error::Api`] failure.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => *status,
            _ => None,
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

/// Boxed error used at the pluggable trait seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
