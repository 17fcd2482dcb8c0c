use std::time::Duration;

use super::error::AuthError;

const DEFAULT_PROFILE_TIMEOUT: Duration = Duration::from_millis(8000);

/// Session coordinator settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub(crate) profile_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            profile_timeout: DEFAULT_PROFILE_TIMEOUT,
        }
    }
}

impl CoordinatorConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create config from environment variables.
    ///
    /// # Optional env vars
    /// - `SITRIXX_PROFILE_TIMEOUT_MS`: profile lookup timeout in milliseconds (default 8000)
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Config`] if the timeout is not a positive integer.
    pub fn from_env() -> Result<Self, AuthError> {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("SITRIXX_PROFILE_TIMEOUT_MS") {
            let millis: u64 = raw
                .trim()
                .parse()
                .map_err(|e| AuthError::Config(format!("SITRIXX_PROFILE_TIMEOUT_MS: {e}")))?;
            if millis == 0 {
                return Err(AuthError::Config(
                    "SITRIXX_PROFILE_TIMEOUT_MS must be greater than zero".into(),
                ));
            }
            config = config.with_profile_timeout(Duration::from_millis(millis));
        }

        Ok(config)
    }

    /// Bound on a single profile lookup; a slower lookup counts as failed.
    #[must_use]
    pub fn with_profile_timeout(mut self, timeout: Duration) -> Self {
        self.profile_timeout = timeout;
        self
    }

    #[must_use]
    pub fn profile_timeout(&self) -> Duration {
        self.profile_timeout
    }
}
