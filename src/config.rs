use url::Url;

use crate::error::Error;

const DEFAULT_PROFILES_TABLE: &str = "profiles";

/// Supabase project configuration.
///
/// Required fields are constructor parameters; everything else has a default.
///
/// ```rust,ignore
/// use sitrixx_session::SupabaseConfig;
///
/// let config = SupabaseConfig::new("https://abc.supabase.co".parse()?, "anon-key")
///     .with_profiles_table("profiles");
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SupabaseConfig {
    pub(crate) project_url: Url,
    pub(crate) anon_key: String,
    pub(crate) profiles_table: String,
    pub(crate) reset_redirect: Option<Url>,
}

impl SupabaseConfig {
    #[must_use]
    pub fn new(project_url: Url, anon_key: impl Into<String>) -> Self {
        Self {
            project_url,
            anon_key: anon_key.into(),
            profiles_table: DEFAULT_PROFILES_TABLE.into(),
            reset_redirect: None,
        }
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `SUPABASE_URL`: project URL
    /// - `SUPABASE_ANON_KEY`: publishable (anon) API key
    ///
    /// # Optional env vars
    /// - `SUPABASE_PROFILES_TABLE`: profile table name (default `profiles`)
    /// - `SITRIXX_RESET_REDIRECT`: deep link the password-reset email points at
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a required variable is missing or a URL is invalid.
    pub fn from_env() -> Result<Self, Error> {
        let url_str = std::env::var("SUPABASE_URL")
            .map_err(|_| Error::Config("SUPABASE_URL is required".into()))?;
        let project_url: Url = url_str
            .parse()
            .map_err(|e| Error::Config(format!("SUPABASE_URL: {e}")))?;
        let anon_key = std::env::var("SUPABASE_ANON_KEY")
            .map_err(|_| Error::Config("SUPABASE_ANON_KEY is required".into()))?;

        let mut config = Self::new(project_url, anon_key);

        if let Ok(table) = std::env::var("SUPABASE_PROFILES_TABLE") {
            config = config.with_profiles_table(table);
        }
        if let Ok(url_str) = std::env::var("SITRIXX_RESET_REDIRECT") {
            let url: Url = url_str
                .parse()
                .map_err(|e| Error::Config(format!("SITRIXX_RESET_REDIRECT: {e}")))?;
            config = config.with_reset_redirect(url);
        }

        Ok(config)
    }

    /// Override the table profiles are read from (default: `profiles`).
    #[must_use]
    pub fn with_profiles_table(mut self, table: impl Into<String>) -> Self {
        self.profiles_table = table.into();
        self
    }

    /// Set the redirect target embedded in password-reset emails.
    #[must_use]
    pub fn with_reset_redirect(mut self, url: Url) -> Self {
        self.reset_redirect = Some(url);
        self
    }

    #[must_use]
    pub fn project_url(&self) -> &Url {
        &self.project_url
    }

    #[must_use]
    pub fn anon_key(&self) -> &str {
        &self.anon_key
    }

    #[must_use]
    pub fn profiles_table(&self) -> &str {
        &self.profiles_table
    }

    #[must_use]
    pub fn reset_redirect(&self) -> Option<&Url> {
        self.reset_redirect.as_ref()
    }

    /// GoTrue endpoint, e.g. `auth_endpoint("token")` → `<project>/auth/v1/token`.
    pub(crate) fn auth_endpoint(&self, path: &str) -> Url {
        self.endpoint("auth/v1", path)
    }

    /// PostgREST endpoint, e.g. `rest_endpoint("profiles")` → `<project>/rest/v1/profiles`.
    pub(crate) fn rest_endpoint(&self, path: &str) -> Url {
        self.endpoint("rest/v1", path)
    }

    fn endpoint(&self, service: &str, path: &str) -> Url {
        let mut url = self.project_url.clone();
        let base = self.project_url.path().trim_end_matches('/');
        url.set_path(&format!("{base}/{service}/{path}"));
        url.set_query(None);
        url
    }
}
