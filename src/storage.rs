use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::BoxError;
use crate::types::Session;

/// Consumer-provided session persistence.
///
/// The identity provider saves every session it receives and restores the
/// last one at startup, so a user stays signed in across launches.
///
/// # Example
///
/// ```rust,ignore
/// impl SessionStore for Keychain {
///     async fn load(&self) -> Result<Option<Session>, BoxError> {
///         Ok(self.read("session")?.map(|raw| serde_json::from_slice(&raw)).transpose()?)
///     }
///
///     async fn save(&self, session: &Session) -> Result<(), BoxError> {
///         self.write("session", &serde_json::to_vec(session)?)
///     }
///
///     async fn clear(&self) -> Result<(), BoxError> {
///         self.delete("session")
///     }
/// }
/// ```
pub trait SessionStore: Send + Sync + 'static {
    /// Load the persisted session, if any.
    fn load(&self) -> impl Future<Output = Result<Option<Session>, BoxError>> + Send;

    /// Persist `session`, replacing any previous one.
    fn save(&self, session: &Session) -> impl Future<Output = Result<(), BoxError>> + Send;

    /// Forget the persisted session.
    fn clear(&self) -> impl Future<Output = Result<(), BoxError>> + Send;
}

/// Process-local store. Sessions do not survive a restart.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    session: Mutex<Option<Session>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with `session` already persisted.
    #[must_use]
    pub fn with_session(session: Session) -> Self {
        Self {
            session: Mutex::new(Some(session)),
        }
    }
}

impl SessionStore for MemorySessionStore {
    async fn load(&self) -> Result<Option<Session>, BoxError> {
        Ok(self.session.lock().clone())
    }

    async fn save(&self, session: &Session) -> Result<(), BoxError> {
        *self.session.lock() = Some(session.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), BoxError> {
        self.session.lock().take();
        Ok(())
    }
}

/// JSON file store. A missing file means "no session".
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for FileSessionStore {
    async fn load(&self) -> Result<Option<Session>, BoxError> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, session: &Session) -> Result<(), BoxError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_vec_pretty(session)?;
        tokio::fs::write(&self.path, raw).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), BoxError> {
        match tokio::fs::remove_file(&self.path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
