//! Session and profile coordinator.
//!
//! [`SessionCoordinator`] keeps the single in-memory answer to "who is signed
//! in and what is their profile", fed by two independent sources: the
//! identity provider's pushed auth events and its own profile lookups.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use sitrixx_session::coordinator::{CoordinatorConfig, SessionCoordinator};
//!
//! // 1. Implement IdentityProvider and ProfileStore (or use the Supabase backends)
//! let coordinator = SessionCoordinator::start(identity, profiles, CoordinatorConfig::from_env()?);
//!
//! // 2. Drive it from the UI
//! coordinator.sign_in("owner@example.com", "secret").await?;
//! let state = coordinator.wait_for(|s| s.profile.is_some()).await?;
//!
//! // 3. Offer a retry when the lookup failed
//! if state.profile_fetch_error.is_some() {
//!     coordinator.refresh_profile().await;
//! }
//! ```

mod config;
mod error;
mod session;
mod state;
mod traits;

#[cfg(test)]
mod tests;

pub use config::CoordinatorConfig;
pub use error::AuthError;
pub use session::SessionCoordinator;
pub use state::{CoordinatorState, Phase};
pub use traits::{AuthEvents, IdentityProvider, ProfileStore};
