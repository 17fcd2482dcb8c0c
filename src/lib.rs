#![doc = include_str!("../README.md")]

#[cfg(feature = "supabase")]
pub mod config;
pub mod coordinator;
pub mod error;
#[cfg(feature = "supabase")]
pub mod gotrue;
#[cfg(feature = "supabase")]
pub mod identity;
#[cfg(feature = "supabase")]
pub mod pkce;
#[cfg(feature = "supabase")]
pub mod rest;
pub mod storage;
pub mod types;

#[cfg(all(test, feature = "supabase"))]
mod test_support;

// Re-exports for convenient access
pub use coordinator::{
    AuthError, CoordinatorConfig, CoordinatorState, IdentityProvider, Phase, ProfileStore,
    SessionCoordinator,
};
pub use error::{BoxError, Error};
pub use storage::{FileSessionStore, MemorySessionStore, SessionStore};
pub use types::{
    ADMIN_ROLE, AuthChangeEvent, AuthStateChange, Profile, Session, SessionUser, UserId,
};

#[cfg(feature = "supabase")]
pub use config::SupabaseConfig;
#[cfg(feature = "supabase")]
pub use gotrue::AuthClient;
#[cfg(feature = "supabase")]
pub use identity::SupabaseIdentity;
#[cfg(feature = "supabase")]
pub use rest::{AccessTokenSource, ProfileClient};
