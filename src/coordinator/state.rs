use crate::types::{Profile, Session, UserId};

/// Observable coordinator state.
///
/// Readers get clones; only the coordinator writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoordinatorState {
    pub session: Option<Session>,
    /// True only until the initial session restore settles.
    pub session_bootstrapping: bool,
    /// Always belongs to `session`'s user when present.
    pub profile: Option<Profile>,
    pub profile_fetch_in_progress: bool,
    pub profile_fetch_error: Option<String>,
}

/// Coarse lifecycle phase derived from [`CoordinatorState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Booting,
    SignedOut,
    SignedInNoProfile,
    SignedInWithProfile,
}

impl CoordinatorState {
    pub(crate) fn booting() -> Self {
        Self {
            session_bootstrapping: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        if self.session_bootstrapping {
            return Phase::Booting;
        }
        match (&self.session, &self.profile) {
            (None, _) => Phase::SignedOut,
            (Some(_), None) => Phase::SignedInNoProfile,
            (Some(_), Some(_)) => Phase::SignedInWithProfile,
        }
    }

    /// User of the held session.
    #[must_use]
    pub fn user_id(&self) -> Option<&UserId> {
        self.session.as_ref().map(Session::user_id)
    }

    /// Whether a profile for `user_id` is already held.
    pub(crate) fn has_profile_for(&self, user_id: &UserId) -> bool {
        self.profile.as_ref().is_some_and(|p| &p.id == user_id)
    }

    pub(crate) fn clear_profile(&mut self) {
        self.profile = None;
        self.profile_fetch_error = None;
        self.profile_fetch_in_progress = false;
    }
}
