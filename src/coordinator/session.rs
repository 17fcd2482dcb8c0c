use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;

use super::config::CoordinatorConfig;
use super::error::AuthError;
use super::state::CoordinatorState;
use super::traits::{AuthEvents, IdentityProvider, ProfileStore};
use crate::types::{AuthChangeEvent, AuthStateChange, Profile, UserId};

/// How a profile request treats a fetch that is already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchMode {
    /// Do nothing if this user's profile is held or being fetched.
    Ensure,
    /// Join an in-flight fetch for the same user, otherwise start one.
    Join,
    /// Start a new fetch even if one is running; the old result goes stale.
    Supersede,
}

#[derive(Debug)]
struct InFlight {
    seq: u64,
    user_id: UserId,
}

/// Owns the signed-in session and the matching profile.
///
/// Reconciles the identity provider's event stream with profile lookups:
/// at most one lookup runs at a time, every lookup is numbered, and only the
/// most recently issued one may write its result. Cloning yields another
/// handle to the same coordinator.
pub struct SessionCoordinator<I, P> {
    inner: Arc<Inner<I, P>>,
}

impl<I, P> Clone for SessionCoordinator<I, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<I, P> {
    identity: I,
    profiles: P,
    config: CoordinatorConfig,
    state: watch::Sender<CoordinatorState>,
    /// Last issued fetch number. Only bumped while holding `in_flight`.
    sequence: AtomicU64,
    in_flight: Mutex<Option<InFlight>>,
    /// An identity event has been applied; the boot result must not override it.
    event_seen: AtomicBool,
    stop: watch::Sender<bool>,
}

impl<I: IdentityProvider, P: ProfileStore> SessionCoordinator<I, P> {
    /// Subscribe to `identity` and start restoring the persisted session.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn start(identity: I, profiles: P, config: CoordinatorConfig) -> Self {
        let inner = Arc::new(Inner {
            identity,
            profiles,
            config,
            state: watch::Sender::new(CoordinatorState::booting()),
            sequence: AtomicU64::new(0),
            in_flight: Mutex::new(None),
            event_seen: AtomicBool::new(false),
            stop: watch::Sender::new(false),
        });

        let events = inner.identity.subscribe();
        tokio::spawn(listen(Arc::downgrade(&inner), inner.stop.subscribe(), events));
        tokio::spawn(Arc::clone(&inner).bootstrap());

        Self { inner }
    }

    /// Snapshot of the current state.
    #[must_use]
    pub fn state(&self) -> CoordinatorState {
        self.inner.state.borrow().clone()
    }

    /// Change notifications, starting from the current state.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CoordinatorState> {
        self.inner.state.subscribe()
    }

    /// Wait until `predicate` holds and return the matching state.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Stopped`] if the coordinator stops first.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&CoordinatorState) -> bool,
    ) -> Result<CoordinatorState, AuthError> {
        if self.inner.is_stopped() {
            return Err(AuthError::Stopped);
        }
        let mut states = self.inner.state.subscribe();
        let mut stop = self.inner.stop.subscribe();
        tokio::select! {
            state = next_matching(&mut states, predicate) => state.ok_or(AuthError::Stopped),
            () = stopped(&mut stop) => Err(AuthError::Stopped),
        }
    }

    /// Sign in with email and password.
    ///
    /// Returns once the provider accepted or rejected the credentials. The
    /// session itself arrives through the provider's `SIGNED_IN` event.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Authentication`] when the provider rejects the
    /// credentials (state is left untouched), or [`AuthError::Stopped`].
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<(), AuthError> {
        if self.inner.is_stopped() {
            return Err(AuthError::Stopped);
        }
        match self.inner.identity.sign_in_with_password(email, password).await {
            Ok(session) => {
                tracing::info!(user_id = %session.user_id(), "Sign-in accepted");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Sign-in rejected");
                Err(AuthError::Authentication(e.to_string()))
            }
        }
    }

    /// Sign out locally, and remotely if the provider can be reached.
    ///
    /// Local state is always cleared and any running profile fetch is
    /// invalidated, even when the remote call fails. Does nothing once
    /// stopped.
    pub async fn sign_out(&self) {
        if self.inner.is_stopped() {
            return;
        }
        if let Err(e) = self.inner.identity.sign_out().await {
            tracing::warn!(error = %e, "Remote sign-out failed; clearing local session");
        }
        self.inner.invalidate(|state| {
            state.session = None;
            state.clear_profile();
        });
        tracing::info!("Signed out");
    }

    /// Re-fetch the profile of the signed-in user and wait for the outcome.
    ///
    /// Failures land in [`CoordinatorState::profile_fetch_error`]. Without a
    /// session this only clears stale profile data.
    pub async fn refresh_profile(&self) {
        let user_id = self.inner.state.borrow().user_id().cloned();
        let Some(user_id) = user_id else {
            self.inner.invalidate(CoordinatorState::clear_profile);
            return;
        };

        let mut states = self.inner.state.subscribe();
        let mut stop = self.inner.stop.subscribe();
        self.inner.request_fetch(user_id, FetchMode::Join);

        tokio::select! {
            _ = next_matching(&mut states, |s| !s.profile_fetch_in_progress) => {}
            () = stopped(&mut stop) => {}
        }
    }

    /// Stop listening to identity events and freeze the state.
    ///
    /// Results that arrive afterwards are dropped.
    pub fn stop(&self) {
        if !self.inner.stop.send_replace(true) {
            tracing::debug!("Session coordinator stopped");
        }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }
}

impl<I: IdentityProvider, P: ProfileStore> Inner<I, P> {
    fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Apply `f` unless stopped. Every state write goes through here.
    fn update<R>(&self, f: impl FnOnce(&mut CoordinatorState) -> R) -> Option<R> {
        if self.is_stopped() {
            return None;
        }
        let mut out = None;
        self.state.send_modify(|state| out = Some(f(state)));
        out
    }

    /// Make every fetch issued so far stale, then apply `f`.
    fn invalidate(&self, f: impl FnOnce(&mut CoordinatorState)) {
        let mut slot = self.in_flight.lock();
        self.sequence.fetch_add(1, Ordering::AcqRel);
        *slot = None;
        self.update(f);
    }

    async fn bootstrap(self: Arc<Self>) {
        let mut stop = self.stop.subscribe();
        let restored = tokio::select! {
            () = stopped(&mut stop) => return,
            restored = self.identity.get_session() => restored,
        };

        let session = restored.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Session restore failed");
            None
        });
        let user_id = session.as_ref().map(|s| s.user_id().clone());

        let applied = self.update(|state| {
            state.session_bootstrapping = false;
            if self.event_seen.load(Ordering::Acquire) {
                return false;
            }
            state.session = session;
            true
        });

        match (applied, user_id) {
            (Some(true), Some(user_id)) => {
                tracing::debug!(user_id = %user_id, "Session restored");
                self.request_fetch(user_id, FetchMode::Ensure);
            }
            (Some(true), None) => tracing::debug!("No session to restore"),
            _ => {}
        }
    }

    fn handle_event(self: &Arc<Self>, change: AuthStateChange) {
        let AuthStateChange { event, session } = change;
        let user_id = session.as_ref().map(|s| s.user_id().clone());
        tracing::debug!(%event, user_id = ?user_id, "Identity event");

        let Some(user_id) = user_id else {
            self.invalidate(|state| {
                self.event_seen.store(true, Ordering::Release);
                state.session = None;
                state.clear_profile();
            });
            return;
        };

        // USER_UPDATED never fetches; for a new user, leave a retryable error.
        let changed_user = self.state.borrow().user_id() != Some(&user_id);
        if event == AuthChangeEvent::UserUpdated && changed_user {
            let message =
                AuthError::ProfileFetch(format!("no profile loaded for {user_id}")).to_string();
            self.invalidate(|state| {
                self.event_seen.store(true, Ordering::Release);
                state.session = session;
                state.profile = None;
                state.profile_fetch_in_progress = false;
                state.profile_fetch_error = Some(message);
            });
            return;
        }

        let applied = self.update(|state| {
            self.event_seen.store(true, Ordering::Release);
            if !state.has_profile_for(&user_id) {
                state.profile = None;
            }
            state.session = session;
        });
        if applied.is_none() {
            return;
        }

        let mode = match event {
            // Fires mid-way through password rotation; a fetch here would race it.
            AuthChangeEvent::UserUpdated => return,
            AuthChangeEvent::SignedIn => FetchMode::Supersede,
            AuthChangeEvent::InitialSession => FetchMode::Ensure,
            AuthChangeEvent::TokenRefreshed | AuthChangeEvent::SignedOut => FetchMode::Join,
        };
        self.request_fetch(user_id, mode);
    }

    fn request_fetch(self: &Arc<Self>, user_id: UserId, mode: FetchMode) {
        if self.is_stopped() {
            return;
        }

        let seq = {
            let mut slot = self.in_flight.lock();
            match slot.as_ref() {
                Some(current) if current.user_id == user_id && mode != FetchMode::Supersede => {
                    tracing::debug!(user_id = %user_id, seq = current.seq, "Joining in-flight profile fetch");
                    return;
                }
                None if mode == FetchMode::Ensure && self.state.borrow().has_profile_for(&user_id) => {
                    tracing::debug!(user_id = %user_id, "Profile already loaded");
                    return;
                }
                _ => {}
            }

            let seq = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
            *slot = Some(InFlight {
                seq,
                user_id: user_id.clone(),
            });
            self.update(|state| {
                state.profile_fetch_in_progress = true;
                state.profile_fetch_error = None;
            });
            seq
        };

        tokio::spawn(Arc::clone(self).run_fetch(seq, user_id));
    }

    async fn run_fetch(self: Arc<Self>, seq: u64, user_id: UserId) {
        let timeout = self.config.profile_timeout;
        let mut stop = self.stop.subscribe();

        let outcome = tokio::select! {
            () = stopped(&mut stop) => return,
            outcome = tokio::time::timeout(timeout, self.profiles.fetch_profile_by_id(&user_id)) => outcome,
        };

        let result = match outcome {
            Ok(Ok(profile)) if profile.id == user_id => Ok(profile),
            Ok(Ok(profile)) => Err(AuthError::ProfileFetch(format!(
                "lookup for {user_id} returned profile {}",
                profile.id
            ))),
            Ok(Err(e)) => Err(AuthError::ProfileFetch(e.to_string())),
            Err(_) => Err(AuthError::ProfileTimeout(timeout)),
        };

        self.finish_fetch(seq, &user_id, result);
    }

    fn finish_fetch(&self, seq: u64, user_id: &UserId, result: Result<Profile, AuthError>) {
        let mut slot = self.in_flight.lock();
        if self.sequence.load(Ordering::Acquire) != seq {
            tracing::debug!(seq, user_id = %user_id, "Discarding superseded profile result");
            return;
        }
        *slot = None;

        match &result {
            Ok(profile) => {
                tracing::debug!(seq, user_id = %user_id, role = ?profile.role, "Profile loaded");
            }
            Err(e) => tracing::warn!(seq, user_id = %user_id, error = %e, "Profile fetch failed"),
        }

        self.update(|state| {
            state.profile_fetch_in_progress = false;
            if state.user_id() != Some(user_id) {
                return;
            }
            match result {
                Ok(profile) => {
                    state.profile = Some(profile);
                    state.profile_fetch_error = None;
                }
                Err(e) => {
                    state.profile = None;
                    state.profile_fetch_error = Some(e.to_string());
                }
            }
        });
    }
}

/// Deliver identity events to the coordinator in arrival order.
async fn listen<I: IdentityProvider, P: ProfileStore>(
    inner: Weak<Inner<I, P>>,
    mut stop: watch::Receiver<bool>,
    mut events: AuthEvents,
) {
    loop {
        let change = tokio::select! {
            () = stopped(&mut stop) => break,
            change = events.recv() => match change {
                Some(change) => change,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_event(change);
    }
    tracing::debug!("Identity event listener finished");
}

/// Resolves once `stop` is set or its sender is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

async fn next_matching(
    states: &mut watch::Receiver<CoordinatorState>,
    mut predicate: impl FnMut(&CoordinatorState) -> bool,
) -> Option<CoordinatorState> {
    loop {
        {
            let state = states.borrow_and_update();
            if predicate(&state) {
                return Some(state.clone());
            }
        }
        if states.changed().await.is_err() {
            return None;
        }
    }
}
