use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use super::*;
use crate::error::BoxError;
use crate::types::{AuthChangeEvent, AuthStateChange, Profile, Session, SessionUser, UserId};

fn session_for(user: &str) -> Session {
    Session::new(format!("token-{user}"), SessionUser::new(user))
}

#[derive(Default)]
struct FakeIdentity {
    restored: Mutex<Option<Session>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<AuthStateChange>>>,
    /// Emit `INITIAL_SESSION` from inside `get_session`.
    initial_on_restore: bool,
    /// Emit `INITIAL_SESSION` as soon as someone subscribes.
    initial_on_subscribe: bool,
    sign_out_fails: bool,
    /// `get_session` fails as if the persisted session were unreadable.
    restore_fails: bool,
    sign_outs: AtomicUsize,
}

impl FakeIdentity {
    fn restoring(user: &str) -> Self {
        Self {
            restored: Mutex::new(Some(session_for(user))),
            initial_on_restore: true,
            ..Self::default()
        }
    }

    /// Restores `user` without announcing it.
    fn restoring_quietly(user: &str) -> Self {
        Self {
            restored: Mutex::new(Some(session_for(user))),
            ..Self::default()
        }
    }

    fn emit(&self, event: AuthChangeEvent, session: Option<Session>) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(AuthStateChange::new(event, session.clone())).is_ok());
    }
}

impl IdentityProvider for FakeIdentity {
    async fn sign_in_with_password(&self, _email: &str, password: &str) -> Result<Session, BoxError> {
        if password != "pw" {
            return Err("Invalid login credentials".into());
        }
        let session = session_for("u1");
        self.emit(AuthChangeEvent::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), BoxError> {
        self.sign_outs.fetch_add(1, Ordering::SeqCst);
        if self.sign_out_fails {
            return Err("network unreachable".into());
        }
        self.emit(AuthChangeEvent::SignedOut, None);
        Ok(())
    }

    async fn get_session(&self) -> Result<Option<Session>, BoxError> {
        if self.restore_fails {
            return Err("storage corrupt".into());
        }
        let session = self.restored.lock().clone();
        if self.initial_on_restore {
            self.emit(AuthChangeEvent::InitialSession, session.clone());
        }
        Ok(session)
    }

    fn subscribe(&self) -> AuthEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.initial_on_subscribe {
            let session = self.restored.lock().clone();
            let _ = tx.send(AuthStateChange::new(AuthChangeEvent::InitialSession, session));
        }
        self.subscribers.lock().push(tx);
        rx
    }
}

type Reply = Result<Profile, String>;

enum Scripted {
    Now(Reply),
    Later(oneshot::Receiver<Reply>),
    Never,
}

/// Answers lookups from a script; an empty script yields a client profile.
#[derive(Default)]
struct FakeProfiles {
    calls: AtomicUsize,
    script: Mutex<VecDeque<Scripted>>,
}

impl FakeProfiles {
    fn push(&self, reply: Scripted) {
        self.script.lock().push_back(reply);
    }

    fn later(&self) -> oneshot::Sender<Reply> {
        let (tx, rx) = oneshot::channel();
        self.push(Scripted::Later(rx));
        tx
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ProfileStore for FakeProfiles {
    async fn fetch_profile_by_id(&self, id: &UserId) -> Result<Profile, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front();
        let reply = match next {
            None => Ok(Profile::new(id.clone())
                .with_role("client")
                .with_needs_password_change(false)),
            Some(Scripted::Now(reply)) => reply,
            Some(Scripted::Later(rx)) => rx.await.unwrap_or_else(|_| Err("reply dropped".into())),
            Some(Scripted::Never) => std::future::pending().await,
        };
        reply.map_err(Into::into)
    }
}

type TestCoordinator = SessionCoordinator<Arc<FakeIdentity>, Arc<FakeProfiles>>;

fn start(identity: FakeIdentity) -> (TestCoordinator, Arc<FakeIdentity>, Arc<FakeProfiles>) {
    start_with(identity, FakeProfiles::default(), CoordinatorConfig::new())
}

fn start_with(
    identity: FakeIdentity,
    profiles: FakeProfiles,
    config: CoordinatorConfig,
) -> (TestCoordinator, Arc<FakeIdentity>, Arc<FakeProfiles>) {
    let identity = Arc::new(identity);
    let profiles = Arc::new(profiles);
    let coordinator = SessionCoordinator::start(identity.clone(), profiles.clone(), config);
    (coordinator, identity, profiles)
}

async fn settle(
    coordinator: &TestCoordinator,
    predicate: impl FnMut(&CoordinatorState) -> bool,
) -> CoordinatorState {
    tokio::time::timeout(Duration::from_secs(2), coordinator.wait_for(predicate))
        .await
        .expect("state did not settle")
        .expect("coordinator stopped")
}

/// Let every ready task run to its next suspension point.
async fn quiesce() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

fn profile_role(state: &CoordinatorState) -> Option<&str> {
    state.profile.as_ref().and_then(|p| p.role.as_deref())
}

#[tokio::test]
async fn sign_in_end_to_end() {
    let (coordinator, _identity, profiles) = start(FakeIdentity::default());

    let booted = settle(&coordinator, |s| !s.session_bootstrapping).await;
    assert_eq!(booted.phase(), Phase::SignedOut);
    assert!(booted.profile.is_none());

    coordinator.sign_in("a@b.com", "pw").await.unwrap();
    let state = settle(&coordinator, |s| s.profile.is_some()).await;

    assert_eq!(state.user_id().map(UserId::as_str), Some("u1"));
    assert_eq!(profile_role(&state), Some("client"));
    assert!(!state.profile.as_ref().unwrap().must_change_password());
    assert!(state.profile_fetch_error.is_none());
    assert!(!state.profile_fetch_in_progress);
    assert_eq!(state.phase(), Phase::SignedInWithProfile);
    assert_eq!(profiles.calls(), 1);
}

#[tokio::test]
async fn sign_in_failure_leaves_state_untouched() {
    let (coordinator, _identity, profiles) = start(FakeIdentity::default());
    settle(&coordinator, |s| !s.session_bootstrapping).await;
    let before = coordinator.state();

    let err = coordinator.sign_in("a@b.com", "wrong").await.unwrap_err();
    quiesce().await;

    assert_eq!(
        err,
        AuthError::Authentication("Invalid login credentials".into())
    );
    assert_eq!(coordinator.state(), before);
    assert_eq!(profiles.calls(), 0);
}

#[tokio::test]
async fn concurrent_refreshes_share_one_lookup() {
    let (coordinator, _identity, profiles) = start(FakeIdentity::restoring("u1"));
    settle(&coordinator, |s| s.profile.is_some()).await;
    assert_eq!(profiles.calls(), 1);

    let reply = profiles.later();
    let first = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.refresh_profile().await }
    });
    let second = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.refresh_profile().await }
    });
    quiesce().await;
    assert_eq!(profiles.calls(), 2);
    assert!(coordinator.state().profile_fetch_in_progress);

    reply.send(Ok(Profile::new("u1").with_role("admin"))).unwrap();
    first.await.unwrap();
    second.await.unwrap();

    let state = coordinator.state();
    assert_eq!(profiles.calls(), 2);
    assert!(state.profile.as_ref().unwrap().is_admin());
    assert!(!state.profile_fetch_in_progress);
}

#[tokio::test]
async fn restore_and_initial_event_fetch_once() {
    let (coordinator, _identity, profiles) = start(FakeIdentity::restoring("u1"));

    let state = settle(&coordinator, |s| s.profile.is_some()).await;
    quiesce().await;

    assert!(!state.session_bootstrapping);
    assert_eq!(profiles.calls(), 1);
}

#[tokio::test]
async fn restore_joins_slow_fetch_started_by_initial_event() {
    let profiles = FakeProfiles::default();
    let reply = profiles.later();
    let identity = FakeIdentity {
        initial_on_subscribe: true,
        ..FakeIdentity::restoring("u1")
    };
    let (coordinator, _identity, profiles) =
        start_with(identity, profiles, CoordinatorConfig::new());

    settle(&coordinator, |s| {
        !s.session_bootstrapping && s.profile_fetch_in_progress
    })
    .await;
    quiesce().await;
    assert_eq!(profiles.calls(), 1);

    reply.send(Ok(Profile::new("u1"))).unwrap();
    settle(&coordinator, |s| s.profile.is_some()).await;
    quiesce().await;
    assert_eq!(profiles.calls(), 1);
}

#[tokio::test]
async fn superseded_result_is_discarded() {
    let profiles = FakeProfiles::default();
    let first = profiles.later();
    let second = profiles.later();
    let (coordinator, identity, profiles) =
        start_with(FakeIdentity::restoring("u1"), profiles, CoordinatorConfig::new());
    settle(&coordinator, |s| s.profile_fetch_in_progress).await;

    identity.emit(AuthChangeEvent::SignedIn, Some(session_for("u1")));
    quiesce().await;
    assert_eq!(profiles.calls(), 2);

    second.send(Ok(Profile::new("u1").with_role("admin"))).unwrap();
    settle(&coordinator, |s| s.profile.is_some()).await;

    first.send(Ok(Profile::new("u1").with_role("client"))).unwrap();
    quiesce().await;

    let state = coordinator.state();
    assert_eq!(profile_role(&state), Some("admin"));
    assert!(!state.profile_fetch_in_progress);
    assert!(state.profile_fetch_error.is_none());
}

#[tokio::test]
async fn superseded_failure_is_discarded() {
    let profiles = FakeProfiles::default();
    let first = profiles.later();
    let (coordinator, identity, _profiles) =
        start_with(FakeIdentity::restoring("u1"), profiles, CoordinatorConfig::new());
    settle(&coordinator, |s| s.profile_fetch_in_progress).await;

    identity.emit(AuthChangeEvent::SignedIn, Some(session_for("u1")));
    settle(&coordinator, |s| s.profile.is_some()).await;

    first.send(Err("connection reset".into())).unwrap();
    quiesce().await;

    let state = coordinator.state();
    assert!(state.profile.is_some());
    assert!(state.profile_fetch_error.is_none());
}

#[tokio::test]
async fn sign_out_invalidates_in_flight_fetch() {
    let profiles = FakeProfiles::default();
    let reply = profiles.later();
    let identity = FakeIdentity {
        sign_out_fails: true,
        ..FakeIdentity::restoring_quietly("u1")
    };
    let (coordinator, _identity, _profiles) =
        start_with(identity, profiles, CoordinatorConfig::new());
    settle(&coordinator, |s| s.profile_fetch_in_progress).await;

    coordinator.sign_out().await;
    let state = coordinator.state();
    assert!(state.session.is_none());
    assert!(!state.profile_fetch_in_progress);

    reply.send(Ok(Profile::new("u1"))).unwrap();
    quiesce().await;

    let state = coordinator.state();
    assert!(state.session.is_none());
    assert!(state.profile.is_none());
    assert_eq!(state.phase(), Phase::SignedOut);
}

#[tokio::test]
async fn signed_out_event_clears_profile() {
    let (coordinator, identity, _profiles) = start(FakeIdentity::restoring("u1"));
    settle(&coordinator, |s| s.profile.is_some()).await;

    identity.emit(AuthChangeEvent::SignedOut, None);
    let state = settle(&coordinator, |s| s.session.is_none()).await;

    assert!(state.profile.is_none());
    assert!(state.profile_fetch_error.is_none());
    assert!(!state.profile_fetch_in_progress);
}

#[tokio::test]
async fn user_updated_never_fetches() {
    let (coordinator, identity, profiles) = start(FakeIdentity::restoring("u1"));
    let before = settle(&coordinator, |s| s.profile.is_some()).await;

    identity.emit(AuthChangeEvent::UserUpdated, Some(session_for("u1")));
    quiesce().await;

    let after = coordinator.state();
    assert_eq!(profiles.calls(), 1);
    assert_eq!(after.profile, before.profile);
    assert!(!after.profile_fetch_in_progress);
}

#[tokio::test]
async fn user_updated_for_new_user_leaves_retryable_error() {
    let profiles = FakeProfiles::default();
    let reply = profiles.later();
    let (coordinator, identity, profiles) =
        start_with(FakeIdentity::restoring("u1"), profiles, CoordinatorConfig::new());
    settle(&coordinator, |s| s.profile_fetch_in_progress).await;

    identity.emit(AuthChangeEvent::UserUpdated, Some(session_for("u2")));
    let state = settle(&coordinator, |s| s.profile_fetch_error.is_some()).await;

    assert_eq!(state.user_id().map(UserId::as_str), Some("u2"));
    assert!(state.profile.is_none());
    assert!(!state.profile_fetch_in_progress);
    assert_eq!(profiles.calls(), 1);

    // The old user's lookup lands late and is dropped.
    let _ = reply.send(Ok(Profile::new("u1")));
    quiesce().await;
    assert!(coordinator.state().profile.is_none());

    coordinator.refresh_profile().await;
    let state = coordinator.state();
    assert_eq!(profiles.calls(), 2);
    assert_eq!(state.profile.as_ref().map(|p| p.id.as_str()), Some("u2"));
    assert!(state.profile_fetch_error.is_none());
}

#[tokio::test]
async fn token_refresh_joins_running_fetch() {
    let profiles = FakeProfiles::default();
    let reply = profiles.later();
    let (coordinator, identity, profiles) =
        start_with(FakeIdentity::restoring("u1"), profiles, CoordinatorConfig::new());
    settle(&coordinator, |s| s.profile_fetch_in_progress).await;

    identity.emit(AuthChangeEvent::TokenRefreshed, Some(session_for("u1")));
    quiesce().await;
    assert_eq!(profiles.calls(), 1);

    reply.send(Ok(Profile::new("u1"))).unwrap();
    settle(&coordinator, |s| s.profile.is_some()).await;
}

#[tokio::test]
async fn switching_user_never_exposes_previous_profile() {
    let (coordinator, identity, _profiles) = start(FakeIdentity::restoring("u1"));
    settle(&coordinator, |s| s.profile.is_some()).await;
    let mut states = coordinator.subscribe();

    identity.emit(AuthChangeEvent::SignedIn, Some(session_for("u2")));
    loop {
        states.changed().await.unwrap();
        let state = states.borrow_and_update().clone();
        if let (Some(user), Some(profile)) = (state.user_id(), state.profile.as_ref()) {
            assert_eq!(user, &profile.id);
            if user.as_str() == "u2" {
                break;
            }
        }
    }
}

#[tokio::test(start_paused = true)]
async fn hung_lookup_times_out() {
    let profiles = FakeProfiles::default();
    profiles.push(Scripted::Never);
    let config = CoordinatorConfig::new().with_profile_timeout(Duration::from_millis(8000));
    let (coordinator, _identity, _profiles) =
        start_with(FakeIdentity::restoring("u1"), profiles, config);
    let started = tokio::time::Instant::now();

    let state = coordinator
        .wait_for(|s| s.profile_fetch_error.is_some())
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(8000));
    assert_eq!(
        state.profile_fetch_error.as_deref(),
        Some("Profile fetch timed out after 8000ms")
    );
    assert!(!state.profile_fetch_in_progress);
    assert!(state.session.is_some());
    assert_eq!(state.phase(), Phase::SignedInNoProfile);
}

#[tokio::test]
async fn refresh_recovers_after_failure() {
    let profiles = FakeProfiles::default();
    profiles.push(Scripted::Now(Err("relation \"profiles\" does not exist".into())));
    let (coordinator, _identity, profiles) = start_with(
        FakeIdentity::restoring_quietly("u1"),
        profiles,
        CoordinatorConfig::new(),
    );

    let failed = settle(&coordinator, |s| s.profile_fetch_error.is_some()).await;
    assert!(failed.profile_fetch_error.unwrap().starts_with("Profile fetch failed"));

    coordinator.refresh_profile().await;

    let state = coordinator.state();
    assert_eq!(profiles.calls(), 2);
    assert!(state.profile.is_some());
    assert!(state.profile_fetch_error.is_none());
}

#[tokio::test]
async fn refresh_without_session_is_noop() {
    let (coordinator, _identity, profiles) = start(FakeIdentity::default());
    settle(&coordinator, |s| !s.session_bootstrapping).await;

    coordinator.refresh_profile().await;

    assert_eq!(profiles.calls(), 0);
    assert_eq!(coordinator.state().phase(), Phase::SignedOut);
}

#[tokio::test]
async fn mismatched_profile_is_an_error() {
    let profiles = FakeProfiles::default();
    profiles.push(Scripted::Now(Ok(Profile::new("someone-else"))));
    let (coordinator, _identity, _profiles) =
        start_with(FakeIdentity::restoring("u1"), profiles, CoordinatorConfig::new());

    let state = settle(&coordinator, |s| s.profile_fetch_error.is_some()).await;
    assert!(state.profile.is_none());
}

#[tokio::test]
async fn stopped_coordinator_ignores_late_results() {
    let profiles = FakeProfiles::default();
    let reply = profiles.later();
    let (coordinator, identity, _profiles) = start_with(
        FakeIdentity::restoring_quietly("u1"),
        profiles,
        CoordinatorConfig::new(),
    );
    let frozen = settle(&coordinator, |s| s.profile_fetch_in_progress).await;

    coordinator.stop();
    let _ = reply.send(Ok(Profile::new("u1")));
    identity.emit(AuthChangeEvent::SignedOut, None);
    quiesce().await;

    assert!(coordinator.is_stopped());
    assert_eq!(coordinator.state(), frozen);
    assert_eq!(
        coordinator.sign_in("a@b.com", "pw").await,
        Err(AuthError::Stopped)
    );
    assert_eq!(
        coordinator.wait_for(|_| true).await,
        Err(AuthError::Stopped)
    );
}

#[tokio::test]
async fn failed_restore_still_finishes_boot() {
    let identity = FakeIdentity {
        restore_fails: true,
        ..FakeIdentity::restoring_quietly("u1")
    };
    let (coordinator, _identity, profiles) = start(identity);

    let state = settle(&coordinator, |s| !s.session_bootstrapping).await;
    quiesce().await;

    assert_eq!(state.phase(), Phase::SignedOut);
    assert!(state.session.is_none());
    assert!(state.profile_fetch_error.is_none());
    assert_eq!(profiles.calls(), 0);

    coordinator.sign_in("a@b.com", "pw").await.unwrap();
    settle(&coordinator, |s| s.profile.is_some()).await;
}

#[tokio::test]
async fn sign_out_after_stop_is_a_noop() {
    let (coordinator, identity, _profiles) = start(FakeIdentity::restoring_quietly("u1"));
    let frozen = settle(&coordinator, |s| s.profile.is_some()).await;

    coordinator.stop();
    coordinator.sign_out().await;

    assert_eq!(identity.sign_outs.load(Ordering::SeqCst), 0);
    assert_eq!(coordinator.state(), frozen);
}
