//! The polling loop: keeps credentials fresh, resolves follows, queries both
//! providers, and reports channels that went live or offline.
//!
//! A single task owns the loop and multiplexes three inputs with
//! `tokio::select!`:
//!
//! - **Shutdown**: a `oneshot`; the loop exits before starting another cycle
//! - **Force check**: a capacity-1 `mpsc`; requests coalesce and never block
//!   the sender (see [`ForceCheck`])
//! - **Timer**: the poll interval, reset after every forced cycle so a forced
//!   check is not immediately followed by a timed one
//!
//! Each cycle runs with the shared [`PollerState`] locked, so the snapshot
//! service always sees either the previous or the next snapshot in full.
//! Listener callbacks run inside the cycle; a slow listener delays polling.
use crate::auth::{AuthError, CredentialKind, TokenManager, UserCredentialStatus};
use crate::follows::{FollowSet, FollowsError, FollowsResolver};
use crate::http::{RequestError, PROVIDER_TIMEOUT};
use crate::streams::{FollowedFeed, LiveDiff, LiveSet, PublicFeed, Snapshot, StreamRecord};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{Instant, Interval, MissedTickBehavior};

#[derive(Debug, Error)]
pub enum PollError {
    /// No App credential could be obtained; nothing can be queried.
    #[error("Failed to obtain app credential: {0}")]
    AppCredential(#[source] AuthError),

    #[error("Failed to refresh user credential: {0}")]
    UserCredential(#[source] AuthError),

    #[error("Failed to resolve user id: {0}")]
    UserId(#[source] AuthError),

    #[error("Failed to resolve follows: {0}")]
    Follows(#[from] FollowsError),
}

impl PollError {
    /// Fatal errors end the loop; the rest only abandon the current cycle.
    /// A missing login can never resolve by retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PollError::AppCredential(_) | PollError::UserId(AuthError::MissingUserName)
        )
    }
}

/// Result of one non-failing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The live set was replaced.
    Updated {
        went_live: usize,
        went_offline: usize,
        /// First completed cycle; it only sets the baseline.
        suppressed: bool,
    },
    /// No usable User credential; the followed contribution and live set are
    /// untouched and no callbacks fired.
    FollowsUnavailable,
}

/// A transition reported to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    Live(StreamRecord),
    Offline(StreamRecord),
}

/// Receives live/offline transitions. Called synchronously from the loop.
pub trait LiveListener: Send + Sync {
    fn on_live(&self, record: &StreamRecord);
    fn on_offline(&self, record: &StreamRecord);
}

impl LiveListener for mpsc::UnboundedSender<LiveEvent> {
    fn on_live(&self, record: &StreamRecord) {
        if self.send(LiveEvent::Live(record.clone())).is_err() {
            tracing::debug!(channel = %record.name(), "Live event dropped (receiver closed)");
        }
    }

    fn on_offline(&self, record: &StreamRecord) {
        if self.send(LiveEvent::Offline(record.clone())).is_err() {
            tracing::debug!(channel = %record.name(), "Offline event dropped (receiver closed)");
        }
    }
}

/// Handle for requesting an immediate cycle.
#[derive(Debug, Clone)]
pub struct ForceCheck {
    tx: mpsc::Sender<()>,
}

impl ForceCheck {
    /// Queues a forced cycle without waiting for it. Returns `false` only when
    /// the loop has stopped; a request made while one is already pending is
    /// folded into it.
    pub fn request(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(())) => {
                tracing::debug!("Force check already pending");
                true
            }
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }
}

/// Immutable loop settings.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    /// Login used to look up the user id when none is configured or cached.
    pub user_name: Option<String>,
    pub provider_timeout: Duration,
}

impl PollerConfig {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            user_name: None,
            provider_timeout: PROVIDER_TIMEOUT,
        }
    }
}

/// State shared between the loop and the snapshot service.
#[derive(Debug)]
pub struct PollerState {
    pub tokens: TokenManager,
    snapshot: Snapshot,
    live_set: LiveSet,
    has_completed_first_cycle: bool,
    follow_scope: Option<FollowSet>,
}

pub type SharedState = Arc<Mutex<PollerState>>;

impl PollerState {
    pub fn new(tokens: TokenManager, interval: Duration) -> Self {
        Self {
            tokens,
            snapshot: Snapshot::new(interval),
            live_set: LiveSet::default(),
            has_completed_first_cycle: false,
            follow_scope: None,
        }
    }

    pub fn shared(self) -> SharedState {
        Arc::new(Mutex::new(self))
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn live_set(&self) -> &LiveSet {
        &self.live_set
    }

    pub fn follow_scope(&self) -> Option<&FollowSet> {
        self.follow_scope.as_ref()
    }

    /// True once a cycle has merged the provider results, even if one of them
    /// failed and contributed its previous (possibly empty) list.
    pub fn is_ready(&self) -> bool {
        self.has_completed_first_cycle
    }
}

/// Why the loop woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Shutdown,
    Forced,
    Timer,
}

/// Timer plus wake-up priority of the loop. The first tick is one interval
/// out, and a forced wake-up pushes the next tick a full interval back.
struct Schedule {
    ticker: Interval,
}

impl Schedule {
    fn new(interval: Duration) -> Self {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { ticker }
    }

    async fn next(
        &mut self,
        shutdown: &mut oneshot::Receiver<()>,
        force_rx: &mut mpsc::Receiver<()>,
    ) -> Wake {
        tokio::select! {
            biased;

            _ = shutdown => Wake::Shutdown,

            Some(()) = force_rx.recv() => {
                self.ticker.reset();
                Wake::Forced
            }

            _ = self.ticker.tick() => Wake::Timer,
        }
    }
}

/// The three provider clients a cycle talks to.
#[derive(Debug, Clone)]
pub struct Providers {
    pub follows: FollowsResolver,
    pub followed: FollowedFeed,
    pub public: PublicFeed,
}

pub struct LiveSetPoller {
    state: SharedState,
    config: PollerConfig,
    providers: Providers,
    listener: Option<Arc<dyn LiveListener>>,
    force_rx: mpsc::Receiver<()>,
}

impl LiveSetPoller {
    /// Builds the poller and the [`ForceCheck`] handle that drives it.
    pub fn new(
        state: SharedState,
        config: PollerConfig,
        providers: Providers,
        listener: Option<Arc<dyn LiveListener>>,
    ) -> (Self, ForceCheck) {
        let (tx, force_rx) = mpsc::channel(1);
        let poller = Self {
            state,
            config,
            providers,
            listener,
            force_rx,
        };
        (poller, ForceCheck { tx })
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Runs an initial cycle, then loops until `shutdown` fires (or its
    /// sender is dropped). Returns the first fatal error.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> Result<(), PollError> {
        self.check(false).await?;

        let mut schedule = Schedule::new(self.config.interval);
        loop {
            let force = match schedule.next(&mut shutdown, &mut self.force_rx).await {
                Wake::Shutdown => {
                    tracing::info!("Poller received shutdown");
                    break;
                }
                Wake::Forced => {
                    tracing::info!("Force check requested");
                    true
                }
                Wake::Timer => false,
            };

            self.check(force).await?;
        }

        Ok(())
    }

    /// One cycle with non-fatal errors logged and absorbed.
    async fn check(&self, force: bool) -> Result<(), PollError> {
        match self.run_cycle(force).await {
            Ok(CycleOutcome::Updated {
                went_live,
                went_offline,
                suppressed,
            }) => {
                tracing::debug!(went_live, went_offline, suppressed, "Poll cycle complete");
                Ok(())
            }
            Ok(CycleOutcome::FollowsUnavailable) => {
                tracing::info!("Follows unavailable, waiting for authorization");
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                tracing::error!(error = %e, "Poll cycle failed fatally");
                Err(e)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Poll cycle abandoned");
                Ok(())
            }
        }
    }

    /// Runs one poll cycle under the shared lock.
    ///
    /// `force` re-resolves the follow scope even when one is held.
    pub async fn run_cycle(&self, force: bool) -> Result<CycleOutcome, PollError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let outcome = self.cycle(state, force).await;

        if let Err(e) = state.tokens.persist_if_changed() {
            tracing::warn!(error = %e, "Failed to persist credentials");
        }
        outcome
    }

    async fn cycle(&self, state: &mut PollerState, force: bool) -> Result<CycleOutcome, PollError> {
        let app_token = state
            .tokens
            .ensure_app_credential()
            .await
            .map_err(PollError::AppCredential)?
            .access_token
            .clone();

        match state.tokens.ensure_user_credential().await {
            Ok(UserCredentialStatus::ReauthorizationRequired) => {
                tracing::warn!("Dropping follow scope until the user authorizes again");
                state.follow_scope = None;
            }
            Ok(_) => {}
            Err(e) => return Err(PollError::UserCredential(e)),
        }

        if state.follow_scope.is_none() || force {
            self.refresh_follow_scope(state).await?;
        }

        let Some(scope) = state.follow_scope.as_ref() else {
            // Public contribution still refreshes while unauthorized.
            match self.bounded(self.providers.public.live_streams()).await {
                Ok(public) => {
                    state.snapshot.public = public;
                    state.snapshot.last_fetched = Utc::now();
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Public feed unavailable, keeping previous list")
                }
            }
            return Ok(CycleOutcome::FollowsUnavailable);
        };

        let (followed, public) = tokio::join!(
            self.bounded(self.providers.followed.live_streams(&app_token, scope)),
            self.bounded(self.providers.public.live_streams()),
        );

        match followed {
            Ok(streams) => state.snapshot.followed = streams,
            Err(e) => {
                if e.is_unauthorized() {
                    state.tokens.invalidate(CredentialKind::App);
                }
                tracing::warn!(error = %e, "Followed feed unavailable, keeping previous list");
            }
        }
        match public {
            Ok(streams) => state.snapshot.public = streams,
            Err(e) => {
                tracing::warn!(error = %e, "Public feed unavailable, keeping previous list");
            }
        }
        state.snapshot.last_fetched = Utc::now();
        state.snapshot.refresh_interval = self.config.interval;

        let live_set = LiveSet::from_snapshot(&state.snapshot);
        let suppressed = !state.has_completed_first_cycle;
        let diff = if suppressed {
            LiveDiff::default()
        } else {
            state.live_set.diff(&live_set)
        };
        self.notify(&diff);

        state.live_set = live_set;
        state.has_completed_first_cycle = true;

        Ok(CycleOutcome::Updated {
            went_live: diff.went_live.len(),
            went_offline: diff.went_offline.len(),
            suppressed,
        })
    }

    /// Re-resolves the follow scope. Leaves it `None` when no usable User
    /// credential exists.
    async fn refresh_follow_scope(&self, state: &mut PollerState) -> Result<(), PollError> {
        let Some(user) = state.tokens.user_credential().cloned() else {
            state.follow_scope = None;
            return Ok(());
        };

        let user_id = state
            .tokens
            .ensure_user_id(self.config.user_name.as_deref())
            .await
            .map_err(PollError::UserId)?
            .to_string();

        match self.providers.follows.resolve(&user_id, &user).await {
            Ok(scope) => {
                tracing::info!(follows = scope.len(), "Follow scope refreshed");
                state.follow_scope = Some(scope);
                Ok(())
            }
            Err(e) if e.is_unauthorized() => {
                tracing::warn!("User credential rejected while resolving follows");
                state.tokens.invalidate(CredentialKind::User);
                state.follow_scope = None;
                Ok(())
            }
            Err(e) => Err(PollError::Follows(e)),
        }
    }

    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, RequestError>>,
    ) -> Result<T, RequestError> {
        let timeout = self.config.provider_timeout;
        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| RequestError::Timeout(timeout))?
    }

    fn notify(&self, diff: &LiveDiff) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };
        for record in &diff.went_live {
            tracing::info!(
                channel = %record.name(),
                service = %record.service(),
                "Channel went live"
            );
            listener.on_live(record);
        }
        for record in &diff.went_offline {
            tracing::info!(
                channel = %record.name(),
                service = %record.service(),
                "Channel went offline"
            );
            listener.on_offline(record);
        }
    }
}
