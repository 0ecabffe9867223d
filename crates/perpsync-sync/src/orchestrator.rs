//! Per-scope refresh driver.
//!
//! Every opened scope gets one driver task that owns its refresh protocol:
//!
//! ```text
//! Idle -> Initializing -> Ready -> Refreshing -> Ready ...
//!                 \-> Failed (no prior data)     Ready <-> Suspended
//! ```
//!
//! Poll ticks, matching invalidations and explicit requests all become
//! triggers. Triggers that queue up while a cycle runs are folded into a
//! single follow-up cycle, so cycles of one scope never overlap. Consumers
//! observe the scope through a `watch` channel carrying a [`ScopeView`].
//!
//! Cancellation (handle dropped or shut down) stops the driver at its next
//! await point. A refresh in flight at that moment is abandoned by this scope
//! only: the shared single flight keeps running for any other waiter, and
//! its result is never published here.

use crate::engine::{RefreshMode, SyncEngine};
use crate::events::InvalidationEvent;
use crate::resource::Resource;
use chrono::{DateTime, Utc};
use perpsync_cache::{Cached, Freshness};
use perpsync_core::{CacheKey, SyncError, SyncResult};
use perpsync_telemetry::Metrics;
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

// ============================================================================
// ScopePhase
// ============================================================================

/// Lifecycle phase of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopePhase {
    Idle,
    /// First load in progress; nothing has been exposed yet.
    Initializing,
    Ready,
    Refreshing,
    /// Hidden; periodic refresh paused.
    Suspended,
    /// First load failed with nothing to fall back to.
    Failed,
}

impl ScopePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Refreshing => "refreshing",
            Self::Suspended => "suspended",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ScopePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ScopeView
// ============================================================================

/// Whether a scope has ever produced data.
///
/// `NotLoaded` is distinct from a loaded empty snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadState<T> {
    NotLoaded,
    Loaded {
        value: T,
        fetched_at: DateTime<Utc>,
        freshness: Freshness,
    },
}

impl<T> LoadState<T> {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded { .. })
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Loaded { value, .. } => Some(value),
            Self::NotLoaded => None,
        }
    }

    pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Loaded { fetched_at, .. } => Some(*fetched_at),
            Self::NotLoaded => None,
        }
    }
}

/// What consumers of a scope see.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeView<T> {
    pub phase: ScopePhase,
    pub data: LoadState<T>,
    /// Last refresh failure. Advisory while `data` is loaded; the hard
    /// `NotInitialized` error in [`ScopePhase::Failed`].
    pub error: Option<SyncError>,
    /// Fetch time of the data being shown, set once a refresh failed after it.
    pub stale_since: Option<DateTime<Utc>>,
    /// Completed refresh cycles, successful or not.
    pub cycles: u64,
}

impl<T> ScopeView<T> {
    fn initial() -> Self {
        Self {
            phase: ScopePhase::Idle,
            data: LoadState::NotLoaded,
            error: None,
            stale_since: None,
            cycles: 0,
        }
    }

    pub fn value(&self) -> Option<&T> {
        self.data.value()
    }

    pub fn is_loaded(&self) -> bool {
        self.data.is_loaded()
    }

    pub fn is_stale(&self) -> bool {
        matches!(
            self.data,
            LoadState::Loaded {
                freshness: Freshness::Stale,
                ..
            }
        )
    }
}

// ============================================================================
// ScopeHandle
// ============================================================================

/// Explicit refresh request; `done` receives the view after the cycle.
struct RefreshRequest<T> {
    done: Option<oneshot::Sender<ScopeView<T>>>,
}

/// Handle to an open scope. Dropping it closes the scope.
pub struct ScopeHandle<R: Resource> {
    scope: R,
    key: CacheKey,
    requests: mpsc::Sender<RefreshRequest<R::Snapshot>>,
    visible: watch::Sender<bool>,
    view: watch::Receiver<ScopeView<R::Snapshot>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<R: Resource> ScopeHandle<R> {
    pub fn scope(&self) -> &R {
        &self.scope
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Ask for a forced refresh. Requests arriving while one is queued are
    /// folded into it.
    pub fn refresh(&self) {
        match self.requests.try_send(RefreshRequest { done: None }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!(scope = %self.key, "Refresh already queued");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(scope = %self.key, "Refresh requested on closed scope");
            }
        }
    }

    /// Force a refresh and wait for the cycle that served it.
    pub async fn refresh_now(&self) -> SyncResult<ScopeView<R::Snapshot>> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(RefreshRequest { done: Some(tx) })
            .await
            .map_err(|_| SyncError::Cancelled)?;
        rx.await.map_err(|_| SyncError::Cancelled)
    }

    /// Pause periodic refresh (view hidden).
    pub fn suspend(&self) {
        self.visible.send_replace(false);
    }

    /// Resume periodic refresh; refreshes immediately.
    pub fn resume(&self) {
        self.visible.send_replace(true);
    }

    pub fn view(&self) -> ScopeView<R::Snapshot> {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ScopeView<R::Snapshot>> {
        self.view.clone()
    }

    /// Wait for the next published view.
    pub async fn changed(&mut self) -> SyncResult<ScopeView<R::Snapshot>> {
        self.view.changed().await.map_err(|_| SyncError::Cancelled)?;
        Ok(self.view.borrow_and_update().clone())
    }

    /// Wait until the view satisfies `predicate` (checked immediately first).
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&ScopeView<R::Snapshot>) -> bool,
    ) -> SyncResult<ScopeView<R::Snapshot>> {
        loop {
            {
                let view = self.view.borrow_and_update();
                if predicate(&view) {
                    return Ok(view.clone());
                }
            }
            self.view.changed().await.map_err(|_| SyncError::Cancelled)?;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Close the scope and wait for its driver to stop.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(scope = %self.key, error = %e, "Scope driver ended abnormally");
            }
        }
    }
}

impl<R: Resource> Drop for ScopeHandle<R> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<R: Resource> fmt::Debug for ScopeHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeHandle")
            .field("key", &self.key)
            .field("phase", &self.view.borrow().phase)
            .field("closed", &self.cancel.is_cancelled())
            .finish()
    }
}

// ============================================================================
// SyncOrchestrator
// ============================================================================

/// Opens scopes on a [`SyncEngine`].
#[derive(Debug, Clone)]
pub struct SyncOrchestrator {
    engine: SyncEngine,
    shutdown: CancellationToken,
}

impl SyncOrchestrator {
    pub fn new(engine: SyncEngine) -> Self {
        Self {
            engine,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    /// Open `scope` with the engine's poll interval for its kind.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open<R: Resource>(&self, scope: R) -> ScopeHandle<R> {
        let interval = self.engine.config().scope(R::KIND).poll_interval;
        self.open_with_interval(scope, interval)
    }

    pub fn open_with_interval<R: Resource>(&self, scope: R, poll_interval: Duration) -> ScopeHandle<R> {
        let key = self.engine.key(&scope);
        let (requests_tx, requests_rx) = mpsc::channel(self.engine.config().command_buffer);
        let (visible_tx, visible_rx) = watch::channel(true);
        let (view_tx, view_rx) = watch::channel(ScopeView::initial());
        let cancel = self.shutdown.child_token();

        let driver = ScopeDriver {
            engine: self.engine.clone(),
            scope: scope.clone(),
            key: key.clone(),
            poll_interval,
            requests: requests_rx,
            visible: visible_rx,
            invalidations: self.engine.subscribe_invalidations(),
            view: view_tx,
            cancel: cancel.clone(),
            phase: ScopePhase::Idle,
            dirty: false,
        };
        Metrics::scope_transition(R::KIND.as_str(), None, Some(ScopePhase::Idle.as_str()));
        let task = tokio::spawn(driver.run());

        ScopeHandle {
            scope,
            key,
            requests: requests_tx,
            visible: visible_tx,
            view: view_rx,
            cancel,
            task: Some(task),
        }
    }

    /// Close every scope opened through this orchestrator.
    pub fn shutdown(&self) {
        info!("Closing all scopes");
        self.shutdown.cancel();
    }
}

// ============================================================================
// ScopeDriver
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Poll,
    Invalidated,
    Requested,
    Resumed,
}

enum Wake<T> {
    Closed,
    Visibility(bool),
    Request(RefreshRequest<T>),
    Invalidation(Result<InvalidationEvent, RecvError>),
    Tick,
}

struct ScopeDriver<R: Resource> {
    engine: SyncEngine,
    scope: R,
    key: CacheKey,
    poll_interval: Duration,
    requests: mpsc::Receiver<RefreshRequest<R::Snapshot>>,
    visible: watch::Receiver<bool>,
    invalidations: broadcast::Receiver<InvalidationEvent>,
    view: watch::Sender<ScopeView<R::Snapshot>>,
    cancel: CancellationToken,
    phase: ScopePhase,
    /// An invalidation arrived while suspended.
    dirty: bool,
}

impl<R: Resource> ScopeDriver<R> {
    async fn run(mut self) {
        info!(scope = %self.key, poll_ms = self.poll_interval.as_millis() as u64, "Scope opened");

        let mut waiters = Vec::new();
        if self.cycle(RefreshMode::IfStale, &mut waiters).await {
            let mut ticker =
                tokio::time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            while let Some(trigger) = self.next_trigger(&mut ticker, &mut waiters).await {
                let forced = self.drain_pending(&mut waiters);
                let mode = match trigger {
                    Trigger::Poll if !forced => RefreshMode::IfStale,
                    Trigger::Resumed if !forced && !self.dirty => RefreshMode::IfStale,
                    _ => RefreshMode::Force,
                };
                trace!(scope = %self.key, ?trigger, ?mode, "Refresh triggered");
                self.dirty = false;
                if !self.cycle(mode, &mut waiters).await {
                    break;
                }
                ticker.reset();
            }
        }

        Metrics::scope_transition(R::KIND.as_str(), Some(self.phase.as_str()), None);
        info!(scope = %self.key, "Scope closed");
    }

    /// Wait for the next trigger; `None` when the scope is closed.
    async fn next_trigger(
        &mut self,
        ticker: &mut tokio::time::Interval,
        waiters: &mut Vec<oneshot::Sender<ScopeView<R::Snapshot>>>,
    ) -> Option<Trigger> {
        loop {
            let suspended = self.phase == ScopePhase::Suspended;
            let wake = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Wake::Closed,
                changed = self.visible.changed() => match changed {
                    Ok(()) => Wake::Visibility(*self.visible.borrow_and_update()),
                    Err(_) => Wake::Closed,
                },
                request = self.requests.recv() => match request {
                    Some(request) => Wake::Request(request),
                    None => Wake::Closed,
                },
                event = self.invalidations.recv() => Wake::Invalidation(event),
                _ = ticker.tick(), if !suspended => Wake::Tick,
            };

            match wake {
                Wake::Closed => return None,
                Wake::Visibility(false) => {
                    if matches!(self.phase, ScopePhase::Ready | ScopePhase::Failed) {
                        debug!(scope = %self.key, "Scope suspended");
                        self.publish(ScopePhase::Suspended, |_| {});
                    }
                }
                Wake::Visibility(true) => {
                    if suspended {
                        debug!(scope = %self.key, dirty = self.dirty, "Scope resumed");
                        return Some(Trigger::Resumed);
                    }
                }
                Wake::Request(request) => {
                    waiters.extend(request.done);
                    return Some(Trigger::Requested);
                }
                Wake::Invalidation(Ok(event)) => {
                    if !event.matches(&self.key) {
                        continue;
                    }
                    debug!(scope = %self.key, reason = %event.reason, "Invalidated");
                    if suspended {
                        self.dirty = true;
                    } else {
                        return Some(Trigger::Invalidated);
                    }
                }
                Wake::Invalidation(Err(RecvError::Lagged(missed))) => {
                    warn!(scope = %self.key, missed, "Invalidations lagged, refreshing");
                    if suspended {
                        self.dirty = true;
                    } else {
                        return Some(Trigger::Invalidated);
                    }
                }
                Wake::Invalidation(Err(RecvError::Closed)) => return None,
                Wake::Tick => return Some(Trigger::Poll),
            }
        }
    }

    /// Fold every queued trigger into the upcoming cycle. Returns whether any
    /// of them forces a remote read.
    fn drain_pending(&mut self, waiters: &mut Vec<oneshot::Sender<ScopeView<R::Snapshot>>>) -> bool {
        let mut forced = false;
        while let Ok(request) = self.requests.try_recv() {
            waiters.extend(request.done);
            forced = true;
        }
        loop {
            match self.invalidations.try_recv() {
                Ok(event) => forced |= event.matches(&self.key),
                Err(TryRecvError::Lagged(_)) => forced = true,
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        forced
    }

    /// Run one refresh cycle and publish its outcome. Returns `false` when
    /// the scope was closed meanwhile; nothing is published in that case.
    async fn cycle(
        &mut self,
        mode: RefreshMode,
        waiters: &mut Vec<oneshot::Sender<ScopeView<R::Snapshot>>>,
    ) -> bool {
        let was_suspended = self.phase == ScopePhase::Suspended;
        let running = if self.view.borrow().is_loaded() {
            ScopePhase::Refreshing
        } else {
            ScopePhase::Initializing
        };
        self.publish(running, |_| {});

        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!(scope = %self.key, "Discarding refresh of closed scope");
                return false;
            }
            outcome = self.engine.refresh(&self.scope, mode) => outcome,
        };
        Metrics::refresh_duration(
            R::KIND.as_str(),
            outcome.is_ok(),
            started.elapsed().as_secs_f64() * 1000.0,
        );

        let settled = if was_suspended && !*self.visible.borrow() {
            ScopePhase::Suspended
        } else {
            ScopePhase::Ready
        };
        match outcome {
            Ok(cached) => self.apply_success(cached, settled),
            Err(e) => self.apply_failure(e, settled),
        }

        let view = self.view.borrow().clone();
        for waiter in waiters.drain(..) {
            let _ = waiter.send(view.clone());
        }
        true
    }

    fn apply_success(&mut self, cached: Cached<R::Snapshot>, settled: ScopePhase) {
        debug!(
            scope = %self.key,
            fetched_at = %cached.fetched_at,
            freshness = cached.state.as_str(),
            "Refresh succeeded"
        );
        self.publish(settled, |view| {
            view.stale_since = (cached.state == Freshness::Stale).then_some(cached.fetched_at);
            view.data = LoadState::Loaded {
                value: cached.value,
                fetched_at: cached.fetched_at,
                freshness: cached.state,
            };
            view.error = None;
            view.cycles += 1;
        });
    }

    fn apply_failure(&mut self, error: SyncError, settled: ScopePhase) {
        let policy = self.engine.config().scope(R::KIND).cache;
        let now = self.engine.clock().now();
        let shown_at = self.view.borrow().data.fetched_at();
        // Past the stale threshold the snapshot is no longer servable.
        let servable_at = shown_at.filter(|at| {
            let age = (now - *at).to_std().unwrap_or(Duration::ZERO);
            policy.classify(age).is_some()
        });
        // Another consumer of the key may hold newer data than this scope.
        let fallback = self
            .engine
            .cached(&self.scope)
            .filter(|c| servable_at.map_or(true, |at| c.fetched_at > at));

        match (servable_at, fallback) {
            (_, Some(cached)) => {
                warn!(
                    scope = %self.key,
                    error = %error,
                    fetched_at = %cached.fetched_at,
                    freshness = cached.state.as_str(),
                    "Refresh failed, serving cached snapshot"
                );
                self.publish(settled, |view| {
                    view.stale_since =
                        (cached.state == Freshness::Stale).then_some(cached.fetched_at);
                    view.data = LoadState::Loaded {
                        value: cached.value,
                        fetched_at: cached.fetched_at,
                        freshness: cached.state,
                    };
                    view.error = Some(error);
                    view.cycles += 1;
                });
            }
            (Some(fetched_at), None) => {
                warn!(
                    scope = %self.key,
                    error = %error,
                    %fetched_at,
                    "Refresh failed, keeping last good snapshot"
                );
                self.publish(settled, |view| {
                    if let LoadState::Loaded { freshness, .. } = &mut view.data {
                        *freshness = Freshness::Stale;
                    }
                    view.stale_since = view.stale_since.or(Some(fetched_at));
                    view.error = Some(error);
                    view.cycles += 1;
                });
            }
            (None, None) => {
                match shown_at {
                    Some(fetched_at) => error!(
                        scope = %self.key,
                        error = %error,
                        %fetched_at,
                        "Refresh failed and last snapshot expired"
                    ),
                    None => error!(scope = %self.key, error = %error, "Scope failed to initialize"),
                }
                let hard = SyncError::NotInitialized {
                    scope: self.key.to_string(),
                    cause: Box::new(error),
                };
                self.publish(ScopePhase::Failed, |view| {
                    view.data = LoadState::NotLoaded;
                    view.stale_since = None;
                    view.error = Some(hard);
                    view.cycles += 1;
                });
            }
        }
    }

    /// Move to `phase` and publish the view after applying `update`.
    fn publish(&mut self, phase: ScopePhase, update: impl FnOnce(&mut ScopeView<R::Snapshot>)) {
        if phase != self.phase {
            Metrics::scope_transition(
                R::KIND.as_str(),
                Some(self.phase.as_str()),
                Some(phase.as_str()),
            );
            trace!(scope = %self.key, from = %self.phase, to = %phase, "Phase transition");
            self.phase = phase;
        }
        self.view.send_modify(|view| {
            view.phase = phase;
            update(view);
        });
    }
}
