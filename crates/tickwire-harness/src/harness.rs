//! Supervised routine execution.
//!
//! [`Harness::run`] spawns a routine as its own task and races it against
//! four abort conditions: the session disconnecting, the simulation tick
//! freezing, the routine stalling, and the time limit. Whichever resolves
//! first decides the [`RunOutcome`].
//!
//! On abort the reason is published on a watch channel. Every
//! [`RoutineContext`] await point selects on that channel, so the routine
//! sees [`RoutineError::Aborted`] at its current `submit`, `wait_until` or
//! `sleep`. A routine that ignores the error is cancelled after the grace
//! period at its next suspension point. Code that never yields cannot be
//! preempted.

use std::any::Any;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tickwire_client::{ActionApi, Session, StateCache};
use tickwire_types::{Action, ConnectionState, ConnectionStatus, RunId, WorldSnapshot};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, HarnessConfig};
use crate::console::ConsoleLevel;
use crate::error::{AbortReason, DisconnectCause, RoutineError};
use crate::instrument::Instrumented;
use crate::lock;
use crate::monitor::{ProgressMonitor, StallSignal, TickFrozen, TickMonitor};
use crate::record::{Diagnostics, RunOutcome, RunRecord, RunRecorder};
use crate::sink::RunSink;

/// Produces a screenshot of the simulation client on demand.
pub trait ScreenshotSource: Send + Sync {
    /// Capture one screenshot and return where it was stored.
    fn capture(&self, tick: Option<u64>) -> anyhow::Result<String>;
}

struct ContextInner<A> {
    api: Instrumented<A>,
    cache: StateCache,
    recorder: RunRecorder,
    progress: Arc<Mutex<ProgressMonitor>>,
    abort: watch::Receiver<Option<AbortReason>>,
}

/// What a routine is handed: instrumented actions, state waits, console
/// output, and a way to report progress.
///
/// Every await point returns [`RoutineError::Aborted`] once the harness
/// decides to stop the run.
pub struct RoutineContext<A> {
    inner: Arc<ContextInner<A>>,
}

impl<A> Clone for RoutineContext<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: ActionApi> RoutineContext<A> {
    /// Submit an action through the instrumented api.
    ///
    /// # Errors
    ///
    /// [`RoutineError::Aborted`] if the harness aborts first (the action
    /// is then recorded as abandoned), otherwise any [`ActionError`]
    /// from the session.
    ///
    /// [`ActionError`]: tickwire_client::ActionError
    pub async fn submit(&self, action: Action) -> Result<Value, RoutineError> {
        self.checkpoint()?;
        tokio::select! {
            biased;
            reason = self.abort_signal() => Err(RoutineError::Aborted(reason)),
            result = self.inner.api.submit(action) => result.map_err(RoutineError::from),
        }
    }

    /// Wait for a snapshot satisfying `predicate`.
    ///
    /// # Errors
    ///
    /// [`RoutineError::Aborted`] on abort, [`RoutineError::Wait`] on
    /// timeout.
    pub async fn wait_until<P>(
        &self,
        predicate: P,
        timeout: Duration,
    ) -> Result<Arc<WorldSnapshot>, RoutineError>
    where
        P: Fn(&WorldSnapshot) -> bool + Send + Sync,
    {
        self.checkpoint()?;
        tokio::select! {
            biased;
            reason = self.abort_signal() => Err(RoutineError::Aborted(reason)),
            result = self.inner.cache.wait_until(predicate, timeout) => result.map_err(RoutineError::from),
        }
    }

    /// Wait for the tick to move past `tick`.
    ///
    /// # Errors
    ///
    /// Same as [`wait_until`](Self::wait_until).
    pub async fn wait_for_tick_after(
        &self,
        tick: u64,
        timeout: Duration,
    ) -> Result<Arc<WorldSnapshot>, RoutineError> {
        self.wait_until(move |s| s.tick > tick, timeout).await
    }

    /// Sleep, waking early on abort.
    ///
    /// # Errors
    ///
    /// [`RoutineError::Aborted`] on abort.
    pub async fn sleep(&self, duration: Duration) -> Result<(), RoutineError> {
        self.checkpoint()?;
        tokio::select! {
            biased;
            reason = self.abort_signal() => Err(RoutineError::Aborted(reason)),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Return the abort error if the harness has already decided to stop.
    ///
    /// For long stretches of work between await points.
    ///
    /// # Errors
    ///
    /// [`RoutineError::Aborted`] once aborted.
    pub fn checkpoint(&self) -> Result<(), RoutineError> {
        self.abort_reason()
            .map_or(Ok(()), |reason| Err(RoutineError::Aborted(reason)))
    }

    /// Why the harness stopped the run, if it has.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        *self.inner.abort.borrow()
    }

    /// Report progress, resetting the stall clock.
    pub fn progress(&self) {
        lock(&self.inner.progress).mark(Instant::now());
    }

    /// Write an informational console line.
    pub fn log(&self, line: impl AsRef<str>) {
        self.inner
            .recorder
            .log(ConsoleLevel::Info, line.as_ref(), self.inner.cache.latest_tick());
    }

    /// Write a warning console line.
    pub fn warn(&self, line: impl AsRef<str>) {
        self.inner
            .recorder
            .log(ConsoleLevel::Warn, line.as_ref(), self.inner.cache.latest_tick());
    }

    /// Most recent snapshot.
    pub fn snapshot(&self) -> Option<Arc<WorldSnapshot>> {
        self.inner.cache.latest()
    }

    /// The instrumented api, for helpers written against [`ActionApi`].
    ///
    /// Calls made through it are recorded but do not observe aborts.
    pub fn api(&self) -> &Instrumented<A> {
        &self.inner.api
    }

    /// Id of the run in progress.
    pub fn run_id(&self) -> RunId {
        self.inner.recorder.run_id()
    }

    async fn abort_signal(&self) -> AbortReason {
        let mut abort = self.inner.abort.clone();
        let reason = abort.wait_for(Option::is_some).await.ok().and_then(|r| *r);
        match reason {
            Some(reason) => reason,
            None => std::future::pending().await,
        }
    }
}

impl<A> std::fmt::Debug for RoutineContext<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutineContext")
            .field("run_id", &self.inner.recorder.run_id())
            .field("abort", &*self.inner.abort.borrow())
            .finish_non_exhaustive()
    }
}

/// How the supervision loop ended.
enum Verdict {
    Finished(Result<anyhow::Result<()>, JoinError>),
    Abort(Abort),
}

/// An abort condition that fired.
enum Abort {
    SessionClosed,
    Frozen(TickFrozen),
    Stalled(StallSignal),
    TimeLimit,
}

impl Abort {
    const fn reason(&self) -> AbortReason {
        match self {
            Self::SessionClosed => AbortReason::Disconnect(DisconnectCause::SessionClosed),
            Self::Frozen(_) => AbortReason::Disconnect(DisconnectCause::TickFrozen),
            Self::Stalled(_) => AbortReason::Stall,
            Self::TimeLimit => AbortReason::TimeLimit,
        }
    }

    fn outcome(&self, config: &HarnessConfig) -> RunOutcome {
        match self {
            Self::Stalled(stall) => {
                warn!(
                    idle_ms = duration_ms(stall.idle),
                    position = ?stall.position,
                    "routine stalled"
                );
                RunOutcome::Stall {
                    idle_ms: duration_ms(stall.idle),
                }
            }
            Self::Frozen(frozen) => {
                warn!(
                    last_tick = ?frozen.last_tick,
                    frozen_ms = duration_ms(frozen.frozen_for),
                    "simulation tick frozen"
                );
                RunOutcome::Disconnect {
                    cause: DisconnectCause::TickFrozen,
                }
            }
            Self::SessionClosed => RunOutcome::Disconnect {
                cause: DisconnectCause::SessionClosed,
            },
            Self::TimeLimit => RunOutcome::Timeout {
                limit_ms: config.time_limit_ms,
            },
        }
    }
}

/// Runs routines under supervision and records what they did.
pub struct Harness {
    config: HarnessConfig,
    sink: Option<Arc<dyn RunSink>>,
    screenshots: Option<Arc<dyn ScreenshotSource>>,
}

impl Harness {
    /// Harness with no sink and no screenshot source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when `config` fails
    /// [`HarnessConfig::validate`]. A harness never starts a routine it
    /// cannot supervise.
    pub fn new(config: HarnessConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            sink: None,
            screenshots: None,
        })
    }

    /// Append every finished record to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn RunSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Capture screenshots from `source` at the configured interval.
    #[must_use]
    pub fn with_screenshots(mut self, source: Arc<dyn ScreenshotSource>) -> Self {
        self.screenshots = Some(source);
        self
    }

    /// Active configuration.
    pub const fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Run `routine` against a connected session.
    pub async fn run_session<F, Fut>(&self, session: &Session, routine: F) -> RunRecord
    where
        F: FnOnce(RoutineContext<Session>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.run(
            session.clone(),
            session.cache().clone(),
            session.watch_status(),
            routine,
        )
        .await
    }

    /// Run `routine` against any [`ActionApi`].
    ///
    /// `cache` backs `wait_until` and the tick and position monitors;
    /// `status` drives disconnect detection. Always returns a finalized
    /// record, which is also appended to the sink if one is set.
    pub async fn run<A, F, Fut>(
        &self,
        api: A,
        cache: StateCache,
        status: watch::Receiver<ConnectionStatus>,
        routine: F,
    ) -> RunRecord
    where
        A: ActionApi + 'static,
        F: FnOnce(RoutineContext<A>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let run_id = RunId::new();
        let recorder = RunRecorder::new(run_id, &self.config.name);
        let started = Instant::now();
        let progress = Arc::new(Mutex::new(ProgressMonitor::new(
            self.config.stall_timeout(),
            started,
        )));
        let (abort_tx, abort_rx) = watch::channel(None);

        let ctx = RoutineContext {
            inner: Arc::new(ContextInner {
                api: Instrumented::new(api, recorder.clone(), self.config.delta.clone()),
                cache: cache.clone(),
                recorder: recorder.clone(),
                progress: Arc::clone(&progress),
                abort: abort_rx,
            }),
        };

        info!(
            run_id = %run_id,
            name = %self.config.name,
            time_limit_ms = self.config.time_limit_ms,
            "routine started"
        );
        let mut handle = tokio::spawn(routine(ctx));

        let verdict = self
            .supervise(&mut handle, &cache, &status, &progress, &recorder, started)
            .await;

        let outcome = match verdict {
            Verdict::Finished(joined) => finished_outcome(joined),
            Verdict::Abort(abort) => {
                let reason = abort.reason();
                warn!(run_id = %run_id, reason = %reason, "aborting routine");
                abort_tx.send_replace(Some(reason));
                self.stop(&mut handle, reason).await;
                abort.outcome(&self.config)
            }
        };

        let last = cache.latest();
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let connection = status.borrow().state;
        let diagnostics = Diagnostics::capture(last.as_deref(), connection, elapsed_ms);
        let record = recorder.finalize(outcome, diagnostics, last.map(|s| (*s).clone()));

        if record.outcome.is_failure() {
            warn!(
                run_id = %run_id,
                outcome = record.outcome.kind(),
                calls = record.calls.len(),
                elapsed_ms,
                "routine finished"
            );
        } else {
            info!(
                run_id = %run_id,
                outcome = record.outcome.kind(),
                calls = record.calls.len(),
                elapsed_ms,
                "routine finished"
            );
        }

        if let Some(sink) = &self.sink {
            persist(Arc::clone(sink), record.clone()).await;
        }
        record
    }

    /// Race the routine against the abort conditions.
    async fn supervise(
        &self,
        handle: &mut JoinHandle<anyhow::Result<()>>,
        cache: &StateCache,
        status: &watch::Receiver<ConnectionStatus>,
        progress: &Mutex<ProgressMonitor>,
        recorder: &RunRecorder,
        started: Instant,
    ) -> Verdict {
        let deadline = started.checked_add(self.config.time_limit());
        let mut ticks = TickMonitor::new(self.config.tick_freeze(), started);
        let mut poll = every(self.config.poll_interval());
        let mut snapshots = self.config.snapshot_interval().map(every);
        let mut screenshots = self
            .screenshots
            .as_ref()
            .and(self.config.screenshot_interval())
            .map(every);

        loop {
            tokio::select! {
                biased;
                joined = &mut *handle => return Verdict::Finished(joined),
                () = sleep_until(deadline) => return Verdict::Abort(Abort::TimeLimit),
                _ = poll.tick() => {
                    if let Some(abort) = check_health(cache, status, progress, &mut ticks) {
                        return Verdict::Abort(abort);
                    }
                }
                () = next_tick(&mut snapshots) => {
                    if let Some(snapshot) = cache.latest() {
                        recorder.push_snapshot(&snapshot);
                    }
                }
                () = next_tick(&mut screenshots) => {
                    self.capture_screenshot(recorder, cache.latest_tick());
                }
            }
        }
    }

    /// Give an aborted routine the grace period, then cancel it.
    async fn stop(&self, handle: &mut JoinHandle<anyhow::Result<()>>, reason: AbortReason) {
        match tokio::time::timeout(self.config.abort_grace(), &mut *handle).await {
            Ok(Ok(Ok(()))) => debug!(%reason, "routine returned after abort"),
            Ok(Ok(Err(e))) => debug!(%reason, error = %e, "routine unwound after abort"),
            Ok(Err(e)) => debug!(%reason, error = %e, "routine task ended after abort"),
            Err(_) => {
                warn!(
                    %reason,
                    grace_ms = self.config.abort_grace_ms,
                    "routine ignored abort, cancelling task"
                );
                handle.abort();
                if let Err(e) = handle.await {
                    debug!(cancelled = e.is_cancelled(), "routine task cancelled");
                }
            }
        }
    }

    fn capture_screenshot(&self, recorder: &RunRecorder, tick: Option<u64>) {
        let Some(source) = &self.screenshots else {
            return;
        };
        match source.capture(tick) {
            Ok(reference) => recorder.push_screenshot(tick, reference),
            Err(e) => warn!(error = %e, ?tick, "screenshot capture failed"),
        }
    }
}

impl std::fmt::Debug for Harness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harness")
            .field("config", &self.config)
            .field("sink", &self.sink.is_some())
            .field("screenshots", &self.screenshots.is_some())
            .finish()
    }
}

/// Disconnect first, then tick freeze, then stall.
fn check_health(
    cache: &StateCache,
    status: &watch::Receiver<ConnectionStatus>,
    progress: &Mutex<ProgressMonitor>,
    ticks: &mut TickMonitor,
) -> Option<Abort> {
    let now = Instant::now();
    let state = status.borrow().state;
    if state == ConnectionState::Disconnected {
        return Some(Abort::SessionClosed);
    }

    // A reconnecting socket is not a frozen simulation.
    let latest = cache.latest();
    ticks.observe(latest.as_ref().map(|s| s.tick), now);
    if let Some(frozen) = ticks
        .check(now)
        .filter(|_| state == ConnectionState::Connected)
    {
        return Some(Abort::Frozen(frozen));
    }

    let mut progress = lock(progress);
    progress.observe_position(latest.as_ref().and_then(|s| s.position()), now);
    progress.check(now).map(Abort::Stalled)
}

/// Append `record` on the blocking pool; sinks do synchronous file I/O.
async fn persist(sink: Arc<dyn RunSink>, record: RunRecord) {
    let run_id = record.run_id;
    match tokio::task::spawn_blocking(move || sink.append(&record)).await {
        Ok(Ok(())) => debug!(run_id = %run_id, "run record persisted"),
        Ok(Err(e)) => error!(run_id = %run_id, error = %e, "failed to persist run record"),
        Err(e) => error!(run_id = %run_id, error = %e, "run record writer task failed"),
    }
}

fn finished_outcome(joined: Result<anyhow::Result<()>, JoinError>) -> RunOutcome {
    match joined {
        Ok(Ok(())) => RunOutcome::Success,
        Ok(Err(e)) => RunOutcome::Error {
            message: format!("{e:#}"),
        },
        Err(e) if e.is_panic() => RunOutcome::Error {
            message: format!("routine panicked: {}", panic_message(e.into_panic())),
        },
        Err(e) => RunOutcome::Error {
            message: format!("routine task failed: {e}"),
        },
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// An interval whose first tick is one period from now.
fn every(period: Duration) -> Interval {
    let now = Instant::now();
    let start = now.checked_add(period).unwrap_or(now);
    let mut interval = tokio::time::interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
