//! Supervised background loops with backoff.
//!
//! A [`RetryTask`] owns one tokio task at a time. The task calls
//! [`Retry::initialize`] once and then [`Retry::retry`] for as long as the
//! task is running. A body reports progress with [`RetryContext::success`]
//! and recoverable trouble with [`RetryContext::failed`]; after a failed
//! attempt the loop sleeps for `delays[retry_count % delays.len()]`. A zero
//! delay means give up.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, trace, warn};

use crate::error::SessionError;

/// Default backoff delays: 1s, 3s, 5s, 8s, 13s
pub const DEFAULT_RETRY_DELAYS: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(3),
    Duration::from_secs(5),
    Duration::from_secs(8),
    Duration::from_secs(13),
];

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static CURRENT_TASK: u64;
}

/// Body of a supervised loop
#[async_trait]
pub trait Retry: Send + Sync + 'static {
    /// Called once before the first attempt
    async fn initialize(&self, _ctx: &RetryContext) -> Result<(), SessionError> {
        Ok(())
    }

    /// One attempt. Returning `Err` ends the loop as a fatal failure.
    async fn retry(&self, ctx: &RetryContext) -> Result<(), SessionError>;

    /// Called exactly once after the loop exits, however it exits
    async fn stopped(&self) {}
}

struct RunState {
    category: String,
    name: String,
    running: AtomicBool,
    failed: AtomicBool,
    retry_count: AtomicUsize,
    stop: watch::Sender<bool>,
    finished: watch::Sender<bool>,
    fatal: Mutex<Option<Arc<SessionError>>>,
}

/// Handle a loop body uses to report outcomes and observe stop requests
#[derive(Clone)]
pub struct RetryContext {
    state: Arc<RunState>,
}

impl RetryContext {
    fn new(category: &str, name: &str) -> Self {
        let (stop, _) = watch::channel(false);
        let (finished, _) = watch::channel(false);
        Self {
            state: Arc::new(RunState {
                category: category.to_string(),
                name: name.to_string(),
                running: AtomicBool::new(true),
                failed: AtomicBool::new(false),
                retry_count: AtomicUsize::new(0),
                stop,
                finished,
                fatal: Mutex::new(None),
            }),
        }
    }

    /// Log category of the owning task
    pub fn category(&self) -> &str {
        &self.state.category
    }

    /// Name of the owning task
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Whether the loop should keep going
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    /// Reset the backoff position
    pub fn success(&self) {
        self.state.retry_count.store(0, Ordering::Release);
    }

    /// Mark the current attempt failed so the loop backs off afterwards
    pub fn failed(&self) {
        self.state.failed.store(true, Ordering::Release);
    }

    /// Consecutive failed attempts since the last success
    pub fn retry_count(&self) -> usize {
        self.state.retry_count.load(Ordering::Acquire)
    }

    /// Ask the loop to exit after the current attempt
    pub fn stop(&self) {
        self.state.running.store(false, Ordering::Release);
        self.state.stop.send_replace(true);
    }

    /// Resolves once a stop has been requested
    pub async fn stopped(&self) {
        let mut stop = self.state.stop.subscribe();
        let _ = stop.wait_for(|stopped| *stopped).await;
    }

    /// Sleep unless stopped first. Returns false when interrupted.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.stopped() => false,
        }
    }

    async fn finished(&self) {
        let mut finished = self.state.finished.subscribe();
        let _ = finished.wait_for(|finished| *finished).await;
    }

    async fn backoff(&self, delays: &[Duration]) -> Result<(), SessionError> {
        let count = self.retry_count();
        let delay = delays[count % delays.len()];
        if delay.is_zero() {
            return Err(SessionError::RetriesExhausted(self.name().to_string()));
        }
        debug!(component = self.category(), "{} retrying in {:?}", self.name(), delay);
        self.sleep(delay).await;
        self.state.retry_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Marks the run finished even if the body panics
struct FinishGuard(RetryContext);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.state.running.store(false, Ordering::Release);
        self.0.state.stop.send_replace(true);
        self.0.state.finished.send_replace(true);
    }
}

async fn supervise(body: &dyn Retry, ctx: &RetryContext, delays: &[Duration]) -> Result<(), SessionError> {
    body.initialize(ctx).await?;
    while ctx.is_running() {
        ctx.state.failed.store(false, Ordering::Release);
        body.retry(ctx).await?;
        if ctx.state.failed.swap(false, Ordering::AcqRel) && ctx.is_running() {
            ctx.backoff(delays).await?;
        }
    }
    Ok(())
}

async fn run_loop(body: Arc<dyn Retry>, ctx: RetryContext, delays: Arc<[Duration]>) {
    let _finish = FinishGuard(ctx.clone());
    trace!(component = ctx.category(), "Started {} task", ctx.name());

    let result = supervise(body.as_ref(), &ctx, &delays).await;
    ctx.state.running.store(false, Ordering::Release);
    body.stopped().await;

    if let Err(e) = result {
        error!(component = ctx.category(), "{} task failed: {}", ctx.name(), e);
        *ctx.state.fatal.lock() = Some(Arc::new(e));
    }
    trace!(component = ctx.category(), "Stopped {} task", ctx.name());
}

/// Owner of a supervised loop.
///
/// At most one run is active at a time: `start` stops the previous run
/// before spawning a new one.
pub struct RetryTask {
    id: u64,
    category: String,
    name: String,
    body: Arc<dyn Retry>,
    delays: Mutex<Arc<[Duration]>>,
    daemon: AtomicBool,
    lifecycle: tokio::sync::Mutex<()>,
    current: Mutex<Option<RetryContext>>,
}

impl RetryTask {
    /// Create a stopped task around `body`
    pub fn new(category: impl Into<String>, name: impl Into<String>, body: Arc<dyn Retry>) -> Self {
        Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            category: category.into(),
            name: name.into(),
            body,
            delays: Mutex::new(Arc::from(&DEFAULT_RETRY_DELAYS[..])),
            daemon: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
            current: Mutex::new(None),
        }
    }

    /// Log category
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Task name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the backoff delays; takes effect on the next `start`
    pub fn set_retry_delays(&self, delays: &[Duration]) {
        if delays.is_empty() {
            warn!(component = %self.category, "Ignoring empty retry delays for {}", self.name);
            return;
        }
        *self.delays.lock() = Arc::from(delays);
    }

    /// Current backoff delays
    pub fn retry_delays(&self) -> Vec<Duration> {
        self.delays.lock().to_vec()
    }

    /// Daemon loops are stopped when this handle is dropped; others keep running
    pub fn set_daemon(&self, daemon: bool) {
        self.daemon.store(daemon, Ordering::Release);
    }

    /// Whether this is a daemon loop
    pub fn is_daemon(&self) -> bool {
        self.daemon.load(Ordering::Acquire)
    }

    /// Whether a run is active and has not been asked to stop
    pub fn is_running(&self) -> bool {
        self.current.lock().as_ref().is_some_and(RetryContext::is_running)
    }

    /// Backoff position of the current run
    pub fn retry_count(&self) -> usize {
        self.current.lock().as_ref().map_or(0, RetryContext::retry_count)
    }

    /// Start the loop, stopping and awaiting any previous run first.
    ///
    /// Must not be called from inside the loop body.
    pub async fn start(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let previous = self.current.lock().take();
        if let Some(previous) = previous {
            previous.stop();
            previous.finished().await;
        }

        let ctx = RetryContext::new(&self.category, &self.name);
        *self.current.lock() = Some(ctx.clone());
        let delays = self.delays.lock().clone();
        tokio::spawn(CURRENT_TASK.scope(self.id, run_loop(self.body.clone(), ctx, delays)));
    }

    /// Stop the loop and wait for it to exit.
    ///
    /// Returns false if it was not running. Called from inside the loop it
    /// only flags the stop and returns immediately.
    pub async fn stop(&self) -> bool {
        if self.is_own_task() {
            return match self.current.lock().as_ref() {
                Some(ctx) if ctx.is_running() => {
                    ctx.stop();
                    true
                }
                _ => false,
            };
        }

        let _lifecycle = self.lifecycle.lock().await;
        let Some(ctx) = self.current.lock().clone() else {
            return false;
        };
        if !ctx.is_running() {
            return false;
        }
        trace!(component = %self.category, "Waiting for {} task to stop...", self.name);
        ctx.stop();
        ctx.finished().await;
        true
    }

    /// Wait for the current run to exit and report its fatal error, if any.
    ///
    /// Every caller waiting on a failed run sees the same error.
    pub async fn wait(&self) -> Result<(), Arc<SessionError>> {
        if self.is_own_task() {
            return Ok(());
        }
        let Some(ctx) = self.current.lock().clone() else {
            return Ok(());
        };
        ctx.finished().await;
        let fatal = ctx.state.fatal.lock().clone();
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn is_own_task(&self) -> bool {
        CURRENT_TASK.try_with(|id| *id == self.id).unwrap_or(false)
    }
}

impl Drop for RetryTask {
    fn drop(&mut self) {
        if self.is_daemon() {
            if let Some(ctx) = self.current.lock().as_ref() {
                ctx.stop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{OnceLock, Weak};
    use tokio::sync::Notify;
    use tokio::time::Instant;

    #[derive(Clone, Copy)]
    enum Step {
        Fail,
        Succeed,
        Stop,
    }

    struct Scripted {
        steps: Vec<Step>,
        attempts: Mutex<Vec<Instant>>,
        stopped: AtomicUsize,
        attempted: Notify,
    }

    impl Scripted {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps,
                attempts: Mutex::new(Vec::new()),
                stopped: AtomicUsize::new(0),
                attempted: Notify::new(),
            })
        }

        fn gaps(&self) -> Vec<Duration> {
            let attempts = self.attempts.lock();
            attempts.windows(2).map(|w| w[1] - w[0]).collect()
        }
    }

    #[async_trait]
    impl Retry for Scripted {
        async fn retry(&self, ctx: &RetryContext) -> Result<(), SessionError> {
            let attempt = {
                let mut attempts = self.attempts.lock();
                attempts.push(Instant::now());
                attempts.len() - 1
            };
            self.attempted.notify_one();
            match self.steps.get(attempt).copied().unwrap_or(Step::Fail) {
                Step::Fail => ctx.failed(),
                Step::Succeed => ctx.success(),
                Step::Stop => ctx.stop(),
            }
            Ok(())
        }

        async fn stopped(&self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn ms(values: &[u64]) -> Vec<Duration> {
        values.iter().map(|&v| Duration::from_millis(v)).collect()
    }

    fn assert_gaps(actual: &[Duration], expected: &[Duration]) {
        assert_eq!(actual.len(), expected.len(), "gaps {:?}", actual);
        for (gap, delay) in actual.iter().zip(expected) {
            assert!(*gap >= *delay && *gap < *delay + Duration::from_millis(5), "gaps {:?}", actual);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_cycles_through_delays() {
        let body = Scripted::new(vec![Step::Fail, Step::Fail, Step::Fail, Step::Fail, Step::Stop]);
        let task = RetryTask::new("test", "cycle", body.clone());
        task.set_retry_delays(&ms(&[10, 20, 30]));

        task.start().await;
        task.wait().await.unwrap();

        assert_gaps(&body.gaps(), &ms(&[10, 20, 30, 10]));
        assert_eq!(body.stopped.load(Ordering::SeqCst), 1);
        assert!(!task.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_backoff() {
        let body = Scripted::new(vec![Step::Fail, Step::Fail, Step::Succeed, Step::Fail, Step::Stop]);
        let task = RetryTask::new("test", "reset", body.clone());
        task.set_retry_delays(&ms(&[10, 20, 30]));

        task.start().await;
        task.wait().await.unwrap();

        assert_gaps(&body.gaps(), &ms(&[10, 20, 0, 10]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delay_gives_up() {
        let body = Scripted::new(vec![]);
        let task = RetryTask::new("test", "doomed", body.clone());
        task.set_retry_delays(&ms(&[10, 0]));

        task.start().await;
        let error = task.wait().await.unwrap_err();

        assert!(matches!(*error, SessionError::RetriesExhausted(ref name) if name == "doomed"));
        assert_eq!(body.attempts.lock().len(), 2);
        assert_eq!(body.stopped.load(Ordering::SeqCst), 1);
        assert!(!task.stop().await);
    }

    #[tokio::test]
    async fn test_stop_interrupts_backoff_and_is_idempotent() {
        let body = Scripted::new(vec![]);
        let task = RetryTask::new("test", "sleepy", body.clone());
        task.set_retry_delays(&ms(&[60_000]));

        task.start().await;
        body.attempted.notified().await;
        assert!(task.is_running());

        let stopped = tokio::time::timeout(Duration::from_secs(2), task.stop()).await;
        assert_eq!(stopped.ok(), Some(true));
        assert!(!task.stop().await);
        assert_eq!(body.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(body.attempts.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_previous_run() {
        let body = Scripted::new(vec![]);
        let task = RetryTask::new("test", "restart", body.clone());
        task.set_retry_delays(&ms(&[1_000]));

        task.start().await;
        body.attempted.notified().await;
        task.start().await;
        body.attempted.notified().await;

        assert_eq!(body.stopped.load(Ordering::SeqCst), 1);
        assert!(task.stop().await);
        assert_eq!(body.stopped.load(Ordering::SeqCst), 2);
    }

    struct SelfStopping {
        task: OnceLock<Weak<RetryTask>>,
        returned: Mutex<Option<bool>>,
    }

    #[async_trait]
    impl Retry for SelfStopping {
        async fn retry(&self, _ctx: &RetryContext) -> Result<(), SessionError> {
            if let Some(task) = self.task.get().and_then(Weak::upgrade) {
                let stopped = task.stop().await;
                *self.returned.lock() = Some(stopped);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stop_from_inside_loop_returns_immediately() {
        let body = Arc::new(SelfStopping {
            task: OnceLock::new(),
            returned: Mutex::new(None),
        });
        let task = Arc::new(RetryTask::new("test", "self", body.clone()));
        let _ = body.task.set(Arc::downgrade(&task));

        task.start().await;
        task.wait().await.unwrap();

        assert_eq!(*body.returned.lock(), Some(true));
        assert!(!task.is_running());
    }

    struct Fatal;

    #[async_trait]
    impl Retry for Fatal {
        async fn retry(&self, _ctx: &RetryContext) -> Result<(), SessionError> {
            Err(SessionError::Fatal("broken invariant".into()))
        }
    }

    #[tokio::test]
    async fn test_fatal_error_is_propagated() {
        let task = RetryTask::new("test", "fatal", Arc::new(Fatal));
        task.start().await;
        let error = task.wait().await.unwrap_err();
        assert!(matches!(*error, SessionError::Fatal(_)));
        assert!(!task.is_running());
    }

    #[tokio::test]
    async fn test_fatal_error_seen_by_every_waiter() {
        let task = RetryTask::new("test", "fatal", Arc::new(Fatal));
        task.start().await;

        let (first, second) = tokio::join!(task.wait(), task.wait());
        let third = task.wait().await;

        for result in [first, second, third] {
            let error = result.unwrap_err();
            assert!(matches!(*error, SessionError::Fatal(ref message) if message == "broken invariant"));
        }
    }
}
