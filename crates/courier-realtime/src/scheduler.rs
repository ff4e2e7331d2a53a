//! Injectable clock and delayed-task scheduler.
//!
//! Every timer in the delivery core (reconnect backoff, handler retry delay,
//! claim grace period, marker expiry, sweeps) goes through [`Scheduler`], so
//! tests can swap the tokio-backed implementation for [`ManualScheduler`] and
//! drive time by hand.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::BoxFuture;
use tokio::task::AbortHandle;

/// A unit of deferred work.
pub type TaskFuture = BoxFuture<'static, ()>;

/// Cancellable handle to a scheduled task.
#[derive(Clone, Debug)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
}

impl TimerHandle {
    fn new(cancelled: Arc<AtomicBool>, abort: Option<AbortHandle>) -> Self {
        Self { cancelled, abort }
    }

    /// Cancels the task if it has not started yet.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Clock plus delayed-task execution.
pub trait Scheduler: Send + Sync + 'static {
    /// Milliseconds since the Unix epoch, as seen by this scheduler.
    fn now_millis(&self) -> u64;

    /// Runs `task` once `delay` has elapsed, unless cancelled first.
    fn schedule(&self, delay: Duration, task: TaskFuture) -> TimerHandle;

    /// Completes after `delay`. Only the awaiting caller is suspended.
    fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()>;
}

/// Scheduler backed by tokio timers.
///
/// `now_millis` is wall-clock time at construction plus tokio's monotonic
/// elapsed time, so it follows `tokio::time::pause`/`advance` in tests while
/// staying comparable across processes in production. `schedule` spawns onto
/// the current tokio runtime.
#[derive(Debug)]
pub struct TokioScheduler {
    origin_wall_ms: u64,
    origin: tokio::time::Instant,
}

impl TokioScheduler {
    /// Creates a scheduler anchored at the current wall-clock time.
    pub fn new() -> Self {
        let origin_wall_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            origin_wall_ms,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TokioScheduler {
    fn now_millis(&self) -> u64 {
        self.origin_wall_ms + self.origin.elapsed().as_millis() as u64
    }

    fn schedule(&self, delay: Duration, task: TaskFuture) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !flag.load(Ordering::SeqCst) {
                task.await;
            }
        });
        TimerHandle::new(cancelled, Some(join.abort_handle()))
    }

    fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(delay))
    }
}

struct ManualTask {
    seq: u64,
    deadline_ms: u64,
    cancelled: Arc<AtomicBool>,
    task: TaskFuture,
}

#[derive(Default)]
struct ManualInner {
    now_ms: u64,
    next_seq: u64,
    tasks: Vec<ManualTask>,
    history: Vec<Duration>,
}

/// Fake clock: nothing happens until [`advance`](ManualScheduler::advance).
///
/// Due tasks run in deadline order (ties in scheduling order), inline on the
/// caller of `advance`. Tasks scheduled while advancing run in the same call
/// if they fall due before the target time.
pub struct ManualScheduler {
    inner: Mutex<ManualInner>,
}

impl ManualScheduler {
    /// Creates a fake clock reading zero.
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Creates a fake clock reading `now_ms`.
    pub fn starting_at(now_ms: u64) -> Self {
        Self {
            inner: Mutex::new(ManualInner {
                now_ms,
                ..Default::default()
            }),
        }
    }

    /// Number of scheduled tasks that are neither run nor cancelled.
    pub fn pending(&self) -> usize {
        let inner = self.inner.lock().expect("lock poisoned");
        inner
            .tasks
            .iter()
            .filter(|t| !t.cancelled.load(Ordering::SeqCst))
            .count()
    }

    /// Time until the earliest live task falls due.
    pub fn next_due_in(&self) -> Option<Duration> {
        let inner = self.inner.lock().expect("lock poisoned");
        inner
            .tasks
            .iter()
            .filter(|t| !t.cancelled.load(Ordering::SeqCst))
            .map(|t| t.deadline_ms)
            .min()
            .map(|d| Duration::from_millis(d.saturating_sub(inner.now_ms)))
    }

    /// Every delay ever passed to `schedule`, in call order.
    pub fn scheduled_delays(&self) -> Vec<Duration> {
        self.inner.lock().expect("lock poisoned").history.clone()
    }

    /// Moves the clock forward by `by`, running every task that falls due.
    pub async fn advance(&self, by: Duration) {
        let target = {
            let inner = self.inner.lock().expect("lock poisoned");
            inner.now_ms + by.as_millis() as u64
        };
        loop {
            let due = {
                let mut inner = self.inner.lock().expect("lock poisoned");
                inner.tasks.retain(|t| !t.cancelled.load(Ordering::SeqCst));
                let idx = inner
                    .tasks
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.deadline_ms <= target)
                    .min_by_key(|(_, t)| (t.deadline_ms, t.seq))
                    .map(|(i, _)| i);
                match idx {
                    Some(i) => {
                        let task = inner.tasks.remove(i);
                        inner.now_ms = inner.now_ms.max(task.deadline_ms);
                        Some(task)
                    }
                    None => {
                        inner.now_ms = target;
                        None
                    }
                }
            };
            match due {
                Some(task) => {
                    if !task.cancelled.load(Ordering::SeqCst) {
                        task.task.await;
                    }
                    // Let tasks woken by this one (sleepers, spawned pumps) run.
                    tokio::task::yield_now().await;
                }
                None => break,
            }
        }
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ManualScheduler {
    fn now_millis(&self) -> u64 {
        self.inner.lock().expect("lock poisoned").now_ms
    }

    fn schedule(&self, delay: Duration, task: TaskFuture) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut inner = self.inner.lock().expect("lock poisoned");
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let deadline_ms = inner.now_ms + delay.as_millis() as u64;
        inner.history.push(delay);
        inner.tasks.push(ManualTask {
            seq,
            deadline_ms,
            cancelled: cancelled.clone(),
            task,
        });
        TimerHandle::new(cancelled, None)
    }

    fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()> {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        self.schedule(
            delay,
            Box::pin(async move {
                let _ = tx.send(());
            }),
        );
        Box::pin(async move {
            let _ = rx.await;
        })
    }
}
