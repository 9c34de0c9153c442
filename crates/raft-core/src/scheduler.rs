//! # scheduler
//!
//! why: election and heartbeat timers fire callbacks into the server after a delay
//! relations: used by the raft server and peers; TokioScheduler is the stock implementation
//! what: DelayedTask, DelayedTaskScheduler trait, tokio-backed TokioScheduler
//!
//! Cancellation is best effort. A task already firing may still run, so every
//! task checks its own cancelled flag before acting.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::AbortHandle;
use tracing::trace;

/// A callback that can be scheduled, cancelled and rescheduled.
pub struct DelayedTask {
    cancelled: AtomicBool,
    exec: Box<dyn Fn() + Send + Sync>,
}

impl DelayedTask {
    pub fn new(exec: impl Fn() + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            exec: Box::new(exec),
        })
    }

    /// Run the callback unless the task was cancelled.
    pub fn execute(&self) {
        if !self.cancelled.load(Ordering::Acquire) {
            (self.exec)();
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Clear the cancelled flag so the task can be scheduled again.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for DelayedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedTask")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Timer service
pub trait DelayedTaskScheduler: Send + Sync {
    /// Run `task` once after `delay_ms`. Scheduling a task that is already
    /// pending replaces the earlier timer.
    fn schedule(&self, task: &Arc<DelayedTask>, delay_ms: u64);

    /// Mark the task cancelled and drop its pending timer if any.
    fn cancel(&self, task: &Arc<DelayedTask>) {
        task.cancel();
        self.cancel_impl(task);
    }

    /// Release the platform timer backing `task`.
    fn cancel_impl(&self, task: &Arc<DelayedTask>);
}

struct Timer {
    generation: u64,
    abort: AbortHandle,
}

type TimerMap = Arc<Mutex<HashMap<usize, Timer>>>;

fn task_key(task: &Arc<DelayedTask>) -> usize {
    Arc::as_ptr(task) as usize
}

/// [`DelayedTaskScheduler`] on a tokio runtime.
///
/// Timer handles stay in the scheduler's own map keyed by task, so tasks
/// carry no platform state. Callbacks run on the blocking pool, never on the
/// timer threads.
pub struct TokioScheduler {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    timers: TimerMap,
    generation: AtomicU64,
}

impl TokioScheduler {
    /// Own a fresh multi-threaded runtime.
    pub fn new(worker_threads: usize) -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("raft-scheduler")
            .enable_time()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            handle,
            timers: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        })
    }

    /// Use a runtime owned by the embedding application.
    pub fn with_handle(handle: Handle) -> Self {
        Self {
            runtime: Mutex::new(None),
            handle,
            timers: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Number of timers that have neither fired nor been cancelled
    pub fn pending(&self) -> usize {
        self.timers.lock().len()
    }

    /// Abort every pending timer and shut down an owned runtime.
    pub fn stop(&self) {
        for (_, timer) in self.timers.lock().drain() {
            timer.abort.abort();
        }
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
    }
}

impl DelayedTaskScheduler for TokioScheduler {
    fn schedule(&self, task: &Arc<DelayedTask>, delay_ms: u64) {
        task.reset();
        let key = task_key(task);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let timers = Arc::clone(&self.timers);
        let fired = Arc::clone(task);

        // hold the map while spawning so a zero delay cannot fire before the
        // timer is registered
        let mut pending = self.timers.lock();
        let join = self.handle.spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            {
                let mut timers = timers.lock();
                match timers.get(&key) {
                    Some(timer) if timer.generation == generation => {
                        timers.remove(&key);
                    }
                    _ => return,
                }
            }
            let _ = tokio::task::spawn_blocking(move || fired.execute()).await;
        });
        let timer = Timer {
            generation,
            abort: join.abort_handle(),
        };
        if let Some(previous) = pending.insert(key, timer) {
            trace!("replacing pending timer");
            previous.abort.abort();
        }
    }

    fn cancel_impl(&self, task: &Arc<DelayedTask>) {
        if let Some(timer) = self.timers.lock().remove(&task_key(task)) {
            timer.abort.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for TokioScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn counting_task() -> (Arc<DelayedTask>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let task = DelayedTask::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (task, count)
    }

    #[test]
    fn cancelled_task_does_not_execute() {
        let (task, count) = counting_task();
        task.cancel();
        task.execute();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        task.reset();
        task.execute();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scheduled_task_fires_once() {
        let scheduler = TokioScheduler::new(1).unwrap();
        let (task, count) = counting_task();
        scheduler.schedule(&task, 10);
        thread::sleep(Duration::from_millis(200));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn cancel_before_fire() {
        let scheduler = TokioScheduler::new(1).unwrap();
        let (task, count) = counting_task();
        scheduler.schedule(&task, 100);
        scheduler.cancel(&task);
        thread::sleep(Duration::from_millis(250));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(task.is_cancelled());
    }

    #[test]
    fn reschedule_replaces_pending_timer() {
        let scheduler = TokioScheduler::new(1).unwrap();
        let (task, count) = counting_task();
        scheduler.schedule(&task, 50);
        scheduler.schedule(&task, 60);
        scheduler.schedule(&task, 70);
        assert_eq!(scheduler.pending(), 1);
        thread::sleep(Duration::from_millis(300));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn schedule_after_cancel_runs_again() {
        let scheduler = TokioScheduler::new(1).unwrap();
        let (task, count) = counting_task();
        scheduler.schedule(&task, 100);
        scheduler.cancel(&task);
        scheduler.schedule(&task, 10);
        thread::sleep(Duration::from_millis(200));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
