//! Recurring task scheduling for the decay job.
//!
//! The limiter never owns a clock. It hands its decay function to a
//! [`Scheduler`], which decides when to run it: [`TokioScheduler`] uses the
//! tokio timer, [`ManualScheduler`] runs tasks only when told to.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// A task run on every tick.
pub type Task = Box<dyn Fn() + Send + Sync + 'static>;

/// Errors that can occur when registering a recurring task.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("recurring task interval must be non-zero")]
    ZeroInterval,

    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),
}

/// Something that can run a task every `interval`.
pub trait Scheduler {
    fn schedule_recurring(&self, interval: Duration, task: Task) -> Result<(), ScheduleError>;
}

/// Runs recurring tasks on a tokio runtime.
///
/// Tasks are aborted when the scheduler is dropped.
pub struct TokioScheduler {
    handle: Handle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TokioScheduler {
    /// Create a scheduler bound to the given runtime.
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Create a scheduler bound to the runtime of the calling context.
    pub fn current() -> Result<Self, ScheduleError> {
        let handle = Handle::try_current().map_err(|e| ScheduleError::NoRuntime(e.to_string()))?;
        Ok(Self::new(handle))
    }

    /// Number of tasks registered and still running.
    pub fn active_tasks(&self) -> usize {
        self.tasks.lock().iter().filter(|t| !t.is_finished()).count()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_recurring(&self, interval: Duration, task: Task) -> Result<(), ScheduleError> {
        if interval.is_zero() {
            return Err(ScheduleError::ZeroInterval);
        }

        // Read the clock through the handle so a paused test clock is honoured.
        let start = {
            let _guard = self.handle.enter();
            Instant::now() + interval
        };
        let join = self.handle.spawn(async move {
            let mut ticker = interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                task();
                trace!(interval = ?interval, "Recurring task tick completed");
            }
        });

        debug!(interval = ?interval, "Scheduled recurring task on tokio runtime");
        self.tasks.lock().push(join);
        Ok(())
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

struct ManualEntry {
    interval: Duration,
    /// Time accumulated towards the next firing.
    pending: Duration,
    task: Task,
}

/// A scheduler driven explicitly by the caller.
///
/// Clones share the same task list, so one clone can be handed to a limiter
/// while another is used to advance time.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    entries: Arc<Mutex<Vec<ManualEntry>>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend `elapsed` time has passed, firing each task once per full
    /// interval covered.
    ///
    /// Returns the total number of task runs.
    pub fn advance(&self, elapsed: Duration) -> usize {
        let mut runs = 0;
        let mut entries = self.entries.lock();
        for entry in entries.iter_mut() {
            entry.pending += elapsed;
            while entry.pending >= entry.interval {
                entry.pending -= entry.interval;
                (entry.task)();
                runs += 1;
            }
        }
        runs
    }

    /// Fire every registered task exactly once, regardless of its interval.
    pub fn tick_all(&self) -> usize {
        let entries = self.entries.lock();
        for entry in entries.iter() {
            (entry.task)();
        }
        entries.len()
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_recurring(&self, interval: Duration, task: Task) -> Result<(), ScheduleError> {
        if interval.is_zero() {
            return Err(ScheduleError::ZeroInterval);
        }
        self.entries.lock().push(ManualEntry {
            interval,
            pending: Duration::ZERO,
            task,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    fn counting_task() -> (Arc<AtomicUsize>, Task) {
        let count = Arc::new(AtomicUsize::new(0));
        let task_count = count.clone();
        let task: Task = Box::new(move || {
            task_count.fetch_add(1, Ordering::SeqCst);
        });
        (count, task)
    }

    #[test]
    fn test_manual_rejects_zero_interval() {
        let scheduler = ManualScheduler::new();
        let (_, task) = counting_task();
        let err = assert_err!(scheduler.schedule_recurring(Duration::ZERO, task));
        assert!(matches!(err, ScheduleError::ZeroInterval));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_manual_advance_fires_per_interval() {
        let scheduler = ManualScheduler::new();
        let (count, task) = counting_task();
        assert_ok!(scheduler.schedule_recurring(Duration::from_secs(60), task));

        assert_eq!(scheduler.advance(Duration::from_secs(59)), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // Remainder carries over.
        assert_eq!(scheduler.advance(Duration::from_secs(1)), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert_eq!(scheduler.advance(Duration::from_secs(180)), 3);
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_manual_clones_share_tasks() {
        let scheduler = ManualScheduler::new();
        let handle = scheduler.clone();
        let (count, task) = counting_task();
        assert_ok!(handle.schedule_recurring(Duration::from_secs(3600), task));

        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.tick_all(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_tokio_current_requires_runtime() {
        assert!(matches!(
            TokioScheduler::current(),
            Err(ScheduleError::NoRuntime(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_ticks_every_interval() {
        let scheduler = TokioScheduler::current().unwrap();
        let (count, task) = counting_task();
        assert_ok!(scheduler.schedule_recurring(Duration::from_secs(1), task));
        assert_eq!(scheduler.active_tasks(), 1);

        // Nothing runs before the first full interval.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_first_tick_counts_from_registration() {
        let scheduler = TokioScheduler::current().unwrap();
        let (count, task) = counting_task();
        assert_ok!(scheduler.schedule_recurring(Duration::from_secs(1), task));

        // The spawned task has not been polled yet when the clock moves.
        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_rejects_zero_interval() {
        let scheduler = TokioScheduler::current().unwrap();
        let (_, task) = counting_task();
        assert_err!(scheduler.schedule_recurring(Duration::ZERO, task));
        assert_eq!(scheduler.active_tasks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_drop_aborts_tasks() {
        let scheduler = TokioScheduler::current().unwrap();
        let (count, task) = counting_task();
        scheduler
            .schedule_recurring(Duration::from_secs(1), task)
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        drop(scheduler);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
