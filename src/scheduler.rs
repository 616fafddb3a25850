//! Task scheduling
//!
//! Two lanes feed work into the render core:
//! - A synchronous queue drained on the simulation thread once per tick.
//!   Network threads use it to marshal tracker mutations.
//! - An async lane on the tokio runtime for fire-and-forget work such as
//!   skin lookups.
//!
//! Once the scheduler is shut down every call is a no-op that returns an
//! already cancelled handle.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};

use crate::render::tracker::Tracker;

/// Work run on the simulation thread
pub type SyncTask = Box<dyn FnOnce() + Send>;

/// Cancellation handle for a scheduled task
#[derive(Debug, Clone)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
}

impl TaskHandle {
    fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            abort: None,
        }
    }

    /// A handle for a task that will never run
    pub fn cancelled() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(true)),
            abort: None,
        }
    }

    /// Prevent the task from running, aborting it if it is async
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Something whose tasks should be skipped once it is gone
pub trait TaskOwner: Send + Sync {
    fn is_alive(&self) -> bool;
}

impl TaskOwner for Tracker {
    fn is_alive(&self) -> bool {
        self.is_active()
    }
}

struct QueuedTask {
    due: u64,
    handle: TaskHandle,
    owner: Option<Weak<dyn TaskOwner>>,
    task: SyncTask,
}

/// Scheduler shared by the simulation loop and the viewer channels
pub struct Scheduler {
    enabled: AtomicBool,
    tick: AtomicU64,
    queue: Mutex<Vec<QueuedTask>>,
    runtime: Option<Handle>,
}

impl Scheduler {
    /// Create a scheduler. Async work goes to `runtime`, or to the runtime
    /// current at spawn time when `None`.
    pub fn new(runtime: Option<Handle>) -> Self {
        Self {
            enabled: AtomicBool::new(true),
            tick: AtomicU64::new(0),
            queue: Mutex::new(Vec::new()),
            runtime,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Last tick drained
    pub fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::SeqCst)
    }

    /// Queued sync tasks
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    fn enqueue(
        &self,
        delay_ticks: u64,
        owner: Option<Weak<dyn TaskOwner>>,
        task: SyncTask,
    ) -> TaskHandle {
        if !self.is_enabled() {
            return TaskHandle::cancelled();
        }
        let handle = TaskHandle::new();
        let due = self.current_tick() + delay_ticks;
        self.queue.lock().push(QueuedTask {
            due,
            handle: handle.clone(),
            owner,
            task,
        });
        handle
    }

    /// Run on the simulation thread at the next tick
    pub fn run_sync<F>(&self, task: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(0, None, Box::new(task))
    }

    /// Run on the simulation thread after `delay_ticks`
    pub fn run_later<F>(&self, delay_ticks: u64, task: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(delay_ticks, None, Box::new(task))
    }

    /// Like `run_later`, skipped if `owner` is gone by then
    pub fn run_later_for<O, F>(&self, owner: &Arc<O>, delay_ticks: u64, task: F) -> TaskHandle
    where
        O: TaskOwner + 'static,
        F: FnOnce() + Send + 'static,
    {
        let owner: Arc<dyn TaskOwner> = owner.clone();
        self.enqueue(delay_ticks, Some(Arc::downgrade(&owner)), Box::new(task))
    }

    /// Spawn fire-and-forget async work
    pub fn run_async<F>(&self, future: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.is_enabled() {
            return TaskHandle::cancelled();
        }
        let runtime = match self.runtime.clone().or_else(|| Handle::try_current().ok()) {
            Some(runtime) => runtime,
            None => {
                warn!("No async runtime available, task dropped");
                return TaskHandle::cancelled();
            }
        };

        let mut handle = TaskHandle::new();
        let cancelled = handle.cancelled.clone();
        let join = runtime.spawn(async move {
            if cancelled.load(Ordering::SeqCst) {
                return;
            }
            future.await;
        });
        handle.abort = Some(join.abort_handle());
        handle
    }

    /// Run every sync task due at `tick`. Returns the number that ran.
    pub fn tick(&self, tick: u64) -> usize {
        self.tick.store(tick, Ordering::SeqCst);
        if !self.is_enabled() {
            return 0;
        }

        let due: Vec<QueuedTask> = {
            let mut queue = self.queue.lock();
            let (due, waiting): (Vec<_>, Vec<_>) =
                queue.drain(..).partition(|task| task.due <= tick);
            *queue = waiting;
            due
        };

        let mut ran = 0;
        for queued in due {
            if queued.handle.is_cancelled() {
                continue;
            }
            if let Some(owner) = &queued.owner {
                let alive = owner.upgrade().map_or(false, |owner| owner.is_alive());
                if !alive {
                    debug!(tick, "Skipping task for a released owner");
                    continue;
                }
            }
            match catch_unwind(AssertUnwindSafe(queued.task)) {
                Ok(()) => ran += 1,
                Err(_) => error!(tick, "Scheduled task panicked"),
            }
        }
        ran
    }

    /// Disable the scheduler and cancel everything queued
    pub fn shutdown(&self) {
        if !self.enabled.swap(false, Ordering::SeqCst) {
            return;
        }
        let queued = std::mem::take(&mut *self.queue.lock());
        for task in &queued {
            task.handle.cancel();
        }
        debug!(cancelled = queued.len(), "Scheduler shut down");
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("enabled", &self.is_enabled())
            .field("tick", &self.current_tick())
            .field("pending", &self.pending())
            .finish()
    }
}
