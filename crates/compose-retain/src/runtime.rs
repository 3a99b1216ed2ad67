use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};
use std::task::Context;

use futures_task::{waker_ref, ArcWake};

use crate::lock;
use crate::platform::RuntimeScheduler;

pub type TaskId = u64;

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct Task {
    id: TaskId,
    future: Mutex<Option<BoxedTask>>,
    queued: AtomicBool,
    cancelled: AtomicBool,
    runtime: Weak<RuntimeInner>,
}

impl Task {
    /// Drops the future if it is still present. Returns whether it was.
    fn release(&self, slot: &mut MutexGuard<'_, Option<BoxedTask>>) -> bool {
        if slot.take().is_some() {
            if let Some(inner) = self.runtime.upgrade() {
                inner.live_tasks.fetch_sub(1, Ordering::SeqCst);
            }
            return true;
        }
        false
    }
}

impl ArcWake for Task {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if arc_self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = arc_self.runtime.upgrade() {
            inner.enqueue(Arc::clone(arc_self));
        }
    }
}

struct RuntimeInner {
    scheduler: Arc<dyn RuntimeScheduler>,
    queue: Mutex<VecDeque<Arc<Task>>>,
    next_task_id: AtomicU64,
    live_tasks: AtomicUsize,
}

impl RuntimeInner {
    fn new(scheduler: Arc<dyn RuntimeScheduler>) -> Self {
        Self {
            scheduler,
            queue: Mutex::new(VecDeque::new()),
            next_task_id: AtomicU64::new(1),
            live_tasks: AtomicUsize::new(0),
        }
    }

    fn enqueue(&self, task: Arc<Task>) {
        if task.queued.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.queue).push_back(task);
        self.scheduler.schedule_frame();
    }

    fn pop(&self) -> Option<Arc<Task>> {
        lock(&self.queue).pop_front()
    }

    fn has_tasks(&self) -> bool {
        !lock(&self.queue).is_empty()
    }
}

/// Cooperative executor for disposal tasks and task scopes.
///
/// Spawning only enqueues; nothing is polled until the host calls
/// [`TaskRuntime::run_until_stalled`] from its UI thread. Wakers may fire from
/// any thread and simply re-enqueue their task.
#[derive(Clone)]
pub struct TaskRuntime {
    inner: Arc<RuntimeInner>,
}

impl TaskRuntime {
    pub fn new(scheduler: Arc<dyn RuntimeScheduler>) -> Self {
        Self {
            inner: Arc::new(RuntimeInner::new(scheduler)),
        }
    }

    pub fn spawn(&self, future: impl Future<Output = ()> + Send + 'static) -> TaskHandle {
        let task = Arc::new(Task {
            id: self.inner.next_task_id.fetch_add(1, Ordering::Relaxed),
            future: Mutex::new(Some(Box::pin(future))),
            queued: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            runtime: Arc::downgrade(&self.inner),
        });
        self.inner.live_tasks.fetch_add(1, Ordering::SeqCst);
        self.inner.enqueue(Arc::clone(&task));
        TaskHandle { task }
    }

    /// Polls queued tasks until none is ready. Returns how many polls ran.
    pub fn run_until_stalled(&self) -> usize {
        let mut polled = 0;
        while let Some(task) = self.inner.pop() {
            poll_task(&task);
            polled += 1;
        }
        polled
    }

    /// Whether some task is queued for polling.
    pub fn has_pending_tasks(&self) -> bool {
        self.inner.has_tasks()
    }

    /// Number of spawned tasks that have neither completed nor been cancelled.
    pub fn live_tasks(&self) -> usize {
        self.inner.live_tasks.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for TaskRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRuntime")
            .field("live_tasks", &self.live_tasks())
            .field("has_pending_tasks", &self.has_pending_tasks())
            .finish()
    }
}

fn poll_task(task: &Arc<Task>) {
    task.queued.store(false, Ordering::SeqCst);
    let mut slot = lock(&task.future);
    if task.cancelled.load(Ordering::SeqCst) {
        task.release(&mut slot);
        return;
    }
    let Some(future) = slot.as_mut() else {
        return;
    };
    let waker = waker_ref(task);
    let mut cx = Context::from_waker(&waker);
    let ready = future.as_mut().poll(&mut cx).is_ready();
    if ready || task.cancelled.load(Ordering::SeqCst) {
        task.release(&mut slot);
    }
}

/// Handle to a spawned task.
#[derive(Clone)]
pub struct TaskHandle {
    task: Arc<Task>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.task.id
    }

    /// Cancels the task. A task that is being polled right now finishes the
    /// current poll and is dropped afterwards; it is never polled again.
    pub fn cancel(&self) {
        if self.task.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut slot = match self.task.future.try_lock() {
            Ok(slot) => slot,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return,
        };
        self.task.release(&mut slot);
    }

    pub fn is_cancelled(&self) -> bool {
        self.task.cancelled.load(Ordering::SeqCst)
    }

    /// Whether the task completed or was cancelled and dropped.
    pub fn is_finished(&self) -> bool {
        lock(&self.task.future).is_none()
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.task.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct TestScheduler {
    requests: AtomicUsize,
}

#[cfg(test)]
impl TestScheduler {
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
impl RuntimeScheduler for TestScheduler {
    fn schedule_frame(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }
}
