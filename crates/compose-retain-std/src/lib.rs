//! Standard runtime services backed by Rust's `std` library.
//!
//! This crate provides concrete implementations of the platform
//! abstraction traits defined in `compose-retain`. Hosts construct a
//! [`StdRetainRuntime`], hand out container owners from it and call
//! [`StdRetainRuntime::produce_frame`] and
//! [`StdRetainRuntime::run_pending_tasks`] from their event loop.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use compose_retain::{
    Clock, ContainerOwner, FrameClock, FrameWait, PlatformWait, RuntimeScheduler, TaskRuntime,
};

type FrameWaker = Arc<dyn Fn() + Send + Sync + 'static>;

/// Scheduler that records frame requests and pokes the host's event loop.
pub struct StdScheduler {
    frame_requested: AtomicBool,
    frame_waker: RwLock<Option<FrameWaker>>,
}

impl StdScheduler {
    pub fn new() -> Self {
        Self {
            frame_requested: AtomicBool::new(false),
            frame_waker: RwLock::new(None),
        }
    }

    /// Returns whether a frame has been requested since the last call.
    pub fn take_frame_request(&self) -> bool {
        self.frame_requested.swap(false, Ordering::SeqCst)
    }

    /// Registers a waker that will be invoked whenever a new frame is scheduled.
    pub fn set_frame_waker(&self, waker: impl Fn() + Send + Sync + 'static) {
        *self
            .frame_waker
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(waker));
    }

    /// Clears any registered frame waker.
    pub fn clear_frame_waker(&self) {
        *self
            .frame_waker
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn wake(&self) {
        let waker = self
            .frame_waker
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(waker) = waker {
            waker();
        }
    }
}

impl Default for StdScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StdScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdScheduler")
            .field(
                "frame_requested",
                &self.frame_requested.load(Ordering::SeqCst),
            )
            .finish()
    }
}

impl RuntimeScheduler for StdScheduler {
    fn schedule_frame(&self) {
        self.frame_requested.store(true, Ordering::SeqCst);
        self.wake();
    }
}

/// Clock implementation backed by [`std::time`].
#[derive(Debug, Default, Clone)]
pub struct StdClock;

impl Clock for StdClock {
    type Instant = Instant;

    fn now(&self) -> Self::Instant {
        Instant::now()
    }

    fn elapsed_millis(&self, since: Self::Instant) -> u64 {
        since.elapsed().as_millis() as u64
    }
}

impl StdClock {
    /// Returns the elapsed time as a [`Duration`] for convenience.
    pub fn elapsed(&self, since: Instant) -> Duration {
        since.elapsed()
    }
}

/// Task runtime, frame clock and wait primitive sharing one scheduler.
#[derive(Clone)]
pub struct StdRetainRuntime {
    scheduler: Arc<StdScheduler>,
    clock: Arc<StdClock>,
    tasks: TaskRuntime,
    frame_clock: FrameClock,
    started: Instant,
}

impl StdRetainRuntime {
    pub fn new() -> Self {
        let scheduler = Arc::new(StdScheduler::default());
        let clock = Arc::new(StdClock);
        Self {
            tasks: TaskRuntime::new(scheduler.clone()),
            frame_clock: FrameClock::new(scheduler.clone()),
            started: clock.now(),
            scheduler,
            clock,
        }
    }

    pub fn task_runtime(&self) -> TaskRuntime {
        self.tasks.clone()
    }

    pub fn frame_clock(&self) -> FrameClock {
        self.frame_clock.clone()
    }

    pub fn scheduler(&self) -> Arc<StdScheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn clock(&self) -> Arc<StdClock> {
        Arc::clone(&self.clock)
    }

    /// Wait primitive that holds background disposals until the next frame.
    pub fn platform_wait(&self) -> Arc<dyn PlatformWait> {
        Arc::new(FrameWait::new(self.frame_clock.clone()))
    }

    /// A container owner whose disposals run on this runtime.
    pub fn new_owner(&self) -> ContainerOwner {
        ContainerOwner::new(self.tasks.clone(), self.platform_wait())
    }

    /// Returns whether a frame was requested since the last poll.
    pub fn take_frame_request(&self) -> bool {
        self.scheduler.take_frame_request()
    }

    /// Registers a waker to be called when the runtime schedules a new frame.
    pub fn set_frame_waker(&self, waker: impl Fn() + Send + Sync + 'static) {
        self.scheduler.set_frame_waker(waker);
    }

    /// Clears any previously registered frame waker.
    pub fn clear_frame_waker(&self) {
        self.scheduler.clear_frame_waker();
    }

    /// Drains pending frame callbacks using the provided frame timestamp in nanoseconds.
    pub fn drain_frame_callbacks(&self, frame_time_nanos: u64) {
        self.frame_clock.drain_frame_callbacks(frame_time_nanos);
    }

    /// Produces a frame stamped with the time since the runtime started and
    /// runs the tasks it released. Returns the frame time.
    pub fn produce_frame(&self) -> u64 {
        let frame_time = self.clock.elapsed(self.started).as_nanos() as u64;
        self.drain_frame_callbacks(frame_time);
        self.run_pending_tasks();
        frame_time
    }

    /// Polls every ready task. Returns how many polls ran.
    pub fn run_pending_tasks(&self) -> usize {
        self.tasks.run_until_stalled()
    }
}

impl fmt::Debug for StdRetainRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdRetainRuntime")
            .field("scheduler", &self.scheduler)
            .field("clock", &self.clock)
            .field("tasks", &self.tasks)
            .finish()
    }
}

impl Default for StdRetainRuntime {
    fn default() -> Self {
        Self::new()
    }
}
