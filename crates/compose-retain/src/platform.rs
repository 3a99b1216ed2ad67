//! Platform abstraction traits for retain runtime services.
//!
//! These traits let the container delegate scheduling, timing and the
//! "safe to dispose" decision to the host platform, so the core never depends
//! on a particular windowing or event loop.

use std::future::Future;
use std::pin::Pin;

/// Schedules work for the retain runtime.
///
/// Implementations are responsible for making the host drain the task runtime
/// and produce frames. They must be safe to use from multiple threads.
pub trait RuntimeScheduler: Send + Sync {
    /// Request that the host schedule a new frame (and drain pending tasks).
    fn schedule_frame(&self);
}

/// Provides timing information for the runtime.
pub trait Clock: Send + Sync {
    /// Instant type produced by this clock implementation.
    type Instant: Copy + Send + Sync;

    /// Returns the current instant.
    fn now(&self) -> Self::Instant;

    /// Returns the number of milliseconds elapsed since `since`.
    fn elapsed_millis(&self, since: Self::Instant) -> u64;
}

pub type WaitFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Gate awaited by every disposal task before it evicts its slot.
///
/// Hosts that draw frames resolve the future once a frame was produced while
/// in the foreground, so objects are not disposed during a transient trip to
/// the background. Hosts without a frame concept return a ready future.
pub trait PlatformWait: Send + Sync {
    fn await_before_disposing(&self, in_foreground: bool) -> WaitFuture;
}

/// Wait primitive for hosts with no meaningful "next frame".
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateWait;

impl PlatformWait for ImmediateWait {
    fn await_before_disposing(&self, _in_foreground: bool) -> WaitFuture {
        Box::pin(std::future::ready(()))
    }
}
