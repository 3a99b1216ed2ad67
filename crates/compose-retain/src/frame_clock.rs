use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Waker};

use crate::lock;
use crate::platform::{PlatformWait, RuntimeScheduler, WaitFuture};

pub(crate) type FrameCallbackId = u64;

type FrameCallback = Box<dyn FnOnce(u64) + Send + 'static>;

struct FrameCallbackEntry {
    id: FrameCallbackId,
    callback: Option<FrameCallback>,
}

struct FrameCallbacks {
    entries: VecDeque<FrameCallbackEntry>,
    next_id: FrameCallbackId,
}

struct FrameClockInner {
    scheduler: Arc<dyn RuntimeScheduler>,
    callbacks: Mutex<FrameCallbacks>,
}

impl FrameClockInner {
    fn cancel(&self, id: FrameCallbackId) {
        let mut callbacks = lock(&self.callbacks);
        if let Some(index) = callbacks.entries.iter().position(|entry| entry.id == id) {
            callbacks.entries.remove(index);
        }
    }
}

/// Registry of callbacks fired on the next frame the host produces.
#[derive(Clone)]
pub struct FrameClock {
    inner: Arc<FrameClockInner>,
}

impl FrameClock {
    pub fn new(scheduler: Arc<dyn RuntimeScheduler>) -> Self {
        Self {
            inner: Arc::new(FrameClockInner {
                scheduler,
                callbacks: Mutex::new(FrameCallbacks {
                    entries: VecDeque::new(),
                    next_id: 1,
                }),
            }),
        }
    }

    pub fn with_frame_nanos(
        &self,
        callback: impl FnOnce(u64) + Send + 'static,
    ) -> FrameCallbackRegistration {
        let id = {
            let mut callbacks = lock(&self.inner.callbacks);
            let id = callbacks.next_id;
            callbacks.next_id += 1;
            callbacks.entries.push_back(FrameCallbackEntry {
                id,
                callback: Some(Box::new(callback)),
            });
            id
        };
        self.inner.scheduler.schedule_frame();
        FrameCallbackRegistration {
            clock: Arc::downgrade(&self.inner),
            id: Some(id),
        }
    }

    /// Future resolving with the timestamp of the next produced frame.
    pub fn next_frame(&self) -> NextFrame {
        NextFrame {
            clock: self.clone(),
            state: Arc::new(Mutex::new(NextFrameState::default())),
            registration: None,
        }
    }

    /// Fires every callback registered before this call. Called by the host
    /// once per produced frame.
    pub fn drain_frame_callbacks(&self, frame_time_nanos: u64) {
        let pending: Vec<FrameCallback> = {
            let mut callbacks = lock(&self.inner.callbacks);
            callbacks
                .entries
                .drain(..)
                .filter_map(|mut entry| entry.callback.take())
                .collect()
        };
        for callback in pending {
            callback(frame_time_nanos);
        }
    }

    pub fn has_frame_callbacks(&self) -> bool {
        !lock(&self.inner.callbacks).entries.is_empty()
    }
}

pub struct FrameCallbackRegistration {
    clock: Weak<FrameClockInner>,
    id: Option<FrameCallbackId>,
}

impl FrameCallbackRegistration {
    pub fn cancel(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(id) = self.id.take() {
            if let Some(clock) = self.clock.upgrade() {
                clock.cancel(id);
            }
        }
    }
}

impl Drop for FrameCallbackRegistration {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Default)]
struct NextFrameState {
    frame_time: Option<u64>,
    waker: Option<Waker>,
}

/// Future returned by [`FrameClock::next_frame`]. Dropping it unregisters the
/// frame callback.
pub struct NextFrame {
    clock: FrameClock,
    state: Arc<Mutex<NextFrameState>>,
    registration: Option<FrameCallbackRegistration>,
}

impl Future for NextFrame {
    type Output = u64;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<u64> {
        let this = self.get_mut();
        {
            let mut state = lock(&this.state);
            if let Some(frame_time) = state.frame_time {
                return Poll::Ready(frame_time);
            }
            state.waker = Some(cx.waker().clone());
        }
        if this.registration.is_none() {
            let state = Arc::clone(&this.state);
            this.registration = Some(this.clock.with_frame_nanos(move |frame_time| {
                let waker = {
                    let mut state = lock(&state);
                    state.frame_time = Some(frame_time);
                    state.waker.take()
                };
                if let Some(waker) = waker {
                    waker.wake();
                }
            }));
        }
        Poll::Pending
    }
}

/// Wait primitive for hosts that draw frames: in the background, disposal
/// waits until the host produces its next frame, which only happens once the
/// UI is live again.
#[derive(Clone)]
pub struct FrameWait {
    clock: FrameClock,
}

impl FrameWait {
    pub fn new(clock: FrameClock) -> Self {
        Self { clock }
    }
}

impl PlatformWait for FrameWait {
    fn await_before_disposing(&self, in_foreground: bool) -> WaitFuture {
        if in_foreground {
            return Box::pin(std::future::ready(()));
        }
        let frame = self.clock.next_frame();
        Box::pin(async move {
            let frame_time = frame.await;
            log::trace!("disposal wait released by frame at {frame_time}ns");
        })
    }
}
