#![doc = r"Lifecycle-scoped retention of objects for the Compose-RS experiment."]

extern crate self as compose_retain;

pub mod composition;
pub mod container;
pub mod disposal;
pub mod error;
pub mod frame_clock;
pub mod hashing;
pub mod key;
pub mod lifecycle;
pub mod observer;
pub mod owner;
pub mod platform;
pub mod resolver;
pub mod retain;
pub mod runtime;
pub mod store;

pub use composition::{
    group, remember, remember_saveable, with_current_composer, with_key, Composer, Composition,
    RememberObserver, SavedState, SlotTable,
};
pub use container::ScopedContainer;
pub use disposal::{Disposable, DisposalStrategy, TaskScope, TrackedValue};
pub use error::RetainError;
pub use frame_clock::{FrameCallbackRegistration, FrameClock, FrameWait, NextFrame};
pub use key::{StableSlotId, VersionKey};
pub use lifecycle::{LifecycleEvent, LifecycleObserver, LifecycleRegistry, LifecycleState};
pub use observer::{DisposalObserver, ResolverObserver};
pub use owner::ContainerOwner;
pub use platform::{Clock, ImmediateWait, PlatformWait, RuntimeScheduler, WaitFuture};
pub use resolver::{KeysInScope, ResolverId, ScopeKey, ScopeKeyResolver};
pub use retain::{
    retain, retain_controller, retain_controller_with_key, retain_disposable,
    retain_disposable_with_key, retain_keys_in_scope, retain_task_scope, retain_with_key, Retain,
};
pub use runtime::{TaskHandle, TaskId, TaskRuntime};
pub use store::{controller_key, Controller, ControllerStore};

#[cfg(test)]
pub use runtime::TestScheduler;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub type Key = u64;

/// Group key for a source location, for hosts that key groups by call site.
pub fn location_key(file: &str, line: u32, column: u32) -> Key {
    hashing::hash_one(&(file, line, column))
}

/// Locks `mutex`, recovering the guard if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "tests/container_tests.rs"]
mod container_tests;

#[cfg(test)]
#[path = "tests/composition_tests.rs"]
mod composition_tests;

#[cfg(test)]
#[path = "tests/retain_tests.rs"]
mod retain_tests;

#[cfg(test)]
#[path = "tests/property_tests.rs"]
mod property_tests;
