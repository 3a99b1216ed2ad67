//! Host lifecycle signal.
//!
//! The [`LifecycleRegistry`] is what a host window, screen or navigation entry
//! drives; observers such as the scoped container subscribe to it explicitly.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::disposal::ObjectId;
use crate::lock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleState {
    Destroyed,
    Initialized,
    Created,
    Started,
    Resumed,
}

impl LifecycleState {
    pub fn is_at_least(self, state: LifecycleState) -> bool {
        self >= state
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    Create,
    Start,
    Resume,
    Pause,
    Stop,
    Destroy,
}

impl LifecycleEvent {
    /// State the registry is in right after dispatching this event.
    pub fn target_state(self) -> LifecycleState {
        match self {
            LifecycleEvent::Create => LifecycleState::Created,
            LifecycleEvent::Start => LifecycleState::Started,
            LifecycleEvent::Resume => LifecycleState::Resumed,
            LifecycleEvent::Pause => LifecycleState::Started,
            LifecycleEvent::Stop => LifecycleState::Created,
            LifecycleEvent::Destroy => LifecycleState::Destroyed,
        }
    }

    /// Events an observer attaching late receives to catch up with `state`.
    fn replay_up_to(state: LifecycleState) -> &'static [LifecycleEvent] {
        const ALL: [LifecycleEvent; 3] = [
            LifecycleEvent::Create,
            LifecycleEvent::Start,
            LifecycleEvent::Resume,
        ];
        match state {
            LifecycleState::Destroyed | LifecycleState::Initialized => &[],
            LifecycleState::Created => &ALL[..1],
            LifecycleState::Started => &ALL[..2],
            LifecycleState::Resumed => &ALL[..],
        }
    }
}

pub trait LifecycleObserver: Send + Sync {
    fn on_lifecycle_event(&self, event: LifecycleEvent);
}

struct RegistryState {
    state: LifecycleState,
    observers: Vec<Arc<dyn LifecycleObserver>>,
}

/// Lifecycle signal source.
///
/// Attaching is idempotent by observer identity and replays the events needed
/// to reach the current state. `Destroy` is terminal: it is delivered at most
/// once and later events are dropped.
#[derive(Clone)]
pub struct LifecycleRegistry {
    inner: Arc<Mutex<RegistryState>>,
}

impl LifecycleRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryState {
                state: LifecycleState::Initialized,
                observers: Vec::new(),
            })),
        }
    }

    pub fn current_state(&self) -> LifecycleState {
        lock(&self.inner).state
    }

    pub fn is_same(&self, other: &LifecycleRegistry) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns `false` when the observer was already attached or the
    /// registry is destroyed.
    pub fn attach(&self, observer: Arc<dyn LifecycleObserver>) -> bool {
        let replay = {
            let mut registry = lock(&self.inner);
            if registry.state == LifecycleState::Destroyed {
                return false;
            }
            let id = ObjectId::of(&observer);
            if registry
                .observers
                .iter()
                .any(|existing| ObjectId::of(existing) == id)
            {
                return false;
            }
            registry.observers.push(Arc::clone(&observer));
            LifecycleEvent::replay_up_to(registry.state)
        };
        for event in replay {
            observer.on_lifecycle_event(*event);
        }
        true
    }

    pub fn detach(&self, observer: &Arc<dyn LifecycleObserver>) -> bool {
        let id = ObjectId::of(observer);
        let mut registry = lock(&self.inner);
        let before = registry.observers.len();
        registry
            .observers
            .retain(|existing| ObjectId::of(existing) != id);
        registry.observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.inner).observers.len()
    }

    pub fn handle_event(&self, event: LifecycleEvent) {
        let observers = {
            let mut registry = lock(&self.inner);
            if registry.state == LifecycleState::Destroyed {
                log::warn!("dropping lifecycle event {event:?} after destroy");
                return;
            }
            registry.state = event.target_state();
            registry.observers.clone()
        };
        for observer in observers {
            observer.on_lifecycle_event(event);
        }
        if event == LifecycleEvent::Destroy {
            lock(&self.inner).observers.clear();
        }
    }

    /// Dispatches the events that move the registry step by step to `state`.
    pub fn move_to(&self, state: LifecycleState) {
        loop {
            let current = self.current_state();
            let next = match (current, state) {
                (LifecycleState::Destroyed, _) => return,
                (current, target) if current == target => return,
                (LifecycleState::Initialized, LifecycleState::Destroyed) => LifecycleEvent::Destroy,
                (LifecycleState::Initialized, _) => LifecycleEvent::Create,
                (LifecycleState::Created, LifecycleState::Destroyed) => LifecycleEvent::Destroy,
                (LifecycleState::Created, LifecycleState::Initialized) => return,
                (LifecycleState::Created, _) => LifecycleEvent::Start,
                (LifecycleState::Started, LifecycleState::Resumed) => LifecycleEvent::Resume,
                (LifecycleState::Started, _) => LifecycleEvent::Stop,
                (LifecycleState::Resumed, _) => LifecycleEvent::Pause,
            };
            self.handle_event(next);
        }
    }
}

impl Default for LifecycleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LifecycleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = lock(&self.inner);
        f.debug_struct("LifecycleRegistry")
            .field("state", &registry.state)
            .field("observers", &registry.observers.len())
            .finish()
    }
}
