//! The lifecycle-scoped container.
//!
//! Every retained object lives in a [`ScopedContainer`] under its
//! [`StableSlotId`]. A slot moves through `absent -> active -> marked ->
//! (active | evicted)`: consumers leaving composition mark it, a disposal task
//! waits for the platform to confirm the UI is live, and only then evicts it.
//! Requesting the slot again before that point cancels the task.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use indexmap::IndexMap;

use crate::hashing::map::{HashMap, HashSet};
use crate::disposal::{ObjectId, TrackedValue};
use crate::key::{StableSlotId, VersionKey};
use crate::lifecycle::{LifecycleEvent, LifecycleObserver, LifecycleRegistry};
use crate::lock;
use crate::platform::PlatformWait;
use crate::resolver::{ResolverId, ScopeKey, ScopeKeyResolver};
use crate::runtime::{TaskHandle, TaskRuntime};

struct PendingDisposal {
    token: u64,
    handle: Option<TaskHandle>,
}

/// Disposal reserved under the state lock, launched once the lock is released.
struct ScheduledDisposal {
    slot: StableSlotId,
    token: u64,
    in_foreground: bool,
}

#[derive(Clone)]
pub(crate) struct ResolverBinding {
    key: ScopeKey,
    resolver: Arc<dyn ScopeKeyResolver>,
}

impl ResolverBinding {
    pub(crate) fn new(resolver: Arc<dyn ScopeKeyResolver>, key: ScopeKey) -> Self {
        Self { key, resolver }
    }

    fn in_scope(&self) -> bool {
        self.resolver.is_key_in_scope(self.key)
    }
}

struct ContainerState {
    values: IndexMap<StableSlotId, TrackedValue>,
    versions: HashMap<StableSlotId, VersionKey>,
    marked: HashSet<StableSlotId>,
    consumers: HashMap<StableSlotId, usize>,
    pending: HashMap<StableSlotId, PendingDisposal>,
    bindings: HashMap<StableSlotId, ResolverBinding>,
    kept_alive: HashMap<ResolverId, HashSet<StableSlotId>>,
    in_foreground: bool,
    changing_configuration: bool,
    torn_down: bool,
}

impl ContainerState {
    fn new() -> Self {
        Self {
            values: IndexMap::new(),
            versions: HashMap::new(),
            marked: HashSet::new(),
            consumers: HashMap::new(),
            pending: HashMap::new(),
            bindings: HashMap::new(),
            kept_alive: HashMap::new(),
            in_foreground: false,
            changing_configuration: false,
            torn_down: false,
        }
    }

    fn cancel_pending(&mut self, slot: &StableSlotId) {
        if let Some(pending) = self.pending.remove(slot) {
            log::trace!("cancelling pending disposal of {slot}");
            if let Some(handle) = pending.handle {
                handle.cancel();
            }
        }
    }

    fn release_keep_alive(&mut self, slot: &StableSlotId) {
        self.kept_alive.retain(|_, slots| {
            slots.remove(slot);
            !slots.is_empty()
        });
    }

    fn is_aliased(&self, value: &TrackedValue) -> bool {
        self.values.values().any(|other| other.same_instance(value))
    }

    /// Drops every record of `slot`. Returns the value when no other slot
    /// still holds the same instance.
    fn evict(&mut self, slot: &StableSlotId) -> Option<TrackedValue> {
        self.marked.remove(slot);
        self.versions.remove(slot);
        self.bindings.remove(slot);
        self.release_keep_alive(slot);
        let value = self.values.shift_remove(slot)?;
        if self.is_aliased(&value) {
            log::debug!("{slot} evicted, value still shared by another slot");
            return None;
        }
        Some(value)
    }
}

struct ContainerShared {
    state: Mutex<ContainerState>,
    runtime: TaskRuntime,
    wait: Arc<dyn PlatformWait>,
    next_token: AtomicU64,
    observer: Arc<dyn LifecycleObserver>,
    lifecycle: Mutex<Option<LifecycleRegistry>>,
}

struct ContainerLifecycleObserver {
    container: Weak<ContainerShared>,
}

impl LifecycleObserver for ContainerLifecycleObserver {
    fn on_lifecycle_event(&self, event: LifecycleEvent) {
        if let Some(shared) = self.container.upgrade() {
            ScopedContainer { shared }.on_lifecycle_event(event);
        }
    }
}

/// Owner of every retained value of one scope.
///
/// Cloning yields another handle to the same container.
#[derive(Clone)]
pub struct ScopedContainer {
    shared: Arc<ContainerShared>,
}

impl ScopedContainer {
    pub fn new(runtime: TaskRuntime, wait: Arc<dyn PlatformWait>) -> Self {
        let shared = Arc::new_cyclic(|weak: &Weak<ContainerShared>| ContainerShared {
            state: Mutex::new(ContainerState::new()),
            runtime,
            wait,
            next_token: AtomicU64::new(1),
            observer: Arc::new(ContainerLifecycleObserver {
                container: weak.clone(),
            }),
            lifecycle: Mutex::new(None),
        });
        Self { shared }
    }

    pub(crate) fn id(&self) -> ObjectId {
        ObjectId::of(&self.shared)
    }

    pub fn runtime(&self) -> &TaskRuntime {
        &self.shared.runtime
    }

    /// Subscribes to `registry`, leaving the previously observed one.
    /// Attaching to the registry already observed does nothing.
    pub fn attach_to_lifecycle(&self, registry: &LifecycleRegistry) {
        let previous = {
            let mut current = lock(&self.shared.lifecycle);
            if current
                .as_ref()
                .is_some_and(|current| current.is_same(registry))
            {
                return;
            }
            current.replace(registry.clone())
        };
        if let Some(previous) = previous {
            previous.detach(&self.shared.observer);
        }
        registry.attach(Arc::clone(&self.shared.observer));
    }

    /// Returns the value in `slot` when its version matches, otherwise
    /// replaces it with a freshly built one.
    ///
    /// Any pending disposal of the slot is cancelled first. A replaced value is
    /// disposed before `builder` runs unless another slot shares it.
    pub fn get_or_build(
        &self,
        slot: &StableSlotId,
        version: VersionKey,
        builder: impl FnOnce() -> TrackedValue,
    ) -> TrackedValue {
        self.get_or_build_with(slot, version, None, builder)
    }

    /// Like [`get_or_build`](Self::get_or_build), and binds the slot to `key`
    /// of `resolver`: while the key is in scope the slot survives its
    /// consumer leaving composition.
    pub fn get_or_build_in_scope(
        &self,
        slot: &StableSlotId,
        version: VersionKey,
        resolver: Arc<dyn ScopeKeyResolver>,
        key: ScopeKey,
        builder: impl FnOnce() -> TrackedValue,
    ) -> TrackedValue {
        let binding = ResolverBinding::new(resolver, key);
        self.get_or_build_with(slot, version, Some(binding), builder)
    }

    fn get_or_build_with(
        &self,
        slot: &StableSlotId,
        version: VersionKey,
        binding: Option<ResolverBinding>,
        builder: impl FnOnce() -> TrackedValue,
    ) -> TrackedValue {
        let replaced = {
            let mut state = lock(&self.shared.state);
            if state.torn_down {
                drop(state);
                log::warn!("container is torn down, {slot} is built untracked");
                return builder();
            }
            state.cancel_pending(slot);
            state.marked.remove(slot);
            state.release_keep_alive(slot);
            match binding {
                Some(binding) => {
                    state.bindings.insert(slot.clone(), binding);
                }
                None => {
                    state.bindings.remove(slot);
                }
            }
            if state.versions.get(slot) == Some(&version) {
                if let Some(existing) = state.values.get(slot) {
                    return existing.clone();
                }
            }
            state.versions.remove(slot);
            match state.values.shift_remove(slot) {
                Some(old) if !state.is_aliased(&old) => Some(old),
                _ => None,
            }
        };
        if let Some(old) = replaced {
            log::debug!("replacing value of {slot}");
            run_disposal(slot, old);
        }

        let value = builder();
        let mut state = lock(&self.shared.state);
        if state.torn_down {
            log::warn!("container torn down while building {slot}, value is untracked");
            return value;
        }
        if state.versions.get(slot) == Some(&version) {
            if let Some(existing) = state.values.get(slot).cloned() {
                let discard = !value.same_instance(&existing) && !state.is_aliased(&value);
                drop(state);
                log::trace!("{slot} was built concurrently, keeping the first value");
                if discard {
                    run_disposal(slot, value);
                }
                return existing;
            }
        }
        log::debug!("created {slot}");
        state.versions.insert(slot.clone(), version);
        state.values.insert(slot.clone(), value.clone());
        value
    }

    /// Registers one more consumer of `slot`. Each consumer is released by
    /// exactly one [`on_slot_abandoned`](Self::on_slot_abandoned) call.
    pub fn add_consumer(&self, slot: &StableSlotId) {
        let mut state = lock(&self.shared.state);
        if state.torn_down {
            return;
        }
        *state.consumers.entry(slot.clone()).or_insert(0) += 1;
    }

    /// Number of registered consumers of `slot` still composed.
    pub fn consumer_count(&self, slot: &StableSlotId) -> usize {
        lock(&self.shared.state)
            .consumers
            .get(slot)
            .copied()
            .unwrap_or(0)
    }

    /// Signals that a consumer of `slot` left composition.
    ///
    /// Once no registered consumer remains, the slot is marked and a disposal
    /// attempt is scheduled, unless it is bound to a resolver that still
    /// reports its key in scope.
    pub fn on_slot_abandoned(&self, slot: &StableSlotId) {
        let binding = {
            let mut state = lock(&self.shared.state);
            if state.torn_down {
                return;
            }
            if let Some(count) = state.consumers.get_mut(slot) {
                *count = count.saturating_sub(1);
                let remaining = *count;
                if remaining > 0 {
                    log::trace!("{slot} still has {remaining} consumers");
                    return;
                }
                state.consumers.remove(slot);
            }
            if !state.values.contains_key(slot) {
                log::trace!("ignoring abandonment of untracked {slot}");
                return;
            }
            state.bindings.get(slot).cloned()
        };
        if let Some(binding) = binding {
            if binding.in_scope() {
                let mut state = lock(&self.shared.state);
                if state.values.contains_key(slot) {
                    log::debug!("{slot} kept alive by resolver {:?}", binding.resolver.id());
                    state
                        .kept_alive
                        .entry(binding.resolver.id())
                        .or_default()
                        .insert(slot.clone());
                }
                return;
            }
        }
        self.mark(slot);
    }

    /// Re-checks the slots kept alive by `resolver` and marks those whose key
    /// left scope.
    pub fn on_resolver_updated(&self, resolver: ResolverId) {
        let kept: Vec<(StableSlotId, Option<ResolverBinding>)> = {
            let state = lock(&self.shared.state);
            let Some(slots) = state.kept_alive.get(&resolver) else {
                return;
            };
            slots
                .iter()
                .map(|slot| (slot.clone(), state.bindings.get(slot).cloned()))
                .collect()
        };
        for (slot, binding) in kept {
            if binding.as_ref().is_some_and(ResolverBinding::in_scope) {
                continue;
            }
            {
                let mut state = lock(&self.shared.state);
                if let Some(slots) = state.kept_alive.get_mut(&resolver) {
                    slots.remove(&slot);
                    if slots.is_empty() {
                        state.kept_alive.remove(&resolver);
                    }
                }
            }
            log::debug!("{slot} left the scope of resolver {resolver:?}");
            self.mark(&slot);
        }
    }

    /// Marks every slot that `resolver` was keeping alive and forgets the
    /// resolver's bindings.
    pub fn on_resolver_abandoned(&self, resolver: ResolverId) {
        let scheduled: Vec<ScheduledDisposal> = {
            let mut state = lock(&self.shared.state);
            if state.torn_down {
                return;
            }
            state
                .bindings
                .retain(|_, binding| binding.resolver.id() != resolver);
            let Some(slots) = state.kept_alive.remove(&resolver) else {
                return;
            };
            log::debug!(
                "resolver {resolver:?} abandoned, releasing {} slots",
                slots.len()
            );
            let mut scheduled = Vec::new();
            for slot in slots {
                if state.values.contains_key(&slot) {
                    state.marked.insert(slot.clone());
                    scheduled.extend(self.reserve_disposal(&mut state, &slot));
                }
            }
            scheduled
        };
        self.launch_disposals(scheduled);
    }

    fn mark(&self, slot: &StableSlotId) {
        let scheduled = {
            let mut state = lock(&self.shared.state);
            if state.torn_down || !state.values.contains_key(slot) {
                return;
            }
            log::debug!("marking {slot} for disposal");
            state.marked.insert(slot.clone());
            self.reserve_disposal(&mut state, slot)
        };
        self.launch_disposals(scheduled);
    }

    /// Reserves a disposal token for `slot` unless a disposal is already in
    /// flight. The task itself is spawned by
    /// [`launch_disposals`](Self::launch_disposals).
    fn reserve_disposal(
        &self,
        state: &mut ContainerState,
        slot: &StableSlotId,
    ) -> Option<ScheduledDisposal> {
        if state.pending.contains_key(slot) {
            log::trace!("disposal of {slot} already in flight");
            return None;
        }
        let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
        state
            .pending
            .insert(slot.clone(), PendingDisposal { token, handle: None });
        Some(ScheduledDisposal {
            slot: slot.clone(),
            token,
            in_foreground: state.in_foreground,
        })
    }

    /// Spawns reserved disposal tasks. Must be called without the state lock:
    /// the wait primitive and the scheduler behind `spawn` are host code.
    fn launch_disposals(&self, scheduled: impl IntoIterator<Item = ScheduledDisposal>) {
        for ScheduledDisposal {
            slot,
            token,
            in_foreground,
        } in scheduled
        {
            let gate = self.shared.wait.await_before_disposing(in_foreground);
            let container = Arc::downgrade(&self.shared);
            let task_slot = slot.clone();
            let handle = self.shared.runtime.spawn(async move {
                gate.await;
                if let Some(shared) = container.upgrade() {
                    ScopedContainer { shared }.complete_disposal(&task_slot, token);
                }
            });
            let orphaned = {
                let mut state = lock(&self.shared.state);
                match state.pending.get_mut(&slot) {
                    Some(pending) if pending.token == token => {
                        pending.handle = Some(handle);
                        None
                    }
                    _ => Some(handle),
                }
            };
            if let Some(handle) = orphaned {
                log::trace!("disposal of {slot} was cancelled before it launched");
                handle.cancel();
            }
        }
    }

    /// Eviction step of a disposal task. Runs entirely under the state lock,
    /// so a concurrent `get_or_build` either cancels it beforehand or sees the
    /// slot already gone.
    fn complete_disposal(&self, slot: &StableSlotId, token: u64) {
        let evicted = {
            let mut state = lock(&self.shared.state);
            match state.pending.get(slot) {
                Some(pending) if pending.token == token => {}
                _ => {
                    log::trace!("stale disposal task for {slot}");
                    return;
                }
            }
            state.pending.remove(slot);
            if !(state.in_foreground || state.changing_configuration) {
                log::trace!("{slot} stays marked until the next resume");
                return;
            }
            log::debug!("evicting {slot}");
            state.evict(slot)
        };
        if let Some(value) = evicted {
            run_disposal(slot, value);
        }
    }

    pub fn on_lifecycle_event(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Resume => {
                let scheduled: Vec<ScheduledDisposal> = {
                    let mut state = lock(&self.shared.state);
                    state.in_foreground = true;
                    state.changing_configuration = false;
                    let marked: Vec<StableSlotId> = state.marked.iter().cloned().collect();
                    if !marked.is_empty() {
                        log::debug!("retrying disposal of {} marked slots", marked.len());
                    }
                    marked
                        .iter()
                        .filter_map(|slot| self.reserve_disposal(&mut state, slot))
                        .collect()
                };
                self.launch_disposals(scheduled);
            }
            LifecycleEvent::Pause => {
                lock(&self.shared.state).in_foreground = false;
            }
            LifecycleEvent::Destroy => {
                let registry = lock(&self.shared.lifecycle).take();
                if let Some(registry) = registry {
                    registry.detach(&self.shared.observer);
                }
            }
            LifecycleEvent::Create | LifecycleEvent::Start | LifecycleEvent::Stop => {}
        }
    }

    pub fn set_changing_configuration(&self, changing: bool) {
        lock(&self.shared.state).changing_configuration = changing;
    }

    /// Cancels every disposal task and disposes every tracked value, in
    /// insertion order. A value shared by several slots is disposed once.
    pub fn teardown(&self) {
        let (values, pending) = {
            let mut state = lock(&self.shared.state);
            if state.torn_down {
                return;
            }
            state.torn_down = true;
            state.versions.clear();
            state.marked.clear();
            state.consumers.clear();
            state.bindings.clear();
            state.kept_alive.clear();
            let pending: Vec<PendingDisposal> =
                state.pending.drain().map(|(_, pending)| pending).collect();
            (std::mem::take(&mut state.values), pending)
        };
        for handle in pending.into_iter().filter_map(|pending| pending.handle) {
            handle.cancel();
        }
        let registry = lock(&self.shared.lifecycle).take();
        if let Some(registry) = registry {
            registry.detach(&self.shared.observer);
        }

        log::debug!("tearing down container with {} values", values.len());
        let values: Vec<(StableSlotId, TrackedValue)> = values.into_iter().collect();
        for (index, (slot, value)) in values.iter().enumerate() {
            let shared_later = values[index + 1..]
                .iter()
                .any(|(_, other)| other.same_instance(value));
            if !shared_later {
                run_disposal(slot, value.clone());
            }
        }
    }

    pub fn get(&self, slot: &StableSlotId) -> Option<TrackedValue> {
        lock(&self.shared.state).values.get(slot).cloned()
    }

    pub fn contains(&self, slot: &StableSlotId) -> bool {
        lock(&self.shared.state).values.contains_key(slot)
    }

    pub fn len(&self) -> usize {
        lock(&self.shared.state).values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_marked(&self, slot: &StableSlotId) -> bool {
        lock(&self.shared.state).marked.contains(slot)
    }

    pub fn has_pending_disposal(&self, slot: &StableSlotId) -> bool {
        lock(&self.shared.state).pending.contains_key(slot)
    }

    pub fn in_foreground(&self) -> bool {
        lock(&self.shared.state).in_foreground
    }

    pub fn is_changing_configuration(&self) -> bool {
        lock(&self.shared.state).changing_configuration
    }

    pub fn is_torn_down(&self) -> bool {
        lock(&self.shared.state).torn_down
    }

    /// Tracked slots in insertion order.
    pub fn slot_ids(&self) -> Vec<StableSlotId> {
        lock(&self.shared.state).values.keys().cloned().collect()
    }
}

impl fmt::Debug for ScopedContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("ScopedContainer")
            .field("values", &state.values.len())
            .field("marked", &state.marked.len())
            .field("pending", &state.pending.len())
            .field("in_foreground", &state.in_foreground)
            .field("changing_configuration", &state.changing_configuration)
            .field("torn_down", &state.torn_down)
            .finish()
    }
}

fn run_disposal(slot: &StableSlotId, value: TrackedValue) {
    let strategy = value.strategy().clone();
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| strategy.run())) {
        log::error!(
            "disposal of {slot} ({strategy:?}) panicked: {}",
            panic_message(payload.as_ref())
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
