//! Retrieval entry points called from composable content.
//!
//! Each retrieval resolves the slot id, makes sure the owner's container
//! exists and observes the composition's lifecycle, remembers a
//! [`DisposalObserver`] for the slot and finally asks the container for the
//! value.

use std::any::type_name;
use std::hash::Hash;
use std::sync::Arc;

use crate::composition::with_current_composer;
use crate::container::ScopedContainer;
use crate::disposal::{Disposable, TaskScope, TrackedValue};
use crate::error::RetainError;
use crate::key::{random_token, StableSlotId, VersionKey};
use crate::observer::{DisposalObserver, ResolverObserver};
use crate::resolver::{KeysInScope, ScopeKey, ScopeKeyResolver};
use crate::runtime::TaskRuntime;
use crate::store::{controller_key, Controller, ControllerStore};

/// Request for a retained value.
///
/// ```ignore
/// let session = Retain::new()
///     .version(&user_id)
///     .value(|| Session::open(user_id))?;
/// ```
#[derive(Default)]
pub struct Retain {
    version: VersionKey,
    shared: Option<StableSlotId>,
    scope: Option<(Arc<dyn ScopeKeyResolver>, ScopeKey)>,
}

impl Retain {
    pub fn new() -> Self {
        Self::default()
    }

    /// A different `key` on a later call replaces the value.
    pub fn version<K: Hash + ?Sized>(mut self, key: &K) -> Self {
        self.version = VersionKey::of(key);
        self
    }

    /// Identifies the slot by `id` instead of its position, so every call
    /// with an equal id shares one value.
    pub fn shared<K: Hash + ?Sized>(mut self, id: &K) -> Self {
        self.shared = Some(StableSlotId::derived(id));
        self
    }

    /// Keeps the value alive while `resolver` reports `key` in scope, even
    /// after this call site leaves the composition.
    pub fn in_scope<R, K>(mut self, resolver: &Arc<R>, key: &K) -> Self
    where
        R: ScopeKeyResolver + 'static,
        K: Hash + ?Sized,
    {
        let resolver: Arc<dyn ScopeKeyResolver> = resolver.clone();
        self.scope = Some((resolver, KeysInScope::scope_key(key)));
        self
    }

    pub fn value<T: Send + Sync + 'static>(
        self,
        init: impl FnOnce() -> T,
    ) -> Result<Arc<T>, RetainError> {
        let version = self.version.for_type::<T>();
        let (tracked, _) = self.retrieve(version, |_| TrackedValue::inert(Arc::new(init())))?;
        downcast_tracked(tracked)
    }

    pub fn disposable<T: Disposable>(
        self,
        init: impl FnOnce() -> T,
    ) -> Result<Arc<T>, RetainError> {
        let version = self.version.for_type::<T>();
        let (tracked, _) =
            self.retrieve(version, |_| TrackedValue::disposable(Arc::new(init())))?;
        downcast_tracked(tracked)
    }

    /// A task scope cancelled when the slot is disposed.
    pub fn task_scope(self) -> Result<TaskScope, RetainError> {
        let version = self.version.for_type::<TaskScope>();
        let (tracked, _) = self.retrieve(version, |runtime| {
            TrackedValue::task_scope(TaskScope::new(runtime.clone()))
        })?;
        downcast_tracked::<TaskScope>(tracked).map(|scope| (*scope).clone())
    }

    /// A controller living in a store of its own; disposing the slot clears
    /// the store.
    pub fn controller<C: Controller>(
        self,
        factory: impl FnOnce(&TaskRuntime) -> C,
    ) -> Result<Arc<C>, RetainError> {
        let key = controller_key::<C>()?;
        let version = self.version.for_type::<ControllerStore>();
        let (tracked, runtime) =
            self.retrieve(version, |_| TrackedValue::store(Arc::new(ControllerStore::new())))?;
        let store = downcast_tracked::<ControllerStore>(tracked)?;
        store.get_or_create(&key, || factory(&runtime))
    }

    fn retrieve(
        self,
        version: VersionKey,
        build: impl FnOnce(&TaskRuntime) -> TrackedValue,
    ) -> Result<(TrackedValue, TaskRuntime), RetainError> {
        let Retain { shared, scope, .. } = self;
        let (container, slot) = with_current_composer(|composer| {
            let owner = composer.container_owner()?;
            let lifecycle = composer.lifecycle()?;
            let container = owner.container()?;
            container.attach_to_lifecycle(&lifecycle);
            let slot = match (shared, &scope) {
                (Some(slot), _) => slot,
                // Keyed by position and scope key so an item scrolled back
                // into view finds the value its resolver kept alive.
                (None, Some((_, key))) => {
                    StableSlotId::derived(&("scoped", composer.positional_key(), *key))
                }
                (None, None) => StableSlotId::from_raw(composer.remember_saveable(random_token)),
            };
            let observed = container.clone();
            composer.remember_observer(&(container.id(), slot.clone()), || {
                DisposalObserver::new(observed, slot.clone())
            });
            Ok::<_, RetainError>((container, slot))
        })??;
        let runtime = container.runtime().clone();
        let builder = || build(&runtime);
        let tracked = match scope {
            Some((resolver, key)) => {
                container.get_or_build_in_scope(&slot, version, resolver, key, builder)
            }
            None => container.get_or_build(&slot, version, builder),
        };
        Ok((tracked, runtime))
    }
}

fn downcast_tracked<T: Send + Sync + 'static>(tracked: TrackedValue) -> Result<Arc<T>, RetainError> {
    tracked
        .downcast::<T>()
        .ok_or_else(|| RetainError::SlotTypeMismatch {
            slot: format!("{tracked:?}"),
            expected: type_name::<T>(),
        })
}

pub fn retain<T: Send + Sync + 'static>(init: impl FnOnce() -> T) -> Result<Arc<T>, RetainError> {
    Retain::new().value(init)
}

/// Like [`retain`]; a different `key` on a later call replaces the value.
pub fn retain_with_key<K: Hash + ?Sized, T: Send + Sync + 'static>(
    key: &K,
    init: impl FnOnce() -> T,
) -> Result<Arc<T>, RetainError> {
    Retain::new().version(key).value(init)
}

pub fn retain_disposable<T: Disposable>(init: impl FnOnce() -> T) -> Result<Arc<T>, RetainError> {
    Retain::new().disposable(init)
}

pub fn retain_disposable_with_key<K: Hash + ?Sized, T: Disposable>(
    key: &K,
    init: impl FnOnce() -> T,
) -> Result<Arc<T>, RetainError> {
    Retain::new().version(key).disposable(init)
}

pub fn retain_task_scope() -> Result<TaskScope, RetainError> {
    Retain::new().task_scope()
}

pub fn retain_controller<C: Controller>(
    factory: impl FnOnce(&TaskRuntime) -> C,
) -> Result<Arc<C>, RetainError> {
    Retain::new().controller(factory)
}

pub fn retain_controller_with_key<K: Hash + ?Sized, C: Controller>(
    key: &K,
    factory: impl FnOnce(&TaskRuntime) -> C,
) -> Result<Arc<C>, RetainError> {
    Retain::new().version(key).controller(factory)
}

/// A resolver whose key set is `keys`, for use with [`Retain::in_scope`].
///
/// Slots it keeps alive are re-checked whenever the key set changes and are
/// released once the resolver itself leaves the composition.
pub fn retain_keys_in_scope<K: Hash>(
    keys: impl IntoIterator<Item = K>,
) -> Result<Arc<KeysInScope>, RetainError> {
    let (container, resolver): (ScopedContainer, Arc<KeysInScope>) =
        with_current_composer(|composer| {
            let owner = composer.container_owner()?;
            let lifecycle = composer.lifecycle()?;
            let container = owner.container()?;
            container.attach_to_lifecycle(&lifecycle);
            let resolver = (*composer.remember(|| Arc::new(KeysInScope::new()))).clone();
            let observed = container.clone();
            composer.remember_observer(&(container.id(), resolver.id()), || {
                ResolverObserver::new(observed, resolver.id())
            });
            Ok::<_, RetainError>((container, resolver))
        })??;
    if resolver.set_keys(keys) {
        container.on_resolver_updated(resolver.id());
    }
    Ok(resolver)
}
