//! Keyed storage for controller objects.
//!
//! A [`ControllerStore`] is what a retained controller actually lives in: the
//! container tracks the store, and clearing the store clears every controller
//! in it.

use std::any::{type_name, Any};
use std::fmt;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

use crate::disposal::{Disposable, TaskScope};
use crate::error::RetainError;
use crate::lock;

/// Long-lived object that owns work on behalf of a screen.
pub trait Controller: Any + Send + Sync {
    /// Scope cancelled when the controller is cleared.
    fn task_scope(&self) -> Option<&TaskScope> {
        None
    }

    /// Store of child controllers, cleared together with this one.
    fn nested_store(&self) -> Option<&ControllerStore> {
        None
    }

    /// Called once after the task scope was cancelled.
    fn on_cleared(&self) {}
}

struct StoreEntry {
    any: Arc<dyn Any + Send + Sync>,
    controller: Arc<dyn Controller>,
    type_name: &'static str,
}

#[derive(Default)]
pub struct ControllerStore {
    entries: Mutex<IndexMap<String, StoreEntry>>,
}

/// Key a controller type is stored under.
pub fn controller_key<C: 'static>() -> Result<String, RetainError> {
    let name = type_name::<C>();
    if name.contains("{{closure}}") || name.contains("{{opaque}}") {
        return Err(RetainError::AnonymousController { type_name: name });
    }
    Ok(format!("compose_retain.controller:{name}"))
}

impl ControllerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the controller under `key`, creating it with `factory` when
    /// absent. The factory runs without the store lock held, so it may build
    /// nested stores.
    pub fn get_or_create<C: Controller>(
        &self,
        key: &str,
        factory: impl FnOnce() -> C,
    ) -> Result<Arc<C>, RetainError> {
        if let Some(existing) = self.get::<C>(key)? {
            return Ok(existing);
        }
        let created = Arc::new(factory());
        let mut entries = lock(&self.entries);
        if let Some(entry) = entries.get(key) {
            let existing = downcast_entry::<C>(key, entry)?;
            drop(entries);
            log::trace!("discarding controller built concurrently for {key}");
            clear_controller(created.as_ref());
            return Ok(existing);
        }
        entries.insert(
            key.to_string(),
            StoreEntry {
                any: created.clone(),
                controller: created.clone(),
                type_name: type_name::<C>(),
            },
        );
        log::debug!("created controller {} under {key}", type_name::<C>());
        Ok(created)
    }

    pub fn get<C: Controller>(&self, key: &str) -> Result<Option<Arc<C>>, RetainError> {
        let entries = lock(&self.entries);
        entries
            .get(key)
            .map(|entry| downcast_entry::<C>(key, entry))
            .transpose()
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.entries).contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.entries).keys().cloned().collect()
    }

    /// Removes every controller, cancelling its scope and then calling
    /// [`Controller::on_cleared`], in insertion order.
    pub fn clear(&self) {
        let entries: Vec<StoreEntry> = {
            let mut entries = lock(&self.entries);
            entries.drain(..).map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            log::debug!("clearing controller {}", entry.type_name);
            clear_controller(entry.controller.as_ref());
        }
    }
}

fn downcast_entry<C: Controller>(key: &str, entry: &StoreEntry) -> Result<Arc<C>, RetainError> {
    entry
        .any
        .clone()
        .downcast::<C>()
        .map_err(|_| RetainError::ControllerTypeMismatch {
            key: key.to_string(),
            expected: type_name::<C>(),
        })
}

fn clear_controller(controller: &dyn Controller) {
    if let Some(scope) = controller.task_scope() {
        scope.cancel();
    }
    if let Some(nested) = controller.nested_store() {
        nested.clear();
    }
    controller.on_cleared();
}

impl Disposable for ControllerStore {
    fn dispose(&self) {
        self.clear();
    }
}

impl fmt::Debug for ControllerStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = lock(&self.entries);
        f.debug_map()
            .entries(entries.iter().map(|(key, entry)| (key, entry.type_name)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{TaskRuntime, TestScheduler};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        cleared: Arc<AtomicUsize>,
    }

    impl Controller for Counter {
        fn on_cleared(&self) {
            self.cleared.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Screen {
        scope: TaskScope,
        children: ControllerStore,
        cleared: Arc<AtomicUsize>,
    }

    impl Controller for Screen {
        fn task_scope(&self) -> Option<&TaskScope> {
            Some(&self.scope)
        }

        fn nested_store(&self) -> Option<&ControllerStore> {
            Some(&self.children)
        }

        fn on_cleared(&self) {
            assert!(!self.scope.is_active());
            self.cleared.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn get_or_create_builds_once_per_key() {
        let store = ControllerStore::new();
        let cleared = Arc::new(AtomicUsize::new(0));
        let builds = AtomicUsize::new(0);
        let key = controller_key::<Counter>().expect("named type");
        for _ in 0..3 {
            store
                .get_or_create(&key, || {
                    builds.fetch_add(1, Ordering::SeqCst);
                    Counter {
                        cleared: cleared.clone(),
                    }
                })
                .expect("same type");
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(store.keys(), vec![key]);
    }

    #[test]
    fn type_mismatch_is_reported() {
        let store = ControllerStore::new();
        let cleared = Arc::new(AtomicUsize::new(0));
        store
            .get_or_create("shared", || Counter { cleared })
            .expect("first insert");
        let runtime = TaskRuntime::new(Arc::new(TestScheduler::default()));
        let result = store.get_or_create("shared", || Screen {
            scope: TaskScope::new(runtime),
            children: ControllerStore::new(),
            cleared: Arc::new(AtomicUsize::new(0)),
        });
        assert!(matches!(
            result,
            Err(RetainError::ControllerTypeMismatch { .. })
        ));
    }

    #[test]
    fn clear_recurses_into_nested_stores() {
        let runtime = TaskRuntime::new(Arc::new(TestScheduler::default()));
        let store = ControllerStore::new();
        let screen_cleared = Arc::new(AtomicUsize::new(0));
        let child_cleared = Arc::new(AtomicUsize::new(0));
        let screen = store
            .get_or_create("screen", || Screen {
                scope: TaskScope::new(runtime.clone()),
                children: ControllerStore::new(),
                cleared: screen_cleared.clone(),
            })
            .expect("screen");
        screen
            .children
            .get_or_create("child", || Counter {
                cleared: child_cleared.clone(),
            })
            .expect("child");

        store.dispose();
        assert!(store.is_empty());
        assert!(screen.children.is_empty());
        assert!(!screen.scope.is_active());
        assert_eq!(screen_cleared.load(Ordering::SeqCst), 1);
        assert_eq!(child_cleared.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closure_types_have_no_key() {
        fn key_of<T: 'static>(_: &T) -> Result<String, RetainError> {
            controller_key::<T>()
        }
        let closure = || 1;
        assert!(matches!(
            key_of(&closure),
            Err(RetainError::AnonymousController { .. })
        ));
        assert!(controller_key::<Counter>().is_ok());
    }
}
