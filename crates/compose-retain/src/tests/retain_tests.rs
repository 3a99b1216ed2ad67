use crate::key::StableSlotId;
use crate::lifecycle::{LifecycleRegistry, LifecycleState};
use crate::platform::ImmediateWait;
use crate::runtime::{TaskRuntime, TestScheduler};
use crate::{
    retain, retain_controller, retain_disposable, retain_disposable_with_key, retain_keys_in_scope,
    retain_task_scope, with_key, Composition, ContainerOwner, Controller, Disposable, Retain,
    RetainError, TaskScope,
};
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Resource {
    disposed: AtomicUsize,
}

impl Resource {
    fn disposed(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl Disposable for Resource {
    fn dispose(&self) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

struct Host {
    runtime: TaskRuntime,
    owner: ContainerOwner,
    composition: Composition,
}

impl Host {
    fn new() -> Self {
        let runtime = TaskRuntime::new(Arc::new(TestScheduler::default()));
        let owner = ContainerOwner::new(runtime.clone(), Arc::new(ImmediateWait));
        let lifecycle = LifecycleRegistry::new();
        lifecycle.move_to(LifecycleState::Resumed);
        let mut composition = Composition::new();
        composition.set_container_owner(owner.clone());
        composition.set_lifecycle(lifecycle);
        Self {
            runtime,
            owner,
            composition,
        }
    }

    fn render(&mut self, content: impl FnMut() -> Result<(), RetainError>) {
        self.composition.render(1, content).expect("render");
        self.runtime.run_until_stalled();
    }
}

#[test]
fn retained_value_is_memoized_until_call_site_leaves() {
    let mut host = Host::new();
    let show = Cell::new(true);
    let builds = Cell::new(0);
    let seen = RefCell::new(Vec::new());
    let mut content = || {
        if show.get() {
            let resource = retain_disposable(|| {
                builds.set(builds.get() + 1);
                Resource::default()
            })?;
            seen.borrow_mut().push(resource);
        }
        Ok(())
    };
    host.render(&mut content);
    host.render(&mut content);
    assert_eq!(builds.get(), 1);
    let seen_values = seen.borrow().clone();
    assert!(Arc::ptr_eq(&seen_values[0], &seen_values[1]));

    show.set(false);
    host.render(&mut content);
    assert_eq!(seen_values[0].disposed(), 1);
    assert!(host.owner.existing_container().is_some_and(|c| c.is_empty()));
}

#[test]
fn changing_the_version_key_replaces_the_value() {
    let mut host = Host::new();
    let user = Cell::new(1u32);
    let seen = RefCell::new(Vec::new());
    let mut content = || {
        let resource = retain_disposable_with_key(&user.get(), Resource::default)?;
        seen.borrow_mut().push(resource);
        Ok(())
    };
    host.render(&mut content);
    user.set(2);
    host.render(&mut content);

    let seen = seen.borrow();
    assert!(!Arc::ptr_eq(&seen[0], &seen[1]));
    assert_eq!(seen[0].disposed(), 1);
    assert_eq!(seen[1].disposed(), 0);
}

#[test]
fn shared_ids_resolve_to_one_value_across_call_sites() {
    let mut host = Host::new();
    let seen = RefCell::new(Vec::new());
    host.render(|| {
        let first = Retain::new().shared(&"session").value(|| 41u32)?;
        let second = with_key(&"elsewhere", || {
            Retain::new().shared(&"session").value(|| 42u32)
        })??;
        seen.borrow_mut().push((first, second));
        Ok(())
    });
    let seen = seen.borrow();
    assert!(Arc::ptr_eq(&seen[0].0, &seen[0].1));
    assert_eq!(*seen[0].0, 41);
}

#[test]
fn shared_slot_survives_while_another_consumer_remains() {
    let mut host = Host::new();
    let show_second = Cell::new(true);
    let builds = Cell::new(0);
    let seen = RefCell::new(Vec::new());
    let mut content = || {
        let first = Retain::new().shared(&"session").disposable(|| {
            builds.set(builds.get() + 1);
            Resource::default()
        })?;
        seen.borrow_mut().push(first);
        if show_second.get() {
            with_key(&"elsewhere", || {
                Retain::new().shared(&"session").disposable(Resource::default)
            })??;
        }
        Ok(())
    };
    host.render(&mut content);
    let slot = StableSlotId::derived(&"session");
    let container = host.owner.existing_container().expect("container");
    assert_eq!(container.consumer_count(&slot), 2);

    show_second.set(false);
    host.render(&mut content);
    let session = seen.borrow()[0].clone();
    assert_eq!(session.disposed(), 0);
    assert!(container.contains(&slot));
    assert!(!container.is_marked(&slot));
    assert_eq!(container.consumer_count(&slot), 1);

    host.render(&mut content);
    assert_eq!(builds.get(), 1);
    assert!(seen.borrow().iter().all(|value| Arc::ptr_eq(value, &session)));
}

#[test]
fn positional_values_differ_per_call_site() {
    let mut host = Host::new();
    let seen = RefCell::new(Vec::new());
    host.render(|| {
        let first = retain(|| 1u32)?;
        let second = retain(|| 2u32)?;
        seen.borrow_mut().push((*first, *second));
        Ok(())
    });
    assert_eq!(*seen.borrow(), vec![(1, 2)]);
}

#[test]
fn task_scope_is_cancelled_when_call_site_leaves() {
    let mut host = Host::new();
    let show = Cell::new(true);
    let scope = RefCell::new(None::<TaskScope>);
    let mut content = || {
        if show.get() {
            *scope.borrow_mut() = Some(retain_task_scope()?);
        }
        Ok(())
    };
    host.render(&mut content);
    let retained = scope.borrow().clone().expect("scope retained");
    assert!(retained.is_active());

    show.set(false);
    host.render(&mut content);
    assert!(!retained.is_active());
}

struct Counter {
    scope: TaskScope,
    cleared: AtomicUsize,
}

impl Controller for Counter {
    fn task_scope(&self) -> Option<&TaskScope> {
        Some(&self.scope)
    }

    fn on_cleared(&self) {
        self.cleared.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn controller_is_cleared_with_its_slot() {
    let mut host = Host::new();
    let show = Cell::new(true);
    let seen = RefCell::new(Vec::new());
    let mut content = || {
        if show.get() {
            let counter = retain_controller(|runtime| Counter {
                scope: TaskScope::new(runtime.clone()),
                cleared: AtomicUsize::new(0),
            })?;
            seen.borrow_mut().push(counter);
        }
        Ok(())
    };
    host.render(&mut content);
    host.render(&mut content);
    let counters = seen.borrow().clone();
    assert!(Arc::ptr_eq(&counters[0], &counters[1]));

    show.set(false);
    host.render(&mut content);
    assert_eq!(counters[0].cleared.load(Ordering::SeqCst), 1);
    assert!(!counters[0].scope.is_active());
}

struct Anonymous<F>(F);

impl<F: Send + Sync + 'static> Controller for Anonymous<F> {}

#[test]
fn anonymous_controller_types_are_rejected() {
    let mut host = Host::new();
    let result = host.composition.render(1, || {
        retain_controller(|_| Anonymous(|| ()))?;
        Ok(())
    });
    assert!(matches!(
        result,
        Err(RetainError::AnonymousController { .. })
    ));
}

#[test]
fn missing_collaborators_are_reported() {
    let mut bare = Composition::new();
    assert_eq!(
        bare.render(1, || retain(|| 0u8).map(drop)),
        Err(RetainError::MissingContainerOwner)
    );

    let runtime = TaskRuntime::new(Arc::new(TestScheduler::default()));
    bare.set_container_owner(ContainerOwner::new(runtime, Arc::new(ImmediateWait)));
    assert_eq!(
        bare.render(1, || retain(|| 0u8).map(drop)),
        Err(RetainError::MissingLifecycle)
    );
    assert_eq!(retain(|| 0u8).map(drop), Err(RetainError::MissingComposition));
}

#[test]
fn cleared_owner_refuses_retrieval() {
    let mut host = Host::new();
    let resource = RefCell::new(None);
    host.render(|| {
        *resource.borrow_mut() = Some(retain_disposable(Resource::default)?);
        Ok(())
    });
    host.owner.clear();
    let resource = resource.borrow().clone().expect("retained");
    assert_eq!(resource.disposed(), 1);
    assert_eq!(
        host.composition.render(1, || retain(|| 0u8).map(drop)),
        Err(RetainError::OwnerCleared)
    );
}

#[test]
fn keys_in_scope_keep_items_alive_past_their_consumer() {
    let mut host = Host::new();
    let keys = RefCell::new(vec!["a", "b"]);
    let visible = RefCell::new(vec!["a", "b"]);
    let seen = RefCell::new(Vec::new());
    let mut content = || {
        let resolver = retain_keys_in_scope(keys.borrow().iter().copied())?;
        for item in visible.borrow().iter() {
            let resource = with_key(item, || {
                Retain::new()
                    .in_scope(&resolver, item)
                    .disposable(Resource::default)
            })??;
            seen.borrow_mut().push((*item, resource));
        }
        Ok(())
    };
    host.render(&mut content);
    let resource_b = seen.borrow()[1].1.clone();

    *visible.borrow_mut() = vec!["a"];
    host.render(&mut content);
    assert_eq!(resource_b.disposed(), 0);

    *keys.borrow_mut() = vec!["a"];
    host.render(&mut content);
    assert_eq!(resource_b.disposed(), 1);
}

#[test]
fn hidden_item_returns_to_the_value_its_key_kept_alive() {
    let mut host = Host::new();
    let keys = RefCell::new(vec!["a", "b"]);
    let visible = RefCell::new(vec!["a", "b"]);
    let seen = RefCell::new(Vec::new());
    let mut content = || {
        let resolver = retain_keys_in_scope(keys.borrow().iter().copied())?;
        for item in visible.borrow().iter() {
            let resource = with_key(item, || {
                Retain::new()
                    .in_scope(&resolver, item)
                    .disposable(Resource::default)
            })??;
            seen.borrow_mut().push((*item, resource));
        }
        Ok(())
    };
    host.render(&mut content);
    let resource_b = seen.borrow()[1].1.clone();

    *visible.borrow_mut() = vec!["a"];
    host.render(&mut content);
    *visible.borrow_mut() = vec!["a", "b"];
    host.render(&mut content);

    let again = seen.borrow().last().map(|(_, resource)| resource.clone()).expect("b shown again");
    assert!(Arc::ptr_eq(&resource_b, &again));
    assert_eq!(resource_b.disposed(), 0);
    let container = host.owner.existing_container().expect("container");
    assert_eq!(container.len(), 2);
}
