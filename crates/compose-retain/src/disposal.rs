//! Disposal strategies for tracked values.
//!
//! The strategy is fixed when a value enters the container, by the entry
//! point that stored it. Plain data is [`DisposalStrategy::Inert`]; types with
//! a release step implement [`Disposable`]; task scopes are cancelled and
//! controller stores are cleared.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::lock;
use crate::runtime::{TaskHandle, TaskRuntime};
use crate::store::ControllerStore;

/// Explicit close/release contract for retained values.
pub trait Disposable: Send + Sync + 'static {
    fn dispose(&self);
}

#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub(crate) struct ObjectId(usize);

impl ObjectId {
    pub(crate) fn of<T: ?Sized>(object: &Arc<T>) -> Self {
        Self(Arc::as_ptr(object) as *const () as usize)
    }
}

struct TaskScopeInner {
    runtime: TaskRuntime,
    active: AtomicBool,
    children: Mutex<Vec<TaskHandle>>,
}

/// Cooperative task scope: every task launched in it is cancelled with it.
#[derive(Clone)]
pub struct TaskScope {
    inner: Arc<TaskScopeInner>,
}

impl TaskScope {
    pub fn new(runtime: TaskRuntime) -> Self {
        Self {
            inner: Arc::new(TaskScopeInner {
                runtime,
                active: AtomicBool::new(true),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Launches `future` in the scope. Returns `None` once the scope is
    /// cancelled.
    pub fn launch(&self, future: impl Future<Output = ()> + Send + 'static) -> Option<TaskHandle> {
        let mut children = lock(&self.inner.children);
        if !self.is_active() {
            return None;
        }
        children.retain(|child| !child.is_finished());
        let handle = self.inner.runtime.spawn(future);
        children.push(handle.clone());
        Some(handle)
    }

    pub fn cancel(&self) {
        let children = {
            let mut children = lock(&self.inner.children);
            if !self.inner.active.swap(false, Ordering::SeqCst) {
                return;
            }
            std::mem::take(&mut *children)
        };
        log::debug!("cancelling task scope with {} children", children.len());
        for child in children {
            child.cancel();
        }
    }

    pub fn runtime(&self) -> &TaskRuntime {
        &self.inner.runtime
    }

    fn id(&self) -> ObjectId {
        ObjectId::of(&self.inner)
    }
}

impl fmt::Debug for TaskScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskScope")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Cleanup applied to a value once it is evicted and no other slot shares it.
#[derive(Clone)]
pub enum DisposalStrategy {
    CancelScope(TaskScope),
    Release(Arc<dyn Disposable>),
    ClearStore(Arc<ControllerStore>),
    Inert,
}

impl DisposalStrategy {
    pub fn run(&self) {
        match self {
            DisposalStrategy::CancelScope(scope) => scope.cancel(),
            DisposalStrategy::Release(value) => value.dispose(),
            DisposalStrategy::ClearStore(store) => store.clear(),
            DisposalStrategy::Inert => {}
        }
    }
}

impl fmt::Debug for DisposalStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisposalStrategy::CancelScope(_) => f.write_str("CancelScope"),
            DisposalStrategy::Release(_) => f.write_str("Release"),
            DisposalStrategy::ClearStore(_) => f.write_str("ClearStore"),
            DisposalStrategy::Inert => f.write_str("Inert"),
        }
    }
}

/// Type-erased payload owned by the container.
#[derive(Clone)]
pub struct TrackedValue {
    value: Arc<dyn Any + Send + Sync>,
    identity: ObjectId,
    strategy: DisposalStrategy,
}

impl TrackedValue {
    pub fn inert<T: Send + Sync + 'static>(value: Arc<T>) -> Self {
        Self {
            identity: ObjectId::of(&value),
            value,
            strategy: DisposalStrategy::Inert,
        }
    }

    pub fn disposable<T: Disposable>(value: Arc<T>) -> Self {
        let release: Arc<dyn Disposable> = value.clone();
        Self {
            identity: ObjectId::of(&value),
            value,
            strategy: DisposalStrategy::Release(release),
        }
    }

    /// A task scope is identified by its shared state, so clones of one scope
    /// stored in different slots alias each other.
    pub fn task_scope(scope: TaskScope) -> Self {
        Self {
            identity: scope.id(),
            value: Arc::new(scope.clone()),
            strategy: DisposalStrategy::CancelScope(scope),
        }
    }

    pub fn store(store: Arc<ControllerStore>) -> Self {
        Self {
            identity: ObjectId::of(&store),
            value: store.clone(),
            strategy: DisposalStrategy::ClearStore(store),
        }
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.value.clone().downcast::<T>().ok()
    }

    pub fn strategy(&self) -> &DisposalStrategy {
        &self.strategy
    }

    /// Reference identity, the basis of the aliasing check.
    pub fn same_instance(&self, other: &TrackedValue) -> bool {
        self.identity == other.identity
    }
}

impl fmt::Debug for TrackedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedValue")
            .field("identity", &self.identity)
            .field("strategy", &self.strategy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::TestScheduler;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Connection {
        closed: AtomicUsize,
    }

    impl Disposable for Connection {
        fn dispose(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn runtime() -> TaskRuntime {
        TaskRuntime::new(Arc::new(TestScheduler::default()))
    }

    #[test]
    fn release_strategy_closes_value() {
        let connection = Arc::new(Connection::default());
        let tracked = TrackedValue::disposable(connection.clone());
        tracked.strategy().run();
        assert_eq!(connection.closed.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(
            &tracked.downcast::<Connection>().expect("connection"),
            &connection
        ));
    }

    #[test]
    fn identity_follows_shared_instance() {
        let shared = Arc::new(5u32);
        let first = TrackedValue::inert(shared.clone());
        let second = TrackedValue::inert(shared);
        let other = TrackedValue::inert(Arc::new(5u32));
        assert!(first.same_instance(&second));
        assert!(!first.same_instance(&other));

        let scope = TaskScope::new(runtime());
        assert!(TrackedValue::task_scope(scope.clone())
            .same_instance(&TrackedValue::task_scope(scope)));
    }

    #[test]
    fn cancelling_scope_cancels_children_and_rejects_new_tasks() {
        let runtime = runtime();
        let scope = TaskScope::new(runtime.clone());
        let child = scope.launch(async {}).expect("scope is active");
        TrackedValue::task_scope(scope.clone()).strategy().run();

        assert!(!scope.is_active());
        assert!(child.is_cancelled());
        assert!(scope.launch(async {}).is_none());
        assert_eq!(runtime.live_tasks(), 0);
    }
}
