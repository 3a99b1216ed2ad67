use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use compose_retain::{
    location_key, Composition, ContainerOwner, Disposable, Key, LifecycleRegistry, LifecycleState,
    RetainError, ScopedContainer,
};
use compose_retain_std::StdRetainRuntime;

type Content = Box<dyn FnMut() -> Result<(), RetainError>>;

/// Headless harness for exercising retention in tests.
///
/// `RetainTestRule` plays the host: it owns a container owner, a lifecycle
/// and a composition, and exposes helpers for recomposing, producing frames,
/// moving the lifecycle and recreating the UI the way a configuration change
/// or process death would.
pub struct RetainTestRule {
    runtime: StdRetainRuntime,
    owner: ContainerOwner,
    lifecycle: LifecycleRegistry,
    composition: Composition,
    content: Option<Content>,
    root_key: Key,
}

impl RetainTestRule {
    /// Create a rule with a resumed lifecycle and an empty composition.
    pub fn new() -> Self {
        let runtime = StdRetainRuntime::new();
        let owner = runtime.new_owner();
        let lifecycle = resumed_lifecycle();
        let composition = attached_composition(Composition::new(), &owner, &lifecycle);
        Self {
            runtime,
            owner,
            lifecycle,
            composition,
            content: None,
            root_key: location_key(file!(), line!(), column!()),
        }
    }

    /// Install the provided content and perform an initial render.
    pub fn set_content(
        &mut self,
        content: impl FnMut() -> Result<(), RetainError> + 'static,
    ) -> Result<(), RetainError> {
        self.content = Some(Box::new(content));
        self.render()
    }

    /// Force a recomposition using the currently installed content.
    pub fn recomposition(&mut self) -> Result<(), RetainError> {
        self.render()
    }

    /// Run disposal tasks until none is ready.
    pub fn pump_until_idle(&mut self) {
        while self.runtime.run_pending_tasks() > 0 {}
    }

    /// Produce a frame at the supplied timestamp. Like a real host, no frame
    /// is drawn unless the lifecycle is resumed.
    pub fn advance_frame(&mut self, frame_time_nanos: u64) {
        self.pump_until_idle();
        if self.lifecycle.current_state() == LifecycleState::Resumed {
            self.runtime.drain_frame_callbacks(frame_time_nanos);
        }
        self.pump_until_idle();
    }

    pub fn pause(&mut self) {
        self.lifecycle.move_to(LifecycleState::Started);
        self.pump_until_idle();
    }

    pub fn resume(&mut self) {
        self.lifecycle.move_to(LifecycleState::Resumed);
        self.pump_until_idle();
    }

    /// Destroy the UI and build it again against the same owner, carrying
    /// the saved state over.
    pub fn recreate_for_configuration_change(&mut self) -> Result<(), RetainError> {
        self.owner.begin_configuration_change();
        self.lifecycle.move_to(LifecycleState::Destroyed);
        let saved = self.composition.save_state();
        self.composition.dispose();

        self.lifecycle = LifecycleRegistry::new();
        self.composition =
            attached_composition(Composition::restore(saved), &self.owner, &self.lifecycle);
        self.lifecycle.move_to(LifecycleState::Created);
        self.render()?;
        self.resume();
        Ok(())
    }

    /// Lose every retained object, keep only the saved state, and build the
    /// UI again with a fresh owner.
    pub fn recreate_after_process_death(&mut self) -> Result<(), RetainError> {
        let saved = self.composition.save_state();
        self.lifecycle.move_to(LifecycleState::Destroyed);
        self.composition.dispose();
        self.owner.clear();

        self.owner = self.runtime.new_owner();
        self.lifecycle = resumed_lifecycle();
        self.composition =
            attached_composition(Composition::restore(saved), &self.owner, &self.lifecycle);
        self.render()
    }

    /// Remove the UI for good and clear the owner, as when a screen is popped
    /// off the back stack.
    pub fn clear_owner(&mut self) {
        self.composition.dispose();
        self.lifecycle.move_to(LifecycleState::Destroyed);
        self.owner.clear();
        self.pump_until_idle();
    }

    pub fn has_content(&self) -> bool {
        self.content.is_some()
    }

    /// The owner's container, once some content retrieved a value.
    pub fn container(&self) -> Option<ScopedContainer> {
        self.owner.existing_container()
    }

    pub fn owner(&self) -> &ContainerOwner {
        &self.owner
    }

    pub fn lifecycle(&self) -> &LifecycleRegistry {
        &self.lifecycle
    }

    pub fn runtime(&self) -> &StdRetainRuntime {
        &self.runtime
    }

    /// Gain mutable access to the raw composition for advanced scenarios.
    pub fn composition(&mut self) -> &mut Composition {
        &mut self.composition
    }

    fn render(&mut self) -> Result<(), RetainError> {
        if let Some(content) = self.content.as_mut() {
            self.composition.render(self.root_key, &mut **content)?;
        }
        self.pump_until_idle();
        Ok(())
    }
}

impl Default for RetainTestRule {
    fn default() -> Self {
        Self::new()
    }
}

fn resumed_lifecycle() -> LifecycleRegistry {
    let lifecycle = LifecycleRegistry::new();
    lifecycle.move_to(LifecycleState::Resumed);
    lifecycle
}

fn attached_composition(
    mut composition: Composition,
    owner: &ContainerOwner,
    lifecycle: &LifecycleRegistry,
) -> Composition {
    composition.set_container_owner(owner.clone());
    composition.set_lifecycle(lifecycle.clone());
    composition
}

/// Convenience helper for tests that only need temporary access to a
/// `RetainTestRule`.
pub fn run_test_retain<R>(f: impl FnOnce(&mut RetainTestRule) -> R) -> R {
    let mut rule = RetainTestRule::new();
    f(&mut rule)
}

/// Disposable that counts how often it was disposed.
#[derive(Debug, Default)]
pub struct DisposeCounter {
    disposed: AtomicUsize,
}

impl DisposeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disposed_count(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed_count() > 0
    }
}

impl Disposable for DisposeCounter {
    fn dispose(&self) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Shared counter for builder invocations.
#[derive(Clone, Debug, Default)]
pub struct BuildCounter {
    count: Arc<AtomicUsize>,
}

impl BuildCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one build and returns the new total.
    pub fn record(&self) -> usize {
        self.count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}
