use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::container::ScopedContainer;
use crate::error::RetainError;
use crate::lock;
use crate::platform::PlatformWait;
use crate::runtime::TaskRuntime;

struct OwnerInner {
    runtime: TaskRuntime,
    wait: Arc<dyn PlatformWait>,
    container: Mutex<Option<ScopedContainer>>,
    cleared: AtomicBool,
}

/// Scope that outlives the UI built inside it (a screen, a navigation entry).
///
/// The owner creates its container on first use and keeps it across
/// configuration changes; [`clear`](Self::clear) tears it down for good.
#[derive(Clone)]
pub struct ContainerOwner {
    inner: Arc<OwnerInner>,
}

impl ContainerOwner {
    pub fn new(runtime: TaskRuntime, wait: Arc<dyn PlatformWait>) -> Self {
        Self {
            inner: Arc::new(OwnerInner {
                runtime,
                wait,
                container: Mutex::new(None),
                cleared: AtomicBool::new(false),
            }),
        }
    }

    pub fn runtime(&self) -> &TaskRuntime {
        &self.inner.runtime
    }

    pub fn container(&self) -> Result<ScopedContainer, RetainError> {
        let mut container = lock(&self.inner.container);
        if self.is_cleared() {
            return Err(RetainError::OwnerCleared);
        }
        let container = container.get_or_insert_with(|| {
            log::debug!("creating scoped container");
            ScopedContainer::new(self.inner.runtime.clone(), Arc::clone(&self.inner.wait))
        });
        Ok(container.clone())
    }

    /// The container, if one was created and the owner is not cleared.
    pub fn existing_container(&self) -> Option<ScopedContainer> {
        lock(&self.inner.container).clone()
    }

    /// Tells the container that the UI is being recreated for a
    /// configuration change, so disposal tasks wait for the new UI.
    pub fn begin_configuration_change(&self) {
        if let Some(container) = self.existing_container() {
            container.set_changing_configuration(true);
        }
    }

    /// Tears the container down. Later retrievals fail with
    /// [`RetainError::OwnerCleared`].
    pub fn clear(&self) {
        let container = {
            let mut container = lock(&self.inner.container);
            if self.inner.cleared.swap(true, Ordering::SeqCst) {
                return;
            }
            container.take()
        };
        if let Some(container) = container {
            container.teardown();
        }
    }

    pub fn is_cleared(&self) -> bool {
        self.inner.cleared.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ContainerOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerOwner")
            .field("cleared", &self.is_cleared())
            .field("has_container", &self.existing_container().is_some())
            .finish()
    }
}
