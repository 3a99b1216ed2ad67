use std::cell::Cell;

use crate::composition::RememberObserver;
use crate::container::ScopedContainer;
use crate::key::StableSlotId;
use crate::resolver::ResolverId;

/// Remembered next to every retrieval; reports the slot as abandoned once
/// its consumer leaves the composition.
///
/// The consumer is registered when the observer is built, not when it is
/// remembered: a pass forgets observers before it remembers new ones, and an
/// abandoned pass releases its observers without remembering them.
pub struct DisposalObserver {
    container: ScopedContainer,
    slot: StableSlotId,
    fired: Cell<bool>,
}

impl DisposalObserver {
    pub fn new(container: ScopedContainer, slot: StableSlotId) -> Self {
        container.add_consumer(&slot);
        Self {
            container,
            slot,
            fired: Cell::new(false),
        }
    }

    pub fn slot(&self) -> &StableSlotId {
        &self.slot
    }

    fn release(&self) {
        if self.fired.replace(true) {
            return;
        }
        self.container.on_slot_abandoned(&self.slot);
    }
}

impl RememberObserver for DisposalObserver {
    fn on_forgotten(&self) {
        self.release();
    }

    fn on_abandoned(&self) {
        self.release();
    }
}

/// Remembered next to a scope-key resolver; releases the slots the resolver
/// kept alive once it leaves the composition.
pub struct ResolverObserver {
    container: ScopedContainer,
    resolver: ResolverId,
    fired: Cell<bool>,
}

impl ResolverObserver {
    pub fn new(container: ScopedContainer, resolver: ResolverId) -> Self {
        Self {
            container,
            resolver,
            fired: Cell::new(false),
        }
    }

    fn release(&self) {
        if self.fired.replace(true) {
            return;
        }
        self.container.on_resolver_abandoned(self.resolver);
    }
}

impl RememberObserver for ResolverObserver {
    fn on_forgotten(&self) {
        self.release();
    }

    fn on_abandoned(&self) {
        self.release();
    }
}
