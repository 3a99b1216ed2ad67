//! Minimal in-process composition host.
//!
//! The slot table provides exactly what retention consumes from a UI runtime:
//! positional `remember`, keyed groups, remember/forget/abandon callbacks and
//! a saveable registry that carries small strings across process death. It
//! renders nothing.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::hash::Hash;
use std::mem;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::error::RetainError;
use crate::hashing::map::HashMap;
use crate::hashing::{group_key, hash_one, slot_key};
use crate::lifecycle::LifecycleRegistry;
use crate::owner::ContainerOwner;
use crate::Key;

/// Callbacks for remembered values that care whether they made it into the
/// committed composition.
pub trait RememberObserver {
    /// The pass that remembered the value was committed.
    fn on_remembered(&self) {}
    /// The value was committed earlier and has now left the composition.
    fn on_forgotten(&self) {}
    /// The pass that remembered the value was discarded.
    fn on_abandoned(&self) {}
}

struct SlotEntry {
    value: Rc<dyn Any>,
    identity: Option<Key>,
    observer: Option<Rc<dyn RememberObserver>>,
    saveable: bool,
    pass: u64,
}

struct GroupFrame {
    key: Key,
    cursor: usize,
    occurrences: HashMap<Key, usize>,
}

impl GroupFrame {
    fn new(key: Key) -> Self {
        Self {
            key,
            cursor: 0,
            occurrences: HashMap::new(),
        }
    }
}

/// Callbacks produced by committing a pass, in dispatch order.
#[derive(Default)]
pub struct PassOutcome {
    pub forgotten: Vec<Rc<dyn RememberObserver>>,
    pub remembered: Vec<Rc<dyn RememberObserver>>,
}

/// Remembered values keyed by their position in the group tree.
#[derive(Default)]
pub struct SlotTable {
    entries: IndexMap<Key, SlotEntry>,
    frames: Vec<GroupFrame>,
    pass: u64,
    inserted: Vec<Key>,
    replaced: Vec<(Key, SlotEntry)>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_pass(&mut self, root: Key) {
        self.pass += 1;
        self.frames.clear();
        self.frames.push(GroupFrame::new(root));
        self.inserted.clear();
        self.replaced.clear();
    }

    pub fn start_group(&mut self, key: Key) {
        let parent = self.current_frame();
        let occurrence = parent.occurrences.entry(key).or_insert(0);
        let index = *occurrence;
        *occurrence += 1;
        let group = group_key(parent.key, key, index);
        self.frames.push(GroupFrame::new(group));
    }

    pub fn end_group(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }

    fn current_frame(&mut self) -> &mut GroupFrame {
        if self.frames.is_empty() {
            self.frames.push(GroupFrame::new(0));
        }
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    /// Claims the next positional slot of the current group.
    pub fn next_slot(&mut self) -> Key {
        let frame = self.current_frame();
        let cursor = frame.cursor;
        frame.cursor += 1;
        slot_key(frame.key, cursor)
    }

    /// Returns the value stored in `slot` when its type and identity match.
    pub fn reuse<T: 'static>(&mut self, slot: Key, identity: Option<Key>) -> Option<Rc<T>> {
        let pass = self.pass;
        let entry = self.entries.get_mut(&slot)?;
        if entry.identity != identity {
            return None;
        }
        let value = entry.value.clone().downcast::<T>().ok()?;
        entry.pass = pass;
        Some(value)
    }

    pub fn insert<T: 'static>(
        &mut self,
        slot: Key,
        value: Rc<T>,
        identity: Option<Key>,
        observer: Option<Rc<dyn RememberObserver>>,
        saveable: bool,
    ) {
        let entry = SlotEntry {
            value,
            identity,
            observer,
            saveable,
            pass: self.pass,
        };
        if let Some(previous) = self.entries.insert(slot, entry) {
            if !self.inserted.contains(&slot) {
                self.replaced.push((slot, previous));
            }
        }
        self.inserted.push(slot);
    }

    /// Commits the pass: entries not visited are dropped and reported as
    /// forgotten (newest first), entries created are reported as remembered.
    pub fn finish_pass(&mut self) -> PassOutcome {
        let pass = self.pass;
        let mut forgotten: Vec<Rc<dyn RememberObserver>> = mem::take(&mut self.replaced)
            .into_iter()
            .filter_map(|(_, entry)| entry.observer)
            .collect();
        self.entries.retain(|_, entry| {
            if entry.pass == pass {
                return true;
            }
            if let Some(observer) = entry.observer.take() {
                forgotten.push(observer);
            }
            false
        });
        forgotten.reverse();
        let remembered = mem::take(&mut self.inserted)
            .into_iter()
            .filter_map(|slot| self.entries.get(&slot))
            .filter_map(|entry| entry.observer.clone())
            .collect();
        self.frames.clear();
        PassOutcome {
            forgotten,
            remembered,
        }
    }

    /// Discards the pass: entries it created are dropped and reported as
    /// abandoned, entries it replaced are restored.
    pub fn abandon_pass(&mut self) -> Vec<Rc<dyn RememberObserver>> {
        let mut abandoned = Vec::new();
        for slot in mem::take(&mut self.inserted).into_iter().rev() {
            if let Some(entry) = self.entries.shift_remove(&slot) {
                abandoned.extend(entry.observer);
            }
        }
        for (slot, entry) in mem::take(&mut self.replaced) {
            self.entries.insert(slot, entry);
        }
        self.frames.clear();
        abandoned
    }

    /// Drops every entry, newest first.
    pub fn dispose(&mut self) -> Vec<Rc<dyn RememberObserver>> {
        let entries = mem::take(&mut self.entries);
        self.inserted.clear();
        self.replaced.clear();
        self.frames.clear();
        entries
            .into_values()
            .rev()
            .filter_map(|entry| entry.observer)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn saveable_values(&self) -> HashMap<String, String> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.saveable)
            .filter_map(|(slot, entry)| {
                let value = entry.value.clone().downcast::<String>().ok()?;
                Some((format!("{slot:016x}"), (*value).clone()))
            })
            .collect()
    }
}

/// Values persisted by `remember_saveable`, keyed by slot position.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SavedState(HashMap<String, String>);

impl SavedState {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value.as_str()))
    }
}

impl FromIterator<(String, String)> for SavedState {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Restored values waiting to be claimed by the slot that saved them.
#[derive(Default)]
pub struct SaveableStateRegistry {
    restored: HashMap<String, String>,
}

impl SaveableStateRegistry {
    pub fn new(saved: SavedState) -> Self {
        Self { restored: saved.0 }
    }

    pub fn consume(&mut self, key: &str) -> Option<String> {
        self.restored.remove(key)
    }
}

thread_local! {
    static CURRENT_COMPOSER: RefCell<Vec<Composer>> = const { RefCell::new(Vec::new()) };
}

struct ComposerGuard;

impl ComposerGuard {
    fn install(composer: Composer) -> Self {
        CURRENT_COMPOSER.with(|stack| stack.borrow_mut().push(composer));
        ComposerGuard
    }
}

impl Drop for ComposerGuard {
    fn drop(&mut self) {
        CURRENT_COMPOSER.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Handle to the composition being rendered.
#[derive(Clone)]
pub struct Composer {
    table: Rc<RefCell<SlotTable>>,
    saveable: Rc<RefCell<SaveableStateRegistry>>,
    owner: Option<ContainerOwner>,
    lifecycle: Option<LifecycleRegistry>,
}

impl Composer {
    pub fn remember<T: 'static>(&self, init: impl FnOnce() -> T) -> Rc<T> {
        self.remember_entry(None, init, |_| None)
    }

    /// Remembers a value tied to `key`: a different key at the same position
    /// replaces the value.
    pub fn remember_keyed<K: Hash + ?Sized, T: 'static>(
        &self,
        key: &K,
        init: impl FnOnce() -> T,
    ) -> Rc<T> {
        self.remember_entry(Some(hash_one(key)), init, |_| None)
    }

    /// Remembers an observer, which receives the remember/forget/abandon
    /// callbacks of its slot.
    pub fn remember_observer<K: Hash + ?Sized, T: RememberObserver + 'static>(
        &self,
        key: &K,
        init: impl FnOnce() -> T,
    ) -> Rc<T> {
        self.remember_entry(Some(hash_one(key)), init, |value| {
            let observer: Rc<dyn RememberObserver> = value;
            Some(observer)
        })
    }

    fn remember_entry<T: 'static>(
        &self,
        identity: Option<Key>,
        init: impl FnOnce() -> T,
        observer: impl FnOnce(Rc<T>) -> Option<Rc<dyn RememberObserver>>,
    ) -> Rc<T> {
        let slot = {
            let mut table = self.table.borrow_mut();
            let slot = table.next_slot();
            if let Some(existing) = table.reuse::<T>(slot, identity) {
                return existing;
            }
            slot
        };
        let value = Rc::new(init());
        let observer = observer(value.clone());
        self.table
            .borrow_mut()
            .insert(slot, value.clone(), identity, observer, false);
        value
    }

    /// Remembers a string that also survives process death when the
    /// composition's state is saved and restored.
    pub fn remember_saveable(&self, init: impl FnOnce() -> String) -> String {
        let slot = {
            let mut table = self.table.borrow_mut();
            let slot = table.next_slot();
            if let Some(existing) = table.reuse::<String>(slot, None) {
                return (*existing).clone();
            }
            slot
        };
        let restored = self.saveable.borrow_mut().consume(&format!("{slot:016x}"));
        let value = restored.unwrap_or_else(init);
        self.table
            .borrow_mut()
            .insert(slot, Rc::new(value.clone()), None, None, true);
        value
    }

    /// Claims the next positional slot without storing anything in it. The
    /// key depends only on the group path and the position, so it is the same
    /// every time that position is composed again.
    pub fn positional_key(&self) -> Key {
        self.table.borrow_mut().next_slot()
    }

    pub fn with_group<R>(&self, key: Key, content: impl FnOnce() -> R) -> R {
        self.table.borrow_mut().start_group(key);
        let result = content();
        self.table.borrow_mut().end_group();
        result
    }

    pub fn with_key<K: Hash + ?Sized, R>(&self, key: &K, content: impl FnOnce() -> R) -> R {
        self.with_group(hash_one(key), content)
    }

    pub fn container_owner(&self) -> Result<ContainerOwner, RetainError> {
        self.owner.clone().ok_or(RetainError::MissingContainerOwner)
    }

    pub fn lifecycle(&self) -> Result<LifecycleRegistry, RetainError> {
        self.lifecycle.clone().ok_or(RetainError::MissingLifecycle)
    }
}

/// Runs `f` with the composer of the composition currently rendering.
pub fn with_current_composer<R>(f: impl FnOnce(&Composer) -> R) -> Result<R, RetainError> {
    let composer = CURRENT_COMPOSER.with(|stack| stack.borrow().last().cloned());
    let composer = composer.ok_or(RetainError::MissingComposition)?;
    Ok(f(&composer))
}

pub fn with_key<K: Hash + ?Sized, R>(
    key: &K,
    content: impl FnOnce() -> R,
) -> Result<R, RetainError> {
    let composer = CURRENT_COMPOSER.with(|stack| stack.borrow().last().cloned());
    let composer = composer.ok_or(RetainError::MissingComposition)?;
    Ok(composer.with_key(key, content))
}

pub fn group<R>(key: Key, content: impl FnOnce() -> R) -> Result<R, RetainError> {
    let composer = CURRENT_COMPOSER.with(|stack| stack.borrow().last().cloned());
    let composer = composer.ok_or(RetainError::MissingComposition)?;
    Ok(composer.with_group(key, content))
}

pub fn remember<T: 'static>(init: impl FnOnce() -> T) -> Result<Rc<T>, RetainError> {
    with_current_composer(|composer| composer.remember(init))
}

pub fn remember_saveable(init: impl FnOnce() -> String) -> Result<String, RetainError> {
    with_current_composer(|composer| composer.remember_saveable(init))
}

/// A tree of remembered values rendered by repeated passes of one content
/// function.
pub struct Composition {
    table: Rc<RefCell<SlotTable>>,
    saveable: Rc<RefCell<SaveableStateRegistry>>,
    owner: Option<ContainerOwner>,
    lifecycle: Option<LifecycleRegistry>,
    disposed: bool,
}

impl Composition {
    pub fn new() -> Self {
        Self::restore(SavedState::default())
    }

    /// Creates a composition whose `remember_saveable` slots start from
    /// `saved`.
    pub fn restore(saved: SavedState) -> Self {
        Self {
            table: Rc::new(RefCell::new(SlotTable::new())),
            saveable: Rc::new(RefCell::new(SaveableStateRegistry::new(saved))),
            owner: None,
            lifecycle: None,
            disposed: false,
        }
    }

    pub fn set_container_owner(&mut self, owner: ContainerOwner) {
        self.owner = Some(owner);
    }

    pub fn set_lifecycle(&mut self, lifecycle: LifecycleRegistry) {
        self.lifecycle = Some(lifecycle);
    }

    pub fn container_owner(&self) -> Option<&ContainerOwner> {
        self.owner.as_ref()
    }

    pub fn lifecycle(&self) -> Option<&LifecycleRegistry> {
        self.lifecycle.as_ref()
    }

    /// Runs one pass of `content`. The pass is committed when `content`
    /// succeeds; on error it is discarded and the values it remembered are
    /// abandoned.
    pub fn render(
        &mut self,
        key: Key,
        mut content: impl FnMut() -> Result<(), RetainError>,
    ) -> Result<(), RetainError> {
        if self.disposed {
            log::warn!("render called on a disposed composition");
            return Ok(());
        }
        self.table.borrow_mut().begin_pass(key);
        let composer = Composer {
            table: Rc::clone(&self.table),
            saveable: Rc::clone(&self.saveable),
            owner: self.owner.clone(),
            lifecycle: self.lifecycle.clone(),
        };
        let result = {
            let _guard = ComposerGuard::install(composer);
            content()
        };
        match result {
            Ok(()) => {
                let outcome = self.table.borrow_mut().finish_pass();
                for observer in outcome.forgotten {
                    observer.on_forgotten();
                }
                for observer in outcome.remembered {
                    observer.on_remembered();
                }
                Ok(())
            }
            Err(err) => {
                log::debug!("discarding composition pass: {err}");
                let abandoned = self.table.borrow_mut().abandon_pass();
                for observer in abandoned {
                    observer.on_abandoned();
                }
                Err(err)
            }
        }
    }

    pub fn save_state(&self) -> SavedState {
        SavedState(self.table.borrow().saveable_values())
    }

    pub fn slot_count(&self) -> usize {
        self.table.borrow().len()
    }

    /// Removes everything from the composition, reporting each observer as
    /// forgotten.
    pub fn dispose(&mut self) {
        if mem::replace(&mut self.disposed, true) {
            return;
        }
        let forgotten = self.table.borrow_mut().dispose();
        for observer in forgotten {
            observer.on_forgotten();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl Default for Composition {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Composition {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Composition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Composition")
            .field("slots", &self.slot_count())
            .field("disposed", &self.disposed)
            .finish()
    }
}
