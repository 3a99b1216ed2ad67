use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use compose_retain::{
    retain, retain_disposable, with_key, LifecycleState, Retain, RetainError,
};
use compose_retain_testing::{BuildCounter, DisposeCounter, RetainTestRule};

const FRAME: u64 = 16_000_000;

type Seen = Rc<RefCell<Vec<Arc<DisposeCounter>>>>;

fn toggled_resource(
    visible: &Rc<Cell<bool>>,
    builds: &BuildCounter,
    seen: &Seen,
) -> impl FnMut() -> Result<(), RetainError> + 'static {
    let visible = Rc::clone(visible);
    let builds = builds.clone();
    let seen = Rc::clone(seen);
    move || {
        if visible.get() {
            let resource = retain_disposable(|| {
                builds.record();
                DisposeCounter::new()
            })?;
            seen.borrow_mut().push(resource);
        }
        Ok(())
    }
}

#[test]
fn recomposition_returns_the_same_instance() {
    let mut rule = RetainTestRule::new();
    let visible = Rc::new(Cell::new(true));
    let builds = BuildCounter::new();
    let seen: Seen = Rc::default();
    rule.set_content(toggled_resource(&visible, &builds, &seen))
        .expect("initial render");
    for _ in 0..3 {
        rule.recomposition().expect("recompose");
    }

    assert_eq!(builds.count(), 1);
    let seen = seen.borrow();
    assert_eq!(seen.len(), 4);
    assert!(seen.iter().all(|resource| Arc::ptr_eq(resource, &seen[0])));
    assert!(!seen[0].is_disposed());
}

#[test]
fn leaving_composition_in_foreground_disposes_promptly() {
    let mut rule = RetainTestRule::new();
    let visible = Rc::new(Cell::new(true));
    let builds = BuildCounter::new();
    let seen: Seen = Rc::default();
    rule.set_content(toggled_resource(&visible, &builds, &seen))
        .expect("initial render");
    let resource = seen.borrow()[0].clone();

    visible.set(false);
    rule.recomposition().expect("recompose");

    assert_eq!(resource.disposed_count(), 1);
    let container = rule.container().expect("container");
    assert!(container.is_empty());
}

#[test]
fn background_disposal_waits_for_resume_and_a_frame() {
    let mut rule = RetainTestRule::new();
    let visible = Rc::new(Cell::new(true));
    let builds = BuildCounter::new();
    let seen: Seen = Rc::default();
    rule.set_content(toggled_resource(&visible, &builds, &seen))
        .expect("initial render");
    let resource = seen.borrow()[0].clone();

    rule.pause();
    visible.set(false);
    rule.recomposition().expect("recompose");
    rule.advance_frame(FRAME);
    assert_eq!(resource.disposed_count(), 0, "no frame is drawn while paused");

    rule.resume();
    assert_eq!(resource.disposed_count(), 0);

    rule.advance_frame(2 * FRAME);
    assert_eq!(resource.disposed_count(), 1);
}

#[test]
fn returning_before_the_frame_rescues_the_value() {
    let mut rule = RetainTestRule::new();
    let visible = Rc::new(Cell::new(true));
    let builds = BuildCounter::new();
    let seen: Seen = Rc::default();
    rule.set_content({
        let visible = Rc::clone(&visible);
        let builds = builds.clone();
        let seen = Rc::clone(&seen);
        move || {
            if visible.get() {
                let resource = Retain::new().shared(&"draft").disposable(|| {
                    builds.record();
                    DisposeCounter::new()
                })?;
                seen.borrow_mut().push(resource);
            }
            Ok(())
        }
    })
    .expect("initial render");

    rule.pause();
    visible.set(false);
    rule.recomposition().expect("hide");
    visible.set(true);
    rule.recomposition().expect("show");
    rule.resume();
    rule.advance_frame(FRAME);

    assert_eq!(builds.count(), 1);
    let seen = seen.borrow();
    assert!(Arc::ptr_eq(&seen[0], &seen[1]));
    assert!(!seen[0].is_disposed());
    let container = rule.container().expect("container");
    assert_eq!(container.len(), 1);
    assert!(container.slot_ids().iter().all(|slot| !container.is_marked(slot)));
}

#[test]
fn configuration_change_keeps_values_visible_in_the_new_ui() {
    let mut rule = RetainTestRule::new();
    let visible = Rc::new(Cell::new(true));
    let builds = BuildCounter::new();
    let seen: Seen = Rc::default();
    rule.set_content(toggled_resource(&visible, &builds, &seen))
        .expect("initial render");

    rule.recreate_for_configuration_change()
        .expect("recreate");
    rule.advance_frame(FRAME);

    assert_eq!(builds.count(), 1);
    let seen = seen.borrow();
    assert_eq!(seen.len(), 2);
    assert!(Arc::ptr_eq(&seen[0], &seen[1]));
    assert!(!seen[0].is_disposed());
    assert_eq!(rule.lifecycle().current_state(), LifecycleState::Resumed);
    let container = rule.container().expect("container");
    assert!(container.in_foreground());
    assert!(!container.is_changing_configuration());
}

#[test]
fn configuration_change_disposes_values_the_new_ui_drops() {
    let mut rule = RetainTestRule::new();
    let visible = Rc::new(Cell::new(true));
    let builds = BuildCounter::new();
    let seen: Seen = Rc::default();
    rule.set_content(toggled_resource(&visible, &builds, &seen))
        .expect("initial render");
    let resource = seen.borrow()[0].clone();

    visible.set(false);
    rule.recreate_for_configuration_change()
        .expect("recreate");
    assert_eq!(resource.disposed_count(), 0, "disposal waits for the next frame");

    rule.advance_frame(FRAME);
    assert_eq!(resource.disposed_count(), 1);
    assert!(rule.container().is_some_and(|container| container.is_empty()));
}

#[test]
fn process_death_rebuilds_values_under_the_same_slot_ids() {
    let mut rule = RetainTestRule::new();
    let visible = Rc::new(Cell::new(true));
    let builds = BuildCounter::new();
    let seen: Seen = Rc::default();
    rule.set_content(toggled_resource(&visible, &builds, &seen))
        .expect("initial render");
    let before = rule.container().expect("container").slot_ids();
    let first = seen.borrow()[0].clone();

    rule.recreate_after_process_death().expect("recreate");

    assert_eq!(first.disposed_count(), 1);
    assert_eq!(builds.count(), 2);
    let after = rule.container().expect("new container").slot_ids();
    assert_eq!(before, after);
    let rebuilt = seen.borrow().last().cloned().expect("rebuilt resource");
    assert!(!Arc::ptr_eq(&first, &rebuilt));
    assert!(!rebuilt.is_disposed());
}

#[test]
fn clearing_the_owner_disposes_everything_once() {
    let mut rule = RetainTestRule::new();
    let seen: Seen = Rc::default();
    rule.set_content({
        let seen = Rc::clone(&seen);
        move || {
            let own = retain_disposable(DisposeCounter::new)?;
            let shared_here = Retain::new()
                .shared(&"connection")
                .disposable(DisposeCounter::new)?;
            let shared_there = with_key(&"detail", || {
                Retain::new()
                    .shared(&"connection")
                    .disposable(DisposeCounter::new)
            })??;
            seen.borrow_mut().extend([own, shared_here, shared_there]);
            Ok(())
        }
    })
    .expect("initial render");

    rule.clear_owner();

    let seen = seen.borrow();
    assert!(Arc::ptr_eq(&seen[1], &seen[2]));
    assert_eq!(seen[0].disposed_count(), 1);
    assert_eq!(seen[1].disposed_count(), 1);
    assert!(rule.owner().is_cleared());
    assert!(rule.container().is_none());
}

#[test]
fn plain_values_need_no_disposal() {
    let mut rule = RetainTestRule::new();
    let values = Rc::new(RefCell::new(Vec::new()));
    rule.set_content({
        let values = Rc::clone(&values);
        move || {
            let label = retain(|| String::from("inbox"))?;
            values.borrow_mut().push(label);
            Ok(())
        }
    })
    .expect("initial render");
    rule.recreate_for_configuration_change()
        .expect("recreate");

    let values = values.borrow();
    assert!(Arc::ptr_eq(&values[0], &values[1]));
    assert_eq!(values[1].as_str(), "inbox");
}
