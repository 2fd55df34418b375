#![forbid(unsafe_code)]

//! Render-adapter boundary for component observers.
//!
//! A [`ComponentSlot`] is what a UI binding keeps per mounted component. Each
//! render calls [`ComponentSlot::begin_render`], reads through the returned
//! [`RenderGuard`], and drops the guard when the render commits. Reads are
//! only permitted while a guard is alive.
//!
//! # Invariants
//!
//! 1. The same observer is reused across renders.
//! 2. Every render after the first acknowledges itself to the scheduler, so
//!    a notification parked for this component during the render is dropped.
//! 3. Dropping the slot destroys the observer.

use std::cell::Cell;
use std::fmt;
use std::ops::Deref;

use crate::observer::{ComponentObserver, Subscriber};
use crate::runtime::Runtime;
use crate::store::DebugPrefix;

/// Per-component holder of a [`ComponentObserver`].
pub struct ComponentSlot {
    observer: ComponentObserver,
    rendered: Cell<bool>,
}

impl fmt::Debug for ComponentSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentSlot")
            .field("observer", &self.observer)
            .field("rendered", &self.rendered.get())
            .finish()
    }
}

impl ComponentSlot {
    #[must_use]
    pub fn new(debug_prefix: Option<&str>) -> Self {
        Self::new_in(&Runtime::current(), debug_prefix)
    }

    #[must_use]
    pub fn new_in(runtime: &Runtime, debug_prefix: Option<&str>) -> Self {
        let observer = ComponentObserver::new_in(runtime);
        observer.lock();
        if let Some(prefix) = debug_prefix {
            observer.set_debug_prefix(prefix);
        }
        Self {
            observer,
            rendered: Cell::new(false),
        }
    }

    /// Start a render. `request_render` is how the slot asks the host to
    /// render again after a change.
    pub fn begin_render(&self, request_render: impl Fn() + 'static) -> RenderGuard<'_> {
        if self.rendered.replace(true) {
            self.observer.on_render();
        }
        self.observer.set_on_change(request_render);
        self.observer.unlock();
        RenderGuard { slot: self }
    }

    #[must_use]
    pub fn observer(&self) -> &ComponentObserver {
        &self.observer
    }
}

impl Drop for ComponentSlot {
    fn drop(&mut self) {
        self.observer.destroy();
    }
}

/// Render window; reads go through it and it locks the observer on drop.
pub struct RenderGuard<'a> {
    slot: &'a ComponentSlot,
}

impl fmt::Debug for RenderGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RenderGuard").field(&self.slot.observer).finish()
    }
}

impl Deref for RenderGuard<'_> {
    type Target = ComponentObserver;

    fn deref(&self) -> &ComponentObserver {
        &self.slot.observer
    }
}

impl Drop for RenderGuard<'_> {
    fn drop(&mut self) {
        self.slot.observer.lock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::error::ReactiveError;
    use crate::observable::{Observable, ObservableOptions};
    use crate::observer::SyncObserver;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn reads_only_inside_the_render_window() {
        let (runtime, _event_loop) = Runtime::lab();
        let title = Observable::new_in(&runtime, ObservableOptions::new().with_default("a"));
        let slot = ComponentSlot::new_in(&runtime, Some("Header"));
        assert!(slot.observer().is_locked());
        {
            let render = slot.begin_render(|| {});
            assert_eq!(render.observe(&title).ok(), Some("a"));
        }
        assert!(matches!(
            slot.observer().observe(&title),
            Err(ReactiveError::ObserverLocked { .. })
        ));
        assert!(slot.observer().debug_id().starts_with("Header::"));
    }

    #[test]
    fn changes_request_a_render() {
        let (runtime, event_loop) = Runtime::lab();
        let title = Observable::new_in(&runtime, ObservableOptions::new().with_default(1));
        let slot = Rc::new(ComponentSlot::new_in(&runtime, None));
        let rendered = Rc::new(RefCell::new(Vec::new()));

        fn render(slot: &Rc<ComponentSlot>, title: &Observable<i32>, out: &Rc<RefCell<Vec<i32>>>) {
            let again = {
                let slot = Rc::downgrade(slot);
                let title = title.clone();
                let out = Rc::clone(out);
                move || {
                    if let Some(slot) = slot.upgrade() {
                        render(&slot, &title, &out);
                    }
                }
            };
            let guard = slot.begin_render(again);
            if let Ok(value) = guard.observe(title) {
                out.borrow_mut().push(value);
            }
        }

        render(&slot, &title, &rendered);
        title.set(2);
        event_loop.run_until_idle();
        title.set(3);
        event_loop.run_until_idle();
        assert_eq!(*rendered.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn render_inside_the_flush_drops_the_parked_notification() {
        let (runtime, event_loop) = Runtime::lab();
        let title = Observable::new_in(&runtime, ObservableOptions::new().with_default(1));
        let requests = Rc::new(Cell::new(0u32));
        let bump = {
            let requests = Rc::clone(&requests);
            move || requests.set(requests.get() + 1)
        };
        let slot = Rc::new(ComponentSlot::new_in(&runtime, None));
        drop(slot.begin_render(bump.clone()).observe(&title));

        // Parent re-renders the child synchronously when the title changes.
        let seen = Rc::new(Cell::new(0));
        let parent = SyncObserver::new_in(&runtime);
        {
            let slot = Rc::clone(&slot);
            let title = title.clone();
            let seen = Rc::clone(&seen);
            let reader = parent.clone();
            parent.set_on_change(move || {
                let _ = reader.observe(&title);
                let guard = slot.begin_render(bump.clone());
                if let Ok(value) = guard.observe(&title) {
                    seen.set(value);
                }
            });
        }
        assert_eq!(parent.observe(&title).ok(), Some(1));

        title.set(2);
        event_loop.run_until_idle();
        assert_eq!(seen.get(), 2);
        assert_eq!(requests.get(), 0);
    }

    #[test]
    fn dropping_the_slot_unsubscribes() {
        let (runtime, _event_loop) = Runtime::lab();
        let title = Observable::new_in(&runtime, ObservableOptions::new().with_default(1));
        let slot = ComponentSlot::new_in(&runtime, None);
        {
            let guard = slot.begin_render(|| {});
            assert!(guard.observe(&title).is_ok());
        }
        assert_eq!(title.observer_count(), 1);
        drop(slot);
        assert_eq!(title.observer_count(), 0);
    }
}
