#![forbid(unsafe_code)]

//! Observers: the reading side of the graph.
//!
//! # Design
//!
//! All three observer flavors share one `ObserverInner`. It tracks the
//! containers it subscribed to during its current read pass and the change
//! callback. When any of them changes, the scheduler calls back into the
//! observer: it unsubscribes from everything (`reset`) and then runs the
//! callback, which is expected to read again and so re-subscribe to whatever
//! it still depends on.
//!
//! The flavors differ only in how a pending state surfaces to the reader:
//!
//! | Flavor               | Pending read returns                   |
//! |----------------------|----------------------------------------|
//! | [`SyncObserver`]      | [`ReactiveError::PendingAccess`]       |
//! | [`AsyncObserver`]     | the provided future                     |
//! | [`ComponentObserver`] | [`ReactiveError::Suspended`]           |
//!
//! Reading a pending state also arms a one-shot wake-up: once the future
//! settles, the observer is queued as if the container had changed.
//!
//! # Invariants
//!
//! 1. An observer without a change callback never subscribes.
//! 2. After `reset`, the observer is attached to no container.
//! 3. A locked component observer refuses to read.
//! 4. Dropping the last handle unsubscribes from every container.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;

use crate::error::{ReactiveError, Result};
use crate::observable::{KeyedSource, ObservableNode, Source};
use crate::runtime::Runtime;
use crate::state_ref::{Provided, StateRef, ThrowMode};
use crate::store::DebugPrefix;

static NEXT_CREATION_ORDER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObserverKind {
    Sync,
    Async,
    Component,
}

pub(crate) struct ObserverInner {
    creation_order: u64,
    kind: ObserverKind,
    weak_self: Weak<ObserverInner>,
    debug_id: RefCell<String>,
    runtime: Runtime,
    locked: Cell<bool>,
    observables: RefCell<IndexMap<u64, Rc<dyn ObservableNode>>>,
    on_change: RefCell<Option<Rc<dyn Fn()>>>,
}

impl ObserverInner {
    fn new(runtime: &Runtime, kind: ObserverKind) -> Rc<Self> {
        let creation_order = NEXT_CREATION_ORDER.fetch_add(1, Ordering::Relaxed);
        Rc::new_cyclic(|weak_self| Self {
            creation_order,
            kind,
            weak_self: weak_self.clone(),
            debug_id: RefCell::new(creation_order.to_string()),
            runtime: runtime.clone(),
            locked: Cell::new(false),
            observables: RefCell::new(IndexMap::new()),
            on_change: RefCell::new(None),
        })
    }

    pub(crate) fn creation_order(&self) -> u64 {
        self.creation_order
    }

    pub(crate) fn is_component(&self) -> bool {
        self.kind == ObserverKind::Component
    }

    fn has_on_change(&self) -> bool {
        self.on_change.borrow().is_some()
    }

    /// Record `observable` for this read pass.
    ///
    /// Returns whether the observable should record the observer in turn.
    pub(crate) fn add_observable(&self, observable: Rc<dyn ObservableNode>) -> Result<bool> {
        if self.is_component() && self.locked.get() {
            return Err(ReactiveError::ObserverLocked {
                debug_id: self.debug_id.borrow().clone(),
            });
        }
        if !self.has_on_change() {
            return Ok(false);
        }
        self.observables
            .borrow_mut()
            .insert(observable.node_id(), observable);
        Ok(true)
    }

    pub(crate) fn reset(&self) {
        let observables = std::mem::take(&mut *self.observables.borrow_mut());
        for observable in observables.into_values() {
            observable.remove_observer(self.creation_order);
        }
    }

    pub(crate) fn observable_changed(&self) {
        self.reset();
        let on_change = self.on_change.borrow().clone();
        if let Some(on_change) = on_change {
            tracing::trace!(observer = %self.debug_id.borrow(), "observer notified");
            on_change();
        }
    }

    fn destroy(&self) {
        self.on_change.borrow_mut().take();
        self.reset();
    }

    fn watch_pending<T: Clone + 'static>(&self, state: &StateRef<T>) {
        if !self.has_on_change() {
            return;
        }
        let weak = self.weak_self.clone();
        state.on_settled(move || {
            if let Some(observer) = weak.upgrade() {
                let scheduler = observer.runtime.scheduler().clone();
                scheduler.add_changed_observer(observer);
            }
        });
    }

    fn observe_state<T: Clone + 'static>(
        &self,
        source: &impl Source<T>,
        handle: &ObserverRef,
    ) -> Result<StateRef<T>> {
        let state = source.observe_ref(handle)?;
        self.watch_pending(&state);
        Ok(state)
    }

    fn observe_key_state<K, T: Clone + 'static>(
        &self,
        source: &impl KeyedSource<K, T>,
        key: &K,
        handle: &ObserverRef,
    ) -> Result<Option<StateRef<T>>> {
        let state = source.observe_key_ref(handle, key)?;
        if let Some(state) = &state {
            self.watch_pending(state);
        }
        Ok(state)
    }
}

impl Drop for ObserverInner {
    fn drop(&mut self) {
        let observables = std::mem::take(self.observables.get_mut());
        for observable in observables.into_values() {
            observable.remove_observer(self.creation_order);
        }
    }
}

/// Opaque handle passed to [`Source::observe_ref`].
#[derive(Clone)]
pub struct ObserverRef {
    inner: Rc<ObserverInner>,
}

impl ObserverRef {
    pub(crate) fn inner(&self) -> &Rc<ObserverInner> {
        &self.inner
    }
}

impl fmt::Debug for ObserverRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverRef")
            .field("debug_id", &*self.inner.debug_id.borrow())
            .field("kind", &self.inner.kind)
            .field("creation_order", &self.inner.creation_order)
            .field("observables", &self.inner.observables.borrow().len())
            .finish()
    }
}

// ─── Subscriber ──────────────────────────────────────────────────────────────

/// Operations shared by every observer flavor.
pub trait Subscriber {
    fn observer_ref(&self) -> &ObserverRef;

    /// Install the callback run when anything read since the last reset
    /// changes. Without one the observer reads but never subscribes.
    fn set_on_change(&self, on_change: impl Fn() + 'static)
    where
        Self: Sized,
    {
        *self.observer_ref().inner.on_change.borrow_mut() = Some(Rc::new(on_change));
    }

    fn clear_on_change(&self) {
        self.observer_ref().inner.on_change.borrow_mut().take();
    }

    /// Unsubscribe from everything read so far.
    fn reset(&self) {
        self.observer_ref().inner.reset();
    }

    /// Drop the callback and unsubscribe.
    fn destroy(&self) {
        self.observer_ref().inner.destroy();
    }

    fn debug_id(&self) -> String {
        self.observer_ref().inner.debug_id.borrow().clone()
    }

    fn creation_order(&self) -> u64 {
        self.observer_ref().inner.creation_order
    }

    /// Containers currently subscribed to.
    fn observable_count(&self) -> usize {
        self.observer_ref().inner.observables.borrow().len()
    }

    /// Subscribe and return the raw state, waking on settlement when pending.
    fn observe_state<T: Clone + 'static>(&self, source: &impl Source<T>) -> Result<StateRef<T>>
    where
        Self: Sized,
    {
        let handle = self.observer_ref();
        handle.inner.observe_state(source, handle)
    }

    fn observe_key_state<K, T: Clone + 'static>(
        &self,
        source: &impl KeyedSource<K, T>,
        key: &K,
    ) -> Result<Option<StateRef<T>>>
    where
        Self: Sized,
    {
        let handle = self.observer_ref();
        handle.inner.observe_key_state(source, key, handle)
    }
}

macro_rules! observer_handle {
    ($name:ident, $kind:expr) => {
        impl $name {
            /// Create on the thread's default runtime.
            #[must_use]
            pub fn new() -> Self {
                Self::new_in(&Runtime::current())
            }

            #[must_use]
            pub fn new_in(runtime: &Runtime) -> Self {
                Self {
                    handle: ObserverRef {
                        inner: ObserverInner::new(runtime, $kind),
                    },
                }
            }

            /// Create with a change callback already installed.
            #[must_use]
            pub fn with_on_change(runtime: &Runtime, on_change: impl Fn() + 'static) -> Self {
                let observer = Self::new_in(runtime);
                observer.set_on_change(on_change);
                observer
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Subscriber for $name {
            fn observer_ref(&self) -> &ObserverRef {
                &self.handle
            }
        }

        impl DebugPrefix for $name {
            fn set_debug_prefix(&self, prefix: &str) {
                let inner = &self.handle.inner;
                let prefixed = format!("{prefix}::{}", inner.debug_id.borrow());
                *inner.debug_id.borrow_mut() = prefixed;
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.handle).finish()
            }
        }
    };
}

// ─── SyncObserver ────────────────────────────────────────────────────────────

/// Observer for synchronous readers; pending reads fail.
///
/// Cloning a `SyncObserver` creates a new handle to the **same** observer.
#[derive(Clone)]
pub struct SyncObserver {
    handle: ObserverRef,
}

observer_handle!(SyncObserver, ObserverKind::Sync);

impl SyncObserver {
    pub fn observe<T: Clone + 'static>(&self, source: &impl Source<T>) -> Result<T> {
        self.observe_state(source)?
            .get_or_throw_sync(ThrowMode::ErrorOnPending)
    }

    /// Read one entry; `Ok(None)` when the key is absent.
    pub fn observe_key<K, T: Clone + 'static>(
        &self,
        source: &impl KeyedSource<K, T>,
        key: &K,
    ) -> Result<Option<T>> {
        self.observe_key_state(source, key)?
            .map(|state| state.get_or_throw_sync(ThrowMode::ErrorOnPending))
            .transpose()
    }
}

// ─── AsyncObserver ───────────────────────────────────────────────────────────

/// Observer for async readers; reads return what the owner provided.
///
/// Cloning an `AsyncObserver` creates a new handle to the **same** observer.
#[derive(Clone)]
pub struct AsyncObserver {
    handle: ObserverRef,
}

observer_handle!(AsyncObserver, ObserverKind::Async);

impl AsyncObserver {
    /// The provided value or future; await it for the value.
    pub fn observe<T: Clone + 'static>(&self, source: &impl Source<T>) -> Result<Provided<T>> {
        self.observe_state(source)?.get_or_throw_provided()
    }

    pub fn observe_key<K, T: Clone + 'static>(
        &self,
        source: &impl KeyedSource<K, T>,
        key: &K,
    ) -> Result<Option<Provided<T>>> {
        self.observe_key_state(source, key)?
            .map(|state| state.get_or_throw_provided())
            .transpose()
    }
}

// ─── ComponentObserver ───────────────────────────────────────────────────────

/// Observer for render functions; pending reads suspend.
///
/// Component notifications run after all other observers in a flush. Reads
/// are only allowed while unlocked, which brackets the render.
#[derive(Clone)]
pub struct ComponentObserver {
    handle: ObserverRef,
}

observer_handle!(ComponentObserver, ObserverKind::Component);

impl ComponentObserver {
    pub fn observe<T: Clone + 'static>(&self, source: &impl Source<T>) -> Result<T> {
        self.observe_state(source)?.get_or_throw_sync(ThrowMode::Suspend)
    }

    pub fn observe_key<K, T: Clone + 'static>(
        &self,
        source: &impl KeyedSource<K, T>,
        key: &K,
    ) -> Result<Option<T>> {
        self.observe_key_state(source, key)?
            .map(|state| state.get_or_throw_sync(ThrowMode::Suspend))
            .transpose()
    }

    pub fn lock(&self) {
        self.handle.inner.locked.set(true);
    }

    pub fn unlock(&self) {
        self.handle.inner.locked.set(false);
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.handle.inner.locked.get()
    }

    /// The component is rendering now; a parked notification is redundant.
    pub fn on_render(&self) {
        self.handle
            .inner
            .runtime
            .scheduler()
            .change_handled_by_order(self.handle.inner.creation_order);
    }
}
