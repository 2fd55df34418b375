#![forbid(unsafe_code)]

//! Derived state.
//!
//! # Design
//!
//! A selector is an observer and a container glued together. Its state
//! observer runs the user's derivation and records every container the
//! derivation reads; its state container caches the result and serves it to
//! downstream observers. When an input changes, the observer re-runs the
//! derivation and writes the result, so downstream observers hear about it
//! only when the result itself changed under the container's comparison.
//!
//! Computation is lazy: nothing runs until the first read. Unobserved
//! selectors release their cached result after the configured selector
//! delay, and their observer lets go of every input at the same time.
//!
//! # Invariants
//!
//! 1. The derivation runs at most once per input change and never before
//!    the first read.
//! 2. A derivation failure is cached as the selector's error.
//! 3. A derivation that reads its own selector fails with
//!    [`ReactiveError::Cycle`] instead of recursing.
//! 4. Releasing the cached result detaches the state observer from every
//!    input.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};

use futures::FutureExt;
use futures::future::LocalBoxFuture;

use crate::equality::Equivalent;
use crate::error::{ReactiveError, Result};
use crate::observable::{AsyncObservable, CoreOptions, Observable, ObservableOptions, Source};
use crate::observer::{AsyncObserver, ObserverRef, Subscriber, SyncObserver};
use crate::runtime::Runtime;
use crate::state_ref::{Provided, StateRef, Status};
use crate::store::DebugPrefix;

type GetState<T> = Rc<dyn Fn(&SyncObserver, Option<T>) -> Result<T>>;
type GetStateAsync<T> =
    Rc<dyn Fn(AsyncObserver, Option<T>) -> LocalBoxFuture<'static, Result<T>>>;

fn cycle_error(debug_id: &RefCell<String>) -> ReactiveError {
    let error = ReactiveError::Cycle {
        debug_id: debug_id.borrow().clone(),
    };
    tracing::warn!(%error, "selector cycle");
    error
}

// ─── Selector ────────────────────────────────────────────────────────────────

struct SelectorInner<T> {
    debug_id: RefCell<String>,
    get_state: GetState<T>,
    observer: SyncObserver,
    observable: Observable<T>,
    computing: Cell<bool>,
}

impl<T: Equivalent + Clone + 'static> SelectorInner<T> {
    fn update_state(&self) {
        if self.computing.replace(true) {
            return;
        }
        let previous = self.observable.peek().ok().flatten();
        let outcome = (self.get_state)(&self.observer, previous);
        self.computing.set(false);
        match outcome {
            Ok(value) => self.observable.set(value),
            Err(ReactiveError::Suspended(_)) => {
                self.observable.set_error(ReactiveError::ThrownFuture);
            }
            Err(error) => self.observable.set_error(error),
        }
    }

    fn observe_ref(&self, observer: &ObserverRef) -> Result<StateRef<T>> {
        if self.computing.get() {
            return Err(cycle_error(&self.debug_id));
        }
        if !self.observable.is_initialized() {
            tracing::trace!(debug_id = %self.debug_id.borrow(), "selector computing on first read");
            self.update_state();
        }
        self.observable.observe_ref(observer)
    }
}

/// Cached, lazily computed derivation of other containers.
///
/// Cloning a `Selector` creates a new handle to the **same** selector.
pub struct Selector<T> {
    inner: Rc<SelectorInner<T>>,
}

impl<T> Clone for Selector<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone + fmt::Debug + 'static> fmt::Debug for Selector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("debug_id", &*self.inner.debug_id.borrow())
            .field("state", &self.inner.observable.current_state())
            .finish()
    }
}

impl<T: Equivalent + Clone + 'static> Selector<T> {
    /// Create on the thread's default runtime.
    pub fn new(get_state: impl Fn(&SyncObserver, Option<T>) -> Result<T> + 'static) -> Self {
        Self::new_in(&Runtime::current(), get_state, ObservableOptions::new())
    }

    pub fn with_options(
        get_state: impl Fn(&SyncObserver, Option<T>) -> Result<T> + 'static,
        options: ObservableOptions<T>,
    ) -> Self {
        Self::new_in(&Runtime::current(), get_state, options)
    }

    /// Create on `runtime`.
    ///
    /// `get_state` receives the state observer and the previous result, if
    /// any. Options left unset fall back to the selector defaults.
    pub fn new_in(
        runtime: &Runtime,
        get_state: impl Fn(&SyncObserver, Option<T>) -> Result<T> + 'static,
        options: ObservableOptions<T>,
    ) -> Self {
        Self::from_core_options(runtime, Rc::new(get_state), CoreOptions::from_values(options))
    }

    pub(crate) fn from_core_options(
        runtime: &Runtime,
        get_state: GetState<T>,
        options: CoreOptions<T>,
    ) -> Self {
        let inner = Rc::new_cyclic(|weak: &Weak<SelectorInner<T>>| {
            let observer = SyncObserver::new_in(runtime);
            let weak = weak.clone();
            observer.set_on_change(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.update_state();
                }
            });
            let detached = observer.clone();
            let options = options.with_on_evict(move || detached.reset());
            let observable = Observable::with_release_fallback(
                runtime,
                options,
                runtime.config().selector_release_delay,
            );
            SelectorInner {
                debug_id: RefCell::new(observable.debug_id()),
                get_state,
                observer,
                observable,
                computing: Cell::new(false),
            }
        });
        Self { inner }
    }

    /// Cached result without computing or subscribing.
    ///
    /// Fails with [`ReactiveError::NotInitialized`] before the first read.
    pub fn peek(&self) -> Result<Option<T>> {
        self.inner.observable.peek()
    }

    /// Cached result, `None` when nothing is cached.
    #[must_use]
    pub fn peek_safe(&self) -> Option<T> {
        if !self.inner.observable.is_initialized() {
            return None;
        }
        self.inner.observable.peek().ok().flatten()
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.inner.observable.is_initialized()
    }

    /// Detach from every input and drop the cached result.
    pub fn destroy(&self) {
        self.inner.observer.destroy();
        self.inner.observable.destroy();
    }

    #[must_use]
    pub fn debug_id(&self) -> String {
        self.inner.debug_id.borrow().clone()
    }

    /// Downstream observers currently subscribed.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.inner.observable.observer_count()
    }

    /// Inputs the derivation is currently subscribed to.
    #[must_use]
    pub fn input_count(&self) -> usize {
        self.inner.observer.observable_count()
    }

    #[must_use]
    pub fn is_release_scheduled(&self) -> bool {
        self.inner.observable.is_release_scheduled()
    }
}

impl<T: Equivalent + Clone + 'static> Source<T> for Selector<T> {
    fn observe_ref(&self, observer: &ObserverRef) -> Result<StateRef<T>> {
        self.inner.observe_ref(observer)
    }
}

impl<T: Equivalent + Clone + 'static> DebugPrefix for Selector<T> {
    fn set_debug_prefix(&self, prefix: &str) {
        {
            let mut debug_id = self.inner.debug_id.borrow_mut();
            *debug_id = format!("{prefix}::{debug_id}");
        }
        self.inner
            .observer
            .set_debug_prefix(&format!("{prefix}::observer"));
        self.inner
            .observable
            .set_debug_prefix(&format!("{prefix}::observable"));
    }
}

// ─── AsyncSelector ───────────────────────────────────────────────────────────

struct AsyncSelectorInner<T> {
    debug_id: RefCell<String>,
    get_state: GetStateAsync<T>,
    observer: AsyncObserver,
    observable: AsyncObservable<T>,
    computing: Cell<bool>,
}

impl<T: Clone + 'static> AsyncSelectorInner<T> {
    fn update_state(&self) {
        if self.computing.replace(true) {
            return;
        }
        let previous = self.observable.peek().ok().flatten();
        let future = (self.get_state)(self.observer.clone(), previous);
        self.computing.set(false);
        self.observable.set_provided(Provided::future(future));
    }

    fn observe_ref(&self, observer: &ObserverRef) -> Result<StateRef<T>> {
        if self.computing.get() {
            return Err(cycle_error(&self.debug_id));
        }
        if !self.observable.is_initialized() {
            tracing::trace!(debug_id = %self.debug_id.borrow(), "selector computing on first read");
            self.update_state();
        }
        self.observable.observe_ref(observer)
    }
}

/// Derivation whose result is produced by a future.
///
/// Every recomputation provides a new future, which always counts as a
/// change downstream.
pub struct AsyncSelector<T> {
    inner: Rc<AsyncSelectorInner<T>>,
}

impl<T> Clone for AsyncSelector<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for AsyncSelector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncSelector")
            .field("debug_id", &*self.inner.debug_id.borrow())
            .finish_non_exhaustive()
    }
}

impl<T: Clone + 'static> AsyncSelector<T> {
    pub fn new<F, Fut>(get_state: F) -> Self
    where
        F: Fn(AsyncObserver, Option<T>) -> Fut + 'static,
        Fut: Future<Output = Result<T>> + 'static,
    {
        Self::new_in(&Runtime::current(), get_state, ObservableOptions::new())
    }

    pub fn with_options<F, Fut>(get_state: F, options: ObservableOptions<Provided<T>>) -> Self
    where
        F: Fn(AsyncObserver, Option<T>) -> Fut + 'static,
        Fut: Future<Output = Result<T>> + 'static,
    {
        Self::new_in(&Runtime::current(), get_state, options)
    }

    /// Create on `runtime`.
    ///
    /// `get_state` receives a handle to the state observer and the previous
    /// resolved result, if any.
    pub fn new_in<F, Fut>(
        runtime: &Runtime,
        get_state: F,
        options: ObservableOptions<Provided<T>>,
    ) -> Self
    where
        F: Fn(AsyncObserver, Option<T>) -> Fut + 'static,
        Fut: Future<Output = Result<T>> + 'static,
    {
        let get_state: GetStateAsync<T> =
            Rc::new(move |observer, previous| get_state(observer, previous).boxed_local());
        Self::from_core_options(runtime, get_state, CoreOptions::from_provided(options))
    }

    pub(crate) fn from_core_options(
        runtime: &Runtime,
        get_state: GetStateAsync<T>,
        options: CoreOptions<T>,
    ) -> Self {
        let inner = Rc::new_cyclic(|weak: &Weak<AsyncSelectorInner<T>>| {
            let observer = AsyncObserver::new_in(runtime);
            let weak = weak.clone();
            observer.set_on_change(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.update_state();
                }
            });
            let detached = observer.clone();
            let options = options.with_on_evict(move || detached.reset());
            let observable = AsyncObservable::with_release_fallback(
                runtime,
                options,
                runtime.config().selector_release_delay,
            );
            AsyncSelectorInner {
                debug_id: RefCell::new(observable.debug_id()),
                get_state,
                observer,
                observable,
                computing: Cell::new(false),
            }
        });
        Self { inner }
    }

    /// Resolved result without computing or subscribing.
    pub fn peek(&self) -> Result<Option<T>> {
        self.inner.observable.peek()
    }

    #[must_use]
    pub fn peek_safe(&self) -> Option<T> {
        if !self.inner.observable.is_initialized() {
            return None;
        }
        self.inner.observable.peek().ok().flatten()
    }

    /// Status of the cached result, `None` before the first read.
    #[must_use]
    pub fn status(&self) -> Option<Status> {
        self.inner.observable.status()
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.inner.observable.is_initialized()
    }

    pub fn destroy(&self) {
        self.inner.observer.destroy();
        self.inner.observable.destroy();
    }

    #[must_use]
    pub fn debug_id(&self) -> String {
        self.inner.debug_id.borrow().clone()
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.inner.observable.observer_count()
    }

    #[must_use]
    pub fn is_release_scheduled(&self) -> bool {
        self.inner.observable.is_release_scheduled()
    }
}

impl<T: Clone + 'static> Source<T> for AsyncSelector<T> {
    fn observe_ref(&self, observer: &ObserverRef) -> Result<StateRef<T>> {
        self.inner.observe_ref(observer)
    }
}

impl<T: Clone + 'static> DebugPrefix for AsyncSelector<T> {
    fn set_debug_prefix(&self, prefix: &str) {
        {
            let mut debug_id = self.inner.debug_id.borrow_mut();
            *debug_id = format!("{prefix}::{debug_id}");
        }
        self.inner
            .observer
            .set_debug_prefix(&format!("{prefix}::observer"));
        self.inner
            .observable
            .set_debug_prefix(&format!("{prefix}::observable"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::ReleaseDelay;
    use crate::observer::ComponentObserver;
    use futures::channel::oneshot;
    use std::time::Duration;

    fn counter() -> (Rc<Cell<u32>>, impl Fn() + 'static) {
        let count = Rc::new(Cell::new(0u32));
        let bump = {
            let count = Rc::clone(&count);
            move || count.set(count.get() + 1)
        };
        (count, bump)
    }

    #[test]
    fn computes_lazily_and_caches() {
        let (runtime, _event_loop) = Runtime::lab();
        let source = Observable::new_in(&runtime, ObservableOptions::new().with_default(2));
        let (runs, bump) = counter();
        let input = source.clone();
        let doubled = Selector::new_in(
            &runtime,
            move |observer, _| {
                bump();
                Ok(observer.observe(&input)? * 2)
            },
            ObservableOptions::new(),
        );
        assert_eq!(runs.get(), 0);
        assert_eq!(doubled.peek_safe(), None);

        let reader = SyncObserver::new_in(&runtime);
        assert_eq!(reader.observe(&doubled).ok(), Some(4));
        assert_eq!(reader.observe(&doubled).ok(), Some(4));
        assert_eq!(runs.get(), 1);
        assert_eq!(doubled.peek_safe(), Some(4));
    }

    #[test]
    fn recomputes_once_per_input_change() {
        let (runtime, event_loop) = Runtime::lab();
        let source = Observable::new_in(&runtime, ObservableOptions::new().with_default(1));
        let (runs, bump) = counter();
        let input = source.clone();
        let doubled = Selector::new_in(
            &runtime,
            move |observer, _| {
                bump();
                Ok(observer.observe(&input)? * 2)
            },
            ObservableOptions::new(),
        );
        let (notified, notify) = counter();
        let reader = SyncObserver::with_on_change(&runtime, notify);
        assert_eq!(reader.observe(&doubled).ok(), Some(2));

        source.set(5);
        source.set(6);
        event_loop.run_until_idle();
        assert_eq!(runs.get(), 2);
        assert_eq!(notified.get(), 1);
        assert_eq!(doubled.peek_safe(), Some(12));
    }

    #[test]
    fn equal_results_do_not_notify_downstream() {
        let (runtime, event_loop) = Runtime::lab();
        let source = Observable::new_in(&runtime, ObservableOptions::new().with_default(3));
        let input = source.clone();
        let parity = Selector::new_in(
            &runtime,
            move |observer, _| Ok(observer.observe(&input)? % 2),
            ObservableOptions::new(),
        );
        let (notified, notify) = counter();
        let reader = SyncObserver::with_on_change(&runtime, notify);
        assert_eq!(reader.observe(&parity).ok(), Some(1));

        source.set(5);
        event_loop.run_until_idle();
        assert_eq!(notified.get(), 0);
        assert_eq!(parity.peek_safe(), Some(1));
    }

    #[test]
    fn previous_result_is_passed_in() {
        let (runtime, event_loop) = Runtime::lab();
        let source = Observable::new_in(&runtime, ObservableOptions::new().with_default(1));
        let input = source.clone();
        let running_total = Selector::new_in(
            &runtime,
            move |observer, previous: Option<i32>| {
                Ok(previous.unwrap_or(0) + observer.observe(&input)?)
            },
            ObservableOptions::new().with_release_delay(ReleaseDelay::Never),
        );
        let reader = SyncObserver::with_on_change(&runtime, || {});
        assert_eq!(reader.observe(&running_total).ok(), Some(1));
        source.set(10);
        event_loop.run_until_idle();
        assert_eq!(running_total.peek_safe(), Some(11));
    }

    #[test]
    fn failures_are_cached() {
        let (runtime, _event_loop) = Runtime::lab();
        let (runs, bump) = counter();
        let broken = Selector::<i32>::new_in(
            &runtime,
            move |_, _| {
                bump();
                Err(ReactiveError::message("no data"))
            },
            ObservableOptions::new(),
        );
        let reader = SyncObserver::new_in(&runtime);
        let first = reader.observe(&broken).unwrap_err();
        let second = reader.observe(&broken).unwrap_err();
        assert!(first.is_same(&second));
        assert_eq!(runs.get(), 1);
        assert_eq!(broken.peek_safe(), None);
    }

    #[test]
    fn reading_itself_is_a_cycle() {
        let (runtime, _event_loop) = Runtime::lab();
        let slot: Rc<RefCell<Option<Selector<i32>>>> = Rc::new(RefCell::new(None));
        let me = Rc::clone(&slot);
        let selector = Selector::new_in(
            &runtime,
            move |observer, _| {
                let this = me.borrow().clone();
                match this {
                    Some(this) => observer.observe(&this),
                    None => Ok(0),
                }
            },
            ObservableOptions::new(),
        );
        *slot.borrow_mut() = Some(selector.clone());
        let reader = SyncObserver::new_in(&runtime);
        assert!(matches!(
            reader.observe(&selector),
            Err(ReactiveError::Cycle { .. })
        ));
        slot.borrow_mut().take();
    }

    #[test]
    fn pending_input_surfaces_and_recovers() {
        let (runtime, event_loop) = Runtime::lab();
        let (tx, rx) = oneshot::channel::<i32>();
        let source = AsyncObservable::new_in(
            &runtime,
            ObservableOptions::new()
                .with_future(async move { rx.await.map_err(ReactiveError::failed) }),
        );
        let input = source.clone();
        let plus_one = Selector::new_in(
            &runtime,
            move |observer, _| Ok(observer.observe(&input)? + 1),
            ObservableOptions::new(),
        );
        let (notified, notify) = counter();
        let reader = SyncObserver::with_on_change(&runtime, notify);
        assert!(reader.observe(&plus_one).unwrap_err().is_pending());

        let _ = tx.send(41);
        event_loop.run_until_idle();
        assert_eq!(notified.get(), 1);
        assert_eq!(reader.observe(&plus_one).ok(), Some(42));
    }

    #[test]
    fn suspension_inside_selector_becomes_thrown_future() {
        let (runtime, _event_loop) = Runtime::lab();
        let (_tx, rx) = oneshot::channel::<i32>();
        let source = AsyncObservable::new_in(
            &runtime,
            ObservableOptions::new()
                .with_future(async move { rx.await.map_err(ReactiveError::failed) }),
        );
        let component = ComponentObserver::new_in(&runtime);
        let input = source.clone();
        let suspending = Selector::new_in(
            &runtime,
            move |_, _| component.observe(&input),
            ObservableOptions::new(),
        );
        let reader = SyncObserver::new_in(&runtime);
        assert!(matches!(
            reader.observe(&suspending),
            Err(ReactiveError::ThrownFuture)
        ));
    }

    #[test]
    fn release_detaches_inputs() {
        let (runtime, event_loop) = Runtime::lab();
        let source = Observable::new_in(&runtime, ObservableOptions::new().with_default(1));
        let released = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&released);
        let input = source.clone();
        let selector = Selector::new_in(
            &runtime,
            move |observer, _| observer.observe(&input),
            ObservableOptions::new().on_release(move |value| sink.borrow_mut().push(value)),
        );
        let reader = SyncObserver::with_on_change(&runtime, || {});
        assert_eq!(reader.observe(&selector).ok(), Some(1));
        assert_eq!(source.observer_count(), 1);
        assert_eq!(selector.input_count(), 1);

        reader.reset();
        event_loop.advance(Duration::from_millis(1));
        assert!(!selector.is_initialized());
        assert_eq!(source.observer_count(), 0);
        assert_eq!(*released.borrow(), vec![1]);

        assert_eq!(reader.observe(&selector).ok(), Some(1));
        assert_eq!(source.observer_count(), 1);
    }

    #[test]
    fn destroy_detaches_and_clears() {
        let (runtime, _event_loop) = Runtime::lab();
        let source = Observable::new_in(&runtime, ObservableOptions::new().with_default(1));
        let input = source.clone();
        let selector = Selector::new_in(
            &runtime,
            move |observer, _| observer.observe(&input),
            ObservableOptions::new(),
        );
        let reader = SyncObserver::new_in(&runtime);
        assert_eq!(reader.observe(&selector).ok(), Some(1));
        selector.destroy();
        assert_eq!(source.observer_count(), 0);
        assert!(!selector.is_initialized());
        assert!(matches!(
            selector.peek(),
            Err(ReactiveError::NotInitialized { .. })
        ));
    }

    #[test]
    fn async_selector_resolves_through_its_inputs() {
        let (runtime, event_loop) = Runtime::lab();
        let source = AsyncObservable::new_in(
            &runtime,
            ObservableOptions::new().with_default(Provided::Value(20)),
        );
        let input = source.clone();
        let (runs, bump) = counter();
        let plus_one = AsyncSelector::new_in(
            &runtime,
            move |observer: AsyncObserver, _| {
                bump();
                let input = input.clone();
                async move { Ok(observer.observe(&input)?.await? + 1) }
            },
            ObservableOptions::new(),
        );
        let reader = SyncObserver::with_on_change(&runtime, || {});
        assert!(matches!(
            reader.observe(&plus_one),
            Err(ReactiveError::PendingAccess)
        ));
        event_loop.run_until_idle();
        assert_eq!(plus_one.status(), Some(Status::Resolved));
        assert_eq!(plus_one.peek_safe(), Some(21));
        assert_eq!(runs.get(), 1);

        source.set(async { Ok(30) });
        event_loop.run_until_idle();
        assert!(runs.get() >= 2);
        assert_eq!(plus_one.peek_safe(), Some(31));
    }

    #[test]
    fn debug_prefix_reaches_parts() {
        let (runtime, _event_loop) = Runtime::lab();
        let selector = Selector::new_in(&runtime, |_, _| Ok(1), ObservableOptions::new());
        let id = selector.debug_id();
        selector.set_debug_prefix("Store::planets");
        assert_eq!(selector.debug_id(), format!("Store::planets::{id}"));
    }
}
