#![forbid(unsafe_code)]

//! Observable state containers.
//!
//! # Design
//!
//! [`Observable<T>`] holds a synchronous value, [`AsyncObservable<T>`] a
//! value or a future of one. Both wrap an `ObservableCore`, which owns the
//! current [`StateRef`], the set of subscribed observers and the release
//! timer.
//!
//! Observers subscribe while they read. A real change hands the whole
//! observer set to the [`Scheduler`](crate::Scheduler) and clears it:
//! observers must read again to hear about the next change. The very first
//! value is not a change, since nobody could have read before it existed.
//!
//! When the last observer leaves, the scheduler runs an idle-check at the end
//! of its flush. The check arms a release timer according to the container's
//! [`ReleaseDelay`]; subscribing again cancels it. When the timer fires the
//! release callback receives the provided value and the state is dropped.
//!
//! # Invariants
//!
//! 1. A release timer is armed only when no observer is attached and none is
//!    armed already.
//! 2. A pending future is never released; eligibility is re-checked once it
//!    settles.
//! 3. `destroy` drops state and observers immediately and never invokes the
//!    release callback.
//! 4. Observers are held weakly; dropped observers never keep state alive.
//!
//! # Failure Modes
//!
//! - **Read before first set**: [`ReactiveError::NotInitialized`].
//! - **Release fires with observers attached**: the release is refused and
//!   logged as [`ReactiveError::ReleasedWhileObserved`].

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ahash::AHashMap;

use crate::config::ReleaseDelay;
use crate::equality::{ComparisonMethod, Equivalent, are_equal};
use crate::error::{ReactiveError, Result};
use crate::event_loop::TimerId;
use crate::observer::{ObserverInner, ObserverRef};
use crate::runtime::Runtime;
use crate::state_ref::{Provided, StateRef, Status};
use crate::store::DebugPrefix;

// ─── Observable ID generation ────────────────────────────────────────────────

static NEXT_OBSERVABLE_ID: AtomicU64 = AtomicU64::new(1);

fn next_observable_id() -> u64 {
    NEXT_OBSERVABLE_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Capability traits ───────────────────────────────────────────────────────

/// Type-erased view of a container, used by observers and the scheduler.
pub(crate) trait ObservableNode {
    fn node_id(&self) -> u64;
    fn debug_id(&self) -> String;
    fn remove_observer(&self, creation_order: u64);
    fn check_for_no_observers(&self);
}

/// Anything an observer can read and subscribe to.
pub trait Source<T> {
    /// Subscribe `observer` (when it has a change callback) and return the
    /// current state.
    fn observe_ref(&self, observer: &ObserverRef) -> Result<StateRef<T>>;
}

/// Keyed collections an observer can read one entry of.
pub trait KeyedSource<K, T> {
    /// Subscribe `observer` to the collection and to the entry for `key`.
    ///
    /// `Ok(None)` when the key is absent and cannot be materialized.
    fn observe_key_ref(&self, observer: &ObserverRef, key: &K) -> Result<Option<StateRef<T>>>;
}

// ─── Options ─────────────────────────────────────────────────────────────────

/// Construction options for a container whose owner provides `P`.
///
/// `P` is `T` for [`Observable<T>`] and [`Provided<T>`] for
/// [`AsyncObservable<T>`].
pub struct ObservableOptions<P> {
    pub(crate) default: Option<P>,
    pub(crate) debug_id: Option<String>,
    pub(crate) comparison: Option<ComparisonMethod>,
    pub(crate) release_delay: Option<ReleaseDelay>,
    pub(crate) on_changed: Option<Rc<dyn Fn(&P)>>,
    pub(crate) on_release: Option<Rc<dyn Fn(P)>>,
}

impl<P> Default for ObservableOptions<P> {
    fn default() -> Self {
        Self {
            default: None,
            debug_id: None,
            comparison: None,
            release_delay: None,
            on_changed: None,
            on_release: None,
        }
    }
}

impl<P: Clone> Clone for ObservableOptions<P> {
    fn clone(&self) -> Self {
        Self {
            default: self.default.clone(),
            debug_id: self.debug_id.clone(),
            comparison: self.comparison,
            release_delay: self.release_delay,
            on_changed: self.on_changed.clone(),
            on_release: self.on_release.clone(),
        }
    }
}

impl<P: fmt::Debug> fmt::Debug for ObservableOptions<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableOptions")
            .field("default", &self.default)
            .field("debug_id", &self.debug_id)
            .field("comparison", &self.comparison)
            .field("release_delay", &self.release_delay)
            .field("on_changed", &self.on_changed.is_some())
            .field("on_release", &self.on_release.is_some())
            .finish()
    }
}

impl<P> ObservableOptions<P> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starting value; without one, reads fail until the first `set`.
    #[must_use]
    pub fn with_default(mut self, value: P) -> Self {
        self.default = Some(value);
        self
    }

    #[must_use]
    pub fn with_debug_id(mut self, debug_id: impl Into<String>) -> Self {
        self.debug_id = Some(debug_id.into());
        self
    }

    #[must_use]
    pub fn with_comparison(mut self, method: ComparisonMethod) -> Self {
        self.comparison = Some(method);
        self
    }

    #[must_use]
    pub fn with_release_delay(mut self, delay: ReleaseDelay) -> Self {
        self.release_delay = Some(delay);
        self
    }

    /// Side effect run after every change, including the first value.
    #[must_use]
    pub fn on_changed(mut self, callback: impl Fn(&P) + 'static) -> Self {
        self.on_changed = Some(Rc::new(callback));
        self
    }

    /// Cleanup run with the provided value when idle state is released.
    #[must_use]
    pub fn on_release(mut self, callback: impl Fn(P) + 'static) -> Self {
        self.on_release = Some(Rc::new(callback));
        self
    }
}

impl<T: Clone + 'static> ObservableOptions<Provided<T>> {
    /// Start from a future instead of a value.
    #[must_use]
    pub fn with_future(self, future: impl Future<Output = Result<T>> + 'static) -> Self {
        self.with_default(Provided::future(future))
    }
}

/// Options normalized to the provided form.
pub(crate) struct CoreOptions<T> {
    pub(crate) default: Option<Provided<T>>,
    pub(crate) debug_id: Option<String>,
    pub(crate) comparison: Option<ComparisonMethod>,
    pub(crate) release_delay: Option<ReleaseDelay>,
    pub(crate) on_changed: Option<Rc<dyn Fn(&Provided<T>)>>,
    pub(crate) on_release: Option<Rc<dyn Fn(Provided<T>)>>,
    /// Runs on every release, before `on_release`, even for error states.
    pub(crate) on_evict: Option<Rc<dyn Fn()>>,
}

impl<T: Clone + 'static> CoreOptions<T> {
    pub(crate) fn with_on_evict(mut self, on_evict: impl Fn() + 'static) -> Self {
        self.on_evict = Some(match self.on_evict.take() {
            Some(outer) => Rc::new(move || {
                on_evict();
                outer();
            }),
            None => Rc::new(on_evict),
        });
        self
    }

    pub(crate) fn from_values(options: ObservableOptions<T>) -> Self {
        Self {
            default: options.default.map(Provided::Value),
            debug_id: options.debug_id,
            comparison: options.comparison,
            release_delay: options.release_delay,
            on_changed: options.on_changed.map(|callback| {
                Rc::new(move |provided: &Provided<T>| {
                    if let Provided::Value(value) = provided {
                        callback(value);
                    }
                }) as Rc<dyn Fn(&Provided<T>)>
            }),
            on_release: options.on_release.map(|callback| {
                Rc::new(move |provided: Provided<T>| {
                    if let Provided::Value(value) = provided {
                        callback(value);
                    }
                }) as Rc<dyn Fn(Provided<T>)>
            }),
            on_evict: None,
        }
    }

    pub(crate) fn from_provided(options: ObservableOptions<Provided<T>>) -> Self {
        Self {
            default: options.default,
            debug_id: options.debug_id,
            comparison: options.comparison,
            release_delay: options.release_delay,
            on_changed: options.on_changed,
            on_release: options.on_release,
            on_evict: None,
        }
    }
}

// ─── Core ────────────────────────────────────────────────────────────────────

pub(crate) struct ObservableCore<T> {
    id: u64,
    weak_self: Weak<ObservableCore<T>>,
    debug_id: RefCell<String>,
    runtime: Runtime,
    comparison: ComparisonMethod,
    release_delay: Option<Duration>,
    on_changed: Option<Rc<dyn Fn(&Provided<T>)>>,
    on_release: Option<Rc<dyn Fn(Provided<T>)>>,
    on_evict: Option<Rc<dyn Fn()>>,
    state: RefCell<Option<StateRef<T>>>,
    observers: RefCell<AHashMap<u64, Weak<ObserverInner>>>,
    release_timer: Cell<Option<TimerId>>,
}

impl<T: Clone + 'static> ObservableCore<T> {
    pub(crate) fn new(
        runtime: &Runtime,
        options: CoreOptions<T>,
        release_fallback: ReleaseDelay,
    ) -> Rc<Self> {
        let config = runtime.config();
        let id = next_observable_id();
        let release_delay =
            config.resolve_release_delay(options.release_delay.unwrap_or(release_fallback));
        let core = Rc::new_cyclic(|weak_self| Self {
            id,
            weak_self: weak_self.clone(),
            debug_id: RefCell::new(options.debug_id.unwrap_or_else(|| id.to_string())),
            runtime: runtime.clone(),
            comparison: options.comparison.unwrap_or(config.default_comparison),
            release_delay,
            on_changed: options.on_changed,
            on_release: options.on_release,
            on_evict: options.on_evict,
            state: RefCell::new(None),
            observers: RefCell::new(AHashMap::new()),
            release_timer: Cell::new(None),
        });
        if let Some(default) = options.default {
            let state = core.make_state(default);
            *core.state.borrow_mut() = Some(state);
        }
        core
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub(crate) fn comparison(&self) -> ComparisonMethod {
        self.comparison
    }

    fn node(&self) -> Option<Rc<dyn ObservableNode>> {
        self.weak_self
            .upgrade()
            .map(|core| core as Rc<dyn ObservableNode>)
    }

    fn make_state(&self, provided: Provided<T>) -> StateRef<T> {
        let state = StateRef::from_provided(&self.runtime, provided);
        if state.status() == Status::Pending {
            let weak = self.weak_self.clone();
            state.set_on_status_changed(move |_| {
                if let Some(core) = weak.upgrade() {
                    core.after_settle();
                }
            });
        }
        state
    }

    fn after_settle(&self) {
        if self.state.borrow().is_none() || self.live_observer_count() != 0 {
            return;
        }
        if let Some(node) = self.node() {
            self.runtime.scheduler().deferred_check_for_no_observers(node);
        }
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.state.borrow().is_some()
    }

    pub(crate) fn current_state(&self) -> Option<StateRef<T>> {
        self.state.borrow().clone()
    }

    pub(crate) fn peek(&self) -> Result<Option<T>> {
        self.current_state()
            .map(|state| state.peek())
            .ok_or_else(|| ReactiveError::not_initialized(self.debug_id.borrow().clone()))
    }

    /// Run `f` against the current resolved value, `None` when there is none.
    pub(crate) fn with_current<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        match self.current_state() {
            Some(state) => state.with_resolved(f),
            None => f(None),
        }
    }

    /// Replace the state unconditionally.
    pub(crate) fn replace(&self, provided: Provided<T>) {
        let was_initialized = self.is_initialized();
        let state = self.make_state(provided.clone());
        *self.state.borrow_mut() = Some(state);
        if was_initialized {
            self.changed();
        }
        let callback = self.on_changed.clone();
        if let Some(callback) = callback {
            callback(&provided);
        }
    }

    pub(crate) fn set_error(&self, error: ReactiveError) {
        let was_initialized = self.is_initialized();
        tracing::debug!(debug_id = %self.debug_id.borrow(), error = %error, "observable failed");
        *self.state.borrow_mut() = Some(StateRef::from_error(error));
        if was_initialized {
            self.changed();
        }
    }

    fn changed(&self) {
        let observers: Vec<Rc<ObserverInner>> = std::mem::take(&mut *self.observers.borrow_mut())
            .into_values()
            .filter_map(|observer| observer.upgrade())
            .collect();
        tracing::trace!(
            debug_id = %self.debug_id.borrow(),
            observers = observers.len(),
            "observable changed"
        );
        if let Some(node) = self.node() {
            self.runtime
                .scheduler()
                .add_changed_observers(node, observers);
        }
    }

    pub(crate) fn observe_ref(&self, observer: &ObserverRef) -> Result<StateRef<T>> {
        let state = self
            .current_state()
            .ok_or_else(|| ReactiveError::not_initialized(self.debug_id.borrow().clone()))?;
        let Some(node) = self.node() else {
            return Ok(state);
        };
        let observer = observer.inner();
        if observer.add_observable(node)? {
            self.cancel_release();
            self.observers
                .borrow_mut()
                .insert(observer.creation_order(), Rc::downgrade(observer));
        }
        Ok(state)
    }

    fn live_observer_count(&self) -> usize {
        let mut observers = self.observers.borrow_mut();
        observers.retain(|_, observer| observer.strong_count() > 0);
        observers.len()
    }

    fn cancel_release(&self) {
        if let Some(id) = self.release_timer.take() {
            self.runtime.timers().clear_timeout(id);
        }
    }

    fn clear_state(&self) {
        self.state.borrow_mut().take();
        self.observers.borrow_mut().clear();
    }

    pub(crate) fn destroy(&self) {
        self.cancel_release();
        self.clear_state();
    }

    fn release(&self) {
        self.release_timer.set(None);
        let observers = self.live_observer_count();
        if observers != 0 {
            let error = ReactiveError::ReleasedWhileObserved {
                debug_id: self.debug_id.borrow().clone(),
                observers,
            };
            tracing::error!(%error, "release refused");
            return;
        }
        let Some(state) = self.current_state() else {
            return;
        };
        tracing::debug!(debug_id = %self.debug_id.borrow(), "releasing idle state");
        if let Some(on_evict) = self.on_evict.clone() {
            on_evict();
        }
        if let (Some(holder), Some(callback)) = (state.holder(), self.on_release.clone()) {
            callback(holder);
        }
        self.clear_state();
    }

    pub(crate) fn observer_count(&self) -> usize {
        self.live_observer_count()
    }

    pub(crate) fn is_release_scheduled(&self) -> bool {
        self.release_timer.get().is_some()
    }

    pub(crate) fn debug_label(&self) -> String {
        self.debug_id.borrow().clone()
    }

    pub(crate) fn set_debug_prefix(&self, prefix: &str) {
        let mut debug_id = self.debug_id.borrow_mut();
        *debug_id = format!("{prefix}::{debug_id}");
    }
}

impl<T: Clone + 'static> ObservableNode for ObservableCore<T> {
    fn node_id(&self) -> u64 {
        self.id
    }

    fn debug_id(&self) -> String {
        self.debug_label()
    }

    fn remove_observer(&self, creation_order: u64) {
        if self
            .observers
            .borrow_mut()
            .remove(&creation_order)
            .is_none()
        {
            return;
        }
        if self.live_observer_count() != 0 {
            return;
        }
        let pending = self
            .current_state()
            .is_some_and(|state| state.status() == Status::Pending);
        if pending {
            return;
        }
        if let Some(node) = self.node() {
            self.runtime.scheduler().deferred_check_for_no_observers(node);
        }
    }

    fn check_for_no_observers(&self) {
        let Some(state) = self.current_state() else {
            return;
        };
        let Some(delay) = self.release_delay else {
            return;
        };
        if state.status() == Status::Pending
            || self.live_observer_count() != 0
            || self.release_timer.get().is_some()
        {
            return;
        }
        let weak = self.weak_self.clone();
        let id = self.runtime.timers().set_timeout(
            delay,
            Box::new(move || {
                if let Some(core) = weak.upgrade() {
                    core.release();
                }
            }),
        );
        tracing::trace!(debug_id = %self.debug_id.borrow(), ?delay, "release armed");
        self.release_timer.set(Some(id));
    }
}

// ─── Observable ──────────────────────────────────────────────────────────────

/// Synchronous state container.
///
/// Cloning an `Observable` creates a new handle to the **same** container.
pub struct Observable<T> {
    core: Rc<ObservableCore<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl<T: Clone + fmt::Debug + 'static> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("debug_id", &self.core.debug_label())
            .field("state", &self.core.current_state())
            .finish()
    }
}

impl<T: Equivalent + Clone + 'static> Observable<T> {
    /// Create on the thread's default runtime.
    pub fn new(options: ObservableOptions<T>) -> Self {
        Self::new_in(&Runtime::current(), options)
    }

    pub fn new_in(runtime: &Runtime, options: ObservableOptions<T>) -> Self {
        Self::from_core_options(runtime, CoreOptions::from_values(options))
    }

    /// Create on the default runtime, seeded with `value`.
    pub fn with_value(value: T) -> Self {
        Self::new(ObservableOptions::new().with_default(value))
    }

    pub(crate) fn from_core_options(runtime: &Runtime, options: CoreOptions<T>) -> Self {
        Self {
            core: ObservableCore::new(
                runtime,
                options,
                runtime.config().observable_release_delay,
            ),
        }
    }

    pub(crate) fn with_release_fallback(
        runtime: &Runtime,
        options: CoreOptions<T>,
        release_fallback: ReleaseDelay,
    ) -> Self {
        Self {
            core: ObservableCore::new(runtime, options, release_fallback),
        }
    }

    /// Write a value; a no-op when it equals the current one.
    pub fn set(&self, value: T) {
        let method = self.core.comparison();
        let unchanged = self
            .core
            .with_current(|current| current.is_some_and(|current| are_equal(current, &value, method)));
        if unchanged {
            return;
        }
        self.core.replace(Provided::Value(value));
    }
}

impl<T: Clone + 'static> Observable<T> {
    /// Current value without subscribing.
    ///
    /// `Ok(None)` when the state is rejected.
    pub fn peek(&self) -> Result<Option<T>> {
        self.core.peek()
    }

    /// Force-fail: every later read returns `error` until the next `set`.
    pub fn set_error(&self, error: ReactiveError) {
        self.core.set_error(error);
    }

    /// Drop state and observers now, without the release callback.
    pub fn destroy(&self) {
        self.core.destroy();
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.core.is_initialized()
    }

    #[must_use]
    pub fn debug_id(&self) -> String {
        self.core.debug_label()
    }

    pub fn set_debug_prefix(&self, prefix: &str) {
        self.core.set_debug_prefix(prefix);
    }

    /// Observers currently subscribed.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.core.observer_count()
    }

    #[must_use]
    pub fn is_release_scheduled(&self) -> bool {
        self.core.is_release_scheduled()
    }

    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        self.core.runtime()
    }

    pub(crate) fn current_state(&self) -> Option<StateRef<T>> {
        self.core.current_state()
    }
}

impl<T: Clone + 'static> Source<T> for Observable<T> {
    fn observe_ref(&self, observer: &ObserverRef) -> Result<StateRef<T>> {
        self.core.observe_ref(observer)
    }
}

impl<T> Equivalent for Observable<T> {
    fn identical(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }
}

impl<T: Clone + 'static> DebugPrefix for Observable<T> {
    fn set_debug_prefix(&self, prefix: &str) {
        self.core.set_debug_prefix(prefix);
    }
}

// ─── AsyncObservable ─────────────────────────────────────────────────────────

/// State container whose owner provides futures.
///
/// A new future always counts as a change.
pub struct AsyncObservable<T> {
    core: Rc<ObservableCore<T>>,
}

impl<T> Clone for AsyncObservable<T> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl<T: Clone + fmt::Debug + 'static> fmt::Debug for AsyncObservable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncObservable")
            .field("debug_id", &self.core.debug_label())
            .field("state", &self.core.current_state())
            .finish()
    }
}

impl<T: Clone + 'static> AsyncObservable<T> {
    pub fn new(options: ObservableOptions<Provided<T>>) -> Self {
        Self::new_in(&Runtime::current(), options)
    }

    pub fn new_in(runtime: &Runtime, options: ObservableOptions<Provided<T>>) -> Self {
        Self::with_release_fallback(
            runtime,
            CoreOptions::from_provided(options),
            runtime.config().observable_release_delay,
        )
    }

    pub(crate) fn with_release_fallback(
        runtime: &Runtime,
        options: CoreOptions<T>,
        release_fallback: ReleaseDelay,
    ) -> Self {
        Self {
            core: ObservableCore::new(runtime, options, release_fallback),
        }
    }

    /// Provide a new future.
    pub fn set(&self, future: impl Future<Output = Result<T>> + 'static) {
        self.core.replace(Provided::future(future));
    }

    /// Provide a value or a future.
    pub fn set_provided(&self, provided: Provided<T>) {
        self.core.replace(provided);
    }

    /// Resolved value without subscribing; `Ok(None)` while pending or
    /// rejected.
    pub fn peek(&self) -> Result<Option<T>> {
        self.core.peek()
    }

    /// Status of the current state, `None` before the first value.
    #[must_use]
    pub fn status(&self) -> Option<Status> {
        self.core.current_state().map(|state| state.status())
    }

    pub fn set_error(&self, error: ReactiveError) {
        self.core.set_error(error);
    }

    pub fn destroy(&self) {
        self.core.destroy();
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.core.is_initialized()
    }

    #[must_use]
    pub fn debug_id(&self) -> String {
        self.core.debug_label()
    }

    pub fn set_debug_prefix(&self, prefix: &str) {
        self.core.set_debug_prefix(prefix);
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.core.observer_count()
    }

    #[must_use]
    pub fn is_release_scheduled(&self) -> bool {
        self.core.is_release_scheduled()
    }
}

impl<T: Clone + 'static> Source<T> for AsyncObservable<T> {
    fn observe_ref(&self, observer: &ObserverRef) -> Result<StateRef<T>> {
        self.core.observe_ref(observer)
    }
}

impl<T> Equivalent for AsyncObservable<T> {
    fn identical(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }
}

impl<T: Clone + 'static> DebugPrefix for AsyncObservable<T> {
    fn set_debug_prefix(&self, prefix: &str) {
        self.core.set_debug_prefix(prefix);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::observer::{Subscriber, SyncObserver};
    use crate::value::Value;
    use futures::channel::oneshot;

    fn counter() -> (Rc<Cell<u32>>, impl Fn() + 'static) {
        let count = Rc::new(Cell::new(0u32));
        let bump = {
            let count = Rc::clone(&count);
            move || count.set(count.get() + 1)
        };
        (count, bump)
    }

    #[test]
    fn peek_before_first_set_fails() {
        let (runtime, _event_loop) = Runtime::lab();
        let observable = Observable::<i32>::new_in(&runtime, ObservableOptions::new());
        assert!(!observable.is_initialized());
        assert!(matches!(
            observable.peek(),
            Err(ReactiveError::NotInitialized { .. })
        ));
        observable.set(1);
        assert_eq!(observable.peek().ok().flatten(), Some(1));
    }

    #[test]
    fn first_set_only_runs_on_changed() {
        let (runtime, event_loop) = Runtime::lab();
        let (changes, bump) = counter();
        let observable = Observable::<i32>::new_in(
            &runtime,
            ObservableOptions::new().on_changed(move |_| bump()),
        );
        observable.set(5);
        event_loop.run_until_idle();
        assert_eq!(changes.get(), 1);
        assert_eq!(runtime.scheduler().flush_count(), 0);
    }

    #[test]
    fn equal_writes_are_ignored() {
        let (runtime, event_loop) = Runtime::lab();
        let (changes, bump) = counter();
        let observable = Observable::new_in(
            &runtime,
            ObservableOptions::new()
                .with_default(Value::object([("a", Value::from(1))]))
                .on_changed(move |_| bump()),
        );
        let observer = SyncObserver::new_in(&runtime);
        let (notified, notify) = counter();
        observer.set_on_change(notify);
        assert!(observer.observe(&observable).is_ok());

        observable.set(Value::object([("a", Value::from(1))]));
        event_loop.run_until_idle();
        assert_eq!(changes.get(), 0);
        assert_eq!(notified.get(), 0);

        observable.set(Value::object([("a", Value::from(2))]));
        event_loop.run_until_idle();
        assert_eq!(changes.get(), 1);
        assert_eq!(notified.get(), 1);
    }

    #[test]
    fn exact_comparison_treats_new_containers_as_changes() {
        let (runtime, _event_loop) = Runtime::lab();
        let (changes, bump) = counter();
        let observable = Observable::new_in(
            &runtime,
            ObservableOptions::new()
                .with_default(vec![1, 2])
                .with_comparison(ComparisonMethod::Exact)
                .on_changed(move |_| bump()),
        );
        observable.set(vec![1, 2]);
        assert_eq!(changes.get(), 1);
    }

    #[test]
    fn change_clears_observer_set() {
        let (runtime, event_loop) = Runtime::lab();
        let observable =
            Observable::new_in(&runtime, ObservableOptions::new().with_default(1));
        let observer = SyncObserver::new_in(&runtime);
        observer.set_on_change(|| {});
        assert!(observer.observe(&observable).is_ok());
        assert_eq!(observable.observer_count(), 1);

        observable.set(2);
        assert_eq!(observable.observer_count(), 0);
        event_loop.run_until_idle();
        assert_eq!(observable.observer_count(), 0);
    }

    #[test]
    fn observer_without_callback_does_not_subscribe() {
        let (runtime, _event_loop) = Runtime::lab();
        let observable =
            Observable::new_in(&runtime, ObservableOptions::new().with_default(1));
        let observer = SyncObserver::new_in(&runtime);
        assert_eq!(observer.observe(&observable).ok(), Some(1));
        assert_eq!(observable.observer_count(), 0);
    }

    #[test]
    fn release_waits_for_delay_and_calls_back() {
        let (runtime, event_loop) = Runtime::lab();
        let released = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&released);
        let observable = Observable::new_in(
            &runtime,
            ObservableOptions::new()
                .with_default(7)
                .with_release_delay(ReleaseDelay::from_millis(10))
                .on_release(move |value| sink.borrow_mut().push(value)),
        );
        let observer = SyncObserver::new_in(&runtime);
        observer.set_on_change(|| {});
        assert!(observer.observe(&observable).is_ok());

        observer.reset();
        event_loop.run_until_idle();
        assert!(observable.is_release_scheduled());

        event_loop.advance(Duration::from_millis(9));
        assert!(observable.is_initialized());
        event_loop.advance(Duration::from_millis(1));
        assert!(!observable.is_initialized());
        assert_eq!(*released.borrow(), vec![7]);
    }

    #[test]
    fn resubscribe_cancels_release() {
        let (runtime, event_loop) = Runtime::lab();
        let (releases, bump) = counter();
        let observable = Observable::new_in(
            &runtime,
            ObservableOptions::new()
                .with_default(1)
                .with_release_delay(ReleaseDelay::Default)
                .on_release(move |_| bump()),
        );
        let observer = SyncObserver::new_in(&runtime);
        observer.set_on_change(|| {});
        assert!(observer.observe(&observable).is_ok());
        observer.reset();
        event_loop.run_until_idle();
        assert!(observable.is_release_scheduled());

        assert!(observer.observe(&observable).is_ok());
        assert!(!observable.is_release_scheduled());
        event_loop.advance(Duration::from_millis(100));
        assert_eq!(releases.get(), 0);
        assert!(observable.is_initialized());
    }

    #[test]
    fn never_release_keeps_state() {
        let (runtime, event_loop) = Runtime::lab();
        let observable =
            Observable::new_in(&runtime, ObservableOptions::new().with_default(1));
        let observer = SyncObserver::new_in(&runtime);
        observer.set_on_change(|| {});
        assert!(observer.observe(&observable).is_ok());
        observer.destroy();
        event_loop.advance(Duration::from_secs(60));
        assert!(!observable.is_release_scheduled());
        assert_eq!(observable.peek().ok().flatten(), Some(1));
    }

    #[test]
    fn forced_error_skips_release_callback() {
        let (runtime, event_loop) = Runtime::lab();
        let (releases, bump) = counter();
        let observable = Observable::new_in(
            &runtime,
            ObservableOptions::new()
                .with_default(1)
                .with_release_delay(ReleaseDelay::Default)
                .on_release(move |_| bump()),
        );
        let observer = SyncObserver::new_in(&runtime);
        observer.set_on_change(|| {});
        assert!(observer.observe(&observable).is_ok());
        observable.set_error(ReactiveError::message("forced"));
        event_loop.advance(Duration::from_millis(5));
        assert!(!observable.is_initialized());
        assert_eq!(releases.get(), 0);
    }

    #[test]
    fn set_error_is_cached_for_every_read() {
        let (runtime, _event_loop) = Runtime::lab();
        let observable =
            Observable::new_in(&runtime, ObservableOptions::new().with_default(1));
        observable.set_error(ReactiveError::message("down"));
        let observer = SyncObserver::new_in(&runtime);
        let first = observer.observe(&observable).unwrap_err();
        let second = observer.observe(&observable).unwrap_err();
        assert!(first.is_same(&second));
        assert_eq!(observable.peek().ok().flatten(), None);
        observable.set(3);
        assert_eq!(observer.observe(&observable).ok(), Some(3));
    }

    #[test]
    fn destroy_skips_release_callback() {
        let (runtime, event_loop) = Runtime::lab();
        let (releases, bump) = counter();
        let observable = Observable::new_in(
            &runtime,
            ObservableOptions::new()
                .with_default(1)
                .with_release_delay(ReleaseDelay::Default)
                .on_release(move |_| bump()),
        );
        let observer = SyncObserver::new_in(&runtime);
        observer.set_on_change(|| {});
        assert!(observer.observe(&observable).is_ok());
        observer.reset();
        event_loop.run_until_idle();
        observable.destroy();
        event_loop.advance(Duration::from_millis(10));
        assert_eq!(releases.get(), 0);
        assert!(!observable.is_initialized());
    }

    #[test]
    fn pending_future_is_not_released_until_settled() {
        let (runtime, event_loop) = Runtime::lab();
        let (tx, rx) = oneshot::channel::<i32>();
        let (releases, bump) = counter();
        let observable = AsyncObservable::new_in(
            &runtime,
            ObservableOptions::new()
                .with_future(async move { rx.await.map_err(ReactiveError::failed) })
                .with_release_delay(ReleaseDelay::Default)
                .on_release(move |_| bump()),
        );
        let observer = SyncObserver::new_in(&runtime);
        observer.set_on_change(|| {});
        assert!(observer.observe(&observable).unwrap_err().is_pending());
        observer.reset();
        event_loop.advance(Duration::from_millis(10));
        assert_eq!(observable.status(), Some(Status::Pending));
        assert!(!observable.is_release_scheduled());

        let _ = tx.send(4);
        event_loop.run_until_idle();
        assert_eq!(observable.peek().ok().flatten(), Some(4));
        assert!(observable.is_release_scheduled());
        event_loop.advance(Duration::from_millis(1));
        assert_eq!(releases.get(), 1);
    }

    #[test]
    fn async_set_always_changes() {
        let (runtime, event_loop) = Runtime::lab();
        let observable = AsyncObservable::new_in(
            &runtime,
            ObservableOptions::new().with_default(Provided::Value(1)),
        );
        let observer = SyncObserver::new_in(&runtime);
        let (notified, notify) = counter();
        observer.set_on_change(notify);
        assert_eq!(observer.observe(&observable).ok(), Some(1));

        observable.set(async { Ok(1) });
        event_loop.run_until_idle();
        assert_eq!(notified.get(), 1);
        assert_eq!(observable.peek().ok().flatten(), Some(1));
    }

    #[test]
    fn debug_prefix_nests() {
        let (runtime, _event_loop) = Runtime::lab();
        let observable = Observable::<i32>::new_in(
            &runtime,
            ObservableOptions::new().with_debug_id("planet"),
        );
        observable.set_debug_prefix("Store");
        assert_eq!(observable.debug_id(), "Store::planet");
    }
}
