#![forbid(unsafe_code)]

//! Runtime context and the batching update scheduler.
//!
//! # Design
//!
//! A [`Runtime`] bundles the engine [`Config`], the timer primitives, the
//! executor that settles futures, and one [`Scheduler`]. Every container is
//! built against a runtime; the `new` constructors use the thread's default
//! runtime and the `new_in` constructors take one explicitly, so tests can run
//! isolated engines side by side.
//!
//! The [`Scheduler`] coalesces synchronous bursts of changes into one flush,
//! deferred with [`Timers::set_immediate`]. A flush:
//!
//! 1. Repeatedly takes the queued observer with the smallest creation order.
//!    Component observers are parked; every other observer handles its change
//!    immediately, which may enqueue more observers into the same loop.
//! 2. Notifies parked component observers in creation order, skipping any
//!    whose change was acknowledged with [`Scheduler::change_handled`].
//! 3. Runs every queued idle-check, including checks queued by earlier ones.
//!
//! Creation order stands in for dependency order: parents are usually built
//! before their children. It is a heuristic, not a topological sort.
//!
//! # Invariants
//!
//! 1. At most one flush is scheduled or running at a time.
//! 2. Within a flush, immediate observers fire in ascending creation order.
//! 3. Component observers fire after all immediate observers.
//! 4. Work queued after the immediate loop has drained starts a new flush.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::channel::oneshot;
use indexmap::IndexMap;

use crate::config::Config;
use crate::error::{ReactiveError, Result};
use crate::event_loop::{EventLoop, Executor, Timers};
use crate::observable::ObservableNode;
use crate::observer::{ObserverInner, Subscriber};

// ─── Scheduler ───────────────────────────────────────────────────────────────

struct SchedulerInner {
    timers: Rc<dyn Timers>,
    is_updating: Cell<bool>,
    flush_scheduled: Cell<bool>,
    pending_changes: RefCell<BTreeMap<u64, Rc<ObserverInner>>>,
    pending_component_updates: RefCell<BTreeMap<u64, Rc<ObserverInner>>>,
    observables_to_check: RefCell<IndexMap<u64, Rc<dyn ObservableNode>>>,
    flushes: Cell<u64>,
}

/// Batching queue that orders and flushes change notifications.
///
/// Cloning a `Scheduler` creates a new handle to the **same** queue.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<SchedulerInner>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("is_updating", &self.inner.is_updating.get())
            .field("pending_changes", &self.inner.pending_changes.borrow().len())
            .field(
                "observables_to_check",
                &self.inner.observables_to_check.borrow().len(),
            )
            .finish()
    }
}

impl Scheduler {
    fn new(timers: Rc<dyn Timers>) -> Self {
        Self {
            inner: Rc::new(SchedulerInner {
                timers,
                is_updating: Cell::new(false),
                flush_scheduled: Cell::new(false),
                pending_changes: RefCell::new(BTreeMap::new()),
                pending_component_updates: RefCell::new(BTreeMap::new()),
                observables_to_check: RefCell::new(IndexMap::new()),
                flushes: Cell::new(0),
            }),
        }
    }

    /// Whether a flush is currently running.
    #[must_use]
    pub fn is_updating(&self) -> bool {
        self.inner.is_updating.get()
    }

    /// Whether any notification or idle-check is waiting for a flush.
    #[must_use]
    pub fn has_pending_work(&self) -> bool {
        !self.inner.pending_changes.borrow().is_empty()
            || !self.inner.pending_component_updates.borrow().is_empty()
            || !self.inner.observables_to_check.borrow().is_empty()
    }

    /// Number of flushes run so far.
    #[must_use]
    pub fn flush_count(&self) -> u64 {
        self.inner.flushes.get()
    }

    /// Withdraw a parked component notification.
    ///
    /// Used when the consumer already rendered the latest state outside the
    /// batch.
    pub fn change_handled(&self, observer: &impl Subscriber) {
        self.change_handled_by_order(observer.creation_order());
    }

    pub(crate) fn change_handled_by_order(&self, creation_order: u64) {
        self.inner
            .pending_component_updates
            .borrow_mut()
            .remove(&creation_order);
    }

    pub(crate) fn add_changed_observer(&self, observer: Rc<ObserverInner>) {
        self.inner
            .pending_changes
            .borrow_mut()
            .insert(observer.creation_order(), observer);
        self.schedule();
    }

    pub(crate) fn add_changed_observers(
        &self,
        observable: Rc<dyn ObservableNode>,
        observers: Vec<Rc<ObserverInner>>,
    ) {
        {
            let mut pending = self.inner.pending_changes.borrow_mut();
            for observer in observers {
                pending.insert(observer.creation_order(), observer);
            }
        }
        self.deferred_check_for_no_observers(observable);
    }

    pub(crate) fn deferred_check_for_no_observers(&self, observable: Rc<dyn ObservableNode>) {
        self.inner
            .observables_to_check
            .borrow_mut()
            .insert(observable.node_id(), observable);
        self.schedule();
    }

    fn schedule(&self) {
        let inner = &self.inner;
        if inner.is_updating.get() || inner.flush_scheduled.get() {
            return;
        }
        inner.flush_scheduled.set(true);
        let weak: Weak<SchedulerInner> = Rc::downgrade(inner);
        inner.timers.set_immediate(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                Scheduler { inner }.flush();
            }
        }));
    }

    fn flush(&self) {
        let inner = &self.inner;
        inner.flush_scheduled.set(false);
        if inner.is_updating.replace(true) {
            return;
        }
        inner.flushes.set(inner.flushes.get() + 1);
        let span = tracing::trace_span!("observite.flush", flush = inner.flushes.get());
        let _guard = span.enter();

        let mut notified = 0usize;
        loop {
            let next = inner.pending_changes.borrow_mut().pop_first();
            let Some((order, observer)) = next else {
                break;
            };
            if observer.is_component() {
                inner
                    .pending_component_updates
                    .borrow_mut()
                    .insert(order, observer);
            } else {
                observer.observable_changed();
                notified += 1;
            }
        }

        let parked: Vec<u64> = inner
            .pending_component_updates
            .borrow()
            .keys()
            .copied()
            .collect();
        let mut rendered = 0usize;
        for order in parked {
            let observer = inner.pending_component_updates.borrow_mut().remove(&order);
            if let Some(observer) = observer {
                observer.observable_changed();
                rendered += 1;
            }
        }

        let mut checked = 0usize;
        loop {
            let batch = std::mem::take(&mut *inner.observables_to_check.borrow_mut());
            if batch.is_empty() {
                break;
            }
            for observable in batch.into_values() {
                observable.check_for_no_observers();
                checked += 1;
            }
        }

        inner.pending_component_updates.borrow_mut().clear();
        inner.is_updating.set(false);
        tracing::debug!(notified, rendered, checked, "flush complete");

        if !inner.pending_changes.borrow().is_empty() {
            tracing::trace!("changes raised after the notify loop, scheduling another flush");
            self.schedule();
        }
    }
}

// ─── Runtime ─────────────────────────────────────────────────────────────────

struct RuntimeInner {
    config: Config,
    timers: Rc<dyn Timers>,
    executor: Rc<dyn Executor>,
    scheduler: Scheduler,
    event_loop: Option<Rc<EventLoop>>,
}

/// Explicit engine context: config, timers, executor and scheduler.
///
/// Cloning a `Runtime` creates a new handle to the **same** context.
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .field("scheduler", &self.inner.scheduler)
            .field("event_loop", &self.inner.event_loop)
            .finish()
    }
}

enum DefaultRuntime {
    Pending(Config),
    Ready(Runtime),
}

thread_local! {
    static DEFAULT_RUNTIME: RefCell<DefaultRuntime> =
        RefCell::new(DefaultRuntime::Pending(Config::default()));
}

impl Runtime {
    #[must_use]
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// Runtime on a wall-clock [`EventLoop`].
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::builder().config(config).build()
    }

    /// Runtime on a lab-clock [`EventLoop`], for deterministic tests.
    #[must_use]
    pub fn lab() -> (Self, Rc<EventLoop>) {
        Self::lab_with(Config::default())
    }

    #[must_use]
    pub fn lab_with(config: Config) -> (Self, Rc<EventLoop>) {
        let event_loop = Rc::new(EventLoop::lab(&crate::event_loop::LabClock::new()));
        let runtime = Self::builder()
            .config(config)
            .event_loop(Rc::clone(&event_loop))
            .build();
        (runtime, event_loop)
    }

    /// The thread's default runtime, created on first use.
    #[must_use]
    pub fn current() -> Self {
        DEFAULT_RUNTIME.with(|slot| {
            let mut slot = slot.borrow_mut();
            match &*slot {
                DefaultRuntime::Ready(runtime) => runtime.clone(),
                DefaultRuntime::Pending(config) => {
                    let runtime = Self::new(config.clone());
                    tracing::debug!("default runtime initialized");
                    *slot = DefaultRuntime::Ready(runtime.clone());
                    runtime
                }
            }
        })
    }

    /// Install `runtime` as the thread's default.
    ///
    /// Fails once the default runtime has been used or installed.
    pub fn install(runtime: Runtime) -> Result<()> {
        DEFAULT_RUNTIME.with(|slot| {
            let mut slot = slot.borrow_mut();
            if matches!(*slot, DefaultRuntime::Ready(_)) {
                return Err(ReactiveError::AlreadyInitialized);
            }
            *slot = DefaultRuntime::Ready(runtime);
            Ok(())
        })
    }

    /// Set the config the default runtime will be created with.
    ///
    /// Fails once the default runtime has been used or installed.
    pub fn set_config_options(config: Config) -> Result<()> {
        DEFAULT_RUNTIME.with(|slot| {
            let mut slot = slot.borrow_mut();
            match &mut *slot {
                DefaultRuntime::Ready(_) => Err(ReactiveError::AlreadyInitialized),
                DefaultRuntime::Pending(pending) => {
                    *pending = config;
                    Ok(())
                }
            }
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    #[must_use]
    pub fn timers(&self) -> &Rc<dyn Timers> {
        &self.inner.timers
    }

    /// The built-in event loop, when the runtime owns one.
    #[must_use]
    pub fn event_loop(&self) -> Option<&Rc<EventLoop>> {
        self.inner.event_loop.as_ref()
    }

    pub fn spawn_local(&self, future: impl Future<Output = ()> + 'static) {
        self.inner.executor.spawn_local(future.boxed_local());
    }

    /// Future that completes after `delay` on this runtime's timers.
    pub fn sleep(&self, delay: Duration) -> impl Future<Output = ()> + 'static {
        let (tx, rx) = oneshot::channel::<()>();
        self.inner.timers.set_timeout(
            delay,
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        async move {
            let _ = rx.await;
        }
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Runtime) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Builder for a [`Runtime`] with swapped timers or executor.
#[derive(Default)]
pub struct RuntimeBuilder {
    config: Config,
    timers: Option<Rc<dyn Timers>>,
    executor: Option<Rc<dyn Executor>>,
    event_loop: Option<Rc<EventLoop>>,
}

impl RuntimeBuilder {
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn timers(mut self, timers: Rc<dyn Timers>) -> Self {
        self.timers = Some(timers);
        self
    }

    #[must_use]
    pub fn executor(mut self, executor: Rc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Use `event_loop` for whichever of timers and executor are not set.
    #[must_use]
    pub fn event_loop(mut self, event_loop: Rc<EventLoop>) -> Self {
        self.event_loop = Some(event_loop);
        self
    }

    #[must_use]
    pub fn build(self) -> Runtime {
        let event_loop = match (&self.timers, &self.executor, self.event_loop) {
            (Some(_), Some(_), event_loop) => event_loop,
            (_, _, Some(event_loop)) => Some(event_loop),
            (_, _, None) => Some(Rc::new(EventLoop::new())),
        };
        let timers: Rc<dyn Timers> = match (self.timers, &event_loop) {
            (Some(timers), _) => timers,
            (None, Some(event_loop)) => Rc::clone(event_loop) as Rc<dyn Timers>,
            (None, None) => Rc::new(EventLoop::new()),
        };
        let executor: Rc<dyn Executor> = match (self.executor, &event_loop) {
            (Some(executor), _) => executor,
            (None, Some(event_loop)) => Rc::clone(event_loop) as Rc<dyn Executor>,
            (None, None) => Rc::new(EventLoop::new()),
        };
        Runtime {
            inner: Rc::new(RuntimeInner {
                scheduler: Scheduler::new(Rc::clone(&timers)),
                config: self.config,
                timers,
                executor,
                event_loop,
            }),
        }
    }
}
