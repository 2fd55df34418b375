#![forbid(unsafe_code)]

//! Timer primitives and a single-threaded host loop.
//!
//! The engine never sleeps or spawns threads on its own. It asks a
//! [`Timers`] implementation for timeouts, intervals and a "next tick"
//! callback, and an [`Executor`] for driving futures. [`EventLoop`] provides
//! both on top of a [`LocalPool`].
//!
//! # Time sources
//!
//! An event loop reads either the wall clock or a [`LabClock`]. With a lab
//! clock nothing happens until [`EventLoop::advance`] moves time forward,
//! which makes release delays and animations deterministic in tests.
//!
//! # Invariants
//!
//! 1. Timers fire in due order; timers due at the same instant fire in the
//!    order they were armed.
//! 2. Immediate callbacks and ready tasks run before any timer is examined.
//! 3. Clearing an interval from inside its own callback stops it.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use ahash::AHashMap;
use futures::executor::{LocalPool, LocalSpawner};
use futures::future::LocalBoxFuture;
use futures::task::LocalSpawnExt;
use web_time::Instant;

/// Handle returned by [`Timers::set_timeout`] and [`Timers::set_interval`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Swappable timer primitives.
pub trait Timers {
    fn set_timeout(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimerId;
    fn clear_timeout(&self, id: TimerId);
    fn set_interval(&self, period: Duration, callback: Box<dyn FnMut()>) -> TimerId;
    fn clear_interval(&self, id: TimerId);
    /// Run `callback` on the next turn of the loop, before any timer.
    fn set_immediate(&self, callback: Box<dyn FnOnce()>);
}

/// Spawns futures that settle state refs.
pub trait Executor {
    fn spawn_local(&self, future: LocalBoxFuture<'static, ()>);
}

// ─── Time source ─────────────────────────────────────────────────────────────

/// Manually advanced clock for deterministic tests.
///
/// Clones share the same time.
#[derive(Debug, Clone)]
pub struct LabClock {
    epoch: Instant,
    offset_us: Rc<Cell<u64>>,
}

impl LabClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            offset_us: Rc::new(Cell::new(0)),
        }
    }

    pub fn advance(&self, delta: Duration) {
        self.offset_us
            .set(self.offset_us.get().saturating_add(duration_to_us(delta)));
    }

    /// Time elapsed since the clock was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        Duration::from_micros(self.offset_us.get())
    }

    #[must_use]
    pub fn now(&self) -> Instant {
        self.epoch + self.elapsed()
    }

    fn elapsed_us(&self) -> u64 {
        self.offset_us.get()
    }

    fn advance_to_us(&self, target_us: u64) {
        if target_us > self.offset_us.get() {
            self.offset_us.set(target_us);
        }
    }
}

impl Default for LabClock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
enum TimeSource {
    Real(Instant),
    Lab(LabClock),
}

impl TimeSource {
    fn elapsed_us(&self) -> u64 {
        match self {
            Self::Real(epoch) => duration_to_us(epoch.elapsed()),
            Self::Lab(clock) => clock.elapsed_us(),
        }
    }
}

fn duration_to_us(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

// ─── Event loop ──────────────────────────────────────────────────────────────

enum TimerTask {
    Once(Box<dyn FnOnce()>),
    Every {
        period_us: u64,
        callback: Box<dyn FnMut()>,
    },
}

/// Single-threaded host for timers, immediates and local tasks.
pub struct EventLoop {
    source: TimeSource,
    next_id: Cell<u64>,
    immediates: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    /// Keyed by `(due_us, id)`.
    timers: RefCell<BTreeMap<(u64, u64), TimerTask>>,
    due_by_id: RefCell<AHashMap<u64, u64>>,
    firing: Cell<Option<u64>>,
    firing_cleared: Cell<bool>,
    pool: RefCell<LocalPool>,
    spawner: LocalSpawner,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("source", &self.source)
            .field("immediates", &self.immediates.borrow().len())
            .field("timers", &self.timers.borrow().len())
            .finish()
    }
}

impl EventLoop {
    /// Event loop on the wall clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_source(TimeSource::Real(Instant::now()))
    }

    /// Event loop driven by `clock`.
    #[must_use]
    pub fn lab(clock: &LabClock) -> Self {
        Self::with_source(TimeSource::Lab(clock.clone()))
    }

    fn with_source(source: TimeSource) -> Self {
        let pool = LocalPool::new();
        let spawner = pool.spawner();
        Self {
            source,
            next_id: Cell::new(1),
            immediates: RefCell::new(VecDeque::new()),
            timers: RefCell::new(BTreeMap::new()),
            due_by_id: RefCell::new(AHashMap::new()),
            firing: Cell::new(None),
            firing_cleared: Cell::new(false),
            pool: RefCell::new(pool),
            spawner,
        }
    }

    /// Whether time only moves through [`advance`](Self::advance).
    #[must_use]
    pub fn is_lab(&self) -> bool {
        matches!(self.source, TimeSource::Lab(_))
    }

    /// Time since the loop was created, as seen by its clock.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        Duration::from_micros(self.source.elapsed_us())
    }

    /// Number of armed timeouts and intervals.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.timers.borrow().len()
    }

    /// Time until the earliest armed timer, zero when one is overdue.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Duration> {
        let due = self.earliest_due()?;
        Some(Duration::from_micros(
            due.saturating_sub(self.source.elapsed_us()),
        ))
    }

    /// Run immediates and ready tasks until neither produces more work.
    ///
    /// Timers are not fired.
    pub fn run_until_idle(&self) {
        loop {
            loop {
                let next = self.immediates.borrow_mut().pop_front();
                let Some(callback) = next else { break };
                callback();
            }
            self.pool.borrow_mut().run_until_stalled();
            if self.immediates.borrow().is_empty() {
                break;
            }
        }
    }

    /// Fire every timer that is due now, then settle.
    ///
    /// Returns the number of timer callbacks invoked.
    pub fn run_due(&self) -> usize {
        let now = self.source.elapsed_us();
        let mut fired = 0;
        self.run_until_idle();
        while self.fire_next_due(now) {
            fired += 1;
            self.run_until_idle();
        }
        fired
    }

    /// Move a lab clock forward by `delta`, firing timers as their due time
    /// is reached.
    ///
    /// On a wall-clock loop this blocks for `delta` instead.
    pub fn advance(&self, delta: Duration) {
        let TimeSource::Lab(clock) = &self.source else {
            self.run_for(delta);
            return;
        };
        let target = clock.elapsed_us().saturating_add(duration_to_us(delta));
        self.run_until_idle();
        while let Some(due) = self.earliest_due().filter(|due| *due <= target) {
            clock.advance_to_us(due);
            self.fire_next_due(due);
            self.run_until_idle();
        }
        clock.advance_to_us(target);
        self.run_until_idle();
    }

    /// Run the loop on the wall clock for `duration`.
    pub fn run_for(&self, duration: Duration) {
        if let TimeSource::Lab(_) = self.source {
            self.advance(duration);
            return;
        }
        let deadline = self.source.elapsed_us().saturating_add(duration_to_us(duration));
        loop {
            self.run_due();
            let now = self.source.elapsed_us();
            if now >= deadline {
                break;
            }
            let wake = self.earliest_due().map_or(deadline, |due| due.min(deadline));
            if wake > now {
                std::thread::sleep(Duration::from_micros(wake - now));
            }
        }
    }

    fn allocate_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    fn earliest_due(&self) -> Option<u64> {
        self.timers.borrow().keys().next().map(|(due, _)| *due)
    }

    fn arm(&self, id: u64, due: u64, task: TimerTask) {
        self.timers.borrow_mut().insert((due, id), task);
        self.due_by_id.borrow_mut().insert(id, due);
    }

    fn disarm(&self, id: u64) {
        let due = self.due_by_id.borrow_mut().remove(&id);
        match due {
            Some(due) => {
                self.timers.borrow_mut().remove(&(due, id));
            }
            None if self.firing.get() == Some(id) => self.firing_cleared.set(true),
            None => {}
        }
    }

    fn fire_next_due(&self, now: u64) -> bool {
        let key = self.timers.borrow().keys().next().copied();
        let Some((due, id)) = key.filter(|(due, _)| *due <= now) else {
            return false;
        };
        let task = self.timers.borrow_mut().remove(&(due, id));
        let Some(task) = task else {
            return false;
        };
        self.due_by_id.borrow_mut().remove(&id);
        match task {
            TimerTask::Once(callback) => callback(),
            TimerTask::Every {
                period_us,
                mut callback,
            } => {
                self.firing.set(Some(id));
                self.firing_cleared.set(false);
                callback();
                self.firing.set(None);
                if !self.firing_cleared.get() {
                    let next = due.saturating_add(period_us.max(1));
                    self.arm(id, next, TimerTask::Every { period_us, callback });
                }
            }
        }
        true
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Timers for EventLoop {
    fn set_timeout(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimerId {
        let id = self.allocate_id();
        let due = self.source.elapsed_us().saturating_add(duration_to_us(delay));
        self.arm(id, due, TimerTask::Once(callback));
        TimerId(id)
    }

    fn clear_timeout(&self, id: TimerId) {
        self.disarm(id.0);
    }

    fn set_interval(&self, period: Duration, callback: Box<dyn FnMut()>) -> TimerId {
        let id = self.allocate_id();
        let period_us = duration_to_us(period).max(1);
        let due = self.source.elapsed_us().saturating_add(period_us);
        self.arm(id, due, TimerTask::Every { period_us, callback });
        TimerId(id)
    }

    fn clear_interval(&self, id: TimerId) {
        self.disarm(id.0);
    }

    fn set_immediate(&self, callback: Box<dyn FnOnce()>) {
        self.immediates.borrow_mut().push_back(callback);
    }
}

impl Executor for EventLoop {
    fn spawn_local(&self, future: LocalBoxFuture<'static, ()>) {
        if let Err(err) = self.spawner.spawn_local(future) {
            tracing::error!(error = %err, "event loop refused a local task");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Rc<RefCell<Vec<&'static str>>>, impl Fn(&'static str) -> Box<dyn FnOnce()>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        let push = move |label: &'static str| -> Box<dyn FnOnce()> {
            let sink = Rc::clone(&sink);
            Box::new(move || sink.borrow_mut().push(label))
        };
        (log, push)
    }

    #[test]
    fn timers_fire_in_due_order() {
        let clock = LabClock::new();
        let event_loop = EventLoop::lab(&clock);
        let (log, push) = recorder();

        event_loop.set_timeout(Duration::from_millis(30), push("late"));
        event_loop.set_timeout(Duration::from_millis(10), push("early"));
        event_loop.set_timeout(Duration::from_millis(10), push("early-second"));

        event_loop.advance(Duration::from_millis(5));
        assert!(log.borrow().is_empty());

        event_loop.advance(Duration::from_millis(25));
        assert_eq!(*log.borrow(), vec!["early", "early-second", "late"]);
        assert_eq!(event_loop.pending_timers(), 0);
    }

    #[test]
    fn cleared_timeout_never_fires() {
        let clock = LabClock::new();
        let event_loop = EventLoop::lab(&clock);
        let (log, push) = recorder();

        let id = event_loop.set_timeout(Duration::from_millis(1), push("fired"));
        event_loop.clear_timeout(id);
        event_loop.advance(Duration::from_millis(10));
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn immediates_run_before_timers() {
        let clock = LabClock::new();
        let event_loop = EventLoop::lab(&clock);
        let (log, push) = recorder();

        event_loop.set_timeout(Duration::ZERO, push("timer"));
        event_loop.set_immediate(push("immediate"));
        event_loop.advance(Duration::ZERO);
        assert_eq!(*log.borrow(), vec!["immediate", "timer"]);
    }

    #[test]
    fn interval_repeats_until_cleared_from_inside() {
        let clock = LabClock::new();
        let event_loop = Rc::new(EventLoop::lab(&clock));
        let ticks = Rc::new(Cell::new(0u32));
        let slot: Rc<Cell<Option<TimerId>>> = Rc::new(Cell::new(None));

        let id = {
            let ticks = Rc::clone(&ticks);
            let slot = Rc::clone(&slot);
            let host = Rc::downgrade(&event_loop);
            event_loop.set_interval(
                Duration::from_millis(10),
                Box::new(move || {
                    ticks.set(ticks.get() + 1);
                    if ticks.get() == 3 {
                        if let (Some(host), Some(id)) = (host.upgrade(), slot.get()) {
                            host.clear_interval(id);
                        }
                    }
                }),
            )
        };
        slot.set(Some(id));

        event_loop.advance(Duration::from_millis(100));
        assert_eq!(ticks.get(), 3);
        assert_eq!(event_loop.pending_timers(), 0);
    }

    #[test]
    fn spawned_tasks_complete_when_idle() {
        let event_loop = EventLoop::lab(&LabClock::new());
        let done = Rc::new(Cell::new(false));
        let flag = Rc::clone(&done);
        event_loop.spawn_local(Box::pin(async move { flag.set(true) }));
        assert!(!done.get());
        event_loop.run_until_idle();
        assert!(done.get());
    }

    #[test]
    fn next_deadline_tracks_earliest_timer() {
        let clock = LabClock::new();
        let event_loop = EventLoop::lab(&clock);
        assert_eq!(event_loop.next_deadline(), None);
        event_loop.set_timeout(Duration::from_millis(40), Box::new(|| {}));
        event_loop.set_timeout(Duration::from_millis(15), Box::new(|| {}));
        assert_eq!(event_loop.next_deadline(), Some(Duration::from_millis(15)));
        clock.advance(Duration::from_millis(20));
        assert_eq!(event_loop.next_deadline(), Some(Duration::ZERO));
        assert_eq!(event_loop.run_due(), 1);
    }
}
