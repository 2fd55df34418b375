#![forbid(unsafe_code)]

//! Time-based interpolation between two observables.
//!
//! An [`ObservableAnimation`] owns a `target` and a `current` observable.
//! Whenever the two differ and no animation is running, frames start on the
//! runtime's interval timer and move `current` toward `target` until the
//! interpolation parameter reaches 1.
//!
//! # Invariants
//!
//! 1. At most one interval is armed per animation.
//! 2. Every setter cancels the running animation before writing.
//! 3. The last frame writes the interpolation at exactly `t = 1`.
//! 4. The start and end values are captured when the animation begins;
//!    later writes to `target` restart it from the current position.
//!
//! # Failure Modes
//!
//! - Either side without a value: no animation starts.
//! - `transition_duration` of zero: the first frame lands on the target.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::equality::{ComparisonMethod, Equivalent, are_equal};
use crate::error::Result;
use crate::event_loop::TimerId;
use crate::observable::{Observable, ObservableOptions, Source};
use crate::observer::ObserverRef;
use crate::runtime::Runtime;
use crate::state_ref::StateRef;
use crate::store::DebugPrefix;

/// Linear interpolation between two values.
pub trait Interpolate: Sized {
    fn interpolate(start: &Self, end: &Self, t: f64) -> Self;
}

impl Interpolate for f64 {
    fn interpolate(start: &Self, end: &Self, t: f64) -> Self {
        start + (end - start) * t
    }
}

impl Interpolate for f32 {
    #[allow(clippy::cast_possible_truncation)]
    fn interpolate(start: &Self, end: &Self, t: f64) -> Self {
        start + (end - start) * t as f32
    }
}

type Interpolator<T> = Rc<dyn Fn(&T, &T, f64) -> T>;

// ─── Options ─────────────────────────────────────────────────────────────────

/// Timing and interpolation for an [`ObservableAnimation`].
pub struct AnimationOptions<T> {
    pub transition_duration: Duration,
    pub frames_per_second: u32,
    /// Delay before the first frame.
    pub wait: Duration,
    interpolator: Interpolator<T>,
}

impl<T> Clone for AnimationOptions<T> {
    fn clone(&self) -> Self {
        Self {
            transition_duration: self.transition_duration,
            frames_per_second: self.frames_per_second,
            wait: self.wait,
            interpolator: Rc::clone(&self.interpolator),
        }
    }
}

impl<T> fmt::Debug for AnimationOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnimationOptions")
            .field("transition_duration", &self.transition_duration)
            .field("frames_per_second", &self.frames_per_second)
            .field("wait", &self.wait)
            .finish_non_exhaustive()
    }
}

impl<T: Interpolate + 'static> Default for AnimationOptions<T> {
    fn default() -> Self {
        Self::with_interpolator(T::interpolate)
    }
}

impl<T: 'static> AnimationOptions<T> {
    /// 150 ms transitions at 30 frames per second, no wait.
    #[must_use]
    pub fn new() -> Self
    where
        T: Interpolate,
    {
        Self::default()
    }

    /// Default timing with a custom interpolator for types without
    /// [`Interpolate`].
    #[must_use]
    pub fn with_interpolator(interpolator: impl Fn(&T, &T, f64) -> T + 'static) -> Self {
        Self {
            transition_duration: Duration::from_millis(150),
            frames_per_second: 30,
            wait: Duration::ZERO,
            interpolator: Rc::new(interpolator),
        }
    }

    #[must_use]
    pub fn transition_duration(mut self, duration: Duration) -> Self {
        self.transition_duration = duration;
        self
    }

    #[must_use]
    pub fn frames_per_second(mut self, fps: u32) -> Self {
        self.frames_per_second = fps.max(1);
        self
    }

    #[must_use]
    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    fn frame_delay(&self) -> Duration {
        Duration::from_millis(1000_u64.div_ceil(u64::from(self.frames_per_second.max(1))))
    }

    fn step(&self) -> f64 {
        if self.transition_duration.is_zero() {
            return 1.0;
        }
        self.frame_delay().as_secs_f64() / self.transition_duration.as_secs_f64()
    }
}

// ─── Animation ───────────────────────────────────────────────────────────────

struct Running<T> {
    start: T,
    end: T,
    t: f64,
    timer: TimerId,
}

struct AnimationInner<T> {
    weak_self: Weak<AnimationInner<T>>,
    runtime: Runtime,
    target: Observable<T>,
    current: Observable<T>,
    options: AnimationOptions<T>,
    running: RefCell<Option<Running<T>>>,
}

impl<T: Equivalent + Clone + 'static> AnimationInner<T> {
    fn on_changed(&self) {
        if self.running.borrow().is_some() {
            return;
        }
        let (Some(start), Some(end)) = (
            self.current.peek().ok().flatten(),
            self.target.peek().ok().flatten(),
        ) else {
            return;
        };
        if are_equal(&start, &end, ComparisonMethod::ShallowEqual) {
            return;
        }
        let weak = self.weak_self.clone();
        let timer = if self.options.wait.is_zero() {
            self.runtime.timers().set_interval(
                self.options.frame_delay(),
                Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_frame();
                    }
                }),
            )
        } else {
            self.runtime.timers().set_interval(
                self.options.wait,
                Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.begin_frames();
                    }
                }),
            )
        };
        tracing::trace!(debug_id = %self.current.debug_id(), "animation started");
        *self.running.borrow_mut() = Some(Running {
            start,
            end,
            t: 0.0,
            timer,
        });
    }

    fn begin_frames(&self) {
        let timers = self.runtime.timers();
        let mut running = self.running.borrow_mut();
        let Some(running) = running.as_mut() else {
            return;
        };
        timers.clear_interval(running.timer);
        let weak = self.weak_self.clone();
        running.timer = timers.set_interval(
            self.options.frame_delay(),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_frame();
                }
            }),
        );
    }

    fn on_frame(&self) {
        let frame = {
            let mut running = self.running.borrow_mut();
            let Some(running) = running.as_mut() else {
                return;
            };
            running.t += self.options.step();
            let t = running.t.min(1.0);
            ((self.options.interpolator)(&running.start, &running.end, t), t)
        };
        let (value, t) = frame;
        self.current.set(value);
        if t >= 1.0 {
            self.clear_animation();
        }
    }

    fn clear_animation(&self) {
        let running = self.running.borrow_mut().take();
        if let Some(running) = running {
            self.runtime.timers().clear_interval(running.timer);
        }
    }
}

/// A `current` value that animates toward a `target`.
///
/// Cloning an `ObservableAnimation` creates a new handle to the **same**
/// animation.
pub struct ObservableAnimation<T> {
    inner: Rc<AnimationInner<T>>,
}

impl<T> Clone for ObservableAnimation<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone + fmt::Debug + 'static> fmt::Debug for ObservableAnimation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableAnimation")
            .field("target", &self.inner.target)
            .field("current", &self.inner.current)
            .field("running", &self.inner.running.borrow().is_some())
            .finish()
    }
}

impl<T: Equivalent + Clone + 'static> ObservableAnimation<T> {
    /// Animation on the default runtime; `current` shares `target`'s options.
    pub fn new(target_options: ObservableOptions<T>, options: AnimationOptions<T>) -> Self {
        Self::new_in(&Runtime::current(), target_options, None, options)
    }

    pub fn new_in(
        runtime: &Runtime,
        target_options: ObservableOptions<T>,
        current_options: Option<ObservableOptions<T>>,
        options: AnimationOptions<T>,
    ) -> Self {
        let current_options = current_options.unwrap_or_else(|| target_options.clone());
        let target = Observable::new_in(runtime, target_options);
        let current = Observable::new_in(runtime, current_options);
        let inner = Rc::new_cyclic(|weak_self| AnimationInner {
            weak_self: weak_self.clone(),
            runtime: runtime.clone(),
            target,
            current,
            options,
            running: RefCell::new(None),
        });
        Self { inner }
    }

    #[must_use]
    pub fn target(&self) -> &Observable<T> {
        &self.inner.target
    }

    #[must_use]
    pub fn current(&self) -> &Observable<T> {
        &self.inner.current
    }

    /// Move the target; `current` follows over the transition.
    pub fn set_target(&self, value: T) {
        self.inner.clear_animation();
        self.inner.target.set(value);
        self.inner.on_changed();
    }

    /// Jump the current value; it then animates back toward the target.
    pub fn set_current(&self, value: T) {
        self.inner.clear_animation();
        self.inner.current.set(value);
        self.inner.on_changed();
    }

    /// Set both sides at once, without animating.
    pub fn set_both(&self, value: T) {
        self.inner.clear_animation();
        self.inner.target.set(value.clone());
        self.inner.current.set(value);
        self.inner.on_changed();
    }

    /// Stop animating where `current` is now.
    pub fn clear_animation(&self) {
        self.inner.clear_animation();
    }

    #[must_use]
    pub fn is_animating(&self) -> bool {
        self.inner.running.borrow().is_some()
    }

    pub fn destroy(&self) {
        self.inner.clear_animation();
        self.inner.target.destroy();
        self.inner.current.destroy();
    }
}

/// Observing an animation observes its current value.
impl<T: Equivalent + Clone + 'static> Source<T> for ObservableAnimation<T> {
    fn observe_ref(&self, observer: &ObserverRef) -> Result<StateRef<T>> {
        self.inner.current.observe_ref(observer)
    }
}

impl<T: Equivalent + Clone + 'static> DebugPrefix for ObservableAnimation<T> {
    fn set_debug_prefix(&self, prefix: &str) {
        self.inner.target.set_debug_prefix(&format!("{prefix}::target"));
        self.inner.current.set_debug_prefix(&format!("{prefix}::current"));
    }
}
