#![forbid(unsafe_code)]

//! Core: observables, observers, selectors, keyed collections, and the
//! batched update scheduler.
//!
//! State lives in observables. Observers read it and are told, once per
//! batch, when something they read has changed. Selectors are derived
//! state: an observer plus an observable, recomputed on change. Idle state
//! is released on a timer once nothing observes it.
//!
//! Everything runs on one thread against an explicit [`Runtime`], which owns
//! the configuration, the timers, the executor for futures and the
//! scheduler.

pub mod animation;
pub mod component;
pub mod config;
pub mod equality;
pub mod error;
pub mod event_loop;
pub mod keyed;
pub mod observable;
pub mod observer;
pub mod runtime;
pub mod selector;
pub mod selector_map;
pub mod state_ref;
pub mod store;
pub mod value;

pub use animation::{AnimationOptions, Interpolate, ObservableAnimation};
pub use component::{ComponentSlot, RenderGuard};
pub use config::{Config, ReleaseDelay};
pub use equality::{ComparisonMethod, Equivalent, are_equal};
pub use error::{ReactiveError, Result, Suspension};
pub use event_loop::{EventLoop, Executor, LabClock, TimerId, Timers};
pub use keyed::{AsyncObservableMap, KeyedOptions, ObservableMap};
pub use observable::{AsyncObservable, KeyedSource, Observable, ObservableOptions, Source};
pub use observer::{AsyncObserver, ComponentObserver, ObserverRef, Subscriber, SyncObserver};
pub use runtime::{Runtime, RuntimeBuilder, Scheduler};
pub use selector::{AsyncSelector, Selector};
pub use selector_map::{AsyncSelectorMap, SelectorMap};
pub use state_ref::{AsyncState, Provided, StateRef, Status, ThrowMode, ValueFuture, value_future};
pub use store::{DebugPrefix, ObservableStore};
pub use value::Value;
