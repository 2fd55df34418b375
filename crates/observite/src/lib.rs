#![forbid(unsafe_code)]

//! observite public facade crate.
//!
//! Re-exports the engine and a prelude with the types most applications
//! touch.

pub use observite_core::*;

pub mod prelude {
    pub use observite_core as core;
    pub use observite_core::{
        AsyncObservable, AsyncObservableMap, AsyncObserver, AsyncSelector, AsyncSelectorMap,
        ComparisonMethod, ComponentObserver, ComponentSlot, Config, DebugPrefix, Equivalent,
        KeyedOptions, KeyedSource, Observable, ObservableAnimation, ObservableMap,
        ObservableOptions, ObservableStore, Provided, ReactiveError, ReleaseDelay, Runtime,
        Selector, SelectorMap, Source, Status, Subscriber, SyncObserver,
    };
}
