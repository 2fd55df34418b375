#![forbid(unsafe_code)]

//! Keyed families of selectors.
//!
//! One selector per key, created on first observation from a shared
//! `get_state(observer, key)` derivation. Entries release after the default
//! delay unless the options say otherwise; on release the selector is
//! destroyed and forgotten, and the per-key release callback runs.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::rc::{Rc, Weak};

use futures::FutureExt;
use futures::future::LocalBoxFuture;
use indexmap::IndexMap;

use crate::config::ReleaseDelay;
use crate::equality::Equivalent;
use crate::error::Result;
use crate::keyed::KeyedOptions;
use crate::observable::{CoreOptions, KeyedSource, Source};
use crate::observer::{AsyncObserver, ObserverRef, SyncObserver};
use crate::runtime::Runtime;
use crate::selector::{AsyncSelector, Selector};
use crate::state_ref::{Provided, StateRef};
use crate::store::DebugPrefix;

fn entry_options<K: Clone + 'static, P: Clone + 'static>(
    options: &KeyedOptions<K, P>,
    key: &K,
) -> crate::observable::ObservableOptions<P> {
    let mut entry = options.entry_options(key, None);
    entry.release_delay = Some(entry.release_delay.unwrap_or(ReleaseDelay::Default));
    entry
}

// ─── SelectorMap ─────────────────────────────────────────────────────────────

type KeyedGetState<K, T> = Rc<dyn Fn(&SyncObserver, &K) -> Result<T>>;

struct SelectorMapInner<K, T> {
    weak_self: Weak<SelectorMapInner<K, T>>,
    runtime: Runtime,
    get_state: KeyedGetState<K, T>,
    options: KeyedOptions<K, T>,
    selectors: RefCell<IndexMap<K, Selector<T>>>,
    debug_prefix: RefCell<Option<String>>,
}

impl<K, T> SelectorMapInner<K, T>
where
    K: Hash + Eq + Clone + 'static,
    T: Equivalent + Clone + 'static,
{
    fn selector(&self, key: &K) -> Selector<T> {
        let existing = self.selectors.borrow().get(key).cloned();
        if let Some(selector) = existing {
            return selector;
        }
        let get_state = Rc::clone(&self.get_state);
        let bound = key.clone();
        let weak = self.weak_self.clone();
        let evicted = key.clone();
        let options = CoreOptions::from_values(entry_options(&self.options, key)).with_on_evict(
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.evict(&evicted);
                }
            },
        );
        let selector = Selector::from_core_options(
            &self.runtime,
            Rc::new(move |observer: &SyncObserver, _previous: Option<T>| {
                get_state(observer, &bound)
            }),
            options,
        );
        let prefix = self.debug_prefix.borrow().clone();
        if let Some(prefix) = prefix {
            selector.set_debug_prefix(&prefix);
        }
        self.selectors
            .borrow_mut()
            .insert(key.clone(), selector.clone());
        selector
    }

    fn evict(&self, key: &K) {
        let removed = self.selectors.borrow_mut().shift_remove(key);
        if let Some(selector) = removed {
            selector.destroy();
        }
    }
}

/// Family of selectors indexed by key.
///
/// Cloning a `SelectorMap` creates a new handle to the **same** family.
pub struct SelectorMap<K, T> {
    inner: Rc<SelectorMapInner<K, T>>,
}

impl<K, T> Clone for SelectorMap<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<K: fmt::Debug, T> fmt::Debug for SelectorMap<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectorMap")
            .field("keys", &self.inner.selectors.borrow().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<K, T> SelectorMap<K, T>
where
    K: Hash + Eq + Clone + 'static,
    T: Equivalent + Clone + 'static,
{
    pub fn new(
        get_state: impl Fn(&SyncObserver, &K) -> Result<T> + 'static,
        options: KeyedOptions<K, T>,
    ) -> Self {
        Self::new_in(&Runtime::current(), get_state, options)
    }

    pub fn new_in(
        runtime: &Runtime,
        get_state: impl Fn(&SyncObserver, &K) -> Result<T> + 'static,
        options: KeyedOptions<K, T>,
    ) -> Self {
        let inner = Rc::new_cyclic(|weak_self| SelectorMapInner {
            weak_self: weak_self.clone(),
            runtime: runtime.clone(),
            get_state: Rc::new(get_state),
            options,
            selectors: RefCell::new(IndexMap::new()),
            debug_prefix: RefCell::new(None),
        });
        Self { inner }
    }

    /// Cached result for `key`; never creates the selector.
    #[must_use]
    pub fn peek(&self, key: &K) -> Option<T> {
        let selector = self.inner.selectors.borrow().get(key).cloned();
        selector.and_then(|selector| selector.peek_safe())
    }

    #[must_use]
    pub fn has(&self, key: &K) -> bool {
        self.inner.selectors.borrow().contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.selectors.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Selector for `key`, creating it if needed.
    #[must_use]
    pub fn get(&self, key: &K) -> Selector<T> {
        self.inner.selector(key)
    }
}

impl<K, T> KeyedSource<K, T> for SelectorMap<K, T>
where
    K: Hash + Eq + Clone + 'static,
    T: Equivalent + Clone + 'static,
{
    fn observe_key_ref(&self, observer: &ObserverRef, key: &K) -> Result<Option<StateRef<T>>> {
        self.inner.selector(key).observe_ref(observer).map(Some)
    }
}

impl<K, T> DebugPrefix for SelectorMap<K, T>
where
    K: Hash + Eq + Clone + 'static,
    T: Equivalent + Clone + 'static,
{
    fn set_debug_prefix(&self, prefix: &str) {
        *self.inner.debug_prefix.borrow_mut() = Some(prefix.to_owned());
        let selectors: Vec<Selector<T>> = self.inner.selectors.borrow().values().cloned().collect();
        for selector in selectors {
            selector.set_debug_prefix(prefix);
        }
    }
}

// ─── AsyncSelectorMap ────────────────────────────────────────────────────────

type KeyedGetStateAsync<K, T> =
    Rc<dyn Fn(AsyncObserver, &K) -> LocalBoxFuture<'static, Result<T>>>;

struct AsyncSelectorMapInner<K, T> {
    weak_self: Weak<AsyncSelectorMapInner<K, T>>,
    runtime: Runtime,
    get_state: KeyedGetStateAsync<K, T>,
    options: KeyedOptions<K, Provided<T>>,
    selectors: RefCell<IndexMap<K, AsyncSelector<T>>>,
    debug_prefix: RefCell<Option<String>>,
}

impl<K, T> AsyncSelectorMapInner<K, T>
where
    K: Hash + Eq + Clone + 'static,
    T: Clone + 'static,
{
    fn selector(&self, key: &K) -> AsyncSelector<T> {
        let existing = self.selectors.borrow().get(key).cloned();
        if let Some(selector) = existing {
            return selector;
        }
        let get_state = Rc::clone(&self.get_state);
        let bound = key.clone();
        let weak = self.weak_self.clone();
        let evicted = key.clone();
        let options = CoreOptions::from_provided(entry_options(&self.options, key)).with_on_evict(
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.evict(&evicted);
                }
            },
        );
        let selector = AsyncSelector::from_core_options(
            &self.runtime,
            Rc::new(move |observer: AsyncObserver, _previous: Option<T>| {
                get_state(observer, &bound)
            }),
            options,
        );
        let prefix = self.debug_prefix.borrow().clone();
        if let Some(prefix) = prefix {
            selector.set_debug_prefix(&prefix);
        }
        self.selectors
            .borrow_mut()
            .insert(key.clone(), selector.clone());
        selector
    }

    fn evict(&self, key: &K) {
        let removed = self.selectors.borrow_mut().shift_remove(key);
        if let Some(selector) = removed {
            selector.destroy();
        }
    }
}

/// Family of async selectors indexed by key.
pub struct AsyncSelectorMap<K, T> {
    inner: Rc<AsyncSelectorMapInner<K, T>>,
}

impl<K, T> Clone for AsyncSelectorMap<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<K: fmt::Debug, T> fmt::Debug for AsyncSelectorMap<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncSelectorMap")
            .field("keys", &self.inner.selectors.borrow().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<K, T> AsyncSelectorMap<K, T>
where
    K: Hash + Eq + Clone + 'static,
    T: Clone + 'static,
{
    pub fn new<F, Fut>(get_state: F, options: KeyedOptions<K, Provided<T>>) -> Self
    where
        F: Fn(AsyncObserver, &K) -> Fut + 'static,
        Fut: Future<Output = Result<T>> + 'static,
    {
        Self::new_in(&Runtime::current(), get_state, options)
    }

    pub fn new_in<F, Fut>(
        runtime: &Runtime,
        get_state: F,
        options: KeyedOptions<K, Provided<T>>,
    ) -> Self
    where
        F: Fn(AsyncObserver, &K) -> Fut + 'static,
        Fut: Future<Output = Result<T>> + 'static,
    {
        let get_state: KeyedGetStateAsync<K, T> =
            Rc::new(move |observer, key| get_state(observer, key).boxed_local());
        let inner = Rc::new_cyclic(|weak_self| AsyncSelectorMapInner {
            weak_self: weak_self.clone(),
            runtime: runtime.clone(),
            get_state,
            options,
            selectors: RefCell::new(IndexMap::new()),
            debug_prefix: RefCell::new(None),
        });
        Self { inner }
    }

    /// Resolved result for `key`; never creates the selector.
    #[must_use]
    pub fn peek(&self, key: &K) -> Option<T> {
        let selector = self.inner.selectors.borrow().get(key).cloned();
        selector.and_then(|selector| selector.peek_safe())
    }

    #[must_use]
    pub fn has(&self, key: &K) -> bool {
        self.inner.selectors.borrow().contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.selectors.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn get(&self, key: &K) -> AsyncSelector<T> {
        self.inner.selector(key)
    }
}

impl<K, T> KeyedSource<K, T> for AsyncSelectorMap<K, T>
where
    K: Hash + Eq + Clone + 'static,
    T: Clone + 'static,
{
    fn observe_key_ref(&self, observer: &ObserverRef, key: &K) -> Result<Option<StateRef<T>>> {
        self.inner.selector(key).observe_ref(observer).map(Some)
    }
}

impl<K, T> DebugPrefix for AsyncSelectorMap<K, T>
where
    K: Hash + Eq + Clone + 'static,
    T: Clone + 'static,
{
    fn set_debug_prefix(&self, prefix: &str) {
        *self.inner.debug_prefix.borrow_mut() = Some(prefix.to_owned());
        let selectors: Vec<AsyncSelector<T>> =
            self.inner.selectors.borrow().values().cloned().collect();
        for selector in selectors {
            selector.set_debug_prefix(prefix);
        }
    }
}
