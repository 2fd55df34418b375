#![forbid(unsafe_code)]

//! Keyed collections of observables.
//!
//! # Design
//!
//! An [`ObservableMap`] is a table of per-key containers held inside one
//! backing [`Observable`]. Observing a key subscribes the reader to the
//! backing container, so whole-table replacements reach it, and to the
//! entry for the key.
//!
//! Writes come in two modes:
//!
//! - **Normal** (`set`): fork the table, write into the fork, and set the
//!   fork on the backing container. The backing comparison is `Exact`, so
//!   every normal write notifies whole-table readers such as
//!   [`ObservableMap::entries`].
//! - **Silent** (materializing a default on first read): write into the
//!   current table in place. Reading a key never notifies anyone.
//!
//! Each entry is released on its own schedule. Release removes the key from
//! the current table, in place, and then calls the per-key release callback.
//!
//! # Invariants
//!
//! 1. `peek` never materializes an entry.
//! 2. A normal write always installs a new table instance.
//! 3. The backing container is never released.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use crate::config::ReleaseDelay;
use crate::equality::{ComparisonMethod, Equivalent};
use crate::error::{ReactiveError, Result};
use crate::observable::{
    AsyncObservable, CoreOptions, KeyedSource, Observable, ObservableOptions, Source,
};
use crate::observer::{AsyncObserver, ObserverRef, SyncObserver};
use crate::runtime::Runtime;
use crate::selector::{AsyncSelector, Selector};
use crate::state_ref::{Provided, StateRef};
use crate::store::DebugPrefix;

// ─── Options ─────────────────────────────────────────────────────────────────

/// Options shared by every entry of a keyed collection.
pub struct KeyedOptions<K, P> {
    pub(crate) comparison: Option<ComparisonMethod>,
    pub(crate) release_delay: Option<ReleaseDelay>,
    pub(crate) on_changed: Option<Rc<dyn Fn(&P)>>,
    pub(crate) on_release: Option<Rc<dyn Fn(&K, P)>>,
}

impl<K, P> Default for KeyedOptions<K, P> {
    fn default() -> Self {
        Self {
            comparison: None,
            release_delay: None,
            on_changed: None,
            on_release: None,
        }
    }
}

impl<K, P> Clone for KeyedOptions<K, P> {
    fn clone(&self) -> Self {
        Self {
            comparison: self.comparison,
            release_delay: self.release_delay,
            on_changed: self.on_changed.clone(),
            on_release: self.on_release.clone(),
        }
    }
}

impl<K, P> fmt::Debug for KeyedOptions<K, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedOptions")
            .field("comparison", &self.comparison)
            .field("release_delay", &self.release_delay)
            .field("on_changed", &self.on_changed.is_some())
            .field("on_release", &self.on_release.is_some())
            .finish()
    }
}

impl<K: 'static, P: 'static> KeyedOptions<K, P> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
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

    #[must_use]
    pub fn on_changed(mut self, callback: impl Fn(&P) + 'static) -> Self {
        self.on_changed = Some(Rc::new(callback));
        self
    }

    /// Cleanup run with the key and provided value when an entry is
    /// released.
    #[must_use]
    pub fn on_release(mut self, callback: impl Fn(&K, P) + 'static) -> Self {
        self.on_release = Some(Rc::new(callback));
        self
    }

    /// Entry options for `key`, seeded with `value`.
    pub(crate) fn entry_options(&self, key: &K, value: Option<P>) -> ObservableOptions<P>
    where
        K: Clone,
    {
        let mut options = ObservableOptions::new();
        options.default = value;
        options.comparison = self.comparison;
        options.release_delay = self.release_delay;
        options.on_changed = self.on_changed.clone();
        options.on_release = self.on_release.clone().map(|callback| {
            let key = key.clone();
            Rc::new(move |provided: P| callback(&key, provided)) as Rc<dyn Fn(P)>
        });
        options
    }
}

// ─── Entry table ─────────────────────────────────────────────────────────────

/// Table of per-key entries; identity is the table instance.
pub(crate) struct EntryTable<K, E> {
    entries: Rc<RefCell<IndexMap<K, E>>>,
}

impl<K, E> Default for EntryTable<K, E> {
    fn default() -> Self {
        Self {
            entries: Rc::new(RefCell::new(IndexMap::new())),
        }
    }
}

impl<K, E> Clone for EntryTable<K, E> {
    fn clone(&self) -> Self {
        Self {
            entries: Rc::clone(&self.entries),
        }
    }
}

impl<K, E> Equivalent for EntryTable<K, E> {
    fn identical(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.entries, &other.entries)
    }
}

impl<K: Hash + Eq + Clone, E: Clone> EntryTable<K, E> {
    /// New table instance with the same entries.
    fn fork(&self) -> Self {
        Self {
            entries: Rc::new(RefCell::new(self.entries.borrow().clone())),
        }
    }

    fn get(&self, key: &K) -> Option<E> {
        self.entries.borrow().get(key).cloned()
    }

    fn insert(&self, key: K, entry: E) {
        self.entries.borrow_mut().insert(key, entry);
    }

    fn remove(&self, key: &K) -> Option<E> {
        self.entries.borrow_mut().shift_remove(key)
    }

    fn contains(&self, key: &K) -> bool {
        self.entries.borrow().contains_key(key)
    }

    fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    fn snapshot(&self) -> Vec<(K, E)> {
        self.entries
            .borrow()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }
}

// ─── Entry capability ────────────────────────────────────────────────────────

/// Container kind stored per key.
pub(crate) trait KeyedEntry: Clone + 'static {
    type Value: Clone + 'static;
    type Provide: Clone + 'static;

    fn create(
        runtime: &Runtime,
        options: ObservableOptions<Self::Provide>,
        on_evict: impl Fn() + 'static,
    ) -> Self;
    fn update(&self, value: Self::Provide);
    fn peek_value(&self) -> Option<Self::Value>;
    fn destroy_entry(&self);
    fn observe_entry(&self, observer: &ObserverRef) -> Result<StateRef<Self::Value>>;
    fn prefix(&self, prefix: &str);
}

impl<T: Equivalent + Clone + 'static> KeyedEntry for Observable<T> {
    type Value = T;
    type Provide = T;

    fn create(
        runtime: &Runtime,
        options: ObservableOptions<T>,
        on_evict: impl Fn() + 'static,
    ) -> Self {
        Observable::from_core_options(
            runtime,
            CoreOptions::from_values(options).with_on_evict(on_evict),
        )
    }

    fn update(&self, value: T) {
        self.set(value);
    }

    fn peek_value(&self) -> Option<T> {
        self.peek().ok().flatten()
    }

    fn destroy_entry(&self) {
        self.destroy();
    }

    fn observe_entry(&self, observer: &ObserverRef) -> Result<StateRef<T>> {
        self.observe_ref(observer)
    }

    fn prefix(&self, prefix: &str) {
        self.set_debug_prefix(prefix);
    }
}

impl<T: Clone + 'static> KeyedEntry for AsyncObservable<T> {
    type Value = T;
    type Provide = Provided<T>;

    fn create(
        runtime: &Runtime,
        options: ObservableOptions<Provided<T>>,
        on_evict: impl Fn() + 'static,
    ) -> Self {
        AsyncObservable::with_release_fallback(
            runtime,
            CoreOptions::from_provided(options).with_on_evict(on_evict),
            runtime.config().observable_release_delay,
        )
    }

    fn update(&self, value: Provided<T>) {
        self.set_provided(value);
    }

    fn peek_value(&self) -> Option<T> {
        self.peek().ok().flatten()
    }

    fn destroy_entry(&self) {
        self.destroy();
    }

    fn observe_entry(&self, observer: &ObserverRef) -> Result<StateRef<T>> {
        self.observe_ref(observer)
    }

    fn prefix(&self, prefix: &str) {
        self.set_debug_prefix(prefix);
    }
}

// ─── Shared map core ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetMode {
    Normal,
    Silent,
}

type GetDefault<K, P> = Rc<dyn Fn(&K) -> P>;

/// `P` is always `E::Provide`; spelled out so handles need no bounds.
struct MapInner<K, P, E> {
    weak_self: Weak<MapInner<K, P, E>>,
    runtime: Runtime,
    table: Observable<EntryTable<K, E>>,
    get_default: Option<GetDefault<K, P>>,
    options: KeyedOptions<K, P>,
    debug_prefix: RefCell<Option<String>>,
}

impl<K, E> MapInner<K, E::Provide, E>
where
    K: Hash + Eq + Clone + 'static,
    E: KeyedEntry,
{
    fn new(
        runtime: &Runtime,
        get_default: Option<GetDefault<K, E::Provide>>,
        options: KeyedOptions<K, E::Provide>,
    ) -> Rc<Self> {
        let table = Observable::new_in(
            runtime,
            ObservableOptions::new()
                .with_default(EntryTable::default())
                .with_comparison(ComparisonMethod::Exact)
                .with_release_delay(ReleaseDelay::Never),
        );
        Rc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            runtime: runtime.clone(),
            table,
            get_default,
            options,
            debug_prefix: RefCell::new(None),
        })
    }

    fn current(&self) -> EntryTable<K, E> {
        self.table.peek().ok().flatten().unwrap_or_default()
    }

    fn set_impl(&self, key: K, value: E::Provide, mode: SetMode) -> E {
        let current = self.current();
        let table = match mode {
            SetMode::Normal => current.fork(),
            SetMode::Silent => current,
        };
        let entry = match table.get(&key) {
            Some(entry) => {
                entry.update(value);
                entry
            }
            None => self.create_entry(&key, value),
        };
        table.insert(key, entry.clone());
        if mode == SetMode::Normal {
            self.table.set(table);
        }
        entry
    }

    fn create_entry(&self, key: &K, value: E::Provide) -> E {
        let options = self.options.entry_options(key, Some(value));
        let weak = self.weak_self.clone();
        let evicted = key.clone();
        let entry = E::create(&self.runtime, options, move || {
            if let Some(inner) = weak.upgrade() {
                let removed = inner.current().remove(&evicted);
                drop(removed);
            }
        });
        let prefix = self.debug_prefix.borrow().clone();
        if let Some(prefix) = prefix {
            entry.prefix(&prefix);
        }
        entry
    }

    fn peek(&self, key: &K) -> Option<E::Value> {
        self.current().get(key).and_then(|entry| entry.peek_value())
    }

    fn peek_entries(&self) -> Vec<(K, Option<E::Value>)> {
        self.current()
            .snapshot()
            .into_iter()
            .map(|(key, entry)| (key, entry.peek_value()))
            .collect()
    }

    fn clear(&self) {
        for (_, entry) in self.current().snapshot() {
            entry.destroy_entry();
        }
        self.table.set(EntryTable::default());
    }

    fn observe_key_ref(
        &self,
        observer: &ObserverRef,
        key: &K,
    ) -> Result<Option<StateRef<E::Value>>> {
        let current = self.table.observe_ref(observer)?.peek().unwrap_or_default();
        let entry = match current.get(key) {
            Some(entry) => Some(entry),
            None => self
                .get_default
                .clone()
                .map(|get_default| self.set_impl(key.clone(), get_default(key), SetMode::Silent)),
        };
        entry.map(|entry| entry.observe_entry(observer)).transpose()
    }

    fn set_debug_prefix(&self, prefix: &str) {
        *self.debug_prefix.borrow_mut() = Some(prefix.to_owned());
        self.table.set_debug_prefix(&format!("{prefix}::map"));
        for (_, entry) in self.current().snapshot() {
            entry.prefix(prefix);
        }
    }
}

// ─── ObservableMap ───────────────────────────────────────────────────────────

/// Keyed collection of synchronous observables.
///
/// Cloning an `ObservableMap` creates a new handle to the **same** table.
pub struct ObservableMap<K, T> {
    inner: Rc<MapInner<K, T, Observable<T>>>,
    entries: Selector<Vec<(K, T)>>,
}

impl<K, T> Clone for ObservableMap<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
            entries: self.entries.clone(),
        }
    }
}

impl<K, T> fmt::Debug for ObservableMap<K, T>
where
    K: Hash + Eq + Clone + fmt::Debug + 'static,
    T: Equivalent + Clone + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableMap")
            .field("entries", &self.inner.peek_entries())
            .finish()
    }
}

impl<K, T> ObservableMap<K, T>
where
    K: Hash + Eq + Clone + Equivalent + 'static,
    T: Equivalent + Clone + 'static,
{
    pub fn new(options: KeyedOptions<K, T>) -> Self {
        Self::new_in(&Runtime::current(), options)
    }

    pub fn new_in(runtime: &Runtime, options: KeyedOptions<K, T>) -> Self {
        Self::build(runtime, None, options)
    }

    /// Map whose missing keys materialize from `get_default` on first read.
    pub fn with_default(
        get_default: impl Fn(&K) -> T + 'static,
        options: KeyedOptions<K, T>,
    ) -> Self {
        Self::with_default_in(&Runtime::current(), get_default, options)
    }

    pub fn with_default_in(
        runtime: &Runtime,
        get_default: impl Fn(&K) -> T + 'static,
        options: KeyedOptions<K, T>,
    ) -> Self {
        Self::build(runtime, Some(Rc::new(get_default)), options)
    }

    fn build(
        runtime: &Runtime,
        get_default: Option<GetDefault<K, T>>,
        options: KeyedOptions<K, T>,
    ) -> Self {
        let inner = MapInner::new(runtime, get_default, options);
        let table = inner.table.clone();
        let entries = Selector::new_in(
            runtime,
            move |observer: &SyncObserver, _| {
                let current = observer.observe(&table)?;
                current
                    .snapshot()
                    .into_iter()
                    .map(|(key, entry)| Ok((key, observer.observe(&entry)?)))
                    .collect()
            },
            ObservableOptions::new(),
        );
        Self { inner, entries }
    }

    /// Value for `key` without subscribing or materializing a default.
    #[must_use]
    pub fn peek(&self, key: &K) -> Option<T> {
        self.inner.peek(key)
    }

    /// Every key with its value, `None` for entries without a value.
    #[must_use]
    pub fn peek_entries(&self) -> Vec<(K, Option<T>)> {
        self.inner.peek_entries()
    }

    /// Create or update the entry for `key`, notifying whole-table readers.
    pub fn set(&self, key: K, value: T) {
        self.inner.set_impl(key, value, SetMode::Normal);
    }

    #[must_use]
    pub fn has(&self, key: &K) -> bool {
        self.inner.current().contains(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.current().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroy every entry and install an empty table.
    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Selector over every `(key, value)` pair.
    #[must_use]
    pub fn entries(&self) -> &Selector<Vec<(K, T)>> {
        &self.entries
    }
}

impl<K, T> KeyedSource<K, T> for ObservableMap<K, T>
where
    K: Hash + Eq + Clone + 'static,
    T: Equivalent + Clone + 'static,
{
    fn observe_key_ref(&self, observer: &ObserverRef, key: &K) -> Result<Option<StateRef<T>>> {
        self.inner.observe_key_ref(observer, key)
    }
}

impl<K, T> DebugPrefix for ObservableMap<K, T>
where
    K: Hash + Eq + Clone + Equivalent + 'static,
    T: Equivalent + Clone + 'static,
{
    fn set_debug_prefix(&self, prefix: &str) {
        self.inner.set_debug_prefix(prefix);
        self.entries.set_debug_prefix(&format!("{prefix}::entries"));
    }
}

// ─── AsyncObservableMap ──────────────────────────────────────────────────────

/// Keyed collection of async observables.
pub struct AsyncObservableMap<K, T> {
    inner: Rc<MapInner<K, Provided<T>, AsyncObservable<T>>>,
    entries: AsyncSelector<Vec<(K, T)>>,
}

impl<K, T> Clone for AsyncObservableMap<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
            entries: self.entries.clone(),
        }
    }
}

impl<K, T> fmt::Debug for AsyncObservableMap<K, T>
where
    K: Hash + Eq + Clone + fmt::Debug + 'static,
    T: Clone + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncObservableMap")
            .field("entries", &self.inner.peek_entries())
            .finish()
    }
}

impl<K, T> AsyncObservableMap<K, T>
where
    K: Hash + Eq + Clone + 'static,
    T: Clone + 'static,
{
    pub fn new(options: KeyedOptions<K, Provided<T>>) -> Self {
        Self::new_in(&Runtime::current(), options)
    }

    pub fn new_in(runtime: &Runtime, options: KeyedOptions<K, Provided<T>>) -> Self {
        Self::build(runtime, None, options)
    }

    /// Map whose missing keys start the future built by `get_default` on
    /// first read.
    pub fn with_default<F, Fut>(get_default: F, options: KeyedOptions<K, Provided<T>>) -> Self
    where
        F: Fn(&K) -> Fut + 'static,
        Fut: Future<Output = Result<T>> + 'static,
    {
        Self::with_default_in(&Runtime::current(), get_default, options)
    }

    pub fn with_default_in<F, Fut>(
        runtime: &Runtime,
        get_default: F,
        options: KeyedOptions<K, Provided<T>>,
    ) -> Self
    where
        F: Fn(&K) -> Fut + 'static,
        Fut: Future<Output = Result<T>> + 'static,
    {
        let get_default: GetDefault<K, Provided<T>> =
            Rc::new(move |key: &K| Provided::future(get_default(key)));
        Self::build(runtime, Some(get_default), options)
    }

    fn build(
        runtime: &Runtime,
        get_default: Option<GetDefault<K, Provided<T>>>,
        options: KeyedOptions<K, Provided<T>>,
    ) -> Self {
        let inner = MapInner::new(runtime, get_default, options);
        let table = inner.table.clone();
        let entries = AsyncSelector::new_in(
            runtime,
            move |observer: AsyncObserver, _| {
                let table = table.clone();
                async move {
                    let current = observer.observe(&table)?.await?;
                    let pending = current.snapshot().into_iter().map(|(key, entry)| {
                        let provided = observer.observe(&entry);
                        async move { Ok::<_, ReactiveError>((key, provided?.await?)) }
                    });
                    futures::future::try_join_all(pending).await
                }
            },
            ObservableOptions::new(),
        );
        Self { inner, entries }
    }

    /// Resolved value for `key`; `None` while pending, rejected or absent.
    #[must_use]
    pub fn peek(&self, key: &K) -> Option<T> {
        self.inner.peek(key)
    }

    #[must_use]
    pub fn peek_entries(&self) -> Vec<(K, Option<T>)> {
        self.inner.peek_entries()
    }

    /// Provide a new future for `key`.
    pub fn set(&self, key: K, future: impl Future<Output = Result<T>> + 'static) {
        self.inner.set_impl(key, Provided::future(future), SetMode::Normal);
    }

    pub fn set_provided(&self, key: K, provided: Provided<T>) {
        self.inner.set_impl(key, provided, SetMode::Normal);
    }

    #[must_use]
    pub fn has(&self, key: &K) -> bool {
        self.inner.current().contains(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.current().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Async selector resolving every `(key, value)` pair.
    #[must_use]
    pub fn entries(&self) -> &AsyncSelector<Vec<(K, T)>> {
        &self.entries
    }
}

impl<K, T> KeyedSource<K, T> for AsyncObservableMap<K, T>
where
    K: Hash + Eq + Clone + 'static,
    T: Clone + 'static,
{
    fn observe_key_ref(&self, observer: &ObserverRef, key: &K) -> Result<Option<StateRef<T>>> {
        self.inner.observe_key_ref(observer, key)
    }
}

impl<K, T> DebugPrefix for AsyncObservableMap<K, T>
where
    K: Hash + Eq + Clone + 'static,
    T: Clone + 'static,
{
    fn set_debug_prefix(&self, prefix: &str) {
        self.inner.set_debug_prefix(prefix);
        self.entries.set_debug_prefix(&format!("{prefix}::entries"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::observer::Subscriber;
    use crate::state_ref::Status;
    use futures::channel::oneshot;
    use std::cell::Cell;
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
    fn peek_does_not_materialize_defaults() {
        let (runtime, _event_loop) = Runtime::lab();
        let map =
            ObservableMap::with_default_in(&runtime, |key: &String| key.len(), KeyedOptions::new());
        assert_eq!(map.peek(&"mars".to_string()), None);
        assert!(!map.has(&"mars".to_string()));

        let reader = SyncObserver::new_in(&runtime);
        assert_eq!(reader.observe_key(&map, &"mars".to_string()).ok(), Some(Some(4)));
        assert!(map.has(&"mars".to_string()));
        assert_eq!(map.peek(&"mars".to_string()), Some(4));
    }

    #[test]
    fn missing_key_without_default_reads_none() {
        let (runtime, _event_loop) = Runtime::lab();
        let map: ObservableMap<u32, i32> = ObservableMap::new_in(&runtime, KeyedOptions::new());
        let reader = SyncObserver::new_in(&runtime);
        assert_eq!(reader.observe_key(&map, &1).ok(), Some(None));
        map.set(1, 10);
        assert_eq!(reader.observe_key(&map, &1).ok(), Some(Some(10)));
    }

    #[test]
    fn reading_a_default_does_not_notify_whole_table_readers() {
        let (runtime, event_loop) = Runtime::lab();
        let map =
            ObservableMap::with_default_in(&runtime, |key: &u32| key * 2, KeyedOptions::new());
        let (notified, notify) = counter();
        let whole = SyncObserver::with_on_change(&runtime, notify);
        assert_eq!(whole.observe(map.entries()).ok(), Some(Vec::new()));

        let reader = SyncObserver::new_in(&runtime);
        assert_eq!(reader.observe_key(&map, &3).ok(), Some(Some(6)));
        event_loop.run_until_idle();
        assert_eq!(notified.get(), 0);

        map.set(4, 1);
        event_loop.run_until_idle();
        assert_eq!(notified.get(), 1);
        assert_eq!(whole.observe(map.entries()).ok(), Some(vec![(3, 6), (4, 1)]));
    }

    #[test]
    fn set_updates_existing_entry_in_place() {
        let (runtime, event_loop) = Runtime::lab();
        let map = ObservableMap::new_in(&runtime, KeyedOptions::new());
        map.set("a", 1);
        let (notified, notify) = counter();
        let reader = SyncObserver::with_on_change(&runtime, notify);
        assert_eq!(reader.observe_key(&map, &"a").ok(), Some(Some(1)));

        map.set("a", 2);
        event_loop.run_until_idle();
        assert_eq!(notified.get(), 1);
        assert_eq!(map.peek(&"a"), Some(2));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn released_entries_leave_the_table() {
        let (runtime, event_loop) = Runtime::lab();
        let released = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&released);
        let map = ObservableMap::with_default_in(
            &runtime,
            |key: &u32| key + 100,
            KeyedOptions::new()
                .with_release_delay(ReleaseDelay::from_millis(50))
                .on_release(move |key: &u32, value| sink.borrow_mut().push((*key, value))),
        );
        let reader = SyncObserver::with_on_change(&runtime, || {});
        assert_eq!(reader.observe_key(&map, &1).ok(), Some(Some(101)));
        reader.reset();

        event_loop.advance(Duration::from_millis(49));
        assert!(map.has(&1));
        event_loop.advance(Duration::from_millis(1));
        assert!(!map.has(&1));
        assert_eq!(*released.borrow(), vec![(1, 101)]);
    }

    #[test]
    fn clear_destroys_entries_and_notifies() {
        let (runtime, event_loop) = Runtime::lab();
        let (releases, bump) = counter();
        let map = ObservableMap::new_in(
            &runtime,
            KeyedOptions::new()
                .with_release_delay(ReleaseDelay::Default)
                .on_release(move |_: &u32, _: i32| bump()),
        );
        map.set(1, 1);
        map.set(2, 2);
        let (notified, notify) = counter();
        let reader = SyncObserver::with_on_change(&runtime, notify);
        assert_eq!(reader.observe_key(&map, &1).ok(), Some(Some(1)));

        map.clear();
        event_loop.advance(Duration::from_millis(10));
        assert!(map.is_empty());
        assert_eq!(notified.get(), 1);
        assert_eq!(releases.get(), 0);
        assert_eq!(reader.observe_key(&map, &1).ok(), Some(None));
    }

    #[test]
    fn peek_entries_lists_every_key() {
        let (runtime, _event_loop) = Runtime::lab();
        let map = ObservableMap::new_in(&runtime, KeyedOptions::new());
        map.set('x', 1);
        map.set('y', 2);
        assert_eq!(map.peek_entries(), vec![('x', Some(1)), ('y', Some(2))]);
    }

    #[test]
    fn async_map_entries_resolve_together() {
        let (runtime, event_loop) = Runtime::lab();
        let (tx_a, rx_a) = oneshot::channel::<i32>();
        let (tx_b, rx_b) = oneshot::channel::<i32>();
        let map: AsyncObservableMap<&'static str, i32> =
            AsyncObservableMap::new_in(&runtime, KeyedOptions::new());
        map.set("a", async move { rx_a.await.map_err(ReactiveError::failed) });
        map.set("b", async move { rx_b.await.map_err(ReactiveError::failed) });

        let reader = SyncObserver::with_on_change(&runtime, || {});
        assert!(reader.observe(map.entries()).unwrap_err().is_pending());
        assert_eq!(map.entries().status(), Some(Status::Pending));

        let _ = tx_a.send(1);
        event_loop.run_until_idle();
        assert_eq!(map.entries().status(), Some(Status::Pending));
        assert_eq!(map.peek(&"a"), Some(1));

        let _ = tx_b.send(2);
        event_loop.run_until_idle();
        assert_eq!(map.entries().peek_safe(), Some(vec![("a", 1), ("b", 2)]));
    }

    #[test]
    fn async_default_starts_on_first_read() {
        let (runtime, event_loop) = Runtime::lab();
        let (starts, bump) = counter();
        let map = AsyncObservableMap::with_default_in(
            &runtime,
            move |key: &u32| {
                bump();
                let key = *key;
                async move { Ok(key * 10) }
            },
            KeyedOptions::new(),
        );
        let reader = AsyncObserver::new_in(&runtime);
        assert!(matches!(
            reader.observe_key(&map, &7),
            Ok(Some(Provided::Future(_)))
        ));
        assert!(reader.observe_key(&map, &7).is_ok());
        assert_eq!(starts.get(), 1);
        event_loop.run_until_idle();
        assert_eq!(map.peek(&7), Some(70));
    }

    #[test]
    fn debug_prefix_reaches_existing_and_new_entries() {
        let (runtime, _event_loop) = Runtime::lab();
        let map: ObservableMap<u32, u32> = ObservableMap::new_in(&runtime, KeyedOptions::new());
        map.set(1, 1);
        map.set_debug_prefix("Store::items");
        map.set(2, 2);
        let first = map.inner.current().get(&1).map(|entry| entry.debug_id());
        let second = map.inner.current().get(&2).map(|entry| entry.debug_id());
        assert!(first.is_some_and(|id| id.starts_with("Store::items::")));
        assert!(second.is_some_and(|id| id.starts_with("Store::items::")));
        assert!(map.inner.table.debug_id().starts_with("Store::items::map::"));
    }
}
