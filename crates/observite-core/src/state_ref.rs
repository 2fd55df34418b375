#![forbid(unsafe_code)]

//! State cache unifying immediate values and pending futures.
//!
//! # Design
//!
//! A [`StateRef`] is created whenever a container's value is set and is
//! replaced wholesale on the next set. It keeps what the owner provided (a
//! value or a [`ValueFuture`]) and, once settled, the result or the error.
//! Settlement of a future is driven by a task on the runtime's executor; the
//! task holds the cache alive so in-flight work is never dropped.
//!
//! # Invariants
//!
//! 1. Status moves Pending→Resolved or Pending→Rejected at most once.
//! 2. A ref built directly in a terminal state never transitions.
//! 3. The status callback fires once per real transition, never on
//!    construction.
//! 4. Re-reads return the cached outcome; the future is never driven twice.

use std::cell::RefCell;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::rc::Rc;

use futures::FutureExt;
use futures::future::{self, LocalBoxFuture, Shared};

use crate::error::{ReactiveError, Result, Suspension};
use crate::runtime::Runtime;

/// Shared, settle-once future of a container value.
pub type ValueFuture<T> = Shared<LocalBoxFuture<'static, Result<T>>>;

/// Wrap a future so it can be stored in a container.
pub fn value_future<T, F>(future: F) -> ValueFuture<T>
where
    T: Clone + 'static,
    F: Future<Output = Result<T>> + 'static,
{
    future.boxed_local().shared()
}

/// What an owner handed to a container: a value or a future of one.
pub enum Provided<T> {
    Value(T),
    Future(ValueFuture<T>),
}

impl<T: Clone> Clone for Provided<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Value(value) => Self::Value(value.clone()),
            Self::Future(future) => Self::Future(future.clone()),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Provided<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Future(future) => f
                .debug_tuple("Future")
                .field(&if future.peek().is_some() { "settled" } else { "pending" })
                .finish(),
        }
    }
}

impl<T> Provided<T> {
    #[must_use]
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Value(value) => Some(value),
            Self::Future(_) => None,
        }
    }

    #[must_use]
    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Value(value) => Some(value),
            Self::Future(_) => None,
        }
    }
}

impl<T: Clone + 'static> Provided<T> {
    pub fn future(future: impl Future<Output = Result<T>> + 'static) -> Self {
        Self::Future(value_future(future))
    }
}

impl<T: Clone + 'static> IntoFuture for Provided<T> {
    type Output = Result<T>;
    type IntoFuture = LocalBoxFuture<'static, Result<T>>;

    fn into_future(self) -> Self::IntoFuture {
        match self {
            Self::Value(value) => future::ready(Ok(value)).boxed_local(),
            Self::Future(future) => future.boxed_local(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Pending,
    Resolved,
    Rejected,
}

/// How a synchronous read treats a pending state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThrowMode {
    /// Fail with [`ReactiveError::PendingAccess`].
    ErrorOnPending,
    /// Fail with [`ReactiveError::Suspended`], carrying a handle to wait on.
    Suspend,
}

/// Snapshot of a state: pending with a handle, resolved, or rejected.
pub enum AsyncState<T> {
    Pending(ValueFuture<T>),
    Resolved(T),
    Rejected(ReactiveError),
}

impl<T: Clone> Clone for AsyncState<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Pending(future) => Self::Pending(future.clone()),
            Self::Resolved(value) => Self::Resolved(value.clone()),
            Self::Rejected(error) => Self::Rejected(error.clone()),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for AsyncState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending(_) => f.write_str("Pending"),
            Self::Resolved(value) => f.debug_tuple("Resolved").field(value).finish(),
            Self::Rejected(error) => f.debug_tuple("Rejected").field(error).finish(),
        }
    }
}

impl<T> AsyncState<T> {
    #[must_use]
    pub fn status(&self) -> Status {
        match self {
            Self::Pending(_) => Status::Pending,
            Self::Resolved(_) => Status::Resolved,
            Self::Rejected(_) => Status::Rejected,
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    #[must_use]
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Resolved(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&ReactiveError> {
        match self {
            Self::Rejected(error) => Some(error),
            _ => None,
        }
    }
}

struct StateCell<T> {
    holder: Option<Provided<T>>,
    state: RefCell<AsyncState<T>>,
    on_status_changed: RefCell<Option<Box<dyn FnOnce(Status)>>>,
    settle_listeners: RefCell<Vec<Box<dyn FnOnce()>>>,
}

/// Cached state of one container value.
///
/// Cloning a `StateRef` creates a new handle to the **same** cache.
pub struct StateRef<T> {
    cell: Rc<StateCell<T>>,
}

impl<T> Clone for StateRef<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Rc::clone(&self.cell),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for StateRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateRef")
            .field("state", &*self.cell.state.borrow())
            .finish()
    }
}

impl<T: Clone + 'static> StateRef<T> {
    fn from_parts(holder: Option<Provided<T>>, state: AsyncState<T>) -> Self {
        Self {
            cell: Rc::new(StateCell {
                holder,
                state: RefCell::new(state),
                on_status_changed: RefCell::new(None),
                settle_listeners: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Resolved immediately.
    pub fn from_value(value: T) -> Self {
        Self::from_parts(Some(Provided::Value(value.clone())), AsyncState::Resolved(value))
    }

    /// Rejected with no holder; releasing it skips the release callback.
    pub fn from_error(error: ReactiveError) -> Self {
        Self::from_parts(None, AsyncState::Rejected(error))
    }

    /// Pending until `future` settles on the runtime's executor.
    pub fn from_future(runtime: &Runtime, future: ValueFuture<T>) -> Self {
        let state = Self::from_parts(
            Some(Provided::Future(future.clone())),
            AsyncState::Pending(future.clone()),
        );
        let driver = state.clone();
        runtime.spawn_local(async move {
            let outcome = future.await;
            driver.settle(outcome);
        });
        state
    }

    pub fn from_provided(runtime: &Runtime, provided: Provided<T>) -> Self {
        match provided {
            Provided::Value(value) => Self::from_value(value),
            Provided::Future(future) => Self::from_future(runtime, future),
        }
    }

    fn settle(&self, outcome: Result<T>) {
        let next = match outcome {
            Ok(value) => AsyncState::Resolved(value),
            Err(ReactiveError::Suspended(_)) => AsyncState::Rejected(ReactiveError::ThrownFuture),
            Err(error) => AsyncState::Rejected(error),
        };
        let status = next.status();
        {
            let mut state = self.cell.state.borrow_mut();
            if !state.is_pending() {
                return;
            }
            *state = next;
        }
        tracing::trace!(?status, "state settled");
        let callback = self.cell.on_status_changed.borrow_mut().take();
        if let Some(callback) = callback {
            callback(status);
        }
        let listeners = std::mem::take(&mut *self.cell.settle_listeners.borrow_mut());
        for listener in listeners {
            listener();
        }
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.cell.state.borrow().status()
    }

    /// Three-state snapshot.
    #[must_use]
    pub fn state(&self) -> AsyncState<T> {
        self.cell.state.borrow().clone()
    }

    /// The resolved value; `None` while pending or when rejected.
    #[must_use]
    pub fn peek(&self) -> Option<T> {
        self.cell.state.borrow().value().cloned()
    }

    /// Run `f` against the resolved value without cloning it.
    pub fn with_resolved<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        f(self.cell.state.borrow().value())
    }

    /// What the owner provided; `None` only for a pure error state.
    #[must_use]
    pub fn holder(&self) -> Option<Provided<T>> {
        self.cell.holder.clone()
    }

    /// The provided value or future, or the cached error.
    pub fn get_or_throw_provided(&self) -> Result<Provided<T>> {
        if let AsyncState::Rejected(error) = &*self.cell.state.borrow() {
            return Err(error.clone());
        }
        self.holder()
            .ok_or_else(|| ReactiveError::not_initialized("StateRef"))
    }

    /// The pending future, the resolved value, or the cached error.
    pub fn get_or_throw_async(&self) -> Result<Provided<T>> {
        match &*self.cell.state.borrow() {
            AsyncState::Pending(future) => Ok(Provided::Future(future.clone())),
            AsyncState::Resolved(value) => Ok(Provided::Value(value.clone())),
            AsyncState::Rejected(error) => Err(error.clone()),
        }
    }

    /// The resolved value, or an error describing why there is none.
    pub fn get_or_throw_sync(&self, mode: ThrowMode) -> Result<T> {
        match &*self.cell.state.borrow() {
            AsyncState::Pending(future) => Err(match mode {
                ThrowMode::ErrorOnPending => ReactiveError::PendingAccess,
                ThrowMode::Suspend => ReactiveError::Suspended(Suspension::new(
                    future.clone().map(|_| ()).boxed_local().shared(),
                )),
            }),
            AsyncState::Resolved(value) => Ok(value.clone()),
            AsyncState::Rejected(error) => Err(error.clone()),
        }
    }

    /// Install the callback fired on the one real status transition.
    pub fn set_on_status_changed(&self, callback: impl FnOnce(Status) + 'static) {
        *self.cell.on_status_changed.borrow_mut() = Some(Box::new(callback));
    }

    /// Run `listener` once when a pending state settles.
    ///
    /// Returns `false`, dropping the listener, when the state is not pending.
    pub fn on_settled(&self, listener: impl FnOnce() + 'static) -> bool {
        if !self.cell.state.borrow().is_pending() {
            return false;
        }
        self.cell.settle_listeners.borrow_mut().push(Box::new(listener));
        true
    }

    /// Whether both handles point at the same cache.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }
}
