#![forbid(unsafe_code)]

//! Error types for the reactive engine.
//!
//! Errors are cached terminal states rather than transient failures: once a
//! container is rejected, every read returns a clone of the same
//! [`ReactiveError`] until a new value is provided. The type is therefore
//! `Clone`, and foreign errors are held behind an `Rc`.

use std::error::Error as StdError;
use std::fmt;
use std::future::IntoFuture;
use std::rc::Rc;

use futures::future::{LocalBoxFuture, Shared};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReactiveError>;

/// Handle to a pending state, returned by suspend-mode reads.
///
/// Awaiting it completes once the underlying state settles, whatever the
/// outcome. Only a render adapter is expected to act on it.
#[derive(Clone)]
pub struct Suspension {
    settled: Shared<LocalBoxFuture<'static, ()>>,
}

impl Suspension {
    pub(crate) fn new(settled: Shared<LocalBoxFuture<'static, ()>>) -> Self {
        Self { settled }
    }

    /// Future that resolves once the pending state settles.
    #[must_use]
    pub fn settled(&self) -> Shared<LocalBoxFuture<'static, ()>> {
        self.settled.clone()
    }
}

impl IntoFuture for Suspension {
    type Output = ();
    type IntoFuture = Shared<LocalBoxFuture<'static, ()>>;

    fn into_future(self) -> Self::IntoFuture {
        self.settled
    }
}

impl fmt::Debug for Suspension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suspension")
            .field("settled", &self.settled.peek().is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Error)]
pub enum ReactiveError {
    #[error("{debug_id}: initialized without a value and not in a rejected state")]
    NotInitialized { debug_id: String },

    #[error("attempted to access a pending state from synchronous code")]
    PendingAccess,

    #[error("read suspended on a pending state")]
    Suspended(Suspension),

    #[error("future thrown inside of a future")]
    ThrownFuture,

    #[error("{debug_id}: component observer used outside of its render window")]
    ObserverLocked { debug_id: String },

    #[error("{debug_id}: releasing with {observers} observers attached")]
    ReleasedWhileObserved { debug_id: String, observers: usize },

    #[error("{debug_id}: selector re-entered its own computation")]
    Cycle { debug_id: String },

    #[error("runtime already initialized for this thread")]
    AlreadyInitialized,

    #[error("{message}")]
    Message { message: Rc<str> },

    #[error("{0}")]
    Failed(Rc<dyn StdError>),
}

impl ReactiveError {
    #[must_use]
    pub fn message(message: impl Into<Rc<str>>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn failed(error: impl StdError + 'static) -> Self {
        Self::Failed(Rc::new(error))
    }

    #[must_use]
    pub fn not_initialized(debug_id: impl Into<String>) -> Self {
        Self::NotInitialized {
            debug_id: debug_id.into(),
        }
    }

    /// Whether the read failed only because the state is still pending.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::PendingAccess | Self::Suspended(_))
    }

    /// Whether two errors are the same cached instance.
    ///
    /// Shared payloads compare by pointer; payload-free variants compare by
    /// kind and rendered message.
    #[must_use]
    pub fn is_same(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Failed(a), Self::Failed(b)) => Rc::ptr_eq(a, b),
            (Self::Message { message: a }, Self::Message { message: b }) => Rc::ptr_eq(a, b),
            (Self::Suspended(_), Self::Suspended(_)) => false,
            _ => {
                std::mem::discriminant(self) == std::mem::discriminant(other)
                    && self.to_string() == other.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Boom;

    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("boom")
        }
    }

    impl StdError for Boom {}

    #[test]
    fn failed_clones_share_identity() {
        let err = ReactiveError::failed(Boom);
        let copy = err.clone();
        assert!(err.is_same(&copy));
        assert!(!err.is_same(&ReactiveError::failed(Boom)));
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn message_errors_render_text() {
        let err = ReactiveError::message("no planets");
        assert_eq!(err.to_string(), "no planets");
        assert!(err.is_same(&err.clone()));
    }

    #[test]
    fn pending_classification() {
        assert!(ReactiveError::PendingAccess.is_pending());
        assert!(!ReactiveError::ThrownFuture.is_pending());
        assert!(
            ReactiveError::not_initialized("Observable::3")
                .to_string()
                .starts_with("Observable::3")
        );
    }
}
