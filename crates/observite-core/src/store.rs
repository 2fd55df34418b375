#![forbid(unsafe_code)]

//! Named groups of observables.
//!
//! A store tags each registered member with `Store::field` so logs and
//! errors name the member by where it lives. Registration is explicit.
//!
//! # Example
//!
//! ```
//! use observite_core::{Observable, ObservableOptions, ObservableStore, Runtime};
//!
//! let (runtime, _event_loop) = Runtime::lab();
//! let selected = Observable::new_in(&runtime, ObservableOptions::new().with_default(0u32));
//! ObservableStore::new("SolarSystem").register("selected", &selected);
//! assert!(selected.debug_id().starts_with("SolarSystem::selected::"));
//! ```

use std::cell::RefCell;
use std::fmt;

/// Anything that carries a debug id which can be prefixed.
pub trait DebugPrefix {
    /// Prepend `prefix` to the debug id, and to those of owned internals.
    fn set_debug_prefix(&self, prefix: &str);
}

impl<P: DebugPrefix + ?Sized> DebugPrefix for &P {
    fn set_debug_prefix(&self, prefix: &str) {
        (**self).set_debug_prefix(prefix);
    }
}

impl<P: DebugPrefix + ?Sized> DebugPrefix for Box<P> {
    fn set_debug_prefix(&self, prefix: &str) {
        (**self).set_debug_prefix(prefix);
    }
}

/// Registry tagging members with `name::field` prefixes.
pub struct ObservableStore {
    name: String,
    fields: RefCell<Vec<String>>,
}

impl fmt::Debug for ObservableStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableStore")
            .field("name", &self.name)
            .field("fields", &self.fields.borrow())
            .finish()
    }
}

impl ObservableStore {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: RefCell::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tag `member` as `field` of this store.
    ///
    /// Registering the same field twice is allowed; the member is prefixed
    /// again and the field is listed once.
    pub fn register<M: DebugPrefix + ?Sized>(&self, field: &str, member: &M) -> &Self {
        member.set_debug_prefix(&self.prefix_for(field));
        let mut fields = self.fields.borrow_mut();
        if !fields.iter().any(|known| known == field) {
            fields.push(field.to_owned());
        }
        tracing::trace!(store = %self.name, field, "registered member");
        self
    }

    /// Register several members at once.
    pub fn register_all<'a>(
        &self,
        members: impl IntoIterator<Item = (&'a str, &'a dyn DebugPrefix)>,
    ) -> &Self {
        for (field, member) in members {
            self.register(field, member);
        }
        self
    }

    /// Fields registered so far, in registration order.
    #[must_use]
    pub fn fields(&self) -> Vec<String> {
        self.fields.borrow().clone()
    }

    #[must_use]
    pub fn prefix_for(&self, field: &str) -> String {
        format!("{}::{field}", self.name)
    }
}
