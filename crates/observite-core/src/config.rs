#![forbid(unsafe_code)]

//! Engine-wide defaults.
//!
//! A [`Config`] is owned by a [`Runtime`](crate::Runtime). Options left unset
//! on an individual container resolve against it at construction time.

use std::time::Duration;

use crate::equality::ComparisonMethod;

/// Idle-time policy controlling when an unobserved container drops its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ReleaseDelay {
    /// Use [`Config::default_release_delay`].
    #[default]
    Default,
    /// Keep the state for as long as the container lives.
    Never,
    /// Release after the given idle time.
    After(Duration),
}

impl ReleaseDelay {
    #[must_use]
    pub const fn from_millis(ms: u64) -> Self {
        Self::After(Duration::from_millis(ms))
    }
}

/// Defaults shared by every container built on one runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Config {
    /// Comparison used by `set` when a container does not pick one.
    pub default_comparison: ComparisonMethod,
    /// Delay behind [`ReleaseDelay::Default`].
    pub default_release_delay: Duration,
    /// Release policy for plain observables and keyed entries.
    pub observable_release_delay: ReleaseDelay,
    /// Release policy for selectors and selector-map entries.
    pub selector_release_delay: ReleaseDelay,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_comparison: ComparisonMethod::ShallowEqual,
            default_release_delay: Duration::from_millis(1),
            observable_release_delay: ReleaseDelay::Never,
            selector_release_delay: ReleaseDelay::Default,
        }
    }
}

impl Config {
    #[must_use]
    pub fn with_default_comparison(mut self, method: ComparisonMethod) -> Self {
        self.default_comparison = method;
        self
    }

    #[must_use]
    pub fn with_default_release_delay(mut self, delay: Duration) -> Self {
        self.default_release_delay = delay;
        self
    }

    #[must_use]
    pub fn with_observable_release_delay(mut self, delay: ReleaseDelay) -> Self {
        self.observable_release_delay = delay;
        self
    }

    #[must_use]
    pub fn with_selector_release_delay(mut self, delay: ReleaseDelay) -> Self {
        self.selector_release_delay = delay;
        self
    }

    /// Concrete idle time for a policy, `None` when it never releases.
    #[must_use]
    pub fn resolve_release_delay(&self, delay: ReleaseDelay) -> Option<Duration> {
        match delay {
            ReleaseDelay::Default => Some(self.default_release_delay),
            ReleaseDelay::Never => None,
            ReleaseDelay::After(delay) => Some(delay),
        }
    }
}
