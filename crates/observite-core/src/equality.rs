#![forbid(unsafe_code)]

//! Structural value comparison with three strictness levels.
//!
//! # Design
//!
//! Every comparison first tries the identity shortcut ([`Equivalent::identical`]):
//! the same reference, or the same primitive value. When that fails the
//! [`ComparisonMethod`] decides how far to look:
//!
//! - [`Exact`](ComparisonMethod::Exact) stops and reports a difference.
//! - [`ShallowEqual`](ComparisonMethod::ShallowEqual) compares one level of
//!   structure, with children compared by identity.
//! - [`DeepEquals`](ComparisonMethod::DeepEquals) recurses with `DeepEquals`
//!   at every level.
//!
//! Owned containers (`Vec`, maps, sets) count as references: two distinct
//! vectors are never identical, even when their contents match. Shared
//! pointers (`Rc`, `Arc`) are identical when they point at the same
//! allocation. `Option`, `Box` and tuples are transparent.
//!
//! # Invariants
//!
//! 1. `are_equal(x, x, m)` is true for every `x` and every `m`.
//! 2. `Exact` never inspects structure.
//! 3. Under `ShallowEqual`, nested containers must be identical to match.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::{BuildHasher, Hash};
use std::rc::Rc;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

/// How strictly two values are compared before a write counts as a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ComparisonMethod {
    /// Identity only.
    Exact,
    /// One level of structure, children by identity.
    #[default]
    ShallowEqual,
    /// Full structural recursion.
    DeepEquals,
}

impl ComparisonMethod {
    /// Method used for the children of a container compared with `self`.
    #[must_use]
    pub const fn child(self) -> Self {
        match self {
            Self::Exact | Self::ShallowEqual => Self::Exact,
            Self::DeepEquals => Self::DeepEquals,
        }
    }
}

/// Values that the equality engine knows how to compare.
///
/// Only [`identical`](Equivalent::identical) is required. Types without inner
/// structure keep the defaults, which fall back to identity.
pub trait Equivalent {
    /// Same reference, or the same primitive value.
    fn identical(&self, other: &Self) -> bool;

    /// One level of structure, children compared with `Exact`.
    fn shallow_equal(&self, other: &Self) -> bool {
        self.identical(other)
    }

    /// Structure compared recursively with `DeepEquals`.
    fn deep_equal(&self, other: &Self) -> bool {
        self.shallow_equal(other)
    }
}

/// Compare `a` and `b` with the given method.
pub fn are_equal<T: Equivalent + ?Sized>(a: &T, b: &T, method: ComparisonMethod) -> bool {
    if a.identical(b) {
        return true;
    }
    match method {
        ComparisonMethod::Exact => false,
        ComparisonMethod::ShallowEqual => a.shallow_equal(b),
        ComparisonMethod::DeepEquals => a.deep_equal(b),
    }
}

/// Implement [`Equivalent`] for a record type.
///
/// The record is identical only to itself (same address); structural
/// comparison walks the listed fields.
///
/// ```
/// use observite_core::{are_equal, impl_equivalent, ComparisonMethod};
///
/// struct Planet {
///     name: String,
///     moons: Vec<String>,
/// }
/// impl_equivalent!(Planet { name, moons });
///
/// let a = Planet { name: "Mars".into(), moons: vec!["Phobos".into()] };
/// let b = Planet { name: "Mars".into(), moons: vec!["Phobos".into()] };
/// assert!(!are_equal(&a, &b, ComparisonMethod::ShallowEqual));
/// assert!(are_equal(&a, &b, ComparisonMethod::DeepEquals));
/// ```
#[macro_export]
macro_rules! impl_equivalent {
    ($ty:ty { $($field:ident),* $(,)? }) => {
        impl $crate::Equivalent for $ty {
            fn identical(&self, other: &Self) -> bool {
                ::core::ptr::eq(self, other)
            }

            fn shallow_equal(&self, other: &Self) -> bool {
                true $(&& $crate::are_equal(
                    &self.$field,
                    &other.$field,
                    $crate::ComparisonMethod::Exact,
                ))*
            }

            fn deep_equal(&self, other: &Self) -> bool {
                true $(&& $crate::are_equal(
                    &self.$field,
                    &other.$field,
                    $crate::ComparisonMethod::DeepEquals,
                ))*
            }
        }
    };
}

/// Implement [`Equivalent`] for value types through `PartialEq`.
#[macro_export]
macro_rules! impl_equivalent_by_eq {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $crate::Equivalent for $ty {
                fn identical(&self, other: &Self) -> bool {
                    self == other
                }
            }
        )*
    };
}

impl_equivalent_by_eq!(
    (),
    bool,
    char,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    str,
    String,
    std::time::Duration,
);

macro_rules! float_equivalent {
    ($($ty:ty),*) => {
        $(
            impl Equivalent for $ty {
                // NaN is identical to itself, +0 and -0 are distinct.
                fn identical(&self, other: &Self) -> bool {
                    (self.is_nan() && other.is_nan()) || self.to_bits() == other.to_bits()
                }
            }
        )*
    };
}

float_equivalent!(f32, f64);

impl<T: Equivalent + ?Sized> Equivalent for &T {
    fn identical(&self, other: &Self) -> bool {
        (**self).identical(*other)
    }

    fn shallow_equal(&self, other: &Self) -> bool {
        (**self).shallow_equal(*other)
    }

    fn deep_equal(&self, other: &Self) -> bool {
        (**self).deep_equal(*other)
    }
}

impl<T: Equivalent> Equivalent for Option<T> {
    fn identical(&self, other: &Self) -> bool {
        match (self, other) {
            (None, None) => true,
            (Some(a), Some(b)) => a.identical(b),
            _ => false,
        }
    }

    fn shallow_equal(&self, other: &Self) -> bool {
        match (self, other) {
            (Some(a), Some(b)) => are_equal(a, b, ComparisonMethod::ShallowEqual),
            _ => false,
        }
    }

    fn deep_equal(&self, other: &Self) -> bool {
        match (self, other) {
            (Some(a), Some(b)) => are_equal(a, b, ComparisonMethod::DeepEquals),
            _ => false,
        }
    }
}

impl<T: Equivalent + ?Sized> Equivalent for Box<T> {
    fn identical(&self, other: &Self) -> bool {
        (**self).identical(&**other)
    }

    fn shallow_equal(&self, other: &Self) -> bool {
        (**self).shallow_equal(&**other)
    }

    fn deep_equal(&self, other: &Self) -> bool {
        (**self).deep_equal(&**other)
    }
}

macro_rules! shared_pointer_equivalent {
    ($($ptr:ident),*) => {
        $(
            impl<T: Equivalent + ?Sized> Equivalent for $ptr<T> {
                fn identical(&self, other: &Self) -> bool {
                    $ptr::ptr_eq(self, other)
                }

                fn shallow_equal(&self, other: &Self) -> bool {
                    are_equal(&**self, &**other, ComparisonMethod::ShallowEqual)
                }

                fn deep_equal(&self, other: &Self) -> bool {
                    are_equal(&**self, &**other, ComparisonMethod::DeepEquals)
                }
            }
        )*
    };
}

shared_pointer_equivalent!(Rc, Arc);

macro_rules! tuple_equivalent {
    ($(($($name:ident $idx:tt),+)),*) => {
        $(
            impl<$($name: Equivalent),+> Equivalent for ($($name,)+) {
                fn identical(&self, other: &Self) -> bool {
                    true $(&& self.$idx.identical(&other.$idx))+
                }

                fn shallow_equal(&self, other: &Self) -> bool {
                    true $(&& are_equal(&self.$idx, &other.$idx, ComparisonMethod::ShallowEqual))+
                }

                fn deep_equal(&self, other: &Self) -> bool {
                    true $(&& are_equal(&self.$idx, &other.$idx, ComparisonMethod::DeepEquals))+
                }
            }
        )*
    };
}

tuple_equivalent!(
    (A 0),
    (A 0, B 1),
    (A 0, B 1, C 2),
    (A 0, B 1, C 2, D 3)
);

// ---------------------------------------------------------------------------
// Sequences
// ---------------------------------------------------------------------------

fn sequence_equal<'a, T>(
    a: impl ExactSizeIterator<Item = &'a T>,
    b: impl ExactSizeIterator<Item = &'a T>,
    method: ComparisonMethod,
) -> bool
where
    T: Equivalent + 'a,
{
    if a.len() != b.len() {
        return false;
    }
    a.zip(b).all(|(x, y)| are_equal(x, y, method))
}

impl<T: Equivalent> Equivalent for [T] {
    fn identical(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }

    fn shallow_equal(&self, other: &Self) -> bool {
        sequence_equal(self.iter(), other.iter(), ComparisonMethod::Exact)
    }

    fn deep_equal(&self, other: &Self) -> bool {
        sequence_equal(self.iter(), other.iter(), ComparisonMethod::DeepEquals)
    }
}

impl<T: Equivalent> Equivalent for Vec<T> {
    fn identical(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }

    fn shallow_equal(&self, other: &Self) -> bool {
        self.as_slice().shallow_equal(other.as_slice())
    }

    fn deep_equal(&self, other: &Self) -> bool {
        self.as_slice().deep_equal(other.as_slice())
    }
}

impl<T: Equivalent> Equivalent for VecDeque<T> {
    fn identical(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }

    fn shallow_equal(&self, other: &Self) -> bool {
        sequence_equal(self.iter(), other.iter(), ComparisonMethod::Exact)
    }

    fn deep_equal(&self, other: &Self) -> bool {
        sequence_equal(self.iter(), other.iter(), ComparisonMethod::DeepEquals)
    }
}

// ---------------------------------------------------------------------------
// Maps and sets
// ---------------------------------------------------------------------------

macro_rules! map_equivalent {
    ($map:ident, [$($bound:tt)*] $(, $hasher:ident)?) => {
        impl<K, V $(, $hasher)?> Equivalent for $map<K, V $(, $hasher)?>
        where
            K: $($bound)*,
            V: Equivalent,
            $($hasher: BuildHasher,)?
        {
            fn identical(&self, other: &Self) -> bool {
                std::ptr::eq(self, other)
            }

            fn shallow_equal(&self, other: &Self) -> bool {
                self.len() == other.len()
                    && self.iter().all(|(key, value)| {
                        other
                            .get(key)
                            .is_some_and(|theirs| are_equal(value, theirs, ComparisonMethod::Exact))
                    })
            }

            fn deep_equal(&self, other: &Self) -> bool {
                self.len() == other.len()
                    && self.iter().all(|(key, value)| {
                        other.get(key).is_some_and(|theirs| {
                            are_equal(value, theirs, ComparisonMethod::DeepEquals)
                        })
                    })
            }
        }
    };
}

map_equivalent!(HashMap, [Eq + Hash], S);
map_equivalent!(IndexMap, [Eq + Hash], S);
map_equivalent!(BTreeMap, [Ord]);

macro_rules! set_equivalent {
    ($set:ident, [$($bound:tt)*] $(, $hasher:ident)?) => {
        impl<T $(, $hasher)?> Equivalent for $set<T $(, $hasher)?>
        where
            T: $($bound)*,
            $($hasher: BuildHasher,)?
        {
            fn identical(&self, other: &Self) -> bool {
                std::ptr::eq(self, other)
            }

            // Membership is the only structure a set has, at any depth.
            fn shallow_equal(&self, other: &Self) -> bool {
                self.len() == other.len() && self.iter().all(|member| other.contains(member))
            }
        }
    };
}

set_equivalent!(HashSet, [Eq + Hash], S);
set_equivalent!(IndexSet, [Eq + Hash], S);
set_equivalent!(BTreeSet, [Ord]);
