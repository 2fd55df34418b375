//! Property-based invariant tests for batching and notification order.
//!
//! These tests verify structural invariants that must hold for any input:
//!
//! 1. A batch of writes notifies a subscriber at most once, and exactly once
//!    when any write in the batch was a real change.
//! 2. The last write of a batch is the value observed afterwards.
//! 3. Observers are notified in creation order, whatever order they
//!    subscribed in.
//! 4. A selector over many inputs always agrees with its inputs after a
//!    flush, and recomputes at most once per batch.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use observite_core::{
    Observable, ObservableOptions, Runtime, Selector, Subscriber, SyncObserver,
};
use proptest::prelude::*;

// ── Helpers ─────────────────────────────────────────────────────────────

fn batches() -> impl Strategy<Value = Vec<Vec<u8>>> {
    proptest::collection::vec(proptest::collection::vec(0u8..4, 0..6), 1..8)
}

// ═════════════════════════════════════════════════════════════════════════
// 1–2. Batching
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn each_batch_notifies_at_most_once(batches in batches()) {
        let (runtime, event_loop) = Runtime::lab();
        let source = Observable::new_in(&runtime, ObservableOptions::new().with_default(0u8));
        let notified = Rc::new(Cell::new(0u32));
        let observer = SyncObserver::new_in(&runtime);
        {
            let bump = Rc::clone(&notified);
            let reader = observer.clone();
            let watched = source.clone();
            observer.set_on_change(move || {
                bump.set(bump.get() + 1);
                let _ = reader.observe(&watched);
            });
        }
        prop_assert_eq!(observer.observe(&source).ok(), Some(0));

        let mut current = 0u8;
        for batch in batches {
            let before = notified.get();
            let mut changed = false;
            for value in &batch {
                changed |= *value != current;
                current = *value;
                source.set(*value);
            }
            event_loop.run_until_idle();
            prop_assert_eq!(notified.get() - before, u32::from(changed));
            prop_assert_eq!(source.peek().ok().flatten(), Some(current));
        }
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 3. Ordering
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn notification_follows_creation_order(
        subscribe_order in Just((0..6usize).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let (runtime, event_loop) = Runtime::lab();
        let source = Observable::new_in(&runtime, ObservableOptions::new().with_default(0));
        let order = Rc::new(RefCell::new(Vec::new()));
        let observers: Vec<SyncObserver> = (0..6)
            .map(|index| {
                let order = Rc::clone(&order);
                SyncObserver::with_on_change(&runtime, move || order.borrow_mut().push(index))
            })
            .collect();
        for index in subscribe_order {
            prop_assert!(observers[index].observe(&source).is_ok());
        }

        source.set(1);
        event_loop.run_until_idle();
        prop_assert_eq!(order.borrow().clone(), (0..6).collect::<Vec<_>>());
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 4. Selectors
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn selector_sum_tracks_its_inputs(
        writes in proptest::collection::vec(
            proptest::collection::vec((0usize..4, -50i64..50), 1..5),
            1..6,
        ),
    ) {
        let (runtime, event_loop) = Runtime::lab();
        let inputs: Vec<Observable<i64>> = (0..4)
            .map(|_| Observable::new_in(&runtime, ObservableOptions::new().with_default(0)))
            .collect();
        let computations = Rc::new(Cell::new(0u32));
        let sum = {
            let inputs = inputs.clone();
            let computations = Rc::clone(&computations);
            Selector::new_in(
                &runtime,
                move |observer: &SyncObserver, _| {
                    computations.set(computations.get() + 1);
                    inputs.iter().try_fold(0i64, |total, input| Ok(total + observer.observe(input)?))
                },
                ObservableOptions::new(),
            )
        };
        let reader = SyncObserver::new_in(&runtime);
        {
            let handle = reader.clone();
            let sum = sum.clone();
            reader.set_on_change(move || {
                let _ = handle.observe(&sum);
            });
        }
        prop_assert_eq!(reader.observe(&sum).ok(), Some(0));

        for batch in writes {
            let before = computations.get();
            for (index, value) in batch {
                inputs[index].set(value);
            }
            event_loop.run_until_idle();
            let expected: i64 = inputs
                .iter()
                .map(|input| input.peek().ok().flatten().unwrap_or(0))
                .sum();
            prop_assert_eq!(sum.peek_safe(), Some(expected));
            prop_assert!(computations.get() - before <= 1);
        }
    }
}
