//! Property-based tests for the algebra of `Cause`.
//!
//! - `Empty` is the identity of both `then` and `both`
//! - `then` and `both` are associative
//! - `both` is commutative, `then` keeps order
//! - `map` is a functor

use lambars_fiber::prelude::*;
use proptest::prelude::*;
use proptest::strategy::Strategy as _;

fn leaf() -> impl proptest::strategy::Strategy<Value = Cause<i32>> {
    prop_oneof![
        any::<i32>().prop_map(Cause::fail),
        (0u64..8).prop_map(|sequence| Cause::interrupt(FiberId::new(0, sequence))),
    ]
}

fn cause() -> impl proptest::strategy::Strategy<Value = Cause<i32>> {
    leaf().prop_recursive(4, 16, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(left, right)| Cause::then(left, right)),
            (inner.clone(), inner).prop_map(|(left, right)| Cause::both(left, right)),
        ]
    })
}

// =============================================================================
// Monoid Laws
// =============================================================================

proptest! {
    #[test]
    fn prop_then_left_identity(value in cause()) {
        prop_assert_eq!(Cause::then(Cause::Empty, value.clone()), value);
    }

    #[test]
    fn prop_then_right_identity(value in cause()) {
        prop_assert_eq!(Cause::then(value.clone(), Cause::Empty), value);
    }

    #[test]
    fn prop_both_identity(value in cause()) {
        prop_assert_eq!(Cause::both(Cause::Empty, value.clone()), value.clone());
        prop_assert_eq!(Cause::both(value.clone(), Cause::Empty), value);
    }

    #[test]
    fn prop_then_associativity(first in cause(), second in cause(), third in cause()) {
        let left = Cause::then(Cause::then(first.clone(), second.clone()), third.clone());
        let right = Cause::then(first, Cause::then(second, third));
        prop_assert_eq!(left, right);
    }

    #[test]
    fn prop_both_associativity(first in cause(), second in cause(), third in cause()) {
        let left = Cause::both(Cause::both(first.clone(), second.clone()), third.clone());
        let right = Cause::both(first, Cause::both(second, third));
        prop_assert_eq!(left, right);
    }

    #[test]
    fn prop_both_commutativity(left in cause(), right in cause()) {
        prop_assert_eq!(
            Cause::both(left.clone(), right.clone()),
            Cause::both(right, left)
        );
    }
}

// =============================================================================
// Queries
// =============================================================================

proptest! {
    #[test]
    fn prop_then_keeps_failures_in_order(left in cause(), right in cause()) {
        let mut expected = left.clone().into_failures();
        expected.extend(right.clone().into_failures());
        prop_assert_eq!(Cause::then(left, right).into_failures(), expected);
    }

    #[test]
    fn prop_a_cause_contains_itself(value in cause()) {
        prop_assert!(value.contains(&value));
    }

    #[test]
    fn prop_map_identity(value in cause()) {
        prop_assert_eq!(value.clone().map(|error| error), value);
    }

    #[test]
    fn prop_map_composition(value in cause()) {
        let composed = value.clone().map(|error| error.wrapping_add(1).wrapping_mul(2));
        let chained = value.map(|error| error.wrapping_add(1)).map(|error| error.wrapping_mul(2));
        prop_assert_eq!(composed, chained);
    }

    #[test]
    fn prop_strip_failures_leaves_only_interruption(value in cause()) {
        let stripped: Cause<i32> = value.clone().strip_failures();
        prop_assert!(stripped.failures().is_empty());
        prop_assert_eq!(stripped.interruptors(), value.interruptors());
    }
}
