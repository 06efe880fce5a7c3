//! Property-based tests for structural diff and patch
//!
//! These tests verify that a delta computed between two arbitrary JSON
//! values always reproduces the target when patched onto the source.

use proptest::prelude::*;
use serde_json::{Map, Value};
use widget_relay_core::diff::{diff, patch};

/// Generate arbitrary leaf values
fn arb_leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        (-1000i64..1000).prop_map(Value::from),
        "[a-z]{0,6}".prop_map(Value::String),
    ]
}

/// Generate arbitrary nested JSON values
fn arb_json() -> impl Strategy<Value = Value> {
    arb_leaf().prop_recursive(4, 48, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::btree_map("[a-e]", inner, 0..5)
                .prop_map(|fields| Value::Object(fields.into_iter().collect::<Map<_, _>>())),
        ]
    })
}

proptest! {
    /// Property: patch(A, diff(A, B)) == B
    #[test]
    fn patch_reproduces_target(left in arb_json(), right in arb_json()) {
        let patched = match diff(&left, &right) {
            Some(delta) => patch(left.clone(), &delta).expect("delta should apply"),
            None => left.clone(),
        };
        prop_assert_eq!(patched, right);
    }

    /// Property: a value never differs from itself
    #[test]
    fn identical_values_have_no_delta(value in arb_json()) {
        prop_assert_eq!(diff(&value, &value), None);
    }

    /// Property: deltas survive the wire encoding unchanged
    #[test]
    fn delta_survives_json_encoding(left in arb_json(), right in arb_json()) {
        if let Some(delta) = diff(&left, &right) {
            let text = serde_json::to_string(&delta).unwrap();
            let decoded: Value = serde_json::from_str(&text).unwrap();
            prop_assert_eq!(patch(left, &decoded).unwrap(), right);
        }
    }

    /// Property: small edits to a large array keep the delta small
    #[test]
    fn single_element_edit_touches_one_index(
        items in prop::collection::vec(0i64..100, 1..40),
        index in any::<prop::sample::Index>(),
        replacement in 100i64..200,
    ) {
        let left = Value::from(items.clone());
        let mut edited = items;
        let at = index.index(edited.len());
        edited[at] = replacement;
        let right = Value::from(edited);

        let delta = diff(&left, &right).expect("arrays differ");
        let entries = delta.as_object().expect("array delta is an object");
        // "_t" marker plus one modified index
        prop_assert_eq!(entries.len(), 2);
        prop_assert_eq!(patch(left, &delta).unwrap(), right);
    }
}
