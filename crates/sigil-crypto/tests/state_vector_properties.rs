//! Property-based tests for StateVector bookkeeping
//!
//! Drives arbitrary use/unuse/next sequences and checks the counting and
//! lowest-free-index invariants after every step.

use proptest::prelude::*;
use sigil_crypto::StateVector;

#[derive(Debug, Clone)]
enum Op {
    Use(u32),
    Unuse(u32),
    Next,
}

fn arbitrary_op(num_keys: u32) -> impl Strategy<Value = Op> {
    // Out-of-range indices are included on purpose; they must be ignored.
    let index = 0..num_keys + 8;
    prop_oneof![
        index.clone().prop_map(Op::Use),
        index.prop_map(Op::Unuse),
        Just(Op::Next),
    ]
}

fn arbitrary_run() -> impl Strategy<Value = (u32, Vec<Op>)> {
    (1u32..300).prop_flat_map(|num_keys| {
        (Just(num_keys), prop::collection::vec(arbitrary_op(num_keys), 0..400))
    })
}

fn check_invariants(sv: &StateVector) -> Result<(), TestCaseError> {
    let used = (0..sv.num_keys()).filter(|&i| sv.used(i)).count() as u32;

    // PROPERTY: available count equals keys minus used bits
    prop_assert_eq!(sv.num_available(), sv.num_keys() - used);

    // PROPERTY: first_available is the lowest unused index
    let lowest = (0..sv.num_keys()).find(|&i| !sv.used(i)).unwrap_or(sv.num_keys());
    prop_assert_eq!(sv.first_available(), lowest);
    Ok(())
}

#[test]
fn prop_counters_track_bitfield() {
    proptest!(|((num_keys, ops) in arbitrary_run())| {
        let mut sv = StateVector::new(num_keys);
        for op in ops {
            match op {
                Op::Use(i) => sv.use_key(i),
                Op::Unuse(i) => sv.unuse(i),
                Op::Next => {
                    let before = sv.clone();
                    if let Ok(index) = sv.next() {
                        // PROPERTY: next never hands out a used index
                        prop_assert!(!before.used(index));
                        prop_assert!(sv.used(index));
                    } else {
                        prop_assert_eq!(before.num_available(), 0);
                    }
                }
            }
            check_invariants(&sv)?;
        }
    });
}

#[test]
fn prop_marshal_preserves_state() {
    proptest!(|((num_keys, ops) in arbitrary_run())| {
        let mut sv = StateVector::new(num_keys);
        for op in ops {
            match op {
                Op::Use(i) => sv.use_key(i),
                Op::Unuse(i) => sv.unuse(i),
                Op::Next => {
                    let _ = sv.next();
                }
            }
        }

        let restored = StateVector::unmarshal(&sv.marshal().unwrap()).unwrap();

        // PROPERTY: persisted state reloads to an identical vector
        prop_assert_eq!(restored, sv);
    });
}

#[test]
fn prop_next_exhausts_in_order() {
    proptest!(|(num_keys in 0u32..200)| {
        let mut sv = StateVector::new(num_keys);
        for expected in 0..num_keys {
            prop_assert_eq!(sv.next().unwrap(), expected);
        }

        // PROPERTY: call num_keys + 1 reports exhaustion
        prop_assert!(sv.next().unwrap_err().requires_rekey());
        prop_assert_eq!(sv.num_available(), 0);
    });
}
