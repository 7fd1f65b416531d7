// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the per-page reference table
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; compares the run-length table against a flat counter vector
//!
//! TEST_SCOPE:
//!   - Writes keep the encoding canonical
//!   - Adjustments match a per-slot model
//!
//! TEST_SCENARIOS:
//!   - set_reflen_matches_model(): random writes agree with a flat vector
//!   - adjust_roundtrip_restores_runs(): +1 then -1 restores the exact run list
//!   - zeroed_ranges_match_model(): reported zero ranges are exactly the slots that hit 0

use super::PpRefTable;
use proptest::prelude::*;

const COVER: usize = 32;

fn arb_write() -> impl Strategy<Value = (usize, usize, u32)> {
    (0..COVER).prop_flat_map(|start| (Just(start), 0..=(COVER - start), 0u32..4))
}

fn expand(table: &PpRefTable) -> Vec<u32> {
    (0..table.cover()).map(|slot| table.refs_at(slot)).collect()
}

fn build(writes: &[(usize, usize, u32)]) -> (PpRefTable, Vec<u32>) {
    let mut table = PpRefTable::try_new(COVER).expect("table");
    let mut model = vec![0u32; COVER];
    for &(start, len, refs) in writes {
        table.set_reflen(start, refs, len);
        model[start..start + len].iter_mut().for_each(|slot| *slot = refs);
    }
    (table, model)
}

proptest! {
    #[test]
    fn set_reflen_matches_model(writes in prop::collection::vec(arb_write(), 0..12)) {
        let (table, model) = build(&writes);
        table.check(COVER);
        prop_assert_eq!(expand(&table), model);
    }

    #[test]
    fn adjust_roundtrip_restores_runs(
        writes in prop::collection::vec(arb_write(), 0..12),
        (start, len) in (0..COVER).prop_flat_map(|s| (Just(s), 0..=(COVER - s))),
    ) {
        let (mut table, _) = build(&writes);
        let before = table.clone();
        prop_assert!(table.adjust(start, len, 1).is_empty());
        table.check(COVER);
        table.adjust(start, len, -1);
        prop_assert_eq!(table, before);
    }

    #[test]
    fn zeroed_ranges_match_model(
        writes in prop::collection::vec(arb_write(), 0..12),
        (start, len) in (0..COVER).prop_flat_map(|s| (Just(s), 0..=(COVER - s))),
    ) {
        let (mut table, mut model) = build(&writes);
        // Lift the window so the decrement cannot underflow.
        table.adjust(start, len, 1);
        model[start..start + len].iter_mut().for_each(|slot| *slot += 1);
        let zeroed = table.adjust(start, len, -1);
        model[start..start + len].iter_mut().for_each(|slot| *slot -= 1);
        let expected: Vec<usize> =
            (start..start + len).filter(|&slot| model[slot] == 0).collect();
        let reported: Vec<usize> = zeroed.into_iter().flatten().collect();
        prop_assert_eq!(reported, expected);
        prop_assert_eq!(expand(&table), model);
    }
}
