// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(all(test, feature = "backend-host"))]
//! CONTEXT: Property-based tests for amap bookkeeping
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; random operation sequences checked against simple models
//!
//! TEST_SCOPE:
//!   - Dense/sparse slot duality under add/unadd
//!   - Anon reference conservation across ref, copy and unref
//!   - Copy-on-write never mutates the source amap's slot mapping
//!
//! TEST_SCENARIOS:
//!   - slot_table_matches_model(): random add/unadd agree with a BTreeMap model
//!   - anon_refs_match_holders(): every anon's count equals its holders plus the test handle
//!   - copy_preserves_source_mapping(): copy duplicates the window and leaves the source intact

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::Amap;
use crate::anon::AnonRef;
use crate::config::AmapConfig;
use crate::entry::{Aref, EntryMap, MapEntry};
use crate::flags::{CopyFlags, Prot, RefFlags, WaitPolicy};
use crate::host::HostBackend;
use crate::memory::AnonMemory;
use proptest::prelude::*;

const PAGE: usize = 4096;
const SLOTS: usize = 16;

struct FixedMap;

impl EntryMap for FixedMap {
    fn clip_start(&mut self, _mem: &AnonMemory, _entry: &mut MapEntry, _va: usize) {}
    fn clip_end(&mut self, _mem: &AnonMemory, _entry: &mut MapEntry, _va: usize) {}
}

fn setup() -> (Arc<HostBackend>, AnonMemory) {
    let host = HostBackend::new();
    let mem = AnonMemory::new(AmapConfig::new(), host.clone()).expect("config");
    (host, mem)
}

fn whole_entry(amap: &Arc<Amap>) -> MapEntry {
    MapEntry::new(0, SLOTS * PAGE, Prot::READ).with_aref(Aref::new(amap.clone(), 0))
}

#[derive(Clone, Debug)]
enum Op {
    /// Take another whole-map reference on entry `i`'s amap.
    Share(usize),
    /// Copy entry `i` so it owns its amap.
    Copy(usize),
    /// Drop entry `i`.
    Drop(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        any::<usize>().prop_map(Op::Share),
        any::<usize>().prop_map(Op::Copy),
        any::<usize>().prop_map(Op::Drop),
    ]
}

proptest! {
    #[test]
    fn slot_table_matches_model(ops in prop::collection::vec((0..SLOTS, any::<bool>()), 0..64)) {
        let (host, mem) = setup();
        let amap = mem.alloc(SLOTS, 0, WaitPolicy::MayBlock).expect("alloc");
        let aref = Aref::new(amap.clone(), 0);
        let mut model: BTreeMap<usize, AnonRef> = BTreeMap::new();
        for (slot, insert) in ops {
            match (insert, model.contains_key(&slot)) {
                (true, false) => {
                    let anon = host.resident_anon(slot as u64);
                    prop_assert!(mem.add(&aref, slot * PAGE, &anon, false).is_none());
                    model.insert(slot, anon);
                }
                (false, true) => {
                    let removed = mem.unadd(&aref, slot * PAGE);
                    let expected = model.remove(&slot).expect("modelled");
                    prop_assert!(removed.ptr_eq(&expected));
                }
                _ => {}
            }
            amap.validate();
            let snap = amap.snapshot();
            let got: Vec<_> = snap.anons.iter().map(|(slot, _)| *slot).collect();
            let want: Vec<_> = model.keys().copied().collect();
            prop_assert_eq!(got, want);
        }
    }

    #[test]
    fn anon_refs_match_holders(
        populated in prop::collection::btree_set(0..SLOTS, 1..SLOTS),
        ops in prop::collection::vec(arb_op(), 0..24),
    ) {
        let (host, mem) = setup();
        let amap = mem.alloc(SLOTS, 0, WaitPolicy::MayBlock).expect("alloc");
        let mut entries = vec![whole_entry(&amap)];
        let anons: Vec<AnonRef> = populated
            .iter()
            .map(|&slot| {
                let anon = host.resident_anon(slot as u64);
                mem.add(entries[0].aref.as_ref().expect("aref"), slot * PAGE, &anon, false);
                anon
            })
            .collect();

        for op in ops {
            match op {
                Op::Share(i) => {
                    let aref = entries[i % entries.len()].aref.as_ref().expect("aref");
                    let amap = aref.amap().clone();
                    mem.amap_ref(&amap, 0, SLOTS, RefFlags::SHARED | RefFlags::ALL);
                    entries.push(whole_entry(&amap));
                }
                Op::Copy(i) => {
                    let i = i % entries.len();
                    let range = entries[i].start..entries[i].end;
                    mem.copy(&mut FixedMap, &mut entries[i], CopyFlags::NOCHUNK, range)
                        .expect("copy");
                }
                Op::Drop(i) => {
                    if entries.len() > 1 {
                        let entry = entries.swap_remove(i % entries.len());
                        let amap = entry.aref.expect("aref").amap().clone();
                        mem.unref(&amap, 0, SLOTS, true);
                    }
                }
            }

            let live: BTreeMap<_, Arc<Amap>> = entries
                .iter()
                .map(|e| {
                    let amap = e.aref.as_ref().expect("aref").amap().clone();
                    (amap.id(), amap)
                })
                .collect();
            let mut holders: BTreeMap<_, usize> = BTreeMap::new();
            for amap in live.values() {
                amap.validate();
                let refs = entries
                    .iter()
                    .filter(|e| Arc::ptr_eq(e.aref.as_ref().expect("aref").amap(), amap))
                    .count();
                prop_assert_eq!(amap.ref_count() as usize, refs);
                for (_, id) in amap.snapshot().anons {
                    *holders.entry(id).or_default() += 1;
                }
            }
            for anon in &anons {
                let held = holders.get(&anon.id()).copied().unwrap_or(0);
                prop_assert_eq!(anon.ref_count(), held + 1);
            }
            let registered: BTreeSet<_> = mem.registry().ids().into_iter().collect();
            let expected: BTreeSet<_> = live.keys().copied().collect();
            prop_assert_eq!(registered, expected);
        }
    }

    #[test]
    fn copy_preserves_source_mapping(
        populated in prop::collection::btree_set(0..SLOTS, 0..SLOTS),
        (offset, pages) in (0..SLOTS).prop_flat_map(|o| (Just(o), 1..=(SLOTS - o))),
    ) {
        let (host, mem) = setup();
        let src = mem.alloc(SLOTS, 0, WaitPolicy::MayBlock).expect("alloc");
        let aref = Aref::new(src.clone(), 0);
        let _anons: Vec<AnonRef> = populated
            .iter()
            .map(|&slot| {
                let anon = host.resident_anon(slot as u64);
                mem.add(&aref, slot * PAGE, &anon, false);
                anon
            })
            .collect();
        mem.amap_ref(&src, 0, SLOTS, RefFlags::SHARED | RefFlags::ALL);
        let before = src.snapshot();

        let mut entry = MapEntry::new(offset * PAGE, (offset + pages) * PAGE, Prot::READ)
            .with_aref(Aref::new(src.clone(), offset));
        let range = entry.start..entry.end;
        mem.copy(&mut FixedMap, &mut entry, CopyFlags::empty(), range).expect("copy");

        let after = src.snapshot();
        prop_assert_eq!(&after.anons, &before.anons);
        prop_assert_eq!(after.ref_count, before.ref_count - 1);

        let copy = entry.aref.as_ref().expect("aref").amap().snapshot();
        let window: Vec<_> = before
            .anons
            .iter()
            .filter(|(slot, _)| (offset..offset + pages).contains(slot))
            .map(|(slot, id)| (slot - offset, *id))
            .collect();
        prop_assert_eq!(copy.anons, window);
        prop_assert_eq!(copy.n_slots, pages);
    }
}
