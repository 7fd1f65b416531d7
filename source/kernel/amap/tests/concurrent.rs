// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Stress test for amap locking under concurrent extend, sharing and swap-off
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! TEST_COVERAGE: 1 integration test
//!
//! TEST_SCOPE:
//!   - Extend reallocating while swap-off walks the registry
//!   - Reference churn on a shared amap during the walk
//!   - Structural invariants hold once every thread has finished
//!
//! TEST_SCENARIOS:
//!   - extend_share_and_swap_off_race(): four growers, one sharer, one swap-off walker
#![cfg(feature = "backend-host")]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use neuron_amap::host::HostBackend;
use neuron_amap::{
    AmapConfig, AnonMemory, AnonRef, Aref, ExtendFlags, MapEntry, Prot, RefFlags, WaitPolicy,
};

const PAGE: usize = 4096;
const GROWERS: u32 = 4;
const GROWTH: usize = 48;

#[test]
fn extend_share_and_swap_off_race() {
    let host = HostBackend::new();
    let mem = Arc::new(AnonMemory::new(AmapConfig::new(), host.clone()).expect("config"));
    let done = Arc::new(AtomicBool::new(false));

    let growers: Vec<_> = (0..GROWERS)
        .map(|t| {
            let (host, mem) = (host.clone(), mem.clone());
            thread::spawn(move || {
                let amap = mem.alloc(1, 0, WaitPolicy::MayBlock).expect("alloc");
                let mut entry =
                    MapEntry::new(0, PAGE, Prot::READ | Prot::WRITE).with_aref(Aref::new(amap, 0));
                let mut anons = Vec::new();
                for i in 0..GROWTH {
                    if i > 0 {
                        mem.extend(&mut entry, PAGE, ExtendFlags::FORWARDS).expect("extend");
                        entry.end += PAGE;
                    }
                    let slot = t * 1000 + i as u32 + 1;
                    let anon = host.swapped_anon(slot, u64::from(slot));
                    mem.add(entry.aref.as_ref().expect("aref"), i * PAGE, &anon, false);
                    anons.push(anon);
                }
                (entry, anons)
            })
        })
        .collect();

    let sharer = {
        let (host, mem, done) = (host.clone(), mem.clone(), done.clone());
        thread::spawn(move || {
            let amap = mem.alloc(8, 0, WaitPolicy::MayBlock).expect("alloc");
            let anon = host.resident_anon(1);
            mem.add(&Aref::new(amap.clone(), 0), 0, &anon, false);
            let mut rounds = 0u32;
            while !done.load(Ordering::Acquire) || rounds < 100 {
                mem.amap_ref(&amap, 0, 8, RefFlags::SHARED | RefFlags::ALL);
                mem.unref(&amap, 0, 8, true);
                rounds += 1;
            }
            (amap, anon)
        })
    };

    let walker = {
        let (mem, done) = (mem.clone(), done.clone());
        thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                mem.swap_off(1..u32::MAX).expect("swap-off");
                thread::yield_now();
            }
        })
    };

    let grown: Vec<(MapEntry, Vec<AnonRef>)> =
        growers.into_iter().map(|h| h.join().expect("grower")).collect();
    done.store(true, Ordering::Release);
    walker.join().expect("walker");
    let (shared, shared_anon) = sharer.join().expect("sharer");

    mem.swap_off(1..u32::MAX).expect("final swap-off");
    assert_eq!(host.swap_in_use(), 0);
    assert_eq!(mem.registry().len(), GROWERS as usize + 1);

    for (t, (entry, anons)) in grown.iter().enumerate() {
        let amap = entry.aref.as_ref().expect("aref").amap();
        amap.validate();
        assert_eq!(amap.n_slots(), GROWTH);
        assert_eq!(amap.n_used(), GROWTH);
        for (i, anon) in anons.iter().enumerate() {
            assert_eq!(anon.swap_slot(), None);
            assert_eq!(host.anon_tag(anon), Some((t * 1000 + i + 1) as u64));
            assert_eq!(anon.ref_count(), 2);
        }
    }

    shared.validate();
    assert_eq!(shared.ref_count(), 1);
    assert!(shared.flags().is_empty());
    assert_eq!(shared_anon.ref_count(), 2);
}
