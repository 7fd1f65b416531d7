// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Protection changes on shared amaps.

use crate::entry::MapEntry;
use crate::flags::{AmapFlags, Prot};
use crate::memory::AnonMemory;

impl AnonMemory {
    /// Pushes `prot` to every resident page the entry maps, if its amap is shared.
    /// Returns the number of pages touched.
    pub fn share_protect(&self, entry: &MapEntry, prot: Prot) -> usize {
        let Some(aref) = entry.aref.as_ref() else {
            return 0;
        };
        let amap = aref.amap();
        let st = amap.lock();
        if !st.flags.contains(AmapFlags::SHARED) {
            return 0;
        }
        let start = aref.page_offset();
        let stop = start + entry.slots(self);
        let arrays = &st.arrays;
        let mut touched = 0;
        let mut protect = |slot: usize| {
            if let Some(page) = arrays.anon[slot].as_ref().and_then(|anon| anon.page()) {
                self.backend().page_protect(&page, prot);
                touched += 1;
            }
        };
        if stop - start < st.n_used() {
            (start..stop).for_each(&mut protect);
        } else {
            arrays
                .slots
                .iter()
                .copied()
                .filter(|slot| (start..stop).contains(slot))
                .for_each(&mut protect);
        }
        log::trace!(target: "amap", "{}: protect {touched} pages {prot:?}", amap.id());
        touched
    }
}
