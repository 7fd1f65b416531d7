// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Slot table: dense/sparse bookkeeping of populated slots.

use alloc::vec::Vec;

use super::AmapState;
use crate::anon::AnonRef;
use crate::entry::Aref;
use crate::flags::{AmapFlags, Prot};
use crate::memory::AnonMemory;

impl AmapState {
    pub(crate) fn insert_slot(&mut self, slot: usize, anon: AnonRef) {
        let arrays = &mut self.arrays;
        assert!(arrays.anon[slot].is_none(), "slot {slot} already populated");
        arrays.back_ptr[slot] = arrays.slots.len();
        arrays.slots.push(slot);
        arrays.anon[slot] = Some(anon);
    }

    pub(crate) fn replace_slot(&mut self, slot: usize, anon: AnonRef) -> AnonRef {
        match self.arrays.anon[slot].replace(anon) {
            Some(old) => old,
            None => panic!("replacing empty slot {slot}"),
        }
    }

    pub(crate) fn remove_slot(&mut self, slot: usize) -> AnonRef {
        let arrays = &mut self.arrays;
        let anon = match arrays.anon[slot].take() {
            Some(anon) => anon,
            None => panic!("removing empty slot {slot}"),
        };
        let ptr = arrays.back_ptr[slot];
        let removed = arrays.slots.swap_remove(ptr);
        assert_eq!(removed, slot, "back_ptr[{slot}] points at slot {removed}");
        if let Some(&moved) = arrays.slots.get(ptr) {
            arrays.back_ptr[moved] = ptr;
        }
        anon
    }

    /// Removes every populated slot of `[start, start + len)`, collecting the references
    /// in `tofree`.
    pub(crate) fn wipe_range(&mut self, start: usize, len: usize, tofree: &mut Vec<AnonRef>) {
        let end = start + len;
        assert!(end <= self.max_slots(), "wipe [{start}, {end}) beyond capacity");
        if len < self.n_used() {
            for slot in start..end {
                if self.arrays.anon[slot].is_some() {
                    tofree.push(self.remove_slot(slot));
                }
            }
        } else {
            let mut i = 0;
            while i < self.n_used() {
                let slot = self.arrays.slots[i];
                if (start..end).contains(&slot) {
                    // The last dense entry moves into `i`; look at it next.
                    tofree.push(self.remove_slot(slot));
                } else {
                    i += 1;
                }
            }
        }
    }

    pub(crate) fn drain_all(&mut self, tofree: &mut Vec<AnonRef>) {
        while let Some(&slot) = self.arrays.slots.last() {
            tofree.push(self.remove_slot(slot));
        }
    }
}

impl AnonMemory {
    fn slot_of(&self, aref: &Aref, offset: usize) -> usize {
        aref.page_offset() + self.config().bytes_to_slots(offset)
    }

    /// Anon mapped at byte `offset` of the aref, if any.
    pub fn lookup(&self, aref: &Aref, offset: usize) -> Option<AnonRef> {
        let slot = self.slot_of(aref, offset);
        let st = aref.amap().lock();
        assert!(slot < st.n_slots, "lookup of slot {slot} beyond {} slots", st.n_slots);
        st.arrays.anon[slot].clone()
    }

    /// Anons of `npages` consecutive slots starting at byte `offset`.
    pub fn lookups(&self, aref: &Aref, offset: usize, npages: usize) -> Vec<Option<AnonRef>> {
        let slot = self.slot_of(aref, offset);
        let st = aref.amap().lock();
        assert!(
            slot + npages <= st.n_slots,
            "lookup of [{slot}, {}) beyond {} slots",
            slot + npages,
            st.n_slots
        );
        st.arrays.anon[slot..slot + npages].to_vec()
    }

    /// Installs a reference to `anon` at byte `offset`. With `replace` the slot must be
    /// populated and the displaced reference is returned; otherwise it must be empty.
    pub fn add(
        &self,
        aref: &Aref,
        offset: usize,
        anon: &AnonRef,
        replace: bool,
    ) -> Option<AnonRef> {
        let slot = self.slot_of(aref, offset);
        let amap = aref.amap();
        let mut st = amap.lock();
        assert!(slot < st.n_slots, "add at slot {slot} beyond {} slots", st.n_slots);
        if replace {
            let shared = st.flags.contains(AmapFlags::SHARED);
            let old_page = match &st.arrays.anon[slot] {
                Some(old) => old.page(),
                None => panic!("{}: replacing empty slot {slot}", amap.id()),
            };
            // Other sharers may still map the old page.
            if let (true, Some(page)) = (shared, old_page) {
                self.backend().page_protect(&page, Prot::NONE);
            }
            log::trace!(target: "amap", "{}: replace slot {slot} with {}", amap.id(), anon.id());
            Some(st.replace_slot(slot, anon.clone()))
        } else {
            log::trace!(target: "amap", "{}: add {} at slot {slot}", amap.id(), anon.id());
            st.insert_slot(slot, anon.clone());
            None
        }
    }

    /// Removes and returns the anon at byte `offset`.
    pub fn unadd(&self, aref: &Aref, offset: usize) -> AnonRef {
        let slot = self.slot_of(aref, offset);
        let amap = aref.amap();
        let mut st = amap.lock();
        assert!(slot < st.n_slots, "unadd at slot {slot} beyond {} slots", st.n_slots);
        log::trace!(target: "amap", "{}: unadd slot {slot}", amap.id());
        st.remove_slot(slot)
    }
}
