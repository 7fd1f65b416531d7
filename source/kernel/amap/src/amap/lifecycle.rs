// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Creation and destruction of amaps.

use alloc::sync::Arc;

use super::{Amap, AmapState, SlotArrays};
use crate::error::Result;
use crate::flags::WaitPolicy;
use crate::memory::AnonMemory;
use crate::ppref::PpRef;

impl AnonMemory {
    /// Allocates and registers an amap of `size_slots` slots with room to grow by
    /// `pad_slots`. The new amap holds one reference.
    pub fn alloc(
        &self,
        size_slots: usize,
        pad_slots: usize,
        wait: WaitPolicy,
    ) -> Result<Arc<Amap>> {
        let amap = self.alloc1(size_slots, pad_slots, wait)?;
        self.registry().insert(&amap);
        Ok(amap)
    }

    /// Like [`AnonMemory::alloc`] but leaves the amap out of the registry.
    pub(crate) fn alloc1(
        &self,
        size_slots: usize,
        pad_slots: usize,
        wait: WaitPolicy,
    ) -> Result<Arc<Amap>> {
        let max_slots = self.config().roundup_slots(size_slots + pad_slots);
        let arrays = self.alloc_arrays(max_slots, wait)?;
        let amap = Arc::new(Amap::new(self.next_amap_id(), size_slots, arrays));
        log::debug!(
            target: "amap",
            "alloc {}: {size_slots} slots, capacity {max_slots}",
            amap.id()
        );
        Ok(amap)
    }

    /// Allocates the three backing arrays. Arrays obtained before a failure are released
    /// on the way out.
    pub(crate) fn alloc_arrays(&self, max_slots: usize, wait: WaitPolicy) -> Result<SlotArrays> {
        let arrays = self.try_arrays(max_slots);
        if let Err(err) = &arrays {
            log::warn!(target: "amap", "array allocation of {max_slots} slots failed: {err}");
            if wait == WaitPolicy::MustNotBlock {
                self.note_low_memory();
            }
        }
        arrays
    }

    fn try_arrays(&self, max_slots: usize) -> Result<SlotArrays> {
        Ok(SlotArrays {
            slots: self.try_vec_with_capacity(max_slots)?,
            back_ptr: self.try_vec(max_slots, 0)?,
            anon: self.try_vec(max_slots, None)?,
        })
    }

    /// Releases the arrays of an amap that has no references and no anons left.
    pub fn free(&self, amap: &Amap) {
        let mut st = amap.lock();
        self.free_locked(amap, &mut st);
    }

    pub(crate) fn free_locked(&self, amap: &Amap, st: &mut AmapState) {
        assert!(!st.dead, "{} freed twice", amap.id());
        assert_eq!(amap.ref_count(), 0, "{} freed while referenced", amap.id());
        assert_eq!(st.n_used(), 0, "{} freed with populated slots", amap.id());
        st.arrays = SlotArrays::default();
        st.ppref = PpRef::Unset;
        st.n_slots = 0;
        st.dead = true;
        log::debug!(target: "amap", "free {}", amap.id());
    }
}
