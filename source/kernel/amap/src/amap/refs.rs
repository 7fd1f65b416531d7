// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Whole-map and per-page reference counting.

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::{Amap, AmapState};
use crate::anon::AnonRef;
use crate::flags::{AmapFlags, RefFlags};
use crate::memory::AnonMemory;
use crate::ppref::{PpRef, PpRefTable};

impl AnonMemory {
    /// Switches the amap to per-page counting. Every existing reference covers the whole
    /// amap. On allocation failure per-page counting is disabled for the rest of the
    /// amap's life.
    pub(crate) fn pp_establish(&self, amap: &Amap, st: &mut AmapState) {
        if !self.config().ppref {
            st.ppref = PpRef::Disabled;
            return;
        }
        let table = self.alloc_gate().and_then(|()| {
            PpRefTable::establish(st.n_slots, st.max_slots(), amap.ref_count())
        });
        st.ppref = match table {
            Ok(table) => PpRef::Active(table),
            Err(err) => {
                log::warn!(target: "amap", "{}: ppref disabled: {err}", amap.id());
                PpRef::Disabled
            }
        };
    }

    /// Adds `delta` to the per-page counts of `[start, start + len)` and wipes every slot
    /// whose count reached zero.
    pub(crate) fn pp_adjref(
        &self,
        st: &mut AmapState,
        start: usize,
        len: usize,
        delta: i32,
        tofree: &mut Vec<AnonRef>,
    ) {
        let Some(table) = st.ppref.table_mut() else {
            return;
        };
        for zeroed in table.adjust(start, len, delta) {
            st.wipe_range(zeroed.start, zeroed.len(), tofree);
        }
    }

    fn adjref_anons(
        &self,
        amap: &Amap,
        st: &mut AmapState,
        offset: usize,
        len: usize,
        delta: i32,
        all: bool,
    ) -> Vec<AnonRef> {
        if st.ppref == PpRef::Unset && !all && len != st.n_slots {
            self.pp_establish(amap, st);
        }
        let refs = i64::from(amap.ref_count()) + i64::from(delta);
        assert!(refs >= 0, "{}: reference count underflow", amap.id());
        amap.set_refs(u32::try_from(refs).unwrap_or(u32::MAX));
        let (start, len) = if all { (0, st.n_slots) } else { (offset, len) };
        let mut tofree = Vec::new();
        self.pp_adjref(st, start, len, delta, &mut tofree);
        tofree
    }

    /// Takes a reference covering `len` slots starting at slot `offset`.
    pub fn amap_ref(&self, amap: &Arc<Amap>, offset: usize, len: usize, flags: RefFlags) {
        let mut st = amap.lock();
        if flags.contains(RefFlags::SHARED) {
            st.flags.insert(AmapFlags::SHARED);
        }
        let all = flags.contains(RefFlags::ALL);
        let tofree = self.adjref_anons(amap, &mut st, offset, len, 1, all);
        log::trace!(
            target: "amap",
            "ref {}: [{offset}, +{len}) {:?} -> {}",
            amap.id(),
            flags,
            amap.ref_count()
        );
        drop(st);
        drop(tofree);
    }

    /// Drops a reference covering `len` slots starting at slot `offset`. The last
    /// reference wipes the amap out.
    pub fn unref(&self, amap: &Arc<Amap>, offset: usize, len: usize, all: bool) {
        let mut st = amap.lock();
        let refs = amap.ref_count();
        assert!(refs > 0, "{} unreferenced without references", amap.id());
        let tofree = if refs == 1 {
            amap.set_refs(0);
            self.wipeout_locked(amap, &mut st)
        } else {
            if refs == 2 {
                st.flags.remove(AmapFlags::SHARED);
            }
            self.adjref_anons(amap, &mut st, offset, len, -1, all)
        };
        log::trace!(
            target: "amap",
            "unref {}: [{offset}, +{len}) -> {}, releasing {} anons",
            amap.id(),
            amap.ref_count(),
            tofree.len()
        );
        drop(st);
        drop(tofree);
    }

    /// Destroys an amap whose last reference is gone. Deferred while swap-off holds it.
    pub fn wipeout(&self, amap: &Arc<Amap>) {
        let mut st = amap.lock();
        let tofree = self.wipeout_locked(amap, &mut st);
        drop(st);
        drop(tofree);
    }

    /// Returns the released anon references; drop them after unlocking.
    pub(crate) fn wipeout_locked(&self, amap: &Amap, st: &mut AmapState) -> Vec<AnonRef> {
        assert_eq!(amap.ref_count(), 0, "{} wiped out while referenced", amap.id());
        if st.flags.contains(AmapFlags::SWAPOFF) {
            log::debug!(target: "amap", "wipeout {} deferred to swap-off", amap.id());
            return Vec::new();
        }
        self.registry().remove(amap.id());
        let mut tofree = Vec::new();
        st.drain_all(&mut tofree);
        log::debug!(target: "amap", "wipeout {}: {} anons released", amap.id(), tofree.len());
        self.free_locked(amap, st);
        tofree
    }
}
