// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Copy-on-write: clearing `needs_copy`, eager copies for wired entries, and splitting
//! references when the map layer clips an entry.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Range;

use crate::entry::{Aref, EntryMap, MapEntry};
use crate::error::Result;
use crate::flags::{AmapFlags, CopyFlags, WaitPolicy};
use crate::memory::AnonMemory;
use crate::ppref::PpRef;

impl AnonMemory {
    /// Gives `entry` an amap it owns alone, so a write fault can proceed.
    ///
    /// `range` is the faulting address range; a large entry without an amap is clipped
    /// to the chunk around it unless [`CopyFlags::NOCHUNK`] is given.
    pub fn copy(
        &self,
        map: &mut dyn EntryMap,
        entry: &mut MapEntry,
        flags: CopyFlags,
        range: Range<usize>,
    ) -> Result<()> {
        let wait = WaitPolicy::from_nowait(flags.contains(CopyFlags::NOWAIT));
        let (src, src_off) = match entry.aref.as_ref() {
            Some(aref) => (aref.amap().clone(), aref.page_offset()),
            None => return self.copy_fresh(map, entry, flags, range, wait),
        };

        if src.ref_count() == 1 {
            let _st = src.lock();
            if src.ref_count() == 1 {
                entry.needs_copy = false;
                return Ok(());
            }
        }

        let slots = entry.slots(self);
        let fresh = self.alloc1(slots, 0, wait)?;
        let mut tofree = Vec::new();
        {
            let mut st = src.lock();
            if src.ref_count() == 1 {
                // The other references went away while we allocated.
                drop(st);
                fresh.set_refs(0);
                self.free(&fresh);
                entry.needs_copy = false;
                log::trace!(target: "amap", "copy: took over {}", src.id());
                return Ok(());
            }
            assert!(
                src_off + slots <= st.n_slots,
                "{}: entry of {slots} slots at {src_off} beyond {} slots",
                src.id(),
                st.n_slots
            );
            {
                let mut dst = fresh.lock();
                for lcv in 0..slots {
                    if let Some(anon) = &st.arrays.anon[src_off + lcv] {
                        dst.insert_slot(lcv, anon.clone());
                    }
                }
            }
            let refs = src.ref_count() - 1;
            src.set_refs(refs);
            if refs == 1 {
                st.flags.remove(AmapFlags::SHARED);
            }
            self.pp_adjref(&mut st, src_off, slots, -1, &mut tofree);
        }
        drop(tofree);

        log::debug!(
            target: "amap",
            "copy {} [{src_off}, +{slots}) -> {} ({} anons)",
            src.id(),
            fresh.id(),
            fresh.n_used()
        );
        self.registry().insert(&fresh);
        entry.aref = Some(Aref::new(fresh, 0));
        entry.needs_copy = false;
        Ok(())
    }

    fn copy_fresh(
        &self,
        map: &mut dyn EntryMap,
        entry: &mut MapEntry,
        flags: CopyFlags,
        range: Range<usize>,
        wait: WaitPolicy,
    ) -> Result<()> {
        if !flags.contains(CopyFlags::NOCHUNK) && entry.slots(self) >= self.config().large_slots {
            let chunk = self.config().chunk_bytes();
            let start = range.start / chunk * chunk;
            let end = (range.end / chunk + usize::from(range.end % chunk != 0)).checked_mul(chunk);
            if start > entry.start {
                map.clip_start(self, entry, start);
            }
            if let Some(end) = end.filter(|&end| end >= start && end < entry.end) {
                map.clip_end(self, entry, end);
            }
            log::trace!(target: "amap", "copy: chunked to [{:#x}, {:#x})", entry.start, entry.end);
        }
        if !flags.contains(CopyFlags::NOMERGE) && map.try_merge(self, entry) {
            return Ok(());
        }
        let amap = self.alloc(entry.slots(self), 0, wait)?;
        entry.aref = Some(Aref::new(amap, 0));
        entry.needs_copy = false;
        Ok(())
    }

    /// Breaks sharing of every anon of a wired entry's amap by copying its page.
    pub fn cow_now(&self, entry: &MapEntry) {
        let Some(aref) = entry.aref.as_ref() else {
            return;
        };
        let amap = aref.amap();
        let mut released = Vec::new();
        'restart: loop {
            let mut st = amap.lock();
            let mut i = 0;
            while i < st.n_used() {
                let slot = st.arrays.slots[i];
                i += 1;
                let page = {
                    let Some(anon) = st.arrays.anon[slot].as_ref() else {
                        panic!("{}: dense entry names empty slot {slot}", amap.id());
                    };
                    if anon.ref_count() == 1 {
                        continue;
                    }
                    match anon.page() {
                        Some(page) => page,
                        None => panic!("{}: wired {} is not resident", amap.id(), anon.id()),
                    }
                };
                if page.is_loaned() {
                    continue;
                }
                if page.is_busy() {
                    drop(st);
                    log::trace!(
                        target: "amap",
                        "cow_now {}: page {:#x} busy",
                        amap.id(),
                        page.frame()
                    );
                    self.backend().wait_page(&page);
                    continue 'restart;
                }
                let nanon = self.backend().alloc_anon();
                let npage = nanon.as_ref().and_then(|_| self.backend().alloc_page());
                let (nanon, npage) = match (nanon, npage) {
                    (Some(nanon), Some(npage)) => (nanon, npage),
                    (nanon, _) => {
                        drop(st);
                        drop(nanon);
                        log::warn!(target: "amap", "cow_now {}: out of memory, waiting", amap.id());
                        self.backend().wait_memory();
                        continue 'restart;
                    }
                };
                self.backend().copy_page(&page, &npage);
                npage.set_busy(false);
                let stale = nanon.install_page(npage);
                assert!(stale.is_none(), "fresh {} already resident", nanon.id());
                released.push(st.replace_slot(slot, nanon));
            }
            break;
        }
        log::trace!(target: "amap", "cow_now {}: {} anons copied", amap.id(), released.len());
        drop(released);
    }

    /// Makes `split` a second reference to `orig`'s amap starting `offset` bytes into
    /// `orig`. Used when the map layer clips an entry in two.
    pub fn splitref(&self, orig: &Aref, split: &mut Aref, offset: usize) {
        assert!(
            Arc::ptr_eq(orig.amap(), split.amap()),
            "splitref across {} and {}",
            orig.amap().id(),
            split.amap().id()
        );
        let left = self.config().bytes_to_slots(offset);
        assert!(left > 0, "splitref at offset 0");
        let amap = orig.amap();
        let mut st = amap.lock();
        assert!(
            orig.page_offset() + left < st.n_slots,
            "{}: split at slot {} beyond {} slots",
            amap.id(),
            orig.page_offset() + left,
            st.n_slots
        );
        if st.ppref == PpRef::Unset {
            self.pp_establish(amap, &mut st);
        }
        amap.set_refs(amap.ref_count() + 1);
        split.set_page_offset(orig.page_offset() + left);
        log::trace!(
            target: "amap",
            "splitref {} at slot {} -> {} refs",
            amap.id(),
            orig.page_offset() + left,
            amap.ref_count()
        );
    }
}
