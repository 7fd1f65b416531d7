// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Growing an amap with its map entry.
//!
//! Three cases, cheapest first: the slots already exist, the arrays have slack, or the
//! arrays are reallocated. Reallocation happens with the amap unlocked; the layout is
//! re-checked once the lock is taken again.

use alloc::vec::Vec;

use super::{Amap, AmapState, SlotArrays};
use crate::anon::AnonRef;
use crate::entry::{Aref, MapEntry};
use crate::error::{AmapError, Result};
use crate::flags::{ExtendFlags, WaitPolicy};
use crate::memory::AnonMemory;
use crate::ppref::{PpRef, PpRefTable};

/// Geometry of one extend request, in slots.
#[derive(Clone, Copy, Debug)]
struct Request {
    forwards: bool,
    mapped: usize,
    add: usize,
}

impl Request {
    fn need(&self, slotoff: usize) -> usize {
        if self.forwards {
            slotoff + self.mapped + self.add
        } else {
            self.add + self.mapped
        }
    }
}

impl AnonMemory {
    /// Grows the entry's amap by `add_bytes`, after the mapping with
    /// [`ExtendFlags::FORWARDS`] or before it with [`ExtendFlags::BACKWARDS`].
    ///
    /// The entry must hold the only reference to its amap.
    pub fn extend(&self, entry: &mut MapEntry, add_bytes: usize, flags: ExtendFlags) -> Result<()> {
        let forwards = flags.contains(ExtendFlags::FORWARDS);
        assert!(
            forwards != flags.contains(ExtendFlags::BACKWARDS),
            "extend needs exactly one direction, got {flags:?}"
        );
        let req = Request {
            forwards,
            mapped: entry.slots(self),
            add: self.config().bytes_to_slots(add_bytes),
        };
        let wait = WaitPolicy::from_nowait(flags.contains(ExtendFlags::NOWAIT));
        let (start, end) = (entry.start, entry.end);
        let Some(aref) = entry.aref.as_mut() else {
            panic!("extend of entry [{start:#x}, {end:#x}) without amap");
        };
        let amap = aref.amap().clone();
        let mut tofree = Vec::new();
        let result = self.extend_amap(&amap, aref, req, wait, &mut tofree);
        drop(tofree);
        result
    }

    fn extend_amap(
        &self,
        amap: &Amap,
        aref: &mut Aref,
        req: Request,
        wait: WaitPolicy,
        tofree: &mut Vec<AnonRef>,
    ) -> Result<()> {
        let mut st = amap.lock();
        assert_eq!(amap.ref_count(), 1, "{} extended while shared", amap.id());

        if st.ppref == PpRef::Disabled {
            // Nobody can reference slots outside this mapping any more.
            let slotoff = aref.page_offset();
            let tail = slotoff + req.mapped;
            let n_slots = st.n_slots;
            st.wipe_range(0, slotoff, tofree);
            st.wipe_range(tail, n_slots.saturating_sub(tail), tofree);
        }

        loop {
            let slotoff = aref.page_offset();
            let need = req.need(slotoff);

            // Case 1: the slots are already there.
            if req.forwards {
                if st.n_slots >= need {
                    claim(&mut st, slotoff + req.mapped, req.add);
                    log::trace!(
                        target: "amap::extend",
                        "{}: forward in place to {need}",
                        amap.id()
                    );
                    return Ok(());
                }
            } else if req.add <= slotoff {
                let new_off = slotoff - req.add;
                aref.set_page_offset(new_off);
                claim(&mut st, new_off, req.add);
                log::trace!(
                    target: "amap::extend",
                    "{}: backward in place to {new_off}",
                    amap.id()
                );
                return Ok(());
            }

            // Case 2: the arrays have room.
            let max = st.max_slots();
            if max >= need {
                if req.forwards {
                    grow_forward_in_slack(&mut st, slotoff + req.mapped, need);
                } else {
                    let new_off = slide_backward_in_slack(&mut st, slotoff, req);
                    aref.set_page_offset(new_off);
                }
                log::trace!(
                    target: "amap::extend",
                    "{}: used slack, n_slots {} of {max}",
                    amap.id(),
                    st.n_slots
                );
                return Ok(());
            }

            // Case 3: reallocate.
            let limit = self.config().large_slots;
            if need >= limit {
                return Err(AmapError::TooLarge { slots: need, limit });
            }
            let alloc_slots = self.config().roundup_slots(need);
            let want_ppref = st.ppref.is_active();
            drop(st);

            let fresh = self.alloc_arrays(alloc_slots, wait)?;
            let fresh_ppref = if want_ppref {
                match self.alloc_gate().and_then(|()| PpRefTable::try_new(alloc_slots)) {
                    Ok(table) => Some(table),
                    Err(err) => {
                        log::warn!(target: "amap::extend", "{}: ppref lost: {err}", amap.id());
                        None
                    }
                }
            } else {
                None
            };

            st = amap.lock();
            assert_eq!(amap.ref_count(), 1, "{} shared while being extended", amap.id());
            if st.max_slots() >= need {
                // Grown by someone else while unlocked.
                if req.forwards && st.n_slots >= need {
                    return Ok(());
                }
                continue;
            }
            let old_max = st.max_slots();
            if req.forwards {
                install_forward(&mut st, fresh, fresh_ppref, slotoff + req.mapped, need);
            } else {
                let new_off = install_backward(&mut st, fresh, fresh_ppref, slotoff, req);
                aref.set_page_offset(new_off);
            }
            log::debug!(
                target: "amap::extend",
                "{}: reallocated {old_max} -> {alloc_slots} slots",
                amap.id()
            );
            return Ok(());
        }
    }
}

/// Asserts that nothing outside `[slotoff, slotoff + mapped)` is populated.
fn assert_only_mapped(st: &AmapState, slotoff: usize, mapped: usize) {
    assert!(
        st.arrays.slots.iter().all(|slot| (slotoff..slotoff + mapped).contains(slot)),
        "populated slots outside the mapping of a singly referenced amap"
    );
}

/// The sole reference now covers `[start, start + len)`.
fn claim(st: &mut AmapState, start: usize, len: usize) {
    if let Some(table) = st.ppref.table_mut() {
        table.set_reflen(start, 1, len);
    }
}

fn grow_forward_in_slack(st: &mut AmapState, map_end: usize, need: usize) {
    claim(st, map_end, need - map_end);
    st.n_slots = need;
}

/// Moves the mapped window to the end of the arrays and returns the new page offset.
fn slide_backward_in_slack(st: &mut AmapState, slotoff: usize, req: Request) -> usize {
    assert_only_mapped(st, slotoff, req.mapped);
    let max = st.max_slots();
    let area = max - req.mapped;
    let shift = area - slotoff;
    let arrays = &mut st.arrays;
    arrays.anon[slotoff..max].rotate_right(shift);
    arrays.back_ptr.copy_within(slotoff..slotoff + req.mapped, area);
    for slot in &mut arrays.slots {
        *slot += shift;
    }
    if let Some(table) = st.ppref.table_mut() {
        table.relocate(slotoff, req.mapped, area);
        table.set_reflen(area - req.add, 1, req.add);
    }
    st.n_slots = max;
    area - req.add
}

fn install_ppref(
    st: &mut AmapState,
    fresh: Option<PpRefTable>,
    fill: impl FnOnce(&PpRefTable, &mut PpRefTable),
) {
    st.ppref = match (core::mem::take(&mut st.ppref), fresh) {
        (PpRef::Active(old), Some(mut new)) => {
            fill(&old, &mut new);
            PpRef::Active(new)
        }
        (PpRef::Active(_), None) => PpRef::Disabled,
        (other, _) => other,
    };
}

fn install_forward(
    st: &mut AmapState,
    mut fresh: SlotArrays,
    fresh_ppref: Option<PpRefTable>,
    map_end: usize,
    need: usize,
) {
    let old = &mut st.arrays;
    for (dst, src) in fresh.anon.iter_mut().zip(old.anon.iter_mut()) {
        *dst = src.take();
    }
    fresh.back_ptr[..old.back_ptr.len()].copy_from_slice(&old.back_ptr);
    fresh.slots.extend_from_slice(&old.slots);
    install_ppref(st, fresh_ppref, |prev, next| {
        next.copy_from(prev, 0, prev.cover(), 0);
        next.set_reflen(map_end, 1, need - map_end);
    });
    st.arrays = fresh;
    st.n_slots = need;
}

/// Copies the mapped window to the end of the new arrays and returns the new page offset.
fn install_backward(
    st: &mut AmapState,
    mut fresh: SlotArrays,
    fresh_ppref: Option<PpRefTable>,
    slotoff: usize,
    req: Request,
) -> usize {
    assert_only_mapped(st, slotoff, req.mapped);
    let alloc_slots = fresh.anon.len();
    let area = alloc_slots - req.mapped;
    let shift = area - slotoff;
    let old = &mut st.arrays;
    for i in 0..req.mapped {
        fresh.anon[area + i] = old.anon[slotoff + i].take();
        fresh.back_ptr[area + i] = old.back_ptr[slotoff + i];
    }
    fresh.slots.extend(old.slots.iter().map(|slot| slot + shift));
    install_ppref(st, fresh_ppref, |prev, next| {
        next.copy_from(prev, slotoff, req.mapped, area);
        next.set_reflen(area - req.add, 1, req.add);
    });
    st.arrays = fresh;
    st.n_slots = alloc_slots;
    area - req.add
}
