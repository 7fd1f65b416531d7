// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: The amap store and the operations that mutate it
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Amap, AmapId, AmapSnapshot; operations are methods on AnonMemory
//! DEPENDS_ON: anon, ppref, registry, backend
//! INVARIANTS: slots[back_ptr[s]] == s for every populated s; anon[s] populated iff s is
//!             listed in slots; ref_count 0 implies no populated slot unless SWAPOFF is set
//!
//! Layout: `anon` and `back_ptr` are indexed by slot and sized to `max_slots`; `slots` is
//! the dense list of populated slot numbers. Removing a slot moves the last dense entry
//! into the hole and patches its back pointer.

use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::{Mutex, MutexGuard};

use crate::anon::{AnonId, AnonRef};
use crate::flags::AmapFlags;
use crate::ppref::PpRef;

mod cow;
mod extend;
mod lifecycle;
mod protect;
mod refs;
mod slots;

/// Identity of an amap; also its registry key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AmapId(pub(crate) u64);

impl AmapId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AmapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "amap#{}", self.0)
    }
}

/// Backing arrays of an amap.
#[derive(Default)]
pub(crate) struct SlotArrays {
    pub(crate) slots: Vec<usize>,
    pub(crate) back_ptr: Vec<usize>,
    pub(crate) anon: Vec<Option<AnonRef>>,
}

pub(crate) struct AmapState {
    pub(crate) flags: AmapFlags,
    pub(crate) n_slots: usize,
    pub(crate) arrays: SlotArrays,
    pub(crate) ppref: PpRef,
    /// Swap-off walkers currently paging in from this amap; `SWAPOFF` is set while
    /// non-zero.
    pub(crate) swapoff_walkers: u32,
    /// Arrays released by `free`; any further use is a bug.
    pub(crate) dead: bool,
}

impl AmapState {
    pub(crate) fn max_slots(&self) -> usize {
        self.arrays.anon.len()
    }

    pub(crate) fn n_used(&self) -> usize {
        self.arrays.slots.len()
    }

    fn check_invariants(&self, id: AmapId, refs: u32) {
        if self.dead {
            assert_eq!(self.n_used(), 0, "{id} freed with populated slots");
            return;
        }
        let arrays = &self.arrays;
        let max = self.max_slots();
        assert!(self.n_slots <= max, "{id}: n_slots {} beyond capacity {max}", self.n_slots);
        assert_eq!(arrays.back_ptr.len(), max, "{id}: back_ptr length");
        assert!(self.n_used() <= self.n_slots, "{id}: more populated slots than slots");
        for (i, &slot) in arrays.slots.iter().enumerate() {
            assert!(slot < self.n_slots, "{id}: populated slot {slot} beyond n_slots");
            assert!(arrays.anon[slot].is_some(), "{id}: dense entry {i} names empty slot {slot}");
            assert_eq!(arrays.back_ptr[slot], i, "{id}: back_ptr[{slot}] does not point at {i}");
        }
        let populated = arrays.anon.iter().filter(|anon| anon.is_some()).count();
        assert_eq!(populated, self.n_used(), "{id}: anon array and dense list disagree");
        assert_eq!(
            self.flags.contains(AmapFlags::SWAPOFF),
            self.swapoff_walkers > 0,
            "{id}: SWAPOFF out of step with {} walkers",
            self.swapoff_walkers
        );
        if refs == 0 && !self.flags.contains(AmapFlags::SWAPOFF) {
            assert_eq!(self.n_used(), 0, "{id}: unreferenced amap still holds anons");
        }
        assert!(
            !(refs == 1 && self.flags.contains(AmapFlags::SHARED)),
            "{id}: SHARED set with a single reference"
        );
        if let PpRef::Active(table) = &self.ppref {
            table.check(max);
        }
    }
}

/// Anonymous memory map.
pub struct Amap {
    id: AmapId,
    /// Whole-map reference count; written only with `state` locked.
    refs: AtomicU32,
    state: Mutex<AmapState>,
}

impl Amap {
    pub(crate) fn new(id: AmapId, n_slots: usize, arrays: SlotArrays) -> Self {
        Self {
            id,
            refs: AtomicU32::new(1),
            state: Mutex::new(AmapState {
                flags: AmapFlags::empty(),
                n_slots,
                arrays,
                ppref: PpRef::Unset,
                swapoff_walkers: 0,
                dead: false,
            }),
        }
    }

    pub fn id(&self) -> AmapId {
        self.id
    }

    /// Number of arefs pointing at this amap. Without the lock this is only a hint.
    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Caller holds the amap lock.
    pub(crate) fn set_refs(&self, refs: u32) {
        self.refs.store(refs, Ordering::Release);
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, AmapState> {
        self.state.lock()
    }

    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, AmapState>> {
        self.state.try_lock()
    }

    pub fn flags(&self) -> AmapFlags {
        self.lock().flags
    }

    pub fn n_slots(&self) -> usize {
        self.lock().n_slots
    }

    pub fn max_slots(&self) -> usize {
        self.lock().max_slots()
    }

    pub fn n_used(&self) -> usize {
        self.lock().n_used()
    }

    pub fn is_freed(&self) -> bool {
        self.lock().dead
    }

    /// Consistent copy of the amap's bookkeeping.
    pub fn snapshot(&self) -> AmapSnapshot {
        let st = self.lock();
        AmapSnapshot {
            id: self.id,
            ref_count: self.ref_count(),
            flags: st.flags,
            n_slots: st.n_slots,
            max_slots: st.max_slots(),
            slots: st.arrays.slots.clone(),
            anons: st
                .arrays
                .anon
                .iter()
                .enumerate()
                .filter_map(|(slot, anon)| anon.as_ref().map(|anon| (slot, anon.id())))
                .collect(),
            ppref: st.ppref.clone(),
        }
    }

    /// Panics if any structural invariant is violated.
    pub fn validate(&self) {
        let st = self.lock();
        st.check_invariants(self.id, self.ref_count());
    }
}

impl fmt::Debug for Amap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Amap").field("id", &self.id).field("refs", &self.ref_count()).finish()
    }
}

/// Point-in-time view of an amap, for diagnostics and tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AmapSnapshot {
    pub id: AmapId,
    pub ref_count: u32,
    pub flags: AmapFlags,
    pub n_slots: usize,
    pub max_slots: usize,
    /// Dense list of populated slots, in internal order.
    pub slots: Vec<usize>,
    /// Populated slots and their anons, by ascending slot.
    pub anons: Vec<(usize, AnonId)>,
    pub ppref: PpRef,
}

impl AmapSnapshot {
    pub fn n_used(&self) -> usize {
        self.slots.len()
    }

    pub fn anon_at(&self, slot: usize) -> Option<AnonId> {
        self.anons.iter().find(|(s, _)| *s == slot).map(|(_, id)| *id)
    }
}

// Amaps are shared across CPUs through `Arc`.
static_assertions::assert_impl_all!(Amap: Send, Sync);

#[cfg(test)]
mod tests_prop;
