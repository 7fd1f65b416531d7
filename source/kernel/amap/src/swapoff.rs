// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Swap-device removal: page in every anon whose swap slot lies on the device.
//!
//! The registry lock is never held while waiting for an amap lock; the walker only
//! try-locks and backs off. While an anon is paged in its amap carries `SWAPOFF`, which
//! makes a concurrent last `unref` leave the wipeout to the walker. Walkers may overlap;
//! the flag stays up until the last of them is done, and that one finishes the wipeout.

use core::ops::Range;

use spin::MutexGuard;

use crate::amap::{Amap, AmapState};
use crate::error::PageinError;
use crate::flags::AmapFlags;
use crate::memory::AnonMemory;
use crate::registry::Cursor;

impl AmapState {
    pub(crate) fn enter_swapoff(&mut self) {
        self.swapoff_walkers += 1;
        self.flags.insert(AmapFlags::SWAPOFF);
    }

    /// Returns `true` when the caller was the last walker.
    pub(crate) fn leave_swapoff(&mut self) -> bool {
        assert!(self.swapoff_walkers > 0, "swap-off walker left without entering");
        self.swapoff_walkers -= 1;
        if self.swapoff_walkers > 0 {
            return false;
        }
        self.flags.remove(AmapFlags::SWAPOFF);
        true
    }
}

impl AnonMemory {
    /// Pages in every anon whose swap slot is in `range`. Stops at the first pagein error.
    pub fn swap_off(&self, range: Range<u32>) -> Result<(), PageinError> {
        log::debug!(target: "amap::swapoff", "swap-off [{}, {})", range.start, range.end);
        let mut cursor = Cursor::start();
        loop {
            let members = self.registry().lock();
            let Some(amap) = cursor.peek(&members) else {
                return Ok(());
            };
            let Some(st) = amap.try_lock() else {
                drop(members);
                self.backend().pause();
                continue;
            };
            drop(members);
            cursor.advance(amap.id());
            self.swap_off_amap(&amap, st, &range)?;
        }
    }

    fn swap_off_amap<'a>(
        &self,
        amap: &'a Amap,
        mut st: MutexGuard<'a, AmapState>,
        range: &Range<u32>,
    ) -> Result<(), PageinError> {
        let mut i = 0;
        while i < st.n_used() {
            let slot = st.arrays.slots[i];
            let anon = match &st.arrays.anon[slot] {
                Some(anon) => anon.clone(),
                None => panic!("{}: dense entry names empty slot {slot}", amap.id()),
            };
            if !anon.swap_slot().is_some_and(|swap| range.contains(&swap.to_raw())) {
                i += 1;
                continue;
            }
            st.enter_swapoff();
            drop(st);
            let rv = self.backend().pagein(&anon);
            drop(anon);
            st = amap.lock();
            let last = st.leave_swapoff();
            if amap.ref_count() == 0 {
                // Whoever leaves last finishes the wipeout deferred by `unref`.
                if last {
                    let tofree = self.wipeout_locked(amap, &mut st);
                    drop(st);
                    drop(tofree);
                }
                return rv;
            }
            if let Err(err) = rv {
                log::warn!(
                    target: "amap::swapoff",
                    "{}: pagein of slot {slot} failed: {err}",
                    amap.id()
                );
                return Err(err);
            }
            // The amap may have changed while unlocked.
            i = 0;
        }
        Ok(())
    }
}
