// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-page reference counts for partially referenced amaps
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PpRef, PpRefTable, RefRun
//! INVARIANTS: runs are sorted, contiguous from slot 0, non-empty, and no two neighbours
//!             carry the same count; the table covers exactly the amap's backing arrays
//!
//! The table is a run-length encoding of one counter per slot. Every write splits the
//! runs at the affected boundaries, rewrites the counts and merges neighbours again, so
//! the encoding of a given count vector is unique.

use alloc::vec::Vec;
use core::ops::Range;

use crate::error::AmapError;

/// `refs` references on each slot of `[start, start + len)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefRun {
    pub start: usize,
    pub len: usize,
    pub refs: u32,
}

impl RefRun {
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PpRefTable {
    runs: Vec<RefRun>,
}

impl PpRefTable {
    /// Creates a table of `cover` slots, all at zero references.
    pub fn try_new(cover: usize) -> Result<Self, AmapError> {
        let mut runs = Vec::new();
        runs.try_reserve_exact(4)?;
        if cover > 0 {
            runs.push(RefRun { start: 0, len: cover, refs: 0 });
        }
        Ok(Self { runs })
    }

    /// Initial table for an amap that just became partially referenced. Until now every
    /// reference covered the whole amap, so `[0, n_slots)` carries `refs` and the slack
    /// `[n_slots, max_slots)` is unreferenced.
    pub fn establish(n_slots: usize, max_slots: usize, refs: u32) -> Result<Self, AmapError> {
        assert!(
            n_slots <= max_slots,
            "ppref establish out of range: n_slots {n_slots}, max {max_slots}"
        );
        let mut table = Self::try_new(max_slots)?;
        table.set_reflen(0, refs, n_slots);
        Ok(table)
    }

    /// Number of slots described by the table.
    pub fn cover(&self) -> usize {
        self.runs.last().map_or(0, RefRun::end)
    }

    pub fn runs(&self) -> &[RefRun] {
        &self.runs
    }

    /// Count at `slot` and the number of slots from `slot` to the end of its run.
    pub fn get_reflen(&self, slot: usize) -> (u32, usize) {
        let run = self.runs[self.find(slot)];
        (run.refs, run.end() - slot)
    }

    /// Per-slot count, expanded. Intended for diagnostics.
    pub fn refs_at(&self, slot: usize) -> u32 {
        self.get_reflen(slot).0
    }

    /// Assigns `refs` to every slot of `[start, start + len)`.
    pub fn set_reflen(&mut self, start: usize, refs: u32, len: usize) {
        if len == 0 {
            return;
        }
        assert!(
            start + len <= self.cover(),
            "ppref write [{start}, {}) beyond cover {}",
            start + len,
            self.cover()
        );
        let first = self.split(start);
        let last = self.split(start + len);
        self.runs.splice(first..last, core::iter::once(RefRun { start, len, refs }));
        self.coalesce();
    }

    /// Adds `delta` to every slot of `[start, start + len)` and returns the sub-ranges whose
    /// count dropped to zero, merged and in ascending order.
    pub fn adjust(&mut self, start: usize, len: usize, delta: i32) -> Vec<Range<usize>> {
        let mut zeroed: Vec<Range<usize>> = Vec::new();
        if len == 0 || delta == 0 {
            return zeroed;
        }
        assert!(
            start + len <= self.cover(),
            "ppref adjust [{start}, {}) beyond cover {}",
            start + len,
            self.cover()
        );
        let first = self.split(start);
        let last = self.split(start + len);
        for run in &mut self.runs[first..last] {
            let refs = i64::from(run.refs) + i64::from(delta);
            assert!(refs >= 0, "ppref underflow on [{}, {})", run.start, run.end());
            run.refs = u32::try_from(refs).unwrap_or(u32::MAX);
            if run.refs == 0 {
                match zeroed.last_mut() {
                    Some(prev) if prev.end == run.start => prev.end = run.end(),
                    _ => zeroed.push(run.start..run.end()),
                }
            }
        }
        self.coalesce();
        zeroed
    }

    /// Runs overlapping `[start, start + len)`, clipped and rebased to 0.
    pub fn window(&self, start: usize, len: usize) -> Vec<RefRun> {
        let end = start + len;
        self.runs
            .iter()
            .filter(|run| run.end() > start && run.start < end)
            .map(|run| {
                let lo = run.start.max(start);
                let hi = run.end().min(end);
                RefRun { start: lo - start, len: hi - lo, refs: run.refs }
            })
            .collect()
    }

    /// Writes the `[src, src + len)` window of `other` at `dst` of this table.
    pub fn copy_from(&mut self, other: &PpRefTable, src: usize, len: usize, dst: usize) {
        for run in other.window(src, len) {
            self.set_reflen(dst + run.start, run.refs, run.len);
        }
    }

    /// Moves the `[src, src + len)` window to `dst`; every other slot becomes unreferenced.
    pub fn relocate(&mut self, src: usize, len: usize, dst: usize) {
        let window = self.window(src, len);
        let cover = self.cover();
        self.runs.clear();
        if cover > 0 {
            self.runs.push(RefRun { start: 0, len: cover, refs: 0 });
        }
        for run in window {
            self.set_reflen(dst + run.start, run.refs, run.len);
        }
    }

    /// Panics unless the encoding is canonical and covers exactly `cover` slots.
    pub fn check(&self, cover: usize) {
        let mut next = 0;
        for (i, run) in self.runs.iter().enumerate() {
            assert!(run.len > 0, "ppref run {i} is empty");
            assert_eq!(run.start, next, "ppref run {i} leaves a gap or overlaps");
            if i > 0 {
                let prev = self.runs[i - 1].refs;
                assert_ne!(prev, run.refs, "ppref runs {} and {i} not merged", i - 1);
            }
            next = run.end();
        }
        assert_eq!(next, cover, "ppref covers {next} slots, expected {cover}");
    }

    fn find(&self, slot: usize) -> usize {
        let i = self.runs.partition_point(|run| run.end() <= slot);
        assert!(i < self.runs.len(), "slot {slot} beyond ppref cover {}", self.cover());
        i
    }

    /// Ensures a run starts at `at` and returns its index (or the run count at the end).
    fn split(&mut self, at: usize) -> usize {
        if at >= self.cover() {
            return self.runs.len();
        }
        let i = self.find(at);
        let run = self.runs[i];
        if run.start == at {
            return i;
        }
        let head = at - run.start;
        self.runs[i].len = head;
        self.runs.insert(i + 1, RefRun { start: at, len: run.len - head, refs: run.refs });
        i + 1
    }

    fn coalesce(&mut self) {
        self.runs.retain(|run| run.len > 0);
        self.runs.dedup_by(|next, prev| {
            if prev.refs == next.refs {
                prev.len += next.len;
                true
            } else {
                false
            }
        });
    }
}

/// State of an amap's per-page reference table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum PpRef {
    /// Every reference so far covered the whole amap.
    #[default]
    Unset,
    /// Could not be established; never retried for this amap.
    Disabled,
    Active(PpRefTable),
}

impl PpRef {
    pub fn is_active(&self) -> bool {
        matches!(self, PpRef::Active(_))
    }

    pub fn table(&self) -> Option<&PpRefTable> {
        match self {
            PpRef::Active(table) => Some(table),
            _ => None,
        }
    }

    pub fn table_mut(&mut self) -> Option<&mut PpRefTable> {
        match self {
            PpRef::Active(table) => Some(table),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests_prop;
