// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! The slice of the map-entry layer the amap code consumes.

use alloc::sync::Arc;

use crate::amap::Amap;
use crate::flags::Prot;
use crate::memory::AnonMemory;

/// A map entry's reference into an amap.
///
/// Constructing an `Aref` does not take a reference on the amap; the reference count is
/// managed explicitly through [`AnonMemory::amap_ref`], [`AnonMemory::unref`] and
/// [`AnonMemory::splitref`].
#[derive(Debug)]
pub struct Aref {
    amap: Arc<Amap>,
    page_offset: usize,
}

impl Aref {
    pub fn new(amap: Arc<Amap>, page_offset: usize) -> Self {
        Self { amap, page_offset }
    }

    pub fn amap(&self) -> &Arc<Amap> {
        &self.amap
    }

    /// Index of the entry's first page within the amap.
    pub fn page_offset(&self) -> usize {
        self.page_offset
    }

    pub(crate) fn set_page_offset(&mut self, page_offset: usize) {
        self.page_offset = page_offset;
    }
}

/// A virtual address range `[start, end)` of a map.
#[derive(Debug)]
pub struct MapEntry {
    pub start: usize,
    pub end: usize,
    pub aref: Option<Aref>,
    /// The amap must be copied before the next write fault.
    pub needs_copy: bool,
    pub wired: bool,
    pub protection: Prot,
}

impl MapEntry {
    pub fn new(start: usize, end: usize, protection: Prot) -> Self {
        assert!(start < end, "empty map entry [{start:#x}, {end:#x})");
        Self { start, end, aref: None, needs_copy: false, wired: false, protection }
    }

    pub fn with_aref(mut self, aref: Aref) -> Self {
        self.aref = Some(aref);
        self
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Number of pages the entry spans.
    pub fn slots(&self, mem: &AnonMemory) -> usize {
        mem.config().bytes_to_slots(self.len())
    }

    /// Clips the entry at `va`. The entry keeps `[va, end)` and the front piece
    /// `[start, va)` is returned; both share the amap.
    pub fn split_at(&mut self, mem: &AnonMemory, va: usize) -> MapEntry {
        assert!(
            va > self.start && va < self.end,
            "split point {va:#x} outside ({:#x}, {:#x})",
            self.start,
            self.end
        );
        let left = va - self.start;
        let front_aref = self.aref.take().map(|orig| {
            let mut back = Aref::new(orig.amap.clone(), orig.page_offset);
            mem.splitref(&orig, &mut back, left);
            self.aref = Some(back);
            orig
        });
        let front = MapEntry {
            start: self.start,
            end: va,
            aref: front_aref,
            needs_copy: self.needs_copy,
            wired: self.wired,
            protection: self.protection,
        };
        self.start = va;
        front
    }
}

/// Map-layer hooks used when the copy path reshapes an entry.
pub trait EntryMap {
    /// Splits `entry` at `va`; the map keeps `[start, va)` as a separate entry.
    fn clip_start(&mut self, mem: &AnonMemory, entry: &mut MapEntry, va: usize);

    /// Splits `entry` at `va`; the map keeps `[va, end)` as a separate entry.
    fn clip_end(&mut self, mem: &AnonMemory, entry: &mut MapEntry, va: usize);

    /// Lets a neighbour absorb `entry`. Returns `true` when the entry was merged away.
    fn try_merge(&mut self, _mem: &AnonMemory, _entry: &mut MapEntry) -> bool {
        false
    }
}
