// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sizing policy for amaps.
//!
//! The defaults mirror what the kernel allocator handles well: 4 KiB pages, slot arrays
//! rounded to the 8-byte allocation granule, growth capped at 256 slots before callers
//! must split a mapping into several amaps, and 16-slot chunks when a large entry gets its
//! first amap.

use static_assertions::const_assert;

use crate::error::ConfigError;

/// Size of a page (and therefore of one slot) in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 4096;
/// Slots per chunk when a large entry is clipped before its first amap is created.
pub const DEFAULT_CHUNK_SLOTS: usize = 16;
/// Amaps at or beyond this many slots are never grown in place.
pub const DEFAULT_LARGE_SLOTS: usize = 256;
/// Slot arrays are sized to a multiple of this many entries.
pub const DEFAULT_SLOT_ALIGN: usize = 2;

const_assert!(DEFAULT_PAGE_SIZE.is_power_of_two());
const_assert!(DEFAULT_SLOT_ALIGN.is_power_of_two());
const_assert!(DEFAULT_CHUNK_SLOTS > 0);
const_assert!(DEFAULT_CHUNK_SLOTS <= DEFAULT_LARGE_SLOTS);

/// Tunable constants consumed by [`crate::AnonMemory`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AmapConfig {
    /// Bytes per slot.
    pub page_size: usize,
    /// Chunk size, in slots, used when clipping a large entry in `copy`.
    pub chunk_slots: usize,
    /// Large-amap threshold in slots; growth reaching it fails with `TooLarge`.
    pub large_slots: usize,
    /// Rounding granule for the backing arrays, in slots.
    pub slot_align: usize,
    /// Whether per-page reference tables may be established at all.
    pub ppref: bool,
}

impl AmapConfig {
    /// Returns the default policy.
    pub const fn new() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            chunk_slots: DEFAULT_CHUNK_SLOTS,
            large_slots: DEFAULT_LARGE_SLOTS,
            slot_align: DEFAULT_SLOT_ALIGN,
            ppref: true,
        }
    }

    pub const fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub const fn with_chunk_slots(mut self, chunk_slots: usize) -> Self {
        self.chunk_slots = chunk_slots;
        self
    }

    pub const fn with_large_slots(mut self, large_slots: usize) -> Self {
        self.large_slots = large_slots;
        self
    }

    pub const fn with_slot_align(mut self, slot_align: usize) -> Self {
        self.slot_align = slot_align;
        self
    }

    pub const fn with_ppref(mut self, enabled: bool) -> Self {
        self.ppref = enabled;
        self
    }

    /// Checks that the policy is internally consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.page_size.is_power_of_two() {
            return Err(ConfigError::PageSize(self.page_size));
        }
        if !self.slot_align.is_power_of_two() {
            return Err(ConfigError::SlotAlign(self.slot_align));
        }
        if self.chunk_slots == 0 || self.chunk_slots > self.large_slots {
            return Err(ConfigError::Chunk { chunk: self.chunk_slots, large: self.large_slots });
        }
        Ok(())
    }

    /// Converts a page-aligned byte length into slots.
    pub fn bytes_to_slots(&self, bytes: usize) -> usize {
        assert!(bytes % self.page_size == 0, "length {bytes:#x} is not page aligned");
        bytes / self.page_size
    }

    /// Rounds a slot count up to the allocation granule.
    pub fn roundup_slots(&self, slots: usize) -> usize {
        (slots + self.slot_align - 1) & !(self.slot_align - 1)
    }

    /// Chunk size in bytes.
    pub fn chunk_bytes(&self) -> usize {
        self.chunk_slots * self.page_size
    }
}

impl Default for AmapConfig {
    fn default() -> Self {
        Self::new()
    }
}
