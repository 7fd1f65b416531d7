// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Flag sets exchanged with the map layer and stored on amaps.

use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    /// Access protection pushed to physical pages through the pmap.
    pub struct Prot: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl Prot {
    /// No access at all; used to revoke every mapping of a page.
    pub const NONE: Self = Self::empty();
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    /// State bits stored on an amap.
    pub struct AmapFlags: u8 {
        /// Aliased by several arefs without per-page tracking of who maps what.
        const SHARED = 1 << 0;
        /// A swap-off walker is paging anons of this amap in; wipeout is deferred.
        const SWAPOFF = 1 << 1;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    /// Options for [`crate::AnonMemory::extend`].
    pub struct ExtendFlags: u8 {
        const FORWARDS = 1 << 0;
        const BACKWARDS = 1 << 1;
        /// Allocation must not block.
        const NOWAIT = 1 << 2;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    /// Options for [`crate::AnonMemory::copy`].
    pub struct CopyFlags: u8 {
        /// Allocation must not block.
        const NOWAIT = 1 << 0;
        /// Never clip a large entry to a chunk boundary.
        const NOCHUNK = 1 << 1;
        /// Never let the map layer merge the entry into a neighbour.
        const NOMERGE = 1 << 2;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    /// Options for [`crate::AnonMemory::amap_ref`].
    pub struct RefFlags: u8 {
        /// Mark the amap shared.
        const SHARED = 1 << 0;
        /// The reference covers the whole amap.
        const ALL = 1 << 1;
    }
}

/// Whether an allocation may sleep waiting for memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitPolicy {
    MayBlock,
    MustNotBlock,
}

impl WaitPolicy {
    pub const fn from_nowait(nowait: bool) -> Self {
        if nowait {
            Self::MustNotBlock
        } else {
            Self::MayBlock
        }
    }
}
