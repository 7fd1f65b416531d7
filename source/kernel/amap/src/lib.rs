// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Anonymous memory maps (amaps) for the neuron VM
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit + property tests per module; host integration tests under tests/
//! PUBLIC API: AnonMemory, Amap, Aref, MapEntry, AnonRef, Page, VmBackend, AmapConfig
//! DEPENDS_ON: VmBackend (pmap, page allocator, swap device), spin, bitflags, log, thiserror
//! INVARIANTS: slots/back_ptr/anon duality; wiped before the last reference drops;
//!             ppref tables are canonical run-length covers of the backing arrays
//!
//! An amap maps a run of page-sized slots to anons. Map entries hold an [`Aref`] into an
//! amap; several entries may share one amap after `fork()` or after an entry is clipped.
//! Sharing is tracked with a whole-map reference count and, once a reference covers only
//! part of the amap, with a per-page reference table so that a partial unmap releases
//! exactly the pages nobody maps any more.
//!
//! All mutating operations live on [`AnonMemory`], which owns the configuration, the
//! registry of live amaps and the handle to the external collaborators ([`VmBackend`]).

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

extern crate alloc;

pub mod amap;
pub mod anon;
pub mod backend;
pub mod config;
pub mod entry;
pub mod error;
#[cfg(feature = "failpoints")]
pub mod failpoints;
pub mod flags;
#[cfg(feature = "backend-host")]
pub mod host;
mod memory;
pub mod ppref;
pub mod registry;
mod swapoff;

pub use amap::{Amap, AmapId, AmapSnapshot};
pub use anon::{Anon, AnonId, AnonRef, AnonReclaim, Page, SwapSlot};
pub use backend::VmBackend;
pub use config::AmapConfig;
pub use entry::{Aref, EntryMap, MapEntry};
pub use error::{AmapError, ConfigError, PageinError, Result};
pub use flags::{AmapFlags, CopyFlags, ExtendFlags, Prot, RefFlags, WaitPolicy};
pub use memory::AnonMemory;
pub use ppref::{PpRef, PpRefTable, RefRun};
pub use registry::Registry;
