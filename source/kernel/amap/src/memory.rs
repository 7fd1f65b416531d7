// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Context shared by every amap operation.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::amap::AmapId;
use crate::backend::VmBackend;
use crate::config::AmapConfig;
use crate::error::{AmapError, ConfigError};
#[cfg(feature = "failpoints")]
use crate::failpoints::FailPoints;
use crate::registry::Registry;

/// Owner of the amap registry, the sizing policy and the backend handle.
pub struct AnonMemory {
    config: AmapConfig,
    backend: Arc<dyn VmBackend>,
    registry: Registry,
    next_id: AtomicU64,
    low_memory: AtomicU64,
    #[cfg(feature = "failpoints")]
    failpoints: FailPoints,
}

impl AnonMemory {
    pub fn new(config: AmapConfig, backend: Arc<dyn VmBackend>) -> Result<Self, ConfigError> {
        config.validate()?;
        log::debug!(
            target: "amap",
            "amap layer up: page {} chunk {} large {} align {} ppref {}",
            config.page_size,
            config.chunk_slots,
            config.large_slots,
            config.slot_align,
            config.ppref
        );
        Ok(Self {
            config,
            backend,
            registry: Registry::new(),
            next_id: AtomicU64::new(1),
            low_memory: AtomicU64::new(0),
            #[cfg(feature = "failpoints")]
            failpoints: FailPoints::new(),
        })
    }

    pub fn config(&self) -> &AmapConfig {
        &self.config
    }

    pub fn backend(&self) -> &dyn VmBackend {
        self.backend.as_ref()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Number of non-blocking allocations that failed so far.
    pub fn low_memory_events(&self) -> u64 {
        self.low_memory.load(Ordering::Relaxed)
    }

    #[cfg(feature = "failpoints")]
    pub fn failpoints(&self) -> &FailPoints {
        &self.failpoints
    }

    pub(crate) fn next_amap_id(&self) -> AmapId {
        AmapId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn note_low_memory(&self) {
        self.low_memory.fetch_add(1, Ordering::Relaxed);
        self.backend.kick_pagedaemon();
    }

    /// Runs an armed allocation hook, then fails with `OutOfMemory` when an armed
    /// failpoint fires.
    #[cfg(feature = "failpoints")]
    pub(crate) fn alloc_gate(&self) -> Result<(), AmapError> {
        self.failpoints.run_alloc_hook();
        if self.failpoints.take_alloc_failure() {
            return Err(AmapError::OutOfMemory);
        }
        Ok(())
    }

    #[cfg(not(feature = "failpoints"))]
    pub(crate) fn alloc_gate(&self) -> Result<(), AmapError> {
        Ok(())
    }

    /// Fallible allocation of a `len`-element vector filled with `fill`.
    pub(crate) fn try_vec<T: Clone>(&self, len: usize, fill: T) -> Result<Vec<T>, AmapError> {
        self.alloc_gate()?;
        let mut v = Vec::new();
        v.try_reserve_exact(len)?;
        v.resize(len, fill);
        Ok(v)
    }

    /// Fallible allocation of an empty vector with room for `cap` elements.
    pub(crate) fn try_vec_with_capacity<T>(&self, cap: usize) -> Result<Vec<T>, AmapError> {
        self.alloc_gate()?;
        let mut v = Vec::new();
        v.try_reserve_exact(cap)?;
        Ok(v)
    }
}

impl fmt::Debug for AnonMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnonMemory")
            .field("config", &self.config)
            .field("amaps", &self.registry.len())
            .field("low_memory", &self.low_memory_events())
            .finish()
    }
}
