// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Recoverable errors. Invariant violations are panics and never show up here.

use alloc::collections::TryReserveError;

/// Result alias for amap operations.
pub type Result<T> = core::result::Result<T, AmapError>;

/// Errors returned to the VM-map layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AmapError {
    /// Backing arrays could not be allocated; nothing was modified.
    #[error("out of memory")]
    OutOfMemory,
    /// Growing would create an amap at or beyond the large-amap threshold.
    #[error("amap of {slots} slots reaches the large-amap limit of {limit} slots")]
    TooLarge { slots: usize, limit: usize },
}

impl From<TryReserveError> for AmapError {
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

/// Errors reported by the swap collaborator while paging an anon back in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PageinError {
    /// The swap device failed to read the page.
    #[error("swap device I/O error")]
    Io,
    /// No page could be allocated to receive the data.
    #[error("no memory for pagein")]
    NoMemory,
}

/// Rejected [`crate::AmapConfig`] values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("page size {0} is not a power of two")]
    PageSize(usize),
    #[error("slot alignment {0} is not a power of two")]
    SlotAlign(usize),
    #[error("chunk of {chunk} slots is empty or exceeds the large-amap limit of {large}")]
    Chunk { chunk: usize, large: usize },
}
