// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Collaborators the amap layer drives but does not implement.
//!
//! The kernel wires these to the pmap, the page allocator and the swap pager; host tests
//! use [`crate::host::HostBackend`].

use alloc::sync::Arc;

use crate::anon::{AnonRef, Page};
use crate::error::PageinError;
use crate::flags::Prot;

pub trait VmBackend: Send + Sync {
    /// Lowers the protection of every mapping of `page` to `prot`.
    fn page_protect(&self, page: &Page, prot: Prot);

    /// Allocates a fresh anon holding one reference.
    fn alloc_anon(&self) -> Option<AnonRef>;

    /// Allocates a page. The page is returned busy.
    fn alloc_page(&self) -> Option<Arc<Page>>;

    /// Copies the contents of `src` into `dst`.
    fn copy_page(&self, src: &Page, dst: &Page);

    /// Brings `anon` back from swap. On success the anon is resident and its swap slot
    /// has been released.
    fn pagein(&self, anon: &AnonRef) -> Result<(), PageinError>;

    /// Sleeps until `page` is no longer busy.
    fn wait_page(&self, page: &Page);

    /// Sleeps until the page daemon has freed memory.
    fn wait_memory(&self);

    /// Backs off before retrying a contended try-lock.
    fn pause(&self) {
        core::hint::spin_loop();
    }

    /// Hints that a non-blocking allocation failed.
    fn kick_pagedaemon(&self) {}
}
