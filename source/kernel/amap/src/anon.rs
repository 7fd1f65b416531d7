// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Anons and the physical pages backing them.
//!
//! An anon is owned by nobody in particular: every amap slot holding it owns one
//! [`AnonRef`], and the anon's reference count is the number of live handles. When the
//! last handle goes away the reclaim hook receives the page and swap slot back.

use alloc::sync::Arc;
use core::fmt;
use core::num::NonZeroU32;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

/// Identity of an anon, assigned by whoever allocates it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AnonId(pub u64);

impl fmt::Display for AnonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "anon#{}", self.0)
    }
}

/// Swap slot holding the paged-out content of an anon. Slot 0 is never valid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(NonZeroU32);

impl SwapSlot {
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match NonZeroU32::new(raw) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    pub const fn to_raw(self) -> u32 {
        self.0.get()
    }
}

/// A physical page frame as seen by the amap layer.
#[derive(Debug)]
pub struct Page {
    frame: u64,
    busy: AtomicBool,
    loan_count: AtomicU32,
}

impl Page {
    pub const fn new(frame: u64) -> Self {
        Self { frame, busy: AtomicBool::new(false), loan_count: AtomicU32::new(0) }
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Release);
    }

    /// Records a loan of the page to another subsystem.
    pub fn loan(&self) {
        self.loan_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unloan(&self) {
        let prev = self.loan_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "page {:#x} unloaned without a loan", self.frame);
    }

    pub fn is_loaned(&self) -> bool {
        self.loan_count.load(Ordering::Acquire) > 0
    }
}

/// Receives the resources of an anon whose last reference dropped.
pub trait AnonReclaim: Send + Sync {
    fn anon_freed(&self, id: AnonId, page: Option<Arc<Page>>, swap_slot: Option<SwapSlot>);
}

#[derive(Default)]
struct AnonState {
    page: Option<Arc<Page>>,
    swap_slot: Option<SwapSlot>,
}

/// Anonymous memory object: a resident page, a swap slot, or both.
pub struct Anon {
    id: AnonId,
    state: Mutex<AnonState>,
    reclaim: Option<Arc<dyn AnonReclaim>>,
}

impl Anon {
    pub fn new(id: AnonId) -> Self {
        Self { id, state: Mutex::new(AnonState::default()), reclaim: None }
    }

    pub fn with_page(self, page: Arc<Page>) -> Self {
        self.state.lock().page = Some(page);
        self
    }

    pub fn with_swap_slot(self, slot: SwapSlot) -> Self {
        self.state.lock().swap_slot = Some(slot);
        self
    }

    pub fn with_reclaim(mut self, reclaim: Arc<dyn AnonReclaim>) -> Self {
        self.reclaim = Some(reclaim);
        self
    }

    pub fn id(&self) -> AnonId {
        self.id
    }
}

impl fmt::Debug for Anon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Anon")
            .field("id", &self.id)
            .field("page", &state.page.as_ref().map(|p| p.frame()))
            .field("swap_slot", &state.swap_slot)
            .finish()
    }
}

impl Drop for Anon {
    fn drop(&mut self) {
        let state = core::mem::take(self.state.get_mut());
        if let Some(reclaim) = self.reclaim.take() {
            reclaim.anon_freed(self.id, state.page, state.swap_slot);
        }
    }
}

/// Counted reference to an [`Anon`]. Cloning increments the anon's reference count.
#[derive(Clone, Debug)]
pub struct AnonRef(Arc<Anon>);

impl AnonRef {
    pub fn new(anon: Anon) -> Self {
        Self(Arc::new(anon))
    }

    pub fn id(&self) -> AnonId {
        self.0.id
    }

    /// Number of live references (`an_ref`).
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn page(&self) -> Option<Arc<Page>> {
        self.0.state.lock().page.clone()
    }

    pub fn swap_slot(&self) -> Option<SwapSlot> {
        self.0.state.lock().swap_slot
    }

    /// Makes `page` resident and returns the page it displaced, if any.
    pub fn install_page(&self, page: Arc<Page>) -> Option<Arc<Page>> {
        self.0.state.lock().page.replace(page)
    }

    /// Replaces the swap slot and returns the previous one.
    pub fn set_swap_slot(&self, slot: Option<SwapSlot>) -> Option<SwapSlot> {
        core::mem::replace(&mut self.0.state.lock().swap_slot, slot)
    }

    pub fn ptr_eq(&self, other: &AnonRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
