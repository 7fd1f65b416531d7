// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-memory backend for running the amap layer on the host
//! OWNERS: @kernel-mm-team
//! STATUS: Functional (host-only)
//! PUBLIC API: HostBackend
//! NOTE: Page contents are modelled as a tag per frame; swap as a tag per slot.
//!
//! Failure knobs make allocation and pagein failures reproducible; counters record how
//! often the amap layer had to wait.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

use crate::anon::{Anon, AnonId, AnonReclaim, AnonRef, Page, SwapSlot};
use crate::backend::VmBackend;
use crate::error::PageinError;
use crate::flags::Prot;

#[derive(Default)]
struct HostState {
    contents: BTreeMap<u64, u64>,
    protections: BTreeMap<u64, Prot>,
    swap: BTreeMap<u32, u64>,
    freed: Vec<AnonId>,
}

/// Called before every pagein; lets a test act while the amap is unlocked.
pub type PageinHook = Arc<dyn Fn(&AnonRef) + Send + Sync>;

pub struct HostBackend {
    me: Weak<HostBackend>,
    next_anon: AtomicU64,
    next_frame: AtomicU64,
    state: Mutex<HostState>,
    fail_anon: AtomicUsize,
    fail_page: AtomicUsize,
    fail_pagein: Mutex<Option<PageinError>>,
    on_pagein: Mutex<Option<PageinHook>>,
    page_waits: AtomicUsize,
    memory_waits: AtomicUsize,
    pageins: AtomicUsize,
    kicks: AtomicUsize,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
}

impl HostBackend {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            next_anon: AtomicU64::new(1),
            next_frame: AtomicU64::new(0x1000),
            state: Mutex::new(HostState::default()),
            fail_anon: AtomicUsize::new(0),
            fail_page: AtomicUsize::new(0),
            fail_pagein: Mutex::new(None),
            on_pagein: Mutex::new(None),
            page_waits: AtomicUsize::new(0),
            memory_waits: AtomicUsize::new(0),
            pageins: AtomicUsize::new(0),
            kicks: AtomicUsize::new(0),
        })
    }

    fn new_anon(&self) -> Anon {
        let id = AnonId(self.next_anon.fetch_add(1, Ordering::Relaxed));
        let anon = Anon::new(id);
        match self.me.upgrade() {
            Some(me) => anon.with_reclaim(me),
            None => anon,
        }
    }

    fn new_frame(&self) -> u64 {
        self.next_frame.fetch_add(1, Ordering::Relaxed)
    }

    /// A resident anon whose page holds `tag`.
    pub fn resident_anon(&self, tag: u64) -> AnonRef {
        let frame = self.new_frame();
        self.state.lock().contents.insert(frame, tag);
        AnonRef::new(self.new_anon().with_page(Arc::new(Page::new(frame))))
    }

    /// A swapped-out anon whose content `tag` sits in swap slot `slot`.
    pub fn swapped_anon(&self, slot: u32, tag: u64) -> AnonRef {
        let Some(swap) = SwapSlot::from_raw(slot) else {
            panic!("swap slot 0 is reserved");
        };
        self.state.lock().swap.insert(slot, tag);
        AnonRef::new(self.new_anon().with_swap_slot(swap))
    }

    /// Content tag of the anon's resident page.
    pub fn anon_tag(&self, anon: &AnonRef) -> Option<u64> {
        anon.page().and_then(|page| self.page_tag(&page))
    }

    pub fn page_tag(&self, page: &Page) -> Option<u64> {
        self.state.lock().contents.get(&page.frame()).copied()
    }

    /// Last protection pushed to `page`.
    pub fn protection(&self, page: &Page) -> Option<Prot> {
        self.state.lock().protections.get(&page.frame()).copied()
    }

    pub fn is_freed(&self, id: AnonId) -> bool {
        self.state.lock().freed.contains(&id)
    }

    pub fn freed(&self) -> Vec<AnonId> {
        self.state.lock().freed.clone()
    }

    pub fn swap_in_use(&self) -> usize {
        self.state.lock().swap.len()
    }

    /// Fails the next `n` anon allocations.
    pub fn fail_anon_allocs(&self, n: usize) {
        self.fail_anon.store(n, Ordering::SeqCst);
    }

    /// Fails the next `n` page allocations.
    pub fn fail_page_allocs(&self, n: usize) {
        self.fail_page.store(n, Ordering::SeqCst);
    }

    /// Fails the next pagein with `err`.
    pub fn fail_next_pagein(&self, err: PageinError) {
        *self.fail_pagein.lock() = Some(err);
    }

    pub fn on_pagein(&self, hook: PageinHook) {
        *self.on_pagein.lock() = Some(hook);
    }

    pub fn page_waits(&self) -> usize {
        self.page_waits.load(Ordering::SeqCst)
    }

    pub fn memory_waits(&self) -> usize {
        self.memory_waits.load(Ordering::SeqCst)
    }

    pub fn pageins(&self) -> usize {
        self.pageins.load(Ordering::SeqCst)
    }

    pub fn pagedaemon_kicks(&self) -> usize {
        self.kicks.load(Ordering::SeqCst)
    }
}

impl VmBackend for HostBackend {
    fn page_protect(&self, page: &Page, prot: Prot) {
        self.state.lock().protections.insert(page.frame(), prot);
    }

    fn alloc_anon(&self) -> Option<AnonRef> {
        if take_one(&self.fail_anon) {
            return None;
        }
        Some(AnonRef::new(self.new_anon()))
    }

    fn alloc_page(&self) -> Option<Arc<Page>> {
        if take_one(&self.fail_page) {
            return None;
        }
        let page = Page::new(self.new_frame());
        page.set_busy(true);
        Some(Arc::new(page))
    }

    fn copy_page(&self, src: &Page, dst: &Page) {
        let mut state = self.state.lock();
        match state.contents.get(&src.frame()).copied() {
            Some(tag) => state.contents.insert(dst.frame(), tag),
            None => state.contents.remove(&dst.frame()),
        };
    }

    fn pagein(&self, anon: &AnonRef) -> Result<(), PageinError> {
        let hook = self.on_pagein.lock().clone();
        if let Some(hook) = hook {
            hook(anon);
        }
        if let Some(err) = self.fail_pagein.lock().take() {
            return Err(err);
        }
        let Some(slot) = anon.swap_slot() else {
            return Ok(());
        };
        let frame = self.new_frame();
        {
            let mut state = self.state.lock();
            let tag = state.swap.remove(&slot.to_raw());
            if let Some(tag) = tag {
                state.contents.insert(frame, tag);
            }
        }
        let stale = anon.install_page(Arc::new(Page::new(frame)));
        debug_assert!(stale.is_none());
        anon.set_swap_slot(None);
        self.pageins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn wait_page(&self, page: &Page) {
        self.page_waits.fetch_add(1, Ordering::SeqCst);
        // The owner finishes its I/O while we sleep.
        page.set_busy(false);
    }

    fn wait_memory(&self) {
        self.memory_waits.fetch_add(1, Ordering::SeqCst);
    }

    fn kick_pagedaemon(&self) {
        self.kicks.fetch_add(1, Ordering::SeqCst);
    }
}

impl AnonReclaim for HostBackend {
    fn anon_freed(&self, id: AnonId, page: Option<Arc<Page>>, swap_slot: Option<SwapSlot>) {
        let mut state = self.state.lock();
        state.freed.push(id);
        if let Some(page) = page {
            state.contents.remove(&page.frame());
            state.protections.remove(&page.frame());
        }
        if let Some(slot) = swap_slot {
            state.swap.remove(&slot.to_raw());
        }
    }
}
