// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Deterministic allocation-failure injection for tests.

use alloc::boxed::Box;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

/// Runs once at the next allocation, before the failure countdown is consulted.
pub type AllocHook = Box<dyn FnOnce() + Send>;

/// Countdown until the next injected allocation failure. Zero means disarmed.
#[derive(Default)]
pub struct FailPoints {
    fail_alloc_in: AtomicUsize,
    on_alloc: Mutex<Option<AllocHook>>,
}

impl FailPoints {
    pub const fn new() -> Self {
        Self { fail_alloc_in: AtomicUsize::new(0), on_alloc: Mutex::new(None) }
    }

    /// Runs `hook` at the next allocation. Growth and copy paths allocate with the amap
    /// unlocked, so the hook can act inside that window.
    pub fn on_next_alloc(&self, hook: AllocHook) {
        *self.on_alloc.lock() = Some(hook);
    }

    /// Lets `skip` allocations succeed, then fails the next one.
    pub fn fail_alloc_after(&self, skip: usize) {
        self.fail_alloc_in.store(skip + 1, Ordering::SeqCst);
    }

    /// Forces the next allocation to fail.
    pub fn fail_next_alloc(&self) {
        self.fail_alloc_after(0);
    }

    pub fn disarm(&self) {
        self.fail_alloc_in.store(0, Ordering::SeqCst);
        self.on_alloc.lock().take();
    }

    pub(crate) fn run_alloc_hook(&self) {
        let hook = self.on_alloc.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Consumes one allocation; returns `true` if it must fail.
    pub(crate) fn take_alloc_failure(&self) -> bool {
        matches!(
            self.fail_alloc_in.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            }),
            Ok(1)
        )
    }
}

impl fmt::Debug for FailPoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailPoints")
            .field("fail_alloc_in", &self.fail_alloc_in.load(Ordering::Relaxed))
            .field("on_alloc", &self.on_alloc.lock().is_some())
            .finish()
    }
}
