// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Global set of live amaps, walked by swap-off.
//!
//! Members are keyed by their monotonically assigned id, so a walker only has to remember
//! the last id it visited to resume after dropping the lock; amaps created meanwhile sort
//! after the cursor and are visited too.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Bound;

use spin::{Mutex, MutexGuard};

use crate::amap::{Amap, AmapId};

pub(crate) type Members = BTreeMap<AmapId, Arc<Amap>>;

pub struct Registry {
    members: Mutex<Members>,
}

impl Registry {
    pub const fn new() -> Self {
        Self { members: Mutex::new(BTreeMap::new()) }
    }

    pub(crate) fn insert(&self, amap: &Arc<Amap>) {
        let id = amap.id();
        let prev = self.members.lock().insert(id, amap.clone());
        assert!(prev.is_none(), "{id} registered twice");
        log::trace!(target: "amap", "registry: insert {id}");
    }

    pub(crate) fn remove(&self, id: AmapId) {
        let removed = self.members.lock().remove(&id);
        assert!(removed.is_some(), "{id} removed but not registered");
        log::trace!(target: "amap", "registry: remove {id}");
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Members> {
        self.members.lock()
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }

    pub fn contains(&self, id: AmapId) -> bool {
        self.members.lock().contains_key(&id)
    }

    pub fn ids(&self) -> Vec<AmapId> {
        self.members.lock().keys().copied().collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.members.lock().keys()).finish()
    }
}

/// Resume position of a registry walk.
#[derive(Clone, Copy, Debug, Default)]
pub struct Cursor {
    last: Option<AmapId>,
}

impl Cursor {
    pub const fn start() -> Self {
        Self { last: None }
    }

    /// First member after the cursor.
    pub(crate) fn peek(&self, members: &Members) -> Option<Arc<Amap>> {
        let lower = match self.last {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        members.range((lower, Bound::Unbounded)).next().map(|(_, amap)| amap.clone())
    }

    pub fn advance(&mut self, id: AmapId) {
        self.last = Some(id);
    }

    pub fn last(&self) -> Option<AmapId> {
        self.last
    }
}
