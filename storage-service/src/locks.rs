// SPDX-License-Identifier: GPL-3.0-only

//! Per-pool mutual exclusion for transactions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

/// Who holds a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockHolder {
    /// An accepted transaction; its record can be polled.
    Transaction(Uuid),
    /// An in-place options change. It writes no transaction record.
    OptionsChange(Uuid),
}

/// Registry of pool id -> current holder.
///
/// Keys are canonical mountpoints. Cloning shares the registry. The engine
/// constructs one at startup.
#[derive(Debug, Clone, Default)]
pub struct PoolLockManager {
    held: Arc<Mutex<HashMap<String, LockHolder>>>,
}

impl PoolLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> MutexGuard<'_, HashMap<String, LockHolder>> {
        // a panicked holder cannot leave the map half-updated
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the lock for `pool` unless someone else holds it.
    ///
    /// On conflict the current holder is returned.
    pub fn try_acquire(&self, pool: &str, holder: LockHolder) -> Result<(), LockHolder> {
        let mut held = self.held();
        match held.get(pool) {
            Some(existing) => Err(*existing),
            None => {
                held.insert(pool.to_string(), holder);
                Ok(())
            }
        }
    }

    pub fn current(&self, pool: &str) -> Option<LockHolder> {
        self.held().get(pool).copied()
    }

    /// Release `pool` if `holder` still holds it.
    pub fn release(&self, pool: &str, holder: LockHolder) -> bool {
        let mut held = self.held();
        if held.get(pool) == Some(&holder) {
            held.remove(pool);
            true
        } else {
            false
        }
    }
}
