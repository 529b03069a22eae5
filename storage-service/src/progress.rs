// SPDX-License-Identifier: GPL-3.0-only

//! Latest percent of running balance/replace operations, per pool.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Default)]
pub struct ProgressGauges {
    gauges: Arc<RwLock<HashMap<String, u8>>>,
}

impl ProgressGauges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, pool: &str, percent: u8) {
        let mut gauges = self.gauges.write().unwrap_or_else(|p| p.into_inner());
        gauges.insert(pool.to_string(), percent.min(100));
    }

    pub fn get(&self, pool: &str) -> Option<u8> {
        let gauges = self.gauges.read().unwrap_or_else(|p| p.into_inner());
        gauges.get(pool).copied()
    }

    pub fn clear(&self, pool: &str) {
        let mut gauges = self.gauges.write().unwrap_or_else(|p| p.into_inner());
        gauges.remove(pool);
    }
}
