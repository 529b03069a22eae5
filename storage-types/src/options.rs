// SPDX-License-Identifier: GPL-3.0-only

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Options used when a pool has no stored record.
pub const CONSERVATIVE_OPTIONS: &str = "compress=zstd:3,noatime";

/// An opened LUKS container backing one pool device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LuksMapping {
    /// Name under `/dev/mapper`.
    pub name: String,
    /// Raw block device holding the LUKS header.
    pub device: String,
}

impl LuksMapping {
    pub fn mapper_path(&self) -> String {
        format!("/dev/mapper/{}", self.name)
    }
}

/// Durable per-pool record, keyed by mountpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolOptionsRecord {
    pub mount: String,
    pub mount_options: String,
    pub devices: Vec<String>,
    #[serde(default)]
    pub mappings: Vec<LuksMapping>,
}

/// Result of an options change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionsChange {
    pub mount_options: String,
    pub reboot_required: bool,
    pub updated_at: DateTime<Utc>,
}
