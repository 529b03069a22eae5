// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::options::LuksMapping;

/// Block-group profile for btrfs data or metadata.
///
/// `raid5`/`raid6` parse so they can be rejected with a precise message,
/// but no plan is ever produced for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaidProfile {
    Single,
    Raid1,
    Raid10,
    Raid5,
    Raid6,
}

impl RaidProfile {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Raid1 => "raid1",
            Self::Raid10 => "raid10",
            Self::Raid5 => "raid5",
            Self::Raid6 => "raid6",
        }
    }

    /// Minimum number of devices the profile can live on.
    pub fn min_devices(self) -> usize {
        match self {
            Self::Single => 1,
            Self::Raid1 | Self::Raid10 | Self::Raid5 => 2,
            Self::Raid6 => 3,
        }
    }

    pub fn is_forbidden(self) -> bool {
        matches!(self, Self::Raid5 | Self::Raid6)
    }

    /// Convention used when the caller does not pick a profile.
    pub fn default_for(device_count: usize) -> Self {
        if device_count >= 2 {
            Self::Raid1
        } else {
            Self::Single
        }
    }
}

impl fmt::Display for RaidProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RaidProfile {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "raid1" => Ok(Self::Raid1),
            "raid10" => Ok(Self::Raid10),
            "raid5" => Ok(Self::Raid5),
            "raid6" => Ok(Self::Raid6),
            other => Err(format!("unknown raid profile: {other}")),
        }
    }
}

/// Optional LUKS layer under every pool device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionSpec {
    pub enabled: bool,
    pub keyfile: String,
}

/// Requested shape of a new pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSpec {
    pub name: String,
    pub devices: Vec<String>,
    pub mountpoint: String,
    #[serde(default)]
    pub data_profile: Option<RaidProfile>,
    #[serde(default)]
    pub metadata_profile: Option<RaidProfile>,
    #[serde(default)]
    pub encryption: Option<EncryptionSpec>,
    /// Explicit mount options; the default heuristic applies when absent.
    #[serde(default)]
    pub mount_options: Option<String>,
}

impl PoolSpec {
    pub fn data_profile(&self) -> RaidProfile {
        self.data_profile
            .unwrap_or_else(|| RaidProfile::default_for(self.devices.len()))
    }

    pub fn metadata_profile(&self) -> RaidProfile {
        self.metadata_profile
            .unwrap_or_else(|| RaidProfile::default_for(self.devices.len()))
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.as_ref().is_some_and(|enc| enc.enabled)
    }
}

/// Device topology change against an existing pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum DeviceChange {
    Add {
        devices: Vec<String>,
        #[serde(default)]
        encryption: Option<EncryptionSpec>,
    },
    Remove {
        devices: Vec<String>,
    },
    Replace {
        old: String,
        new: String,
        #[serde(default)]
        encryption: Option<EncryptionSpec>,
    },
}

/// What the planner knows about a pool before a topology change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolTopology {
    pub mount: String,
    pub devices: Vec<String>,
    pub data_profile: RaidProfile,
    pub metadata_profile: RaidProfile,
    #[serde(default)]
    pub mappings: Vec<LuksMapping>,
}
