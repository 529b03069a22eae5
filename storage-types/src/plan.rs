// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Placeholder in proposed fstab/crypttab lines, resolved once the device exists.
pub const UUID_TOKEN: &str = "__UUID__";

/// Subvolumes every pool is created with.
pub const RESERVED_SUBVOLUMES: [&str; 3] = ["data", "snaps", "apps"];

/// Typed tag describing what a step does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Probe,
    EnsureKeyfile,
    LuksFormat,
    LuksOpen,
    LuksClose,
    Mkfs,
    Mkdir,
    Mount,
    Unmount,
    SubvolumeCreate,
    FstabEnsure,
    FstabRemove,
    CrypttabEnsure,
    CrypttabRemove,
    DeviceAdd,
    DeviceRemove,
    Replace,
    Balance,
    Wipe,
}

impl StepAction {
    /// Whether the step can lose data.
    pub fn is_destructive(self) -> bool {
        matches!(
            self,
            Self::LuksFormat
                | Self::Mkfs
                | Self::DeviceAdd
                | Self::DeviceRemove
                | Self::Replace
                | Self::Wipe
        )
    }

    /// Steps that launch a kernel operation that keeps running after the command returns.
    pub fn is_long_running(self) -> bool {
        matches!(self, Self::Balance | Self::Replace)
    }

    /// Steps carried out through the agent's table maintenance calls instead of `execute`.
    pub fn is_table_edit(self) -> bool {
        matches!(
            self,
            Self::FstabEnsure | Self::FstabRemove | Self::CrypttabEnsure | Self::CrypttabRemove
        )
    }

    pub fn verb(self) -> Option<ConfirmVerb> {
        match self {
            Self::Mkfs => Some(ConfirmVerb::Create),
            Self::DeviceAdd => Some(ConfirmVerb::Add),
            Self::DeviceRemove => Some(ConfirmVerb::Remove),
            Self::Replace => Some(ConfirmVerb::Replace),
            Self::Unmount => Some(ConfirmVerb::Destroy),
            _ => None,
        }
    }
}

/// What a step acts on, recorded at planning time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ResourceRef {
    Device {
        path: String,
    },
    Mapping {
        name: String,
        device: String,
    },
    Mount {
        path: String,
    },
    /// A line in fstab/crypttab. `needle` identifies the line for removal;
    /// `uuid_of` names the device whose UUID replaces [`UUID_TOKEN`] in `line`.
    TableEntry {
        needle: String,
        #[serde(default)]
        line: Option<String>,
        #[serde(default)]
        uuid_of: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub description: String,
    /// Human-readable rendering of `argv` (or of the table edit).
    pub command: String,
    /// Program and arguments handed to the agent. Empty for table edits.
    #[serde(default)]
    pub argv: Vec<String>,
    pub destructive: bool,
    pub action: StepAction,
    #[serde(default)]
    pub resource: Option<ResourceRef>,
}

impl PlanStep {
    pub fn mapping(&self) -> Option<(&str, &str)> {
        match &self.resource {
            Some(ResourceRef::Mapping { name, device }) => Some((name.as_str(), device.as_str())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
    pub warnings: Vec<String>,
    #[serde(rename = "requiresBalance")]
    pub requires_balance: bool,
    #[serde(rename = "mountOptions")]
    pub mount_options: String,
    #[serde(default)]
    pub fstab_lines: Vec<String>,
    #[serde(default)]
    pub crypttab_lines: Vec<String>,
}

impl Plan {
    /// Confirmation verb the caller must echo back before this plan may run.
    pub fn confirm_verb(&self) -> Option<ConfirmVerb> {
        let verbs: Vec<ConfirmVerb> = self
            .steps
            .iter()
            .filter_map(|step| step.action.verb())
            .collect();

        ConfirmVerb::PRIORITY
            .into_iter()
            .find(|candidate| verbs.contains(candidate))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConfirmVerb {
    Create,
    Add,
    Remove,
    Replace,
    Destroy,
}

impl ConfirmVerb {
    /// When a plan mixes verbs, the most consequential one is demanded.
    pub const PRIORITY: [ConfirmVerb; 5] = [
        Self::Destroy,
        Self::Create,
        Self::Replace,
        Self::Remove,
        Self::Add,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Add => "ADD",
            Self::Remove => "REMOVE",
            Self::Replace => "REPLACE",
            Self::Destroy => "DESTROY",
        }
    }
}

impl fmt::Display for ConfirmVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfirmVerb {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "CREATE" => Ok(Self::Create),
            "ADD" => Ok(Self::Add),
            "REMOVE" => Ok(Self::Remove),
            "REPLACE" => Ok(Self::Replace),
            "DESTROY" => Ok(Self::Destroy),
            other => Err(format!("unknown confirmation: {other}")),
        }
    }
}
