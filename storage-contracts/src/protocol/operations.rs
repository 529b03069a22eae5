// SPDX-License-Identifier: GPL-3.0-only

//! Typed payloads exchanged with the agent.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: String,
    pub args: Vec<String>,
}

impl ExecRequest {
    pub fn new<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResponse {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
}

impl ExecResponse {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableFile {
    Fstab,
    Crypttab,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableLineRequest {
    pub table: TableFile,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceStatus {
    pub running: bool,
    pub percent: u8,
    #[serde(default)]
    pub left: Option<u64>,
    #[serde(default)]
    pub total: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaceStatus {
    pub running: bool,
    pub percent: u8,
    #[serde(default)]
    pub completed: Option<u64>,
    #[serde(default)]
    pub total: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Balance,
    Replace,
}

/// One observation of a long-running kernel operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationProgress {
    pub operation: OperationKind,
    pub running: bool,
    pub percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

impl OperationProgress {
    pub fn is_done(&self) -> bool {
        !self.running || self.percent >= 100
    }

    pub fn completed(operation: OperationKind) -> Self {
        Self {
            operation,
            running: false,
            percent: 100,
            left: None,
            completed: None,
            total: None,
        }
    }
}

impl From<BalanceStatus> for OperationProgress {
    fn from(status: BalanceStatus) -> Self {
        Self {
            operation: OperationKind::Balance,
            running: status.running,
            percent: status.percent.min(100),
            left: status.left,
            completed: None,
            total: status.total,
        }
    }
}

impl From<ReplaceStatus> for OperationProgress {
    fn from(status: ReplaceStatus) -> Self {
        Self {
            operation: OperationKind::Replace,
            running: status.running,
            percent: status.percent.min(100),
            left: None,
            completed: status.completed,
            total: status.total,
        }
    }
}
