// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::options::LuksMapping;
use crate::plan::PlanStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Ok,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    Create,
    AddDevices,
    RemoveDevices,
    ReplaceDevice,
    Destroy,
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::AddDevices => "add_devices",
            Self::RemoveDevices => "remove_devices",
            Self::ReplaceDevice => "replace_device",
            Self::Destroy => "destroy",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxStep {
    #[serde(flatten)]
    pub step: PlanStep,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl TxStep {
    pub fn pending(step: PlanStep) -> Self {
        Self {
            step,
            status: StepStatus::Pending,
            started_at: None,
            finished_at: None,
            exit_code: None,
        }
    }
}

/// Durable record of one accepted apply request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tx {
    pub id: Uuid,
    pub kind: TxKind,
    /// Mountpoint of the pool the transaction works on; the pool lock key.
    pub pool: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub ok: bool,
    pub error: Option<String>,
    pub steps: Vec<TxStep>,
    /// Options recorded for the pool once the transaction succeeds.
    #[serde(default)]
    pub mount_options: Option<String>,
    /// Fstab lines this transaction may write; removed again on failure.
    #[serde(default)]
    pub fstab_lines: Vec<String>,
    #[serde(default)]
    pub mappings: Vec<LuksMapping>,
}

impl Tx {
    pub fn new(
        kind: TxKind,
        pool: impl Into<String>,
        steps: Vec<PlanStep>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            pool: pool.into(),
            started_at: now,
            finished_at: None,
            ok: false,
            error: None,
            steps: steps.into_iter().map(TxStep::pending).collect(),
            mount_options: None,
            fstab_lines: Vec::new(),
            mappings: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn running_step(&self) -> Option<&TxStep> {
        self.steps
            .iter()
            .find(|step| step.status == StepStatus::Running)
    }

    pub fn start_step(&mut self, index: usize, now: DateTime<Utc>) {
        if let Some(step) = self.steps.get_mut(index) {
            step.status = StepStatus::Running;
            step.started_at = Some(now);
        }
    }

    pub fn finish_step(
        &mut self,
        index: usize,
        exit_code: Option<i32>,
        ok: bool,
        now: DateTime<Utc>,
    ) {
        if let Some(step) = self.steps.get_mut(index) {
            step.status = if ok { StepStatus::Ok } else { StepStatus::Error };
            step.finished_at = Some(now);
            step.exit_code = exit_code;
        }
    }

    /// Terminal success. Only valid once every step is `ok`.
    pub fn succeed(&mut self, now: DateTime<Utc>) {
        self.ok = self
            .steps
            .iter()
            .all(|step| step.status == StepStatus::Ok);
        self.finished_at = Some(now);
    }

    /// Terminal failure. The first error wins.
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.ok = false;
        if self.error.is_none() {
            self.error = Some(error.into());
        }
        self.finished_at = Some(now);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}
