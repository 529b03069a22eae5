// SPDX-License-Identifier: GPL-3.0-only

use serde_json::json;
use storage_contracts::{StorageError, StorageErrorKind};
use storage_sys::MountOptionError;
use thiserror::Error;
use uuid::Uuid;
use zbus::fdo;

use crate::locks::LockHolder;

/// Failures surfaced by the pool transaction engine.
///
/// Everything here is reported synchronously on the accept path. Failures
/// after a transaction has been accepted only show up in its record and log.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{message}")]
    Validation { code: &'static str, message: String },

    #[error("pool {pool} is locked by transaction {tx_id}")]
    Conflict { pool: String, tx_id: Uuid },

    /// An options change holds the pool; there is no transaction to poll.
    #[error("pool {pool} is busy with a mount options change")]
    Busy { pool: String },

    #[error("{message}")]
    Precondition { code: &'static str, message: String },

    #[error("not found: {id}")]
    NotFound { code: &'static str, id: String },

    #[error("agent error: {0}")]
    Agent(#[from] StorageError),

    #[error("store I/O failed on {path}: {reason}")]
    Store { path: String, reason: String },
}

impl ServiceError {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn precondition(code: &'static str, message: impl Into<String>) -> Self {
        Self::Precondition {
            code,
            message: message.into(),
        }
    }

    pub fn store(path: impl AsRef<std::path::Path>, reason: impl std::fmt::Display) -> Self {
        Self::Store {
            path: path.as_ref().display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Rejection for a pool someone else holds.
    pub fn locked(pool: &str, holder: LockHolder) -> Self {
        match holder {
            LockHolder::Transaction(tx_id) => Self::Conflict {
                pool: pool.to_string(),
                tx_id,
            },
            LockHolder::OptionsChange(_) => Self::Busy {
                pool: pool.to_string(),
            },
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { code, .. }
            | Self::Precondition { code, .. }
            | Self::NotFound { code, .. } => code,
            Self::Conflict { .. } => "pool_locked",
            Self::Busy { .. } => "options_change_in_progress",
            Self::Agent(_) => "agent_unavailable",
            Self::Store { .. } => "store_io",
        }
    }

    pub fn kind(&self) -> StorageErrorKind {
        match self {
            Self::Validation { .. } => StorageErrorKind::InvalidInput,
            Self::Conflict { .. } => StorageErrorKind::Conflict,
            Self::Busy { .. } => StorageErrorKind::Busy,
            Self::Precondition { .. } => StorageErrorKind::Precondition,
            Self::NotFound { .. } => StorageErrorKind::NotFound,
            Self::Agent(_) => StorageErrorKind::Unavailable,
            Self::Store { .. } => StorageErrorKind::Internal,
        }
    }

    /// JSON body handed to D-Bus callers.
    pub fn to_body(&self) -> String {
        let mut body = json!({
            "code": self.code(),
            "status": self.kind().code(),
            "message": self.to_string(),
        });
        if let Self::Conflict { tx_id, .. } = self {
            body["tx_id"] = json!(tx_id.to_string());
        }
        body.to_string()
    }
}

impl From<MountOptionError> for ServiceError {
    fn from(err: MountOptionError) -> Self {
        match err {
            MountOptionError::Empty => Self::validation("empty_mount_options", err.to_string()),
            MountOptionError::InvalidToken { .. } => {
                Self::validation("invalid_mount_option", err.to_string())
            }
        }
    }
}

impl From<ServiceError> for fdo::Error {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Validation { .. } => fdo::Error::InvalidArgs(err.to_body()),
            _ => fdo::Error::Failed(err.to_body()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
