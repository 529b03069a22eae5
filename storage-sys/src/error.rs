// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;

/// Error types for system-level operations
#[derive(Error, Debug)]
pub enum SysError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    MountOption(#[from] MountOptionError),

    #[error("Operation failed: {0}")]
    OperationFailed(String),
}

/// Rejection from the mount-option validator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MountOptionError {
    #[error("mount options are required")]
    Empty,

    #[error("invalid mount option token: {token}")]
    InvalidToken { token: String },
}

impl MountOptionError {
    pub fn token(&self) -> Option<&str> {
        match self {
            Self::Empty => None,
            Self::InvalidToken { token } => Some(token),
        }
    }
}

/// Result type alias for system operations
pub type Result<T> = std::result::Result<T, SysError>;
