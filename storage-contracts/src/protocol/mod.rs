// SPDX-License-Identifier: GPL-3.0-only

pub mod error;
pub mod operations;

pub use error::{StorageError, StorageErrorKind};
pub use operations::{
    BalanceStatus, ExecRequest, ExecResponse, OperationKind, OperationProgress, ReplaceStatus,
    TableFile, TableLineRequest,
};
