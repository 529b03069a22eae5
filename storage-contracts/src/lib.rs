// SPDX-License-Identifier: GPL-3.0-only

pub mod client;
pub mod protocol;
pub mod traits;

pub use client::AgentClient;
pub use protocol::{
    BalanceStatus, ExecRequest, ExecResponse, OperationKind, OperationProgress, ReplaceStatus,
    StorageError, StorageErrorKind, TableFile, TableLineRequest,
};
pub use traits::AgentOps;
