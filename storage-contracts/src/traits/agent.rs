// SPDX-License-Identifier: GPL-3.0-only

use async_trait::async_trait;

use crate::protocol::{BalanceStatus, ExecRequest, ExecResponse, ReplaceStatus, TableFile};
use crate::StorageError;

/// Capabilities consumed from the privileged agent.
///
/// Every call is a synchronous request/response with no retry. A non-zero
/// exit code is a successful call; `Err` means the agent could not be reached
/// or answered with something unreadable.
#[async_trait]
pub trait AgentOps: Send + Sync {
    async fn execute(&self, request: ExecRequest) -> Result<ExecResponse, StorageError>;

    async fn balance_status(&self, mount: &str) -> Result<BalanceStatus, StorageError>;

    async fn replace_status(&self, mount: &str) -> Result<ReplaceStatus, StorageError>;

    async fn ensure_line(&self, table: TableFile, line: &str) -> Result<(), StorageError>;

    async fn remove_lines_containing(
        &self,
        table: TableFile,
        needle: &str,
    ) -> Result<(), StorageError>;
}
