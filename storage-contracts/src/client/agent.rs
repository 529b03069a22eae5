// SPDX-License-Identifier: GPL-3.0-only

use async_trait::async_trait;
use zbus::{Connection, proxy};

use crate::protocol::{
    BalanceStatus, ExecRequest, ExecResponse, ReplaceStatus, TableFile, TableLineRequest,
};
use crate::{AgentOps, StorageError};

/// D-Bus proxy for the privileged agent. Payloads are JSON strings.
#[proxy(
    interface = "org.nasos.Agent1",
    default_service = "org.nasos.Agent",
    default_path = "/org/nasos/Agent"
)]
pub trait AgentInterface {
    /// Run a command, returns a JSON `ExecResponse`
    async fn execute(&self, request: &str) -> zbus::Result<String>;

    /// Returns a JSON `BalanceStatus` for the filesystem mounted at `mount`
    async fn balance_status(&self, mount: &str) -> zbus::Result<String>;

    /// Returns a JSON `ReplaceStatus` for the filesystem mounted at `mount`
    async fn replace_status(&self, mount: &str) -> zbus::Result<String>;

    /// Append a line to fstab/crypttab unless already present
    async fn ensure_line(&self, request: &str) -> zbus::Result<()>;

    /// Drop every fstab/crypttab line containing the given text
    async fn remove_lines_containing(&self, request: &str) -> zbus::Result<()>;
}

/// Client for the agent over the system bus
pub struct AgentClient {
    proxy: AgentInterfaceProxy<'static>,
}

impl AgentClient {
    /// Connect to the agent on the system bus
    pub async fn system() -> Result<Self, StorageError> {
        let connection = Connection::system().await.map_err(|e| {
            StorageError::unavailable(format!("Failed to connect to system bus: {e}"))
        })?;
        Self::with_connection(&connection).await
    }

    pub async fn with_connection(connection: &Connection) -> Result<Self, StorageError> {
        let proxy = AgentInterfaceProxy::new(connection).await.map_err(|e| {
            StorageError::unavailable(format!("Failed to create agent proxy: {e}"))
        })?;

        Ok(Self { proxy })
    }

    fn table_request(table: TableFile, text: &str) -> Result<String, StorageError> {
        let request = TableLineRequest {
            table,
            text: text.to_string(),
        };
        Ok(serde_json::to_string(&request)?)
    }
}

#[async_trait]
impl AgentOps for AgentClient {
    async fn execute(&self, request: ExecRequest) -> Result<ExecResponse, StorageError> {
        let payload = serde_json::to_string(&request)?;
        let json = self.proxy.execute(&payload).await?;
        Ok(serde_json::from_str(&json)?)
    }

    async fn balance_status(&self, mount: &str) -> Result<BalanceStatus, StorageError> {
        let json = self.proxy.balance_status(mount).await?;
        Ok(serde_json::from_str(&json)?)
    }

    async fn replace_status(&self, mount: &str) -> Result<ReplaceStatus, StorageError> {
        let json = self.proxy.replace_status(mount).await?;
        Ok(serde_json::from_str(&json)?)
    }

    async fn ensure_line(&self, table: TableFile, line: &str) -> Result<(), StorageError> {
        let payload = Self::table_request(table, line)?;
        Ok(self.proxy.ensure_line(&payload).await?)
    }

    async fn remove_lines_containing(
        &self,
        table: TableFile,
        needle: &str,
    ) -> Result<(), StorageError> {
        let payload = Self::table_request(table, needle)?;
        Ok(self.proxy.remove_lines_containing(&payload).await?)
    }
}
