// SPDX-License-Identifier: GPL-3.0-only

use std::sync::Arc;

use futures_util::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use uuid::Uuid;
use zbus::object_server::SignalEmitter;
use zbus::{Connection, fdo, interface};

use crate::engine::{
    ApplyResponse, ChangeRequest, CreateRequest, DestroyRequest, OptionsRequest, PoolEngine,
};
use crate::error::ServiceError;

pub const POOLS_PATH: &str = "/org/nasos/Storage/Pools";

/// D-Bus surface of the pool transaction engine. Requests and replies are JSON strings.
pub struct PoolsHandler {
    engine: Arc<PoolEngine>,
}

impl PoolsHandler {
    pub fn new(engine: Arc<PoolEngine>) -> Self {
        Self { engine }
    }
}

fn parse<T: DeserializeOwned>(json: &str) -> fdo::Result<T> {
    serde_json::from_str(json).map_err(|error| {
        ServiceError::validation("invalid_spec", format!("malformed request: {error}")).into()
    })
}

fn parse_tx_id(tx_id: &str) -> fdo::Result<Uuid> {
    Uuid::parse_str(tx_id).map_err(|_| {
        ServiceError::NotFound {
            code: "tx_not_found",
            id: tx_id.to_string(),
        }
        .into()
    })
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value)
        .map_err(|error| fdo::Error::Failed(format!("Serialization error: {error}")))
}

#[interface(name = "org.nasos.Storage.Pools1")]
impl PoolsHandler {
    #[zbus(signal)]
    async fn log_line(ctxt: &SignalEmitter<'_>, tx_id: &str, line: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn log_closed(ctxt: &SignalEmitter<'_>, tx_id: &str) -> zbus::Result<()>;

    /// Plan a new pool, returns a JSON `Plan`
    async fn plan_create(&self, request: &str) -> fdo::Result<String> {
        let request: CreateRequest = parse(request)?;
        let plan = self.engine.plan_create(&request).await?;
        to_json(&plan)
    }

    /// Start creating a pool, returns `{"tx_id": ...}`
    async fn apply_create(&self, request: &str) -> fdo::Result<String> {
        let request: CreateRequest = parse(request)?;
        tracing::info!("Create requested for {}", request.spec.mountpoint);
        let tx_id = self.engine.apply_create(&request).await?;
        to_json(&ApplyResponse { tx_id })
    }

    async fn plan_device_change(&self, request: &str) -> fdo::Result<String> {
        let request: ChangeRequest = parse(request)?;
        let plan = self.engine.plan_change(&request).await?;
        to_json(&plan)
    }

    async fn apply_device_change(&self, request: &str) -> fdo::Result<String> {
        let request: ChangeRequest = parse(request)?;
        tracing::info!("Device change requested for {}", request.mount);
        let tx_id = self.engine.apply_change(&request).await?;
        to_json(&ApplyResponse { tx_id })
    }

    async fn plan_destroy(&self, request: &str) -> fdo::Result<String> {
        let request: DestroyRequest = parse(request)?;
        let plan = self.engine.plan_destroy(&request).await?;
        to_json(&plan)
    }

    async fn apply_destroy(&self, request: &str) -> fdo::Result<String> {
        let request: DestroyRequest = parse(request)?;
        tracing::info!("Destroy requested for {}", request.mount);
        let tx_id = self.engine.apply_destroy(&request).await?;
        to_json(&ApplyResponse { tx_id })
    }

    async fn get_options(&self, mount: &str) -> fdo::Result<String> {
        let options = self.engine.get_options(mount)?;
        to_json(&json!({ "mount": mount, "mountOptions": options }))
    }

    /// Returns a JSON `OptionsChange`
    async fn change_options(&self, request: &str) -> fdo::Result<String> {
        let request: OptionsRequest = parse(request)?;
        let change = self.engine.change_options(&request).await?;
        to_json(&change)
    }

    async fn get_transaction(&self, tx_id: &str) -> fdo::Result<String> {
        let tx = self.engine.status(parse_tx_id(tx_id)?)?;
        to_json(&tx)
    }

    async fn list_transactions(&self) -> fdo::Result<String> {
        let txs = self.engine.list_transactions()?;
        to_json(&txs)
    }

    /// Log bytes from `offset`, returns `{"chunk": ..., "nextOffset": ...}`
    async fn read_log(&self, tx_id: &str, offset: u64) -> fdo::Result<String> {
        let (chunk, next_offset) = self.engine.read_log(parse_tx_id(tx_id)?, offset)?;
        to_json(&json!({ "chunk": chunk, "nextOffset": next_offset }))
    }

    /// Stream the log as `LogLine` signals followed by `LogClosed`
    async fn watch_log(
        &self,
        #[zbus(connection)] connection: &Connection,
        tx_id: &str,
    ) -> fdo::Result<()> {
        let id = parse_tx_id(tx_id)?;
        let lines = self.engine.watch_log(id)?;
        let connection = connection.clone();
        let tx_id = id.to_string();

        tokio::spawn(async move {
            let emitter = match SignalEmitter::new(&connection, POOLS_PATH) {
                Ok(emitter) => emitter,
                Err(error) => {
                    tracing::warn!("Signal context error: {}", error);
                    return;
                }
            };

            let mut lines = std::pin::pin!(lines);
            while let Some(line) = lines.next().await {
                if let Err(error) = Self::log_line(&emitter, &tx_id, &line).await {
                    tracing::debug!("Stopping log stream for {}: {}", tx_id, error);
                    return;
                }
            }
            Self::log_closed(&emitter, &tx_id).await.ok();
        });

        Ok(())
    }

    /// Latest percent of a running balance/replace, `{"percent": null}` when idle
    async fn progress(&self, mount: &str) -> fdo::Result<String> {
        to_json(&json!({ "mount": mount, "percent": self.engine.progress(mount) }))
    }

    /// Mark a transaction stuck since the last restart as failed and unlock its pool
    async fn abandon(&self, tx_id: &str) -> fdo::Result<String> {
        let tx = self.engine.abandon(parse_tx_id(tx_id)?)?;
        to_json(&tx)
    }
}
