// SPDX-License-Identifier: GPL-3.0-only

//! Asynchronous transaction worker.
//!
//! One task per accepted transaction walks the steps in order, persisting
//! the record after every transition. The first failing step halts the
//! transaction and triggers best-effort compensation. The pool lock is
//! released once the record is terminal.

use std::sync::Arc;

use chrono::Utc;
use storage_contracts::{AgentOps, ExecRequest, OperationKind, OperationProgress, TableFile};
use storage_sys::{btrfs_tools, command, fstab};
use storage_types::{
    CONSERVATIVE_OPTIONS, LogLevel, PoolOptionsRecord, ResourceRef, StepAction, StepStatus, Tx,
    TxKind, UUID_TOKEN,
};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ExecutorSettings;
use crate::locks::{LockHolder, PoolLockManager};
use crate::pool_options::PoolOptionsStore;
use crate::progress::ProgressGauges;
use crate::tx_store::TxStore;

enum StepError {
    Failed {
        exit_code: Option<i32>,
        message: String,
    },
    /// Shutdown while waiting on a kernel operation; the record stays `running`.
    Interrupted,
}

impl StepError {
    fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            exit_code: None,
            message: message.into(),
        }
    }
}

enum Outcome {
    Completed,
    Failed(String),
    Interrupted,
}

#[derive(Clone)]
pub struct Executor {
    agent: Arc<dyn AgentOps>,
    store: TxStore,
    pool_options: PoolOptionsStore,
    locks: PoolLockManager,
    gauges: ProgressGauges,
    settings: ExecutorSettings,
    shutdown: CancellationToken,
}

impl Executor {
    pub fn new(
        agent: Arc<dyn AgentOps>,
        store: TxStore,
        pool_options: PoolOptionsStore,
        locks: PoolLockManager,
        gauges: ProgressGauges,
        settings: ExecutorSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            agent,
            store,
            pool_options,
            locks,
            gauges,
            settings,
            shutdown,
        }
    }

    /// Run `tx` on its own task. The caller must already hold the pool lock.
    pub fn spawn(&self, tx: Tx) -> JoinHandle<()> {
        let executor = self.clone();
        tokio::spawn(async move { executor.run(tx).await })
    }

    pub async fn run(&self, mut tx: Tx) {
        let tx_id = tx.id;
        let pool = tx.pool.clone();
        info!(%tx_id, kind = %tx.kind, pool = %pool, "transaction started");
        self.log(tx_id, LogLevel::Info, None, &format!("{} transaction started on {pool}", tx.kind));

        match self.drive(&mut tx).await {
            // the terminal save comes last: log readers stop once they see it
            Outcome::Completed => {
                self.after_success(&tx).await;
                self.log(tx_id, LogLevel::Info, None, "transaction succeeded");
                info!(%tx_id, pool = %pool, "transaction succeeded");
                tx.succeed(Utc::now());
                self.persist_final(&tx);
            }
            Outcome::Failed(message) => {
                self.log(tx_id, LogLevel::Error, None, &format!("transaction failed: {message}"));
                error!(%tx_id, pool = %pool, "transaction failed: {}", message);
                self.compensate(&tx).await;
                tx.fail(message, Utc::now());
                self.persist_final(&tx);
            }
            Outcome::Interrupted => {
                warn!(%tx_id, pool = %pool, "transaction interrupted by shutdown, left running");
                self.log(
                    tx_id,
                    LogLevel::Warn,
                    None,
                    "interrupted by shutdown; state unknown until inspected",
                );
                return;
            }
        }

        self.gauges.clear(&pool);
        self.locks.release(&pool, LockHolder::Transaction(tx_id));
    }

    async fn drive(&self, tx: &mut Tx) -> Outcome {
        for index in 0..tx.steps.len() {
            let step = tx.steps[index].step.clone();

            tx.start_step(index, Utc::now());
            if let Err(message) = self.persist(tx) {
                tx.finish_step(index, None, false, Utc::now());
                return Outcome::Failed(message);
            }
            self.log(tx.id, LogLevel::Info, Some(&step.id), &format!("running: {}", step.command));

            let mut result = self.run_step(tx, index).await;
            if result.is_ok() && step.action.is_long_running() {
                result = self.track(tx, index).await.map(|()| Some(0));
            }

            match result {
                Ok(exit_code) => {
                    tx.finish_step(index, exit_code, true, Utc::now());
                    self.log(tx.id, LogLevel::Info, Some(&step.id), "ok");
                    if let Err(message) = self.persist(tx) {
                        return Outcome::Failed(message);
                    }
                }
                Err(StepError::Interrupted) => return Outcome::Interrupted,
                Err(StepError::Failed { exit_code, message }) => {
                    tx.finish_step(index, exit_code, false, Utc::now());
                    self.log(tx.id, LogLevel::Error, Some(&step.id), &message);
                    return Outcome::Failed(format!("step {} failed: {message}", step.id));
                }
            }
        }

        Outcome::Completed
    }

    async fn run_step(&self, tx: &Tx, index: usize) -> Result<Option<i32>, StepError> {
        let step = &tx.steps[index].step;

        if step.action.is_table_edit() {
            self.edit_table(step.action, step.resource.as_ref()).await?;
            return Ok(None);
        }

        let (program, args) = step
            .argv
            .split_first()
            .ok_or_else(|| StepError::failed("step has no command"))?;
        let response = self
            .agent
            .execute(ExecRequest::new(program.clone(), args.iter().cloned()))
            .await
            .map_err(|e| StepError::failed(e.to_string()))?;

        debug!(tx_id = %tx.id, step_id = %step.id, exit_code = response.exit_code, "step returned");
        if response.success() {
            Ok(Some(response.exit_code))
        } else {
            let output = response.stdout.trim();
            let message = if output.is_empty() {
                format!("exit code {}", response.exit_code)
            } else {
                format!("exit code {}: {output}", response.exit_code)
            };
            Err(StepError::Failed {
                exit_code: Some(response.exit_code),
                message,
            })
        }
    }

    async fn edit_table(
        &self,
        action: StepAction,
        resource: Option<&ResourceRef>,
    ) -> Result<(), StepError> {
        let Some(ResourceRef::TableEntry {
            needle,
            line,
            uuid_of,
        }) = resource
        else {
            return Err(StepError::failed("table step without a table entry"));
        };

        let table = match action {
            StepAction::CrypttabEnsure | StepAction::CrypttabRemove => TableFile::Crypttab,
            _ => TableFile::Fstab,
        };

        match (action, line) {
            (StepAction::FstabEnsure | StepAction::CrypttabEnsure, Some(line)) => {
                let resolved = match uuid_of {
                    Some(device) if line.contains(UUID_TOKEN) => {
                        let uuid = self.resolve_uuid(device).await?;
                        fstab::resolve_uuid(line, &uuid)
                    }
                    _ => line.clone(),
                };
                self.agent
                    .ensure_line(table, &resolved)
                    .await
                    .map_err(|e| StepError::failed(e.to_string()))
            }
            (StepAction::FstabRemove | StepAction::CrypttabRemove, _) => self
                .agent
                .remove_lines_containing(table, needle)
                .await
                .map_err(|e| StepError::failed(e.to_string())),
            _ => Err(StepError::failed("ensure step without a line")),
        }
    }

    async fn resolve_uuid(&self, device: &str) -> Result<String, StepError> {
        let response = self
            .agent
            .execute(ExecRequest::new(
                "blkid",
                ["-s", "UUID", "-o", "value", device],
            ))
            .await
            .map_err(|e| StepError::failed(e.to_string()))?;
        let uuid = response.stdout.trim();
        if !response.success() || uuid.is_empty() {
            return Err(StepError::failed(format!("could not resolve UUID of {device}")));
        }
        Ok(uuid.to_string())
    }

    /// Poll a launched balance/replace until it stops, bounded by `max_polls`.
    async fn track(&self, tx: &Tx, index: usize) -> Result<(), StepError> {
        let step = &tx.steps[index].step;
        let operation = if step.action == StepAction::Replace {
            OperationKind::Replace
        } else {
            OperationKind::Balance
        };

        if self.settings.fast_complete {
            self.record_progress(tx, &step.id, &OperationProgress::completed(operation));
            return Ok(());
        }

        let period = self.settings.poll_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cancel = self.shutdown.child_token();

        for poll in 1..=self.settings.max_polls {
            tokio::select! {
                _ = cancel.cancelled() => return Err(StepError::Interrupted),
                _ = ticker.tick() => {}
            }

            let status = match operation {
                OperationKind::Balance => self
                    .agent
                    .balance_status(&tx.pool)
                    .await
                    .map(OperationProgress::from),
                OperationKind::Replace => self
                    .agent
                    .replace_status(&tx.pool)
                    .await
                    .map(OperationProgress::from),
            };

            match status {
                Ok(progress) => {
                    self.record_progress(tx, &step.id, &progress);
                    if progress.is_done() {
                        return Ok(());
                    }
                }
                Err(e) => {
                    warn!(tx_id = %tx.id, poll, "status query failed: {}", e);
                    self.log(
                        tx.id,
                        LogLevel::Warn,
                        Some(&step.id),
                        &format!("status query failed: {e}"),
                    );
                }
            }
        }

        Err(StepError::failed(format!(
            "still running after {} polls",
            self.settings.max_polls
        )))
    }

    fn record_progress(&self, tx: &Tx, step_id: &str, progress: &OperationProgress) {
        self.gauges.set(&tx.pool, progress.percent);
        info!(
            tx_id = %tx.id,
            step_id,
            percent = progress.percent,
            left = ?progress.left,
            completed = ?progress.completed,
            total = ?progress.total,
            "progress"
        );
        let payload = serde_json::to_string(progress).unwrap_or_default();
        self.log(tx.id, LogLevel::Info, Some(step_id), &format!("progress {payload}"));
    }

    /// Best-effort cleanup after a failed step. Errors are logged and ignored.
    async fn compensate(&self, tx: &Tx) {
        if !tx.fstab_lines.is_empty() {
            let needle = fstab::mount_needle(&tx.pool);
            match self
                .agent
                .remove_lines_containing(TableFile::Fstab, &needle)
                .await
            {
                Ok(()) => self.log(tx.id, LogLevel::Warn, None, "compensation: removed fstab entry"),
                Err(e) => debug!(tx_id = %tx.id, "fstab compensation failed: {}", e),
            }
        }

        let opened = tx
            .steps
            .iter()
            .rev()
            .filter(|s| s.step.action == StepAction::LuksOpen && s.status == StepStatus::Ok)
            .filter_map(|s| s.step.mapping());
        for (name, _) in opened {
            let request = ExecRequest::new("cryptsetup", ["close", name]);
            let rendered = command::render(&["cryptsetup", "close", name]);
            match self.agent.execute(request).await {
                Ok(response) if response.success() => {
                    self.log(tx.id, LogLevel::Warn, None, &format!("compensation: {rendered}"));
                }
                Ok(response) => debug!(
                    tx_id = %tx.id,
                    "{} exited with {}", rendered, response.exit_code
                ),
                Err(e) => debug!(tx_id = %tx.id, "{} failed: {}", rendered, e),
            }
        }
    }

    /// Keep the pool record in step with what the transaction left behind.
    async fn after_success(&self, tx: &Tx) {
        if tx.kind == TxKind::Destroy {
            if let Err(e) = self.pool_options.remove(&tx.pool) {
                warn!(tx_id = %tx.id, "failed to drop pool record: {}", e);
            }
            return;
        }

        let members = self.current_members(&tx.pool).await;
        let result = match tx.kind {
            TxKind::Create => self.pool_options.upsert(PoolOptionsRecord {
                mount: tx.pool.clone(),
                mount_options: tx
                    .mount_options
                    .clone()
                    .unwrap_or_else(|| CONSERVATIVE_OPTIONS.to_string()),
                devices: members.unwrap_or_else(|| {
                    tx.mappings.iter().map(|m| m.mapper_path()).collect()
                }),
                mappings: tx.mappings.clone(),
            }),
            _ => self
                .pool_options
                .update(&tx.pool, |record| {
                    for mapping in &tx.mappings {
                        if !record.mappings.contains(mapping) {
                            record.mappings.push(mapping.clone());
                        }
                    }
                    if let Some(members) = members {
                        record.devices = members;
                        let devices = &record.devices;
                        record
                            .mappings
                            .retain(|m| devices.contains(&m.mapper_path()));
                    }
                })
                .map(|_| ()),
        };

        if let Err(e) = result {
            warn!(tx_id = %tx.id, "failed to update pool record: {}", e);
        }
    }

    async fn current_members(&self, mount: &str) -> Option<Vec<String>> {
        let request = ExecRequest::new("btrfs", ["filesystem", "show", "--raw", mount]);
        match self.agent.execute(request).await {
            Ok(response) if response.success() => {
                let members = btrfs_tools::member_devices(&response.stdout);
                (!members.is_empty()).then_some(members)
            }
            Ok(response) => {
                warn!("btrfs filesystem show {} exited with {}", mount, response.exit_code);
                None
            }
            Err(e) => {
                warn!("could not query members of {}: {}", mount, e);
                None
            }
        }
    }

    fn persist(&self, tx: &Tx) -> Result<(), String> {
        self.store.save(tx).map_err(|e| {
            error!(tx_id = %tx.id, "failed to persist transaction: {}", e);
            e.to_string()
        })
    }

    fn persist_final(&self, tx: &Tx) {
        if let Err(message) = self.persist(tx) {
            warn!(tx_id = %tx.id, "terminal state not recorded, record stays non-terminal: {}", message);
        }
    }

    fn log(&self, tx_id: Uuid, level: LogLevel, step_id: Option<&str>, message: &str) {
        if let Err(e) = self.store.append_log(tx_id, level, step_id, message) {
            warn!(%tx_id, "failed to append transaction log: {}", e);
        }
    }
}
