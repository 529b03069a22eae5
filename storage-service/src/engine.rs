// SPDX-License-Identifier: GPL-3.0-only

//! Accept path for pool operations.
//!
//! Every apply request is planned, guarded (confirmation, signatures,
//! cleanliness), checked against the pool lock and persisted before the
//! executor takes over. Only rejections on this path are synchronous.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::Stream;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use storage_contracts::{AgentOps, ExecRequest, TableFile};
use storage_sys::{btrfs_tools, command, fstab, mountpoint, probe, validate_mount_options};
use storage_types::{
    DeviceChange, LogLevel, LuksMapping, OptionsChange, Plan, PoolOptionsRecord, PoolSpec,
    PoolTopology, RaidProfile, StepAction, StepStatus, Tx, TxKind,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{ServiceConfig, StreamSettings};
use crate::error::{Result, ServiceError};
use crate::executor::Executor;
use crate::locks::{LockHolder, PoolLockManager};
use crate::planner;
use crate::pool_options::PoolOptionsStore;
use crate::progress::ProgressGauges;
use crate::tx_store::TxStore;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRequest {
    pub spec: PoolSpec,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub confirm: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeRequest {
    pub mount: String,
    pub change: DeviceChange,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub confirm: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DestroyRequest {
    pub mount: String,
    #[serde(default)]
    pub wipe: bool,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub confirm: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionsRequest {
    pub mount: String,
    pub mount_options: String,
}

impl CreateRequest {
    fn canonical(&self) -> Result<Self> {
        let mut request = self.clone();
        request.spec.mountpoint = planner::normalize_mountpoint(&self.spec.mountpoint)?;
        Ok(request)
    }
}

impl ChangeRequest {
    fn canonical(&self) -> Result<Self> {
        Ok(Self {
            mount: planner::normalize_mountpoint(&self.mount)?,
            ..self.clone()
        })
    }
}

impl DestroyRequest {
    fn canonical(&self) -> Result<Self> {
        Ok(Self {
            mount: planner::normalize_mountpoint(&self.mount)?,
            ..self.clone()
        })
    }
}

impl OptionsRequest {
    fn canonical(&self) -> Result<Self> {
        Ok(Self {
            mount: planner::normalize_mountpoint(&self.mount)?,
            ..self.clone()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResponse {
    pub tx_id: Uuid,
}

pub const ABANDON_REASON: &str = "abandoned by operator";

pub struct PoolEngine {
    agent: Arc<dyn AgentOps>,
    store: TxStore,
    pool_options: PoolOptionsStore,
    locks: PoolLockManager,
    gauges: ProgressGauges,
    executor: Executor,
    sysfs_root: PathBuf,
    stream: StreamSettings,
    /// Unfinished transactions found at startup; only these may be abandoned.
    recovered: Arc<Mutex<HashSet<Uuid>>>,
}

impl PoolEngine {
    pub fn new(
        config: &ServiceConfig,
        agent: Arc<dyn AgentOps>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let store = TxStore::open(config.transactions_dir())?;
        let pool_options = PoolOptionsStore::open(config.pool_options_path())?;
        let locks = PoolLockManager::new();
        let gauges = ProgressGauges::new();
        let executor = Executor::new(
            agent.clone(),
            store.clone(),
            pool_options.clone(),
            locks.clone(),
            gauges.clone(),
            config.executor_settings(),
            shutdown,
        );

        Ok(Self {
            agent,
            store,
            pool_options,
            locks,
            gauges,
            executor,
            sysfs_root: config.sysfs_root.clone(),
            stream: config.stream_settings(),
            recovered: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Re-lock pools whose transaction never reached a terminal state.
    ///
    /// Such transactions are not resumed; their pools stay locked until an
    /// operator abandons them.
    pub fn recover(&self) -> Result<Vec<Uuid>> {
        let mut stuck = Vec::new();
        for tx in self.store.list()? {
            if tx.is_terminal() {
                continue;
            }
            warn!(
                tx_id = %tx.id,
                pool = %tx.pool,
                "transaction was in flight at last shutdown; pool stays locked until abandoned"
            );
            if let Err(holder) = self
                .locks
                .try_acquire(&tx.pool, LockHolder::Transaction(tx.id))
            {
                warn!(tx_id = %tx.id, ?holder, "pool {} already locked by another stuck transaction", tx.pool);
            }
            self.recovered_set().insert(tx.id);
            stuck.push(tx.id);
        }
        Ok(stuck)
    }

    fn recovered_set(&self) -> std::sync::MutexGuard<'_, HashSet<Uuid>> {
        self.recovered.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub async fn plan_create(&self, request: &CreateRequest) -> Result<Plan> {
        let request = &request.canonical()?;
        let spec = &request.spec;
        planner::validate_spec(spec)?;
        if self.pool_options.get(&spec.mountpoint)?.is_some() {
            return Err(ServiceError::validation(
                "invalid_spec",
                format!("a pool is already recorded at {}", spec.mountpoint),
            ));
        }
        self.ensure_unclaimed(&spec.devices, None)?;

        let defaults = storage_sys::default_options(&spec.devices, &self.sysfs_root);
        let mut plan = planner::plan_create(spec, defaults)?;
        self.probe_signatures(&spec.devices, request.force, &mut plan.warnings)
            .await?;
        Ok(plan)
    }

    pub async fn apply_create(&self, request: &CreateRequest) -> Result<Uuid> {
        let request = &request.canonical()?;
        self.ensure_unlocked(&request.spec.mountpoint)?;
        let plan = self.plan_create(request).await?;
        planner::check_confirmation(&plan, &request.confirm)?;

        let mut tx = Tx::new(
            TxKind::Create,
            request.spec.mountpoint.clone(),
            plan.steps.clone(),
            Utc::now(),
        );
        tx.mount_options = Some(plan.mount_options.clone());
        tx.fstab_lines = plan.fstab_lines.clone();
        tx.mappings = opened_mappings(&plan);
        self.accept(tx)
    }

    pub async fn plan_change(&self, request: &ChangeRequest) -> Result<Plan> {
        let request = &request.canonical()?;
        let record = self.pool_options.get(&request.mount)?.ok_or_else(|| {
            ServiceError::NotFound {
                code: "pool_not_found",
                id: request.mount.clone(),
            }
        })?;

        let joining: Vec<String> = match &request.change {
            DeviceChange::Add { devices, .. } => devices.clone(),
            DeviceChange::Replace { new, .. } => vec![new.clone()],
            DeviceChange::Remove { .. } => Vec::new(),
        };
        self.ensure_unclaimed(&joining, Some(&request.mount))?;

        let (data_profile, metadata_profile) = self.current_profiles(&request.mount).await?;
        let topology = PoolTopology {
            mount: record.mount.clone(),
            devices: record.devices.clone(),
            data_profile,
            metadata_profile,
            mappings: record.mappings.clone(),
        };

        let mut plan = planner::plan_change(&topology, &request.change)?;
        plan.mount_options = record.mount_options;
        self.probe_signatures(&joining, request.force, &mut plan.warnings)
            .await?;
        Ok(plan)
    }

    pub async fn apply_change(&self, request: &ChangeRequest) -> Result<Uuid> {
        let request = &request.canonical()?;
        self.ensure_unlocked(&request.mount)?;
        let plan = self.plan_change(request).await?;
        planner::check_confirmation(&plan, &request.confirm)?;

        let kind = match request.change {
            DeviceChange::Add { .. } => TxKind::AddDevices,
            DeviceChange::Remove { .. } => TxKind::RemoveDevices,
            DeviceChange::Replace { .. } => TxKind::ReplaceDevice,
        };
        let mut tx = Tx::new(kind, request.mount.clone(), plan.steps.clone(), Utc::now());
        tx.mappings = opened_mappings(&plan);
        self.accept(tx)
    }

    async fn current_profiles(&self, mount: &str) -> Result<(RaidProfile, RaidProfile)> {
        let response = self
            .agent
            .execute(ExecRequest::new("btrfs", ["filesystem", "df", mount]))
            .await?;
        if !response.success() {
            warn!(
                "btrfs filesystem df {} exited with {}, assuming {}",
                mount,
                response.exit_code,
                btrfs_tools::FALLBACK_PROFILE
            );
        }
        Ok(btrfs_tools::parse_profiles(&response.stdout))
    }

    pub async fn plan_destroy(&self, request: &DestroyRequest) -> Result<Plan> {
        let request = &request.canonical()?;
        let record = self.pool_options.get(&request.mount)?.ok_or_else(|| {
            ServiceError::NotFound {
                code: "pool_not_found",
                id: request.mount.clone(),
            }
        })?;

        let mut plan = planner::plan_destroy(&record, request.wipe);

        let listing = self
            .agent
            .execute(ExecRequest::new("ls", ["-A", request.mount.as_str()]))
            .await?;
        let foreign = if listing.success() {
            mountpoint::unexpected_entries(&listing.stdout)
        } else {
            vec![format!("<unreadable: ls exited with {}>", listing.exit_code)]
        };

        if !foreign.is_empty() {
            let message = format!(
                "{} holds unexpected entries: {}",
                request.mount,
                foreign.join(", ")
            );
            if !request.force {
                return Err(ServiceError::precondition("mountpoint_not_clean", message));
            }
            plan.warnings.push(message);
        }

        Ok(plan)
    }

    pub async fn apply_destroy(&self, request: &DestroyRequest) -> Result<Uuid> {
        let request = &request.canonical()?;
        self.ensure_unlocked(&request.mount)?;
        let plan = self.plan_destroy(request).await?;
        planner::check_confirmation(&plan, &request.confirm)?;

        let tx = Tx::new(
            TxKind::Destroy,
            request.mount.clone(),
            plan.steps,
            Utc::now(),
        );
        self.accept(tx)
    }

    fn ensure_unlocked(&self, pool: &str) -> Result<()> {
        match self.locks.current(pool) {
            Some(holder) => Err(ServiceError::locked(pool, holder)),
            None => Ok(()),
        }
    }

    fn ensure_unclaimed(&self, devices: &[String], except: Option<&str>) -> Result<()> {
        let in_use = self.pool_options.devices_in_use(except)?;
        match devices.iter().find(|device| in_use.contains(device)) {
            Some(device) => Err(ServiceError::validation(
                "device_in_use",
                format!("{device} already backs another pool"),
            )),
            None => Ok(()),
        }
    }

    /// Run the non-destructive probe over `devices`; signatures are warnings
    /// with `force` and a precondition failure without it.
    async fn probe_signatures(
        &self,
        devices: &[String],
        force: bool,
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        let mut found = Vec::new();
        for device in devices {
            let argv = probe::wipefs_probe_argv(device);
            let response = self
                .agent
                .execute(ExecRequest::new(argv[0].clone(), argv[1..].iter().cloned()))
                .await?;
            if !response.success() {
                return Err(ServiceError::precondition(
                    "probe_failed",
                    format!("{} exited with {}", command::render(&argv), response.exit_code),
                ));
            }

            let signatures = probe::parse_signatures(&response.stdout);
            if !signatures.is_empty() {
                found.push(format!(
                    "{device} carries existing signatures: {}",
                    signatures.join(", ")
                ));
            }
        }

        if !found.is_empty() && !force {
            return Err(ServiceError::precondition(
                "signatures_present",
                format!("{}; pass force to overwrite", found.join("; ")),
            ));
        }
        warnings.extend(found);
        Ok(())
    }

    /// Lock, persist and hand the transaction to the executor.
    fn accept(&self, tx: Tx) -> Result<Uuid> {
        let tx_id = tx.id;
        let holder = LockHolder::Transaction(tx_id);
        if let Err(existing) = self.locks.try_acquire(&tx.pool, holder) {
            return Err(ServiceError::locked(&tx.pool, existing));
        }

        if let Err(e) = self.store.create(&tx) {
            self.locks.release(&tx.pool, holder);
            return Err(e);
        }

        info!(%tx_id, kind = %tx.kind, pool = %tx.pool, steps = tx.steps.len(), "transaction accepted");
        self.executor.spawn(tx);
        Ok(tx_id)
    }

    pub fn get_options(&self, mount: &str) -> Result<String> {
        self.pool_options
            .options_for(&planner::normalize_mountpoint(mount)?)
    }

    /// Remount with new options; on remount failure rewrite fstab instead.
    ///
    /// The stored options only change once the new options are live or
    /// written to fstab.
    pub async fn change_options(&self, request: &OptionsRequest) -> Result<OptionsChange> {
        let request = request.canonical()?;
        let mount = request.mount.as_str();
        let options = validate_mount_options(&request.mount_options)?;

        let holder = LockHolder::OptionsChange(Uuid::new_v4());
        if let Err(existing) = self.locks.try_acquire(mount, holder) {
            return Err(ServiceError::locked(mount, existing));
        }
        let result = self.apply_options(mount, &options).await;
        self.locks.release(mount, holder);
        result
    }

    async fn apply_options(&self, mount: &str, options: &str) -> Result<OptionsChange> {
        let record = self
            .pool_options
            .get(mount)?
            .ok_or_else(|| ServiceError::NotFound {
                code: "pool_not_found",
                id: mount.to_string(),
            })?;
        let old = record.mount_options.clone();

        let reboot_required = !self.remount(mount, options).await;
        if reboot_required {
            self.rewrite_fstab(&record, options).await?;
        }

        if let Err(e) = self.pool_options.set_options(mount, options) {
            self.roll_back_options(&record, reboot_required).await;
            return Err(e);
        }

        info!(
            target: "audit",
            mount,
            old = %old,
            new = %options,
            reboot_required,
            "mount options changed"
        );

        Ok(OptionsChange {
            mount_options: options.to_string(),
            reboot_required,
            updated_at: Utc::now(),
        })
    }

    /// Returns whether the kernel accepted the new options.
    async fn remount(&self, mount: &str, options: &str) -> bool {
        let remount_options = format!("remount,{options}");
        let remount = self
            .agent
            .execute(ExecRequest::new(
                "mount",
                ["-o", remount_options.as_str(), mount],
            ))
            .await;
        match remount {
            Ok(response) if response.success() => true,
            Ok(response) => {
                warn!("remount of {} exited with {}", mount, response.exit_code);
                false
            }
            Err(e) => {
                warn!("remount of {} failed: {}", mount, e);
                false
            }
        }
    }

    /// Put the recorded options back after the store refused the new ones.
    async fn roll_back_options(&self, record: &PoolOptionsRecord, rewrote_fstab: bool) {
        let mount = record.mount.as_str();
        let old = record.mount_options.as_str();
        if rewrote_fstab {
            if let Err(e) = self.rewrite_fstab(record, old).await {
                warn!("could not restore fstab entry of {}: {}", mount, e);
            }
        } else if !self.remount(mount, old).await {
            warn!("could not restore mount options of {}", mount);
        }
    }

    /// Replace the fstab entry of `record` with one carrying `options`.
    ///
    /// If the new line cannot be written the previous line is put back.
    async fn rewrite_fstab(&self, record: &PoolOptionsRecord, options: &str) -> Result<()> {
        let mount = record.mount.as_str();
        let source = record.devices.first().ok_or_else(|| {
            ServiceError::precondition(
                "pool_not_found",
                format!("no recorded device to resolve fstab entry of {mount}"),
            )
        })?;

        let uuid = self
            .agent
            .execute(ExecRequest::new(
                "blkid",
                ["-s", "UUID", "-o", "value", source.as_str()],
            ))
            .await?;
        if !uuid.success() || uuid.stdout.trim().is_empty() {
            return Err(ServiceError::precondition(
                "pool_not_found",
                format!("could not resolve UUID of {source}"),
            ));
        }

        let line = fstab::resolve_uuid(&fstab::fstab_line(mount, options), &uuid.stdout);
        self.agent
            .remove_lines_containing(TableFile::Fstab, &fstab::mount_needle(mount))
            .await?;
        if let Err(e) = self.agent.ensure_line(TableFile::Fstab, &line).await {
            let previous = fstab::resolve_uuid(
                &fstab::fstab_line(mount, &record.mount_options),
                &uuid.stdout,
            );
            if let Err(restore) = self.agent.ensure_line(TableFile::Fstab, &previous).await {
                warn!("could not restore fstab entry of {}: {}", mount, restore);
            }
            return Err(e.into());
        }
        Ok(())
    }

    pub fn status(&self, tx_id: Uuid) -> Result<Tx> {
        self.store.load(tx_id)?.ok_or_else(|| ServiceError::NotFound {
            code: "tx_not_found",
            id: tx_id.to_string(),
        })
    }

    pub fn list_transactions(&self) -> Result<Vec<Tx>> {
        self.store.list()
    }

    pub fn read_log(&self, tx_id: Uuid, offset: u64) -> Result<(String, u64)> {
        self.store.read_log(tx_id, offset)
    }

    pub fn progress(&self, mount: &str) -> Option<u8> {
        let mount = planner::normalize_mountpoint(mount).ok()?;
        self.gauges.get(&mount)
    }

    /// Mark a transaction left over from a previous run as failed and unlock its pool.
    pub fn abandon(&self, tx_id: Uuid) -> Result<Tx> {
        let mut tx = self.status(tx_id)?;
        if tx.is_terminal() {
            return Err(ServiceError::precondition(
                "tx_finished",
                format!("transaction {tx_id} already finished"),
            ));
        }
        if !self.recovered_set().contains(&tx_id) {
            return Err(ServiceError::precondition(
                "tx_active",
                format!("transaction {tx_id} is still being executed"),
            ));
        }

        let now = Utc::now();
        if let Some(index) = tx
            .steps
            .iter()
            .position(|step| step.status == StepStatus::Running)
        {
            tx.finish_step(index, None, false, now);
        }
        tx.fail(ABANDON_REASON, now);
        self.store.save(&tx)?;
        self.store
            .append_log(tx_id, LogLevel::Warn, None, ABANDON_REASON)?;

        self.locks.release(&tx.pool, LockHolder::Transaction(tx_id));
        self.recovered_set().remove(&tx_id);
        warn!(%tx_id, pool = %tx.pool, "transaction abandoned by operator");
        Ok(tx)
    }

    /// Replay the log, then tail it until the transaction ends or the
    /// stream's time bound passes.
    pub fn watch_log(&self, tx_id: Uuid) -> Result<impl Stream<Item = String> + Send + 'static> {
        self.store.log_len(tx_id)?;
        let tail = LogTail {
            store: self.store.clone(),
            tx_id,
            offset: 0,
            buffered: VecDeque::new(),
            deadline: Instant::now() + self.stream.max_duration,
            interval: self.stream.poll_interval,
            finished: false,
        };
        Ok(stream::unfold(tail, LogTail::next_line))
    }
}

fn opened_mappings(plan: &Plan) -> Vec<LuksMapping> {
    plan.steps
        .iter()
        .filter(|step| step.action == StepAction::LuksOpen)
        .filter_map(|step| step.mapping())
        .map(|(name, device)| LuksMapping {
            name: name.to_string(),
            device: device.to_string(),
        })
        .collect()
}

struct LogTail {
    store: TxStore,
    tx_id: Uuid,
    offset: u64,
    buffered: VecDeque<String>,
    deadline: Instant,
    interval: Duration,
    finished: bool,
}

impl LogTail {
    fn pull(&mut self) -> bool {
        match self.store.log_len(self.tx_id) {
            Ok(size) if size > self.offset => {}
            Ok(_) => return true,
            Err(_) => return false,
        }
        match self.store.read_log(self.tx_id, self.offset) {
            Ok((chunk, next)) => {
                self.offset = next;
                self.buffered.extend(chunk.lines().map(ToString::to_string));
                true
            }
            Err(_) => false,
        }
    }

    fn is_terminal(&self) -> bool {
        self.store
            .load(self.tx_id)
            .ok()
            .flatten()
            .is_none_or(|tx| tx.is_terminal())
    }

    async fn next_line(mut self) -> Option<(String, Self)> {
        loop {
            if let Some(line) = self.buffered.pop_front() {
                return Some((line, self));
            }
            if self.finished || Instant::now() >= self.deadline {
                return None;
            }
            if !self.pull() {
                return None;
            }
            if !self.buffered.is_empty() {
                continue;
            }

            if self.is_terminal() {
                // lines written between the last pull and the final save
                self.pull();
                self.finished = true;
                continue;
            }

            let remaining = self.deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.interval.min(remaining)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::StreamExt;
    use storage_types::EncryptionSpec;

    use super::*;
    use crate::testing::{AgentCall, ScriptedAgent, TEST_UUID};

    struct Fixture {
        _dir: tempfile::TempDir,
        config: ServiceConfig,
        agent: ScriptedAgent,
        engine: PoolEngine,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ServiceConfig {
            state_dir: dir.path().to_path_buf(),
            poll_interval_ms: 1,
            stream_poll_interval_ms: 5,
            stream_max_secs: 5,
            sysfs_root: dir.path().join("sys"),
            ..ServiceConfig::default()
        };
        let agent = ScriptedAgent::new();
        let engine = PoolEngine::new(&config, Arc::new(agent.clone()), CancellationToken::new())
            .expect("engine");
        Fixture {
            _dir: dir,
            config,
            agent,
            engine,
        }
    }

    fn create_request(devices: &[&str], confirm: &str) -> CreateRequest {
        CreateRequest {
            spec: PoolSpec {
                name: "tank".to_string(),
                devices: devices.iter().map(ToString::to_string).collect(),
                mountpoint: "/mnt/tank".to_string(),
                data_profile: None,
                metadata_profile: None,
                encryption: None,
                mount_options: None,
            },
            force: false,
            confirm: confirm.to_string(),
        }
    }

    fn seed_pool(fixture: &Fixture, devices: &[&str]) {
        fixture
            .engine
            .pool_options
            .upsert(PoolOptionsRecord {
                mount: "/mnt/tank".to_string(),
                mount_options: "compress=zstd:3,noatime".to_string(),
                devices: devices.iter().map(ToString::to_string).collect(),
                mappings: Vec::new(),
            })
            .expect("seed record");
    }

    async fn wait_terminal(engine: &PoolEngine, tx_id: Uuid) -> Tx {
        for _ in 0..500 {
            let tx = engine.status(tx_id).expect("status");
            if tx.is_terminal() {
                return tx;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("transaction {tx_id} did not finish");
    }

    #[tokio::test]
    async fn signatures_block_planning_without_force() {
        let fixture = fixture();
        fixture.agent.respond("wipefs -n", 0, "ext4\n");

        let mut request = create_request(&["/dev/sdb"], "CREATE");
        let err = fixture
            .engine
            .plan_create(&request)
            .await
            .expect_err("signatures");
        assert_eq!(err.code(), "signatures_present");
        assert!(err.to_string().contains("/dev/sdb"));

        request.force = true;
        let plan = fixture.engine.plan_create(&request).await.expect("forced plan");
        assert_eq!(plan.warnings.len(), 1);
        assert!(plan.warnings[0].contains("ext4"));

        let probes: Vec<String> = fixture
            .agent
            .commands()
            .into_iter()
            .filter(|c| c.starts_with("wipefs"))
            .collect();
        assert!(probes.iter().all(|c| c.contains(" -n ") && !c.contains(" -a ")));
    }

    #[tokio::test]
    async fn default_options_follow_transport() {
        let fixture = fixture();
        let queue = fixture.config.sysfs_root.join("block/sdb/queue");
        std::fs::create_dir_all(&queue).expect("sysfs dir");
        std::fs::write(queue.join("rotational"), "0\n").expect("rotational");

        let plan = fixture
            .engine
            .plan_create(&create_request(&["/dev/sdb"], ""))
            .await
            .expect("plan");
        assert_eq!(plan.mount_options, storage_sys::heuristic::SOLID_STATE_OPTIONS);
    }

    #[tokio::test]
    async fn confirmation_mismatch_creates_no_transaction() {
        let fixture = fixture();
        let err = fixture
            .engine
            .apply_create(&create_request(&["/dev/sdb"], "DESTROY"))
            .await
            .expect_err("mismatch");

        assert_eq!(err.code(), "confirmation_mismatch");
        assert!(fixture.engine.list_transactions().expect("list").is_empty());
        assert_eq!(fixture.engine.locks.current("/mnt/tank"), None);
    }

    #[tokio::test]
    async fn concurrent_applies_on_one_pool_have_one_winner() {
        let fixture = fixture();
        seed_pool(&fixture, &["/dev/sdb", "/dev/sdc"]);
        fixture.agent.respond(
            "btrfs filesystem df",
            0,
            "Data, RAID1: total=1.00GiB, used=0.00B\nMetadata, RAID1: total=256.00MiB, used=0.00B\n",
        );
        // keep the winner busy so the loser sees the lock
        fixture.agent.script_balance(vec![
            storage_contracts::BalanceStatus {
                running: true,
                percent: 1,
                left: None,
                total: None,
            };
            400
        ]);

        let first = ChangeRequest {
            mount: "/mnt/tank".to_string(),
            change: DeviceChange::Remove {
                devices: vec!["/dev/sdc".to_string()],
            },
            force: false,
            confirm: "REMOVE".to_string(),
        };
        let second = first.clone();

        let (a, b) = tokio::join!(
            fixture.engine.apply_change(&first),
            fixture.engine.apply_change(&second)
        );

        let (winner, loser) = match (a, b) {
            (Ok(id), Err(err)) | (Err(err), Ok(id)) => (id, err),
            other => panic!("expected one winner, got {other:?}"),
        };
        match loser {
            ServiceError::Conflict { tx_id, .. } => assert_eq!(tx_id, winner),
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(fixture.engine.list_transactions().expect("list").len(), 1);
    }

    #[tokio::test]
    async fn apply_create_runs_to_completion() {
        let fixture = fixture();
        let tx_id = fixture
            .engine
            .apply_create(&create_request(&["/dev/sdb", "/dev/sdc"], "CREATE"))
            .await
            .expect("accepted");

        let tx = wait_terminal(&fixture.engine, tx_id).await;
        assert!(tx.ok, "error: {:?}", tx.error);
        assert!(tx.steps.iter().all(|s| s.status == StepStatus::Ok));
        assert_eq!(fixture.engine.locks.current("/mnt/tank"), None);
        assert!(
            fixture
                .agent
                .commands()
                .iter()
                .any(|c| c.starts_with("mkfs.btrfs -f -L tank -d raid1 -m raid1"))
        );
    }

    #[tokio::test]
    async fn devices_of_other_pools_are_rejected() {
        let fixture = fixture();
        seed_pool(&fixture, &["/dev/sdb"]);
        let mut request = create_request(&["/dev/sdb"], "CREATE");
        request.spec.mountpoint = "/mnt/other".to_string();

        let err = fixture.engine.plan_create(&request).await.expect_err("in use");
        assert_eq!(err.code(), "device_in_use");
    }

    #[tokio::test]
    async fn destroy_requires_clean_mountpoint_unless_forced() {
        let clean = fixture();
        seed_pool(&clean, &["/dev/sdb"]);

        clean.agent.respond("ls -A", 0, "data\nsnaps\napps\n.trash\n");
        let mut request = DestroyRequest {
            mount: "/mnt/tank".to_string(),
            wipe: false,
            force: false,
            confirm: "DESTROY".to_string(),
        };
        assert!(clean.engine.plan_destroy(&request).await.is_ok());

        let dirty = fixture();
        seed_pool(&dirty, &["/dev/sdb"]);
        dirty.agent.respond("ls -A", 0, "data\nmovies\n");
        let err = dirty.engine.plan_destroy(&request).await.expect_err("dirty");
        assert_eq!(err.code(), "mountpoint_not_clean");
        assert!(err.to_string().contains("movies"));

        request.force = true;
        let plan = dirty.engine.plan_destroy(&request).await.expect("forced");
        assert!(plan.warnings.iter().any(|w| w.contains("movies")));
    }

    #[tokio::test]
    async fn unknown_pool_is_not_found() {
        let fixture = fixture();
        let err = fixture
            .engine
            .plan_destroy(&DestroyRequest {
                mount: "/mnt/none".to_string(),
                wipe: false,
                force: false,
                confirm: String::new(),
            })
            .await
            .expect_err("missing");
        assert_eq!(err.code(), "pool_not_found");
    }

    #[tokio::test]
    async fn failed_remount_rewrites_fstab_and_requires_reboot() {
        let fixture = fixture();
        seed_pool(&fixture, &["/dev/sdb"]);
        fixture.agent.fail("remount");

        let change = fixture
            .engine
            .change_options(&OptionsRequest {
                mount: "/mnt/tank".to_string(),
                mount_options: "compress=zstd:5,noatime".to_string(),
            })
            .await
            .expect("change");

        assert!(change.reboot_required);
        assert_eq!(
            fixture.agent.table_calls(),
            vec![
                AgentCall::RemoveLines(TableFile::Fstab, " /mnt/tank ".to_string()),
                AgentCall::EnsureLine(
                    TableFile::Fstab,
                    format!("UUID={TEST_UUID} /mnt/tank btrfs compress=zstd:5,noatime 0 0")
                ),
            ]
        );
        assert_eq!(
            fixture.engine.get_options("/mnt/tank").expect("get"),
            "compress=zstd:5,noatime"
        );
    }

    #[tokio::test]
    async fn successful_remount_leaves_fstab_alone() {
        let fixture = fixture();
        seed_pool(&fixture, &["/dev/sdb"]);

        let change = fixture
            .engine
            .change_options(&OptionsRequest {
                mount: "/mnt/tank".to_string(),
                mount_options: "noatime".to_string(),
            })
            .await
            .expect("change");

        assert!(!change.reboot_required);
        assert!(fixture.agent.table_calls().is_empty());
        assert!(
            fixture
                .agent
                .commands()
                .contains(&"mount -o remount,noatime /mnt/tank".to_string())
        );
        assert_eq!(fixture.engine.locks.current("/mnt/tank"), None);
    }

    fn options_request(mount: &str, options: &str) -> OptionsRequest {
        OptionsRequest {
            mount: mount.to_string(),
            mount_options: options.to_string(),
        }
    }

    #[tokio::test]
    async fn options_change_for_unknown_pool_leaves_no_record() {
        let fixture = fixture();
        fixture.agent.fail("remount");

        let err = fixture
            .engine
            .change_options(&options_request("/mnt/new", "noatime"))
            .await
            .expect_err("unknown pool");

        assert_eq!(err.code(), "pool_not_found");
        assert!(fixture.agent.calls().is_empty());
        assert!(fixture.engine.pool_options.get("/mnt/new").expect("get").is_none());
        assert_eq!(fixture.engine.locks.current("/mnt/new"), None);

        let mut request = create_request(&["/dev/sdb"], "CREATE");
        request.spec.mountpoint = "/mnt/new".to_string();
        assert!(fixture.engine.plan_create(&request).await.is_ok());
    }

    #[tokio::test]
    async fn failed_fstab_rewrite_keeps_recorded_options() {
        let fixture = fixture();
        seed_pool(&fixture, &["/dev/sdb"]);
        fixture.agent.fail("remount");
        fixture.agent.fail("blkid");

        let err = fixture
            .engine
            .change_options(&options_request("/mnt/tank", "compress=zstd:9"))
            .await
            .expect_err("no uuid");

        assert_eq!(err.code(), "pool_not_found");
        assert!(fixture.agent.table_calls().is_empty());
        assert_eq!(
            fixture.engine.get_options("/mnt/tank").expect("get"),
            "compress=zstd:3,noatime"
        );
    }

    #[tokio::test]
    async fn mountpoint_spellings_share_one_lock_and_record() {
        let fixture = fixture();
        seed_pool(&fixture, &["/dev/sdb"]);
        let holder = Uuid::new_v4();
        fixture
            .engine
            .locks
            .try_acquire("/mnt/tank", LockHolder::Transaction(holder))
            .expect("lock");

        for spelling in ["/mnt/tank/", "//mnt//tank"] {
            match fixture
                .engine
                .change_options(&options_request(spelling, "noatime"))
                .await
            {
                Err(ServiceError::Conflict { tx_id, .. }) => assert_eq!(tx_id, holder),
                other => panic!("{spelling}: expected conflict, got {other:?}"),
            }
        }
        fixture
            .engine
            .locks
            .release("/mnt/tank", LockHolder::Transaction(holder));

        fixture
            .engine
            .change_options(&options_request("/mnt/tank/", "noatime"))
            .await
            .expect("change");
        assert!(
            fixture
                .agent
                .commands()
                .contains(&"mount -o remount,noatime /mnt/tank".to_string())
        );
        let records = fixture.engine.pool_options.records().expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].mount_options, "noatime");
        assert_eq!(fixture.engine.get_options("/mnt/tank/").expect("get"), "noatime");

        let err = fixture
            .engine
            .change_options(&options_request("/mnt/../tank", "noatime"))
            .await
            .expect_err("dot-dot");
        assert_eq!(err.code(), "invalid_spec");
    }

    #[tokio::test]
    async fn conflict_with_options_change_carries_no_tx_id() {
        let fixture = fixture();
        seed_pool(&fixture, &["/dev/sdb", "/dev/sdc"]);
        fixture
            .engine
            .locks
            .try_acquire("/mnt/tank", LockHolder::OptionsChange(Uuid::new_v4()))
            .expect("lock");

        let err = fixture
            .engine
            .apply_destroy(&DestroyRequest {
                mount: "/mnt/tank".to_string(),
                wipe: false,
                force: true,
                confirm: "DESTROY".to_string(),
            })
            .await
            .expect_err("busy");

        assert_eq!(err.code(), "options_change_in_progress");
        let body: serde_json::Value = serde_json::from_str(&err.to_body()).expect("body");
        assert!(body.get("tx_id").is_none());
        assert!(fixture.engine.list_transactions().expect("list").is_empty());
    }

    #[tokio::test]
    async fn invalid_options_are_rejected_before_remount() {
        let fixture = fixture();
        let err = fixture
            .engine
            .change_options(&OptionsRequest {
                mount: "/mnt/tank".to_string(),
                mount_options: "nodatacow".to_string(),
            })
            .await
            .expect_err("invalid");
        assert_eq!(err.code(), "invalid_mount_option");
        assert!(fixture.agent.calls().is_empty());
    }

    #[tokio::test]
    async fn recovery_relocks_until_abandoned() {
        let fixture = fixture();
        let mut tx = Tx::new(
            TxKind::Create,
            "/mnt/tank",
            planner::plan_create(&create_request(&["/dev/sdb"], "").spec, "noatime")
                .expect("plan")
                .steps,
            Utc::now(),
        );
        tx.start_step(0, Utc::now());
        fixture.engine.store.create(&tx).expect("create");

        let engine = PoolEngine::new(
            &fixture.config,
            Arc::new(fixture.agent.clone()),
            CancellationToken::new(),
        )
        .expect("restarted engine");
        assert_eq!(engine.recover().expect("recover"), vec![tx.id]);

        let err = engine
            .apply_create(&create_request(&["/dev/sdb"], "CREATE"))
            .await
            .expect_err("locked");
        assert_eq!(err.code(), "pool_locked");

        let abandoned = engine.abandon(tx.id).expect("abandon");
        assert!(abandoned.is_terminal());
        assert_eq!(abandoned.error.as_deref(), Some(ABANDON_REASON));
        assert_eq!(abandoned.steps[0].status, StepStatus::Error);
        assert_eq!(abandoned.steps[1].status, StepStatus::Pending);
        assert_eq!(engine.locks.current("/mnt/tank"), None);

        let again = engine.abandon(tx.id).expect_err("already finished");
        assert_eq!(again.code(), "tx_finished");
    }

    #[tokio::test]
    async fn watch_log_replays_and_closes_after_completion() {
        let fixture = fixture();
        let mut request = create_request(&["/dev/sdb"], "CREATE");
        request.spec.encryption = Some(EncryptionSpec {
            enabled: false,
            keyfile: String::new(),
        });
        let tx_id = fixture.engine.apply_create(&request).await.expect("accepted");
        wait_terminal(&fixture.engine, tx_id).await;

        let lines: Vec<String> = fixture
            .engine
            .watch_log(tx_id)
            .expect("stream")
            .collect()
            .await;

        assert!(lines.first().is_some_and(|l| l.contains("transaction started")));
        assert!(lines.last().is_some_and(|l| l.contains("transaction succeeded")));
        assert!(lines.iter().any(|l| l.contains("[mkfs] running: mkfs.btrfs")));
    }

    #[tokio::test]
    async fn watch_log_of_unknown_tx_is_not_found() {
        let fixture = fixture();
        assert!(matches!(
            fixture.engine.watch_log(Uuid::new_v4()),
            Err(ServiceError::NotFound { .. })
        ));
    }
}
