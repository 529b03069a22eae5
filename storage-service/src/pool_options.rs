// SPDX-License-Identifier: GPL-3.0-only

//! Durable per-pool mount options and device membership.
//!
//! All pools share one JSON array file. Read-modify-write sequences hold an
//! exclusive `flock` on a sibling lock file, so concurrent transactions on
//! different pools cannot lose each other's updates.

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use nix::fcntl::{Flock, FlockArg};
use storage_sys::durable::write_atomic;
use storage_types::{CONSERVATIVE_OPTIONS, PoolOptionsRecord};

use crate::error::{Result, ServiceError};

#[derive(Debug, Clone)]
pub struct PoolOptionsStore {
    path: PathBuf,
    lock_path: PathBuf,
    // flock is per open file description; this serializes callers in-process too
    local: Arc<Mutex<()>>,
}

impl PoolOptionsStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ServiceError::store(parent, e))?;
        }
        let mut lock_name = path.clone().into_os_string();
        lock_name.push(".lock");

        Ok(Self {
            path,
            lock_path: PathBuf::from(lock_name),
            local: Arc::new(Mutex::new(())),
        })
    }

    pub fn records(&self) -> Result<Vec<PoolOptionsRecord>> {
        match fs::read(&self.path) {
            Ok(raw) if raw.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
            Ok(raw) => serde_json::from_slice(&raw).map_err(|e| ServiceError::store(&self.path, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(ServiceError::store(&self.path, e)),
        }
    }

    pub fn get(&self, mount: &str) -> Result<Option<PoolOptionsRecord>> {
        Ok(self.records()?.into_iter().find(|r| r.mount == mount))
    }

    /// Stored options, or the conservative preset for unknown pools.
    pub fn options_for(&self, mount: &str) -> Result<String> {
        Ok(self
            .get(mount)?
            .map(|r| r.mount_options)
            .unwrap_or_else(|| CONSERVATIVE_OPTIONS.to_string()))
    }

    /// Devices (and raw devices behind mappings) claimed by pools other than `except`.
    pub fn devices_in_use(&self, except: Option<&str>) -> Result<Vec<String>> {
        Ok(self
            .records()?
            .into_iter()
            .filter(|r| Some(r.mount.as_str()) != except)
            .flat_map(|r| {
                let raw = r.mappings.into_iter().map(|m| m.device);
                r.devices.into_iter().chain(raw)
            })
            .collect())
    }

    /// Run `change` over the records under the write lock and persist the result.
    fn modify<T>(&self, change: impl FnOnce(&mut Vec<PoolOptionsRecord>) -> T) -> Result<T> {
        let _local = self.local.lock().unwrap_or_else(|p| p.into_inner());

        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| ServiceError::store(&self.lock_path, e))?;
        let _flock = Flock::lock(lock_file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| ServiceError::store(&self.lock_path, errno))?;

        let mut records = self.records()?;
        let result = change(&mut records);

        let data =
            serde_json::to_vec_pretty(&records).map_err(|e| ServiceError::store(&self.path, e))?;
        write_atomic(&self.path, &data).map_err(|e| ServiceError::store(&self.path, e))?;
        Ok(result)
    }

    /// Replace the options of an existing pool. Unknown pools are not created.
    pub fn set_options(&self, mount: &str, options: &str) -> Result<()> {
        if self.update(mount, |record| record.mount_options = options.to_string())? {
            Ok(())
        } else {
            Err(ServiceError::NotFound {
                code: "pool_not_found",
                id: mount.to_string(),
            })
        }
    }

    /// Insert or replace the whole record for `record.mount`.
    pub fn upsert(&self, record: PoolOptionsRecord) -> Result<()> {
        self.modify(|records| {
            records.retain(|r| r.mount != record.mount);
            records.push(record);
        })
    }

    /// Apply `update` to an existing record. Returns false if there is none.
    pub fn update(&self, mount: &str, update: impl FnOnce(&mut PoolOptionsRecord)) -> Result<bool> {
        self.modify(|records| match records.iter_mut().find(|r| r.mount == mount) {
            Some(record) => {
                update(record);
                true
            }
            None => false,
        })
    }

    pub fn remove(&self, mount: &str) -> Result<bool> {
        self.modify(|records| {
            let before = records.len();
            records.retain(|r| r.mount != mount);
            records.len() != before
        })
    }
}
