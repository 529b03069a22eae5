// SPDX-License-Identifier: GPL-3.0-only

//! File-backed transaction records.
//!
//! Each transaction owns `<id>.json` (the queryable state, replaced
//! atomically on every save) and `<id>.log` (an append-only narrative).

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use chrono::{SecondsFormat, Utc};
use storage_sys::durable::write_atomic;
use storage_types::{LogLevel, Tx};
use tracing::warn;
use uuid::Uuid;

use crate::error::{Result, ServiceError};

#[derive(Debug, Clone)]
pub struct TxStore {
    dir: PathBuf,
}

impl TxStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| ServiceError::store(&dir, e))?;
        Ok(Self { dir })
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub fn log_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.log"))
    }

    /// Persist a new transaction. An existing record with the same id is a bug.
    pub fn create(&self, tx: &Tx) -> Result<()> {
        let path = self.record_path(tx.id);
        if path.exists() {
            return Err(ServiceError::store(
                &path,
                format!("transaction {} already exists", tx.id),
            ));
        }

        let log_path = self.log_path(tx.id);
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&log_path)
            .map_err(|e| ServiceError::store(&log_path, e))?;

        self.save(tx)
    }

    /// Replace the stored record with `tx`.
    pub fn save(&self, tx: &Tx) -> Result<()> {
        let path = self.record_path(tx.id);
        let data = serde_json::to_vec_pretty(tx).map_err(|e| ServiceError::store(&path, e))?;
        write_atomic(&path, &data).map_err(|e| ServiceError::store(&path, e))
    }

    pub fn load(&self, id: Uuid) -> Result<Option<Tx>> {
        let path = self.record_path(id);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ServiceError::store(&path, e)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| ServiceError::store(&path, e))
    }

    /// Every stored record, newest first. Unreadable records are skipped.
    pub fn list(&self) -> Result<Vec<Tx>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| ServiceError::store(&self.dir, e))?;

        let mut txs = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|raw| serde_json::from_slice::<Tx>(&raw).map_err(|e| e.to_string()));
            match parsed {
                Ok(tx) => txs.push(tx),
                Err(reason) => warn!("skipping unreadable transaction {}: {}", path.display(), reason),
            }
        }

        txs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(txs)
    }

    /// Append one line to the transaction log.
    pub fn append_log(
        &self,
        id: Uuid,
        level: LogLevel,
        step_id: Option<&str>,
        message: &str,
    ) -> Result<()> {
        let path = self.log_path(id);
        let line = format!(
            "{} {} [{}] {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level,
            step_id.unwrap_or("-"),
            message.replace('\n', " "),
        );

        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| ServiceError::store(&path, e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| ServiceError::store(&path, e))
    }

    pub fn log_len(&self, id: Uuid) -> Result<u64> {
        let path = self.log_path(id);
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ServiceError::NotFound {
                code: "tx_not_found",
                id: id.to_string(),
            }),
            Err(e) => Err(ServiceError::store(&path, e)),
        }
    }

    /// Log bytes from `offset` on, and the offset to continue from.
    ///
    /// Only whole lines are returned so a reader never sees a torn line.
    pub fn read_log(&self, id: Uuid, offset: u64) -> Result<(String, u64)> {
        let path = self.log_path(id);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ServiceError::NotFound {
                    code: "tx_not_found",
                    id: id.to_string(),
                });
            }
            Err(e) => return Err(ServiceError::store(&path, e)),
        };

        file.seek(SeekFrom::Start(offset))
            .map_err(|e| ServiceError::store(&path, e))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| ServiceError::store(&path, e))?;

        let complete = buf.iter().rposition(|b| *b == b'\n').map_or(0, |pos| pos + 1);
        buf.truncate(complete);
        let next = offset + complete as u64;
        Ok((String::from_utf8_lossy(&buf).into_owned(), next))
    }
}
