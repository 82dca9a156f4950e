//! Monthly-partitioned parquet storage with Hive-style layout.
//!
//! Layout: `{root}/market={ID}/{YYYY-MM}/manifest.json` + `v{version}.parquet`
//!
//! - A partition is published by atomically renaming its manifest into place;
//!   the data file it names is written first, so readers see the old version
//!   or the new one, never a partial write.
//! - Every manifest carries the BLAKE3 checksum of its parquet bytes, verified
//!   on read.
//! - Writers to one key serialize on that key's mutex. Distinct keys never
//!   share a lock.

pub mod codec;
pub mod error;
pub mod schema;

pub use error::StoreError;
pub use schema::{PartitionSchema, SchemaError};

use crate::domain::{ContractBar, ContractId, MarketId, YearMonth};
use chrono::NaiveDate;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MANIFEST_FILE: &str = "manifest.json";

/// Address of one partition: a market and a calendar month.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub market: MarketId,
    pub month: YearMonth,
}

impl PartitionKey {
    pub fn new(market: MarketId, month: YearMonth) -> Self {
        Self { market, month }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.market, self.month)
    }
}

/// Published description of a partition's current version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionManifest {
    pub market: MarketId,
    pub month: YearMonth,
    pub version: u64,
    /// BLAKE3 hex digest of the parquet bytes.
    pub checksum: String,
    pub rows: usize,
    pub first_date: NaiveDate,
    pub last_date: NaiveDate,
    /// Distinct contracts with at least one row, ascending.
    pub contracts: Vec<ContractId>,
    pub written_at: chrono::NaiveDateTime,
}

impl PartitionManifest {
    pub fn key(&self) -> PartitionKey {
        PartitionKey::new(self.market.clone(), self.month)
    }

    fn data_file(&self) -> String {
        data_file_name(self.version)
    }
}

/// A verified partition: its manifest and rows sorted by (date, contract).
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub manifest: PartitionManifest,
    pub rows: Vec<ContractBar>,
}

/// How a write treats an existing partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum WriteMode {
    /// Fails if the partition already exists.
    Create,
    /// Overwrites all rows; `expected` must be the current version.
    Replace { expected: u64 },
    /// Upserts by (date, contract); `expected` must be the current version.
    Merge { expected: u64 },
}

impl WriteMode {
    fn name(&self) -> &'static str {
        match self {
            WriteMode::Create => "create",
            WriteMode::Replace { .. } => "replace",
            WriteMode::Merge { .. } => "merge",
        }
    }

    fn expected(&self) -> Option<u64> {
        match *self {
            WriteMode::Create => None,
            WriteMode::Replace { expected } | WriteMode::Merge { expected } => Some(expected),
        }
    }
}

/// Which months in a range have a published partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coverage {
    pub present: Vec<YearMonth>,
    pub missing: Vec<YearMonth>,
}

impl Coverage {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

#[derive(Default)]
struct PartitionLock {
    /// Serializes writers of one key.
    write: Mutex<()>,
    /// Held shared by readers over manifest + bytes, exclusively for publish.
    publish: RwLock<()>,
}

/// A partition's lock, held for the duration of one read or write. The map
/// entry is dropped with the last lease so idle keys do not accumulate.
struct LockLease<'a> {
    locks: &'a DashMap<PartitionKey, Arc<PartitionLock>>,
    key: &'a PartitionKey,
    lock: Arc<PartitionLock>,
}

impl std::ops::Deref for LockLease<'_> {
    type Target = PartitionLock;

    fn deref(&self) -> &PartitionLock {
        &self.lock
    }
}

impl Drop for LockLease<'_> {
    fn drop(&mut self) {
        // The map holds one reference and this lease another; anything more
        // is a concurrent lease that still needs the entry.
        self.locks
            .remove_if(self.key, |_, lock| Arc::strong_count(lock) == 2);
    }
}

/// The partition store.
pub struct PartitionStore {
    root: PathBuf,
    locks: DashMap<PartitionKey, Arc<PartitionLock>>,
}

impl PartitionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: DashMap::new(),
        }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for a market: `{root}/market={ID}/`
    fn market_dir(&self, market: &MarketId) -> PathBuf {
        self.root.join(format!("market={market}"))
    }

    /// Directory for a partition: `{root}/market={ID}/{YYYY-MM}/`
    fn partition_dir(&self, key: &PartitionKey) -> PathBuf {
        self.market_dir(&key.market).join(key.month.to_string())
    }

    fn manifest_path(&self, key: &PartitionKey) -> PathBuf {
        self.partition_dir(key).join(MANIFEST_FILE)
    }

    fn lock_for<'a>(&'a self, key: &'a PartitionKey) -> LockLease<'a> {
        let lock = self.locks.entry(key.clone()).or_default().clone();
        LockLease {
            locks: &self.locks,
            key,
            lock,
        }
    }

    /// Current manifest of a partition, `None` if never published.
    pub fn manifest(&self, key: &PartitionKey) -> Result<Option<PartitionManifest>, StoreError> {
        let path = self.manifest_path(key);
        let content = match fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(path, e)),
        };
        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|e| StoreError::CorruptPartition {
                key: key.clone(),
                reason: format!("manifest: {e}"),
            })
    }

    /// Read and verify a partition. Absent partitions are `Ok(None)`.
    pub fn read_partition(&self, key: &PartitionKey) -> Result<Option<Partition>, StoreError> {
        let lock = self.lock_for(key);
        let (manifest, bytes) = {
            let _reading = lock.publish.read();
            let Some(manifest) = self.manifest(key)? else {
                return Ok(None);
            };
            let path = self.partition_dir(key).join(manifest.data_file());
            let bytes = match fs::read(&path) {
                Ok(b) => b,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(StoreError::CorruptPartition {
                        key: key.clone(),
                        reason: format!("data file {} is missing", manifest.data_file()),
                    })
                }
                Err(e) => return Err(StoreError::io(path, e)),
            };
            (manifest, bytes)
        };

        let checksum = blake3::hash(&bytes).to_hex().to_string();
        if checksum != manifest.checksum {
            tracing::warn!(partition = %key, "checksum mismatch");
            return Err(StoreError::CorruptPartition {
                key: key.clone(),
                reason: format!("checksum {checksum} does not match manifest {}", manifest.checksum),
            });
        }

        let corrupt = |e: StoreError| StoreError::CorruptPartition {
            key: key.clone(),
            reason: e.to_string(),
        };
        let df = codec::decode(&bytes).map_err(corrupt)?;
        let rows = codec::dataframe_to_rows(&df).map_err(corrupt)?;
        if rows.len() != manifest.rows {
            return Err(StoreError::CorruptPartition {
                key: key.clone(),
                reason: format!("{} rows on disk, manifest lists {}", rows.len(), manifest.rows),
            });
        }

        tracing::debug!(partition = %key, version = manifest.version, rows = rows.len(), "read partition");
        Ok(Some(Partition { manifest, rows }))
    }

    /// Write rows to a partition and publish the new version.
    ///
    /// Rows are validated and sorted by (date, contract) before encoding.
    pub fn write_partition(
        &self,
        key: &PartitionKey,
        rows: Vec<ContractBar>,
        mode: WriteMode,
    ) -> Result<PartitionManifest, StoreError> {
        let lock = self.lock_for(key);
        let _writer = lock.write.lock();

        let current = self.manifest(key)?;
        let found = current.as_ref().map(|m| m.version);
        let conflict = || StoreError::PartitionWriteConflict {
            key: key.clone(),
            mode: mode.name(),
            expected: mode.expected(),
            found,
        };
        if found != mode.expected() {
            return Err(conflict());
        }

        let rows = match mode {
            WriteMode::Merge { .. } => {
                let existing = self.read_partition(key)?.ok_or_else(conflict)?;
                let mut merged: BTreeMap<(NaiveDate, ContractId), ContractBar> = existing
                    .rows
                    .into_iter()
                    .map(|r| ((r.date, r.contract.clone()), r))
                    .collect();
                PartitionSchema::validate_rows(&key.market, key.month, &rows).map_err(|source| {
                    StoreError::InvalidRows {
                        key: key.clone(),
                        source,
                    }
                })?;
                for row in rows {
                    merged.insert((row.date, row.contract.clone()), row);
                }
                merged.into_values().collect()
            }
            WriteMode::Create | WriteMode::Replace { .. } => {
                PartitionSchema::validate_rows(&key.market, key.month, &rows).map_err(|source| {
                    StoreError::InvalidRows {
                        key: key.clone(),
                        source,
                    }
                })?;
                let mut rows = rows;
                rows.sort_by(|a, b| (a.date, &a.contract).cmp(&(b.date, &b.contract)));
                rows
            }
        };

        let mut df = codec::rows_to_dataframe(&rows)?;
        let bytes = codec::encode(&mut df)?;
        let contracts: BTreeSet<ContractId> = rows.iter().map(|r| r.contract.clone()).collect();
        let (first_date, last_date) = match (rows.first(), rows.last()) {
            (Some(first), Some(last)) => (first.date, last.date),
            _ => {
                return Err(StoreError::InvalidRows {
                    key: key.clone(),
                    source: SchemaError::Empty,
                })
            }
        };

        let manifest = PartitionManifest {
            market: key.market.clone(),
            month: key.month,
            version: found.map_or(1, |v| v + 1),
            checksum: blake3::hash(&bytes).to_hex().to_string(),
            rows: rows.len(),
            first_date,
            last_date,
            contracts: contracts.into_iter().collect(),
            written_at: chrono::Local::now().naive_local(),
        };

        let dir = self.partition_dir(key);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        // Data file first; it is unreachable until the manifest names it
        let data_path = dir.join(manifest.data_file());
        write_atomically(&data_path, &bytes)?;

        let manifest_json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| StoreError::Codec(format!("manifest serialization: {e}")))?;
        let manifest_path = self.manifest_path(key);
        let tmp_path = manifest_path.with_extension("json.tmp");
        fs::write(&tmp_path, manifest_json).map_err(|e| StoreError::io(&tmp_path, e))?;
        {
            let _publishing = lock.publish.write();
            fs::rename(&tmp_path, &manifest_path).map_err(|e| {
                let _ = fs::remove_file(&tmp_path);
                StoreError::io(&manifest_path, e)
            })?;
        }

        if let Some(previous) = current {
            let stale = dir.join(previous.data_file());
            if let Err(e) = fs::remove_file(&stale) {
                tracing::debug!(path = %stale.display(), error = %e, "could not remove superseded data file");
            }
        }

        tracing::info!(
            partition = %key,
            version = manifest.version,
            rows = manifest.rows,
            mode = mode.name(),
            "published partition"
        );
        Ok(manifest)
    }

    /// Months with a published partition for a market, ascending.
    pub fn list_partitions(&self, market: &MarketId) -> Result<Vec<YearMonth>, StoreError> {
        let dir = self.market_dir(market);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(dir, e)),
        };

        let mut months = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let path = entry.path();
            let Some(month) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<YearMonth>().ok())
            else {
                continue;
            };
            if path.join(MANIFEST_FILE).exists() {
                months.push(month);
            }
        }
        months.sort_unstable();
        Ok(months)
    }

    /// Latest published partition month of a market.
    pub fn latest_partition(&self, market: &MarketId) -> Result<Option<YearMonth>, StoreError> {
        Ok(self.list_partitions(market)?.last().copied())
    }

    /// Which months in `[from, to]` are stored. Missing months are reported,
    /// never filled.
    pub fn check_coverage(
        &self,
        market: &MarketId,
        from: YearMonth,
        to: YearMonth,
    ) -> Result<Coverage, StoreError> {
        let stored: BTreeSet<YearMonth> = self.list_partitions(market)?.into_iter().collect();
        let (present, missing): (Vec<_>, Vec<_>) =
            from.through(to).partition(|m| stored.contains(m));
        Ok(Coverage { present, missing })
    }

    /// Markets with a directory in the store, ascending.
    pub fn markets(&self) -> Result<Vec<MarketId>, StoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.root, e)),
        };
        let mut markets = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.root, e))?;
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.strip_prefix("market="))
            {
                markets.push(MarketId::from(id));
            }
        }
        markets.sort();
        Ok(markets)
    }
}

fn data_file_name(version: u64) -> String {
    format!("v{version:06}.parquet")
}

/// Write to `{path}.tmp`, then rename into place.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp_path = path.with_extension("parquet.tmp");
    fs::write(&tmp_path, bytes).map_err(|e| StoreError::io(&tmp_path, e))?;
    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        StoreError::io(path, e)
    })
}
