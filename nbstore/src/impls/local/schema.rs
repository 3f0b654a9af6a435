//! On-disk layouts of the local databases and their migrations.
//!
//! Current layout, column families by the version that introduced them:
//!
//! | version | column family              | key               | value                        |
//! |---------|----------------------------|-------------------|------------------------------|
//! | 1       | `meta`                     | setting name      | setting bytes                |
//! | 1       | `snapshots`                | doc_id            | ts:8 BE ++ bincode record    |
//! | 1       | `updates`                  | doc_id \0 ts:8 BE | bincode record               |
//! | 1       | `clocks`                   | doc_id            | ts:8 BE                      |
//! | 1       | `blobs`                    | key               | lz4 payload                  |
//! | 1       | `blob_meta`                | key               | bincode [`BlobMeta`]         |
//! | 2       | `peer_remote_clocks`       | peer \0 doc_id    | ts:8 BE                      |
//! | 2       | `peer_pulled_remote_clocks`| peer \0 doc_id    | ts:8 BE                      |
//! | 2       | `peer_pushed_clocks`       | peer \0 doc_id    | ts:8 BE                      |
//!
//! Values that start with a timestamp are merged last-writer-wins: the value
//! with the strictly greatest timestamp survives.

use rocksdb::MergeOperands;
use serde::{Deserialize, Serialize};

use super::db::RocksDb;
use crate::error::{Error, Result};
use crate::storage::Timestamp;

pub const CF_META: &str = "meta";
pub const CF_SNAPSHOTS: &str = "snapshots";
pub const CF_UPDATES: &str = "updates";
pub const CF_CLOCKS: &str = "clocks";
pub const CF_BLOBS: &str = "blobs";
pub const CF_BLOB_META: &str = "blob_meta";
pub const CF_PEER_REMOTE_CLOCKS: &str = "peer_remote_clocks";
pub const CF_PEER_PULLED_REMOTE_CLOCKS: &str = "peer_pulled_remote_clocks";
pub const CF_PEER_PUSHED_CLOCKS: &str = "peer_pushed_clocks";

/// Legacy layout: all updates of a document in one value.
pub const CF_LEGACY_DOCS: &str = "workspace";
pub const CF_LEGACY_BLOBS: &str = "blob";

pub const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";

pub type MigrationFn = fn(&RocksDb) -> Result<()>;

/// A database layout.
pub struct DbSchema {
    pub name: &'static str,
    /// Newest version this build knows
    pub version: u32,
    /// `(introduced_in, column_family)`
    column_families: &'static [(u32, &'static str)],
    /// Column families merged last-writer-wins
    lww_families: &'static [&'static str],
    /// `(target_version, step)`, ascending
    migrations: &'static [(u32, MigrationFn)],
}

impl DbSchema {
    /// Column families present at `version`.
    pub fn column_families(&self, version: u32) -> Vec<&'static str> {
        self.column_families
            .iter()
            .filter(|(since, _)| *since <= version)
            .map(|(_, name)| *name)
            .collect()
    }

    pub fn is_lww(&self, cf: &str) -> bool {
        self.lww_families.contains(&cf)
    }

    /// Run every step in `(from, to]`.
    pub fn migrate(&self, db: &RocksDb, from: u32, to: u32) -> Result<()> {
        for (target, step) in self.migrations {
            if *target > from && *target <= to {
                log::info!("Migrating {} database to version {target}", self.name);
                step(db)?;
            }
        }
        Ok(())
    }
}

pub static CURRENT: DbSchema = DbSchema {
    name: "nbstore",
    version: 2,
    column_families: &[
        (1, CF_META),
        (1, CF_SNAPSHOTS),
        (1, CF_UPDATES),
        (1, CF_CLOCKS),
        (1, CF_BLOBS),
        (1, CF_BLOB_META),
        (2, CF_PEER_REMOTE_CLOCKS),
        (2, CF_PEER_PULLED_REMOTE_CLOCKS),
        (2, CF_PEER_PUSHED_CLOCKS),
    ],
    lww_families: &[
        CF_SNAPSHOTS,
        CF_CLOCKS,
        CF_PEER_REMOTE_CLOCKS,
        CF_PEER_PULLED_REMOTE_CLOCKS,
        CF_PEER_PUSHED_CLOCKS,
    ],
    migrations: &[(2, rebuild_clocks)],
};

pub static LEGACY: DbSchema = DbSchema {
    name: "nbstore-v1",
    version: 1,
    column_families: &[(1, CF_META), (1, CF_LEGACY_DOCS), (1, CF_LEGACY_BLOBS)],
    lww_families: &[],
    migrations: &[],
};

// ─── Value codecs ─────────────────────────────────────────────────────

/// A snapshot or logged update as stored on disk. `bin` is LZ4 compressed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    pub editor: Option<String>,
    pub bin: Vec<u8>,
}

impl StoredRecord {
    pub fn new(bin: &[u8], editor: Option<String>) -> Self {
        Self {
            editor,
            bin: lz4_flex::compress_prepend_size(bin),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(record)
    }

    pub fn payload(&self) -> Result<Vec<u8>> {
        lz4_flex::decompress_size_prepended(&self.bin).map_err(|e| Error::Compression(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMeta {
    pub mime: String,
    pub size: u64,
    pub created_at: Timestamp,
    pub deleted_at: Option<Timestamp>,
}

impl BlobMeta {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(meta)
    }
}

/// Prefix `payload` with a big-endian timestamp.
pub fn stamp(timestamp: Timestamp, payload: &[u8]) -> Vec<u8> {
    let mut value = Vec::with_capacity(8 + payload.len());
    value.extend_from_slice(&timestamp.to_be_bytes());
    value.extend_from_slice(payload);
    value
}

/// Split a stamped value into `(timestamp, payload)`.
pub fn unstamp(value: &[u8]) -> Result<(Timestamp, &[u8])> {
    if value.len() < 8 {
        return Err(Error::Deserialization(format!(
            "stamped value too short: {} bytes",
            value.len()
        )));
    }
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&value[..8]);
    Ok((u64::from_be_bytes(ts), &value[8..]))
}

/// Key parts are joined with `\0`, so they must not contain it.
fn check_key_part(what: &str, part: &str) -> Result<()> {
    if part.contains('\0') {
        return Err(Error::InvalidId(format!("{what} {part:?} contains a NUL byte")));
    }
    Ok(())
}

/// `doc_id \0 ts:8 BE`
pub fn update_key(doc_id: &str, timestamp: Timestamp) -> Result<Vec<u8>> {
    let mut key = update_prefix(doc_id)?;
    key.extend_from_slice(&timestamp.to_be_bytes());
    Ok(key)
}

/// `doc_id \0`, the prefix of all update keys of a document.
pub fn update_prefix(doc_id: &str) -> Result<Vec<u8>> {
    check_key_part("doc id", doc_id)?;
    let mut prefix = Vec::with_capacity(doc_id.len() + 9);
    prefix.extend_from_slice(doc_id.as_bytes());
    prefix.push(0);
    Ok(prefix)
}

/// Timestamp and doc id encoded in an update key.
pub fn parse_update_key(key: &[u8]) -> Result<(String, Timestamp)> {
    if key.len() < 9 || key[key.len() - 9] != 0 {
        return Err(Error::Deserialization("malformed update key".into()));
    }
    let split = key.len() - 9;
    let doc_id = String::from_utf8(key[..split].to_vec())
        .map_err(|e| Error::Deserialization(e.to_string()))?;
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&key[split + 1..]);
    Ok((doc_id, u64::from_be_bytes(ts)))
}

/// `peer \0 doc_id`
pub fn peer_key(peer: &str, doc_id: &str) -> Result<Vec<u8>> {
    check_key_part("peer", peer)?;
    check_key_part("doc id", doc_id)?;
    let mut key = Vec::with_capacity(peer.len() + doc_id.len() + 1);
    key.extend_from_slice(peer.as_bytes());
    key.push(0);
    key.extend_from_slice(doc_id.as_bytes());
    Ok(key)
}

/// Last-writer-wins merge: keep the operand with the strictly greatest
/// timestamp prefix, earlier values win ties.
pub fn lww_merge(_key: &[u8], existing: Option<&[u8]>, operands: &MergeOperands) -> Option<Vec<u8>> {
    let mut winner: Option<(Timestamp, &[u8])> = existing.and_then(|v| unstamp(v).ok().map(|(ts, _)| (ts, v)));
    for operand in operands {
        let Ok((ts, _)) = unstamp(operand) else {
            continue;
        };
        if winner.is_none_or(|(best, _)| ts > best) {
            winner = Some((ts, operand));
        }
    }
    winner.map(|(_, value)| value.to_vec())
}

// ─── Migrations ───────────────────────────────────────────────────────

/// v1 → v2: recompute `clocks` from snapshots and logged updates.
fn rebuild_clocks(db: &RocksDb) -> Result<()> {
    let cf = |name: &str| {
        db.cf_handle(name)
            .ok_or_else(|| Error::Database(format!("Column family '{name}' not found")))
    };
    let snapshots = cf(CF_SNAPSHOTS)?;
    let updates = cf(CF_UPDATES)?;
    let clocks = cf(CF_CLOCKS)?;

    let mut latest: std::collections::HashMap<Vec<u8>, Timestamp> = std::collections::HashMap::new();
    for item in db.iterator_cf(snapshots, rocksdb::IteratorMode::Start) {
        let (key, value) = item?;
        let (ts, _) = unstamp(&value)?;
        let entry = latest.entry(key.to_vec()).or_default();
        *entry = (*entry).max(ts);
    }
    for item in db.iterator_cf(updates, rocksdb::IteratorMode::Start) {
        let (key, _) = item?;
        let (doc_id, ts) = parse_update_key(&key)?;
        let entry = latest.entry(doc_id.into_bytes()).or_default();
        *entry = (*entry).max(ts);
    }

    let mut batch = rocksdb::WriteBatch::default();
    for (doc_id, ts) in &latest {
        batch.put_cf(clocks, doc_id, ts.to_be_bytes());
    }
    db.write(batch)?;
    log::info!("Rebuilt {} document clocks", latest.len());
    Ok(())
}
