//! Versioned local databases shared by every tab of one device.
//!
//! Each named database is one RocksDB instance under `data_dir`. RocksDB
//! allows a single open handle per path, so tabs never open it themselves:
//! they lease the shared handle from [`LocalDatabases`], which also plays the
//! part of the browser's version negotiation:
//!
//! ```text
//! open(name, V)            holders at W
//!   W == V  ──────────────► share the handle
//!   W <  V  ──────────────► ask holders to close (version change);
//!                            any left → Blocked
//!   W >  V  ──────────────► Blocked
//!   none, on disk > V ────► VersionConflict
//!   none, on disk < V ────► migrate, then open
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};

use super::schema::{self, DbSchema, CF_META, SCHEMA_VERSION_KEY};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::storage::{now_millis, Timestamp};

pub type RocksDb = DBWithThreadMode<SingleThreaded>;

/// Called on a holder when a newer version wants the database.
pub type VersionChangeCallback = Arc<dyn Fn() + Send + Sync>;

struct OpenDatabase {
    version: u32,
    db: Weak<LocalDb>,
    holders: Vec<(u64, VersionChangeCallback)>,
}

/// Factory and registry of open local databases.
pub struct LocalDatabases {
    config: Arc<StoreConfig>,
    open: Mutex<HashMap<String, OpenDatabase>>,
    next_holder: AtomicU64,
}

impl LocalDatabases {
    pub fn new(config: Arc<StoreConfig>) -> Self {
        Self {
            config,
            open: Mutex::new(HashMap::new()),
            next_holder: AtomicU64::new(0),
        }
    }

    /// Lease database `name` at `version` of `schema`.
    ///
    /// `on_version_change` runs (outside any lock) when a later opener wants
    /// a higher version; the holder is expected to drop its lease.
    pub fn open(
        self: &Arc<Self>,
        name: &str,
        schema: &'static DbSchema,
        version: u32,
        on_version_change: VersionChangeCallback,
    ) -> Result<DbLease> {
        if version == 0 || version > schema.version {
            return Err(Error::InvalidOptions(format!(
                "{} schema has no version {version}",
                schema.name
            )));
        }

        let mut open = self.open.lock();

        if let Some(entry) = open.get(name) {
            let live = entry.db.upgrade();
            if entry.version == version {
                if let Some(db) = live {
                    return Ok(self.add_holder(&mut open, name, db, on_version_change));
                }
            } else if entry.version > version && live.is_some() {
                log::debug!("Open {name} v{version} blocked by holders at v{}", entry.version);
                return Err(Error::Blocked);
            } else if live.is_some() {
                let callbacks: Vec<VersionChangeCallback> =
                    entry.holders.iter().map(|(_, cb)| cb.clone()).collect();
                drop(live);
                drop(open);

                log::info!(
                    "Asking {} holder(s) of {name} to close for version {version}",
                    callbacks.len()
                );
                for callback in callbacks {
                    callback();
                }

                open = self.open.lock();
                let still_open = open
                    .get(name)
                    .is_some_and(|entry| entry.db.strong_count() > 0);
                if still_open {
                    return Err(Error::Blocked);
                }
            }
        }

        let db = Arc::new(LocalDb::open(&self.config, name, schema, version)?);
        open.insert(
            name.to_string(),
            OpenDatabase {
                version,
                db: Arc::downgrade(&db),
                holders: Vec::new(),
            },
        );
        Ok(self.add_holder(&mut open, name, db, on_version_change))
    }

    fn add_holder(
        self: &Arc<Self>,
        open: &mut MutexGuard<'_, HashMap<String, OpenDatabase>>,
        name: &str,
        db: Arc<LocalDb>,
        on_version_change: VersionChangeCallback,
    ) -> DbLease {
        let id = self.next_holder.fetch_add(1, Ordering::Relaxed);
        if let Some(entry) = open.get_mut(name) {
            entry.holders.push((id, on_version_change));
        }
        DbLease {
            db,
            databases: Arc::downgrade(self),
            holder: id,
        }
    }

    fn release(&self, name: &str, holder: u64) {
        let mut open = self.open.lock();
        if let Some(entry) = open.get_mut(name) {
            entry.holders.retain(|(id, _)| *id != holder);
            if entry.holders.is_empty() && entry.db.strong_count() <= 1 {
                open.remove(name);
            }
        }
    }

    /// Version currently held open for `name`, if any.
    pub fn open_version(&self, name: &str) -> Option<u32> {
        self.open
            .lock()
            .get(name)
            .filter(|entry| entry.db.strong_count() > 0)
            .map(|entry| entry.version)
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.config.data_dir.join(dir_name(name))
    }
}

/// A holder's share of an open database. Dropping it releases the holder.
pub struct DbLease {
    db: Arc<LocalDb>,
    databases: Weak<LocalDatabases>,
    holder: u64,
}

impl DbLease {
    pub fn db(&self) -> &LocalDb {
        &self.db
    }
}

impl std::ops::Deref for DbLease {
    type Target = LocalDb;

    fn deref(&self) -> &LocalDb {
        &self.db
    }
}

impl Drop for DbLease {
    fn drop(&mut self) {
        if let Some(databases) = self.databases.upgrade() {
            databases.release(&self.db.name, self.holder);
        }
    }
}

/// One physical database.
pub struct LocalDb {
    name: String,
    version: u32,
    db: RocksDb,
    /// Last timestamp handed out or observed
    clock: AtomicU64,
    /// Serializes read-modify-write sequences across tabs
    write_lock: Mutex<()>,
    sync_writes: bool,
}

impl LocalDb {
    fn open(config: &StoreConfig, name: &str, schema: &'static DbSchema, version: u32) -> Result<Self> {
        let path = config.data_dir.join(dir_name(name));
        std::fs::create_dir_all(&path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(64);
        db_opts.set_keep_log_file_num(2);

        let mut families: Vec<String> = schema
            .column_families(version)
            .into_iter()
            .map(String::from)
            .collect();
        // RocksDB refuses to open without every existing family
        for existing in RocksDb::list_cf(&Options::default(), &path).unwrap_or_default() {
            if !families.contains(&existing) {
                families.push(existing);
            }
        }

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let descriptors: Vec<ColumnFamilyDescriptor> = families
            .iter()
            .map(|cf| ColumnFamilyDescriptor::new(cf.as_str(), cf_options(schema, cf, &cache)))
            .collect();

        let db = RocksDb::open_cf_descriptors(&db_opts, &path, descriptors)?;

        let meta = db
            .cf_handle(CF_META)
            .ok_or_else(|| Error::Database(format!("Column family '{CF_META}' not found")))?;
        let stored = match db.get_cf(meta, SCHEMA_VERSION_KEY)? {
            Some(bytes) => decode_version(&bytes)?,
            None => 0,
        };

        if stored > version {
            log::warn!("Database {name} is at version {stored}, this build opens {version}");
            return Err(Error::VersionConflict {
                found: stored,
                supported: version,
            });
        }
        if stored < version {
            schema.migrate(&db, stored, version)?;
            db.put_cf(meta, SCHEMA_VERSION_KEY, version.to_be_bytes())?;
        }

        let clock = max_clock(&db, schema)?;
        log::debug!("Opened local database {name} v{version} at {}", path.display());

        Ok(Self {
            name: name.to_string(),
            version,
            db,
            clock: AtomicU64::new(clock),
            write_lock: Mutex::new(()),
            sync_writes: config.sync_writes,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub(crate) fn raw(&self) -> &RocksDb {
        &self.db
    }

    pub(crate) fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Database(format!("Column family '{name}' not found")))
    }

    pub(crate) fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock()
    }

    pub(crate) fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// A fresh timestamp, strictly greater than any issued or observed.
    pub(crate) fn next_timestamp(&self) -> Timestamp {
        let now = now_millis();
        let mut last = self.clock.load(Ordering::SeqCst);
        loop {
            let next = now.max(last + 1);
            match self
                .clock
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    /// Make sure later timestamps are greater than `timestamp`.
    pub(crate) fn observe_timestamp(&self, timestamp: Timestamp) {
        self.clock.fetch_max(timestamp, Ordering::SeqCst);
    }

    /// All entries of `cf` whose key starts with `prefix`, in key order.
    pub(crate) fn scan_prefix(&self, cf: &str, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let cf = self.cf(cf)?;
        let mut entries = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key, value));
        }
        Ok(entries)
    }
}

fn cf_options(schema: &DbSchema, name: &str, cache: &Cache) -> Options {
    let mut opts = Options::default();

    let mut block_opts = BlockBasedOptions::default();
    block_opts.set_block_cache(cache);
    block_opts.set_bloom_filter(10.0, false);
    opts.set_block_based_table_factory(&block_opts);
    opts.set_compression_type(DBCompressionType::Lz4);

    match name {
        // payloads are LZ4 compressed before they get here
        schema::CF_BLOBS | schema::CF_UPDATES | schema::CF_LEGACY_BLOBS => {
            opts.set_compression_type(DBCompressionType::None);
        }
        _ => {}
    }

    if schema.is_lww(name) {
        opts.set_merge_operator_associative("lww", schema::lww_merge);
    }
    opts
}

fn decode_version(bytes: &[u8]) -> Result<u32> {
    let raw: [u8; 4] = bytes
        .try_into()
        .map_err(|_| Error::Deserialization("bad schema version".into()))?;
    Ok(u32::from_be_bytes(raw))
}

fn max_clock(db: &RocksDb, schema: &DbSchema) -> Result<Timestamp> {
    if !schema.is_lww(schema::CF_CLOCKS) {
        return Ok(0);
    }
    let Some(cf) = db.cf_handle(schema::CF_CLOCKS) else {
        return Ok(0);
    };
    let mut max = 0;
    for item in db.iterator_cf(cf, IteratorMode::Start) {
        let (_, value) = item?;
        let (ts, _) = schema::unstamp(&value)?;
        max = max.max(ts);
    }
    Ok(max)
}

/// Directory name for a database name (`local:workspace:ws1` → `local_workspace_ws1`).
fn dir_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}
