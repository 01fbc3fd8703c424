//! Minimal transactional engine backing the subscription store.
//!
//! The on-disk layout is a directory holding a `MANIFEST` (magic plus format
//! version), a `LOCK` file held exclusively for the lifetime of the handle,
//! and a `tables.bin` MessagePack document with the table contents and the
//! snapshot version counter.
//!
//! Concurrency model: the current state lives behind an immutable `Arc`
//! snapshot. Read transactions clone the `Arc` and never block. Write
//! transactions serialize through a gate; commit persists the working copy,
//! publishes it as the new snapshot, and bumps the snapshot version.

use crate::error::{Result, StoreError};
use crate::types::SetRecord;
use fs2::FileExt;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// Magic bytes for the store manifest.
const MANIFEST_MAGIC: &[u8; 4] = b"FSS\0";

/// Magic bytes for the tables document.
const TABLES_MAGIC: &[u8; 4] = b"FST\0";

/// Current on-disk format version.
const FORMAT_VERSION: u8 = 1;

const TABLES_FILE: &str = "tables.bin";

/// Table contents, persisted as one document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct Tables {
    /// Internal-metadata schema versions by group key.
    pub schema_versions: BTreeMap<String, i64>,

    /// Subscription sets by version (the primary key). Embedded
    /// subscription rows live inside each set row, so removing a set
    /// removes its subscriptions with it.
    pub sub_sets: BTreeMap<i64, SetRecord>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Persisted {
    snapshot_version: u64,
    tables: Tables,
}

/// An immutable view of the database at one snapshot version.
struct Snapshot {
    version: u64,
    tables: Tables,
}

/// Serializes writers. Readers never touch this.
#[derive(Default)]
struct WriterGate {
    busy: Mutex<bool>,
    released: Condvar,
}

impl WriterGate {
    fn acquire(&self) {
        let mut busy = self.busy.lock();
        while *busy {
            self.released.wait(&mut busy);
        }
        *busy = true;
    }

    fn release(&self) {
        let mut busy = self.busy.lock();
        *busy = false;
        self.released.notify_one();
    }
}

struct Shared {
    dir: PathBuf,
    _lock_file: File,
    writer: WriterGate,
    current: RwLock<Arc<Snapshot>>,
}

/// Handle to an on-disk database instance.
pub struct Database {
    shared: Arc<Shared>,
}

impl Database {
    /// Open an existing database or create a new one at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let manifest = dir.join("MANIFEST");
        if manifest.exists() {
            Self::verify_manifest(&manifest)?;
        } else {
            Self::write_manifest(&manifest)?;
        }

        let lock_file = Self::acquire_lock(&dir)?;

        let tables_path = dir.join(TABLES_FILE);
        let persisted = if tables_path.exists() {
            Self::read_tables(&tables_path)?
        } else {
            Persisted::default()
        };

        debug!(
            path = %dir.display(),
            snapshot_version = persisted.snapshot_version,
            "opened subscription database"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                dir,
                _lock_file: lock_file,
                writer: WriterGate::default(),
                current: RwLock::new(Arc::new(Snapshot {
                    version: persisted.snapshot_version,
                    tables: persisted.tables,
                })),
            }),
        })
    }

    /// Begin a frozen read transaction at the current snapshot.
    pub fn begin_read(&self) -> ReadTransaction {
        ReadTransaction {
            snapshot: Arc::clone(&self.shared.current.read()),
        }
    }

    /// Begin a write transaction. Blocks while another writer is live.
    pub fn begin_write(&self) -> WriteTransaction {
        self.shared.writer.acquire();
        let (base_version, tables) = {
            let current = self.shared.current.read();
            (current.version, current.tables.clone())
        };
        WriteTransaction {
            shared: Arc::clone(&self.shared),
            tables,
            base_version,
            gate_held: true,
        }
    }

    /// The snapshot version of the most recent commit.
    pub fn latest_snapshot_version(&self) -> u64 {
        self.shared.current.read().version
    }

    fn write_manifest(path: &Path) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(MANIFEST_MAGIC)?;
        file.write_all(&[FORMAT_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != MANIFEST_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid manifest magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != FORMAT_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported format version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(dir: &Path) -> Result<File> {
        let lock_file = File::create(dir.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;
        Ok(lock_file)
    }

    fn read_tables(path: &Path) -> Result<Persisted> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != TABLES_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid tables magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != FORMAT_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported tables format version: {}",
                version[0]
            )));
        }

        let mut encoded = Vec::new();
        file.read_to_end(&mut encoded)?;
        Ok(rmp_serde::from_slice(&encoded)?)
    }

    fn write_tables(dir: &Path, persisted: &Persisted) -> Result<()> {
        let tmp_path = dir.join("tables.bin.tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(TABLES_MAGIC)?;
            file.write_all(&[FORMAT_VERSION])?;
            let encoded = rmp_serde::to_vec(persisted)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, dir.join(TABLES_FILE))?;
        Ok(())
    }
}

/// A frozen view of the database. Cheap to create, never blocks writers.
pub struct ReadTransaction {
    snapshot: Arc<Snapshot>,
}

impl ReadTransaction {
    /// The snapshot version this transaction observes.
    pub fn snapshot_version(&self) -> u64 {
        self.snapshot.version
    }

    /// Look up the recorded schema version for a metadata group.
    pub fn schema_version(&self, group: &str) -> Option<i64> {
        self.snapshot.tables.schema_versions.get(group).copied()
    }

    /// The subscription set table, keyed by version.
    pub(crate) fn sub_sets(&self) -> &BTreeMap<i64, SetRecord> {
        &self.snapshot.tables.sub_sets
    }
}

/// An exclusive write transaction over a working copy of the tables.
///
/// Dropping the transaction without committing rolls it back: the working
/// copy is discarded and no snapshot version is consumed.
pub struct WriteTransaction {
    shared: Arc<Shared>,
    tables: Tables,
    base_version: u64,
    gate_held: bool,
}

impl WriteTransaction {
    /// The snapshot version this transaction will publish on commit.
    pub fn version(&self) -> u64 {
        self.base_version + 1
    }

    /// Record the schema version for a metadata group.
    pub fn set_schema_version(&mut self, group: &str, version: i64) {
        self.tables.schema_versions.insert(group.to_owned(), version);
    }

    /// The subscription set table, keyed by version.
    pub(crate) fn sub_sets(&self) -> &BTreeMap<i64, SetRecord> {
        &self.tables.sub_sets
    }

    pub(crate) fn sub_sets_mut(&mut self) -> &mut BTreeMap<i64, SetRecord> {
        &mut self.tables.sub_sets
    }

    /// Guard for mutation entry points.
    pub fn ensure_writing(&self) -> Result<()> {
        if self.gate_held {
            Ok(())
        } else {
            Err(StoreError::WrongTransactionStage)
        }
    }

    /// Persist the working copy and publish it as the current snapshot.
    pub fn commit(mut self) -> Result<()> {
        self.commit_inner()?;
        Ok(())
    }

    /// Commit, then continue with a read transaction at the snapshot this
    /// commit just published.
    pub fn commit_and_continue_as_read(mut self) -> Result<ReadTransaction> {
        let snapshot = self.commit_inner()?;
        Ok(ReadTransaction { snapshot })
    }

    fn commit_inner(&mut self) -> Result<Arc<Snapshot>> {
        self.ensure_writing()?;

        let new_version = self.base_version + 1;
        let tables = std::mem::take(&mut self.tables);

        let persisted = Persisted {
            snapshot_version: new_version,
            tables,
        };
        Database::write_tables(&self.shared.dir, &persisted)?;

        let snapshot = Arc::new(Snapshot {
            version: new_version,
            tables: persisted.tables,
        });
        *self.shared.current.write() = Arc::clone(&snapshot);

        self.shared.writer.release();
        self.gate_held = false;

        trace!(snapshot_version = new_version, "committed write transaction");
        Ok(snapshot)
    }
}

impl Drop for WriteTransaction {
    fn drop(&mut self) {
        if self.gate_held {
            self.shared.writer.release();
        }
    }
}
