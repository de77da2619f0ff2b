use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rocksdb::{Direction, IteratorMode, Options, DB};
use sluice_core::{Error, KvState, RangeScan, Result, ScanGuard};

/// A RocksDB-backed `KvState` (enable with `--features rocksdb`).
///
/// Writes go through `writes` so `delete_if` can check and delete without a put
/// landing in between.
pub struct RocksDbState {
    db: DB,
    writes: Mutex<()>,
    open_scans: Arc<AtomicUsize>,
}

fn store_err(e: rocksdb::Error) -> Error {
    Error::Store(e.to_string())
}

impl RocksDbState {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path).map_err(store_err)?;
        Ok(Self {
            db,
            writes: Mutex::new(()),
            open_scans: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn open_scans(&self) -> usize {
        self.open_scans.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KvState for RocksDbState {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db.get(key).map_err(store_err)
    }
    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        let _w = self.writes.lock();
        self.db.put(key, value).map_err(store_err)
    }
    async fn delete(&self, key: &[u8]) -> Result<()> {
        let _w = self.writes.lock();
        self.db.delete(key).map_err(store_err)
    }
    async fn delete_if(&self, key: &[u8], expired: &(dyn for<'a> Fn(&'a [u8]) -> bool + Send + Sync)) -> Result<bool> {
        let _w = self.writes.lock();
        match self.db.get(key).map_err(store_err)? {
            Some(current) if expired(&current) => {
                self.db.delete(key).map_err(store_err)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
    async fn range(&self, prefix: Option<&[u8]>) -> Result<RangeScan> {
        // Read from a point-in-time snapshot; the snapshot is released when this returns.
        let snapshot = self.db.snapshot();
        let mode = match prefix {
            Some(p) => IteratorMode::From(p, Direction::Forward),
            None => IteratorMode::Start,
        };
        let mut out = Vec::new();
        for item in snapshot.iterator(mode) {
            let (k, v) = item.map_err(store_err)?;
            if let Some(p) = prefix {
                if !k.starts_with(p) {
                    break;
                }
            }
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(RangeScan::tracked(out, ScanGuard::new(&self.open_scans)))
    }
    async fn approximate_count(&self) -> Result<u64> {
        Ok(self
            .db
            .property_int_value("rocksdb.estimate-num-keys")
            .map_err(store_err)?
            .unwrap_or(0))
    }
}
