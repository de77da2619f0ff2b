use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sluice_core::{KvState, RangeScan, Result, ScanGuard};

/// A simple in-memory `KvState` backed by an ordered map.
///
/// Each call takes the lock once; `range` copies the matching entries out under
/// that lock and iterates the copy afterwards.
#[derive(Clone, Default)]
pub struct InMemoryState {
    map: Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>,
    open_scans: Arc<AtomicUsize>,
}

impl InMemoryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Range scans handed out and not yet closed or dropped.
    pub fn open_scans(&self) -> usize {
        self.open_scans.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

#[async_trait]
impl KvState for InMemoryState {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.lock().get(key).cloned())
    }
    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.map.lock().insert(key.to_vec(), value);
        Ok(())
    }
    async fn delete(&self, key: &[u8]) -> Result<()> {
        self.map.lock().remove(key);
        Ok(())
    }
    async fn delete_if(&self, key: &[u8], expired: &(dyn for<'a> Fn(&'a [u8]) -> bool + Send + Sync)) -> Result<bool> {
        let mut map = self.map.lock();
        let gone = map.get(key).is_some_and(|current| expired(current));
        if gone {
            map.remove(key);
        }
        Ok(gone)
    }
    async fn range(&self, prefix: Option<&[u8]>) -> Result<RangeScan> {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = {
            let guard = self.map.lock();
            match prefix {
                Some(p) => guard
                    .range::<[u8], _>((Bound::Included(p), Bound::Unbounded))
                    .take_while(|(k, _)| k.starts_with(p))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                None => guard.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            }
        };
        Ok(RangeScan::tracked(entries, ScanGuard::new(&self.open_scans)))
    }
    async fn approximate_count(&self) -> Result<u64> {
        Ok(self.map.lock().len() as u64)
    }
}
