//! Routes interactive queries to the instance that owns the data.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use sluice_core::{metrics, KvState};
use tracing::{debug, warn};

use crate::error::QueryError;
use crate::metadata::ClusterMetadata;
use crate::remote::RemoteQuery;

/// Answers point and fleet-wide queries against named stores.
///
/// Every instance registers the same store names; only the owning instance
/// holds a given key.
pub struct QueryRouter {
    metadata: Arc<ClusterMetadata>,
    remote: Arc<dyn RemoteQuery>,
    stores: HashMap<String, Arc<dyn KvState>>,
}

impl QueryRouter {
    pub fn new(metadata: Arc<ClusterMetadata>, remote: Arc<dyn RemoteQuery>) -> Self {
        Self {
            metadata,
            remote,
            stores: HashMap::new(),
        }
    }

    pub fn store(mut self, name: impl Into<String>, store: Arc<dyn KvState>) -> Self {
        self.stores.insert(name.into(), store);
        self
    }

    pub fn metadata(&self) -> &Arc<ClusterMetadata> {
        &self.metadata
    }

    fn local_store(&self, name: &str) -> Result<&Arc<dyn KvState>, QueryError> {
        self.stores
            .get(name)
            .ok_or_else(|| QueryError::UnknownStore(name.to_string()))
    }

    fn record_failure(&self, err: &QueryError, host: &str, store: &str) {
        metrics::REMOTE_QUERY_FAILURES.with_label_values(&[err.kind()]).inc();
        warn!(%host, store, error = %err, "remote query failed");
    }

    /// Reads `key` from this instance's copy of `store`, with no routing.
    pub async fn get_local(&self, store: &str, key: &str) -> Result<Option<serde_json::Value>, QueryError> {
        let st = self.local_store(store)?;
        match st.get(key.as_bytes()).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(sluice_core::Error::from)?)),
            None => Ok(None),
        }
    }

    /// Point query: read locally when this instance owns `key`, otherwise ask the owner once.
    pub async fn lookup(&self, store: &str, key: &str) -> Result<Option<serde_json::Value>, QueryError> {
        self.local_store(store)?;
        let owner = self
            .metadata
            .owner_of(key.as_bytes())
            .ok_or_else(|| QueryError::NoOwner(self.metadata.partition_of(key.as_bytes())))?;
        if self.metadata.is_local(&owner) {
            return self.get_local(store, key).await;
        }
        debug!(%owner, store, key, "forwarding lookup");
        self.remote.get(&owner, store, key).await.inspect_err(|e| {
            self.record_failure(e, &owner.to_string(), store);
        })
    }

    pub async fn count_local(&self, store: &str) -> Result<u64, QueryError> {
        Ok(self.local_store(store)?.approximate_count().await?)
    }

    /// Scatter-gather: folds every instance's local count with `combine`.
    ///
    /// An instance that cannot answer contributes `identity`.
    pub async fn aggregate_across_fleet<F>(&self, store: &str, identity: u64, combine: F) -> Result<u64, QueryError>
    where
        F: Fn(u64, u64) -> u64,
    {
        let local = self.count_local(store).await?;
        let remotes = self
            .metadata
            .instances()
            .into_iter()
            .map(|i| i.host)
            .filter(|h| !self.metadata.is_local(h))
            .collect::<Vec<_>>();
        let partials = join_all(remotes.iter().map(|h| self.remote.count_local(h, store))).await;
        let mut total = combine(identity, local);
        for (host, partial) in remotes.iter().zip(partials) {
            match partial {
                Ok(n) => total = combine(total, n),
                Err(e) => self.record_failure(&e, &host.to_string(), store),
            }
        }
        Ok(total)
    }

    pub async fn count_across_fleet(&self, store: &str) -> Result<u64, QueryError> {
        self.aggregate_across_fleet(store, 0, |a, b| a + b).await
    }

    /// Every entry of this instance's copy of `store`, in key order.
    pub async fn all_local(&self, store: &str) -> Result<serde_json::Map<String, serde_json::Value>, QueryError> {
        let scan = self.local_store(store)?.range(None).await?;
        let mut out = serde_json::Map::new();
        for (k, v) in scan {
            let value = serde_json::from_slice(&v).map_err(sluice_core::Error::from)?;
            out.insert(String::from_utf8_lossy(&k).into_owned(), value);
        }
        Ok(out)
    }
}
