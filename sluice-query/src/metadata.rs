//! Fleet roster and key ownership.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sluice_core::config::ServerConfig;
use sluice_core::{Error, PartitionAssigner, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Advertised `host:port` of one instance's query endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostInfo {
    pub host: String,
    pub port: u16,
}

impl HostInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    pub fn parse(endpoint: &str) -> Result<Self> {
        let (host, port) = endpoint
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("endpoint {endpoint:?} is not host:port")))?;
        let port = port
            .parse()
            .map_err(|e| Error::Config(format!("endpoint {endpoint:?}: {e}")))?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for HostInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMetadata {
    pub host: HostInfo,
    pub partitions: BTreeSet<u32>,
}

impl InstanceMetadata {
    pub fn new(host: HostInfo, partitions: impl IntoIterator<Item = u32>) -> Self {
        Self {
            host,
            partitions: partitions.into_iter().collect(),
        }
    }
}

/// Which instance currently owns each partition.
///
/// Holds no data of its own; answers may be stale while membership changes.
/// The roster is written only by `apply_membership` (directly or through
/// `follow`) and read under a short read lock per lookup.
pub struct ClusterMetadata {
    local: HostInfo,
    assigner: PartitionAssigner,
    roster: RwLock<Vec<InstanceMetadata>>,
}

impl ClusterMetadata {
    /// A fleet of one: the local instance owns every partition.
    pub fn single(local: HostInfo, assigner: PartitionAssigner) -> Self {
        let me = InstanceMetadata::new(local.clone(), 0..assigner.partitions());
        Self {
            local,
            assigner,
            roster: RwLock::new(vec![me]),
        }
    }

    pub fn new(local: HostInfo, assigner: PartitionAssigner, roster: Vec<InstanceMetadata>) -> Self {
        Self {
            local,
            assigner,
            roster: RwLock::new(roster),
        }
    }

    /// Builds the roster from `[server]`.
    ///
    /// Peers that list no partitions get them dealt round-robin in roster order.
    pub fn from_config(cfg: &ServerConfig, partitions: u32) -> Result<Self> {
        let assigner = PartitionAssigner::new(partitions);
        let local = HostInfo::new(cfg.host.clone(), cfg.port);
        if cfg.peers.is_empty() {
            return Ok(Self::single(local, assigner));
        }
        let hosts = cfg
            .peers
            .iter()
            .map(|p| HostInfo::parse(&p.endpoint))
            .collect::<Result<Vec<_>>>()?;
        let roster = if cfg.peers.iter().all(|p| p.partitions.is_empty()) {
            let n = hosts.len() as u32;
            hosts
                .into_iter()
                .enumerate()
                .map(|(i, h)| InstanceMetadata::new(h, (0..assigner.partitions()).filter(|p| p % n == i as u32)))
                .collect()
        } else {
            hosts
                .into_iter()
                .zip(&cfg.peers)
                .map(|(h, p)| InstanceMetadata::new(h, p.partitions.iter().copied()))
                .collect()
        };
        Ok(Self::new(local, assigner, roster))
    }

    pub fn local(&self) -> &HostInfo {
        &self.local
    }

    pub fn is_local(&self, host: &HostInfo) -> bool {
        *host == self.local
    }

    pub fn partition_of(&self, key: &[u8]) -> u32 {
        self.assigner.assign(key)
    }

    /// Owner of the partition `key` hashes to, if any instance claims it.
    pub fn owner_of(&self, key: &[u8]) -> Option<HostInfo> {
        let partition = self.partition_of(key);
        self.roster
            .read()
            .iter()
            .find(|i| i.partitions.contains(&partition))
            .map(|i| i.host.clone())
    }

    /// Partitions the current roster assigns to this instance.
    pub fn local_partitions(&self) -> BTreeSet<u32> {
        self.roster
            .read()
            .iter()
            .filter(|i| i.host == self.local)
            .flat_map(|i| i.partitions.iter().copied())
            .collect()
    }

    pub fn instances(&self) -> Vec<InstanceMetadata> {
        self.roster.read().clone()
    }

    /// Replaces the roster with the latest membership snapshot.
    pub fn apply_membership(&self, roster: Vec<InstanceMetadata>) {
        let mut current = self.roster.write();
        if *current == roster {
            debug!("membership unchanged");
            return;
        }
        let before: BTreeSet<_> = current.iter().map(|i| i.host.clone()).collect();
        let after: BTreeSet<_> = roster.iter().map(|i| i.host.clone()).collect();
        let joined = after.difference(&before).count();
        let left = before.difference(&after).count();
        *current = roster;
        info!(instances = current.len(), joined, left, "cluster membership changed");
    }

    /// Applies every roster published on `updates` until the sender goes away.
    pub fn follow(self: Arc<Self>, mut updates: watch::Receiver<Vec<InstanceMetadata>>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let initial = updates.borrow_and_update().clone();
            self.apply_membership(initial);
            while updates.changed().await.is_ok() {
                let roster = updates.borrow_and_update().clone();
                self.apply_membership(roster);
            }
            debug!("membership feed closed");
        })
    }
}
