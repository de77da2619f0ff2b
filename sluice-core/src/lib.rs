//! sluice-core: fundamental types, traits and the partitioned executor.
//!
//! Goal: provide the essential abstractions for a partitioned streaming pipeline:
//! - `Record`, `EventTime`, `Watermark`
//! - Traits: `Source`, `Operator`, `Sink`, `Context`, `KvState`, `BroadcastTable`
//! - `PartitionAssigner` and `TimestampExtractor`
//! - a tokio-based `Executor` with one single-writer worker per partition
//!
//! Quick example:
//! ```no_run
//! use sluice_core::{Context, Source, Sink, Operator, Record};
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! struct MySource;
//! #[async_trait::async_trait]
//! impl Source for MySource {
//!     async fn run(&mut self, ctx: &mut dyn Context) -> sluice_core::Result<()> {
//!         ctx.collect(Record::from_value("hello").with_key("greeting"));
//!         Ok(())
//!     }
//! }
//!
//! struct MyOp;
//! #[async_trait::async_trait]
//! impl Operator for MyOp {
//!     async fn on_element(&mut self, ctx: &mut dyn Context, rec: Record) -> sluice_core::Result<()> {
//!         ctx.collect(rec);
//!         Ok(())
//!     }
//! }
//!
//! struct MySink;
//! #[async_trait::async_trait]
//! impl Sink for MySink {
//!     async fn on_element(&mut self, _rec: Record) -> sluice_core::Result<()> { Ok(()) }
//! }
//!
//! let mut exec = sluice_core::Executor::new(4);
//! exec.source(MySource).operator(|_partition| MyOp).sink(MySink);
//! exec.run().await?;
//! # Ok(()) }
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub mod config;
pub mod executor;
pub mod metrics;
pub mod partition;
pub mod record;
pub mod time;

pub use executor::Executor;
pub use partition::PartitionAssigner;
pub use record::{EventTime, Record, Watermark};
pub use time::{IngestionTime, TimestampExtractor, WatermarkClock};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("state store failure: {0}")]
    Store(String),
    #[error("invalid event time: {0}")]
    Extraction(String),
    #[error("suppression buffer of {operator} exceeded {capacity} records")]
    SuppressionBufferFull { operator: String, capacity: usize },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("pipeline shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, Error>;

/// An ordered `(key, value)` snapshot produced by [`KvState::range`].
///
/// The scan holds whatever resources the backend attached to it until it is
/// closed or dropped, so every exit path releases it.
pub struct RangeScan {
    entries: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
    _guard: Option<ScanGuard>,
}

/// Tracks an open scan in a backend-owned counter.
pub struct ScanGuard(Arc<AtomicUsize>);

impl ScanGuard {
    pub fn new(open: &Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::SeqCst);
        Self(open.clone())
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RangeScan {
    /// `entries` must already be sorted by key.
    pub fn new(entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        Self {
            entries: entries.into_iter(),
            _guard: None,
        }
    }

    pub fn tracked(entries: Vec<(Vec<u8>, Vec<u8>)>, guard: ScanGuard) -> Self {
        Self {
            entries: entries.into_iter(),
            _guard: Some(guard),
        }
    }

    pub fn close(self) {}
}

impl Iterator for RangeScan {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

/// Durable keyed store.
///
/// Implementations synchronise per call; no operation may hold a lock across calls.
#[async_trait::async_trait]
pub trait KvState: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()>;
    async fn delete(&self, key: &[u8]) -> Result<()>;
    /// Deletes `key` only if its current value still satisfies `expired`; returns
    /// whether it was deleted.
    ///
    /// The default reads then deletes. Backends that can serialise the check with
    /// concurrent writers override it.
    async fn delete_if(&self, key: &[u8], expired: &(dyn for<'a> Fn(&'a [u8]) -> bool + Send + Sync)) -> Result<bool> {
        match self.get(key).await? {
            Some(current) if expired(&current) => {
                self.delete(key).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
    /// Stable, key-ordered snapshot of all entries, or those starting with `prefix`.
    async fn range(&self, prefix: Option<&[u8]>) -> Result<RangeScan>;
    /// Entry count without a full scan; may be an estimate.
    async fn approximate_count(&self) -> Result<u64>;
}

/// A keyed table replicated in full to every partition worker.
///
/// The executor bootstraps it to completion before any stream record is processed,
/// then applies later records of [`BroadcastTable::stream`] directly.
#[async_trait::async_trait]
pub trait BroadcastTable: Send + Sync {
    fn stream(&self) -> &str;
    async fn apply(&self, record: Record) -> Result<()>;
}

pub trait Context: Send {
    fn collect(&mut self, record: Record);
    fn watermark(&mut self, wm: Watermark);
    /// Partition served by the current worker; sources see 0.
    fn partition(&self) -> u32 {
        0
    }
}

#[async_trait::async_trait]
pub trait Source: Send {
    async fn run(&mut self, ctx: &mut dyn Context) -> Result<()>;
}

#[async_trait::async_trait]
pub trait Operator: Send {
    async fn on_element(&mut self, ctx: &mut dyn Context, record: Record) -> Result<()>;
    async fn on_watermark(&mut self, _ctx: &mut dyn Context, _wm: Watermark) -> Result<()> {
        Ok(())
    }
}

#[async_trait::async_trait]
pub trait Sink: Send {
    async fn on_element(&mut self, record: Record) -> Result<()>;
}

/// Context that buffers everything collected; used for bootstrapping and in tests.
#[derive(Debug, Default)]
pub struct CollectingContext {
    pub out: Vec<Record>,
    pub watermarks: Vec<Watermark>,
    pub partition: u32,
}

impl Context for CollectingContext {
    fn collect(&mut self, record: Record) {
        self.out.push(record);
    }
    fn watermark(&mut self, wm: Watermark) {
        self.watermarks.push(wm);
    }
    fn partition(&self) -> u32 {
        self.partition
    }
}

pub mod prelude {
    pub use super::{
        BroadcastTable, Context, EventTime, Executor, KvState, Operator, PartitionAssigner, RangeScan, Record,
        Result, Sink, Source, TimestampExtractor, Watermark,
    };
}
