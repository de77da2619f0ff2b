//! sluice-state: durable keyed store backends.
//! Provides an ordered `InMemoryState`, an optional RocksDB backend and the TTL sweeper.

mod mem;
#[cfg(feature = "rocksdb")]
pub mod rocks;
pub mod ttl;

pub use mem::InMemoryState;
#[cfg(feature = "rocksdb")]
pub use rocks::RocksDbState;
pub use ttl::{reported_timestamp_ms, SweepHandle, TtlSweeper};
