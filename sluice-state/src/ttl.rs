//! Time-based eviction for a `KvState`.
//!
//! A `TtlSweeper` runs on its own tokio interval, independent of record processing.
//! Each pass opens one range scan, deletes entries whose "last reported" timestamp is
//! at least `retention` old, and releases the scan on every exit path. The scan only
//! nominates candidates: each one is deleted through `KvState::delete_if` against its
//! current value, so an entry refreshed after the scan opened survives. Processing is
//! never blocked for the length of a pass.

use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use sluice_core::{metrics, EventTime, KvState, Result};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type TimestampOf = Arc<dyn Fn(&[u8]) -> Option<i64> + Send + Sync>;

pub struct TtlSweeper {
    name: String,
    store: Arc<dyn KvState>,
    retention_ms: i64,
    interval: Duration,
    timestamp_of: TimestampOf,
}

impl TtlSweeper {
    /// `timestamp_of` derives the epoch-ms "last reported" time from a stored value;
    /// entries for which it returns `None` are never evicted.
    pub fn new<F>(name: impl Into<String>, store: Arc<dyn KvState>, retention: Duration, timestamp_of: F) -> Self
    where
        F: Fn(&[u8]) -> Option<i64> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            store,
            retention_ms: retention.as_millis() as i64,
            interval: Duration::from_secs(5 * 60),
            timestamp_of: Arc::new(timestamp_of),
        }
    }

    /// Time between passes; clamped to at least 1ms.
    pub fn interval(mut self, every: Duration) -> Self {
        self.interval = every.max(Duration::from_millis(1));
        self
    }

    /// One pass over the store as of `now_ms`; returns the number of deleted entries.
    pub async fn sweep_once(&self, now_ms: i64) -> Result<usize> {
        let scan = self.store.range(None).await?;
        let mut scanned = 0usize;
        let mut deleted = 0usize;
        // `?` inside the loop drops the scan, which releases it.
        let expired = |value: &[u8]| (self.timestamp_of)(value).is_some_and(|t| now_ms - t >= self.retention_ms);
        for (key, value) in scan {
            scanned += 1;
            if expired(&value) && self.store.delete_if(&key, &expired).await? {
                deleted += 1;
            }
        }
        metrics::STORE_EVICTIONS
            .with_label_values(&[self.name.as_str()])
            .inc_by(deleted as u64);
        info!(store = %self.name, scanned, deleted, "ttl sweep pass");
        Ok(deleted)
    }

    /// Runs the sweep every `interval` until the returned handle is cancelled or dropped.
    pub fn spawn(self) -> SweepHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_once(EventTime::now().millis()).await {
                            warn!(store = %self.name, error = %e, "ttl sweep failed");
                        }
                    }
                }
            }
            debug!(store = %self.name, "ttl sweeper stopped");
        });
        SweepHandle {
            stop: Some(stop_tx),
            handle,
        }
    }
}

/// Owner of a running sweeper. Dropping it stops the timer.
pub struct SweepHandle {
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl SweepHandle {
    /// Stops the sweeper and waits for an in-flight pass to finish.
    pub async fn cancel(mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.handle).await;
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
    }
}

/// Reads an epoch-ms number or RFC3339 string at JSON `pointer` (e.g. `/reported/timestamp`).
pub fn reported_timestamp_ms(pointer: impl Into<String>) -> impl Fn(&[u8]) -> Option<i64> + Send + Sync + 'static {
    let pointer = pointer.into();
    move |bytes| {
        let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
        match value.pointer(&pointer)? {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.timestamp_millis()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryState;

    const DAY_MS: i64 = 86_400_000;

    fn twin(reported_at: i64) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({"reported": {"power": "on", "timestamp": reported_at}})).unwrap()
    }

    #[tokio::test]
    async fn sweep_deletes_expired_and_keeps_recent() {
        let state = InMemoryState::new();
        let now = 1_700_000_000_000;
        state.put(b"turbine-old", twin(now - 8 * DAY_MS)).await.unwrap();
        state.put(b"turbine-new", twin(now - 6 * DAY_MS)).await.unwrap();
        state
            .put(b"turbine-desired-only", serde_json::to_vec(&serde_json::json!({"desired": {}})).unwrap())
            .await
            .unwrap();
        let sweeper = TtlSweeper::new(
            "digital-twin",
            Arc::new(state.clone()),
            Duration::from_secs(7 * 24 * 3600),
            reported_timestamp_ms("/reported/timestamp"),
        );
        assert_eq!(sweeper.sweep_once(now).await.unwrap(), 1);
        assert!(state.get(b"turbine-old").await.unwrap().is_none());
        assert!(state.get(b"turbine-new").await.unwrap().is_some());
        assert!(state.get(b"turbine-desired-only").await.unwrap().is_some());
        assert_eq!(state.open_scans(), 0);
    }

    /// Refreshes `key` right after handing out the scan, as a concurrent writer would.
    struct RefreshedDuringScan {
        inner: InMemoryState,
        key: &'static [u8],
        fresh: Vec<u8>,
    }

    #[async_trait::async_trait]
    impl KvState for RefreshedDuringScan {
        async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
            self.inner.get(key).await
        }
        async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
            self.inner.put(key, value).await
        }
        async fn delete(&self, key: &[u8]) -> Result<()> {
            self.inner.delete(key).await
        }
        async fn delete_if(&self, key: &[u8], expired: &(dyn for<'a> Fn(&'a [u8]) -> bool + Send + Sync)) -> Result<bool> {
            self.inner.delete_if(key, expired).await
        }
        async fn range(&self, prefix: Option<&[u8]>) -> Result<sluice_core::RangeScan> {
            let scan = self.inner.range(prefix).await?;
            self.inner.put(self.key, self.fresh.clone()).await?;
            Ok(scan)
        }
        async fn approximate_count(&self) -> Result<u64> {
            self.inner.approximate_count().await
        }
    }

    #[tokio::test]
    async fn entry_refreshed_after_the_scan_survives() {
        let now = 1_700_000_000_000;
        let inner = InMemoryState::new();
        inner.put(b"turbine-1", twin(now - 8 * DAY_MS)).await.unwrap();
        inner.put(b"turbine-2", twin(now - 9 * DAY_MS)).await.unwrap();
        let store = RefreshedDuringScan {
            inner: inner.clone(),
            key: b"turbine-1",
            fresh: twin(now),
        };
        let sweeper = TtlSweeper::new(
            "digital-twin",
            Arc::new(store),
            Duration::from_secs(7 * 24 * 3600),
            reported_timestamp_ms("/reported/timestamp"),
        );
        assert_eq!(sweeper.sweep_once(now).await.unwrap(), 1);
        assert_eq!(inner.get(b"turbine-1").await.unwrap(), Some(twin(now)));
        assert!(inner.get(b"turbine-2").await.unwrap().is_none());
        assert_eq!(inner.open_scans(), 0);
    }

    #[test]
    fn reported_timestamp_accepts_rfc3339() {
        let f = reported_timestamp_ms("/reported/timestamp");
        let v = serde_json::to_vec(&serde_json::json!({"reported": {"timestamp": "2023-11-14T22:13:20Z"}})).unwrap();
        assert_eq!(f(&v), Some(1_700_000_000_000));
        assert_eq!(f(b"not json".as_slice()), None);
    }

    #[tokio::test]
    async fn spawned_sweeper_evicts_and_stops_on_cancel() {
        let state = InMemoryState::new();
        state.put(b"gone", twin(0)).await.unwrap();
        let handle = TtlSweeper::new(
            "twins",
            Arc::new(state.clone()),
            Duration::from_secs(60),
            reported_timestamp_ms("/reported/timestamp"),
        )
        .interval(Duration::from_millis(10))
        .spawn();
        for _ in 0..100 {
            if state.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(state.is_empty());
        handle.cancel().await;
        assert_eq!(state.open_scans(), 0);
    }
}
