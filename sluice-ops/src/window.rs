use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sluice_core::{metrics, Context, Error, EventTime, KvState, Operator, Record, Result, Watermark};
use tracing::{debug, error, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowAssigner {
    Tumbling { size_ms: i64 },
    Sliding { size_ms: i64, slide_ms: i64 },
}

/// Half-open event-time interval `[start, end)` in epoch ms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Window {
    pub start: i64,
    pub end: i64,
}

impl Window {
    pub fn contains(&self, ts: EventTime) -> bool {
        self.start <= ts.millis() && ts.millis() < self.end
    }

    /// A window closes for good once the watermark reaches `end + grace`.
    pub fn is_closed(&self, wm: Watermark, grace_ms: i64) -> bool {
        wm.millis() >= self.end + grace_ms
    }
}

impl WindowAssigner {
    pub fn tumbling(size_ms: i64) -> Self {
        WindowAssigner::Tumbling { size_ms: size_ms.max(1) }
    }

    pub fn sliding(size_ms: i64, slide_ms: i64) -> Self {
        WindowAssigner::Sliding {
            size_ms: size_ms.max(1),
            slide_ms: slide_ms.max(1),
        }
    }

    /// Windows containing `ts`, in ascending start order.
    pub fn assign(&self, ts: EventTime) -> Vec<Window> {
        let t = ts.millis();
        match *self {
            WindowAssigner::Tumbling { size_ms } => {
                let start = t - t.rem_euclid(size_ms);
                vec![Window {
                    start,
                    end: start + size_ms,
                }]
            }
            WindowAssigner::Sliding { size_ms, slide_ms } => {
                let mut out = Vec::new();
                let mut start = t - t.rem_euclid(slide_ms);
                while start > t - size_ms {
                    out.push(Window {
                        start,
                        end: start + size_ms,
                    });
                    start -= slide_ms;
                }
                out.reverse();
                out
            }
        }
    }
}

/// Composite (original key, window) identity of one aggregation entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowedKey {
    pub key: Vec<u8>,
    pub window: Window,
}

impl WindowedKey {
    // layout: key | start (be i64) | end (be i64)
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.key.len() + 16);
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.window.start.to_be_bytes());
        out.extend_from_slice(&self.window.end.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let split = bytes.len().checked_sub(16)?;
        let (key, tail) = bytes.split_at(split);
        let start = i64::from_be_bytes(tail[..8].try_into().ok()?);
        let end = i64::from_be_bytes(tail[8..].try_into().ok()?);
        Some(Self {
            key: key.to_vec(),
            window: Window { start, end },
        })
    }
}

/// Action taken when a suppression buffer would exceed its capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BufferFull {
    /// Halt the pipeline with `Error::SuppressionBufferFull`.
    #[default]
    ShutDown,
    /// Emit the window that closes soonest before its time and evict it.
    EmitEarly,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferConfig {
    pub max_records: Option<usize>,
    pub on_full: BufferFull,
}

impl BufferConfig {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn max_records(max: usize) -> Self {
        Self {
            max_records: Some(max),
            on_full: BufferFull::ShutDown,
        }
    }

    pub fn shut_down_when_full(mut self) -> Self {
        self.on_full = BufferFull::ShutDown;
        self
    }

    pub fn emit_early_when_full(mut self) -> Self {
        self.on_full = BufferFull::EmitEarly;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Suppression {
    /// Forward every accumulator update.
    #[default]
    None,
    /// Forward only the final value of each window, once, when it closes.
    UntilWindowCloses(BufferConfig),
}

type Init<A> = Box<dyn Fn() -> A + Send + Sync>;
type Aggregator<A> = Box<dyn Fn(&[u8], &serde_json::Value, A) -> A + Send + Sync>;

/// Per-key windowed aggregation over a durable store.
///
/// Accumulators live in `store` as JSON under `ns_prefix | WindowedKey::encode()`.
/// The operator itself only keeps the index of open windows ordered by close time,
/// which `restore` rebuilds from the store.
///
/// ```no_run
/// use std::sync::Arc;
/// use sluice_ops::{WindowAssigner, WindowedAggregate, Suppression, BufferConfig};
/// # fn store() -> Arc<dyn sluice_core::KvState> { unimplemented!() }
/// let pulse = WindowedAggregate::count("pulse-counts", WindowAssigner::tumbling(60_000), 5_000, store())
///     .with_suppression(Suppression::UntilWindowCloses(BufferConfig::unbounded().shut_down_when_full()));
/// # let _ = pulse;
/// ```
pub struct WindowedAggregate<A> {
    name: String,
    assigner: WindowAssigner,
    grace_ms: i64,
    init: Init<A>,
    aggregator: Aggregator<A>,
    store: Arc<dyn KvState>,
    ns_prefix: Vec<u8>,
    suppression: Suppression,
    // (close_at, encoded windowed key)
    pending: BTreeSet<(i64, Vec<u8>)>,
    watermark: Option<Watermark>,
    late: u64,
}

impl WindowedAggregate<i64> {
    pub fn count(name: impl Into<String>, assigner: WindowAssigner, grace_ms: i64, store: Arc<dyn KvState>) -> Self {
        Self::new(name, assigner, grace_ms, store, || 0i64, |_k, _v, n| n + 1)
    }
}

impl<A> WindowedAggregate<A>
where
    A: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new<I, F>(
        name: impl Into<String>,
        assigner: WindowAssigner,
        grace_ms: i64,
        store: Arc<dyn KvState>,
        init: I,
        aggregator: F,
    ) -> Self
    where
        I: Fn() -> A + Send + Sync + 'static,
        F: Fn(&[u8], &serde_json::Value, A) -> A + Send + Sync + 'static,
    {
        let name = name.into();
        let ns_prefix = format!("{name}:").into_bytes();
        Self {
            name,
            assigner,
            grace_ms: grace_ms.max(0),
            init: Box::new(init),
            aggregator: Box::new(aggregator),
            store,
            ns_prefix,
            suppression: Suppression::None,
            pending: BTreeSet::new(),
            watermark: None,
            late: 0,
        }
    }

    pub fn with_suppression(mut self, suppression: Suppression) -> Self {
        self.suppression = suppression;
        self
    }

    /// Store key namespace; defaults to `"{name}:"`.
    pub fn with_prefix(mut self, prefix: impl AsRef<[u8]>) -> Self {
        self.ns_prefix = prefix.as_ref().to_vec();
        self
    }

    pub fn late_records(&self) -> u64 {
        self.late
    }

    /// Open windows currently held back.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Rebuild the open-window index from accumulators already in the store.
    pub async fn restore(&mut self) -> Result<usize> {
        let scan = self.store.range(Some(&self.ns_prefix)).await?;
        for (k, _) in scan {
            if let Some(wk) = WindowedKey::decode(&k[self.ns_prefix.len()..]) {
                self.pending.insert((wk.window.end + self.grace_ms, wk.encode()));
            }
        }
        self.report_buffered();
        Ok(self.pending.len())
    }

    fn store_key(&self, encoded: &[u8]) -> Vec<u8> {
        let mut k = self.ns_prefix.clone();
        k.extend_from_slice(encoded);
        k
    }

    fn output(&self, wk: &WindowedKey, acc: &A) -> Result<Record> {
        let value = serde_json::json!({
            "key": String::from_utf8_lossy(&wk.key),
            "window_start_ms": wk.window.start,
            "window_end_ms": wk.window.end,
            "value": serde_json::to_value(acc)?,
        });
        Ok(Record::new(self.name.clone(), wk.key.clone(), value, EventTime(wk.window.end - 1)))
    }

    fn report_buffered(&self) {
        if matches!(self.suppression, Suppression::UntilWindowCloses(_)) {
            metrics::SUPPRESSION_BUFFERED
                .with_label_values(&[self.name.as_str()])
                .set(self.pending.len() as i64);
        }
    }

    /// Final emission (when suppressed) and eviction of one window.
    async fn close(&mut self, ctx: &mut dyn Context, encoded: &[u8]) -> Result<()> {
        let store_key = self.store_key(encoded);
        let Some(wk) = WindowedKey::decode(encoded) else {
            return Ok(());
        };
        if let Some(bytes) = self.store.get(&store_key).await? {
            if matches!(self.suppression, Suppression::UntilWindowCloses(_)) {
                let acc: A = serde_json::from_slice(&bytes)?;
                ctx.collect(self.output(&wk, &acc)?);
                metrics::OP_THROUGHPUT
                    .with_label_values(&[self.name.as_str(), "emit"])
                    .inc();
                debug!(operator = %self.name, key = %String::from_utf8_lossy(&wk.key), start = wk.window.start, "window closed");
            }
            self.store.delete(&store_key).await?;
        }
        Ok(())
    }

    async fn enforce_capacity(&mut self, ctx: &mut dyn Context, config: BufferConfig) -> Result<()> {
        let Some(max) = config.max_records else {
            return Ok(());
        };
        while self.pending.len() > max {
            match config.on_full {
                BufferFull::ShutDown => {
                    error!(operator = %self.name, capacity = max, "suppression buffer full; shutting down");
                    return Err(Error::SuppressionBufferFull {
                        operator: self.name.clone(),
                        capacity: max,
                    });
                }
                BufferFull::EmitEarly => {
                    let Some((_, encoded)) = self.pending.pop_first() else {
                        break;
                    };
                    debug!(operator = %self.name, "suppression buffer full; emitting early");
                    self.close(ctx, &encoded).await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<A> Operator for WindowedAggregate<A>
where
    A: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    #[instrument(name = "windowed_aggregate_on_element", skip_all)]
    async fn on_element(&mut self, ctx: &mut dyn Context, rec: Record) -> Result<()> {
        metrics::OP_THROUGHPUT
            .with_label_values(&[self.name.as_str(), "receive"])
            .inc();
        let mut dropped = false;
        for window in self.assigner.assign(rec.event_time) {
            if self.watermark.is_some_and(|wm| window.is_closed(wm, self.grace_ms)) {
                dropped = true;
                continue;
            }
            let wk = WindowedKey {
                key: rec.key.clone(),
                window,
            };
            let encoded = wk.encode();
            let store_key = self.store_key(&encoded);
            let prev = match self.store.get(&store_key).await? {
                Some(bytes) => serde_json::from_slice(&bytes)?,
                None => (self.init)(),
            };
            let next = (self.aggregator)(&rec.key, &rec.value, prev);
            self.store.put(&store_key, serde_json::to_vec(&next)?).await?;
            let opened = self.pending.insert((window.end + self.grace_ms, encoded));
            match self.suppression {
                Suppression::None => {
                    ctx.collect(self.output(&wk, &next)?);
                    metrics::OP_THROUGHPUT
                        .with_label_values(&[self.name.as_str(), "emit"])
                        .inc();
                }
                Suppression::UntilWindowCloses(config) => {
                    if opened {
                        self.enforce_capacity(ctx, config).await?;
                        self.report_buffered();
                    }
                }
            }
        }
        if dropped {
            self.late += 1;
            metrics::LATE_RECORDS.with_label_values(&[self.name.as_str()]).inc();
            debug!(operator = %self.name, key = %rec.key_str(), ts = rec.event_time.millis(), "dropping late record");
        }
        Ok(())
    }

    async fn on_watermark(&mut self, ctx: &mut dyn Context, wm: Watermark) -> Result<()> {
        let wm = self.watermark.map_or(wm, |cur| cur.max(wm));
        self.watermark = Some(wm);
        while self.pending.first().is_some_and(|(close_at, _)| *close_at <= wm.millis()) {
            let Some((_, encoded)) = self.pending.pop_first() else {
                break;
            };
            self.close(ctx, &encoded).await?;
        }
        self.report_buffered();
        Ok(())
    }
}
