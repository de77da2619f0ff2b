//! Join operators.
//!
//! * `WindowedJoin`: inner stream-stream join bounded by `JoinWindows`.
//! * `StreamTableJoin`: stream records look up a co-partitioned table kept in a `KvState`.
//! * `GlobalTableJoin`: stream records look up a `GlobalTable` replicated to every partition.
//!
//! Inputs are told apart by `Record::stream`. Both sides of a join must be partitioned
//! on the join key; re-keyed inputs need a `Rekey` followed by `Executor::repartition`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use sluice_core::{metrics, BroadcastTable, Context, EventTime, KvState, Operator, Record, Result, Watermark};
use tracing::{debug, instrument};

/// Time bounds of a stream-stream join, in ms.
///
/// A left record at `ta` matches right records with `tb` in `[ta - before, ta + after]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinWindows {
    pub before_ms: i64,
    pub after_ms: i64,
    pub grace_ms: i64,
}

impl JoinWindows {
    pub fn of(diff_ms: i64) -> Self {
        Self {
            before_ms: diff_ms,
            after_ms: diff_ms,
            grace_ms: 0,
        }
    }

    pub fn before(mut self, ms: i64) -> Self {
        self.before_ms = ms;
        self
    }

    pub fn after(mut self, ms: i64) -> Self {
        self.after_ms = ms;
        self
    }

    pub fn grace(mut self, ms: i64) -> Self {
        self.grace_ms = ms;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

type Buffer = HashMap<Vec<u8>, Vec<(EventTime, serde_json::Value)>>;

/// Symmetric windowed inner join of the `left` and `right` streams.
///
/// Arrival on either side scans the other side's buffer for the same key. Output is
/// `combiner(left, right)` stamped with the later of the two event times.
///
/// A left input is late once the watermark passes `t + after + grace` (right: `before`).
/// Buffered records on either side are kept until `t + before + after + grace`, the
/// latest point at which an accepted input from the other side can still match them.
pub struct WindowedJoin<F> {
    name: String,
    left: String,
    right: String,
    windows: JoinWindows,
    combiner: F,
    left_buf: Buffer,
    right_buf: Buffer,
    watermark: Option<Watermark>,
    late: u64,
}

impl<F> WindowedJoin<F>
where
    F: Fn(&serde_json::Value, &serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
{
    pub fn new(
        name: impl Into<String>,
        left: impl Into<String>,
        right: impl Into<String>,
        windows: JoinWindows,
        combiner: F,
    ) -> Self {
        Self {
            name: name.into(),
            left: left.into(),
            right: right.into(),
            windows,
            combiner,
            left_buf: HashMap::new(),
            right_buf: HashMap::new(),
            watermark: None,
            late: 0,
        }
    }

    pub fn late_records(&self) -> u64 {
        self.late
    }

    /// Records currently buffered on both sides.
    pub fn buffered(&self) -> usize {
        self.left_buf.values().chain(self.right_buf.values()).map(Vec::len).sum()
    }

    /// How far the watermark may pass an input's time before the input is late.
    fn lateness(&self, side: Side) -> i64 {
        let reach = match side {
            Side::Left => self.windows.after_ms,
            Side::Right => self.windows.before_ms,
        };
        reach + self.windows.grace_ms
    }

    fn retention(&self) -> i64 {
        self.windows.before_ms + self.windows.after_ms + self.windows.grace_ms
    }

    fn matches(&self, side: Side, t: EventTime, other: EventTime) -> bool {
        let (lo, hi) = match side {
            Side::Left => (t.millis() - self.windows.before_ms, t.millis() + self.windows.after_ms),
            Side::Right => (t.millis() - self.windows.after_ms, t.millis() + self.windows.before_ms),
        };
        lo <= other.millis() && other.millis() <= hi
    }
}

#[async_trait]
impl<F> Operator for WindowedJoin<F>
where
    F: Fn(&serde_json::Value, &serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
{
    #[instrument(name = "windowed_join_on_element", skip_all)]
    async fn on_element(&mut self, ctx: &mut dyn Context, rec: Record) -> Result<()> {
        let side = if rec.stream == self.left {
            Side::Left
        } else if rec.stream == self.right {
            Side::Right
        } else {
            debug!(operator = %self.name, stream = %rec.stream, "record from a stream outside the join");
            metrics::DROPPED_RECORDS.with_label_values(&["unknown_stream"]).inc();
            return Ok(());
        };
        metrics::OP_THROUGHPUT
            .with_label_values(&[self.name.as_str(), "receive"])
            .inc();
        if let Some(wm) = self.watermark {
            if wm.millis() > rec.event_time.millis() + self.lateness(side) {
                self.late += 1;
                metrics::LATE_RECORDS.with_label_values(&[self.name.as_str()]).inc();
                debug!(operator = %self.name, key = %rec.key_str(), "dropping late join input");
                return Ok(());
            }
        }

        let other = match side {
            Side::Left => &self.right_buf,
            Side::Right => &self.left_buf,
        };
        if let Some(candidates) = other.get(&rec.key) {
            for (t, v) in candidates {
                if !self.matches(side, rec.event_time, *t) {
                    continue;
                }
                let joined = match side {
                    Side::Left => (self.combiner)(&rec.value, v),
                    Side::Right => (self.combiner)(v, &rec.value),
                };
                ctx.collect(Record::new(
                    self.name.clone(),
                    rec.key.clone(),
                    joined,
                    rec.event_time.max(*t),
                ));
                metrics::OP_THROUGHPUT
                    .with_label_values(&[self.name.as_str(), "emit"])
                    .inc();
            }
        }

        let own = match side {
            Side::Left => &mut self.left_buf,
            Side::Right => &mut self.right_buf,
        };
        own.entry(rec.key).or_default().push((rec.event_time, rec.value));
        Ok(())
    }

    async fn on_watermark(&mut self, _ctx: &mut dyn Context, wm: Watermark) -> Result<()> {
        let wm = self.watermark.map_or(wm, |cur| cur.max(wm));
        self.watermark = Some(wm);
        let keep = self.retention();
        for buf in [&mut self.left_buf, &mut self.right_buf] {
            buf.retain(|_, entries| {
                entries.retain(|(t, _)| wm.millis() <= t.millis() + keep);
                !entries.is_empty()
            });
        }
        Ok(())
    }
}

/// Joins a stream against a co-partitioned table.
///
/// Records of the `table` stream upsert (or, with a `null` value, delete) the table
/// entry and emit nothing. Records of the `stream` stream look up their key and emit
/// `joiner(stream_value, table_value)` when present.
pub struct StreamTableJoin<F> {
    name: String,
    stream: String,
    table: String,
    store: Arc<dyn KvState>,
    joiner: F,
}

impl<F> StreamTableJoin<F>
where
    F: Fn(&serde_json::Value, &serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
{
    pub fn new(
        name: impl Into<String>,
        stream: impl Into<String>,
        table: impl Into<String>,
        store: Arc<dyn KvState>,
        joiner: F,
    ) -> Self {
        Self {
            name: name.into(),
            stream: stream.into(),
            table: table.into(),
            store,
            joiner,
        }
    }
}

#[async_trait]
impl<F> Operator for StreamTableJoin<F>
where
    F: Fn(&serde_json::Value, &serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
{
    #[instrument(name = "stream_table_join_on_element", skip_all)]
    async fn on_element(&mut self, ctx: &mut dyn Context, rec: Record) -> Result<()> {
        if rec.stream == self.table {
            if rec.value.is_null() {
                self.store.delete(&rec.key).await?;
            } else {
                self.store.put(&rec.key, serde_json::to_vec(&rec.value)?).await?;
            }
            return Ok(());
        }
        if rec.stream != self.stream {
            metrics::DROPPED_RECORDS.with_label_values(&["unknown_stream"]).inc();
            return Ok(());
        }
        metrics::OP_THROUGHPUT
            .with_label_values(&[self.name.as_str(), "receive"])
            .inc();
        if let Some(bytes) = self.store.get(&rec.key).await? {
            let row: serde_json::Value = serde_json::from_slice(&bytes)?;
            let joined = (self.joiner)(&rec.value, &row);
            ctx.collect(Record::new(self.name.clone(), rec.key, joined, rec.event_time));
            metrics::OP_THROUGHPUT
                .with_label_values(&[self.name.as_str(), "emit"])
                .inc();
        }
        Ok(())
    }
}

/// Keyed table replicated in full to every partition worker.
///
/// Register it with `Executor::global_table`; it is loaded before any stream record
/// is processed and follows later records of its stream.
#[derive(Debug, Default)]
pub struct GlobalTable {
    stream: String,
    rows: RwLock<HashMap<Vec<u8>, serde_json::Value>>,
}

impl GlobalTable {
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            rows: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<serde_json::Value> {
        self.rows.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

#[async_trait]
impl BroadcastTable for GlobalTable {
    fn stream(&self) -> &str {
        &self.stream
    }

    async fn apply(&self, record: Record) -> Result<()> {
        let mut rows = self.rows.write();
        if record.value.is_null() {
            rows.remove(&record.key);
        } else {
            rows.insert(record.key, record.value);
        }
        Ok(())
    }
}

/// Joins a stream against a `GlobalTable`, looking rows up by `key_mapper(record)`.
///
/// No repartition is needed since every partition sees the whole table.
pub struct GlobalTableJoin<M, F> {
    name: String,
    table: Arc<GlobalTable>,
    key_mapper: M,
    joiner: F,
}

impl<M, F> GlobalTableJoin<M, F>
where
    M: Fn(&Record) -> Option<Vec<u8>> + Send + Sync + 'static,
    F: Fn(&serde_json::Value, &serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, table: Arc<GlobalTable>, key_mapper: M, joiner: F) -> Self {
        Self {
            name: name.into(),
            table,
            key_mapper,
            joiner,
        }
    }
}

#[async_trait]
impl<M, F> Operator for GlobalTableJoin<M, F>
where
    M: Fn(&Record) -> Option<Vec<u8>> + Send + Sync + 'static,
    F: Fn(&serde_json::Value, &serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
{
    #[instrument(name = "global_table_join_on_element", skip_all)]
    async fn on_element(&mut self, ctx: &mut dyn Context, rec: Record) -> Result<()> {
        metrics::OP_THROUGHPUT
            .with_label_values(&[self.name.as_str(), "receive"])
            .inc();
        let Some(lookup) = (self.key_mapper)(&rec) else {
            return Ok(());
        };
        if let Some(row) = self.table.get(&lookup) {
            let joined = (self.joiner)(&rec.value, &row);
            ctx.collect(Record::new(self.name.clone(), rec.key, joined, rec.event_time));
            metrics::OP_THROUGHPUT
                .with_label_values(&[self.name.as_str(), "emit"])
                .inc();
        }
        Ok(())
    }
}
