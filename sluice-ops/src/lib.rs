//! sluice-ops: standard operators built on top of sluice-core.
//!
//! Included operators:
//! - `Map`: one-to-many mapping of JSON payloads
//! - `Filter`: predicate-based filtering
//! - `Rekey`: derive a new key from a record (follow it with `Executor::repartition`)
//! - `OnStream`: scope any operator to the records of one stream
//! - `WindowedAggregate`: tumbling/sliding windows with grace and optional suppression
//! - `Aggregate` + `TopN`: unwindowed per-key aggregation, e.g. leaderboards
//! - `Materialize`: write a stream into a queryable store
//! - `WindowedJoin`, `StreamTableJoin`, `GlobalTableJoin`

use async_trait::async_trait;
use sluice_core::{metrics, Context, Operator, Record, Result, Watermark};
use tracing::instrument;

pub mod aggregate;
pub mod join;
pub mod time;
pub mod window;

pub use aggregate::{Aggregate, Materialize, TopN};
pub use join::{GlobalTable, GlobalTableJoin, JoinWindows, StreamTableJoin, WindowedJoin};
pub use time::{FieldTimestampExtractor, TimestampPolicy};
pub use window::{
    BufferConfig, BufferFull, Suppression, Window, WindowAssigner, WindowedAggregate, WindowedKey,
};

#[async_trait]
pub trait FnMap: Send + Sync {
    async fn call(&self, value: serde_json::Value) -> Result<Vec<serde_json::Value>>;
}

pub struct MapFn<F>(pub F);
impl<F> MapFn<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}
#[async_trait]
impl<F> FnMap for MapFn<F>
where
    F: Fn(serde_json::Value) -> Vec<serde_json::Value> + Send + Sync,
{
    async fn call(&self, value: serde_json::Value) -> Result<Vec<serde_json::Value>> {
        Ok((self.0)(value))
    }
}

/// Map operator: applies a user function that returns zero or more outputs per input.
///
/// Outputs keep the input's key, stream and event time.
///
/// Example
/// ```no_run
/// use sluice_ops::{Map, MapFn};
/// let map = Map::new(MapFn::new(|v: serde_json::Value| vec![v]));
/// # let _ = map;
/// ```
pub struct Map<F> {
    func: F,
}
impl<F> Map<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> Operator for Map<F>
where
    F: FnMap + Send + Sync + 'static,
{
    #[instrument(name = "map_on_element", skip_all)]
    async fn on_element(&mut self, ctx: &mut dyn Context, rec: Record) -> Result<()> {
        metrics::OP_THROUGHPUT.with_label_values(&["Map", "receive"]).inc();
        let Record {
            stream,
            key,
            value,
            event_time,
            partition,
        } = rec;
        for v in self.func.call(value).await? {
            ctx.collect(Record {
                stream: stream.clone(),
                key: key.clone(),
                value: v,
                event_time,
                partition,
            });
            metrics::OP_THROUGHPUT.with_label_values(&["Map", "emit"]).inc();
        }
        Ok(())
    }
}

#[async_trait]
pub trait FnFilter: Send + Sync {
    async fn call(&self, value: &serde_json::Value) -> Result<bool>;
}

pub struct FilterFn<F>(pub F);
impl<F> FilterFn<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}
#[async_trait]
impl<F> FnFilter for FilterFn<F>
where
    F: Fn(&serde_json::Value) -> bool + Send + Sync,
{
    async fn call(&self, value: &serde_json::Value) -> Result<bool> {
        Ok((self.0)(value))
    }
}

/// Filter operator: keeps inputs that satisfy the predicate.
///
/// Example
/// ```no_run
/// use sluice_ops::{Filter, FilterFn};
/// let high_pulse = Filter::new(FilterFn::new(|v: &serde_json::Value| v["value"].as_i64().unwrap_or(0) >= 100));
/// # let _ = high_pulse;
/// ```
pub struct Filter<F> {
    pred: F,
}
impl<F> Filter<F> {
    pub fn new(pred: F) -> Self {
        Self { pred }
    }
}

#[async_trait]
impl<F> Operator for Filter<F>
where
    F: FnFilter + Send + Sync + 'static,
{
    #[instrument(name = "filter_on_element", skip_all)]
    async fn on_element(&mut self, ctx: &mut dyn Context, rec: Record) -> Result<()> {
        metrics::OP_THROUGHPUT.with_label_values(&["Filter", "receive"]).inc();
        if self.pred.call(&rec.value).await? {
            ctx.collect(rec);
            metrics::OP_THROUGHPUT.with_label_values(&["Filter", "emit"]).inc();
        }
        Ok(())
    }
}

/// Rekey operator: replaces each record's key with `key_fn(&record)`.
///
/// The new key only determines placement after a repartition; put
/// `Executor::repartition` between this and any keyed operator.
///
/// Example
/// ```no_run
/// use sluice_ops::Rekey;
/// let by_player = Rekey::new(|r: &sluice_core::Record| r.value["player_id"].to_string().into_bytes());
/// # let _ = by_player;
/// ```
pub struct Rekey<F> {
    key_fn: F,
}
impl<F> Rekey<F> {
    pub fn new(key_fn: F) -> Self {
        Self { key_fn }
    }
}

#[async_trait]
impl<F> Operator for Rekey<F>
where
    F: Fn(&Record) -> Vec<u8> + Send + Sync + 'static,
{
    #[instrument(name = "rekey_on_element", skip_all)]
    async fn on_element(&mut self, ctx: &mut dyn Context, mut rec: Record) -> Result<()> {
        metrics::OP_THROUGHPUT.with_label_values(&["Rekey", "receive"]).inc();
        rec.key = (self.key_fn)(&rec);
        ctx.collect(rec);
        Ok(())
    }
}

/// Applies `inner` to records of `stream` and forwards every other record untouched.
///
/// Lets one stage carry several streams, each through its own chain.
pub struct OnStream<O> {
    stream: String,
    inner: O,
}
impl<O> OnStream<O> {
    pub fn new(stream: impl Into<String>, inner: O) -> Self {
        Self {
            stream: stream.into(),
            inner,
        }
    }
}

#[async_trait]
impl<O> Operator for OnStream<O>
where
    O: Operator,
{
    async fn on_element(&mut self, ctx: &mut dyn Context, rec: Record) -> Result<()> {
        if rec.stream == self.stream {
            self.inner.on_element(ctx, rec).await
        } else {
            ctx.collect(rec);
            Ok(())
        }
    }

    async fn on_watermark(&mut self, ctx: &mut dyn Context, wm: Watermark) -> Result<()> {
        self.inner.on_watermark(ctx, wm).await
    }
}

pub mod prelude {
    pub use super::{
        Aggregate, BufferConfig, BufferFull, FieldTimestampExtractor, Filter, FilterFn, FnFilter, FnMap, GlobalTable,
        GlobalTableJoin, JoinWindows, Map, MapFn, Materialize, OnStream, Rekey, StreamTableJoin, Suppression,
        TimestampPolicy, TopN, Window, WindowAssigner, WindowedAggregate, WindowedJoin,
    };
}
