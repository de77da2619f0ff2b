//! Partitioned, staged executor.
//!
//! Records from all sources pass through a dispatcher that assigns each one to a
//! partition by key. Every stage runs one tokio task per partition, each owning its
//! own operator instances, so per-key state is only ever touched by one writer.
//! `Executor::repartition` ends a stage: records leaving it are re-assigned by their
//! (possibly new) key and shuffled to the next stage's workers.
//!
//! In a fleet, `Executor::owned_partitions` limits the last stage, which holds the
//! queryable state, to the partitions this instance owns. Records routed into it for
//! any other partition are dropped, since their owner processes them. Earlier stages
//! see every record, so rekeying before the last shuffle loses nothing.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::{
    BroadcastTable, CollectingContext, Context, Error, EventTime, IngestionTime, Operator, PartitionAssigner,
    Record, Result, Sink, Source, TimestampExtractor, Watermark, WatermarkClock,
};

type OperatorFactory = Box<dyn Fn(u32) -> Box<dyn Operator> + Send + Sync>;

#[derive(Default)]
struct Stage {
    factories: Vec<OperatorFactory>,
}

enum Message {
    Record(Record),
    Watermark { from: usize, wm: Watermark },
}

enum Ingest {
    Record(Record),
    Watermark { source: usize, wm: Watermark },
}

pub struct Executor {
    assigner: PartitionAssigner,
    extractor: Arc<dyn TimestampExtractor>,
    sources: Vec<Box<dyn Source>>,
    stages: Vec<Stage>,
    current: Stage,
    tables: Vec<(Arc<dyn BroadcastTable>, Box<dyn Source>)>,
    sink: Option<Box<dyn Sink>>,
    channel_capacity: usize,
    owned: Option<BTreeSet<u32>>,
}

impl Executor {
    pub fn new(partitions: u32) -> Self {
        Self {
            assigner: PartitionAssigner::new(partitions),
            extractor: Arc::new(IngestionTime),
            sources: Vec::new(),
            stages: Vec::new(),
            current: Stage::default(),
            tables: Vec::new(),
            sink: None,
            channel_capacity: 1_024,
            owned: None,
        }
    }

    pub fn assigner(&self) -> PartitionAssigner {
        self.assigner
    }

    /// Event-time extractor applied by first-stage workers.
    ///
    /// A record whose extraction fails with `Error::Extraction` is dropped and counted;
    /// any other error stops the pipeline.
    pub fn extractor<E: TimestampExtractor + 'static>(&mut self, extractor: E) -> &mut Self {
        self.extractor = Arc::new(extractor);
        self
    }

    pub fn source<S: Source + 'static>(&mut self, s: S) -> &mut Self {
        self.sources.push(Box::new(s));
        self
    }

    /// Adds an operator to the current stage; `factory` is called once per partition.
    pub fn operator<F, O>(&mut self, factory: F) -> &mut Self
    where
        F: Fn(u32) -> O + Send + Sync + 'static,
        O: Operator + 'static,
    {
        self.current
            .factories
            .push(Box::new(move |p| Box::new(factory(p)) as Box<dyn Operator>));
        self
    }

    /// Ends the current stage. Records are re-partitioned by key before the next one.
    pub fn repartition(&mut self) -> &mut Self {
        let stage = std::mem::take(&mut self.current);
        self.stages.push(stage);
        self
    }

    /// Registers a broadcast table, loaded from `bootstrap` before processing starts.
    pub fn global_table<T, S>(&mut self, table: Arc<T>, bootstrap: S) -> &mut Self
    where
        T: BroadcastTable + 'static,
        S: Source + 'static,
    {
        self.tables.push((table, Box::new(bootstrap)));
        self
    }

    pub fn sink<K: Sink + 'static>(&mut self, s: K) -> &mut Self {
        self.sink = Some(Box::new(s));
        self
    }

    pub fn channel_capacity(&mut self, capacity: usize) -> &mut Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Processes only `partitions`; by default this instance owns all of them.
    pub fn owned_partitions(&mut self, partitions: impl IntoIterator<Item = u32>) -> &mut Self {
        self.owned = Some(partitions.into_iter().collect());
        self
    }

    pub async fn run(&mut self) -> Result<()> {
        let partitions = self.assigner.partitions();
        let assigner = self.assigner;
        let capacity = self.channel_capacity;
        let sources = std::mem::take(&mut self.sources);
        if sources.is_empty() {
            return Err(Error::Config("no source".into()));
        }
        let mut sink = self.sink.take().ok_or_else(|| Error::Config("no sink".into()))?;
        let mut stages = std::mem::take(&mut self.stages);
        stages.push(std::mem::take(&mut self.current));
        let last = stages.len() - 1;
        let owned: Option<Arc<Vec<bool>>> = self.owned.as_ref().map(|set| {
            info!(?set, partitions, "last stage limited to owned partitions");
            Arc::new((0..partitions).map(|p| set.contains(&p)).collect())
        });

        // Broadcast tables are complete before the first stream record is dispatched.
        let mut tables = Vec::with_capacity(self.tables.len());
        for (table, mut bootstrap) in self.tables.drain(..) {
            let mut ctx = CollectingContext::default();
            bootstrap.run(&mut ctx).await?;
            let loaded = ctx.out.len();
            for rec in ctx.out {
                table.apply(rec).await?;
            }
            info!(stream = table.stream(), records = loaded, "broadcast table bootstrapped");
            tables.push(table);
        }

        let (sink_tx, mut sink_rx) = mpsc::channel::<Message>(capacity);
        let sink_handle: JoinHandle<Result<()>> = tokio::spawn(async move {
            while let Some(msg) = sink_rx.recv().await {
                if let Message::Record(rec) = msg {
                    let started = Instant::now();
                    sink.on_element(rec).await?;
                    metrics::SINK_PROC_LATENCY_MS.observe(started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
            Ok(())
        });

        // Build stages back to front so each worker knows where its output goes.
        let mut workers: Vec<JoinHandle<Result<()>>> = Vec::new();
        let mut downstream = Downstream::Sink(sink_tx);
        let mut first_stage = Arc::new(Vec::new());
        for (idx, stage) in stages.into_iter().enumerate().rev() {
            let upstreams = if idx == 0 { 1 } else { partitions as usize };
            let mut senders = Vec::with_capacity(partitions as usize);
            for p in 0..partitions {
                let (tx, rx) = mpsc::channel(capacity);
                let worker = PartitionWorker {
                    stage: idx,
                    partition: p,
                    ops: stage.factories.iter().map(|f| f(p)).collect(),
                    extractor: (idx == 0).then(|| self.extractor.clone()),
                    clock: WatermarkClock::new(),
                    upstream_wms: vec![None; upstreams],
                    downstream: downstream.clone(),
                };
                workers.push(tokio::spawn(worker.run(rx)));
                senders.push(tx);
            }
            first_stage = Arc::new(senders);
            downstream = Downstream::Shuffle {
                assigner,
                partitions: first_stage.clone(),
                owned: owned.clone().filter(|_| idx == last),
            };
        }
        drop(downstream);

        let (ingest_tx, mut ingest_rx) = mpsc::unbounded_channel::<Ingest>();
        let source_count = sources.len();
        let mut source_handles: Vec<JoinHandle<Result<()>>> = Vec::with_capacity(source_count);
        for (id, mut src) in sources.into_iter().enumerate() {
            let mut ctx = SourceCtx {
                id,
                tx: ingest_tx.clone(),
            };
            source_handles.push(tokio::spawn(async move { src.run(&mut ctx).await }));
        }
        // Drop our sender so the dispatcher finishes once every source is done.
        drop(ingest_tx);

        let dispatch_owned = owned.filter(|_| last == 0);
        let dispatcher: JoinHandle<Result<()>> = tokio::spawn(async move {
            let mut source_wms: Vec<Option<Watermark>> = vec![None; source_count];
            while let Some(msg) = ingest_rx.recv().await {
                match msg {
                    Ingest::Record(mut rec) => {
                        metrics::QUEUE_DEPTH.dec();
                        if let Some(table) = tables.iter().find(|t| t.stream() == rec.stream) {
                            table.apply(rec).await?;
                            continue;
                        }
                        let p = assigner.assign(&rec.key);
                        if owned_elsewhere(&dispatch_owned, p) {
                            continue;
                        }
                        rec.partition = p;
                        first_stage[p as usize]
                            .send(Message::Record(rec))
                            .await
                            .map_err(|_| Error::Shutdown)?;
                    }
                    Ingest::Watermark { source, wm } => {
                        raise(&mut source_wms[source], wm);
                        if let Some(min) = min_complete(&source_wms) {
                            for tx in first_stage.iter() {
                                tx.send(Message::Watermark { from: 0, wm: min })
                                    .await
                                    .map_err(|_| Error::Shutdown)?;
                            }
                        }
                    }
                }
            }
            Ok(())
        });

        let mut failure = None;
        for handle in source_handles {
            settle(&mut failure, handle.await);
        }
        settle(&mut failure, dispatcher.await);
        for handle in workers {
            settle(&mut failure, handle.await);
        }
        settle(&mut failure, sink_handle.await);
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Keeps the most meaningful error: a root cause beats the `Shutdown` it caused elsewhere.
fn settle(first: &mut Option<Error>, joined: std::result::Result<Result<()>, tokio::task::JoinError>) {
    let err = match joined {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e,
        Err(e) => Error::Anyhow(anyhow::anyhow!(e)),
    };
    match first {
        None => *first = Some(err),
        Some(Error::Shutdown) if !matches!(err, Error::Shutdown) => *first = Some(err),
        Some(_) => {}
    }
}

/// True, and counted as dropped, when `partition` belongs to another instance.
fn owned_elsewhere(owned: &Option<Arc<Vec<bool>>>, partition: u32) -> bool {
    let elsewhere = owned.as_ref().is_some_and(|o| !o[partition as usize]);
    if elsewhere {
        metrics::DROPPED_RECORDS.with_label_values(&["unowned_partition"]).inc();
    }
    elsewhere
}

fn raise(slot: &mut Option<Watermark>, wm: Watermark) {
    *slot = Some(slot.map_or(wm, |cur| cur.max(wm)));
}

fn min_complete(slots: &[Option<Watermark>]) -> Option<Watermark> {
    slots.iter().copied().collect::<Option<Vec<_>>>()?.into_iter().min()
}

#[derive(Clone)]
enum Downstream {
    Sink(mpsc::Sender<Message>),
    Shuffle {
        assigner: PartitionAssigner,
        partitions: Arc<Vec<mpsc::Sender<Message>>>,
        owned: Option<Arc<Vec<bool>>>,
    },
}

impl Downstream {
    async fn record(&self, mut rec: Record) -> Result<()> {
        match self {
            Downstream::Sink(tx) => tx.send(Message::Record(rec)).await.map_err(|_| Error::Shutdown),
            Downstream::Shuffle {
                assigner,
                partitions,
                owned,
            } => {
                let p = assigner.assign(&rec.key);
                if owned_elsewhere(owned, p) {
                    return Ok(());
                }
                rec.partition = p;
                partitions[p as usize]
                    .send(Message::Record(rec))
                    .await
                    .map_err(|_| Error::Shutdown)
            }
        }
    }

    async fn watermark(&self, from: u32, wm: Watermark) -> Result<()> {
        if let Downstream::Shuffle { partitions, .. } = self {
            for tx in partitions.iter() {
                tx.send(Message::Watermark {
                    from: from as usize,
                    wm,
                })
                .await
                .map_err(|_| Error::Shutdown)?;
            }
        }
        Ok(())
    }
}

struct SourceCtx {
    id: usize,
    tx: mpsc::UnboundedSender<Ingest>,
}

impl Context for SourceCtx {
    fn collect(&mut self, record: Record) {
        if self.tx.send(Ingest::Record(record)).is_ok() {
            metrics::QUEUE_DEPTH.inc();
        }
    }
    fn watermark(&mut self, wm: Watermark) {
        let _ = self.tx.send(Ingest::Watermark { source: self.id, wm });
    }
}

struct LocalCtx<'a> {
    out: &'a mut Vec<Record>,
    partition: u32,
}

impl<'a> Context for LocalCtx<'a> {
    fn collect(&mut self, record: Record) {
        self.out.push(record);
    }
    fn watermark(&mut self, _wm: Watermark) {}
    fn partition(&self) -> u32 {
        self.partition
    }
}

struct PartitionWorker {
    stage: usize,
    partition: u32,
    ops: Vec<Box<dyn Operator>>,
    extractor: Option<Arc<dyn TimestampExtractor>>,
    clock: WatermarkClock,
    upstream_wms: Vec<Option<Watermark>>,
    downstream: Downstream,
}

impl PartitionWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<Message>) -> Result<()> {
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Record(mut rec) => {
                    rec.partition = self.partition;
                    if let Some(extractor) = &self.extractor {
                        rec.event_time = match extractor.extract(&rec, self.clock.watermark()) {
                            Ok(ts) => ts,
                            Err(Error::Extraction(reason)) => {
                                debug!(partition = self.partition, key = %rec.key_str(), %reason, "rejecting record without valid event time");
                                metrics::DROPPED_RECORDS.with_label_values(&["invalid_timestamp"]).inc();
                                continue;
                            }
                            Err(e) => return Err(e),
                        };
                    }
                    let ts = rec.event_time;
                    let started = Instant::now();
                    let out = self.push_from(0, vec![rec]).await?;
                    metrics::OP_PROC_LATENCY_MS.observe(started.elapsed().as_secs_f64() * 1_000.0);
                    emit(&self.downstream, out).await?;
                    if self.clock.observe(ts) {
                        self.advance(Watermark(ts)).await?;
                    }
                }
                Message::Watermark { from, wm } => {
                    let Some(slot) = self.upstream_wms.get_mut(from) else {
                        warn!(stage = self.stage, from, "watermark from unknown upstream");
                        continue;
                    };
                    raise(slot, wm);
                    if let Some(min) = min_complete(&self.upstream_wms) {
                        if self.clock.observe(min.0) {
                            self.advance(min).await?;
                        }
                    }
                }
            }
        }
        debug!(stage = self.stage, partition = self.partition, "partition worker finished");
        Ok(())
    }

    /// Runs `batch` through operators `start..` and returns what falls out the end.
    async fn push_from(&mut self, start: usize, mut batch: Vec<Record>) -> Result<Vec<Record>> {
        let partition = self.partition;
        for op in self.ops.iter_mut().skip(start) {
            if batch.is_empty() {
                break;
            }
            let mut next = Vec::new();
            for item in batch.drain(..) {
                let mut ctx = LocalCtx {
                    out: &mut next,
                    partition,
                };
                op.on_element(&mut ctx, item).await?;
            }
            batch = next;
        }
        Ok(batch)
    }

    async fn advance(&mut self, wm: Watermark) -> Result<()> {
        metrics::LAG_WATERMARK_MS.set(EventTime::now().millis() - wm.millis());
        for i in 0..self.ops.len() {
            let mut fired = Vec::new();
            let mut ctx = LocalCtx {
                out: &mut fired,
                partition: self.partition,
            };
            self.ops[i].on_watermark(&mut ctx, wm).await?;
            let out = self.push_from(i + 1, fired).await?;
            emit(&self.downstream, out).await?;
        }
        self.downstream.watermark(self.partition, wm).await
    }
}

/// Borrows only the channel side so worker futures stay `Send`.
async fn emit(downstream: &Downstream, out: Vec<Record>) -> Result<()> {
    for rec in out {
        downstream.record(rec).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct VecSource(Vec<Record>, Option<Watermark>);

    #[async_trait::async_trait]
    impl Source for VecSource {
        async fn run(&mut self, ctx: &mut dyn Context) -> Result<()> {
            for rec in self.0.drain(..) {
                ctx.collect(rec);
            }
            if let Some(wm) = self.1 {
                ctx.watermark(wm);
            }
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct VecSink(Arc<Mutex<Vec<Record>>>);

    #[async_trait::async_trait]
    impl Sink for VecSink {
        async fn on_element(&mut self, record: Record) -> Result<()> {
            self.0.lock().push(record);
            Ok(())
        }
    }

    /// Writes the serving partition into the value.
    struct TagPartition(&'static str);

    #[async_trait::async_trait]
    impl Operator for TagPartition {
        async fn on_element(&mut self, ctx: &mut dyn Context, mut rec: Record) -> Result<()> {
            rec.value[self.0] = serde_json::json!(ctx.partition());
            ctx.collect(rec);
            Ok(())
        }
    }

    struct RekeyByField(&'static str);

    #[async_trait::async_trait]
    impl Operator for RekeyByField {
        async fn on_element(&mut self, ctx: &mut dyn Context, mut rec: Record) -> Result<()> {
            rec.key = rec.value[self.0].as_str().unwrap_or_default().as_bytes().to_vec();
            ctx.collect(rec);
            Ok(())
        }
    }

    fn rec(key: &str, ts: i64, value: serde_json::Value) -> Record {
        Record::new("events", key, value, EventTime(ts))
    }

    #[tokio::test]
    async fn records_land_on_their_key_partition() {
        let sink = VecSink::default();
        let records = (0..50)
            .map(|i| rec(&format!("k{}", i % 7), i, serde_json::json!({})))
            .collect();
        let mut exec = Executor::new(4);
        let assigner = exec.assigner();
        exec.source(VecSource(records, None))
            .operator(|_| TagPartition("p"))
            .sink(sink.clone());
        exec.run().await.unwrap();

        let out = sink.0.lock();
        assert_eq!(out.len(), 50);
        for r in out.iter() {
            let expected = assigner.assign(&r.key);
            assert_eq!(r.value["p"], serde_json::json!(expected));
            assert_eq!(r.partition, expected);
        }
    }

    #[tokio::test]
    async fn repartition_moves_rekeyed_records_to_the_new_owner() {
        let sink = VecSink::default();
        let records = (0..40)
            .map(|i| rec(&format!("score-{i}"), i, serde_json::json!({"player": format!("player-{}", i % 5)})))
            .collect();
        let mut exec = Executor::new(8);
        let assigner = exec.assigner();
        exec.source(VecSource(records, None))
            .operator(|_| RekeyByField("player"))
            .repartition()
            .operator(|_| TagPartition("p"))
            .sink(sink.clone());
        exec.run().await.unwrap();

        let out = sink.0.lock();
        assert_eq!(out.len(), 40);
        for r in out.iter() {
            assert_eq!(r.key_str(), r.value["player"].as_str().unwrap());
            assert_eq!(r.value["p"], serde_json::json!(assigner.assign(&r.key)));
        }
    }

    struct CountingTable {
        applied: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl BroadcastTable for CountingTable {
        fn stream(&self) -> &str {
            "products"
        }
        async fn apply(&self, _record: Record) -> Result<()> {
            self.applied.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct SeenTableSize(Arc<CountingTable>);

    #[async_trait::async_trait]
    impl Operator for SeenTableSize {
        async fn on_element(&mut self, ctx: &mut dyn Context, mut rec: Record) -> Result<()> {
            rec.value["table_size"] = serde_json::json!(self.0.applied.load(Ordering::SeqCst));
            ctx.collect(rec);
            Ok(())
        }
    }

    #[tokio::test]
    async fn broadcast_table_is_loaded_before_processing() {
        let table = Arc::new(CountingTable {
            applied: AtomicUsize::new(0),
        });
        let bootstrap = (0..10)
            .map(|i| Record::new("products", format!("p{i}"), serde_json::json!({}), EventTime(0)))
            .collect();
        let sink = VecSink::default();
        let mut exec = Executor::new(3);
        let t = table.clone();
        exec.global_table(table.clone(), VecSource(bootstrap, None))
            .source(VecSource(vec![rec("a", 1, serde_json::json!({})), rec("b", 2, serde_json::json!({}))], None))
            .operator(move |_| SeenTableSize(t.clone()))
            .sink(sink.clone());
        exec.run().await.unwrap();

        let out = sink.0.lock();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|r| r.value["table_size"] == serde_json::json!(10)));
    }

    #[tokio::test]
    async fn table_stream_records_update_the_table_only() {
        let table = Arc::new(CountingTable {
            applied: AtomicUsize::new(0),
        });
        let sink = VecSink::default();
        let mut exec = Executor::new(2);
        let records = vec![
            Record::new("products", "p1", serde_json::json!({}), EventTime(0)),
            rec("a", 1, serde_json::json!({})),
        ];
        exec.global_table(table.clone(), VecSource(Vec::new(), None))
            .source(VecSource(records, None))
            .sink(sink.clone());
        exec.run().await.unwrap();
        assert_eq!(table.applied.load(Ordering::SeqCst), 1);
        assert_eq!(sink.0.lock().len(), 1);
    }

    struct Failing;

    #[async_trait::async_trait]
    impl Operator for Failing {
        async fn on_element(&mut self, _ctx: &mut dyn Context, _rec: Record) -> Result<()> {
            Err(Error::SuppressionBufferFull {
                operator: "test".into(),
                capacity: 0,
            })
        }
    }

    #[tokio::test]
    async fn fatal_operator_error_stops_the_pipeline() {
        let records = (0..100).map(|i| rec(&format!("k{i}"), i, serde_json::json!({}))).collect();
        let mut exec = Executor::new(2);
        exec.source(VecSource(records, None))
            .operator(|_| Failing)
            .sink(VecSink::default());
        let err = exec.run().await.unwrap_err();
        assert!(matches!(err, Error::SuppressionBufferFull { .. }), "got {err:?}");
    }

    struct WatermarkEcho;

    #[async_trait::async_trait]
    impl Operator for WatermarkEcho {
        async fn on_element(&mut self, _ctx: &mut dyn Context, _rec: Record) -> Result<()> {
            Ok(())
        }
        async fn on_watermark(&mut self, ctx: &mut dyn Context, wm: Watermark) -> Result<()> {
            ctx.collect(Record::new("wm", "wm", serde_json::json!(wm.millis()), wm.0));
            Ok(())
        }
    }

    #[tokio::test]
    async fn source_watermark_reaches_every_partition() {
        let sink = VecSink::default();
        let end = Watermark(EventTime(1_000_000));
        let mut exec = Executor::new(3);
        exec.source(VecSource(Vec::new(), Some(end)))
            .operator(|_| WatermarkEcho)
            .sink(sink.clone());
        exec.run().await.unwrap();
        let out = sink.0.lock();
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|r| r.value == serde_json::json!(1_000_000)));
    }

    #[tokio::test]
    async fn only_owned_partitions_are_processed() {
        let sink = VecSink::default();
        let records = (0..40).map(|i| rec(&format!("k{i}"), i, serde_json::json!({}))).collect();
        let mut exec = Executor::new(4);
        let assigner = exec.assigner();
        exec.owned_partitions([0, 2])
            .source(VecSource(records, None))
            .operator(|_| TagPartition("p"))
            .sink(sink.clone());
        exec.run().await.unwrap();

        let expected = (0..40)
            .filter(|i| matches!(assigner.assign(format!("k{i}").as_bytes()), 0 | 2))
            .count();
        let out = sink.0.lock();
        assert!(expected > 0 && expected < 40);
        assert_eq!(out.len(), expected);
        assert!(out.iter().all(|r| r.partition == 0 || r.partition == 2));
    }

    #[tokio::test]
    async fn rekeyed_records_reach_the_owner_of_their_new_key() {
        let sink = VecSink::default();
        let records = (0..40)
            .map(|i| rec(&format!("score-{i}"), i, serde_json::json!({"player": format!("player-{}", i % 8)})))
            .collect();
        let mut exec = Executor::new(4);
        let assigner = exec.assigner();
        let mine = assigner.assign(b"player-0");
        exec.owned_partitions([mine])
            .source(VecSource(records, None))
            .operator(|_| RekeyByField("player"))
            .repartition()
            .operator(|_| TagPartition("p"))
            .sink(sink.clone());
        exec.run().await.unwrap();

        // every score of a player on `mine` arrives, whatever its original key hashed to
        let expected = (0..40)
            .filter(|i| assigner.assign(format!("player-{}", i % 8).as_bytes()) == mine)
            .count();
        let out = sink.0.lock();
        assert!(expected >= 5);
        assert_eq!(out.len(), expected);
        for r in out.iter() {
            assert_eq!(assigner.assign(&r.key), mine);
            assert_eq!(r.value["p"], serde_json::json!(mine));
        }
    }

    #[tokio::test]
    async fn empty_source_does_not_hold_back_the_watermark() {
        let sink = VecSink::default();
        let end = Watermark(EventTime(i64::MAX));
        let mut exec = Executor::new(2);
        exec.source(VecSource(vec![rec("a", 5, serde_json::json!({}))], Some(end)))
            .source(VecSource(Vec::new(), Some(end)))
            .operator(|_| WatermarkEcho)
            .sink(sink.clone());
        exec.run().await.unwrap();
        let out = sink.0.lock();
        assert!(out.iter().any(|r| r.event_time == EventTime(i64::MAX)));
    }

    #[tokio::test]
    async fn rejected_timestamp_drops_only_that_record() {
        let sink = VecSink::default();
        let mut exec = Executor::new(1);
        exec.extractor(|r: &Record, _pt: Option<EventTime>| -> Result<EventTime> {
            r.value
                .get("ts")
                .and_then(|v| v.as_i64())
                .map(EventTime)
                .ok_or_else(|| Error::Extraction("missing ts".into()))
        })
        .source(VecSource(
            vec![rec("a", 0, serde_json::json!({"ts": 5})), rec("b", 0, serde_json::json!({}))],
            None,
        ))
        .sink(sink.clone());
        exec.run().await.unwrap();
        let out = sink.0.lock();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].event_time, EventTime(5));
    }
}
