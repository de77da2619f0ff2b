//! sluice-io: simple ingestion and emission collaborators for local runs.
//! - `FileSource`: reads JSONL and emits keyed records with an event-time hint
//! - `FileSink`: writes `(key, value, timestamp)` JSON lines to stdout or a file
//! - `ChannelSink`: forwards records into a tokio channel

use async_trait::async_trait;
use sluice_core::{metrics, Context, Error, EventTime, Record, Result, Sink, Source, Watermark};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

const HUNDRED_YEARS_MS: i64 = 100 * 365 * 86_400_000;

/// Reads a JSONL file and emits one record per line.
/// - `stream`: logical stream name stamped on every record
/// - `key_field`: field (or `/json/pointer`) holding the record key; unkeyed if absent
/// - `time_field`: field holding the timestamp hint (RFC3339 string or epoch ms)
pub struct FileSource {
    pub path: String,
    pub stream: String,
    pub key_field: Option<String>,
    pub time_field: Option<String>,
}

impl FileSource {
    pub fn jsonl(path: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            stream: stream.into(),
            key_field: None,
            time_field: None,
        }
    }

    pub fn key_field(mut self, field: impl Into<String>) -> Self {
        self.key_field = Some(field.into());
        self
    }

    pub fn time_field(mut self, field: impl Into<String>) -> Self {
        self.time_field = Some(field.into());
        self
    }
}

fn field<'a>(v: &'a serde_json::Value, name: &str) -> Option<&'a serde_json::Value> {
    if name.starts_with('/') {
        v.pointer(name)
    } else {
        v.get(name)
    }
}

fn key_of(v: &serde_json::Value, name: &str) -> Vec<u8> {
    match field(v, name) {
        Some(serde_json::Value::String(s)) => s.as_bytes().to_vec(),
        Some(serde_json::Value::Null) | None => Vec::new(),
        Some(other) => other.to_string().into_bytes(),
    }
}

fn time_hint(v: &serde_json::Value, name: &str) -> Option<EventTime> {
    match field(v, name)? {
        serde_json::Value::Number(n) => n.as_i64().map(EventTime),
        serde_json::Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| EventTime(t.timestamp_millis())),
        _ => None,
    }
}

#[async_trait]
impl Source for FileSource {
    async fn run(&mut self, ctx: &mut dyn Context) -> Result<()> {
        let file = tokio::fs::File::open(&self.path).await?;
        let mut lines = tokio::io::BufReader::new(file).lines();
        let mut max_ts: Option<EventTime> = None;
        let mut count = 0usize;
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let v: serde_json::Value = serde_json::from_str(&line)?;
            let key = self.key_field.as_deref().map(|f| key_of(&v, f)).unwrap_or_default();
            // the hint is only a default; the executor's extractor has the final say
            let ts = self
                .time_field
                .as_deref()
                .and_then(|f| time_hint(&v, f))
                .unwrap_or_else(EventTime::now);
            max_ts = Some(max_ts.map_or(ts, |m| m.max(ts)));
            ctx.collect(Record::new(self.stream.clone(), key, v, ts));
            count += 1;
        }
        info!(path = %self.path, stream = %self.stream, records = count, "file source exhausted");
        // End of input: a watermark far in the future closes every open window. An
        // empty file still reports one so it never holds back the other sources.
        let end = max_ts.map_or(i64::MAX, |m| m.millis().saturating_add(HUNDRED_YEARS_MS));
        ctx.watermark(Watermark(EventTime(end)));
        Ok(())
    }
}

fn emission_line(record: &Record) -> Result<String> {
    Ok(serde_json::to_string(&serde_json::json!({
        "key": record.key_str(),
        "value": record.value,
        "timestamp": record.event_time.millis(),
    }))?)
}

/// Writes each record as a single JSON line to stdout or a file.
pub struct FileSink {
    pub path: Option<String>,
    file: Option<tokio::fs::File>,
}

impl FileSink {
    pub fn stdout() -> Self {
        Self { path: None, file: None }
    }

    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            file: None,
        }
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn on_element(&mut self, record: Record) -> Result<()> {
        let line = emission_line(&record)?;
        let Some(p) = &self.path else {
            println!("{}", line);
            return Ok(());
        };
        if self.file.is_none() {
            let f = tokio::fs::OpenOptions::new().create(true).append(true).open(p).await?;
            debug!(path = %p, "file sink opened");
            self.file = Some(f);
        }
        if let Some(f) = self.file.as_mut() {
            f.write_all(line.as_bytes()).await?;
            f.write_all(b"\n").await?;
            f.flush().await?;
        }
        metrics::BYTES_WRITTEN
            .with_label_values(&["FileSink"])
            .inc_by((line.len() + 1) as u64);
        Ok(())
    }
}

/// Forwards every record into an unbounded channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Record>,
}

impl ChannelSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Record>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Sink for ChannelSink {
    async fn on_element(&mut self, record: Record) -> Result<()> {
        self.tx.send(record).map_err(|_| Error::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::CollectingContext;

    fn tmp_file(name: &str) -> String {
        let mut p = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        p.push(format!("sluice_test_{}_{}.tmp", name, nanos));
        p.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn file_source_jsonl_reads_keyed_lines() {
        let path = tmp_file("jsonl");
        let content = concat!(
            "{\"patient_id\":\"p1\",\"timestamp\":1704067200000,\"bpm\":70}\n",
            "\n",
            "{\"patient_id\":\"p2\",\"timestamp\":\"2024-01-01T00:01:00Z\",\"bpm\":90}\n",
        );
        tokio::fs::write(&path, content).await.unwrap();
        let mut src = FileSource::jsonl(&path, "pulse-events")
            .key_field("patient_id")
            .time_field("timestamp");
        let mut ctx = CollectingContext::default();
        src.run(&mut ctx).await.unwrap();
        assert_eq!(ctx.out.len(), 2);
        assert_eq!(ctx.out[0].key_str(), "p1");
        assert_eq!(ctx.out[0].stream, "pulse-events");
        assert_eq!(ctx.out[0].event_time, EventTime(1_704_067_200_000));
        assert_eq!(ctx.out[1].event_time, EventTime(1_704_067_260_000));
        assert_eq!(ctx.watermarks.len(), 1);
        assert!(ctx.watermarks[0].millis() > 1_704_067_260_000 + HUNDRED_YEARS_MS - 1);
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn file_source_rejects_malformed_lines() {
        let path = tmp_file("bad");
        tokio::fs::write(&path, "{not json}\n").await.unwrap();
        let mut src = FileSource::jsonl(&path, "s");
        let mut ctx = CollectingContext::default();
        assert!(matches!(src.run(&mut ctx).await, Err(Error::Json(_))));
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn empty_file_still_reports_end_of_input() {
        let path = tmp_file("empty");
        tokio::fs::write(&path, "").await.unwrap();
        let mut ctx = CollectingContext::default();
        FileSource::jsonl(&path, "body-temp-events").run(&mut ctx).await.unwrap();
        assert!(ctx.out.is_empty());
        assert_eq!(ctx.watermarks, vec![Watermark(EventTime(i64::MAX))]);
        let _ = tokio::fs::remove_file(&path).await;
    }

    /// Holds every record until the watermark passes its event time.
    #[derive(Default)]
    struct HoldUntilClosed(Vec<Record>);

    #[async_trait]
    impl sluice_core::Operator for HoldUntilClosed {
        async fn on_element(&mut self, _ctx: &mut dyn Context, record: Record) -> Result<()> {
            self.0.push(record);
            Ok(())
        }
        async fn on_watermark(&mut self, ctx: &mut dyn Context, wm: Watermark) -> Result<()> {
            let (ready, held): (Vec<Record>, Vec<Record>) = std::mem::take(&mut self.0)
                .into_iter()
                .partition(|r| r.event_time.millis() + 60_000 <= wm.millis());
            self.0 = held;
            for r in ready {
                ctx.collect(r);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn empty_second_source_lets_the_first_finish() {
        let pulses = tmp_file("pulses");
        let temps = tmp_file("temps");
        tokio::fs::write(&pulses, "{\"patient_id\":\"p1\",\"timestamp\":1000}\n").await.unwrap();
        tokio::fs::write(&temps, "").await.unwrap();
        let (sink, mut rx) = ChannelSink::channel();
        let mut exec = sluice_core::Executor::new(2);
        exec.source(FileSource::jsonl(&pulses, "pulse-events").key_field("patient_id").time_field("timestamp"))
            .source(FileSource::jsonl(&temps, "body-temp-events").key_field("patient_id"))
            .operator(|_| HoldUntilClosed::default())
            .sink(sink);
        exec.run().await.unwrap();
        let out = rx.recv().await.unwrap();
        assert_eq!(out.key_str(), "p1");
        let _ = tokio::fs::remove_file(&pulses).await;
        let _ = tokio::fs::remove_file(&temps).await;
    }

    #[tokio::test]
    async fn file_sink_writes_key_value_timestamp() {
        let path = tmp_file("sink");
        let mut sink = FileSink::file(&path);
        sink.on_element(Record::new("alerts", "p1", serde_json::json!({"value": 120}), EventTime(59_999)))
            .await
            .unwrap();
        sink.on_element(Record::new("alerts", "p2", serde_json::json!({"value": 101}), EventTime(59_999)))
            .await
            .unwrap();
        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<serde_json::Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["key"], serde_json::json!("p1"));
        assert_eq!(lines[0]["timestamp"], serde_json::json!(59_999));
        assert_eq!(lines[1]["value"]["value"], serde_json::json!(101));
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn channel_sink_forwards() {
        let (mut sink, mut rx) = ChannelSink::channel();
        sink.on_element(Record::new("s", "k", serde_json::json!(1), EventTime(0))).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().key_str(), "k");
        drop(rx);
        assert!(sink.on_element(Record::new("s", "k", serde_json::json!(2), EventTime(0))).await.is_err());
    }
}
