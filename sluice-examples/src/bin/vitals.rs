//! Patient monitoring: heart rate from pulse events, joined with high body temperature.
//! Run:
//!   cargo run -p sluice-examples --bin vitals -- [pulse.jsonl] [body-temp.jsonl]
//! Pulse fields: patient_id, timestamp (RFC3339 or epoch ms)
//! Body temperature fields: patient_id, timestamp, temperature (°F)
//!
//! Pulses are counted per patient in 60s tumbling windows (grace 5s) and only the final
//! count of each window is forwarded. Rates of 100 bpm or more are joined with readings
//! above 100.4°F taken within a minute of each other.

use std::sync::Arc;

use anyhow::Result;
use sluice_core::Executor;
use sluice_io::{FileSink, FileSource};
use sluice_ops::prelude::*;
use sluice_state::InMemoryState;

fn data(name: &str) -> String {
    std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("data")
        .join(name)
        .to_string_lossy()
        .to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()))
        .init();
    let pulse = std::env::args().nth(1).unwrap_or_else(|| data("pulse-events.jsonl"));
    let temps = std::env::args().nth(2).unwrap_or_else(|| data("body-temp-events.jsonl"));

    let counts = Arc::new(InMemoryState::new());

    let mut exec = Executor::new(4);
    exec.source(FileSource::jsonl(pulse, "pulse-events").key_field("patient_id").time_field("timestamp"))
        .source(FileSource::jsonl(temps, "body-temp-events").key_field("patient_id").time_field("timestamp"))
        .extractor(FieldTimestampExtractor::new("timestamp"))
        .operator(move |_| {
            OnStream::new(
                "pulse-events",
                WindowedAggregate::count("pulse-counts", WindowAssigner::tumbling(60_000), 5_000, counts.clone())
                    .with_suppression(Suppression::UntilWindowCloses(BufferConfig::unbounded().shut_down_when_full())),
            )
        })
        .operator(|_| {
            OnStream::new(
                "pulse-counts",
                Filter::new(FilterFn::new(|v: &serde_json::Value| v["value"].as_i64().unwrap_or(0) >= 100)),
            )
        })
        .operator(|_| {
            OnStream::new(
                "pulse-counts",
                Map::new(MapFn::new(|v: serde_json::Value| {
                    vec![serde_json::json!({ "heart_rate": v["value"], "window_start_ms": v["window_start_ms"] })]
                })),
            )
        })
        .operator(|_| {
            OnStream::new(
                "body-temp-events",
                Filter::new(FilterFn::new(|v: &serde_json::Value| {
                    v["temperature"].as_f64().is_some_and(|t| t > 100.4)
                })),
            )
        })
        .operator(|_| {
            WindowedJoin::new(
                "alerts",
                "pulse-counts",
                "body-temp-events",
                JoinWindows::of(60_000).grace(10_000),
                |pulse: &serde_json::Value, temp: &serde_json::Value| {
                    serde_json::json!({ "heart_rate": pulse["heart_rate"], "body_temp": temp })
                },
            )
        })
        .sink(FileSink::stdout());

    exec.run().await?;
    Ok(())
}
