//! Digital twin of wind turbines: desired and reported state per turbine, with a TTL sweep.
//! Run:
//!   cargo run -p sluice-examples --bin digital_twin -- [turbine-states.jsonl]
//! Input fields: turbine_id, timestamp (RFC3339), wind_speed_mph, power (ON|OFF), type (REPORTED|DESIRED)
//!
//! A reported state with winds above 65 mph while powered on also yields a desired
//! state of OFF. Both kinds are folded into one twin per turbine. Twins whose last
//! reported state is 7 days old or more are swept every 5 minutes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sluice_core::{Executor, KvState};
use sluice_io::{FileSink, FileSource};
use sluice_ops::prelude::*;
use sluice_state::{reported_timestamp_ms, InMemoryState, TtlSweeper};
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DigitalTwin {
    desired: Option<serde_json::Value>,
    reported: Option<serde_json::Value>,
}

fn high_winds(reported: serde_json::Value) -> Vec<serde_json::Value> {
    let windy = reported["wind_speed_mph"].as_f64().is_some_and(|w| w > 65.0);
    let on = reported["power"] == "ON";
    if !(windy && on) {
        return vec![reported];
    }
    info!("high winds detected. sending shutdown signal");
    let mut desired = reported.clone();
    desired["power"] = "OFF".into();
    desired["type"] = "DESIRED".into();
    vec![reported, desired]
}

fn ttl_sweeper(store: Arc<dyn KvState>) -> TtlSweeper {
    TtlSweeper::new(
        "digital-twin-store",
        store,
        Duration::from_secs(7 * 24 * 3600),
        reported_timestamp_ms("/reported/timestamp"),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()))
        .init();
    let input = std::env::args().nth(1).unwrap_or_else(|| {
        std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("data")
            .join("turbine-states.jsonl")
            .to_string_lossy()
            .to_string()
    });

    let twins = Arc::new(InMemoryState::new());
    let background = ttl_sweeper(twins.clone()).interval(Duration::from_secs(5 * 60)).spawn();

    let store = twins.clone();
    let mut exec = Executor::new(2);
    exec.source(FileSource::jsonl(input, "reported-state-events").key_field("turbine_id").time_field("timestamp"))
        .extractor(FieldTimestampExtractor::new("timestamp"))
        .operator(|_| Map::new(MapFn::new(high_winds)))
        .operator(move |_| {
            Aggregate::new(
                "digital-twins",
                store.clone(),
                DigitalTwin::default,
                |_key, state, mut twin: DigitalTwin| {
                    match state["type"].as_str() {
                        Some("DESIRED") => twin.desired = Some(state.clone()),
                        Some("REPORTED") => twin.reported = Some(state.clone()),
                        _ => tracing::warn!("skipping state update due to unset type (must be: desired, reported)"),
                    }
                    twin
                },
            )
        })
        .sink(FileSink::stdout());
    exec.run().await?;

    // The sample states are years old, so one pass now shows the eviction.
    let before = twins.approximate_count().await?;
    let evicted = ttl_sweeper(twins.clone())
        .sweep_once(chrono::Utc::now().timestamp_millis())
        .await?;
    info!(before, evicted, remaining = twins.approximate_count().await?, "ttl pass");

    background.cancel().await;
    Ok(())
}
