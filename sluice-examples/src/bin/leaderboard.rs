//! Video game leaderboard: top three scores per game, queryable over HTTP.
//! Run:
//!   cargo run -p sluice-examples --bin leaderboard -- [port]
//!   curl localhost:7070/store/high-scores/1
//!   curl localhost:7070/store/high-scores/count
//! Inputs (under data/): score-events (player_id, product_id, score), players (id, name),
//! products (id, name).
//!
//! Score events arrive unkeyed, are rekeyed by player and repartitioned, joined with the
//! players table and then with the products broadcast table, regrouped by product and
//! folded into a Top-3. A score that arrives before its player row finds nothing to join.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sluice_core::{Executor, Record};
use sluice_io::{FileSink, FileSource};
use sluice_ops::prelude::*;
use sluice_query::{ClusterMetadata, HostInfo, HttpRemote, QueryRouter};
use sluice_state::InMemoryState;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Enriched {
    player_id: String,
    player_name: String,
    product_id: String,
    game: String,
    score: f64,
}

fn data(name: &str) -> String {
    std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("data")
        .join(name)
        .to_string_lossy()
        .to_string()
}

fn field_key(field: &'static str) -> impl Fn(&Record) -> Vec<u8> + Send + Sync + 'static {
    move |r: &Record| r.value[field].as_str().unwrap_or_default().as_bytes().to_vec()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()))
        .init();
    let port: u16 = match std::env::args().nth(1) {
        Some(p) => p.parse()?,
        None => 7070,
    };
    let partitions = 4;

    let players = Arc::new(InMemoryState::new());
    let high_scores = Arc::new(InMemoryState::new());
    let products = Arc::new(GlobalTable::new("products"));

    let metadata = ClusterMetadata::single(HostInfo::new("127.0.0.1", port), sluice_core::PartitionAssigner::new(partitions));
    let remote = Arc::new(HttpRemote::new(std::time::Duration::from_secs(2))?);
    let router = Arc::new(QueryRouter::new(Arc::new(metadata), remote).store("high-scores", high_scores.clone()));
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    let server = tokio::spawn(sluice_query::http::serve(listener, router.clone()));

    let mut exec = Executor::new(partitions);
    exec.global_table(products.clone(), FileSource::jsonl(data("products.jsonl"), "products").key_field("id"))
        .source(FileSource::jsonl(data("score-events.jsonl"), "score-events").time_field("timestamp"))
        .source(FileSource::jsonl(data("players.jsonl"), "players").key_field("id"))
        .operator(|_| OnStream::new("score-events", Rekey::new(field_key("player_id"))))
        .repartition()
        .operator(move |_| {
            StreamTableJoin::new(
                "with-players",
                "score-events",
                "players",
                players.clone(),
                |score: &serde_json::Value, player: &serde_json::Value| {
                    serde_json::json!({ "score_event": score, "player": player })
                },
            )
        })
        .operator(move |_| {
            GlobalTableJoin::new(
                "with-products",
                products.clone(),
                |r: &Record| r.value["score_event"]["product_id"].as_str().map(|p| p.as_bytes().to_vec()),
                |with_player: &serde_json::Value, product: &serde_json::Value| {
                    serde_json::to_value(Enriched {
                        player_id: with_player["player"]["id"].as_str().unwrap_or_default().into(),
                        player_name: with_player["player"]["name"].as_str().unwrap_or_default().into(),
                        product_id: product["id"].as_str().unwrap_or_default().into(),
                        game: product["name"].as_str().unwrap_or_default().into(),
                        score: with_player["score_event"]["score"].as_f64().unwrap_or(0.0),
                    })
                    .unwrap_or_default()
                },
            )
        })
        .operator(|_| Rekey::new(field_key("product_id")))
        .repartition()
        .operator(move |_| {
            Aggregate::new(
                "high-scores",
                high_scores.clone(),
                || TopN::<Enriched>::new(3),
                |_key, value, mut top: TopN<Enriched>| {
                    if let Ok(e) = serde_json::from_value::<Enriched>(value.clone()) {
                        // f64 is not Ord; rank on milli-points
                        top.insert_by_score(e, |s| (s.score * 1_000.0) as i64);
                    }
                    top
                },
            )
        })
        .sink(FileSink::stdout());
    exec.run().await?;

    if let Some(top) = router.lookup("high-scores", "1").await? {
        tracing::info!(%top, "high scores for product 1");
    }
    tracing::info!(games = router.count_across_fleet("high-scores").await?, "leaderboards materialized");
    tracing::info!("serving queries on 127.0.0.1:{}; stop with ctrl-c", port);
    server.await??;
    Ok(())
}
