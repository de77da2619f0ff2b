use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use clap::{Parser, Subcommand};
use sluice_core::config::{parse_duration_ms, PipelineConfig, StoreConfig, SuppressConfig};
use sluice_core::{Executor, KvState};
use sluice_ops::{
    BufferConfig, FieldTimestampExtractor, Materialize, Suppression, TimestampPolicy, WindowAssigner, WindowedAggregate,
};
use sluice_query::{ClusterMetadata, HostInfo, HttpRemote, QueryRouter};
use sluice_state::{reported_timestamp_ms, InMemoryState, TtlSweeper};
use tokio::task::JoinHandle;

#[derive(Parser, Debug)]
#[command(name = "sluice", version, about = "Sluice CLI", disable_help_subcommand = false)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a pipeline from a pipeline.toml
    Run {
        #[arg(short, long)]
        config: std::path::PathBuf,
        /// Serve the query surface on this port when the config has no [server]
        #[arg(long, default_value_t = 0)]
        http_port: u16,
    },
    /// Serve only /metrics
    Serve {
        #[arg(long, default_value_t = 9898)]
        port: u16,
    },
}

fn app() -> Router {
    Router::new().route("/metrics", get(metrics))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { port } => {
            let addr: SocketAddr = format!("127.0.0.1:{}", port).parse()?;
            tracing::info!("serving /metrics on {}", addr);
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app()).await?;
            Ok(())
        }
        Commands::Run { config, http_port } => {
            let text = tokio::fs::read_to_string(&config).await?;
            let cfg = PipelineConfig::from_toml(&text)?;
            run_pipeline(cfg, http_port).await
        }
    }
}

async fn metrics() -> String {
    sluice_core::metrics::render_prometheus()
}

/// Opens a backend for one store; `dir` names its subdirectory under `store.path`.
fn open_store(cfg: &StoreConfig, dir: &str) -> anyhow::Result<Arc<dyn KvState>> {
    #[cfg(feature = "rocksdb")]
    {
        if let Some(root) = &cfg.path {
            return Ok(Arc::new(sluice_state::RocksDbState::open(root.join(dir))?));
        }
    }
    #[cfg(not(feature = "rocksdb"))]
    {
        if cfg.path.is_some() {
            tracing::warn!(store = %cfg.name, dir, "store.path ignored: built without rocksdb, using memory");
        }
    }
    Ok(Arc::new(InMemoryState::new()))
}

fn window_assigner(cfg: &PipelineConfig) -> anyhow::Result<WindowAssigner> {
    let size = parse_duration_ms(&cfg.window.size)?;
    Ok(match cfg.window.slide.as_deref() {
        Some(slide) if cfg.window.kind == "sliding" => WindowAssigner::sliding(size, parse_duration_ms(slide)?),
        _ => WindowAssigner::tumbling(size),
    })
}

fn suppression(cfg: &SuppressConfig) -> Suppression {
    if !cfg.until_window_closes {
        return Suppression::None;
    }
    let buffer = match cfg.max_records {
        Some(max) => BufferConfig::max_records(max),
        None => BufferConfig::unbounded(),
    };
    let buffer = match cfg.on_full.as_deref() {
        Some("emit_early") => buffer.emit_early_when_full(),
        _ => buffer.shut_down_when_full(),
    };
    Suppression::UntilWindowCloses(buffer)
}

/// Query surface for `store`: the configured fleet, or a fleet of one on `http_port`.
/// Returns the bind address along with the router.
fn query_router(
    cfg: &PipelineConfig,
    http_port: u16,
    store: Arc<dyn KvState>,
) -> anyhow::Result<Option<(HostInfo, Arc<QueryRouter>)>> {
    let partitions = cfg.execution.partitions;
    let (bind, metadata, timeout) = match &cfg.server {
        Some(server) => (
            HostInfo::new(server.host.clone(), server.port),
            ClusterMetadata::from_config(server, partitions)?,
            parse_duration_ms(&server.request_timeout)?,
        ),
        None if http_port != 0 => (
            HostInfo::new("127.0.0.1", http_port),
            ClusterMetadata::single(
                HostInfo::new("127.0.0.1", http_port),
                sluice_core::PartitionAssigner::new(partitions),
            ),
            2_000,
        ),
        None => return Ok(None),
    };
    let remote = Arc::new(HttpRemote::new(Duration::from_millis(timeout as u64))?);
    let router = QueryRouter::new(Arc::new(metadata), remote).store(cfg.store.name.clone(), store);
    Ok(Some((bind, Arc::new(router))))
}

/// What outlives a finished pipeline: its result store and the query surface, if any.
struct Finished {
    results: Arc<dyn KvState>,
    query: Option<(Arc<QueryRouter>, JoinHandle<std::io::Result<()>>)>,
}

async fn run_pipeline(cfg: PipelineConfig, http_port: u16) -> anyhow::Result<()> {
    let finished = execute(cfg, http_port).await?;
    if let Some((_, server)) = finished.query {
        tracing::info!("still serving queries; stop with ctrl-c");
        server.await??;
    }
    Ok(())
}

async fn execute(cfg: PipelineConfig, http_port: u16) -> anyhow::Result<Finished> {
    cfg.validate()?;

    let assigner = window_assigner(&cfg)?;
    let grace_ms = parse_duration_ms(&cfg.window.grace)?;
    let suppression = suppression(&cfg.suppress);
    let policy = TimestampPolicy::parse(cfg.time.on_invalid_timestamp.as_deref().unwrap_or("fallback"))?;
    let window_store = open_store(&cfg.store, "windows")?;
    let results = open_store(&cfg.store, &cfg.store.name)?;

    let sweeper = match (&cfg.store.ttl, &cfg.store.ttl_field) {
        (Some(ttl), Some(field)) => {
            let mut sweeper = TtlSweeper::new(
                cfg.store.name.clone(),
                results.clone(),
                Duration::from_millis(parse_duration_ms(ttl)? as u64),
                reported_timestamp_ms(field.clone()),
            );
            if let Some(every) = &cfg.store.sweep_interval {
                sweeper = sweeper.interval(Duration::from_millis(parse_duration_ms(every)? as u64));
            }
            Some(sweeper.spawn())
        }
        _ => None,
    };

    let query = match query_router(&cfg, http_port, results.clone())? {
        Some((bind, router)) => {
            let listener = tokio::net::TcpListener::bind((bind.host.as_str(), bind.port)).await?;
            let server = tokio::spawn(sluice_query::http::serve(listener, router.clone()));
            Some((router, server))
        }
        None => None,
    };

    let source = sluice_io::FileSource::jsonl(cfg.source.path.to_string_lossy(), cfg.source.stream.clone())
        .key_field(cfg.source.key_field.clone())
        .time_field(cfg.source.time_field.clone());
    let extractor = FieldTimestampExtractor::new(cfg.source.time_field.clone()).with_policy(policy);
    let name = format!("{}-windows", cfg.store.name);

    let mut exec = Executor::new(cfg.execution.partitions);
    if let Some((router, _)) = &query {
        exec.owned_partitions(router.metadata().local_partitions());
    }
    exec.source(source).extractor(extractor).operator(move |_| {
        WindowedAggregate::count(name.clone(), assigner, grace_ms, window_store.clone())
            .with_suppression(suppression)
    });
    let results_for_op = results.clone();
    exec.operator(move |_| Materialize::new(results_for_op.clone()));
    match (cfg.sink.kind.as_str(), &cfg.sink.path) {
        ("file", Some(path)) => exec.sink(sluice_io::FileSink::file(path.to_string_lossy())),
        _ => exec.sink(sluice_io::FileSink::stdout()),
    };
    let outcome = exec.run().await;

    if let Some(handle) = sweeper {
        handle.cancel().await;
    }
    outcome?;
    tracing::info!(store = %cfg.store.name, "pipeline finished");
    Ok(Finished { results, query })
}
