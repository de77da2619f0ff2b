use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{Error, Result};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SourceConfig {
    pub kind: String,       // "file"
    pub path: PathBuf,      // JSONL input
    pub stream: String,     // logical stream name, e.g. "pulse-events"
    pub key_field: String,  // e.g. "patient_id"
    pub time_field: String, // e.g. "timestamp"
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct TimeConfig {
    /// "fallback" (default) | "fail"
    #[serde(default)]
    pub on_invalid_timestamp: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WindowConfig {
    #[serde(rename = "type")]
    pub kind: String, // tumbling|sliding
    pub size: String, // e.g., "60s"
    #[serde(default)]
    pub slide: Option<String>,
    /// Required; there is deliberately no default grace.
    pub grace: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SuppressConfig {
    #[serde(default = "default_true")]
    pub until_window_closes: bool,
    #[serde(default)]
    pub max_records: Option<usize>,
    /// "shutdown" (default) | "emit_early"
    #[serde(default)]
    pub on_full: Option<String>,
}

impl Default for SuppressConfig {
    fn default() -> Self {
        Self {
            until_window_closes: true,
            max_records: None,
            on_full: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ExecutionConfig {
    #[serde(default = "default_partitions")]
    pub partitions: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            partitions: default_partitions(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StoreConfig {
    pub name: String,
    #[serde(default)]
    pub path: Option<PathBuf>, // rocksdb directory when built with the feature
    #[serde(default)]
    pub ttl: Option<String>, // e.g. "7d"
    #[serde(default)]
    pub sweep_interval: Option<String>, // e.g. "5m"
    #[serde(default)]
    pub ttl_field: Option<String>, // JSON pointer into the stored value, e.g. "/reported/timestamp"
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SinkConfig {
    pub kind: String, // "file" | "stdout"
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PeerConfig {
    pub endpoint: String, // host:port
    #[serde(default)]
    pub partitions: Vec<u32>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    /// Static fleet roster; this instance is the entry whose endpoint is `host:port`.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,
}

impl ServerConfig {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PipelineConfig {
    pub source: SourceConfig,
    #[serde(default)]
    pub time: TimeConfig,
    pub window: WindowConfig,
    #[serde(default)]
    pub suppress: SuppressConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    pub store: StoreConfig,
    pub sink: SinkConfig,
    #[serde(default)]
    pub server: Option<ServerConfig>,
}

impl PipelineConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.kind.as_str() != "file" {
            return Err(Error::Config(format!("unsupported source kind: {}", self.source.kind)));
        }
        if self.sink.kind.as_str() != "file" && self.sink.kind.as_str() != "stdout" {
            return Err(Error::Config(format!("unsupported sink kind: {}", self.sink.kind)));
        }
        if self.sink.kind.as_str() == "file" && self.sink.path.is_none() {
            return Err(Error::Config("sink.path must be set for a file sink".into()));
        }
        match self.window.kind.as_str() {
            "tumbling" => {}
            "sliding" if self.window.slide.is_some() => {}
            "sliding" => return Err(Error::Config("sliding windows need window.slide".into())),
            other => return Err(Error::Config(format!("unsupported window type: {other}"))),
        }
        positive_duration("window.size", &self.window.size)?;
        if let Some(slide) = &self.window.slide {
            positive_duration("window.slide", slide)?;
        }
        if parse_duration_ms(&self.window.grace)? < 0 {
            return Err(Error::Config(format!("window.grace must not be negative: {}", self.window.grace)));
        }
        if self.execution.partitions == 0 {
            return Err(Error::Config("execution.partitions must be at least 1".into()));
        }
        if let Some(p) = self.time.on_invalid_timestamp.as_deref() {
            if !matches!(p, "fallback" | "fail") {
                return Err(Error::Config(format!("unknown time.on_invalid_timestamp: {p}")));
            }
        }
        if let Some(p) = self.suppress.on_full.as_deref() {
            if !matches!(p, "shutdown" | "emit_early") {
                return Err(Error::Config(format!("unknown suppress.on_full: {p}")));
            }
        }
        if self.store.ttl.is_some() != self.store.ttl_field.is_some() {
            return Err(Error::Config("store.ttl and store.ttl_field must be set together".into()));
        }
        if let Some(ttl) = &self.store.ttl {
            positive_duration("store.ttl", ttl)?;
        }
        if let Some(every) = &self.store.sweep_interval {
            positive_duration("store.sweep_interval", every)?;
        }
        if let Some(server) = &self.server {
            positive_duration("server.request_timeout", &server.request_timeout)?;
            let me = server.endpoint();
            if !server.peers.is_empty() && !server.peers.iter().any(|p| p.endpoint == me) {
                return Err(Error::Config(format!("server.peers must include this instance ({me})")));
            }
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_partitions() -> u32 {
    4
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_request_timeout() -> String {
    "2s".into()
}

fn positive_duration(name: &str, value: &str) -> Result<i64> {
    match parse_duration_ms(value)? {
        ms if ms > 0 => Ok(ms),
        _ => Err(Error::Config(format!("{name} must be positive, got {value:?}"))),
    }
}

pub fn parse_duration_ms(s: &str) -> Result<i64> {
    // small parser for values like "10s", "500ms", "2m", "7d"
    let s = s.trim();
    let parse = |n: &str| {
        n.trim()
            .parse::<i64>()
            .map_err(|e| Error::Config(format!("invalid duration {s:?}: {e}")))
    };
    if let Some(num) = s.strip_suffix("ms") {
        return parse(num);
    }
    if let Some(num) = s.strip_suffix('s') {
        return Ok(parse(num)? * 1_000);
    }
    if let Some(num) = s.strip_suffix('m') {
        return Ok(parse(num)? * 60_000);
    }
    if let Some(num) = s.strip_suffix('h') {
        return Ok(parse(num)? * 3_600_000);
    }
    if let Some(num) = s.strip_suffix('d') {
        return Ok(parse(num)? * 86_400_000);
    }
    // default assume seconds
    Ok(parse(s)? * 1_000)
}
