//! Declarative configuration
//!
//! Raw serde records for the benchmark configuration file, plus the
//! value parsers (durations, CPU shares, memory limits) shared by the
//! resolver. `endpoints` and `servers` deserialize into `IndexMap`s so
//! the file's declaration order is the iteration order everywhere
//! downstream.

mod file;
mod resolve;

pub use file::{find_config, load_config};
pub use resolve::{resolve, ResolvedConfig, RunDefaults};

use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::sink::InfluxSettings;

/// Configuration errors are fatal at startup and always carry the
/// config path that produced them.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{context}: {message}")]
    Invalid { context: String, message: String },

    #[error("unsupported config extension: {0} (expected .json, .yaml or .yml)")]
    UnsupportedExtension(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },
}

impl ConfigError {
    pub fn invalid(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            context: context.into(),
            message: message.into(),
        }
    }
}

/// Top-level configuration file.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    #[serde(default)]
    pub benchmark: BenchmarkSection,

    #[serde(default)]
    pub container: ContainerSection,

    #[serde(default)]
    pub capacity: CapacitySection,

    /// Database names the servers under test depend on.
    #[serde(default)]
    pub databases: Vec<String>,

    /// Servers, either `[{name, image, port}]` or `{name: port}`.
    /// Declaration order is the benchmark order.
    #[serde(default)]
    pub servers: ServersSection,

    /// Endpoint catalog shared by all servers. Declaration order is
    /// the report order.
    #[serde(default)]
    pub endpoints: IndexMap<String, EndpointConfig>,

    /// Optional time-series sink.
    #[serde(default)]
    pub influx: Option<InfluxSettings>,
}

/// `benchmark` section: load shape and timing.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BenchmarkSection {
    pub base_url: Option<String>,
    /// Worker count per endpoint run.
    pub concurrency: Option<usize>,
    pub requests_per_endpoint: Option<u64>,
    pub duration_per_endpoint: Option<DurationValue>,
    pub request_timeout: Option<DurationValue>,
    #[serde(default)]
    pub warmup: WarmupSection,
    pub server_cooldown: Option<DurationValue>,
    pub resources_enabled: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WarmupSection {
    pub enabled: Option<bool>,
    pub duration: Option<DurationValue>,
    pub pause: Option<DurationValue>,
}

/// `container` section: resource limits and runtime wiring.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerSection {
    pub cpu_limit: Option<CpuValue>,
    pub memory_limit: Option<String>,
    pub network: Option<String>,
    /// Compose file for database dependencies.
    pub compose_file: Option<String>,
}

/// `capacity` section: binary-search SLO parameters. Percent fields
/// are given as percentages (`5` = 5%).
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapacitySection {
    pub enabled: Option<bool>,
    pub min_workers: Option<usize>,
    pub max_workers: Option<usize>,
    pub search_precision: Option<f64>,
    pub min_success_rate: Option<f64>,
    pub p99_threshold: Option<DurationValue>,
    pub warmup_duration: Option<DurationValue>,
    pub measure_duration: Option<DurationValue>,
    pub iteration_pause: Option<DurationValue>,
    pub pre_run_pause: Option<DurationValue>,
}

/// Servers accept a list form with explicit images or a shorthand map
/// of `name: port` where the image defaults to the name.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum ServersSection {
    List(Vec<ServerEntry>),
    Map(IndexMap<String, u16>),
}

impl Default for ServersSection {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerEntry {
    pub name: String,
    pub image: String,
    pub port: u16,
}

/// One declarative endpoint.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    pub method: Option<String>,
    pub path: Option<String>,
    #[serde(default)]
    pub query: IndexMap<String, String>,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    pub body: Option<Value>,
    #[serde(default)]
    pub form_data: IndexMap<String, String>,
    pub file: Option<FileUpload>,
    pub expected_status: Option<u16>,
    #[serde(default)]
    pub expected_headers: IndexMap<String, String>,
    pub expected_body: Option<Value>,
    pub expected_text: Option<String>,
    #[serde(default)]
    pub variations: Vec<Variation>,
    /// Sequence membership. A flow endpoint is excluded from flat
    /// endpoint testing.
    pub flow: Option<FlowConfig>,
    /// Expand this endpoint once per configured database, substituting
    /// `{database}` in the path.
    #[serde(default)]
    pub per_database: bool,
}

/// File asset attached as a multipart upload.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileUpload {
    pub field: String,
    pub path: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

/// Partial endpoint override: maps merge into the base, scalars
/// replace when set.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Variation {
    pub name: Option<String>,
    pub method: Option<String>,
    pub path: Option<String>,
    #[serde(default)]
    pub query: IndexMap<String, String>,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    pub body: Option<Value>,
    #[serde(default)]
    pub form_data: IndexMap<String, String>,
    pub file: Option<FileUpload>,
    pub expected_status: Option<u16>,
    #[serde(default)]
    pub expected_headers: IndexMap<String, String>,
    pub expected_body: Option<Value>,
    pub expected_text: Option<String>,
}

/// Sequence membership descriptor.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowConfig {
    pub id: String,
    /// response field -> variable name captured after this step.
    #[serde(default)]
    pub capture: IndexMap<String, String>,
    /// Variables generated per cycle, shared by the whole sequence.
    #[serde(default)]
    pub vars: IndexMap<String, VarSpecConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VarSpecConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub optional: Option<OptionalValue>,
}

/// `optional` accepts `true` (coin flip) or an explicit probability.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(untagged)]
pub enum OptionalValue {
    Flag(bool),
    Probability(f64),
}

impl OptionalValue {
    /// Omission probability in `[0, 1]`.
    pub fn probability(self) -> Result<f64, String> {
        match self {
            OptionalValue::Flag(true) => Ok(0.5),
            OptionalValue::Flag(false) => Ok(0.0),
            OptionalValue::Probability(p) if (0.0..=1.0).contains(&p) => Ok(p),
            OptionalValue::Probability(p) => Err(format!("optional must be in [0, 1], got {p}")),
        }
    }
}

/// Durations accept a bare number of seconds or a suffixed string
/// (`500ms`, `10s`, `2m`).
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum DurationValue {
    Seconds(f64),
    Text(String),
}

impl DurationValue {
    pub fn resolve(&self) -> Result<Duration, String> {
        match self {
            DurationValue::Seconds(secs) => {
                if *secs < 0.0 {
                    return Err(format!("duration must be non-negative, got {secs}"));
                }
                Ok(Duration::from_secs_f64(*secs))
            }
            DurationValue::Text(text) => parse_duration(text),
        }
    }
}

/// Parse `500ms` / `10s` / `2m` / bare seconds.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    let (number, scale) = if let Some(stripped) = text.strip_suffix("ms") {
        (stripped, 0.001)
    } else if let Some(stripped) = text.strip_suffix('s') {
        (stripped, 1.0)
    } else if let Some(stripped) = text.strip_suffix('m') {
        (stripped, 60.0)
    } else {
        (text, 1.0)
    };

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration \"{text}\""))?;
    if value < 0.0 {
        return Err(format!("duration must be non-negative, got \"{text}\""));
    }
    Ok(Duration::from_secs_f64(value * scale))
}

/// CPU limit: a core count or a percentage of one core (`150%` = 1.5
/// cores).
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum CpuValue {
    Cores(f64),
    Text(String),
}

impl CpuValue {
    pub fn resolve(&self) -> Result<f64, String> {
        let cores = match self {
            CpuValue::Cores(cores) => *cores,
            CpuValue::Text(text) => {
                let text = text.trim();
                if let Some(percent) = text.strip_suffix('%') {
                    let value: f64 = percent
                        .trim()
                        .parse()
                        .map_err(|_| format!("invalid cpu limit \"{text}\""))?;
                    value / 100.0
                } else {
                    text.parse()
                        .map_err(|_| format!("invalid cpu limit \"{text}\""))?
                }
            }
        };
        if cores <= 0.0 {
            return Err(format!("cpu limit must be positive, got {cores}"));
        }
        Ok(cores)
    }
}

/// Normalize a memory limit to a `{k,m,g}b` suffix (`512MB` -> `512mb`).
pub fn normalize_memory(text: &str) -> Result<String, String> {
    let text = text.trim().to_ascii_lowercase();
    let digits_end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(digits_end);

    if number.is_empty() {
        return Err(format!("invalid memory limit \"{text}\""));
    }
    let normalized_unit = match unit.trim() {
        "k" | "kb" => "kb",
        "m" | "mb" => "mb",
        "g" | "gb" => "gb",
        other => {
            return Err(format!(
                "invalid memory unit \"{other}\" (expected kb, mb or gb)"
            ))
        }
    };
    Ok(format!("{number}{normalized_unit}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1.5").unwrap(), Duration::from_millis(1500));
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn test_duration_value_number() {
        let value: DurationValue = serde_json::from_str("2.5").unwrap();
        assert_eq!(value.resolve().unwrap(), Duration::from_millis(2500));

        let value: DurationValue = serde_json::from_str("\"750ms\"").unwrap();
        assert_eq!(value.resolve().unwrap(), Duration::from_millis(750));
    }

    #[test]
    fn test_cpu_value_forms() {
        let cores: CpuValue = serde_json::from_str("1.5").unwrap();
        assert_eq!(cores.resolve().unwrap(), 1.5);

        let percent: CpuValue = serde_json::from_str("\"150%\"").unwrap();
        assert_eq!(percent.resolve().unwrap(), 1.5);

        let plain: CpuValue = serde_json::from_str("\"2\"").unwrap();
        assert_eq!(plain.resolve().unwrap(), 2.0);

        let zero: CpuValue = serde_json::from_str("0").unwrap();
        assert!(zero.resolve().is_err());
    }

    #[test]
    fn test_normalize_memory() {
        assert_eq!(normalize_memory("512MB").unwrap(), "512mb");
        assert_eq!(normalize_memory("512m").unwrap(), "512mb");
        assert_eq!(normalize_memory("1g").unwrap(), "1gb");
        assert_eq!(normalize_memory("65536kb").unwrap(), "65536kb");
        assert!(normalize_memory("512").is_err());
        assert!(normalize_memory("lots").is_err());
    }

    #[test]
    fn test_optional_value() {
        assert_eq!(OptionalValue::Flag(true).probability().unwrap(), 0.5);
        assert_eq!(OptionalValue::Flag(false).probability().unwrap(), 0.0);
        assert_eq!(OptionalValue::Probability(0.2).probability().unwrap(), 0.2);
        assert!(OptionalValue::Probability(1.5).probability().is_err());
    }

    #[test]
    fn test_endpoints_preserve_declaration_order() {
        let json = r#"{
            "endpoints": {
                "zeta": {"path": "/z"},
                "alpha": {"path": "/a"},
                "mid": {"path": "/m"}
            }
        }"#;
        let raw: RawConfig = serde_json::from_str(json).unwrap();
        let order: Vec<&String> = raw.endpoints.keys().collect();
        assert_eq!(order, ["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_servers_both_forms() {
        let list: RawConfig = serde_json::from_str(
            r#"{"servers": [{"name": "axum", "image": "bench/axum", "port": 3000}]}"#,
        )
        .unwrap();
        match list.servers {
            ServersSection::List(entries) => {
                assert_eq!(entries[0].image, "bench/axum");
            }
            _ => panic!("expected list form"),
        }

        let map: RawConfig =
            serde_json::from_str(r#"{"servers": {"axum": 3000, "actix": 3001}}"#).unwrap();
        match map.servers {
            ServersSection::Map(entries) => {
                let names: Vec<&String> = entries.keys().collect();
                assert_eq!(names, ["axum", "actix"]);
            }
            _ => panic!("expected map form"),
        }
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result: Result<RawConfig, _> =
            serde_json::from_str(r#"{"benchmark": {"not_a_field": 1}}"#);
        assert!(result.is_err());
    }
}
