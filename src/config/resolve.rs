//! Configuration resolution
//!
//! Turns the declarative records into flat, pre-built testcases and
//! sequences: defaults applied, values validated, endpoints expanded
//! across databases and variations, URLs and bodies computed once.
//! Declaration order is preserved end to end. The resolver never
//! mutates state on error; it either returns a complete
//! `ResolvedConfig` or the first `ConfigError` with its context path.

use std::path::PathBuf;
use std::time::Duration;

use indexmap::IndexMap;
use url::Url;

use super::{
    CapacitySection, ConfigError, EndpointConfig, FlowConfig, RawConfig, ServersSection,
    Variation, VarSpecConfig,
};
use crate::models::{
    canonicalize_headers, CapacitySettings, Expectation, LoadBound, RequestBody, ResolvedSequence,
    ResolvedServer, SequenceStep, Testcase, VarKind, VarSpec, WarmupSettings,
};
use crate::sink::InfluxSettings;

const DEFAULT_BASE_URL: &str = "http://localhost";
const DEFAULT_WORKERS: usize = 10;
const DEFAULT_ITERATIONS: u64 = 100;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(3);

const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

/// Phase defaults derived from the config; CLI flags override these.
#[derive(Clone, Copy, Debug)]
pub struct RunDefaults {
    pub warmup: bool,
    pub resources: bool,
    pub capacity: bool,
}

/// The fully resolved run: everything execution needs, nothing left to
/// parse.
#[derive(Clone, Debug)]
pub struct ResolvedConfig {
    pub servers: Vec<ResolvedServer>,
    pub databases: Vec<String>,
    pub network: Option<String>,
    pub compose_file: Option<PathBuf>,
    pub server_cooldown: Duration,
    pub influx: Option<InfluxSettings>,
    pub defaults: RunDefaults,
}

/// Resolve a raw config into executable form.
pub fn resolve(raw: &RawConfig) -> Result<ResolvedConfig, ConfigError> {
    let bound = resolve_bound(raw)?;
    let request_timeout = optional_duration(
        raw.benchmark.request_timeout.as_ref(),
        "benchmark.request_timeout",
    )?
    .unwrap_or(DEFAULT_REQUEST_TIMEOUT);

    let warmup_defaults = WarmupSettings::default();
    let warmup = WarmupSettings {
        enabled: raw.benchmark.warmup.enabled.unwrap_or(warmup_defaults.enabled),
        duration: optional_duration(
            raw.benchmark.warmup.duration.as_ref(),
            "benchmark.warmup.duration",
        )?
        .unwrap_or(warmup_defaults.duration),
        pause: optional_duration(raw.benchmark.warmup.pause.as_ref(), "benchmark.warmup.pause")?
            .unwrap_or(warmup_defaults.pause),
    };

    let capacity = resolve_capacity(&raw.capacity)?;
    let workers = raw.benchmark.concurrency.unwrap_or(DEFAULT_WORKERS);
    if workers == 0 {
        return Err(ConfigError::invalid(
            "benchmark.concurrency",
            "must be at least 1",
        ));
    }

    let resources_enabled = raw.benchmark.resources_enabled.unwrap_or(true);
    let server_cooldown = optional_duration(
        raw.benchmark.server_cooldown.as_ref(),
        "benchmark.server_cooldown",
    )?
    .unwrap_or(DEFAULT_COOLDOWN);

    let cpu_limit = match &raw.container.cpu_limit {
        Some(value) => Some(
            value
                .resolve()
                .map_err(|e| ConfigError::invalid("container.cpu_limit", e))?,
        ),
        None => None,
    };
    let memory_limit = match &raw.container.memory_limit {
        Some(value) => Some(
            super::normalize_memory(value)
                .map_err(|e| ConfigError::invalid("container.memory_limit", e))?,
        ),
        None => None,
    };

    if let Some(influx) = &raw.influx {
        if !(influx.sample_rate > 0.0 && influx.sample_rate <= 1.0) {
            return Err(ConfigError::invalid(
                "influx.sample_rate",
                format!("must be in (0, 1], got {}", influx.sample_rate),
            ));
        }
    }

    let base = raw
        .benchmark
        .base_url
        .clone()
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

    let entries = server_entries(&raw.servers)?;
    if entries.is_empty() {
        return Err(ConfigError::invalid("servers", "at least one server required"));
    }

    let mut servers = Vec::with_capacity(entries.len());
    for (name, image, port) in entries {
        let base_url = server_base_url(&base, port)?;
        let (testcases, endpoint_order, sequences) = expand_endpoints(raw, &base_url)?;

        servers.push(ResolvedServer {
            name,
            image,
            container_port: port,
            host_port: port,
            base_url,
            request_timeout,
            cpu_limit,
            memory_limit: memory_limit.clone(),
            workers,
            bound,
            testcases,
            endpoint_order,
            warmup,
            resources_enabled,
            capacity: capacity.clone(),
            sequences,
        });
    }

    Ok(ResolvedConfig {
        defaults: RunDefaults {
            warmup: warmup.enabled,
            resources: resources_enabled,
            capacity: capacity.enabled,
        },
        servers,
        databases: raw.databases.clone(),
        network: raw.container.network.clone(),
        compose_file: raw.container.compose_file.as_ref().map(PathBuf::from),
        server_cooldown,
        influx: raw.influx.clone(),
    })
}

/// Pick the load bound; the two config forms are mutually exclusive.
fn resolve_bound(raw: &RawConfig) -> Result<LoadBound, ConfigError> {
    match (
        raw.benchmark.requests_per_endpoint,
        raw.benchmark.duration_per_endpoint.as_ref(),
    ) {
        (Some(_), Some(_)) => Err(ConfigError::invalid(
            "benchmark",
            "requests_per_endpoint and duration_per_endpoint are mutually exclusive",
        )),
        (Some(0), None) => Err(ConfigError::invalid(
            "benchmark.requests_per_endpoint",
            "must be at least 1",
        )),
        (Some(n), None) => Ok(LoadBound::Iterations(n)),
        (None, Some(value)) => {
            let duration = value
                .resolve()
                .map_err(|e| ConfigError::invalid("benchmark.duration_per_endpoint", e))?;
            if duration.is_zero() {
                return Err(ConfigError::invalid(
                    "benchmark.duration_per_endpoint",
                    "must be positive",
                ));
            }
            Ok(LoadBound::Duration(duration))
        }
        (None, None) => Ok(LoadBound::Iterations(DEFAULT_ITERATIONS)),
    }
}

fn resolve_capacity(section: &CapacitySection) -> Result<CapacitySettings, ConfigError> {
    let defaults = CapacitySettings::default();
    let min_workers = section.min_workers.unwrap_or(defaults.min_workers);
    let max_workers = section.max_workers.unwrap_or(defaults.max_workers);
    if min_workers == 0 || max_workers < min_workers {
        return Err(ConfigError::invalid(
            "capacity",
            format!("invalid worker range [{min_workers}, {max_workers}]"),
        ));
    }

    let search_precision = match section.search_precision {
        Some(percent) if percent > 0.0 && percent <= 100.0 => percent / 100.0,
        Some(percent) => {
            return Err(ConfigError::invalid(
                "capacity.search_precision",
                format!("must be a percentage in (0, 100], got {percent}"),
            ))
        }
        None => defaults.search_precision,
    };
    let min_success_rate = match section.min_success_rate {
        Some(percent) if percent > 0.0 && percent <= 100.0 => percent / 100.0,
        Some(percent) => {
            return Err(ConfigError::invalid(
                "capacity.min_success_rate",
                format!("must be a percentage in (0, 100], got {percent}"),
            ))
        }
        None => defaults.min_success_rate,
    };

    Ok(CapacitySettings {
        enabled: section.enabled.unwrap_or(defaults.enabled),
        min_workers,
        max_workers,
        search_precision,
        min_success_rate,
        p99_threshold: optional_duration(section.p99_threshold.as_ref(), "capacity.p99_threshold")?
            .unwrap_or(defaults.p99_threshold),
        warmup_duration: optional_duration(
            section.warmup_duration.as_ref(),
            "capacity.warmup_duration",
        )?
        .unwrap_or(defaults.warmup_duration),
        measure_duration: optional_duration(
            section.measure_duration.as_ref(),
            "capacity.measure_duration",
        )?
        .unwrap_or(defaults.measure_duration),
        iteration_pause: optional_duration(
            section.iteration_pause.as_ref(),
            "capacity.iteration_pause",
        )?
        .unwrap_or(defaults.iteration_pause),
        pre_run_pause: optional_duration(section.pre_run_pause.as_ref(), "capacity.pre_run_pause")?
            .unwrap_or(defaults.pre_run_pause),
    })
}

fn optional_duration(
    value: Option<&super::DurationValue>,
    context: &str,
) -> Result<Option<Duration>, ConfigError> {
    value
        .map(|v| v.resolve().map_err(|e| ConfigError::invalid(context, e)))
        .transpose()
}

fn server_entries(section: &ServersSection) -> Result<Vec<(String, String, u16)>, ConfigError> {
    let entries = match section {
        ServersSection::List(list) => list
            .iter()
            .map(|entry| (entry.name.clone(), entry.image.clone(), entry.port))
            .collect::<Vec<_>>(),
        // Shorthand form: the image is the server name.
        ServersSection::Map(map) => map
            .iter()
            .map(|(name, port)| (name.clone(), name.clone(), *port))
            .collect(),
    };

    for (name, _, port) in &entries {
        if name.is_empty() {
            return Err(ConfigError::invalid("servers", "server name must not be empty"));
        }
        if *port == 0 {
            return Err(ConfigError::invalid(
                format!("server \"{name}\""),
                "port must not be 0",
            ));
        }
    }
    Ok(entries)
}

fn server_base_url(base: &str, port: u16) -> Result<Url, ConfigError> {
    let mut url = Url::parse(base)
        .map_err(|e| ConfigError::invalid("benchmark.base_url", e.to_string()))?;
    url.set_port(Some(port))
        .map_err(|_| ConfigError::invalid("benchmark.base_url", "cannot carry a port"))?;
    Ok(url)
}

/// Expand the endpoint catalog for one server's base URL.
fn expand_endpoints(
    raw: &RawConfig,
    base_url: &Url,
) -> Result<(Vec<Testcase>, Vec<String>, Vec<ResolvedSequence>), ConfigError> {
    let mut testcases = Vec::new();
    let mut endpoint_order = Vec::new();
    // Sequence groups keyed by (id, database), in first-seen order.
    let mut groups: IndexMap<(String, Option<String>), ResolvedSequence> = IndexMap::new();

    for (name, endpoint) in &raw.endpoints {
        let context = format!("endpoint \"{name}\"");

        let databases: Vec<Option<&str>> = if endpoint.per_database && !raw.databases.is_empty() {
            raw.databases.iter().map(|db| Some(db.as_str())).collect()
        } else {
            vec![None]
        };

        if let Some(flow) = &endpoint.flow {
            // Sequence members never appear in the flat endpoint set.
            for db in &databases {
                let key = (flow.id.clone(), db.map(str::to_string));
                let group = groups.entry(key).or_insert_with(|| ResolvedSequence {
                    id: flow.id.clone(),
                    database: db.map(str::to_string),
                    vars: IndexMap::new(),
                    steps: Vec::new(),
                });
                for (var_name, spec) in &flow.vars {
                    group
                        .vars
                        .insert(var_name.clone(), resolve_var_spec(spec, &context)?);
                }
                group
                    .steps
                    .push(resolve_step(name, endpoint, flow, *db, &context)?);
            }
            continue;
        }

        // One order entry per declared endpoint; database and
        // variation expansion below stays testcase-level and is
        // regrouped under this key at dispatch time.
        endpoint_order.push(name.clone());

        for db in &databases {
            let testcase = build_testcase(name, endpoint, None, *db, base_url, &context)?;
            testcases.push(testcase);

            for (index, variation) in endpoint.variations.iter().enumerate() {
                let context = format!("{context} variation {}", index + 1);
                let testcase =
                    build_testcase(name, endpoint, Some((index, variation)), *db, base_url, &context)?;
                testcases.push(testcase);
            }
        }
    }

    Ok((testcases, endpoint_order, groups.into_values().collect()))
}

fn validate_method(method: Option<&str>, context: &str) -> Result<String, ConfigError> {
    let method = method.unwrap_or("GET").trim().to_ascii_uppercase();
    if !ALLOWED_METHODS.contains(&method.as_str()) {
        return Err(ConfigError::invalid(
            context,
            format!("unsupported method \"{method}\""),
        ));
    }
    Ok(method)
}

fn validate_status(status: Option<u16>, context: &str) -> Result<u16, ConfigError> {
    let status = status.unwrap_or(200);
    if !(100..=599).contains(&status) {
        return Err(ConfigError::invalid(
            context,
            format!("expected_status must be in [100, 599], got {status}"),
        ));
    }
    Ok(status)
}

/// Paths must start with `/`; prepend when missing.
fn normalize_path(path: Option<&str>, db: Option<&str>, context: &str) -> Result<String, ConfigError> {
    let path = path
        .ok_or_else(|| ConfigError::invalid(context, "missing path"))?
        .trim()
        .to_string();
    if path.is_empty() {
        return Err(ConfigError::invalid(context, "path must not be empty"));
    }
    let mut path = if path.starts_with('/') {
        path
    } else {
        format!("/{path}")
    };
    if let Some(db) = db {
        path = path.replace("{database}", db);
    }
    Ok(path)
}

/// Merge two ordered maps: base entries first, overrides appended or
/// replacing in place.
fn merge_maps(
    base: &IndexMap<String, String>,
    overrides: &IndexMap<String, String>,
) -> IndexMap<String, String> {
    let mut merged = base.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Build one fully resolved testcase from an endpoint and an optional
/// variation overlay.
fn build_testcase(
    name: &str,
    endpoint: &EndpointConfig,
    variation: Option<(usize, &Variation)>,
    db: Option<&str>,
    base_url: &Url,
    context: &str,
) -> Result<Testcase, ConfigError> {
    let overlay = variation.map(|(_, v)| v);

    let method = validate_method(
        overlay
            .and_then(|v| v.method.as_deref())
            .or(endpoint.method.as_deref()),
        context,
    )?;
    let path = normalize_path(
        overlay
            .and_then(|v| v.path.as_deref())
            .or(endpoint.path.as_deref()),
        db,
        context,
    )?;

    let query = match overlay {
        Some(v) => merge_maps(&endpoint.query, &v.query),
        None => endpoint.query.clone(),
    };
    let headers = match overlay {
        Some(v) => merge_maps(&endpoint.headers, &v.headers),
        None => endpoint.headers.clone(),
    };
    let expected_headers = match overlay {
        Some(v) => merge_maps(&endpoint.expected_headers, &v.expected_headers),
        None => endpoint.expected_headers.clone(),
    };

    let expected_status = validate_status(
        overlay
            .and_then(|v| v.expected_status)
            .or(endpoint.expected_status),
        context,
    )?;
    let expected_body = overlay
        .and_then(|v| v.expected_body.clone())
        .or_else(|| endpoint.expected_body.clone());
    let expected_text = overlay
        .and_then(|v| v.expected_text.clone())
        .or_else(|| endpoint.expected_text.clone());

    let file = overlay.and_then(|v| v.file.as_ref()).or(endpoint.file.as_ref());
    let form_data = match overlay {
        Some(v) => merge_maps(&endpoint.form_data, &v.form_data),
        None => endpoint.form_data.clone(),
    };
    let body_value = overlay
        .and_then(|v| v.body.clone())
        .or_else(|| endpoint.body.clone());

    // Pre-compute the payload: file wins over form fields, form fields
    // over a JSON body.
    let body = if let Some(file) = file {
        build_multipart(file, &form_data, context)?
    } else if !form_data.is_empty() {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in &form_data {
            serializer.append_pair(key, value);
        }
        RequestBody::Form(serializer.finish())
    } else if let Some(value) = &body_value {
        let serialized = serde_json::to_string(value)
            .map_err(|e| ConfigError::invalid(context, format!("unserializable body: {e}")))?;
        RequestBody::Json(serialized)
    } else {
        RequestBody::None
    };

    // URL: resolve the path against the base, then encode the query.
    let mut url = base_url
        .join(&path)
        .map_err(|e| ConfigError::invalid(context, format!("invalid path \"{path}\": {e}")))?;
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in &query {
            pairs.append_pair(key, value);
        }
    }

    let mut testcase_name = match db {
        Some(db) => format!("{name} [{db}]"),
        None => name.to_string(),
    };
    if let Some((index, v)) = variation {
        let suffix = v
            .name
            .clone()
            .unwrap_or_else(|| format!("variation {}", index + 1));
        testcase_name = format!("{testcase_name} / {suffix}");
    }

    Ok(Testcase {
        name: testcase_name,
        endpoint: name.to_string(),
        method,
        url,
        headers: canonicalize_headers(&headers),
        body,
        expect: Expectation {
            status: expected_status,
            headers: canonicalize_headers(&expected_headers),
            body: expected_body,
            text: expected_text,
        },
    })
}

/// Assemble a multipart body: file part plus any form fields, with a
/// per-testcase boundary.
fn build_multipart(
    file: &super::FileUpload,
    form_data: &IndexMap<String, String>,
    context: &str,
) -> Result<RequestBody, ConfigError> {
    let bytes = std::fs::read(&file.path).map_err(|e| {
        ConfigError::invalid(context, format!("cannot read file \"{}\": {e}", file.path))
    })?;

    let filename = file.filename.clone().unwrap_or_else(|| {
        std::path::Path::new(&file.path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string())
    });
    let content_type = file
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let boundary = format!("server-bench-{:016x}", rand::random::<u64>());
    let mut body = Vec::with_capacity(bytes.len() + 512);

    for (key, value) in form_data {
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{key}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n",
            file.field
        )
        .as_bytes(),
    );
    body.extend_from_slice(&bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    Ok(RequestBody::Multipart {
        content_type: format!("multipart/form-data; boundary={boundary}"),
        body,
    })
}

fn resolve_step(
    name: &str,
    endpoint: &EndpointConfig,
    flow: &FlowConfig,
    db: Option<&str>,
    context: &str,
) -> Result<SequenceStep, ConfigError> {
    Ok(SequenceStep {
        name: name.to_string(),
        method: validate_method(endpoint.method.as_deref(), context)?,
        path_template: normalize_path(endpoint.path.as_deref(), db, context)?,
        headers: canonicalize_headers(&endpoint.headers),
        body: endpoint.body.clone(),
        expected_status: validate_status(endpoint.expected_status, context)?,
        expected_body: endpoint.expected_body.clone(),
        capture: flow.capture.clone(),
    })
}

fn resolve_var_spec(spec: &VarSpecConfig, context: &str) -> Result<VarSpec, ConfigError> {
    let kind = match spec.kind.to_ascii_lowercase().as_str() {
        "email" => VarKind::Email,
        "int" => VarKind::Int,
        other => {
            return Err(ConfigError::invalid(
                context,
                format!("unknown var type \"{other}\" (expected email or int)"),
            ))
        }
    };

    let min = spec.min.unwrap_or(1);
    let max = spec.max.unwrap_or(1_000_000);
    if kind == VarKind::Int && min > max {
        return Err(ConfigError::invalid(
            context,
            format!("var range [{min}, {max}] is empty"),
        ));
    }

    let optional = match spec.optional {
        Some(value) => value
            .probability()
            .map_err(|e| ConfigError::invalid(context, e))?,
        None => 0.0,
    };

    Ok(VarSpec {
        kind,
        min,
        max,
        optional,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> RawConfig {
        serde_json::from_str(json).expect("config json")
    }

    fn sample_config() -> RawConfig {
        parse(
            r#"{
                "benchmark": {
                    "base_url": "http://localhost",
                    "concurrency": 4,
                    "requests_per_endpoint": 50,
                    "request_timeout": "5s"
                },
                "container": {"cpu_limit": "150%", "memory_limit": "512MB"},
                "databases": ["postgres", "mysql"],
                "servers": [{"name": "axum", "image": "bench/axum", "port": 3000}],
                "endpoints": {
                    "root": {
                        "path": "/",
                        "expected_body": {"message": "Hello, World!"}
                    },
                    "users": {
                        "method": "post",
                        "path": "users",
                        "body": {"name": "a"},
                        "expected_status": 201,
                        "variations": [
                            {"name": "bad payload", "body": {"name": ""}, "expected_status": 422}
                        ]
                    },
                    "db_ping": {
                        "path": "/db/{database}/ping",
                        "per_database": true
                    },
                    "create_user": {
                        "method": "POST",
                        "path": "/users",
                        "body": {"email": "{unique_email}"},
                        "expected_status": 201,
                        "flow": {
                            "id": "signup",
                            "capture": {"id": "id"},
                            "vars": {"unique_email": {"type": "email"}}
                        }
                    },
                    "read_user": {
                        "path": "/users/{id}",
                        "flow": {"id": "signup"}
                    }
                }
            }"#,
        )
    }

    #[test]
    fn test_resolve_order_and_expansion() {
        let resolved = resolve(&sample_config()).unwrap();
        assert_eq!(resolved.servers.len(), 1);

        let server = &resolved.servers[0];
        // Flow endpoints are excluded; the order carries declared
        // endpoints only, while expansion stays testcase-level.
        assert_eq!(server.endpoint_order, vec!["root", "users", "db_ping"]);
        let testcase_names: Vec<&str> =
            server.testcases.iter().map(|tc| tc.name.as_str()).collect();
        assert_eq!(
            testcase_names,
            [
                "root",
                "users",
                "users / bad payload",
                "db_ping [postgres]",
                "db_ping [mysql]",
            ]
        );
        // Every expanded testcase keeps its declared endpoint key.
        assert_eq!(
            server
                .testcases
                .iter()
                .filter(|tc| tc.endpoint == "db_ping")
                .count(),
            2
        );
        assert_eq!(server.workers, 4);
        assert_eq!(server.bound, LoadBound::Iterations(50));
        assert_eq!(server.cpu_limit, Some(1.5));
        assert_eq!(server.memory_limit.as_deref(), Some("512mb"));
    }

    #[test]
    fn test_resolve_database_substitution() {
        let resolved = resolve(&sample_config()).unwrap();
        let server = &resolved.servers[0];
        let ping = server
            .testcases
            .iter()
            .find(|tc| tc.name == "db_ping [postgres]")
            .unwrap();
        assert_eq!(ping.url.path(), "/db/postgres/ping");
    }

    #[test]
    fn test_resolve_variation_merge() {
        let resolved = resolve(&sample_config()).unwrap();
        let server = &resolved.servers[0];
        let variation = server
            .testcases
            .iter()
            .find(|tc| tc.name == "users / bad payload")
            .unwrap();
        // scalar replaced
        assert_eq!(variation.expect.status, 422);
        // body replaced, method inherited and uppercased
        assert_eq!(variation.method, "POST");
        assert_eq!(variation.body, RequestBody::Json("{\"name\":\"\"}".into()));
        // path auto-prefixed from "users"
        assert_eq!(variation.url.path(), "/users");
    }

    #[test]
    fn test_resolve_sequences_grouped() {
        let resolved = resolve(&sample_config()).unwrap();
        let server = &resolved.servers[0];

        assert_eq!(server.sequences.len(), 1);
        let seq = &server.sequences[0];
        assert_eq!(seq.id, "signup");
        assert_eq!(seq.steps.len(), 2);
        assert_eq!(seq.steps[0].name, "create_user");
        assert_eq!(seq.steps[1].name, "read_user");
        assert_eq!(seq.steps[0].capture.get("id").map(String::as_str), Some("id"));
        assert!(seq.vars.contains_key("unique_email"));
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let raw = sample_config();
        let first = resolve(&raw).unwrap();
        let second = resolve(&raw).unwrap();

        let names =
            |cfg: &ResolvedConfig| -> Vec<String> { cfg.servers[0].endpoint_order.clone() };
        let urls = |cfg: &ResolvedConfig| -> Vec<String> {
            cfg.servers[0]
                .testcases
                .iter()
                .map(|tc| tc.url.to_string())
                .collect()
        };
        assert_eq!(names(&first), names(&second));
        assert_eq!(urls(&first), urls(&second));
    }

    #[test]
    fn test_resolve_rejects_both_bounds() {
        let raw = parse(
            r#"{
                "benchmark": {"requests_per_endpoint": 10, "duration_per_endpoint": "5s"},
                "servers": {"axum": 3000},
                "endpoints": {"root": {"path": "/"}}
            }"#,
        );
        let err = resolve(&raw).unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn test_resolve_rejects_bad_method() {
        let raw = parse(
            r#"{
                "servers": {"axum": 3000},
                "endpoints": {"bad": {"method": "BREW", "path": "/"}}
            }"#,
        );
        let err = resolve(&raw).unwrap_err().to_string();
        assert!(err.contains("endpoint \"bad\""));
        assert!(err.contains("BREW"));
    }

    #[test]
    fn test_resolve_rejects_bad_status_in_variation() {
        let raw = parse(
            r#"{
                "servers": {"axum": 3000},
                "endpoints": {
                    "users": {
                        "path": "/users",
                        "variations": [{"expected_status": 99}]
                    }
                }
            }"#,
        );
        let err = resolve(&raw).unwrap_err().to_string();
        assert!(err.contains("endpoint \"users\" variation 1"));
    }

    #[test]
    fn test_resolve_query_encoding() {
        let raw = parse(
            r#"{
                "servers": {"axum": 3000},
                "endpoints": {
                    "search": {"path": "/search", "query": {"q": "a b", "limit": "10"}}
                }
            }"#,
        );
        let resolved = resolve(&raw).unwrap();
        let url = &resolved.servers[0].testcases[0].url;
        assert_eq!(url.query(), Some("q=a+b&limit=10"));
    }

    #[test]
    fn test_resolve_map_servers_default_image() {
        let raw = parse(
            r#"{
                "servers": {"axum": 3000, "actix": 3001},
                "endpoints": {"root": {"path": "/"}}
            }"#,
        );
        let resolved = resolve(&raw).unwrap();
        assert_eq!(resolved.servers.len(), 2);
        assert_eq!(resolved.servers[0].image, "axum");
        assert_eq!(resolved.servers[0].host_port, 3000);
        assert_eq!(resolved.servers[1].name, "actix");
        assert_eq!(
            resolved.servers[1].base_url.as_str(),
            "http://localhost:3001/"
        );
    }

    #[test]
    fn test_resolve_headers_canonicalized() {
        let raw = parse(
            r#"{
                "servers": {"axum": 3000},
                "endpoints": {
                    "root": {
                        "path": "/",
                        "headers": {" x-api-key ": " secret "},
                        "expected_headers": {"content-type": "application/json"}
                    }
                }
            }"#,
        );
        let resolved = resolve(&raw).unwrap();
        let tc = &resolved.servers[0].testcases[0];
        assert_eq!(tc.headers.get("X-Api-Key").map(String::as_str), Some("secret"));
        assert!(tc.expect.headers.contains_key("Content-Type"));
    }

    #[test]
    fn test_resolve_default_bound() {
        let raw = parse(
            r#"{"servers": {"axum": 3000}, "endpoints": {"root": {"path": "/"}}}"#,
        );
        let resolved = resolve(&raw).unwrap();
        assert_eq!(resolved.servers[0].bound, LoadBound::Iterations(100));
        assert_eq!(resolved.servers[0].workers, 10);
    }

    #[test]
    fn test_resolve_requires_servers() {
        let raw = parse(r#"{"endpoints": {"root": {"path": "/"}}}"#);
        assert!(resolve(&raw).is_err());
    }

    #[test]
    fn test_resolve_form_body() {
        let raw = parse(
            r#"{
                "servers": {"axum": 3000},
                "endpoints": {
                    "login": {
                        "method": "POST",
                        "path": "/login",
                        "form_data": {"user": "admin", "pass": "s3cret&more"}
                    }
                }
            }"#,
        );
        let resolved = resolve(&raw).unwrap();
        match &resolved.servers[0].testcases[0].body {
            RequestBody::Form(encoded) => {
                assert!(encoded.contains("user=admin"));
                assert!(encoded.contains("pass=s3cret%26more"));
            }
            other => panic!("expected form body, got {other:?}"),
        }
    }
}
