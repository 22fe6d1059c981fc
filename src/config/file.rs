//! Configuration file discovery and loading
//!
//! Finds the config in standard locations, rejects unsupported
//! extensions, and parses JSON or YAML into the raw records.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::{ConfigError, RawConfig};

/// Search locations, in order of precedence.
const CONFIG_LOCATIONS: &[&str] = &[
    "./bench.json",
    "./bench.yaml",
    "./bench.yml",
    "./.server-bench/config.json",
    "~/.config/server-bench/config.json",
];

/// Find a configuration file in the standard locations.
pub fn find_config() -> Option<PathBuf> {
    for location in CONFIG_LOCATIONS {
        let path = expand_path(location);
        if path.exists() {
            debug!(path = %path.display(), "found config");
            return Some(path);
        }
    }
    None
}

/// Load and parse a configuration file.
///
/// JSON is the primary format; YAML is accepted for convenience. Any
/// other extension is rejected outright.
pub fn load_config(path: impl AsRef<Path>) -> Result<RawConfig, ConfigError> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if !matches!(extension.as_str(), "json" | "yaml" | "yml") {
        return Err(ConfigError::UnsupportedExtension(
            path.display().to_string(),
        ));
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let raw: RawConfig = if extension == "json" {
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?
    } else {
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?
    };

    Ok(raw)
}

/// Expand `~` to the home directory.
fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_load_json_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bench.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{"servers": {{"axum": 3000}}, "endpoints": {{"root": {{"path": "/"}}}}}}"#
        )
        .unwrap();

        let raw = load_config(&path).unwrap();
        assert_eq!(raw.endpoints.len(), 1);
    }

    #[test]
    fn test_load_yaml_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bench.yaml");
        std::fs::write(&path, "servers:\n  axum: 3000\nendpoints:\n  root:\n    path: /\n")
            .unwrap();

        let raw = load_config(&path).unwrap();
        assert_eq!(raw.endpoints.len(), 1);
    }

    #[test]
    fn test_unsupported_extension_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bench.toml");
        std::fs::write(&path, "x = 1").unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedExtension(_)));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load_config("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_expand_path_plain() {
        assert_eq!(expand_path("./x.json"), PathBuf::from("./x.json"));
    }
}
