//! Configuration loading from `~/.taia/config.toml` with defaults.
//!
//! A config may list `include = ["other.toml", ...]`; included files are
//! deep-merged first (later includes win) and the including file overrides
//! them. Include paths must be relative, stay inside the config directory,
//! and may not form a cycle.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use taia_types::config::FederationConfig;
use tracing::{info, warn};

/// Maximum include nesting depth.
const MAX_INCLUDE_DEPTH: u32 = 10;

/// Load the federation configuration, falling back to defaults.
///
/// A missing, unreadable or invalid file never fails the caller; the
/// problem is logged and defaults are used. When `home_dir` is set but
/// `data_dir` is not, the data directory follows the home directory.
pub fn load_config(path: Option<&Path>) -> FederationConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return FederationConfig::default();
    }

    let contents = match std::fs::read_to_string(&config_path) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, path = %config_path.display(), "Failed to read config file, using defaults");
            return FederationConfig::default();
        }
    };
    let mut root_value = match toml::from_str::<toml::Value>(&contents) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, path = %config_path.display(), "Failed to parse config, using defaults");
            return FederationConfig::default();
        }
    };

    let config_dir = config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let mut visited = HashSet::new();
    visited.insert(std::fs::canonicalize(&config_path).unwrap_or_else(|_| config_path.clone()));
    if let Err(e) = resolve_includes(&mut root_value, &config_dir, &mut visited, 0) {
        warn!(error = %e, "Config include resolution failed, using root config only");
    }

    if let toml::Value::Table(ref mut tbl) = root_value {
        tbl.remove("include");
        if !tbl.contains_key("data_dir") {
            if let Some(home) = tbl.get("home_dir").and_then(|v| v.as_str()) {
                let data_dir = Path::new(home).join("data").to_string_lossy().into_owned();
                tbl.insert("data_dir".to_string(), toml::Value::String(data_dir));
            }
        }
    }

    match root_value.try_into::<FederationConfig>() {
        Ok(config) => {
            info!(path = %config_path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(error = %e, path = %config_path.display(), "Failed to deserialize merged config, using defaults");
            FederationConfig::default()
        }
    }
}

fn resolve_includes(
    root_value: &mut toml::Value,
    config_dir: &Path,
    visited: &mut HashSet<PathBuf>,
    depth: u32,
) -> Result<(), String> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(format!(
            "Config include depth exceeded maximum of {MAX_INCLUDE_DEPTH}"
        ));
    }

    let includes: Vec<String> = match root_value
        .as_table()
        .and_then(|tbl| tbl.get("include"))
        .and_then(|v| v.as_array())
    {
        Some(arr) => arr
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        None => return Ok(()),
    };
    if includes.is_empty() {
        return Ok(());
    }

    let canonical_dir = std::fs::canonicalize(config_dir)
        .map_err(|e| format!("Config dir cannot be canonicalized: {e}"))?;
    let mut merged = toml::Value::Table(toml::map::Map::new());

    for include in &includes {
        let include_path = Path::new(include);
        if include_path.is_absolute() {
            return Err(format!("Config include rejects absolute path: {include}"));
        }
        if include_path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(format!("Config include rejects path traversal: {include}"));
        }

        let canonical = std::fs::canonicalize(config_dir.join(include_path))
            .map_err(|e| format!("Config include '{include}' cannot be resolved: {e}"))?;
        if !canonical.starts_with(&canonical_dir) {
            return Err(format!("Config include '{include}' escapes config directory"));
        }
        if !visited.insert(canonical.clone()) {
            return Err(format!("Circular config include detected: {include}"));
        }

        info!(include = %include, "Loading config include");
        let contents = std::fs::read_to_string(&canonical)
            .map_err(|e| format!("Failed to read config include '{include}': {e}"))?;
        let mut value: toml::Value = toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config include '{include}': {e}"))?;

        let include_dir = canonical.parent().unwrap_or(config_dir).to_path_buf();
        resolve_includes(&mut value, &include_dir, visited, depth + 1)?;
        if let toml::Value::Table(ref mut tbl) = value {
            tbl.remove("include");
        }
        deep_merge_toml(&mut merged, &value);
    }

    let mut root = root_value.clone();
    if let toml::Value::Table(ref mut tbl) = root {
        tbl.remove("include");
    }
    deep_merge_toml(&mut merged, &root);
    *root_value = merged;
    Ok(())
}

/// Deep-merge two TOML values. Tables merge recursively; for everything
/// else `overlay` wins.
pub fn deep_merge_toml(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_tbl), toml::Value::Table(overlay_tbl)) => {
            for (key, overlay_val) in overlay_tbl {
                if let Some(base_val) = base_tbl.get_mut(key) {
                    deep_merge_toml(base_val, overlay_val);
                } else {
                    base_tbl.insert(key.clone(), overlay_val.clone());
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}

/// The federation home directory, `~/.taia`.
pub fn taia_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".taia")
}

/// Default config file path.
pub fn default_config_path() -> PathBuf {
    taia_home().join("config.toml")
}
