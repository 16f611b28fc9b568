//! Config file discovery and layered loading.
//!
//! Implements the `Config::load()` algorithm:
//! 1. Parse `defaults.toml` into the base tree
//! 2. Merge `/etc/hearth/config.toml` (system)
//! 3. Merge `{hearth_home}/config.toml` (user)
//! 4. Merge the explicit `--config` file, if any
//! 5. Apply env var fallbacks for fields no file set
//! 6. Resolve `${VAR}` references
//! 7. Deserialize the merged tree into [`Config`]
//! 8. Validate

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::env::{apply_env_fallbacks, collect_env_vars, resolve_env_references};
use crate::error::{ConfigError, ConfigResult};
use crate::merge::{ConfigLayer, FieldSources, deep_merge_tracking, record_leaves};
use crate::types::Config;
use crate::validate;

/// Embedded default configuration.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// System-wide config path.
const SYSTEM_CONFIG_PATH: &str = "/etc/hearth/config.toml";

/// Maximum allowed config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

/// A loaded configuration together with where each field came from.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// The validated configuration.
    pub config: Config,
    /// The hearth home directory user config and default paths hang off.
    pub hearth_home: PathBuf,
    /// Source layer of every leaf field.
    pub field_sources: FieldSources,
    /// Files that were merged, lowest precedence first.
    pub loaded_files: Vec<String>,
}

/// Load the configuration with layered precedence.
///
/// `explicit` is a file named on the command line; it wins over every other
/// layer. `hearth_home_override` replaces `$HEARTH_HOME` / `~/.hearth`.
///
/// # Errors
///
/// Returns a [`ConfigError`] if any config file is malformed, the home
/// directory cannot be determined, or the merged configuration fails
/// validation.
pub fn load(
    explicit: Option<&Path>,
    hearth_home_override: Option<&Path>,
) -> ConfigResult<ResolvedConfig> {
    let env_vars = collect_env_vars();
    let hearth_home = match hearth_home_override {
        Some(h) => h.to_path_buf(),
        None => default_hearth_home(&env_vars)?,
    };
    load_layers(
        &[Path::new(SYSTEM_CONFIG_PATH)],
        explicit,
        &hearth_home,
        &env_vars,
    )
}

/// Layered load with every input passed in explicitly.
pub(crate) fn load_layers(
    system_paths: &[&Path],
    explicit: Option<&Path>,
    hearth_home: &Path,
    env_vars: &HashMap<String, String>,
) -> ConfigResult<ResolvedConfig> {
    let mut merged: toml::Value =
        toml::from_str(DEFAULTS_TOML).map_err(|e| ConfigError::ParseError {
            path: "<embedded defaults>".to_owned(),
            source: e,
        })?;

    let mut field_sources = FieldSources::new();
    let mut loaded_files = Vec::new();
    record_leaves(&merged, "", &ConfigLayer::Defaults, &mut field_sources);

    let user_path = hearth_home.join("config.toml");
    let mut layers: Vec<(PathBuf, ConfigLayer)> = system_paths
        .iter()
        .map(|p| (p.to_path_buf(), ConfigLayer::System))
        .collect();
    layers.push((user_path, ConfigLayer::User));
    if let Some(path) = explicit {
        layers.push((
            path.to_path_buf(),
            ConfigLayer::Explicit(path.display().to_string()),
        ));
    }

    for (path, layer) in layers {
        let overlay = match try_load_file(&path)? {
            Some(overlay) => overlay,
            // A missing explicit file is an error, other layers are optional.
            None if matches!(layer, ConfigLayer::Explicit(_)) => {
                return Err(ConfigError::ReadError {
                    path: path.display().to_string(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            },
            None => continue,
        };
        deep_merge_tracking(&mut merged, &overlay, "", &layer, &mut field_sources);
        loaded_files.push(path.display().to_string());
        info!(path = %path.display(), layer = %layer, "loaded config layer");
    }

    let env_count = apply_env_fallbacks(&mut merged, &mut field_sources, env_vars);
    if env_count > 0 {
        debug!(count = env_count, "applied environment variable fallbacks");
    }

    resolve_env_references(&mut merged, env_vars);
    let config: Config =
        merged
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError {
                path: "<merged config>".to_owned(),
                source: e,
            })?;

    validate::validate(&config)?;

    Ok(ResolvedConfig {
        config,
        hearth_home: hearth_home.to_path_buf(),
        field_sources,
        loaded_files,
    })
}

/// Load a config from a single file (no layering).
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read, parsed, or fails
/// validation.
pub fn load_file(path: &Path) -> ConfigResult<Config> {
    let value = try_load_file(path)?.ok_or_else(|| ConfigError::ReadError {
        path: path.display().to_string(),
        source: std::io::Error::from(std::io::ErrorKind::NotFound),
    })?;
    let config: Config = value
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::ParseError {
            path: path.display().to_string(),
            source: e,
        })?;
    validate::validate(&config)?;
    Ok(config)
}

/// Read and parse a file, returning `None` if it doesn't exist.
///
/// A single read is used, without a separate exists check.
fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found, skipping");
            return Ok(None);
        },
        Err(e) => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source: e,
            });
        },
    };

    if content.len() as u64 > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::ValidationError {
            field: path.display().to_string(),
            message: format!(
                "config file is {} bytes, exceeding the {MAX_CONFIG_FILE_SIZE} byte limit",
                content.len()
            ),
        });
    }

    let value: toml::Value = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        source: e,
    })?;

    Ok(Some(value))
}

/// `$HEARTH_HOME` if set, otherwise `~/.hearth`.
fn default_hearth_home(env_vars: &HashMap<String, String>) -> ConfigResult<PathBuf> {
    if let Some(home) = env_vars.get("HEARTH_HOME").filter(|h| !h.is_empty()) {
        return Ok(PathBuf::from(home));
    }
    directories::BaseDirs::new()
        .map(|d| d.home_dir().join(".hearth"))
        .ok_or(ConfigError::NoHomeDir)
}
