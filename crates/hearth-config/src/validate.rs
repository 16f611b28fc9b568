//! Post-merge configuration validation.

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

/// Upper bound for a single lifecycle call (one hour).
const MAX_LIFECYCLE_TIMEOUT_SECS: u64 = 3600;

/// Validate a fully-merged and deserialized configuration.
///
/// # Errors
///
/// Returns the first validation error found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_host(config)?;
    validate_modules(config)?;
    validate_bringup(config)?;
    validate_wasm(config)?;
    validate_logging(config)?;
    Ok(())
}

fn validate_host(config: &Config) -> ConfigResult<()> {
    let version = config.host.version.trim();
    let well_formed = !version.is_empty()
        && version
            .split(['.', '-', '+'])
            .next()
            .is_some_and(|major| major.parse::<u64>().is_ok());
    if !well_formed {
        return Err(ConfigError::ValidationError {
            field: "host.version".to_owned(),
            message: format!("'{}' is not a semantic version", config.host.version),
        });
    }
    Ok(())
}

fn validate_modules(config: &Config) -> ConfigResult<()> {
    for (field, value) in [
        ("modules.dir", config.modules.dir.as_deref()),
        ("modules.registry_file", config.modules.registry_file.as_deref()),
        ("host.data_dir", config.host.data_dir.as_deref()),
    ] {
        if value.is_some_and(|v| v.trim().is_empty()) {
            return Err(ConfigError::ValidationError {
                field: field.to_owned(),
                message: "path must not be empty; omit the key to use the default".to_owned(),
            });
        }
    }
    Ok(())
}

fn validate_bringup(config: &Config) -> ConfigResult<()> {
    if config.bringup.lifecycle_timeout_secs > MAX_LIFECYCLE_TIMEOUT_SECS {
        return Err(ConfigError::ValidationError {
            field: "bringup.lifecycle_timeout_secs".to_owned(),
            message: format!(
                "{} exceeds the {MAX_LIFECYCLE_TIMEOUT_SECS} second limit",
                config.bringup.lifecycle_timeout_secs
            ),
        });
    }
    Ok(())
}

fn validate_wasm(config: &Config) -> ConfigResult<()> {
    if config.wasm.max_memory_mb == 0 {
        return Err(ConfigError::ValidationError {
            field: "wasm.max_memory_mb".to_owned(),
            message: "must be greater than zero".to_owned(),
        });
    }
    if config.wasm.call_timeout_secs == 0 {
        return Err(ConfigError::ValidationError {
            field: "wasm.call_timeout_secs".to_owned(),
            message: "must be greater than zero".to_owned(),
        });
    }
    Ok(())
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::ValidationError {
            field: "logging.level".to_owned(),
            message: format!(
                "unsupported log level '{}'; expected one of: {}",
                config.logging.level,
                valid_levels.join(", ")
            ),
        });
    }

    let valid_formats = ["pretty", "compact", "json", "full"];
    if !valid_formats.contains(&config.logging.format.as_str()) {
        return Err(ConfigError::ValidationError {
            field: "logging.format".to_owned(),
            message: format!(
                "unsupported log format '{}'; expected one of: {}",
                config.logging.format,
                valid_formats.join(", ")
            ),
        });
    }

    Ok(())
}
