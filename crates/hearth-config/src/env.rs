//! Environment variable fallbacks and `${VAR}` reference resolution.
//!
//! Environment variables are a fallback, never an override: they only fill
//! fields that no config file set.

use std::collections::HashMap;
use std::fmt::Write as _;

use tracing::debug;

use crate::merge::{ConfigLayer, FieldSources};

/// How an env var value is coerced before insertion.
#[derive(Clone, Copy)]
enum ValueKind {
    Str,
    Int,
    Bool,
}

struct EnvMapping {
    var_name: &'static str,
    field_path: &'static str,
    kind: ValueKind,
}

const ENV_MAPPINGS: &[EnvMapping] = &[
    EnvMapping {
        var_name: "HEARTH_HOST_VERSION",
        field_path: "host.version",
        kind: ValueKind::Str,
    },
    EnvMapping {
        var_name: "HEARTH_DATA_DIR",
        field_path: "host.data_dir",
        kind: ValueKind::Str,
    },
    EnvMapping {
        var_name: "HEARTH_MODULES_DIR",
        field_path: "modules.dir",
        kind: ValueKind::Str,
    },
    EnvMapping {
        var_name: "HEARTH_REGISTRY_FILE",
        field_path: "modules.registry_file",
        kind: ValueKind::Str,
    },
    EnvMapping {
        var_name: "HEARTH_LIFECYCLE_TIMEOUT_SECS",
        field_path: "bringup.lifecycle_timeout_secs",
        kind: ValueKind::Int,
    },
    EnvMapping {
        var_name: "HEARTH_ABORT_ON_COMPAT_ERRORS",
        field_path: "bringup.abort_on_compat_errors",
        kind: ValueKind::Bool,
    },
    EnvMapping {
        var_name: "HEARTH_LOG_LEVEL",
        field_path: "logging.level",
        kind: ValueKind::Str,
    },
    EnvMapping {
        var_name: "HEARTH_LOG_FORMAT",
        field_path: "logging.format",
        kind: ValueKind::Str,
    },
];

/// Apply environment variable fallbacks to fields that no config file set.
///
/// Fields that only carry an embedded default still accept the fallback.
/// Returns the number of env vars applied.
pub fn apply_env_fallbacks<S: ::std::hash::BuildHasher>(
    merged: &mut toml::Value,
    sources: &mut FieldSources,
    env_vars: &HashMap<String, String, S>,
) -> usize {
    let mut count: usize = 0;

    for mapping in ENV_MAPPINGS {
        let set_by_file = sources
            .get(mapping.field_path)
            .is_some_and(|layer| *layer != ConfigLayer::Defaults);
        if set_by_file {
            continue;
        }

        if let Some(val) = env_vars.get(mapping.var_name) {
            debug!(
                var = mapping.var_name,
                field = mapping.field_path,
                "applying env var fallback"
            );
            set_field(merged, mapping.field_path, coerce(mapping.kind, val));
            sources.insert(mapping.field_path.to_owned(), ConfigLayer::Environment);
            count = count.saturating_add(1);
        }
    }

    count
}

/// Resolve `${VAR}` references within string values of the tree.
///
/// References that don't resolve are left as-is.
pub fn resolve_env_references<S: ::std::hash::BuildHasher>(
    val: &mut toml::Value,
    env_vars: &HashMap<String, String, S>,
) {
    match val {
        toml::Value::String(s) => {
            *s = resolve_string_refs(s, env_vars);
        },
        toml::Value::Table(table) => {
            for (_, child) in table.iter_mut() {
                resolve_env_references(child, env_vars);
            }
        },
        toml::Value::Array(arr) => {
            for child in arr.iter_mut() {
                resolve_env_references(child, env_vars);
            }
        },
        _ => {},
    }
}

fn resolve_string_refs<S: ::std::hash::BuildHasher>(
    input: &str,
    env_vars: &HashMap<String, String, S>,
) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' || chars.peek() != Some(&'{') {
            result.push(ch);
            continue;
        }
        chars.next();

        let mut var_name = String::new();
        let mut closed = false;
        for ch in chars.by_ref() {
            if ch == '}' {
                closed = true;
                break;
            }
            var_name.push(ch);
        }

        match env_vars.get(&var_name) {
            Some(val) if closed && !var_name.is_empty() => result.push_str(val),
            _ if closed => {
                debug!(var = var_name, "unresolved env var reference in config");
                let _ = write!(result, "${{{var_name}}}");
            },
            _ => {
                result.push_str("${");
                result.push_str(&var_name);
            },
        }
    }

    result
}

fn coerce(kind: ValueKind, val: &str) -> toml::Value {
    match kind {
        ValueKind::Int => val
            .parse::<i64>()
            .map_or_else(|_| toml::Value::String(val.to_owned()), toml::Value::Integer),
        ValueKind::Bool => val
            .parse::<bool>()
            .map_or_else(|_| toml::Value::String(val.to_owned()), toml::Value::Boolean),
        ValueKind::Str => toml::Value::String(val.to_owned()),
    }
}

/// Set a dotted-path field, creating intermediate tables as needed.
fn set_field(root: &mut toml::Value, path: &str, value: toml::Value) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(leaf) = segments.pop() else {
        return;
    };

    let mut current = root;
    for segment in segments {
        let Some(table) = current.as_table_mut() else {
            return;
        };
        current = table
            .entry(segment)
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }

    if let Some(table) = current.as_table_mut() {
        table.insert(leaf.to_owned(), value);
    }
}

/// Collect all current environment variables into a map.
#[must_use]
pub fn collect_env_vars() -> HashMap<String, String> {
    std::env::vars().collect()
}
