//! Shared data model and file primitives for the pattern-transfer lab.
//!
//! Every other crate in the workspace speaks in these types: the run
//! configuration, the result a backend hands back to the dispatcher, the
//! channel-keyed timeseries and the pattern-state snapshot. The helpers at the
//! bottom of this file are the only place that knows how artifacts hit disk.

pub mod config;
pub mod pattern;
pub mod result;
pub mod timeseries;

pub use config::{
    AgentConfig, BackendKind, ConfigError, EnsembleConfig, EnsembleMode, ExecutorConfig,
    ExecutorKind, HybridConfig, QuantumConfig, RunConfig, Substrate, WorldConfig,
};
pub use pattern::{Matrix, PatternState};
pub use result::{Metrics, RunResult, RunStatus};
pub use timeseries::{Timeseries, TimeseriesError};

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;

/// Creates `path` and its parents. Existing directories are fine.
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Hex SHA-256 of `bytes` without any prefix.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// `sha256:`-prefixed digest, the form stored in manifests and records.
pub fn sha256_bytes(bytes: &[u8]) -> String {
    format!("sha256:{}", sha256_hex(bytes))
}

/// First `len` hex characters of the SHA-256 of `input`.
pub fn short_digest(input: &str, len: usize) -> String {
    let mut full = sha256_hex(input.as_bytes());
    full.truncate(len.min(full.len()));
    full
}

/// Serializes `value` with object keys sorted at every depth and no
/// insignificant whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

pub fn canonical_json_digest(value: &Value) -> String {
    sha256_bytes(canonical_json(value).as_bytes())
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Appends `line` plus a newline in a single write.
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let mut buf = String::with_capacity(line.len() + 1);
    buf.push_str(line);
    buf.push('\n');
    file.write_all(buf.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let a = json!({"b": 1, "a": {"z": [1, {"y": 2, "x": 3}], "c": null}});
        assert_eq!(
            canonical_json(&a),
            r#"{"a":{"c":null,"z":[1,{"x":3,"y":2}]},"b":1}"#
        );
    }

    #[test]
    fn canonical_digest_ignores_key_order() {
        let a = json!({"seed": 1, "horizon": 10});
        let b = json!({"horizon": 10, "seed": 1});
        assert_eq!(canonical_json_digest(&a), canonical_json_digest(&b));
        assert!(canonical_json_digest(&a).starts_with("sha256:"));
    }

    #[test]
    fn short_digest_is_fixed_length_hex() {
        let d = short_digest("cfg.json-42-classical-1", 12);
        assert_eq!(d.len(), 12);
        assert!(d.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(d, short_digest("cfg.json-42-classical-2", 12));
    }

    #[test]
    fn append_line_accumulates_lines() {
        let root = std::env::temp_dir().join(format!(
            "lab_core_append_test_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let path = root.join("nested").join("ledger.jsonl");
        append_line(&path, "{\"a\":1}").expect("first append");
        append_line(&path, "{\"a\":2}").expect("second append");
        let text = fs::read_to_string(&path).expect("read ledger");
        assert_eq!(text, "{\"a\":1}\n{\"a\":2}\n");
        let _ = fs::remove_dir_all(root);
    }
}
