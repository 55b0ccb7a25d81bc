//! Where a run came from: config hash, source revision and runner version,
//! written next to the run's other artifacts as `provenance.json`.

use anyhow::Result;
use chrono::Utc;
use lab_core::{atomic_write_json_pretty, ensure_dir};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const PROVENANCE_SCHEMA: &str = "provenance_v1";
pub const PROVENANCE_FILE: &str = "provenance.json";
pub const RUNNER_VERSION: &str = concat!("rust-", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub schema_version: String,
    pub run_id: String,
    pub config_hash: String,
    pub git_commit: Option<String>,
    pub runner_version: String,
    pub created_at: String,
}

pub fn default_provenance(run_id: &str, config_hash: &str, git_commit: Option<String>) -> Provenance {
    Provenance {
        schema_version: PROVENANCE_SCHEMA.to_string(),
        run_id: run_id.to_string(),
        config_hash: config_hash.to_string(),
        git_commit,
        runner_version: RUNNER_VERSION.to_string(),
        created_at: Utc::now().to_rfc3339(),
    }
}

pub fn write_provenance(result_dir: &Path, record: &Provenance) -> Result<PathBuf> {
    ensure_dir(result_dir)?;
    let path = result_dir.join(PROVENANCE_FILE);
    atomic_write_json_pretty(&path, &serde_json::to_value(record)?)?;
    Ok(path)
}

/// Commit checked out in the repository containing `start`, read straight
/// from the `.git` metadata. `None` outside a repository or when HEAD cannot
/// be resolved.
pub fn git_commit(start: &Path) -> Option<String> {
    let start = start
        .canonicalize()
        .unwrap_or_else(|_| start.to_path_buf());
    let git_dir = find_git_dir(&start)?;
    let head = fs::read_to_string(git_dir.join("HEAD")).ok()?;
    let head = head.trim();
    let commit = match head.strip_prefix("ref:") {
        Some(name) => resolve_ref(&git_dir, name.trim()),
        None if is_object_id(head) => Some(head.to_string()),
        None => None,
    };
    if commit.is_none() {
        tracing::debug!(git_dir = %git_dir.display(), "HEAD did not resolve to a commit");
    }
    commit
}

fn find_git_dir(start: &Path) -> Option<PathBuf> {
    for dir in start.ancestors() {
        let dot_git = dir.join(".git");
        if dot_git.is_dir() {
            return Some(dot_git);
        }
        if dot_git.is_file() {
            let text = fs::read_to_string(&dot_git).ok()?;
            let target = PathBuf::from(text.trim().strip_prefix("gitdir:")?.trim());
            return Some(if target.is_absolute() {
                target
            } else {
                dir.join(target)
            });
        }
    }
    None
}

/// Linked worktrees keep shared refs in the directory named by `commondir`.
fn ref_stores(git_dir: &Path) -> Vec<PathBuf> {
    let mut stores = vec![git_dir.to_path_buf()];
    if let Ok(common) = fs::read_to_string(git_dir.join("commondir")) {
        let common = PathBuf::from(common.trim());
        stores.push(if common.is_absolute() {
            common
        } else {
            git_dir.join(common)
        });
    }
    stores
}

fn resolve_ref(git_dir: &Path, name: &str) -> Option<String> {
    for store in ref_stores(git_dir) {
        if let Ok(text) = fs::read_to_string(store.join(name)) {
            let id = text.trim();
            if is_object_id(id) {
                return Some(id.to_string());
            }
        }
        if let Ok(packed) = fs::read_to_string(store.join("packed-refs")) {
            let hit = packed
                .lines()
                .filter(|l| !l.starts_with('#') && !l.starts_with('^'))
                .filter_map(|l| l.split_once(' '))
                .find(|(_, r)| r.trim() == name)
                .map(|(id, _)| id.to_string());
            if let Some(id) = hit.filter(|id| is_object_id(id)) {
                return Some(id);
            }
        }
    }
    None
}

fn is_object_id(s: &str) -> bool {
    matches!(s.len(), 40 | 64) && s.chars().all(|c| c.is_ascii_hexdigit())
}
