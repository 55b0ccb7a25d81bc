//! Append-only run ledger, one JSON object per line.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use lab_core::{ensure_dir, BackendKind, Metrics, RunResult, RunStatus};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, SystemTime};

const LOCK_ATTEMPTS: usize = 500;
const LOCK_RETRY: Duration = Duration::from_millis(10);
/// Writers hold the lock for one line; anything older is abandoned.
const LOCK_STALE_AFTER_SECS: i64 = 30;

/// Serializes writers inside this process. The lock file covers other
/// processes.
static WRITERS: Mutex<()> = Mutex::new(());

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    /// Fractional UNIX seconds.
    pub timestamp: f64,
    pub config_path: String,
    pub backend: BackendKind,
    pub status: RunStatus,
    pub log_path: String,
    pub results_path: String,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default)]
    pub git_commit: Option<String>,
    pub config_hash: String,
    #[serde(default)]
    pub dataset_id: Option<String>,
}

impl RunRecord {
    pub fn from_result(result: &RunResult, config_path: &str) -> Self {
        Self {
            run_id: result.run_id.clone(),
            timestamp: Utc::now().timestamp_micros() as f64 / 1e6,
            config_path: config_path.to_string(),
            backend: result.backend,
            status: result.status,
            log_path: result.log_path.display().to_string(),
            results_path: result.results_path.display().to_string(),
            metrics: result.metrics.clone(),
            git_commit: result.git_commit.clone(),
            config_hash: result.config_hash.clone(),
            dataset_id: result.dataset_id.clone(),
        }
    }
}

#[derive(Debug)]
struct RegistryLock {
    path: PathBuf,
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn try_acquire(lock_path: &Path) -> Result<Option<RegistryLock>> {
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)
    {
        Ok(mut file) => {
            let lock = RegistryLock {
                path: lock_path.to_path_buf(),
            };
            let payload = json!({
                "pid": std::process::id(),
                "acquired_at": Utc::now().to_rfc3339(),
            });
            file.write_all(format!("{payload}\n").as_bytes())?;
            Ok(Some(lock))
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(target_os = "linux")]
fn pid_alive(pid: u64) -> Option<bool> {
    let proc_root = Path::new("/proc");
    proc_root
        .is_dir()
        .then(|| proc_root.join(pid.to_string()).exists())
}

#[cfg(not(target_os = "linux"))]
fn pid_alive(_pid: u64) -> Option<bool> {
    None
}

/// A lock left by a writer that died, or one held longer than
/// [`LOCK_STALE_AFTER_SECS`]. Unreadable payloads fall back to the file's mtime.
fn lock_is_stale(text: &str, modified: Option<SystemTime>) -> bool {
    let payload: Option<Value> = serde_json::from_str(text.trim()).ok();
    let pid = payload
        .as_ref()
        .and_then(|v| v.get("pid"))
        .and_then(Value::as_u64);
    if let Some(false) = pid.and_then(pid_alive) {
        return true;
    }
    let acquired = payload
        .as_ref()
        .and_then(|v| v.get("acquired_at"))
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .or_else(|| modified.map(DateTime::<Utc>::from));
    match acquired {
        Some(t) => Utc::now().signed_duration_since(t).num_seconds() > LOCK_STALE_AFTER_SECS,
        None => false,
    }
}

fn break_stale_lock(lock_path: &Path) -> Result<bool> {
    let text = match fs::read_to_string(lock_path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(_) => String::new(),
    };
    let modified = fs::metadata(lock_path).and_then(|m| m.modified()).ok();
    if !lock_is_stale(&text, modified) {
        return Ok(false);
    }
    // Only remove the lock we judged; a fresh holder has rewritten it.
    if fs::read_to_string(lock_path).unwrap_or_default() != text {
        return Ok(false);
    }
    tracing::warn!(lock = %lock_path.display(), holder = %text.trim(), "breaking stale registry lock");
    match fs::remove_file(lock_path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn acquire_registry_lock(registry_path: &Path) -> Result<RegistryLock> {
    let mut name = registry_path.as_os_str().to_owned();
    name.push(".lock");
    let lock_path = PathBuf::from(name);
    for _ in 0..LOCK_ATTEMPTS {
        if let Some(lock) = try_acquire(&lock_path)? {
            return Ok(lock);
        }
        if break_stale_lock(&lock_path)? {
            continue;
        }
        thread::sleep(LOCK_RETRY);
    }
    Err(anyhow!(
        "registry_locked: {} is held by another writer",
        lock_path.display()
    ))
}

#[derive(Debug, Clone)]
pub struct RunRegistry {
    path: PathBuf,
}

impl RunRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add(&self, record: &RunRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            ensure_dir(parent)?;
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let _guard = WRITERS.lock().unwrap_or_else(|e| e.into_inner());
        let _lock = acquire_registry_lock(&self.path)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Every parseable record in file order. Bad lines, including ones that
    /// are not valid UTF-8, are skipped.
    pub fn list(&self) -> Result<Vec<RunRecord>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for (idx, raw) in bytes.split(|b| *b == b'\n').enumerate() {
            let line = match std::str::from_utf8(raw) {
                Ok(line) => line,
                Err(err) => {
                    tracing::warn!(
                        registry = %self.path.display(),
                        line = idx + 1,
                        error = %err,
                        "skipping non-UTF-8 registry line"
                    );
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RunRecord>(line) {
                Ok(record) => out.push(record),
                Err(err) => tracing::warn!(
                    registry = %self.path.display(),
                    line = idx + 1,
                    error = %err,
                    "skipping unreadable registry line"
                ),
            }
        }
        Ok(out)
    }

    /// The `n` newest records, newest first.
    pub fn latest(&self, n: usize) -> Result<Vec<RunRecord>> {
        let mut records = self.list()?;
        records.sort_by(|a, b| b.timestamp.total_cmp(&a.timestamp));
        records.truncate(n);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_registry(label: &str) -> (PathBuf, RunRegistry) {
        let root = std::env::temp_dir().join(format!(
            "lab_registry_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp root");
        let registry = RunRegistry::new(root.join("runs.jsonl"));
        (root, registry)
    }

    fn record(run_id: &str, timestamp: f64) -> RunRecord {
        RunRecord {
            run_id: run_id.to_string(),
            timestamp,
            config_path: "cfg.json".into(),
            backend: BackendKind::Classical,
            status: RunStatus::Ok,
            log_path: format!("logs/{run_id}.log"),
            results_path: format!("results/{run_id}"),
            metrics: Metrics::new(),
            git_commit: None,
            config_hash: "sha256:00".into(),
            dataset_id: None,
        }
    }

    #[test]
    fn missing_file_lists_nothing() {
        let (root, registry) = temp_registry("missing");
        assert!(registry.list().expect("list").is_empty());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn corrupted_line_is_skipped() {
        let (root, registry) = temp_registry("corrupt");
        registry.add(&record("a", 1.0)).expect("add a");
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(registry.path())
            .expect("open");
        file.write_all(b"{\"run_id\": \"half\n").expect("garbage");
        registry.add(&record("b", 2.0)).expect("add b");
        let ids: Vec<String> = registry
            .list()
            .expect("list")
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn latest_sorts_newest_first() {
        let (root, registry) = temp_registry("latest");
        for (id, ts) in [("old", 10.0), ("new", 30.0), ("mid", 20.0)] {
            registry.add(&record(id, ts)).expect("add");
        }
        let latest = registry.latest(2).expect("latest");
        let ids: Vec<&str> = latest.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid"]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn lock_is_released_after_each_write() {
        let (root, registry) = temp_registry("lock");
        registry.add(&record("a", 1.0)).expect("add");
        assert!(!root.join("runs.jsonl.lock").exists());
        let held = acquire_registry_lock(registry.path()).expect("lock");
        assert!(try_acquire(&root.join("runs.jsonl.lock"))
            .expect("try")
            .is_none());
        drop(held);
        registry.add(&record("b", 2.0)).expect("add after release");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn non_utf8_line_is_skipped() {
        let (root, registry) = temp_registry("utf8");
        registry.add(&record("a", 1.0)).expect("add a");
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(registry.path())
            .expect("open");
        file.write_all(b"{\"run_id\": \"\xff\xfe broken\n").expect("garbage");
        registry.add(&record("b", 2.0)).expect("add b");
        let ids: Vec<String> = registry
            .list()
            .expect("list survives invalid bytes")
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(registry.latest(1).expect("latest")[0].run_id, "b");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn abandoned_lock_is_broken_on_add() {
        let (root, registry) = temp_registry("stale");
        let lock_path = root.join("runs.jsonl.lock");
        let acquired_at =
            (Utc::now() - chrono::Duration::seconds(LOCK_STALE_AFTER_SECS + 60)).to_rfc3339();
        let payload = format!(
            "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
            std::process::id(),
            acquired_at
        );
        fs::write(&lock_path, payload).expect("stale lock");
        registry.add(&record("a", 1.0)).expect("add breaks the stale lock");
        assert!(!lock_path.exists());
        assert_eq!(registry.list().expect("list").len(), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn fresh_lock_of_a_live_writer_is_respected() {
        let payload = format!(
            "{{\"pid\":{},\"acquired_at\":\"{}\"}}",
            std::process::id(),
            Utc::now().to_rfc3339()
        );
        assert!(!lock_is_stale(&payload, None));
        assert!(!lock_is_stale("", Some(SystemTime::now())));
        assert!(lock_is_stale("", Some(SystemTime::UNIX_EPOCH)));
    }

    #[test]
    fn lock_payload_is_written_and_removed_on_drop() {
        let (root, _registry) = temp_registry("payload");
        let lock_path = root.join("runs.jsonl.lock");
        let lock = try_acquire(&lock_path)
            .expect("acquire")
            .expect("lock was free");
        let payload: Value =
            serde_json::from_str(&fs::read_to_string(&lock_path).expect("read lock"))
                .expect("payload is json");
        assert_eq!(payload["pid"], json!(std::process::id()));
        assert!(payload["acquired_at"].is_string());
        assert!(try_acquire(&lock_path).expect("second try").is_none());
        drop(lock);
        assert!(!lock_path.exists());
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn lock_of_a_dead_pid_is_stale() {
        let payload = format!(
            "{{\"pid\":{},\"acquired_at\":\"{}\"}}",
            u32::MAX,
            Utc::now().to_rfc3339()
        );
        assert!(lock_is_stale(&payload, None));
    }

    #[test]
    fn concurrent_writers_never_interleave() {
        let (root, registry) = temp_registry("concurrent");
        thread::scope(|s| {
            for t in 0..4 {
                let registry = &registry;
                s.spawn(move || {
                    for i in 0..10 {
                        registry
                            .add(&record(&format!("t{t}_{i}"), (t * 10 + i) as f64))
                            .expect("add");
                    }
                });
            }
        });
        let text = fs::read_to_string(registry.path()).expect("read");
        assert_eq!(text.lines().count(), 40);
        assert_eq!(registry.list().expect("list").len(), 40);
        let _ = fs::remove_dir_all(root);
    }
}
