//! Checkpoint Store
//!
//! Durable snapshots of execution progress. Every save writes a new dated
//! file and refreshes a `<workflow>_latest.json` alias so resume never has
//! to scan the directory:
//!
//! ```text
//! checkpoints/
//!   research_20240301_101500_123456.json
//!   research_20240301_101512_654321.json
//!   research_latest.json        <- copy of the newest
//! ```
//!
//! Both files are written to a temporary name and renamed into place, so
//! a crash mid-write never leaves a truncated checkpoint behind.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::results::ResultStore;
use crate::monitoring::ExecutionLog;

/// Current checkpoint document version.
pub const CHECKPOINT_VERSION: u32 = 1;

const LATEST_SUFFIX: &str = "_latest.json";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("checkpoint {path} has unsupported version {version}")]
    UnsupportedVersion { path: PathBuf, version: u32 },

    #[error("checkpoint {0} not found")]
    NotFound(PathBuf),
}

impl CheckpointError {
    /// True when the checkpoint exists but cannot be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupt { .. } | Self::UnsupportedVersion { .. })
    }
}

/// A versioned snapshot of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub workflow_name: String,
    /// Index of the first step that has not completed.
    pub step_index: usize,
    pub results: ResultStore,
    pub execution_log: ExecutionLog,
    /// Encoded variables (see [`codec`](super::codec)).
    #[serde(default)]
    pub variable_state: Value,
    /// Ids of sessions referenced during the run.
    #[serde(default)]
    pub sessions: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(workflow_name: impl Into<String>, step_index: usize, results: ResultStore) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            workflow_name: workflow_name.into(),
            step_index,
            results,
            execution_log: ExecutionLog::new(),
            variable_state: Value::Null,
            sessions: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_log(mut self, log: ExecutionLog) -> Self {
        self.execution_log = log;
        self
    }

    pub fn with_variable_state(mut self, state: Value) -> Self {
        self.variable_state = state;
        self
    }

    pub fn with_sessions(mut self, sessions: Vec<String>) -> Self {
        self.sessions = sessions;
        self
    }
}

/// Listing entry for a dated checkpoint file.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointInfo {
    pub filename: String,
    pub path: PathBuf,
    pub step_index: usize,
    pub timestamp: DateTime<Utc>,
}

/// Directory-backed checkpoint store.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

/// Replaces characters that are unsafe in file names.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "workflow".to_string()
    } else {
        cleaned
    }
}

/// True for `<prefix>YYYYMMDD_...json` names belonging to one workflow.
fn is_dated_file(filename: &str, prefix: &str) -> bool {
    let Some(rest) = filename.strip_prefix(prefix) else {
        return false;
    };
    if !filename.ends_with(".json") || filename.ends_with(LATEST_SUFFIX) {
        return false;
    }
    let bytes = rest.as_bytes();
    bytes.len() > 9 && bytes[..8].iter().all(u8::is_ascii_digit) && bytes[8] == b'_'
}

/// Writes `content` to a temporary sibling and renames it over `path`.
pub(crate) fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the alias that mirrors the newest checkpoint.
    pub fn latest_path(&self, workflow: &str) -> PathBuf {
        self.dir.join(format!("{}{}", sanitize_name(workflow), LATEST_SUFFIX))
    }

    /// Writes a new dated checkpoint and refreshes the latest alias.
    ///
    /// Returns the path of the dated file.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf, CheckpointError> {
        fs::create_dir_all(&self.dir).map_err(|source| CheckpointError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let stem = format!(
            "{}_{}",
            sanitize_name(&checkpoint.workflow_name),
            checkpoint.timestamp.format("%Y%m%d_%H%M%S_%6f")
        );
        let mut path = self.dir.join(format!("{}.json", stem));
        let mut attempt = 1;
        while path.exists() {
            path = self.dir.join(format!("{}_{}.json", stem, attempt));
            attempt += 1;
        }

        let content = serde_json::to_string_pretty(checkpoint).map_err(|e| CheckpointError::Corrupt {
            path: path.clone(),
            message: e.to_string(),
        })?;

        let latest = self.latest_path(&checkpoint.workflow_name);
        for target in [&path, &latest] {
            write_atomic(target, &content).map_err(|source| CheckpointError::Io {
                path: target.clone(),
                source,
            })?;
        }

        info!(
            "Checkpoint saved for '{}' at step {} ({})",
            checkpoint.workflow_name,
            checkpoint.step_index,
            path.display()
        );
        Ok(path)
    }

    /// Loads the newest checkpoint for `workflow`.
    ///
    /// A missing checkpoint is `Ok(None)`; an unreadable one is an error.
    pub fn load_latest(&self, workflow: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.latest_path(workflow);
        if !path.exists() {
            debug!("No checkpoint found for '{}'", workflow);
            return Ok(None);
        }
        Self::read(&path).map(Some)
    }

    /// Loads a specific checkpoint file from the store directory.
    pub fn load(&self, filename: &str) -> Result<Checkpoint, CheckpointError> {
        let path = self.dir.join(filename);
        if !path.exists() {
            return Err(CheckpointError::NotFound(path));
        }
        Self::read(&path)
    }

    fn read(path: &Path) -> Result<Checkpoint, CheckpointError> {
        let content = fs::read_to_string(path).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: Value = serde_json::from_str(&content).map_err(|e| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let version = raw.get("version").and_then(Value::as_u64).unwrap_or(0) as u32;
        if version != CHECKPOINT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                path: path.to_path_buf(),
                version,
            });
        }

        serde_json::from_value(raw).map_err(|e| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Dated checkpoints for `workflow`, newest first. The alias is not listed.
    pub fn list(&self, workflow: &str) -> Result<Vec<CheckpointInfo>, CheckpointError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let prefix = format!("{}_", sanitize_name(workflow));
        let entries = fs::read_dir(&self.dir).map_err(|source| CheckpointError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut infos = Vec::new();
        for entry in entries.flatten() {
            let filename = entry.file_name().to_string_lossy().to_string();
            if !is_dated_file(&filename, &prefix) {
                continue;
            }
            match Self::read(&entry.path()) {
                Ok(checkpoint) => infos.push(CheckpointInfo {
                    filename,
                    path: entry.path(),
                    step_index: checkpoint.step_index,
                    timestamp: checkpoint.timestamp,
                }),
                Err(e) => warn!("Skipping unreadable checkpoint {}: {}", filename, e),
            }
        }

        infos.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.filename.cmp(&a.filename)));
        Ok(infos)
    }

    /// Deletes all but the `keep_n` newest dated checkpoints.
    ///
    /// Returns the number of files removed. The alias is never touched.
    pub fn prune(&self, workflow: &str, keep_n: usize) -> Result<usize, CheckpointError> {
        let stale: Vec<CheckpointInfo> = self.list(workflow)?.into_iter().skip(keep_n).collect();
        for info in &stale {
            fs::remove_file(&info.path).map_err(|source| CheckpointError::Io {
                path: info.path.clone(),
                source,
            })?;
            debug!("Pruned checkpoint {}", info.filename);
        }
        if !stale.is_empty() {
            info!("Pruned {} checkpoint(s) for '{}'", stale.len(), workflow);
        }
        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::EventType;
    use serde_json::json;
    use tempfile::tempdir;

    fn checkpoint(step_index: usize) -> Checkpoint {
        let mut results = ResultStore::new();
        results.store("a", json!({"value": step_index}));
        let mut log = ExecutionLog::new();
        log.record("a", Some("set"), Some(0), EventType::Completed, None);
        Checkpoint::new("research", step_index, results)
            .with_log(log)
            .with_variable_state(json!({"topic": {"kind": "value", "value": "rust"}}))
    }

    #[test]
    fn test_save_and_load_latest() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        let saved = checkpoint(1);
        let path = store.save(&saved).unwrap();
        assert!(path.exists());
        assert!(store.latest_path("research").exists());

        let loaded = store.load_latest("research").unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(loaded.results, saved.results);
    }

    #[test]
    fn test_latest_tracks_newest() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(&checkpoint(1)).unwrap();
        store.save(&checkpoint(2)).unwrap();

        assert_eq!(store.load_latest("research").unwrap().unwrap().step_index, 2);
        assert_eq!(store.list("research").unwrap().len(), 2);
    }

    #[test]
    fn test_missing_is_none() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("never-created"));
        assert!(store.load_latest("research").unwrap().is_none());
        assert!(store.list("research").unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_latest_is_error() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        fs::write(store.latest_path("research"), "{ not json").unwrap();

        let err = store.load_latest("research").unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_unknown_version_is_corruption() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut doc = serde_json::to_value(checkpoint(1)).unwrap();
        doc["version"] = json!(99);
        fs::write(store.latest_path("research"), doc.to_string()).unwrap();

        let err = store.load_latest("research").unwrap_err();
        assert!(matches!(err, CheckpointError::UnsupportedVersion { version: 99, .. }));
    }

    #[test]
    fn test_load_by_filename() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let path = store.save(&checkpoint(3)).unwrap();
        let filename = path.file_name().unwrap().to_str().unwrap();

        assert_eq!(store.load(filename).unwrap().step_index, 3);
        assert!(matches!(store.load("nope.json"), Err(CheckpointError::NotFound(_))));
    }

    #[test]
    fn test_prune_then_save_leaves_two_dated_files() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(&checkpoint(1)).unwrap();

        assert_eq!(store.prune("research", 1).unwrap(), 0);
        store.save(&checkpoint(2)).unwrap();

        let dated = store.list("research").unwrap();
        assert_eq!(dated.len(), 2);
        assert!(store.latest_path("research").exists());
        let files = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 3);
    }

    #[test]
    fn test_prune_keeps_newest() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        for i in 0..4 {
            store.save(&checkpoint(i)).unwrap();
        }

        assert_eq!(store.prune("research", 2).unwrap(), 2);
        let remaining: Vec<usize> = store.list("research").unwrap().iter().map(|c| c.step_index).collect();
        assert_eq!(remaining, vec![3, 2]);
        assert_eq!(store.load_latest("research").unwrap().unwrap().step_index, 3);
    }

    #[test]
    fn test_workflows_do_not_share_listings() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(&checkpoint(1)).unwrap();
        let mut other = checkpoint(1);
        other.workflow_name = "research_v2".into();
        store.save(&other).unwrap();

        assert_eq!(store.list("research").unwrap().len(), 1);
        assert_eq!(store.list("research_v2").unwrap().len(), 1);
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("my flow/v2"), "my_flow_v2");
        assert_eq!(sanitize_name("  "), "workflow");
    }
}
