//! Session Store
//!
//! Turn-bounded conversational state that outlives a single run. A session
//! is created once, continued turn by turn, and may be persisted to
//! `<sessions dir>/<id>.json` so a later process can `open` it again.
//!
//! State machine:
//!
//! ```text
//! active --continue (turn_count < max_turns)--> active (turn_count + 1)
//! active --continue (turn_count == max_turns)--> Bounds error, unchanged
//! active --archive--> archived (continue rejected)
//! ```
//!
//! Session checkpoints are separate from run checkpoints: they snapshot
//! conversational context, not pipeline progress.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use super::checkpoint::write_atomic;

pub const DEFAULT_MAX_TURNS: u32 = 20;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session '{0}' not found")]
    NotFound(String),

    #[error("session '{id}' reached its limit of {max_turns} turns")]
    Bounds { id: String, max_turns: u32 },

    #[error("session '{0}' is archived")]
    Archived(String),

    #[error("session '{0}' has no turn awaiting a response")]
    NoPendingTurn(String),

    #[error("session I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("session file {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Archived,
}

/// One prompt and (once recorded) its response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub turn: u32,
    pub prompt: String,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub cost: f64,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot of conversational context at a given turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCheckpoint {
    pub turn: u32,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub persisted: bool,
    pub status: SessionStatus,
    pub max_turns: u32,
    pub turn_count: u32,
    /// Take a session checkpoint every N completed turns.
    #[serde(default)]
    pub checkpoint_interval: Option<u32>,
    #[serde(default)]
    pub interactions: Vec<Interaction>,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default)]
    pub checkpoints: Vec<SessionCheckpoint>,
}

impl Session {
    pub fn remaining_turns(&self) -> u32 {
        self.max_turns.saturating_sub(self.turn_count)
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Completed prompt/response pairs in turn order.
    pub fn history(&self) -> impl Iterator<Item = (&str, &str)> {
        self.interactions
            .iter()
            .filter_map(|i| i.response.as_deref().map(|r| (i.prompt.as_str(), r)))
    }

    fn snapshot(&self) -> Value {
        json!({
            "turn_count": self.turn_count,
            "total_cost": self.total_cost,
            "interactions": self.interactions,
        })
    }
}

/// Options for [`SessionStore::create`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOptions {
    #[serde(default)]
    pub persist: bool,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default)]
    pub checkpoint_interval: Option<u32>,
}

fn default_max_turns() -> u32 {
    DEFAULT_MAX_TURNS
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            persist: false,
            max_turns: DEFAULT_MAX_TURNS,
            checkpoint_interval: None,
        }
    }
}

impl SessionOptions {
    pub fn persisted(mut self) -> Self {
        self.persist = true;
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: u32) -> Self {
        self.checkpoint_interval = Some(interval).filter(|n| *n > 0);
        self
    }
}

/// Returned by a successful [`SessionStore::continue_session`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnOutcome {
    pub turn_count: u32,
    pub status: SessionStatus,
    pub remaining: u32,
}

/// Keyed session storage, optionally backed by a directory.
#[derive(Debug, Default)]
pub struct SessionStore {
    dir: Option<PathBuf>,
    sessions: HashMap<String, Session>,
}

impl SessionStore {
    /// Store that persists sessions created with `persist: true` under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            sessions: HashMap::new(),
        }
    }

    /// Store that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn create(&mut self, name: &str, options: SessionOptions) -> Result<&Session, SessionError> {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: now,
            updated_at: now,
            persisted: options.persist && self.dir.is_some(),
            status: SessionStatus::Active,
            max_turns: options.max_turns,
            turn_count: 0,
            checkpoint_interval: options.checkpoint_interval.filter(|n| *n > 0),
            interactions: Vec::new(),
            total_cost: 0.0,
            checkpoints: Vec::new(),
        };
        if options.persist && self.dir.is_none() {
            warn!("Session '{}' requested persistence but no session directory is configured", name);
        }
        info!(
            "Created session '{}' ({}) with max {} turns",
            name, session.id, session.max_turns
        );
        let id = session.id.clone();
        self.persist(&session)?;
        Ok(self.sessions.entry(id).or_insert(session))
    }

    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// Returns a session, loading it from the session directory if needed.
    pub fn open(&mut self, id: &str) -> Result<&Session, SessionError> {
        if !self.sessions.contains_key(id) {
            let path = self
                .session_path(id)
                .filter(|p| p.exists())
                .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
            let session = Self::read(&path)?;
            debug!("Loaded session '{}' from {}", id, path.display());
            self.sessions.insert(id.to_string(), session);
        }
        self.sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Newest active session named `name`, searching memory then disk.
    pub fn find_by_name(&mut self, name: &str) -> Result<Option<&Session>, SessionError> {
        let mut candidates: Vec<(DateTime<Utc>, String)> = self
            .sessions
            .values()
            .filter(|s| s.name == name && s.is_active())
            .map(|s| (s.created_at, s.id.clone()))
            .collect();

        if candidates.is_empty() {
            for session in self.read_persisted()? {
                if session.name == name && session.is_active() {
                    candidates.push((session.created_at, session.id.clone()));
                    self.sessions.entry(session.id.clone()).or_insert(session);
                }
            }
        }

        candidates.sort();
        Ok(candidates.pop().and_then(|(_, id)| self.sessions.get(&id)))
    }

    /// Starts the next turn with `prompt`.
    ///
    /// Fails without changing the session when it is archived or already
    /// at `max_turns`.
    pub fn continue_session(&mut self, id: &str, prompt: &str) -> Result<TurnOutcome, SessionError> {
        let session = self.open_mut(id)?;

        if !session.is_active() {
            return Err(SessionError::Archived(id.to_string()));
        }
        if session.turn_count >= session.max_turns {
            warn!(
                "Session '{}' is at its turn limit ({}/{})",
                id, session.turn_count, session.max_turns
            );
            return Err(SessionError::Bounds {
                id: id.to_string(),
                max_turns: session.max_turns,
            });
        }

        // Advance a copy; the stored session only moves once it is on disk.
        let mut advanced = session.clone();
        advanced.turn_count += 1;
        advanced.updated_at = Utc::now();
        advanced.interactions.push(Interaction {
            turn: advanced.turn_count,
            prompt: prompt.to_string(),
            response: None,
            cost: 0.0,
            timestamp: advanced.updated_at,
        });
        let outcome = TurnOutcome {
            turn_count: advanced.turn_count,
            status: advanced.status,
            remaining: advanced.remaining_turns(),
        };

        self.persist(&advanced)?;
        debug!("Session '{}' turn {}/{}", id, outcome.turn_count, advanced.max_turns);
        self.sessions.insert(id.to_string(), advanced);
        Ok(outcome)
    }

    /// Completes the latest turn with the model's response and cost.
    ///
    /// Takes an automatic session checkpoint when the turn count reaches a
    /// multiple of the session's `checkpoint_interval`.
    pub fn record_response(&mut self, id: &str, response: &str, cost: f64) -> Result<&Session, SessionError> {
        let session = self.open_mut(id)?;
        let pending = session
            .interactions
            .last_mut()
            .filter(|i| i.response.is_none())
            .ok_or_else(|| SessionError::NoPendingTurn(id.to_string()))?;

        pending.response = Some(response.to_string());
        pending.cost = cost;
        session.total_cost += cost;
        session.updated_at = Utc::now();

        let due = session
            .checkpoint_interval
            .map(|n| session.turn_count % n == 0)
            .unwrap_or(false);
        if due {
            let data = session.snapshot();
            session.checkpoints.push(SessionCheckpoint {
                turn: session.turn_count,
                data,
                timestamp: Utc::now(),
            });
            debug!("Automatic checkpoint for session '{}' at turn {}", id, session.turn_count);
        }

        let snapshot = session.clone();
        self.persist(&snapshot)?;
        self.sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Records a caller-supplied session checkpoint; returns how many the
    /// session now has.
    pub fn checkpoint(&mut self, id: &str, data: Value) -> Result<usize, SessionError> {
        let session = self.open_mut(id)?;
        session.checkpoints.push(SessionCheckpoint {
            turn: session.turn_count,
            data,
            timestamp: Utc::now(),
        });
        session.updated_at = Utc::now();
        let count = session.checkpoints.len();
        let snapshot = session.clone();
        self.persist(&snapshot)?;
        info!("Session '{}' checkpoint {} saved", id, count);
        Ok(count)
    }

    pub fn archive(&mut self, id: &str) -> Result<(), SessionError> {
        let session = self.open_mut(id)?;
        session.status = SessionStatus::Archived;
        session.updated_at = Utc::now();
        let snapshot = session.clone();
        self.persist(&snapshot)?;
        info!("Session '{}' archived", id);
        Ok(())
    }

    /// Sessions currently loaded, oldest first.
    pub fn list(&self) -> Vec<&Session> {
        let mut sessions: Vec<&Session> = self.sessions.values().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    fn open_mut(&mut self, id: &str) -> Result<&mut Session, SessionError> {
        self.open(id)?;
        self.sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    fn session_path(&self, id: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(format!("{}.json", id)))
    }

    fn persist(&self, session: &Session) -> Result<(), SessionError> {
        if !session.persisted {
            return Ok(());
        }
        let (Some(dir), Some(path)) = (&self.dir, self.session_path(&session.id)) else {
            return Ok(());
        };
        let io_err = |source| SessionError::Io {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(dir).map_err(io_err)?;
        let content = serde_json::to_string_pretty(session).map_err(|e| SessionError::Corrupt {
            path: path.clone(),
            message: e.to_string(),
        })?;
        write_atomic(&path, &content).map_err(io_err)
    }

    fn read(path: &Path) -> Result<Session, SessionError> {
        let content = fs::read_to_string(path).map_err(|source| SessionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|e| SessionError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    fn read_persisted(&self) -> Result<Vec<Session>, SessionError> {
        let Some(dir) = self.dir.as_ref().filter(|d| d.exists()) else {
            return Ok(Vec::new());
        };
        let entries = fs::read_dir(dir).map_err(|source| SessionError::Io {
            path: dir.clone(),
            source,
        })?;
        let mut sessions = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path) {
                Ok(session) => sessions.push(session),
                Err(e) => warn!("Ignoring unreadable session file: {}", e),
            }
        }
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_continue() {
        let mut store = SessionStore::in_memory();
        let id = store.create("chat", SessionOptions::default().with_max_turns(3)).unwrap().id.clone();

        let outcome = store.continue_session(&id, "hello").unwrap();
        assert_eq!(outcome.turn_count, 1);
        assert_eq!(outcome.status, SessionStatus::Active);
        assert_eq!(outcome.remaining, 2);

        let session = store.get(&id).unwrap();
        assert_eq!(session.interactions.len(), 1);
        assert_eq!(session.interactions[0].prompt, "hello");
    }

    #[test]
    fn test_bounds_error_does_not_increment() {
        let mut store = SessionStore::in_memory();
        let id = store.create("chat", SessionOptions::default().with_max_turns(2)).unwrap().id.clone();
        store.continue_session(&id, "one").unwrap();
        store.continue_session(&id, "two").unwrap();

        let err = store.continue_session(&id, "three").unwrap_err();
        assert!(matches!(err, SessionError::Bounds { max_turns: 2, .. }));

        let session = store.get(&id).unwrap();
        assert_eq!(session.turn_count, 2);
        assert_eq!(session.interactions.len(), 2);
    }

    #[test]
    fn test_zero_turn_session_rejects_first_continue() {
        let mut store = SessionStore::in_memory();
        let id = store.create("none", SessionOptions::default().with_max_turns(0)).unwrap().id.clone();
        assert!(matches!(
            store.continue_session(&id, "hi"),
            Err(SessionError::Bounds { .. })
        ));
    }

    #[test]
    fn test_record_response_and_auto_checkpoint() {
        let mut store = SessionStore::in_memory();
        let options = SessionOptions::default().with_checkpoint_interval(2);
        let id = store.create("chat", options).unwrap().id.clone();

        store.continue_session(&id, "q1").unwrap();
        let session = store.record_response(&id, "a1", 0.5).unwrap();
        assert!(session.checkpoints.is_empty());

        store.continue_session(&id, "q2").unwrap();
        let session = store.record_response(&id, "a2", 0.25).unwrap();
        assert_eq!(session.checkpoints.len(), 1);
        assert_eq!(session.checkpoints[0].turn, 2);
        assert!((session.total_cost - 0.75).abs() < f64::EPSILON);

        let history: Vec<_> = session.history().collect();
        assert_eq!(history, vec![("q1", "a1"), ("q2", "a2")]);

        assert!(matches!(
            store.record_response(&id, "extra", 0.0),
            Err(SessionError::NoPendingTurn(_))
        ));
    }

    #[test]
    fn test_manual_checkpoint_and_archive() {
        let mut store = SessionStore::in_memory();
        let id = store.create("chat", SessionOptions::default()).unwrap().id.clone();

        assert_eq!(store.checkpoint(&id, json!({"note": "before archive"})).unwrap(), 1);
        store.archive(&id).unwrap();

        assert!(matches!(
            store.continue_session(&id, "hi"),
            Err(SessionError::Archived(_))
        ));
        assert_eq!(store.get(&id).unwrap().turn_count, 0);
    }

    #[test]
    fn test_unknown_session() {
        let mut store = SessionStore::in_memory();
        assert!(matches!(
            store.continue_session("nope", "hi"),
            Err(SessionError::NotFound(_))
        ));
    }

    #[test]
    fn test_persisted_session_survives_store() {
        let dir = tempdir().unwrap();
        let id = {
            let mut store = SessionStore::new(dir.path());
            let id = store.create("notes", SessionOptions::default().persisted()).unwrap().id.clone();
            store.continue_session(&id, "remember this").unwrap();
            store.record_response(&id, "noted", 0.1).unwrap();
            id
        };
        assert!(dir.path().join(format!("{}.json", id)).exists());

        let mut store = SessionStore::new(dir.path());
        let session = store.open(&id).unwrap();
        assert_eq!(session.turn_count, 1);
        assert_eq!(session.interactions[0].response.as_deref(), Some("noted"));

        let found = store.find_by_name("notes").unwrap().unwrap();
        assert_eq!(found.id, id);
    }

    #[test]
    fn test_failed_write_leaves_turn_unchanged() {
        let dir = tempdir().unwrap();
        let sessions_dir = dir.path().join("sessions");
        let mut store = SessionStore::new(&sessions_dir);
        let id = store.create("notes", SessionOptions::default().persisted()).unwrap().id.clone();

        fs::remove_dir_all(&sessions_dir).unwrap();
        fs::write(&sessions_dir, "not a directory").unwrap();

        let err = store.continue_session(&id, "lost").unwrap_err();
        assert!(matches!(err, SessionError::Io { .. }));
        let session = store.get(&id).unwrap();
        assert_eq!(session.turn_count, 0);
        assert!(session.interactions.is_empty());
    }

    #[test]
    fn test_find_by_name_reads_disk() {
        let dir = tempdir().unwrap();
        let id = SessionStore::new(dir.path())
            .create("digest", SessionOptions::default().persisted())
            .unwrap()
            .id
            .clone();

        let mut fresh = SessionStore::new(dir.path());
        assert_eq!(fresh.find_by_name("digest").unwrap().map(|s| s.id.clone()), Some(id));
        assert!(fresh.find_by_name("other").unwrap().is_none());
    }

    #[test]
    fn test_non_persisted_sessions_stay_in_memory() {
        let dir = tempdir().unwrap();
        let mut store = SessionStore::new(dir.path());
        store.create("scratch", SessionOptions::default()).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        assert_eq!(store.list().len(), 1);
    }
}
