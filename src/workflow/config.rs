//! Run Configuration
//!
//! Resolves directories, the checkpoint flag and provider timeouts with a
//! fixed precedence: explicit run option, then the value declared in the
//! workflow, then an environment variable, then the built-in default.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use log::debug;
use thiserror::Error;

use super::model::WorkflowDefinition;

pub const ENV_WORKSPACE: &str = "FLOWRUNNER_WORKSPACE";
pub const ENV_OUTPUT_DIR: &str = "FLOWRUNNER_OUTPUT_DIR";
pub const ENV_CHECKPOINT_DIR: &str = "FLOWRUNNER_CHECKPOINT_DIR";
pub const ENV_CHECKPOINTS: &str = "FLOWRUNNER_CHECKPOINTS";
pub const ENV_TIMEOUT_SECS: &str = "FLOWRUNNER_TIMEOUT_SECS";
pub const ENV_SESSION_DIR: &str = "FLOWRUNNER_SESSION_DIR";

pub const DEFAULT_WORKSPACE: &str = ".flowrunner/workspace";
pub const DEFAULT_OUTPUT_DIR: &str = ".flowrunner/output";
pub const DEFAULT_CHECKPOINT_DIR: &str = ".flowrunner/checkpoints";
pub const DEFAULT_SESSION_DIR: &str = ".flowrunner/sessions";
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Errors raised while resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}")]
    InvalidEnv { key: String, value: String },

    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Explicit per-run options supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub workspace_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub checkpoint_dir: Option<PathBuf>,
    pub checkpoint_enabled: Option<bool>,
    pub provider_timeout: Option<Duration>,
    /// Resume from the latest checkpoint when one exists.
    pub resume: bool,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workspace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace_dir = Some(dir.into());
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    pub fn with_checkpoints(mut self, enabled: bool) -> Self {
        self.checkpoint_enabled = Some(enabled);
        self
    }

    pub fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = Some(timeout);
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Convenience: places workspace, output and checkpoints under `root`.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self::new()
            .with_workspace_dir(root.join("workspace"))
            .with_output_dir(root.join("output"))
            .with_checkpoint_dir(root.join("checkpoints"))
    }
}

/// Fully resolved settings for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub workspace_dir: PathBuf,
    pub output_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub checkpoint_enabled: bool,
    pub provider_timeout: Duration,
}

/// Picks the first available value in precedence order.
pub fn resolve<T>(explicit: Option<T>, declared: Option<T>, from_env: Option<T>, default: T) -> T {
    explicit.or(declared).or(from_env).unwrap_or(default)
}

/// Parses boolean-ish environment values (`1/0`, `true/false`, `yes/no`, `on/off`).
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl RunSettings {
    /// Resolves settings using the process environment.
    pub fn resolve(options: &RunOptions, workflow: &WorkflowDefinition) -> Result<Self, ConfigError> {
        Self::resolve_with(options, workflow, |key| env::var(key).ok())
    }

    /// Resolves settings with an injectable environment lookup.
    pub fn resolve_with<F>(
        options: &RunOptions,
        workflow: &WorkflowDefinition,
        lookup: F,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_path = |key: &str| lookup(key).filter(|v| !v.trim().is_empty()).map(PathBuf::from);

        let env_flag = match lookup(ENV_CHECKPOINTS) {
            Some(raw) => Some(parse_flag(&raw).ok_or_else(|| ConfigError::InvalidEnv {
                key: ENV_CHECKPOINTS.to_string(),
                value: raw.clone(),
            })?),
            None => None,
        };

        let env_timeout = match lookup(ENV_TIMEOUT_SECS) {
            Some(raw) => Some(
                raw.trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|_| ConfigError::InvalidEnv {
                        key: ENV_TIMEOUT_SECS.to_string(),
                        value: raw.clone(),
                    })?,
            ),
            None => None,
        };

        let settings = Self {
            workspace_dir: resolve(
                options.workspace_dir.clone(),
                workflow.workspace_dir.clone(),
                env_path(ENV_WORKSPACE),
                PathBuf::from(DEFAULT_WORKSPACE),
            ),
            output_dir: resolve(
                options.output_dir.clone(),
                workflow.output_dir.clone(),
                env_path(ENV_OUTPUT_DIR),
                PathBuf::from(DEFAULT_OUTPUT_DIR),
            ),
            checkpoint_dir: resolve(
                options.checkpoint_dir.clone(),
                workflow.checkpoint_dir.clone(),
                env_path(ENV_CHECKPOINT_DIR),
                PathBuf::from(DEFAULT_CHECKPOINT_DIR),
            ),
            checkpoint_enabled: resolve(
                options.checkpoint_enabled,
                workflow.checkpoint_enabled,
                env_flag,
                true,
            ),
            provider_timeout: resolve(
                options.provider_timeout,
                None,
                env_timeout,
                Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            ),
        };

        debug!("Resolved run settings: {:?}", settings);
        Ok(settings)
    }

    /// Creates the workspace, output and (when enabled) checkpoint directories.
    pub fn create_directories(&self) -> Result<(), ConfigError> {
        let mut dirs = vec![&self.workspace_dir, &self.output_dir];
        if self.checkpoint_enabled {
            dirs.push(&self.checkpoint_dir);
        }
        for dir in dirs {
            fs::create_dir_all(dir).map_err(|source| ConfigError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

/// Directory for persisted sessions: explicit value, environment, default.
pub fn session_dir(explicit: Option<PathBuf>) -> PathBuf {
    resolve(
        explicit,
        None,
        env::var(ENV_SESSION_DIR).ok().map(PathBuf::from),
        PathBuf::from(DEFAULT_SESSION_DIR),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_nothing_set() {
        let workflow = WorkflowDefinition::new("wf");
        let settings = RunSettings::resolve_with(&RunOptions::new(), &workflow, env_of(&[])).unwrap();

        assert_eq!(settings.workspace_dir, PathBuf::from(DEFAULT_WORKSPACE));
        assert_eq!(settings.output_dir, PathBuf::from(DEFAULT_OUTPUT_DIR));
        assert_eq!(settings.checkpoint_dir, PathBuf::from(DEFAULT_CHECKPOINT_DIR));
        assert!(settings.checkpoint_enabled);
        assert_eq!(settings.provider_timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
    }

    #[test]
    fn test_precedence_order() {
        let mut workflow = WorkflowDefinition::new("wf");
        workflow.output_dir = Some(PathBuf::from("declared/out"));
        workflow.checkpoint_dir = Some(PathBuf::from("declared/cp"));
        workflow.checkpoint_enabled = Some(false);

        let env = env_of(&[
            (ENV_WORKSPACE, "env/ws"),
            (ENV_OUTPUT_DIR, "env/out"),
            (ENV_CHECKPOINT_DIR, "env/cp"),
            (ENV_CHECKPOINTS, "yes"),
            (ENV_TIMEOUT_SECS, "30"),
        ]);
        let options = RunOptions::new().with_checkpoint_dir("explicit/cp");

        let settings = RunSettings::resolve_with(&options, &workflow, env).unwrap();

        assert_eq!(settings.workspace_dir, PathBuf::from("env/ws"));
        assert_eq!(settings.output_dir, PathBuf::from("declared/out"));
        assert_eq!(settings.checkpoint_dir, PathBuf::from("explicit/cp"));
        assert!(!settings.checkpoint_enabled);
        assert_eq!(settings.provider_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_env_values_rejected() {
        let workflow = WorkflowDefinition::new("wf");
        let err = RunSettings::resolve_with(
            &RunOptions::new(),
            &workflow,
            env_of(&[(ENV_CHECKPOINTS, "maybe")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains(ENV_CHECKPOINTS));

        let err = RunSettings::resolve_with(
            &RunOptions::new(),
            &workflow,
            env_of(&[(ENV_TIMEOUT_SECS, "soon")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("ON"), Some(true));
        assert_eq!(parse_flag(" 0 "), Some(false));
        assert_eq!(parse_flag("perhaps"), None);
    }

    #[test]
    fn test_create_directories() {
        let temp_dir = tempdir().unwrap();
        let workflow = WorkflowDefinition::new("wf");
        let options = RunOptions::rooted_at(temp_dir.path());
        let settings = RunSettings::resolve_with(&options, &workflow, env_of(&[])).unwrap();

        settings.create_directories().unwrap();
        assert!(temp_dir.path().join("workspace").is_dir());
        assert!(temp_dir.path().join("output").is_dir());
        assert!(temp_dir.path().join("checkpoints").is_dir());
    }

    #[test]
    fn test_checkpoint_dir_not_created_when_disabled() {
        let temp_dir = tempdir().unwrap();
        let workflow = WorkflowDefinition::new("wf");
        let options = RunOptions::rooted_at(temp_dir.path()).with_checkpoints(false);
        let settings = RunSettings::resolve_with(&options, &workflow, env_of(&[])).unwrap();

        settings.create_directories().unwrap();
        assert!(!temp_dir.path().join("checkpoints").exists());
    }
}
