//! Engine configuration and per-session options.
//!
//! `EngineConfig` is read from TOML (by default
//! `~/.config/csm/config.toml`); every field has a default, so an absent
//! file or an empty table is a valid configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use csm_core::SessionId;
use csm_protocol::DEFAULT_MAX_LINE_BYTES;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, Result};

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Agent executable, looked up on `PATH` when not absolute.
    pub binary: PathBuf,

    /// Maximum number of live sessions in one manager.
    pub max_sessions: usize,

    /// Idle time after which the sweep closes a session. 0 disables the sweep.
    pub session_ttl_secs: u64,

    pub cleanup_interval_secs: u64,

    /// Capacity of each session's event channel.
    pub event_buffer: usize,

    pub max_line_bytes: usize,

    /// Time a closing agent gets to exit after stdin is closed.
    pub close_grace_ms: u64,

    pub init_timeout_secs: u64,

    /// Defaults applied to every session unless its options override them.
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub cwd: Option<PathBuf>,
    pub extra_args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("claude"),
            max_sessions: 10,
            session_ttl_secs: 30 * 60,
            cleanup_interval_secs: 60,
            event_buffer: 100,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            close_grace_ms: 2000,
            init_timeout_secs: 30,
            model: None,
            permission_mode: None,
            cwd: None,
            extra_args: Vec::new(),
            env: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Returns the default config file location, if a config dir exists.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("csm").join("config.toml"))
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_toml_str(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(EngineError::Config(format!(
                "cannot read {}: {e}",
                path.display()
            ))),
        }
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(EngineError::Config("max_sessions must be at least 1".into()));
        }
        if self.event_buffer == 0 {
            return Err(EngineError::Config("event_buffer must be at least 1".into()));
        }
        if self.max_line_bytes == 0 {
            return Err(EngineError::Config("max_line_bytes must be at least 1".into()));
        }
        if self.session_ttl_secs > 0 && self.cleanup_interval_secs == 0 {
            return Err(EngineError::Config(
                "cleanup_interval_secs must be non-zero when session_ttl_secs is set".into(),
            ));
        }
        if self.binary.as_os_str().is_empty() {
            return Err(EngineError::Config("binary must not be empty".into()));
        }
        Ok(())
    }

    /// `None` when TTL eviction is disabled.
    pub fn session_ttl(&self) -> Option<Duration> {
        (self.session_ttl_secs > 0).then(|| Duration::from_secs(self.session_ttl_secs))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    /// Per-session options seeded from this config's defaults.
    pub fn session_defaults(&self) -> SessionOptions {
        SessionOptions {
            model: self.model.clone(),
            cwd: self.cwd.clone(),
            permission_mode: self.permission_mode.clone(),
            extra_args: self.extra_args.clone(),
            env: self.env.clone(),
            ..SessionOptions::default()
        }
    }
}

/// Options for one session (or one one-shot query).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionOptions {
    pub model: Option<String>,
    pub cwd: Option<PathBuf>,
    pub permission_mode: Option<String>,
    pub system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub extra_args: Vec<String>,

    /// Merged over the parent environment of the agent process.
    pub env: HashMap<String, String>,

    /// Overrides the agent's config directory (credentials, settings).
    pub config_dir: Option<PathBuf>,

    /// Id to start the conversation under; generated when absent.
    pub session_id: Option<SessionId>,

    /// Continue an earlier conversation.
    pub resume: Option<SessionId>,

    /// Stay in `Creating` until the agent's `init` event arrives.
    pub wait_for_init: bool,
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn session_id(mut self, id: impl Into<SessionId>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn wait_for_init(mut self, wait: bool) -> Self {
        self.wait_for_init = wait;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Fills unset fields from `defaults`. Explicit values win; env maps
    /// and argument lists are combined.
    pub fn merged_over(mut self, defaults: &SessionOptions) -> Self {
        if self.model.is_none() {
            self.model = defaults.model.clone();
        }
        if self.cwd.is_none() {
            self.cwd = defaults.cwd.clone();
        }
        if self.permission_mode.is_none() {
            self.permission_mode = defaults.permission_mode.clone();
        }
        if self.system_prompt.is_none() {
            self.system_prompt = defaults.system_prompt.clone();
        }
        if self.allowed_tools.is_empty() {
            self.allowed_tools = defaults.allowed_tools.clone();
        }
        if self.config_dir.is_none() {
            self.config_dir = defaults.config_dir.clone();
        }

        let mut args = defaults.extra_args.clone();
        args.append(&mut self.extra_args);
        self.extra_args = args;

        for (key, value) in &defaults.env {
            self.env.entry(key.clone()).or_insert_with(|| value.clone());
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.binary, PathBuf::from("claude"));
        assert_eq!(config.max_sessions, 10);
        assert_eq!(config.session_ttl(), Some(Duration::from_secs(1800)));
        assert_eq!(config.max_line_bytes, 32 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = EngineConfig::from_toml_str(
            r#"
            max_sessions = 3
            session_ttl_secs = 0
            model = "claude-haiku-4-5"

            [env]
            CLAUDE_CODE_USE_BEDROCK = "1"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_sessions, 3);
        assert_eq!(config.session_ttl(), None);
        assert_eq!(config.event_buffer, 100);
        assert_eq!(config.env.get("CLAUDE_CODE_USE_BEDROCK").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(EngineConfig::from_toml_str("max_sessions = 0").is_err());
        assert!(EngineConfig::from_toml_str("event_buffer = 0").is_err());
        assert!(EngineConfig::from_toml_str("cleanup_interval_secs = 0").is_err());
        assert!(
            EngineConfig::from_toml_str("session_ttl_secs = 0\ncleanup_interval_secs = 0").is_ok()
        );
        assert!(matches!(
            EngineConfig::from_toml_str("max_sessions = \"many\""),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "binary = \"/opt/claude\"\nclose_grace_ms = 10\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.binary, PathBuf::from("/opt/claude"));
        assert_eq!(config.close_grace(), Duration::from_millis(10));
    }

    #[test]
    fn test_options_merge() {
        let defaults = SessionOptions::new()
            .model("default-model")
            .env("A", "1")
            .env("B", "1");
        let mut opts = SessionOptions::new().env("B", "2");
        opts.extra_args.push("--own".into());

        let mut defaults_with_args = defaults.clone();
        defaults_with_args.extra_args.push("--base".into());

        let merged = opts.merged_over(&defaults_with_args);
        assert_eq!(merged.model.as_deref(), Some("default-model"));
        assert_eq!(merged.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(merged.env.get("B").map(String::as_str), Some("2"));
        assert_eq!(merged.extra_args, vec!["--base", "--own"]);
    }
}
