//! Building the agent's command line.
//!
//! The engine never interprets individual flags. A [`CommandBuilder`] turns
//! [`SessionOptions`] into a [`LaunchSpec`]; the launcher only runs it.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;

use crate::config::SessionOptions;

/// How the agent is driven.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchMode {
    /// Long-lived: turns are written to stdin as stream-json.
    Interactive,
    /// A single prompt passed on the command line; stdin is closed.
    OneShot { prompt: String },
}

/// Everything needed to spawn the agent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    /// Merged over the parent environment.
    pub env: HashMap<String, String>,
    /// Stdin stays open for turns.
    pub interactive: bool,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Program name for logs and errors.
    pub fn display_program(&self) -> String {
        self.program.display().to_string()
    }
}

/// Produces the command line for a session.
pub trait CommandBuilder: Send + Sync {
    fn build(&self, opts: &SessionOptions, mode: &LaunchMode) -> LaunchSpec;
}

/// Environment variable the agent reads its config directory from.
const CONFIG_DIR_ENV: &str = "CLAUDE_CONFIG_DIR";

/// The Claude Code CLI in stream-json mode.
#[derive(Debug, Clone)]
pub struct ClaudeCommand {
    binary: PathBuf,
}

impl ClaudeCommand {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for ClaudeCommand {
    fn default() -> Self {
        Self::new("claude")
    }
}

impl CommandBuilder for ClaudeCommand {
    fn build(&self, opts: &SessionOptions, mode: &LaunchMode) -> LaunchSpec {
        let mut spec = LaunchSpec::new(&self.binary)
            .arg("--print")
            .arg("--output-format").arg("stream-json").arg("--verbose");
        if matches!(mode, LaunchMode::Interactive) {
            spec = spec.arg("--input-format").arg("stream-json");
            spec.interactive = true;
        }

        if let Some(model) = &opts.model {
            spec = spec.arg("--model").arg(model);
        }
        if let Some(permission) = &opts.permission_mode {
            spec = spec.arg("--permission-mode").arg(permission);
        }
        if let Some(prompt) = &opts.system_prompt {
            spec = spec.arg("--append-system-prompt").arg(prompt);
        }
        if !opts.allowed_tools.is_empty() {
            spec = spec.arg("--allowedTools").arg(opts.allowed_tools.join(","));
        }
        if let Some(id) = &opts.resume {
            spec = spec.arg("--resume").arg(id.as_str());
        } else if let Some(id) = &opts.session_id {
            spec = spec.arg("--session-id").arg(id.as_str());
        }
        spec.args.extend(opts.extra_args.iter().map(OsString::from));
        // After `--` so a leading dash is not read as a flag.
        if let LaunchMode::OneShot { prompt } = mode {
            spec = spec.arg("--").arg(prompt);
        }

        spec.cwd = opts.cwd.clone();
        spec.env = opts.env.clone();
        if let Some(dir) = &opts.config_dir {
            spec.env
                .insert(CONFIG_DIR_ENV.to_string(), dir.display().to_string());
        }
        spec
    }
}

/// Runs a fixed program and arguments, ignoring flag-shaped options.
///
/// Used for wrapper scripts and for stand-in agents in tests. The working
/// directory and environment from the options still apply; a one-shot
/// prompt is appended as the last argument.
#[derive(Debug, Clone)]
pub struct FixedCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl FixedCommand {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl CommandBuilder for FixedCommand {
    fn build(&self, opts: &SessionOptions, mode: &LaunchMode) -> LaunchSpec {
        let mut spec = LaunchSpec::new(&self.program);
        spec.args = self.args.clone();
        match mode {
            LaunchMode::Interactive => spec.interactive = true,
            LaunchMode::OneShot { prompt } => spec.args.push(prompt.into()),
        }
        spec.cwd = opts.cwd.clone();
        spec.env = opts.env.clone();
        spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csm_core::SessionId;

    fn args(spec: &LaunchSpec) -> Vec<String> {
        spec.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_claude_interactive_selects_stream_json() {
        let spec = ClaudeCommand::default().build(&SessionOptions::new(), &LaunchMode::Interactive);
        let args = args(&spec);
        assert!(spec.interactive);
        assert_eq!(spec.program, PathBuf::from("claude"));
        for pair in [["--output-format", "stream-json"], ["--input-format", "stream-json"]] {
            assert!(args.windows(2).any(|w| w == pair), "missing {pair:?} in {args:?}");
        }
        assert!(args.contains(&"--verbose".to_string()));
    }

    #[test]
    fn test_claude_one_shot_passes_prompt() {
        let mode = LaunchMode::OneShot {
            prompt: "hello".to_string(),
        };
        let spec = ClaudeCommand::default().build(&SessionOptions::new(), &mode);
        let args = args(&spec);
        assert!(!spec.interactive);
        assert_eq!(args.first().map(String::as_str), Some("--print"));
        assert_eq!(&args[args.len() - 2..], ["--", "hello"]);
        assert!(!args.contains(&"--input-format".to_string()));
    }

    #[test]
    fn test_claude_one_shot_dash_prompt_follows_extra_args() {
        let mut opts = SessionOptions::new().model("m");
        opts.extra_args = vec!["--debug".into()];
        let mode = LaunchMode::OneShot {
            prompt: "--help me".to_string(),
        };
        let args = args(&ClaudeCommand::default().build(&opts, &mode));
        assert_eq!(&args[args.len() - 3..], ["--debug", "--", "--help me"]);
        assert!(args.windows(2).any(|w| w == ["--model", "m"]));
    }

    #[test]
    fn test_claude_maps_options() {
        let mut opts = SessionOptions::new()
            .model("claude-haiku-4-5")
            .session_id("abc")
            .cwd("/work");
        opts.allowed_tools = vec!["Read".into(), "Bash".into()];
        opts.config_dir = Some(PathBuf::from("/creds"));
        opts.extra_args = vec!["--debug".into()];

        let spec = ClaudeCommand::new("/bin/claude").build(&opts, &LaunchMode::Interactive);
        let args = args(&spec);
        assert!(args.windows(2).any(|w| w == ["--model", "claude-haiku-4-5"]));
        assert!(args.windows(2).any(|w| w == ["--session-id", "abc"]));
        assert!(args.windows(2).any(|w| w == ["--allowedTools", "Read,Bash"]));
        assert_eq!(args.last().map(String::as_str), Some("--debug"));
        assert_eq!(spec.cwd, Some(PathBuf::from("/work")));
        assert_eq!(spec.env.get(CONFIG_DIR_ENV).map(String::as_str), Some("/creds"));
    }

    #[test]
    fn test_resume_wins_over_session_id() {
        let mut opts = SessionOptions::new().session_id("new");
        opts.resume = Some(SessionId::new("old"));
        let args = args(&ClaudeCommand::default().build(&opts, &LaunchMode::Interactive));
        assert!(args.windows(2).any(|w| w == ["--resume", "old"]));
        assert!(!args.contains(&"--session-id".to_string()));
    }

    #[test]
    fn test_fixed_command() {
        let cmd = FixedCommand::new("/bin/sh", ["-c", "cat"]);
        let spec = cmd.build(&SessionOptions::new().env("K", "V"), &LaunchMode::Interactive);
        assert_eq!(args(&spec), vec!["-c", "cat"]);
        assert!(spec.interactive);
        assert_eq!(spec.env.get("K").map(String::as_str), Some("V"));

        let spec = cmd.build(
            &SessionOptions::new(),
            &LaunchMode::OneShot {
                prompt: "p".into(),
            },
        );
        assert_eq!(args(&spec), vec!["-c", "cat", "p"]);
    }
}
