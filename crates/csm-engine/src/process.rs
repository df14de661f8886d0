//! Agent process launcher.
//!
//! The agent runs in its own process group so that tool subprocesses it
//! spawns (shells, language servers, MCP servers) die with it: termination
//! signals go to the negative pgid, not only to the immediate child.
//!
//! # Panic-Free Guarantees
//!
//! Signal delivery failures (already-dead group, ESRCH) are ignored; every
//! other failure is returned as an [`EngineError`].

use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use csm_protocol::LineScanner;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::LaunchSpec;
use crate::error::{EngineError, Result};

/// Number of stderr lines kept for error reports.
const STDERR_TAIL_LINES: usize = 20;

/// Longest stderr line kept, in bytes.
const STDERR_LINE_BYTES: usize = 512;

/// How long `wait` lets the stderr reader drain after the child exits.
const STDERR_DRAIN: Duration = Duration::from_millis(200);

/// Bounded tail of the child's stderr.
#[derive(Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
}

impl StderrTail {
    fn push(&mut self, line: &[u8]) {
        let end = line.len().min(STDERR_LINE_BYTES);
        let text = String::from_utf8_lossy(line.get(..end).unwrap_or_default()).into_owned();
        if self.lines.len() == STDERR_TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(text);
    }

    fn joined(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// A running agent process.
///
/// Owns the child exclusively. Dropping it without [`kill_group`] or
/// [`wait`] still SIGKILLs the process group.
///
/// [`kill_group`]: AgentProcess::kill_group
/// [`wait`]: AgentProcess::wait
pub struct AgentProcess {
    child: Child,
    pid: Option<u32>,
    program: String,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr_tail: Arc<Mutex<StderrTail>>,
    stderr_task: Option<JoinHandle<()>>,
    exit: Option<ExitStatus>,
}

impl AgentProcess {
    /// Starts the agent described by `spec`.
    ///
    /// Must be called within a tokio runtime. Start failures (missing
    /// binary, permission denied, bad cwd) are returned here, before any
    /// output is read.
    pub fn spawn(spec: &LaunchSpec) -> Result<Self> {
        let program = spec.display_program();

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(if spec.interactive {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|e| EngineError::ProcessStart {
            program: program.clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id();
        info!(program = %program, pid = ?pid, "Agent process started");

        let stderr_tail = Arc::new(Mutex::new(StderrTail::default()));
        let stderr_task = child.stderr.take().map(|stderr| {
            let tail = Arc::clone(&stderr_tail);
            tokio::spawn(async move {
                let mut scanner = LineScanner::with_max_line_bytes(stderr, 1024 * 1024);
                while let Ok(Some(line)) = scanner.next_line().await {
                    debug!(pid = ?pid, line = %String::from_utf8_lossy(&line), "agent stderr");
                    tail.lock().unwrap_or_else(PoisonError::into_inner).push(&line);
                }
            })
        });

        Ok(Self {
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            child,
            pid,
            program,
            stderr_tail,
            stderr_task,
            exit: None,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Takes the stdin pipe; `None` for one-shot launches or if taken.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// The last lines the agent wrote to stderr.
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .joined()
    }

    /// Exit status once the process has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    /// Waits for the process to exit and reaps it.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let status = match self.exit {
            Some(status) => status,
            None => {
                let status = self
                    .child
                    .wait()
                    .await
                    .map_err(|e| EngineError::StreamRead(format!("waiting for agent: {e}")))?;
                self.exit = Some(status);
                debug!(pid = ?self.pid, status = %status, "Agent process reaped");
                status
            }
        };
        self.drain_stderr().await;
        Ok(status)
    }

    async fn drain_stderr(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            // A grandchild may still hold stderr open.
            if tokio::time::timeout(STDERR_DRAIN, task).await.is_err() {
                debug!(pid = ?self.pid, "stderr reader still running after exit");
            }
        }
    }

    /// Terminates the whole process group and reaps the child.
    ///
    /// Sends SIGTERM to the group, gives the leader `grace` to exit, then
    /// SIGKILLs the group unconditionally so no descendant survives.
    pub async fn kill_group(&mut self, grace: Duration) -> Result<ExitStatus> {
        if let Some(status) = self.exit {
            #[cfg(unix)]
            self.signal_group(nix::sys::signal::Signal::SIGKILL);
            return Ok(status);
        }

        #[cfg(unix)]
        {
            self.signal_group(nix::sys::signal::Signal::SIGTERM);
            if let Ok(Ok(status)) = tokio::time::timeout(grace, self.child.wait()).await {
                self.exit = Some(status);
            }
            self.signal_group(nix::sys::signal::Signal::SIGKILL);
        }
        #[cfg(not(unix))]
        {
            let _ = grace;
            if let Err(e) = self.child.start_kill() {
                warn!(pid = ?self.pid, error = %e, "Failed to kill agent");
            }
        }

        if self.exit.is_none() {
            if let Err(e) = self.child.start_kill() {
                debug!(pid = ?self.pid, error = %e, "start_kill after group kill");
            }
        }
        let status = self.wait().await?;
        info!(pid = ?self.pid, status = %status, "Agent process terminated");
        Ok(status)
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: nix::sys::signal::Signal) {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) else {
            return;
        };
        // Negative pid addresses the process group.
        match kill(Pid::from_raw(-pid), signal) {
            Ok(()) => debug!(pgid = pid, signal = ?signal, "Signalled agent process group"),
            Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => warn!(pgid = pid, signal = ?signal, error = %e, "Failed to signal process group"),
        }
    }
}

impl Drop for AgentProcess {
    fn drop(&mut self) {
        if self.exit.is_none() {
            #[cfg(unix)]
            self.signal_group(nix::sys::signal::Signal::SIGKILL);
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for AgentProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentProcess")
            .field("program", &self.program)
            .field("pid", &self.pid)
            .field("exit", &self.exit)
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::command::LaunchSpec;
    use tokio::io::AsyncReadExt;

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec::new("/bin/sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_missing_binary_fails_synchronously() {
        let err = AgentProcess::spawn(&LaunchSpec::new("/nonexistent/agent-binary")).unwrap_err();
        match err {
            EngineError::ProcessStart { program, .. } => {
                assert_eq!(program, "/nonexistent/agent-binary")
            }
            other => panic!("expected ProcessStart, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stdout_env_and_exit_code() {
        let mut spec = sh("echo \"$CSM_TEST_VAR\"; exit 3");
        spec.env.insert("CSM_TEST_VAR".into(), "hello".into());
        let mut proc = AgentProcess::spawn(&spec).unwrap();
        assert!(proc.take_stdin().is_none());

        let mut out = String::new();
        proc.take_stdout()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert_eq!(out, "hello\n");

        let status = proc.wait().await.unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn test_stderr_tail_is_bounded() {
        let mut proc =
            AgentProcess::spawn(&sh("i=0; while [ $i -lt 50 ]; do echo err$i >&2; i=$((i+1)); done"))
                .unwrap();
        proc.wait().await.unwrap();
        let tail = proc.stderr_tail();
        let lines: Vec<_> = tail.lines().collect();
        assert_eq!(lines.len(), STDERR_TAIL_LINES);
        assert_eq!(lines.last(), Some(&"err49"));
    }

    #[tokio::test]
    async fn test_kill_group_terminates_sleeping_agent() {
        let mut proc = AgentProcess::spawn(&sh("sleep 30")).unwrap();
        let status = tokio::time::timeout(
            Duration::from_secs(5),
            proc.kill_group(Duration::from_millis(200)),
        )
        .await
        .expect("kill_group timed out")
        .unwrap();
        assert!(!status.success());
        assert!(proc.exit_status().is_some());
    }

    #[tokio::test]
    async fn test_kill_group_ignores_sigterm_trap() {
        let mut proc = AgentProcess::spawn(&sh("trap '' TERM; sleep 30 & wait")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::time::timeout(
            Duration::from_secs(5),
            proc.kill_group(Duration::from_millis(100)),
        )
        .await
        .expect("kill_group timed out")
        .unwrap();
    }
}
