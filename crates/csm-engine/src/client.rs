//! One-shot queries: one agent process per prompt.
//!
//! The agent is launched with the prompt on its command line and stdin
//! closed. Its stream is read by the same loop sessions use; the first
//! `result` completes the query's [`ResultFuture`].

use std::sync::Arc;
use std::time::Duration;

use csm_protocol::{EventPayload, LineScanner};
use tokio::process::ChildStdout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accumulator::{Accumulator, QueryResponse};
use crate::command::{ClaudeCommand, CommandBuilder, LaunchMode};
use crate::config::{EngineConfig, SessionOptions};
use crate::error::{EngineError, Result};
use crate::future::ResultFuture;
use crate::pipe::{self, EventSender, EventStream};
use crate::process::AgentProcess;
use crate::reader::{self, ReadOutcome, ReadStats};

/// Upper bound on the kill grace after cancellation.
const CANCEL_GRACE: Duration = Duration::from_millis(500);

/// The live output of a one-shot query.
#[derive(Debug)]
pub struct QueryStream {
    /// Every event in emission order. Closes after the agent is reaped.
    pub events: EventStream,
    /// Completes with the agent's `result`, or with the error that ended
    /// the stream first.
    pub result: ResultFuture,
    cancel: CancellationToken,
}

impl QueryStream {
    /// Stops the query and kills the agent's process group.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Launches one-shot queries.
pub struct Client {
    builder: Arc<dyn CommandBuilder>,
    config: EngineConfig,
    defaults: SessionOptions,
}

impl Client {
    /// # Errors
    ///
    /// `EngineError::Config` if the configuration does not validate.
    pub fn new(config: EngineConfig, builder: Arc<dyn CommandBuilder>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            builder,
            defaults: config.session_defaults(),
            config,
        })
    }

    /// A client for the configured Claude binary.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let builder = Arc::new(ClaudeCommand::new(config.binary.clone()));
        Self::new(config, builder)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Starts `prompt` and returns its events and result future.
    ///
    /// Must be called within a tokio runtime. Cancelling `cancel` kills the
    /// agent; the stream then ends with an error event and the future with
    /// `EngineError::Cancelled`.
    ///
    /// # Errors
    ///
    /// `EngineError::ProcessStart` if the agent cannot be started.
    pub fn stream(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        opts: SessionOptions,
    ) -> Result<QueryStream> {
        let opts = opts.merged_over(&self.defaults);
        let mode = LaunchMode::OneShot {
            prompt: prompt.to_string(),
        };
        let spec = self.builder.build(&opts, &mode);

        let mut process = AgentProcess::spawn(&spec)?;
        let stdout = process.take_stdout().ok_or_else(|| EngineError::ProcessStart {
            program: process.program().to_string(),
            reason: "stdout not captured".to_string(),
        })?;

        let (mut sender, events) = pipe::channel(self.config.event_buffer);
        if let Some(id) = opts.session_id.clone().or_else(|| opts.resume.clone()) {
            sender.set_session_id(id);
        }
        let scanner = LineScanner::with_max_line_bytes(stdout, self.config.max_line_bytes);
        let result = ResultFuture::new();
        let cancel = cancel.child_token();

        tokio::spawn(run_query(
            process,
            scanner,
            sender,
            cancel.clone(),
            result.clone(),
            self.config.close_grace(),
        ));

        Ok(QueryStream {
            events,
            result,
            cancel,
        })
    }

    /// Runs `prompt` to completion and folds its events.
    ///
    /// # Errors
    ///
    /// - `EngineError::ProcessStart` if the agent cannot be started
    /// - `EngineError::ProcessExited` if it exits without a `result`
    /// - `EngineError::Cancelled` if `cancel` fires first
    pub async fn query(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        opts: SessionOptions,
    ) -> Result<QueryResponse> {
        let QueryStream {
            mut events, result, ..
        } = self.stream(cancel, prompt, opts)?;

        let acc = Accumulator::new();
        let folded = acc.consume(&mut events).await;
        debug!(events = folded, "Query stream drained");

        result.wait(cancel).await?;
        Ok(acc.response())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("binary", &self.config.binary)
            .finish()
    }
}

/// Reader task for a one-shot query. Owns the process.
async fn run_query(
    mut process: AgentProcess,
    mut scanner: LineScanner<ChildStdout>,
    mut sender: EventSender,
    cancel: CancellationToken,
    result: ResultFuture,
    grace: Duration,
) {
    let mut stats = ReadStats::default();
    let outcome = reader::pump(&mut scanner, &mut sender, &cancel, &mut stats, |event| {
        if let EventPayload::Result(payload) = &event.payload {
            result.complete(Ok((**payload).clone()));
        }
    })
    .await;
    debug!(
        pid = ?process.pid(),
        lines = stats.lines,
        events = stats.events,
        skipped = stats.skipped,
        outcome = ?outcome,
        "Query reader stopped"
    );

    match outcome {
        ReadOutcome::Eof if result.is_done() => {
            if tokio::time::timeout(grace, process.wait()).await.is_err() {
                debug!(pid = ?process.pid(), "Agent lingering after result");
            }
            // Also reaps any tool subprocess left in the group.
            reader::reap_group(&mut process, Duration::ZERO).await;
        }
        ReadOutcome::Eof => {
            let error = match tokio::time::timeout(grace, reader::exit_error(&mut process)).await {
                Ok(error) => error,
                Err(_) => {
                    reader::reap_group(&mut process, Duration::ZERO).await;
                    reader::exit_error(&mut process).await
                }
            };
            reader::reap_group(&mut process, Duration::ZERO).await;
            warn!(error = %error, "Agent exited without a result");
            reader::report_failure(&mut sender, &error);
            result.complete(Err(error));
        }
        ReadOutcome::Cancelled => {
            reader::reap_group(&mut process, grace.min(CANCEL_GRACE)).await;
            info!(pid = ?process.pid(), "Query cancelled");
            reader::report_failure(&mut sender, &EngineError::Cancelled);
            result.complete(Err(EngineError::Cancelled));
        }
        ReadOutcome::Failed(error) => {
            warn!(error = %error, "Agent stream failed");
            reader::report_failure(&mut sender, &error);
            result.complete(Err(error));
            reader::reap_group(&mut process, grace).await;
        }
    }
    drop(sender);
}
