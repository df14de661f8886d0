//! The stream reader loop shared by sessions and one-shot queries.
//!
//! One reader per agent process: scan a line, skip blanks, parse, stamp the
//! session id, let the owner observe the event, then deliver it. Parse
//! failures are logged and skipped; scan failures and cancellation end the
//! loop and are reported to the owner, which decides how to terminate.

use std::time::Duration;

use csm_protocol::parse::{is_blank, preview};
use csm_protocol::{parse_line, Event, LineScanner, ScanError};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::pipe::{Delivery, EventSender};
use crate::process::AgentProcess;

/// Why the reader stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    /// The agent closed stdout.
    Eof,
    Cancelled,
    /// Unrecoverable read error.
    Failed(EngineError),
}

/// Counters for one reader run.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ReadStats {
    pub lines: u64,
    pub events: u64,
    pub skipped: u64,
}

/// Reads events until end of stream, a read error or cancellation.
///
/// `observe` sees every event, already stamped with the stream's session
/// id, before it is delivered. It runs even when the consumer has dropped
/// its stream, so turn bookkeeping keeps working.
pub(crate) async fn pump<R, F>(
    scanner: &mut LineScanner<R>,
    sender: &mut EventSender,
    cancel: &CancellationToken,
    stats: &mut ReadStats,
    mut observe: F,
) -> ReadOutcome
where
    R: AsyncRead + Unpin,
    F: FnMut(&Event),
{
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ReadOutcome::Cancelled,
            next = scanner.next_line() => next,
        };

        let line = match next {
            Ok(Some(line)) => line,
            Ok(None) => return ReadOutcome::Eof,
            Err(ScanError::LineTooLong { max, line }) => {
                return ReadOutcome::Failed(EngineError::LineTooLong { max, line })
            }
            Err(ScanError::Io(e)) => return ReadOutcome::Failed(EngineError::StreamRead(e.to_string())),
        };
        stats.lines += 1;

        if is_blank(&line) {
            continue;
        }

        let mut event = match parse_line(&line) {
            Ok(event) => event,
            Err(e) => {
                stats.skipped += 1;
                warn!(
                    session_id = %sender.session_id(),
                    len = line.len(),
                    preview = %preview(&line),
                    error = %e,
                    "Skipping malformed line"
                );
                continue;
            }
        };
        sender.stamp(&mut event);
        observe(&event);
        stats.events += 1;

        match sender.send(event, cancel).await {
            Delivery::Delivered => {}
            Delivery::NoReceiver | Delivery::Full => {
                debug!(session_id = %sender.session_id(), "Event consumer gone, discarding")
            }
            Delivery::Cancelled => return ReadOutcome::Cancelled,
        }
    }
}

/// Builds the error for an agent that exited before finishing its turn.
///
/// Reaps the process first so the exit code and stderr tail are final.
pub(crate) async fn exit_error(process: &mut AgentProcess) -> EngineError {
    match process.wait().await {
        Ok(status) => EngineError::ProcessExited {
            code: status.code(),
            stderr: process.stderr_tail(),
        },
        Err(e) => e,
    }
}

/// Kills the agent's process group. A failure is logged, not returned.
pub(crate) async fn reap_group(process: &mut AgentProcess, grace: Duration) {
    if let Err(e) = process.kill_group(grace).await {
        warn!(pid = ?process.pid(), error = %e, "Failed to reap agent");
    }
}

/// Sends the engine-side error event that ends a failed stream.
pub(crate) fn report_failure(sender: &mut EventSender, error: &EngineError) {
    let event = Event::error(sender.session_id().clone(), error.to_string());
    if sender.try_send_final(event) != Delivery::Delivered {
        debug!(session_id = %sender.session_id(), error = %error, "Could not deliver error event");
    }
}
