//! A conversational session bound to one agent process.
//!
//! ```text
//!             send(turn)                         events()
//!  caller ───────────────▶ stdin ─▶ agent ─▶ stdout ─▶ reader task ─▶ EventStream
//!    ▲                                                   │
//!    └──────────────── ResultFuture ◀────── `result` ────┘
//! ```
//!
//! The reader task owns the process. It is the only writer of the event
//! channel and drops its sender when it stops, which closes the channel.
//!
//! # Panic-Free Guarantees
//!
//! No `.unwrap()`/`.expect()`; poisoned locks are recovered with
//! `PoisonError::into_inner`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use csm_core::{Money, SessionId, SessionStatus, Usage};
use csm_protocol::{
    Event, EventPayload, EventType, LineScanner, ToolCorrelator, UserMessage,
};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accumulator::{Accumulator, QueryResponse};
use crate::command::LaunchSpec;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::future::ResultFuture;
use crate::pipe::{self, EventSender, EventStream};
use crate::process::AgentProcess;
use crate::reader::{self, ReadOutcome, ReadStats};

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    /// The id the agent reports in its events; empty until the first one.
    pub agent_session_id: SessionId,
    pub status: SessionStatus,
    pub model: Option<String>,
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub turns: u64,
    pub usage: Usage,
    pub cost: Money,
    /// Tool calls announced by the agent and not yet answered.
    pub pending_tool_uses: usize,
    pub last_error: Option<String>,
}

/// Mutable bookkeeping updated by both the caller and the reader.
#[derive(Debug)]
struct Tracking {
    agent_session_id: SessionId,
    model: Option<String>,
    pid: Option<u32>,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    last_activity_at: Instant,
    turns: u64,
    usage: Usage,
    cost: Money,
    tools: ToolCorrelator,
    failure: Option<EngineError>,
}

impl Tracking {
    fn touch(&mut self) {
        self.last_activity = Utc::now();
        self.last_activity_at = Instant::now();
    }
}

/// State shared between a [`Session`] and its reader task.
#[derive(Debug)]
struct Shared {
    id: SessionId,
    status: watch::Sender<SessionStatus>,
    tracking: Mutex<Tracking>,
    turn: Mutex<Option<ResultFuture>>,
}

impl Shared {
    fn tracking(&self) -> MutexGuard<'_, Tracking> {
        self.tracking.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn turn(&self) -> MutexGuard<'_, Option<ResultFuture>> {
        self.turn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Moves to `next` if the state machine allows it.
    fn transition(&self, next: SessionStatus) -> bool {
        let mut from = None;
        self.status.send_if_modified(|current| {
            if current.can_transition_to(next) {
                from = Some(*current);
                *current = next;
                true
            } else {
                false
            }
        });
        match from {
            Some(from) => {
                info!(session_id = %self.id, from = %from, to = %next, "Session status changed");
                true
            }
            None => false,
        }
    }

    /// Reader-side bookkeeping for one event.
    fn observe(&self, event: &Event) {
        let mut tracking = self.tracking();
        tracking.touch();
        tracking.tools.observe(event);
        if !event.session_id.is_empty() && tracking.agent_session_id != event.session_id {
            tracking.agent_session_id = event.session_id.clone();
        }

        match &event.payload {
            EventPayload::Init(init) => {
                if tracking.model.is_none() && !init.model.is_empty() {
                    tracking.model = Some(init.model.clone());
                }
                drop(tracking);
                debug!(session_id = %self.id, agent_session_id = %event.session_id, "Agent initialized");
                self.transition(SessionStatus::Active);
            }
            EventPayload::Assistant(msg) => {
                tracking.usage += msg.usage;
                if tracking.model.is_none() && !msg.model.is_empty() {
                    tracking.model = Some(msg.model.clone());
                }
            }
            EventPayload::Result(result) => {
                tracking.cost += result.total_cost_usd;
                drop(tracking);
                match self.turn().take() {
                    Some(turn) => {
                        turn.complete(Ok((**result).clone()));
                    }
                    None => debug!(session_id = %self.id, "Result with no turn in flight"),
                }
            }
            _ => {}
        }
    }

    /// Ends the in-flight turn, if any, with `error`, and remembers the
    /// error as the session's failure.
    fn fail(&self, error: EngineError) {
        if let Some(turn) = self.turn().take() {
            turn.complete(Err(error.clone()));
        }
        let mut tracking = self.tracking();
        if tracking.failure.is_none() {
            tracking.failure = Some(error);
        }
    }
}

/// The session's own event stream while no caller has taken it.
#[derive(Debug)]
struct Parked {
    stream: EventStream,
    /// Turn-ending events already read from `stream`.
    turns_read: u64,
}

/// One conversation with one agent process.
///
/// Created by [`Session::start`] (usually through
/// [`SessionManager`](crate::SessionManager)). One turn may be in flight at
/// a time; [`send`](Session::send) rejects overlapping turns.
#[derive(Debug)]
pub struct Session {
    shared: Arc<Shared>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    events: tokio::sync::Mutex<Option<Parked>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    close_grace: Duration,
}

impl Session {
    /// Launches the agent and starts its reader.
    ///
    /// The session is `Active` on return unless `wait_for_init` is set, in
    /// which case it stays `Creating` until the agent's `init` event (see
    /// [`wait_ready`](Session::wait_ready)). Cancelling `cancel` tears the
    /// session down and kills the agent's process group.
    ///
    /// # Errors
    ///
    /// `EngineError::ProcessStart` if the agent cannot be started.
    pub fn start(
        id: SessionId,
        spec: &LaunchSpec,
        config: &EngineConfig,
        wait_for_init: bool,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let mut process = AgentProcess::spawn(spec)?;
        let stdin = process.take_stdin();
        let stdout = process.take_stdout().ok_or_else(|| EngineError::ProcessStart {
            program: process.program().to_string(),
            reason: "stdout not captured".to_string(),
        })?;

        let now = Utc::now();
        let (status, _) = watch::channel(SessionStatus::Creating);
        let shared = Arc::new(Shared {
            id: id.clone(),
            status,
            tracking: Mutex::new(Tracking {
                agent_session_id: SessionId::default(),
                model: None,
                pid: process.pid(),
                created_at: now,
                last_activity: now,
                last_activity_at: Instant::now(),
                turns: 0,
                usage: Usage::default(),
                cost: Money::zero(),
                tools: ToolCorrelator::new(),
                failure: None,
            }),
            turn: Mutex::new(None),
        });

        let (mut sender, stream) = pipe::channel(config.event_buffer);
        sender.set_session_id(id.clone());
        let scanner = LineScanner::with_max_line_bytes(stdout, config.max_line_bytes);
        let cancel = cancel.child_token();

        let reader = tokio::spawn(run_reader(
            Arc::clone(&shared),
            process,
            scanner,
            sender,
            cancel.clone(),
            config.close_grace(),
        ));

        if !wait_for_init {
            shared.transition(SessionStatus::Active);
        }
        info!(session_id = %id, "Session started");

        Ok(Self {
            shared,
            stdin: tokio::sync::Mutex::new(stdin),
            events: tokio::sync::Mutex::new(Some(Parked {
                stream,
                turns_read: 0,
            })),
            reader: Mutex::new(Some(reader)),
            cancel,
            close_grace: config.close_grace(),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.shared.id
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    /// Watches status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status.subscribe()
    }

    /// True while the session counts for lookups and capacity.
    pub fn is_live(&self) -> bool {
        self.status().is_live()
    }

    pub fn info(&self) -> SessionInfo {
        let status = self.status();
        let tracking = self.shared.tracking();
        SessionInfo {
            id: self.shared.id.clone(),
            agent_session_id: tracking.agent_session_id.clone(),
            status,
            model: tracking.model.clone(),
            pid: tracking.pid,
            created_at: tracking.created_at,
            last_activity: tracking.last_activity,
            turns: tracking.turns,
            usage: tracking.usage,
            cost: tracking.cost,
            pending_tool_uses: tracking.tools.pending_count(),
            last_error: tracking.failure.as_ref().map(ToString::to_string),
        }
    }

    /// Time since the last turn or event.
    pub fn idle_for(&self) -> Duration {
        self.shared.tracking().last_activity_at.elapsed()
    }

    /// The error that ended the session, if it failed.
    pub fn failure(&self) -> Option<EngineError> {
        self.shared.tracking().failure.clone()
    }

    /// Moves a `Creating` session to `Active` without waiting for `init`.
    pub fn proceed(&self) -> Result<()> {
        let current = self.status();
        if current == SessionStatus::Active {
            return Ok(());
        }
        current.transition(SessionStatus::Active)?;
        self.shared.transition(SessionStatus::Active);
        Ok(())
    }

    /// Waits until the session leaves `Creating`.
    ///
    /// # Errors
    ///
    /// - `EngineError::InitTimeout` if `init` does not arrive in time
    /// - `EngineError::Cancelled` if `cancel` fires first
    /// - the session's failure if the agent died during startup
    pub async fn wait_ready(&self, cancel: &CancellationToken, timeout: Duration) -> Result<()> {
        let mut rx = self.subscribe_status();
        let waited = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            waited = tokio::time::timeout(
                timeout,
                rx.wait_for(|s| *s != SessionStatus::Creating),
            ) => waited,
        };

        match waited {
            Err(_) => Err(EngineError::InitTimeout {
                secs: timeout.as_secs(),
            }),
            Ok(Ok(status)) if *status == SessionStatus::Active => Ok(()),
            Ok(Ok(status)) => {
                let status = *status;
                Err(self.failure().unwrap_or(EngineError::SessionClosed {
                    id: self.shared.id.clone(),
                    status,
                }))
            }
            Ok(Err(_)) => Err(EngineError::SessionClosed {
                id: self.shared.id.clone(),
                status: self.status(),
            }),
        }
    }

    /// Writes one user turn to the agent.
    ///
    /// Returns the turn's [`ResultFuture`], completed by the reader when the
    /// agent's `result` arrives or the stream fails. The turn's events go to
    /// the stream returned by [`events`](Session::events); a caller that
    /// does not consume it should use [`query`](Session::query) instead.
    ///
    /// # Errors
    ///
    /// - `EngineError::SessionClosed` if the session is not `Active`
    /// - `EngineError::TurnInProgress` if the previous turn has no result yet
    /// - `EngineError::StdinWrite` / `Cancelled` if the write fails
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        message: impl Into<UserMessage>,
    ) -> Result<ResultFuture> {
        self.send_turn(cancel, message.into())
            .await
            .map(|(future, _)| future)
    }

    /// Like `send`, also returning the turn's 1-based number.
    async fn send_turn(
        &self,
        cancel: &CancellationToken,
        message: UserMessage,
    ) -> Result<(ResultFuture, u64)> {
        let status = self.status();
        if !status.accepts_turns() {
            return Err(self.closed_error(status));
        }

        let future = {
            let mut turn = self.shared.turn();
            if turn.as_ref().is_some_and(|t| !t.is_done()) {
                return Err(EngineError::TurnInProgress(self.shared.id.clone()));
            }
            let future = ResultFuture::new();
            *turn = Some(future.clone());
            future
        };

        let target = {
            let tracking = self.shared.tracking();
            if tracking.agent_session_id.is_empty() {
                self.shared.id.clone()
            } else {
                tracking.agent_session_id.clone()
            }
        };
        let message = message.with_session(&target);
        if let Err(e) = self.write_turn(cancel, &message).await {
            self.abandon_turn(&future, e.clone());
            return Err(e);
        }

        let mut tracking = self.shared.tracking();
        tracking.turns += 1;
        tracking.touch();
        debug!(session_id = %self.shared.id, turn = tracking.turns, "Turn sent");
        Ok((future, tracking.turns))
    }

    async fn write_turn(&self, cancel: &CancellationToken, message: &UserMessage) -> Result<()> {
        let line = message
            .to_line()
            .map_err(|e| EngineError::StdinWrite(e.to_string()))?;

        let mut stdin = self.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            return Err(self.closed_error(self.status()));
        };
        let write = async {
            pipe.write_all(&line).await?;
            pipe.flush().await
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            // Close gave up waiting for the write.
            _ = self.cancel.cancelled() => Err(self.closed_error(self.status())),
            written = write => written.map_err(|e| EngineError::StdinWrite(e.to_string())),
        }
    }

    /// Clears a turn that never reached the agent.
    fn abandon_turn(&self, future: &ResultFuture, error: EngineError) {
        let mut turn = self.shared.turn();
        future.complete(Err(error));
        if turn.as_ref().is_some_and(|t| t.is_done()) {
            *turn = None;
        }
    }

    fn closed_error(&self, status: SessionStatus) -> EngineError {
        EngineError::SessionClosed {
            id: self.shared.id.clone(),
            status,
        }
    }

    /// Takes the session's event stream. Only the first call gets it.
    pub async fn events(&self) -> Option<EventStream> {
        self.events.lock().await.take().map(|parked| parked.stream)
    }

    /// Sends a turn and folds its events into a [`QueryResponse`].
    ///
    /// When the event stream has not been taken, the turn's events are
    /// drained from it, skipping whatever earlier turns left unread;
    /// otherwise only the `result` payload is available and the text comes
    /// from it.
    pub async fn query(
        &self,
        cancel: &CancellationToken,
        message: impl Into<UserMessage>,
    ) -> Result<QueryResponse> {
        let (future, turn) = self.send_turn(cancel, message.into()).await?;
        let acc = Accumulator::new();

        {
            let mut events = self.events.lock().await;
            if let Some(parked) = events.as_mut() {
                while parked.turns_read < turn {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                        next = parked.stream.recv() => next,
                    };
                    let Some(event) = next else { break };
                    if parked.turns_read + 1 == turn {
                        acc.add(&event);
                    } else {
                        debug!(
                            session_id = %self.shared.id,
                            event_type = %event.event_type(),
                            "Skipping unread event from an earlier turn"
                        );
                    }
                    if ends_turn(&event) {
                        parked.turns_read += 1;
                    }
                }
            }
        }

        let result = future.wait(cancel).await?;
        if !acc.is_done() {
            acc.add(&Event::new(
                self.shared.id.clone(),
                EventPayload::Result(Box::new(result)),
                Vec::new(),
            ));
        }
        Ok(acc.response())
    }

    /// Closes the session and reaps its agent.
    ///
    /// Closes stdin so the agent can exit on its own, waits up to the close
    /// grace period, then kills the process group. Returns once the reader
    /// has stopped and the event channel is closed. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let started = self.shared.transition(SessionStatus::Closing);
        if started {
            // EOF on stdin ends the agent's input loop. A write blocked on a
            // full pipe holds the lock; cancelling after the grace ends it.
            match self.stdin.try_lock() {
                Ok(mut stdin) => drop(stdin.take()),
                Err(_) => debug!(session_id = %self.shared.id, "Turn write in progress during close"),
            }
        }

        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut reader) = reader {
            if tokio::time::timeout(self.close_grace, &mut reader).await.is_err() {
                debug!(session_id = %self.shared.id, "Agent still running after close grace, killing");
                self.cancel.cancel();
                if let Err(e) = reader.await {
                    warn!(session_id = %self.shared.id, error = %e, "Reader task failed");
                }
            }
            self.shared.transition(SessionStatus::Closed);
            if let Ok(mut stdin) = self.stdin.try_lock() {
                drop(stdin.take());
            }
        }

        // A concurrent close (or the reader itself) finishes the job.
        let mut rx = self.subscribe_status();
        if rx.wait_for(|s| s.is_terminal()).await.is_err() {
            debug!(session_id = %self.shared.id, "Status channel closed during close");
        }
        Ok(())
    }

    /// Cancels the session: the reader stops and the process group is killed.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // The reader owns the process; cancelling it kills the group.
        self.cancel.cancel();
    }
}

/// Reader task: pumps events, then terminates the stream exactly once.
async fn run_reader(
    shared: Arc<Shared>,
    mut process: AgentProcess,
    mut scanner: LineScanner<tokio::process::ChildStdout>,
    mut sender: EventSender,
    cancel: CancellationToken,
    grace: Duration,
) {
    let mut stats = ReadStats::default();
    let outcome = reader::pump(&mut scanner, &mut sender, &cancel, &mut stats, |event| {
        shared.observe(event)
    })
    .await;
    debug!(
        session_id = %shared.id,
        lines = stats.lines,
        events = stats.events,
        skipped = stats.skipped,
        outcome = ?outcome,
        "Reader stopped"
    );

    match outcome {
        ReadOutcome::Eof => {
            let status = shared.status();
            if matches!(status, SessionStatus::Closing | SessionStatus::Terminating) {
                reader::reap_group(&mut process, grace).await;
                shared.fail(EngineError::SessionClosed {
                    id: shared.id.clone(),
                    status,
                });
            } else {
                let error = match tokio::time::timeout(grace, reader::exit_error(&mut process)).await
                {
                    Ok(error) => error,
                    // Closed stdout but kept running.
                    Err(_) => {
                        reader::reap_group(&mut process, Duration::ZERO).await;
                        reader::exit_error(&mut process).await
                    }
                };
                // Descendants may outlive the leader.
                reader::reap_group(&mut process, Duration::ZERO).await;
                warn!(session_id = %shared.id, error = %error, "Agent exited unexpectedly");
                reader::report_failure(&mut sender, &error);
                shared.fail(error);
                shared.transition(SessionStatus::Error);
            }
        }
        ReadOutcome::Cancelled => {
            let closing = shared.status() == SessionStatus::Closing;
            if !closing {
                shared.transition(SessionStatus::Terminating);
            }
            reader::reap_group(&mut process, grace.min(Duration::from_millis(500))).await;
            if !closing {
                reader::report_failure(&mut sender, &EngineError::Cancelled);
            }
            shared.fail(EngineError::Cancelled);
            if !closing {
                shared.transition(SessionStatus::Closed);
            }
        }
        ReadOutcome::Failed(error) => {
            warn!(session_id = %shared.id, error = %error, "Agent stream failed");
            reader::report_failure(&mut sender, &error);
            shared.fail(error);
            shared.transition(SessionStatus::Error);
            reader::reap_group(&mut process, grace).await;
        }
    }

    if shared.status() == SessionStatus::Error {
        info!(session_id = %shared.id, "Session failed");
    }
    // Dropping the sender closes the event channel, after the reader stopped.
    drop(sender);
}

/// Event types that end a turn on the stream.
pub(crate) fn ends_turn(event: &Event) -> bool {
    matches!(event.event_type(), EventType::Result | EventType::Error)
}
