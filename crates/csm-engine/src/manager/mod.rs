//! Session pool with a capacity limit and idle eviction.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  create/get/close  ┌───────────────────────────────┐
//! │    caller    │───────────────────▶│ RwLock<HashMap<Id, Session>>  │
//! └──────────────┘                    └───────────────────────────────┘
//!                                        ▲ write lock   │ close (outside lock)
//!                                 ┌──────┴──────┐       ▼
//!                                 │ sweep task  │  Session ─▶ agent process group
//!                                 └─────────────┘
//! ```
//!
//! Reads (`get`, `list`, `count`, `info`) take the read lock. Mutations
//! (`create`, `close`, sweep eviction) take the write lock; a session is
//! removed from the map under the lock and closed after releasing it, so an
//! explicit close and a sweep can never both close the same entry.
//!
//! # Panic-Free Guarantees
//!
//! No `.unwrap()`/`.expect()` outside tests. Errors from individual
//! sessions during `close_all` and sweeps are logged, not propagated.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use csm_core::SessionId;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{ClaudeCommand, CommandBuilder, LaunchMode};
use crate::config::{EngineConfig, SessionOptions};
use crate::error::{EngineError, Result};
use crate::session::{Session, SessionInfo};

mod sweep;

pub use sweep::CloseReason;

/// State shared between the manager and its sweep task.
pub(crate) struct Inner {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    config: EngineConfig,
    defaults: SessionOptions,
    builder: Arc<dyn CommandBuilder>,
}

/// Owns a set of sessions keyed by id.
///
/// At most `max_sessions` sessions are live (`Creating` or `Active`) at a
/// time. Closed and failed sessions may linger in the map until the next
/// `create` or sweep prunes them, but lookups treat them as absent.
pub struct SessionManager {
    inner: Arc<Inner>,
    sweep: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SessionManager {
    /// Creates a manager that launches agents with `builder`.
    ///
    /// Starts the idle sweep unless `session_ttl_secs` is 0. Must be called
    /// within a tokio runtime.
    ///
    /// # Errors
    ///
    /// `EngineError::Config` if the configuration does not validate.
    pub fn new(config: EngineConfig, builder: Arc<dyn CommandBuilder>) -> Result<Self> {
        config.validate()?;
        let inner = Arc::new(Inner {
            sessions: RwLock::new(HashMap::new()),
            defaults: config.session_defaults(),
            config,
            builder,
        });

        let sweep = inner.config.session_ttl().map(|ttl| {
            let token = CancellationToken::new();
            let handle = sweep::spawn_sweep_task(
                Arc::clone(&inner),
                ttl,
                inner.config.cleanup_interval(),
                token.clone(),
            );
            (token, handle)
        });
        if sweep.is_none() {
            debug!("Session TTL disabled, no sweep task started");
        }

        Ok(Self {
            inner,
            sweep: Mutex::new(sweep),
        })
    }

    /// Creates a manager that launches the configured Claude binary.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let builder = Arc::new(ClaudeCommand::new(config.binary.clone()));
        Self::new(config, builder)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// True while the background sweep is running.
    pub fn has_sweep(&self) -> bool {
        self.sweep
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Starts a new session.
    ///
    /// `opts` is merged over the manager's defaults. The session id is
    /// `opts.session_id`, else `opts.resume`, else a fresh UUID; unless
    /// resuming, it is passed to the agent as its session id. Cancelling
    /// `cancel` later tears the session down.
    ///
    /// # Errors
    ///
    /// - `EngineError::CapacityExceeded` when `max_sessions` are live; nothing
    ///   is spawned
    /// - `EngineError::SessionExists` if a live session has the same id
    /// - `EngineError::ProcessStart` if the agent cannot be started
    /// - `EngineError::InitTimeout` / `Cancelled` when waiting for `init`
    pub async fn create(
        &self,
        cancel: &CancellationToken,
        opts: SessionOptions,
    ) -> Result<Arc<Session>> {
        let mut opts = opts.merged_over(&self.inner.defaults);
        let id = opts
            .session_id
            .clone()
            .or_else(|| opts.resume.clone())
            .unwrap_or_else(|| SessionId::new(uuid::Uuid::new_v4().to_string()));
        // The agent must know the id for a later resume to find it.
        if opts.resume.is_none() {
            opts.session_id = Some(id.clone());
        }

        let session = {
            let mut sessions = self.inner.sessions.write().await;
            sessions.retain(|_, s| !s.status().is_terminal());

            let live = sessions.values().filter(|s| s.is_live()).count();
            let max = self.inner.config.max_sessions;
            if live >= max {
                warn!(max, "Session limit reached, rejecting create");
                return Err(EngineError::CapacityExceeded { max });
            }
            if sessions.get(&id).is_some_and(|s| s.is_live()) {
                return Err(EngineError::SessionExists(id));
            }

            let spec = self.inner.builder.build(&opts, &LaunchMode::Interactive);
            let session = Arc::new(Session::start(
                id.clone(),
                &spec,
                &self.inner.config,
                opts.wait_for_init,
                cancel,
            )?);
            sessions.insert(id.clone(), Arc::clone(&session));
            session
        };
        info!(session_id = %id, "Session created");

        if opts.wait_for_init {
            if let Err(e) = session
                .wait_ready(cancel, self.inner.config.init_timeout())
                .await
            {
                warn!(session_id = %id, error = %e, "Session failed to initialize");
                self.remove_entry(&id, &session).await;
                if let Err(close_err) = session.close().await {
                    debug!(session_id = %id, error = %close_err, "Close after failed init");
                }
                return Err(e);
            }
        }
        Ok(session)
    }

    /// Removes `id` only if it still maps to `session`.
    async fn remove_entry(&self, id: &SessionId, session: &Arc<Session>) {
        let mut sessions = self.inner.sessions.write().await;
        if sessions.get(id).is_some_and(|s| Arc::ptr_eq(s, session)) {
            sessions.remove(id);
        }
    }

    /// Looks up a live session.
    ///
    /// # Errors
    ///
    /// `EngineError::SessionNotFound` for unknown, closed or failed ids.
    pub async fn get(&self, id: &SessionId) -> Result<Arc<Session>> {
        let sessions = self.inner.sessions.read().await;
        sessions
            .get(id)
            .filter(|s| s.is_live())
            .cloned()
            .ok_or_else(|| EngineError::SessionNotFound(id.clone()))
    }

    /// Returns the live session `id`, or starts one that resumes it.
    pub async fn resume(
        &self,
        cancel: &CancellationToken,
        id: &SessionId,
        mut opts: SessionOptions,
    ) -> Result<Arc<Session>> {
        if let Ok(session) = self.get(id).await {
            debug!(session_id = %id, "Resume found live session");
            return Ok(session);
        }
        opts.session_id = None;
        opts.resume = Some(id.clone());
        self.create(cancel, opts).await
    }

    /// Closes one session.
    ///
    /// # Errors
    ///
    /// `EngineError::SessionNotFound` if `id` is unknown or no longer live.
    pub async fn close(&self, id: &SessionId) -> Result<()> {
        let session = {
            let mut sessions = self.inner.sessions.write().await;
            match sessions.remove(id) {
                Some(session) if session.is_live() => session,
                _ => return Err(EngineError::SessionNotFound(id.clone())),
            }
        };
        session.close().await?;
        info!(session_id = %id, reason = %CloseReason::Explicit, "Session closed");
        Ok(())
    }

    /// Closes every tracked session. Best effort: a failing close is
    /// logged and the rest proceed. Returns the number closed.
    pub async fn close_all(&self) -> usize {
        self.close_all_with(CloseReason::Explicit).await
    }

    async fn close_all_with(&self, reason: CloseReason) -> usize {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.inner.sessions.write().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        sweep::close_sessions(drained.into_iter().map(|s| (s, reason)).collect()).await
    }

    /// Snapshots of all live sessions.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.inner.sessions.read().await;
        sessions
            .values()
            .filter(|s| s.is_live())
            .map(|s| s.info())
            .collect()
    }

    /// Number of live sessions.
    pub async fn count(&self) -> usize {
        let sessions = self.inner.sessions.read().await;
        sessions.values().filter(|s| s.is_live()).count()
    }

    /// Snapshot of one live session.
    pub async fn info(&self, id: &SessionId) -> Result<SessionInfo> {
        self.get(id).await.map(|s| s.info())
    }

    /// Runs one eviction pass now. Returns the number of sessions removed.
    pub async fn sweep_now(&self) -> usize {
        match self.inner.config.session_ttl() {
            Some(ttl) => sweep::sweep_once(&self.inner, ttl).await,
            None => sweep::prune_dead(&self.inner).await,
        }
    }

    /// Stops the sweep and closes every session.
    pub async fn shutdown(&self) -> usize {
        let sweep = self
            .sweep
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((token, handle)) = sweep {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Sweep task failed");
            }
        }
        let closed = self.close_all_with(CloseReason::Shutdown).await;
        info!(closed, "Session manager shut down");
        closed
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some((token, _)) = self
            .sweep
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("max_sessions", &self.inner.config.max_sessions)
            .field("sweep", &self.has_sweep())
            .finish()
    }
}
