//! Background eviction of idle and dead sessions.

use std::sync::Arc;
use std::time::Duration;

use csm_core::SessionStatus;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Inner;
use crate::session::Session;

/// Why a session left the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A caller closed it.
    Explicit,

    /// No activity for longer than the session TTL.
    Idle,

    /// The manager shut down.
    Shutdown,

    /// Its cancellation token fired.
    Cancelled,

    /// The agent exited or its stream failed.
    ProcessExited,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Explicit => write!(f, "explicitly closed"),
            Self::Idle => write!(f, "idle past session TTL"),
            Self::Shutdown => write!(f, "manager shutdown"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::ProcessExited => write!(f, "agent process exited"),
        }
    }
}

/// Why `session` should be evicted now, if at all.
fn eviction_reason(session: &Session, ttl: Option<Duration>) -> Option<CloseReason> {
    match session.status() {
        SessionStatus::Error => Some(CloseReason::ProcessExited),
        SessionStatus::Closed | SessionStatus::Terminating => Some(CloseReason::Cancelled),
        SessionStatus::Creating | SessionStatus::Active => {
            ttl.filter(|ttl| session.idle_for() > *ttl)
                .map(|_| CloseReason::Idle)
        }
        // Someone else is closing it.
        SessionStatus::Closing => None,
    }
}

/// Spawns the periodic sweep; it stops when `token` is cancelled.
pub(super) fn spawn_sweep_task(
    inner: Arc<Inner>,
    ttl: Duration,
    every: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Sweep task stopping");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let evicted = sweep_once(&inner, ttl).await;
            debug!(evicted, "Session sweep finished");
        }
    })
}

/// Evicts idle sessions and drops dead ones. Returns how many left the map.
pub(super) async fn sweep_once(inner: &Inner, ttl: Duration) -> usize {
    evict(inner, Some(ttl)).await
}

/// Drops dead sessions only.
pub(super) async fn prune_dead(inner: &Inner) -> usize {
    evict(inner, None).await
}

async fn evict(inner: &Inner, ttl: Option<Duration>) -> usize {
    let evicted: Vec<(Arc<Session>, CloseReason)> = {
        let mut sessions = inner.sessions.write().await;
        let doomed: Vec<_> = sessions
            .iter()
            .filter_map(|(id, s)| eviction_reason(s, ttl).map(|reason| (id.clone(), reason)))
            .collect();
        doomed
            .into_iter()
            .filter_map(|(id, reason)| sessions.remove(&id).map(|s| (s, reason)))
            .collect()
    };

    let count = evicted.len();
    if count > 0 {
        info!(count, "Evicting sessions");
        close_sessions(evicted).await;
    }
    count
}

/// Closes sessions concurrently, outside any lock. Returns how many closed.
pub(super) async fn close_sessions(sessions: Vec<(Arc<Session>, CloseReason)>) -> usize {
    let mut set = JoinSet::new();
    for (session, reason) in sessions {
        set.spawn(async move {
            let result = session.close().await;
            (session.id().clone(), reason, result)
        });
    }

    let mut closed = 0;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((id, reason, Ok(()))) => {
                closed += 1;
                info!(session_id = %id, reason = %reason, "Session closed");
            }
            Ok((id, reason, Err(e))) => {
                warn!(session_id = %id, reason = %reason, error = %e, "Failed to close session");
            }
            Err(e) => warn!(error = %e, "Close task failed"),
        }
    }
    closed
}
