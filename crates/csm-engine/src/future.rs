//! One-shot, multi-reader completion of a turn.

use std::sync::Arc;

use csm_protocol::ResultPayload;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};

type Outcome = Option<std::result::Result<ResultPayload, EngineError>>;

/// Completion handle for one turn.
///
/// Completed at most once, by the stream reader, with either the turn's
/// `result` payload or the error that ended the stream. Clones share the
/// same state; any number of them may [`wait`](ResultFuture::wait), before
/// or after completion, and all observe the same outcome.
#[derive(Clone, Debug)]
pub struct ResultFuture {
    tx: Arc<watch::Sender<Outcome>>,
}

impl Default for ResultFuture {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultFuture {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Stores the outcome. Only the first call has an effect; later calls
    /// return false and leave the stored outcome untouched.
    pub fn complete(&self, outcome: std::result::Result<ResultPayload, EngineError>) -> bool {
        let mut outcome = Some(outcome);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        })
    }

    pub fn is_done(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// The outcome, if already complete.
    pub fn try_get(&self) -> Option<Result<ResultPayload>> {
        self.tx.borrow().clone()
    }

    /// Waits for completion or for `cancel`.
    ///
    /// Cancellation returns [`EngineError::Cancelled`] and does not touch the
    /// stored state; a completion that happens later is still seen by other
    /// clones.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<ResultPayload> {
        let mut rx = self.tx.subscribe();
        tokio::select! {
            biased;
            outcome = rx.wait_for(Option::is_some) => match outcome {
                Ok(value) => value.clone().unwrap_or(Err(EngineError::Cancelled)),
                // The sender lives in `self`, so it cannot be dropped here.
                Err(_) => Err(EngineError::Cancelled),
            },
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
        }
    }
}
