//! Bounded event channel from a stream reader to its consumer.
//!
//! There is exactly one [`EventSender`] per stream, owned by the reader
//! task. The channel closes when that task drops it, which only happens
//! after the reader has stopped, so consumers never race a late send.

use csm_core::SessionId;
use csm_protocol::Event;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Creates a channel holding up to `capacity` undelivered events.
pub fn channel(capacity: usize) -> (EventSender, EventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        EventSender {
            tx,
            session_id: SessionId::default(),
        },
        EventStream { rx },
    )
}

/// Producer half. Stamps the stream's session id onto events that lack one.
#[derive(Debug)]
pub struct EventSender {
    tx: mpsc::Sender<Event>,
    session_id: SessionId,
}

/// Outcome of [`EventSender::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The consumer dropped its stream; the event was discarded.
    NoReceiver,
    /// The channel had no room and the sender could not wait.
    Full,
    Cancelled,
}

impl EventSender {
    /// The most recent id seen on this stream; empty until one arrives.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Presets the id, e.g. when the caller chose it before launch.
    pub fn set_session_id(&mut self, id: SessionId) {
        self.session_id = id;
    }

    /// Fills in a missing session id, or remembers a new one.
    pub fn stamp(&mut self, event: &mut Event) {
        if event.session_id.is_empty() {
            event.session_id = self.session_id.clone();
        } else if event.session_id != self.session_id {
            self.session_id = event.session_id.clone();
        }
    }

    /// Stamps and delivers one event, waiting for room in the channel.
    ///
    /// A dropped receiver is not an error: the reader keeps draining the
    /// agent so the turn can still complete.
    pub async fn send(&mut self, mut event: Event, cancel: &CancellationToken) -> Delivery {
        self.stamp(&mut event);
        if self.tx.is_closed() {
            return Delivery::NoReceiver;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Delivery::Cancelled,
            sent = self.tx.send(event) => match sent {
                Ok(()) => Delivery::Delivered,
                Err(_) => Delivery::NoReceiver,
            },
        }
    }

    /// Delivers without waiting; used for the final error event, when
    /// cancellation may already have fired.
    pub fn try_send_final(&mut self, mut event: Event) -> Delivery {
        self.stamp(&mut event);
        match self.tx.try_send(event) {
            Ok(()) => Delivery::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::NoReceiver,
        }
    }
}

/// Consumer half, read-only to the caller.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<Event>,
}

impl EventStream {
    /// Next event in emission order; `None` once the reader has stopped
    /// and everything has been delivered.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Collects every remaining event.
    pub async fn collect(mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        events
    }
}
