// Broker transport seam
// The ConnectionManager only knows these traits; `stomp::StompTransport` is the
// production implementation and tests plug in an in-memory one.

use async_trait::async_trait;
use log::debug;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::models::UserId;
use super::reconnect::Epoch;
use super::EngineEvent;

/// Something the transport observed after the session was opened.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A payload arrived on one of our subscriptions. `subscription` is the id
    /// returned by `TransportSession::subscribe`, when the broker reports it.
    Frame {
        subscription: Option<String>,
        destination: String,
        body: String,
    },
    /// The session is gone (socket close, ERROR frame, missed heartbeats)
    Closed { reason: String },
}

/// Handle given to a transport so its read loop can report back to the engine.
/// Every sink is bound to the epoch of the attempt that created it; anything it
/// delivers after that attempt was superseded is discarded by the engine.
#[derive(Clone)]
pub struct SessionSink {
    epoch: Epoch,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl SessionSink {
    pub(crate) fn new(epoch: Epoch, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        SessionSink { epoch, tx }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Forward an inbound payload. Never blocks; returns false once the engine is gone.
    pub fn deliver(&self, destination: impl Into<String>, body: impl Into<String>) -> bool {
        self.send(TransportEvent::Frame {
            subscription: None,
            destination: destination.into(),
            body: body.into(),
        })
    }

    /// Like `deliver`, for a payload tagged with the subscription it arrived on.
    pub fn deliver_subscribed(
        &self,
        subscription: impl Into<String>,
        destination: impl Into<String>,
        body: impl Into<String>,
    ) -> bool {
        self.send(TransportEvent::Frame {
            subscription: Some(subscription.into()),
            destination: destination.into(),
            body: body.into(),
        })
    }

    pub fn closed(&self, reason: impl Into<String>) -> bool {
        self.send(TransportEvent::Closed { reason: reason.into() })
    }

    fn send(&self, event: TransportEvent) -> bool {
        match self.tx.send(EngineEvent::Transport { epoch: self.epoch, event }) {
            Ok(()) => true,
            Err(_) => {
                debug!("Engine dropped, discarding transport event for epoch {}", self.epoch);
                false
            }
        }
    }
}

/// Factory for broker sessions.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open an authenticated session for `identity`. Resolves once the broker
    /// accepted the session; inbound traffic and closure are reported via `sink`.
    async fn open(
        &self,
        identity: UserId,
        sink: SessionSink,
    ) -> Result<Box<dyn TransportSession>, TransportError>;
}

/// An open broker session. All methods queue work and return immediately.
pub trait TransportSession: Send {
    /// Subscribe to `destination`, returning the subscription id.
    fn subscribe(&mut self, destination: &str) -> Result<String, TransportError>;

    fn unsubscribe(&mut self, subscription_id: &str) -> Result<(), TransportError>;

    fn publish(&mut self, destination: &str, body: &str) -> Result<(), TransportError>;

    /// Close the session. Must not report a `Closed` event for an explicit close
    /// that the engine already accounted for; the engine ignores it anyway.
    fn close(&mut self);
}
