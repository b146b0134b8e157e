// Connection management for the sync engine
// Owns the broker session, its three subscriptions, and the reconnect timer.
// All methods run on the engine's single owner; asynchronous work (opening the
// transport, waiting out a backoff) is spawned and reports back as EngineEvents.

use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{SyncError, TransportError};
use crate::models::UserId;
use super::reconnect::{
    ConnectionMachine, ConnectionState, Epoch, LossOutcome, ReconnectPolicy, Transition,
};
use super::transport::{SessionSink, Transport, TransportEvent, TransportSession};
use super::wire::{decode_inbound, Channel, InboundEvent, OutboundCommand};
use super::EngineEvent;

/// Connection-state callback, invoked once per transition.
pub type StateCallback = Box<dyn FnMut(ConnectionState) + Send>;

/// Settles when the connection first reaches CONNECTED, FAILED, or is
/// cancelled by `disconnect()`.
pub struct PendingConnect {
    rx: oneshot::Receiver<Result<(), SyncError>>,
}

impl PendingConnect {
    /// Wait for the outcome. The engine must keep being pumped meanwhile.
    pub async fn wait(self) -> Result<(), SyncError> {
        self.rx.await.unwrap_or(Err(SyncError::Cancelled))
    }

    /// Non-blocking check; `None` while still pending.
    pub fn try_result(&mut self) -> Option<Result<(), SyncError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(SyncError::Cancelled)),
        }
    }
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    machine: ConnectionMachine,
    identity: Option<UserId>,
    on_state: Option<StateCallback>,
    session: Option<Box<dyn TransportSession>>,
    subscriptions: Vec<(Channel, String)>,
    open_task: Option<JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,
    pending: Vec<oneshot::Sender<Result<(), SyncError>>>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        policy: ReconnectPolicy,
        events_tx: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        ConnectionManager {
            transport,
            machine: ConnectionMachine::new(policy),
            identity: None,
            on_state: None,
            session: None,
            subscriptions: Vec::new(),
            open_task: None,
            retry_timer: None,
            pending: Vec::new(),
            events_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    pub fn is_connected(&self) -> bool {
        self.machine.state() == ConnectionState::Connected
    }

    pub fn identity(&self) -> Option<UserId> {
        self.identity
    }

    /// Consecutive failed attempts since the last successful connect.
    pub fn attempt(&self) -> u32 {
        self.machine.attempt()
    }

    pub fn epoch(&self) -> Epoch {
        self.machine.epoch()
    }

    pub fn retry_scheduled(&self) -> bool {
        self.retry_timer.is_some()
    }

    /// Active subscription ids by channel.
    pub fn subscriptions(&self) -> &[(Channel, String)] {
        &self.subscriptions
    }

    /// Start a session for `identity`. The returned handle settles later;
    /// state changes are reported through `on_state`.
    pub fn connect(
        &mut self,
        identity: UserId,
        on_state: StateCallback,
    ) -> Result<PendingConnect, SyncError> {
        let transition = self.machine.begin_connect()?;
        info!("Connecting to broker as user {}", identity);

        self.identity = Some(identity);
        self.on_state = Some(on_state);
        let (tx, rx) = oneshot::channel();
        self.pending.push(tx);

        self.emit(transition);
        self.spawn_open();
        Ok(PendingConnect { rx })
    }

    /// Tear the session down. Cancels the retry timer and any open in flight,
    /// releases subscriptions, and settles pending connects with `Cancelled`.
    pub fn disconnect(&mut self) {
        self.cancel_retry();
        if let Some(task) = self.open_task.take() {
            task.abort();
        }

        if let Some(mut session) = self.session.take() {
            for (channel, id) in self.subscriptions.drain(..) {
                if let Err(e) = session.unsubscribe(&id) {
                    debug!("Failed to unsubscribe {:?} ({}): {}", channel, id, e);
                }
            }
            session.close();
        }
        self.subscriptions.clear();

        if let Some(transition) = self.machine.reset() {
            info!("Disconnected from broker");
            self.emit(transition);
        }

        for tx in self.pending.drain(..) {
            let _ = tx.send(Err(SyncError::Cancelled));
        }
        self.on_state = None;
        self.identity = None;
    }

    /// Publish a command. Only valid while CONNECTED; never queues.
    pub fn send(&mut self, command: &OutboundCommand) -> Result<(), SyncError> {
        if self.machine.state() != ConnectionState::Connected {
            debug!("Rejecting {:?}: not connected ({:?})", command.kind(), self.machine.state());
            return Err(SyncError::NotConnected);
        }
        let session = self.session.as_mut().ok_or(SyncError::NotConnected)?;

        let body = command.encode()?;
        session.publish(command.destination(), &body)?;
        debug!("Published {:?} to {}", command.kind(), command.destination());
        Ok(())
    }

    /// Result of a transport open started by `spawn_open`.
    pub fn handle_opened(
        &mut self,
        epoch: Epoch,
        result: Result<Box<dyn TransportSession>, TransportError>,
    ) {
        if !self.machine.is_current(epoch) {
            if let Ok(mut session) = result {
                debug!("Closing session from stale attempt (epoch {})", epoch);
                session.close();
            }
            return;
        }
        self.open_task = None;

        match result {
            Ok(session) => self.on_established(session),
            Err(e) => {
                warn!("Failed to open broker session: {}", e);
                self.on_lost();
            }
        }
    }

    /// Inbound traffic or closure reported by the live session. Returns the
    /// decoded event for frames on our queues.
    pub fn handle_transport(&mut self, epoch: Epoch, event: TransportEvent) -> Option<InboundEvent> {
        if !self.machine.is_current(epoch) {
            debug!("Ignoring transport event from stale epoch {}", epoch);
            return None;
        }

        match event {
            TransportEvent::Frame { subscription, destination, body } => {
                let channel = match self.classify(subscription.as_deref(), &destination) {
                    Some(channel) => channel,
                    None => {
                        warn!(
                            "Frame on unexpected destination {} (subscription {:?})",
                            destination, subscription
                        );
                        return None;
                    }
                };
                match decode_inbound(channel, &body) {
                    Ok(event) => Some(event),
                    Err(e) => {
                        warn!("Dropping undecodable {:?} payload: {}", channel, e);
                        None
                    }
                }
            }
            TransportEvent::Closed { reason } => {
                warn!("Broker session closed: {}", reason);
                self.on_lost();
                None
            }
        }
    }

    /// Which queue a frame belongs to. The subscription id is authoritative;
    /// brokers rewrite user destinations, so the destination is only a fallback.
    fn classify(&self, subscription: Option<&str>, destination: &str) -> Option<Channel> {
        if let Some(id) = subscription {
            return self
                .subscriptions
                .iter()
                .find(|(_, sub)| sub == id)
                .map(|(channel, _)| *channel);
        }
        Channel::from_destination(destination, self.identity?)
    }

    /// Backoff timer fired.
    pub fn handle_reconnect_due(&mut self, epoch: Epoch) {
        if !self.machine.is_current(epoch) || self.machine.state() != ConnectionState::Reconnecting {
            debug!("Ignoring stale reconnect timer (epoch {})", epoch);
            return;
        }
        self.retry_timer = None;

        info!(
            "Reconnecting (attempt {}/{})",
            self.machine.attempt(),
            self.machine.policy().max_attempts
        );
        self.spawn_open();
    }

    fn on_established(&mut self, mut session: Box<dyn TransportSession>) {
        let identity = match self.identity {
            Some(identity) => identity,
            None => {
                session.close();
                return;
            }
        };

        let mut subscriptions = Vec::with_capacity(Channel::ALL.len());
        for channel in Channel::ALL {
            match session.subscribe(&channel.destination(identity)) {
                Ok(id) => subscriptions.push((channel, id)),
                Err(e) => {
                    error!("Failed to subscribe to {:?}: {}", channel, e);
                    session.close();
                    self.on_lost();
                    return;
                }
            }
        }
        self.session = Some(session);
        self.subscriptions = subscriptions;

        if let Some(transition) = self.machine.established() {
            info!("Connected to broker as user {}", identity);
            self.emit(transition);
        }
        for tx in self.pending.drain(..) {
            let _ = tx.send(Ok(()));
        }
    }

    fn on_lost(&mut self) {
        // The session is dead; closing is enough, unsubscribing would go nowhere
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        self.subscriptions.clear();

        let (outcome, transition) = self.machine.lost();
        if let Some(transition) = transition {
            self.emit(transition);
        }

        match outcome {
            LossOutcome::Retry { attempt, delay } => {
                info!(
                    "Attempting to reconnect in {}ms (attempt {}/{})",
                    delay.as_millis(),
                    attempt,
                    self.machine.policy().max_attempts
                );
                self.schedule_retry(delay);
            }
            LossOutcome::Exhausted { attempts } => {
                error!("Max reconnection attempts reached ({})", attempts);
                self.cancel_retry();
                for tx in self.pending.drain(..) {
                    let _ = tx.send(Err(SyncError::ExhaustedRetries { attempts }));
                }
            }
            LossOutcome::Ignored => {}
        }
    }

    fn spawn_open(&mut self) {
        let identity = match self.identity {
            Some(identity) => identity,
            None => return,
        };
        let epoch = self.machine.epoch();
        let sink = SessionSink::new(epoch, self.events_tx.clone());
        let transport = self.transport.clone();
        let events_tx = self.events_tx.clone();

        if let Some(task) = self.open_task.take() {
            task.abort();
        }
        self.open_task = Some(tokio::spawn(async move {
            let result = transport.open(identity, sink).await;
            if events_tx.send(EngineEvent::Opened { epoch, result }).is_err() {
                debug!("Engine dropped before transport open completed");
            }
        }));
    }

    fn schedule_retry(&mut self, delay: Duration) {
        self.cancel_retry();
        let epoch = self.machine.epoch();
        let events_tx = self.events_tx.clone();
        self.retry_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events_tx.send(EngineEvent::ReconnectDue { epoch });
        }));
    }

    fn cancel_retry(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }

    fn emit(&mut self, transition: Transition) {
        debug!("Connection state {:?} -> {:?}", transition.from, transition.to);
        if let Some(callback) = self.on_state.as_mut() {
            callback(transition.to);
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.cancel_retry();
        if let Some(task) = self.open_task.take() {
            task.abort();
        }
        if let Some(mut session) = self.session.take() {
            session.close();
        }
    }
}
