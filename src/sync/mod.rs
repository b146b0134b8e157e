// Client-side synchronization engine
// This file is the entry point for the sync engine: it owns the connection,
// the message store, the typing tracker and the conversation directory, and
// routes events and commands between them.
//
// Everything mutable lives behind `&mut SyncEngine`. Background tasks (socket
// I/O, transport opens, timers) only post EngineEvents to one queue, and the
// owner applies them one at a time with `pump()` / `handle_event()`.

use anyhow::Result;
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod connection;
pub mod directory;
pub mod message_store;
pub mod reconnect;
pub mod transport;
pub mod typing;
pub mod wire;

pub use connection::{ConnectionManager, PendingConnect, StateCallback};
pub use directory::ConversationDirectory;
pub use message_store::{AddOutcome, MessageStore, StatusOutcome};
pub use reconnect::{ConnectionState, ReconnectPolicy};
pub use transport::{SessionSink, Transport, TransportEvent, TransportSession};
pub use typing::{TypingSignal, TypingTracker};
pub use wire::{CommandKind, InboundEvent, OutboundCommand};

use crate::api::ChatApi;
use crate::config::SyncConfig;
use crate::error::{SyncError, TransportError};
use crate::models::{
    ChatMessageRequest, ConversationEntry, Message, MessageId, MessageStatus, PeerSummary,
    ReceiptRequest, TypingNotification, UserId,
};
use reconnect::Epoch;

/// Everything that can wake the engine up.
pub enum EngineEvent {
    /// A transport open attempt finished
    Opened {
        epoch: Epoch,
        result: Result<Box<dyn TransportSession>, TransportError>,
    },
    /// Traffic or closure from a session
    Transport { epoch: Epoch, event: TransportEvent },
    /// Backoff elapsed
    ReconnectDue { epoch: Epoch },
    LocalTypingIdle { peer: UserId, generation: u64 },
    RemoteTypingExpired { peer: UserId, generation: u64 },
}

impl fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineEvent::Opened { epoch, result } => f
                .debug_struct("Opened")
                .field("epoch", epoch)
                .field("ok", &result.is_ok())
                .finish(),
            EngineEvent::Transport { epoch, event } => f
                .debug_struct("Transport")
                .field("epoch", epoch)
                .field("event", event)
                .finish(),
            EngineEvent::ReconnectDue { epoch } => {
                f.debug_struct("ReconnectDue").field("epoch", epoch).finish()
            }
            EngineEvent::LocalTypingIdle { peer, generation } => f
                .debug_struct("LocalTypingIdle")
                .field("peer", peer)
                .field("generation", generation)
                .finish(),
            EngineEvent::RemoteTypingExpired { peer, generation } => f
                .debug_struct("RemoteTypingExpired")
                .field("peer", peer)
                .field("generation", generation)
                .finish(),
        }
    }
}

/// What an applied event changed, for the embedding UI to re-render.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncUpdate {
    /// A message was appended to or merged into `peer`'s log
    MessageStored { peer: UserId, id: MessageId, outcome: AddOutcome },
    StatusChanged { peer: UserId, id: MessageId, status: MessageStatus },
    RemoteTyping { peer: UserId, is_typing: bool },
    /// Connection lifecycle moved; see `SyncEngine::connection_state`
    Connection(ConnectionState),
}

/// One chat session: connection, stores and timers for a single identity.
pub struct SyncEngine {
    config: SyncConfig,
    connection: ConnectionManager,
    messages: MessageStore,
    typing: TypingTracker,
    directory: ConversationDirectory,
    local_user: Option<UserId>,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
}

impl SyncEngine {
    pub fn new(transport: Arc<dyn Transport>, config: SyncConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let policy = ReconnectPolicy {
            base_delay: config.reconnect_base_delay(),
            max_attempts: config.max_reconnect_attempts,
        };

        SyncEngine {
            connection: ConnectionManager::new(transport, policy, events_tx.clone()),
            typing: TypingTracker::new(config.typing_idle(), config.remote_typing_ttl(), events_tx),
            messages: MessageStore::new(),
            directory: ConversationDirectory::new(),
            local_user: None,
            events_rx,
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn local_user(&self) -> Option<UserId> {
        self.local_user
    }

    // ---------------------------------------------------------------------
    // Connection lifecycle
    // ---------------------------------------------------------------------

    /// Connect as `identity`. `on_state` sees every connection transition,
    /// including those of later automatic reconnects.
    pub fn connect<F>(&mut self, identity: UserId, on_state: F) -> Result<PendingConnect, SyncError>
    where
        F: FnMut(ConnectionState) + Send + 'static,
    {
        // A rejected connect leaves the current session and its stores intact
        let pending = self.connection.connect(identity, Box::new(on_state))?;
        if let Some(previous) = self.local_user {
            if previous != identity {
                // A different user in the same engine starts from a clean slate
                info!("Switching session from user {} to {}", previous, identity);
                self.clear_stores();
            }
        }
        self.local_user = Some(identity);
        Ok(pending)
    }

    /// Drop the broker session. Stores are kept; see `teardown`.
    pub fn disconnect(&mut self) {
        self.connection.disconnect();
    }

    /// Logout: disconnect and forget everything held for the session.
    pub fn teardown(&mut self) {
        self.connection.disconnect();
        self.clear_stores();
        self.local_user = None;
        info!("Chat session torn down");
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    // ---------------------------------------------------------------------
    // Event loop
    // ---------------------------------------------------------------------

    /// Wait for the next event and apply it, returning what it changed.
    /// Returns `None` only if every event source is gone.
    pub async fn pump(&mut self) -> Option<Vec<SyncUpdate>> {
        let event = self.events_rx.recv().await?;
        Some(self.handle_event(event))
    }

    /// Apply every event that is already queued, without waiting.
    pub fn drain_ready(&mut self) -> Vec<SyncUpdate> {
        let mut updates = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            updates.extend(self.handle_event(event));
        }
        updates
    }

    /// Apply one event. Each event's mutations complete before the next one.
    pub fn handle_event(&mut self, event: EngineEvent) -> Vec<SyncUpdate> {
        match event {
            EngineEvent::Opened { epoch, result } => {
                let before = self.connection.state();
                self.connection.handle_opened(epoch, result);
                self.connection_update(before)
            }
            EngineEvent::Transport { epoch, event } => {
                let before = self.connection.state();
                match self.connection.handle_transport(epoch, event) {
                    Some(inbound) => self.apply_inbound(inbound),
                    None => self.connection_update(before),
                }
            }
            EngineEvent::ReconnectDue { epoch } => {
                self.connection.handle_reconnect_due(epoch);
                Vec::new()
            }
            EngineEvent::LocalTypingIdle { peer, generation } => {
                if let Some(signal) = self.typing.local_idle(peer, generation) {
                    self.publish_typing(signal);
                }
                Vec::new()
            }
            EngineEvent::RemoteTypingExpired { peer, generation } => {
                if self.typing.remote_expired(peer, generation) {
                    vec![SyncUpdate::RemoteTyping { peer, is_typing: false }]
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn connection_update(&self, before: ConnectionState) -> Vec<SyncUpdate> {
        let after = self.connection.state();
        if after != before {
            vec![SyncUpdate::Connection(after)]
        } else {
            Vec::new()
        }
    }

    fn apply_inbound(&mut self, event: InboundEvent) -> Vec<SyncUpdate> {
        let me = match self.local_user {
            Some(me) => me,
            None => return Vec::new(),
        };
        match event {
            InboundEvent::Message(message) => self.apply_message(me, message),
            InboundEvent::StatusUpdate(notification) => {
                match self.messages.update_status(&notification.message_id, notification.status) {
                    StatusOutcome::Applied { peer, to, .. } => vec![SyncUpdate::StatusChanged {
                        peer,
                        id: notification.message_id,
                        status: to,
                    }],
                    StatusOutcome::Stale | StatusOutcome::Unknown => Vec::new(),
                }
            }
            InboundEvent::Typing(notification) => {
                let peer = notification.sender_id;
                if self.typing.on_remote_typing(peer, notification.is_typing) {
                    vec![SyncUpdate::RemoteTyping { peer, is_typing: notification.is_typing }]
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn apply_message(&mut self, me: UserId, message: Message) -> Vec<SyncUpdate> {
        let peer = message.peer_of(me);
        let incoming = !message.is_from(me);
        let needs_delivery_ack = incoming
            && message.receiver_id == me
            && message.status == MessageStatus::Sent
            && self.config.auto_ack_delivery;

        let outcome = self.messages.add_message(peer, message.clone());
        // Own echoes and corrections never count as unread
        let count_unread = incoming && outcome == AddOutcome::Appended;
        self.directory.apply_incoming_message(peer, &message, count_unread);

        let typing_cleared = incoming && self.typing.on_remote_typing(peer, false);
        if typing_cleared {
            debug!("Cleared typing indicator of {} on new message", peer);
        }

        if needs_delivery_ack {
            let receipt = OutboundCommand::MarkDelivered(ReceiptRequest {
                message_id: message.id.clone(),
                sender_id: message.sender_id,
            });
            if let Err(e) = self.connection.send(&receipt) {
                warn!("Could not acknowledge delivery of {}: {}", message.id, e);
            }
        }

        let mut updates = vec![SyncUpdate::MessageStored { peer, id: message.id, outcome }];
        if typing_cleared {
            updates.push(SyncUpdate::RemoteTyping { peer, is_typing: false });
        }
        updates
    }

    // ---------------------------------------------------------------------
    // Commands
    // ---------------------------------------------------------------------

    fn require_user(&self) -> Result<UserId, SyncError> {
        match self.local_user {
            Some(user) if self.connection.is_connected() => Ok(user),
            _ => Err(SyncError::NotConnected),
        }
    }

    /// Publish a chat message. The message shows up in the store when the
    /// broker echoes it back with its server id.
    pub fn send_message(&mut self, peer: UserId, content: &str) -> Result<(), SyncError> {
        let me = self.require_user()?;
        if let Some(signal) = self.typing.stop_local_typing(peer) {
            self.publish_typing(signal);
        }
        self.connection.send(&OutboundCommand::SendMessage(ChatMessageRequest {
            sender_id: me,
            receiver_id: peer,
            content: content.to_string(),
        }))
    }

    /// A local keystroke in the conversation with `peer`.
    pub fn notify_typing(&mut self, peer: UserId) {
        if let Some(signal) = self.typing.notify_local_typing(peer) {
            self.publish_typing(signal);
        }
    }

    fn publish_typing(&mut self, signal: TypingSignal) {
        let me = match self.local_user {
            Some(me) => me,
            None => return,
        };
        let command = OutboundCommand::SetTyping(TypingNotification {
            sender_id: me,
            receiver_id: signal.peer,
            is_typing: signal.is_typing,
        });
        // Advisory only, so a dropped indicator is not worth surfacing
        if let Err(e) = self.connection.send(&command) {
            debug!("Typing indicator for {} not sent: {}", signal.peer, e);
        }
    }

    /// Tell `sender` their message reached us.
    pub fn mark_delivered(&mut self, message_id: MessageId, sender: UserId) -> Result<(), SyncError> {
        self.require_user()?;
        self.connection.send(&OutboundCommand::MarkDelivered(ReceiptRequest {
            message_id,
            sender_id: sender,
        }))
    }

    /// Tell `sender` we read their message.
    pub fn mark_message_read(&mut self, message_id: MessageId, sender: UserId) -> Result<(), SyncError> {
        self.require_user()?;
        self.connection.send(&OutboundCommand::MarkRead(ReceiptRequest {
            message_id,
            sender_id: sender,
        }))
    }

    /// Send READ receipts for every message from `peer` not yet known as read.
    /// Returns how many receipts were published.
    pub fn send_read_receipts(&mut self, peer: UserId) -> Result<usize, SyncError> {
        let me = self.require_user()?;
        let unread: Vec<(MessageId, UserId)> = self
            .messages
            .get(peer)
            .iter()
            .filter(|m| m.receiver_id == me && m.status < MessageStatus::Read)
            .map(|m| (m.id.clone(), m.sender_id))
            .collect();

        for (id, sender) in &unread {
            self.connection.send(&OutboundCommand::MarkRead(ReceiptRequest {
                message_id: id.clone(),
                sender_id: *sender,
            }))?;
        }
        Ok(unread.len())
    }

    /// Reset the unread badge for `peer`. Message statuses are left alone;
    /// they only change when receipts come back from the broker.
    pub fn mark_read(&mut self, peer: UserId) {
        self.directory.mark_read(peer);
    }

    pub fn set_active_conversation(&mut self, peer: Option<UserId>) {
        self.directory.set_active(peer);
        if let Some(peer) = peer {
            self.directory.mark_read(peer);
        }
    }

    /// Open a conversation chosen from search results.
    pub fn select_search_result(&mut self, peer: &PeerSummary) -> ConversationEntry {
        self.directory.upsert_from_search(peer).clone()
    }

    // ---------------------------------------------------------------------
    // REST collaborators
    // ---------------------------------------------------------------------

    /// Load the conversation directory for the connected user.
    pub async fn bootstrap(&mut self, api: &dyn ChatApi) -> Result<()> {
        let me = self.local_user.ok_or(SyncError::NotConnected)?;
        let entries = api.conversations(me).await?;
        info!("Loaded {} conversations for user {}", entries.len(), me);
        self.directory.bootstrap(entries);
        Ok(())
    }

    /// Make `peer` the active conversation, load its latest history page and
    /// mark it read on the server and locally.
    pub async fn open_conversation(&mut self, api: &dyn ChatApi, peer: UserId) -> Result<()> {
        let me = self.local_user.ok_or(SyncError::NotConnected)?;
        self.directory.set_active(Some(peer));

        let page = api
            .conversation_history(me, peer, 0, self.config.history_page_size)
            .await?;
        self.messages.load_history(peer, 0, page.content);

        api.mark_conversation_read(me, peer).await?;
        self.directory.mark_read(peer);
        Ok(())
    }

    /// Load an older history page for `peer`. Returns false when the server
    /// reports no further pages.
    pub async fn load_older(&mut self, api: &dyn ChatApi, peer: UserId, page: u32) -> Result<bool> {
        let me = self.local_user.ok_or(SyncError::NotConnected)?;
        let history = api
            .conversation_history(me, peer, page, self.config.history_page_size)
            .await?;
        let more = !history.last;
        self.messages.load_history(peer, page, history.content);
        Ok(more)
    }

    /// Search users by name or email, leaving out the local user.
    pub async fn search_users(&self, api: &dyn ChatApi, query: &str) -> Result<Vec<PeerSummary>> {
        let results = api.search_users(query).await?;
        Ok(results
            .into_iter()
            .filter(|u| Some(u.id) != self.local_user)
            .collect())
    }

    // ---------------------------------------------------------------------
    // State for the UI
    // ---------------------------------------------------------------------

    pub fn messages(&self, peer: UserId) -> &[Message] {
        self.messages.get(peer)
    }

    pub fn message_store(&self) -> &MessageStore {
        &self.messages
    }

    pub fn conversations(&self) -> &[ConversationEntry] {
        self.directory.entries()
    }

    pub fn conversation(&self, peer: UserId) -> Option<&ConversationEntry> {
        self.directory.get(peer)
    }

    pub fn active_conversation(&self) -> Option<UserId> {
        self.directory.active()
    }

    pub fn is_peer_typing(&self, peer: UserId) -> bool {
        self.typing.is_typing(peer)
    }

    pub fn typing_peers(&self) -> Vec<UserId> {
        self.typing.typing_peers()
    }

    fn clear_stores(&mut self) {
        self.messages.clear();
        self.directory.clear();
        self.typing.clear();
    }
}
