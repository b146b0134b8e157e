// Common test utilities for integration tests
// In-memory broker transport, a fake REST backend and small builders shared by
// the engine tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::LevelFilter;
use tokio::time::Instant;

use chat_sync::{
    api::{ChatApi, HistoryPage},
    config::SyncConfig,
    error::TransportError,
    models::{ConversationEntry, Message, MessageId, MessageStatus, PeerSummary, PresenceStatus, UserId},
    sync::{ConnectionState, SessionSink, SyncEngine, Transport, TransportSession},
};

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

pub const ME: UserId = UserId(1);
pub const BOB: UserId = UserId(2);
pub const CAROL: UserId = UserId(3);

/// Upper bound on events processed while waiting for a condition
const MAX_EVENTS: usize = 200;

#[derive(Default)]
struct BrokerState {
    fail_next: u32,
    fail_always: bool,
    opens: Vec<(UserId, Instant)>,
    sinks: Vec<SessionSink>,
    subscribed: Vec<String>,
    unsubscribed: Vec<String>,
    published: Vec<(String, String)>,
    closed: usize,
    next_subscription: u64,
}

/// In-memory broker. Records everything the engine does and lets tests push
/// frames or drop the connection.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<BrokerState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` opens fail.
    pub fn fail_next(&self, count: u32) {
        self.state.lock().unwrap().fail_next = count;
    }

    pub fn fail_always(&self, fail: bool) {
        self.state.lock().unwrap().fail_always = fail;
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().unwrap().opens.len()
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.state.lock().unwrap().opens.iter().map(|(_, at)| *at).collect()
    }

    pub fn opened_as(&self) -> Vec<UserId> {
        self.state.lock().unwrap().opens.iter().map(|(id, _)| *id).collect()
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.state.lock().unwrap().subscribed.clone()
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        self.state.lock().unwrap().unsubscribed.clone()
    }

    pub fn closed_count(&self) -> usize {
        self.state.lock().unwrap().closed
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().published.clone()
    }

    /// Decoded bodies published to `destination`, in order.
    pub fn published_to(&self, destination: &str) -> Vec<serde_json::Value> {
        self.published()
            .into_iter()
            .filter(|(dest, _)| dest == destination)
            .map(|(_, body)| serde_json::from_str(&body).unwrap())
            .collect()
    }

    /// Sink handed to the `index`-th successful open.
    pub fn sink(&self, index: usize) -> SessionSink {
        self.state.lock().unwrap().sinks[index].clone()
    }

    /// Deliver a frame on the most recent session.
    pub fn push(&self, destination: &str, body: &str) -> bool {
        let sink = self.state.lock().unwrap().sinks.last().cloned();
        sink.map(|s| s.deliver(destination, body)).unwrap_or(false)
    }

    /// Deliver a frame tagged with `subscription` on the most recent session.
    pub fn push_subscribed(&self, subscription: &str, destination: &str, body: &str) -> bool {
        let sink = self.state.lock().unwrap().sinks.last().cloned();
        sink.map(|s| s.deliver_subscribed(subscription, destination, body))
            .unwrap_or(false)
    }

    /// Deliver `message` on the local user's message queue.
    pub fn push_message(&self, to: UserId, message: &Message) -> bool {
        self.push(
            &format!("/user/{}/queue/messages", to),
            &serde_json::to_string(message).unwrap(),
        )
    }

    /// Simulate the broker going away under the most recent session.
    pub fn drop_connection(&self) -> bool {
        let sink = self.state.lock().unwrap().sinks.last().cloned();
        sink.map(|s| s.closed("connection reset by peer")).unwrap_or(false)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(
        &self,
        identity: UserId,
        sink: SessionSink,
    ) -> Result<Box<dyn TransportSession>, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.opens.push((identity, Instant::now()));

        if state.fail_always {
            return Err(TransportError::Connect("connection refused".into()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(TransportError::Connect("connection refused".into()));
        }

        state.sinks.push(sink);
        Ok(Box::new(MockSession {
            state: self.state.clone(),
            open: true,
        }))
    }
}

struct MockSession {
    state: Arc<Mutex<BrokerState>>,
    open: bool,
}

impl TransportSession for MockSession {
    fn subscribe(&mut self, destination: &str) -> Result<String, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.next_subscription += 1;
        state.subscribed.push(destination.to_string());
        Ok(format!("sub-{}", state.next_subscription))
    }

    fn unsubscribe(&mut self, subscription_id: &str) -> Result<(), TransportError> {
        self.state
            .lock()
            .unwrap()
            .unsubscribed
            .push(subscription_id.to_string());
        Ok(())
    }

    fn publish(&mut self, destination: &str, body: &str) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        self.state
            .lock()
            .unwrap()
            .published
            .push((destination.to_string(), body.to_string()));
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.state.lock().unwrap().closed += 1;
        }
    }
}

/// Canned REST backend.
#[derive(Default)]
pub struct FakeApi {
    pub conversations: Vec<ConversationEntry>,
    pub history: HashMap<(UserId, u32), HistoryPage>,
    pub users: Vec<PeerSummary>,
    pub read_marks: Mutex<Vec<(UserId, UserId)>>,
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn conversation_history(
        &self,
        _me: UserId,
        peer: UserId,
        page: u32,
        _size: u32,
    ) -> Result<HistoryPage> {
        self.history
            .get(&(peer, page))
            .cloned()
            .ok_or_else(|| anyhow!("no history page {} for {}", page, peer))
    }

    async fn conversations(&self, _me: UserId) -> Result<Vec<ConversationEntry>> {
        Ok(self.conversations.clone())
    }

    async fn mark_conversation_read(&self, me: UserId, peer: UserId) -> Result<()> {
        self.read_marks.lock().unwrap().push((me, peer));
        Ok(())
    }

    async fn search_users(&self, query: &str) -> Result<Vec<PeerSummary>> {
        let query = query.to_lowercase();
        Ok(self
            .users
            .iter()
            .filter(|u| u.username.to_lowercase().contains(&query) || u.email.to_lowercase().contains(&query))
            .cloned()
            .collect())
    }
}

pub fn message(id: &str, from: UserId, to: UserId, content: &str) -> Message {
    Message {
        id: MessageId::new(id),
        sender_id: from,
        receiver_id: to,
        content: content.to_string(),
        sent_at: None,
        status: MessageStatus::Sent,
        delivered_at: None,
        read_at: None,
    }
}

pub fn entry(peer: UserId, name: &str) -> ConversationEntry {
    ConversationEntry {
        other_user_id: peer,
        other_username: name.to_string(),
        other_user_email: format!("{}@example.com", name),
        last_message_content: None,
        last_message_time: None,
        unread_count: 0,
        other_user_status: PresenceStatus::Online,
    }
}

pub fn user(id: UserId, name: &str) -> PeerSummary {
    PeerSummary {
        id,
        email: format!("{}@example.com", name),
        username: name.to_string(),
        status: PresenceStatus::Online,
    }
}

pub fn engine(transport: &MockTransport) -> SyncEngine {
    setup_logging();
    SyncEngine::new(Arc::new(transport.clone()), SyncConfig::default())
}

/// Connection-state callback that records every state it is given.
pub fn state_recorder() -> (Arc<Mutex<Vec<ConnectionState>>>, impl FnMut(ConnectionState) + Send + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |state| sink.lock().unwrap().push(state))
}

/// Process engine events until `done` holds.
pub async fn pump_until<F>(engine: &mut SyncEngine, mut done: F)
where
    F: FnMut(&SyncEngine) -> bool,
{
    for _ in 0..MAX_EVENTS {
        if done(engine) {
            return;
        }
        tokio::time::timeout(Duration::from_secs(120), engine.pump())
            .await
            .expect("no engine event within timeout")
            .expect("engine event queue closed");
    }
    panic!("condition not reached after {} events", MAX_EVENTS);
}

/// An engine for `ME` that has reached CONNECTED.
pub async fn connected_engine(transport: &MockTransport) -> SyncEngine {
    let mut engine = engine(transport);
    engine.connect(ME, |_| {}).unwrap();
    pump_until(&mut engine, |e| e.connection_state() == ConnectionState::Connected).await;
    engine
}
