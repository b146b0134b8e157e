// Per-peer message logs
// Logs keep arrival order. A message whose id is already present is merged in
// place; status only ever moves forward (SENT -> DELIVERED -> READ).

use log::debug;
use std::collections::{HashMap, HashSet};

use crate::models::{Message, MessageId, MessageStatus, UserId};

/// Result of `add_message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Appended,
    /// An existing entry with the same id was merged at its original position
    Merged,
}

/// Result of `update_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    Applied { peer: UserId, from: MessageStatus, to: MessageStatus },
    /// The message is already at or past the requested status
    Stale,
    /// No log holds this id; the update is dropped
    Unknown,
}

#[derive(Debug, Default)]
pub struct MessageStore {
    logs: HashMap<UserId, Vec<Message>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or correct a message in `peer`'s log.
    pub fn add_message(&mut self, peer: UserId, message: Message) -> AddOutcome {
        let log = self.logs.entry(peer).or_default();

        if let Some(existing) = log.iter_mut().find(|m| m.id == message.id) {
            merge_into(existing, message);
            debug!("Merged message {} in log of {}", existing.id, peer);
            return AddOutcome::Merged;
        }

        debug!("Appended message {} to log of {}", message.id, peer);
        log.push(message);
        AddOutcome::Appended
    }

    /// Apply a receipt. The id alone identifies the message, whichever log holds it.
    pub fn update_status(&mut self, message_id: &MessageId, status: MessageStatus) -> StatusOutcome {
        for (peer, log) in self.logs.iter_mut() {
            if let Some(message) = log.iter_mut().find(|m| &m.id == message_id) {
                if status <= message.status {
                    debug!(
                        "Ignoring {:?} for message {}: already {:?}",
                        status, message_id, message.status
                    );
                    return StatusOutcome::Stale;
                }
                let from = message.status;
                message.status = status;
                debug!("Message {} status {:?} -> {:?}", message_id, from, status);
                return StatusOutcome::Applied { peer: *peer, from, to: status };
            }
        }

        // Cannot be told apart from a race with history loading; never buffered
        debug!("Dropping status {:?} for unknown message {}", status, message_id);
        StatusOutcome::Unknown
    }

    /// The ordered log for `peer`; empty if there is none.
    pub fn get(&self, peer: UserId) -> &[Message] {
        self.logs.get(&peer).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn find(&self, message_id: &MessageId) -> Option<&Message> {
        self.logs
            .values()
            .flat_map(|log| log.iter())
            .find(|m| &m.id == message_id)
    }

    pub fn last_message(&self, peer: UserId) -> Option<&Message> {
        self.logs.get(&peer).and_then(|log| log.last())
    }

    pub fn peers(&self) -> impl Iterator<Item = &UserId> {
        self.logs.keys()
    }

    /// Merge one page of server history. `page` is newest-first as the backend
    /// returns it. Page 0 becomes the start of the log, followed by any live
    /// messages it does not contain; later pages prepend older messages.
    pub fn load_history(&mut self, peer: UserId, page_index: u32, page: Vec<Message>) {
        let mut chronological: Vec<Message> = Vec::with_capacity(page.len());
        let mut seen = HashSet::new();
        for message in page.into_iter().rev() {
            if seen.insert(message.id.clone()) {
                chronological.push(message);
            }
        }

        let existing = self.logs.remove(&peer).unwrap_or_default();
        let mut merged = if page_index == 0 {
            chronological
        } else {
            chronological
                .into_iter()
                .filter(|m| !existing.iter().any(|e| e.id == m.id))
                .collect()
        };
        let snapshot_len = merged.len();

        for message in existing {
            match merged.iter_mut().find(|m| m.id == message.id) {
                // Live copy may carry a later status than the snapshot
                Some(snapshot) => {
                    if message.status > snapshot.status {
                        snapshot.status = message.status;
                    }
                }
                None => merged.push(message),
            }
        }

        debug!(
            "Loaded history page {} for {}: {} from server, {} total",
            page_index,
            peer,
            snapshot_len,
            merged.len()
        );
        self.logs.insert(peer, merged);
    }

    pub fn clear_peer(&mut self, peer: UserId) {
        self.logs.remove(&peer);
    }

    pub fn clear(&mut self) {
        self.logs.clear();
    }
}

/// Take the newer copy's fields but never move status backward or lose
/// receipt timestamps the newer copy lacks.
fn merge_into(existing: &mut Message, incoming: Message) {
    let status = existing.status.max(incoming.status);
    let delivered_at = incoming.delivered_at.or(existing.delivered_at);
    let read_at = incoming.read_at.or(existing.read_at);

    *existing = incoming;
    existing.status = status;
    existing.delivered_at = delivered_at;
    existing.read_at = read_at;
}
