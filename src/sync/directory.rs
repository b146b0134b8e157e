// Conversation directory
// One entry per peer, most recently active first. Entries come from the server
// snapshot, from search results (provisional), and are kept fresh by incoming
// messages.

use log::debug;

use crate::models::{ConversationEntry, Message, PeerSummary, UserId};

#[derive(Debug, Default)]
pub struct ConversationDirectory {
    entries: Vec<ConversationEntry>,
    active: Option<UserId>,
}

impl ConversationDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the directory with the server's snapshot. Duplicate peers in
    /// the snapshot collapse to their first occurrence.
    pub fn bootstrap(&mut self, entries: Vec<ConversationEntry>) {
        self.entries.clear();
        for entry in entries {
            if self.position(entry.other_user_id).is_none() {
                self.entries.push(entry);
            } else {
                debug!("Skipping duplicate directory entry for {}", entry.other_user_id);
            }
        }
        if let Some(active) = self.active {
            if self.position(active).is_none() {
                self.active = None;
            }
        }
        debug!("Directory bootstrapped with {} conversations", self.entries.len());
    }

    /// Open a conversation picked from search results. An existing entry is
    /// activated untouched; otherwise a provisional one is inserted on top.
    pub fn upsert_from_search(&mut self, peer: &PeerSummary) -> &ConversationEntry {
        let index = match self.position(peer.id) {
            Some(index) => index,
            None => {
                debug!("Adding provisional conversation with {}", peer.id);
                self.entries.insert(0, peer.to_provisional_entry());
                0
            }
        };
        self.active = Some(peer.id);
        &self.entries[index]
    }

    /// Refresh the preview of `peer`'s entry for a stored message. Unread is
    /// bumped when `count_unread` is set and the conversation is not on screen.
    /// Returns false if the peer has no entry.
    pub fn apply_incoming_message(
        &mut self,
        peer: UserId,
        message: &Message,
        count_unread: bool,
    ) -> bool {
        let index = match self.position(peer) {
            Some(index) => index,
            None => {
                debug!("No directory entry for {}, preview not updated", peer);
                return false;
            }
        };

        let mut entry = self.entries.remove(index);
        entry.last_message_content = Some(message.content.clone());
        if message.sent_at.is_some() {
            entry.last_message_time = message.sent_at;
        }
        if count_unread && self.active != Some(peer) {
            entry.unread_count += 1;
        }
        self.entries.insert(0, entry);
        true
    }

    /// Clear the unread badge. Message statuses are not touched here.
    pub fn mark_read(&mut self, peer: UserId) {
        if let Some(index) = self.position(peer) {
            self.entries[index].unread_count = 0;
        }
    }

    /// Mark the conversation currently on screen; `None` when nothing is open.
    pub fn set_active(&mut self, peer: Option<UserId>) {
        self.active = peer;
    }

    pub fn active(&self) -> Option<UserId> {
        self.active
    }

    pub fn get(&self, peer: UserId) -> Option<&ConversationEntry> {
        self.position(peer).map(|index| &self.entries[index])
    }

    pub fn entries(&self) -> &[ConversationEntry] {
        &self.entries
    }

    pub fn total_unread(&self) -> u64 {
        self.entries.iter().map(|e| e.unread_count).sum()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.active = None;
    }

    fn position(&self, peer: UserId) -> Option<usize> {
        self.entries.iter().position(|e| e.other_user_id == peer)
    }
}
