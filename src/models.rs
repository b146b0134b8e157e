// Data model shared by the sync engine, the wire codec and the REST collaborators.
// Field names follow the broker's camelCase JSON.

use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Numeric user identifier as issued by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        UserId(id)
    }
}

/// Opaque message identifier. The backend sends numbers, but nothing in the
/// client relies on that, so both JSON numbers and strings are accepted.
/// An id decoded from a number is written back as a number; equality and
/// hashing only look at the text.
#[derive(Debug, Clone)]
pub struct MessageId {
    value: String,
    numeric: bool,
}

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        MessageId { value: id.into(), numeric: false }
    }

    pub fn from_number(id: i64) -> Self {
        MessageId { value: id.to_string(), numeric: true }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn is_numeric(&self) -> bool {
        self.numeric
    }
}

impl PartialEq for MessageId {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for MessageId {}

impl Hash for MessageId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.numeric {
            if let Ok(n) = self.value.parse::<i64>() {
                return serializer.serialize_i64(n);
            }
        }
        serializer.serialize_str(&self.value)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Number(i64),
            Text(String),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Number(n) => MessageId::from_number(n),
            RawId::Text(s) => MessageId::new(s),
        })
    }
}

/// Delivery status of a message. The ordering is the allowed direction of travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

/// Online status of a peer as reported by the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PresenceStatus {
    Online,
    // Anything the backend invents later is treated as offline
    #[default]
    #[serde(other)]
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sent_at: Option<NaiveDateTime>,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<NaiveDateTime>,
}

impl Message {
    /// The other participant of the conversation this message belongs to.
    pub fn peer_of(&self, local_user: UserId) -> UserId {
        if self.sender_id == local_user {
            self.receiver_id
        } else {
            self.sender_id
        }
    }

    pub fn is_from(&self, user: UserId) -> bool {
        self.sender_id == user
    }
}

/// One row of the conversation list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEntry {
    pub other_user_id: UserId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub other_username: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub other_user_email: String,
    #[serde(default)]
    pub last_message_content: Option<String>,
    #[serde(default)]
    pub last_message_time: Option<NaiveDateTime>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub unread_count: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub other_user_status: PresenceStatus,
}

/// A user returned by the search endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub id: UserId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub email: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub username: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: PresenceStatus,
}

impl PeerSummary {
    /// Provisional directory entry for a peer we have not talked to yet.
    pub fn to_provisional_entry(&self) -> ConversationEntry {
        ConversationEntry {
            other_user_id: self.id,
            other_username: self.username.clone(),
            other_user_email: self.email.clone(),
            last_message_content: None,
            last_message_time: None,
            unread_count: 0,
            other_user_status: self.status,
        }
    }
}

/// Delivered/read receipt pushed on the notification queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotification {
    pub message_id: MessageId,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<NaiveDateTime>,
}

/// Typing indicator, used both inbound and outbound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotification {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageRequest {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
}

/// Body of the delivered and read receipt commands. `sender_id` is the
/// original author of the message, who gets notified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptRequest {
    pub message_id: MessageId,
    pub sender_id: UserId,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
