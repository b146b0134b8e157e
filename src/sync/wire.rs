// Broker destinations and payload codec
// Inbound frames are classified by the queue they arrived on; outbound commands
// map one-to-one onto application destinations.

use log::debug;

use crate::error::SyncError;
use crate::models::{
    ChatMessageRequest, Message, ReceiptRequest, StatusNotification, TypingNotification, UserId,
};

pub mod destinations {
    pub const SEND_MESSAGE: &str = "/app/chat.send";
    pub const TYPING: &str = "/app/chat.typing";
    pub const DELIVERED: &str = "/app/chat.delivered";
    pub const READ: &str = "/app/chat.read";

    pub const MESSAGES_QUEUE: &str = "queue/messages";
    pub const NOTIFICATIONS_QUEUE: &str = "queue/notifications";
    pub const TYPING_QUEUE: &str = "queue/typing";
}

/// The three per-user inbound queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Messages,
    Notifications,
    Typing,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Messages, Channel::Notifications, Channel::Typing];

    fn queue(self) -> &'static str {
        match self {
            Channel::Messages => destinations::MESSAGES_QUEUE,
            Channel::Notifications => destinations::NOTIFICATIONS_QUEUE,
            Channel::Typing => destinations::TYPING_QUEUE,
        }
    }

    /// User-scoped destination, e.g. `/user/7/queue/messages`.
    pub fn destination(self, user: UserId) -> String {
        format!("/user/{}/{}", user, self.queue())
    }

    /// Accepts both the subscribed form and the `/user/queue/...` form the
    /// broker writes into MESSAGE frames for user destinations.
    pub fn from_destination(destination: &str, user: UserId) -> Option<Channel> {
        Channel::ALL.into_iter().find(|channel| {
            channel.destination(user) == destination
                || destination.strip_prefix("/user/") == Some(channel.queue())
        })
    }
}

/// A decoded inbound event. Each frame becomes exactly one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Message(Message),
    StatusUpdate(StatusNotification),
    Typing(TypingNotification),
}

pub fn decode_inbound(channel: Channel, body: &str) -> Result<InboundEvent, SyncError> {
    let event = match channel {
        Channel::Messages => InboundEvent::Message(serde_json::from_str(body)?),
        Channel::Notifications => InboundEvent::StatusUpdate(serde_json::from_str(body)?),
        Channel::Typing => InboundEvent::Typing(serde_json::from_str(body)?),
    };
    debug!("Decoded {:?} frame", channel);
    Ok(event)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    ChatMessage,
    Typing,
    DeliveredReceipt,
    ReadReceipt,
}

/// Everything the engine may publish.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundCommand {
    SendMessage(ChatMessageRequest),
    SetTyping(TypingNotification),
    MarkDelivered(ReceiptRequest),
    MarkRead(ReceiptRequest),
}

impl OutboundCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            OutboundCommand::SendMessage(_) => CommandKind::ChatMessage,
            OutboundCommand::SetTyping(_) => CommandKind::Typing,
            OutboundCommand::MarkDelivered(_) => CommandKind::DeliveredReceipt,
            OutboundCommand::MarkRead(_) => CommandKind::ReadReceipt,
        }
    }

    pub fn destination(&self) -> &'static str {
        match self.kind() {
            CommandKind::ChatMessage => destinations::SEND_MESSAGE,
            CommandKind::Typing => destinations::TYPING,
            CommandKind::DeliveredReceipt => destinations::DELIVERED,
            CommandKind::ReadReceipt => destinations::READ,
        }
    }

    pub fn encode(&self) -> Result<String, SyncError> {
        let body = match self {
            OutboundCommand::SendMessage(req) => serde_json::to_string(req)?,
            OutboundCommand::SetTyping(notification) => serde_json::to_string(notification)?,
            OutboundCommand::MarkDelivered(receipt) | OutboundCommand::MarkRead(receipt) => {
                serde_json::to_string(receipt)?
            }
        };
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageId, MessageStatus};

    #[test]
    fn test_channel_destinations() {
        let me = UserId(7);
        assert_eq!(Channel::Messages.destination(me), "/user/7/queue/messages");
        assert_eq!(
            Channel::from_destination("/user/7/queue/typing", me),
            Some(Channel::Typing)
        );
        // Another user's queue is not ours
        assert_eq!(Channel::from_destination("/user/8/queue/typing", me), None);
    }

    #[test]
    fn test_channel_from_rewritten_user_destination() {
        let me = UserId(7);
        assert_eq!(
            Channel::from_destination("/user/queue/messages", me),
            Some(Channel::Messages)
        );
        assert_eq!(
            Channel::from_destination("/user/queue/notifications", me),
            Some(Channel::Notifications)
        );
        assert_eq!(Channel::from_destination("/user/queue/other", me), None);
        assert_eq!(Channel::from_destination("/queue/messages", me), None);
    }

    #[test]
    fn test_decode_message_with_backend_shape() {
        let body = r#"{"id":42,"senderId":2,"receiverId":1,"content":"hi",
            "status":"SENT","sentAt":"2024-05-01T10:15:30.123","deliveredAt":null,"readAt":null}"#;
        match decode_inbound(Channel::Messages, body).unwrap() {
            InboundEvent::Message(m) => {
                assert_eq!(m.id, MessageId::new("42"));
                assert_eq!(m.sender_id, UserId(2));
                assert_eq!(m.status, MessageStatus::Sent);
                assert!(m.sent_at.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_status_update_and_typing() {
        let status = decode_inbound(
            Channel::Notifications,
            r#"{"messageId":"m1","status":"READ","timestamp":"2024-05-01T10:15:30"}"#,
        )
        .unwrap();
        assert!(matches!(
            status,
            InboundEvent::StatusUpdate(StatusNotification { status: MessageStatus::Read, .. })
        ));

        let typing = decode_inbound(
            Channel::Typing,
            r#"{"senderId":2,"receiverId":1,"isTyping":true}"#,
        )
        .unwrap();
        assert_eq!(
            typing,
            InboundEvent::Typing(TypingNotification {
                sender_id: UserId(2),
                receiver_id: UserId(1),
                is_typing: true,
            })
        );
    }

    #[test]
    fn test_decode_garbage_is_decode_error() {
        let err = decode_inbound(Channel::Messages, "<html>").unwrap_err();
        assert!(matches!(err, SyncError::Decode(_)));
    }

    #[test]
    fn test_encode_receipt_body() {
        let cmd = OutboundCommand::MarkDelivered(ReceiptRequest {
            message_id: MessageId::new("m1"),
            sender_id: UserId(2),
        });
        assert_eq!(cmd.destination(), "/app/chat.delivered");
        assert_eq!(cmd.encode().unwrap(), r#"{"messageId":"m1","senderId":2}"#);
    }
}
