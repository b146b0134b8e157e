// REST collaborators used by the sync engine
// History, the conversation list, read marking and user search live behind
// plain HTTP endpoints. The engine only depends on this trait; the embedding
// application supplies the HTTP client.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{ConversationEntry, Message, PeerSummary, UserId};

/// One page of conversation history, newest message first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HistoryPage {
    pub content: Vec<Message>,
    pub total_pages: u32,
    pub total_elements: u64,
    /// Zero-based page index
    pub number: u32,
    pub size: u32,
    /// True when no older page exists
    pub last: bool,
}

#[async_trait]
pub trait ChatApi: Send + Sync {
    /// `GET /api/messages/conversation?userId1=&userId2=&page=&size=`
    async fn conversation_history(
        &self,
        me: UserId,
        peer: UserId,
        page: u32,
        size: u32,
    ) -> Result<HistoryPage>;

    /// `GET /api/messages/conversations?userId=`, most recent first
    async fn conversations(&self, me: UserId) -> Result<Vec<ConversationEntry>>;

    /// `PUT /api/messages/conversation/read?receiverId=&senderId=`
    async fn mark_conversation_read(&self, me: UserId, peer: UserId) -> Result<()>;

    /// User search by name or email
    async fn search_users(&self, query: &str) -> Result<Vec<PeerSummary>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageStatus;

    #[test]
    fn test_history_page_from_spring_json() {
        let json = r#"{
            "content": [
                {"id": 12, "senderId": 2, "receiverId": 1, "content": "newest",
                 "sentAt": "2024-03-01T10:15:30", "status": "READ"},
                {"id": 11, "senderId": 1, "receiverId": 2, "content": "older",
                 "sentAt": "2024-03-01T10:14:00", "status": "DELIVERED"}
            ],
            "pageable": {"pageNumber": 0, "pageSize": 50},
            "totalPages": 3,
            "totalElements": 102,
            "number": 0,
            "size": 50,
            "last": false,
            "first": true
        }"#;

        let page: HistoryPage = serde_json::from_str(json).unwrap();
        assert_eq!(page.content.len(), 2);
        assert_eq!(page.content[0].id.as_str(), "12");
        assert_eq!(page.content[1].status, MessageStatus::Delivered);
        assert_eq!(page.total_pages, 3);
        assert!(!page.last);
    }

    #[test]
    fn test_empty_history_page_defaults() {
        let page: HistoryPage = serde_json::from_str("{}").unwrap();
        assert!(page.content.is_empty());
        assert!(!page.last);
    }
}
