use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{MessageId, Role, RoomId, UserId},
    error::RelayError,
};

/// Events a client may send over its connection. Anything other than
/// `Authenticate` is rejected until the connection holds an identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    #[serde(rename_all = "camelCase")]
    Authenticate {
        id: UserId,
        name: String,
        role: Role,
    },
    JoinConversation(RoomId),
    LeaveConversation(RoomId),
    #[serde(rename_all = "camelCase")]
    SendMessage {
        conversation_id: RoomId,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Typing {
        conversation_id: RoomId,
        is_typing: bool,
    },
    #[serde(rename_all = "camelCase")]
    MarkAsRead {
        conversation_id: RoomId,
        message_ids: Vec<MessageId>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: UserId,
    pub name: String,
    pub role: Role,
}

/// Read-only projection of a persisted message, carrying the
/// store-assigned identifier and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: MessageId,
    pub conversation_id: RoomId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub message: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Point-in-time snapshot delivered once, right after authenticate.
    OnlineUsers(Vec<UserSummary>),
    #[serde(rename_all = "camelCase")]
    UserOnline { user_id: UserId, user_name: String },
    #[serde(rename_all = "camelCase")]
    UserOffline { user_id: UserId, user_name: String },
    /// Bounded recent history, oldest first, delivered to a joining
    /// connection only.
    MessageHistory(Vec<MessagePayload>),
    NewMessage(MessagePayload),
    #[serde(rename_all = "camelCase")]
    UserTyping {
        user_id: UserId,
        user_name: String,
        is_typing: bool,
    },
    #[serde(rename_all = "camelCase")]
    MessagesRead {
        conversation_id: RoomId,
        message_ids: Vec<MessageId>,
    },
    Error(RelayError),
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
