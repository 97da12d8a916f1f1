use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    AssistantConversationId, AssistantMessageId, AssistantRole, ConversationId, MessageId, UserId,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ClientRequest {
    #[serde(rename_all = "camelCase")]
    SendIntent {
        conversation_id: ConversationId,
        content: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerEvent {
    MessageConfirmed(MessagePayload),
    #[serde(rename_all = "camelCase")]
    ConversationDeleted { conversation_id: ConversationId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: MessageId,
    pub content: String,
    pub sender_id: UserId,
    pub conversation_id: ConversationId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: UserId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPreview {
    pub id: ConversationId,
    pub user: UserSummary,
    pub last_message: Option<String>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub last_message_sender_id: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

impl ConversationPreview {
    /// Most-recent-activity key: the last message time, or the conversation's
    /// creation time when it has no messages yet.
    pub fn activity_at(&self) -> DateTime<Utc> {
        self.last_message_time.unwrap_or(self.created_at)
    }
}

/// Sorts previews by most recent activity, newest first. Ties fall back to the
/// larger conversation id so the order is total.
pub fn sort_previews(previews: &mut [ConversationPreview]) {
    previews.sort_by(|a, b| {
        b.activity_at()
            .cmp(&a.activity_at())
            .then_with(|| b.id.cmp(&a.id))
    });
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub user_id: UserId,
    pub name: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    #[serde(default)]
    pub peer_id: Option<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationHistory {
    pub id: ConversationId,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<MessagePayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantConversationSummary {
    pub id: AssistantConversationId,
    pub title: String,
    pub updated_at: DateTime<Utc>,
    pub last_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantMessagePayload {
    pub id: AssistantMessageId,
    pub role: AssistantRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantConversationDetail {
    pub id: AssistantConversationId,
    pub title: String,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<AssistantMessagePayload>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssistantTitleRequest {
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantChatRequest {
    pub conversation_id: AssistantConversationId,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantChatResponse {
    pub user_message: AssistantMessagePayload,
    pub assistant_message: AssistantMessagePayload,
}
