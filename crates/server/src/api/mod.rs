use std::sync::Arc;

use axum::{http::StatusCode, Json};
use shared::{
    domain::{AssistantConversationId, AssistantRole, ConversationId, UserId, DEFAULT_ASSISTANT_TITLE},
    error::{ApiError, ErrorCode},
    protocol::{
        sort_previews, AssistantChatResponse, AssistantConversationDetail,
        AssistantConversationSummary, AssistantMessagePayload, ConversationHistory,
        ConversationPreview, UserSummary,
    },
};
use storage::{Storage, StoredAssistantConversation, StoredAssistantMessage, StoredUser};
use tracing::error;

use crate::{
    assistant::{build_prompt, TextGenerator},
    relay::message_payload,
};

const MAX_ASSISTANT_TITLE_CHARS: usize = 80;
const AUTO_TITLE_CHARS: usize = 40;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub assistant: Arc<dyn TextGenerator>,
}

pub type ApiRejection = (StatusCode, Json<ApiError>);

pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn reject(err: ApiError) -> ApiRejection {
    (status_for(err.code), Json(err))
}

pub async fn list_users(ctx: &ApiContext, caller: UserId) -> Result<Vec<UserSummary>, ApiError> {
    let users = ctx
        .storage
        .list_users_except(caller)
        .await
        .map_err(internal)?;
    Ok(users.into_iter().map(user_summary).collect())
}

pub async fn list_conversations(
    ctx: &ApiContext,
    caller: UserId,
) -> Result<Vec<ConversationPreview>, ApiError> {
    let stored = ctx
        .storage
        .list_conversation_previews(caller)
        .await
        .map_err(internal)?;
    let mut previews: Vec<ConversationPreview> = stored
        .into_iter()
        .map(|preview| ConversationPreview {
            id: preview.conversation_id,
            user: user_summary(preview.peer),
            last_message: preview.last_message,
            last_message_time: preview.last_message_time,
            last_message_sender_id: preview.last_message_sender_id,
            created_at: preview.created_at,
        })
        .collect();
    sort_previews(&mut previews);
    Ok(previews)
}

pub async fn create_or_get_conversation(
    ctx: &ApiContext,
    caller: UserId,
    peer_id: Option<UserId>,
) -> Result<ConversationHistory, ApiError> {
    let peer_id = peer_id
        .filter(|peer| peer.0 > 0)
        .ok_or_else(|| ApiError::validation("peerId is required"))?;
    if peer_id == caller {
        return Err(ApiError::validation("cannot start a conversation with yourself"));
    }
    ctx.storage
        .find_user(peer_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("user"))?;

    let (conversation, _created) = ctx
        .storage
        .create_or_get_conversation(caller, peer_id)
        .await
        .map_err(internal)?;
    history_for(ctx, conversation.conversation_id, conversation.created_at).await
}

pub async fn conversation_history(
    ctx: &ApiContext,
    caller: UserId,
    conversation_id: ConversationId,
) -> Result<ConversationHistory, ApiError> {
    ensure_participant(ctx, conversation_id, caller).await?;
    let conversation = ctx
        .storage
        .load_conversation(conversation_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("conversation"))?;
    history_for(ctx, conversation_id, conversation.created_at).await
}

async fn history_for(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    created_at: chrono::DateTime<chrono::Utc>,
) -> Result<ConversationHistory, ApiError> {
    let messages = ctx
        .storage
        .list_messages(conversation_id)
        .await
        .map_err(internal)?;
    Ok(ConversationHistory {
        id: conversation_id,
        created_at,
        messages: messages.into_iter().map(message_payload).collect(),
    })
}

/// Non-participants get the same answer as for a missing conversation.
async fn ensure_participant(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    user_id: UserId,
) -> Result<(), ApiError> {
    let member = ctx
        .storage
        .is_participant(conversation_id, user_id)
        .await
        .map_err(internal)?;
    if member {
        Ok(())
    } else {
        Err(ApiError::not_found("conversation"))
    }
}

pub async fn list_assistant_conversations(
    ctx: &ApiContext,
    caller: UserId,
) -> Result<Vec<AssistantConversationSummary>, ApiError> {
    let summaries = ctx
        .storage
        .list_assistant_conversations(caller)
        .await
        .map_err(internal)?;
    Ok(summaries
        .into_iter()
        .map(|summary| AssistantConversationSummary {
            id: summary.conversation.conversation_id,
            title: summary.conversation.title,
            updated_at: summary.conversation.updated_at,
            last_message: summary.last_message,
        })
        .collect())
}

pub async fn create_assistant_conversation(
    ctx: &ApiContext,
    caller: UserId,
    title: Option<String>,
) -> Result<AssistantConversationDetail, ApiError> {
    let title = title
        .as_deref()
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .map(|title| truncate_chars(title, MAX_ASSISTANT_TITLE_CHARS))
        .unwrap_or_else(|| DEFAULT_ASSISTANT_TITLE.to_string());
    let created = ctx
        .storage
        .create_assistant_conversation(caller, &title)
        .await
        .map_err(internal)?;
    Ok(assistant_detail(created, Vec::new()))
}

pub async fn get_assistant_conversation(
    ctx: &ApiContext,
    caller: UserId,
    conversation_id: AssistantConversationId,
) -> Result<AssistantConversationDetail, ApiError> {
    let conversation = owned_assistant_conversation(ctx, caller, conversation_id).await?;
    let messages = ctx
        .storage
        .list_assistant_messages(conversation_id)
        .await
        .map_err(internal)?;
    Ok(assistant_detail(conversation, messages))
}

pub async fn rename_assistant_conversation(
    ctx: &ApiContext,
    caller: UserId,
    conversation_id: AssistantConversationId,
    title: Option<String>,
) -> Result<AssistantConversationSummary, ApiError> {
    let title = title
        .as_deref()
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .ok_or_else(|| ApiError::validation("title is required"))?;
    let title = truncate_chars(title, MAX_ASSISTANT_TITLE_CHARS);

    let renamed = ctx
        .storage
        .rename_assistant_conversation(caller, conversation_id, &title)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("conversation"))?;
    Ok(AssistantConversationSummary {
        id: renamed.conversation_id,
        title: renamed.title,
        updated_at: renamed.updated_at,
        last_message: None,
    })
}

pub async fn delete_assistant_conversation(
    ctx: &ApiContext,
    caller: UserId,
    conversation_id: AssistantConversationId,
) -> Result<(), ApiError> {
    let removed = ctx
        .storage
        .delete_assistant_conversation(caller, conversation_id)
        .await
        .map_err(internal)?;
    if removed {
        Ok(())
    } else {
        Err(ApiError::not_found("conversation"))
    }
}

/// Generates a reply from the stored transcript plus the new turn, then stores
/// both turns together. A generator failure stores nothing.
pub async fn assistant_chat(
    ctx: &ApiContext,
    caller: UserId,
    conversation_id: AssistantConversationId,
    content: &str,
) -> Result<AssistantChatResponse, ApiError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(ApiError::validation("message content is required"));
    }
    owned_assistant_conversation(ctx, caller, conversation_id).await?;

    let history = ctx
        .storage
        .list_assistant_messages(conversation_id)
        .await
        .map_err(internal)?;
    let mut turns: Vec<(AssistantRole, &str)> = history
        .iter()
        .map(|message| (message.role, message.content.as_str()))
        .collect();
    turns.push((AssistantRole::User, content));

    let reply = ctx
        .assistant
        .generate(&build_prompt(&turns))
        .await
        .map_err(|err| {
            error!(user_id = caller.0, conversation_id = conversation_id.0, error = %err, "assistant generation failed");
            ApiError::new(ErrorCode::Internal, "failed to generate AI response")
        })?;

    let (user_message, assistant_message) = ctx
        .storage
        .append_assistant_exchange(
            conversation_id,
            content,
            &reply,
            &truncate_chars(content, AUTO_TITLE_CHARS),
        )
        .await
        .map_err(internal)?;
    Ok(AssistantChatResponse {
        user_message: assistant_message_payload(user_message),
        assistant_message: assistant_message_payload(assistant_message),
    })
}

async fn owned_assistant_conversation(
    ctx: &ApiContext,
    caller: UserId,
    conversation_id: AssistantConversationId,
) -> Result<StoredAssistantConversation, ApiError> {
    ctx.storage
        .load_assistant_conversation(caller, conversation_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("conversation"))
}

fn assistant_detail(
    conversation: StoredAssistantConversation,
    messages: Vec<StoredAssistantMessage>,
) -> AssistantConversationDetail {
    AssistantConversationDetail {
        id: conversation.conversation_id,
        title: conversation.title,
        updated_at: conversation.updated_at,
        messages: messages.into_iter().map(assistant_message_payload).collect(),
    }
}

fn assistant_message_payload(message: StoredAssistantMessage) -> AssistantMessagePayload {
    AssistantMessagePayload {
        id: message.message_id,
        role: message.role,
        content: message.content,
        created_at: message.created_at,
    }
}

fn user_summary(user: StoredUser) -> UserSummary {
    UserSummary {
        id: user.user_id,
        name: user.username,
        image: user.image,
    }
}

fn truncate_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

/// Logs the store error and answers with a generic message.
pub fn internal(err: anyhow::Error) -> ApiError {
    error!(error = %err, "store operation failed");
    ApiError::new(ErrorCode::Internal, "internal server error")
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
