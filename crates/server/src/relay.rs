use std::{collections::HashMap, sync::Arc};

use shared::{
    domain::{ConversationId, UserId},
    protocol::{MessagePayload, ServerEvent},
};
use storage::{Storage, StoredMessage};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::rooms::RoomRouter;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("message content is empty")]
    EmptyContent,
    #[error("message content exceeds {max} characters")]
    ContentTooLong { max: usize },
    #[error("user is not a participant of the conversation")]
    NotParticipant,
    #[error("persistence failed: {0}")]
    Persistence(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: MessagePayload,
    pub delivered: usize,
}

/// Authorizes, persists, then fans out. Persistence always completes before
/// any participant room sees the event, and rooms see a conversation's
/// confirmations in store order.
#[derive(Clone)]
pub struct MessageRelay {
    storage: Storage,
    rooms: RoomRouter,
    max_message_chars: usize,
    /// Held from insert through fanout, one per conversation.
    write_locks: Arc<Mutex<HashMap<ConversationId, Arc<Mutex<()>>>>>,
}

impl MessageRelay {
    pub fn new(storage: Storage, rooms: RoomRouter, max_message_chars: usize) -> Self {
        Self {
            storage,
            rooms,
            max_message_chars,
            write_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn write_lock(&self, conversation_id: ConversationId) -> Arc<Mutex<()>> {
        self.write_locks
            .lock()
            .await
            .entry(conversation_id)
            .or_default()
            .clone()
    }

    pub async fn send_message(
        &self,
        sender: UserId,
        conversation_id: ConversationId,
        content: &str,
    ) -> Result<Delivery, RelayError> {
        let result = self.try_send(sender, conversation_id, content).await;
        match &result {
            Ok(delivery) => info!(
                user_id = sender.0,
                conversation_id = conversation_id.0,
                message_id = delivery.message.id.0,
                delivered = delivery.delivered,
                "message relayed"
            ),
            Err(RelayError::Persistence(error)) => error!(
                user_id = sender.0,
                conversation_id = conversation_id.0,
                %error,
                "message persistence failed; nothing fanned out"
            ),
            Err(reason) => warn!(
                user_id = sender.0,
                conversation_id = conversation_id.0,
                %reason,
                "send-intent dropped"
            ),
        }
        result
    }

    async fn try_send(
        &self,
        sender: UserId,
        conversation_id: ConversationId,
        content: &str,
    ) -> Result<Delivery, RelayError> {
        let content = validate_content(content, self.max_message_chars)?;

        if !self.storage.is_participant(conversation_id, sender).await? {
            return Err(RelayError::NotParticipant);
        }

        let lock = self.write_lock(conversation_id).await;
        let _ordered = lock.lock().await;
        let stored = self
            .storage
            .insert_message(conversation_id, sender, content)
            .await?;
        let participants = self.storage.list_participants(conversation_id).await?;

        let message = message_payload(stored);
        let event = ServerEvent::MessageConfirmed(message.clone());
        let delivered = self.fan_out(&participants, &event).await;
        Ok(Delivery { message, delivered })
    }

    /// Atomically removes the conversation, then notifies every former
    /// participant. Returns the number of connections notified.
    pub async fn delete_conversation(
        &self,
        caller: UserId,
        conversation_id: ConversationId,
    ) -> Result<usize, RelayError> {
        if !self.storage.is_participant(conversation_id, caller).await? {
            return Err(RelayError::NotParticipant);
        }

        let former = self
            .storage
            .delete_conversation(conversation_id)
            .await
            .map_err(|error| {
                error!(
                    user_id = caller.0,
                    conversation_id = conversation_id.0,
                    error = %error,
                    "conversation delete rolled back"
                );
                RelayError::Persistence(error)
            })?;

        self.write_locks.lock().await.remove(&conversation_id);
        let delivered = self
            .fan_out(&former, &ServerEvent::ConversationDeleted { conversation_id })
            .await;
        info!(
            user_id = caller.0,
            conversation_id = conversation_id.0,
            delivered,
            "conversation deleted"
        );
        Ok(delivered)
    }

    async fn fan_out(&self, participants: &[UserId], event: &ServerEvent) -> usize {
        let mut delivered = 0;
        for participant in participants {
            delivered += self.rooms.emit_to_identity(*participant, event).await;
        }
        delivered
    }
}

/// Trims and bounds message content; the trimmed slice is what gets stored.
pub fn validate_content(content: &str, max_chars: usize) -> Result<&str, RelayError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(RelayError::EmptyContent);
    }
    if trimmed.chars().count() > max_chars {
        return Err(RelayError::ContentTooLong { max: max_chars });
    }
    Ok(trimmed)
}

pub fn message_payload(stored: StoredMessage) -> MessagePayload {
    MessagePayload {
        id: stored.message_id,
        content: stored.content,
        sender_id: stored.sender_id,
        conversation_id: stored.conversation_id,
        created_at: stored.created_at,
    }
}

#[cfg(test)]
#[path = "tests/relay_tests.rs"]
mod tests;
