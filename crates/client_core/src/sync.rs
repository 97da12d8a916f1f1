//! Client-side conversation state. Merges optimistic sends, realtime pushes and
//! REST reads into one view. Pure and synchronous; `RealtimeClient` drives it.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, UserId, MAX_MESSAGE_CHARS},
    protocol::{
        sort_previews, ConversationHistory, ConversationPreview, MessagePayload, ServerEvent,
        UserSummary,
    },
};
use uuid::Uuid;

use crate::error::{ClientError, ClientResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TempMessageId(Uuid);

impl TempMessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TempMessageId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalMessage {
    Optimistic {
        temp_id: TempMessageId,
        conversation_id: Option<ConversationId>,
        sender_id: UserId,
        content: String,
        created_at: DateTime<Utc>,
    },
    Confirmed(MessagePayload),
}

impl LocalMessage {
    pub fn content(&self) -> &str {
        match self {
            Self::Optimistic { content, .. } => content,
            Self::Confirmed(message) => &message.content,
        }
    }

    pub fn sender_id(&self) -> UserId {
        match self {
            Self::Optimistic { sender_id, .. } => *sender_id,
            Self::Confirmed(message) => message.sender_id,
        }
    }

    pub fn is_optimistic(&self) -> bool {
        matches!(self, Self::Optimistic { .. })
    }

    pub fn durable_id(&self) -> Option<MessageId> {
        match self {
            Self::Optimistic { .. } => None,
            Self::Confirmed(message) => Some(message.id),
        }
    }

    fn order_key(&self) -> Option<(DateTime<Utc>, MessageId)> {
        match self {
            Self::Optimistic { .. } => None,
            Self::Confirmed(message) => Some((message.created_at, message.id)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewState {
    NoConversationSelected,
    Loading {
        peer: UserSummary,
        conversation_id: ConversationId,
    },
    /// `conversation_id` stays `None` until the first send creates it.
    Ready {
        peer: UserSummary,
        conversation_id: Option<ConversationId>,
    },
}

impl ViewState {
    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self {
            Self::NoConversationSelected => None,
            Self::Loading {
                conversation_id, ..
            } => Some(*conversation_id),
            Self::Ready {
                conversation_id, ..
            } => *conversation_id,
        }
    }

    pub fn peer(&self) -> Option<&UserSummary> {
        match self {
            Self::NoConversationSelected => None,
            Self::Loading { peer, .. } | Self::Ready { peer, .. } => Some(peer),
        }
    }
}

/// Follow-up network work the engine cannot do itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    FetchHistory(ConversationId),
    RefetchConversations,
}

/// A send accepted locally; the caller resolves the conversation if needed and
/// emits the send-intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub temp_id: TempMessageId,
    pub peer_id: UserId,
    pub conversation_id: Option<ConversationId>,
    pub content: String,
}

/// A send-intent that went out and still awaits its confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingEntry {
    temp_id: TempMessageId,
    /// Newest message time known for the conversation at emit time. Only
    /// history messages stored after it can be this send.
    after: Option<DateTime<Utc>>,
}

/// Everything a local delete touches, restored verbatim on failure.
#[derive(Debug, Clone)]
pub struct DeleteSnapshot {
    conversation_id: ConversationId,
    previews: Vec<ConversationPreview>,
    view: ViewState,
    messages: Vec<LocalMessage>,
    pending: HashMap<ConversationId, VecDeque<PendingEntry>>,
}

impl DeleteSnapshot {
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }
}

#[derive(Debug, Clone)]
pub struct ChatState {
    user_id: UserId,
    previews: Vec<ConversationPreview>,
    view: ViewState,
    /// Confirmed messages sorted by `(created_at, id)`, then optimistic ones in
    /// send order.
    messages: Vec<LocalMessage>,
    /// Sends whose intent went out, per conversation, oldest first.
    pending: HashMap<ConversationId, VecDeque<PendingEntry>>,
}

impl ChatState {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            previews: Vec::new(),
            view: ViewState::NoConversationSelected,
            messages: Vec::new(),
            pending: HashMap::new(),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn previews(&self) -> &[ConversationPreview] {
        &self.previews
    }

    pub fn view(&self) -> &ViewState {
        &self.view
    }

    pub fn messages(&self) -> &[LocalMessage] {
        &self.messages
    }

    pub fn active_conversation_id(&self) -> Option<ConversationId> {
        self.view.conversation_id()
    }

    pub fn pending_count(&self, conversation_id: ConversationId) -> usize {
        self.pending.get(&conversation_id).map(VecDeque::len).unwrap_or(0)
    }

    /// Installs a fresh preview list. An active conversation that is no longer
    /// listed was deleted while we were not looking, so the view is cleared.
    pub fn replace_previews(&mut self, mut previews: Vec<ConversationPreview>) {
        sort_previews(&mut previews);
        self.previews = previews;
        if let Some(active) = self.active_conversation_id() {
            if !self.previews.iter().any(|p| p.id == active) {
                self.clear_view();
                self.pending.remove(&active);
            }
        }
    }

    pub fn select_peer(&mut self, peer: UserSummary) -> Option<SyncAction> {
        self.messages.clear();
        let existing = self
            .previews
            .iter()
            .find(|preview| preview.user.id == peer.id)
            .map(|preview| preview.id);
        match existing {
            Some(conversation_id) => {
                self.view = ViewState::Loading {
                    peer,
                    conversation_id,
                };
                Some(SyncAction::FetchHistory(conversation_id))
            }
            None => {
                self.view = ViewState::Ready {
                    peer,
                    conversation_id: None,
                };
                None
            }
        }
    }

    pub fn clear_view(&mut self) {
        self.view = ViewState::NoConversationSelected;
        self.messages.clear();
    }

    /// Merges an authoritative history read for `conversation_id`. Returns
    /// `false` and changes nothing when the view has moved elsewhere.
    ///
    /// Own messages in the history that were not known locally are matched
    /// against the pending queue in order, the same way realtime confirmations
    /// are, so a confirmation missed while offline does not leave a stale
    /// optimistic copy behind. A message stored before a send was emitted is
    /// never taken as that send.
    pub fn apply_history(
        &mut self,
        conversation_id: ConversationId,
        history: Vec<MessagePayload>,
    ) -> bool {
        if self.active_conversation_id() != Some(conversation_id) {
            return false;
        }
        if let ViewState::Loading { peer, .. } = &self.view {
            self.view = ViewState::Ready {
                peer: peer.clone(),
                conversation_id: Some(conversation_id),
            };
        }

        for message in history {
            if message.conversation_id != conversation_id || self.has_confirmed(message.id) {
                continue;
            }
            if message.sender_id == self.user_id {
                self.settle_pending(conversation_id, Some(message.created_at));
            }
            self.insert_confirmed(message);
        }
        true
    }

    /// Appends an optimistic message to the active view.
    pub fn begin_send(&mut self, content: &str) -> ClientResult<PendingSend> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        if content.chars().count() > MAX_MESSAGE_CHARS {
            return Err(ClientError::MessageTooLong {
                max: MAX_MESSAGE_CHARS,
            });
        }
        let (peer_id, conversation_id) = match &self.view {
            ViewState::NoConversationSelected => return Err(ClientError::NoConversationSelected),
            ViewState::Loading {
                peer,
                conversation_id,
            } => (peer.id, Some(*conversation_id)),
            ViewState::Ready {
                peer,
                conversation_id,
            } => (peer.id, *conversation_id),
        };

        let temp_id = TempMessageId::new();
        self.messages.push(LocalMessage::Optimistic {
            temp_id,
            conversation_id,
            sender_id: self.user_id,
            content: content.to_string(),
            created_at: Utc::now(),
        });
        Ok(PendingSend {
            temp_id,
            peer_id,
            conversation_id,
            content: content.to_string(),
        })
    }

    /// Records the durable conversation returned by create-or-get for `peer_id`.
    pub fn conversation_resolved(&mut self, peer_id: UserId, conversation: ConversationHistory) {
        let conversation_id = conversation.id;
        let is_active_peer = self.view.peer().map(|peer| peer.id) == Some(peer_id);

        if is_active_peer {
            if let ViewState::Ready {
                peer,
                conversation_id: None,
            } = &self.view
            {
                let peer = peer.clone();
                if !self.previews.iter().any(|p| p.id == conversation_id) {
                    self.previews.push(ConversationPreview {
                        id: conversation_id,
                        user: peer.clone(),
                        last_message: None,
                        last_message_time: None,
                        last_message_sender_id: None,
                        created_at: conversation.created_at,
                    });
                }
                self.view = ViewState::Ready {
                    peer,
                    conversation_id: Some(conversation_id),
                };
            }
            for message in &mut self.messages {
                if let LocalMessage::Optimistic {
                    conversation_id: slot @ None,
                    ..
                } = message
                {
                    *slot = Some(conversation_id);
                }
            }
        }

        for message in &conversation.messages {
            self.bump_preview(message);
        }
        sort_previews(&mut self.previews);
        if is_active_peer {
            self.apply_history(conversation_id, conversation.messages);
        }
    }

    /// Must be called before the send-intent leaves, so a fast confirmation
    /// always finds its pending entry.
    pub fn mark_emitted(&mut self, conversation_id: ConversationId, temp_id: TempMessageId) {
        let previewed = self
            .previews
            .iter()
            .find(|preview| preview.id == conversation_id)
            .and_then(|preview| preview.last_message_time);
        let viewed = if self.active_conversation_id() == Some(conversation_id) {
            self.messages
                .iter()
                .filter_map(LocalMessage::order_key)
                .map(|(created_at, _)| created_at)
                .max()
        } else {
            None
        };
        self.pending
            .entry(conversation_id)
            .or_default()
            .push_back(PendingEntry {
                temp_id,
                after: previewed.max(viewed),
            });
    }

    /// Undoes `mark_emitted` when the intent never reached the socket. The
    /// optimistic message stays visible; it just no longer awaits a
    /// confirmation.
    pub fn abandon_pending(&mut self, conversation_id: ConversationId, temp_id: TempMessageId) {
        if let Some(queue) = self.pending.get_mut(&conversation_id) {
            queue.retain(|entry| entry.temp_id != temp_id);
            if queue.is_empty() {
                self.pending.remove(&conversation_id);
            }
        }
    }

    pub fn apply_server_event(&mut self, event: ServerEvent) -> Option<SyncAction> {
        match event {
            ServerEvent::MessageConfirmed(message) => self.apply_confirmed(message),
            ServerEvent::ConversationDeleted { conversation_id } => {
                self.remove_conversation(conversation_id);
                None
            }
        }
    }

    fn apply_confirmed(&mut self, message: MessagePayload) -> Option<SyncAction> {
        let conversation_id = message.conversation_id;
        let known = self.bump_preview(&message);
        if known {
            sort_previews(&mut self.previews);
        }

        let active = self.active_conversation_id() == Some(conversation_id);
        if active && self.has_confirmed(message.id) {
            return if known {
                None
            } else {
                Some(SyncAction::RefetchConversations)
            };
        }
        if message.sender_id == self.user_id {
            self.settle_pending(conversation_id, None);
        }
        if active {
            self.insert_confirmed(message);
        }

        if known {
            None
        } else {
            Some(SyncAction::RefetchConversations)
        }
    }

    /// Optimistically removes a conversation and returns what is needed to put
    /// it back.
    pub fn begin_delete(&mut self, conversation_id: ConversationId) -> DeleteSnapshot {
        let snapshot = DeleteSnapshot {
            conversation_id,
            previews: self.previews.clone(),
            view: self.view.clone(),
            messages: self.messages.clone(),
            pending: self.pending.clone(),
        };
        self.remove_conversation(conversation_id);
        snapshot
    }

    pub fn rollback_delete(&mut self, snapshot: DeleteSnapshot) {
        self.previews = snapshot.previews;
        self.view = snapshot.view;
        self.messages = snapshot.messages;
        self.pending = snapshot.pending;
    }

    /// Drops every pending entry. Run once a reconnect resync has merged
    /// history and before any send goes out on the new connection: the merge
    /// settled every earlier send that was stored, the rest never reached the
    /// store. Their optimistic copies stay visible, like any other failed send.
    pub fn forget_unconfirmed_sends(&mut self) -> usize {
        let forgotten = self.pending.values().map(VecDeque::len).sum();
        self.pending.clear();
        forgotten
    }

    /// Actions that recover anything missed while the realtime channel was down.
    pub fn resync_plan(&self) -> Vec<SyncAction> {
        let mut actions = vec![SyncAction::RefetchConversations];
        if let Some(active) = self.active_conversation_id() {
            actions.push(SyncAction::FetchHistory(active));
        }
        actions
    }

    fn remove_conversation(&mut self, conversation_id: ConversationId) {
        self.previews.retain(|preview| preview.id != conversation_id);
        self.pending.remove(&conversation_id);
        if self.active_conversation_id() == Some(conversation_id) {
            self.clear_view();
        }
    }

    /// Returns whether the conversation is in the preview list.
    fn bump_preview(&mut self, message: &MessagePayload) -> bool {
        let Some(preview) = self
            .previews
            .iter_mut()
            .find(|preview| preview.id == message.conversation_id)
        else {
            return false;
        };
        let newer = preview
            .last_message_time
            .map_or(true, |current| message.created_at >= current);
        if newer {
            preview.last_message = Some(message.content.clone());
            preview.last_message_time = Some(message.created_at);
            preview.last_message_sender_id = Some(message.sender_id);
        }
        true
    }

    /// Settles the send at the front of the conversation's pending queue and
    /// drops its optimistic copy. A message read from history (`stored_at`
    /// set) only settles a send emitted before it was stored.
    fn settle_pending(&mut self, conversation_id: ConversationId, stored_at: Option<DateTime<Utc>>) {
        let Some(queue) = self.pending.get_mut(&conversation_id) else {
            return;
        };
        let Some(front) = queue.front() else {
            return;
        };
        if let (Some(stored_at), Some(after)) = (stored_at, front.after) {
            if stored_at <= after {
                return;
            }
        }
        let temp_id = front.temp_id;
        queue.pop_front();
        if queue.is_empty() {
            self.pending.remove(&conversation_id);
        }
        self.messages.retain(|message| {
            !matches!(message, LocalMessage::Optimistic { temp_id: id, .. } if *id == temp_id)
        });
    }

    fn has_confirmed(&self, id: MessageId) -> bool {
        self.messages
            .iter()
            .any(|message| message.durable_id() == Some(id))
    }

    fn insert_confirmed(&mut self, message: MessagePayload) {
        let key = (message.created_at, message.id);
        let confirmed_len = self
            .messages
            .iter()
            .take_while(|message| !message.is_optimistic())
            .count();
        let position = self.messages[..confirmed_len]
            .partition_point(|existing| existing.order_key().map_or(false, |k| k <= key));
        self.messages
            .insert(position, LocalMessage::Confirmed(message));
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
