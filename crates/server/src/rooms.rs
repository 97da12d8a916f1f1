use std::{collections::HashMap, sync::Arc};

use shared::{domain::UserId, protocol::ServerEvent};
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    RwLock,
};
use tracing::debug;
use uuid::Uuid;

/// Identifies one open realtime connection within its identity's room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

struct Connection {
    id: ConnectionId,
    sender: UnboundedSender<ServerEvent>,
}

/// Identity -> open connections. A room exists only while it has at least one
/// connection; delivery to an empty or missing room is dropped.
#[derive(Default, Clone)]
pub struct RoomRouter {
    rooms: Arc<RwLock<HashMap<UserId, Vec<Connection>>>>,
}

impl RoomRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn admit(&self, user_id: UserId) -> (ConnectionId, UnboundedReceiver<ServerEvent>) {
        let (sender, rx) = unbounded_channel();
        let id = ConnectionId::new();

        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(user_id).or_default();
        room.push(Connection { id, sender });
        debug!(user_id = user_id.0, connections = room.len(), "connection admitted");

        (id, rx)
    }

    pub async fn remove(&self, user_id: UserId, connection_id: ConnectionId) {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(&user_id) else {
            return;
        };
        room.retain(|connection| connection.id != connection_id);
        debug!(user_id = user_id.0, remaining = room.len(), "connection removed");
        if room.is_empty() {
            rooms.remove(&user_id);
        }
    }

    /// Hands `event` to every open connection of `user_id` and returns how many
    /// accepted it. Connections whose receiver is gone are pruned on the way.
    pub async fn emit_to_identity(&self, user_id: UserId, event: &ServerEvent) -> usize {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(&user_id) else {
            return 0;
        };
        room.retain(|connection| connection.sender.send(event.clone()).is_ok());
        let delivered = room.len();
        if room.is_empty() {
            rooms.remove(&user_id);
        }
        delivered
    }

    pub async fn connection_count(&self, user_id: UserId) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(&user_id).map(Vec::len).unwrap_or(0)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

#[cfg(test)]
#[path = "tests/rooms_tests.rs"]
mod tests;
