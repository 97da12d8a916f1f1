use std::sync::Arc;

use crate::{
    api::ApiContext, gate::SessionValidator, relay::MessageRelay, rooms::RoomRouter,
    session::SessionConfig,
};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) rooms: RoomRouter,
    pub(crate) relay: MessageRelay,
    pub(crate) validator: Arc<dyn SessionValidator>,
    pub(crate) session: SessionConfig,
}
