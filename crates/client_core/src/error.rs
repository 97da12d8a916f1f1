use shared::error::ApiException;
use thiserror::Error;

pub type ClientResult<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not logged in")]
    NotLoggedIn,
    #[error("realtime channel is not connected")]
    NotConnected,
    #[error("no conversation selected")]
    NoConversationSelected,
    #[error("message content is empty")]
    EmptyMessage,
    #[error("message exceeds {max} characters")]
    MessageTooLong { max: usize },
    #[error("invalid server url: {0}")]
    InvalidServerUrl(String),
    #[error("server rejected request: {0}")]
    Api(#[from] ApiException),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("realtime connection failed: {0}")]
    Realtime(#[from] tokio_tungstenite::tungstenite::Error),
}
