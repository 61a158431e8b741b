//! Error types for Huddle Core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Microphone unavailable: {0}")]
    Microphone(String),

    #[error("Peer connection error: {0}")]
    PeerConnection(String),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid call state: {0}")]
    InvalidCallState(String),

    #[error("Call cancelled: {0}")]
    CallCancelled(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Device and negotiation failures end the call and are shown to the user.
    /// Write failures and stale events are only logged.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Error::Microphone(_) | Error::PeerConnection(_) | Error::InvalidCallState(_)
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::Config(format!("Invalid URL: {}", e))
    }
}
