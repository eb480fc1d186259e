//! Client error types.

use std::io;

use mqpoll_core::{ConnackCode, ProtocolError};
use thiserror::Error;

use crate::persistence::PersistenceError;
use crate::settings::SettingsError;

/// Client error type.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection refused: {0}")]
    ConnectionRefused(ConnackCode),

    #[error("Connection lost")]
    Disconnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Operation timed out")]
    Timeout,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid UTF-8 string: {0:?}")]
    BadUtf8String(String),

    #[error("Maximum number of messages in flight reached")]
    MaxMessagesInflight,

    #[error("No message identifier available")]
    NoMessageId,

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Settings(#[from] SettingsError),
}

impl ClientError {
    /// Capacity conditions and timeouts clear up on their own; the same call
    /// can be made again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::MaxMessagesInflight | ClientError::NoMessageId | ClientError::Timeout
        )
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
