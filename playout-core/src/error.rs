use thiserror::Error;

use crate::session::SessionId;

/// All errors produced by playout-core.
///
/// Only setup and control paths return these. The real-time render path
/// absorbs every anomaly locally (silence, drop or reset).
#[derive(Debug, Error)]
pub enum PlayoutError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no default output device found")]
    NoOutputDevice,

    #[error("unsupported stream format: {0}")]
    UnsupportedFormat(String),

    #[error("failed to open output stream: {0}")]
    StreamOpen(String),

    #[error("audio backend error: {0}")]
    Backend(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("session {0} is closed")]
    SessionClosed(SessionId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PlayoutError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, PlayoutError>;
