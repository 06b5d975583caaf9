use cxr_core::CodecError;

use crate::transport::TransportError;

/// Errors surfaced by session operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SessionError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("invalid action: {reason}")]
    InvalidAction { reason: String },
}

impl SessionError {
    pub fn invalid_action(reason: impl Into<String>) -> Self {
        Self::InvalidAction {
            reason: reason.into(),
        }
    }
}
