use serde::{Deserialize, Serialize};

/// Why a single envelope could not be turned into a readable message.
///
/// Stored on the message itself; only the kind is kept, never the underlying error value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DecryptErrorKind {
    #[error("invalid envelope")]
    Invalid,
    #[error("failed to decrypt")]
    DecryptFailed,
    #[error("Invalid seal format - expected kind 13, got {0}")]
    InvalidSealKind(u16),
    #[error("Invalid message format - expected kind 14 or 15, got {0}")]
    UnsupportedInnerKind(u16),
    #[error("self-copy has a missing or self-referential recipient")]
    MalformedRecipient,
    #[error("malformed payload")]
    Malformed,
}

impl DecryptErrorKind {
    /// Validation failures are dropped outright instead of being shown as placeholders.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DecryptErrorKind::Invalid | DecryptErrorKind::MalformedRecipient
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("cache directory error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache task failed: {0}")]
    Task(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("query timed out after {0} ms")]
    Timeout(u128),
    #[error("query failed: {0}")]
    Query(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("publish failed: {0}")]
    Publish(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("direct messages are disabled")]
    Disabled,
    #[error("message is empty")]
    EmptyMessage,
    #[error("cannot send a direct message to yourself")]
    SelfRecipient,
    #[error("signer error: {0}")]
    Signer(String),
    #[error("Failed to publish message to both recipient and sender")]
    BothCopiesRejected,
    #[error("no relay accepted the message")]
    Rejected,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_inner_kind_names_the_kind() {
        let err = DecryptErrorKind::UnsupportedInnerKind(99);
        assert!(err.to_string().contains("99"));
        assert!(!err.is_validation());
        assert!(DecryptErrorKind::MalformedRecipient.is_validation());
    }

    #[test]
    fn error_marker_round_trips_through_json() {
        let json = serde_json::to_string(&DecryptErrorKind::InvalidSealKind(1)).unwrap();
        let back: DecryptErrorKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, DecryptErrorKind::InvalidSealKind(1));
    }
}
