//! Persistent cache of encrypted message history and sync checkpoints.
//!
//! Records hold envelopes only. Plaintext is rebuilt by the codec on load.

mod memory;
mod sqlite;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::model::{StoredMessage, SyncCheckpoints};
use crate::store::ConversationMap;

pub use memory::MemoryCache;
pub use sqlite::SqliteCache;

/// Identifies one local identity's record inside a storage scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub scope: String,
    pub identity: String,
}

impl CacheKey {
    pub fn new(scope: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            identity: identity.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.identity)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredConversation {
    pub messages: Vec<StoredMessage>,
    pub last_activity: u64,
    #[serde(default)]
    pub has_nip04: bool,
    #[serde(default)]
    pub has_nip17: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Partner pubkey (hex) to conversation.
    pub participants: BTreeMap<String, StoredConversation>,
    #[serde(default)]
    pub last_sync: SyncCheckpoints,
}

impl CacheRecord {
    pub fn from_snapshot(conversations: &ConversationMap, last_sync: SyncCheckpoints) -> Self {
        let mut participants = BTreeMap::new();
        for (partner, conversation) in conversations {
            let messages: Vec<StoredMessage> = conversation
                .messages
                .iter()
                .filter_map(|m| m.to_stored())
                .collect();
            if messages.is_empty() {
                continue;
            }
            participants.insert(
                partner.to_hex(),
                StoredConversation {
                    messages,
                    last_activity: conversation.last_activity,
                    has_nip04: conversation.has_nip04,
                    has_nip17: conversation.has_nip17,
                },
            );
        }
        Self {
            participants,
            last_sync,
        }
    }

    pub fn message_count(&self) -> usize {
        self.participants.values().map(|c| c.messages.len()).sum()
    }
}

/// Whole-record storage keyed by local identity. Writes replace the previous record.
pub trait DmCache: Send + Sync {
    fn read(&self, key: &CacheKey) -> Result<Option<CacheRecord>, CacheError>;
    fn write(&self, key: &CacheKey, record: &CacheRecord) -> Result<(), CacheError>;
    fn delete(&self, key: &CacheKey) -> Result<(), CacheError>;
}
