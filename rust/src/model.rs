use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::DecryptErrorKind;
use crate::protocol::{LoadingPhase, MessageProtocol, ProtocolMode, OPTIMISTIC_ID_PREFIX};

/// A protocol-normalized direct message.
///
/// `content` is the raw ciphertext as delivered. `decrypted_content` only lives in
/// memory and is never written to the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct DmMessage {
    pub id: String,
    pub pubkey: PublicKey,
    pub kind: Kind,
    pub protocol: MessageProtocol,
    /// Seconds. For gift wraps this is the inner rumor timestamp.
    pub created_at: u64,
    pub content: String,
    pub tags: Vec<Tag>,
    pub decrypted_content: Option<String>,
    pub error: Option<DecryptErrorKind>,
    pub is_sending: bool,
    /// Local millis at which a fresh message was first observed.
    pub client_first_seen: Option<u64>,
    pub original_gift_wrap_id: Option<String>,
    /// Encrypted form that gets persisted: the kind 4 event or the seal.
    pub envelope: Option<Event>,
}

impl DmMessage {
    pub fn dedup_key(&self) -> &str {
        self.original_gift_wrap_id.as_deref().unwrap_or(&self.id)
    }

    pub fn is_optimistic(&self) -> bool {
        self.is_sending || self.id.starts_with(OPTIMISTIC_ID_PREFIX)
    }

    pub fn text(&self) -> &str {
        self.decrypted_content.as_deref().unwrap_or_default()
    }

    /// Persistable form, or `None` for placeholders that never had an envelope.
    pub fn to_stored(&self) -> Option<StoredMessage> {
        let event = self.envelope.clone()?;
        Some(StoredMessage {
            event,
            created_at: self.created_at,
            original_gift_wrap_id: self.original_gift_wrap_id.clone(),
        })
    }
}

/// What the cache keeps per message: the encrypted envelope plus dedup metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub event: Event,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_gift_wrap_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    pub messages: Vec<DmMessage>,
    pub last_activity: u64,
    pub has_nip04: bool,
    pub has_nip17: bool,
}

impl Conversation {
    pub fn from_messages(messages: Vec<DmMessage>, has_nip04: bool, has_nip17: bool) -> Self {
        let mut conversation = Self {
            messages,
            last_activity: 0,
            has_nip04,
            has_nip17,
        };
        conversation.normalize();
        conversation
    }

    pub fn last_message(&self) -> Option<&DmMessage> {
        self.messages.last()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.messages.iter().any(|m| m.dedup_key() == key)
    }

    pub(crate) fn mark_protocol(&mut self, protocol: MessageProtocol) {
        match protocol {
            MessageProtocol::Nip04 => self.has_nip04 = true,
            MessageProtocol::Nip17 => self.has_nip17 = true,
        }
    }

    /// Re-sort ascending (stable) and derive `last_activity` from the newest element.
    pub(crate) fn normalize(&mut self) {
        self.messages.sort_by_key(|m| m.created_at);
        self.last_activity = self.messages.last().map(|m| m.created_at).unwrap_or(0);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSummary {
    pub partner: PublicKey,
    pub last_message: Option<DmMessage>,
    pub last_activity: u64,
    pub has_nip04: bool,
    pub has_nip17: bool,
    /// The local user has sent at least one message into this conversation.
    pub is_known: bool,
    pub is_request: bool,
    pub last_message_from_user: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoints {
    #[serde(default)]
    pub nip04: Option<u64>,
    #[serde(default)]
    pub nip17: Option<u64>,
}

impl SyncCheckpoints {
    pub fn get(&self, protocol: MessageProtocol) -> Option<u64> {
        match protocol {
            MessageProtocol::Nip04 => self.nip04,
            MessageProtocol::Nip17 => self.nip17,
        }
    }

    pub fn set(&mut self, protocol: MessageProtocol, at: u64) {
        match protocol {
            MessageProtocol::Nip04 => self.nip04 = Some(at),
            MessageProtocol::Nip17 => self.nip17 = Some(at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanProgress {
    pub current: usize,
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanProgressState {
    pub nip04: Option<ScanProgress>,
    pub nip17: Option<ScanProgress>,
}

impl ScanProgressState {
    pub fn set(&mut self, protocol: MessageProtocol, progress: Option<ScanProgress>) {
        match protocol {
            MessageProtocol::Nip04 => self.nip04 = progress,
            MessageProtocol::Nip17 => self.nip17 = progress,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStatus {
    pub nip04: bool,
    pub nip17: bool,
}

impl SubscriptionStatus {
    pub fn set(&mut self, protocol: MessageProtocol, connected: bool) {
        match protocol {
            MessageProtocol::Nip04 => self.nip04 = connected,
            MessageProtocol::Nip17 => self.nip17 = connected,
        }
    }
}

/// Snapshot of everything the UI needs to render loading state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStatus {
    pub phase: LoadingPhase,
    pub is_loading: bool,
    pub is_doing_initial_load: bool,
    pub last_sync: SyncCheckpoints,
    pub subscriptions: SubscriptionStatus,
    pub scan_progress: ScanProgressState,
    pub protocol_mode: ProtocolMode,
}

pub(crate) fn now_seconds() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub(crate) fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn text_message(id: &str, author: PublicKey, created_at: u64, text: &str) -> DmMessage {
        DmMessage {
            id: id.to_string(),
            pubkey: author,
            kind: Kind::from(crate::protocol::KIND_PRIVATE_TEXT),
            protocol: MessageProtocol::Nip17,
            created_at,
            content: String::new(),
            tags: Vec::new(),
            decrypted_content: Some(text.to_string()),
            error: None,
            is_sending: false,
            client_first_seen: None,
            original_gift_wrap_id: None,
            envelope: None,
        }
    }

    #[test]
    fn dedup_key_prefers_the_wrapper_id() {
        let author = Keys::generate().public_key();
        let mut msg = text_message("inner", author, 1, "hi");
        assert_eq!(msg.dedup_key(), "inner");
        msg.original_gift_wrap_id = Some("wrap".into());
        assert_eq!(msg.dedup_key(), "wrap");
    }

    #[test]
    fn placeholders_without_envelope_are_not_persisted() {
        let author = Keys::generate().public_key();
        let msg = text_message("optimistic-1-abc", author, 1, "hi");
        assert!(msg.is_optimistic());
        assert!(msg.to_stored().is_none());
    }

    #[test]
    fn conversation_tracks_newest_message() {
        let author = Keys::generate().public_key();
        let conversation = Conversation::from_messages(
            vec![
                text_message("b", author, 20, "second"),
                text_message("a", author, 10, "first"),
            ],
            false,
            true,
        );
        assert_eq!(conversation.last_activity, 20);
        assert_eq!(conversation.last_message().map(|m| m.id.as_str()), Some("b"));
        assert_eq!(conversation.messages[0].id, "a");
    }
}
