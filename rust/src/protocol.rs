//! Protocol constants and the small enums shared by every layer of the sync engine.

use nostr_sdk::prelude::Kind;
use serde::{Deserialize, Serialize};

/// Legacy pairwise-encrypted direct message (NIP-04).
pub const KIND_LEGACY_DM: u16 = 4;
/// Seal wrapping the inner rumor (NIP-59).
pub const KIND_SEAL: u16 = 13;
/// Inner plain-text chat message (NIP-17).
pub const KIND_PRIVATE_TEXT: u16 = 14;
/// Inner file message (NIP-17).
pub const KIND_PRIVATE_FILE: u16 = 15;
/// Outer one-time-key envelope (NIP-59).
pub const KIND_GIFT_WRAP: u16 = 1059;

/// Gift-wrap outer timestamps are randomized up to this far into the past.
pub const GIFT_WRAP_SKEW_SECS: u64 = 2 * 24 * 60 * 60;

/// An optimistic entry is reconciled with a confirmed message inside this window.
pub const OPTIMISTIC_MATCH_WINDOW_SECS: u64 = 30;

pub const OPTIMISTIC_ID_PREFIX: &str = "optimistic-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageProtocol {
    Nip04,
    Nip17,
}

impl MessageProtocol {
    pub fn label(self) -> &'static str {
        match self {
            MessageProtocol::Nip04 => "NIP-4",
            MessageProtocol::Nip17 => "NIP-17",
        }
    }

    /// Kind used for an optimistic placeholder sent over this protocol.
    pub fn message_kind(self) -> Kind {
        match self {
            MessageProtocol::Nip04 => Kind::from(KIND_LEGACY_DM),
            MessageProtocol::Nip17 => Kind::from(KIND_PRIVATE_TEXT),
        }
    }
}

impl std::fmt::Display for MessageProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Which protocols the client is allowed to use.
///
/// Legacy reception is always kept on; the mode only controls whether the
/// modern protocol participates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolMode {
    Nip04Only,
    #[default]
    Nip17Only,
    Nip04OrNip17,
}

impl ProtocolMode {
    pub fn modern_enabled(self) -> bool {
        !matches!(self, ProtocolMode::Nip04Only)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadingPhase {
    #[default]
    Idle,
    Cache,
    Relays,
    Subscriptions,
    Ready,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_only_mode_disables_modern_protocol() {
        assert!(!ProtocolMode::Nip04Only.modern_enabled());
        assert!(ProtocolMode::Nip17Only.modern_enabled());
        assert!(ProtocolMode::Nip04OrNip17.modern_enabled());
    }

    #[test]
    fn protocol_mode_uses_snake_case_on_the_wire() {
        let mode: ProtocolMode = serde_json::from_str("\"nip04_or_nip17\"").unwrap();
        assert_eq!(mode, ProtocolMode::Nip04OrNip17);
        assert_eq!(ProtocolMode::default(), ProtocolMode::Nip17Only);
    }
}
