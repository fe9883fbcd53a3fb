//! Encrypted direct-message sync engine.
//!
//! Reconciles legacy NIP-04 messages and NIP-17 gift wraps into one
//! locally-persisted, incrementally-synced conversation store.

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod error_log;
pub mod logging;
pub mod model;
pub mod pagination;
pub mod protocol;
pub mod store;
pub mod sync;
pub mod transport;
pub mod updates;

pub use cache::{CacheKey, CacheRecord, DmCache, MemoryCache, SqliteCache};
pub use codec::{Codec, Decoded};
pub use config::{load_config, DmConfig, Timing};
pub use error::{CacheError, DecryptErrorKind, SendError, TransportError};
pub use logging::init_logging;
pub use model::*;
pub use pagination::{ConversationPage, ConversationView};
pub use protocol::{LoadingPhase, MessageProtocol, ProtocolMode};
pub use store::{AddOutcome, ConversationStore};
pub use sync::{DmSync, DmSyncParams, FileAttachment, SendRequest};
pub use transport::{DmFilter, EventStream, PublishOutcome, RelayTransport};
pub use updates::DmUpdate;

/// Accepts `npub1...`, hex, and `nostr:`-prefixed forms.
pub fn parse_pubkey(input: &str) -> Option<nostr_sdk::prelude::PublicKey> {
    let normalized = input.trim();
    let normalized = normalized.strip_prefix("nostr:").unwrap_or(normalized);
    nostr_sdk::prelude::PublicKey::parse(normalized).ok()
}
