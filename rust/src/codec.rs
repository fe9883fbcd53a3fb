//! Turns raw relay envelopes into normalized [`DmMessage`]s.
//!
//! Nothing here returns an `Err` to the caller: every failure becomes a
//! [`Decoded::Error`] so scans and subscriptions can keep going.

use std::sync::Arc;
use std::time::Duration;

use nostr_sdk::prelude::*;

use crate::error::DecryptErrorKind;
use crate::model::{now_millis, DmMessage, StoredMessage};
use crate::protocol::{
    MessageProtocol, KIND_GIFT_WRAP, KIND_LEGACY_DM, KIND_PRIVATE_FILE, KIND_PRIVATE_TEXT,
    KIND_SEAL,
};

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    pub partner: PublicKey,
    pub message: DmMessage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodeFailure {
    pub protocol: MessageProtocol,
    pub partner: Option<PublicKey>,
    pub kind: DecryptErrorKind,
    /// Present when the failed message should still be shown as a placeholder.
    pub message: Option<DmMessage>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Legacy(DecodedMessage),
    ModernText(DecodedMessage),
    ModernFile(DecodedMessage),
    Error(DecodeFailure),
}

impl Decoded {
    pub fn protocol(&self) -> MessageProtocol {
        match self {
            Decoded::Legacy(_) => MessageProtocol::Nip04,
            Decoded::ModernText(_) | Decoded::ModernFile(_) => MessageProtocol::Nip17,
            Decoded::Error(failure) => failure.protocol,
        }
    }

    /// Where this result lands in the store, if anywhere.
    ///
    /// Validation failures never land. Other failures land only when they carry a
    /// resolved partner and a placeholder message.
    pub fn into_placement(self) -> Option<(PublicKey, DmMessage)> {
        match self {
            Decoded::Legacy(d) | Decoded::ModernText(d) | Decoded::ModernFile(d) => {
                Some((d.partner, d.message))
            }
            Decoded::Error(DecodeFailure {
                partner: Some(partner),
                message: Some(message),
                kind,
                ..
            }) if !kind.is_validation() => Some((partner, message)),
            Decoded::Error(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&DecodeFailure> {
        match self {
            Decoded::Error(failure) => Some(failure),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct Codec {
    signer: Arc<dyn NostrSigner>,
    me: PublicKey,
    freshness_ms: u64,
}

impl Codec {
    pub fn new(signer: Arc<dyn NostrSigner>, me: PublicKey, freshness: Duration) -> Self {
        Self {
            signer,
            me,
            freshness_ms: freshness.as_millis() as u64,
        }
    }

    pub fn me(&self) -> PublicKey {
        self.me
    }

    pub async fn decode(&self, event: &Event) -> Decoded {
        match event.kind.as_u16() {
            KIND_LEGACY_DM => self.decode_legacy(event).await,
            KIND_GIFT_WRAP => self.decode_gift_wrap(event).await,
            other => {
                tracing::debug!(kind = other, id = %event.id, "ignoring unexpected event kind");
                Decoded::Error(DecodeFailure {
                    protocol: MessageProtocol::Nip04,
                    partner: None,
                    kind: DecryptErrorKind::Invalid,
                    message: None,
                })
            }
        }
    }

    pub async fn decode_legacy(&self, event: &Event) -> Decoded {
        let recipient = match validate_legacy(event) {
            Ok(recipient) => recipient,
            Err(kind) => return legacy_failure(None, kind, None),
        };
        let partner = if event.pubkey == self.me {
            recipient
        } else {
            event.pubkey
        };
        if partner == self.me {
            return legacy_failure(None, DecryptErrorKind::MalformedRecipient, None);
        }

        let mut message = legacy_message(event, event.created_at.as_secs());
        message.client_first_seen = self.first_seen(message.created_at);
        match self.signer.nip04_decrypt(&partner, &event.content).await {
            Ok(plaintext) => {
                message.decrypted_content = Some(plaintext);
                Decoded::Legacy(DecodedMessage { partner, message })
            }
            Err(e) => {
                tracing::debug!(%e, id = %event.id, "legacy decrypt failed");
                message.error = Some(DecryptErrorKind::DecryptFailed);
                legacy_failure(Some(partner), DecryptErrorKind::DecryptFailed, Some(message))
            }
        }
    }

    pub async fn decode_gift_wrap(&self, wrap: &Event) -> Decoded {
        match self.unwrap_gift_wrap(wrap).await {
            Ok(decoded) => decoded,
            Err(kind) => {
                tracing::debug!(wrapper_id = %wrap.id, error = %kind, "gift wrap rejected");
                Decoded::Error(DecodeFailure {
                    protocol: MessageProtocol::Nip17,
                    partner: None,
                    kind,
                    message: None,
                })
            }
        }
    }

    async fn unwrap_gift_wrap(&self, wrap: &Event) -> Result<Decoded, DecryptErrorKind> {
        if wrap.kind.as_u16() != KIND_GIFT_WRAP {
            return Err(DecryptErrorKind::Invalid);
        }
        let seal_json = self
            .signer
            .nip44_decrypt(&wrap.pubkey, &wrap.content)
            .await
            .map_err(|_| DecryptErrorKind::DecryptFailed)?;
        let seal = Event::from_json(&seal_json).map_err(|_| DecryptErrorKind::Malformed)?;
        if seal.kind.as_u16() != KIND_SEAL {
            return Err(DecryptErrorKind::InvalidSealKind(seal.kind.as_u16()));
        }

        let rumor = self.open_seal(&seal).await?;
        let partner = self.modern_partner(&seal, &rumor)?;
        let mut message = modern_message(&seal, &rumor, Some(wrap.id.to_hex()));
        message.client_first_seen = self.first_seen(message.created_at);

        let decoded = DecodedMessage { partner, message };
        Ok(if rumor.kind.as_u16() == KIND_PRIVATE_FILE {
            Decoded::ModernFile(decoded)
        } else {
            Decoded::ModernText(decoded)
        })
    }

    async fn open_seal(&self, seal: &Event) -> Result<UnsignedEvent, DecryptErrorKind> {
        let rumor_json = self
            .signer
            .nip44_decrypt(&seal.pubkey, &seal.content)
            .await
            .map_err(|_| DecryptErrorKind::DecryptFailed)?;
        let rumor =
            UnsignedEvent::from_json(&rumor_json).map_err(|_| DecryptErrorKind::Malformed)?;
        let kind = rumor.kind.as_u16();
        if kind != KIND_PRIVATE_TEXT && kind != KIND_PRIVATE_FILE {
            return Err(DecryptErrorKind::UnsupportedInnerKind(kind));
        }
        // The rumor author must be whoever signed the seal.
        if rumor.pubkey != seal.pubkey {
            return Err(DecryptErrorKind::Malformed);
        }
        Ok(rumor)
    }

    fn modern_partner(
        &self,
        seal: &Event,
        rumor: &UnsignedEvent,
    ) -> Result<PublicKey, DecryptErrorKind> {
        if seal.pubkey != self.me {
            return Ok(seal.pubkey);
        }
        // Self-copy: the conversation is with whoever the rumor addresses.
        match rumor.tags.public_keys().next() {
            Some(recipient) if *recipient != self.me => Ok(*recipient),
            _ => Err(DecryptErrorKind::MalformedRecipient),
        }
    }

    /// Rebuild a message from its cached envelope. Failures are kept with an error marker.
    pub async fn rehydrate(&self, stored: &StoredMessage) -> Option<DmMessage> {
        let event = &stored.event;
        match event.kind.as_u16() {
            KIND_LEGACY_DM => Some(self.rehydrate_legacy(stored).await),
            KIND_SEAL => Some(match self.open_seal(event).await {
                Ok(rumor) => {
                    let mut message =
                        modern_message(event, &rumor, stored.original_gift_wrap_id.clone());
                    message.created_at = stored.created_at;
                    message
                }
                Err(kind) => {
                    let mut message = failed_seal_message(stored);
                    message.error = Some(kind);
                    message
                }
            }),
            other => {
                tracing::warn!(kind = other, id = %event.id, "unexpected kind in cache, skipping");
                None
            }
        }
    }

    async fn rehydrate_legacy(&self, stored: &StoredMessage) -> DmMessage {
        let event = &stored.event;
        let mut message = legacy_message(event, stored.created_at);
        let partner = if event.pubkey == self.me {
            event.tags.public_keys().next().copied()
        } else {
            Some(event.pubkey)
        };
        let Some(partner) = partner else {
            message.error = Some(DecryptErrorKind::Invalid);
            return message;
        };
        match self.signer.nip04_decrypt(&partner, &event.content).await {
            Ok(plaintext) => message.decrypted_content = Some(plaintext),
            Err(e) => {
                tracing::debug!(%e, id = %event.id, "cached legacy message failed to decrypt");
                message.error = Some(DecryptErrorKind::DecryptFailed);
            }
        }
        message
    }

    fn first_seen(&self, created_at: u64) -> Option<u64> {
        let now = now_millis();
        if now.saturating_sub(created_at.saturating_mul(1000)) < self.freshness_ms {
            Some(now)
        } else {
            None
        }
    }
}

/// A legacy envelope must be kind 4, address someone via a `p` tag and carry ciphertext.
fn validate_legacy(event: &Event) -> Result<PublicKey, DecryptErrorKind> {
    if event.kind.as_u16() != KIND_LEGACY_DM || event.content.is_empty() {
        return Err(DecryptErrorKind::Invalid);
    }
    event
        .tags
        .public_keys()
        .next()
        .copied()
        .ok_or(DecryptErrorKind::Invalid)
}

fn legacy_failure(
    partner: Option<PublicKey>,
    kind: DecryptErrorKind,
    message: Option<DmMessage>,
) -> Decoded {
    Decoded::Error(DecodeFailure {
        protocol: MessageProtocol::Nip04,
        partner,
        kind,
        message,
    })
}

fn legacy_message(event: &Event, created_at: u64) -> DmMessage {
    DmMessage {
        id: event.id.to_hex(),
        pubkey: event.pubkey,
        kind: event.kind,
        protocol: MessageProtocol::Nip04,
        created_at,
        content: event.content.clone(),
        tags: event.tags.iter().cloned().collect(),
        decrypted_content: None,
        error: None,
        is_sending: false,
        client_first_seen: None,
        original_gift_wrap_id: None,
        envelope: Some(event.clone()),
    }
}

fn modern_message(seal: &Event, rumor: &UnsignedEvent, wrapper_id: Option<String>) -> DmMessage {
    let created_at = rumor.created_at.as_secs();
    let id = match rumor.id {
        Some(id) => id.to_hex(),
        None => fallback_id(rumor.kind.as_u16(), created_at, &seal.pubkey, &rumor.content),
    };
    DmMessage {
        id,
        pubkey: seal.pubkey,
        kind: rumor.kind,
        protocol: MessageProtocol::Nip17,
        created_at,
        content: seal.content.clone(),
        tags: rumor.tags.iter().cloned().collect(),
        decrypted_content: Some(rumor.content.clone()),
        error: None,
        is_sending: false,
        client_first_seen: None,
        original_gift_wrap_id: wrapper_id,
        envelope: Some(seal.clone()),
    }
}

fn failed_seal_message(stored: &StoredMessage) -> DmMessage {
    let seal = &stored.event;
    DmMessage {
        id: seal.id.to_hex(),
        pubkey: seal.pubkey,
        kind: seal.kind,
        protocol: MessageProtocol::Nip17,
        created_at: stored.created_at,
        content: seal.content.clone(),
        tags: Vec::new(),
        decrypted_content: None,
        error: None,
        is_sending: false,
        client_first_seen: None,
        original_gift_wrap_id: stored.original_gift_wrap_id.clone(),
        envelope: Some(seal.clone()),
    }
}

/// Deterministic id for rumors that arrive without one.
pub fn fallback_id(kind: u16, created_at: u64, author: &PublicKey, content: &str) -> String {
    let author_hex = author.to_hex();
    let author_prefix: String = author_hex.chars().take(8).collect();
    let content_prefix: String = content.chars().take(16).collect();
    format!("missing-{kind}-{created_at}-{author_prefix}-{content_prefix}")
}
