//! Send path: optimistic insert, envelope construction and publishing.

use std::sync::Arc;

use nostr_sdk::nostr::nips::nip44;
use nostr_sdk::prelude::*;
use rand::distributions::Alphanumeric;
use rand::Rng;

use super::DmSync;
use crate::error::SendError;
use crate::model::{now_millis, now_seconds, DmMessage};
use crate::protocol::{
    MessageProtocol, GIFT_WRAP_SKEW_SECS, KIND_GIFT_WRAP, KIND_LEGACY_DM, KIND_PRIVATE_FILE,
    KIND_PRIVATE_TEXT, KIND_SEAL, OPTIMISTIC_ID_PREFIX,
};
use crate::updates::DmUpdate;

/// An already-uploaded file. `tags` are the upload service's descriptor tags (`x`, `ox`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttachment {
    pub url: String,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
    pub name: Option<String>,
    pub tags: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendRequest {
    pub recipient: PublicKey,
    pub content: String,
    /// Defaults to the legacy protocol.
    pub protocol: Option<MessageProtocol>,
    pub attachments: Vec<FileAttachment>,
}

impl SendRequest {
    pub fn text(recipient: PublicKey, content: impl Into<String>) -> Self {
        Self {
            recipient,
            content: content.into(),
            protocol: None,
            attachments: Vec::new(),
        }
    }

    pub fn with_protocol(mut self, protocol: MessageProtocol) -> Self {
        self.protocol = Some(protocol);
        self
    }
}

/// Message body with attachment URLs appended as trailing lines.
pub fn prepare_payload(content: &str, attachments: &[FileAttachment]) -> String {
    if attachments.is_empty() {
        return content.to_string();
    }
    let urls = attachments
        .iter()
        .map(|a| a.url.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    if content.is_empty() {
        urls
    } else {
        format!("{content}\n\n{urls}")
    }
}

/// One `imeta` tag per attachment.
pub fn imeta_tags(attachments: &[FileAttachment]) -> Vec<Tag> {
    attachments
        .iter()
        .map(|attachment| {
            let mut values = vec![format!("url {}", attachment.url)];
            if let Some(mime) = &attachment.mime_type {
                values.push(format!("m {mime}"));
            }
            if let Some(size) = attachment.size {
                values.push(format!("size {size}"));
            }
            if let Some(name) = &attachment.name {
                values.push(format!("alt {name}"));
            }
            for tag in &attachment.tags {
                if let [key, value, ..] = tag.as_slice() {
                    if key == "x" || key == "ox" {
                        values.push(format!("{key} {value}"));
                    }
                }
            }
            Tag::custom(TagKind::Custom("imeta".into()), values)
        })
        .collect()
}

pub(crate) fn build_rumor(
    author: PublicKey,
    recipient: PublicKey,
    payload: &str,
    attachments: &[FileAttachment],
    created_at: u64,
) -> UnsignedEvent {
    let kind = if attachments.is_empty() {
        KIND_PRIVATE_TEXT
    } else {
        KIND_PRIVATE_FILE
    };
    let mut rumor = EventBuilder::new(Kind::from(kind), payload)
        .tag(Tag::public_key(recipient))
        .tags(imeta_tags(attachments))
        .custom_created_at(Timestamp::from(created_at))
        .build(author);
    rumor.ensure_id();
    rumor
}

/// Seal `rumor` for `target` with the signer, then gift-wrap it under a one-time key.
pub(crate) async fn wrap_rumor(
    signer: &Arc<dyn NostrSigner>,
    rumor: &UnsignedEvent,
    target: PublicKey,
    wrap_created_at: u64,
) -> Result<Event, SendError> {
    let sealed = signer
        .nip44_encrypt(&target, &rumor.as_json())
        .await
        .map_err(|e| SendError::Signer(e.to_string()))?;
    let unsigned_seal = EventBuilder::new(Kind::from(KIND_SEAL), sealed)
        .custom_created_at(rumor.created_at)
        .build(rumor.pubkey);
    let seal = signer
        .sign_event(unsigned_seal)
        .await
        .map_err(|e| SendError::Signer(e.to_string()))?;

    let ephemeral = Keys::generate();
    let wrapped = nip44::encrypt(
        ephemeral.secret_key(),
        &target,
        seal.as_json(),
        nip44::Version::V2,
    )
    .map_err(|e| SendError::Signer(e.to_string()))?;
    EventBuilder::new(Kind::from(KIND_GIFT_WRAP), wrapped)
        .tag(Tag::public_key(target))
        .custom_created_at(Timestamp::from(wrap_created_at))
        .sign_with_keys(&ephemeral)
        .map_err(|e| SendError::Signer(e.to_string()))
}

/// Somewhere in the last two days, never in the future.
fn randomized_past(now: u64) -> u64 {
    now.saturating_sub(rand::thread_rng().gen_range(0..=GIFT_WRAP_SKEW_SECS))
}

fn optimistic_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(char::from)
        .collect();
    format!("{OPTIMISTIC_ID_PREFIX}{}-{}", now_millis(), suffix.to_lowercase())
}

impl DmSync {
    pub async fn send_message(&self, request: SendRequest) -> Result<(), SendError> {
        let inner = &self.inner;
        if !inner.config.enabled {
            return Err(SendError::Disabled);
        }
        let payload = prepare_payload(&request.content, &request.attachments);
        if payload.trim().is_empty() {
            return Err(SendError::EmptyMessage);
        }
        if request.recipient == inner.me {
            return Err(SendError::SelfRecipient);
        }
        let protocol = request.protocol.unwrap_or(MessageProtocol::Nip04);
        let created_at = now_seconds();

        let kind = match protocol {
            MessageProtocol::Nip17 if !request.attachments.is_empty() => {
                Kind::from(KIND_PRIVATE_FILE)
            }
            _ => protocol.message_kind(),
        };
        let optimistic = DmMessage {
            id: optimistic_id(),
            pubkey: inner.me,
            kind,
            protocol,
            created_at,
            content: String::new(),
            tags: vec![Tag::public_key(request.recipient)],
            decrypted_content: Some(payload.clone()),
            error: None,
            is_sending: true,
            client_first_seen: Some(now_millis()),
            original_gift_wrap_id: None,
            envelope: None,
        };
        inner
            .store
            .add_single(optimistic, request.recipient, protocol);
        inner.emit(|rev| DmUpdate::ConversationsChanged { rev });

        let result = match protocol {
            MessageProtocol::Nip04 => self.send_legacy(&request, &payload, created_at).await,
            MessageProtocol::Nip17 => self.send_modern(&request, &payload, created_at).await,
        };
        match &result {
            Ok(()) => tracing::info!(%protocol, recipient = %request.recipient, "dm sent"),
            Err(e) => {
                tracing::error!(%e, %protocol, recipient = %request.recipient, "dm send failed");
                let error = e.to_string();
                inner.emit(|rev| DmUpdate::SendFailed {
                    rev,
                    recipient: request.recipient.to_hex(),
                    error,
                });
            }
        }
        result
    }

    async fn send_legacy(
        &self,
        request: &SendRequest,
        payload: &str,
        created_at: u64,
    ) -> Result<(), SendError> {
        let inner = &self.inner;
        let ciphertext = inner
            .signer
            .nip04_encrypt(&request.recipient, payload)
            .await
            .map_err(|e| SendError::Signer(e.to_string()))?;
        let unsigned = EventBuilder::new(Kind::from(KIND_LEGACY_DM), ciphertext)
            .tag(Tag::public_key(request.recipient))
            .tags(imeta_tags(&request.attachments))
            .custom_created_at(Timestamp::from(created_at))
            .build(inner.me);
        let event = inner
            .signer
            .sign_event(unsigned)
            .await
            .map_err(|e| SendError::Signer(e.to_string()))?;

        let outcome = inner.transport.publish(&event).await?;
        if !outcome.is_accepted() {
            tracing::warn!(rejected = ?outcome.rejected, "legacy dm rejected by all relays");
            return Err(SendError::Rejected);
        }
        Ok(())
    }

    async fn send_modern(
        &self,
        request: &SendRequest,
        payload: &str,
        created_at: u64,
    ) -> Result<(), SendError> {
        let me = self.inner.me;
        let rumor = build_rumor(
            me,
            request.recipient,
            payload,
            &request.attachments,
            created_at,
        );
        let (to_recipient, to_self) = tokio::join!(
            self.publish_copy(&rumor, request.recipient),
            self.publish_copy(&rumor, me),
        );
        match (to_recipient, to_self) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) => {
                tracing::warn!(%e, "recipient copy failed, self copy published");
                Ok(())
            }
            (Ok(()), Err(e)) => {
                tracing::warn!(%e, "self copy failed, recipient copy published");
                Ok(())
            }
            (Err(SendError::Signer(e)), Err(_)) => Err(SendError::Signer(e)),
            (Err(recipient_err), Err(self_err)) => {
                tracing::error!(%recipient_err, %self_err, "both gift wrap copies failed");
                Err(SendError::BothCopiesRejected)
            }
        }
    }

    async fn publish_copy(&self, rumor: &UnsignedEvent, target: PublicKey) -> Result<(), SendError> {
        let wrap = wrap_rumor(
            &self.inner.signer,
            rumor,
            target,
            randomized_past(now_seconds()),
        )
        .await?;
        let outcome = self.inner.transport.publish(&wrap).await?;
        if !outcome.is_accepted() {
            return Err(SendError::Rejected);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(url: &str) -> FileAttachment {
        FileAttachment {
            url: url.into(),
            mime_type: Some("image/jpeg".into()),
            size: Some(1024),
            name: Some("photo.jpg".into()),
            tags: vec![
                vec!["x".into(), "deadbeef".into()],
                vec!["ox".into(), "cafebabe".into()],
                vec!["dim".into(), "10x10".into()],
            ],
        }
    }

    #[test]
    fn payload_appends_urls_after_blank_line() {
        let files = [attachment("https://a/1.jpg"), attachment("https://a/2.jpg")];
        assert_eq!(
            prepare_payload("look", &files),
            "look\n\nhttps://a/1.jpg\nhttps://a/2.jpg"
        );
        assert_eq!(prepare_payload("", &files[..1]), "https://a/1.jpg");
        assert_eq!(prepare_payload("plain", &[]), "plain");
    }

    #[test]
    fn imeta_tag_carries_file_metadata() {
        let tags = imeta_tags(&[attachment("https://a/1.jpg")]);
        assert_eq!(tags.len(), 1);
        let values = tags[0].as_slice();
        assert_eq!(values[0], "imeta");
        assert!(values.contains(&"url https://a/1.jpg".to_string()));
        assert!(values.contains(&"m image/jpeg".to_string()));
        assert!(values.contains(&"size 1024".to_string()));
        assert!(values.contains(&"x deadbeef".to_string()));
        assert!(values.contains(&"ox cafebabe".to_string()));
        assert!(!values.iter().any(|v| v.starts_with("dim")));
    }

    #[test]
    fn rumor_kind_depends_on_attachments() {
        let me = Keys::generate().public_key();
        let bob = Keys::generate().public_key();
        let text = build_rumor(me, bob, "hi", &[], 10);
        assert_eq!(text.kind.as_u16(), KIND_PRIVATE_TEXT);
        assert!(text.id.is_some());
        let file = build_rumor(me, bob, "hi", &[attachment("https://a/1.jpg")], 10);
        assert_eq!(file.kind.as_u16(), KIND_PRIVATE_FILE);
    }

    #[test]
    fn wrap_timestamps_never_land_in_the_future() {
        let now = 1_700_000_000;
        for _ in 0..100 {
            let ts = randomized_past(now);
            assert!(ts <= now);
            assert!(ts >= now - GIFT_WRAP_SKEW_SECS);
        }
    }

    #[test]
    fn optimistic_ids_are_prefixed_and_unique() {
        let a = optimistic_id();
        let b = optimistic_id();
        assert!(a.starts_with(OPTIMISTIC_ID_PREFIX));
        assert_ne!(a, b);
    }
}
