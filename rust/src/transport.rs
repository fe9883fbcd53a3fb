//! Relay transport seam.
//!
//! The sync engine only needs query / subscribe / publish. [`RelayTransport`] is
//! implemented for `nostr_sdk::Client`; tests plug in an in-memory relay.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use nostr_sdk::prelude::*;

use crate::error::TransportError;

/// The subset of relay filters this engine uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmFilter {
    pub kind: u16,
    pub author: Option<PublicKey>,
    /// Matches events carrying this pubkey in a `p` tag.
    pub recipient: Option<PublicKey>,
    pub since: Option<u64>,
    pub limit: Option<usize>,
}

impl DmFilter {
    pub fn new(kind: u16) -> Self {
        Self {
            kind,
            author: None,
            recipient: None,
            since: None,
            limit: None,
        }
    }

    pub fn author(mut self, author: PublicKey) -> Self {
        self.author = Some(author);
        self
    }

    pub fn recipient(mut self, recipient: PublicKey) -> Self {
        self.recipient = Some(recipient);
        self
    }

    pub fn since(mut self, since: Option<u64>) -> Self {
        self.since = since;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if event.kind.as_u16() != self.kind {
            return false;
        }
        if self.author.is_some_and(|a| a != event.pubkey) {
            return false;
        }
        if let Some(recipient) = &self.recipient {
            if !event.tags.public_keys().any(|pk| pk == recipient) {
                return false;
            }
        }
        if self.since.is_some_and(|s| event.created_at.as_secs() < s) {
            return false;
        }
        true
    }

    pub fn to_nostr(&self) -> Filter {
        let mut filter = Filter::new().kind(Kind::from(self.kind));
        if let Some(author) = self.author {
            filter = filter.author(author);
        }
        if let Some(recipient) = self.recipient {
            filter = filter.pubkey(recipient);
        }
        if let Some(since) = self.since {
            filter = filter.since(Timestamp::from(since));
        }
        if let Some(limit) = self.limit {
            filter = filter.limit(limit);
        }
        filter
    }
}

/// Per-relay result of a publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    pub accepted: Vec<String>,
    pub rejected: BTreeMap<String, String>,
}

impl PublishOutcome {
    pub fn is_accepted(&self) -> bool {
        !self.accepted.is_empty()
    }
}

/// Live events for one subscription. Dropping the receiver ends the subscription.
pub type EventStream = flume::Receiver<Event>;

#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn query(
        &self,
        filters: Vec<DmFilter>,
        timeout: Duration,
    ) -> Result<Vec<Event>, TransportError>;

    async fn subscribe(&self, filters: Vec<DmFilter>) -> Result<EventStream, TransportError>;

    async fn publish(&self, event: &Event) -> Result<PublishOutcome, TransportError>;
}

#[async_trait]
impl RelayTransport for Client {
    async fn query(
        &self,
        filters: Vec<DmFilter>,
        timeout: Duration,
    ) -> Result<Vec<Event>, TransportError> {
        let fetch = async {
            let mut seen: HashSet<EventId> = HashSet::new();
            let mut out = Vec::new();
            for filter in &filters {
                let events = self
                    .fetch_events(filter.to_nostr(), timeout)
                    .await
                    .map_err(|e| TransportError::Query(e.to_string()))?;
                for event in events {
                    if seen.insert(event.id) {
                        out.push(event);
                    }
                }
            }
            Ok::<_, TransportError>(out)
        };
        // fetch_events applies the timeout per filter; bound the whole query as well.
        match tokio::time::timeout(timeout * filters.len().max(1) as u32, fetch).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout.as_millis())),
        }
    }

    async fn subscribe(&self, filters: Vec<DmFilter>) -> Result<EventStream, TransportError> {
        // Take the broadcast receiver first so nothing between subscribe and spawn is lost.
        let mut notifications = self.notifications();
        let mut ids = Vec::with_capacity(filters.len());
        for filter in &filters {
            let output = Client::subscribe(self, filter.to_nostr(), None)
                .await
                .map_err(|e| TransportError::Subscribe(e.to_string()))?;
            ids.push(output.val);
        }

        let (tx, rx) = flume::unbounded();
        let client = self.clone();
        tokio::spawn(async move {
            // Dropping the stream is noticed on the next pool notification.
            while !tx.is_disconnected() {
                match notifications.recv().await {
                    Ok(RelayPoolNotification::Event {
                        subscription_id,
                        event,
                        ..
                    }) => {
                        if !ids.contains(&subscription_id) {
                            continue;
                        }
                        if tx.send((*event).clone()).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "relay notifications lagged");
                    }
                    Err(_) => break,
                }
            }
            for id in &ids {
                let _ = client.unsubscribe(id).await;
            }
        });
        Ok(rx)
    }

    async fn publish(&self, event: &Event) -> Result<PublishOutcome, TransportError> {
        let output = self
            .send_event(event)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        Ok(PublishOutcome {
            accepted: output.success.iter().map(|url| url.to_string()).collect(),
            rejected: output
                .failed
                .iter()
                .map(|(url, err)| (url.to_string(), err.clone()))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy(from: &Keys, to: PublicKey, at: u64) -> Event {
        EventBuilder::new(Kind::from(4), "ciphertext?iv=abc")
            .tag(Tag::public_key(to))
            .custom_created_at(Timestamp::from(at))
            .sign_with_keys(from)
            .unwrap()
    }

    #[test]
    fn filter_matches_author_recipient_and_since() {
        let me = Keys::generate();
        let bob = Keys::generate();
        let inbound = legacy(&bob, me.public_key(), 100);
        let outbound = legacy(&me, bob.public_key(), 200);

        let to_me = DmFilter::new(4).recipient(me.public_key());
        assert!(to_me.matches(&inbound));
        assert!(!to_me.matches(&outbound));

        let from_me = DmFilter::new(4).author(me.public_key()).since(Some(150));
        assert!(from_me.matches(&outbound));
        assert!(!from_me.matches(&inbound));
        assert!(!DmFilter::new(1059).matches(&inbound));
        assert!(!from_me.clone().since(Some(201)).matches(&outbound));
    }
}
