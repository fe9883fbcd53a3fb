//! In-memory conversation store.
//!
//! Every mutation builds a fresh map under the write lock and publishes it as a
//! new snapshot, so readers holding an older `Arc` never observe partial updates.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nostr_sdk::prelude::PublicKey;
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::model::{Conversation, ConversationSummary, DmMessage};
use crate::protocol::{MessageProtocol, OPTIMISTIC_MATCH_WINDOW_SECS};

pub type ConversationMap = HashMap<PublicKey, Arc<Conversation>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Appended,
    /// An optimistic placeholder was swapped for the confirmed message.
    Replaced,
    Duplicate,
}

#[derive(Default)]
struct Snapshot {
    rev: u64,
    conversations: Arc<ConversationMap>,
}

pub struct ConversationStore {
    snapshot: RwLock<Snapshot>,
    changes: watch::Sender<u64>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            snapshot: RwLock::new(Snapshot::default()),
            changes,
        }
    }

    /// Receives the store revision after every committed mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub fn rev(&self) -> u64 {
        self.snapshot.read().rev
    }

    pub fn snapshot(&self) -> Arc<ConversationMap> {
        Arc::clone(&self.snapshot.read().conversations)
    }

    pub fn get(&self, partner: &PublicKey) -> Option<Arc<Conversation>> {
        self.snapshot.read().conversations.get(partner).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.read().conversations.is_empty()
    }

    pub fn replace_all(&self, conversations: HashMap<PublicKey, Conversation>) {
        let next = conversations
            .into_iter()
            .map(|(partner, mut conversation)| {
                conversation.normalize();
                (partner, Arc::new(conversation))
            })
            .collect();
        let mut guard = self.snapshot.write();
        self.commit(&mut guard, next);
    }

    pub fn clear(&self) {
        let mut guard = self.snapshot.write();
        self.commit(&mut guard, ConversationMap::new());
    }

    /// Merge a batch per partner, skipping anything whose dedup key is already present.
    ///
    /// Returns how many messages were actually added.
    pub fn merge_batch(&self, batch: HashMap<PublicKey, Vec<DmMessage>>) -> usize {
        let mut guard = self.snapshot.write();
        let mut next: ConversationMap = (*guard.conversations).clone();
        let mut added = 0;

        for (partner, incoming) in batch {
            if incoming.is_empty() {
                continue;
            }
            let mut conversation = next
                .get(&partner)
                .map(|c| (**c).clone())
                .unwrap_or_default();
            let mut keys: HashSet<String> = conversation
                .messages
                .iter()
                .map(|m| m.dedup_key().to_string())
                .collect();
            let before = conversation.messages.len();
            for message in incoming {
                if keys.insert(message.dedup_key().to_string()) {
                    conversation.mark_protocol(message.protocol);
                    conversation.messages.push(message);
                }
            }
            if conversation.messages.len() == before {
                continue;
            }
            added += conversation.messages.len() - before;
            conversation.normalize();
            next.insert(partner, Arc::new(conversation));
        }

        if added > 0 {
            self.commit(&mut guard, next);
        }
        added
    }

    /// Add one live or optimistic message.
    pub fn add_single(
        &self,
        message: DmMessage,
        partner: PublicKey,
        protocol: MessageProtocol,
    ) -> AddOutcome {
        let mut guard = self.snapshot.write();
        let mut conversation = guard
            .conversations
            .get(&partner)
            .map(|c| (**c).clone())
            .unwrap_or_default();
        if conversation.contains_key(message.dedup_key()) {
            return AddOutcome::Duplicate;
        }

        let placeholder = if message.is_optimistic() {
            None
        } else {
            conversation.messages.iter().position(|existing| {
                existing.is_optimistic()
                    && existing.pubkey == message.pubkey
                    && existing.decrypted_content == message.decrypted_content
                    && existing.created_at.abs_diff(message.created_at)
                        <= OPTIMISTIC_MATCH_WINDOW_SECS
            })
        };

        let outcome = match placeholder {
            Some(pos) => {
                let original = &conversation.messages[pos];
                let mut confirmed = message;
                confirmed.created_at = original.created_at;
                confirmed.client_first_seen = original.client_first_seen;
                conversation.messages[pos] = confirmed;
                AddOutcome::Replaced
            }
            None => {
                conversation.messages.push(message);
                AddOutcome::Appended
            }
        };
        conversation.mark_protocol(protocol);
        conversation.normalize();

        let mut next: ConversationMap = (*guard.conversations).clone();
        next.insert(partner, Arc::new(conversation));
        self.commit(&mut guard, next);
        outcome
    }

    /// Summaries sorted newest activity first.
    pub fn summaries(&self, me: &PublicKey) -> Vec<ConversationSummary> {
        let snapshot = self.snapshot();
        let mut list: Vec<ConversationSummary> = snapshot
            .iter()
            .map(|(partner, conversation)| {
                let is_known = conversation.messages.iter().any(|m| m.pubkey == *me);
                let last_message = conversation.last_message().cloned();
                ConversationSummary {
                    partner: *partner,
                    last_message_from_user: last_message
                        .as_ref()
                        .is_some_and(|m| m.pubkey == *me),
                    last_message,
                    last_activity: conversation.last_activity,
                    has_nip04: conversation.has_nip04,
                    has_nip17: conversation.has_nip17,
                    is_known,
                    is_request: !is_known,
                }
            })
            .collect();
        list.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then_with(|| a.partner.to_hex().cmp(&b.partner.to_hex()))
        });
        list
    }

    fn commit(&self, guard: &mut Snapshot, next: ConversationMap) {
        guard.rev += 1;
        guard.conversations = Arc::new(next);
        self.changes.send_replace(guard.rev);
    }
}
