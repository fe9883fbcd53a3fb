#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use courier_core::{
    DmCache, DmConfig, DmFilter, DmSync, DmSyncParams, EventStream, PublishOutcome, RelayTransport,
    Timing, TransportError,
};
use nostr_sdk::prelude::*;
use parking_lot::Mutex;

pub const RELAY_URL: &str = "wss://mock.relay";

/// In-memory relay: stores events, answers filtered queries newest-first and fans
/// published events out to matching live subscriptions.
#[derive(Default)]
pub struct MockRelay {
    events: Mutex<Vec<Event>>,
    subscribers: Mutex<Vec<(Vec<DmFilter>, flume::Sender<Event>)>>,
    published: Mutex<Vec<Event>>,
    failing_kinds: Mutex<HashSet<u16>>,
    delayed_kinds: Mutex<HashMap<u16, Duration>>,
    queries: Mutex<Vec<QueryRecord>>,
    reject_publish: AtomicBool,
}

/// One answered query: the filters as sent and how many events came back.
#[derive(Debug, Clone)]
pub struct QueryRecord {
    pub filters: Vec<DmFilter>,
    pub returned: usize,
}

impl MockRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store an event and deliver it to live subscribers, as if another client published it.
    pub fn inject(&self, event: Event) {
        self.events.lock().push(event.clone());
        let subscribers = self.subscribers.lock();
        for (filters, tx) in subscribers.iter() {
            if filters.iter().any(|f| f.matches(&event)) {
                let _ = tx.send(event.clone());
            }
        }
    }

    /// Queries touching this kind time out.
    pub fn fail_queries_for(&self, kind: u16) {
        self.failing_kinds.lock().insert(kind);
    }

    /// Queries touching this kind answer only after `delay`.
    pub fn delay_queries_for(&self, kind: u16, delay: Duration) {
        self.delayed_kinds.lock().insert(kind, delay);
    }

    /// Answered queries touching this kind, in order.
    pub fn queries_for(&self, kind: u16) -> Vec<QueryRecord> {
        self.queries
            .lock()
            .iter()
            .filter(|q| q.filters.iter().any(|f| f.kind == kind))
            .cloned()
            .collect()
    }

    pub fn reject_publishes(&self, reject: bool) {
        self.reject_publish.store(reject, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<Event> {
        self.published.lock().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .iter()
            .filter(|(_, tx)| !tx.is_disconnected())
            .count()
    }

    /// Drop every live subscription, as a relay disconnect would.
    pub fn disconnect_all(&self) {
        self.subscribers.lock().clear();
    }
}

#[async_trait]
impl RelayTransport for MockRelay {
    async fn query(
        &self,
        filters: Vec<DmFilter>,
        timeout: Duration,
    ) -> Result<Vec<Event>, TransportError> {
        {
            let failing = self.failing_kinds.lock();
            if filters.iter().any(|f| failing.contains(&f.kind)) {
                return Err(TransportError::Timeout(timeout.as_millis()));
            }
        }
        let delay = {
            let delayed = self.delayed_kinds.lock();
            filters.iter().find_map(|f| delayed.get(&f.kind).copied())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let events = self.events.lock().clone();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for filter in &filters {
            let mut matching: Vec<&Event> = events.iter().filter(|e| filter.matches(e)).collect();
            matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            if let Some(limit) = filter.limit {
                matching.truncate(limit);
            }
            for event in matching {
                if seen.insert(event.id) {
                    out.push(event.clone());
                }
            }
        }
        self.queries.lock().push(QueryRecord {
            filters,
            returned: out.len(),
        });
        Ok(out)
    }

    async fn subscribe(&self, filters: Vec<DmFilter>) -> Result<EventStream, TransportError> {
        let (tx, rx) = flume::unbounded();
        for event in self.events.lock().iter() {
            if filters.iter().any(|f| f.matches(event)) {
                let _ = tx.send(event.clone());
            }
        }
        self.subscribers.lock().push((filters, tx));
        Ok(rx)
    }

    async fn publish(&self, event: &Event) -> Result<PublishOutcome, TransportError> {
        if self.reject_publish.load(Ordering::SeqCst) {
            return Ok(PublishOutcome {
                accepted: Vec::new(),
                rejected: [(RELAY_URL.to_string(), "blocked: test".to_string())]
                    .into_iter()
                    .collect(),
            });
        }
        self.published.lock().push(event.clone());
        self.inject(event.clone());
        Ok(PublishOutcome {
            accepted: vec![RELAY_URL.to_string()],
            rejected: Default::default(),
        })
    }
}

pub fn test_config() -> DmConfig {
    DmConfig {
        disable_network: Some(false),
        relay_urls: Some(vec![RELAY_URL.to_string()]),
        timing: Timing {
            debounced_write_ms: 50,
            error_log_debounce_ms: 20,
            ..Timing::default()
        },
        ..DmConfig::default()
    }
}

pub fn engine(
    data_dir: &Path,
    keys: &Keys,
    relay: Arc<MockRelay>,
    cache: Arc<dyn DmCache>,
    config: DmConfig,
) -> DmSync {
    DmSync::new(DmSyncParams {
        data_dir: data_dir.to_path_buf(),
        config,
        identity: keys.public_key(),
        signer: Arc::new(keys.clone()),
        transport: relay,
        cache,
    })
}

pub async fn legacy_dm(from: &Keys, to: PublicKey, text: &str, created_at: u64) -> Event {
    let ciphertext = from.nip04_encrypt(&to, text).await.unwrap();
    EventBuilder::new(Kind::from(4), ciphertext)
        .tag(Tag::public_key(to))
        .custom_created_at(Timestamp::from(created_at))
        .sign_with_keys(from)
        .unwrap()
}

/// Gift wrap `text` from `from` to `to`, with independent inner and outer timestamps.
pub async fn gift_wrap(
    from: &Keys,
    to: PublicKey,
    text: &str,
    inner_created_at: u64,
    outer_created_at: u64,
) -> Event {
    let mut rumor = EventBuilder::new(Kind::from(14), text)
        .tag(Tag::public_key(to))
        .custom_created_at(Timestamp::from(inner_created_at))
        .build(from.public_key());
    rumor.ensure_id();
    let sealed = from.nip44_encrypt(&to, &rumor.as_json()).await.unwrap();
    let seal = EventBuilder::new(Kind::from(13), sealed)
        .custom_created_at(Timestamp::from(inner_created_at))
        .sign_with_keys(from)
        .unwrap();
    let ephemeral = Keys::generate();
    let wrapped = nostr_sdk::nostr::nips::nip44::encrypt(
        ephemeral.secret_key(),
        &to,
        seal.as_json(),
        nostr_sdk::nostr::nips::nip44::Version::V2,
    )
    .unwrap();
    EventBuilder::new(Kind::from(1059), wrapped)
        .tag(Tag::public_key(to))
        .custom_created_at(Timestamp::from(outer_created_at))
        .sign_with_keys(&ephemeral)
        .unwrap()
}

pub fn now() -> u64 {
    Timestamp::now().as_secs()
}

pub async fn wait_until(what: &str, timeout: Duration, mut f: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{what}: condition not met within {timeout:?}");
}
