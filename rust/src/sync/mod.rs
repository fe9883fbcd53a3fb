//! Sync orchestrator.
//!
//! Drives `idle → cache → relays → subscriptions → ready`, owns the live
//! subscription and debounce resources, and coordinates the send path.

mod persist;
mod scan;
pub mod send;
mod subscription;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use flume::{Receiver, Sender};
use nostr_sdk::prelude::*;
use parking_lot::Mutex;

use crate::cache::{CacheKey, DmCache};
use crate::codec::Codec;
use crate::config::DmConfig;
use crate::error::CacheError;
use crate::error_log::ErrorAggregator;
use crate::model::{
    now_seconds, Conversation, ConversationSummary, ScanProgress, ScanProgressState,
    SubscriptionStatus, SyncCheckpoints, SyncStatus,
};
use crate::pagination::{ConversationPage, ConversationView};
use crate::protocol::{LoadingPhase, MessageProtocol};
use crate::store::ConversationStore;
use crate::transport::RelayTransport;
use crate::updates::DmUpdate;

pub use send::{FileAttachment, SendRequest};
pub use subscription::subscription_since;

use persist::PersistHandle;
use subscription::SubscriptionHandle;

const CLEAR_MARKER_FILE: &str = "dm_clear_on_next_start";

pub struct DmSyncParams {
    pub data_dir: PathBuf,
    pub config: DmConfig,
    pub identity: PublicKey,
    pub signer: Arc<dyn NostrSigner>,
    pub transport: Arc<dyn RelayTransport>,
    pub cache: Arc<dyn DmCache>,
}

#[derive(Debug, Default)]
struct SyncState {
    phase: LoadingPhase,
    is_loading: bool,
    checkpoints: SyncCheckpoints,
    subscriptions: SubscriptionStatus,
    progress: ScanProgressState,
    has_initial_load_completed: bool,
    relays: Vec<String>,
}

pub(crate) struct Inner {
    config: DmConfig,
    data_dir: PathBuf,
    me: PublicKey,
    signer: Arc<dyn NostrSigner>,
    transport: Arc<dyn RelayTransport>,
    cache: Arc<dyn DmCache>,
    cache_key: CacheKey,
    codec: Codec,
    store: ConversationStore,
    errors: ErrorAggregator,
    state: Mutex<SyncState>,
    live: Mutex<HashMap<MessageProtocol, SubscriptionHandle>>,
    persister: Mutex<Option<PersistHandle>>,
    // Serializes load and clear cycles.
    cycle: tokio::sync::Mutex<()>,
    // Serializes cache writes against each other and against deletes.
    flush_lock: tokio::sync::Mutex<()>,
    rev: AtomicU64,
    update_sender: Sender<DmUpdate>,
    update_receiver: Receiver<DmUpdate>,
}

/// Handle to the direct-message sync engine. Cheap to clone.
#[derive(Clone)]
pub struct DmSync {
    inner: Arc<Inner>,
}

impl DmSync {
    pub fn new(params: DmSyncParams) -> Self {
        let DmSyncParams {
            data_dir,
            config,
            identity,
            signer,
            transport,
            cache,
        } = params;
        let (update_sender, update_receiver) = flume::unbounded();
        let codec = Codec::new(Arc::clone(&signer), identity, config.timing.freshness());
        let state = SyncState {
            relays: config.relay_set(),
            ..Default::default()
        };
        Self {
            inner: Arc::new(Inner {
                cache_key: CacheKey::new(config.storage_scope.clone(), identity.to_hex()),
                errors: ErrorAggregator::new(config.timing.error_window()),
                config,
                data_dir,
                me: identity,
                signer,
                transport,
                cache,
                codec,
                store: ConversationStore::new(),
                state: Mutex::new(state),
                live: Mutex::new(HashMap::new()),
                persister: Mutex::new(None),
                cycle: tokio::sync::Mutex::new(()),
                flush_lock: tokio::sync::Mutex::new(()),
                rev: AtomicU64::new(0),
                update_sender,
                update_receiver,
            }),
        }
    }

    pub fn identity(&self) -> PublicKey {
        self.inner.me
    }

    pub fn config(&self) -> &DmConfig {
        &self.inner.config
    }

    pub fn updates(&self) -> Receiver<DmUpdate> {
        self.inner.update_receiver.clone()
    }

    pub fn store(&self) -> &ConversationStore {
        &self.inner.store
    }

    pub fn conversations(&self) -> Vec<ConversationSummary> {
        self.inner.store.summaries(&self.inner.me)
    }

    pub fn conversation(&self, partner: &PublicKey) -> Option<Arc<Conversation>> {
        self.inner.store.get(partner)
    }

    pub fn page(&self, view: &ConversationView) -> ConversationPage {
        view.page(&self.inner.store)
    }

    pub fn new_view(&self) -> ConversationView {
        ConversationView::new(self.inner.config.timing.messages_per_page)
    }

    pub fn status(&self) -> SyncStatus {
        let st = self.inner.state.lock();
        SyncStatus {
            phase: st.phase,
            is_loading: st.is_loading,
            is_doing_initial_load: st.is_loading
                && matches!(st.phase, LoadingPhase::Cache | LoadingPhase::Relays),
            last_sync: st.checkpoints,
            subscriptions: st.subscriptions,
            scan_progress: st.progress.clone(),
            protocol_mode: self.inner.config.protocol_mode,
        }
    }

    /// Run one full load cycle. Returns once subscriptions are open.
    pub async fn start(&self) {
        if !self.inner.config.enabled {
            tracing::info!("direct messages disabled, skipping load");
            return;
        }
        let _cycle = self.inner.cycle.lock().await;
        if self.inner.take_clear_marker() {
            tracing::info!("clear requested on start");
            self.inner.clear_locked().await;
        }
        self.inner.load_locked().await;
    }

    pub async fn clear_cache(&self) {
        if !self.inner.config.enabled {
            return;
        }
        let _cycle = self.inner.cycle.lock().await;
        self.inner.clear_locked().await;
    }

    pub async fn clear_cache_and_refetch(&self) {
        if !self.inner.config.enabled {
            return;
        }
        let _cycle = self.inner.cycle.lock().await;
        self.inner.clear_locked().await;
        self.inner.load_locked().await;
    }

    /// Clears and reloads when the relay set differs from the one the current data came from.
    pub async fn on_relay_config_changed(&self, relays: Vec<String>) {
        let reload = {
            let mut st = self.inner.state.lock();
            if st.relays == relays {
                false
            } else {
                st.relays = relays;
                st.has_initial_load_completed
            }
        };
        if reload {
            tracing::info!("relay configuration changed, clearing dm cache");
            self.clear_cache_and_refetch().await;
        }
    }

    /// Leave a marker so the next `start()` begins from an empty cache.
    pub fn request_clear_on_next_start(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.inner.data_dir)?;
        std::fs::write(self.inner.data_dir.join(CLEAR_MARKER_FILE), b"1")
    }

    pub async fn flush(&self) -> Result<(), CacheError> {
        self.inner.flush().await
    }

    /// Close subscriptions, cancel the pending debounced write and flush once.
    pub async fn shutdown(&self) {
        self.inner.close_all_subscriptions();
        if let Some(persister) = self.inner.persister.lock().take() {
            persister.cancel();
        }
        if let Err(e) = self.inner.flush().await {
            tracing::error!(%e, "final dm cache flush failed");
        }
    }
}

impl Inner {
    pub(crate) fn next_rev(&self) -> u64 {
        self.rev.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn emit(&self, update: impl FnOnce(u64) -> DmUpdate) {
        let _ = self.update_sender.send(update(self.next_rev()));
    }

    fn set_phase(&self, phase: LoadingPhase, is_loading: bool) {
        {
            let mut st = self.state.lock();
            st.phase = phase;
            st.is_loading = is_loading;
        }
        tracing::debug!(?phase, is_loading, "dm loading phase");
        self.emit(|rev| DmUpdate::LoadingPhaseChanged {
            rev,
            phase,
            is_loading,
        });
    }

    pub(crate) fn set_progress(&self, protocol: MessageProtocol, progress: Option<ScanProgress>) {
        let snapshot = {
            let mut st = self.state.lock();
            st.progress.set(protocol, progress);
            st.progress.clone()
        };
        self.emit(|rev| DmUpdate::ScanProgressChanged {
            rev,
            progress: snapshot,
        });
    }

    pub(crate) fn set_subscription_status(&self, protocol: MessageProtocol, connected: bool) {
        let status = {
            let mut st = self.state.lock();
            st.subscriptions.set(protocol, connected);
            st.subscriptions
        };
        self.emit(|rev| DmUpdate::SubscriptionsChanged { rev, status });
    }

    fn set_checkpoint(&self, protocol: MessageProtocol, at: u64) {
        let last_sync = {
            let mut st = self.state.lock();
            st.checkpoints.set(protocol, at);
            st.checkpoints
        };
        self.emit(|rev| DmUpdate::CheckpointsChanged { rev, last_sync });
    }

    fn protocols(&self) -> Vec<MessageProtocol> {
        let mut protocols = vec![MessageProtocol::Nip04];
        if self.config.protocol_mode.modern_enabled() {
            protocols.push(MessageProtocol::Nip17);
        }
        protocols
    }

    fn take_clear_marker(&self) -> bool {
        let marker = self.data_dir.join(CLEAR_MARKER_FILE);
        if !marker.exists() {
            return false;
        }
        if let Err(e) = std::fs::remove_file(&marker) {
            tracing::warn!(%e, "failed to remove clear marker");
        }
        true
    }

    async fn load_locked(self: &Arc<Self>) {
        if self.state.lock().phase != LoadingPhase::Idle {
            tracing::debug!("dm load already ran, skipping");
            return;
        }
        self.ensure_persister();

        self.set_phase(LoadingPhase::Cache, true);
        let prior = self.load_cached().await;
        // Cached conversations are displayable from here on.
        self.set_phase(LoadingPhase::Relays, false);

        if self.config.network_enabled() {
            let protocols = self.protocols();
            let modern_enabled = protocols.contains(&MessageProtocol::Nip17);
            let flushed = AtomicBool::new(false);
            let legacy = self.scan_and_merge(MessageProtocol::Nip04, prior.nip04, &flushed);
            let modern = async {
                if modern_enabled {
                    self.scan_and_merge(MessageProtocol::Nip17, prior.nip17, &flushed)
                        .await
                } else {
                    None
                }
            };
            // Both scans must finish before subscriptions open; each merges on its own.
            let (legacy_newest, modern_newest) = tokio::join!(legacy, modern);
            let newest = HashMap::from([
                (MessageProtocol::Nip04, legacy_newest),
                (MessageProtocol::Nip17, modern_newest),
            ]);

            self.set_phase(LoadingPhase::Subscriptions, false);
            let overlap = self.config.timing.subscription_overlap_secs;
            for protocol in protocols {
                let since = subscription_since(
                    protocol,
                    newest.get(&protocol).copied().flatten(),
                    prior.get(protocol),
                    overlap,
                    now_seconds(),
                );
                self.open_subscription(protocol, since).await;
            }
        } else {
            tracing::info!("network disabled, serving dm cache only");
        }

        self.state.lock().has_initial_load_completed = true;
        self.set_phase(LoadingPhase::Ready, false);
    }

    /// Scan one protocol and merge its results as soon as that scan finishes.
    /// The first merge in a load cycle that adds messages flushes immediately.
    /// Returns the newest envelope timestamp fetched.
    async fn scan_and_merge(
        &self,
        protocol: MessageProtocol,
        checkpoint: Option<u64>,
        flushed: &AtomicBool,
    ) -> Option<u64> {
        let outcome = self.scan(protocol, checkpoint).await;
        let added = self.store.merge_batch(outcome.messages);
        if added > 0 {
            self.emit(|rev| DmUpdate::ConversationsChanged { rev });
        }
        tracing::info!(
            protocol = %outcome.protocol,
            fetched = outcome.fetched,
            added,
            "dm scan finished"
        );
        if outcome.error.is_none() {
            self.set_checkpoint(protocol, now_seconds());
        }
        if added > 0 && !flushed.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.flush().await {
                tracing::error!(%e, "immediate dm cache flush failed");
            }
        }
        outcome.newest
    }

    /// Rehydrate the cached record into the store. Returns the cached checkpoints.
    async fn load_cached(&self) -> SyncCheckpoints {
        let cache = Arc::clone(&self.cache);
        let key = self.cache_key.clone();
        let record = match tokio::task::spawn_blocking(move || cache.read(&key)).await {
            Ok(Ok(Some(record))) => record,
            Ok(Ok(None)) => {
                tracing::debug!(key = %self.cache_key, "no dm cache record");
                return SyncCheckpoints::default();
            }
            Ok(Err(e)) => {
                tracing::error!(%e, "failed to read dm cache");
                return SyncCheckpoints::default();
            }
            Err(e) => {
                tracing::error!(%e, "dm cache read task failed");
                return SyncCheckpoints::default();
            }
        };
        if record.participants.is_empty() {
            return SyncCheckpoints::default();
        }

        let modern_enabled = self.config.protocol_mode.modern_enabled();
        let mut conversations = HashMap::new();
        for (partner_hex, stored) in &record.participants {
            let Ok(partner) = PublicKey::from_hex(partner_hex) else {
                tracing::warn!(partner = %partner_hex, "skipping cached conversation with bad key");
                continue;
            };
            if !modern_enabled && stored.has_nip17 {
                continue;
            }
            let mut messages = Vec::with_capacity(stored.messages.len());
            for message in &stored.messages {
                if let Some(message) = self.codec.rehydrate(message).await {
                    messages.push(message);
                }
            }
            conversations.insert(
                partner,
                Conversation::from_messages(messages, stored.has_nip04, stored.has_nip17),
            );
        }
        tracing::info!(
            conversations = conversations.len(),
            messages = record.message_count(),
            "dm cache loaded"
        );
        self.store.replace_all(conversations);
        self.emit(|rev| DmUpdate::ConversationsChanged { rev });

        let last_sync = record.last_sync;
        self.state.lock().checkpoints = last_sync;
        self.emit(|rev| DmUpdate::CheckpointsChanged { rev, last_sync });
        last_sync
    }

    async fn clear_locked(&self) {
        self.close_all_subscriptions();
        {
            let _flush = self.flush_lock.lock().await;
            let cache = Arc::clone(&self.cache);
            let key = self.cache_key.clone();
            match tokio::task::spawn_blocking(move || cache.delete(&key)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(%e, "failed to delete dm cache"),
                Err(e) => tracing::error!(%e, "dm cache delete task failed"),
            }
            self.store.clear();
        }
        {
            let mut st = self.state.lock();
            let relays = std::mem::take(&mut st.relays);
            *st = SyncState {
                relays,
                ..Default::default()
            };
        }
        self.emit(|rev| DmUpdate::ConversationsChanged { rev });
        self.emit(|rev| DmUpdate::SubscriptionsChanged {
            rev,
            status: SubscriptionStatus::default(),
        });
        self.emit(|rev| DmUpdate::CheckpointsChanged {
            rev,
            last_sync: SyncCheckpoints::default(),
        });
        self.set_phase(LoadingPhase::Idle, false);
        tracing::info!("dm cache cleared");
    }
}
