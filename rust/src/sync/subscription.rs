use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use nostr_sdk::prelude::*;
use tokio::sync::Notify;

use super::Inner;
use crate::protocol::{MessageProtocol, GIFT_WRAP_SKEW_SECS, KIND_GIFT_WRAP, KIND_LEGACY_DM};
use crate::store::AddOutcome;
use crate::transport::{DmFilter, EventStream};
use crate::updates::DmUpdate;

/// A running live subscription. Closing flips `alive` and wakes the consumer, which
/// exits at its next suspension point without interrupting an in-flight decode.
pub(crate) struct SubscriptionHandle {
    alive: Arc<AtomicBool>,
    stop: Arc<Notify>,
}

impl SubscriptionHandle {
    pub(crate) fn close(self) {
        self.alive.store(false, Ordering::SeqCst);
        self.stop.notify_one();
    }
}

/// `since` for a live subscription: the newer of the scan's newest envelope and the
/// prior checkpoint minus the overlap, or `now` when neither exists. Gift wraps
/// additionally reach back over the randomized timestamp window.
pub fn subscription_since(
    protocol: MessageProtocol,
    scan_newest: Option<u64>,
    checkpoint: Option<u64>,
    overlap_secs: u64,
    now: u64,
) -> u64 {
    let resumed = checkpoint.map(|c| c.saturating_sub(overlap_secs));
    let base = match (scan_newest, resumed) {
        (Some(newest), Some(resumed)) => newest.max(resumed),
        (Some(newest), None) => newest,
        (None, Some(resumed)) => resumed,
        (None, None) => now,
    };
    match protocol {
        MessageProtocol::Nip04 => base,
        MessageProtocol::Nip17 => base.saturating_sub(GIFT_WRAP_SKEW_SECS),
    }
}

impl Inner {
    fn live_filters(&self, protocol: MessageProtocol, since: u64) -> Vec<DmFilter> {
        match protocol {
            MessageProtocol::Nip04 => vec![
                DmFilter::new(KIND_LEGACY_DM)
                    .author(self.me)
                    .since(Some(since)),
                DmFilter::new(KIND_LEGACY_DM)
                    .recipient(self.me)
                    .since(Some(since)),
            ],
            MessageProtocol::Nip17 => vec![DmFilter::new(KIND_GIFT_WRAP)
                .recipient(self.me)
                .since(Some(since))],
        }
    }

    /// Open (or replace) the live subscription for one protocol.
    pub(crate) async fn open_subscription(self: &Arc<Self>, protocol: MessageProtocol, since: u64) {
        self.close_subscription(protocol);

        let stream = match self.transport.subscribe(self.live_filters(protocol, since)).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(%e, %protocol, "failed to open dm subscription");
                self.set_subscription_status(protocol, false);
                return;
            }
        };

        let alive = Arc::new(AtomicBool::new(true));
        let stop = Arc::new(Notify::new());
        tokio::spawn(consume(
            Arc::downgrade(self),
            protocol,
            stream,
            Arc::clone(&alive),
            Arc::clone(&stop),
        ));
        if let Some(previous) = self
            .live
            .lock()
            .insert(protocol, SubscriptionHandle { alive, stop })
        {
            previous.close();
        }
        tracing::info!(%protocol, since, "dm subscription open");
        self.set_subscription_status(protocol, true);
    }

    pub(crate) fn close_subscription(&self, protocol: MessageProtocol) {
        if let Some(handle) = self.live.lock().remove(&protocol) {
            handle.close();
            tracing::debug!(%protocol, "dm subscription closed");
        }
    }

    pub(crate) fn close_all_subscriptions(&self) {
        let handles: Vec<_> = self.live.lock().drain().collect();
        for (protocol, handle) in handles {
            handle.close();
            self.set_subscription_status(protocol, false);
        }
    }

    async fn handle_live_event(&self, protocol: MessageProtocol, event: Event) {
        let decoded = self.codec.decode(&event).await;
        if let Some(failure) = decoded.failure() {
            self.errors
                .record(&format!("{} live", protocol.label()), &failure.kind.to_string());
        }
        let Some((partner, message)) = decoded.into_placement() else {
            return;
        };
        let outcome = self.store.add_single(message, partner, protocol);
        if outcome != AddOutcome::Duplicate {
            tracing::debug!(%protocol, partner = %partner, ?outcome, "live dm");
            self.emit(|rev| DmUpdate::ConversationsChanged { rev });
        }
    }
}

async fn consume(
    inner: Weak<Inner>,
    protocol: MessageProtocol,
    stream: EventStream,
    alive: Arc<AtomicBool>,
    stop: Arc<Notify>,
) {
    loop {
        let next = tokio::select! {
            _ = stop.notified() => break,
            next = stream.recv_async() => next,
        };
        if !alive.load(Ordering::SeqCst) {
            break;
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match next {
            Ok(event) => inner.handle_live_event(protocol, event).await,
            Err(_) => {
                // No automatic reconnect; a resync reopens the subscription.
                tracing::warn!(%protocol, "dm subscription stream ended");
                if alive.swap(false, Ordering::SeqCst) {
                    inner.set_subscription_status(protocol, false);
                }
                break;
            }
        }
    }
}
