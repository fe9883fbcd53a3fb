use std::collections::HashMap;
use std::time::Duration;

use nostr_sdk::prelude::*;

use super::Inner;
use crate::error::TransportError;
use crate::model::{DmMessage, ScanProgress};
use crate::protocol::{MessageProtocol, GIFT_WRAP_SKEW_SECS, KIND_GIFT_WRAP, KIND_LEGACY_DM};
use crate::transport::DmFilter;

pub(crate) struct ScanOutcome {
    pub protocol: MessageProtocol,
    pub messages: HashMap<PublicKey, Vec<DmMessage>>,
    /// Newest envelope timestamp fetched.
    pub newest: Option<u64>,
    pub fetched: usize,
    /// Set when a query failed or timed out; partial results are still returned.
    pub error: Option<TransportError>,
}

impl Inner {
    /// Historical batch scan for one protocol, resuming from its checkpoint.
    pub(crate) async fn scan(&self, protocol: MessageProtocol, checkpoint: Option<u64>) -> ScanOutcome {
        let timing = self.config.timing;
        let timeout = Duration::from_millis(match protocol {
            MessageProtocol::Nip04 => timing.nip04_query_timeout_ms,
            MessageProtocol::Nip17 => timing.nip17_query_timeout_ms,
        });
        let category = format!("{} scan", protocol.label());

        let mut outcome = ScanOutcome {
            protocol,
            messages: HashMap::new(),
            newest: None,
            fetched: 0,
            error: None,
        };
        let mut cursor = scan_since(protocol, checkpoint);
        let mut batch_number = 0;

        self.set_progress(
            protocol,
            Some(ScanProgress {
                current: 0,
                status: format!("Starting {} scan...", protocol.label()),
            }),
        );

        while outcome.fetched < timing.scan_total_limit {
            let limit = timing
                .scan_batch_size
                .min(timing.scan_total_limit - outcome.fetched);
            let full_batch = match protocol {
                MessageProtocol::Nip04 => limit * timing.legacy_batch_multiplier,
                MessageProtocol::Nip17 => limit,
            };
            let filters = self.scan_filters(protocol, cursor, limit);
            let events = match self.transport.query(filters, timeout).await {
                Ok(events) => events,
                Err(e) => {
                    tracing::warn!(%e, %protocol, batch = batch_number + 1, "dm scan query failed");
                    outcome.error = Some(e);
                    break;
                }
            };
            if events.is_empty() {
                break;
            }
            batch_number += 1;
            outcome.fetched += events.len();

            let mut oldest = u64::MAX;
            for event in &events {
                let created_at = event.created_at.as_secs();
                oldest = oldest.min(created_at);
                outcome.newest = Some(outcome.newest.map_or(created_at, |n| n.max(created_at)));

                let decoded = self.codec.decode(event).await;
                if let Some(failure) = decoded.failure() {
                    self.errors.record(&category, &failure.kind.to_string());
                }
                if let Some((partner, message)) = decoded.into_placement() {
                    outcome.messages.entry(partner).or_default().push(message);
                }
            }

            self.set_progress(
                protocol,
                Some(ScanProgress {
                    current: outcome.fetched,
                    status: format!("Batch {batch_number} complete: {} messages", events.len()),
                }),
            );
            tracing::debug!(%protocol, batch = batch_number, count = events.len(), "dm scan batch");

            // Short batch means the relay is probably drained. This is a heuristic and
            // `legacy_batch_multiplier` is the knob for it.
            if events.len() < full_batch {
                break;
            }
            // Resume from the oldest timestamp seen. A relay that answers newest-first
            // can hand back the same window again; dedup absorbs it and the total cap
            // ends the loop. Tune `scan_batch_size` and `scan_total_limit` to trade
            // depth against query count.
            cursor = Some(oldest);
        }

        self.set_progress(protocol, None);
        outcome
    }

    fn scan_filters(
        &self,
        protocol: MessageProtocol,
        since: Option<u64>,
        limit: usize,
    ) -> Vec<DmFilter> {
        match protocol {
            MessageProtocol::Nip04 => vec![
                DmFilter::new(KIND_LEGACY_DM)
                    .author(self.me)
                    .since(since)
                    .limit(limit),
                DmFilter::new(KIND_LEGACY_DM)
                    .recipient(self.me)
                    .since(since)
                    .limit(limit),
            ],
            MessageProtocol::Nip17 => vec![DmFilter::new(KIND_GIFT_WRAP)
                .recipient(self.me)
                .since(since)
                .limit(limit)],
        }
    }
}

/// Where a historical scan starts. Gift-wrap timestamps may sit up to two days in the past.
pub(crate) fn scan_since(protocol: MessageProtocol, checkpoint: Option<u64>) -> Option<u64> {
    match protocol {
        MessageProtocol::Nip04 => checkpoint,
        MessageProtocol::Nip17 => checkpoint.map(|c| c.saturating_sub(GIFT_WRAP_SKEW_SECS)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modern_scan_resumes_two_days_before_checkpoint() {
        let checkpoint = 1_700_000_000;
        assert_eq!(
            scan_since(MessageProtocol::Nip17, Some(checkpoint)),
            Some(checkpoint - GIFT_WRAP_SKEW_SECS)
        );
        assert_eq!(
            scan_since(MessageProtocol::Nip04, Some(checkpoint)),
            Some(checkpoint)
        );
        assert_eq!(scan_since(MessageProtocol::Nip17, None), None);
    }

    #[test]
    fn skewed_resume_covers_a_wrap_backdated_by_36_hours() {
        let checkpoint = 1_700_000_000;
        let outer_created_at = checkpoint - 36 * 60 * 60;
        let since = scan_since(MessageProtocol::Nip17, Some(checkpoint)).unwrap();
        assert!(outer_created_at >= since);
    }
}
