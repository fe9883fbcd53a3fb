use std::path::Path;
use std::time::Duration;

use nostr_sdk::prelude::RelayUrl;
use serde::{Deserialize, Serialize};

use crate::protocol::ProtocolMode;

pub const CONFIG_FILE: &str = "courier_config.json";

const DEFAULT_RELAY_URLS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://relay.primal.net",
    "wss://nos.lol",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DmConfig {
    pub enabled: bool,
    pub protocol_mode: ProtocolMode,
    pub relay_urls: Option<Vec<String>>,
    pub disable_network: Option<bool>,
    /// Namespaces persisted records so separate deployments sharing storage don't collide.
    pub storage_scope: String,
    pub timing: Timing,
}

impl Default for DmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            protocol_mode: ProtocolMode::default(),
            relay_urls: None,
            disable_network: None,
            storage_scope: "default".to_string(),
            timing: Timing::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub debounced_write_ms: u64,
    pub recent_message_threshold_ms: u64,
    pub subscription_overlap_secs: u64,
    pub scan_batch_size: usize,
    pub scan_total_limit: usize,
    /// Legacy scans query two directions per batch, so a full batch is this many times the limit.
    pub legacy_batch_multiplier: usize,
    pub nip04_query_timeout_ms: u64,
    pub nip17_query_timeout_ms: u64,
    pub error_log_debounce_ms: u64,
    pub messages_per_page: usize,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            debounced_write_ms: 15_000,
            recent_message_threshold_ms: 5_000,
            subscription_overlap_secs: 10,
            scan_batch_size: 1_000,
            scan_total_limit: 20_000,
            legacy_batch_multiplier: 2,
            nip04_query_timeout_ms: 15_000,
            nip17_query_timeout_ms: 30_000,
            error_log_debounce_ms: 2_000,
            messages_per_page: 25,
        }
    }
}

impl Timing {
    pub fn debounced_write(&self) -> Duration {
        Duration::from_millis(self.debounced_write_ms)
    }

    pub fn freshness(&self) -> Duration {
        Duration::from_millis(self.recent_message_threshold_ms)
    }

    pub fn error_window(&self) -> Duration {
        Duration::from_millis(self.error_log_debounce_ms)
    }
}

pub fn load_config(data_dir: &Path) -> DmConfig {
    let path = data_dir.join(CONFIG_FILE);
    let Ok(bytes) = std::fs::read(&path) else {
        return DmConfig::default();
    };
    match serde_json::from_slice::<DmConfig>(&bytes) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(%e, path = %path.display(), "invalid config, using defaults");
            DmConfig::default()
        }
    }
}

impl DmConfig {
    pub fn network_enabled(&self) -> bool {
        // Used to keep tests deterministic and offline.
        if let Some(disable) = self.disable_network {
            return !disable;
        }
        std::env::var("COURIER_DISABLE_NETWORK").ok().as_deref() != Some("1")
    }

    pub fn relay_urls(&self) -> Vec<RelayUrl> {
        if let Some(urls) = &self.relay_urls {
            let parsed: Vec<RelayUrl> = urls
                .iter()
                .filter_map(|u| RelayUrl::parse(u).ok())
                .collect();
            if !parsed.is_empty() {
                return parsed;
            }
        }
        DEFAULT_RELAY_URLS
            .iter()
            .filter_map(|u| RelayUrl::parse(u).ok())
            .collect()
    }

    /// Relay set as plain strings, used to detect configuration changes.
    pub fn relay_set(&self) -> Vec<String> {
        self.relay_urls().iter().map(|u| u.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path());
        assert_eq!(config, DmConfig::default());
        assert!(config.enabled);
        assert_eq!(config.timing.scan_batch_size, 1_000);
        assert_eq!(config.timing.nip17_query_timeout_ms, 30_000);
    }

    #[test]
    fn partial_file_overrides_only_named_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"protocol_mode":"nip04_only","timing":{"debounced_write_ms":50}}"#,
        )
        .unwrap();
        let config = load_config(dir.path());
        assert_eq!(config.protocol_mode, ProtocolMode::Nip04Only);
        assert_eq!(config.timing.debounced_write_ms, 50);
        assert_eq!(config.timing.messages_per_page, 25);
        assert_eq!(config.storage_scope, "default");
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{not json").unwrap();
        assert_eq!(load_config(dir.path()), DmConfig::default());
    }

    #[test]
    fn explicit_disable_network_wins_over_env() {
        let config = DmConfig {
            disable_network: Some(true),
            ..Default::default()
        };
        assert!(!config.network_enabled());
    }

    #[test]
    fn invalid_relay_urls_fall_back_to_defaults() {
        let config = DmConfig {
            relay_urls: Some(vec!["not a url".into()]),
            ..Default::default()
        };
        assert_eq!(config.relay_urls().len(), DEFAULT_RELAY_URLS.len());
    }
}
