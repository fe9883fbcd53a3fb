use crate::model::{ScanProgressState, SubscriptionStatus, SyncCheckpoints};
use crate::protocol::LoadingPhase;

/// Change notifications published by the sync engine.
///
/// Conversations themselves are not carried; read a fresh snapshot on `ConversationsChanged`.
#[derive(Debug, Clone, PartialEq)]
pub enum DmUpdate {
    LoadingPhaseChanged {
        rev: u64,
        phase: LoadingPhase,
        is_loading: bool,
    },
    ConversationsChanged {
        rev: u64,
    },
    SubscriptionsChanged {
        rev: u64,
        status: SubscriptionStatus,
    },
    ScanProgressChanged {
        rev: u64,
        progress: ScanProgressState,
    },
    CheckpointsChanged {
        rev: u64,
        last_sync: SyncCheckpoints,
    },
    SendFailed {
        rev: u64,
        recipient: String,
        error: String,
    },
}

impl DmUpdate {
    pub fn rev(&self) -> u64 {
        match self {
            DmUpdate::LoadingPhaseChanged { rev, .. } => *rev,
            DmUpdate::ConversationsChanged { rev } => *rev,
            DmUpdate::SubscriptionsChanged { rev, .. } => *rev,
            DmUpdate::ScanProgressChanged { rev, .. } => *rev,
            DmUpdate::CheckpointsChanged { rev, .. } => *rev,
            DmUpdate::SendFailed { rev, .. } => *rev,
        }
    }
}
