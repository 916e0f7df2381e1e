//! Fire-and-forget progress notifications.
//!
//! Response fragments about download/install progress are surfaced on a
//! broadcast channel. Emitting never blocks and never fails a call:
//! with no subscriber, events simply evaporate.

use tokio::sync::broadcast;

use crate::model::CanonicalName;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    DownloadProgress {
        canonical_name: CanonicalName,
        percent: u8,
    },
    DownloadCompleted {
        canonical_name: CanonicalName,
    },
    InstallProgress {
        canonical_name: CanonicalName,
        percent: u8,
        overall_percent: u8,
    },
    InstallCompleted {
        canonical_name: CanonicalName,
    },
    RemoveCompleted {
        canonical_name: CanonicalName,
    },
}

#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<ProgressEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Sends to whoever is listening; a send with no receivers is fine.
    pub fn emit(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(256)
    }
}
