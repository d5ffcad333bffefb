// Scan progress payloads and collaborator notifications

use std::path::PathBuf;
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::RwLock;
use serde::Serialize;

use crate::scan::ScanType;

/// Progress payload published while a scan is running.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanProgress {
    pub scan_type: ScanType,
    pub current: u64,
    pub total: u64,
    pub percent: f64,
    pub message: String,
    pub restarts: u32,
}

impl ScanProgress {
    pub fn new(scan_type: ScanType, current: u64, total: u64) -> Self {
        let total_safe = total.max(1);
        let percent = (current as f64 / total_safe as f64) * 100.0;
        Self {
            scan_type,
            current,
            total,
            percent: percent.min(100.0),
            message: String::new(),
            restarts: 0,
        }
    }

    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = msg.into();
        self
    }

    pub fn with_restarts(mut self, restarts: u32) -> Self {
        self.restarts = restarts;
        self
    }
}

/// Signals delivered to the rest of the application.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum CollectionEvent {
    ScanStarted { scan_type: ScanType },
    ScanProgress(ScanProgress),
    ScanFinished { scan_type: ScanType, changed: bool },
    ScanFailed { scan_type: ScanType, message: String },
    /// Permanent tables changed; cached views must be refreshed
    CollectionUpdated,
    TrackMoved {
        old_path: PathBuf,
        new_path: PathBuf,
        unique_id: Option<String>,
    },
}

pub trait CollectionObserver: Send + Sync {
    fn on_event(&self, event: &CollectionEvent);
}

/// Forwards every event into a channel.
pub struct ChannelObserver {
    tx: Sender<CollectionEvent>,
}

impl ChannelObserver {
    pub fn new(tx: Sender<CollectionEvent>) -> Self {
        Self { tx }
    }
}

impl CollectionObserver for ChannelObserver {
    fn on_event(&self, event: &CollectionEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// Fan-out of events to every registered observer.
#[derive(Clone, Default)]
pub struct Notifier {
    observers: Arc<RwLock<Vec<Arc<dyn CollectionObserver>>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn CollectionObserver>) {
        self.observers.write().push(observer);
    }

    pub fn emit(&self, event: CollectionEvent) {
        log::debug!("Collection event: {:?}", event);
        for observer in self.observers.read().iter() {
            observer.on_event(&event);
        }
    }
}

/// Receives playlist files the scanner found inside collection folders.
pub trait PlaylistImporter: Send + Sync {
    fn import_playlist(&self, path: &std::path::Path);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_percent_is_clamped() {
        let p = ScanProgress::new(ScanType::Full, 12, 10);
        assert_eq!(p.percent, 100.0);

        let p = ScanProgress::new(ScanType::Incremental, 0, 0);
        assert_eq!(p.percent, 0.0);

        let p = ScanProgress::new(ScanType::Full, 5, 10).with_message("Scanning").with_restarts(2);
        assert_eq!(p.percent, 50.0);
        assert_eq!(p.message, "Scanning");
        assert_eq!(p.restarts, 2);
    }

    #[test]
    fn test_notifier_fans_out() {
        let (tx_a, rx_a) = crossbeam_channel::unbounded();
        let (tx_b, rx_b) = crossbeam_channel::unbounded();
        let notifier = Notifier::new();
        notifier.subscribe(Arc::new(ChannelObserver::new(tx_a)));
        notifier.subscribe(Arc::new(ChannelObserver::new(tx_b)));

        notifier.emit(CollectionEvent::CollectionUpdated);
        assert_eq!(rx_a.try_recv().unwrap(), CollectionEvent::CollectionUpdated);
        assert_eq!(rx_b.try_recv().unwrap(), CollectionEvent::CollectionUpdated);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(CollectionEvent::ScanFinished {
            scan_type: ScanType::Incremental,
            changed: true,
        })
        .unwrap();
        assert_eq!(json["event"], "scanFinished");
        assert_eq!(json["changed"], true);
    }
}
