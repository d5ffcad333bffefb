// Periodic maintenance: auto-scan when monitoring is enabled, registry garbage collection

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{select, tick, Sender};

use super::{ScanManager, ScanRequest};
use crate::error::Result;
use crate::registry::{GcOutcome, Registry};

/// Background thread driving the auto-scan and registry GC ticks. Stops on drop.
pub struct MaintenanceTimer {
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MaintenanceTimer {
    pub fn spawn(
        manager: Arc<ScanManager>,
        registry: Arc<Registry>,
        scan_interval: Duration,
        gc_interval: Duration,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);
        let scan_tick = tick(scan_interval);
        let gc_tick = tick(gc_interval);

        let thread = std::thread::Builder::new()
            .name("collection-timer".into())
            .spawn(move || {
                let mut running = true;
                while running {
                    select! {
                        recv(shutdown_rx) -> _ => running = false,
                        recv(scan_tick) -> _ => auto_scan(&manager),
                        recv(gc_tick) -> _ => {
                            if let GcOutcome::Skipped(reason) = registry.collect_garbage(manager.is_running()) {
                                log::debug!("Registry GC skipped: {:?}", reason);
                            }
                        }
                    }
                }
            })?;

        Ok(Self {
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        // Dropping the sender wakes the thread
        self.shutdown.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Maintenance timer thread panicked");
            }
        }
    }
}

impl Drop for MaintenanceTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn auto_scan(manager: &ScanManager) {
    if !manager.config().monitor_changes {
        return;
    }
    match manager.start_incremental(None) {
        Ok(ScanRequest::Started) => log::info!("Auto-scan started"),
        Ok(other) => log::debug!("Auto-scan: {:?}", other),
        Err(e) => log::error!("Auto-scan failed to start: {}", e),
    }
}
