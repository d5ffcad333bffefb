// Scan worker: pumps scanner output through the parser into staging and restarts crashed scanners

use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{select, Receiver, RecvTimeoutError, Sender};

use super::{ScanOutcome, ScanShared, ScanType};
use crate::constants::{SCANNER_CHANNEL_CAP, SCANNER_EXIT_POLL_MS};
use crate::error::{CollectionError, Result};
use crate::events::{CollectionEvent, Notifier, PlaylistImporter, ScanProgress};
use crate::parser::{ImageTags, ScanParser, ScanResultSink, TrackTags};
use crate::processor::{CommitSummary, ScanResultProcessor};
use crate::registry::Registry;
use crate::scanner::{spawn_reader, ExitKind, ProcessSlot, ScannerArgs, ScannerLauncher, ScannerOutput};

/// Work units between two progress notifications.
const PROGRESS_EVERY: u64 = 25;

pub(super) struct ScanJob {
    pub args: ScannerArgs,
    pub launcher: Arc<dyn ScannerLauncher>,
    pub registry: Arc<Registry>,
    pub notifier: Notifier,
    pub playlists: Option<Arc<dyn PlaylistImporter>>,
    pub shared: Arc<ScanShared>,
    pub slot: ProcessSlot,
    pub cancel: Receiver<()>,
    pub max_restarts: u32,
    pub restart_delay: Duration,
}

enum Pumped {
    Finished,
    Aborted,
}

/// Thread body: run the scan to completion, then commit or roll back.
pub(super) fn run(job: ScanJob, processor: ScanResultProcessor) {
    let scan_type = job.args.scan_type;
    job.notifier.emit(CollectionEvent::ScanStarted { scan_type });

    let mut sink = WorkerSink::new(processor, job.notifier.clone(), job.playlists.clone(), job.shared.clone());

    // A panic in the pipeline must still end the scan
    let pumped = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| pump(&job, &mut sink)))
        .unwrap_or_else(|_| Err(CollectionError::Scanner("Scan worker panicked".to_string())));

    let outcome = match pumped.and_then(|p| commit_if_finished(p, &mut sink)) {
        Ok(Some(summary)) => {
            publish_commit(&job.registry, &job.notifier, scan_type, &summary);
            ScanOutcome::Committed(summary)
        }
        Ok(None) => {
            roll_back(&mut sink);
            log::info!("{} scan aborted", scan_type.as_str());
            job.notifier.emit(CollectionEvent::ScanFailed {
                scan_type,
                message: "Scan aborted".to_string(),
            });
            ScanOutcome::Aborted
        }
        Err(e) => {
            roll_back(&mut sink);
            log::error!("{} scan failed: {}", scan_type.as_str(), e);
            job.notifier.emit(CollectionEvent::ScanFailed {
                scan_type,
                message: e.to_string(),
            });
            ScanOutcome::Failed(e.to_string())
        }
    };

    job.shared.finish(outcome);
}

fn commit_if_finished(pumped: Pumped, sink: &mut WorkerSink) -> Result<Option<CommitSummary>> {
    match pumped {
        Pumped::Finished => sink.processor.commit().map(Some),
        Pumped::Aborted => Ok(None),
    }
}

fn roll_back(sink: &mut WorkerSink) {
    if let Err(e) = sink.processor.rollback() {
        log::error!("Rollback failed: {}", e);
    }
}

/// Tell the rest of the application what a commit changed.
pub(super) fn publish_commit(registry: &Registry, notifier: &Notifier, scan_type: ScanType, summary: &CommitSummary) {
    if summary.changed {
        registry.invalidate();
    }
    for change in summary.url_changes.iter().filter(|c| c.is_move()) {
        notifier.emit(CollectionEvent::TrackMoved {
            old_path: change.old_path.clone(),
            new_path: change.new_path.clone(),
            unique_id: change.new_unique_id.clone(),
        });
    }
    if summary.changed {
        notifier.emit(CollectionEvent::CollectionUpdated);
    }
    notifier.emit(CollectionEvent::ScanFinished {
        scan_type,
        changed: summary.changed,
    });
}

/// Run scanner generations until one exits cleanly, then flush the parser.
fn pump(job: &ScanJob, sink: &mut WorkerSink) -> Result<Pumped> {
    let (tx, rx) = crossbeam_channel::bounded(SCANNER_CHANNEL_CAP);
    let mut readers = Vec::new();

    let result = stream_scanner(job, sink, &tx, &rx, &mut readers);

    // Error or abort with a scanner still attached
    let leftover = job.slot.lock().take();
    if let Some(mut process) = leftover {
        if let Err(e) = process.kill().and_then(|_| process.wait()) {
            log::warn!("Failed to stop scanner: {}", e);
        }
    }

    // Readers blocked on a full channel see the disconnect and exit
    drop(rx);
    drop(tx);
    for reader in readers {
        if reader.join().is_err() {
            log::warn!("Scanner reader thread panicked");
        }
    }
    result
}

fn stream_scanner(
    job: &ScanJob,
    sink: &mut WorkerSink,
    tx: &Sender<ScannerOutput>,
    rx: &Receiver<ScannerOutput>,
    readers: &mut Vec<JoinHandle<()>>,
) -> Result<Pumped> {
    let mut parser = ScanParser::new();
    let mut args = job.args.clone();
    let mut generation = 0u32;
    let mut crashes = 0u32;

    loop {
        if job.shared.aborting() {
            return Ok(Pumped::Aborted);
        }

        generation += 1;
        let mut process = job.launcher.launch(&args)?;
        let stdout = process.take_stdout();
        *job.slot.lock() = Some(process);
        let stdout = stdout.ok_or_else(|| CollectionError::Scanner("Scanner stdout unavailable".to_string()))?;
        readers.push(spawn_reader(generation, stdout, tx.clone())?);

        if !drain(generation, &mut parser, sink, rx, &job.cancel)? {
            return Ok(Pumped::Aborted);
        }

        let exit = match await_exit(job)? {
            Some(exit) => exit,
            None => return Ok(Pumped::Aborted),
        };

        match exit {
            ExitKind::Normal(0) => break,
            ExitKind::Normal(code) => {
                return Err(CollectionError::Scanner(format!("Scanner exited with status {}", code)));
            }
            ExitKind::Killed => return Ok(Pumped::Aborted),
            ExitKind::Crashed => {
                crashes += 1;
                job.shared.set_restarts(crashes);
                sink.restarts = crashes;
                if crashes >= job.max_restarts {
                    return Err(CollectionError::Scanner(format!(
                        "Scanner crashed {} times; scan aborted",
                        crashes
                    )));
                }

                log::warn!(
                    "Scanner crashed ({} of {} allowed); resuming in {:?}",
                    crashes,
                    job.max_restarts,
                    job.restart_delay
                );
                parser.reset_decoder();
                match job.cancel.recv_timeout(job.restart_delay) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return Ok(Pumped::Aborted),
                }
                args = job.args.resumed();
            }
        }
    }

    parser.finish(sink)?;
    log::info!("Scanner produced {} records over {} launches", parser.event_count(), generation);
    Ok(Pumped::Finished)
}

/// Wait for the attached scanner to end. It stays in the slot meanwhile so abort can kill it.
/// None if the scan was cancelled first.
fn await_exit(job: &ScanJob) -> Result<Option<ExitKind>> {
    loop {
        {
            let mut slot = job.slot.lock();
            let Some(process) = slot.as_mut() else {
                return Ok(Some(ExitKind::Killed));
            };
            if let Some(exit) = process.try_wait()? {
                slot.take();
                return Ok(Some(exit));
            }
        }
        match job.cancel.recv_timeout(Duration::from_millis(SCANNER_EXIT_POLL_MS)) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return Ok(None),
        }
    }
}

/// Feed one scanner generation to the parser until its EOF. False if the scan was cancelled.
fn drain(
    generation: u32,
    parser: &mut ScanParser,
    sink: &mut WorkerSink,
    rx: &Receiver<ScannerOutput>,
    cancel: &Receiver<()>,
) -> Result<bool> {
    loop {
        select! {
            recv(cancel) -> _ => return Ok(false),
            recv(rx) -> msg => match msg {
                Ok(ScannerOutput::Data { generation: g, bytes }) if g == generation => {
                    parser.feed(&bytes, sink)?;
                }
                Ok(ScannerOutput::Eof { generation: g }) if g == generation => return Ok(true),
                Ok(_) => log::debug!("Dropping output of a replaced scanner"),
                Err(_) => {
                    return Err(CollectionError::Scanner("Scanner output channel closed".to_string()));
                }
            },
        }
    }
}

// ----- Sink -----

/// Routes parser output into staging and reports progress.
pub(super) struct WorkerSink {
    pub(super) processor: ScanResultProcessor,
    notifier: Notifier,
    playlists: Option<Arc<dyn PlaylistImporter>>,
    shared: Arc<ScanShared>,
    scan_type: ScanType,
    total: u64,
    current: u64,
    restarts: u32,
}

impl WorkerSink {
    pub(super) fn new(
        processor: ScanResultProcessor,
        notifier: Notifier,
        playlists: Option<Arc<dyn PlaylistImporter>>,
        shared: Arc<ScanShared>,
    ) -> Self {
        Self {
            scan_type: processor.scan_type(),
            processor,
            notifier,
            playlists,
            shared,
            total: 0,
            current: 0,
            restarts: 0,
        }
    }

    fn report(&self) {
        self.shared.update_progress(self.current, self.total);
        let mut progress = ScanProgress::new(self.scan_type, self.current, self.total).with_restarts(self.restarts);
        if self.restarts > 0 {
            progress = progress.with_message(format!("Scanner restarts: {}", self.restarts));
        }
        self.notifier.emit(CollectionEvent::ScanProgress(progress));
    }
}

impl ScanResultSink for WorkerSink {
    fn item_count(&mut self, count: u64) {
        self.total = count;
        self.report();
    }

    fn add_directory(&mut self, path: &str, mtime: Option<i64>) -> Result<()> {
        if self.shared.aborting() {
            return Ok(());
        }
        self.processor.add_directory(path, mtime).map(|_| ())
    }

    fn process_directory(&mut self, tracks: Vec<TrackTags>) -> Result<()> {
        if self.shared.aborting() {
            return Ok(());
        }
        self.processor.process_directory(tracks)
    }

    fn add_images(&mut self, images: Vec<ImageTags>) -> Result<()> {
        if self.shared.aborting() {
            return Ok(());
        }
        self.processor.add_images(images)
    }

    fn playlist(&mut self, path: &str) -> Result<()> {
        match &self.playlists {
            Some(importer) => importer.import_playlist(Path::new(path)),
            None => log::debug!("No playlist importer; skipping {}", path),
        }
        Ok(())
    }

    fn progress(&mut self) {
        self.current += 1;
        if self.current % PROGRESS_EVERY == 0 || self.current == self.total {
            self.report();
        }
    }
}
