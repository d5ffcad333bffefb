// Scan orchestration: one scan in flight, full or incremental, with crash recovery
//
// The control side (this module) decides what to scan and owns start/abort. The
// scanner's output is consumed on a dedicated "scan-worker" thread (see worker.rs).

pub mod dirs;
pub mod timer;
mod worker;

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::config::{self, ScanConfig};
use crate::constants::SCANNER_READ_CHUNK;
use crate::db::Database;
use crate::error::{CollectionError, Result};
use crate::events::{CollectionEvent, Notifier, PlaylistImporter};
use crate::mount::MountPointResolver;
use crate::parser::ScanParser;
use crate::processor::{CommitSummary, ScanResultProcessor};
use crate::registry::Registry;
use crate::scanner::checkpoint;
use crate::scanner::{ProcessSlot, ScannerArgs, ScannerLauncher};

use worker::{ScanJob, WorkerSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanType {
    Full,
    Incremental,
}

impl ScanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanType::Full => "full",
            ScanType::Incremental => "incremental",
        }
    }
}

/// Answer to a start request. Only `Started` means a scan is now running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ScanRequest {
    Started,
    AlreadyRunning,
    Blocked,
    /// Nothing changed on disk (or no folders configured)
    NothingToDo,
    NotInCollection,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ScanStatus {
    Idle,
    #[serde(rename_all = "camelCase")]
    Running {
        scan_type: ScanType,
        restarts: u32,
        current: u64,
        total: u64,
    },
}

/// How the most recent scan ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    Committed(CommitSummary),
    Aborted,
    Failed(String),
}

/// State shared between the control side and the scan worker.
#[derive(Debug)]
pub(crate) struct ScanShared {
    status: Mutex<ScanStatus>,
    last_outcome: Mutex<Option<ScanOutcome>>,
    abort: AtomicBool,
}

impl ScanShared {
    fn new() -> Self {
        Self {
            status: Mutex::new(ScanStatus::Idle),
            last_outcome: Mutex::new(None),
            abort: AtomicBool::new(false),
        }
    }

    fn aborting(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    fn update_progress(&self, current: u64, total: u64) {
        if let ScanStatus::Running { current: c, total: t, .. } = &mut *self.status.lock() {
            *c = current;
            *t = total;
        }
    }

    fn set_restarts(&self, count: u32) {
        if let ScanStatus::Running { restarts, .. } = &mut *self.status.lock() {
            *restarts = count;
        }
    }

    fn finish(&self, outcome: ScanOutcome) {
        *self.last_outcome.lock() = Some(outcome);
        *self.status.lock() = ScanStatus::Idle;
    }
}

/// The scan worker currently (or last) attached to the manager.
struct WorkerHandle {
    thread: JoinHandle<()>,
    cancel: Sender<()>,
    slot: ProcessSlot,
}

pub struct ScanManager {
    db: Database,
    mounts: Arc<dyn MountPointResolver>,
    registry: Arc<Registry>,
    launcher: Arc<dyn ScannerLauncher>,
    notifier: Notifier,
    playlists: RwLock<Option<Arc<dyn PlaylistImporter>>>,
    config: RwLock<ScanConfig>,
    blocked: AtomicBool,
    shared: Arc<ScanShared>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl ScanManager {
    pub fn new(
        db: Database,
        mounts: Arc<dyn MountPointResolver>,
        registry: Arc<Registry>,
        launcher: Arc<dyn ScannerLauncher>,
        notifier: Notifier,
        config: ScanConfig,
    ) -> Self {
        Self {
            db,
            mounts,
            registry,
            launcher,
            notifier,
            playlists: RwLock::new(None),
            config: RwLock::new(config),
            blocked: AtomicBool::new(false),
            shared: Arc::new(ScanShared::new()),
            worker: Mutex::new(None),
        }
    }

    pub fn set_playlist_importer(&self, importer: Arc<dyn PlaylistImporter>) {
        *self.playlists.write() = Some(importer);
    }

    pub fn config(&self) -> ScanConfig {
        self.config.read().clone()
    }

    /// Takes effect from the next scan on.
    pub fn set_config(&self, config: ScanConfig) {
        *self.config.write() = config;
    }

    // ----- Status -----

    pub fn is_running(&self) -> bool {
        *self.shared.status.lock() != ScanStatus::Idle
    }

    pub fn status(&self) -> ScanStatus {
        self.shared.status.lock().clone()
    }

    pub fn last_outcome(&self) -> Option<ScanOutcome> {
        self.shared.last_outcome.lock().clone()
    }

    /// Block (or unblock) new scans, e.g. while files are being moved around.
    pub fn set_block_scan(&self, blocked: bool) {
        log::info!("Scanning {}", if blocked { "blocked" } else { "unblocked" });
        self.blocked.store(blocked, Ordering::SeqCst);
    }

    // ----- Start -----

    /// Rescan every collection folder and replace the collection's content.
    pub fn start_full(&self) -> Result<ScanRequest> {
        let mut worker = self.worker.lock();
        if let Some(refused) = self.refuse_start() {
            return Ok(refused);
        }
        reap(&mut worker);

        let config = self.config();
        if config.collection_folders.is_empty() {
            log::info!("No collection folders configured; nothing to scan");
            return Ok(ScanRequest::NothingToDo);
        }

        let args = self.scanner_args(&config, ScanType::Full, None, config.collection_folders.clone())?;
        let processor = ScanResultProcessor::new(self.db.clone(), self.mounts.clone(), ScanType::Full);
        *worker = Some(self.spawn(args, processor, &config)?);
        Ok(ScanRequest::Started)
    }

    /// Rescan what changed on disk, or only `directory` when given.
    pub fn start_incremental(&self, directory: Option<&Path>) -> Result<ScanRequest> {
        let mut worker = self.worker.lock();
        if let Some(refused) = self.refuse_start() {
            return Ok(refused);
        }
        reap(&mut worker);

        let config = self.config();
        let plan = {
            let conn = self.db.lock();
            match directory {
                Some(dir) => match dirs::plan_single(&conn, self.mounts.as_ref(), dir)? {
                    Some(plan) => plan,
                    None => {
                        log::info!("{} is not a collection directory", dir.display());
                        return Ok(ScanRequest::NotInCollection);
                    }
                },
                None => dirs::plan_incremental(&conn, self.mounts.as_ref())?,
            }
        };

        if plan.is_empty() {
            log::debug!("Incremental scan skipped: no directory changed");
            return Ok(ScanRequest::NothingToDo);
        }

        let mtime_file = checkpoint::mtime_file_path(&config.save_location());
        checkpoint::write_mtime_file(&mtime_file, &plan.known_good)?;

        let args = self.scanner_args(&config, ScanType::Incremental, Some(mtime_file), plan.scan_dirs)?;
        let processor = ScanResultProcessor::new(self.db.clone(), self.mounts.clone(), ScanType::Incremental)
            .with_removed_directories(plan.removed_directories);
        *worker = Some(self.spawn(args, processor, &config)?);
        Ok(ScanRequest::Started)
    }

    fn refuse_start(&self) -> Option<ScanRequest> {
        if self.is_running() {
            log::debug!("Scan request ignored: a scan is already running");
            return Some(ScanRequest::AlreadyRunning);
        }
        if self.blocked.load(Ordering::SeqCst) {
            log::info!("Scan request ignored: scanning is blocked");
            return Some(ScanRequest::Blocked);
        }
        None
    }

    fn scanner_args(
        &self,
        config: &ScanConfig,
        scan_type: ScanType,
        mtime_file: Option<PathBuf>,
        folders: Vec<PathBuf>,
    ) -> Result<ScannerArgs> {
        let collection_id = config::collection_id(&self.db.lock())?;
        Ok(ScannerArgs {
            scan_type,
            recursive: config.scan_recursively,
            charset_detection: config.use_charset_detection,
            resume: false,
            save_location: config.save_location(),
            collection_id,
            pid: std::process::id(),
            mtime_file,
            folders,
        })
    }

    /// Start the worker thread. The caller holds the `worker` lock.
    fn spawn(&self, args: ScannerArgs, processor: ScanResultProcessor, config: &ScanConfig) -> Result<WorkerHandle> {
        let scan_type = args.scan_type;
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded(1);
        let slot: ProcessSlot = Arc::new(Mutex::new(None));

        self.shared.abort.store(false, Ordering::SeqCst);
        *self.shared.status.lock() = ScanStatus::Running {
            scan_type,
            restarts: 0,
            current: 0,
            total: 0,
        };

        let job = ScanJob {
            args,
            launcher: self.launcher.clone(),
            registry: self.registry.clone(),
            notifier: self.notifier.clone(),
            playlists: self.playlists.read().clone(),
            shared: self.shared.clone(),
            slot: slot.clone(),
            cancel: cancel_rx,
            max_restarts: config.max_restarts,
            restart_delay: config.restart_delay(),
        };

        let shared = self.shared.clone();
        let spawned = std::thread::Builder::new()
            .name("scan-worker".into())
            .spawn(move || worker::run(job, processor));

        match spawned {
            Ok(thread) => {
                log::info!("{} scan started", scan_type.as_str());
                Ok(WorkerHandle {
                    thread,
                    cancel: cancel_tx,
                    slot,
                })
            }
            Err(e) => {
                shared.finish(ScanOutcome::Failed(e.to_string()));
                Err(e.into())
            }
        }
    }

    // ----- Stop -----

    /// Stop the running scan, discard its results and wait for the worker to exit.
    /// Returns false if no scan was running.
    pub fn abort(&self) -> bool {
        let Some(handle) = self.worker.lock().take() else {
            return false;
        };
        let was_running = self.is_running();
        if was_running {
            log::info!("Aborting scan");
            self.shared.abort.store(true, Ordering::SeqCst);
            let _ = handle.cancel.try_send(());
            if let Some(process) = handle.slot.lock().as_mut() {
                if let Err(e) = process.kill() {
                    log::warn!("Failed to kill scanner: {}", e);
                }
            }
        }

        if handle.thread.join().is_err() {
            log::error!("Scan worker panicked");
        }
        self.shared.abort.store(false, Ordering::SeqCst);
        was_running
    }

    /// Block until the current scan (if any) has ended. Returns how it ended.
    pub fn wait(&self) -> Option<ScanOutcome> {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread.join().is_err() {
                log::error!("Scan worker panicked");
            }
        }
        self.last_outcome()
    }

    // ----- Batch files -----

    /// Feed a batch of scanner output from a file through the pipeline and commit it.
    ///
    /// Runs on the calling thread. An incremental batch only adds and updates;
    /// it cannot know which directories the interrupted scan meant to remove.
    /// Refused with `Busy` while a scan runs or scanning is blocked.
    pub fn import_batch(&self, path: &Path, scan_type: ScanType) -> Result<CommitSummary> {
        let _worker = self.worker.lock();
        match self.refuse_start() {
            Some(ScanRequest::Blocked) => return Err(CollectionError::Busy("scanning is blocked".to_string())),
            Some(_) => return Err(CollectionError::Busy("a scan is already running".to_string())),
            None => {}
        }
        *self.shared.status.lock() = ScanStatus::Running {
            scan_type,
            restarts: 0,
            current: 0,
            total: 0,
        };
        self.notifier.emit(CollectionEvent::ScanStarted { scan_type });
        log::info!("Importing {} batch {}", scan_type.as_str(), path.display());

        let processor = ScanResultProcessor::new(self.db.clone(), self.mounts.clone(), scan_type);
        let mut sink = WorkerSink::new(
            processor,
            self.notifier.clone(),
            self.playlists.read().clone(),
            self.shared.clone(),
        );

        let result = feed_file(path, &mut sink).and_then(|_| sink.processor.commit());
        match result {
            Ok(summary) => {
                worker::publish_commit(&self.registry, &self.notifier, scan_type, &summary);
                self.shared.finish(ScanOutcome::Committed(summary.clone()));
                Ok(summary)
            }
            Err(e) => {
                if let Err(rollback_err) = sink.processor.rollback() {
                    log::error!("Rollback failed: {}", rollback_err);
                }
                log::error!("Batch import failed: {}", e);
                self.notifier.emit(CollectionEvent::ScanFailed {
                    scan_type,
                    message: e.to_string(),
                });
                self.shared.finish(ScanOutcome::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Consume a batch file an earlier run left in the save location, if any.
    /// The file stays in place when scanning is busy or blocked.
    pub fn resume_pending_batch(&self) -> Result<Option<CommitSummary>> {
        let save_location = self.config().save_location();
        let Some((scan_type, path)) = checkpoint::pending_batch(&save_location) else {
            return Ok(None);
        };

        match self.import_batch(&path, scan_type) {
            Err(CollectionError::Busy(reason)) => {
                log::info!("Leaving {} for later: {}", path.display(), reason);
                Err(CollectionError::Busy(reason))
            }
            result => {
                // A batch that cannot be imported would fail the same way next time
                checkpoint::remove_if_exists(&path)?;
                result.map(Some)
            }
        }
    }
}

impl Drop for ScanManager {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Join a worker that already finished.
fn reap(worker: &mut Option<WorkerHandle>) {
    if let Some(old) = worker.take() {
        if old.thread.join().is_err() {
            log::error!("Scan worker panicked");
        }
    }
}

/// Stream a file through a fresh parser in read-sized chunks.
fn feed_file(path: &Path, sink: &mut WorkerSink) -> Result<()> {
    let mut file = File::open(path)?;
    let mut parser = ScanParser::new();
    let mut buf = vec![0u8; SCANNER_READ_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        parser.feed(&buf[..n], sink)?;
    }
    parser.finish(sink)
}
