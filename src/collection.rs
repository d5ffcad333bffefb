// Collection service object: owns the database handle, registry, scan manager and observers

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::config::{self, ScanConfig};
use crate::db::migrations::MigrationOutcome;
use crate::db::schema::{self, CollectionCounts, Statistics, TrackView};
use crate::db::Database;
use crate::error::{CollectionError, Result};
use crate::events::{CollectionObserver, Notifier, PlaylistImporter};
use crate::mount::{LocalMounts, MountPointResolver};
use crate::registry::Registry;
use crate::scan::timer::MaintenanceTimer;
use crate::scan::ScanManager;
use crate::scanner::{ProcessLauncher, ScannerLauncher};
use crate::tools;

pub struct Collection {
    db: Database,
    mounts: Arc<dyn MountPointResolver>,
    registry: Arc<Registry>,
    scans: Arc<ScanManager>,
    notifier: Notifier,
    migration: MigrationOutcome,
    timer: Mutex<Option<MaintenanceTimer>>,
}

impl Collection {
    /// Open (or create) the collection database at `db_path` with local paths and the real scanner.
    pub fn open(db_path: &Path) -> Result<Self> {
        Self::open_with_mounts(db_path, Arc::new(LocalMounts))
    }

    /// Open with the real scanner and the given mount points.
    pub fn open_with_mounts(db_path: &Path, mounts: Arc<dyn MountPointResolver>) -> Result<Self> {
        Self::open_with(Database::open(db_path)?, mounts, None)
    }

    /// Open over an existing handle. `launcher` defaults to the configured scanner binary.
    pub fn open_with(
        db: Database,
        mounts: Arc<dyn MountPointResolver>,
        launcher: Option<Arc<dyn ScannerLauncher>>,
    ) -> Result<Self> {
        let migration = db.migrate()?;
        let config = config::load(&db.lock())?;

        let launcher = launcher.unwrap_or_else(|| {
            let path = tools::scanner_path(config.scanner_path.as_deref());
            Arc::new(ProcessLauncher::new(path)) as Arc<dyn ScannerLauncher>
        });

        let notifier = Notifier::new();
        let registry = Arc::new(Registry::new(db.clone(), mounts.clone()));
        let scans = Arc::new(ScanManager::new(
            db.clone(),
            mounts.clone(),
            registry.clone(),
            launcher,
            notifier.clone(),
            config,
        ));

        let collection = Self {
            db,
            mounts,
            registry,
            scans,
            notifier,
            migration,
            timer: Mutex::new(None),
        };
        collection.after_open()?;
        Ok(collection)
    }

    /// A schema change that alters track identity needs a full rescan; otherwise
    /// pick up whatever an interrupted run left behind.
    fn after_open(&self) -> Result<()> {
        if self.migration.rescan_required {
            log::warn!("Schema upgrade requires a full rescan");
            let request = self.scans.start_full()?;
            log::info!("Full rescan after upgrade: {:?}", request);
            return Ok(());
        }

        match self.scans.resume_pending_batch() {
            Ok(Some(summary)) => log::info!("Imported leftover scan batch: {} tracks", summary.tracks),
            Ok(None) => {}
            Err(CollectionError::Busy(reason)) => log::info!("Leftover scan batch kept: {}", reason),
            Err(e) => log::error!("Leftover scan batch could not be imported: {}", e),
        }
        Ok(())
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn scans(&self) -> &Arc<ScanManager> {
        &self.scans
    }

    pub fn migration(&self) -> &MigrationOutcome {
        &self.migration
    }

    pub fn subscribe(&self, observer: Arc<dyn CollectionObserver>) {
        self.notifier.subscribe(observer);
    }

    pub fn set_playlist_importer(&self, importer: Arc<dyn PlaylistImporter>) {
        self.scans.set_playlist_importer(importer);
    }

    // ----- Configuration -----

    pub fn config(&self) -> ScanConfig {
        self.scans.config()
    }

    /// Persist a new configuration. Scans started from now on use it.
    pub fn update_config(&self, config: ScanConfig) -> Result<()> {
        config::save(&self.db.lock(), &config)?;
        self.scans.set_config(config);
        Ok(())
    }

    pub fn scanner_version(&self) -> Option<String> {
        let path = tools::scanner_path(self.config().scanner_path.as_deref());
        tools::scanner_version(&path)
    }

    pub fn counts(&self) -> Result<CollectionCounts> {
        schema::collection_counts(&self.db.lock())
    }

    // ----- Tracks -----

    /// The track stored for the file at `path`, with its play statistics.
    pub fn track_at(&self, path: &Path) -> Result<Option<(TrackView, Option<Statistics>)>> {
        let device_id = self.mounts.device_id(path);
        let rpath = self.mounts.relative_path(device_id, path);
        let conn = self.db.lock();
        let Some(track) = schema::get_track_by_path(&conn, device_id, &rpath)? else {
            return Ok(None);
        };
        let stats = schema::get_statistics(&conn, track.url_id)?;
        Ok(Some((track, stats)))
    }

    /// Where the track with this scanner unique id lives now.
    pub fn locate_unique_id(&self, unique_id: &str) -> Result<Option<PathBuf>> {
        let url = schema::find_url_by_uid(&self.db.lock(), unique_id)?;
        Ok(url.map(|url| self.mounts.absolute_path(url.device_id, &url.rpath)))
    }

    /// Count one play of the file at `path`. False if the file is not in the collection.
    pub fn record_play(&self, path: &Path, played_at: i64) -> Result<bool> {
        let conn = self.db.lock();
        let Some(url_id) = self.url_id(&conn, path)? else {
            return Ok(false);
        };
        schema::record_play(&conn, url_id, played_at)?;
        Ok(true)
    }

    /// Rate the file at `path` from 0 to 10. False if the file is not in the collection.
    pub fn set_rating(&self, path: &Path, rating: i64) -> Result<bool> {
        if !(0..=10).contains(&rating) {
            return Err(CollectionError::Config(format!("Rating {} is outside 0-10", rating)));
        }
        let conn = self.db.lock();
        let Some(url_id) = self.url_id(&conn, path)? else {
            return Ok(false);
        };
        schema::set_rating(&conn, url_id, rating)?;
        Ok(true)
    }

    fn url_id(&self, conn: &Connection, path: &Path) -> Result<Option<i64>> {
        let device_id = self.mounts.device_id(path);
        let rpath = self.mounts.relative_path(device_id, path);
        Ok(schema::find_url_by_path(conn, device_id, &rpath)?.map(|url| url.id))
    }

    // ----- Maintenance -----

    /// Start the auto-scan and registry GC timers. Restarts them if already running.
    pub fn start_maintenance(&self) -> Result<()> {
        let config = self.config();
        let mut timer = self.timer.lock();
        timer.take();
        *timer = Some(MaintenanceTimer::spawn(
            self.scans.clone(),
            self.registry.clone(),
            config.auto_scan_interval(),
            config.registry_gc_interval(),
        )?);
        log::info!(
            "Maintenance started (auto-scan every {:?}, registry GC every {:?})",
            config.auto_scan_interval(),
            config.registry_gc_interval()
        );
        Ok(())
    }

    pub fn stop_maintenance(&self) {
        if let Some(mut timer) = self.timer.lock().take() {
            timer.stop();
        }
    }
}

impl Drop for Collection {
    fn drop(&mut self) {
        self.stop_maintenance();
        self.scans.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::MountTable;
    use crate::scan::{ScanRequest, ScanType};
    use crate::scanner::{ExitKind, ScannerArgs, ScannerProcess};
    use std::io::Read;

    /// Launcher whose scanner prints nothing and exits cleanly.
    struct SilentLauncher;

    struct SilentProcess;

    impl ScannerProcess for SilentProcess {
        fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
            Some(Box::new(std::io::empty()))
        }
        fn kill(&mut self) -> Result<()> {
            Ok(())
        }
        fn wait(&mut self) -> Result<ExitKind> {
            Ok(ExitKind::Normal(0))
        }
        fn try_wait(&mut self) -> Result<Option<ExitKind>> {
            Ok(Some(ExitKind::Normal(0)))
        }
    }

    impl ScannerLauncher for SilentLauncher {
        fn launch(&self, _args: &ScannerArgs) -> Result<Box<dyn ScannerProcess>> {
            Ok(Box::new(SilentProcess))
        }
    }

    fn open_memory() -> Collection {
        let db = Database::open_in_memory().unwrap();
        Collection::open_with(db, Arc::new(LocalMounts), Some(Arc::new(SilentLauncher))).unwrap()
    }

    #[test]
    fn test_open_creates_schema() {
        let collection = open_memory();
        assert!(collection.migration().created);
        assert!(!collection.migration().rescan_required);
        assert_eq!(collection.counts().unwrap().tracks, 0);
    }

    #[test]
    fn test_config_round_trip_reaches_scan_manager() {
        let collection = open_memory();
        let mut config = collection.config();
        config.collection_folders = vec![std::env::temp_dir()];
        config.monitor_changes = true;
        collection.update_config(config.clone()).unwrap();

        assert_eq!(collection.scans().config(), config);
        assert_eq!(config::load(&collection.db().lock()).unwrap(), config);
    }

    #[test]
    fn test_full_scan_without_folders_does_nothing() {
        let collection = open_memory();
        assert_eq!(collection.scans().start_full().unwrap(), ScanRequest::NothingToDo);
    }

    fn import_one_track(collection: &Collection, dir: &Path, file: &Path) {
        let batch = dir.join("batch.txt");
        let lines = [
            format!(r#"{{"type":"folder","path":"{}","mtime":7}}"#, dir.display()),
            format!(
                r#"{{"type":"tags","path":"{}","artist":"A","album":"X","title":"T","uniqueid":"u1"}}"#,
                file.display()
            ),
        ];
        std::fs::write(&batch, lines.join("\n") + "\n").unwrap();
        collection.scans().import_batch(&batch, ScanType::Full).unwrap();
    }

    #[test]
    fn test_track_lookup_and_statistics_through_mounts() {
        let volume = tempfile::TempDir::new().unwrap();
        let mounts = MountTable::new().with_mount(4, volume.path());
        let db = Database::open_in_memory().unwrap();
        let collection = Collection::open_with(db, Arc::new(mounts), Some(Arc::new(SilentLauncher))).unwrap();

        let file = volume.path().join("01.mp3");
        import_one_track(&collection, volume.path(), &file);

        let (track, stats) = collection.track_at(&file).unwrap().unwrap();
        assert_eq!(track.rpath, "./01.mp3");
        assert_eq!(track.title.as_deref(), Some("T"));
        assert!(stats.is_none());
        assert_eq!(collection.locate_unique_id("u1").unwrap(), Some(file.clone()));
        assert_eq!(collection.locate_unique_id("missing").unwrap(), None);

        assert!(collection.record_play(&file, 100).unwrap());
        assert!(collection.record_play(&file, 200).unwrap());
        assert!(collection.set_rating(&file, 8).unwrap());
        let (_, stats) = collection.track_at(&file).unwrap().unwrap();
        let stats = stats.unwrap();
        assert_eq!(stats.playcount, 2);
        assert_eq!(stats.first_played, Some(100));
        assert_eq!(stats.last_played, Some(200));
        assert_eq!(stats.rating, 8);
    }

    #[test]
    fn test_statistics_for_unknown_file_are_not_recorded() {
        let collection = open_memory();
        let file = Path::new("/nowhere/01.mp3");
        assert!(collection.track_at(file).unwrap().is_none());
        assert!(!collection.record_play(file, 1).unwrap());
        assert!(!collection.set_rating(file, 5).unwrap());
        assert!(matches!(collection.set_rating(file, 11), Err(CollectionError::Config(_))));
    }

    #[test]
    fn test_maintenance_starts_and_stops() {
        let collection = open_memory();
        collection.start_maintenance().unwrap();
        collection.start_maintenance().unwrap();
        collection.stop_maintenance();
    }
}
