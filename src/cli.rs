// collectiondb CLI binary

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use collectiondb::db;
use collectiondb::events::CollectionObserver;
use collectiondb::mount::{LocalMounts, MountPointResolver, MountTable};
use collectiondb::{Collection, CollectionEvent, ScanOutcome, ScanRequest, ScanStatus, ScanType};

#[derive(Parser)]
#[command(name = "collectiondb")]
#[command(about = "collectiondb - Scan media folders into a collection database", long_about = None)]
#[command(version)]
struct Cli {
    /// Collection database (defaults to the platform data directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Mounted volume as DEVICE_ID=PATH; repeat for several volumes
    #[arg(long = "mount", global = true, value_parser = parse_mount)]
    mounts: Vec<(i64, PathBuf)>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and register collection folders
    Init {
        /// Folders to add to the collection
        folders: Vec<PathBuf>,
    },

    /// Scan the collection folders
    Scan {
        /// Rescan everything instead of only what changed
        #[arg(long)]
        full: bool,
        /// Rescan a single known directory
        #[arg(long, conflicts_with = "full")]
        dir: Option<PathBuf>,
    },

    /// Import a scanner batch file
    Import {
        file: PathBuf,
        /// Treat the batch as an incremental scan
        #[arg(long)]
        incremental: bool,
    },

    /// Show collection counts and scanner information
    Status,

    /// Show a track and its play statistics
    Track {
        /// Audio file in the collection
        #[arg(required_unless_present = "uid")]
        file: Option<PathBuf>,
        /// Find the track by scanner unique id instead
        #[arg(long, conflicts_with = "file")]
        uid: Option<String>,
        /// Count one play now
        #[arg(long)]
        played: bool,
        /// Set the rating (0-10)
        #[arg(long, value_parser = clap::value_parser!(i64).range(0..=10))]
        rate: Option<i64>,
    },

    /// Show or change the scan configuration
    Config {
        #[arg(long)]
        add_folder: Vec<PathBuf>,
        #[arg(long)]
        remove_folder: Vec<PathBuf>,
        /// Enable or disable the auto-scan timer
        #[arg(long)]
        monitor: Option<bool>,
        #[arg(long)]
        recursive: Option<bool>,
        #[arg(long)]
        charset_detection: Option<bool>,
        #[arg(long)]
        scanner: Option<PathBuf>,
        #[arg(long)]
        max_restarts: Option<u32>,
    },

    /// Keep running: auto-scan on changes and collect registry garbage
    Watch,

    /// Upgrade the database schema
    Migrate,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("collectiondb=info")).init();

    let cli = Cli::parse();
    let target = Target {
        db_path: cli.db.unwrap_or_else(db::default_db_path),
        mounts: cli.mounts,
    };

    match cli.command {
        Commands::Init { folders } => cmd_init(target, folders),
        Commands::Scan { full, dir } => cmd_scan(target, full, dir),
        Commands::Import { file, incremental } => cmd_import(target, file, incremental),
        Commands::Status => cmd_status(target),
        Commands::Track { file, uid, played, rate } => cmd_track(target, file, uid, played, rate),
        Commands::Config {
            add_folder,
            remove_folder,
            monitor,
            recursive,
            charset_detection,
            scanner,
            max_restarts,
        } => cmd_config(
            target,
            ConfigChanges {
                add_folder,
                remove_folder,
                monitor,
                recursive,
                charset_detection,
                scanner,
                max_restarts,
            },
        ),
        Commands::Watch => cmd_watch(target),
        Commands::Migrate => cmd_migrate(target),
    }
}

/// The database to open and the volumes mounted next to the root filesystem.
struct Target {
    db_path: PathBuf,
    mounts: Vec<(i64, PathBuf)>,
}

impl Target {
    fn open(&self) -> Result<Collection> {
        let mounts: Arc<dyn MountPointResolver> = if self.mounts.is_empty() {
            Arc::new(LocalMounts)
        } else {
            let table = self
                .mounts
                .iter()
                .fold(MountTable::new(), |table, (id, path)| table.with_mount(*id, path.clone()));
            Arc::new(table)
        };
        Ok(Collection::open_with_mounts(&self.db_path, mounts)?)
    }
}

fn parse_mount(arg: &str) -> std::result::Result<(i64, PathBuf), String> {
    let (id, path) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected DEVICE_ID=PATH, got '{}'", arg))?;
    let id: i64 = id.trim().parse().map_err(|_| format!("invalid device id '{}'", id))?;
    if id < 0 {
        return Err("device ids below 0 are reserved for the local filesystem".to_string());
    }
    Ok((id, PathBuf::from(path)))
}

/// Prints scan events as they arrive.
struct ConsoleObserver;

impl CollectionObserver for ConsoleObserver {
    fn on_event(&self, event: &CollectionEvent) {
        match event {
            CollectionEvent::ScanStarted { scan_type } => println!("{} scan started", scan_type.as_str()),
            CollectionEvent::ScanProgress(p) => {
                let restarts = if p.restarts > 0 { format!(" ({} restarts)", p.restarts) } else { String::new() };
                println!("  {}/{} ({:.0}%){}", p.current, p.total, p.percent, restarts);
            }
            CollectionEvent::TrackMoved { old_path, new_path, .. } => {
                println!("  moved {} -> {}", old_path.display(), new_path.display());
            }
            CollectionEvent::ScanFinished { scan_type, changed } => {
                println!("{} scan finished{}", scan_type.as_str(), if *changed { "" } else { " (no changes)" });
            }
            CollectionEvent::ScanFailed { scan_type, message } => {
                println!("{} scan failed: {}", scan_type.as_str(), message);
            }
            CollectionEvent::CollectionUpdated => {}
        }
    }
}

fn cmd_init(target: Target, folders: Vec<PathBuf>) -> Result<()> {
    let collection = target.open()?;

    let mut config = collection.config();
    for folder in folders {
        let folder = folder
            .canonicalize()
            .map_err(|_| anyhow::anyhow!("Folder does not exist: {}", folder.display()))?;
        if !config.collection_folders.contains(&folder) {
            config.collection_folders.push(folder);
        }
    }
    collection.update_config(config.clone())?;

    println!("Initialized collection at {}", target.db_path.display());
    println!("Folders:");
    for folder in &config.collection_folders {
        println!("  {}", folder.display());
    }
    if config.collection_folders.is_empty() {
        println!("  (none) Use 'collectiondb config --add-folder <dir>' to add one.");
    }

    Ok(())
}

fn cmd_scan(target: Target, full: bool, dir: Option<PathBuf>) -> Result<()> {
    let collection = target.open()?;
    collection.subscribe(Arc::new(ConsoleObserver));

    // Opening may already have started a rescan after a schema upgrade
    if collection.scans().is_running() {
        println!("A scan started automatically; waiting for it first");
        collection.scans().wait();
    }

    let request = if full {
        collection.scans().start_full()?
    } else {
        collection.scans().start_incremental(dir.as_deref())?
    };

    match request {
        ScanRequest::Started => {}
        ScanRequest::NothingToDo => {
            println!("Nothing to scan.");
            return Ok(());
        }
        ScanRequest::NotInCollection => {
            anyhow::bail!("Not a collection directory: {}", dir.unwrap_or_default().display());
        }
        other => anyhow::bail!("Scan not started: {:?}", other),
    }

    report_outcome(collection.scans().wait())
}

fn cmd_import(target: Target, file: PathBuf, incremental: bool) -> Result<()> {
    let collection = target.open()?;
    collection.subscribe(Arc::new(ConsoleObserver));

    let scan_type = if incremental { ScanType::Incremental } else { ScanType::Full };
    let summary = collection.scans().import_batch(&file, scan_type)?;
    println!("Imported {} tracks in {} directories", summary.tracks, summary.directories);
    Ok(())
}

fn report_outcome(outcome: Option<ScanOutcome>) -> Result<()> {
    match outcome {
        Some(ScanOutcome::Committed(summary)) => {
            println!();
            println!("Scan complete:");
            println!("  Directories:  {}", summary.directories);
            println!("  Tracks:       {}", summary.tracks);
            println!("  Moved:        {}", summary.url_changes.iter().filter(|c| c.is_move()).count());
            println!("  Conflicts:    {}", summary.conflicts);
            Ok(())
        }
        Some(ScanOutcome::Aborted) => anyhow::bail!("Scan aborted"),
        Some(ScanOutcome::Failed(message)) => anyhow::bail!("Scan failed: {}", message),
        None => Ok(()),
    }
}

fn cmd_track(target: Target, file: Option<PathBuf>, uid: Option<String>, played: bool, rate: Option<i64>) -> Result<()> {
    let collection = target.open()?;

    let path = match (file, uid) {
        (Some(file), _) => file
            .canonicalize()
            .map_err(|_| anyhow::anyhow!("File does not exist: {}", file.display()))?,
        (None, Some(uid)) => collection
            .locate_unique_id(&uid)?
            .ok_or_else(|| anyhow::anyhow!("No track with unique id {}", uid))?,
        (None, None) => anyhow::bail!("Give a file or --uid"),
    };

    if played && !collection.record_play(&path, chrono::Utc::now().timestamp())? {
        anyhow::bail!("Not in the collection: {}", path.display());
    }
    if let Some(rating) = rate {
        if !collection.set_rating(&path, rating)? {
            anyhow::bail!("Not in the collection: {}", path.display());
        }
    }

    let Some((track, stats)) = collection.track_at(&path)? else {
        anyhow::bail!("Not in the collection: {}", path.display());
    };
    println!("{}", path.display());
    println!("  Title:        {}", track.title.as_deref().unwrap_or("-"));
    println!("  Artist:       {}", track.artist.as_deref().unwrap_or("-"));
    println!("  Album:        {}", track.album.as_deref().unwrap_or("-"));
    println!("  Album artist: {}", track.album_artist.as_deref().unwrap_or("(compilation)"));
    println!("  Genre:        {}", track.genre.as_deref().unwrap_or("-"));
    println!("  Year:         {}", track.year.as_deref().unwrap_or("-"));
    if let Some(uid) = &track.unique_id {
        println!("  Unique id:    {}", uid);
    }
    match stats {
        Some(stats) => {
            println!("  Plays:        {}", stats.playcount);
            println!("  Rating:       {}", stats.rating);
            if let Some(last) = stats.last_played.and_then(|t| chrono::DateTime::from_timestamp(t, 0)) {
                println!("  Last played:  {}", last.format("%Y-%m-%d %H:%M"));
            }
        }
        None => println!("  Plays:        0"),
    }
    Ok(())
}

fn cmd_status(target: Target) -> Result<()> {
    let collection = target.open()?;
    let counts = collection.counts()?;
    let config = collection.config();

    println!("Collection: {}", target.db_path.display());
    println!();
    println!("Tracks:       {}", counts.tracks);
    println!("Albums:       {}", counts.albums);
    println!("Artists:      {}", counts.artists);
    println!("Genres:       {}", counts.genres);
    println!("Composers:    {}", counts.composers);
    println!("Years:        {}", counts.years);
    println!("Images:       {}", counts.images);
    println!("Directories:  {}", counts.directories);
    println!();
    println!("Folders:");
    for folder in &config.collection_folders {
        println!("  {}", folder.display());
    }
    println!();
    match collection.scanner_version() {
        Some(version) => println!("Scanner:      {}", version),
        None => println!("Scanner:      not found"),
    }
    if let ScanStatus::Running { scan_type, current, total, .. } = collection.scans().status() {
        println!("Scanning:     {} {}/{}", scan_type.as_str(), current, total);
    }

    Ok(())
}

struct ConfigChanges {
    add_folder: Vec<PathBuf>,
    remove_folder: Vec<PathBuf>,
    monitor: Option<bool>,
    recursive: Option<bool>,
    charset_detection: Option<bool>,
    scanner: Option<PathBuf>,
    max_restarts: Option<u32>,
}

fn cmd_config(target: Target, changes: ConfigChanges) -> Result<()> {
    let collection = target.open()?;
    let mut config = collection.config();
    let before = config.clone();

    for folder in changes.add_folder {
        let folder = folder
            .canonicalize()
            .map_err(|_| anyhow::anyhow!("Folder does not exist: {}", folder.display()))?;
        if !config.collection_folders.contains(&folder) {
            config.collection_folders.push(folder);
        }
    }
    config.collection_folders.retain(|f| !changes.remove_folder.contains(f));
    if let Some(monitor) = changes.monitor {
        config.monitor_changes = monitor;
    }
    if let Some(recursive) = changes.recursive {
        config.scan_recursively = recursive;
    }
    if let Some(charset) = changes.charset_detection {
        config.use_charset_detection = charset;
    }
    if let Some(scanner) = changes.scanner {
        config.scanner_path = Some(scanner);
    }
    if let Some(max) = changes.max_restarts {
        config.max_restarts = max;
    }

    if config != before {
        collection.update_config(config.clone())?;
    }
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn cmd_watch(target: Target) -> Result<()> {
    let collection = target.open()?;
    collection.subscribe(Arc::new(ConsoleObserver));

    if !collection.config().monitor_changes {
        println!("Change monitoring is off; only registry maintenance will run.");
        println!("Enable it with 'collectiondb config --monitor true'.");
    }
    collection.start_maintenance()?;
    println!("Watching collection. Press Ctrl-C to stop.");

    loop {
        std::thread::park();
    }
}

fn cmd_migrate(target: Target) -> Result<()> {
    let collection = target.open()?;
    let outcome = collection.migration();

    if outcome.created {
        println!("Created new database at version {}", outcome.to_version);
    } else {
        match outcome.from_version {
            Some(from) if from == outcome.to_version => println!("Database is up to date (version {})", from),
            Some(from) => println!("Upgraded database from version {} to {}", from, outcome.to_version),
            None => println!("Database at version {}", outcome.to_version),
        }
    }
    if outcome.rescan_required {
        println!("A full rescan was started to rebuild track identities.");
        report_outcome(collection.scans().wait())?;
    }
    Ok(())
}
