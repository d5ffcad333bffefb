// Collection DB Constants
// Wire-level names below are shared with the scanner binary. Do not change them independently.

// Schema
pub const DB_VERSION: u32 = 5;
pub const DB_VERSION_COMPONENT: &str = "DB_VERSION";
pub const DB_FILENAME: &str = "collection.db";

// Devices
pub const LOCAL_DEVICE_ID: i64 = -1;

// Scanner process
pub const SCANNER_BINARY: &str = "collection-scanner";
pub const SCANNER_PATH_ENV: &str = "COLLECTIONDB_SCANNER_PATH";
pub const DEFAULT_MAX_RESTARTS: u32 = 80;
pub const DEFAULT_RESTART_DELAY_MS: u64 = 1000;
pub const SCANNER_READ_CHUNK: usize = 8 * 1024;
pub const SCANNER_CHANNEL_CAP: usize = 64;
pub const SCANNER_EXIT_POLL_MS: u64 = 50;

// Checkpoint files (inside the scanner save location)
pub const SAVE_LOCATION_FOLDER: &str = "scanner";
pub const FULL_BATCH_FILENAME: &str = "collection_scan_full.batch";
pub const INCREMENTAL_BATCH_FILENAME: &str = "collection_scan_incremental.batch";
pub const MTIME_FILENAME: &str = "collection_scan.mtime";
pub const MTIME_SEPARATOR: &str = "_AMAROKMTIME_";

// Timers
pub const DEFAULT_AUTO_SCAN_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_REGISTRY_GC_INTERVAL_SECS: u64 = 30;

// Album-artist inference
pub const FEATURING_SEPARATORS: [&str; 4] = ["featuring", "feat.", "ft.", "f."];
pub const MAX_INFERENCE_GROUP: usize = 60;

// Files the compilation-collision check counts as media
pub const MEDIA_EXTENSIONS: [&str; 12] = [
    "mp3", "ogg", "oga", "flac", "wma", "m4a", "aac", "opus", "wav", "aiff", "ape", "mpc",
];

// Settings keys
pub const SETTING_SCAN_CONFIG: &str = "scan_config";
pub const SETTING_COLLECTION_ID: &str = "collection_id";
