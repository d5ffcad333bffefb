// Database module

pub mod migrations;
pub mod schema;
pub mod staging;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use directories::ProjectDirs;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;

use crate::constants::{DB_FILENAME, SAVE_LOCATION_FOLDER};
use crate::error::Result;

/// Open or create a database at the given path. Does not migrate.
pub fn open_db(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(db_path)?;

    // Enable WAL mode for better concurrency
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;

    Ok(conn)
}

/// Shared handle to the single collection connection.
///
/// Permanent and staging SQL both go through this handle; staging tables are
/// temp tables and only exist on this connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(db_path: &Path) -> Result<Self> {
        Ok(Self::from_connection(open_db(db_path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Lock the connection. Hold the guard only for the duration of one logical operation.
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Run migrations (or create the schema for a brand-new file).
    pub fn migrate(&self) -> Result<migrations::MigrationOutcome> {
        migrations::update(&self.lock())
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "collectiondb", "collectiondb")
}

/// Default database location in the platform data directory.
pub fn default_db_path() -> PathBuf {
    project_dirs()
        .map(|d| d.data_dir().join(DB_FILENAME))
        .unwrap_or_else(|| PathBuf::from(DB_FILENAME))
}

/// Default directory the scanner writes its checkpoint and batch files to.
pub fn default_save_location() -> PathBuf {
    project_dirs()
        .map(|d| d.data_dir().join(SAVE_LOCATION_FOLDER))
        .unwrap_or_else(|| PathBuf::from(SAVE_LOCATION_FOLDER))
}
