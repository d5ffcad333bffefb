// Scan configuration, persisted as JSON in the settings table

use std::path::PathBuf;
use std::time::Duration;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::db::{self, schema};
use crate::error::{CollectionError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScanConfig {
    /// Root folders handed to the scanner on a full scan
    pub collection_folders: Vec<PathBuf>,
    pub scan_recursively: bool,
    pub use_charset_detection: bool,
    /// Enables the auto-scan timer
    pub monitor_changes: bool,
    pub auto_scan_interval_secs: u64,
    pub max_restarts: u32,
    pub restart_delay_ms: u64,
    pub registry_gc_interval_secs: u64,
    pub scanner_path: Option<PathBuf>,
    pub save_location: Option<PathBuf>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            collection_folders: Vec::new(),
            scan_recursively: true,
            use_charset_detection: false,
            monitor_changes: false,
            auto_scan_interval_secs: DEFAULT_AUTO_SCAN_INTERVAL_SECS,
            max_restarts: DEFAULT_MAX_RESTARTS,
            restart_delay_ms: DEFAULT_RESTART_DELAY_MS,
            registry_gc_interval_secs: DEFAULT_REGISTRY_GC_INTERVAL_SECS,
            scanner_path: None,
            save_location: None,
        }
    }
}

impl ScanConfig {
    pub fn auto_scan_interval(&self) -> Duration {
        Duration::from_secs(self.auto_scan_interval_secs.max(1))
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn registry_gc_interval(&self) -> Duration {
        Duration::from_secs(self.registry_gc_interval_secs.max(1))
    }

    /// Where the scanner keeps checkpoint and batch files.
    pub fn save_location(&self) -> PathBuf {
        self.save_location
            .clone()
            .unwrap_or_else(db::default_save_location)
    }

    /// Reject values the scan manager cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_restarts == 0 {
            return Err(CollectionError::Config("maxRestarts must be at least 1".to_string()));
        }
        for folder in &self.collection_folders {
            if !folder.is_absolute() {
                return Err(CollectionError::Config(format!(
                    "Collection folder must be absolute: {}",
                    folder.display()
                )));
            }
        }
        Ok(())
    }
}

/// Load the stored config, falling back to defaults when none was saved.
pub fn load(conn: &Connection) -> Result<ScanConfig> {
    match schema::get_setting(conn, SETTING_SCAN_CONFIG)? {
        Some(json) => {
            let config: ScanConfig = serde_json::from_str(&json)?;
            config.validate()?;
            Ok(config)
        }
        None => Ok(ScanConfig::default()),
    }
}

pub fn save(conn: &Connection, config: &ScanConfig) -> Result<()> {
    config.validate()?;
    let json = serde_json::to_string(config)?;
    schema::set_setting(conn, SETTING_SCAN_CONFIG, &json)
}

/// The collection id passed to the scanner. Generated and stored on first use.
pub fn collection_id(conn: &Connection) -> Result<String> {
    if let Some(id) = schema::get_setting(conn, SETTING_COLLECTION_ID)? {
        return Ok(id);
    }
    let id = uuid::Uuid::new_v4().to_string();
    schema::set_setting(conn, SETTING_COLLECTION_ID, &id)?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations;

    fn setup_test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        migrations::create_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn test_defaults_when_unset() {
        let conn = setup_test_db();
        let config = load(&conn).unwrap();
        assert_eq!(config, ScanConfig::default());
        assert_eq!(config.max_restarts, 80);
        assert_eq!(config.auto_scan_interval(), Duration::from_secs(60));
        assert!(config.scan_recursively);
    }

    #[test]
    fn test_save_and_load() {
        let conn = setup_test_db();
        let config = ScanConfig {
            collection_folders: vec![PathBuf::from("/music")],
            monitor_changes: true,
            ..Default::default()
        };
        save(&conn, &config).unwrap();
        assert_eq!(load(&conn).unwrap(), config);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let conn = setup_test_db();
        schema::set_setting(&conn, SETTING_SCAN_CONFIG, r#"{"monitorChanges":true}"#).unwrap();
        let config = load(&conn).unwrap();
        assert!(config.monitor_changes);
        assert_eq!(config.max_restarts, DEFAULT_MAX_RESTARTS);
    }

    #[test]
    fn test_relative_folder_rejected() {
        let config = ScanConfig {
            collection_folders: vec![PathBuf::from("music")],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_collection_id_is_stable() {
        let conn = setup_test_db();
        let first = collection_id(&conn).unwrap();
        let second = collection_id(&conn).unwrap();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }
}
