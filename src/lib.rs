// collectiondb - Collection scan-and-synchronize engine

pub mod constants;
pub mod error;
pub mod config;
pub mod tools;
pub mod mount;
pub mod events;
pub mod db;
pub mod registry;
pub mod parser;
pub mod processor;
pub mod scanner;
pub mod scan;
pub mod collection;

pub use collection::Collection;
pub use config::ScanConfig;
pub use error::{CollectionError, Result};
pub use events::{CollectionEvent, CollectionObserver, PlaylistImporter, ScanProgress};
pub use scan::{ScanOutcome, ScanRequest, ScanStatus, ScanType};
