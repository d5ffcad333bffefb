// Schema version management
// Migrations are forward-only. Never edit or delete a migration after it ships.

use rusqlite::{params, Connection, OptionalExtension};

use crate::constants::{DB_VERSION, DB_VERSION_COMPONENT};
use crate::error::{CollectionError, Result};

/// DDL for a brand-new database at the current schema version.
const CREATE_SCHEMA: &str = r#"
    CREATE TABLE admin (
        component TEXT PRIMARY KEY,
        version INTEGER NOT NULL
    );

    CREATE TABLE settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE devices (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        type TEXT,
        label TEXT,
        lastmountpoint TEXT,
        uuid TEXT UNIQUE
    );

    CREATE TABLE urls (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        deviceid INTEGER NOT NULL,
        rpath TEXT NOT NULL,
        directory INTEGER,
        uniqueid TEXT
    );

    CREATE TABLE directories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        deviceid INTEGER NOT NULL,
        dir TEXT NOT NULL,
        changedate INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE artists (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    );

    CREATE TABLE images (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT NOT NULL UNIQUE
    );

    CREATE TABLE albums (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        artist INTEGER,
        image INTEGER
    );

    CREATE TABLE genres (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    );

    CREATE TABLE composers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    );

    CREATE TABLE years (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    );

    CREATE TABLE tracks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        url INTEGER NOT NULL UNIQUE,
        artist INTEGER,
        album INTEGER,
        genre INTEGER,
        composer INTEGER,
        year INTEGER,
        title TEXT,
        comment TEXT,
        tracknumber INTEGER,
        discnumber INTEGER,
        bitrate INTEGER,
        length INTEGER,
        samplerate INTEGER,
        filesize INTEGER,
        filetype TEXT,
        bpm REAL,
        createdate INTEGER,
        modifydate INTEGER,
        albumgain REAL,
        albumpeakgain REAL,
        trackgain REAL,
        trackpeakgain REAL
    );

    CREATE TABLE statistics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        url INTEGER NOT NULL UNIQUE,
        firstplayed INTEGER,
        lastplayed INTEGER,
        score REAL,
        rating INTEGER NOT NULL DEFAULT 0,
        playcount INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE playlists (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL
    );

    CREATE TABLE playlist_tracks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        playlist_id INTEGER NOT NULL,
        position INTEGER NOT NULL,
        url TEXT NOT NULL,
        uniqueid TEXT,
        title TEXT
    );

"#;

/// Indexes of the current schema. Shared by fresh creation and the upgrade that backfills them.
const CREATE_INDEXES: &str = r#"
    CREATE UNIQUE INDEX IF NOT EXISTS urls_id_rpath ON urls(deviceid, rpath);
    CREATE UNIQUE INDEX IF NOT EXISTS urls_uniqueid ON urls(uniqueid);
    CREATE INDEX IF NOT EXISTS urls_directory ON urls(directory);
    CREATE UNIQUE INDEX IF NOT EXISTS directories_deviceid_dir ON directories(deviceid, dir);
    CREATE UNIQUE INDEX IF NOT EXISTS albums_name_artist ON albums(name, COALESCE(artist, -1));
    CREATE INDEX IF NOT EXISTS albums_artist ON albums(artist);
    CREATE INDEX IF NOT EXISTS tracks_artist ON tracks(artist);
    CREATE INDEX IF NOT EXISTS tracks_album ON tracks(album);
    CREATE INDEX IF NOT EXISTS tracks_genre ON tracks(genre);
    CREATE INDEX IF NOT EXISTS tracks_composer ON tracks(composer);
    CREATE INDEX IF NOT EXISTS tracks_year ON tracks(year);
    CREATE INDEX IF NOT EXISTS playlist_tracks_playlist ON playlist_tracks(playlist_id);
"#;

/// Before version 5 nothing enforced these keys; keep the lowest id of each duplicate.
const DEDUPLICATE_KEYS: &str = r#"
    DELETE FROM urls WHERE id NOT IN (SELECT MIN(id) FROM urls GROUP BY deviceid, rpath);
    DELETE FROM tracks WHERE url NOT IN (SELECT id FROM urls);
    UPDATE urls SET directory = (
        SELECT MIN(d2.id) FROM directories d1 JOIN directories d2
            ON d2.deviceid = d1.deviceid AND d2.dir = d1.dir
        WHERE d1.id = urls.directory)
    WHERE directory IS NOT NULL;
    DELETE FROM directories WHERE id NOT IN (SELECT MIN(id) FROM directories GROUP BY deviceid, dir);
    UPDATE tracks SET album = (
        SELECT MIN(a2.id) FROM albums a1 JOIN albums a2
            ON a2.name = a1.name AND COALESCE(a2.artist, -1) = COALESCE(a1.artist, -1)
        WHERE a1.id = tracks.album)
    WHERE album IS NOT NULL;
    DELETE FROM albums WHERE id NOT IN (SELECT MIN(id) FROM albums GROUP BY name, COALESCE(artist, -1));
"#;

/// One upgrade step from `version - 1` to `version`.
struct Migration {
    version: u32,
    /// SQL batches run in order
    sql: &'static [&'static str],
    /// The step changes how tracks are identified, so stored content must be rebuilt.
    requires_rescan: bool,
}

/// All upgrade steps in order. The last entry's version must equal `DB_VERSION`.
const MIGRATIONS: &[Migration] = &[
    // Migration 2: replay gain
    Migration {
        version: 2,
        sql: &[r#"
        ALTER TABLE tracks ADD COLUMN albumgain REAL;
        ALTER TABLE tracks ADD COLUMN albumpeakgain REAL;
        ALTER TABLE tracks ADD COLUMN trackgain REAL;
        ALTER TABLE tracks ADD COLUMN trackpeakgain REAL;
        "#],
        requires_rescan: false,
    },
    // Migration 3: cover images
    Migration {
        version: 3,
        sql: &[r#"
        CREATE TABLE images (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            path TEXT NOT NULL UNIQUE
        );
        ALTER TABLE albums ADD COLUMN image INTEGER;
        "#],
        requires_rescan: false,
    },
    // Migration 4: durable track identity
    Migration {
        version: 4,
        sql: &[r#"
        ALTER TABLE urls ADD COLUMN uniqueid TEXT;
        CREATE UNIQUE INDEX urls_uniqueid ON urls(uniqueid);
        "#],
        requires_rescan: true,
    },
    // Migration 5: indexes of the fresh schema, missing on upgraded databases
    Migration {
        version: 5,
        sql: &[DEDUPLICATE_KEYS, CREATE_INDEXES],
        requires_rescan: false,
    },
];

/// What `update` did to the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOutcome {
    /// Version found before the update (None for a brand-new database)
    pub from_version: Option<u32>,
    pub to_version: u32,
    /// A fresh schema was created
    pub created: bool,
    /// Content must be rebuilt with a full scan
    pub rescan_required: bool,
}

/// Read the stored schema version. None means the database has never been initialized.
pub fn stored_version(conn: &Connection) -> Result<Option<u32>> {
    let has_admin: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'admin'",
        [],
        |row| row.get(0),
    )?;
    if has_admin == 0 {
        return Ok(None);
    }

    let version = conn
        .query_row(
            "SELECT version FROM admin WHERE component = ?1",
            params![DB_VERSION_COMPONENT],
            |row| row.get::<_, u32>(0),
        )
        .optional()?;
    Ok(version)
}

fn set_stored_version(conn: &Connection, version: u32) -> Result<()> {
    conn.execute(
        "INSERT INTO admin (component, version) VALUES (?1, ?2)
         ON CONFLICT(component) DO UPDATE SET version = excluded.version",
        params![DB_VERSION_COMPONENT, version],
    )?;
    Ok(())
}

/// True if the stored version differs from the version this build targets.
pub fn needs_update(conn: &Connection) -> Result<bool> {
    Ok(stored_version(conn)? != Some(DB_VERSION))
}

/// Create all permanent tables for the current version and record the version row.
pub fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_SCHEMA)?;
    conn.execute_batch(CREATE_INDEXES)?;
    set_stored_version(conn, DB_VERSION)?;
    log::info!("Created collection schema version {}", DB_VERSION);
    Ok(())
}

/// Bring the database to `DB_VERSION` (crash-safe: the version row is written after every step).
pub fn update(conn: &Connection) -> Result<MigrationOutcome> {
    let current = match stored_version(conn)? {
        Some(v) => v,
        None => {
            create_schema(conn)?;
            return Ok(MigrationOutcome {
                from_version: None,
                to_version: DB_VERSION,
                created: true,
                rescan_required: false,
            });
        }
    };

    // Refuse to open a DB created by a newer build
    if current > DB_VERSION {
        return Err(CollectionError::SchemaTooNew {
            found: current,
            supported: DB_VERSION,
        });
    }

    let mut rescan_required = false;
    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }

        for batch in migration.sql {
            conn.execute_batch(batch)?;
        }
        set_stored_version(conn, migration.version)?;
        rescan_required |= migration.requires_rescan;

        log::info!("Applied collection migration {}", migration.version);
    }

    Ok(MigrationOutcome {
        from_version: Some(current),
        to_version: DB_VERSION,
        created: false,
        rescan_required,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Schema as shipped at version 1, before any migration.
    const LEGACY_V1: &str = r#"
        CREATE TABLE admin (component TEXT PRIMARY KEY, version INTEGER NOT NULL);
        CREATE TABLE settings (key TEXT PRIMARY KEY, value TEXT NOT NULL);
        CREATE TABLE devices (id INTEGER PRIMARY KEY AUTOINCREMENT, type TEXT, label TEXT, lastmountpoint TEXT, uuid TEXT UNIQUE);
        CREATE TABLE urls (id INTEGER PRIMARY KEY AUTOINCREMENT, deviceid INTEGER NOT NULL, rpath TEXT NOT NULL, directory INTEGER);
        CREATE TABLE directories (id INTEGER PRIMARY KEY AUTOINCREMENT, deviceid INTEGER NOT NULL, dir TEXT NOT NULL, changedate INTEGER NOT NULL DEFAULT 0);
        CREATE TABLE artists (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL UNIQUE);
        CREATE TABLE albums (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL, artist INTEGER);
        CREATE TABLE genres (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL UNIQUE);
        CREATE TABLE composers (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL UNIQUE);
        CREATE TABLE years (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL UNIQUE);
        CREATE TABLE tracks (id INTEGER PRIMARY KEY AUTOINCREMENT, url INTEGER NOT NULL UNIQUE, artist INTEGER, album INTEGER,
            genre INTEGER, composer INTEGER, year INTEGER, title TEXT, comment TEXT, tracknumber INTEGER, discnumber INTEGER,
            bitrate INTEGER, length INTEGER, samplerate INTEGER, filesize INTEGER, filetype TEXT, bpm REAL,
            createdate INTEGER, modifydate INTEGER);
        CREATE TABLE statistics (id INTEGER PRIMARY KEY AUTOINCREMENT, url INTEGER NOT NULL UNIQUE, firstplayed INTEGER,
            lastplayed INTEGER, score REAL, rating INTEGER NOT NULL DEFAULT 0, playcount INTEGER NOT NULL DEFAULT 0);
        CREATE TABLE playlists (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL);
        CREATE TABLE playlist_tracks (id INTEGER PRIMARY KEY AUTOINCREMENT, playlist_id INTEGER NOT NULL, position INTEGER NOT NULL,
            url TEXT NOT NULL, uniqueid TEXT, title TEXT);
        INSERT INTO admin (component, version) VALUES ('DB_VERSION', 1);
    "#;

    fn column_names(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table)).unwrap();
        stmt.query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap()
    }

    fn index_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'index' AND sql IS NOT NULL ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_migration_list_ends_at_target_version() {
        let last = MIGRATIONS.last().map(|m| m.version);
        assert_eq!(last, Some(DB_VERSION));
        for pair in MIGRATIONS.windows(2) {
            assert_eq!(pair[0].version + 1, pair[1].version, "Migration steps must be consecutive");
        }
    }

    #[test]
    fn test_fresh_database_creates_schema() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(stored_version(&conn).unwrap(), None);
        assert!(needs_update(&conn).unwrap());

        let outcome = update(&conn).unwrap();
        assert!(outcome.created);
        assert!(!outcome.rescan_required);
        assert_eq!(outcome.from_version, None);
        assert_eq!(stored_version(&conn).unwrap(), Some(DB_VERSION));
        assert!(!needs_update(&conn).unwrap());

        // Second update is a no-op
        let again = update(&conn).unwrap();
        assert!(!again.created);
        assert_eq!(again.from_version, Some(DB_VERSION));
        assert!(!again.rescan_required);
    }

    #[test]
    fn test_legacy_database_is_upgraded_step_by_step() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(LEGACY_V1).unwrap();
        assert_eq!(stored_version(&conn).unwrap(), Some(1));

        let outcome = update(&conn).unwrap();
        assert_eq!(outcome.from_version, Some(1));
        assert_eq!(outcome.to_version, DB_VERSION);
        assert!(outcome.rescan_required, "Identity migration must demand a full rescan");

        assert!(column_names(&conn, "tracks").contains(&"trackpeakgain".to_string()));
        assert!(column_names(&conn, "albums").contains(&"image".to_string()));
        assert!(column_names(&conn, "urls").contains(&"uniqueid".to_string()));
        assert_eq!(stored_version(&conn).unwrap(), Some(DB_VERSION));

        let fresh = Connection::open_in_memory().unwrap();
        update(&fresh).unwrap();
        assert_eq!(index_names(&conn), index_names(&fresh));

        conn.execute("INSERT INTO urls (deviceid, rpath) VALUES (-1, './a.mp3')", []).unwrap();
        let dup = conn.execute("INSERT INTO urls (deviceid, rpath) VALUES (-1, './a.mp3')", []);
        assert!(dup.is_err(), "Upgraded database must enforce unique paths");
    }

    #[test]
    fn test_upgrade_collapses_duplicate_rows() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(LEGACY_V1).unwrap();
        conn.execute_batch(
            "INSERT INTO directories (id, deviceid, dir, changedate) VALUES (1, -1, './m', 1), (2, -1, './m', 2);
             INSERT INTO urls (id, deviceid, rpath, directory) VALUES (1, -1, './m/a.mp3', 2), (2, -1, './m/a.mp3', 2);
             INSERT INTO albums (id, name, artist) VALUES (1, 'X', NULL), (2, 'X', NULL);
             INSERT INTO tracks (url, album) VALUES (1, 2), (2, 2);",
        )
        .unwrap();

        update(&conn).unwrap();

        let count = |table: &str| -> i64 {
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0)).unwrap()
        };
        assert_eq!(count("urls"), 1);
        assert_eq!(count("directories"), 1);
        assert_eq!(count("albums"), 1);
        assert_eq!(count("tracks"), 1);
        let (directory, album): (i64, i64) = conn
            .query_row(
                "SELECT u.directory, t.album FROM tracks t JOIN urls u ON u.id = t.url",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!((directory, album), (1, 1));
    }

    #[test]
    fn test_current_database_needs_no_rescan() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(CREATE_SCHEMA).unwrap();
        conn.execute_batch(CREATE_INDEXES).unwrap();
        set_stored_version(&conn, DB_VERSION).unwrap();

        let outcome = update(&conn).unwrap();
        assert!(!outcome.rescan_required);
    }

    #[test]
    fn test_newer_database_is_refused() {
        let conn = Connection::open_in_memory().unwrap();
        create_schema(&conn).unwrap();
        set_stored_version(&conn, DB_VERSION + 1).unwrap();

        match update(&conn) {
            Err(CollectionError::SchemaTooNew { found, supported }) => {
                assert_eq!(found, DB_VERSION + 1);
                assert_eq!(supported, DB_VERSION);
            }
            other => panic!("Expected SchemaTooNew, got {:?}", other),
        }
    }

    #[test]
    fn test_compilation_uniqueness_is_enforced() {
        let conn = Connection::open_in_memory().unwrap();
        create_schema(&conn).unwrap();
        conn.execute("INSERT INTO albums (name, artist) VALUES ('Hits', NULL)", []).unwrap();
        let dup = conn.execute("INSERT INTO albums (name, artist) VALUES ('Hits', NULL)", []);
        assert!(dup.is_err(), "Two compilations with the same name must be rejected");
    }
}
