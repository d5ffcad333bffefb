// Staging tables: per-scan temp copies of the content and identity tables

use rusqlite::Connection;

use crate::error::Result;

/// A permanent table mirrored into staging as `<name>_temp`.
#[derive(Debug, Clone, Copy)]
pub struct StagedTable {
    pub name: &'static str,
    pub columns: &'static str,
    ddl: &'static str,
}

impl StagedTable {
    pub fn temp_name(&self) -> String {
        format!("{}_temp", self.name)
    }
}

pub const URLS: StagedTable = StagedTable {
    name: "urls",
    columns: "id, deviceid, rpath, directory, uniqueid",
    ddl: r#"
        CREATE TEMP TABLE urls_temp (
            id INTEGER PRIMARY KEY,
            deviceid INTEGER NOT NULL,
            rpath TEXT NOT NULL,
            directory INTEGER,
            uniqueid TEXT
        );
        CREATE UNIQUE INDEX urls_temp_rpath ON urls_temp(deviceid, rpath);
        CREATE UNIQUE INDEX urls_temp_uniqueid ON urls_temp(uniqueid);
        CREATE INDEX urls_temp_directory ON urls_temp(directory);
    "#,
};

pub const DIRECTORIES: StagedTable = StagedTable {
    name: "directories",
    columns: "id, deviceid, dir, changedate",
    ddl: r#"
        CREATE TEMP TABLE directories_temp (
            id INTEGER PRIMARY KEY,
            deviceid INTEGER NOT NULL,
            dir TEXT NOT NULL,
            changedate INTEGER NOT NULL DEFAULT 0
        );
        CREATE UNIQUE INDEX directories_temp_dir ON directories_temp(deviceid, dir);
    "#,
};

pub const ARTISTS: StagedTable = StagedTable {
    name: "artists",
    columns: "id, name",
    ddl: "CREATE TEMP TABLE artists_temp (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE);",
};

pub const IMAGES: StagedTable = StagedTable {
    name: "images",
    columns: "id, path",
    ddl: "CREATE TEMP TABLE images_temp (id INTEGER PRIMARY KEY, path TEXT NOT NULL UNIQUE);",
};

pub const ALBUMS: StagedTable = StagedTable {
    name: "albums",
    columns: "id, name, artist, image",
    ddl: r#"
        CREATE TEMP TABLE albums_temp (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            artist INTEGER,
            image INTEGER
        );
        CREATE UNIQUE INDEX albums_temp_name_artist ON albums_temp(name, COALESCE(artist, -1));
    "#,
};

pub const COMPOSERS: StagedTable = StagedTable {
    name: "composers",
    columns: "id, name",
    ddl: "CREATE TEMP TABLE composers_temp (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE);",
};

pub const GENRES: StagedTable = StagedTable {
    name: "genres",
    columns: "id, name",
    ddl: "CREATE TEMP TABLE genres_temp (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE);",
};

pub const YEARS: StagedTable = StagedTable {
    name: "years",
    columns: "id, name",
    ddl: "CREATE TEMP TABLE years_temp (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE);",
};

pub const TRACKS: StagedTable = StagedTable {
    name: "tracks",
    columns: "id, url, artist, album, genre, composer, year, title, comment, tracknumber, discnumber, \
              bitrate, length, samplerate, filesize, filetype, bpm, createdate, modifydate, \
              albumgain, albumpeakgain, trackgain, trackpeakgain",
    ddl: r#"
        CREATE TEMP TABLE tracks_temp (
            id INTEGER PRIMARY KEY,
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
        CREATE INDEX tracks_temp_album ON tracks_temp(album);
    "#,
};

/// Publish order: dimensions before the rows that reference them.
pub const COMMIT_ORDER: [StagedTable; 9] = [
    ARTISTS, IMAGES, ALBUMS, COMPOSERS, GENRES, YEARS, URLS, DIRECTORIES, TRACKS,
];

/// Tables cleared by a full scan. Identity tables (urls, directories, statistics) survive.
pub const CONTENT_TABLES: [&str; 7] = [
    "tracks", "albums", "artists", "genres", "composers", "years", "images",
];

/// Create (or recreate) every staging table.
pub fn create_staging(conn: &Connection) -> Result<()> {
    drop_staging(conn)?;
    for table in COMMIT_ORDER {
        conn.execute_batch(table.ddl)?;
    }
    Ok(())
}

/// Drop every staging table. Safe to call when none exist.
pub fn drop_staging(conn: &Connection) -> Result<()> {
    for table in COMMIT_ORDER {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS temp.{};", table.temp_name()))?;
    }
    Ok(())
}

/// True if the staging tables currently exist on this connection.
pub fn staging_exists(conn: &Connection) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_temp_master WHERE type = 'table' AND name = 'tracks_temp'",
        [],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Seed a staging table with the full content of its permanent table.
pub fn copy_to_staging(conn: &Connection, table: &StagedTable) -> Result<usize> {
    let sql = format!(
        "INSERT INTO {temp} ({cols}) SELECT {cols} FROM {name}",
        temp = table.temp_name(),
        cols = table.columns,
        name = table.name,
    );
    Ok(conn.execute(&sql, [])?)
}

/// Copy staged rows over the permanent table, replacing rows that collide on any unique key.
pub fn publish(conn: &Connection, table: &StagedTable) -> Result<usize> {
    let sql = format!(
        "INSERT OR REPLACE INTO {name} ({cols}) SELECT {cols} FROM {temp}",
        temp = table.temp_name(),
        cols = table.columns,
        name = table.name,
    );
    Ok(conn.execute(&sql, [])?)
}

/// Replace the permanent table's content with the staged rows.
pub fn replace(conn: &Connection, table: &StagedTable) -> Result<usize> {
    conn.execute(&format!("DELETE FROM {}", table.name), [])?;
    publish(conn, table)
}

/// Delete every row of the content tables.
pub fn clear_content_tables(conn: &Connection) -> Result<()> {
    for name in CONTENT_TABLES {
        conn.execute(&format!("DELETE FROM {}", name), [])?;
    }
    Ok(())
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
    fn test_create_and_drop_staging() {
        let conn = setup_test_db();
        assert!(!staging_exists(&conn).unwrap());

        create_staging(&conn).unwrap();
        assert!(staging_exists(&conn).unwrap());

        // Recreating replaces rather than failing
        create_staging(&conn).unwrap();

        drop_staging(&conn).unwrap();
        assert!(!staging_exists(&conn).unwrap());
        drop_staging(&conn).unwrap();
    }

    #[test]
    fn test_copy_then_publish_round_trip() {
        let conn = setup_test_db();
        conn.execute("INSERT INTO artists (name) VALUES ('Alpha'), ('Beta')", []).unwrap();
        create_staging(&conn).unwrap();

        assert_eq!(copy_to_staging(&conn, &ARTISTS).unwrap(), 2);
        conn.execute("INSERT INTO artists_temp (name) VALUES ('Gamma')", []).unwrap();

        publish(&conn, &ARTISTS).unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM artists", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn test_replace_removes_rows_missing_from_staging() {
        let conn = setup_test_db();
        conn.execute("INSERT INTO directories (deviceid, dir, changedate) VALUES (-1, './a', 1), (-1, './b', 2)", [])
            .unwrap();
        create_staging(&conn).unwrap();
        conn.execute("INSERT INTO directories_temp (deviceid, dir, changedate) VALUES (-1, './a', 5)", [])
            .unwrap();

        replace(&conn, &DIRECTORIES).unwrap();
        let dirs: Vec<(String, i64)> = conn
            .prepare("SELECT dir, changedate FROM directories")
            .unwrap()
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(dirs, vec![("./a".to_string(), 5)]);
    }
}
