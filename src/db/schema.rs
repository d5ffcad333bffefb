// Database schema types and query helpers

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::Result;

// ----- Directories -----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRow {
    pub id: i64,
    pub device_id: i64,
    pub rpath: String,
    pub changedate: i64,
}

/// All known directories on the given devices, ordered by path.
pub fn list_directories(conn: &Connection, device_ids: &[i64]) -> Result<Vec<DirectoryRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, deviceid, dir, changedate FROM directories ORDER BY deviceid, dir",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(DirectoryRow {
                id: row.get(0)?,
                device_id: row.get(1)?,
                rpath: row.get(2)?,
                changedate: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows
        .into_iter()
        .filter(|d| device_ids.contains(&d.device_id))
        .collect())
}

pub fn find_directory(conn: &Connection, device_id: i64, rpath: &str) -> Result<Option<DirectoryRow>> {
    let result = conn.query_row(
        "SELECT id, deviceid, dir, changedate FROM directories WHERE deviceid = ?1 AND dir = ?2",
        params![device_id, rpath],
        |row| {
            Ok(DirectoryRow {
                id: row.get(0)?,
                device_id: row.get(1)?,
                rpath: row.get(2)?,
                changedate: row.get(3)?,
            })
        },
    ).optional()?;
    Ok(result)
}

// ----- URLs -----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlRow {
    pub id: i64,
    pub device_id: i64,
    pub rpath: String,
    pub directory: Option<i64>,
    pub unique_id: Option<String>,
}

pub(crate) fn map_url(row: &rusqlite::Row<'_>) -> rusqlite::Result<UrlRow> {
    Ok(UrlRow {
        id: row.get(0)?,
        device_id: row.get(1)?,
        rpath: row.get(2)?,
        directory: row.get(3)?,
        unique_id: row.get(4)?,
    })
}

pub fn find_url_by_uid(conn: &Connection, unique_id: &str) -> Result<Option<UrlRow>> {
    let result = conn.query_row(
        "SELECT id, deviceid, rpath, directory, uniqueid FROM urls WHERE uniqueid = ?1",
        params![unique_id],
        map_url,
    ).optional()?;
    Ok(result)
}

pub fn find_url_by_path(conn: &Connection, device_id: i64, rpath: &str) -> Result<Option<UrlRow>> {
    let result = conn.query_row(
        "SELECT id, deviceid, rpath, directory, uniqueid FROM urls WHERE deviceid = ?1 AND rpath = ?2",
        params![device_id, rpath],
        map_url,
    ).optional()?;
    Ok(result)
}

// ----- Tracks -----

/// A track joined with its URL and dimension names, as the browser sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackView {
    pub id: i64,
    pub url_id: i64,
    pub rpath: String,
    pub unique_id: Option<String>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    /// None for compilations
    pub album_artist: Option<String>,
    pub genre: Option<String>,
    pub year: Option<String>,
}

const TRACK_VIEW_SQL: &str = "
    SELECT t.id, u.id, u.rpath, u.uniqueid, t.title, ar.name, al.name, aa.name, g.name, y.name
    FROM tracks t
    JOIN urls u ON u.id = t.url
    LEFT JOIN artists ar ON ar.id = t.artist
    LEFT JOIN albums al ON al.id = t.album
    LEFT JOIN artists aa ON aa.id = al.artist
    LEFT JOIN genres g ON g.id = t.genre
    LEFT JOIN years y ON y.id = t.year";

fn map_track_view(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrackView> {
    Ok(TrackView {
        id: row.get(0)?,
        url_id: row.get(1)?,
        rpath: row.get(2)?,
        unique_id: row.get(3)?,
        title: row.get(4)?,
        artist: row.get(5)?,
        album: row.get(6)?,
        album_artist: row.get(7)?,
        genre: row.get(8)?,
        year: row.get(9)?,
    })
}

pub fn list_tracks(conn: &Connection, limit: i64) -> Result<Vec<TrackView>> {
    let mut stmt = conn.prepare(&format!("{} ORDER BY u.rpath LIMIT ?1", TRACK_VIEW_SQL))?;
    let tracks = stmt
        .query_map(params![limit], map_track_view)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(tracks)
}

pub fn get_track_by_path(conn: &Connection, device_id: i64, rpath: &str) -> Result<Option<TrackView>> {
    let result = conn.query_row(
        &format!("{} WHERE u.deviceid = ?1 AND u.rpath = ?2", TRACK_VIEW_SQL),
        params![device_id, rpath],
        map_track_view,
    ).optional()?;
    Ok(result)
}

/// Delete the tracks whose URL lives in one of the given directories.
pub fn delete_tracks_in_directories(conn: &Connection, table_suffix: &str, directory_ids: &[i64]) -> Result<usize> {
    let mut deleted = 0;
    let sql = format!(
        "DELETE FROM tracks{s} WHERE url IN (SELECT id FROM urls{s} WHERE directory = ?1)",
        s = table_suffix
    );
    for dir_id in directory_ids {
        deleted += conn.execute(&sql, params![dir_id])?;
    }
    Ok(deleted)
}

// ----- Statistics -----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub url_id: i64,
    pub first_played: Option<i64>,
    pub last_played: Option<i64>,
    pub score: Option<f64>,
    pub rating: i64,
    pub playcount: i64,
}

pub fn get_statistics(conn: &Connection, url_id: i64) -> Result<Option<Statistics>> {
    let result = conn.query_row(
        "SELECT url, firstplayed, lastplayed, score, rating, playcount FROM statistics WHERE url = ?1",
        params![url_id],
        |row| {
            Ok(Statistics {
                url_id: row.get(0)?,
                first_played: row.get(1)?,
                last_played: row.get(2)?,
                score: row.get(3)?,
                rating: row.get(4)?,
                playcount: row.get(5)?,
            })
        },
    ).optional()?;
    Ok(result)
}

/// Record one play of the track behind `url_id`.
pub fn record_play(conn: &Connection, url_id: i64, played_at: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO statistics (url, firstplayed, lastplayed, playcount) VALUES (?1, ?2, ?2, 1)
         ON CONFLICT(url) DO UPDATE SET lastplayed = excluded.lastplayed, playcount = playcount + 1",
        params![url_id, played_at],
    )?;
    Ok(())
}

pub fn set_rating(conn: &Connection, url_id: i64, rating: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO statistics (url, rating) VALUES (?1, ?2)
         ON CONFLICT(url) DO UPDATE SET rating = excluded.rating",
        params![url_id, rating],
    )?;
    Ok(())
}

// ----- Playlists -----

#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistEntry {
    pub playlist_id: i64,
    pub position: i64,
    pub url: String,
    pub unique_id: Option<String>,
    pub title: Option<String>,
}

#[cfg(test)]
pub fn create_playlist(conn: &Connection, name: &str) -> Result<i64> {
    conn.execute("INSERT INTO playlists (name) VALUES (?1)", params![name])?;
    Ok(conn.last_insert_rowid())
}

#[cfg(test)]
pub fn add_playlist_entry(conn: &Connection, entry: &PlaylistEntry) -> Result<i64> {
    conn.execute(
        "INSERT INTO playlist_tracks (playlist_id, position, url, uniqueid, title) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![entry.playlist_id, entry.position, entry.url, entry.unique_id, entry.title],
    )?;
    Ok(conn.last_insert_rowid())
}

#[cfg(test)]
pub fn list_playlist_entries(conn: &Connection, playlist_id: i64) -> Result<Vec<PlaylistEntry>> {
    let mut stmt = conn.prepare(
        "SELECT playlist_id, position, url, uniqueid, title FROM playlist_tracks
         WHERE playlist_id = ?1 ORDER BY position",
    )?;
    let entries = stmt
        .query_map(params![playlist_id], |row| {
            Ok(PlaylistEntry {
                playlist_id: row.get(0)?,
                position: row.get(1)?,
                url: row.get(2)?,
                unique_id: row.get(3)?,
                title: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(entries)
}

// ----- Settings (KV store) -----

/// Get a setting value by key. Returns None if not set.
pub fn get_setting(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn.query_row(
        "SELECT value FROM settings WHERE key = ?1",
        [key],
        |row| row.get(0),
    ).optional()?;
    Ok(value)
}

/// Set a setting value (upsert).
pub fn set_setting(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

// ----- Summary -----

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionCounts {
    pub tracks: i64,
    pub albums: i64,
    pub artists: i64,
    pub genres: i64,
    pub composers: i64,
    pub years: i64,
    pub images: i64,
    pub urls: i64,
    pub directories: i64,
}

pub fn collection_counts(conn: &Connection) -> Result<CollectionCounts> {
    let count = |table: &str| -> Result<i64> {
        Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?)
    };
    Ok(CollectionCounts {
        tracks: count("tracks")?,
        albums: count("albums")?,
        artists: count("artists")?,
        genres: count("genres")?,
        composers: count("composers")?,
        years: count("years")?,
        images: count("images")?,
        urls: count("urls")?,
        directories: count("directories")?,
    })
}
