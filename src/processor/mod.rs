// Staging and reconciliation of scan results
//
// All writes of a scan land in the `*_temp` staging tables. Nothing touches the
// permanent tables until `commit`, and `rollback` only drops staging.

pub mod album_artist;
mod identity;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use walkdir::WalkDir;

pub use album_artist::AlbumArtist;
pub use identity::UrlChange;

use crate::constants::MEDIA_EXTENSIONS;
use crate::db::staging::{self, COMMIT_ORDER, DIRECTORIES, URLS};
use crate::db::{schema, Database};
use crate::error::Result;
use crate::mount::MountPointResolver;
use crate::parser::{parent_dir, ImageTags, TrackTags};
use crate::registry::DimensionKind;
use crate::scan::ScanType;

/// What a commit published.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitSummary {
    pub directories: usize,
    pub tracks: usize,
    pub url_changes: Vec<UrlChange>,
    pub conflicts: usize,
    /// Permanent tables were modified
    pub changed: bool,
}

/// Lookups remembered for the duration of one scan.
#[derive(Debug, Default)]
struct StagingCache {
    dimensions: HashMap<(DimensionKind, String), i64>,
    albums: HashMap<(String, Option<i64>), i64>,
    directories: HashMap<String, i64>,
    single_file_dirs: HashMap<String, bool>,
}

pub struct ScanResultProcessor {
    db: Database,
    mounts: Arc<dyn MountPointResolver>,
    scan_type: ScanType,
    /// Permanent directory ids whose tracks are replaced by this scan
    removed_directories: Vec<i64>,
    staged: bool,
    cache: StagingCache,
    url_changes: Vec<UrlChange>,
    /// (image id, artist, album) pairs whose album was not staged yet
    pending_images: Vec<(i64, String, String)>,
    directories_added: usize,
    tracks_added: usize,
    conflicts: usize,
}

impl ScanResultProcessor {
    pub fn new(db: Database, mounts: Arc<dyn MountPointResolver>, scan_type: ScanType) -> Self {
        Self {
            db,
            mounts,
            scan_type,
            removed_directories: Vec::new(),
            staged: false,
            cache: StagingCache::default(),
            url_changes: Vec::new(),
            pending_images: Vec::new(),
            directories_added: 0,
            tracks_added: 0,
            conflicts: 0,
        }
    }

    /// Directories (permanent ids) marked changed or deleted before the scan started.
    pub fn with_removed_directories(mut self, ids: Vec<i64>) -> Self {
        self.removed_directories = ids;
        self
    }

    pub fn scan_type(&self) -> ScanType {
        self.scan_type
    }

    pub fn is_staged(&self) -> bool {
        self.staged
    }

    /// Create staging tables and seed them. Runs once; later calls do nothing.
    pub fn setup_staging(&mut self) -> Result<()> {
        if self.staged {
            return Ok(());
        }

        let db = self.db.clone();
        let conn = db.lock();
        staging::create_staging(&conn)?;

        match self.scan_type {
            ScanType::Incremental => {
                for table in COMMIT_ORDER {
                    staging::copy_to_staging(&conn, &table)?;
                }
                let dropped = schema::delete_tracks_in_directories(&conn, "_temp", &self.removed_directories)?;
                for dir_id in &self.removed_directories {
                    conn.execute("DELETE FROM directories_temp WHERE id = ?1", params![dir_id])?;
                }
                log::debug!(
                    "Staged collection copy; {} tracks in {} changed directories will be rescanned",
                    dropped,
                    self.removed_directories.len()
                );
            }
            ScanType::Full => {
                // Keep URL and directory ids (and the statistics keyed on them) stable across full scans
                staging::copy_to_staging(&conn, &URLS)?;
                staging::copy_to_staging(&conn, &DIRECTORIES)?;
            }
        }

        self.staged = true;
        Ok(())
    }

    // ----- Directories -----

    /// Insert a directory into staging or refresh its watermark.
    pub fn add_directory(&mut self, path: &str, mtime: Option<i64>) -> Result<i64> {
        self.setup_staging()?;
        let db = self.db.clone();
        let conn = db.lock();

        let path = normalize_dir(path);
        let mtime = mtime.unwrap_or_else(|| dir_mtime(Path::new(path)));
        let id = self.upsert_directory(&conn, path, mtime)?;
        self.directories_added += 1;
        Ok(id)
    }

    fn upsert_directory(&mut self, conn: &Connection, path: &str, mtime: i64) -> Result<i64> {
        let abs = Path::new(path);
        let device = self.mounts.device_id(abs);
        let rpath = self.mounts.relative_path(device, abs);

        let existing: Option<(i64, i64)> = conn.query_row(
            "SELECT id, changedate FROM directories_temp WHERE deviceid = ?1 AND dir = ?2",
            params![device, rpath],
            |row| Ok((row.get(0)?, row.get(1)?)),
        ).optional()?;

        let id = match existing {
            Some((id, changedate)) => {
                if changedate != mtime {
                    conn.execute(
                        "UPDATE directories_temp SET changedate = ?1 WHERE id = ?2",
                        params![mtime, id],
                    )?;
                }
                id
            }
            None => {
                conn.execute(
                    "INSERT INTO directories_temp (deviceid, dir, changedate) VALUES (?1, ?2, ?3)",
                    params![device, rpath, mtime],
                )?;
                conn.last_insert_rowid()
            }
        };

        self.cache.directories.insert(path.to_string(), id);
        Ok(id)
    }

    /// Staging id of a track's directory, created from the filesystem if the scanner never announced it.
    fn directory_id(&mut self, conn: &Connection, dir: &str) -> Result<i64> {
        if let Some(id) = self.cache.directories.get(dir) {
            return Ok(*id);
        }
        let abs = Path::new(dir);
        let device = self.mounts.device_id(abs);
        let rpath = self.mounts.relative_path(device, abs);
        let existing: Option<i64> = conn.query_row(
            "SELECT id FROM directories_temp WHERE deviceid = ?1 AND dir = ?2",
            params![device, rpath],
            |row| row.get(0),
        ).optional()?;
        match existing {
            Some(id) => {
                self.cache.directories.insert(dir.to_string(), id);
                Ok(id)
            }
            None => self.upsert_directory(conn, dir, dir_mtime(abs)),
        }
    }

    // ----- Dimensions -----

    /// Look up or insert a dimension row in staging.
    fn resolve_dimension(&mut self, conn: &Connection, kind: DimensionKind, name: &str) -> Result<i64> {
        let key = (kind, name.to_string());
        if let Some(id) = self.cache.dimensions.get(&key) {
            return Ok(*id);
        }

        let table = format!("{}_temp", kind.table());
        let column = kind.column();
        let existing: Option<i64> = conn.query_row(
            &format!("SELECT id FROM {} WHERE {} = ?1", table, column),
            params![name],
            |row| row.get(0),
        ).optional()?;

        let id = match existing {
            Some(id) => id,
            None => {
                conn.execute(&format!("INSERT INTO {} ({}) VALUES (?1)", table, column), params![name])?;
                conn.last_insert_rowid()
            }
        };
        self.cache.dimensions.insert(key, id);
        Ok(id)
    }

    fn optional_dimension(&mut self, conn: &Connection, kind: DimensionKind, name: &str) -> Result<Option<i64>> {
        if name.trim().is_empty() {
            return Ok(None);
        }
        self.resolve_dimension(conn, kind, name).map(Some)
    }

    /// Look up or insert an album; single-file directories may join a same-named album instead.
    fn album_id(&mut self, conn: &Connection, name: &str, artist: Option<i64>, single_file: bool) -> Result<i64> {
        let key = (name.to_string(), artist);
        if let Some(id) = self.cache.albums.get(&key) {
            return Ok(*id);
        }

        let existing: Option<i64> = conn.query_row(
            "SELECT id FROM albums_temp WHERE name = ?1 AND COALESCE(artist, -1) = COALESCE(?2, -1)",
            params![name, artist],
            |row| row.get(0),
        ).optional()?;
        if let Some(id) = existing {
            self.cache.albums.insert(key, id);
            return Ok(id);
        }

        if single_file {
            if let Some(id) = self.merge_into_existing_album(conn, name, artist)? {
                return Ok(id);
            }
        }

        conn.execute(
            "INSERT INTO albums_temp (name, artist) VALUES (?1, ?2)",
            params![name, artist],
        )?;
        let id = conn.last_insert_rowid();
        self.cache.albums.insert(key, id);
        Ok(id)
    }

    /// Compilation-collision check: a lone file whose album already exists elsewhere
    /// joins that album. If the artists disagree the album becomes a compilation.
    fn merge_into_existing_album(&mut self, conn: &Connection, name: &str, artist: Option<i64>) -> Result<Option<i64>> {
        let candidate: Option<(i64, Option<i64>)> = conn.query_row(
            "SELECT a.id, a.artist FROM albums_temp a
             WHERE a.name = ?1 AND EXISTS (SELECT 1 FROM tracks_temp t WHERE t.album = a.id)
             ORDER BY a.artist IS NOT NULL, a.id
             LIMIT 1",
            params![name],
            |row| Ok((row.get(0)?, row.get(1)?)),
        ).optional()?;

        let Some((album_id, album_artist)) = candidate else {
            return Ok(None);
        };

        if album_artist.is_none() || album_artist == artist {
            log::debug!("Merging lone track into existing album '{}' ({})", name, album_id);
            return Ok(Some(album_id));
        }

        // Artists disagree: the album is really a compilation
        let compilation: Option<i64> = conn.query_row(
            "SELECT id FROM albums_temp WHERE name = ?1 AND artist IS NULL",
            params![name],
            |row| row.get(0),
        ).optional()?;

        let target = match compilation {
            Some(comp_id) => {
                conn.execute("UPDATE tracks_temp SET album = ?1 WHERE album = ?2", params![comp_id, album_id])?;
                conn.execute("DELETE FROM albums_temp WHERE id = ?1", params![album_id])?;
                comp_id
            }
            None => {
                conn.execute("UPDATE albums_temp SET artist = NULL WHERE id = ?1", params![album_id])?;
                album_id
            }
        };

        log::info!("Album '{}' now treated as a compilation", name);
        self.cache.albums.retain(|_, id| *id != album_id);
        self.cache.albums.insert((name.to_string(), None), target);
        Ok(Some(target))
    }

    /// True if `dir` holds exactly one media file.
    fn holds_single_media_file(&mut self, dir: &str) -> bool {
        if let Some(single) = self.cache.single_file_dirs.get(dir) {
            return *single;
        }
        let count = WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && is_media_file(e.path()))
            .take(2)
            .count();
        let single = count == 1;
        self.cache.single_file_dirs.insert(dir.to_string(), single);
        single
    }

    // ----- Tracks -----

    /// Stage all tracks of one directory.
    pub fn process_directory(&mut self, tracks: Vec<TrackTags>) -> Result<()> {
        let Some(first) = tracks.first() else {
            return Ok(());
        };
        self.setup_staging()?;

        let dir = parent_dir(&first.path);
        let decision = album_artist::decide(&tracks);
        let single_file = tracks.len() == 1 && self.holds_single_media_file(&dir);

        let db = self.db.clone();
        let conn = db.lock();
        for tags in &tracks {
            let album_artist = match &decision {
                AlbumArtist::PerTrack => Some(tags.artist.as_str()),
                AlbumArtist::Shared(shared) => shared.as_deref(),
            };
            self.add_track(&conn, tags, album_artist, single_file)?;
        }
        Ok(())
    }

    fn add_track(&mut self, conn: &Connection, tags: &TrackTags, album_artist: Option<&str>, single_file: bool) -> Result<()> {
        let path = Path::new(&tags.path);
        let device = self.mounts.device_id(path);
        let rpath = self.mounts.relative_path(device, path);
        let dir_id = self.directory_id(conn, &parent_dir(&tags.path))?;
        let url_id = self.resolve_url(conn, device, &rpath, &tags.unique_id, dir_id)?;

        let artist_id = self.resolve_dimension(conn, DimensionKind::Artist, &tags.artist)?;
        let album_id = if tags.album.is_empty() {
            None
        } else {
            let album_artist_id = match album_artist {
                Some(name) => Some(self.resolve_dimension(conn, DimensionKind::Artist, name)?),
                None => None,
            };
            Some(self.album_id(conn, &tags.album, album_artist_id, single_file)?)
        };
        let genre_id = self.optional_dimension(conn, DimensionKind::Genre, &tags.genre)?;
        let composer_id = self.optional_dimension(conn, DimensionKind::Composer, &tags.composer)?;
        let year_id = match tags.year.filter(|y| *y > 0) {
            Some(year) => Some(self.resolve_dimension(conn, DimensionKind::Year, &year.to_string())?),
            None => None,
        };

        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT INTO tracks_temp (url, artist, album, genre, composer, year, title, comment,
                tracknumber, discnumber, bitrate, length, samplerate, filesize, filetype, bpm,
                createdate, modifydate, albumgain, albumpeakgain, trackgain, trackpeakgain)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                COALESCE((SELECT createdate FROM tracks WHERE url = ?1), ?17),
                ?18, ?19, ?20, ?21, ?22)
             ON CONFLICT(url) DO UPDATE SET
                artist = excluded.artist, album = excluded.album, genre = excluded.genre,
                composer = excluded.composer, year = excluded.year, title = excluded.title,
                comment = excluded.comment, tracknumber = excluded.tracknumber,
                discnumber = excluded.discnumber, bitrate = excluded.bitrate,
                length = excluded.length, samplerate = excluded.samplerate,
                filesize = excluded.filesize, filetype = excluded.filetype, bpm = excluded.bpm,
                modifydate = excluded.modifydate, albumgain = excluded.albumgain,
                albumpeakgain = excluded.albumpeakgain, trackgain = excluded.trackgain,
                trackpeakgain = excluded.trackpeakgain",
            params![
                url_id,
                artist_id,
                album_id,
                genre_id,
                composer_id,
                year_id,
                tags.title,
                tags.comment,
                tags.track_number,
                tags.disc_number,
                tags.bitrate,
                tags.length,
                tags.samplerate,
                tags.filesize,
                tags.filetype,
                tags.bpm,
                now,
                tags.mtime,
                tags.album_gain,
                tags.album_peak_gain,
                tags.track_gain,
                tags.track_peak_gain,
            ],
        )?;
        self.tracks_added += 1;
        Ok(())
    }

    // ----- Images -----

    /// Stage cover images and attach them to the albums they name.
    pub fn add_images(&mut self, images: Vec<ImageTags>) -> Result<()> {
        self.setup_staging()?;
        let db = self.db.clone();
        let conn = db.lock();

        for image in images {
            let image_id = self.resolve_dimension(&conn, DimensionKind::Image, &image.path)?;
            for (artist, album) in image.albums {
                if !associate_image(&conn, image_id, &artist, &album)? {
                    self.pending_images.push((image_id, artist, album));
                }
            }
        }
        Ok(())
    }

    // ----- Commit / rollback -----

    /// Publish staging into the permanent tables and drop staging.
    pub fn commit(&mut self) -> Result<CommitSummary> {
        if !self.staged {
            if self.removed_directories.is_empty() {
                log::warn!("Commit requested but nothing was staged");
                return Ok(CommitSummary::default());
            }
            self.setup_staging()?;
        }

        let db = self.db.clone();
        let conn = db.lock();

        for (image_id, artist, album) in std::mem::take(&mut self.pending_images) {
            if !associate_image(&conn, image_id, &artist, &album)? {
                log::debug!("No album '{}' by '{}' for image {}", album, artist, image_id);
            }
        }

        match self.scan_type {
            ScanType::Incremental => {
                let removed = schema::delete_tracks_in_directories(&conn, "", &self.removed_directories)?;
                log::debug!("Removed {} tracks from rescanned directories", removed);
            }
            ScanType::Full => {
                staging::clear_content_tables(&conn)?;
                self.drop_unvisited_directories(&conn)?;
            }
        }

        let mut published = 0;
        for table in COMMIT_ORDER {
            let rows = if table.name == DIRECTORIES.name {
                staging::replace(&conn, &table)?
            } else {
                staging::publish(&conn, &table)?
            };
            log::debug!("Published {} rows into {}", rows, table.name);
            published += rows;
        }

        identity::propagate_url_changes(&conn, &self.url_changes)?;
        staging::drop_staging(&conn)?;

        if self.scan_type == ScanType::Incremental {
            prune_orphaned_dimensions(&conn)?;
        }
        prune_orphaned_urls(&conn)?;
        drop(conn);

        let summary = CommitSummary {
            directories: self.directories_added,
            tracks: self.tracks_added,
            url_changes: std::mem::take(&mut self.url_changes),
            conflicts: self.conflicts,
            changed: published > 0 || !self.removed_directories.is_empty(),
        };
        log::info!(
            "Committed {} scan: {} tracks in {} directories, {} moved/retagged, {} conflicts",
            self.scan_type.as_str(),
            summary.tracks,
            summary.directories,
            summary.url_changes.len(),
            summary.conflicts
        );
        self.reset();
        Ok(summary)
    }

    /// Discard everything staged. Permanent tables are not touched.
    pub fn rollback(&mut self) -> Result<()> {
        let db = self.db.clone();
        staging::drop_staging(&db.lock())?;
        if self.staged {
            log::info!("Rolled back {} scan", self.scan_type.as_str());
        }
        self.reset();
        Ok(())
    }

    /// A full scan sees every directory; seeded ones it never visited are gone.
    fn drop_unvisited_directories(&self, conn: &Connection) -> Result<()> {
        let visited: HashSet<i64> = self.cache.directories.values().copied().collect();
        let staged: Vec<i64> = conn
            .prepare("SELECT id FROM directories_temp")?
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        for id in staged.into_iter().filter(|id| !visited.contains(id)) {
            conn.execute("DELETE FROM directories_temp WHERE id = ?1", params![id])?;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.staged = false;
        self.cache = StagingCache::default();
        self.url_changes.clear();
        self.pending_images.clear();
        self.directories_added = 0;
        self.tracks_added = 0;
        self.conflicts = 0;
    }

    fn absolute_path(&self, device_id: i64, rpath: &str) -> PathBuf {
        self.mounts.absolute_path(device_id, rpath)
    }
}

/// Set `image_id` on staged albums matching (artist, album). An empty artist means compilation.
fn associate_image(conn: &Connection, image_id: i64, artist: &str, album: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE albums_temp SET image = ?1
         WHERE name = ?2
           AND ((?3 = '' AND artist IS NULL)
                OR artist IN (SELECT id FROM artists_temp WHERE name = ?3))",
        params![image_id, album, artist],
    )?;
    Ok(changed > 0)
}

/// Delete permanent dimension rows nothing refers to any more.
fn prune_orphaned_dimensions(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "DELETE FROM albums WHERE id NOT IN (SELECT album FROM tracks WHERE album IS NOT NULL);
         DELETE FROM artists
            WHERE id NOT IN (SELECT artist FROM tracks WHERE artist IS NOT NULL)
              AND id NOT IN (SELECT artist FROM albums WHERE artist IS NOT NULL);
         DELETE FROM genres WHERE id NOT IN (SELECT genre FROM tracks WHERE genre IS NOT NULL);
         DELETE FROM composers WHERE id NOT IN (SELECT composer FROM tracks WHERE composer IS NOT NULL);
         DELETE FROM years WHERE id NOT IN (SELECT year FROM tracks WHERE year IS NOT NULL);
         DELETE FROM images WHERE id NOT IN (SELECT image FROM albums WHERE image IS NOT NULL);",
    )?;
    Ok(())
}

/// Drop URLs of vanished directories that no track uses, and statistics of vanished URLs.
fn prune_orphaned_urls(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "DELETE FROM urls
            WHERE id NOT IN (SELECT url FROM tracks)
              AND (directory IS NULL OR directory NOT IN (SELECT id FROM directories));
         DELETE FROM statistics WHERE url NOT IN (SELECT id FROM urls);",
    )?;
    Ok(())
}

/// Directory paths are stored without a trailing separator.
fn normalize_dir(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() { path } else { trimmed }
}

/// Modification time of a directory in Unix seconds, 0 if it cannot be read.
pub fn dir_mtime(path: &Path) -> i64 {
    std::fs::metadata(path)
        .map(|m| filetime::FileTime::from_last_modification_time(&m).unix_seconds())
        .unwrap_or(0)
}

/// Check if a file is a media file based on extension
pub fn is_media_file(path: &Path) -> bool {
    let ext = match path.extension().and_then(|e| e.to_str()) {
        Some(e) => e.to_lowercase(),
        None => return false,
    };
    MEDIA_EXTENSIONS.contains(&ext.as_str())
}
