// Dimension registry: shared read/insert cache over the permanent dimension tables
//
// Records live in per-kind arenas keyed by row id. Albums and tracks refer to
// other records by plain id. Garbage collection is a reachability sweep: a record
// survives while a cached track (or album) refers to it, or while it was used
// since the previous pass.

mod arena;

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use arena::Arena;

use crate::db::Database;
use crate::error::Result;
use crate::mount::MountPointResolver;

/// Dimension tables that hold a single name (or path) column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DimensionKind {
    Artist,
    Genre,
    Composer,
    Year,
    Image,
}

impl DimensionKind {
    pub fn table(&self) -> &'static str {
        match self {
            DimensionKind::Artist => "artists",
            DimensionKind::Genre => "genres",
            DimensionKind::Composer => "composers",
            DimensionKind::Year => "years",
            DimensionKind::Image => "images",
        }
    }

    pub fn column(&self) -> &'static str {
        match self {
            DimensionKind::Image => "path",
            _ => "name",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionEntry {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumEntry {
    pub id: i64,
    pub name: String,
    /// None for compilations
    pub artist_id: Option<i64>,
    pub image_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackEntry {
    pub track_id: i64,
    pub url_id: i64,
    pub path: PathBuf,
    pub unique_id: Option<String>,
    pub title: Option<String>,
    pub artist_id: Option<i64>,
    pub album_id: Option<i64>,
    pub genre_id: Option<i64>,
    pub composer_id: Option<i64>,
    pub year_id: Option<i64>,
}

/// Why a garbage collection pass did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcSkip {
    ScanRunning,
    /// Another thread held one of the registry locks
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcOutcome {
    Skipped(GcSkip),
    Swept { evicted: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub tracks: usize,
    pub albums: usize,
    pub artists: usize,
    pub genres: usize,
    pub composers: usize,
    pub years: usize,
    pub images: usize,
}

pub struct Registry {
    db: Database,
    mounts: Arc<dyn MountPointResolver>,
    // Lock order for anything taking more than one: tracks, albums, artists, years, genres, composers, images
    tracks: Mutex<Arena<String, TrackEntry>>,
    albums: Mutex<Arena<(String, Option<i64>), AlbumEntry>>,
    artists: Mutex<Arena<String, DimensionEntry>>,
    years: Mutex<Arena<String, DimensionEntry>>,
    genres: Mutex<Arena<String, DimensionEntry>>,
    composers: Mutex<Arena<String, DimensionEntry>>,
    images: Mutex<Arena<String, DimensionEntry>>,
}

impl Registry {
    pub fn new(db: Database, mounts: Arc<dyn MountPointResolver>) -> Self {
        Self {
            db,
            mounts,
            tracks: Mutex::new(Arena::new()),
            albums: Mutex::new(Arena::new()),
            artists: Mutex::new(Arena::new()),
            years: Mutex::new(Arena::new()),
            genres: Mutex::new(Arena::new()),
            composers: Mutex::new(Arena::new()),
            images: Mutex::new(Arena::new()),
        }
    }

    fn arena(&self, kind: DimensionKind) -> &Mutex<Arena<String, DimensionEntry>> {
        match kind {
            DimensionKind::Artist => &self.artists,
            DimensionKind::Genre => &self.genres,
            DimensionKind::Composer => &self.composers,
            DimensionKind::Year => &self.years,
            DimensionKind::Image => &self.images,
        }
    }

    // ----- Dimensions -----

    /// Id of the named dimension row, inserting it into the permanent table if needed.
    pub fn dimension_id(&self, kind: DimensionKind, name: &str) -> Result<i64> {
        let mut arena = self.arena(kind).lock();
        if let Some(entry) = arena.get_by_key(&name.to_string()) {
            return Ok(entry.id);
        }

        let id = insert_or_lookup(&self.db.lock(), kind, name)?;
        arena.insert(id, name.to_string(), DimensionEntry { id, name: name.to_string() });
        Ok(id)
    }

    /// Dimension row by id, from cache or database.
    pub fn dimension(&self, kind: DimensionKind, id: i64) -> Result<Option<DimensionEntry>> {
        let mut arena = self.arena(kind).lock();
        if let Some(entry) = arena.get(id) {
            return Ok(Some(entry.clone()));
        }

        let name: Option<String> = self.db.lock().query_row(
            &format!("SELECT {} FROM {} WHERE id = ?1", kind.column(), kind.table()),
            params![id],
            |row| row.get(0),
        ).optional()?;

        Ok(name.map(|name| {
            let entry = DimensionEntry { id, name: name.clone() };
            arena.insert(id, name, entry.clone());
            entry
        }))
    }

    // ----- Albums -----

    /// Id of the album (name, album artist), inserting it if needed. `artist_id` None means compilation.
    pub fn album_id(&self, name: &str, artist_id: Option<i64>) -> Result<i64> {
        let key = (name.to_string(), artist_id);
        let mut arena = self.albums.lock();
        if let Some(entry) = arena.get_by_key(&key) {
            return Ok(entry.id);
        }

        let conn = self.db.lock();
        conn.execute(
            "INSERT OR IGNORE INTO albums (name, artist) VALUES (?1, ?2)",
            params![name, artist_id],
        )?;
        let (id, image_id): (i64, Option<i64>) = conn.query_row(
            "SELECT id, image FROM albums WHERE name = ?1 AND COALESCE(artist, -1) = COALESCE(?2, -1)",
            params![name, artist_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        arena.insert(id, key, AlbumEntry { id, name: name.to_string(), artist_id, image_id });
        Ok(id)
    }

    pub fn album(&self, id: i64) -> Result<Option<AlbumEntry>> {
        let mut arena = self.albums.lock();
        if let Some(entry) = arena.get(id) {
            return Ok(Some(entry.clone()));
        }

        let entry = self.db.lock().query_row(
            "SELECT id, name, artist, image FROM albums WHERE id = ?1",
            params![id],
            |row| {
                Ok(AlbumEntry {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    artist_id: row.get(2)?,
                    image_id: row.get(3)?,
                })
            },
        ).optional()?;

        if let Some(entry) = &entry {
            arena.insert(entry.id, (entry.name.clone(), entry.artist_id), entry.clone());
        }
        Ok(entry)
    }

    // ----- Tracks -----

    pub fn track_by_unique_id(&self, unique_id: &str) -> Result<Option<TrackEntry>> {
        let mut arena = self.tracks.lock();
        if let Some(entry) = arena.get_by_key(&unique_id.to_string()) {
            return Ok(Some(entry.clone()));
        }
        let entry = self.load_track("u.uniqueid = ?1", unique_id)?;
        Ok(entry.map(|e| cache_track(&mut arena, e)))
    }

    pub fn track_by_url(&self, url_id: i64) -> Result<Option<TrackEntry>> {
        let mut arena = self.tracks.lock();
        if let Some(entry) = arena.get(url_id) {
            return Ok(Some(entry.clone()));
        }
        let entry = self.load_track("u.id = ?1", url_id)?;
        Ok(entry.map(|e| cache_track(&mut arena, e)))
    }

    fn load_track<P: rusqlite::ToSql>(&self, filter: &str, value: P) -> Result<Option<TrackEntry>> {
        let conn = self.db.lock();
        let row = conn.query_row(
            &format!(
                "SELECT t.id, u.id, u.deviceid, u.rpath, u.uniqueid, t.title,
                        t.artist, t.album, t.genre, t.composer, t.year
                 FROM tracks t JOIN urls u ON u.id = t.url WHERE {}",
                filter
            ),
            params![value],
            |row| {
                Ok((
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    TrackEntry {
                        track_id: row.get(0)?,
                        url_id: row.get(1)?,
                        path: PathBuf::new(),
                        unique_id: row.get(4)?,
                        title: row.get(5)?,
                        artist_id: row.get(6)?,
                        album_id: row.get(7)?,
                        genre_id: row.get(8)?,
                        composer_id: row.get(9)?,
                        year_id: row.get(10)?,
                    },
                ))
            },
        ).optional()?;

        Ok(row.map(|(device_id, rpath, mut entry)| {
            entry.path = self.mounts.absolute_path(device_id, &rpath);
            entry
        }))
    }

    // ----- Coherence -----

    /// Forget everything cached. Called whenever the permanent tables were rewritten.
    pub fn invalidate(&self) {
        self.tracks.lock().clear();
        self.albums.lock().clear();
        self.artists.lock().clear();
        self.years.lock().clear();
        self.genres.lock().clear();
        self.composers.lock().clear();
        self.images.lock().clear();
        log::debug!("Registry cache invalidated");
    }

    /// Evict cached records nothing refers to. Gives up immediately if any lock is taken.
    pub fn collect_garbage(&self, scan_running: bool) -> GcOutcome {
        if scan_running {
            return GcOutcome::Skipped(GcSkip::ScanRunning);
        }

        // Guards acquired so far are released on early return
        let Some(mut tracks) = self.tracks.try_lock() else { return busy() };
        let Some(mut albums) = self.albums.try_lock() else { return busy() };
        let Some(mut artists) = self.artists.try_lock() else { return busy() };
        let Some(mut years) = self.years.try_lock() else { return busy() };
        let Some(mut genres) = self.genres.try_lock() else { return busy() };
        let Some(mut composers) = self.composers.try_lock() else { return busy() };
        let Some(mut images) = self.images.try_lock() else { return busy() };

        let mut evicted = tracks.sweep(|_| false);

        let live_tracks: Vec<&TrackEntry> = tracks.values().collect();
        let referenced = |f: fn(&TrackEntry) -> Option<i64>| -> Vec<i64> {
            live_tracks.iter().filter_map(|t| f(t)).collect()
        };
        let track_albums = referenced(|t| t.album_id);
        let track_artists = referenced(|t| t.artist_id);
        let track_years = referenced(|t| t.year_id);
        let track_genres = referenced(|t| t.genre_id);
        let track_composers = referenced(|t| t.composer_id);

        evicted += albums.sweep(|id| track_albums.contains(&id));

        let album_artists: Vec<i64> = albums.values().filter_map(|a| a.artist_id).collect();
        let album_images: Vec<i64> = albums.values().filter_map(|a| a.image_id).collect();

        evicted += artists.sweep(|id| track_artists.contains(&id) || album_artists.contains(&id));
        evicted += years.sweep(|id| track_years.contains(&id));
        evicted += genres.sweep(|id| track_genres.contains(&id));
        evicted += composers.sweep(|id| track_composers.contains(&id));
        evicted += images.sweep(|id| album_images.contains(&id));

        log::debug!("Registry GC evicted {} records", evicted);
        GcOutcome::Swept { evicted }
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            tracks: self.tracks.lock().len(),
            albums: self.albums.lock().len(),
            artists: self.artists.lock().len(),
            years: self.years.lock().len(),
            genres: self.genres.lock().len(),
            composers: self.composers.lock().len(),
            images: self.images.lock().len(),
        }
    }
}

fn busy() -> GcOutcome {
    log::debug!("Registry GC skipped: cache in use");
    GcOutcome::Skipped(GcSkip::Busy)
}

fn cache_track(arena: &mut Arena<String, TrackEntry>, entry: TrackEntry) -> TrackEntry {
    let key = entry.unique_id.clone().unwrap_or_else(|| format!("url:{}", entry.url_id));
    arena.insert(entry.url_id, key, entry.clone());
    entry
}

fn insert_or_lookup(conn: &Connection, kind: DimensionKind, name: &str) -> Result<i64> {
    conn.execute(
        &format!("INSERT OR IGNORE INTO {} ({}) VALUES (?1)", kind.table(), kind.column()),
        params![name],
    )?;
    let id = conn.query_row(
        &format!("SELECT id FROM {} WHERE {} = ?1", kind.table(), kind.column()),
        params![name],
        |row| row.get(0),
    )?;
    Ok(id)
}
