// Unique-id reconciliation: keeping URL rows (and what hangs off them) stable across moves

use std::path::PathBuf;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::ScanResultProcessor;
use crate::db::schema::{map_url, UrlRow};
use crate::error::Result;

/// A URL row that changed path or unique id during the scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlChange {
    pub url_id: i64,
    pub old_path: PathBuf,
    pub new_path: PathBuf,
    pub old_unique_id: Option<String>,
    pub new_unique_id: Option<String>,
}

impl UrlChange {
    pub fn is_move(&self) -> bool {
        self.old_path != self.new_path
    }
}

fn staged_url_by_path(conn: &Connection, device_id: i64, rpath: &str) -> Result<Option<UrlRow>> {
    let row = conn.query_row(
        "SELECT id, deviceid, rpath, directory, uniqueid FROM urls_temp WHERE deviceid = ?1 AND rpath = ?2",
        params![device_id, rpath],
        map_url,
    ).optional()?;
    Ok(row)
}

fn staged_url_by_uid(conn: &Connection, unique_id: &str) -> Result<Option<UrlRow>> {
    let row = conn.query_row(
        "SELECT id, deviceid, rpath, directory, uniqueid FROM urls_temp WHERE uniqueid = ?1",
        params![unique_id],
        map_url,
    ).optional()?;
    Ok(row)
}

impl ScanResultProcessor {
    /// Find or create the staged URL row for a file.
    ///
    /// A unique-id match wins over a path match: the file was moved or renamed.
    /// A path match alone means the file was retagged with a new unique id.
    pub(super) fn resolve_url(
        &mut self,
        conn: &Connection,
        device_id: i64,
        rpath: &str,
        unique_id: &str,
        directory_id: i64,
    ) -> Result<i64> {
        let unique_id = Some(unique_id.trim()).filter(|u| !u.is_empty());

        let by_path = staged_url_by_path(conn, device_id, rpath)?;
        let by_uid = match unique_id {
            Some(uid) => staged_url_by_uid(conn, uid)?,
            None => None,
        };

        match (by_path, by_uid) {
            (None, None) => {
                conn.execute(
                    "INSERT INTO urls_temp (deviceid, rpath, directory, uniqueid) VALUES (?1, ?2, ?3, ?4)",
                    params![device_id, rpath, directory_id, unique_id],
                )?;
                Ok(conn.last_insert_rowid())
            }
            (Some(path_row), Some(uid_row)) if path_row.id == uid_row.id => {
                if path_row.directory != Some(directory_id) {
                    conn.execute(
                        "UPDATE urls_temp SET directory = ?1 WHERE id = ?2",
                        params![directory_id, path_row.id],
                    )?;
                }
                Ok(path_row.id)
            }
            (Some(path_row), Some(uid_row)) => {
                log::error!(
                    "Conflicting identities for {}: it is URL {} by path but unique id {:?} belongs to URL {} at {}",
                    rpath,
                    path_row.id,
                    unique_id,
                    uid_row.id,
                    uid_row.rpath
                );
                self.conflicts += 1;

                // The unique id wins; the row that only shared the path goes away
                conn.execute("DELETE FROM tracks_temp WHERE url = ?1", params![path_row.id])?;
                conn.execute("DELETE FROM urls_temp WHERE id = ?1", params![path_row.id])?;
                self.move_url(conn, &uid_row, device_id, rpath, directory_id)?;
                Ok(uid_row.id)
            }
            (None, Some(uid_row)) => {
                self.move_url(conn, &uid_row, device_id, rpath, directory_id)?;
                Ok(uid_row.id)
            }
            (Some(path_row), None) => {
                let retagged = unique_id.filter(|uid| path_row.unique_id.as_deref() != Some(*uid));
                if let Some(new_uid) = retagged {
                    log::debug!("URL {} retagged with unique id {}", path_row.id, new_uid);
                    conn.execute(
                        "UPDATE urls_temp SET uniqueid = ?1, directory = ?2 WHERE id = ?3",
                        params![new_uid, directory_id, path_row.id],
                    )?;
                    let path = self.absolute_path(device_id, rpath);
                    self.url_changes.push(UrlChange {
                        url_id: path_row.id,
                        old_path: path.clone(),
                        new_path: path,
                        old_unique_id: path_row.unique_id.clone(),
                        new_unique_id: Some(new_uid.to_string()),
                    });
                } else if path_row.directory != Some(directory_id) {
                    conn.execute(
                        "UPDATE urls_temp SET directory = ?1 WHERE id = ?2",
                        params![directory_id, path_row.id],
                    )?;
                }
                Ok(path_row.id)
            }
        }
    }

    fn move_url(&mut self, conn: &Connection, row: &UrlRow, device_id: i64, rpath: &str, directory_id: i64) -> Result<()> {
        conn.execute(
            "UPDATE urls_temp SET deviceid = ?1, rpath = ?2, directory = ?3 WHERE id = ?4",
            params![device_id, rpath, directory_id, row.id],
        )?;
        let old_path = self.absolute_path(row.device_id, &row.rpath);
        let new_path = self.absolute_path(device_id, rpath);
        log::info!("Track moved: {} -> {}", old_path.display(), new_path.display());
        self.url_changes.push(UrlChange {
            url_id: row.id,
            old_path,
            new_path,
            old_unique_id: row.unique_id.clone(),
            new_unique_id: row.unique_id.clone(),
        });
        Ok(())
    }
}

/// Rewrite tables that refer to tracks by path string or unique id.
pub(super) fn propagate_url_changes(conn: &Connection, changes: &[UrlChange]) -> Result<()> {
    for change in changes {
        if change.is_move() {
            conn.execute(
                "UPDATE playlist_tracks SET url = ?1 WHERE url = ?2",
                params![change.new_path.to_string_lossy(), change.old_path.to_string_lossy()],
            )?;
        }
        if let (Some(old), Some(new)) = (&change.old_unique_id, &change.new_unique_id) {
            if old != new {
                conn.execute(
                    "UPDATE playlist_tracks SET uniqueid = ?1 WHERE uniqueid = ?2",
                    params![new, old],
                )?;
            }
        }
    }
    Ok(())
}
