// Incremental scan planning: which known directories changed since their last scan

use std::path::{Path, PathBuf};

use rusqlite::Connection;

use crate::db::schema::{self, DirectoryRow};
use crate::error::Result;
use crate::mount::MountPointResolver;
use crate::processor::dir_mtime;

/// What an incremental scan has to look at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncrementalPlan {
    /// Folders handed to the scanner: changed and deleted directories
    pub scan_dirs: Vec<PathBuf>,
    /// Permanent directory ids whose tracks the scan replaces
    pub removed_directories: Vec<i64>,
    /// Unchanged directories with their watermark, for the mtime manifest
    pub known_good: Vec<(PathBuf, i64)>,
    pub changed: usize,
    pub deleted: usize,
}

impl IncrementalPlan {
    pub fn is_empty(&self) -> bool {
        self.scan_dirs.is_empty()
    }

    fn mark(&mut self, row: &DirectoryRow, path: PathBuf) {
        self.removed_directories.push(row.id);
        self.scan_dirs.push(path);
    }
}

/// Compare every known directory on a mounted device against the filesystem.
pub fn plan_incremental(conn: &Connection, mounts: &dyn MountPointResolver) -> Result<IncrementalPlan> {
    let mut plan = IncrementalPlan::default();

    for row in schema::list_directories(conn, &mounts.mounted_device_ids())? {
        let path = mounts.absolute_path(row.device_id, &row.rpath);
        if !path.is_dir() {
            log::debug!("Directory gone: {}", path.display());
            plan.deleted += 1;
            plan.mark(&row, path);
            continue;
        }

        let mtime = dir_mtime(&path);
        if mtime != row.changedate {
            log::debug!("Directory changed: {} ({} -> {})", path.display(), row.changedate, mtime);
            plan.changed += 1;
            plan.mark(&row, path);
        } else {
            plan.known_good.push((path, row.changedate));
        }
    }

    log::info!(
        "Incremental plan: {} changed, {} deleted, {} unchanged",
        plan.changed,
        plan.deleted,
        plan.known_good.len()
    );
    Ok(plan)
}

/// Plan for rescanning one directory. None if it is not part of the collection.
pub fn plan_single(conn: &Connection, mounts: &dyn MountPointResolver, dir: &Path) -> Result<Option<IncrementalPlan>> {
    // Drops a trailing separator
    let dir: PathBuf = dir.components().collect();
    let device = mounts.device_id(&dir);
    let rpath = mounts.relative_path(device, &dir);

    let Some(row) = schema::find_directory(conn, device, &rpath)? else {
        return Ok(None);
    };

    let mut plan = IncrementalPlan::default();
    if dir.is_dir() {
        plan.changed = 1;
    } else {
        plan.deleted = 1;
    }
    plan.mark(&row, dir);
    Ok(Some(plan))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations;
    use crate::mount::LocalMounts;
    use filetime::{set_file_mtime, FileTime};
    use rusqlite::params;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Connection) {
        let tmp = TempDir::new().unwrap();
        let conn = Connection::open_in_memory().unwrap();
        migrations::create_schema(&conn).unwrap();
        (tmp, conn)
    }

    fn known_dir(conn: &Connection, path: &Path, changedate: i64) -> i64 {
        conn.execute(
            "INSERT INTO directories (deviceid, dir, changedate) VALUES (-1, ?1, ?2)",
            params![LocalMounts.relative_path(-1, path), changedate],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    #[test]
    fn test_unchanged_directory_goes_to_manifest() {
        let (tmp, conn) = setup();
        let dir = tmp.path().join("album");
        std::fs::create_dir(&dir).unwrap();
        set_file_mtime(&dir, FileTime::from_unix_time(1_600_000_000, 0)).unwrap();
        known_dir(&conn, &dir, 1_600_000_000);

        let plan = plan_incremental(&conn, &LocalMounts).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.known_good, vec![(dir, 1_600_000_000)]);
    }

    #[test]
    fn test_changed_and_deleted_directories_are_rescanned() {
        let (tmp, conn) = setup();
        let changed = tmp.path().join("changed");
        std::fs::create_dir(&changed).unwrap();
        set_file_mtime(&changed, FileTime::from_unix_time(1_700_000_000, 0)).unwrap();
        let changed_id = known_dir(&conn, &changed, 1_600_000_000);

        let gone = tmp.path().join("gone");
        let gone_id = known_dir(&conn, &gone, 1_600_000_000);

        let plan = plan_incremental(&conn, &LocalMounts).unwrap();
        assert_eq!(plan.changed, 1);
        assert_eq!(plan.deleted, 1);
        assert_eq!(plan.scan_dirs, vec![changed, gone]);
        assert_eq!(plan.removed_directories, vec![changed_id, gone_id]);
        assert!(plan.known_good.is_empty());
    }

    #[test]
    fn test_unmounted_devices_are_ignored() {
        let (_tmp, conn) = setup();
        conn.execute(
            "INSERT INTO directories (deviceid, dir, changedate) VALUES (7, './somewhere', 1)",
            [],
        )
        .unwrap();
        let plan = plan_incremental(&conn, &LocalMounts).unwrap();
        assert_eq!(plan, IncrementalPlan::default());
    }

    #[test]
    fn test_single_directory_must_be_known() {
        let (tmp, conn) = setup();
        let dir = tmp.path().join("album");
        std::fs::create_dir(&dir).unwrap();
        assert!(plan_single(&conn, &LocalMounts, &dir).unwrap().is_none());

        let id = known_dir(&conn, &dir, dir_mtime(&dir));
        let with_slash = PathBuf::from(format!("{}/", dir.display()));
        let plan = plan_single(&conn, &LocalMounts, &with_slash).unwrap().unwrap();
        assert_eq!(plan.removed_directories, vec![id]);
        assert_eq!(plan.scan_dirs, vec![dir]);
        assert_eq!(plan.changed, 1);
    }
}
