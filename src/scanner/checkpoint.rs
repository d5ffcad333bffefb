// Checkpoint files shared with the scanner: the mtime manifest and leftover batch files

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::constants::{FULL_BATCH_FILENAME, INCREMENTAL_BATCH_FILENAME, MTIME_FILENAME, MTIME_SEPARATOR};
use crate::error::Result;
use crate::scan::ScanType;

pub fn mtime_file_path(save_location: &Path) -> PathBuf {
    save_location.join(MTIME_FILENAME)
}

pub fn batch_file_path(save_location: &Path, scan_type: ScanType) -> PathBuf {
    match scan_type {
        ScanType::Full => save_location.join(FULL_BATCH_FILENAME),
        ScanType::Incremental => save_location.join(INCREMENTAL_BATCH_FILENAME),
    }
}

/// Write the known-good manifest: one `<dir>_AMAROKMTIME_<epoch>` line per directory.
pub fn write_mtime_file(path: &Path, entries: &[(PathBuf, i64)]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = BufWriter::new(fs::File::create(path)?);
    for (dir, mtime) in entries {
        writeln!(out, "{}{}{}", dir.to_string_lossy(), MTIME_SEPARATOR, mtime)?;
    }
    out.flush()?;
    Ok(())
}

/// Read a manifest back. Malformed lines are skipped.
#[cfg(test)]
pub fn read_mtime_file(path: &Path) -> Result<Vec<(PathBuf, i64)>> {
    use std::io::{BufRead, BufReader};

    let reader = BufReader::new(fs::File::open(path)?);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let Some((dir, mtime)) = line.rsplit_once(MTIME_SEPARATOR) else {
            log::warn!("Skipping malformed mtime line: {}", line);
            continue;
        };
        match mtime.trim().parse::<i64>() {
            Ok(mtime) => entries.push((PathBuf::from(dir), mtime)),
            Err(_) => log::warn!("Skipping malformed mtime line: {}", line),
        }
    }
    Ok(entries)
}

/// A batch file left behind by an interrupted run, full scans first.
pub fn pending_batch(save_location: &Path) -> Option<(ScanType, PathBuf)> {
    [ScanType::Full, ScanType::Incremental]
        .into_iter()
        .map(|t| (t, batch_file_path(save_location, t)))
        .find(|(_, path)| path.is_file())
}

pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_mtime_file_format() {
        let tmp = TempDir::new().unwrap();
        let path = mtime_file_path(tmp.path());
        let entries = vec![
            (PathBuf::from("/music/a"), 1_700_000_000),
            (PathBuf::from("/music/b_AMAROKMTIME_x"), 5),
        ];
        write_mtime_file(&path, &entries).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().next(), Some("/music/a_AMAROKMTIME_1700000000"));

        // The last separator splits, so odd directory names survive
        assert_eq!(read_mtime_file(&path).unwrap(), entries);
    }

    #[test]
    fn test_pending_batch_prefers_full() {
        let tmp = TempDir::new().unwrap();
        assert!(pending_batch(tmp.path()).is_none());

        let incremental = batch_file_path(tmp.path(), ScanType::Incremental);
        fs::write(&incremental, b"").unwrap();
        assert_eq!(pending_batch(tmp.path()), Some((ScanType::Incremental, incremental.clone())));

        let full = batch_file_path(tmp.path(), ScanType::Full);
        fs::write(&full, b"").unwrap();
        assert_eq!(pending_batch(tmp.path()), Some((ScanType::Full, full.clone())));

        remove_if_exists(&full).unwrap();
        remove_if_exists(&full).unwrap();
        assert_eq!(pending_batch(tmp.path()).map(|(t, _)| t), Some(ScanType::Incremental));
    }
}
