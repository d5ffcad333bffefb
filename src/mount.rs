// Mount point resolution: absolute paths <-> (device id, relative path)

use std::path::{Path, PathBuf};

use crate::constants::LOCAL_DEVICE_ID;

/// Maps file locations to the device they live on.
///
/// A relative path always starts with "." so it can be joined back onto a mount point.
pub trait MountPointResolver: Send + Sync {
    fn device_id(&self, path: &Path) -> i64;
    fn relative_path(&self, device_id: i64, path: &Path) -> String;
    fn absolute_path(&self, device_id: i64, rpath: &str) -> PathBuf;
    /// Devices whose directories can be checked right now.
    fn mounted_device_ids(&self) -> Vec<i64>;
}

/// Everything lives on the root filesystem under device -1.
#[derive(Debug, Default, Clone)]
pub struct LocalMounts;

impl MountPointResolver for LocalMounts {
    fn device_id(&self, _path: &Path) -> i64 {
        LOCAL_DEVICE_ID
    }

    fn relative_path(&self, _device_id: i64, path: &Path) -> String {
        format!(".{}", path.to_string_lossy())
    }

    fn absolute_path(&self, _device_id: i64, rpath: &str) -> PathBuf {
        PathBuf::from(rpath.strip_prefix('.').unwrap_or(rpath))
    }

    fn mounted_device_ids(&self) -> Vec<i64> {
        vec![LOCAL_DEVICE_ID]
    }
}

/// A fixed table of mounted volumes, longest mount point wins.
/// Paths outside every mount fall back to the local device.
#[derive(Debug, Default, Clone)]
pub struct MountTable {
    mounts: Vec<(i64, PathBuf)>,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mount(mut self, device_id: i64, mount_point: impl Into<PathBuf>) -> Self {
        self.mounts.push((device_id, mount_point.into()));
        // Longest prefix first
        self.mounts
            .sort_by(|a, b| b.1.as_os_str().len().cmp(&a.1.as_os_str().len()));
        self
    }

    fn mount_point(&self, device_id: i64) -> Option<&Path> {
        self.mounts
            .iter()
            .find(|(id, _)| *id == device_id)
            .map(|(_, p)| p.as_path())
    }
}

impl MountPointResolver for MountTable {
    fn device_id(&self, path: &Path) -> i64 {
        self.mounts
            .iter()
            .find(|(_, mount)| path.starts_with(mount))
            .map(|(id, _)| *id)
            .unwrap_or(LOCAL_DEVICE_ID)
    }

    fn relative_path(&self, device_id: i64, path: &Path) -> String {
        match self.mount_point(device_id).and_then(|m| path.strip_prefix(m).ok()) {
            Some(rest) => format!("./{}", rest.to_string_lossy()),
            None => LocalMounts.relative_path(device_id, path),
        }
    }

    fn absolute_path(&self, device_id: i64, rpath: &str) -> PathBuf {
        match self.mount_point(device_id) {
            Some(mount) => mount.join(rpath.trim_start_matches("./")),
            None => LocalMounts.absolute_path(device_id, rpath),
        }
    }

    fn mounted_device_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.mounts.iter().map(|(id, _)| *id).collect();
        ids.push(LOCAL_DEVICE_ID);
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_round_trip() {
        let mounts = LocalMounts;
        let path = Path::new("/music/a/01.mp3");
        let device = mounts.device_id(path);
        let rpath = mounts.relative_path(device, path);
        assert_eq!(device, -1);
        assert_eq!(rpath, "./music/a/01.mp3");
        assert_eq!(mounts.absolute_path(device, &rpath), path);
    }

    #[test]
    fn test_mount_table_prefers_longest_mount() {
        let mounts = MountTable::new()
            .with_mount(1, "/media")
            .with_mount(2, "/media/usb");
        let path = Path::new("/media/usb/album/01.flac");

        assert_eq!(mounts.device_id(path), 2);
        let rpath = mounts.relative_path(2, path);
        assert_eq!(rpath, "./album/01.flac");
        assert_eq!(mounts.absolute_path(2, &rpath), path);
    }

    #[test]
    fn test_mount_table_falls_back_to_local() {
        let mounts = MountTable::new().with_mount(3, "/mnt/nas");
        let path = Path::new("/home/me/song.ogg");
        assert_eq!(mounts.device_id(path), LOCAL_DEVICE_ID);
        assert_eq!(mounts.relative_path(LOCAL_DEVICE_ID, path), "./home/me/song.ogg");
        assert!(mounts.mounted_device_ids().contains(&3));
        assert!(mounts.mounted_device_ids().contains(&LOCAL_DEVICE_ID));
    }
}
