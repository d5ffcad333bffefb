// External scanner binary resolver
//
// Resolution order:
// 1) Explicit path from the scan config
// 2) Environment variable override (COLLECTIONDB_SCANNER_PATH)
// 3) Next to the executable
// 4) bin/ next to the executable
// 5) PATH fallback

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::constants::{SCANNER_BINARY, SCANNER_PATH_ENV};

/// Platform file name of an executable.
fn executable_name(name: &str) -> String {
    if cfg!(windows) && !name.to_ascii_lowercase().ends_with(".exe") {
        format!("{}.exe", name)
    } else {
        name.to_string()
    }
}

/// Install locations checked before falling back to PATH.
fn install_candidates(name: &str) -> Vec<PathBuf> {
    let Some(exe_dir) = env::current_exe().ok().and_then(|p| p.parent().map(Path::to_path_buf)) else {
        return Vec::new();
    };
    let file = executable_name(name);
    vec![exe_dir.join(&file), exe_dir.join("bin").join(&file)]
}

fn resolve_tool(configured: Option<&Path>, env_key: &str, name: &str) -> PathBuf {
    if let Some(path) = configured {
        return path.to_path_buf();
    }

    let from_env = env::var_os(env_key).map(PathBuf::from).filter(|p| p.exists());
    from_env
        .into_iter()
        .chain(install_candidates(name))
        .find(|p| p.exists())
        .unwrap_or_else(|| PathBuf::from(name))
}

/// Path to the metadata scanner binary.
pub fn scanner_path(configured: Option<&Path>) -> PathBuf {
    resolve_tool(configured, SCANNER_PATH_ENV, SCANNER_BINARY)
}

/// Run `<scanner> --version` and return the first line it prints.
pub fn scanner_version(path: &Path) -> Option<String> {
    let output = Command::new(path).arg("--version").output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
}
