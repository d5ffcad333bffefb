// Scanner subprocess: command line contract, process control and stdout pumping

pub mod checkpoint;

use std::ffi::OsString;
use std::io::{ErrorKind, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use crate::constants::SCANNER_READ_CHUNK;
use crate::error::{CollectionError, Result};
use crate::scan::ScanType;

/// How a scanner process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Exited on its own with this status code
    Normal(i32),
    /// Terminated abnormally (signal, crash)
    Crashed,
    /// Terminated by us
    Killed,
}

/// Arguments for one scanner invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannerArgs {
    pub scan_type: ScanType,
    pub recursive: bool,
    pub charset_detection: bool,
    /// Re-attach to the scan a crashed scanner left behind
    pub resume: bool,
    pub save_location: PathBuf,
    pub collection_id: String,
    pub pid: u32,
    pub mtime_file: Option<PathBuf>,
    pub folders: Vec<PathBuf>,
}

impl ScannerArgs {
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["--nocrashhandler".into()];

        args.push(match self.scan_type {
            ScanType::Full => "-p".into(),
            ScanType::Incremental => "-i".into(),
        });
        if self.recursive {
            args.push("-r".into());
        }
        if self.charset_detection {
            args.push("-c".into());
        }
        if self.resume {
            args.push("-s".into());
        }

        args.push("--savelocation".into());
        args.push(self.save_location.clone().into_os_string());
        args.push("--collectionid".into());
        args.push(self.collection_id.clone().into());
        args.push("--pid".into());
        args.push(self.pid.to_string().into());

        if let Some(mtime_file) = &self.mtime_file {
            args.push("--mtime".into());
            args.push(mtime_file.clone().into_os_string());
        }

        // A resumed scanner picks its folder list up from the save location
        if !self.resume {
            args.extend(self.folders.iter().map(|f| f.clone().into_os_string()));
        }
        args
    }

    /// The same logical scan, restarted after a crash.
    pub fn resumed(&self) -> Self {
        Self {
            resume: true,
            ..self.clone()
        }
    }
}

/// A running scanner.
pub trait ScannerProcess: Send {
    /// Hand out stdout once; later calls return None.
    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>>;
    fn kill(&mut self) -> Result<()>;
    /// Block until the process ends.
    fn wait(&mut self) -> Result<ExitKind>;
    /// The exit, if the process has already ended.
    fn try_wait(&mut self) -> Result<Option<ExitKind>>;
}

/// Starts scanner processes.
pub trait ScannerLauncher: Send + Sync {
    fn launch(&self, args: &ScannerArgs) -> Result<Box<dyn ScannerProcess>>;
}

/// Launches the real scanner binary.
pub struct ProcessLauncher {
    path: PathBuf,
}

impl ProcessLauncher {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl ScannerLauncher for ProcessLauncher {
    fn launch(&self, args: &ScannerArgs) -> Result<Box<dyn ScannerProcess>> {
        log::info!("Starting scanner {} {:?}", self.path.display(), args.to_args());
        let child = Command::new(&self.path)
            .args(args.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                CollectionError::Scanner(format!("Failed to start {}: {}", self.path.display(), e))
            })?;
        Ok(Box::new(ChildProcess { child, killed: false }))
    }
}

struct ChildProcess {
    child: Child,
    killed: bool,
}

impl ScannerProcess for ChildProcess {
    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        self.child
            .stdout
            .take()
            .map(|s| Box::new(s) as Box<dyn Read + Send>)
    }

    fn kill(&mut self) -> Result<()> {
        self.killed = true;
        match self.child.kill() {
            Ok(()) => Ok(()),
            // Already exited
            Err(e) if e.kind() == ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn wait(&mut self) -> Result<ExitKind> {
        let status = self.child.wait()?;
        Ok(self.exit_kind(status))
    }

    fn try_wait(&mut self) -> Result<Option<ExitKind>> {
        let status = self.child.try_wait()?;
        Ok(status.map(|status| self.exit_kind(status)))
    }
}

impl ChildProcess {
    fn exit_kind(&self, status: ExitStatus) -> ExitKind {
        if self.killed {
            return ExitKind::Killed;
        }
        match status.code() {
            Some(code) => ExitKind::Normal(code),
            None => ExitKind::Crashed,
        }
    }
}

/// The scanner currently attached to a scan. Shared between the scan worker and abort.
pub type ProcessSlot = Arc<Mutex<Option<Box<dyn ScannerProcess>>>>;

/// Output of one scanner process, tagged with its launch generation so that
/// bytes from a replaced process can be told apart from the current one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScannerOutput {
    Data { generation: u32, bytes: Vec<u8> },
    Eof { generation: u32 },
}

/// Pump a scanner's stdout into the bounded output channel until EOF.
pub fn spawn_reader(
    generation: u32,
    mut stdout: Box<dyn Read + Send>,
    tx: Sender<ScannerOutput>,
) -> Result<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name(format!("scanner-reader-{}", generation))
        .spawn(move || {
            let mut buf = vec![0u8; SCANNER_READ_CHUNK];
            loop {
                match stdout.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let msg = ScannerOutput::Data {
                            generation,
                            bytes: buf[..n].to_vec(),
                        };
                        if tx.send(msg).is_err() {
                            // Scan worker is gone
                            return;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::warn!("Scanner stdout read failed: {}", e);
                        break;
                    }
                }
            }
            let _ = tx.send(ScannerOutput::Eof { generation });
        })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_args() -> ScannerArgs {
        ScannerArgs {
            scan_type: ScanType::Incremental,
            recursive: true,
            charset_detection: false,
            resume: false,
            save_location: PathBuf::from("/tmp/save"),
            collection_id: "abc".to_string(),
            pid: 42,
            mtime_file: Some(PathBuf::from("/tmp/save/collection_scan.mtime")),
            folders: vec![PathBuf::from("/music/a"), PathBuf::from("/music/b")],
        }
    }

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().to_string()).collect()
    }

    #[test]
    fn test_incremental_args() {
        let args = strings(&sample_args().to_args());
        assert_eq!(
            args,
            vec![
                "--nocrashhandler", "-i", "-r", "--savelocation", "/tmp/save",
                "--collectionid", "abc", "--pid", "42",
                "--mtime", "/tmp/save/collection_scan.mtime",
                "/music/a", "/music/b",
            ]
        );
    }

    #[test]
    fn test_resumed_args_keep_mode_and_drop_folders() {
        let args = sample_args();
        let resumed = args.resumed();
        let out = strings(&resumed.to_args());
        assert!(out.contains(&"-s".to_string()));
        assert!(out.contains(&"-i".to_string()), "Resume must keep the incremental flag");
        assert!(out.contains(&"--collectionid".to_string()));
        assert!(!out.contains(&"/music/a".to_string()));
    }

    #[test]
    fn test_full_scan_flags() {
        let args = ScannerArgs {
            scan_type: ScanType::Full,
            recursive: false,
            charset_detection: true,
            mtime_file: None,
            ..sample_args()
        };
        let out = strings(&args.to_args());
        assert!(out.contains(&"-p".to_string()));
        assert!(out.contains(&"-c".to_string()));
        assert!(!out.contains(&"-r".to_string()));
        assert!(!out.contains(&"--mtime".to_string()));
    }

    #[test]
    fn test_reader_forwards_chunks_then_eof() {
        let (tx, rx) = crossbeam_channel::bounded(4);
        let stdout: Box<dyn Read + Send> = Box::new(Cursor::new(b"hello\nworld\n".to_vec()));
        let handle = spawn_reader(7, stdout, tx).unwrap();

        let mut data = Vec::new();
        loop {
            match rx.recv().unwrap() {
                ScannerOutput::Data { generation, bytes } => {
                    assert_eq!(generation, 7);
                    data.extend(bytes);
                }
                ScannerOutput::Eof { generation } => {
                    assert_eq!(generation, 7);
                    break;
                }
            }
        }
        handle.join().unwrap();
        assert_eq!(data, b"hello\nworld\n");
    }
}
