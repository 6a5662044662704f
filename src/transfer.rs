//! Filesystem side of file transfer: reading outgoing files and writing
//! incoming ones into the download directory.

use fear_core::protocol::MessageType;
use fear_core::transfer::{
    ChunkSink, CompletedTransfer, FileChunk, FileEnd, FileStart, IncomingTransfer, OutgoingFile,
    TransferError, TransferProgress, sanitize_file_name,
};
use log::{debug, info, warn};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const PART_SUFFIX: &str = ".part";
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// `report.pdf`, `report-1.pdf`, `report-2.pdf`, ...
fn candidate_name(file_name: &str, attempt: u32) -> String {
    if attempt == 0 {
        return file_name.to_owned();
    }
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}-{attempt}.{ext}"),
        _ => format!("{file_name}-{attempt}"),
    }
}

fn create_new(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Could not delete {}: {e}", path.display());
        }
    }
}

/// Sink for one incoming file.
///
/// The final name is reserved with an empty placeholder and the data goes
/// to `<name>.part`; both are created with `create_new`, so a file that
/// already exists in the download directory is never opened. Committing
/// renames the part file over the placeholder. Discarding removes only the
/// two files this sink created.
#[derive(Debug)]
pub struct FsSink {
    path: PathBuf,
    part_path: PathBuf,
    file: Option<File>,
    finished: bool,
}

impl FsSink {
    pub fn create_unique(dir: &Path, file_name: &str) -> io::Result<Self> {
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = candidate_name(file_name, attempt);
            let path = dir.join(&name);
            match create_new(&path) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
            let part_path = dir.join(format!("{name}{PART_SUFFIX}"));
            match create_new(&part_path) {
                Ok(file) => {
                    return Ok(Self {
                        path,
                        part_path,
                        file: Some(file),
                        finished: false,
                    });
                }
                Err(e) => {
                    remove_quietly(&path);
                    if e.kind() != io::ErrorKind::AlreadyExists {
                        return Err(e);
                    }
                }
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free name for {file_name}"),
        ))
    }

    /// Where the file ends up once committed.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChunkSink for FsSink {
    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("sink already closed"))?;
        file.write_all(data)
    }

    fn commit(&mut self) -> io::Result<()> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| io::Error::other("sink already closed"))?;
        file.flush()?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&self.part_path, &self.path)?;
        self.finished = true;
        Ok(())
    }

    fn discard(&mut self) {
        if self.finished {
            return;
        }
        self.file.take();
        self.finished = true;
        remove_quietly(&self.part_path);
        remove_quietly(&self.path);
    }
}

/// Reads `path` and prepares it for sending under its base name.
pub async fn load_outgoing(path: &Path) -> Result<OutgoingFile, TransferError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TransferError::InvalidFileName(path.display().to_string()))?
        .to_owned();
    let data = tokio::fs::read(path).await?;
    OutgoingFile::new(&name, data)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Started { file_name: String, total: u64 },
    Progress { file_name: String, progress: TransferProgress },
    Completed(CompletedTransfer),
    /// Nothing to do, e.g. a chunk with no transfer in progress.
    Ignored,
}

#[derive(Debug)]
pub struct ReceiveFailure {
    pub file_name: Option<String>,
    pub error: TransferError,
}

/// Receives at most one file at a time into `download_dir`.
///
/// All methods do blocking filesystem work; the control session drives a
/// receiver from the blocking thread pool.
pub struct FileReceiver {
    download_dir: PathBuf,
    active: Option<IncomingTransfer<FsSink>>,
}

impl FileReceiver {
    pub fn new(download_dir: PathBuf) -> Self {
        Self {
            download_dir,
            active: None,
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn is_receiving(&self) -> bool {
        self.active.is_some()
    }

    pub fn handle(
        &mut self,
        msg_type: MessageType,
        sender: &str,
        payload: &[u8],
    ) -> Result<ReceiveOutcome, ReceiveFailure> {
        match msg_type {
            MessageType::FileStart => self.on_start(sender, payload),
            MessageType::FileChunk => self.on_chunk(payload),
            MessageType::FileEnd => self.on_end(payload),
            _ => Ok(ReceiveOutcome::Ignored),
        }
    }

    fn on_start(&mut self, sender: &str, payload: &[u8]) -> Result<ReceiveOutcome, ReceiveFailure> {
        if let Some(previous) = self.active.take() {
            warn!(
                "New file from {sender} while {} was incomplete, discarding it",
                previous.state().file_name
            );
            previous.abort();
        }
        let fail = |file_name: Option<String>, error: TransferError| ReceiveFailure { file_name, error };

        let start = FileStart::decode(payload).map_err(|e| fail(None, e))?;
        let file_name = sanitize_file_name(&start.name).map_err(|e| fail(Some(start.name.clone()), e))?;
        std::fs::create_dir_all(&self.download_dir)
            .map_err(|e| fail(Some(file_name.clone()), e.into()))?;
        let sink = FsSink::create_unique(&self.download_dir, &file_name)
            .map_err(|e| fail(Some(file_name.clone()), e.into()))?;
        let destination = sink.path().to_path_buf();

        info!("Receiving {file_name} ({} bytes) from {sender}", start.size);
        self.active = Some(IncomingTransfer::begin(&start, file_name.clone(), destination, sink));
        Ok(ReceiveOutcome::Started {
            file_name,
            total: start.size as u64,
        })
    }

    fn on_chunk(&mut self, payload: &[u8]) -> Result<ReceiveOutcome, ReceiveFailure> {
        let Some(transfer) = self.active.as_mut() else {
            debug!("File chunk with no transfer in progress");
            return Ok(ReceiveOutcome::Ignored);
        };
        let file_name = transfer.state().file_name.clone();
        let result = FileChunk::decode(payload).and_then(|chunk| transfer.on_chunk(&chunk));
        match result {
            Ok(progress) => Ok(ReceiveOutcome::Progress {
                file_name,
                progress,
            }),
            Err(error) => {
                if let Some(transfer) = self.active.take() {
                    // Malformed payloads have not discarded yet.
                    transfer.abort();
                }
                Err(ReceiveFailure {
                    file_name: Some(file_name),
                    error,
                })
            }
        }
    }

    fn on_end(&mut self, payload: &[u8]) -> Result<ReceiveOutcome, ReceiveFailure> {
        let Some(transfer) = self.active.take() else {
            debug!("File end with no transfer in progress");
            return Ok(ReceiveOutcome::Ignored);
        };
        let file_name = transfer.state().file_name.clone();
        let end = match FileEnd::decode(payload) {
            Ok(end) => end,
            Err(error) => {
                transfer.abort();
                return Err(ReceiveFailure {
                    file_name: Some(file_name),
                    error,
                });
            }
        };
        match transfer.finish(&end) {
            Ok(done) => {
                info!("Received {} ({} bytes)", done.destination.display(), done.size);
                Ok(ReceiveOutcome::Completed(done))
            }
            Err(error) => Err(ReceiveFailure {
                file_name: Some(file_name),
                error,
            }),
        }
    }
}

impl Drop for FileReceiver {
    fn drop(&mut self) {
        if let Some(transfer) = self.active.take() {
            transfer.abort();
        }
    }
}
