//! Chunked file transfer with CRC-32 verification.
//!
//! The sender announces name, size and whole-file CRC, then streams chunks
//! each carrying its own CRC, then repeats the whole-file CRC. The receiver
//! verifies every chunk, folds it into a running CRC and only commits the
//! output once the final CRC matches.

pub mod crc;
pub mod payload;

use std::io;
use std::path::PathBuf;

use log::{debug, warn};
use thiserror::Error;

pub use crc::{RunningCrc, checksum};
pub use payload::{FileChunk, FileEnd, FileStart, sanitize_file_name};

use crate::protocol::FILE_CHUNK_SIZE;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("malformed file transfer payload: {0}")]
    Malformed(&'static str),
    #[error("file name too long: {0} bytes")]
    NameTooLong(usize),
    #[error("invalid file name {0:?}")]
    InvalidFileName(String),
    #[error("refusing to send an empty file")]
    EmptyFile,
    #[error("file too large to send: {0} bytes")]
    TooLarge(u64),
    #[error("chunk checksum mismatch (expected {expected:08x}, got {actual:08x})")]
    ChunkCrcMismatch { expected: u32, actual: u32 },
    #[error("file checksum mismatch (expected {expected:08x}, got {actual:08x})")]
    FileCrcMismatch { expected: u32, actual: u32 },
    #[error("received {received} bytes but {announced} were announced")]
    Overflow { announced: u32, received: u64 },
    #[error("transfer ended after {received} of {announced} bytes")]
    Incomplete { announced: u32, received: u64 },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransferError {
    /// Integrity failures abort the transfer and delete partial output.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::ChunkCrcMismatch { .. }
                | Self::FileCrcMismatch { .. }
                | Self::Overflow { .. }
                | Self::Incomplete { .. }
        )
    }
}

/// Sequential byte sink receiving a file's contents.
pub trait ChunkSink {
    fn append(&mut self, data: &[u8]) -> io::Result<()>;
    /// Makes the written bytes durable under their final name.
    fn commit(&mut self) -> io::Result<()>;
    /// Deletes whatever was written. Best effort.
    fn discard(&mut self);
}

/// Receiver-side bookkeeping for one in-flight file.
#[derive(Debug, Clone)]
pub struct FileTransferState {
    pub file_name: String,
    pub destination: PathBuf,
    pub total_size: u32,
    pub bytes_received: u64,
    pub running_crc: RunningCrc,
    pub expected_crc: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTransfer {
    pub file_name: String,
    pub destination: PathBuf,
    pub size: u64,
    pub crc: u32,
}

/// A file being received into `S`.
///
/// After any error the partial output has already been discarded and the
/// transfer must be dropped.
pub struct IncomingTransfer<S: ChunkSink> {
    state: FileTransferState,
    sink: S,
}

impl<S: ChunkSink> IncomingTransfer<S> {
    pub fn begin(start: &FileStart, file_name: String, destination: PathBuf, sink: S) -> Self {
        debug!(
            "Receiving {file_name} ({} bytes, crc {:08x})",
            start.size, start.crc
        );
        Self {
            state: FileTransferState {
                file_name,
                destination,
                total_size: start.size,
                bytes_received: 0,
                running_crc: RunningCrc::new(),
                expected_crc: start.crc,
            },
            sink,
        }
    }

    pub fn state(&self) -> &FileTransferState {
        &self.state
    }

    fn fail(&mut self, err: TransferError) -> TransferError {
        warn!("Aborting transfer of {}: {err}", self.state.file_name);
        self.sink.discard();
        err
    }

    pub fn on_chunk(&mut self, chunk: &FileChunk<'_>) -> Result<TransferProgress, TransferError> {
        let actual = checksum(chunk.data);
        if actual != chunk.crc {
            return Err(self.fail(TransferError::ChunkCrcMismatch {
                expected: chunk.crc,
                actual,
            }));
        }
        let received = self.state.bytes_received + chunk.data.len() as u64;
        if received > self.state.total_size as u64 {
            return Err(self.fail(TransferError::Overflow {
                announced: self.state.total_size,
                received,
            }));
        }
        if let Err(e) = self.sink.append(chunk.data) {
            return Err(self.fail(e.into()));
        }
        self.state.running_crc.update(chunk.data);
        self.state.bytes_received = received;
        Ok(TransferProgress {
            bytes: received,
            total: self.state.total_size as u64,
        })
    }

    /// Verifies the accumulated CRC against both announced values and
    /// commits or discards the output.
    pub fn finish(mut self, end: &FileEnd) -> Result<CompletedTransfer, TransferError> {
        if self.state.bytes_received != self.state.total_size as u64 {
            return Err(self.fail(TransferError::Incomplete {
                announced: self.state.total_size,
                received: self.state.bytes_received,
            }));
        }
        let actual = self.state.running_crc.finalize();
        if actual != end.crc || actual != self.state.expected_crc {
            let expected = if actual != end.crc { end.crc } else { self.state.expected_crc };
            return Err(self.fail(TransferError::FileCrcMismatch { expected, actual }));
        }
        if let Err(e) = self.sink.commit() {
            return Err(self.fail(e.into()));
        }
        Ok(CompletedTransfer {
            file_name: self.state.file_name.clone(),
            destination: self.state.destination.clone(),
            size: self.state.bytes_received,
            crc: actual,
        })
    }

    /// Drops the transfer, deleting partial output.
    pub fn abort(mut self) {
        self.sink.discard();
    }
}

/// A file prepared for sending.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    start: FileStart,
    data: Vec<u8>,
}

impl OutgoingFile {
    pub fn new(name: &str, data: Vec<u8>) -> Result<Self, TransferError> {
        if data.is_empty() {
            return Err(TransferError::EmptyFile);
        }
        let size = u32::try_from(data.len()).map_err(|_| TransferError::TooLarge(data.len() as u64))?;
        let name = sanitize_file_name(name)?;
        let start = FileStart {
            name,
            size,
            crc: checksum(&data),
        };
        // Validate the announced name once, up front.
        start.encode()?;
        Ok(Self { start, data })
    }

    pub fn start(&self) -> &FileStart {
        &self.start
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn start_payload(&self) -> Result<Vec<u8>, TransferError> {
        self.start.encode()
    }

    /// Chunk payloads paired with the byte count sent once each is delivered.
    pub fn chunk_payloads(&self) -> impl Iterator<Item = (Vec<u8>, u64)> + '_ {
        let mut sent = 0u64;
        self.data.chunks(FILE_CHUNK_SIZE).map(move |data| {
            sent += data.len() as u64;
            let payload = FileChunk {
                crc: checksum(data),
                data,
            }
            .encode();
            (payload, sent)
        })
    }

    pub fn end_payload(&self) -> Vec<u8> {
        FileEnd {
            crc: self.start.crc,
        }
        .encode()
    }
}
