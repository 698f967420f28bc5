//! Write-ahead logging.
//!
//! A durable, append-only, generic write-ahead log. [`Wal`] persists any
//! record type implementing [`LogRecord`] with CRC32 protection, using
//! [`crate::encoding`] for serialization. Two subsystems share it: the
//! memtable (one segment per memtable, `wal-<seq>.log`) and the manifest
//! (a single fixed segment, truncated on checkpoint).
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER_BYTES][HEADER_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! ...
//! ```
//!
//! - **Header** — a [`WalHeader`] followed by a 4-byte CRC32.
//! - **Record** — a 4-byte little-endian length prefix, the encoded record
//!   bytes, and a CRC32 computed over `len || record_bytes`.
//!
//! # Guarantees
//!
//! - **Durability**: every `append()` is followed by `fsync` via
//!   [`File::sync_all`] before returning.
//! - **Integrity**: header and record checksums are verified during replay.
//! - **Corruption detection**: replay stops at the first failed checksum or
//!   truncated frame.
//!
//! The file handle is shared behind `Arc<Mutex<File>>`, so a replay
//! iterator may coexist with appenders; the iterator tracks its own logical
//! offset and seeks before each read.

#[cfg(test)]
mod tests;

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};

const U32_SIZE: usize = std::mem::size_of::<u32>();

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Data integrity failure — checksum did not match.
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// Record exceeds the configured maximum size.
    #[error("Record size exceeds limit ({0} bytes)")]
    RecordTooLarge(usize),

    /// Unexpected end-of-file during read.
    #[error("Unexpected end of file")]
    UnexpectedEof,

    /// WAL header failed integrity validation.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Internal consistency or locking error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Segment naming
// ------------------------------------------------------------------------------------------------

/// Builds the on-disk path of a memtable WAL segment: `wal-<seq>.log`.
pub fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("wal-{seq:06}.log"))
}

/// Parses the segment sequence out of a `wal-<seq>.log` file name.
///
/// Returns `None` for files that are not memtable WAL segments.
pub fn parse_segment_seq(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix("wal-")
        .and_then(|s| s.strip_suffix(".log"))
        .and_then(|s| s.parse::<u64>().ok())
}

// ------------------------------------------------------------------------------------------------
// Header
// ------------------------------------------------------------------------------------------------

/// Metadata written at the start of every WAL file.
///
/// Validates the file's identity and constraints; followed on disk by a
/// CRC32 checksum over the encoded header bytes.
#[derive(Debug)]
pub struct WalHeader {
    /// Magic constant identifying StratumDB WAL files (`b"SWAL"`).
    magic: [u8; 4],

    /// WAL format version.
    version: u32,

    /// Maximum record size in bytes.
    max_record_size: u32,

    /// Segment sequence number.
    segment_seq: u64,
}

impl WalHeader {
    /// Expected 4-byte magic constant.
    pub const MAGIC: [u8; 4] = *b"SWAL";

    /// Current supported format version.
    pub const VERSION: u32 = 1;

    /// Default maximum record size (1 MiB).
    pub const DEFAULT_MAX_RECORD_SIZE: u32 = 1024 * 1024;

    /// Encoded size of the header without the trailing CRC:
    /// `magic(4) + version(4) + max_record_size(4) + segment_seq(8)`.
    pub const ENCODED_SIZE: usize = 4 + 4 + 4 + 8;

    /// Total on-disk size of the header including its trailing CRC32.
    pub const DISK_SIZE: usize = Self::ENCODED_SIZE + U32_SIZE;

    fn new(max_record_size: u32, segment_seq: u64) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            max_record_size,
            segment_seq,
        }
    }
}

impl encoding::Encode for WalHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.magic.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.max_record_size.encode_to(buf)?;
        self.segment_seq.encode_to(buf)?;
        Ok(())
    }
}

impl encoding::Decode for WalHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (magic, n) = <[u8; 4]>::decode_from(&buf[offset..])?;
        offset += n;
        let (version, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (max_record_size, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (segment_seq, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                magic,
                version,
                max_record_size,
                segment_seq,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// LogRecord marker trait
// ------------------------------------------------------------------------------------------------

/// Trait for record types that can travel through the WAL.
///
/// A blanket impl covers every type that is [`encoding::Encode`] +
/// [`encoding::Decode`] + `Debug + Send + Sync`.
pub trait LogRecord: encoding::Encode + encoding::Decode + std::fmt::Debug + Send + Sync {}
impl<T> LogRecord for T where T: encoding::Encode + encoding::Decode + std::fmt::Debug + Send + Sync {}

// ------------------------------------------------------------------------------------------------
// Wal
// ------------------------------------------------------------------------------------------------

/// A generic, thread-safe write-ahead log.
///
/// See the [module-level documentation](self) for format and guarantees.
///
/// # Type Parameters
///
/// * `T` — any record type implementing [`LogRecord`].
#[derive(Debug)]
pub struct Wal<T: LogRecord> {
    /// Shared file handle for appenders and replay iterators.
    inner_file: Arc<Mutex<File>>,

    /// Path to the WAL file on disk.
    path: PathBuf,

    /// Persistent header with metadata and limits.
    header: WalHeader,

    _phantom: std::marker::PhantomData<T>,
}

impl<T: LogRecord> Wal<T> {
    /// Open or create a WAL file at the given path.
    ///
    /// A fresh (empty) file gets a new header with the given `segment_seq`.
    /// An existing file has its header validated: CRC, magic, version, and
    /// the expected segment sequence must all match.
    pub fn open<P: AsRef<Path>>(
        path: P,
        segment_seq: u64,
        max_record_size: Option<u32>,
    ) -> Result<Self, WalError> {
        let path_ref = path.as_ref();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path_ref)?;

        let header = if file.metadata()?.len() == 0 {
            let header = WalHeader::new(
                max_record_size.unwrap_or(WalHeader::DEFAULT_MAX_RECORD_SIZE),
                segment_seq,
            );
            write_header(&mut file, &header)?;
            file.sync_all()?;

            info!(path = %path_ref.display(), seq = segment_seq, "WAL created");
            header
        } else {
            file.seek(SeekFrom::Start(0))?;
            let header = read_and_validate_header(&mut file)?;

            if header.segment_seq != segment_seq {
                return Err(WalError::InvalidHeader(format!(
                    "segment sequence mismatch (header {}, expected {})",
                    header.segment_seq, segment_seq
                )));
            }

            debug!(
                path = %path_ref.display(),
                seq = header.segment_seq,
                "WAL header validated"
            );
            header
        };

        Ok(Self {
            inner_file: Arc::new(Mutex::new(file)),
            path: path_ref.to_path_buf(),
            header,
            _phantom: std::marker::PhantomData,
        })
    }

    /// Appends a single record and fsyncs before returning.
    ///
    /// The record is written as `[u32 len LE][record_bytes][u32 crc32 LE]`
    /// where the CRC covers `len || record_bytes`. On any error the
    /// caller must treat the append as not durable.
    pub fn append(&self, record: &T) -> Result<(), WalError> {
        let record_bytes = encoding::encode_to_vec(record)?;
        let record_len = u32::try_from(record_bytes.len())
            .map_err(|_| WalError::RecordTooLarge(record_bytes.len()))?;

        if record_len > self.header.max_record_size {
            return Err(WalError::RecordTooLarge(record_len as usize));
        }

        let len_bytes = record_len.to_le_bytes();
        let checksum = compute_crc(&[&len_bytes, &record_bytes]);

        let mut guard = self
            .inner_file
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;

        guard.write_all(&len_bytes)?;
        guard.write_all(&record_bytes)?;
        guard.write_all(&checksum.to_le_bytes())?;
        guard.sync_all()?;

        trace!(
            len = record_len,
            crc = format_args!("{checksum:08x}"),
            "WAL record appended"
        );
        Ok(())
    }

    /// Returns an iterator that replays all records in write order.
    ///
    /// Each frame's CRC is verified before the record is decoded.
    pub fn replay_iter(&self) -> Result<WalIter<T>, WalError> {
        debug!(path = %self.path.display(), "WAL replay started");

        Ok(WalIter {
            file: Arc::clone(&self.inner_file),
            offset: WalHeader::DISK_SIZE as u64,
            max_record_size: self.header.max_record_size as usize,
            _phantom: std::marker::PhantomData,
        })
    }

    /// Truncates the WAL back to an empty segment (header only).
    ///
    /// Used by the manifest after folding the event log into a snapshot.
    pub fn truncate(&mut self) -> Result<(), WalError> {
        let mut guard = self
            .inner_file
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;

        guard.set_len(0)?;
        guard.seek(SeekFrom::Start(0))?;
        write_header(&mut *guard, &self.header)?;
        guard.sync_all()?;

        info!(path = %self.path.display(), "WAL truncated");
        Ok(())
    }

    /// Path of the underlying WAL file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Segment sequence number recorded in the header.
    pub fn segment_seq(&self) -> u64 {
        self.header.segment_seq
    }

    /// Current on-disk file size in bytes.
    pub fn file_size(&self) -> Result<u64, WalError> {
        let guard = self
            .inner_file
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;
        Ok(guard.metadata()?.len())
    }
}

impl<T: LogRecord> Drop for Wal<T> {
    fn drop(&mut self) {
        match self.inner_file.lock() {
            Ok(guard) => {
                if let Err(e) = guard.sync_all() {
                    error!(path = %self.path.display(), error = %e, "WAL sync failed on drop");
                }
            }
            Err(poisoned) => {
                let file = poisoned.into_inner();
                if let Err(e) = file.sync_all() {
                    error!(path = %self.path.display(), error = %e, "WAL sync failed on drop (poisoned lock)");
                }
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// WalIter
// ------------------------------------------------------------------------------------------------

/// Streaming WAL replay iterator.
///
/// Reads one frame at a time, verifies its CRC, and yields decoded `T`
/// values. Holds an `Arc` on the file handle, so it may outlive the
/// [`Wal`] that created it.
pub struct WalIter<T: LogRecord> {
    file: Arc<Mutex<File>>,

    /// Current byte offset within the WAL file.
    offset: u64,

    max_record_size: usize,

    _phantom: std::marker::PhantomData<T>,
}

impl<T: LogRecord> std::fmt::Debug for WalIter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalIter")
            .field("offset", &self.offset)
            .field("max_record_size", &self.max_record_size)
            .finish_non_exhaustive()
    }
}

impl<T: LogRecord> WalIter<T> {
    /// Reads and CRC-verifies the next frame, advancing the logical
    /// offset. Returns `Ok(None)` at a clean end of file.
    fn read_next_frame(&mut self) -> Result<Option<Vec<u8>>, WalError> {
        // Lock only for the duration of one frame read.
        let mut guard = self
            .file
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;

        guard.seek(SeekFrom::Start(self.offset))?;

        // Length prefix; EOF here means the previous frame was the last.
        let mut len_bytes = [0u8; U32_SIZE];
        match guard.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                trace!(offset = self.offset, "WAL replay reached end of file");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let record_len = u32::from_le_bytes(len_bytes) as usize;
        if record_len > self.max_record_size {
            return Err(WalError::RecordTooLarge(record_len));
        }

        // Payload and checksum; EOF inside either is a torn write.
        let mut payload = vec![0u8; record_len];
        read_fully(&mut *guard, &mut payload, self.offset, "payload")?;

        let mut crc_bytes = [0u8; U32_SIZE];
        read_fully(&mut *guard, &mut crc_bytes, self.offset, "checksum")?;
        let stored_checksum = u32::from_le_bytes(crc_bytes);

        if let Ok(pos) = guard.stream_position() {
            self.offset = pos;
        }

        verify_crc(&[&len_bytes, &payload], stored_checksum)?;
        Ok(Some(payload))
    }
}

impl<T: LogRecord> Iterator for WalIter<T> {
    type Item = Result<T, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        let payload = match self.read_next_frame() {
            Ok(Some(payload)) => payload,
            Ok(None) => return None,
            Err(e) => return Some(Err(e)),
        };

        match encoding::decode_from_slice::<T>(&payload) {
            Ok((record, _)) => Some(Ok(record)),
            Err(e) => Some(Err(WalError::Encoding(e))),
        }
    }
}

/// `read_exact` that maps a short read to [`WalError::UnexpectedEof`],
/// logging which part of the frame was torn.
fn read_fully(
    reader: &mut impl Read,
    buf: &mut [u8],
    offset: u64,
    part: &str,
) -> Result<(), WalError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            warn!(offset, part, "WAL frame truncated");
            Err(WalError::UnexpectedEof)
        }
        Err(e) => Err(e.into()),
    }
}

// ------------------------------------------------------------------------------------------------
// Header I/O helpers
// ------------------------------------------------------------------------------------------------

fn write_header<W: Write>(writer: &mut W, header: &WalHeader) -> Result<(), WalError> {
    let header_bytes = encoding::encode_to_vec(header)?;
    let checksum = compute_crc(&[&header_bytes]);

    writer.write_all(&header_bytes)?;
    writer.write_all(&checksum.to_le_bytes())?;
    Ok(())
}

/// Reads a [`WalHeader`] from the current position and checks CRC, magic,
/// and version. Segment-sequence validation is left to the caller.
fn read_and_validate_header<R: Read>(reader: &mut R) -> Result<WalHeader, WalError> {
    let mut header_bytes = vec![0u8; WalHeader::ENCODED_SIZE];
    reader.read_exact(&mut header_bytes)?;

    let mut checksum_bytes = [0u8; U32_SIZE];
    reader.read_exact(&mut checksum_bytes)?;
    let stored_checksum = u32::from_le_bytes(checksum_bytes);

    verify_crc(&[&header_bytes], stored_checksum)
        .map_err(|_| WalError::InvalidHeader("header checksum mismatch".into()))?;

    let (header, _) = encoding::decode_from_slice::<WalHeader>(&header_bytes)?;

    if header.magic != WalHeader::MAGIC {
        return Err(WalError::InvalidHeader("bad magic".into()));
    }
    if header.version != WalHeader::VERSION {
        return Err(WalError::InvalidHeader(format!(
            "unsupported version {}",
            header.version
        )));
    }

    Ok(header)
}

// ------------------------------------------------------------------------------------------------
// CRC helpers
// ------------------------------------------------------------------------------------------------

fn compute_crc(parts: &[&[u8]]) -> u32 {
    let mut hasher = Crc32::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

fn verify_crc(parts: &[&[u8]], expected: u32) -> Result<(), WalError> {
    if compute_crc(parts) != expected {
        return Err(WalError::ChecksumMismatch);
    }
    Ok(())
}
