//! Transaction log
//!
//! Append-only file of committed transactions. Each entry is framed as
//! `[length:4][payload:N][crc32:4]` with a bincode payload. A torn or
//! corrupt tail (crash during append) is cut off when the log is opened.

use crate::apply::TransactionToApply;
use crate::command::Command;
use crate::{Error, Result};
use crc32fast::Hasher;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// File name of the transaction log
pub const TRANSACTION_LOG: &str = "txlog";

const FRAME_OVERHEAD: usize = 8;

/// One committed transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Transaction id
    pub tx_id: u64,
    /// Commit time, milliseconds since the epoch
    pub timestamp: i64,
    /// Commands of the transaction
    pub commands: Vec<Command>,
}

impl From<&TransactionToApply> for LogEntry {
    fn from(tx: &TransactionToApply) -> Self {
        Self {
            tx_id: tx.tx_id,
            timestamp: tx.commit_timestamp,
            commands: tx.commands.clone(),
        }
    }
}

impl From<LogEntry> for TransactionToApply {
    fn from(entry: LogEntry) -> Self {
        Self {
            tx_id: entry.tx_id,
            commands: entry.commands,
            commit_timestamp: entry.timestamp,
        }
    }
}

fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

fn encode(entry: &LogEntry) -> Result<Vec<u8>> {
    let payload = bincode::serialize(entry)?;
    let length = u32::try_from(payload.len())
        .map_err(|_| Error::Serialization(format!("log entry {} too large", entry.tx_id)))?;
    let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&checksum(&payload).to_le_bytes());
    Ok(frame)
}

/// Decode every complete, valid frame; returns the entries and the length of the valid prefix
fn decode_all(bytes: &[u8]) -> (Vec<LogEntry>, usize) {
    let mut entries = Vec::new();
    let mut offset = 0;
    while bytes.len() - offset >= FRAME_OVERHEAD {
        let mut length = [0u8; 4];
        length.copy_from_slice(&bytes[offset..offset + 4]);
        let length = u32::from_le_bytes(length) as usize;
        let end = offset + 4 + length;
        if end + 4 > bytes.len() {
            break;
        }
        let payload = &bytes[offset + 4..end];
        let mut stored = [0u8; 4];
        stored.copy_from_slice(&bytes[end..end + 4]);
        if u32::from_le_bytes(stored) != checksum(payload) {
            break;
        }
        match bincode::deserialize::<LogEntry>(payload) {
            Ok(entry) => entries.push(entry),
            Err(_) => break,
        }
        offset = end + 4;
    }
    (entries, offset)
}

/// Destination of log frames
trait LogFile: Write {
    /// Cut the file back to `len` bytes
    fn truncate(&mut self, len: u64) -> std::io::Result<()>;
}

impl LogFile for File {
    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)
    }
}

struct LogWriter<F = File> {
    file: F,
    /// Length of the valid prefix: every byte before it belongs to a complete frame
    end: u64,
    last_tx_id: u64,
    /// A failed append could not be cut back; the tail holds a torn frame
    broken: bool,
}

impl<F: LogFile> LogWriter<F> {
    fn append(&mut self, entry: &LogEntry) -> Result<()> {
        if self.broken {
            return Err(Error::invalid_state(
                "transaction log has a torn frame from a failed append",
            ));
        }
        if entry.tx_id <= self.last_tx_id {
            return Err(Error::invalid_state(format!(
                "transaction {} appended after {}",
                entry.tx_id, self.last_tx_id
            )));
        }
        let frame = encode(entry)?;
        if let Err(e) = self.file.write_all(&frame).and_then(|()| self.file.flush()) {
            match self.file.truncate(self.end) {
                Ok(()) => tracing::warn!(
                    "Append of transaction {} failed, log cut back to {} bytes: {}",
                    entry.tx_id,
                    self.end,
                    e
                ),
                Err(rollback) => {
                    self.broken = true;
                    tracing::error!(
                        "Append of transaction {} failed ({}) and the log could not be cut back: {}",
                        entry.tx_id,
                        e,
                        rollback
                    );
                }
            }
            return Err(e.into());
        }
        self.end += frame.len() as u64;
        self.last_tx_id = entry.tx_id;
        Ok(())
    }
}

/// Transaction log file
pub struct TransactionLog {
    path: PathBuf,
    inner: Mutex<LogWriter>,
}

impl TransactionLog {
    /// Open or create the log in `dir`, truncating a damaged tail
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join(TRANSACTION_LOG);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let (entries, valid) = decode_all(&bytes);
        if valid < bytes.len() {
            tracing::warn!(
                "Truncating {} bytes of damaged tail from {:?}",
                bytes.len() - valid,
                path
            );
            file.set_len(valid as u64)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::End(0))?;
        let last_tx_id = entries.last().map(|e| e.tx_id).unwrap_or(0);
        tracing::debug!("Opened transaction log {:?}: {} entries", path, entries.len());

        Ok(Self {
            path,
            inner: Mutex::new(LogWriter {
                file,
                end: valid as u64,
                last_tx_id,
                broken: false,
            }),
        })
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entry; ids must increase.
    ///
    /// A failed write is cut back so later entries never follow a torn frame.
    pub fn append(&self, entry: &LogEntry) -> Result<()> {
        self.inner.lock().append(entry)
    }

    /// fsync the log
    pub fn force(&self) -> Result<()> {
        self.inner.lock().file.sync_data()?;
        Ok(())
    }

    /// Highest transaction id in the log
    pub fn last_tx_id(&self) -> u64 {
        self.inner.lock().last_tx_id
    }

    /// Entries with an id above `tx_id`, in log order
    pub fn read_entries_after(&self, tx_id: u64) -> Result<Vec<LogEntry>> {
        let bytes = {
            let _appends = self.inner.lock();
            std::fs::read(&self.path)?
        };
        let (entries, _) = decode_all(&bytes);
        Ok(entries.into_iter().filter(|e| e.tx_id > tx_id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(tx_id: u64) -> LogEntry {
        LogEntry {
            tx_id,
            timestamp: 0,
            commands: vec![Command::NodeCount {
                label: 1,
                delta: tx_id as i64,
            }],
        }
    }

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let log = TransactionLog::open(dir.path()).unwrap();
        for tx in 1..=3 {
            log.append(&entry(tx)).unwrap();
        }
        log.force().unwrap();
        assert_eq!(log.last_tx_id(), 3);
        let tail = log.read_entries_after(1).unwrap();
        assert_eq!(tail, vec![entry(2), entry(3)]);
    }

    #[test]
    fn test_ids_must_increase() {
        let dir = TempDir::new().unwrap();
        let log = TransactionLog::open(dir.path()).unwrap();
        log.append(&entry(2)).unwrap();
        assert!(log.append(&entry(2)).is_err());
    }

    #[test]
    fn test_torn_tail_truncated_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let log = TransactionLog::open(dir.path()).unwrap();
            log.append(&entry(1)).unwrap();
            log.append(&entry(2)).unwrap();
        }
        let path = dir.path().join(TRANSACTION_LOG);
        let full = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full - 3).unwrap();
        drop(file);

        let log = TransactionLog::open(dir.path()).unwrap();
        assert_eq!(log.last_tx_id(), 1);
        log.append(&entry(2)).unwrap();
        assert_eq!(log.read_entries_after(0).unwrap(), vec![entry(1), entry(2)]);
    }

    #[test]
    fn test_corrupt_checksum_stops_reading() {
        let dir = TempDir::new().unwrap();
        {
            let log = TransactionLog::open(dir.path()).unwrap();
            log.append(&entry(1)).unwrap();
        }
        let path = dir.path().join(TRANSACTION_LOG);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let log = TransactionLog::open(dir.path()).unwrap();
        assert_eq!(log.last_tx_id(), 0);
        assert!(log.read_entries_after(0).unwrap().is_empty());
    }

    struct ShortDisk {
        data: Vec<u8>,
        capacity: usize,
        truncate_fails: bool,
    }

    impl Write for ShortDisk {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let room = self.capacity.saturating_sub(self.data.len());
            if room == 0 {
                return Err(std::io::Error::other("disk full"));
            }
            let n = room.min(buf.len());
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl LogFile for ShortDisk {
        fn truncate(&mut self, len: u64) -> std::io::Result<()> {
            if self.truncate_fails {
                return Err(std::io::Error::other("read-only"));
            }
            self.data.truncate(len as usize);
            Ok(())
        }
    }

    fn short_disk_writer(capacity: usize, truncate_fails: bool) -> LogWriter<ShortDisk> {
        LogWriter {
            file: ShortDisk {
                data: Vec::new(),
                capacity,
                truncate_fails,
            },
            end: 0,
            last_tx_id: 0,
            broken: false,
        }
    }

    #[test]
    fn test_failed_append_is_cut_back() {
        let frame_len = encode(&entry(1)).unwrap().len();
        let mut writer = short_disk_writer(frame_len + 5, false);
        writer.append(&entry(1)).unwrap();

        assert!(writer.append(&entry(2)).is_err());
        assert_eq!(writer.file.data.len(), frame_len);
        assert_eq!(writer.last_tx_id, 1);

        writer.file.capacity = usize::MAX;
        writer.append(&entry(2)).unwrap();
        writer.append(&entry(3)).unwrap();
        let (entries, valid) = decode_all(&writer.file.data);
        assert_eq!(entries, vec![entry(1), entry(2), entry(3)]);
        assert_eq!(valid, writer.file.data.len());
    }

    #[test]
    fn test_append_refused_after_failed_cut_back() {
        let frame_len = encode(&entry(1)).unwrap().len();
        let mut writer = short_disk_writer(frame_len + 5, true);
        writer.append(&entry(1)).unwrap();
        assert!(writer.append(&entry(2)).is_err());

        writer.file.capacity = usize::MAX;
        assert!(matches!(writer.append(&entry(2)), Err(Error::InvalidState(_))));
        let (entries, _) = decode_all(&writer.file.data);
        assert_eq!(entries, vec![entry(1)]);
    }
}
