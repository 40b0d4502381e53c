//! Disk-backed append log for recovery records.
//!
//! Record framing: `total_len:u32 | crc:u32 | payload`, where the
//! payload is the bincode form of a [`LogRec`] and the CRC covers the
//! payload only. A torn or corrupt tail is reported, not silently
//! skipped.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;

use crate::recovery::LogRec;

const RECORD_HEADER_SIZE: usize = 8;

pub struct LogManager {
    file: File,
    path: PathBuf,
}

impl LogManager {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path_buf = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path_buf)?;
        Ok(Self {
            file,
            path: path_buf,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record and syncs it to disk.
    pub fn append(&mut self, rec: &LogRec) -> io::Result<()> {
        let payload = bincode::serialize(rec)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let total_len = (RECORD_HEADER_SIZE + payload.len()) as u32;
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&total_len.to_le_bytes())?;
        self.file.write_all(&crc.to_le_bytes())?;
        self.file.write_all(&payload)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Reads the whole log back, verifying each record's checksum.
    pub fn read_all(&mut self) -> io::Result<Vec<LogRec>> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        self.file.read_to_end(&mut buf)?;

        let mut records = Vec::new();
        let mut at = 0usize;
        while at < buf.len() {
            if at + RECORD_HEADER_SIZE > buf.len() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated log record header",
                ));
            }
            let total_len =
                u32::from_le_bytes(buf[at..at + 4].try_into().unwrap()) as usize;
            let crc = u32::from_le_bytes(buf[at + 4..at + 8].try_into().unwrap());
            if total_len < RECORD_HEADER_SIZE || at + total_len > buf.len() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated log record payload",
                ));
            }
            let payload = &buf[at + RECORD_HEADER_SIZE..at + total_len];
            let mut hasher = Hasher::new();
            hasher.update(payload);
            if hasher.finalize() != crc {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "log record crc mismatch",
                ));
            }
            let rec = bincode::deserialize(payload)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            records.push(rec);
            at += total_len;
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::LogState;
    use tempfile::tempdir;

    #[test]
    fn append_then_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("granite.log");
        let mut state = LogState::new();
        let recs = vec![
            state.begin_log(1),
            state.insert_log(1, "a", 1),
            state.update_log(1, "a", 1, "a", 2),
            state.commit_log(1),
        ];
        {
            let mut log = LogManager::open(&path).unwrap();
            for rec in &recs {
                log.append(rec).unwrap();
            }
        }
        let mut log = LogManager::open(&path).unwrap();
        assert_eq!(log.read_all().unwrap(), recs);
    }

    #[test]
    fn corruption_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("granite.log");
        let mut state = LogState::new();
        {
            let mut log = LogManager::open(&path).unwrap();
            log.append(&state.insert_log(1, "victim", 1)).unwrap();
        }
        // Flip a payload byte.
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let mut log = LogManager::open(&path).unwrap();
        let err = log.read_all().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
