//! Byte-addressable device abstraction
//! The engines only ever see this trait; whether it is backed by a raw
//! device handle, a flat image file or an in-memory buffer is the caller's
//! business.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::warn;

use crate::error::{RecoveryError, Result};

/// A source of raw bytes. Short reads at end-of-device are allowed and must
/// be handled by callers; reading wholly past the end yields an empty buffer.
pub trait BlockSource {
    /// Total size in bytes.
    fn size(&self) -> u64;

    /// Read up to `length` bytes starting at `offset`.
    fn read_at(&mut self, offset: u64, length: usize) -> Result<Vec<u8>>;
}

/// Block source over a flat image file or a raw device node.
pub struct FileBlockSource {
    handle: File,
    total_size: u64,
}

impl FileBlockSource {
    pub fn open(path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(|e| RecoveryError::DeviceUnreadable(format!("{}: {}", path, e)))?;

        // Device nodes report zero-length metadata; seek to the end instead.
        let mut handle = file;
        let total_size = handle
            .seek(SeekFrom::End(0))
            .map_err(|e| RecoveryError::DeviceUnreadable(format!("{}: {}", path, e)))?;
        if total_size == 0 {
            return Err(RecoveryError::DeviceUnreadable(format!(
                "{}: device reports zero size",
                path
            )));
        }

        Ok(FileBlockSource { handle, total_size })
    }
}

impl BlockSource for FileBlockSource {
    fn size(&self) -> u64 {
        self.total_size
    }

    fn read_at(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        if offset >= self.total_size {
            return Ok(Vec::new());
        }
        self.handle.seek(SeekFrom::Start(offset))?;

        let mut buffer = vec![0u8; length];
        let mut filled = 0;
        while filled < length {
            match self.handle.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        buffer.truncate(filled);
        Ok(buffer)
    }
}

/// In-memory block source, used by tests and by callers that already hold a
/// full snapshot of the device.
pub struct MemBlockSource {
    data: Vec<u8>,
}

impl MemBlockSource {
    pub fn new(data: Vec<u8>) -> Self {
        MemBlockSource { data }
    }
}

impl BlockSource for MemBlockSource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let start = offset.min(self.data.len() as u64) as usize;
        let end = (start + length).min(self.data.len());
        Ok(self.data[start..end].to_vec())
    }
}

/// Replace characters the output filesystem rejects. The original first byte
/// of deleted FAT entries and raw UTF-16 names can both carry garbage.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c < ' ' || matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') {
                '_'
            } else {
                c
            }
        })
        .collect();

    let trimmed = cleaned.trim_matches(|c| c == ' ' || c == '.').to_string();
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed
    }
}

/// Pick a destination path that does not collide with an existing file by
/// appending a numeric suffix before the extension.
pub fn unique_destination(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }

    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let ext = Path::new(filename).extension().and_then(|s| s.to_str());

    let mut counter = 1;
    loop {
        let name = match ext {
            Some(e) => format!("{}_{}.{}", stem, counter, e),
            None => format!("{}_{}", stem, counter),
        };
        let path = dir.join(name);
        if !path.exists() {
            return path;
        }
        counter += 1;
    }
}

/// Write one recovered file, creating parent directories as needed.
/// Returns the written path, or None after logging the failure so the
/// caller's scan loop keeps going.
pub fn save_recovered_file(dir: &Path, filename: &str, data: &[u8]) -> Option<PathBuf> {
    if let Err(e) = std::fs::create_dir_all(dir) {
        warn!("cannot create output directory {}: {}", dir.display(), e);
        return None;
    }

    let destination = unique_destination(dir, filename);
    let result = File::create(&destination).and_then(|mut f| f.write_all(data));
    match result {
        Ok(()) => Some(destination),
        Err(e) => {
            warn!("failed to write {}: {}", destination.display(), e);
            // Do not leave a truncated file behind.
            let _ = std::fs::remove_file(&destination);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_source_short_read() {
        let mut src = MemBlockSource::new(vec![1, 2, 3, 4]);
        assert_eq!(src.size(), 4);
        assert_eq!(src.read_at(2, 10).unwrap(), vec![3, 4]);
        assert!(src.read_at(100, 10).unwrap().is_empty());
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("a<b>c.txt"), "a_b_c.txt");
        assert_eq!(sanitize_filename("  spaced  "), "spaced");
        assert_eq!(sanitize_filename("???"), "___");
        assert_eq!(sanitize_filename(""), "unnamed");
    }

    #[test]
    fn test_unique_destination() {
        let dir = tempfile::tempdir().unwrap();
        let first = unique_destination(dir.path(), "report.txt");
        std::fs::write(&first, b"x").unwrap();
        let second = unique_destination(dir.path(), "report.txt");
        assert_eq!(second.file_name().unwrap(), "report_1.txt");
    }

    #[test]
    fn test_save_recovered_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_recovered_file(&dir.path().join("Images"), "pic.jpg", b"data").unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"data");
    }
}
