//! Positioned disk I/O for container files

use crate::core::error::{HdfError, Result};
use crate::core::header::{validate_magic, MAGIC, MAGIC_LEN};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Disk-backed container storage
///
/// Every offset stored in the file is a `u32`, so the file never grows past
/// `u32::MAX` bytes; appends that would cross it fail with `NoSpace`.
pub struct ContainerFile {
    file: File,
    path: PathBuf,
    writable: bool,
    end: u64,
}

impl ContainerFile {
    /// Create (truncating) a container file holding only the magic
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| {
                HdfError::BadOpen(format!("{}: {}", path.as_ref().display(), e))
            })?;

        file.write_all(&MAGIC)?;
        file.flush()?;

        Ok(ContainerFile {
            file,
            path: path.as_ref().to_path_buf(),
            writable: true,
            end: MAGIC_LEN as u64,
        })
    }

    /// Open an existing container file and check its magic
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&path)
            .map_err(|e| {
                HdfError::BadOpen(format!("{}: {}", path.as_ref().display(), e))
            })?;

        let end = file.metadata()?.len();
        let mut magic = [0u8; MAGIC_LEN];
        if end < MAGIC_LEN as u64 {
            return Err(HdfError::BadOpen(format!(
                "{}: file too short ({} bytes)",
                path.as_ref().display(),
                end
            )));
        }
        file.read_exact(&mut magic)?;
        validate_magic(&magic)?;

        Ok(ContainerFile {
            file,
            path: path.as_ref().to_path_buf(),
            writable,
            end,
        })
    }

    /// Fill `buf` from `offset`; a short file yields `ShortIo`
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(HdfError::ShortIo {
                        expected: buf.len(),
                        actual: filled,
                    })
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == IoErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Read `len` bytes at `offset` into a fresh buffer
    pub fn read_vec(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Write `data` at `offset`, growing the file if needed
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(HdfError::BadOpen("container is open read-only".into()));
        }
        let new_end = offset + data.len() as u64;
        if new_end > u32::MAX as u64 {
            return Err(HdfError::NoSpace(format!(
                "write to {}..{} exceeds the 32-bit offset range",
                offset, new_end
            )));
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.end = self.end.max(new_end);
        Ok(())
    }

    /// Append `data` at end of file, returning its offset
    pub fn append(&mut self, data: &[u8]) -> Result<u32> {
        let offset = self.end;
        self.write_at(offset, data)?;
        Ok(offset as u32)
    }

    /// Current end-of-file offset
    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Get file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sync all writes to disk
    pub fn sync(&mut self) -> Result<()> {
        if self.writable {
            self.file.flush()?;
            self.file.sync_all()?;
        }
        Ok(())
    }
}
