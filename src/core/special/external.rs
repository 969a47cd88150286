//! External-file elements
//!
//! The payload lives in another file at a fixed offset. The file is opened on
//! first I/O and closed with the handle. Once opening fails the handle stays
//! failed; every later call reports the same error.
//!
//! ```text
//! control block  code u16, length u32, offset u32, path_len u32, path
//! ```

use super::{checked_len, clamp_read, Backend, SpecialInfo, SpecialKind};
use crate::core::error::{HdfError, Result};
use crate::core::tags::is_special_tag;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalHeader {
    pub length: u32,
    /// Offset of the payload inside the external file
    pub offset: u32,
    /// Path as stored, possibly relative
    pub path: PathBuf,
}

impl ExternalHeader {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let path = self.path.to_string_lossy();
        let mut out = Vec::with_capacity(14 + path.len());
        out.write_u16::<BigEndian>(SpecialKind::External.code())?;
        out.write_u32::<BigEndian>(self.length)?;
        out.write_u32::<BigEndian>(self.offset)?;
        out.write_u32::<BigEndian>(path.len() as u32)?;
        out.extend_from_slice(path.as_bytes());
        Ok(out)
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self> {
        let bad = |_| HdfError::corrupt("truncated external-element header");
        let code = bytes.read_u16::<BigEndian>().map_err(bad)?;
        if code != SpecialKind::External.code() {
            return Err(HdfError::corrupt(format!("special code {} is not external", code)));
        }
        let length = bytes.read_u32::<BigEndian>().map_err(bad)?;
        let offset = bytes.read_u32::<BigEndian>().map_err(bad)?;
        let path_len = bytes.read_u32::<BigEndian>().map_err(bad)? as usize;
        if path_len == 0 || bytes.len() < path_len {
            return Err(HdfError::corrupt(format!(
                "external path of {} bytes with {} available",
                path_len,
                bytes.len()
            )));
        }
        let path = std::str::from_utf8(&bytes[..path_len])
            .map_err(|_| HdfError::corrupt("external path is not UTF-8"))?;
        Ok(ExternalHeader {
            length,
            offset,
            path: PathBuf::from(path),
        })
    }
}

pub(crate) struct ExternalElement {
    header: ExternalHeader,
    resolved: PathBuf,
    file: Option<File>,
    file_writable: bool,
    failed: Option<String>,
    header_dirty: bool,
}

impl ExternalElement {
    pub(crate) fn open(be: &mut Backend<'_>, block: &[u8]) -> Result<Self> {
        let header = ExternalHeader::from_bytes(block)?;
        let resolved = be.resolve_path(&header.path);
        Ok(ExternalElement {
            header,
            resolved,
            file: None,
            file_writable: false,
            failed: None,
            header_dirty: false,
        })
    }

    /// Move the plain element at `slot` out to `path` at `offset`
    pub(crate) fn promote(be: &mut Backend<'_>, slot: usize, path: &Path, offset: u32) -> Result<()> {
        let dd = be.descriptor(slot)?;
        if is_special_tag(dd.tag) {
            return Err(HdfError::BadArgs(format!(
                "tag {} ref {} is already a special element",
                dd.tag, dd.reference
            )));
        }
        if path.as_os_str().is_empty() {
            return Err(HdfError::BadArgs("external path is empty".into()));
        }
        checked_len(offset as usize + dd.length as usize)?;

        let resolved = be.resolve_path(path);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&resolved)
            .map_err(|e| HdfError::BadOpen(format!("{}: {}", resolved.display(), e)))?;
        if dd.length > 0 {
            let data = be.read_slot(slot)?;
            file.seek(SeekFrom::Start(offset as u64))?;
            file.write_all(&data)?;
        }
        file.flush()?;

        let header = ExternalHeader {
            length: dd.length,
            offset,
            path: path.to_path_buf(),
        };
        be.relocate_slot(slot, &header.to_bytes()?)?;
        be.directory.set_special(slot, true)?;
        debug!(path = %resolved.display(), offset, length = dd.length, "moved element to external file");
        Ok(())
    }

    pub fn length(&self) -> u64 {
        self.header.length as u64
    }

    fn ensure_open(&mut self, write: bool) -> Result<&mut File> {
        if let Some(msg) = &self.failed {
            return Err(HdfError::BadOpen(msg.clone()));
        }
        if self.file.is_none() || (write && !self.file_writable) {
            let opened = OpenOptions::new()
                .read(true)
                .write(write)
                .create(write)
                .open(&self.resolved);
            match opened {
                Ok(file) => {
                    self.file = Some(file);
                    self.file_writable = write;
                }
                Err(e) => {
                    let msg = format!("external file {}: {}", self.resolved.display(), e);
                    warn!("{}", msg);
                    self.failed = Some(msg.clone());
                    return Err(HdfError::BadOpen(msg));
                }
            }
        }
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(HdfError::BadOpen(format!(
                "external file {} is not open",
                self.resolved.display()
            ))),
        }
    }

    pub(crate) fn read(&mut self, _be: &mut Backend<'_>, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let n = clamp_read(self.length(), pos, buf.len());
        let start = self.header.offset as u64 + pos;
        let file = self.ensure_open(false)?;
        if n == 0 {
            return Ok(0);
        }
        file.seek(SeekFrom::Start(start))?;
        let mut filled = 0;
        while filled < n {
            match file.read(&mut buf[filled..n])? {
                0 => {
                    return Err(HdfError::ShortIo {
                        expected: n,
                        actual: filled,
                    })
                }
                k => filled += k,
            }
        }
        Ok(n)
    }

    pub(crate) fn write(&mut self, _be: &mut Backend<'_>, pos: u64, data: &[u8]) -> Result<()> {
        let end = pos + data.len() as u64;
        let new_len = checked_len(end as usize)?;
        checked_len(self.header.offset as usize + end as usize)?;
        let start = self.header.offset as u64 + pos;
        let file = self.ensure_open(true)?;
        file.seek(SeekFrom::Start(start))?;
        file.write_all(data)?;
        if new_len > self.header.length {
            self.header.length = new_len;
            self.header_dirty = true;
        }
        Ok(())
    }

    pub(crate) fn flush(&mut self, be: &mut Backend<'_>, slot: usize) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            if self.file_writable {
                file.flush()?;
            }
        }
        if self.header_dirty {
            be.store_slot(slot, &self.header.to_bytes()?)?;
            self.header_dirty = false;
        }
        Ok(())
    }

    pub fn info(&self) -> SpecialInfo {
        SpecialInfo::External {
            path: self.header.path.clone(),
            offset: self.header.offset,
            length: self.header.length,
        }
    }
}
