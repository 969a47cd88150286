//! Compressed elements
//!
//! The compressed stream is stored as `(TAG_COMPRESSED, comp_ref)`. The whole
//! element is inflated into memory on first access; writes edit the image and
//! the stream is rebuilt when the handle is flushed.
//!
//! ```text
//! control block  code u16, version u16, length u32, comp_ref u16,
//!                method u16, level u32
//! ```

use super::{checked_len, clamp_read, Backend, SpecialInfo, SpecialKind};
use crate::core::compression::{compress, decompress, CompressionConfig, CompressionMethod};
use crate::core::error::{HdfError, Result};
use crate::core::tags::{is_special_tag, Ref, TAG_COMPRESSED};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tracing::debug;

pub const COMPRESSED_HEADER_LEN: usize = 16;
pub const COMPRESSED_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressedHeader {
    pub version: u16,
    /// Uncompressed length
    pub length: u32,
    pub comp_ref: Ref,
    pub compression: CompressionConfig,
}

impl CompressedHeader {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(COMPRESSED_HEADER_LEN);
        out.write_u16::<BigEndian>(SpecialKind::Compressed.code())?;
        out.write_u16::<BigEndian>(self.version)?;
        out.write_u32::<BigEndian>(self.length)?;
        out.write_u16::<BigEndian>(self.comp_ref)?;
        out.write_u16::<BigEndian>(self.compression.method.code())?;
        out.write_u32::<BigEndian>(self.compression.level)?;
        Ok(out)
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self> {
        let bad = |_| HdfError::corrupt("truncated compressed-element header");
        let code = bytes.read_u16::<BigEndian>().map_err(bad)?;
        if code != SpecialKind::Compressed.code() {
            return Err(HdfError::corrupt(format!("special code {} is not compressed", code)));
        }
        let version = bytes.read_u16::<BigEndian>().map_err(bad)?;
        let length = bytes.read_u32::<BigEndian>().map_err(bad)?;
        let comp_ref = bytes.read_u16::<BigEndian>().map_err(bad)?;
        let method_code = bytes.read_u16::<BigEndian>().map_err(bad)?;
        let level = bytes.read_u32::<BigEndian>().map_err(bad)?;
        let method = CompressionMethod::from_u16(method_code).ok_or_else(|| {
            HdfError::corrupt(format!("unsupported compression method {}", method_code))
        })?;
        Ok(CompressedHeader {
            version,
            length,
            comp_ref,
            compression: CompressionConfig { method, level },
        })
    }
}

pub(crate) struct CompressedElement {
    header: CompressedHeader,
    image: Option<Vec<u8>>,
    dirty: bool,
}

impl CompressedElement {
    pub(crate) fn open(block: &[u8]) -> Result<Self> {
        Ok(CompressedElement {
            header: CompressedHeader::from_bytes(block)?,
            image: None,
            dirty: false,
        })
    }

    /// Compress the plain element at `slot` in place of its raw bytes
    pub(crate) fn promote(be: &mut Backend<'_>, slot: usize, compression: CompressionConfig) -> Result<()> {
        let dd = be.descriptor(slot)?;
        if is_special_tag(dd.tag) {
            return Err(HdfError::BadArgs(format!(
                "tag {} ref {} is already a special element",
                dd.tag, dd.reference
            )));
        }
        let data = be.read_slot(slot)?;
        let stream = compress(&data, &compression)?;
        let (comp_ref, _) = be.append_element(TAG_COMPRESSED, &stream)?;

        let header = CompressedHeader {
            version: COMPRESSED_VERSION,
            length: dd.length,
            comp_ref,
            compression,
        };
        be.relocate_slot(slot, &header.to_bytes()?)?;
        be.directory.set_special(slot, true)?;
        debug!(
            tag = dd.tag,
            reference = dd.reference,
            method = compression.method.name(),
            raw = dd.length,
            stored = stream.len(),
            "compressed element"
        );
        Ok(())
    }

    pub fn length(&self) -> u64 {
        match &self.image {
            Some(image) => image.len() as u64,
            None => self.header.length as u64,
        }
    }

    fn image(&mut self, be: &mut Backend<'_>) -> Result<&mut Vec<u8>> {
        if self.image.is_none() {
            let expected = self.header.length as usize;
            let stream = be
                .load_element(TAG_COMPRESSED, self.header.comp_ref)?
                .ok_or_else(|| {
                    HdfError::corrupt(format!(
                        "compressed stream {} is missing",
                        self.header.comp_ref
                    ))
                })?;
            let data = if expected == 0 {
                Vec::new()
            } else {
                decompress(&stream, self.header.compression.method, expected)?
            };
            self.image = Some(data);
        }
        match self.image.as_mut() {
            Some(image) => Ok(image),
            None => Err(HdfError::corrupt("compressed image unavailable")),
        }
    }

    pub(crate) fn read(&mut self, be: &mut Backend<'_>, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let n = clamp_read(self.length(), pos, buf.len());
        if n == 0 {
            return Ok(0);
        }
        let image = self.image(be)?;
        let start = pos as usize;
        buf[..n].copy_from_slice(&image[start..start + n]);
        Ok(n)
    }

    pub(crate) fn write(&mut self, be: &mut Backend<'_>, pos: u64, data: &[u8]) -> Result<()> {
        let end = checked_len(pos as usize + data.len())? as usize;
        let image = self.image(be)?;
        if image.len() < end {
            image.resize(end, 0);
        }
        image[pos as usize..end].copy_from_slice(data);
        self.dirty = true;
        Ok(())
    }

    pub(crate) fn flush(&mut self, be: &mut Backend<'_>, slot: usize) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let image = match &self.image {
            Some(image) => image,
            None => return Ok(()),
        };
        let stream = compress(image, &self.header.compression)?;
        be.store_element(TAG_COMPRESSED, self.header.comp_ref, &stream)?;
        self.header.length = checked_len(image.len())?;
        be.store_slot(slot, &self.header.to_bytes()?)?;
        self.dirty = false;
        Ok(())
    }

    pub(crate) fn info(&self, be: &Backend<'_>) -> SpecialInfo {
        let stored_length = be
            .directory
            .locate(TAG_COMPRESSED, self.header.comp_ref)
            .and_then(|slot| be.directory.get(slot))
            .map_or(0, |dd| dd.length);
        SpecialInfo::Compressed {
            compression: self.header.compression,
            length: self.length() as u32,
            stored_length,
        }
    }
}
