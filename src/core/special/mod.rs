//! Special-element dispatch
//!
//! A DD whose tag carries the special bit points at a control block instead
//! of raw bytes. The first `u16` of the control block names the storage
//! strategy. [`Storage`] is resolved when the first handle on an element
//! is opened; later handles on the same element share it, and every
//! byte-level read and write goes through it.

pub mod chunked;
pub mod compressed;
pub mod external;
pub mod linked;

use crate::core::compression::CompressionConfig;
use crate::core::config::ContainerConfig;
use crate::core::directory::Directory;
use crate::core::error::{HdfError, Result};
use crate::core::header::Descriptor;
use crate::core::io::ContainerFile;
use crate::core::tags::{is_special_tag, Ref, Tag, REF_WILDCARD};
use byteorder::{BigEndian, ByteOrder};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use chunked::{ChunkGeometry, ChunkSpec, ChunkedHeader};
pub use compressed::CompressedHeader;
pub use external::ExternalHeader;
pub use linked::LinkedHeader;

pub(crate) use chunked::ChunkedElement;
pub(crate) use compressed::CompressedElement;
pub(crate) use external::ExternalElement;
pub(crate) use linked::LinkedElement;

/// Storage strategy code stored at the head of a control block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SpecialKind {
    Linked = 1,
    External = 2,
    Compressed = 3,
    Chunked = 5,
}

impl SpecialKind {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(SpecialKind::Linked),
            2 => Some(SpecialKind::External),
            3 => Some(SpecialKind::Compressed),
            5 => Some(SpecialKind::Chunked),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        self as u16
    }
}

/// Read the strategy code of a control block
pub fn control_kind(block: &[u8]) -> Result<SpecialKind> {
    if block.len() < 2 {
        return Err(HdfError::corrupt(format!(
            "control block of {} bytes",
            block.len()
        )));
    }
    let code = BigEndian::read_u16(&block[0..2]);
    SpecialKind::from_code(code)
        .ok_or_else(|| HdfError::corrupt(format!("unknown special code {}", code)))
}

/// Storage details reported by `Container::special_info`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecialInfo {
    Plain,
    Linked {
        length: u32,
        first_len: u32,
        block_len: u32,
        blocks_per_table: u32,
        blocks_allocated: usize,
    },
    External {
        path: PathBuf,
        offset: u32,
        length: u32,
    },
    Compressed {
        compression: CompressionConfig,
        length: u32,
        stored_length: u32,
    },
    Chunked {
        dims: Vec<u32>,
        chunk_dims: Vec<u32>,
        nt_size: u32,
        compression: CompressionConfig,
        chunks_written: usize,
    },
}

impl SpecialInfo {
    pub fn kind(&self) -> Option<SpecialKind> {
        match self {
            SpecialInfo::Plain => None,
            SpecialInfo::Linked { .. } => Some(SpecialKind::Linked),
            SpecialInfo::External { .. } => Some(SpecialKind::External),
            SpecialInfo::Compressed { .. } => Some(SpecialKind::Compressed),
            SpecialInfo::Chunked { .. } => Some(SpecialKind::Chunked),
        }
    }
}

/// Mutable view of a session's file and directory, handed to storage
/// strategies for the duration of one operation
pub(crate) struct Backend<'a> {
    pub file: &'a mut ContainerFile,
    pub directory: &'a mut Directory,
    pub config: &'a ContainerConfig,
    pub base_dir: &'a Path,
}

impl<'a> Backend<'a> {
    pub fn descriptor(&self, slot: usize) -> Result<Descriptor> {
        self.directory
            .get(slot)
            .copied()
            .ok_or_else(|| HdfError::corrupt(format!("DD slot {} is empty", slot)))
    }

    /// Raw bytes addressed by a DD
    pub fn read_slot(&mut self, slot: usize) -> Result<Vec<u8>> {
        let dd = self.descriptor(slot)?;
        self.file.read_vec(dd.offset as u64, dd.length as usize)
    }

    /// Bytes of `(tag, ref)`, `None` when no such element exists
    pub fn load_element(&mut self, tag: Tag, reference: Ref) -> Result<Option<Vec<u8>>> {
        match self.directory.locate(tag, reference) {
            Some(slot) => self.read_slot(slot).map(Some),
            None => Ok(None),
        }
    }

    /// Replace the bytes behind a DD. Data that fits is rewritten in place,
    /// an element ending at end of file grows in place, anything else moves
    /// to end of file. The DD is updated only after the data is written.
    pub fn store_slot(&mut self, slot: usize, data: &[u8]) -> Result<()> {
        let dd = self.descriptor(slot)?;
        let len = checked_len(data.len())?;
        let end = dd.offset as u64 + dd.length as u64;
        let offset = if dd.length > 0 && (len <= dd.length || end == self.file.end()) {
            self.file.write_at(dd.offset as u64, data)?;
            dd.offset
        } else {
            self.file.append(data)?
        };
        self.directory.update(slot, offset, len);
        Ok(())
    }

    /// Cut a plain element back to `len` bytes; longer lengths are ignored
    pub fn truncate_slot(&mut self, slot: usize, len: u64) -> Result<()> {
        let dd = self.descriptor(slot)?;
        if len < dd.length as u64 {
            self.directory.update(slot, dd.offset, len as u32);
        }
        Ok(())
    }

    /// Write data at end of file and point the DD at it
    pub fn relocate_slot(&mut self, slot: usize, data: &[u8]) -> Result<()> {
        let len = checked_len(data.len())?;
        let offset = self.file.append(data)?;
        self.directory.update(slot, offset, len);
        Ok(())
    }

    /// Write `data` and only then create a DD for it under a fresh ref
    pub fn append_element(&mut self, tag: Tag, data: &[u8]) -> Result<(Ref, usize)> {
        let len = checked_len(data.len())?;
        let offset = self.file.append(data)?;
        let slot = self.directory.allocate(self.file, tag, REF_WILDCARD)?;
        self.directory.update(slot, offset, len);
        Ok((self.descriptor(slot)?.reference, slot))
    }

    /// Claim a fresh ref with an empty (length 0) DD
    pub fn reserve_element(&mut self, tag: Tag) -> Result<(Ref, usize)> {
        let slot = self.directory.allocate(self.file, tag, REF_WILDCARD)?;
        Ok((self.descriptor(slot)?.reference, slot))
    }

    /// Store `data` as `(tag, ref)`, creating the DD if needed
    pub fn store_element(&mut self, tag: Tag, reference: Ref, data: &[u8]) -> Result<usize> {
        match self.directory.locate(tag, reference) {
            Some(slot) => {
                self.store_slot(slot, data)?;
                Ok(slot)
            }
            None => {
                let len = checked_len(data.len())?;
                let offset = self.file.append(data)?;
                let slot = self.directory.allocate(self.file, tag, reference)?;
                self.directory.update(slot, offset, len);
                Ok(slot)
            }
        }
    }

    /// Resolve an external-element path
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match &self.config.external_dir {
            Some(dir) => dir.join(path),
            None => self.base_dir.join(path),
        }
    }
}

pub(crate) fn checked_len(len: usize) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| HdfError::NoSpace(format!("element of {} bytes exceeds 32-bit lengths", len)))
}

/// Resolved storage of one element, shared by every handle open on it so
/// they all see the same chunk cache and buffered state
pub(crate) type SharedStorage = Arc<Mutex<Storage>>;

/// Resolved storage strategy of one element
pub(crate) enum Storage {
    Plain,
    Linked(LinkedElement),
    External(ExternalElement),
    Compressed(CompressedElement),
    Chunked(Box<ChunkedElement>),
}

impl Storage {
    /// Inspect the DD at `slot` and parse its control block, if any
    pub fn resolve(be: &mut Backend<'_>, slot: usize) -> Result<Self> {
        let dd = be.descriptor(slot)?;
        if !is_special_tag(dd.tag) {
            return Ok(Storage::Plain);
        }
        let block = be.read_slot(slot).map_err(|e| match e {
            HdfError::ShortIo { .. } => HdfError::corrupt("control block extends past end of file"),
            other => other,
        })?;
        let storage = match control_kind(&block)? {
            SpecialKind::Linked => Storage::Linked(LinkedElement::open(be, &block)?),
            SpecialKind::External => Storage::External(ExternalElement::open(be, &block)?),
            SpecialKind::Compressed => {
                Storage::Compressed(CompressedElement::open(&block)?)
            }
            SpecialKind::Chunked => {
                Storage::Chunked(Box::new(ChunkedElement::open(be, &block)?))
            }
        };
        Ok(storage)
    }

    pub fn shared(self) -> SharedStorage {
        Arc::new(Mutex::new(self))
    }

    pub fn kind(&self) -> Option<SpecialKind> {
        match self {
            Storage::Plain => None,
            Storage::Linked(_) => Some(SpecialKind::Linked),
            Storage::External(_) => Some(SpecialKind::External),
            Storage::Compressed(_) => Some(SpecialKind::Compressed),
            Storage::Chunked(_) => Some(SpecialKind::Chunked),
        }
    }

    /// Logical length in bytes
    pub fn length(&self, be: &Backend<'_>, slot: usize) -> Result<u64> {
        Ok(match self {
            Storage::Plain => be.descriptor(slot)?.length as u64,
            Storage::Linked(el) => el.length(),
            Storage::External(el) => el.length(),
            Storage::Compressed(el) => el.length(),
            Storage::Chunked(el) => el.length(),
        })
    }

    /// Read up to `buf.len()` bytes at `pos`; returns the count, which is
    /// short only at end of element
    pub fn read(
        &mut self,
        be: &mut Backend<'_>,
        slot: usize,
        pos: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        match self {
            Storage::Plain => {
                let dd = be.descriptor(slot)?;
                let n = clamp_read(dd.length as u64, pos, buf.len());
                if n > 0 {
                    be.file.read_at(dd.offset as u64 + pos, &mut buf[..n])?;
                }
                Ok(n)
            }
            Storage::Linked(el) => el.read(be, pos, buf),
            Storage::External(el) => el.read(be, pos, buf),
            Storage::Compressed(el) => el.read(be, pos, buf),
            Storage::Chunked(el) => el.read(be, pos, buf),
        }
    }

    pub fn write(
        &mut self,
        be: &mut Backend<'_>,
        slot: usize,
        pos: u64,
        data: &[u8],
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        match self {
            Storage::Plain => write_plain(be, slot, pos, data),
            Storage::Linked(el) => el.write(be, pos, data),
            Storage::External(el) => el.write(be, pos, data),
            Storage::Compressed(el) => el.write(be, pos, data),
            Storage::Chunked(el) => el.write(be, pos, data),
        }
    }

    /// Push buffered state (chunk cache, link tables, compressed image,
    /// control block) to the file
    pub fn flush(&mut self, be: &mut Backend<'_>, slot: usize) -> Result<()> {
        match self {
            Storage::Plain => Ok(()),
            Storage::Linked(el) => el.flush(be, slot),
            Storage::External(el) => el.flush(be, slot),
            Storage::Compressed(el) => el.flush(be, slot),
            Storage::Chunked(el) => el.flush(be),
        }
    }

    pub fn info(&self, be: &Backend<'_>) -> SpecialInfo {
        match self {
            Storage::Plain => SpecialInfo::Plain,
            Storage::Linked(el) => el.info(),
            Storage::External(el) => el.info(),
            Storage::Compressed(el) => el.info(be),
            Storage::Chunked(el) => el.info(),
        }
    }

    pub fn as_chunked(&mut self) -> Option<&mut ChunkedElement> {
        match self {
            Storage::Chunked(el) => Some(el),
            _ => None,
        }
    }
}

fn clamp_read(length: u64, pos: u64, want: usize) -> usize {
    length.saturating_sub(pos).min(want as u64) as usize
}

/// Plain write: in place when it fits or the element ends at end of file,
/// otherwise the element moves to end of file
fn write_plain(be: &mut Backend<'_>, slot: usize, pos: u64, data: &[u8]) -> Result<()> {
    let dd = be.descriptor(slot)?;
    let new_end = pos + data.len() as u64;
    let new_len = checked_len(new_end.max(dd.length as u64) as usize)?;
    let ends_at_eof = dd.offset as u64 + dd.length as u64 == be.file.end();

    if dd.length > 0 && (new_end <= dd.length as u64 || ends_at_eof) {
        be.file.write_at(dd.offset as u64 + pos, data)?;
        be.directory.update(slot, dd.offset, new_len);
        return Ok(());
    }

    let mut image = if dd.length > 0 {
        be.file.read_vec(dd.offset as u64, dd.length as usize)?
    } else {
        Vec::new()
    };
    image.resize(new_len as usize, 0);
    image[pos as usize..new_end as usize].copy_from_slice(data);
    be.relocate_slot(slot, &image)
}

#[cfg(test)]
pub(crate) mod fixture {
    use super::*;
    use tempfile::TempDir;

    /// A fresh container file and directory for strategy tests
    pub(crate) struct Fixture {
        pub dir: TempDir,
        pub file: ContainerFile,
        pub directory: Directory,
        pub config: ContainerConfig,
    }

    impl Fixture {
        pub fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut file = ContainerFile::create(dir.path().join("special.hdf")).unwrap();
            let directory = Directory::create(&mut file, 8).unwrap();
            Fixture {
                dir,
                file,
                directory,
                config: ContainerConfig::default(),
            }
        }

        pub fn backend(&mut self) -> Backend<'_> {
            Backend {
                file: &mut self.file,
                directory: &mut self.directory,
                config: &self.config,
                base_dir: self.dir.path(),
            }
        }

        /// Close and reopen the file, reloading the directory
        pub fn reopen(&mut self) {
            let mut be = self.backend();
            be.directory.flush(be.file).unwrap();
            let path = self.dir.path().join("special.hdf");
            self.file = ContainerFile::open(&path, true).unwrap();
            self.directory = Directory::load(&mut self.file, 8).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixture::Fixture;
    use super::*;
    use crate::core::tags::TAG_IP8;

    #[test]
    fn test_special_kind_codes() {
        assert_eq!(SpecialKind::from_code(5), Some(SpecialKind::Chunked));
        assert_eq!(SpecialKind::from_code(4), None);
        assert!(matches!(control_kind(&[0, 9, 0]), Err(HdfError::CorruptSpecialElement(_))));
        assert!(control_kind(&[0]).is_err());
    }

    #[test]
    fn test_plain_write_grows_at_eof_in_place() {
        let mut fx = Fixture::new();
        let mut be = fx.backend();
        let slot = be.directory.allocate(be.file, TAG_IP8, 1).unwrap();
        let mut storage = Storage::resolve(&mut be, slot).unwrap();

        storage.write(&mut be, slot, 0, b"abcd").unwrap();
        let first = be.descriptor(slot).unwrap();
        storage.write(&mut be, slot, 4, b"efgh").unwrap();
        let grown = be.descriptor(slot).unwrap();
        assert_eq!(first.offset, grown.offset);
        assert_eq!(grown.length, 8);

        let mut buf = [0u8; 16];
        let n = storage.read(&mut be, slot, 2, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"cdefgh");
    }

    #[test]
    fn test_plain_write_relocates_when_not_at_eof() {
        let mut fx = Fixture::new();
        let mut be = fx.backend();
        let slot = be.directory.allocate(be.file, TAG_IP8, 1).unwrap();
        let mut storage = Storage::resolve(&mut be, slot).unwrap();
        storage.write(&mut be, slot, 0, b"abcd").unwrap();
        let before = be.descriptor(slot).unwrap();

        be.append_element(TAG_IP8, b"blocker").unwrap();
        storage.write(&mut be, slot, 2, b"XYZW").unwrap();
        let after = be.descriptor(slot).unwrap();
        assert_ne!(before.offset, after.offset);
        assert_eq!(be.read_slot(slot).unwrap(), b"abXYZW");
    }

    #[test]
    fn test_store_element_creates_then_rewrites() {
        let mut fx = Fixture::new();
        let mut be = fx.backend();
        let slot = be.store_element(TAG_IP8, 4, b"0123456789").unwrap();
        let offset = be.descriptor(slot).unwrap().offset;

        assert_eq!(be.store_element(TAG_IP8, 4, b"short").unwrap(), slot);
        let dd = be.descriptor(slot).unwrap();
        assert_eq!((dd.offset, dd.length), (offset, 5));
        assert_eq!(be.load_element(TAG_IP8, 4).unwrap().unwrap(), b"short");
        assert_eq!(be.load_element(TAG_IP8, 5).unwrap(), None);
    }

    #[test]
    fn test_resolve_rejects_unknown_code() {
        let mut fx = Fixture::new();
        let mut be = fx.backend();
        let (_, slot) = be.append_element(TAG_IP8, &[0, 7, 1, 2, 3]).unwrap();
        be.directory.set_special(slot, true).unwrap();
        assert!(matches!(
            Storage::resolve(&mut be, slot),
            Err(HdfError::CorruptSpecialElement(_))
        ));
    }

    #[test]
    fn test_relative_paths_resolve_against_container_dir() {
        let mut fx = Fixture::new();
        let be = fx.backend();
        let base = be.base_dir.to_path_buf();
        assert_eq!(be.resolve_path(Path::new("ext.bin")), base.join("ext.bin"));
        assert_eq!(be.resolve_path(Path::new("/abs/ext.bin")), PathBuf::from("/abs/ext.bin"));
    }
}
