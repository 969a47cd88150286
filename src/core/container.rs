//! Container session
//!
//! A [`Container`] owns one open file, its directory and every access handle
//! opened through it. All state is per session: two containers never share a
//! cursor, a pending ref or a last-error slot.

use crate::core::access::{Access, AccessId, AccessMode, AccessTable, BitSession, Positioning};
use crate::core::bitio::{
    clear_bit_tail, find_bit_tail, record_bit_tail, BitReader, BitWriter, HandleStream,
};
use crate::core::chunk_cache::ChunkCacheStats;
use crate::core::compression::CompressionConfig;
use crate::core::config::ContainerConfig;
use crate::core::directory::{Direction, Directory};
use crate::core::error::{ErrorKind, HdfError, Result};
use crate::core::header::Descriptor;
use crate::core::io::ContainerFile;
use crate::core::special::{
    Backend, ChunkSpec, ChunkedElement, CompressedElement, ExternalElement, LinkedElement,
    SharedStorage, SpecialInfo, SpecialKind, Storage,
};
use crate::core::tags::{base_tag, is_special_tag, Ref, Tag, REF_WILDCARD, TAG_WILDCARD};
use std::cell::Cell;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    ReadWrite,
    /// Create a new container, truncating any existing file
    Create,
}

/// What `inquire` reports about an open handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementInfo {
    pub tag: Tag,
    pub reference: Ref,
    /// Logical length in bytes
    pub length: u64,
    /// File offset of the element's bytes (or control block)
    pub offset: u32,
    pub position: u64,
    pub mode: AccessMode,
    pub special: Option<SpecialKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerStats {
    pub elements: usize,
    pub dd_slots: usize,
    pub empty_slots: usize,
    pub dd_blocks: usize,
    pub open_accesses: usize,
    pub file_size: u64,
}

/// Cursor over the DDs matching a tag/ref pattern, either of which may be a
/// wildcard
#[derive(Debug, Clone)]
pub struct ElementScan {
    tag: Tag,
    reference: Ref,
    cursor: Option<usize>,
    done: bool,
}

pub struct Container {
    file: ContainerFile,
    directory: Directory,
    accesses: AccessTable,
    config: ContainerConfig,
    mode: OpenMode,
    base_dir: PathBuf,
    last_error: Cell<Option<ErrorKind>>,
    pending_ref: Option<Ref>,
    closed: bool,
}

impl Container {
    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode) -> Result<Self> {
        Self::open_with_config(path, mode, ContainerConfig::default())
    }

    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        mode: OpenMode,
        config: ContainerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref();
        let (file, directory) = match mode {
            OpenMode::Create => {
                let mut file = ContainerFile::create(path)?;
                let directory = Directory::create(&mut file, config.dd_block_size)?;
                info!("Created container at {:?}", path);
                (file, directory)
            }
            OpenMode::Read | OpenMode::ReadWrite => {
                let mut file = ContainerFile::open(path, mode == OpenMode::ReadWrite)?;
                let directory = Directory::load(&mut file, config.dd_block_size)?;
                info!(
                    "Opened container at {:?} ({} elements, {} DD blocks)",
                    path,
                    directory.len(),
                    directory.block_count()
                );
                (file, directory)
            }
        };

        let base_dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        Ok(Container {
            file,
            directory,
            accesses: AccessTable::default(),
            config,
            mode,
            base_dir,
            last_error: Cell::new(None),
            pending_ref: None,
            closed: false,
        })
    }

    /// End every open handle, write the directory and close the file. The
    /// first failure is reported as `CantClose` after everything has been
    /// released.
    pub fn close(mut self) -> Result<()> {
        let path = self.file.path().to_path_buf();
        let result = match self.teardown() {
            Some(e) => Err(HdfError::CantClose(e.to_string())),
            None => Ok(()),
        };
        info!("Closed container at {:?}", path);
        result
    }

    /// Flush open handles and the directory without closing anything
    pub fn flush(&mut self) -> Result<()> {
        self.tracked(|c| {
            for id in c.accesses.ids() {
                let (mut be, accesses) = c.parts();
                let access = accesses.get(id)?;
                access.storage.lock().flush(&mut be, access.slot)?;
            }
            if c.file.is_writable() {
                c.directory.flush(&mut c.file)?;
                c.file.sync()?;
            }
            Ok(())
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Kind of the error raised by the most recent failed operation; cleared
    /// at the start of each operation
    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error.get()
    }

    /// Open the first element matching `(tag, ref)` for reading
    pub fn start_read(&mut self, tag: Tag, reference: Ref) -> Result<AccessId> {
        self.tracked(|c| c.begin_read(tag, reference))
    }

    /// Open `(tag, ref)` for writing, creating an empty element if needed.
    /// A wildcard ref takes the pending ref or a fresh one.
    pub fn start_write(&mut self, tag: Tag, reference: Ref) -> Result<AccessId> {
        self.tracked(|c| c.begin_write(tag, reference))
    }

    /// Rebind a read handle to the next element matching `(tag, ref)`
    pub fn next_read(
        &mut self,
        id: AccessId,
        tag: Tag,
        reference: Ref,
        positioning: Positioning,
    ) -> Result<()> {
        self.tracked(|c| c.rebind(id, tag, reference, positioning))
    }

    /// Rebind a read handle to the next element matching the pattern it was
    /// opened with
    pub fn next_match(&mut self, id: AccessId) -> Result<()> {
        self.tracked(|c| {
            let (tag, reference) = c
                .accesses
                .get(id)?
                .pattern
                .ok_or_else(|| HdfError::BadArgs(format!("{} was not opened for reading", id)))?;
            c.rebind(id, tag, reference, Positioning::Current)
        })
    }

    pub fn end_access(&mut self, id: AccessId) -> Result<()> {
        self.tracked(|c| c.release(id))
    }

    /// Read at the handle's position; returns fewer bytes only at end of
    /// element
    pub fn read(&mut self, id: AccessId, buf: &mut [u8]) -> Result<usize> {
        self.tracked(|c| {
            let (mut be, accesses) = c.parts();
            let access = accesses.get_mut(id)?;
            access.ensure_byte_mode(id)?;
            let n = access
                .storage
                .lock()
                .read(&mut be, access.slot, access.position, buf)?;
            access.position += n as u64;
            Ok(n)
        })
    }

    pub fn write(&mut self, id: AccessId, data: &[u8]) -> Result<()> {
        self.tracked(|c| {
            let (mut be, accesses) = c.parts();
            let access = accesses.get_mut(id)?;
            access.ensure_byte_mode(id)?;
            if access.mode != AccessMode::Write {
                return Err(HdfError::BadArgs(format!("{} is a read handle", id)));
            }
            access
                .storage
                .lock()
                .write(&mut be, access.slot, access.position, data)?;
            access.position += data.len() as u64;
            Ok(())
        })
    }

    /// Move the handle's position; read handles cannot move past the end
    pub fn seek(&mut self, id: AccessId, pos: SeekFrom) -> Result<u64> {
        self.tracked(|c| {
            let (be, accesses) = c.parts();
            let access = accesses.get_mut(id)?;
            access.ensure_byte_mode(id)?;
            let length = access.storage.lock().length(&be, access.slot)?;
            let target = match pos {
                SeekFrom::Start(n) => Some(n),
                SeekFrom::Current(d) => access.position.checked_add_signed(d),
                SeekFrom::End(d) => length.checked_add_signed(d),
            }
            .ok_or_else(|| HdfError::BadArgs(format!("seek to {:?} before start", pos)))?;
            if access.mode == AccessMode::Read && target > length {
                return Err(HdfError::BadArgs(format!(
                    "seek to {} past end of {}-byte element",
                    target, length
                )));
            }
            access.position = target;
            Ok(target)
        })
    }

    /// Read one whole chunk of a chunked element
    pub fn read_chunk(&mut self, id: AccessId, coords: &[u32], buf: &mut [u8]) -> Result<()> {
        self.tracked(|c| {
            let (mut be, accesses) = c.parts();
            with_chunked(accesses.get(id)?, id, |el| el.read_chunk(&mut be, coords, buf))
        })
    }

    pub fn write_chunk(&mut self, id: AccessId, coords: &[u32], data: &[u8]) -> Result<()> {
        self.tracked(|c| {
            let (mut be, accesses) = c.parts();
            let access = accesses.get_mut(id)?;
            if access.mode != AccessMode::Write {
                return Err(HdfError::BadArgs(format!("{} is a read handle", id)));
            }
            with_chunked(access, id, |el| el.write_chunk(&mut be, coords, data))
        })
    }

    /// Set how many chunks the element's cache holds; returns the capacity
    /// actually applied after the byte budget. The cache is shared by every
    /// handle open on the element.
    pub fn set_chunk_cache(&mut self, id: AccessId, capacity: usize) -> Result<usize> {
        self.tracked(|c| {
            let (mut be, accesses) = c.parts();
            with_chunked(accesses.get(id)?, id, |el| el.set_cache_capacity(&mut be, capacity))
        })
    }

    pub fn chunk_cache_stats(&mut self, id: AccessId) -> Result<ChunkCacheStats> {
        self.tracked(|c| with_chunked(c.accesses.get(id)?, id, |el| Ok(el.cache_stats())))
    }

    pub fn is_chunk_cached(&mut self, id: AccessId, coords: &[u32]) -> Result<bool> {
        self.tracked(|c| with_chunked(c.accesses.get(id)?, id, |el| Ok(el.is_cached(coords))))
    }

    pub fn inquire(&mut self, id: AccessId) -> Result<ElementInfo> {
        self.tracked(|c| {
            let (be, accesses) = c.parts();
            let access = accesses.get(id)?;
            let dd = be.descriptor(access.slot)?;
            let storage = access.storage.lock();
            Ok(ElementInfo {
                tag: access.tag,
                reference: access.reference,
                length: storage.length(&be, access.slot)?,
                offset: dd.offset,
                position: access.position,
                mode: access.mode,
                special: storage.kind(),
            })
        })
    }

    pub fn special_info(&mut self, id: AccessId) -> Result<SpecialInfo> {
        self.tracked(|c| {
            let (be, accesses) = c.parts();
            Ok(accesses.get(id)?.storage.lock().info(&be))
        })
    }

    /// Elements with base tag `tag` (every element for the wildcard); DDs
    /// sharing their bytes count once
    pub fn number_of(&self, tag: Tag) -> usize {
        self.last_error.set(None);
        self.directory.number_of(tag)
    }

    /// Next DD matching `(tag, ref)` after the element `after` (from the
    /// corresponding end when `None`)
    pub fn find(
        &self,
        tag: Tag,
        reference: Ref,
        after: Option<(Tag, Ref)>,
        direction: Direction,
    ) -> Result<Option<Descriptor>> {
        self.last_error.set(None);
        let result = (|| -> Result<Option<Descriptor>> {
            let from = match after {
                Some((t, r)) => Some(
                    self.directory
                        .locate(t, r)
                        .filter(|_| t != TAG_WILDCARD && r != REF_WILDCARD)
                        .ok_or_else(|| HdfError::not_found(t, r))?,
                ),
                None => None,
            };
            Ok(self
                .directory
                .find_next(tag, reference, from, direction)
                .and_then(|slot| self.directory.get(slot).copied()))
        })();
        self.record(result)
    }

    pub fn scan(&self, tag: Tag, reference: Ref) -> ElementScan {
        ElementScan {
            tag,
            reference,
            cursor: None,
            done: false,
        }
    }

    pub fn scan_next(&self, scan: &mut ElementScan) -> Option<Descriptor> {
        if scan.done {
            return None;
        }
        match self
            .directory
            .find_next(scan.tag, scan.reference, scan.cursor, Direction::Forward)
        {
            Some(slot) => {
                scan.cursor = Some(slot);
                self.directory.get(slot).copied()
            }
            None => {
                scan.done = true;
                None
            }
        }
    }

    /// Iterate the DDs matching `(tag, ref)` in directory order
    pub fn elements(&self, tag: Tag, reference: Ref) -> impl Iterator<Item = Descriptor> + '_ {
        let mut scan = self.scan(tag, reference);
        std::iter::from_fn(move || self.scan_next(&mut scan))
    }

    /// Page through live DDs: skip `start`, return at most `max`
    pub fn descriptors(&self, start: usize, max: usize) -> Vec<Descriptor> {
        self.directory.descriptors(start, max)
    }

    pub fn new_ref(&self) -> Result<Ref> {
        self.last_error.set(None);
        let result = self.directory.new_ref();
        self.record(result)
    }

    /// Ref to be used by the next write that does not name one
    pub fn set_pending_ref(&mut self, reference: Ref) {
        self.pending_ref = (reference != REF_WILDCARD).then_some(reference);
    }

    /// Take the pending ref, or a fresh one when none is set
    pub fn next_write_ref(&mut self) -> Result<Ref> {
        self.tracked(|c| c.take_write_ref())
    }

    /// Whole contents of the first element matching `(tag, ref)`
    pub fn get_element(&mut self, tag: Tag, reference: Ref) -> Result<Vec<u8>> {
        self.tracked(|c| {
            let slot = c
                .directory
                .locate(tag, reference)
                .ok_or_else(|| HdfError::not_found(tag, reference))?;
            let storage = c.element_storage(slot)?;
            let mut storage = storage.lock();
            let (mut be, _) = c.parts();
            let length = storage.length(&be, slot)? as usize;
            let mut data = vec![0u8; length];
            let n = storage.read(&mut be, slot, 0, &mut data)?;
            if n != length {
                return Err(HdfError::ShortIo {
                    expected: length,
                    actual: n,
                });
            }
            Ok(data)
        })
    }

    /// Replace the contents of `(tag, ref)`, creating it if needed. A plain
    /// element of the same length is rewritten where it is.
    pub fn put_element(&mut self, tag: Tag, reference: Ref, data: &[u8]) -> Result<()> {
        self.tracked(|c| {
            c.ensure_writable()?;
            if tag == TAG_WILDCARD || reference == REF_WILDCARD {
                return Err(HdfError::BadArgs("put_element needs an exact tag and ref".into()));
            }
            let key = (base_tag(tag), reference);
            if c.accesses.writer_open(key) {
                return Err(HdfError::AlreadyOpen {
                    tag: key.0,
                    reference,
                });
            }
            match c.directory.locate(tag, reference) {
                Some(slot) if is_special_tag(c.directory_tag(slot)?) => {
                    let storage = c.element_storage(slot)?;
                    let mut storage = storage.lock();
                    let (mut be, _) = c.parts();
                    storage.write(&mut be, slot, 0, data)?;
                    storage.flush(&mut be, slot)?;
                }
                _ => {
                    let (mut be, _) = c.parts();
                    be.store_element(key.0, reference, data)?;
                }
            }
            debug!(tag = key.0, reference, len = data.len(), "put element");
            Ok(())
        })
    }

    pub fn element_length(&mut self, tag: Tag, reference: Ref) -> Result<u64> {
        self.tracked(|c| {
            let slot = c
                .directory
                .locate(tag, reference)
                .ok_or_else(|| HdfError::not_found(tag, reference))?;
            let storage = c.element_storage(slot)?;
            let storage = storage.lock();
            let (be, _) = c.parts();
            storage.length(&be, slot)
        })
    }

    pub fn exists(&self, tag: Tag, reference: Ref) -> bool {
        self.last_error.set(None);
        self.directory.locate(tag, reference).is_some()
    }

    /// Remove the DD of `(tag, ref)`; file space is not reclaimed
    pub fn delete(&mut self, tag: Tag, reference: Ref) -> Result<()> {
        self.tracked(|c| {
            c.ensure_writable()?;
            let key = (base_tag(tag), reference);
            if c.accesses.is_open(key) {
                return Err(HdfError::AlreadyOpen {
                    tag: key.0,
                    reference,
                });
            }
            c.directory.free(tag, reference)?;
            let (mut be, _) = c.parts();
            clear_bit_tail(&mut be, key.0, reference)
        })
    }

    /// Add `(tag, ref)` as a second name for the bytes of `(old_tag, old_ref)`
    pub fn duplicate(&mut self, tag: Tag, reference: Ref, old_tag: Tag, old_ref: Ref) -> Result<()> {
        self.tracked(|c| {
            c.ensure_writable()?;
            c.directory
                .duplicate(&mut c.file, tag, reference, old_tag, old_ref)
                .map(|_| ())
        })
    }

    /// Turn `(tag, ref)` into a linked-block element and open it for writing.
    /// Existing bytes become the first block. `None` takes the configured
    /// block layout.
    pub fn create_linked(
        &mut self,
        tag: Tag,
        reference: Ref,
        block_len: Option<u32>,
        blocks_per_table: Option<u32>,
    ) -> Result<AccessId> {
        self.tracked(|c| {
            let block_len = block_len.unwrap_or(c.config.linked_block_len);
            let nblocks = blocks_per_table.unwrap_or(c.config.linked_block_count);
            c.create_special(tag, reference, |be, slot| {
                LinkedElement::promote(be, slot, block_len, nblocks)
            })
        })
    }

    /// Move `(tag, ref)` out to `path` at `offset` and open it for writing
    pub fn create_external<P: AsRef<Path>>(
        &mut self,
        tag: Tag,
        reference: Ref,
        path: P,
        offset: u32,
    ) -> Result<AccessId> {
        let path = path.as_ref();
        self.tracked(|c| {
            c.create_special(tag, reference, |be, slot| {
                ExternalElement::promote(be, slot, path, offset)
            })
        })
    }

    /// Compress `(tag, ref)` and open it for writing
    pub fn create_compressed(
        &mut self,
        tag: Tag,
        reference: Ref,
        compression: CompressionConfig,
    ) -> Result<AccessId> {
        self.tracked(|c| {
            c.create_special(tag, reference, |be, slot| {
                CompressedElement::promote(be, slot, compression)
            })
        })
    }

    /// Create a chunked element at `(tag, ref)`, which must be new or empty,
    /// and open it for writing
    pub fn create_chunked(&mut self, tag: Tag, reference: Ref, spec: ChunkSpec) -> Result<AccessId> {
        self.tracked(|c| {
            c.create_special(tag, reference, |be, slot| {
                ChunkedElement::initialize(be, slot, spec)
            })
        })
    }

    /// Open `(tag, ref)` for bit-level reading
    pub fn start_bit_read(&mut self, tag: Tag, reference: Ref) -> Result<AccessId> {
        self.tracked(|c| {
            let id = c.begin_read(tag, reference)?;
            let buffer_size = c.config.bit_buffer_size;
            let setup = (|| -> Result<()> {
                let (mut be, accesses) = c.parts();
                let access = accesses.get_mut(id)?;
                let length = access.storage.lock().length(&be, access.slot)?;
                let valid = find_bit_tail(&mut be, access.tag, access.reference)?
                    .map_or(8, |(_, valid)| valid);
                access.bit = Some(BitSession::Read(BitReader::new(length, valid, buffer_size)));
                Ok(())
            })();
            if let Err(e) = setup {
                let _ = c.accesses.remove(id);
                return Err(e);
            }
            Ok(id)
        })
    }

    /// Open `(tag, ref)` for bit-level writing from its first byte. Ending
    /// the session truncates a plain element to the bits written; special
    /// elements keep any bytes past that point.
    pub fn start_bit_write(&mut self, tag: Tag, reference: Ref) -> Result<AccessId> {
        self.tracked(|c| {
            let id = c.begin_write(tag, reference)?;
            let buffer_size = c.config.bit_buffer_size;
            let access = c.accesses.get_mut(id)?;
            access.bit = Some(BitSession::Write {
                writer: BitWriter::new(0, buffer_size),
                appendable: false,
            });
            Ok(id)
        })
    }

    /// Continue the bit stream at the end of the element's existing bits and
    /// record the final partial byte when the session ends. Must be called
    /// before any bits are written.
    pub fn bit_appendable(&mut self, id: AccessId) -> Result<()> {
        self.tracked(|c| {
            let buffer_size = c.config.bit_buffer_size;
            let (mut be, accesses) = c.parts();
            let access = accesses.get_mut(id)?;
            let untouched = match &access.bit {
                Some(BitSession::Write { writer, .. }) => {
                    writer.byte_position() == 0 && writer.bit_offset() == 0
                }
                _ => return Err(HdfError::BadArgs(format!("{} is not a bit writer", id))),
            };
            if !untouched {
                return Err(HdfError::BadArgs(format!(
                    "{} already wrote bits; appendable must come first",
                    id
                )));
            }

            let mut storage = access.storage.lock();
            let length = storage.length(&be, access.slot)?;
            let tail = find_bit_tail(&mut be, access.tag, access.reference)?;
            let writer = match tail {
                Some((_, valid)) if valid < 8 && length > 0 => {
                    let mut last = [0u8; 1];
                    storage.read(&mut be, access.slot, length - 1, &mut last)?;
                    BitWriter::resume(length - 1, last[0], valid, buffer_size)
                }
                _ => BitWriter::new(length, buffer_size),
            };
            drop(storage);
            access.bit = Some(BitSession::Write {
                writer,
                appendable: true,
            });
            Ok(())
        })
    }

    pub fn bit_write(&mut self, id: AccessId, width: u32, value: u32) -> Result<()> {
        self.tracked(|c| {
            let (mut be, accesses) = c.parts();
            let access = accesses.get_mut(id)?;
            match &mut access.bit {
                Some(BitSession::Write { writer, .. }) => {
                    let mut storage = access.storage.lock();
                    let mut stream = HandleStream {
                        storage: &mut *storage,
                        be: &mut be,
                        slot: access.slot,
                    };
                    writer.write(&mut stream, width, value)
                }
                _ => Err(HdfError::BadArgs(format!("{} is not a bit writer", id))),
            }
        })
    }

    /// Read up to `width` bits; returns the value and the number of bits
    /// read, which is short only at end of data
    pub fn bit_read(&mut self, id: AccessId, width: u32) -> Result<(u32, u32)> {
        self.tracked(|c| {
            let (mut be, accesses) = c.parts();
            let access = accesses.get_mut(id)?;
            match &mut access.bit {
                Some(BitSession::Read(reader)) => {
                    let mut storage = access.storage.lock();
                    let mut stream = HandleStream {
                        storage: &mut *storage,
                        be: &mut be,
                        slot: access.slot,
                    };
                    reader.read(&mut stream, width)
                }
                _ => Err(HdfError::BadArgs(format!("{} is not a bit reader", id))),
            }
        })
    }

    pub fn bit_seek(&mut self, id: AccessId, byte_offset: u64, bit_offset: u32) -> Result<()> {
        self.tracked(|c| match &mut c.accesses.get_mut(id)?.bit {
            Some(BitSession::Read(reader)) => reader.seek(byte_offset, bit_offset),
            _ => Err(HdfError::BadArgs(format!("{} is not a bit reader", id))),
        })
    }

    /// End a bit session and release its handle
    pub fn end_bit_access(&mut self, id: AccessId) -> Result<()> {
        self.tracked(|c| {
            if c.accesses.get(id)?.bit.is_none() {
                return Err(HdfError::BadArgs(format!("{} has no bit session", id)));
            }
            c.release(id)
        })
    }

    pub fn stats(&self) -> ContainerStats {
        ContainerStats {
            elements: self.directory.len(),
            dd_slots: self.directory.capacity(),
            empty_slots: self.directory.empty_slots(),
            dd_blocks: self.directory.block_count(),
            open_accesses: self.accesses.len(),
            file_size: self.file.end(),
        }
    }

    pub fn tag_name(tag: Tag) -> Option<&'static str> {
        crate::core::tags::tag_name(tag)
    }

    fn tracked<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.last_error.set(None);
        let result = op(self);
        self.record(result)
    }

    fn record<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.last_error.set(Some(e.kind()));
        }
        result
    }

    fn parts(&mut self) -> (Backend<'_>, &mut AccessTable) {
        let Container {
            file,
            directory,
            accesses,
            config,
            base_dir,
            ..
        } = self;
        (
            Backend {
                file,
                directory,
                config,
                base_dir,
            },
            accesses,
        )
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.mode == OpenMode::Read {
            return Err(HdfError::BadOpen(format!(
                "{:?} was opened read-only",
                self.file.path()
            )));
        }
        Ok(())
    }

    fn take_write_ref(&mut self) -> Result<Ref> {
        match self.pending_ref.take() {
            Some(reference) => Ok(reference),
            None => self.directory.new_ref(),
        }
    }

    fn open_access(
        &mut self,
        slot: usize,
        mode: AccessMode,
        pattern: Option<(Tag, Ref)>,
    ) -> Result<AccessId> {
        let storage = self.element_storage(slot)?;
        let (be, accesses) = self.parts();
        let dd = be.descriptor(slot)?;
        let id = accesses.insert(Access {
            tag: base_tag(dd.tag),
            reference: dd.reference,
            slot,
            mode,
            position: 0,
            storage,
            bit: None,
            pattern,
        })?;
        debug!(%id, tag = dd.tag, reference = dd.reference, ?mode, "started access");
        Ok(id)
    }

    fn begin_read(&mut self, tag: Tag, reference: Ref) -> Result<AccessId> {
        let slot = self
            .directory
            .locate(tag, reference)
            .ok_or_else(|| HdfError::not_found(tag, reference))?;
        self.open_access(slot, AccessMode::Read, Some((tag, reference)))
    }

    fn begin_write(&mut self, tag: Tag, reference: Ref) -> Result<AccessId> {
        self.ensure_writable()?;
        if tag == TAG_WILDCARD {
            return Err(HdfError::BadArgs("start_write needs a tag".into()));
        }
        let reference = if reference == REF_WILDCARD {
            self.take_write_ref()?
        } else {
            reference
        };
        let key = (base_tag(tag), reference);
        if self.accesses.writer_open(key) {
            return Err(HdfError::AlreadyOpen {
                tag: key.0,
                reference,
            });
        }
        let slot = match self.directory.locate(tag, reference) {
            Some(slot) => slot,
            None => self.directory.allocate(&mut self.file, key.0, reference)?,
        };
        self.open_access(slot, AccessMode::Write, None)
    }

    fn create_special(
        &mut self,
        tag: Tag,
        reference: Ref,
        convert: impl FnOnce(&mut Backend<'_>, usize) -> Result<()>,
    ) -> Result<AccessId> {
        self.ensure_writable()?;
        if tag == TAG_WILDCARD || reference == REF_WILDCARD {
            return Err(HdfError::BadArgs("special elements need an exact tag and ref".into()));
        }
        let key = (base_tag(tag), reference);
        if self.accesses.is_open(key) {
            return Err(HdfError::AlreadyOpen {
                tag: key.0,
                reference,
            });
        }
        let (slot, created) = match self.directory.locate(tag, reference) {
            Some(slot) => (slot, false),
            None => (self.directory.allocate(&mut self.file, key.0, reference)?, true),
        };
        let (mut be, _) = self.parts();
        if let Err(e) = convert(&mut be, slot) {
            if created {
                be.directory.free_slot(slot);
            }
            return Err(e);
        }
        self.open_access(slot, AccessMode::Write, None)
    }

    fn rebind(&mut self, id: AccessId, tag: Tag, reference: Ref, positioning: Positioning) -> Result<()> {
        let access = self.accesses.get(id)?;
        if access.mode != AccessMode::Read || access.bit.is_some() {
            return Err(HdfError::BadArgs(format!("{} is not a byte read handle", id)));
        }
        let from = match positioning {
            Positioning::Start => None,
            Positioning::Current => Some(access.slot),
        };
        let slot = self
            .directory
            .find_next(tag, reference, from, Direction::Forward)
            .ok_or_else(|| HdfError::not_found(tag, reference))?;
        let storage = self.element_storage(slot)?;

        let (mut be, accesses) = self.parts();
        let dd = be.descriptor(slot)?;
        let access = accesses.get_mut(id)?;
        let previous = std::mem::replace(&mut access.storage, storage);
        let old_key = access.key();
        let old_slot = access.slot;
        access.tag = base_tag(dd.tag);
        access.reference = dd.reference;
        access.slot = slot;
        access.position = 0;
        if !accesses.is_open(old_key) {
            previous.lock().flush(&mut be, old_slot)?;
        }
        Ok(())
    }

    fn release(&mut self, id: AccessId) -> Result<()> {
        let (mut be, accesses) = self.parts();
        let mut access = accesses.remove(id)?;
        let last = !accesses.is_open(access.key());
        let result = finish_access(&mut be, &mut access, last);
        debug!(%id, tag = access.tag, reference = access.reference, last, "ended access");
        result
    }

    /// Storage of the element at `slot`: the one its open handles share, or
    /// a freshly resolved one
    fn element_storage(&mut self, slot: usize) -> Result<SharedStorage> {
        let (mut be, accesses) = self.parts();
        let dd = be.descriptor(slot)?;
        match accesses.shared_storage((base_tag(dd.tag), dd.reference)) {
            Some(storage) => Ok(storage),
            None => Ok(Storage::resolve(&mut be, slot)?.shared()),
        }
    }

    fn directory_tag(&self, slot: usize) -> Result<Tag> {
        self.directory
            .get(slot)
            .map(|dd| dd.tag)
            .ok_or_else(|| HdfError::corrupt(format!("DD slot {} is empty", slot)))
    }

    /// Release every handle and write the directory; returns the first
    /// failure
    fn teardown(&mut self) -> Option<HdfError> {
        let mut first = None;
        for id in self.accesses.ids() {
            if let Err(e) = self.release(id) {
                warn!("Failed to end {} during close: {}", id, e);
                first.get_or_insert(e);
            }
        }
        if self.file.is_writable() {
            let written = self
                .directory
                .flush(&mut self.file)
                .and_then(|_| self.file.sync());
            if let Err(e) = written {
                warn!("Failed to write directory of {:?}: {}", self.file.path(), e);
                first.get_or_insert(e);
            }
        }
        self.closed = true;
        first
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if !self.closed {
            if let Some(e) = self.teardown() {
                warn!("Container {:?} dropped with errors: {}", self.file.path(), e);
            }
        }
    }
}

fn with_chunked<T>(
    access: &Access,
    id: AccessId,
    op: impl FnOnce(&mut ChunkedElement) -> Result<T>,
) -> Result<T> {
    let mut storage = access.storage.lock();
    let element = storage
        .as_chunked()
        .ok_or_else(|| HdfError::BadArgs(format!("{} is not a chunked element", id)))?;
    op(element)
}

/// Finish any bit session, then flush the element's buffered state. A
/// reader that is not the last handle on the element leaves the shared
/// state alone.
fn finish_access(be: &mut Backend<'_>, access: &mut Access, last: bool) -> Result<()> {
    let mut storage = access.storage.lock();
    match access.bit.take() {
        Some(BitSession::Write {
            mut writer,
            appendable,
        }) => {
            let valid = {
                let mut stream = HandleStream {
                    storage: &mut *storage,
                    be: &mut *be,
                    slot: access.slot,
                };
                writer.finish(&mut stream)?
            };
            access.position = writer.byte_position();
            if appendable {
                record_bit_tail(be, access.tag, access.reference, valid)?;
            } else {
                clear_bit_tail(be, access.tag, access.reference)?;
                if storage.kind().is_none() {
                    be.truncate_slot(access.slot, access.position)?;
                }
            }
        }
        Some(BitSession::Read(reader)) => {
            access.position = reader.position().div_ceil(8);
        }
        None => {}
    }
    if last || access.mode == AccessMode::Write {
        storage.flush(be, access.slot)?;
    }
    Ok(())
}
