//! Linked-block elements
//!
//! The element's bytes live in a chain of blocks, each its own
//! `(TAG_LINKED, ref)` element. Block 0 spans `first_len` bytes, every later
//! block `block_len`. Block refs are listed in link tables of `nblocks`
//! entries; each table names the next one, `0` ending the chain. A zero block
//! ref means the block was never written and reads as zeros.
//!
//! ```text
//! control block  code u16, length u32, first_len u32, block_len u32,
//!                nblocks u32, link_ref u16
//! link table     next u16, nblocks x block_ref u16
//! ```

use super::{checked_len, clamp_read, Backend, SpecialInfo, SpecialKind};
use crate::core::error::{HdfError, Result};
use crate::core::tags::{is_special_tag, Ref, REF_WILDCARD, TAG_LINKED};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashSet;
use tracing::debug;

pub const LINKED_HEADER_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkedHeader {
    /// Logical length of the element
    pub length: u32,
    pub first_len: u32,
    pub block_len: u32,
    /// Block refs per link table
    pub nblocks: u32,
    /// Ref of the first link table
    pub link_ref: Ref,
}

impl LinkedHeader {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(LINKED_HEADER_LEN);
        out.write_u16::<BigEndian>(SpecialKind::Linked.code())?;
        out.write_u32::<BigEndian>(self.length)?;
        out.write_u32::<BigEndian>(self.first_len)?;
        out.write_u32::<BigEndian>(self.block_len)?;
        out.write_u32::<BigEndian>(self.nblocks)?;
        out.write_u16::<BigEndian>(self.link_ref)?;
        Ok(out)
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self> {
        let bad = |_| HdfError::corrupt("truncated linked-block header");
        let code = bytes.read_u16::<BigEndian>().map_err(bad)?;
        if code != SpecialKind::Linked.code() {
            return Err(HdfError::corrupt(format!("special code {} is not linked", code)));
        }
        let header = LinkedHeader {
            length: bytes.read_u32::<BigEndian>().map_err(bad)?,
            first_len: bytes.read_u32::<BigEndian>().map_err(bad)?,
            block_len: bytes.read_u32::<BigEndian>().map_err(bad)?,
            nblocks: bytes.read_u32::<BigEndian>().map_err(bad)?,
            link_ref: bytes.read_u16::<BigEndian>().map_err(bad)?,
        };
        if header.block_len == 0 {
            return Err(HdfError::corrupt("linked block length is 0"));
        }
        if header.nblocks == 0 || header.nblocks > u16::MAX as u32 {
            return Err(HdfError::corrupt(format!(
                "link table size {} out of range",
                header.nblocks
            )));
        }
        if header.link_ref == REF_WILDCARD {
            return Err(HdfError::corrupt("linked element has no link table"));
        }
        Ok(header)
    }
}

#[derive(Debug)]
struct LinkTable {
    slot: usize,
    next: Ref,
    blocks: Vec<Ref>,
    dirty: bool,
}

impl LinkTable {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        encode_table(self.next, &self.blocks)
    }

    fn parse(slot: usize, mut bytes: &[u8], nblocks: usize) -> Result<Self> {
        if bytes.len() != 2 + 2 * nblocks {
            return Err(HdfError::corrupt(format!(
                "link table of {} bytes, expected {}",
                bytes.len(),
                2 + 2 * nblocks
            )));
        }
        let bad = |_| HdfError::corrupt("truncated link table");
        let next = bytes.read_u16::<BigEndian>().map_err(bad)?;
        let mut blocks = Vec::with_capacity(nblocks);
        for _ in 0..nblocks {
            blocks.push(bytes.read_u16::<BigEndian>().map_err(bad)?);
        }
        Ok(LinkTable {
            slot,
            next,
            blocks,
            dirty: false,
        })
    }
}

fn encode_table(next: Ref, blocks: &[Ref]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(2 + 2 * blocks.len());
    out.write_u16::<BigEndian>(next)?;
    for &block in blocks {
        out.write_u16::<BigEndian>(block)?;
    }
    Ok(out)
}

pub(crate) struct LinkedElement {
    header: LinkedHeader,
    tables: Vec<LinkTable>,
    header_dirty: bool,
}

impl LinkedElement {
    pub(crate) fn open(be: &mut Backend<'_>, block: &[u8]) -> Result<Self> {
        let header = LinkedHeader::from_bytes(block)?;
        let mut tables = Vec::new();
        let mut seen = HashSet::new();
        let mut next = header.link_ref;

        while next != REF_WILDCARD {
            if !seen.insert(next) {
                return Err(HdfError::corrupt(format!("link table chain loops at ref {}", next)));
            }
            let slot = be
                .directory
                .locate(TAG_LINKED, next)
                .ok_or_else(|| HdfError::corrupt(format!("link table {} is missing", next)))?;
            let bytes = be.read_slot(slot).map_err(|_| {
                HdfError::corrupt(format!("link table {} extends past end of file", next))
            })?;
            let table = LinkTable::parse(slot, &bytes, header.nblocks as usize)?;
            next = table.next;
            tables.push(table);
        }

        Ok(LinkedElement {
            header,
            tables,
            header_dirty: false,
        })
    }

    /// Turn the plain element at `slot` into a linked one; existing bytes
    /// become block 0
    pub(crate) fn promote(be: &mut Backend<'_>, slot: usize, block_len: u32, nblocks: u32) -> Result<()> {
        let dd = be.descriptor(slot)?;
        if is_special_tag(dd.tag) {
            return Err(HdfError::BadArgs(format!(
                "tag {} ref {} is already a special element",
                dd.tag, dd.reference
            )));
        }
        if block_len == 0 || nblocks == 0 || nblocks > u16::MAX as u32 {
            return Err(HdfError::BadArgs(format!(
                "invalid linked layout: block_len {} nblocks {}",
                block_len, nblocks
            )));
        }

        let mut blocks = vec![REF_WILDCARD; nblocks as usize];
        let first_len = if dd.length > 0 {
            let first = be.directory.allocate(be.file, TAG_LINKED, REF_WILDCARD)?;
            be.directory.update(first, dd.offset, dd.length);
            blocks[0] = be.descriptor(first)?.reference;
            dd.length
        } else {
            block_len
        };
        let (link_ref, _) = be.append_element(TAG_LINKED, &encode_table(REF_WILDCARD, &blocks)?)?;

        let header = LinkedHeader {
            length: dd.length,
            first_len,
            block_len,
            nblocks,
            link_ref,
        };
        be.relocate_slot(slot, &header.to_bytes()?)?;
        be.directory.set_special(slot, true)?;
        debug!(tag = dd.tag, reference = dd.reference, first_len, block_len, "promoted to linked blocks");
        Ok(())
    }

    pub fn length(&self) -> u64 {
        self.header.length as u64
    }

    /// Logical span of block `i`: (start, len)
    fn span(&self, i: u64) -> (u64, u64) {
        let first = self.header.first_len as u64;
        let std_len = self.header.block_len as u64;
        if i == 0 {
            (0, first)
        } else {
            (first + (i - 1) * std_len, std_len)
        }
    }

    /// Block index and offset within it of logical byte `pos`
    fn locate(&self, pos: u64) -> (u64, u64) {
        let first = self.header.first_len as u64;
        if pos < first {
            return (0, pos);
        }
        let std_len = self.header.block_len as u64;
        let rel = pos - first;
        (1 + rel / std_len, rel % std_len)
    }

    fn block_ref(&self, i: u64) -> Ref {
        let per = self.header.nblocks as u64;
        self.tables
            .get((i / per) as usize)
            .map_or(REF_WILDCARD, |t| t.blocks[(i % per) as usize])
    }

    fn set_block_ref(&mut self, be: &mut Backend<'_>, i: u64, block: Ref) -> Result<()> {
        let per = self.header.nblocks as u64;
        let t = (i / per) as usize;
        while self.tables.len() <= t {
            let (reference, slot) = be.reserve_element(TAG_LINKED)?;
            if let Some(prev) = self.tables.last_mut() {
                prev.next = reference;
                prev.dirty = true;
            }
            self.tables.push(LinkTable {
                slot,
                next: REF_WILDCARD,
                blocks: vec![REF_WILDCARD; per as usize],
                dirty: true,
            });
            debug!(reference, "chained new link table");
        }
        let table = &mut self.tables[t];
        table.blocks[(i % per) as usize] = block;
        table.dirty = true;
        Ok(())
    }

    pub(crate) fn read(&mut self, be: &mut Backend<'_>, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let n = clamp_read(self.length(), pos, buf.len());
        let mut done = 0usize;
        while done < n {
            let (i, off) = self.locate(pos + done as u64);
            let (_, len) = self.span(i);
            let take = ((len - off) as usize).min(n - done);
            let out = &mut buf[done..done + take];

            match self.block_ref(i) {
                REF_WILDCARD => out.fill(0),
                block => {
                    let slot = be.directory.locate(TAG_LINKED, block).ok_or(HdfError::ShortIo {
                        expected: take,
                        actual: 0,
                    })?;
                    let dd = be.descriptor(slot)?;
                    let avail = (dd.length as u64).saturating_sub(off).min(take as u64) as usize;
                    if avail > 0 {
                        be.file.read_at(dd.offset as u64 + off, &mut out[..avail])?;
                    }
                    if avail < take {
                        return Err(HdfError::ShortIo {
                            expected: take,
                            actual: avail,
                        });
                    }
                }
            }
            done += take;
        }
        Ok(n)
    }

    pub(crate) fn write(&mut self, be: &mut Backend<'_>, pos: u64, data: &[u8]) -> Result<()> {
        let end = pos + data.len() as u64;
        let new_len = checked_len(end as usize)?;
        let mut done = 0usize;

        while done < data.len() {
            let (i, off) = self.locate(pos + done as u64);
            let (_, len) = self.span(i);
            let take = ((len - off) as usize).min(data.len() - done);
            let part = &data[done..done + take];
            let off = off as usize;

            match self.block_ref(i) {
                REF_WILDCARD => {
                    let mut block = vec![0u8; len as usize];
                    block[off..off + take].copy_from_slice(part);
                    let (reference, _) = be.append_element(TAG_LINKED, &block)?;
                    self.set_block_ref(be, i, reference)?;
                }
                block => {
                    let slot = be.directory.locate(TAG_LINKED, block).ok_or(HdfError::ShortIo {
                        expected: take,
                        actual: 0,
                    })?;
                    let dd = be.descriptor(slot)?;
                    if off + take <= dd.length as usize {
                        be.file.write_at(dd.offset as u64 + off as u64, part)?;
                    } else {
                        let mut bytes = be.read_slot(slot)?;
                        bytes.resize((len as usize).max(off + take), 0);
                        bytes[off..off + take].copy_from_slice(part);
                        be.store_slot(slot, &bytes)?;
                    }
                }
            }
            done += take;
        }

        if new_len > self.header.length {
            self.header.length = new_len;
            self.header_dirty = true;
        }
        Ok(())
    }

    pub(crate) fn flush(&mut self, be: &mut Backend<'_>, slot: usize) -> Result<()> {
        for table in self.tables.iter_mut().filter(|t| t.dirty) {
            be.store_slot(table.slot, &table.to_bytes()?)?;
            table.dirty = false;
        }
        if self.header_dirty {
            be.store_slot(slot, &self.header.to_bytes()?)?;
            self.header_dirty = false;
        }
        Ok(())
    }

    pub fn info(&self) -> SpecialInfo {
        SpecialInfo::Linked {
            length: self.header.length,
            first_len: self.header.first_len,
            block_len: self.header.block_len,
            blocks_per_table: self.header.nblocks,
            blocks_allocated: self
                .tables
                .iter()
                .flat_map(|t| t.blocks.iter())
                .filter(|&&r| r != REF_WILDCARD)
                .count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixture::Fixture;
    use super::super::Storage;
    use super::*;
    use crate::core::tags::TAG_RI8;

    fn linked_element(fx: &mut Fixture, initial: &[u8], block_len: u32, nblocks: u32) -> usize {
        let mut be = fx.backend();
        let slot = be.directory.allocate(be.file, TAG_RI8, 1).unwrap();
        if !initial.is_empty() {
            be.relocate_slot(slot, initial).unwrap();
        }
        LinkedElement::promote(&mut be, slot, block_len, nblocks).unwrap();
        slot
    }

    fn read_all(storage: &mut Storage, fx: &mut Fixture, slot: usize) -> Vec<u8> {
        let mut be = fx.backend();
        let len = storage.length(&be, slot).unwrap() as usize;
        let mut buf = vec![0u8; len];
        let n = storage.read(&mut be, slot, 0, &mut buf).unwrap();
        assert_eq!(n, len);
        buf
    }

    #[test]
    fn test_header_layout() {
        let header = LinkedHeader {
            length: 10,
            first_len: 4,
            block_len: 8,
            nblocks: 16,
            link_ref: 3,
        };
        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes.len(), LINKED_HEADER_LEN);
        assert_eq!(&bytes[0..2], &[0, 1]);
        assert_eq!(LinkedHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_zero_block_len_is_corrupt() {
        let mut bytes = LinkedHeader {
            length: 0,
            first_len: 4,
            block_len: 8,
            nblocks: 16,
            link_ref: 3,
        }
        .to_bytes()
        .unwrap();
        bytes[10..14].copy_from_slice(&0u32.to_be_bytes());
        assert!(matches!(
            LinkedHeader::from_bytes(&bytes),
            Err(HdfError::CorruptSpecialElement(_))
        ));
        assert!(LinkedHeader::from_bytes(&bytes[..7]).is_err());
    }

    #[test]
    fn test_promote_keeps_bytes_and_grows_across_tables() {
        let mut fx = Fixture::new();
        let slot = linked_element(&mut fx, b"HEAD", 3, 2);

        let mut be = fx.backend();
        let mut storage = Storage::resolve(&mut be, slot).unwrap();
        storage.write(&mut be, slot, 4, b"abcdefghijkl").unwrap();
        storage.flush(&mut be, slot).unwrap();
        assert_eq!(read_all(&mut storage, &mut fx, slot), b"HEADabcdefghijkl");

        fx.reopen();
        let mut be = fx.backend();
        let mut storage = Storage::resolve(&mut be, slot).unwrap();
        assert_eq!(read_all(&mut storage, &mut fx, slot), b"HEADabcdefghijkl");
        match storage.info(&fx.backend()) {
            SpecialInfo::Linked {
                first_len,
                block_len,
                blocks_allocated,
                ..
            } => {
                assert_eq!(first_len, 4);
                assert_eq!(block_len, 3);
                // HEAD + four 3-byte blocks
                assert_eq!(blocks_allocated, 5);
            }
            other => panic!("unexpected info {:?}", other),
        }
    }

    #[test]
    fn test_unwritten_blocks_read_as_zero() {
        let mut fx = Fixture::new();
        let slot = linked_element(&mut fx, b"", 4, 4);

        let mut be = fx.backend();
        let mut storage = Storage::resolve(&mut be, slot).unwrap();
        storage.write(&mut be, slot, 10, b"xy").unwrap();
        assert_eq!(storage.length(&be, slot).unwrap(), 12);

        let data = read_all(&mut storage, &mut fx, slot);
        assert_eq!(&data[..10], &[0u8; 10]);
        assert_eq!(&data[10..], b"xy");
    }

    #[test]
    fn test_missing_block_is_short_io() {
        let mut fx = Fixture::new();
        let slot = linked_element(&mut fx, b"", 4, 4);

        let mut be = fx.backend();
        let mut storage = Storage::resolve(&mut be, slot).unwrap();
        storage.write(&mut be, slot, 0, b"12345678").unwrap();
        storage.flush(&mut be, slot).unwrap();

        // Drop the second data block behind the element's back
        let second = be
            .directory
            .iter()
            .filter(|(_, dd)| dd.tag == TAG_LINKED && dd.length == 4)
            .map(|(_, dd)| dd.reference)
            .max()
            .unwrap();
        be.directory.free(TAG_LINKED, second).unwrap();

        let mut buf = [0u8; 8];
        assert!(matches!(
            storage.read(&mut be, slot, 0, &mut buf),
            Err(HdfError::ShortIo { .. })
        ));
    }

    #[test]
    fn test_promote_rejects_special_element() {
        let mut fx = Fixture::new();
        let slot = linked_element(&mut fx, b"data", 8, 4);
        let mut be = fx.backend();
        assert!(matches!(
            LinkedElement::promote(&mut be, slot, 8, 4),
            Err(HdfError::BadArgs(_))
        ));
    }
}
