//! Directory store: the in-memory DD table
//!
//! The directory is a chain of DD blocks starting right after the magic. It
//! is loaded completely on open and only dirty blocks are rewritten on flush.
//! Growing the directory appends a fresh block at end of file and links it
//! from the previous tail block.
//!
//! Slots are addressed by their position in directory order (`usize`), which
//! stays stable for the lifetime of the session: slots are emptied, never
//! removed.

use crate::core::error::{HdfError, Result};
use crate::core::header::{
    DdBlockHeader, Descriptor, DD_BLOCK_HEADER_SIZE, DD_SIZE, FIRST_BLOCK_OFFSET,
};
use crate::core::io::ContainerFile;
use crate::core::tags::{
    base_tag, is_special_tag, special_tag, Ref, Tag, REF_WILDCARD, TAG_NULL, TAG_WILDCARD,
};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Iteration order for [`Directory::find_next`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Clone)]
struct DdBlock {
    offset: u32,
    first: usize,
    len: usize,
    next: u32,
    dirty: bool,
}

pub struct Directory {
    dds: Vec<Descriptor>,
    blocks: Vec<DdBlock>,
    index: HashMap<(Tag, Ref), usize>,
    max_ref: Ref,
    block_size: u16,
}

impl Directory {
    /// Write an empty first block into a freshly created file
    pub fn create(file: &mut ContainerFile, block_size: u16) -> Result<Self> {
        let mut dir = Directory {
            dds: Vec::new(),
            blocks: Vec::new(),
            index: HashMap::new(),
            max_ref: 0,
            block_size,
        };
        let offset = dir.write_new_block(file)?;
        if offset != FIRST_BLOCK_OFFSET {
            return Err(HdfError::BadOpen(format!(
                "first DD block landed at {} instead of {}",
                offset, FIRST_BLOCK_OFFSET
            )));
        }
        Ok(dir)
    }

    /// Read the whole block chain
    pub fn load(file: &mut ContainerFile, block_size: u16) -> Result<Self> {
        let mut dir = Directory {
            dds: Vec::new(),
            blocks: Vec::new(),
            index: HashMap::new(),
            max_ref: 0,
            block_size,
        };
        let mut seen = HashSet::new();
        let mut offset = FIRST_BLOCK_OFFSET;

        loop {
            if !seen.insert(offset) {
                return Err(HdfError::BadOpen(format!(
                    "DD block chain loops back to offset {}",
                    offset
                )));
            }
            let mut head = [0u8; DD_BLOCK_HEADER_SIZE];
            file.read_at(offset as u64, &mut head)
                .map_err(|e| truncated(offset, e))?;
            let header = DdBlockHeader::from_bytes(&head)?;

            let mut body = vec![0u8; header.ndds as usize * DD_SIZE];
            file.read_at(offset as u64 + DD_BLOCK_HEADER_SIZE as u64, &mut body)
                .map_err(|e| truncated(offset, e))?;

            let first = dir.dds.len();
            for raw in body.chunks_exact(DD_SIZE) {
                let mut dd = Descriptor::from_bytes(raw)?;
                if !dd.is_empty() {
                    if dd.tag == TAG_WILDCARD || dd.reference == REF_WILDCARD {
                        warn!(tag = dd.tag, reference = dd.reference, "ignoring DD with wildcard key");
                        dd = Descriptor::empty();
                    } else if dir.index.contains_key(&dd.key()) {
                        warn!(
                            tag = dd.tag,
                            reference = dd.reference,
                            "duplicate DD key, keeping the first occurrence"
                        );
                        dd = Descriptor::empty();
                    } else {
                        dir.index.insert(dd.key(), dir.dds.len());
                        dir.max_ref = dir.max_ref.max(dd.reference);
                    }
                }
                dir.dds.push(dd);
            }
            dir.blocks.push(DdBlock {
                offset,
                first,
                len: header.ndds as usize,
                next: header.next,
                dirty: false,
            });

            match header.next {
                0 => break,
                next if next < FIRST_BLOCK_OFFSET => {
                    return Err(HdfError::BadOpen(format!(
                        "DD block at {} links to invalid offset {}",
                        offset, next
                    )))
                }
                next => offset = next,
            }
        }

        debug!(
            blocks = dir.blocks.len(),
            slots = dir.dds.len(),
            live = dir.index.len(),
            "directory loaded"
        );
        Ok(dir)
    }

    /// Rewrite dirty blocks in place
    pub fn flush(&mut self, file: &mut ContainerFile) -> Result<()> {
        for i in 0..self.blocks.len() {
            if self.blocks[i].dirty {
                let bytes = self.block_bytes(i);
                file.write_at(self.blocks[i].offset as u64, &bytes)?;
                self.blocks[i].dirty = false;
            }
        }
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.blocks.iter().any(|b| b.dirty)
    }

    /// Slot of `(tag, ref)`; either may be a wildcard, in which case the
    /// first match in directory order wins
    pub fn locate(&self, tag: Tag, reference: Ref) -> Option<usize> {
        if tag != TAG_WILDCARD && reference != REF_WILDCARD {
            return self.index.get(&(base_tag(tag), reference)).copied();
        }
        self.find_next(tag, reference, None, Direction::Forward)
    }

    /// Next slot after (or before) `from` matching the pattern; `None` starts
    /// at the corresponding end of the directory
    pub fn find_next(
        &self,
        tag: Tag,
        reference: Ref,
        from: Option<usize>,
        direction: Direction,
    ) -> Option<usize> {
        match direction {
            Direction::Forward => {
                let start = from.map_or(0, |i| i + 1);
                (start..self.dds.len()).find(|&i| matches(&self.dds[i], tag, reference))
            }
            Direction::Backward => {
                let end = from.unwrap_or(self.dds.len()).min(self.dds.len());
                (0..end)
                    .rev()
                    .find(|&i| matches(&self.dds[i], tag, reference))
            }
        }
    }

    pub fn get(&self, idx: usize) -> Option<&Descriptor> {
        self.dds.get(idx).filter(|dd| !dd.is_empty())
    }

    /// Create a DD with length 0 for `(tag, ref)`, choosing a fresh ref
    /// when `reference` is the wildcard
    pub fn allocate(&mut self, file: &mut ContainerFile, tag: Tag, reference: Ref) -> Result<usize> {
        if tag == TAG_WILDCARD || base_tag(tag) == TAG_NULL {
            return Err(HdfError::BadArgs(format!("cannot allocate tag {}", tag)));
        }
        let reference = if reference == REF_WILDCARD {
            self.new_ref()?
        } else {
            reference
        };
        let key = (base_tag(tag), reference);
        if self.index.contains_key(&key) {
            return Err(HdfError::DuplicateKey {
                tag: key.0,
                reference,
            });
        }

        let slot = match self.dds.iter().position(Descriptor::is_empty) {
            Some(slot) => slot,
            None => {
                self.write_new_block(file)?;
                self.dds.len() - self.block_size as usize
            }
        };

        self.dds[slot] = Descriptor::new(tag, reference, 0, 0);
        self.index.insert(key, slot);
        self.max_ref = self.max_ref.max(reference);
        self.mark_dirty(slot);
        debug!(tag, reference, slot, "allocated DD");
        Ok(slot)
    }

    /// Empty the DD of `(tag, ref)`; file space is not reclaimed
    pub fn free(&mut self, tag: Tag, reference: Ref) -> Result<()> {
        let idx = self
            .locate(tag, reference)
            .filter(|_| tag != TAG_WILDCARD && reference != REF_WILDCARD)
            .ok_or_else(|| HdfError::not_found(tag, reference))?;
        self.free_slot(idx);
        Ok(())
    }

    pub(crate) fn free_slot(&mut self, idx: usize) {
        if let Some(dd) = self.get(idx).copied() {
            self.index.remove(&dd.key());
            self.dds[idx] = Descriptor::empty();
            self.mark_dirty(idx);
            debug!(tag = dd.tag, reference = dd.reference, slot = idx, "freed DD");
        }
    }

    /// Point a DD at new bytes
    pub(crate) fn update(&mut self, idx: usize, offset: u32, length: u32) {
        let dd = &mut self.dds[idx];
        if dd.offset != offset || dd.length != length {
            dd.offset = offset;
            dd.length = length;
            self.mark_dirty(idx);
        }
    }

    /// Switch a DD between its plain and special tag
    pub(crate) fn set_special(&mut self, idx: usize, special: bool) -> Result<()> {
        let dd = self.dds[idx];
        let base = base_tag(dd.tag);
        let tag = if special {
            special_tag(base).ok_or_else(|| {
                HdfError::BadArgs(format!("tag {} cannot hold a special element", base))
            })?
        } else {
            base
        };
        if tag != dd.tag {
            self.dds[idx].tag = tag;
            self.mark_dirty(idx);
        }
        Ok(())
    }

    /// Add a second DD `(tag, ref)` sharing the bytes of `(old_tag, old_ref)`
    pub fn duplicate(
        &mut self,
        file: &mut ContainerFile,
        tag: Tag,
        reference: Ref,
        old_tag: Tag,
        old_ref: Ref,
    ) -> Result<usize> {
        let old = self
            .locate(old_tag, old_ref)
            .and_then(|i| self.get(i).copied())
            .ok_or_else(|| HdfError::not_found(old_tag, old_ref))?;
        let slot = self.allocate(file, base_tag(tag), reference)?;
        if is_special_tag(old.tag) {
            self.set_special(slot, true)?;
        }
        self.update(slot, old.offset, old.length);
        Ok(slot)
    }

    /// Number of elements with base tag `tag` (all when wildcard). DDs that
    /// share a physical offset count once; zero-length DDs own no bytes and
    /// always count.
    pub fn number_of(&self, tag: Tag) -> usize {
        let mut offsets = HashSet::new();
        let mut count = 0;
        for dd in self.dds.iter().filter(|dd| matches(dd, tag, REF_WILDCARD)) {
            if dd.length == 0 || offsets.insert(dd.offset) {
                count += 1;
            }
        }
        count
    }

    /// One past the largest ref ever seen, or the lowest ref unused by any
    /// tag once that would overflow
    pub fn new_ref(&self) -> Result<Ref> {
        if self.max_ref < Ref::MAX {
            return Ok(self.max_ref + 1);
        }
        let used: HashSet<Ref> = self.index.keys().map(|&(_, r)| r).collect();
        (1..=Ref::MAX)
            .find(|r| !used.contains(r))
            .ok_or_else(|| HdfError::NoSpace("every reference number is in use".into()))
    }

    /// Page through live descriptors: skip `start`, return at most `max`
    pub fn descriptors(&self, start: usize, max: usize) -> Vec<Descriptor> {
        self.iter().skip(start).take(max).map(|(_, dd)| *dd).collect()
    }

    /// Live descriptors in directory order
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Descriptor)> {
        self.dds.iter().enumerate().filter(|(_, dd)| !dd.is_empty())
    }

    /// Number of live elements
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Total DD slots across all blocks
    pub fn capacity(&self) -> usize {
        self.dds.len()
    }

    pub fn empty_slots(&self) -> usize {
        self.dds.len() - self.index.len()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn mark_dirty(&mut self, idx: usize) {
        let block = self.blocks.partition_point(|b| b.first <= idx) - 1;
        self.blocks[block].dirty = true;
    }

    fn block_bytes(&self, i: usize) -> Vec<u8> {
        let block = &self.blocks[i];
        let header = DdBlockHeader {
            ndds: block.len as u16,
            next: block.next,
        };
        let mut bytes = Vec::with_capacity(header.block_len());
        bytes.extend_from_slice(&header.to_bytes());
        for dd in &self.dds[block.first..block.first + block.len] {
            bytes.extend_from_slice(&dd.to_bytes());
        }
        bytes
    }

    /// Append an empty block at end of file and chain it from the tail block
    fn write_new_block(&mut self, file: &mut ContainerFile) -> Result<u32> {
        let len = self.block_size as usize;
        let header = DdBlockHeader {
            ndds: self.block_size,
            next: 0,
        };
        let mut bytes = Vec::with_capacity(header.block_len());
        bytes.extend_from_slice(&header.to_bytes());
        for _ in 0..len {
            bytes.extend_from_slice(&Descriptor::empty().to_bytes());
        }
        let offset = file.append(&bytes)?;

        if let Some(tail) = self.blocks.last_mut() {
            tail.next = offset;
            tail.dirty = true;
        }
        self.blocks.push(DdBlock {
            offset,
            first: self.dds.len(),
            len,
            next: 0,
            dirty: false,
        });
        self.dds.resize(self.dds.len() + len, Descriptor::empty());
        debug!(offset, slots = len, "appended DD block");
        Ok(offset)
    }
}

fn matches(dd: &Descriptor, tag: Tag, reference: Ref) -> bool {
    !dd.is_empty()
        && (tag == TAG_WILDCARD || base_tag(dd.tag) == base_tag(tag))
        && (reference == REF_WILDCARD || dd.reference == reference)
}

fn truncated(offset: u32, err: HdfError) -> HdfError {
    match err {
        HdfError::ShortIo { .. } => {
            HdfError::BadOpen(format!("DD block at {} is truncated", offset))
        }
        other => other,
    }
}
