//! On-disk layout of the container preamble and DD blocks
//!
//! ```text
//! offset 0      magic  0e 03 13 01
//! offset 4      DD block: ndds u16, next u32, ndds x DD
//! DD            tag u16, ref u16, offset u32, length u32
//! ```
//!
//! Everything is big-endian. `next == 0` terminates the block chain.

use crate::core::error::{HdfError, Result};
use crate::core::tags::{base_tag, Ref, Tag, TAG_NULL};
use byteorder::{BigEndian, ByteOrder};

pub const MAGIC: [u8; 4] = [0x0e, 0x03, 0x13, 0x01];
pub const MAGIC_LEN: usize = MAGIC.len();

/// Offset of the first DD block
pub const FIRST_BLOCK_OFFSET: u32 = MAGIC_LEN as u32;

/// Bytes per data descriptor
pub const DD_SIZE: usize = 12;

/// Bytes of a DD block header (`ndds`, `next`)
pub const DD_BLOCK_HEADER_SIZE: usize = 6;

/// Check the four leading bytes of a file
pub fn validate_magic(bytes: &[u8]) -> Result<()> {
    if bytes.len() < MAGIC_LEN || bytes[..MAGIC_LEN] != MAGIC {
        return Err(HdfError::BadOpen("not a tag/ref container (bad magic)".into()));
    }
    Ok(())
}

/// Data descriptor: one directory record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor {
    /// Tag as stored, special bit included
    pub tag: Tag,
    pub reference: Ref,
    pub offset: u32,
    pub length: u32,
}

impl Descriptor {
    pub fn new(tag: Tag, reference: Ref, offset: u32, length: u32) -> Self {
        Descriptor {
            tag,
            reference,
            offset,
            length,
        }
    }

    /// An unused slot
    pub fn empty() -> Self {
        Descriptor::new(TAG_NULL, 0, 0, 0)
    }

    pub fn is_empty(&self) -> bool {
        self.tag == TAG_NULL
    }

    /// `(base tag, ref)` lookup key
    pub fn key(&self) -> (Tag, Ref) {
        (base_tag(self.tag), self.reference)
    }

    pub fn to_bytes(&self) -> [u8; DD_SIZE] {
        let mut bytes = [0u8; DD_SIZE];
        BigEndian::write_u16(&mut bytes[0..2], self.tag);
        BigEndian::write_u16(&mut bytes[2..4], self.reference);
        BigEndian::write_u32(&mut bytes[4..8], self.offset);
        BigEndian::write_u32(&mut bytes[8..12], self.length);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DD_SIZE {
            return Err(HdfError::BadOpen(format!(
                "truncated descriptor: {} bytes",
                bytes.len()
            )));
        }
        Ok(Descriptor {
            tag: BigEndian::read_u16(&bytes[0..2]),
            reference: BigEndian::read_u16(&bytes[2..4]),
            offset: BigEndian::read_u32(&bytes[4..8]),
            length: BigEndian::read_u32(&bytes[8..12]),
        })
    }
}

/// Header of one DD block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DdBlockHeader {
    pub ndds: u16,
    /// File offset of the next block, 0 for the last one
    pub next: u32,
}

impl DdBlockHeader {
    /// Total on-disk size of the block this header introduces
    pub fn block_len(&self) -> usize {
        DD_BLOCK_HEADER_SIZE + self.ndds as usize * DD_SIZE
    }

    pub fn to_bytes(&self) -> [u8; DD_BLOCK_HEADER_SIZE] {
        let mut bytes = [0u8; DD_BLOCK_HEADER_SIZE];
        BigEndian::write_u16(&mut bytes[0..2], self.ndds);
        BigEndian::write_u32(&mut bytes[2..6], self.next);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DD_BLOCK_HEADER_SIZE {
            return Err(HdfError::BadOpen("truncated DD block header".into()));
        }
        Ok(DdBlockHeader {
            ndds: BigEndian::read_u16(&bytes[0..2]),
            next: BigEndian::read_u32(&bytes[2..6]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tags::TAG_IP8;

    #[test]
    fn test_descriptor_layout_is_big_endian() {
        let dd = Descriptor::new(TAG_IP8, 2, 0x0102_0304, 768);
        let bytes = dd.to_bytes();
        assert_eq!(&bytes[0..2], &[0x00, 0xC9]);
        assert_eq!(&bytes[2..4], &[0x00, 0x02]);
        assert_eq!(&bytes[4..8], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[8..12], &[0x00, 0x00, 0x03, 0x00]);
        assert_eq!(Descriptor::from_bytes(&bytes).unwrap(), dd);
    }

    #[test]
    fn test_empty_descriptor() {
        let dd = Descriptor::empty();
        assert!(dd.is_empty());
        assert!(!Descriptor::new(TAG_IP8, 1, 0, 0).is_empty());
    }

    #[test]
    fn test_magic_validation() {
        assert!(validate_magic(&MAGIC).is_ok());
        assert!(matches!(
            validate_magic(b"CART"),
            Err(HdfError::BadOpen(_))
        ));
        assert!(validate_magic(&MAGIC[..2]).is_err());
    }

    #[test]
    fn test_block_header() {
        let header = DdBlockHeader { ndds: 16, next: 200 };
        assert_eq!(header.to_bytes(), [0, 16, 0, 0, 0, 200]);
        let parsed = DdBlockHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.block_len(), 6 + 16 * 12);
        assert!(DdBlockHeader::from_bytes(&[0, 1]).is_err());
    }
}
