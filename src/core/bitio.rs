//! Bit-granular reading and writing
//!
//! Fields of 1 to 32 bits are packed most-significant-bit first into a byte
//! stream. The codec only needs positioned byte access ([`ByteSource`],
//! [`ByteSink`]), so it works the same over every storage strategy.
//!
//! Ending a bit write pads the last byte with zero bits. An appendable bit
//! write also records how many bits of that byte are valid in a
//! `(TAG_BIT_TAIL, ref)` element holding `tag u16, ref u16, valid u8`, so a
//! later bit read stops before the padding and a later appendable write
//! continues inside the partial byte.

use crate::core::directory::Direction;
use crate::core::error::{HdfError, Result};
use crate::core::special::{Backend, Storage};
use crate::core::tags::{base_tag, Ref, Tag, REF_WILDCARD, TAG_BIT_TAIL};
use byteorder::{BigEndian, ByteOrder};

pub const MAX_BIT_WIDTH: u32 = 32;

/// Low `n` bits set, `n` in `0..=32`
pub fn mask(n: u32) -> u32 {
    ((1u64 << n) - 1) as u32
}

fn check_width(width: u32) -> Result<()> {
    if width == 0 || width > MAX_BIT_WIDTH {
        return Err(HdfError::BadArgs(format!(
            "bit field width {} outside 1..={}",
            width, MAX_BIT_WIDTH
        )));
    }
    Ok(())
}

/// Positioned byte output
pub trait ByteSink {
    fn write_bytes(&mut self, offset: u64, bytes: &[u8]) -> Result<()>;
}

/// Positioned byte input; returns fewer bytes only at end of data
pub trait ByteSource {
    fn read_bytes(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;
}

pub struct BitWriter {
    /// Byte offset where `pending[0]` belongs
    start: u64,
    pending: Vec<u8>,
    acc: u8,
    /// Bits used in `acc`, always `0..=7` between calls
    used: u32,
    buffer_size: usize,
}

impl BitWriter {
    pub fn new(start: u64, buffer_size: usize) -> Self {
        BitWriter {
            start,
            pending: Vec::new(),
            acc: 0,
            used: 0,
            buffer_size: buffer_size.max(1),
        }
    }

    /// Continue inside a partially filled byte at `offset` whose top `valid`
    /// bits are kept
    pub fn resume(offset: u64, partial: u8, valid: u32, buffer_size: usize) -> Self {
        let mut writer = BitWriter::new(offset, buffer_size);
        if valid > 0 && valid < 8 {
            writer.acc = partial & !(mask(8 - valid) as u8);
            writer.used = valid;
        }
        writer
    }

    pub fn write<S: ByteSink>(&mut self, sink: &mut S, width: u32, value: u32) -> Result<()> {
        check_width(width)?;
        let value = value & mask(width);
        let mut remaining = width;
        while remaining > 0 {
            let free = 8 - self.used;
            let take = free.min(remaining);
            let bits = ((value >> (remaining - take)) & mask(take)) as u8;
            self.acc |= bits << (free - take);
            self.used += take;
            remaining -= take;
            if self.used == 8 {
                self.pending.push(self.acc);
                self.acc = 0;
                self.used = 0;
                if self.pending.len() >= self.buffer_size {
                    self.drain(sink)?;
                }
            }
        }
        Ok(())
    }

    /// Bit offset inside the current byte
    pub fn bit_offset(&self) -> u32 {
        self.used
    }

    /// Whole bytes accepted so far, counted from the start of the element
    pub fn byte_position(&self) -> u64 {
        self.start + self.pending.len() as u64
    }

    /// Push buffered bytes and the zero-padded partial byte. Returns the
    /// number of valid bits in the final byte (8 when byte aligned).
    pub fn finish<S: ByteSink>(&mut self, sink: &mut S) -> Result<u32> {
        let valid = if self.used > 0 {
            self.pending.push(self.acc);
            let valid = self.used;
            self.acc = 0;
            self.used = 0;
            valid
        } else {
            8
        };
        self.drain(sink)?;
        Ok(valid)
    }

    fn drain<S: ByteSink>(&mut self, sink: &mut S) -> Result<()> {
        if !self.pending.is_empty() {
            sink.write_bytes(self.start, &self.pending)?;
            self.start += self.pending.len() as u64;
            self.pending.clear();
        }
        Ok(())
    }
}

pub struct BitReader {
    /// Readable bits from the start of the element
    total_bits: u64,
    cursor: u64,
    window: Vec<u8>,
    window_start: u64,
    buffer_size: usize,
}

impl BitReader {
    /// Reader over `length` bytes whose last byte holds `last_valid` bits
    pub fn new(length: u64, last_valid: u32, buffer_size: usize) -> Self {
        let total_bits = if length == 0 {
            0
        } else {
            (length - 1) * 8 + last_valid.clamp(1, 8) as u64
        };
        BitReader {
            total_bits,
            cursor: 0,
            window: Vec::new(),
            window_start: 0,
            buffer_size: buffer_size.max(1),
        }
    }

    /// Read up to `width` bits; returns the value (right-aligned) and the
    /// number of bits actually read, which is short only at end of data
    pub fn read<S: ByteSource>(&mut self, source: &mut S, width: u32) -> Result<(u32, u32)> {
        check_width(width)?;
        let count = (self.total_bits - self.cursor).min(width as u64) as u32;
        let mut value = 0u32;
        let mut got = 0;
        while got < count {
            let byte = self.byte_at(source, self.cursor / 8)?;
            let avail = 8 - (self.cursor % 8) as u32;
            let take = avail.min(count - got);
            let bits = (byte as u32 >> (avail - take)) & mask(take);
            value = if take == 32 { bits } else { (value << take) | bits };
            self.cursor += take as u64;
            got += take;
        }
        Ok((value, count))
    }

    /// Move to `byte_offset * 8 + bit_offset`
    pub fn seek(&mut self, byte_offset: u64, bit_offset: u32) -> Result<()> {
        if bit_offset > 7 {
            return Err(HdfError::BadArgs(format!("bit offset {} outside 0..=7", bit_offset)));
        }
        let target = byte_offset * 8 + bit_offset as u64;
        if target > self.total_bits {
            return Err(HdfError::BadArgs(format!(
                "bit position {} past end of {} bits",
                target, self.total_bits
            )));
        }
        self.cursor = target;
        Ok(())
    }

    /// Bit offset inside the current byte
    pub fn bit_offset(&self) -> u32 {
        (self.cursor % 8) as u32
    }

    pub fn position(&self) -> u64 {
        self.cursor
    }

    pub fn total_bits(&self) -> u64 {
        self.total_bits
    }

    fn byte_at<S: ByteSource>(&mut self, source: &mut S, index: u64) -> Result<u8> {
        let in_window = index >= self.window_start
            && index < self.window_start + self.window.len() as u64;
        if !in_window {
            self.window.resize(self.buffer_size, 0);
            let n = source.read_bytes(index, &mut self.window)?;
            self.window.truncate(n);
            self.window_start = index;
            if n == 0 {
                return Err(HdfError::ShortIo {
                    expected: 1,
                    actual: 0,
                });
            }
        }
        Ok(self.window[(index - self.window_start) as usize])
    }
}

/// Byte access to one element's storage for the bit codec
pub(crate) struct HandleStream<'s, 'b, 'a> {
    pub storage: &'s mut Storage,
    pub be: &'b mut Backend<'a>,
    pub slot: usize,
}

impl ByteSink for HandleStream<'_, '_, '_> {
    fn write_bytes(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.storage.write(self.be, self.slot, offset, bytes)
    }
}

impl ByteSource for HandleStream<'_, '_, '_> {
    fn read_bytes(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.storage.read(self.be, self.slot, offset, buf)
    }
}

const BIT_TAIL_LEN: usize = 5;

fn encode_tail(tag: Tag, reference: Ref, valid: u8) -> [u8; BIT_TAIL_LEN] {
    let mut out = [0u8; BIT_TAIL_LEN];
    BigEndian::write_u16(&mut out[0..2], base_tag(tag));
    BigEndian::write_u16(&mut out[2..4], reference);
    out[4] = valid;
    out
}

/// Slot and valid-bit count of the tail record of `(tag, ref)`
pub(crate) fn find_bit_tail(be: &mut Backend<'_>, tag: Tag, reference: Ref) -> Result<Option<(usize, u32)>> {
    let mut at = None;
    while let Some(slot) = be
        .directory
        .find_next(TAG_BIT_TAIL, REF_WILDCARD, at, Direction::Forward)
    {
        at = Some(slot);
        let bytes = be.read_slot(slot)?;
        if bytes.len() != BIT_TAIL_LEN {
            continue;
        }
        let t = BigEndian::read_u16(&bytes[0..2]);
        let r = BigEndian::read_u16(&bytes[2..4]);
        if t == base_tag(tag) && r == reference {
            return Ok(Some((slot, bytes[4] as u32)));
        }
    }
    Ok(None)
}

/// Record (or clear, for a byte-aligned end) the valid bits of the last byte
pub(crate) fn record_bit_tail(be: &mut Backend<'_>, tag: Tag, reference: Ref, valid: u32) -> Result<()> {
    let existing = find_bit_tail(be, tag, reference)?;
    match (existing, valid) {
        (Some((slot, _)), 8) => be.directory.free_slot(slot),
        (None, 8) => {}
        (Some((slot, _)), v) => be.store_slot(slot, &encode_tail(tag, reference, v as u8))?,
        (None, v) => {
            be.append_element(TAG_BIT_TAIL, &encode_tail(tag, reference, v as u8))?;
        }
    }
    Ok(())
}

pub(crate) fn clear_bit_tail(be: &mut Backend<'_>, tag: Tag, reference: Ref) -> Result<()> {
    if let Some((slot, _)) = find_bit_tail(be, tag, reference)? {
        be.directory.free_slot(slot);
    }
    Ok(())
}
