//! Compression codecs for compressed elements and chunk payloads
//!
//! Streams are stored bare (no method byte, no size prefix beyond what the
//! codec itself writes); the method and uncompressed length live in the
//! owning control block.

use crate::core::error::{HdfError, Result};
use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression as FlateCompression;
use std::io::Read;

/// Compression method code as stored in control blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CompressionMethod {
    /// Stored as-is
    None = 0,
    /// Run-length pairs of (count, byte)
    Rle = 1,
    /// Raw deflate, level 0-9
    Deflate = 2,
    /// LZ4 block with prepended size
    Lz4 = 3,
    /// Zstandard frame, level 1-22
    Zstd = 4,
}

impl CompressionMethod {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(CompressionMethod::None),
            1 => Some(CompressionMethod::Rle),
            2 => Some(CompressionMethod::Deflate),
            3 => Some(CompressionMethod::Lz4),
            4 => Some(CompressionMethod::Zstd),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        match self {
            CompressionMethod::None => "none",
            CompressionMethod::Rle => "rle",
            CompressionMethod::Deflate => "deflate",
            CompressionMethod::Lz4 => "lz4",
            CompressionMethod::Zstd => "zstd",
        }
    }
}

/// Method plus its level parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionConfig {
    pub method: CompressionMethod,
    /// Meaning depends on the method; ignored by None, Rle and Lz4
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig::none()
    }
}

impl CompressionConfig {
    pub fn none() -> Self {
        CompressionConfig {
            method: CompressionMethod::None,
            level: 0,
        }
    }

    pub fn rle() -> Self {
        CompressionConfig {
            method: CompressionMethod::Rle,
            level: 0,
        }
    }

    pub fn deflate(level: u32) -> Self {
        CompressionConfig {
            method: CompressionMethod::Deflate,
            level: level.min(9),
        }
    }

    pub fn lz4() -> Self {
        CompressionConfig {
            method: CompressionMethod::Lz4,
            level: 0,
        }
    }

    pub fn zstd(level: u32) -> Self {
        CompressionConfig {
            method: CompressionMethod::Zstd,
            level: level.clamp(1, 22),
        }
    }

    pub fn is_none(&self) -> bool {
        self.method == CompressionMethod::None
    }
}

/// Compress data using the configured method
pub fn compress(data: &[u8], config: &CompressionConfig) -> Result<Vec<u8>> {
    match config.method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Rle => Ok(rle_encode(data)),
        CompressionMethod::Deflate => {
            let mut encoder = DeflateEncoder::new(data, FlateCompression::new(config.level.min(9)));
            let mut compressed = Vec::new();
            encoder
                .read_to_end(&mut compressed)
                .map_err(|e| HdfError::Compression(format!("deflate failed: {}", e)))?;
            Ok(compressed)
        }
        CompressionMethod::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionMethod::Zstd => zstd::bulk::compress(data, config.level.clamp(1, 22) as i32)
            .map_err(|e| HdfError::Compression(format!("zstd failed: {}", e))),
    }
}

/// Decompress a stream that must expand to exactly `expected_len` bytes
pub fn decompress(data: &[u8], method: CompressionMethod, expected_len: usize) -> Result<Vec<u8>> {
    let out = match method {
        CompressionMethod::None => data.to_vec(),
        CompressionMethod::Rle => rle_decode(data, expected_len)?,
        CompressionMethod::Deflate => {
            let mut decoder = DeflateDecoder::new(data).take(expected_len as u64 + 1);
            let mut out = Vec::with_capacity(preallocation(data.len(), expected_len));
            decoder
                .read_to_end(&mut out)
                .map_err(|e| HdfError::Compression(format!("deflate stream: {}", e)))?;
            out
        }
        CompressionMethod::Lz4 => {
            if data.len() < 4 {
                return Err(HdfError::Compression("lz4 stream too short".into()));
            }
            let size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
            if size != expected_len {
                return Err(HdfError::Compression(format!(
                    "lz4 stream declares {} bytes, expected {}",
                    size, expected_len
                )));
            }
            if size > data.len().saturating_mul(LZ4_MAX_RATIO) {
                return Err(HdfError::Compression(format!(
                    "lz4 stream of {} bytes cannot expand to {}",
                    data.len(),
                    size
                )));
            }
            lz4_flex::decompress(&data[4..], size)
                .map_err(|e| HdfError::Compression(format!("lz4 stream: {}", e)))?
        }
        CompressionMethod::Zstd => {
            let stream_err = |e: std::io::Error| HdfError::Compression(format!("zstd stream: {}", e));
            let mut decoder = zstd::stream::read::Decoder::new(data)
                .map_err(stream_err)?
                .take(expected_len as u64 + 1);
            let mut out = Vec::with_capacity(preallocation(data.len(), expected_len));
            decoder.read_to_end(&mut out).map_err(stream_err)?;
            out
        }
    };

    if out.len() != expected_len {
        return Err(HdfError::Compression(format!(
            "{} stream expands to {} bytes, expected {}",
            method.name(),
            out.len(),
            expected_len
        )));
    }
    Ok(out)
}

/// lz4 cannot expand a block by more than this factor
const LZ4_MAX_RATIO: usize = 255;

/// Output buffer to reserve up front; `expected_len` comes from the file, so
/// it is only trusted as far as the stream size makes plausible
fn preallocation(stream_len: usize, expected_len: usize) -> usize {
    expected_len.min(stream_len.saturating_mul(8))
}

fn rle_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let byte = data[i];
        let mut run = 1usize;
        while i + run < data.len() && data[i + run] == byte && run < 255 {
            run += 1;
        }
        out.push(run as u8);
        out.push(byte);
        i += run;
    }
    out
}

fn rle_decode(data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    if data.len() % 2 != 0 {
        return Err(HdfError::Compression("rle stream has odd length".into()));
    }
    let mut out = Vec::with_capacity(expected_len.min(data.len() / 2 * 255));
    for pair in data.chunks_exact(2) {
        if pair[0] == 0 || out.len() + pair[0] as usize > expected_len {
            return Err(HdfError::Compression("rle run out of range".into()));
        }
        out.extend(std::iter::repeat(pair[1]).take(pair[0] as usize));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        let mut data = b"palette entry ".repeat(40);
        data.extend(std::iter::repeat(0u8).take(600));
        data
    }

    #[test]
    fn test_method_conversion() {
        assert_eq!(CompressionMethod::from_u16(2), Some(CompressionMethod::Deflate));
        assert_eq!(CompressionMethod::from_u16(4), Some(CompressionMethod::Zstd));
        assert_eq!(CompressionMethod::from_u16(99), None);
        assert_eq!(CompressionMethod::Lz4.code(), 3);
    }

    #[test]
    fn test_every_method_restores_input() {
        let data = sample();
        for config in [
            CompressionConfig::none(),
            CompressionConfig::rle(),
            CompressionConfig::deflate(6),
            CompressionConfig::lz4(),
            CompressionConfig::zstd(3),
        ] {
            let packed = compress(&data, &config).unwrap();
            let unpacked = decompress(&packed, config.method, data.len()).unwrap();
            assert_eq!(unpacked, data, "method {:?}", config.method);
        }
    }

    #[test]
    fn test_rle_long_runs_split() {
        let data = vec![7u8; 600];
        let packed = compress(&data, &CompressionConfig::rle()).unwrap();
        assert_eq!(packed, vec![255, 7, 255, 7, 90, 7]);
    }

    #[test]
    fn test_length_mismatch_is_corruption() {
        let data = sample();
        let packed = compress(&data, &CompressionConfig::deflate(6)).unwrap();
        let err = decompress(&packed, CompressionMethod::Deflate, data.len() - 1).unwrap_err();
        assert!(matches!(err, HdfError::Compression(_)));
    }

    #[test]
    fn test_garbage_stream_rejected() {
        let garbage = [0xffu8, 0x13, 0x00, 0x42, 0x99];
        assert!(decompress(&garbage, CompressionMethod::Zstd, 100).is_err());
        assert!(decompress(&garbage, CompressionMethod::Lz4, 100).is_err());
        assert!(decompress(&garbage, CompressionMethod::Rle, 100).is_err());
    }

    #[test]
    fn test_declared_length_does_not_drive_allocation() {
        let data = vec![3u8; 64];
        assert_eq!(preallocation(10, 1 << 31), 80);
        assert_eq!(preallocation(1000, 64), 64);

        for config in [CompressionConfig::deflate(6), CompressionConfig::zstd(3)] {
            let packed = compress(&data, &config).unwrap();
            let err = decompress(&packed, config.method, u32::MAX as usize).unwrap_err();
            assert!(matches!(err, HdfError::Compression(_)), "method {:?}", config.method);
        }

        let mut lz4 = compress(&data, &CompressionConfig::lz4()).unwrap();
        lz4[..4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            decompress(&lz4, CompressionMethod::Lz4, u32::MAX as usize),
            Err(HdfError::Compression(_))
        ));
    }

    #[test]
    fn test_level_clamping() {
        assert_eq!(CompressionConfig::deflate(42).level, 9);
        assert_eq!(CompressionConfig::zstd(0).level, 1);
    }
}
