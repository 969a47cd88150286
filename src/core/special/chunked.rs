//! Chunked elements
//!
//! A chunked element is an N-dimensional array of `nt_size`-byte values in
//! row-major order, cut into fixed-shape chunks. Each written chunk is its
//! own `(TAG_CHUNK, ref)` element; the chunk table `(TAG_CHUNK_TABLE, ref)`
//! maps grid coordinates to chunk refs. Chunks never written read as the fill
//! value without touching the file. Edge chunks keep the full chunk shape;
//! the part outside the array holds fill.
//!
//! ```text
//! control block  code u16, version u8, flags u32, nt_size u32, ndims u32,
//!                dims[ndims] u32, chunk_dims[ndims] u32, fill_len u32, fill,
//!                method u16, level u32, table_ref u16
//! chunk table    count u32, count x (coords[ndims] u32, chunk_ref u16)
//! ```
//!
//! All I/O goes through the element's [`ChunkCache`].

use super::{clamp_read, Backend, SpecialInfo, SpecialKind};
use crate::core::chunk_cache::{ChunkCache, ChunkCacheStats, ChunkCoord, ChunkStore};
use crate::core::compression::{compress, decompress, CompressionConfig, CompressionMethod};
use crate::core::config::ContainerConfig;
use crate::core::error::{HdfError, Result};
use crate::core::tags::{is_special_tag, Ref, TAG_CHUNK, TAG_CHUNK_TABLE};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

pub const CHUNKED_VERSION: u8 = 1;
pub const MAX_DIMS: usize = 32;

/// Shape, value size, fill and compression of a new chunked element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpec {
    pub dims: Vec<u32>,
    pub chunk_dims: Vec<u32>,
    /// Bytes per value
    pub nt_size: u32,
    /// Fill value, empty or exactly `nt_size` bytes; empty means zeros
    pub fill: Vec<u8>,
    pub compression: CompressionConfig,
}

impl ChunkSpec {
    pub fn new(dims: Vec<u32>, chunk_dims: Vec<u32>, nt_size: u32) -> Self {
        ChunkSpec {
            dims,
            chunk_dims,
            nt_size,
            fill: Vec::new(),
            compression: CompressionConfig::none(),
        }
    }

    pub fn with_fill(mut self, fill: Vec<u8>) -> Self {
        self.fill = fill;
        self
    }

    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = compression;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let ndims = self.dims.len();
        if ndims == 0 || ndims > MAX_DIMS {
            return Err(HdfError::BadArgs(format!(
                "chunked element needs 1..={} dimensions, got {}",
                MAX_DIMS, ndims
            )));
        }
        if self.chunk_dims.len() != ndims {
            return Err(HdfError::BadArgs(format!(
                "{} chunk dimensions for {} array dimensions",
                self.chunk_dims.len(),
                ndims
            )));
        }
        if self.nt_size == 0 {
            return Err(HdfError::BadArgs("value size is 0".into()));
        }
        for (d, (&dim, &chunk)) in self.dims.iter().zip(&self.chunk_dims).enumerate() {
            if dim == 0 || chunk == 0 || chunk > dim {
                return Err(HdfError::BadArgs(format!(
                    "dimension {}: size {} with chunk size {}",
                    d, dim, chunk
                )));
            }
        }
        if !self.fill.is_empty() && self.fill.len() != self.nt_size as usize {
            return Err(HdfError::BadArgs(format!(
                "fill of {} bytes for {}-byte values",
                self.fill.len(),
                self.nt_size
            )));
        }
        let bytes = self
            .dims
            .iter()
            .try_fold(self.nt_size as u64, |acc, &d| acc.checked_mul(d as u64))
            .ok_or_else(|| {
                HdfError::BadArgs(format!(
                    "chunked element {:?} x {} bytes overflows 64-bit sizes",
                    self.dims, self.nt_size
                ))
            })?;
        if bytes > u32::MAX as u64 {
            return Err(HdfError::NoSpace(format!(
                "chunked element of {} bytes exceeds 32-bit lengths",
                bytes
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedHeader {
    pub version: u8,
    pub flags: u32,
    pub spec: ChunkSpec,
    pub table_ref: Ref,
}

impl ChunkedHeader {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let spec = &self.spec;
        let mut out = Vec::new();
        out.write_u16::<BigEndian>(SpecialKind::Chunked.code())?;
        out.write_u8(self.version)?;
        out.write_u32::<BigEndian>(self.flags)?;
        out.write_u32::<BigEndian>(spec.nt_size)?;
        out.write_u32::<BigEndian>(spec.dims.len() as u32)?;
        for &dim in spec.dims.iter().chain(&spec.chunk_dims) {
            out.write_u32::<BigEndian>(dim)?;
        }
        out.write_u32::<BigEndian>(spec.fill.len() as u32)?;
        out.extend_from_slice(&spec.fill);
        out.write_u16::<BigEndian>(spec.compression.method.code())?;
        out.write_u32::<BigEndian>(spec.compression.level)?;
        out.write_u16::<BigEndian>(self.table_ref)?;
        Ok(out)
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self> {
        let bad = |_| HdfError::corrupt("truncated chunked-element header");
        let code = bytes.read_u16::<BigEndian>().map_err(bad)?;
        if code != SpecialKind::Chunked.code() {
            return Err(HdfError::corrupt(format!("special code {} is not chunked", code)));
        }
        let version = bytes.read_u8().map_err(bad)?;
        let flags = bytes.read_u32::<BigEndian>().map_err(bad)?;
        let nt_size = bytes.read_u32::<BigEndian>().map_err(bad)?;
        let ndims = bytes.read_u32::<BigEndian>().map_err(bad)? as usize;
        if ndims == 0 || ndims > MAX_DIMS {
            return Err(HdfError::corrupt(format!("chunked element with {} dimensions", ndims)));
        }
        let mut dims = Vec::with_capacity(ndims);
        for _ in 0..ndims {
            dims.push(bytes.read_u32::<BigEndian>().map_err(bad)?);
        }
        let mut chunk_dims = Vec::with_capacity(ndims);
        for _ in 0..ndims {
            chunk_dims.push(bytes.read_u32::<BigEndian>().map_err(bad)?);
        }
        let fill_len = bytes.read_u32::<BigEndian>().map_err(bad)? as usize;
        if bytes.len() < fill_len {
            return Err(HdfError::corrupt("fill value extends past control block"));
        }
        let fill = bytes[..fill_len].to_vec();
        bytes = &bytes[fill_len..];
        let method_code = bytes.read_u16::<BigEndian>().map_err(bad)?;
        let level = bytes.read_u32::<BigEndian>().map_err(bad)?;
        let table_ref = bytes.read_u16::<BigEndian>().map_err(bad)?;

        let method = CompressionMethod::from_u16(method_code).ok_or_else(|| {
            HdfError::corrupt(format!("unsupported chunk compression {}", method_code))
        })?;
        let spec = ChunkSpec {
            dims,
            chunk_dims,
            nt_size,
            fill,
            compression: CompressionConfig { method, level },
        };
        spec.validate()
            .map_err(|e| HdfError::corrupt(format!("chunked layout: {}", e)))?;

        Ok(ChunkedHeader {
            version,
            flags,
            spec,
            table_ref,
        })
    }
}

/// Index arithmetic between byte offsets, value coordinates and chunks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkGeometry {
    dims: Vec<u32>,
    chunk_dims: Vec<u32>,
    nt_size: u64,
    grid: Vec<u32>,
}

impl ChunkGeometry {
    pub fn new(dims: &[u32], chunk_dims: &[u32], nt_size: u32) -> Self {
        let grid = dims
            .iter()
            .zip(chunk_dims)
            .map(|(&d, &c)| d.div_ceil(c.max(1)))
            .collect();
        ChunkGeometry {
            dims: dims.to_vec(),
            chunk_dims: chunk_dims.to_vec(),
            nt_size: nt_size as u64,
            grid,
        }
    }

    /// Chunks along each dimension
    pub fn grid(&self) -> &[u32] {
        &self.grid
    }

    pub fn chunk_count(&self) -> u64 {
        self.grid.iter().map(|&g| g as u64).product()
    }

    pub fn chunk_values(&self) -> u64 {
        self.chunk_dims.iter().map(|&c| c as u64).product()
    }

    pub fn chunk_bytes(&self) -> usize {
        (self.chunk_values() * self.nt_size) as usize
    }

    /// Logical size of the whole array, saturating at `u64::MAX` for shapes
    /// that [`ChunkSpec::validate`] rejects
    pub fn element_bytes(&self) -> u64 {
        self.dims
            .iter()
            .try_fold(self.nt_size, |acc, &d| acc.checked_mul(d as u64))
            .unwrap_or(u64::MAX)
    }

    /// Chunk holding byte `pos`, the offset inside that chunk, and how many
    /// bytes from there are contiguous in both the array and the chunk
    pub fn locate(&self, pos: u64) -> (ChunkCoord, usize, usize) {
        let n = self.dims.len();
        let mut value = pos / self.nt_size;
        let byte = pos % self.nt_size;

        let mut index = vec![0u64; n];
        for d in (0..n).rev() {
            index[d] = value % self.dims[d] as u64;
            value /= self.dims[d] as u64;
        }

        let mut coords = Vec::with_capacity(n);
        let mut in_chunk = 0u64;
        for d in 0..n {
            let c = self.chunk_dims[d] as u64;
            coords.push((index[d] / c) as u32);
            in_chunk = in_chunk * c + index[d] % c;
        }

        let last = n - 1;
        let c = self.chunk_dims[last] as u64;
        let values = (c - index[last] % c).min(self.dims[last] as u64 - index[last]);
        let offset = in_chunk * self.nt_size + byte;
        let run = values * self.nt_size - byte;
        (coords, offset as usize, run as usize)
    }

    /// Byte range `[first, end)` spanned by the in-bounds values of a chunk
    pub fn chunk_extent(&self, coords: &[u32]) -> (u64, u64) {
        let mut first = 0u64;
        let mut last = 0u64;
        for d in 0..self.dims.len() {
            let dim = self.dims[d] as u64;
            let c = self.chunk_dims[d] as u64;
            let lo = coords[d] as u64 * c;
            let hi = ((coords[d] as u64 + 1) * c).min(dim) - 1;
            first = first * dim + lo;
            last = last * dim + hi;
        }
        (first * self.nt_size, (last + 1) * self.nt_size)
    }

    /// Whether the byte range `[start, end)` overwrites every in-bounds value
    /// of the chunk
    pub fn covers(&self, coords: &[u32], start: u64, end: u64) -> bool {
        let (first, last) = self.chunk_extent(coords);
        start <= first && end >= last
    }

    pub fn check_coords(&self, coords: &[u32]) -> Result<()> {
        if coords.len() != self.grid.len() {
            return Err(HdfError::BadArgs(format!(
                "{} chunk coordinates for {} dimensions",
                coords.len(),
                self.grid.len()
            )));
        }
        for (d, (&c, &g)) in coords.iter().zip(&self.grid).enumerate() {
            if c >= g {
                return Err(HdfError::BadArgs(format!(
                    "chunk coordinate {} in dimension {} outside grid of {}",
                    c, d, g
                )));
            }
        }
        Ok(())
    }

    /// A chunk holding only `fill`
    pub fn blank(&self, fill: &[u8]) -> Vec<u8> {
        if fill.is_empty() {
            vec![0u8; self.chunk_bytes()]
        } else {
            fill.repeat(self.chunk_values() as usize)
        }
    }
}

fn encode_table(table: &BTreeMap<ChunkCoord, Ref>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.write_u32::<BigEndian>(table.len() as u32)?;
    for (coords, &chunk) in table {
        for &c in coords {
            out.write_u32::<BigEndian>(c)?;
        }
        out.write_u16::<BigEndian>(chunk)?;
    }
    Ok(out)
}

fn parse_table(bytes: &[u8], geometry: &ChunkGeometry) -> Result<BTreeMap<ChunkCoord, Ref>> {
    let mut table = BTreeMap::new();
    if bytes.is_empty() {
        return Ok(table);
    }
    let ndims = geometry.grid().len();
    let mut rd = bytes;
    let bad = |_| HdfError::corrupt("truncated chunk table");
    let count = rd.read_u32::<BigEndian>().map_err(bad)? as usize;
    let record = 4 * ndims + 2;
    if rd.len() != count * record {
        return Err(HdfError::corrupt(format!(
            "chunk table holds {} bytes for {} records",
            rd.len(),
            count
        )));
    }
    for _ in 0..count {
        let mut coords = Vec::with_capacity(ndims);
        for _ in 0..ndims {
            coords.push(rd.read_u32::<BigEndian>().map_err(bad)?);
        }
        let chunk = rd.read_u16::<BigEndian>().map_err(bad)?;
        geometry
            .check_coords(&coords)
            .map_err(|e| HdfError::corrupt(format!("chunk table: {}", e)))?;
        if table.insert(coords, chunk).is_some() {
            return Err(HdfError::corrupt("chunk table lists a chunk twice"));
        }
    }
    Ok(table)
}

/// Largest chunk cache capacity the byte budget allows
fn capacity_limit(config: &ContainerConfig, geometry: &ChunkGeometry) -> usize {
    (config.chunk_cache_budget / geometry.chunk_bytes().max(1)).max(1)
}

/// Chunk table and chunk elements behind one element's cache
struct TableStore<'s, 'a> {
    be: &'s mut Backend<'a>,
    spec: &'s ChunkSpec,
    geometry: &'s ChunkGeometry,
    table: &'s mut BTreeMap<ChunkCoord, Ref>,
    table_dirty: &'s mut bool,
}

impl ChunkStore for TableStore<'_, '_> {
    fn load(&mut self, coord: &[u32]) -> Result<Option<Vec<u8>>> {
        let chunk = match self.table.get(coord) {
            Some(&chunk) => chunk,
            None => return Ok(None),
        };
        let slot = self
            .be
            .directory
            .locate(TAG_CHUNK, chunk)
            .ok_or_else(|| HdfError::corrupt(format!("chunk {} of {:?} is missing", chunk, coord)))?;
        if self.be.descriptor(slot)?.length == 0 {
            // Reserved but never stored
            return Ok(None);
        }
        let stored = self.be.read_slot(slot)?;
        let expected = self.geometry.chunk_bytes();
        if self.spec.compression.is_none() {
            if stored.len() != expected {
                return Err(HdfError::corrupt(format!(
                    "chunk {:?} holds {} bytes, expected {}",
                    coord,
                    stored.len(),
                    expected
                )));
            }
            return Ok(Some(stored));
        }
        decompress(&stored, self.spec.compression.method, expected).map(Some)
    }

    fn blank(&self, _coord: &[u32]) -> Vec<u8> {
        self.geometry.blank(&self.spec.fill)
    }

    fn store(&mut self, coord: &[u32], data: &[u8]) -> Result<()> {
        self.reserve(coord)?;
        let chunk = match self.table.get(coord) {
            Some(&chunk) => chunk,
            None => return Err(HdfError::corrupt(format!("chunk {:?} has no table entry", coord))),
        };
        let bytes = if self.spec.compression.is_none() {
            data.to_vec()
        } else {
            compress(data, &self.spec.compression)?
        };
        self.be.store_element(TAG_CHUNK, chunk, &bytes)?;
        Ok(())
    }

    fn reserve(&mut self, coord: &[u32]) -> Result<()> {
        if !self.table.contains_key(coord) {
            let (chunk, _) = self.be.reserve_element(TAG_CHUNK)?;
            self.table.insert(coord.to_vec(), chunk);
            *self.table_dirty = true;
            debug!(?coord, chunk, "allocated chunk");
        }
        Ok(())
    }
}

pub(crate) struct ChunkedElement {
    header: ChunkedHeader,
    geometry: ChunkGeometry,
    table: BTreeMap<ChunkCoord, Ref>,
    table_slot: usize,
    table_dirty: bool,
    cache: ChunkCache,
}

impl ChunkedElement {
    pub(crate) fn open(be: &mut Backend<'_>, block: &[u8]) -> Result<Self> {
        let header = ChunkedHeader::from_bytes(block)?;
        let spec = &header.spec;
        let geometry = ChunkGeometry::new(&spec.dims, &spec.chunk_dims, spec.nt_size);

        let table_slot = be
            .directory
            .locate(TAG_CHUNK_TABLE, header.table_ref)
            .ok_or_else(|| HdfError::corrupt(format!("chunk table {} is missing", header.table_ref)))?;
        let bytes = be
            .read_slot(table_slot)
            .map_err(|_| HdfError::corrupt("chunk table extends past end of file"))?;
        let table = parse_table(&bytes, &geometry)?;

        let last = geometry.grid().len() - 1;
        let wanted = be
            .config
            .default_chunk_cache
            .unwrap_or(geometry.grid()[last] as usize);
        let capacity = wanted.min(capacity_limit(be.config, &geometry));

        Ok(ChunkedElement {
            header,
            geometry,
            table,
            table_slot,
            table_dirty: false,
            cache: ChunkCache::new(capacity),
        })
    }

    /// Lay out a new chunked element at `slot`, which must be empty
    pub(crate) fn initialize(be: &mut Backend<'_>, slot: usize, spec: ChunkSpec) -> Result<()> {
        spec.validate()?;
        let dd = be.descriptor(slot)?;
        if is_special_tag(dd.tag) || dd.length > 0 {
            return Err(HdfError::BadArgs(format!(
                "tag {} ref {} already holds data; chunking needs a new element",
                dd.tag, dd.reference
            )));
        }
        let (table_ref, _) = be.append_element(TAG_CHUNK_TABLE, &encode_table(&BTreeMap::new())?)?;
        let header = ChunkedHeader {
            version: CHUNKED_VERSION,
            flags: 0,
            spec,
            table_ref,
        };
        be.relocate_slot(slot, &header.to_bytes()?)?;
        be.directory.set_special(slot, true)?;
        debug!(
            tag = dd.tag,
            reference = dd.reference,
            dims = ?header.spec.dims,
            chunk_dims = ?header.spec.chunk_dims,
            "created chunked element"
        );
        Ok(())
    }

    fn parts<'s, 'a>(&'s mut self, be: &'s mut Backend<'a>) -> (&'s mut ChunkCache, TableStore<'s, 'a>) {
        let store = TableStore {
            be,
            spec: &self.header.spec,
            geometry: &self.geometry,
            table: &mut self.table,
            table_dirty: &mut self.table_dirty,
        };
        (&mut self.cache, store)
    }

    pub fn length(&self) -> u64 {
        self.geometry.element_bytes()
    }

    pub fn geometry(&self) -> &ChunkGeometry {
        &self.geometry
    }

    pub(crate) fn read(&mut self, be: &mut Backend<'_>, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let n = clamp_read(self.length(), pos, buf.len());
        let mut done = 0usize;
        while done < n {
            let (coords, offset, run) = self.geometry.locate(pos + done as u64);
            let take = run.min(n - done);
            let (cache, mut store) = self.parts(be);
            let chunk = cache.get(&coords, &mut store)?;
            buf[done..done + take].copy_from_slice(&chunk[offset..offset + take]);
            done += take;
        }
        Ok(n)
    }

    pub(crate) fn write(&mut self, be: &mut Backend<'_>, pos: u64, data: &[u8]) -> Result<()> {
        let end = pos + data.len() as u64;
        if end > self.length() {
            return Err(HdfError::BadArgs(format!(
                "write to {}..{} past chunked element of {} bytes",
                pos,
                end,
                self.length()
            )));
        }
        let mut touched = HashSet::new();
        let mut done = 0usize;
        while done < data.len() {
            let (coords, offset, run) = self.geometry.locate(pos + done as u64);
            let take = run.min(data.len() - done);
            let load = touched.contains(&coords) || !self.geometry.covers(&coords, pos, end);
            let (cache, mut store) = self.parts(be);
            let chunk = cache.get_mut(&coords, &mut store, load)?;
            chunk[offset..offset + take].copy_from_slice(&data[done..done + take]);
            touched.insert(coords);
            done += take;
        }
        Ok(())
    }

    pub(crate) fn read_chunk(&mut self, be: &mut Backend<'_>, coords: &[u32], buf: &mut [u8]) -> Result<()> {
        self.geometry.check_coords(coords)?;
        self.check_chunk_len(buf.len())?;
        let (cache, mut store) = self.parts(be);
        buf.copy_from_slice(cache.get(coords, &mut store)?);
        Ok(())
    }

    pub(crate) fn write_chunk(&mut self, be: &mut Backend<'_>, coords: &[u32], data: &[u8]) -> Result<()> {
        self.geometry.check_coords(coords)?;
        self.check_chunk_len(data.len())?;
        let (cache, mut store) = self.parts(be);
        cache.put(coords, data.to_vec(), &mut store)
    }

    fn check_chunk_len(&self, len: usize) -> Result<()> {
        let expected = self.geometry.chunk_bytes();
        if len != expected {
            return Err(HdfError::BadArgs(format!(
                "chunk buffer of {} bytes, chunks hold {}",
                len, expected
            )));
        }
        Ok(())
    }

    /// Resize the cache, capped by the byte budget; returns the capacity set
    pub(crate) fn set_cache_capacity(&mut self, be: &mut Backend<'_>, capacity: usize) -> Result<usize> {
        if capacity == 0 {
            return Err(HdfError::BadArgs("chunk cache capacity must be at least 1".into()));
        }
        let capacity = capacity.min(capacity_limit(be.config, &self.geometry));
        let (cache, mut store) = self.parts(be);
        cache.resize(capacity, &mut store)?;
        Ok(capacity)
    }

    pub fn cache_stats(&self) -> ChunkCacheStats {
        self.cache.stats()
    }

    pub fn is_cached(&self, coords: &[u32]) -> bool {
        self.cache.contains(coords)
    }

    /// Write back dirty chunks, then the chunk table if it changed
    pub(crate) fn flush(&mut self, be: &mut Backend<'_>) -> Result<()> {
        let (cache, mut store) = self.parts(be);
        cache.flush_all(&mut store)?;
        if self.table_dirty {
            be.store_slot(self.table_slot, &encode_table(&self.table)?)?;
            self.table_dirty = false;
        }
        Ok(())
    }

    pub fn info(&self) -> SpecialInfo {
        let spec = &self.header.spec;
        SpecialInfo::Chunked {
            dims: spec.dims.clone(),
            chunk_dims: spec.chunk_dims.clone(),
            nt_size: spec.nt_size,
            compression: spec.compression,
            chunks_written: self.table.len(),
        }
    }
}
