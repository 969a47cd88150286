//! # tagfile-rs - Tag/Ref Binary Containers
//!
//! `tagfile-rs` reads and writes self-describing binary containers in which
//! every object is an *element* addressed by a `(tag, ref)` pair. A chained
//! directory of descriptors maps each pair to a byte range of the file.
//!
//! - **Plain elements** stored as one contiguous range
//! - **Special elements**: linked blocks, external files, compressed
//!   streams and chunked arrays with a per-element LRU chunk cache
//! - **Bit-level I/O** for packed fields of 1 to 32 bits
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tagfile_rs::{Container, OpenMode, Result, TAG_RI8};
//!
//! # fn main() -> Result<()> {
//! let mut file = Container::open("image.hdf", OpenMode::Create)?;
//!
//! let aid = file.start_write(TAG_RI8, 1)?;
//! file.write(aid, &[0u8; 256])?;
//! file.end_access(aid)?;
//!
//! let pixels = file.get_element(TAG_RI8, 1)?;
//! assert_eq!(pixels.len(), 256);
//! file.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Chunked Elements
//!
//! ```rust,no_run
//! use tagfile_rs::{ChunkSpec, ContainerBuilder, Result, TAG_NDG};
//!
//! # fn main() -> Result<()> {
//! let mut file = ContainerBuilder::new()
//!     .path("grid.hdf")
//!     .create()
//!     .chunk_cache_budget(16 * 1024 * 1024)
//!     .build()?;
//!
//! let spec = ChunkSpec::new(vec![1024, 1024], vec![64, 64], 4);
//! let aid = file.create_chunked(TAG_NDG, 1, spec)?;
//! file.write_chunk(aid, &[0, 0], &vec![1u8; 64 * 64 * 4])?;
//! file.end_access(aid)?;
//! # Ok(())
//! # }
//! ```

pub mod core;

pub use crate::core::{
    access::{AccessId, AccessMode, Positioning},
    chunk_cache::ChunkCacheStats,
    compression::{CompressionConfig, CompressionMethod},
    config::ContainerConfig,
    container::{Container, ContainerStats, ElementInfo, ElementScan, OpenMode},
    directory::Direction,
    error::{ErrorKind, HdfError, Result},
    header::Descriptor,
    special::{ChunkSpec, SpecialInfo, SpecialKind},
    tags::{
        Ref, Tag, REF_WILDCARD, TAG_IP8, TAG_LUT, TAG_NDG, TAG_NULL, TAG_RI8, TAG_WILDCARD,
    },
};

use parking_lot::{Mutex, MutexGuard};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Builder for opening a [`Container`] with custom settings
///
/// # Examples
///
/// ```rust,no_run
/// use tagfile_rs::ContainerBuilder;
///
/// # fn main() -> tagfile_rs::Result<()> {
/// let file = ContainerBuilder::new()
///     .path("/data/scan.hdf")
///     .read_write()
///     .dd_block_size(64)
///     .external_dir("/data/raw")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ContainerBuilder {
    path: Option<PathBuf>,
    mode: OpenMode,
    config: ContainerConfig,
    config_file: Option<PathBuf>,
}

impl ContainerBuilder {
    /// Read-only open with default settings
    pub fn new() -> Self {
        ContainerBuilder {
            path: None,
            mode: OpenMode::Read,
            config: ContainerConfig::default(),
            config_file: None,
        }
    }

    pub fn path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn mode(mut self, mode: OpenMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn read_write(self) -> Self {
        self.mode(OpenMode::ReadWrite)
    }

    /// Create (truncating) instead of opening
    pub fn create(self) -> Self {
        self.mode(OpenMode::Create)
    }

    /// Start from a complete configuration
    pub fn config(mut self, config: ContainerConfig) -> Self {
        self.config = config;
        self
    }

    /// Load settings from a TOML file at build time; values set on the
    /// builder afterwards are ignored
    pub fn config_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config_file = Some(path.into());
        self
    }

    pub fn dd_block_size(mut self, dds: u16) -> Self {
        self.config.dd_block_size = dds;
        self
    }

    pub fn chunk_cache_budget(mut self, bytes: usize) -> Self {
        self.config.chunk_cache_budget = bytes;
        self
    }

    pub fn default_chunk_cache(mut self, chunks: usize) -> Self {
        self.config.default_chunk_cache = Some(chunks);
        self
    }

    pub fn linked_blocks(mut self, block_len: u32, blocks_per_table: u32) -> Self {
        self.config.linked_block_len = block_len;
        self.config.linked_block_count = blocks_per_table;
        self
    }

    pub fn bit_buffer_size(mut self, bytes: usize) -> Self {
        self.config.bit_buffer_size = bytes;
        self
    }

    pub fn external_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.external_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> Result<Container> {
        let path = self
            .path
            .ok_or_else(|| HdfError::BadArgs("container path must be set".into()))?;
        let config = match self.config_file {
            Some(file) => {
                debug!("Loading container settings from {:?}", file);
                ContainerConfig::load(file)?
            }
            None => self.config,
        };
        info!("Building container at {:?} ({:?})", path, self.mode);
        Container::open_with_config(path, self.mode, config)
    }
}

impl Default for ContainerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`Container`] shared between threads. Every operation holds one lock
/// for its whole duration, so directory updates and chunk write-backs never
/// interleave.
#[derive(Clone)]
pub struct SharedContainer {
    inner: Arc<Mutex<Container>>,
}

impl SharedContainer {
    pub fn new(container: Container) -> Self {
        SharedContainer {
            inner: Arc::new(Mutex::new(container)),
        }
    }

    /// Lock the session for a sequence of operations
    pub fn lock(&self) -> MutexGuard<'_, Container> {
        self.inner.lock()
    }

    /// Run `f` with the session locked
    pub fn with<T>(&self, f: impl FnOnce(&mut Container) -> T) -> T {
        f(&mut self.inner.lock())
    }

    /// Close the session if this is the last handle to it; otherwise hand
    /// the handle back
    pub fn try_close(self) -> std::result::Result<Result<()>, SharedContainer> {
        match Arc::try_unwrap(self.inner) {
            Ok(mutex) => Ok(mutex.into_inner().close()),
            Err(inner) => Err(SharedContainer { inner }),
        }
    }
}

impl From<Container> for SharedContainer {
    fn from(container: Container) -> Self {
        SharedContainer::new(container)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_requires_path() {
        assert!(matches!(
            ContainerBuilder::new().build(),
            Err(HdfError::BadArgs(_))
        ));
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let result = ContainerBuilder::new()
            .path(dir.path().join("bad.hdf"))
            .create()
            .dd_block_size(0)
            .build();
        assert!(matches!(result, Err(HdfError::Config(_))));
    }

    #[test]
    fn test_builder_reads_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = dir.path().join("container.toml");
        std::fs::write(&settings, "dd_block_size = 4\nbit_buffer_size = 8\n").unwrap();
        let file = ContainerBuilder::new()
            .path(dir.path().join("configured.hdf"))
            .create()
            .config_file(&settings)
            .build()
            .unwrap();
        assert_eq!(file.config().dd_block_size, 4);
        assert_eq!(file.config().bit_buffer_size, 8);
        assert_eq!(file.stats().dd_slots, 4);
    }

    #[test]
    fn test_shared_container_close() {
        let dir = tempfile::tempdir().unwrap();
        let file = Container::open(dir.path().join("shared.hdf"), OpenMode::Create).unwrap();
        let shared = SharedContainer::from(file);
        let other = shared.clone();
        other.with(|c| c.put_element(TAG_LUT, 1, b"lut")).unwrap();
        let shared = match shared.try_close() {
            Ok(_) => panic!("closed while another handle was alive"),
            Err(shared) => shared,
        };
        drop(other);
        match shared.try_close() {
            Ok(closed) => closed.unwrap(),
            Err(_) => panic!("last handle could not close"),
        }
    }
}
