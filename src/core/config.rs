//! Session configuration
//!
//! Loaded from TOML or built with [`crate::ContainerBuilder`]. Every field has a
//! default, so an empty document is a valid configuration.

use crate::core::error::{HdfError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_DD_BLOCK_SIZE: u16 = 16;
pub const DEFAULT_CHUNK_CACHE_BUDGET: usize = 64 * 1024 * 1024;
pub const DEFAULT_LINKED_BLOCK_LEN: u32 = 4096;
pub const DEFAULT_LINKED_BLOCK_COUNT: u32 = 16;
pub const DEFAULT_BIT_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContainerConfig {
    /// DDs per newly appended directory block
    pub dd_block_size: u16,
    /// Upper bound, in bytes, on one element's chunk cache
    pub chunk_cache_budget: usize,
    /// Chunk cache capacity for new chunked handles; `None` picks the
    /// number of chunks along the last dimension
    pub default_chunk_cache: Option<usize>,
    /// Size of standard blocks in linked elements
    pub linked_block_len: u32,
    /// Block refs per link table
    pub linked_block_count: u32,
    /// Bytes buffered by a bit writer before they reach the element
    pub bit_buffer_size: usize,
    /// Base directory for relative external-element paths; defaults to the
    /// container's own directory
    pub external_dir: Option<PathBuf>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        ContainerConfig {
            dd_block_size: DEFAULT_DD_BLOCK_SIZE,
            chunk_cache_budget: DEFAULT_CHUNK_CACHE_BUDGET,
            default_chunk_cache: None,
            linked_block_len: DEFAULT_LINKED_BLOCK_LEN,
            linked_block_count: DEFAULT_LINKED_BLOCK_COUNT,
            bit_buffer_size: DEFAULT_BIT_BUFFER_SIZE,
            external_dir: None,
        }
    }
}

impl ContainerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: ContainerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(&path).map_err(|e| {
            HdfError::Config(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dd_block_size == 0 {
            return Err(HdfError::Config("dd_block_size must be at least 1".into()));
        }
        if self.linked_block_len == 0 {
            return Err(HdfError::Config(
                "linked_block_len must be at least 1".into(),
            ));
        }
        if self.linked_block_count == 0 || self.linked_block_count > u16::MAX as u32 {
            return Err(HdfError::Config(format!(
                "linked_block_count must be in 1..={}",
                u16::MAX
            )));
        }
        if self.bit_buffer_size == 0 {
            return Err(HdfError::Config("bit_buffer_size must be at least 1".into()));
        }
        if self.default_chunk_cache == Some(0) {
            return Err(HdfError::Config(
                "default_chunk_cache must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ContainerConfig::default();
        assert_eq!(config.dd_block_size, 16);
        assert_eq!(config.chunk_cache_budget, 64 * 1024 * 1024);
        assert_eq!(config.default_chunk_cache, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config = ContainerConfig::from_toml_str("").unwrap();
        assert_eq!(config, ContainerConfig::default());
    }

    #[test]
    fn test_partial_toml() {
        let config = ContainerConfig::from_toml_str(
            r#"
            dd_block_size = 64
            default_chunk_cache = 8
            external_dir = "/data/ext"
            "#,
        )
        .unwrap();
        assert_eq!(config.dd_block_size, 64);
        assert_eq!(config.default_chunk_cache, Some(8));
        assert_eq!(config.external_dir, Some(PathBuf::from("/data/ext")));
        assert_eq!(config.linked_block_len, DEFAULT_LINKED_BLOCK_LEN);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            ContainerConfig::from_toml_str("dd_block_size = 0"),
            Err(HdfError::Config(_))
        ));
        assert!(matches!(
            ContainerConfig::from_toml_str("linked_block_count = 70000"),
            Err(HdfError::Config(_))
        ));
        assert!(matches!(
            ContainerConfig::from_toml_str("no_such_field = 1"),
            Err(HdfError::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("container.toml");
        std::fs::write(&path, "bit_buffer_size = 128\n").unwrap();

        let config = ContainerConfig::load(&path).unwrap();
        assert_eq!(config.bit_buffer_size, 128);
        assert!(ContainerConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
