//! Container core: on-disk format, directory, storage strategies and the
//! session that ties them together

pub mod access;
pub mod bitio;
pub mod chunk_cache;
pub mod compression;
pub mod config;
pub mod container;
pub mod directory;
pub mod error;
pub mod header;
pub mod io;
pub mod special;
pub mod tags;

pub use container::{Container, ContainerStats, ElementInfo, ElementScan, OpenMode};
