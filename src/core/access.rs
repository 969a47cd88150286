//! Access handles
//!
//! Every open element gets an [`AccessId`]. Ids increase monotonically and
//! are never reused within a session, so a released id can only ever report
//! `StaleHandle`.

use crate::core::bitio::{BitReader, BitWriter};
use crate::core::error::{HdfError, Result};
use crate::core::special::{SharedStorage, Storage};
use crate::core::tags::{Ref, Tag};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccessId(pub(crate) u32);

impl AccessId {
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for AccessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "aid#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// Where `next_read` starts looking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Positioning {
    /// From the beginning of the directory
    Start,
    /// After the element the handle is bound to
    Current,
}

pub(crate) enum BitSession {
    Read(BitReader),
    Write { writer: BitWriter, appendable: bool },
}

pub(crate) struct Access {
    /// Base tag of the bound element
    pub tag: Tag,
    pub reference: Ref,
    pub slot: usize,
    pub mode: AccessMode,
    pub position: u64,
    /// Shared with every other handle on the same element
    pub storage: SharedStorage,
    pub bit: Option<BitSession>,
    /// Wildcard pattern given to `start_read`, reused by `next_read`
    pub pattern: Option<(Tag, Ref)>,
}

impl Access {
    pub fn key(&self) -> (Tag, Ref) {
        (self.tag, self.reference)
    }

    pub fn ensure_byte_mode(&self, id: AccessId) -> Result<()> {
        if self.bit.is_some() {
            return Err(HdfError::BadArgs(format!(
                "{} has an open bit session; end it before byte I/O",
                id
            )));
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct AccessTable {
    open: BTreeMap<u32, Access>,
    next_id: u32,
}

impl AccessTable {
    pub fn insert(&mut self, access: Access) -> Result<AccessId> {
        let id = self
            .next_id
            .checked_add(1)
            .ok_or_else(|| HdfError::NoSpace("access ids exhausted".into()))?;
        self.next_id = id;
        self.open.insert(id, access);
        Ok(AccessId(id))
    }

    pub fn get(&self, id: AccessId) -> Result<&Access> {
        self.open.get(&id.0).ok_or(HdfError::StaleHandle(id.0))
    }

    pub fn get_mut(&mut self, id: AccessId) -> Result<&mut Access> {
        self.open.get_mut(&id.0).ok_or(HdfError::StaleHandle(id.0))
    }

    pub fn remove(&mut self, id: AccessId) -> Result<Access> {
        self.open.remove(&id.0).ok_or(HdfError::StaleHandle(id.0))
    }

    /// Any handle bound to the element
    pub fn is_open(&self, key: (Tag, Ref)) -> bool {
        self.open.values().any(|a| a.key() == key)
    }

    pub fn writer_open(&self, key: (Tag, Ref)) -> bool {
        self.open
            .values()
            .any(|a| a.key() == key && a.mode == AccessMode::Write)
    }

    /// Storage already resolved by a handle open on the element
    pub fn shared_storage(&self, key: (Tag, Ref)) -> Option<SharedStorage> {
        self.open
            .values()
            .find(|a| a.key() == key)
            .map(|a| a.storage.clone())
    }

    pub fn ids(&self) -> Vec<AccessId> {
        self.open.keys().map(|&id| AccessId(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(tag: Tag, reference: Ref, mode: AccessMode) -> Access {
        Access {
            tag,
            reference,
            slot: 0,
            mode,
            position: 0,
            storage: Storage::Plain.shared(),
            bit: None,
            pattern: None,
        }
    }

    #[test]
    fn test_ids_are_never_reused() {
        let mut table = AccessTable::default();
        let a = table.insert(plain(201, 1, AccessMode::Read)).unwrap();
        table.remove(a).unwrap();
        let b = table.insert(plain(201, 1, AccessMode::Read)).unwrap();
        assert_ne!(a, b);
        assert!(matches!(table.get(a), Err(HdfError::StaleHandle(_))));
        assert!(matches!(table.remove(a), Err(HdfError::StaleHandle(_))));
    }

    #[test]
    fn test_writer_tracking() {
        let mut table = AccessTable::default();
        table.insert(plain(201, 1, AccessMode::Read)).unwrap();
        assert!(table.is_open((201, 1)));
        assert!(!table.writer_open((201, 1)));
        let w = table.insert(plain(201, 1, AccessMode::Write)).unwrap();
        assert!(table.writer_open((201, 1)));
        table.remove(w).unwrap();
        assert!(!table.writer_open((201, 1)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_handles_on_one_element_share_storage() {
        let mut table = AccessTable::default();
        assert!(table.shared_storage((201, 1)).is_none());
        let first = plain(201, 1, AccessMode::Write);
        let storage = first.storage.clone();
        let a = table.insert(first).unwrap();

        let shared = table.shared_storage((201, 1)).unwrap();
        assert!(std::sync::Arc::ptr_eq(&shared, &storage));
        assert!(table.shared_storage((201, 2)).is_none());

        let mut second = plain(201, 1, AccessMode::Read);
        second.storage = shared;
        table.insert(second).unwrap();
        table.remove(a).unwrap();
        let left = table.shared_storage((201, 1)).unwrap();
        assert!(std::sync::Arc::ptr_eq(&left, &storage));
    }

    #[test]
    fn test_bit_session_blocks_byte_io() {
        let mut access = plain(201, 1, AccessMode::Read);
        assert!(access.ensure_byte_mode(AccessId(1)).is_ok());
        access.bit = Some(BitSession::Read(BitReader::new(0, 8, 16)));
        assert!(matches!(
            access.ensure_byte_mode(AccessId(1)),
            Err(HdfError::BadArgs(_))
        ));
    }
}
