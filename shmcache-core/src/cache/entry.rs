//! Cache entries stored inside pool blocks
//!
//! An entry occupies exactly one allocator block:
//!
//! ```text
//! +-------------+-----------+-----+------------------+
//! | EntryHeader | key bytes | NUL | payload bytes    |
//! +-------------+-----------+-----+------------------+
//! ```
//!
//! The entry offset is the block payload offset handed out by the allocator.

use crate::arena::{Arena, Offset};
use crate::block::CorruptionError;
use serde::{Deserialize, Serialize};
use std::mem;

const ENTRY_MAGIC: u32 = 0x5348_4345;
const CUSTOM_TYPE_BASE: u32 = 0x1_0000;
/// One of the references is the inserter's
const FLAG_INSERTER_REF: u32 = 1;

/// Kind of blob stored in an entry; only interpreted by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryType {
    Blob,
    Image,
    Text,
    Custom(u16),
}

impl EntryType {
    pub fn to_raw(self) -> u32 {
        match self {
            EntryType::Blob => 0,
            EntryType::Image => 1,
            EntryType::Text => 2,
            EntryType::Custom(tag) => CUSTOM_TYPE_BASE | tag as u32,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(EntryType::Blob),
            1 => Some(EntryType::Image),
            2 => Some(EntryType::Text),
            r if r & !0xFFFF == CUSTOM_TYPE_BASE => Some(EntryType::Custom(r as u16)),
            _ => None,
        }
    }
}

/// Lifecycle of an entry
///
/// `Live` entries hold at least one reference. Dropping the last one moves
/// the entry to `PendingFree` and onto the pending-free queue, from where a
/// later `lookup` may rescue it back to `Live`. Only cleanup moves it on to
/// `Reclaimed`, right before its block is freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryState {
    Live = 1,
    PendingFree = 2,
    Reclaimed = 3,
}

impl EntryState {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(EntryState::Live),
            2 => Some(EntryState::PendingFree),
            3 => Some(EntryState::Reclaimed),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntryHeader {
    magic: u32,
    entry_type: u32,
    state: u32,
    pub(crate) refcount: u32,
    pub(crate) serial: u64,
    key_len: u32,
    flags: u32,
    payload_len: u64,
}

pub const ENTRY_HEADER_SIZE: u64 = mem::size_of::<EntryHeader>() as u64;

impl EntryHeader {
    pub(crate) fn state(&self) -> Option<EntryState> {
        EntryState::from_raw(self.state)
    }

    pub(crate) fn set_state(&mut self, state: EntryState) {
        self.state = state as u32;
    }

    pub(crate) fn entry_type(&self) -> Option<EntryType> {
        EntryType::from_raw(self.entry_type)
    }

    /// Whether the inserter's reference is still among `refcount`
    pub(crate) fn has_inserter_ref(&self) -> bool {
        self.flags & FLAG_INSERTER_REF != 0
    }

    pub(crate) fn clear_inserter_ref(&mut self) {
        self.flags &= !FLAG_INSERTER_REF;
    }

    /// References taken through `lookup`
    pub(crate) fn lookup_refs(&self) -> u32 {
        self.refcount - self.refcount.min(self.has_inserter_ref() as u32)
    }
}

/// Bytes needed to store an entry with the given key and payload
pub fn entry_size(key_len: usize, payload_len: usize) -> u64 {
    ENTRY_HEADER_SIZE + key_len as u64 + 1 + payload_len as u64
}

/// Reference to an entry that survives across processes
///
/// The serial is unique per segment, so a handle whose block was reclaimed and
/// reused for another entry no longer matches. Handles returned by `insert`
/// stand for the inserter's reference, which is dropped at most once whether
/// through `release`, `remove` or a later insert of the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryHandle {
    pub offset: Offset,
    pub serial: u64,
    #[serde(skip)]
    pub(crate) inserter: bool,
}

impl EntryHandle {
    /// Whether this handle carries the inserter's reference
    pub fn is_inserter(&self) -> bool {
        self.inserter
    }

    /// Same entry, regardless of which reference the handles stand for
    pub fn same_entry(&self, other: &EntryHandle) -> bool {
        self.offset == other.offset && self.serial == other.serial
    }
}

/// Snapshot of an entry's metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    pub key: String,
    pub entry_type: EntryType,
    pub state: EntryState,
    pub refcount: u32,
    /// The inserter's reference has not been dropped yet
    pub inserter_ref: bool,
    pub payload_len: u64,
    pub serial: u64,
}

/// Validated view of one entry
#[derive(Clone, Copy)]
pub(crate) struct EntryRef<'a> {
    arena: &'a Arena,
    offset: Offset,
    header: EntryHeader,
}

impl<'a> EntryRef<'a> {
    /// Write a fresh entry with one reference into `offset`
    pub(crate) fn write_new(
        arena: &'a Arena,
        offset: Offset,
        key: &[u8],
        payload: &[u8],
        entry_type: EntryType,
        serial: u64,
    ) -> Result<Self, CorruptionError> {
        let header = EntryHeader {
            magic: ENTRY_MAGIC,
            entry_type: entry_type.to_raw(),
            state: EntryState::Live as u32,
            refcount: 1,
            serial,
            key_len: key.len() as u32,
            flags: FLAG_INSERTER_REF,
            payload_len: payload.len() as u64,
        };

        let key_at = offset.add(ENTRY_HEADER_SIZE);
        let payload_at = key_at.add(key.len() as u64 + 1);
        let written = arena.write(offset, header)
            && arena.copy_in(key_at, key)
            && arena.fill(key_at.add(key.len() as u64), 1, 0)
            && arena.copy_in(payload_at, payload);
        if !written {
            return Err(CorruptionError::BadEntry(offset));
        }

        Ok(Self {
            arena,
            offset,
            header,
        })
    }

    /// Read and validate the entry at `offset`
    pub(crate) fn open(arena: &'a Arena, offset: Offset) -> Result<Self, CorruptionError> {
        let header: EntryHeader = arena
            .read(offset)
            .ok_or(CorruptionError::BadEntry(offset))?;
        if header.magic != ENTRY_MAGIC || header.state().is_none() {
            return Err(CorruptionError::BadEntry(offset));
        }
        let size = entry_size(header.key_len as usize, header.payload_len as usize);
        if !arena.contains(offset, size) {
            return Err(CorruptionError::BadEntry(offset));
        }

        Ok(Self {
            arena,
            offset,
            header,
        })
    }

    pub(crate) fn offset(&self) -> Offset {
        self.offset
    }

    pub(crate) fn header(&self) -> EntryHeader {
        self.header
    }

    pub(crate) fn store_header(&mut self, header: EntryHeader) {
        self.arena.write(self.offset, header);
        self.header = header;
    }

    pub(crate) fn handle(&self) -> EntryHandle {
        EntryHandle {
            offset: self.offset,
            serial: self.header.serial,
            inserter: false,
        }
    }


    pub(crate) fn matches(&self, handle: EntryHandle) -> bool {
        self.offset == handle.offset && self.header.serial == handle.serial
    }

    pub(crate) fn key(&self) -> &'a [u8] {
        self.arena
            .bytes(self.offset.add(ENTRY_HEADER_SIZE), self.header.key_len as usize)
            .unwrap_or_default()
    }

    pub(crate) fn key_matches(&self, key: &[u8]) -> bool {
        self.header.key_len as usize == key.len() && self.key() == key
    }

    pub(crate) fn payload(&self) -> &'a [u8] {
        let at = self
            .offset
            .add(ENTRY_HEADER_SIZE + self.header.key_len as u64 + 1);
        self.arena
            .bytes(at, self.header.payload_len as usize)
            .unwrap_or_default()
    }

    pub(crate) fn entry_type(&self) -> EntryType {
        self.header.entry_type().unwrap_or(EntryType::Blob)
    }

    pub(crate) fn info(&self) -> EntryInfo {
        EntryInfo {
            key: String::from_utf8_lossy(self.key()).into_owned(),
            entry_type: self.entry_type(),
            state: self.header.state().unwrap_or(EntryState::Reclaimed),
            refcount: self.header.refcount,
            inserter_ref: self.header.has_inserter_ref(),
            payload_len: self.header.payload_len,
            serial: self.header.serial,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaBuffer;

    #[test]
    fn test_entry_type_raw_values() {
        for ty in [EntryType::Blob, EntryType::Image, EntryType::Text, EntryType::Custom(7)] {
            assert_eq!(EntryType::from_raw(ty.to_raw()), Some(ty));
        }
        assert_eq!(EntryType::from_raw(3), None);
    }

    #[test]
    fn test_write_and_open_entry() {
        let buffer = ArenaBuffer::new(1024);
        let arena = buffer.arena();
        let at = Offset::new(64);

        EntryRef::write_new(&arena, at, b"icon:home", b"\x01\x02\x03", EntryType::Image, 9).unwrap();

        let entry = EntryRef::open(&arena, at).unwrap();
        assert_eq!(entry.key(), b"icon:home");
        assert!(entry.key_matches(b"icon:home"));
        assert!(!entry.key_matches(b"icon:hom"));
        assert_eq!(entry.payload(), &[1, 2, 3]);
        assert_eq!(entry.entry_type(), EntryType::Image);
        assert_eq!(entry.header().refcount, 1);
        assert_eq!(entry.header().state(), Some(EntryState::Live));
        assert_eq!(
            entry.handle(),
            EntryHandle {
                offset: at,
                serial: 9,
                inserter: false
            }
        );
        assert!(entry.header().has_inserter_ref());
        assert!(!entry.handle().is_inserter());

        // Key is NUL terminated in the arena
        let nul = arena.bytes(at.add(ENTRY_HEADER_SIZE + 9), 1).unwrap();
        assert_eq!(nul, &[0]);
    }

    #[test]
    fn test_open_rejects_garbage() {
        let buffer = ArenaBuffer::new(256);
        let arena = buffer.arena();

        assert!(EntryRef::open(&arena, Offset::new(0)).is_err());
        assert!(EntryRef::open(&arena, Offset::NULL).is_err());
    }

    #[test]
    fn test_open_rejects_overlong_lengths() {
        let buffer = ArenaBuffer::new(256);
        let arena = buffer.arena();
        let at = Offset::new(0);

        let mut entry = EntryRef::write_new(&arena, at, b"k", b"v", EntryType::Blob, 1).unwrap();
        let mut header = entry.header();
        header.payload_len = 4096;
        entry.store_header(header);

        assert_eq!(EntryRef::open(&arena, at).err(), Some(CorruptionError::BadEntry(at)));
    }

    #[test]
    fn test_write_out_of_range_fails() {
        let buffer = ArenaBuffer::new(64);
        let arena = buffer.arena();
        let result = EntryRef::write_new(&arena, Offset::new(8), b"key", &[0u8; 64], EntryType::Blob, 1);
        assert!(result.is_err());
    }

    #[test]
    fn test_lookup_refs_exclude_inserter() {
        let buffer = ArenaBuffer::new(256);
        let arena = buffer.arena();
        let entry = EntryRef::write_new(&arena, Offset::new(0), b"k", b"v", EntryType::Blob, 1).unwrap();

        let mut header = entry.header();
        assert_eq!(header.lookup_refs(), 0);
        header.refcount = 3;
        assert_eq!(header.lookup_refs(), 2);
        header.clear_inserter_ref();
        assert_eq!(header.lookup_refs(), 3);
    }

    #[test]
    fn test_info() {
        let buffer = ArenaBuffer::new(512);
        let arena = buffer.arena();
        let mut entry =
            EntryRef::write_new(&arena, Offset::new(8), b"name", b"hello", EntryType::Text, 4).unwrap();

        let mut header = entry.header();
        header.refcount = 0;
        header.clear_inserter_ref();
        header.set_state(EntryState::PendingFree);
        entry.store_header(header);

        let info = EntryRef::open(&arena, Offset::new(8)).unwrap().info();
        assert_eq!(info.key, "name");
        assert_eq!(info.state, EntryState::PendingFree);
        assert_eq!(info.refcount, 0);
        assert!(!info.inserter_ref);
        assert_eq!(info.payload_len, 5);
        assert_eq!(info.serial, 4);
    }
}
