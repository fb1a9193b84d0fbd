//! Fixed-capacity open-addressing index from keys to entries
//!
//! Collisions are resolved with double hashing: the probe sequence for a key
//! starts at `hash % N` and advances by a key-derived step. Removed entries
//! leave a tombstone behind whenever another probe path may run through their
//! slot, so lookups never stop short of an entry further along a chain.

use super::entry::EntryRef;
use crate::arena::{Arena, Offset};
use crate::block::CorruptionError;
use std::mem;
use tracing::debug;

const SLOT_EMPTY: u64 = u64::MAX;
const SLOT_TOMBSTONE: u64 = u64::MAX - 1;

/// Contents of one index slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Empty,
    Tombstone,
    Occupied(Offset),
}

impl Slot {
    fn from_raw(raw: u64) -> Self {
        match raw {
            SLOT_EMPTY => Slot::Empty,
            SLOT_TOMBSTONE => Slot::Tombstone,
            offset => Slot::Occupied(Offset::new(offset)),
        }
    }

    fn to_raw(self) -> u64 {
        match self {
            Slot::Empty => SLOT_EMPTY,
            Slot::Tombstone => SLOT_TOMBSTONE,
            Slot::Occupied(offset) => offset.get(),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct IndexHeader {
    capacity: u64,
    max_items: u64,
    items: u64,
    tombstones: u64,
}

const INDEX_HEADER_SIZE: u64 = mem::size_of::<IndexHeader>() as u64;

/// Start slot and step for `key` in a table of `capacity` slots
///
/// The hash is a weighted sum of the key bytes. The step is derived from the
/// same sum and forced to be nonzero.
pub fn hash_key(key: &[u8], capacity: u64) -> (u64, u64) {
    let mut hash: u64 = 1;
    for (i, &c) in key.iter().enumerate() {
        hash = hash.wrapping_add((i as u64).wrapping_mul(131)).wrapping_add(c as u64);
    }

    let mut step = hash.wrapping_add(31);
    if let Some(&last) = key.last() {
        step = step.wrapping_sub(last as u64);
    }

    let capacity = capacity.max(1);
    let modulus = capacity.saturating_sub(1).max(1);
    let mut step = step % modulus;
    if step == 0 {
        step = 31 % modulus;
    }
    if step == 0 {
        step = 1;
    }
    (hash % capacity, step)
}

/// Slots visited when looking for a key
///
/// Yields at most `capacity` slots and stops early when the sequence comes
/// back to its start, so a probe always terminates even when the step shares
/// a factor with the table size.
#[derive(Debug, Clone)]
pub struct Probe {
    capacity: u64,
    start: u64,
    step: u64,
    next: u64,
    taken: u64,
}

impl Probe {
    pub fn new(key: &[u8], capacity: u64) -> Self {
        let (start, step) = hash_key(key, capacity);
        Self {
            capacity,
            start,
            step,
            next: start,
            taken: 0,
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn step(&self) -> u64 {
        self.step
    }
}

impl Iterator for Probe {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.capacity == 0 || self.taken >= self.capacity {
            return None;
        }
        if self.taken > 0 && self.next == self.start {
            return None;
        }
        let slot = self.next;
        self.next = (self.next + self.step) % self.capacity;
        self.taken += 1;
        Some(slot)
    }
}

/// Result of a key search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Found {
    pub entry: Option<(u64, Offset)>,
    /// Key comparisons performed on the way
    pub comparisons: u64,
}

/// Where an insert put the new entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub slot: u64,
    /// Older entry with the same key that the new one now shadows
    pub replaced: Option<Offset>,
    pub comparisons: u64,
}

/// Index view over the region at `base`
#[derive(Clone, Copy)]
pub struct HashIndex {
    arena: Arena,
    base: Offset,
    capacity: u64,
}

impl HashIndex {
    pub const fn region_size(capacity: u64) -> u64 {
        INDEX_HEADER_SIZE + capacity * 8
    }

    /// Lay out an empty index
    pub fn init(arena: Arena, base: Offset, capacity: u64, max_items: u64) -> Result<Self, CorruptionError> {
        if capacity < 2 || !arena.contains(base, Self::region_size(capacity)) {
            return Err(CorruptionError::Index(format!(
                "{} slots do not fit at {}",
                capacity, base
            )));
        }
        let header = IndexHeader {
            capacity,
            max_items,
            items: 0,
            tombstones: 0,
        };
        arena.write(base, header);

        let index = Self {
            arena,
            base,
            capacity,
        };
        for slot in 0..capacity {
            index.set_slot(slot, Slot::Empty);
        }
        Ok(index)
    }

    /// Attach to an index laid out by [`HashIndex::init`]
    pub fn open(arena: Arena, base: Offset) -> Result<Self, CorruptionError> {
        let header: IndexHeader = arena
            .read(base)
            .ok_or_else(|| CorruptionError::Index(format!("no index header at {}", base)))?;
        if header.capacity < 2
            || header.items > header.capacity
            || !arena.contains(base, Self::region_size(header.capacity))
        {
            return Err(CorruptionError::Index("index header is damaged".into()));
        }
        Ok(Self {
            arena,
            base,
            capacity: header.capacity,
        })
    }

    fn header(&self) -> IndexHeader {
        self.arena.read(self.base).unwrap_or(IndexHeader {
            capacity: self.capacity,
            max_items: 0,
            items: 0,
            tombstones: 0,
        })
    }

    fn store_header(&self, header: IndexHeader) {
        self.arena.write(self.base, header);
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn max_items(&self) -> u64 {
        self.header().max_items
    }

    /// Live entries, shadowed ones included
    pub fn items(&self) -> u64 {
        self.header().items
    }

    pub fn tombstones(&self) -> u64 {
        self.header().tombstones
    }

    /// Whether another entry is admitted under the soft cap
    pub fn admits(&self) -> bool {
        let header = self.header();
        header.items < header.max_items
    }

    fn slot_offset(&self, slot: u64) -> Offset {
        self.base.add(INDEX_HEADER_SIZE + slot * 8)
    }

    pub fn slot(&self, slot: u64) -> Slot {
        if slot >= self.capacity {
            return Slot::Empty;
        }
        self.arena
            .read::<u64>(self.slot_offset(slot))
            .map_or(Slot::Empty, Slot::from_raw)
    }

    fn set_slot(&self, slot: u64, value: Slot) {
        if slot < self.capacity {
            self.arena.write(self.slot_offset(slot), value.to_raw());
        }
    }

    pub fn probe(&self, key: &[u8]) -> Probe {
        Probe::new(key, self.capacity)
    }

    fn entry(&self, offset: Offset) -> Result<EntryRef<'_>, CorruptionError> {
        EntryRef::open(&self.arena, offset)
    }

    /// Find the first entry on `key`'s probe path whose key matches
    pub fn find(&self, key: &[u8]) -> Result<Found, CorruptionError> {
        let mut comparisons = 0;
        for slot in self.probe(key) {
            match self.slot(slot) {
                Slot::Empty => break,
                Slot::Tombstone => continue,
                Slot::Occupied(offset) => {
                    comparisons += 1;
                    if self.entry(offset)?.key_matches(key) {
                        return Ok(Found {
                            entry: Some((slot, offset)),
                            comparisons,
                        });
                    }
                }
            }
        }
        Ok(Found {
            entry: None,
            comparisons,
        })
    }

    /// Publish `entry` under `key`
    ///
    /// The new entry goes into the earliest reusable slot on the probe path.
    /// If an older entry with the same key sits before that slot, the two
    /// swap places so the newer entry is always found first. Returns `None`
    /// when the probe path has no reusable slot.
    ///
    /// Only the newest version is ordered. Older versions of a key keep
    /// whatever order the swaps left them in (after three inserts: newest,
    /// oldest, middle), so once the newest is removed `find` may return any
    /// older version that is still published.
    pub fn insert(&self, key: &[u8], entry: Offset) -> Result<Option<Placement>, CorruptionError> {
        let mut reusable: Option<(usize, u64)> = None;
        let mut existing: Option<(usize, u64, Offset)> = None;
        let mut comparisons = 0;

        for (position, slot) in self.probe(key).enumerate() {
            match self.slot(slot) {
                Slot::Empty => {
                    reusable.get_or_insert((position, slot));
                    break;
                }
                Slot::Tombstone => {
                    reusable.get_or_insert((position, slot));
                }
                Slot::Occupied(offset) => {
                    if existing.is_none() {
                        comparisons += 1;
                        if self.entry(offset)?.key_matches(key) {
                            existing = Some((position, slot, offset));
                        }
                    }
                }
            }
            if reusable.is_some() && existing.is_some() {
                break;
            }
        }

        let Some((free_position, free_slot)) = reusable else {
            debug!(key = %String::from_utf8_lossy(key), "no free slot on probe path");
            return Ok(None);
        };

        let mut header = self.header();
        if self.slot(free_slot) == Slot::Tombstone {
            header.tombstones = header.tombstones.saturating_sub(1);
        }

        let placement = match existing {
            Some((old_position, old_slot, old_offset)) if old_position < free_position => {
                self.set_slot(free_slot, Slot::Occupied(old_offset));
                self.set_slot(old_slot, Slot::Occupied(entry));
                Placement {
                    slot: old_slot,
                    replaced: Some(old_offset),
                    comparisons,
                }
            }
            _ => {
                self.set_slot(free_slot, Slot::Occupied(entry));
                Placement {
                    slot: free_slot,
                    replaced: existing.map(|(_, _, offset)| offset),
                    comparisons,
                }
            }
        };

        header.items += 1;
        self.store_header(header);
        debug!(
            key = %String::from_utf8_lossy(key),
            slot = placement.slot,
            replaced = placement.replaced.is_some(),
            "published entry"
        );
        Ok(Some(placement))
    }

    /// Slot that currently holds `entry`
    pub fn slot_of(&self, key: &[u8], entry: Offset) -> Option<u64> {
        let on_path = self
            .probe(key)
            .take_while(|&slot| self.slot(slot) != Slot::Empty)
            .find(|&slot| self.slot(slot) == Slot::Occupied(entry));
        on_path.or_else(|| (0..self.capacity).find(|&slot| self.slot(slot) == Slot::Occupied(entry)))
    }

    /// Whether some probe path other than the one through `slot` itself
    /// passes `slot` before reaching its own entry
    fn crossed_by_other_chain(&self, slot: u64) -> Result<bool, CorruptionError> {
        for other in 0..self.capacity {
            if other == slot {
                continue;
            }
            let Slot::Occupied(offset) = self.slot(other) else {
                continue;
            };
            let entry = self.entry(offset)?;
            for step in self.probe(entry.key()) {
                if step == other {
                    break;
                }
                if step == slot {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Drop the entry in `slot` from the index
    ///
    /// The slot becomes a tombstone when the next slot on the removed key's
    /// chain is in use or another key's chain runs through it; otherwise it
    /// becomes empty. Returns the marker that was written.
    pub fn remove_on_reclaim(&self, slot: u64) -> Result<Slot, CorruptionError> {
        let Slot::Occupied(offset) = self.slot(slot) else {
            return Err(CorruptionError::Index(format!("slot {} holds no entry", slot)));
        };
        let entry = self.entry(offset)?;
        let (_, step) = hash_key(entry.key(), self.capacity);
        let next = (slot + step) % self.capacity;

        let marker = if self.slot(next) != Slot::Empty || self.crossed_by_other_chain(slot)? {
            Slot::Tombstone
        } else {
            Slot::Empty
        };
        self.set_slot(slot, marker);

        let mut header = self.header();
        header.items = header.items.saturating_sub(1);
        if marker == Slot::Tombstone {
            header.tombstones += 1;
        }
        self.store_header(header);
        debug!(slot, ?marker, "removed entry from index");
        Ok(marker)
    }

    /// Entries currently published, with their slots
    pub fn entries(&self) -> Vec<(u64, Offset)> {
        (0..self.capacity)
            .filter_map(|slot| match self.slot(slot) {
                Slot::Occupied(offset) => Some((slot, offset)),
                _ => None,
            })
            .collect()
    }

    /// Verify counters and that every entry is reachable along its probe path
    pub fn check_consistency(&self) -> Result<(), CorruptionError> {
        let header = self.header();
        if header.capacity != self.capacity {
            return Err(CorruptionError::Index("capacity changed under the view".into()));
        }

        let mut occupied = 0;
        let mut tombstones = 0;
        for slot in 0..self.capacity {
            match self.slot(slot) {
                Slot::Empty => {}
                Slot::Tombstone => tombstones += 1,
                Slot::Occupied(offset) => {
                    occupied += 1;
                    let entry = self.entry(offset)?;
                    let reachable = self
                        .probe(entry.key())
                        .take_while(|&s| s == slot || self.slot(s) != Slot::Empty)
                        .any(|s| s == slot);
                    if !reachable {
                        return Err(CorruptionError::Index(format!(
                            "entry in slot {} is not reachable from its key",
                            slot
                        )));
                    }
                }
            }
        }

        if occupied != header.items {
            return Err(CorruptionError::Index(format!(
                "item count {} but {} slots in use",
                header.items, occupied
            )));
        }
        if tombstones != header.tombstones {
            return Err(CorruptionError::Index(format!(
                "tombstone count {} but {} tombstones",
                header.tombstones, tombstones
            )));
        }
        Ok(())
    }
}
