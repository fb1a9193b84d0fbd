//! Bounded queue of entries waiting to be reclaimed
//!
//! Lives in the segment right after the hash index. Order is insertion order;
//! removals shift the tail down so the queue stays dense.

use crate::arena::{Arena, Offset};
use crate::block::CorruptionError;
use std::mem;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct QueueHeader {
    capacity: u64,
    len: u64,
}

const QUEUE_HEADER_SIZE: u64 = mem::size_of::<QueueHeader>() as u64;

#[derive(Clone, Copy)]
pub struct FreeQueue {
    arena: Arena,
    base: Offset,
    capacity: u64,
}

impl FreeQueue {
    pub const fn region_size(capacity: u64) -> u64 {
        QUEUE_HEADER_SIZE + capacity * 8
    }

    pub fn init(arena: Arena, base: Offset, capacity: u64) -> Result<Self, CorruptionError> {
        if capacity == 0 || !arena.contains(base, Self::region_size(capacity)) {
            return Err(CorruptionError::Queue(format!(
                "{} entries do not fit at {}",
                capacity, base
            )));
        }
        arena.write(base, QueueHeader { capacity, len: 0 });
        arena.fill(base.add(QUEUE_HEADER_SIZE), (capacity * 8) as usize, 0xFF);
        Ok(Self {
            arena,
            base,
            capacity,
        })
    }

    pub fn open(arena: Arena, base: Offset) -> Result<Self, CorruptionError> {
        let header: QueueHeader = arena
            .read(base)
            .ok_or_else(|| CorruptionError::Queue(format!("no queue header at {}", base)))?;
        if header.capacity == 0
            || header.len > header.capacity
            || !arena.contains(base, Self::region_size(header.capacity))
        {
            return Err(CorruptionError::Queue("queue header is damaged".into()));
        }
        Ok(Self {
            arena,
            base,
            capacity: header.capacity,
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn len(&self) -> u64 {
        self.arena
            .read::<QueueHeader>(self.base)
            .map_or(0, |h| h.len.min(self.capacity))
    }

    fn set_len(&self, len: u64) {
        self.arena.write(
            self.base,
            QueueHeader {
                capacity: self.capacity,
                len,
            },
        );
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    fn item_offset(&self, index: u64) -> Offset {
        self.base.add(QUEUE_HEADER_SIZE + index * 8)
    }

    pub fn get(&self, index: u64) -> Option<Offset> {
        if index >= self.len() {
            return None;
        }
        self.arena.read::<u64>(self.item_offset(index)).map(Offset::new)
    }

    /// Append `entry`; false when the queue is full
    pub fn push(&self, entry: Offset) -> bool {
        let len = self.len();
        if len >= self.capacity {
            return false;
        }
        self.arena.write(self.item_offset(len), entry.get());
        self.set_len(len + 1);
        true
    }

    pub fn position(&self, entry: Offset) -> Option<u64> {
        (0..self.len()).find(|&i| self.get(i) == Some(entry))
    }

    pub fn remove_at(&self, index: u64) -> Option<Offset> {
        let len = self.len();
        let removed = self.get(index)?;
        for i in index + 1..len {
            if let Some(next) = self.get(i) {
                self.arena.write(self.item_offset(i - 1), next.get());
            }
        }
        self.arena.write(self.item_offset(len - 1), Offset::NULL.get());
        self.set_len(len - 1);
        Some(removed)
    }

    /// Remove `entry` wherever it sits; false when it was not queued
    pub fn remove(&self, entry: Offset) -> bool {
        match self.position(entry) {
            Some(index) => self.remove_at(index).is_some(),
            None => false,
        }
    }

    pub fn entries(&self) -> Vec<Offset> {
        (0..self.len()).filter_map(|i| self.get(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaBuffer;

    fn queue(buffer: &ArenaBuffer, capacity: u64) -> FreeQueue {
        FreeQueue::init(buffer.arena(), Offset::new(16), capacity).unwrap()
    }

    #[test]
    fn test_push_until_full() {
        let buffer = ArenaBuffer::new(1024);
        let q = queue(&buffer, 3);

        assert!(q.is_empty());
        assert!(q.push(Offset::new(100)));
        assert!(q.push(Offset::new(200)));
        assert!(q.push(Offset::new(300)));
        assert!(q.is_full());
        assert!(!q.push(Offset::new(400)));
        assert_eq!(q.entries(), vec![Offset::new(100), Offset::new(200), Offset::new(300)]);
    }

    #[test]
    fn test_remove_keeps_order() {
        let buffer = ArenaBuffer::new(1024);
        let q = queue(&buffer, 4);
        for raw in [8, 16, 24, 32] {
            q.push(Offset::new(raw));
        }

        assert!(q.remove(Offset::new(16)));
        assert!(!q.remove(Offset::new(16)));
        assert_eq!(q.entries(), vec![Offset::new(8), Offset::new(24), Offset::new(32)]);

        assert_eq!(q.remove_at(2), Some(Offset::new(32)));
        assert_eq!(q.remove_at(2), None);
        assert_eq!(q.position(Offset::new(24)), Some(1));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_open_sees_queued_entries() {
        let buffer = ArenaBuffer::new(1024);
        let q = queue(&buffer, 4);
        q.push(Offset::new(512));

        let reopened = FreeQueue::open(buffer.arena(), Offset::new(16)).unwrap();
        assert_eq!(reopened.capacity(), 4);
        assert_eq!(reopened.entries(), vec![Offset::new(512)]);
    }

    #[test]
    fn test_init_rejects_zero_capacity() {
        let buffer = ArenaBuffer::new(64);
        assert!(FreeQueue::init(buffer.arena(), Offset::new(0), 0).is_err());
        assert!(FreeQueue::init(buffer.arena(), Offset::new(0), 100).is_err());
    }
}
