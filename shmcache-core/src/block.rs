//! First-fit block allocator for the arena pool
//!
//! The pool is a doubly linked list of blocks in address order, framed by two
//! sentinels: `head` (always free, zero capacity, never handed out) and `tail`
//! (never free). Free blocks are additionally threaded into a singly linked
//! chain that starts at `head.next_free` and also runs in address order.
//!
//! Allocation takes the first free block that fits and splits it when the
//! remainder can hold another header. Freeing merges the block with free
//! neighbours on both sides, so two adjacent free blocks never survive a
//! `free`.

use crate::arena::{align_up, Arena, Offset, ARENA_ALIGN};
use serde::Serialize;
use std::mem;
use thiserror::Error;
use tracing::{debug, warn};

const BLOCK_SIGNATURE: u32 = 0x0F00_C0DE;
const FLAG_FREE: u32 = 1;
const FLAG_USED: u32 = 0;

/// Header in front of every block
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    signature: u32,
    free: u32,
    prev: Offset,
    next: Offset,
    /// Only meaningful while the block is free
    next_free: Offset,
}

pub const BLOCK_HEADER_SIZE: u64 = mem::size_of::<BlockHeader>() as u64;

impl BlockHeader {
    fn new(prev: Offset, next: Offset, free: bool) -> Self {
        Self {
            signature: BLOCK_SIGNATURE,
            free: if free { FLAG_FREE } else { FLAG_USED },
            prev,
            next,
            next_free: Offset::NULL,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.signature == BLOCK_SIGNATURE
    }

    pub fn is_free(&self) -> bool {
        self.free == FLAG_FREE
    }

    pub fn prev(&self) -> Offset {
        self.prev
    }

    pub fn next(&self) -> Offset {
        self.next
    }

    pub fn next_free(&self) -> Offset {
        self.next_free
    }
}

/// Damage detected in arena structures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorruptionError {
    #[error("invalid block signature at offset {0}")]
    BadSignature(Offset),
    #[error("offset {0} is outside the pool")]
    OutOfBounds(Offset),
    #[error("block at offset {0} is already free")]
    DoubleFree(Offset),
    #[error("adjacent free blocks at offsets {0} and {1}")]
    AdjacentFree(Offset, Offset),
    #[error("block list inconsistent: {0}")]
    BlockList(String),
    #[error("free chain inconsistent: {0}")]
    FreeChain(String),
    #[error("hash index inconsistent: {0}")]
    Index(String),
    #[error("damaged cache entry at offset {0}")]
    BadEntry(Offset),
    #[error("pending-free queue inconsistent: {0}")]
    Queue(String),
    #[error("pending-free queue is still full after cleanup")]
    QueueOverflow,
}

/// One block as seen from outside the allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockInfo {
    /// Payload offset, the value `allocate` hands out
    pub offset: Offset,
    pub capacity: u64,
    pub free: bool,
}

/// Pool usage summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: u64,
    pub free_bytes: u64,
    pub used_bytes: u64,
    pub blocks: u64,
    pub free_blocks: u64,
    pub largest_free: u64,
}

impl PoolStats {
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.used_bytes as f64 / self.capacity as f64
        }
    }

    pub fn fragmentation(&self) -> f64 {
        if self.free_bytes == 0 {
            0.0
        } else {
            1.0 - (self.largest_free as f64 / self.free_bytes as f64)
        }
    }
}

/// Allocator over one pool region of the arena
///
/// The allocator holds no state of its own beyond the sentinel offsets; all
/// bookkeeping lives in the arena, so every process builds its own copy.
/// Callers must hold the segment's exclusive lock for `allocate` and `free`.
#[derive(Clone, Copy)]
pub struct BlockAllocator {
    arena: Arena,
    head: Offset,
    first: Offset,
    tail: Offset,
}

impl BlockAllocator {
    /// Bytes occupied by a pool with `capacity` payload bytes, sentinels included
    pub const fn region_size(capacity: u64) -> u64 {
        3 * BLOCK_HEADER_SIZE + align_up(capacity)
    }

    fn sentinels(arena: &Arena, start: Offset, capacity: u64) -> Result<(Offset, Offset, Offset), CorruptionError> {
        let capacity = align_up(capacity);
        if start.is_null()
            || start.get() % ARENA_ALIGN != 0
            || capacity < ARENA_ALIGN
            || !arena.contains(start, Self::region_size(capacity))
        {
            return Err(CorruptionError::OutOfBounds(start));
        }
        let head = start;
        let first = head.add(BLOCK_HEADER_SIZE);
        let tail = first.add(BLOCK_HEADER_SIZE + capacity);
        Ok((head, first, tail))
    }

    /// Lay out an empty pool of `capacity` bytes at `start`
    pub fn init(arena: Arena, start: Offset, capacity: u64) -> Result<Self, CorruptionError> {
        let (head, first, tail) = Self::sentinels(&arena, start, capacity)?;

        let mut head_hdr = BlockHeader::new(Offset::NULL, first, true);
        head_hdr.next_free = first;
        let first_hdr = BlockHeader::new(head, tail, true);
        let tail_hdr = BlockHeader::new(first, Offset::NULL, false);

        arena.write(head, head_hdr);
        arena.write(first, first_hdr);
        arena.write(tail, tail_hdr);

        let allocator = Self {
            arena,
            head,
            first,
            tail,
        };
        arena.release_pages(first.add(BLOCK_HEADER_SIZE), align_up(capacity));
        Ok(allocator)
    }

    /// Attach to a pool previously laid out by [`BlockAllocator::init`]
    pub fn open(arena: Arena, start: Offset, capacity: u64) -> Result<Self, CorruptionError> {
        let (head, first, tail) = Self::sentinels(&arena, start, capacity)?;
        let allocator = Self {
            arena,
            head,
            first,
            tail,
        };

        let head_hdr = allocator.header(head)?;
        let tail_hdr = allocator.header(tail)?;
        if !head_hdr.is_free() || !head_hdr.prev.is_null() || head_hdr.next != first {
            return Err(CorruptionError::BlockList("head sentinel is damaged".into()));
        }
        if tail_hdr.is_free() || !tail_hdr.next.is_null() {
            return Err(CorruptionError::BlockList("tail sentinel is damaged".into()));
        }
        Ok(allocator)
    }

    /// Payload bytes the pool can hold when empty
    pub fn capacity(&self) -> u64 {
        self.tail.get() - self.first.get() - BLOCK_HEADER_SIZE
    }

    fn header(&self, block: Offset) -> Result<BlockHeader, CorruptionError> {
        let header: BlockHeader = self
            .arena
            .read(block)
            .ok_or(CorruptionError::OutOfBounds(block))?;
        if !header.is_valid() {
            return Err(CorruptionError::BadSignature(block));
        }
        Ok(header)
    }

    fn store(&self, block: Offset, header: BlockHeader) {
        let written = self.arena.write(block, header);
        debug_assert!(written, "block header store out of range");
    }

    fn invalidate(&self, block: Offset) {
        self.store(
            block,
            BlockHeader {
                signature: 0,
                free: FLAG_USED,
                prev: Offset::NULL,
                next: Offset::NULL,
                next_free: Offset::NULL,
            },
        );
    }

    fn capacity_of(block: Offset, header: &BlockHeader) -> u64 {
        if header.next.is_null() {
            return 0;
        }
        header
            .next
            .get()
            .saturating_sub(block.get() + BLOCK_HEADER_SIZE)
    }

    fn max_blocks(&self) -> u64 {
        (self.tail.get() - self.head.get()) / BLOCK_HEADER_SIZE + 1
    }

    /// Block header offset for a payload offset inside the pool
    fn block_of(&self, payload: Offset) -> Option<Offset> {
        let block = payload.sub(BLOCK_HEADER_SIZE);
        (!block.is_null() && block >= self.first && block < self.tail).then_some(block)
    }

    /// Allocate `size` payload bytes, returning the payload offset
    ///
    /// Returns `None` when `size` is zero or no free block is large enough.
    pub fn allocate(&self, size: usize) -> Option<Offset> {
        if size == 0 {
            return None;
        }
        let need = align_up(size as u64);

        let mut prev_free = self.head;
        let mut prev_hdr = match self.header(self.head) {
            Ok(header) => header,
            Err(e) => {
                warn!(error = %e, "allocator head is damaged, possible memory corruption");
                return None;
            }
        };
        let mut node = prev_hdr.next_free;
        let mut steps = 0;

        while !node.is_null() {
            let mut hdr = match self.header(node) {
                Ok(header) if header.is_free() => header,
                Ok(_) => {
                    warn!(offset = %node, "free chain reaches a used block, possible memory corruption");
                    return None;
                }
                Err(e) => {
                    warn!(error = %e, "free chain is damaged, possible memory corruption");
                    return None;
                }
            };

            let capacity = Self::capacity_of(node, &hdr);
            if capacity >= need {
                if capacity > need + BLOCK_HEADER_SIZE {
                    let following = hdr.next;
                    let mut following_hdr = match self.header(following) {
                        Ok(header) => header,
                        Err(e) => {
                            warn!(error = %e, "block list is damaged, possible memory corruption");
                            return None;
                        }
                    };

                    let rest = node.add(BLOCK_HEADER_SIZE + need);
                    let mut rest_hdr = BlockHeader::new(node, following, true);
                    rest_hdr.next_free = hdr.next_free;
                    self.store(rest, rest_hdr);

                    following_hdr.prev = rest;
                    self.store(following, following_hdr);

                    hdr.next = rest;
                    prev_hdr.next_free = rest;
                } else {
                    prev_hdr.next_free = hdr.next_free;
                }

                hdr.free = FLAG_USED;
                hdr.next_free = Offset::NULL;
                self.store(prev_free, prev_hdr);
                self.store(node, hdr);

                let payload = node.add(BLOCK_HEADER_SIZE);
                debug!(size, offset = %payload, "allocated block");
                return Some(payload);
            }

            prev_free = node;
            prev_hdr = hdr;
            node = hdr.next_free;

            steps += 1;
            if steps > self.max_blocks() {
                warn!("free chain does not terminate, possible memory corruption");
                return None;
            }
        }

        debug!(size, "no free block large enough");
        None
    }

    /// Free the block whose payload starts at `payload`
    ///
    /// Returns the capacity of the free region the block ended up in after
    /// coalescing. A block whose header fails validation is left untouched.
    pub fn free(&self, payload: Offset) -> Result<u64, CorruptionError> {
        let block = self
            .block_of(payload)
            .ok_or(CorruptionError::OutOfBounds(payload))?;
        let mut hdr = self.header(block)?;
        if hdr.is_free() {
            return Err(CorruptionError::DoubleFree(payload));
        }

        hdr.free = FLAG_FREE;
        self.store(block, hdr);

        // Merge into free blocks on the left
        let mut node = block;
        let mut node_hdr = hdr;
        while node != self.first {
            let prev = node_hdr.prev;
            let mut prev_hdr = self.header(prev)?;
            if !prev_hdr.is_free() {
                break;
            }
            let next = node_hdr.next;
            let mut next_hdr = self.header(next)?;

            next_hdr.prev = prev;
            prev_hdr.next = next;
            self.store(next, next_hdr);
            self.store(prev, prev_hdr);
            self.invalidate(node);

            node = prev;
            node_hdr = prev_hdr;
        }

        // Merge free blocks on the right into it
        loop {
            let next = node_hdr.next;
            let next_hdr = self.header(next)?;
            if !next_hdr.is_free() {
                break;
            }
            let after = next_hdr.next;
            let mut after_hdr = self.header(after)?;

            after_hdr.prev = node;
            node_hdr.next = after;
            self.store(after, after_hdr);
            self.store(node, node_hdr);
            self.invalidate(next);
        }

        // Chain the merged block to the next free block on its right
        let mut next_free = Offset::NULL;
        let mut cursor = node_hdr.next;
        while !cursor.is_null() {
            let cursor_hdr = self.header(cursor)?;
            if cursor_hdr.is_free() {
                next_free = cursor;
                break;
            }
            cursor = cursor_hdr.next;
        }
        node_hdr.next_free = next_free;
        self.store(node, node_hdr);

        // Point the closest free block on its left at it; `head` ends the search
        let mut cursor = node_hdr.prev;
        loop {
            if cursor.is_null() {
                return Err(CorruptionError::FreeChain(format!(
                    "no free block precedes {}",
                    node
                )));
            }
            let mut cursor_hdr = self.header(cursor)?;
            if cursor_hdr.is_free() {
                cursor_hdr.next_free = node;
                self.store(cursor, cursor_hdr);
                break;
            }
            cursor = cursor_hdr.prev;
        }

        let capacity = Self::capacity_of(node, &node_hdr);
        self.arena
            .release_pages(node.add(BLOCK_HEADER_SIZE), capacity);
        debug!(offset = %payload, merged = %node.add(BLOCK_HEADER_SIZE), capacity, "freed block");
        Ok(capacity)
    }

    /// Capacity of an allocated block
    pub fn payload_capacity(&self, payload: Offset) -> Result<u64, CorruptionError> {
        let block = self
            .block_of(payload)
            .ok_or(CorruptionError::OutOfBounds(payload))?;
        let hdr = self.header(block)?;
        if hdr.is_free() {
            return Err(CorruptionError::DoubleFree(payload));
        }
        Ok(Self::capacity_of(block, &hdr))
    }

    /// Whether `payload` is the start of a block currently handed out
    pub fn is_allocated(&self, payload: Offset) -> bool {
        self.block_of(payload)
            .and_then(|block| self.header(block).ok())
            .map_or(false, |hdr| !hdr.is_free())
    }

    /// All blocks between the sentinels, in address order
    pub fn blocks(&self) -> Result<Vec<BlockInfo>, CorruptionError> {
        let mut blocks = Vec::new();
        let mut node = self.first;
        let mut steps = 0;
        while node != self.tail {
            let hdr = self.header(node)?;
            blocks.push(BlockInfo {
                offset: node.add(BLOCK_HEADER_SIZE),
                capacity: Self::capacity_of(node, &hdr),
                free: hdr.is_free(),
            });
            node = hdr.next;

            steps += 1;
            if node.is_null() || steps > self.max_blocks() {
                return Err(CorruptionError::BlockList("block list does not reach tail".into()));
            }
        }
        Ok(blocks)
    }

    /// Free blocks in address order
    pub fn free_regions(&self) -> Result<Vec<BlockInfo>, CorruptionError> {
        Ok(self.blocks()?.into_iter().filter(|b| b.free).collect())
    }

    pub fn stats(&self) -> Result<PoolStats, CorruptionError> {
        let mut stats = PoolStats {
            capacity: self.capacity(),
            ..Default::default()
        };
        for block in self.blocks()? {
            stats.blocks += 1;
            if block.free {
                stats.free_blocks += 1;
                stats.free_bytes += block.capacity;
                stats.largest_free = stats.largest_free.max(block.capacity);
            } else {
                stats.used_bytes += block.capacity;
            }
        }
        Ok(stats)
    }

    /// Walk the block list and the free chain and verify every invariant
    pub fn check_consistency(&self) -> Result<(), CorruptionError> {
        let head_hdr = self.header(self.head)?;
        let tail_hdr = self.header(self.tail)?;

        if !head_hdr.prev.is_null() || !head_hdr.is_free() || head_hdr.next != self.first {
            return Err(CorruptionError::BlockList("head sentinel is damaged".into()));
        }
        if tail_hdr.is_free() || !tail_hdr.next.is_null() || !tail_hdr.next_free.is_null() {
            return Err(CorruptionError::BlockList("tail sentinel is damaged".into()));
        }

        let mut prev = self.head;
        let mut prev_free = false;
        let mut node = self.first;
        let mut expected_free = head_hdr.next_free;
        let mut steps = 0;

        while !node.is_null() {
            let hdr = self.header(node)?;
            if hdr.prev != prev {
                return Err(CorruptionError::BlockList(format!(
                    "block {} links back to {} instead of {}",
                    node, hdr.prev, prev
                )));
            }
            if node != self.tail && hdr.next <= node {
                return Err(CorruptionError::BlockList(format!(
                    "block {} is not followed by a higher address",
                    node
                )));
            }

            if hdr.is_free() {
                if node != expected_free {
                    return Err(CorruptionError::FreeChain(format!(
                        "free block {} is not next on the chain (expected {})",
                        node, expected_free
                    )));
                }
                if prev_free {
                    return Err(CorruptionError::AdjacentFree(prev, node));
                }
                expected_free = hdr.next_free;
            } else if node == expected_free {
                return Err(CorruptionError::FreeChain(format!(
                    "used block {} is on the free chain",
                    node
                )));
            }

            // The head sentinel is free by construction and never merges
            prev_free = hdr.is_free() && node != self.head;
            prev = node;
            node = hdr.next;

            steps += 1;
            if steps > self.max_blocks() {
                return Err(CorruptionError::BlockList("block list does not terminate".into()));
            }
        }

        if !expected_free.is_null() {
            return Err(CorruptionError::FreeChain(format!(
                "chain continues past the last free block to {}",
                expected_free
            )));
        }
        if prev != self.tail {
            return Err(CorruptionError::BlockList("block list does not end at tail".into()));
        }
        Ok(())
    }

    /// Rebuild the free chain from the block list
    pub fn rebuild_free_chain(&self) -> Result<(), CorruptionError> {
        let mut last_free = Offset::NULL;
        let mut node = self.header(self.tail)?.prev;
        let mut steps = 0;

        while node != self.head {
            if node.is_null() {
                return Err(CorruptionError::BlockList("block list does not reach head".into()));
            }
            let mut hdr = self.header(node)?;
            if hdr.is_free() {
                hdr.next_free = last_free;
                self.store(node, hdr);
                last_free = node;
            }
            node = hdr.prev;

            steps += 1;
            if steps > self.max_blocks() {
                return Err(CorruptionError::BlockList("block list does not terminate".into()));
            }
        }

        let mut head_hdr = self.header(self.head)?;
        head_hdr.next_free = last_free;
        self.store(self.head, head_hdr);
        Ok(())
    }
}
