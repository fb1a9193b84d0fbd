//! Shared memory cache that ties all components together
//!
//! Provides the segment layout, the per-process [`ShmCache`] context and the
//! high-level insert / lookup / release / cleanup operations. Every mutating
//! operation runs under the segment's exclusive lock; plain lookups and
//! statistics only take it shared.

use crate::{
    arena::{align_up, Arena, Offset},
    block::{BlockAllocator, CorruptionError, PoolStats},
    cache::{
        entry::{entry_size, EntryHandle, EntryInfo, EntryRef, EntryState, EntryType},
        free_queue::FreeQueue,
        hash_index::HashIndex,
        local_refs::{LocalId, LocalRefTable},
    },
    config::CacheConfig,
    lock::{LockError, SegmentLock},
    memory::SharedMemory,
};
use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::mem;
use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

const SEGMENT_MAGIC: u64 = 0x5348_4D43_4143_4845; // "SHMCACHE"
const SEGMENT_VERSION: u32 = 1;

/// Profiling counters kept in the segment header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Counter {
    FindHits,
    FindMisses,
    FindComparisons,
    InsertHits,
    InsertMisses,
    InsertComparisons,
    Reclaimed,
}

const COUNTER_COUNT: usize = 7;

/// Placement of the segment regions; identical in every process
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Layout {
    pub segment_size: u64,
    pub index_offset: u64,
    pub slots: u64,
    pub queue_offset: u64,
    pub queue_capacity: u64,
    pub pool_offset: u64,
    pub pool_capacity: u64,
}

impl Layout {
    pub fn for_config(config: &CacheConfig) -> Self {
        let header_size = align_up(mem::size_of::<SegmentHeader>() as u64);
        let index_offset = header_size;
        let queue_offset = index_offset + align_up(HashIndex::region_size(config.slots));
        let pool_offset = queue_offset + align_up(FreeQueue::region_size(config.max_pending_free));
        let pool_capacity = align_up(config.pool_size);

        Self {
            segment_size: pool_offset + BlockAllocator::region_size(pool_capacity),
            index_offset,
            slots: config.slots,
            queue_offset,
            queue_capacity: config.max_pending_free,
            pool_offset,
            pool_capacity,
        }
    }

    fn crc(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&SEGMENT_VERSION.to_le_bytes());
        for field in [
            self.segment_size,
            self.index_offset,
            self.slots,
            self.queue_offset,
            self.queue_capacity,
            self.pool_offset,
            self.pool_capacity,
        ] {
            hasher.update(&field.to_le_bytes());
        }
        hasher.finalize()
    }
}

/// Header at offset 0 of every segment
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct SegmentHeader {
    magic: u64,
    version: u32,
    layout_crc: u32,
    /// Milliseconds since the Unix epoch
    created_at: i64,
    layout: Layout,
    next_serial: u64,
    counters: [u64; COUNTER_COUNT],
}

const NEXT_SERIAL_OFFSET: u64 = mem::offset_of!(SegmentHeader, next_serial) as u64;
const COUNTERS_OFFSET: u64 = mem::offset_of!(SegmentHeader, counters) as u64;

impl SegmentHeader {
    fn new(layout: Layout) -> Self {
        Self {
            magic: SEGMENT_MAGIC,
            version: SEGMENT_VERSION,
            layout_crc: layout.crc(),
            created_at: Utc::now().timestamp_millis(),
            layout,
            next_serial: 1,
            counters: [0; COUNTER_COUNT],
        }
    }

    fn is_valid(&self) -> bool {
        self.magic == SEGMENT_MAGIC
            && self.version == SEGMENT_VERSION
            && self.layout_crc == self.layout.crc()
    }
}

/// Process-local views of the structures in one segment
#[derive(Clone, Copy)]
struct Segment {
    arena: Arena,
    layout: Layout,
    allocator: BlockAllocator,
    index: HashIndex,
    queue: FreeQueue,
}

impl Segment {
    /// Lay out a fresh segment over `arena`
    fn format(arena: Arena, layout: Layout, max_items: u64) -> Result<Self, ShmCacheError> {
        if (arena.len() as u64) < layout.segment_size {
            return Err(ShmCacheError::InvalidHeader);
        }
        arena.write(Offset::new(0), SegmentHeader::new(layout));

        let index = HashIndex::init(arena, Offset::new(layout.index_offset), layout.slots, max_items)?;
        let queue = FreeQueue::init(arena, Offset::new(layout.queue_offset), layout.queue_capacity)?;
        let allocator = BlockAllocator::init(arena, Offset::new(layout.pool_offset), layout.pool_capacity)?;

        Ok(Self {
            arena,
            layout,
            allocator,
            index,
            queue,
        })
    }

    /// Validate the header written by the owner and attach to its structures
    fn load(arena: Arena) -> Result<Self, ShmCacheError> {
        let header: SegmentHeader = arena
            .read(Offset::new(0))
            .ok_or(ShmCacheError::InvalidHeader)?;
        if !header.is_valid() || header.layout.segment_size > arena.len() as u64 {
            warn!("segment header failed validation");
            return Err(ShmCacheError::InvalidHeader);
        }
        let layout = header.layout;

        let index = HashIndex::open(arena, Offset::new(layout.index_offset))?;
        let queue = FreeQueue::open(arena, Offset::new(layout.queue_offset))?;
        let allocator = BlockAllocator::open(arena, Offset::new(layout.pool_offset), layout.pool_capacity)?;
        if index.capacity() != layout.slots || queue.capacity() != layout.queue_capacity {
            return Err(ShmCacheError::InvalidHeader);
        }

        Ok(Self {
            arena,
            layout,
            allocator,
            index,
            queue,
        })
    }

    fn atomic(&self, offset: u64) -> Option<&AtomicU64> {
        self.arena.atomic_u64(Offset::new(offset))
    }

    fn counter(&self, counter: Counter) -> u64 {
        self.atomic(COUNTERS_OFFSET + counter as u64 * 8)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    fn bump(&self, counter: Counter, by: u64) {
        if let Some(c) = self.atomic(COUNTERS_OFFSET + counter as u64 * 8) {
            c.fetch_add(by, Ordering::Relaxed);
        }
    }

    fn next_serial(&self) -> u64 {
        self.atomic(NEXT_SERIAL_OFFSET)
            .map_or(0, |c| c.fetch_add(1, Ordering::Relaxed))
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.arena
            .read::<SegmentHeader>(Offset::new(0))
            .and_then(|h| Utc.timestamp_millis_opt(h.created_at).single())
            .unwrap_or_default()
    }
}

/// Why an insert could not be satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Exhaustion {
    #[error("hash index is at its admission cap")]
    IndexFull,
    #[error("no free block is large enough")]
    OutOfMemory,
    #[error("entry of {0} bytes can never fit in the pool")]
    TooLarge(u64),
}

/// Cache errors
#[derive(Debug, Error)]
pub enum ShmCacheError {
    #[error("Memory error: {0}")]
    Memory(#[from] anyhow::Error),
    #[error("Invalid header")]
    InvalidHeader,
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),
    #[error("Corruption detected: {0}")]
    Corruption(#[from] CorruptionError),
    #[error("Cache capacity exhausted: {0}")]
    CapacityExhausted(Exhaustion),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Blob belongs to another cache attachment")]
    ForeignBlob,
}

impl ShmCacheError {
    /// Whether the caller may simply skip caching and carry on
    pub fn is_capacity(&self) -> bool {
        matches!(self, ShmCacheError::CapacityExhausted(_))
    }
}

fn validate_key(key: &str) -> Result<(), ShmCacheError> {
    if key.contains('\0') {
        return Err(ShmCacheError::InvalidKey("key cannot contain NUL".into()));
    }
    if key.len() > u32::MAX as usize {
        return Err(ShmCacheError::InvalidKey("key is too long".into()));
    }
    Ok(())
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub segment_size: u64,
    pub slots: u64,
    pub items: u64,
    pub max_items: u64,
    pub tombstones: u64,
    pub pending_free: u64,
    pub pending_capacity: u64,
    pub pool: PoolStats,
    pub find_hits: u64,
    pub find_misses: u64,
    pub find_comparisons: u64,
    pub insert_hits: u64,
    pub insert_misses: u64,
    pub insert_comparisons: u64,
    pub reclaimed: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.find_hits + self.find_misses;
        if lookups == 0 {
            0.0
        } else {
            self.find_hits as f64 / lookups as f64
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// One process's attachment to a shared cache segment
///
/// Create one per process with [`ShmCache::attach`] and pass it to whatever
/// needs the cache. Dropping it releases any references held through
/// [`ShmCache::hold_local`] but leaves the segment in place;
/// [`ShmCache::detach`] with `teardown` removes it.
pub struct ShmCache {
    segment: Segment,
    lock: SegmentLock,
    memory: SharedMemory,
    name: String,
    owner: bool,
    reclaim_batch: usize,
    local_refs: Mutex<LocalRefTable>,
}

impl ShmCache {
    /// Attach to the segment named in `config`
    ///
    /// The owner recreates the segment from scratch, destroying anything a
    /// previous owner left behind. Other processes attach to an existing
    /// segment and fail if there is none.
    pub fn attach(config: &CacheConfig, owner: bool) -> Result<Self, ShmCacheError> {
        config
            .validate()
            .map_err(|e| ShmCacheError::Config(e.to_string()))?;

        let dir = config.segment_dir.as_deref();
        let path = SharedMemory::segment_path(&config.name, dir);
        let lock = SegmentLock::open(&SegmentLock::lock_path(&path), config.lock_timeout())?;

        let (memory, segment) = if owner {
            let _guard = lock.write()?;
            let layout = Layout::for_config(config);
            let memory = SharedMemory::create(&config.name, layout.segment_size as usize, dir)?;
            let arena = memory.arena().with_page_release(config.release_pages);
            let segment = Segment::format(arena, layout, config.max_items)?;
            info!(
                name = %config.name,
                path = %path.display(),
                size = layout.segment_size,
                "created cache segment"
            );
            (memory, segment)
        } else {
            let _guard = lock.read()?;
            let memory = SharedMemory::open(&config.name, dir)?;
            let arena = memory.arena().with_page_release(config.release_pages);
            let segment = Segment::load(arena)?;
            info!(name = %config.name, path = %path.display(), "attached to cache segment");
            (memory, segment)
        };

        Ok(Self {
            segment,
            lock,
            memory,
            name: config.name.clone(),
            owner,
            reclaim_batch: config.reclaim_batch,
            local_refs: Mutex::new(LocalRefTable::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    pub fn segment_path(&self) -> &Path {
        self.memory.path()
    }

    pub fn layout(&self) -> Layout {
        self.segment.layout
    }

    /// Store `bytes` under `key`
    ///
    /// The returned handle carries the inserter's reference. It is dropped
    /// exactly once: by [`ShmCache::release`] on this handle, by
    /// [`ShmCache::remove`], or when a later insert of the same key shadows
    /// the entry, whichever comes first. Releasing the handle after that is a
    /// no-op.
    pub fn insert(
        &self,
        key: &str,
        bytes: &[u8],
        entry_type: EntryType,
    ) -> Result<EntryHandle, ShmCacheError> {
        validate_key(key)?;
        let _guard = self.lock.write()?;
        self.debug_check("pre insert");

        let result = self.insert_locked(key, bytes, entry_type);
        if let Err(ShmCacheError::CapacityExhausted(reason)) = &result {
            self.segment.bump(Counter::InsertMisses, 1);
            warn!(key, size = bytes.len(), %reason, "insert failed");
        }

        self.debug_check("post insert");
        result
    }

    /// Insert, draining the whole pending-free queue once if space runs out
    pub fn insert_or_reclaim(
        &self,
        key: &str,
        bytes: &[u8],
        entry_type: EntryType,
    ) -> Result<EntryHandle, ShmCacheError> {
        match self.insert(key, bytes, entry_type) {
            Err(ShmCacheError::CapacityExhausted(
                reason @ (Exhaustion::IndexFull | Exhaustion::OutOfMemory),
            )) => {
                if self.cleanup_all()? == 0 {
                    return Err(ShmCacheError::CapacityExhausted(reason));
                }
                self.insert(key, bytes, entry_type)
            }
            other => other,
        }
    }

    fn insert_locked(
        &self,
        key: &str,
        bytes: &[u8],
        entry_type: EntryType,
    ) -> Result<EntryHandle, ShmCacheError> {
        let size = entry_size(key.len(), bytes.len());
        if size > self.segment.allocator.capacity() {
            return Err(ShmCacheError::CapacityExhausted(Exhaustion::TooLarge(size)));
        }

        match self.try_insert(key, bytes, entry_type, size) {
            Err(ShmCacheError::CapacityExhausted(reason)) => {
                debug!(key, %reason, "insert under pressure, running cleanup");
                if self.cleanup_locked()? == 0 {
                    return Err(ShmCacheError::CapacityExhausted(reason));
                }
                self.try_insert(key, bytes, entry_type, size)
            }
            other => other,
        }
    }

    fn try_insert(
        &self,
        key: &str,
        bytes: &[u8],
        entry_type: EntryType,
        size: u64,
    ) -> Result<EntryHandle, ShmCacheError> {
        let segment = &self.segment;
        if !segment.index.admits() {
            return Err(ShmCacheError::CapacityExhausted(Exhaustion::IndexFull));
        }
        let offset = segment
            .allocator
            .allocate(size as usize)
            .ok_or(ShmCacheError::CapacityExhausted(Exhaustion::OutOfMemory))?;

        let serial = segment.next_serial();
        let published = EntryRef::write_new(&segment.arena, offset, key.as_bytes(), bytes, entry_type, serial)
            .and_then(|_| segment.index.insert(key.as_bytes(), offset));

        let placement = match published {
            Ok(Some(placement)) => placement,
            Ok(None) => {
                segment.allocator.free(offset)?;
                return Err(ShmCacheError::CapacityExhausted(Exhaustion::IndexFull));
            }
            Err(e) => {
                if let Err(free_err) = segment.allocator.free(offset) {
                    warn!(offset = %offset, error = %free_err, "could not free block of failed insert");
                }
                return Err(e.into());
            }
        };

        segment.bump(Counter::InsertHits, 1);
        segment.bump(Counter::InsertComparisons, placement.comparisons);

        if let Some(old) = placement.replaced {
            let shadowed = EntryRef::open(&segment.arena, old)?;
            if shadowed.header().has_inserter_ref() {
                self.deref_locked(shadowed, true)?;
            }
        }

        debug!(key, offset = %offset, slot = placement.slot, serial, "inserted entry");
        Ok(EntryHandle {
            offset,
            serial,
            inserter: true,
        })
    }

    /// Look up `key` and take a reference on it
    ///
    /// The reference is released when the returned blob is dropped, or kept
    /// with [`CachedBlob::into_handle`] / [`ShmCache::hold_local`].
    pub fn lookup(&self, key: &str) -> Result<Option<CachedBlob<'_>>, ShmCacheError> {
        Ok(self.locate(key, true)?.map(|entry| CachedBlob {
            cache: self,
            handle: entry.handle(),
            bytes: entry.payload(),
            entry_type: entry.entry_type(),
            armed: true,
        }))
    }

    /// Look up `key`, taking a reference only when `add_ref` is set
    ///
    /// Without `add_ref` only the shared lock is taken and the handle carries
    /// no reference, so the entry may be reclaimed at any time.
    pub fn lookup_entry(&self, key: &str, add_ref: bool) -> Result<Option<EntryHandle>, ShmCacheError> {
        Ok(self.locate(key, add_ref)?.map(|entry| entry.handle()))
    }

    fn locate(&self, key: &str, add_ref: bool) -> Result<Option<EntryRef<'_>>, ShmCacheError> {
        validate_key(key)?;
        let _guard = if add_ref {
            self.lock.write()?
        } else {
            self.lock.read()?
        };
        let segment = &self.segment;

        let found = segment.index.find(key.as_bytes())?;
        segment.bump(Counter::FindComparisons, found.comparisons);
        let Some((slot, offset)) = found.entry else {
            segment.bump(Counter::FindMisses, 1);
            debug!(key, comparisons = found.comparisons, "lookup miss");
            return Ok(None);
        };
        segment.bump(Counter::FindHits, 1);

        let mut entry = EntryRef::open(&segment.arena, offset)?;
        if add_ref {
            let mut header = entry.header();
            if header.refcount == 0 {
                if segment.queue.remove(offset) {
                    debug!(key, offset = %offset, "rescued entry from pending-free queue");
                }
                header.set_state(EntryState::Live);
            }
            header.refcount += 1;
            entry.store_header(header);
            self.debug_check("post lookup");
        }

        debug!(key, slot, refcount = entry.header().refcount, "lookup hit");
        Ok(Some(entry))
    }

    /// Whether `key` currently has an entry
    pub fn contains(&self, key: &str) -> Result<bool, ShmCacheError> {
        validate_key(key)?;
        let _guard = self.lock.read()?;
        Ok(self.segment.index.find(key.as_bytes())?.entry.is_some())
    }

    /// Payload of the entry behind `handle`
    ///
    /// The slice stays valid only while a reference on the entry is held.
    pub fn payload(&self, handle: EntryHandle) -> Result<Option<&[u8]>, ShmCacheError> {
        let _guard = self.lock.read()?;
        Ok(self.live_entry(handle).map(|entry| entry.payload()))
    }

    /// Metadata of the entry behind `handle`; `None` once it is reclaimed
    pub fn entry_info(&self, handle: EntryHandle) -> Result<Option<EntryInfo>, ShmCacheError> {
        let _guard = self.lock.read()?;
        Ok(self.live_entry(handle).map(|entry| entry.info()))
    }

    fn live_entry(&self, handle: EntryHandle) -> Option<EntryRef<'_>> {
        if !self.segment.allocator.is_allocated(handle.offset) {
            return None;
        }
        let entry = EntryRef::open(&self.segment.arena, handle.offset).ok()?;
        let live = entry.matches(handle) && entry.header().state() != Some(EntryState::Reclaimed);
        live.then_some(entry)
    }

    /// Drop one reference taken by `insert` or `lookup`
    ///
    /// The entry is queued for reclamation when its count reaches zero.
    /// Releasing a handle whose reference is already gone (the entry was
    /// reclaimed, the inserter's reference was dropped, or no lookup
    /// references are left) only logs a warning.
    pub fn release(&self, handle: EntryHandle) -> Result<(), ShmCacheError> {
        let _guard = self.lock.write()?;
        self.debug_check("pre release");

        let Some(entry) = self.live_entry(handle) else {
            warn!(offset = %handle.offset, serial = handle.serial, "release of stale handle ignored");
            return Ok(());
        };
        let header = entry.header();
        let held = if handle.inserter {
            header.has_inserter_ref()
        } else {
            header.lookup_refs() > 0
        };
        if !held {
            warn!(
                offset = %handle.offset,
                inserter = handle.inserter,
                "release of a reference that is no longer held ignored"
            );
            return Ok(());
        }

        let remaining = self.deref_locked(entry, handle.inserter)?;
        debug!(offset = %handle.offset, remaining, "released entry");
        self.debug_check("post release");
        Ok(())
    }

    /// Drop the reference held by whoever inserted `key`
    ///
    /// Returns false when there is no entry or its inserter's reference is
    /// already gone.
    pub fn remove(&self, key: &str) -> Result<bool, ShmCacheError> {
        validate_key(key)?;
        let _guard = self.lock.write()?;
        self.debug_check("pre remove");

        let Some((_, offset)) = self.segment.index.find(key.as_bytes())?.entry else {
            return Ok(false);
        };
        let entry = EntryRef::open(&self.segment.arena, offset)?;
        if !entry.header().has_inserter_ref() {
            debug!(key, "inserter reference already dropped");
            return Ok(false);
        }

        self.deref_locked(entry, true)?;
        self.debug_check("post remove");
        Ok(true)
    }

    /// Decrement a positive refcount, queueing the entry when it hits zero
    fn deref_locked(&self, mut entry: EntryRef<'_>, inserter: bool) -> Result<u32, ShmCacheError> {
        let mut header = entry.header();
        if inserter {
            header.clear_inserter_ref();
        }
        header.refcount = header.refcount.saturating_sub(1);
        if header.refcount == 0 {
            header.set_state(EntryState::PendingFree);
            entry.store_header(header);
            self.enqueue(entry.offset())?;
        } else {
            entry.store_header(header);
        }
        Ok(header.refcount)
    }

    fn enqueue(&self, offset: Offset) -> Result<(), ShmCacheError> {
        let queue = &self.segment.queue;
        if queue.position(offset).is_some() {
            return Ok(());
        }
        if queue.is_full() {
            debug!("pending-free queue full, forcing cleanup");
            self.cleanup_locked()?;
            if queue.is_full() {
                return Err(CorruptionError::QueueOverflow.into());
            }
        }
        queue.push(offset);
        Ok(())
    }

    /// Reclaim up to one batch of unreferenced entries
    ///
    /// Returns whether anything was reclaimed.
    pub fn cleanup(&self) -> Result<bool, ShmCacheError> {
        let _guard = self.lock.write()?;
        self.debug_check("pre cleanup");
        let reclaimed = self.cleanup_locked()?;
        self.debug_check("post cleanup");
        Ok(reclaimed > 0)
    }

    /// Run cleanup until nothing more can be reclaimed; returns the total
    pub fn cleanup_all(&self) -> Result<usize, ShmCacheError> {
        let _guard = self.lock.write()?;
        let mut total = 0;
        loop {
            let reclaimed = self.cleanup_locked()?;
            if reclaimed == 0 {
                break;
            }
            total += reclaimed;
        }
        if total > 0 {
            info!(reclaimed = total, "drained pending-free queue");
        }
        Ok(total)
    }

    fn cleanup_locked(&self) -> Result<usize, ShmCacheError> {
        let segment = &self.segment;
        let mut reclaimed = 0;
        let mut position = 0;

        while position < segment.queue.len() && reclaimed < self.reclaim_batch {
            let Some(offset) = segment.queue.get(position) else {
                break;
            };
            let mut entry = EntryRef::open(&segment.arena, offset)?;
            let mut header = entry.header();
            if header.refcount != 0 {
                position += 1;
                continue;
            }

            if let Some(slot) = segment.index.slot_of(entry.key(), offset) {
                segment.index.remove_on_reclaim(slot)?;
            }
            header.set_state(EntryState::Reclaimed);
            entry.store_header(header);
            segment.queue.remove_at(position);
            segment.allocator.free(offset)?;

            segment.bump(Counter::Reclaimed, 1);
            reclaimed += 1;
            debug!(offset = %offset, "reclaimed entry");
        }

        Ok(reclaimed)
    }

    /// Keep the reference behind `blob` until [`ShmCache::release_local`]
    ///
    /// A blob looked up through another attachment is refused; dropping it
    /// releases its reference against the cache it came from.
    pub fn hold_local(&self, blob: CachedBlob<'_>) -> Result<LocalId, ShmCacheError> {
        if !std::ptr::eq(blob.cache, self) {
            warn!(offset = %blob.handle.offset, "refusing to hold a blob from another cache");
            return Err(ShmCacheError::ForeignBlob);
        }
        let handle = blob.into_handle();
        Ok(self.local_refs.lock().insert(handle))
    }

    /// Release a reference kept with [`ShmCache::hold_local`]
    pub fn release_local(&self, id: LocalId) -> Result<bool, ShmCacheError> {
        let handle = self.local_refs.lock().take(id);
        match handle {
            Some(handle) => {
                self.release(handle)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn local_ref_count(&self) -> usize {
        self.local_refs.lock().len()
    }

    fn release_all_local(&self) {
        let handles = self.local_refs.lock().drain();
        for handle in handles {
            if let Err(e) = self.release(handle) {
                warn!(offset = %handle.offset, error = %e, "failed to release local reference");
            }
        }
    }

    pub fn stats(&self) -> Result<CacheStats, ShmCacheError> {
        let _guard = self.lock.read()?;
        let segment = &self.segment;

        Ok(CacheStats {
            name: self.name.clone(),
            created_at: segment.created_at(),
            segment_size: segment.layout.segment_size,
            slots: segment.index.capacity(),
            items: segment.index.items(),
            max_items: segment.index.max_items(),
            tombstones: segment.index.tombstones(),
            pending_free: segment.queue.len(),
            pending_capacity: segment.queue.capacity(),
            pool: segment.allocator.stats()?,
            find_hits: segment.counter(Counter::FindHits),
            find_misses: segment.counter(Counter::FindMisses),
            find_comparisons: segment.counter(Counter::FindComparisons),
            insert_hits: segment.counter(Counter::InsertHits),
            insert_misses: segment.counter(Counter::InsertMisses),
            insert_comparisons: segment.counter(Counter::InsertComparisons),
            reclaimed: segment.counter(Counter::Reclaimed),
        })
    }

    /// Walk the allocator, index and queue and verify every invariant
    pub fn check_consistency(&self) -> Result<(), ShmCacheError> {
        let _guard = self.lock.read()?;
        self.check_locked()
    }

    fn check_locked(&self) -> Result<(), ShmCacheError> {
        let segment = &self.segment;
        segment.allocator.check_consistency()?;
        segment.index.check_consistency()?;

        for (slot, offset) in segment.index.entries() {
            if !segment.allocator.is_allocated(offset) {
                return Err(CorruptionError::Index(format!(
                    "slot {} points at unallocated block {}",
                    slot, offset
                ))
                .into());
            }
            let header = EntryRef::open(&segment.arena, offset)?.header();
            if header.has_inserter_ref() && header.refcount == 0 {
                return Err(CorruptionError::BadEntry(offset).into());
            }
        }

        let queued = segment.queue.entries();
        for (i, &offset) in queued.iter().enumerate() {
            if queued[..i].contains(&offset) {
                return Err(CorruptionError::Queue(format!("entry {} queued twice", offset)).into());
            }
            if !segment.allocator.is_allocated(offset) {
                return Err(CorruptionError::Queue(format!("queued entry {} is not allocated", offset)).into());
            }
            let header = EntryRef::open(&segment.arena, offset)?.header();
            if header.refcount != 0
                || header.has_inserter_ref()
                || header.state() != Some(EntryState::PendingFree)
            {
                return Err(CorruptionError::Queue(format!("queued entry {} is still referenced", offset)).into());
            }
        }
        Ok(())
    }

    #[cfg(feature = "consistency-checks")]
    fn debug_check(&self, stage: &str) {
        if let Err(e) = self.check_locked() {
            warn!(stage, error = %e, "consistency check failed");
        }
    }

    #[cfg(not(feature = "consistency-checks"))]
    fn debug_check(&self, _stage: &str) {}

    /// Detach from the segment
    ///
    /// With `teardown` the owner also removes the segment and its lock file.
    /// Processes still attached keep their mapping until they detach.
    pub fn detach(self, teardown: bool) -> Result<(), ShmCacheError> {
        self.release_all_local();

        if teardown {
            if self.owner {
                self.memory.unlink()?;
                self.lock
                    .remove_file()
                    .context("Failed to remove segment lock file")?;
                info!(name = %self.name, "tore down cache segment");
            } else {
                warn!(name = %self.name, "only the owner can tear down the segment");
            }
        }

        debug!(name = %self.name, "detached from cache segment");
        Ok(())
    }
}

impl Drop for ShmCache {
    fn drop(&mut self) {
        self.release_all_local();
    }
}

/// Referenced view of a cached payload
///
/// Dereferences to the payload bytes in shared memory and releases its
/// reference when dropped.
pub struct CachedBlob<'a> {
    cache: &'a ShmCache,
    handle: EntryHandle,
    bytes: &'a [u8],
    entry_type: EntryType,
    armed: bool,
}

impl<'a> CachedBlob<'a> {
    pub fn handle(&self) -> EntryHandle {
        self.handle
    }

    pub fn entry_type(&self) -> EntryType {
        self.entry_type
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Keep the reference past the blob; release it with [`ShmCache::release`]
    pub fn into_handle(mut self) -> EntryHandle {
        self.armed = false;
        self.handle
    }

    /// Release the reference now, reporting failures
    pub fn release(mut self) -> Result<(), ShmCacheError> {
        self.armed = false;
        self.cache.release(self.handle)
    }
}

impl Deref for CachedBlob<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes
    }
}

impl fmt::Debug for CachedBlob<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedBlob")
            .field("handle", &self.handle)
            .field("entry_type", &self.entry_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl Drop for CachedBlob<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.cache.release(self.handle) {
                warn!(offset = %self.handle.offset, error = %e, "failed to release cached blob");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> CacheConfig {
        CacheConfig {
            segment_dir: Some(dir.path().to_path_buf()),
            pool_size: 64 * 1024,
            slots: 61,
            max_items: 40,
            max_pending_free: 8,
            lock_timeout_ms: 200,
            ..CacheConfig::named("unit")
        }
    }

    #[test]
    fn test_cache_creation() {
        let dir = TempDir::new().unwrap();
        let cache = ShmCache::attach(&config(&dir), true).unwrap();
        assert!(cache.is_owner());
        assert!(cache.segment_path().exists());

        let stats = cache.stats().unwrap();
        assert_eq!(stats.items, 0);
        assert_eq!(stats.slots, 61);
        assert_eq!(stats.pool.capacity, 64 * 1024);
        assert_eq!(stats.pool.free_blocks, 1);
        cache.check_consistency().unwrap();
    }

    #[test]
    fn test_layout_is_aligned_and_ordered() {
        let layout = Layout::for_config(&CacheConfig::default());
        assert_eq!(layout.index_offset % 8, 0);
        assert_eq!(layout.queue_offset % 8, 0);
        assert_eq!(layout.pool_offset % 8, 0);
        assert!(layout.index_offset < layout.queue_offset);
        assert!(layout.queue_offset < layout.pool_offset);
        assert_eq!(
            layout.segment_size,
            layout.pool_offset + BlockAllocator::region_size(layout.pool_capacity)
        );
    }

    #[test]
    fn test_attacher_rejects_damaged_header() {
        let dir = TempDir::new().unwrap();
        let cache = ShmCache::attach(&config(&dir), true).unwrap();
        cache.segment.arena.fill(Offset::new(0), 8, 0);

        let result = ShmCache::attach(&config(&dir), false);
        assert!(matches!(result, Err(ShmCacheError::InvalidHeader)));
    }

    #[test]
    fn test_attach_without_owner_fails() {
        let dir = TempDir::new().unwrap();
        assert!(ShmCache::attach(&config(&dir), false).is_err());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut bad = config(&dir);
        bad.max_items = bad.slots;
        assert!(matches!(ShmCache::attach(&bad, true), Err(ShmCacheError::Config(_))));
    }

    #[test]
    fn test_invalid_keys() {
        let dir = TempDir::new().unwrap();
        let cache = ShmCache::attach(&config(&dir), true).unwrap();

        assert!(matches!(
            cache.insert("a\0b", b"x", EntryType::Blob),
            Err(ShmCacheError::InvalidKey(_))
        ));
        assert!(matches!(cache.lookup("a\0b"), Err(ShmCacheError::InvalidKey(_))));
    }

    #[test]
    fn test_empty_key_is_a_valid_key() {
        let dir = TempDir::new().unwrap();
        let cache = ShmCache::attach(&config(&dir), true).unwrap();

        assert!(cache.lookup("").unwrap().is_none());
        let handle = cache.insert("", b"nameless", EntryType::Blob).unwrap();
        cache.insert("a", b"named", EntryType::Blob).unwrap();

        assert_eq!(&*cache.lookup("").unwrap().unwrap(), b"nameless");
        assert_eq!(cache.entry_info(handle).unwrap().unwrap().key, "");

        assert!(cache.remove("").unwrap());
        assert!(cache.cleanup().unwrap());
        assert!(!cache.contains("").unwrap());
        assert!(cache.contains("a").unwrap());
        cache.check_consistency().unwrap();
    }

    #[test]
    fn test_blob_drop_releases_reference() {
        let dir = TempDir::new().unwrap();
        let cache = ShmCache::attach(&config(&dir), true).unwrap();
        let handle = cache.insert("k", b"value", EntryType::Text).unwrap();

        {
            let blob = cache.lookup("k").unwrap().unwrap();
            assert_eq!(&*blob, b"value");
            assert_eq!(blob.entry_type(), EntryType::Text);
            assert_eq!(cache.entry_info(handle).unwrap().unwrap().refcount, 2);
        }
        assert_eq!(cache.entry_info(handle).unwrap().unwrap().refcount, 1);
    }

    #[test]
    fn test_lookup_without_ref_leaves_count() {
        let dir = TempDir::new().unwrap();
        let cache = ShmCache::attach(&config(&dir), true).unwrap();
        let handle = cache.insert("k", b"v", EntryType::Blob).unwrap();

        let found = cache.lookup_entry("k", false).unwrap().unwrap();
        assert!(found.same_entry(&handle));
        assert!(handle.is_inserter());
        assert!(!found.is_inserter());
        assert_eq!(cache.entry_info(handle).unwrap().unwrap().refcount, 1);
        assert_eq!(cache.lookup_entry("other", false).unwrap(), None);
    }

    #[test]
    fn test_too_large_entry() {
        let dir = TempDir::new().unwrap();
        let cache = ShmCache::attach(&config(&dir), true).unwrap();
        let huge = vec![0u8; 64 * 1024];

        let err = cache.insert("huge", &huge, EntryType::Blob).unwrap_err();
        assert!(matches!(err, ShmCacheError::CapacityExhausted(Exhaustion::TooLarge(_))));
        assert!(err.is_capacity());
        assert_eq!(cache.stats().unwrap().insert_misses, 1);
    }

    #[test]
    fn test_remove_drops_inserter_reference() {
        let dir = TempDir::new().unwrap();
        let cache = ShmCache::attach(&config(&dir), true).unwrap();
        let handle = cache.insert("gone", b"soon", EntryType::Blob).unwrap();

        assert!(cache.remove("gone").unwrap());
        assert!(!cache.remove("gone").unwrap());
        assert!(!cache.remove("never").unwrap());

        let info = cache.entry_info(handle).unwrap().unwrap();
        assert_eq!(info.state, EntryState::PendingFree);
        assert!(cache.cleanup().unwrap());
        assert!(!cache.contains("gone").unwrap());
        assert_eq!(cache.entry_info(handle).unwrap(), None);
    }

    #[test]
    fn test_local_refs_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let owner = ShmCache::attach(&config(&dir), true).unwrap();
        let handle = owner.insert("img", b"pixels", EntryType::Image).unwrap();

        {
            let other = ShmCache::attach(&config(&dir), false).unwrap();
            let blob = other.lookup("img").unwrap().unwrap();
            let _held = other.hold_local(blob).unwrap();
            assert_eq!(other.local_ref_count(), 1);
            assert_eq!(owner.entry_info(handle).unwrap().unwrap().refcount, 2);

            let second = other.hold_local(other.lookup("img").unwrap().unwrap()).unwrap();
            assert!(other.release_local(second).unwrap());
            assert!(!other.release_local(second).unwrap());
            assert_eq!(other.local_ref_count(), 1);
        }

        assert_eq!(owner.entry_info(handle).unwrap().unwrap().refcount, 1);
    }

    #[test]
    fn test_hold_local_refuses_foreign_blob() {
        let dir = TempDir::new().unwrap();
        let owner = ShmCache::attach(&config(&dir), true).unwrap();
        let other = ShmCache::attach(&config(&dir), false).unwrap();
        let handle = owner.insert("img", b"pixels", EntryType::Image).unwrap();

        let blob = other.lookup("img").unwrap().unwrap();
        assert_eq!(owner.entry_info(handle).unwrap().unwrap().refcount, 2);
        assert!(matches!(owner.hold_local(blob), Err(ShmCacheError::ForeignBlob)));

        // The refused blob went back through its own attachment
        assert_eq!(owner.local_ref_count(), 0);
        assert_eq!(other.local_ref_count(), 0);
        assert_eq!(owner.entry_info(handle).unwrap().unwrap().refcount, 1);
    }

    #[test]
    fn test_inserter_reference_is_dropped_once() {
        let dir = TempDir::new().unwrap();
        let cache = ShmCache::attach(&config(&dir), true).unwrap();
        let handle = cache.insert("k", b"v", EntryType::Blob).unwrap();
        let held = cache.lookup("k").unwrap().unwrap();

        assert!(cache.remove("k").unwrap());
        let info = cache.entry_info(handle).unwrap().unwrap();
        assert_eq!(info.refcount, 1);
        assert!(!info.inserter_ref);

        // Neither the insert handle nor another remove touches the lookup reference
        cache.release(handle).unwrap();
        assert!(!cache.remove("k").unwrap());
        assert_eq!(cache.entry_info(handle).unwrap().unwrap().refcount, 1);
        assert!(!cache.cleanup().unwrap());
        assert_eq!(held.as_bytes(), b"v");

        drop(held);
        assert!(cache.cleanup().unwrap());
        cache.check_consistency().unwrap();
    }

    #[test]
    fn test_stats_serialize() {
        let dir = TempDir::new().unwrap();
        let cache = ShmCache::attach(&config(&dir), true).unwrap();
        cache.insert("a", b"1", EntryType::Blob).unwrap();
        assert!(cache.lookup("a").unwrap().is_some());
        assert!(cache.lookup("b").unwrap().is_none());

        let stats = cache.stats().unwrap();
        assert_eq!(stats.insert_hits, 1);
        assert_eq!(stats.find_hits, 1);
        assert_eq!(stats.find_misses, 1);
        assert!((stats.hit_ratio() - 0.5).abs() < f64::EPSILON);

        let json = stats.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["name"], "unit");
        assert_eq!(value["items"], 1);
    }

    #[test]
    fn test_detach_with_teardown_removes_segment() {
        let dir = TempDir::new().unwrap();
        let cache = ShmCache::attach(&config(&dir), true).unwrap();
        let path = cache.segment_path().to_path_buf();

        cache.detach(true).unwrap();
        assert!(!path.exists());
        assert!(!SegmentLock::lock_path(&path).exists());
        assert!(ShmCache::attach(&config(&dir), false).is_err());
    }

    #[test]
    fn test_non_owner_cannot_tear_down() {
        let dir = TempDir::new().unwrap();
        let owner = ShmCache::attach(&config(&dir), true).unwrap();
        let other = ShmCache::attach(&config(&dir), false).unwrap();

        other.detach(true).unwrap();
        assert!(owner.segment_path().exists());
    }
}
