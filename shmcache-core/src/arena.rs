//! Offset model for the shared arena
//!
//! Nothing stored inside the arena is a native pointer. Every link is an
//! [`Offset`] measured from the arena base, and each process turns offsets
//! into local addresses through its own [`Arena`] view. The same segment can
//! therefore be mapped at a different address in every attached process.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU64;
#[cfg(target_os = "linux")]
use tracing::{debug, trace};

/// Alignment of every structure placed in the arena
pub const ARENA_ALIGN: u64 = 8;

/// Round `value` up to the arena alignment
pub const fn align_up(value: u64) -> u64 {
    (value + ARENA_ALIGN - 1) & !(ARENA_ALIGN - 1)
}

/// Byte distance from the arena base
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Offset(u64);

impl Offset {
    /// Sentinel that maps to no local address
    pub const NULL: Offset = Offset(u64::MAX);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == u64::MAX
    }

    /// Offset `bytes` further into the arena. Null and overflow yield null.
    pub fn add(self, bytes: u64) -> Offset {
        if self.is_null() {
            return self;
        }
        match self.0.checked_add(bytes) {
            Some(raw) if raw != u64::MAX => Offset(raw),
            _ => Offset::NULL,
        }
    }

    /// Offset `bytes` back towards the base. Null and underflow yield null.
    pub fn sub(self, bytes: u64) -> Offset {
        if self.is_null() {
            return self;
        }
        self.0.checked_sub(bytes).map_or(Offset::NULL, Offset)
    }
}

impl Default for Offset {
    fn default() -> Self {
        Offset::NULL
    }
}

impl fmt::Debug for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Offset(null)")
        } else {
            write!(f, "Offset({:#x})", self.0)
        }
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "{:#x}", self.0)
        }
    }
}

/// Process-local view of an arena
///
/// All accessors are bounds checked and fail closed: an offset that is null,
/// out of range or misaligned for the requested type produces `None` instead
/// of touching memory outside the arena.
#[derive(Clone, Copy)]
pub struct Arena {
    base: NonNull<u8>,
    len: usize,
    release_pages: bool,
}

// The view only carries an address; synchronisation is the caller's job
// (see `lock::SegmentLock`).
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Create a view over `len` bytes starting at `base`
    ///
    /// # Safety
    /// - `base` must be aligned to [`ARENA_ALIGN`]
    /// - the memory must stay mapped, readable and writable for as long as
    ///   this view or any copy of it is used
    pub unsafe fn from_raw(base: NonNull<u8>, len: usize) -> Self {
        Self {
            base,
            len,
            release_pages: false,
        }
    }

    /// Allow [`Arena::release_pages`] to hand pages back to the kernel
    pub fn with_page_release(mut self, enabled: bool) -> Self {
        self.release_pages = enabled;
        self
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base address of this process's mapping
    pub fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Whether `size` bytes starting at `offset` lie inside the arena
    pub fn contains(&self, offset: Offset, size: u64) -> bool {
        !offset.is_null()
            && offset
                .get()
                .checked_add(size)
                .map_or(false, |end| end <= self.len as u64)
    }

    /// Convert an offset into a local address
    pub fn to_local(&self, offset: Offset) -> Option<NonNull<u8>> {
        if !self.contains(offset, 1) {
            return None;
        }
        // In range, so the add stays inside the mapping
        let ptr = unsafe { self.base.as_ptr().add(offset.get() as usize) };
        NonNull::new(ptr)
    }

    /// Convert a local address back into an offset
    pub fn to_offset(&self, ptr: *const u8) -> Offset {
        if ptr.is_null() {
            return Offset::NULL;
        }
        let addr = ptr as usize;
        let base = self.base_addr();
        if addr < base || addr - base >= self.len {
            return Offset::NULL;
        }
        Offset::new((addr - base) as u64)
    }

    fn typed_ptr<T>(&self, offset: Offset) -> Option<*mut T> {
        let size = mem::size_of::<T>() as u64;
        if !self.contains(offset, size) || offset.get() % mem::align_of::<T>() as u64 != 0 {
            return None;
        }
        Some(unsafe { self.base.as_ptr().add(offset.get() as usize) } as *mut T)
    }

    /// Read a plain-data value stored at `offset`
    ///
    /// `T` must be a `#[repr(C)]` type made of integers, for which any bit
    /// pattern is a valid value.
    pub(crate) fn read<T: Copy>(&self, offset: Offset) -> Option<T> {
        self.typed_ptr::<T>(offset)
            .map(|ptr| unsafe { std::ptr::read(ptr) })
    }

    /// Write a plain-data value at `offset`, returning false when out of range
    pub(crate) fn write<T: Copy>(&self, offset: Offset, value: T) -> bool {
        match self.typed_ptr::<T>(offset) {
            Some(ptr) => {
                unsafe { std::ptr::write(ptr, value) };
                true
            }
            None => false,
        }
    }

    /// Atomic counter stored at `offset`
    pub fn atomic_u64(&self, offset: Offset) -> Option<&AtomicU64> {
        self.typed_ptr::<AtomicU64>(offset)
            .map(|ptr| unsafe { &*ptr })
    }

    /// Borrow `len` bytes starting at `offset`
    pub fn bytes(&self, offset: Offset, len: usize) -> Option<&[u8]> {
        if !self.contains(offset, len as u64) {
            return None;
        }
        unsafe {
            Some(std::slice::from_raw_parts(
                self.base.as_ptr().add(offset.get() as usize),
                len,
            ))
        }
    }

    /// Copy `data` into the arena at `offset`
    pub fn copy_in(&self, offset: Offset, data: &[u8]) -> bool {
        if !self.contains(offset, data.len() as u64) {
            return false;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.base.as_ptr().add(offset.get() as usize),
                data.len(),
            );
        }
        true
    }

    /// Fill `len` bytes at `offset` with `byte`
    pub fn fill(&self, offset: Offset, len: usize, byte: u8) -> bool {
        if !self.contains(offset, len as u64) {
            return false;
        }
        unsafe {
            std::ptr::write_bytes(self.base.as_ptr().add(offset.get() as usize), byte, len);
        }
        true
    }

    /// Hand the whole pages inside `[offset, offset + len)` back to the kernel
    ///
    /// Only active for views created with page release enabled. The range is
    /// shrunk to page boundaries, so the bytes around it are never touched.
    pub fn release_pages(&self, offset: Offset, len: u64) {
        if !self.release_pages || !self.contains(offset, len) {
            return;
        }

        #[cfg(target_os = "linux")]
        {
            let page = page_size();
            let start = self.base_addr() as u64 + offset.get();
            let first = (start + page - 1) & !(page - 1);
            let end = (start + len) & !(page - 1);
            if end <= first {
                return;
            }

            let rc = unsafe {
                libc::madvise(
                    first as *mut libc::c_void,
                    (end - first) as usize,
                    libc::MADV_REMOVE,
                )
            };
            if rc != 0 {
                debug!(
                    error = %std::io::Error::last_os_error(),
                    "madvise of free arena pages failed"
                );
            } else {
                trace!(offset = %offset, bytes = end - first, "released free arena pages");
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

/// Heap-backed arena for single-process use and tests
pub struct ArenaBuffer {
    _memory: Vec<u64>,
    arena: Arena,
}

impl ArenaBuffer {
    /// Allocate a zeroed arena of at least `size` bytes
    pub fn new(size: usize) -> Self {
        let words = ((size + 7) / 8).max(1);
        let mut memory = vec![0u64; words];
        let base = NonNull::new(memory.as_mut_ptr().cast::<u8>())
            .unwrap_or_else(NonNull::dangling);
        // The Vec's heap buffer never moves while `_memory` is alive
        let arena = unsafe { Arena::from_raw(base, size) };
        Self {
            _memory: memory,
            arena,
        }
    }

    pub fn arena(&self) -> Arena {
        self.arena
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_null_and_arithmetic() {
        assert!(Offset::NULL.is_null());
        assert!(Offset::default().is_null());
        assert_eq!(Offset::new(16).add(8), Offset::new(24));
        assert_eq!(Offset::new(16).sub(8), Offset::new(8));
        assert!(Offset::new(4).sub(8).is_null());
        assert!(Offset::NULL.add(8).is_null());
        assert_eq!(Offset::new(0x20).to_string(), "0x20");
        assert_eq!(Offset::NULL.to_string(), "null");
    }

    #[test]
    fn test_offset_conversion() {
        let buffer = ArenaBuffer::new(4096);
        let arena = buffer.arena();

        let ptr = arena.to_local(Offset::new(100)).unwrap();
        assert_eq!(arena.to_offset(ptr.as_ptr()), Offset::new(100));
        assert_eq!(ptr.as_ptr() as usize - arena.base_addr(), 100);
    }

    #[test]
    fn test_out_of_range_fails_closed() {
        let buffer = ArenaBuffer::new(256);
        let arena = buffer.arena();

        assert!(arena.to_local(Offset::NULL).is_none());
        assert!(arena.to_local(Offset::new(256)).is_none());
        assert!(arena.read::<u64>(Offset::new(252)).is_none());
        assert!(arena.bytes(Offset::new(200), 100).is_none());
        assert!(!arena.copy_in(Offset::new(250), &[0u8; 16]));
        assert!(arena.to_offset(std::ptr::null()).is_null());

        let outside = (arena.base_addr() + 1024) as *const u8;
        assert!(arena.to_offset(outside).is_null());
    }

    #[test]
    fn test_typed_access() {
        let buffer = ArenaBuffer::new(256);
        let arena = buffer.arena();

        assert!(arena.write(Offset::new(8), 0xdead_beef_u64));
        assert_eq!(arena.read::<u64>(Offset::new(8)), Some(0xdead_beef));

        // Misaligned reads are refused
        assert!(arena.read::<u64>(Offset::new(9)).is_none());

        let counter = arena.atomic_u64(Offset::new(16)).unwrap();
        counter.fetch_add(3, std::sync::atomic::Ordering::Relaxed);
        assert_eq!(arena.read::<u64>(Offset::new(16)), Some(3));
    }

    #[test]
    fn test_byte_copies() {
        let buffer = ArenaBuffer::new(256);
        let arena = buffer.arena();

        assert!(arena.copy_in(Offset::new(32), b"hello"));
        assert_eq!(arena.bytes(Offset::new(32), 5).unwrap(), b"hello");

        assert!(arena.fill(Offset::new(32), 5, 0xAA));
        assert!(arena.bytes(Offset::new(32), 5).unwrap().iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_two_views_agree_on_offsets() {
        // Same memory seen through two views at different bases
        let buffer = ArenaBuffer::new(512);
        let whole = buffer.arena();
        let shifted_base = whole.to_local(Offset::new(64)).unwrap();
        let shifted = unsafe { Arena::from_raw(shifted_base, 448) };

        assert!(shifted.write(Offset::new(8), 42u64));
        assert_eq!(whole.read::<u64>(Offset::new(72)), Some(42));
    }
}
