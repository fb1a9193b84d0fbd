//! Cache structures stored in the segment

pub mod entry;
pub mod free_queue;
pub mod hash_index;
pub mod local_refs;

pub use entry::{entry_size, EntryHandle, EntryInfo, EntryState, EntryType, ENTRY_HEADER_SIZE};
pub use free_queue::FreeQueue;
pub use hash_index::{hash_key, HashIndex, Probe, Slot};
pub use local_refs::{LocalId, LocalRefTable};
