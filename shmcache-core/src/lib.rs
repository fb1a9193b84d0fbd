//! shmcache core - shared memory blob cache
//!
//! This crate provides a cache of named byte blobs that several processes
//! share without a server:
//! - Named shared memory segments and an offset-based arena model
//! - A first-fit block allocator with coalescing
//! - A double-hashed index with tombstones
//! - Refcounted entries with deferred, bounded reclamation
//! - A process-shared reader/writer lock

pub mod arena;
pub mod block;
pub mod cache;
pub mod config;
pub mod core;
pub mod lock;
pub mod logging;
pub mod memory;

pub use crate::core::*;
pub use arena::*;
pub use block::*;
pub use cache::*;
pub use config::*;
pub use lock::*;
pub use logging::*;
pub use memory::*;
