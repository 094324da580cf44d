//! A thread-local slab allocator with power of two size classes and an inline-first small
//! vector drawing its heap storage from it.
//!
//! 0 locks, every thread owns its own pool, nothing allocated from one thread's pool may be
//! freed on another

/// Typed element allocators on top of the pool
pub mod alloc;
pub mod error;
mod heap;
/// Size-class slab pool and its per-thread instance
pub mod pool;
/// Inline-first small vector
pub mod vec;

pub use alloc::{ElementAlloc, HeapAlloc, SlabAlloc};
pub use error::AllocError;
pub use pool::{PoolStats, SlabPool, ThreadPool, thread_pool_stats, with_thread_pool};
pub use vec::{SmallVec, Storage};
