use std::alloc::{Layout, LayoutError, handle_alloc_error};

use thiserror::Error;

/// Failure modes of the pool, the element allocators and the containers built on them.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The general heap could not satisfy the request.
    #[error("out of memory: failed to allocate {size} bytes aligned to {align}")]
    OutOfMemory { size: usize, align: usize },

    /// An element count or capacity does not fit into a valid layout.
    #[error("capacity overflow")]
    CapacityOverflow,

    /// The calling thread's pool has already been torn down.
    #[error("thread-local slab pool is no longer available on this thread")]
    PoolUnavailable,
}

impl AllocError {
    pub(crate) fn out_of_memory(layout: Layout) -> Self {
        Self::OutOfMemory {
            size: layout.size(),
            align: layout.align(),
        }
    }

    /// Diverges the way the standard collections do when an allocation fails.
    pub fn fatal(self) -> ! {
        if let Self::OutOfMemory { size, align } = self {
            if let Ok(layout) = Layout::from_size_align(size, align) {
                handle_alloc_error(layout)
            }
        }
        panic!("{self}")
    }
}

impl From<LayoutError> for AllocError {
    fn from(_: LayoutError) -> Self {
        Self::CapacityOverflow
    }
}
