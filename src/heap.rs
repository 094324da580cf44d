//! General heap layer: pages, oversized requests and the plain element allocator all end up here.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::error::AllocError;

#[inline(always)]
pub(crate) fn allocate(layout: Layout) -> Result<NonNull<u8>, AllocError> {
    debug_assert!(layout.size() > 0, "zero-size heap allocation");
    let ptr = unsafe { alloc::alloc(layout) };
    NonNull::new(ptr).ok_or(AllocError::out_of_memory(layout))
}

/// # Safety
///
/// `ptr` must have been returned by [`allocate`] or [`reallocate`] with exactly `layout`.
#[inline(always)]
pub(crate) unsafe fn deallocate(ptr: NonNull<u8>, layout: Layout) {
    unsafe { alloc::dealloc(ptr.as_ptr(), layout) }
}

/// Resizes a block in place or by moving it. On failure the old block is left untouched.
///
/// # Safety
///
/// Same contract as [`deallocate`]; `new_size` must be non-zero.
pub(crate) unsafe fn reallocate(
    ptr: NonNull<u8>,
    layout: Layout,
    new_size: usize,
) -> Result<NonNull<u8>, AllocError> {
    debug_assert!(new_size > 0, "zero-size heap reallocation");
    let new_layout = Layout::from_size_align(new_size, layout.align())?;
    let new_ptr = unsafe { alloc::realloc(ptr.as_ptr(), layout, new_size) };
    NonNull::new(new_ptr).ok_or(AllocError::out_of_memory(new_layout))
}
