use std::alloc::Layout;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::error::AllocError;
use crate::heap;
use crate::pool::{ThreadPool, with_thread_pool};

/// Storage for contiguous runs of `T`, handed out and taken back in element counts.
///
/// # Safety
///
/// Implementations must return blocks valid for reads and writes of `n` elements of `T`,
/// aligned for `T`, and must accept every block they returned in [`ElementAlloc::deallocate`]
/// and [`ElementAlloc::try_reallocate_raw`] with the same count.
pub unsafe trait ElementAlloc<T>: Default + Clone {
    /// The same allocation policy for another element type.
    type Rebind<U>: ElementAlloc<U>;

    fn rebind<U>(&self) -> Self::Rebind<U>;

    fn try_allocate(&self, n: usize) -> Result<NonNull<T>, AllocError>;

    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator for exactly `n` elements, and must not
    /// be used afterwards. Elements still stored there are not dropped.
    unsafe fn deallocate(&self, ptr: NonNull<T>, n: usize);

    /// Moves the block to room for `new_n` elements with a raw byte copy of the first
    /// `min(old_n, new_n)` slots. On failure the old block is left untouched.
    ///
    /// # Safety
    ///
    /// Same contract as [`ElementAlloc::deallocate`] for `ptr` and `old_n`. Slots past `new_n`
    /// are discarded without being dropped.
    unsafe fn try_reallocate_raw(
        &self,
        ptr: NonNull<T>,
        old_n: usize,
        new_n: usize,
    ) -> Result<NonNull<T>, AllocError>;

    fn allocate(&self, n: usize) -> NonNull<T> {
        self.try_allocate(n).unwrap_or_else(|err| err.fatal())
    }

    /// Allocates room for one `T` and moves `value` into it.
    fn try_construct(&self, value: T) -> Result<NonNull<T>, AllocError> {
        let ptr = self.try_allocate(1)?;
        unsafe { ptr.as_ptr().write(value) };
        Ok(ptr)
    }

    fn construct(&self, value: T) -> NonNull<T> {
        self.try_construct(value).unwrap_or_else(|err| err.fatal())
    }

    /// Drops the value behind `ptr` and gives its storage back.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`ElementAlloc::construct`] on this allocator and still hold a
    /// live value.
    unsafe fn destroy(&self, ptr: NonNull<T>) {
        unsafe {
            ptr.as_ptr().drop_in_place();
            self.deallocate(ptr, 1);
        }
    }

    /// Resizing is only offered for `Copy` elements, anything else has to be moved over
    /// element by element.
    ///
    /// # Safety
    ///
    /// See [`ElementAlloc::try_reallocate_raw`].
    unsafe fn try_reallocate(
        &self,
        ptr: NonNull<T>,
        old_n: usize,
        new_n: usize,
    ) -> Result<NonNull<T>, AllocError>
    where
        T: Copy,
    {
        unsafe { self.try_reallocate_raw(ptr, old_n, new_n) }
    }

    /// # Safety
    ///
    /// See [`ElementAlloc::try_reallocate_raw`].
    unsafe fn reallocate(&self, ptr: NonNull<T>, old_n: usize, new_n: usize) -> NonNull<T>
    where
        T: Copy,
    {
        unsafe { self.try_reallocate_raw(ptr, old_n, new_n) }.unwrap_or_else(|err| err.fatal())
    }
}

#[inline(always)]
fn bytes_for<T>(n: usize) -> Result<usize, AllocError> {
    n.checked_mul(size_of::<T>())
        .filter(|&bytes| bytes <= isize::MAX as usize)
        .ok_or(AllocError::CapacityOverflow)
}

/// Element allocator backed by the calling thread's [`ThreadPool`].
///
/// Carries no state, every instance on a thread talks to the same pool. Neither `Send` nor
/// `Sync`: a block has to be returned on the thread whose pool handed it out.
pub struct SlabAlloc<T> {
    _marker: PhantomData<*const T>,
}

impl<T> SlabAlloc<T> {
    const ALIGN_FITS: () = assert!(
        align_of::<T>() <= ThreadPool::LARGE_ALIGN,
        "element alignment exceeds what the slab pool guarantees"
    );

    pub const fn new() -> Self {
        let () = Self::ALIGN_FITS;
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for SlabAlloc<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SlabAlloc<T> {}

impl<T> Default for SlabAlloc<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Debug for SlabAlloc<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SlabAlloc<{}>", std::any::type_name::<T>())
    }
}

unsafe impl<T> ElementAlloc<T> for SlabAlloc<T> {
    type Rebind<U> = SlabAlloc<U>;

    fn rebind<U>(&self) -> SlabAlloc<U> {
        SlabAlloc::new()
    }

    fn try_allocate(&self, n: usize) -> Result<NonNull<T>, AllocError> {
        let bytes = bytes_for::<T>(n)?;
        if bytes == 0 {
            return Ok(NonNull::dangling());
        }
        // size classes are powers of two carved from page aligned memory, so every chunk is
        // aligned to its own width and thereby to T
        let ptr = with_thread_pool(|pool| pool.try_allocate(bytes))??;
        Ok(ptr.cast())
    }

    unsafe fn deallocate(&self, ptr: NonNull<T>, n: usize) {
        let bytes = n * size_of::<T>();
        if bytes == 0 {
            return;
        }
        // once the pool is gone its pages are gone too or were leaked on purpose, either way
        // there is nothing left to return the chunk to
        let _ = with_thread_pool(|pool| unsafe { pool.deallocate(ptr.cast(), bytes) });
    }

    unsafe fn try_reallocate_raw(
        &self,
        ptr: NonNull<T>,
        old_n: usize,
        new_n: usize,
    ) -> Result<NonNull<T>, AllocError> {
        let old_bytes = old_n * size_of::<T>();
        let new_bytes = bytes_for::<T>(new_n)?;
        if old_bytes == 0 {
            return self.try_allocate(new_n);
        }
        if new_bytes == 0 {
            unsafe { self.deallocate(ptr, old_n) };
            return Ok(NonNull::dangling());
        }
        let ptr = with_thread_pool(|pool| unsafe {
            pool.try_reallocate(ptr.cast(), old_bytes, new_bytes)
        })??;
        Ok(ptr.cast())
    }
}

/// Element allocator going straight to the general heap with `T`'s own alignment.
pub struct HeapAlloc<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> HeapAlloc<T> {
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }

    fn layout(n: usize) -> Result<Layout, AllocError> {
        Ok(Layout::array::<T>(n)?)
    }
}

impl<T> Clone for HeapAlloc<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for HeapAlloc<T> {}

impl<T> Default for HeapAlloc<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Debug for HeapAlloc<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HeapAlloc<{}>", std::any::type_name::<T>())
    }
}

unsafe impl<T> ElementAlloc<T> for HeapAlloc<T> {
    type Rebind<U> = HeapAlloc<U>;

    fn rebind<U>(&self) -> HeapAlloc<U> {
        HeapAlloc::new()
    }

    fn try_allocate(&self, n: usize) -> Result<NonNull<T>, AllocError> {
        let layout = Self::layout(n)?;
        if layout.size() == 0 {
            return Ok(NonNull::dangling());
        }
        Ok(heap::allocate(layout)?.cast())
    }

    unsafe fn deallocate(&self, ptr: NonNull<T>, n: usize) {
        let size = n * size_of::<T>();
        if size == 0 {
            return;
        }
        unsafe {
            heap::deallocate(
                ptr.cast(),
                Layout::from_size_align_unchecked(size, align_of::<T>()),
            )
        }
    }

    unsafe fn try_reallocate_raw(
        &self,
        ptr: NonNull<T>,
        old_n: usize,
        new_n: usize,
    ) -> Result<NonNull<T>, AllocError> {
        let old_size = old_n * size_of::<T>();
        let new_size = Self::layout(new_n)?.size();
        if old_size == 0 {
            return self.try_allocate(new_n);
        }
        if new_size == 0 {
            unsafe { self.deallocate(ptr, old_n) };
            return Ok(NonNull::dangling());
        }
        let old = unsafe { Layout::from_size_align_unchecked(old_size, align_of::<T>()) };
        Ok(unsafe { heap::reallocate(ptr.cast(), old, new_size) }?.cast())
    }
}
