use std::fmt::Debug;
use std::mem::{self, MaybeUninit};
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use std::slice;

use tracing::warn;

use crate::alloc::{ElementAlloc, SlabAlloc};
use crate::error::AllocError;

/// Where a [`SmallVec`] currently keeps its elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// the fixed buffer embedded in the vector itself
    Inline,
    /// a block obtained from the vector's allocator
    Heap,
}

/// A growable array keeping up to `N` elements inline before moving to heap storage from `A`.
///
/// Growth doubles the capacity once the vector is full. Erasing shrinks as soon as the length
/// drops to a quarter of the capacity: back into the inline buffer if at most `N / 2` elements
/// are left, otherwise to half the capacity. The gap between growing at full and shrinking at a
/// quarter keeps alternating push/erase from reallocating on every call.
///
/// Element types without drop glue are moved as one block and resized through
/// [`ElementAlloc::try_reallocate_raw`], everything else is moved one element at a time.
pub struct SmallVec<T, const N: usize = 2, A: ElementAlloc<T> = SlabAlloc<T>> {
    len: usize,
    /// N while inline
    cap: usize,
    heap: Option<NonNull<T>>,
    inline: [MaybeUninit<T>; N],
    alloc: A,
}

unsafe impl<T: Send, const N: usize, A: ElementAlloc<T> + Send> Send for SmallVec<T, N, A> {}
unsafe impl<T: Sync, const N: usize, A: ElementAlloc<T> + Sync> Sync for SmallVec<T, N, A> {}

impl<T, const N: usize, A: ElementAlloc<T>> SmallVec<T, N, A> {
    const BITWISE: bool = !mem::needs_drop::<T>();

    pub fn new() -> Self {
        Self::new_in(A::default())
    }

    pub fn new_in(alloc: A) -> Self {
        Self {
            len: 0,
            cap: N,
            heap: None,
            inline: [const { MaybeUninit::uninit() }; N],
            alloc,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn storage(&self) -> Storage {
        match self.heap {
            Some(_) => Storage::Heap,
            None => Storage::Inline,
        }
    }

    pub fn is_inline(&self) -> bool {
        self.heap.is_none()
    }

    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    fn as_ptr(&self) -> *const T {
        match self.heap {
            Some(block) => block.as_ptr(),
            None => self.inline.as_ptr().cast(),
        }
    }

    fn as_mut_ptr(&mut self) -> *mut T {
        match self.heap {
            Some(block) => block.as_ptr(),
            None => self.inline.as_mut_ptr().cast(),
        }
    }

    pub fn as_slice(&self) -> &[T] {
        unsafe { slice::from_raw_parts(self.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        unsafe { slice::from_raw_parts_mut(self.as_mut_ptr(), self.len) }
    }

    pub fn front(&self) -> Option<&T> {
        self.as_slice().first()
    }

    pub fn back(&self) -> Option<&T> {
        self.as_slice().last()
    }

    pub fn front_mut(&mut self) -> Option<&mut T> {
        self.as_mut_slice().first_mut()
    }

    pub fn back_mut(&mut self) -> Option<&mut T> {
        self.as_mut_slice().last_mut()
    }

    /// Appends `value`, growing first if the vector is full. On failure the vector is left as
    /// it was and `value` is dropped.
    pub fn try_push(&mut self, value: T) -> Result<(), AllocError> {
        if self.len == self.cap {
            self.grow()?;
        }
        unsafe { self.as_mut_ptr().add(self.len).write(value) };
        self.len += 1;
        Ok(())
    }

    pub fn push(&mut self, value: T) {
        if let Err(err) = self.try_push(value) {
            err.fatal()
        }
    }

    /// Builds the new last element in place once room for it exists.
    pub fn emplace_back(&mut self, make: impl FnOnce() -> T) -> &mut T {
        if self.len == self.cap {
            if let Err(err) = self.grow() {
                err.fatal()
            }
        }
        unsafe {
            let slot = self.as_mut_ptr().add(self.len);
            slot.write(make());
            self.len += 1;
            &mut *slot
        }
    }

    /// Inserts `value` at `pos`, shifting everything after it one slot towards the end.
    ///
    /// # Panics
    ///
    /// Panics if `pos > len`.
    pub fn try_insert(&mut self, pos: usize, value: T) -> Result<(), AllocError> {
        let len = self.len;
        if pos > len {
            panic!("insertion index (is {pos}) should be <= len (is {len})");
        }

        if len == self.cap {
            self.grow()?;
        }

        unsafe {
            let base = self.as_mut_ptr();
            if Self::BITWISE {
                ptr::copy(base.add(pos), base.add(pos + 1), len - pos);
            } else {
                // back to front, so every slot is read before it is overwritten
                for i in (pos..len).rev() {
                    base.add(i + 1).write(base.add(i).read());
                }
            }
            base.add(pos).write(value);
        }
        self.len += 1;
        Ok(())
    }

    /// # Panics
    ///
    /// Panics if `pos > len`.
    pub fn insert(&mut self, pos: usize, value: T) {
        if let Err(err) = self.try_insert(pos, value) {
            err.fatal()
        }
    }

    /// Takes the element at `pos` out, closing the gap and shrinking if the vector became
    /// sparse enough.
    ///
    /// # Panics
    ///
    /// Panics if `pos >= len`.
    pub fn remove(&mut self, pos: usize) -> T {
        let len = self.len;
        if pos >= len {
            panic!("removal index (is {pos}) should be < len (is {len})");
        }

        let value;
        unsafe {
            let base = self.as_mut_ptr();
            value = base.add(pos).read();
            if Self::BITWISE {
                ptr::copy(base.add(pos + 1), base.add(pos), len - pos - 1);
            } else {
                // front to back, so every slot is read before it is overwritten
                for i in pos + 1..len {
                    base.add(i - 1).write(base.add(i).read());
                }
            }
        }
        self.len -= 1;
        self.shrink();
        value
    }

    /// Destroys the element at `pos`. Same shifting and shrinking as [`SmallVec::remove`].
    ///
    /// # Panics
    ///
    /// Panics if `pos >= len`.
    pub fn erase(&mut self, pos: usize) {
        drop(self.remove(pos));
    }

    pub fn pop(&mut self) -> Option<T> {
        match self.len {
            0 => None,
            len => Some(self.remove(len - 1)),
        }
    }

    /// Drops every element and falls back to the inline buffer.
    pub fn clear(&mut self) {
        let len = mem::replace(&mut self.len, 0);
        unsafe { ptr::drop_in_place(ptr::slice_from_raw_parts_mut(self.as_mut_ptr(), len)) };
        self.release();
    }

    /// Moves the elements into a `Vec` from the global allocator.
    pub fn into_vec(mut self) -> Vec<T> {
        let len = mem::replace(&mut self.len, 0);
        let mut out = Vec::with_capacity(len);
        unsafe {
            ptr::copy_nonoverlapping(self.as_ptr(), out.as_mut_ptr(), len);
            out.set_len(len);
        }
        out
    }

    fn grow(&mut self) -> Result<(), AllocError> {
        let new_cap = self
            .cap
            .checked_mul(2)
            .ok_or(AllocError::CapacityOverflow)?
            .max(1);
        self.move_to_heap(new_cap)
    }

    fn shrink(&mut self) {
        let Some(block) = self.heap else {
            return;
        };

        let half = self.cap / 2;
        if self.len > half / 2 {
            return;
        }

        if self.len <= N / 2 {
            unsafe {
                let inline = self.inline.as_mut_ptr().cast::<T>();
                Self::move_elements(block.as_ptr(), inline, self.len);
                self.alloc.deallocate(block, self.cap);
            }
            self.heap = None;
            self.cap = N;
        } else if let Err(err) = self.move_to_heap(half) {
            warn!(%err, capacity = self.cap, len = self.len, "keeping oversized buffer after failed shrink");
        }
    }

    /// Moves the live elements into a heap block of `new_cap` slots. The new block is fully
    /// populated before the old one is released, a failed allocation changes nothing.
    fn move_to_heap(&mut self, new_cap: usize) -> Result<(), AllocError> {
        debug_assert!(new_cap >= self.len);

        let block = match self.heap {
            Some(old) if Self::BITWISE => unsafe {
                self.alloc.try_reallocate_raw(old, self.cap, new_cap)?
            },
            old => {
                let block = self.alloc.try_allocate(new_cap)?;
                unsafe {
                    Self::move_elements(self.as_ptr(), block.as_ptr(), self.len);
                    if let Some(old) = old {
                        self.alloc.deallocate(old, self.cap);
                    }
                }
                block
            }
        };

        self.heap = Some(block);
        self.cap = new_cap;
        Ok(())
    }

    /// # Safety
    ///
    /// `src` must hold `len` live elements, `dst` must have room for them and the two ranges
    /// must not overlap. Afterwards the elements belong to `dst`.
    unsafe fn move_elements(src: *const T, dst: *mut T, len: usize) {
        unsafe {
            if Self::BITWISE {
                ptr::copy_nonoverlapping(src, dst, len);
            } else {
                for i in 0..len {
                    dst.add(i).write(src.add(i).read());
                }
            }
        }
    }

    /// Gives a heap block back to the allocator. Elements must already be gone.
    fn release(&mut self) {
        if let Some(block) = self.heap.take() {
            unsafe { self.alloc.deallocate(block, self.cap) };
            self.cap = N;
        }
    }
}

impl<T, const N: usize, A: ElementAlloc<T>> Drop for SmallVec<T, N, A> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<T, const N: usize, A: ElementAlloc<T>> Default for SmallVec<T, N, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize, A: ElementAlloc<T>> Deref for SmallVec<T, N, A> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T, const N: usize, A: ElementAlloc<T>> DerefMut for SmallVec<T, N, A> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

impl<T: Clone, const N: usize, A: ElementAlloc<T>> Clone for SmallVec<T, N, A> {
    fn clone(&self) -> Self {
        let mut out = Self::new_in(self.alloc.clone());
        out.extend(self.iter().cloned());
        out
    }
}

impl<T: Debug, const N: usize, A: ElementAlloc<T>> Debug for SmallVec<T, N, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T: PartialEq, const N: usize, A: ElementAlloc<T>, const M: usize, B: ElementAlloc<T>>
    PartialEq<SmallVec<T, M, B>> for SmallVec<T, N, A>
{
    fn eq(&self, other: &SmallVec<T, M, B>) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl<T: Eq, const N: usize, A: ElementAlloc<T>> Eq for SmallVec<T, N, A> {}

impl<T: PartialEq, const N: usize, A: ElementAlloc<T>> PartialEq<[T]> for SmallVec<T, N, A> {
    fn eq(&self, other: &[T]) -> bool {
        self.as_slice() == other
    }
}

impl<T, const N: usize, A: ElementAlloc<T>> Extend<T> for SmallVec<T, N, A> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for value in iter {
            self.push(value);
        }
    }
}

impl<T, const N: usize, A: ElementAlloc<T>> FromIterator<T> for SmallVec<T, N, A> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut out = Self::new();
        out.extend(iter);
        out
    }
}

impl<'a, T, const N: usize, A: ElementAlloc<T>> IntoIterator for &'a SmallVec<T, N, A> {
    type Item = &'a T;
    type IntoIter = slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, T, const N: usize, A: ElementAlloc<T>> IntoIterator for &'a mut SmallVec<T, N, A> {
    type Item = &'a mut T;
    type IntoIter = slice::IterMut<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter_mut()
    }
}
