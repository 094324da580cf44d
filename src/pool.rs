use std::alloc::Layout;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::ptr::{self, NonNull};

use tracing::{debug, warn};

use crate::error::AllocError;
use crate::heap;

/// Link stored in the first word of every free chunk.
#[derive(Debug)]
struct Chunk {
    next: Option<NonNull<Chunk>>,
}

#[derive(Debug)]
struct Page {
    base: NonNull<u8>,
    class: usize,
}

/// Counters describing what a pool currently holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// pages ever requested from the general heap
    pub pages_allocated: usize,
    /// pages handed back to the general heap
    pub pages_released: usize,
    /// pages currently owned by the pool
    pub pages_live: usize,
    /// chunks checked out to callers
    pub chunks_in_use: usize,
    /// oversized blocks checked out to callers
    pub large_in_use: usize,
}

/// Segregated-size slab allocator.
///
/// Requests up to [`SlabPool::MAX_SIZE`] bytes are rounded up to one of `CLASSES` power of two
/// size classes starting at `MIN_SIZE`. Each class keeps a singly linked free list threaded
/// through the free chunks themselves, so allocated chunks carry no header. An empty class
/// carves a fresh `PAGE_SIZE` aligned page: the first chunk goes to the caller, the rest onto
/// the free list. Anything larger goes straight to the general heap, aligned to `MIN_SIZE`.
///
/// Not thread safe, meant to be used through the per-thread instance behind
/// [`with_thread_pool`].
pub struct SlabPool<
    const PAGE_SIZE: usize = 1024,
    const MIN_SIZE: usize = 16,
    const CLASSES: usize = 6,
> {
    free: [Option<NonNull<Chunk>>; CLASSES],
    pages: Vec<Page>,
    stats: PoolStats,
}

impl<const PAGE_SIZE: usize, const MIN_SIZE: usize, const CLASSES: usize> Display
    for SlabPool<PAGE_SIZE, MIN_SIZE, CLASSES>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SlabPool {{ page: {PAGE_SIZE}, classes: {MIN_SIZE}..={}, {:?} }}",
            Self::MAX_SIZE,
            self.stats()
        )
    }
}

impl<const PAGE_SIZE: usize, const MIN_SIZE: usize, const CLASSES: usize>
    SlabPool<PAGE_SIZE, MIN_SIZE, CLASSES>
{
    /// Largest request served from a size class.
    pub const MAX_SIZE: usize = MIN_SIZE << (CLASSES - 1);

    /// Alignment of oversized blocks taken from the general heap.
    pub const LARGE_ALIGN: usize = MIN_SIZE;

    const GEOMETRY: () = {
        assert!(PAGE_SIZE.is_power_of_two(), "page size must be a power of two");
        assert!(MIN_SIZE.is_power_of_two(), "minimum chunk size must be a power of two");
        assert!(
            MIN_SIZE >= size_of::<Chunk>(),
            "minimum chunk size must hold a free-list link"
        );
        assert!(CLASSES > 0, "at least one size class is required");
        assert!(
            (MIN_SIZE << (CLASSES - 1)) <= PAGE_SIZE,
            "largest size class must fit into a page"
        );
    };

    pub fn new() -> Self {
        let () = Self::GEOMETRY;
        Self {
            free: [None; CLASSES],
            pages: Vec::new(),
            stats: PoolStats::default(),
        }
    }

    /// Size class serving `size` bytes, `None` if the request takes the general heap path.
    pub const fn class_index(size: usize) -> Option<usize> {
        if size > Self::MAX_SIZE {
            return None;
        }
        if size <= MIN_SIZE {
            return Some(0);
        }
        Some((size.next_power_of_two().trailing_zeros() - MIN_SIZE.trailing_zeros()) as usize)
    }

    /// Width of the chunk that would serve `size` bytes.
    pub const fn chunk_size_for(size: usize) -> Option<usize> {
        match Self::class_index(size) {
            Some(class) => Some(Self::chunk_size(class)),
            None => None,
        }
    }

    #[inline(always)]
    const fn chunk_size(class: usize) -> usize {
        MIN_SIZE << class
    }

    #[inline(always)]
    const fn chunks_per_page(class: usize) -> usize {
        PAGE_SIZE / Self::chunk_size(class)
    }

    #[inline(always)]
    fn page_base(ptr: NonNull<u8>) -> usize {
        ptr.as_ptr() as usize & !(PAGE_SIZE - 1)
    }

    fn page_layout() -> Layout {
        // PAGE_SIZE is a non-zero power of two, checked in GEOMETRY
        unsafe { Layout::from_size_align_unchecked(PAGE_SIZE, PAGE_SIZE) }
    }

    fn large_layout(size: usize) -> Result<Layout, AllocError> {
        Ok(Layout::from_size_align(size, Self::LARGE_ALIGN)?)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pages_live: self.pages.len(),
            ..self.stats
        }
    }

    /// Hands out at least `size` bytes. Never returns null: failure of the general heap is
    /// reported as [`AllocError::OutOfMemory`].
    pub fn try_allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        #[cfg(feature = "trace")]
        tracing::trace!(size, "[SlabPool] allocate");

        let Some(class) = Self::class_index(size) else {
            let ptr = heap::allocate(Self::large_layout(size)?)?;
            self.stats.large_in_use += 1;
            return Ok(ptr);
        };

        let ptr = match self.free[class] {
            Some(chunk) => {
                self.free[class] = unsafe { chunk.as_ref().next };
                chunk.cast()
            }
            None => self.carve(class)?,
        };
        self.stats.chunks_in_use += 1;
        Ok(ptr)
    }

    pub fn allocate(&mut self, size: usize) -> NonNull<u8> {
        self.try_allocate(size).unwrap_or_else(|err| err.fatal())
    }

    /// Requests a fresh page for `class`, links every chunk but the first into the free list
    /// in address order and returns the first one, which sits at the page base.
    fn carve(&mut self, class: usize) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(self.free[class].is_none(), "carving a class with free chunks");

        let page = heap::allocate(Self::page_layout())?;
        let chunk_size = Self::chunk_size(class);

        let mut head = None;
        for i in (1..Self::chunks_per_page(class)).rev() {
            unsafe {
                let chunk = page.as_ptr().add(i * chunk_size).cast::<Chunk>();
                chunk.write(Chunk { next: head });
                head = Some(NonNull::new_unchecked(chunk));
            }
        }
        self.free[class] = head;

        self.pages.push(Page { base: page, class });
        self.stats.pages_allocated += 1;
        debug!(
            class,
            chunk_size,
            page = ?page,
            "carved page into {} chunks",
            Self::chunks_per_page(class)
        );
        Ok(page)
    }

    /// Returns `ptr` to the pool.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this pool with the same `size` and must not be used afterwards.
    /// Neither is checked outside of debug builds.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        #[cfg(feature = "trace")]
        tracing::trace!(size, ptr = ?ptr, "[SlabPool] deallocate");

        let Some(class) = Self::class_index(size) else {
            self.stats.large_in_use -= 1;
            // the layout was valid when the block was handed out
            unsafe {
                heap::deallocate(
                    ptr,
                    Layout::from_size_align_unchecked(size, Self::LARGE_ALIGN),
                )
            };
            return;
        };

        debug_assert!(
            self.owns(ptr, class),
            "chunk {ptr:?} was not carved by this pool for size class {class}"
        );

        let chunk = ptr.cast::<Chunk>();
        unsafe {
            chunk.as_ptr().write(Chunk {
                next: self.free[class],
            })
        };
        self.free[class] = Some(chunk);
        self.stats.chunks_in_use -= 1;
    }

    fn owns(&self, ptr: NonNull<u8>, class: usize) -> bool {
        let base = Self::page_base(ptr);
        self.pages
            .iter()
            .any(|page| page.base.as_ptr() as usize == base && page.class == class)
    }

    /// Resizes a block from `old_size` to `new_size` bytes, copying `min(old_size, new_size)`
    /// bytes when it has to move. Requests that stay within one size class return `ptr`
    /// unchanged. On failure the old block is still owned by the caller.
    ///
    /// # Safety
    ///
    /// Same contract as [`SlabPool::deallocate`] for `ptr` and `old_size`.
    pub unsafe fn try_reallocate(
        &mut self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let keep = old_size.min(new_size);
        match (Self::class_index(old_size), Self::class_index(new_size)) {
            (None, None) => unsafe {
                let layout = Layout::from_size_align_unchecked(old_size, Self::LARGE_ALIGN);
                heap::reallocate(ptr, layout, new_size)
            },
            (Some(old), Some(new)) if old == new => Ok(ptr),
            (Some(_), None) => {
                let new_ptr = heap::allocate(Self::large_layout(new_size)?)?;
                self.stats.large_in_use += 1;
                unsafe {
                    ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), keep);
                    self.deallocate(ptr, old_size);
                }
                Ok(new_ptr)
            }
            _ => {
                let new_ptr = self.try_allocate(new_size)?;
                unsafe {
                    ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), keep);
                    self.deallocate(ptr, old_size);
                }
                Ok(new_ptr)
            }
        }
    }

    /// # Safety
    ///
    /// See [`SlabPool::try_reallocate`].
    pub unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> NonNull<u8> {
        unsafe { self.try_reallocate(ptr, old_size, new_size) }.unwrap_or_else(|err| err.fatal())
    }

    /// Releases every page whose chunks are all sitting on the free list and returns how many
    /// were released. Pages with at least one chunk checked out stay untouched.
    pub fn trim(&mut self) -> usize {
        let mut free_per_page: HashMap<usize, usize> = HashMap::new();
        for head in &self.free {
            let mut cur = *head;
            while let Some(chunk) = cur {
                *free_per_page.entry(Self::page_base(chunk.cast())).or_default() += 1;
                cur = unsafe { chunk.as_ref().next };
            }
        }

        let (empty, busy): (Vec<Page>, Vec<Page>) =
            self.pages.drain(..).partition(|page| {
                let base = page.base.as_ptr() as usize;
                free_per_page.get(&base).copied() == Some(Self::chunks_per_page(page.class))
            });
        self.pages = busy;

        if empty.is_empty() {
            return 0;
        }

        let doomed: HashSet<usize> = empty
            .iter()
            .map(|page| page.base.as_ptr() as usize)
            .collect();
        self.unlink(&doomed);

        for page in &empty {
            unsafe { heap::deallocate(page.base, Self::page_layout()) };
            debug!(class = page.class, page = ?page.base, "released page");
        }
        self.stats.pages_released += empty.len();
        empty.len()
    }

    /// Drops every free chunk located in one of the `doomed` pages from the free lists,
    /// keeping the order of the survivors.
    fn unlink(&mut self, doomed: &HashSet<usize>) {
        for head in self.free.iter_mut() {
            let mut kept: Option<NonNull<Chunk>> = None;
            let mut tail: Option<NonNull<Chunk>> = None;
            let mut cur = *head;

            while let Some(chunk) = cur {
                cur = unsafe { chunk.as_ref().next };
                if doomed.contains(&Self::page_base(chunk.cast())) {
                    continue;
                }
                unsafe { (*chunk.as_ptr()).next = None };
                match tail {
                    Some(t) => unsafe { (*t.as_ptr()).next = Some(chunk) },
                    None => kept = Some(chunk),
                }
                tail = Some(chunk);
            }

            *head = kept;
        }
    }
}

impl<const PAGE_SIZE: usize, const MIN_SIZE: usize, const CLASSES: usize> Default
    for SlabPool<PAGE_SIZE, MIN_SIZE, CLASSES>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<const PAGE_SIZE: usize, const MIN_SIZE: usize, const CLASSES: usize> Drop
    for SlabPool<PAGE_SIZE, MIN_SIZE, CLASSES>
{
    fn drop(&mut self) {
        let released = self.trim();

        // pages with chunks still checked out are leaked, never freed under a caller
        if !self.pages.is_empty() {
            warn!(
                pages = self.pages.len(),
                chunks = self.stats.chunks_in_use,
                "leaking pages with chunks still checked out at pool teardown"
            );
        }
        if self.stats.large_in_use > 0 {
            warn!(
                blocks = self.stats.large_in_use,
                "oversized blocks still checked out at pool teardown"
            );
        }
        debug!(released, "slab pool torn down");
    }
}

/// Geometry of the per-thread pool: 1024 byte pages, six classes from 16 to 512 bytes.
pub type ThreadPool = SlabPool;

thread_local! {
    static THREAD_POOL: RefCell<ThreadPool> = RefCell::new(ThreadPool::new());
}

/// Runs `f` against the calling thread's pool, creating it on first use.
///
/// Fails with [`AllocError::PoolUnavailable`] once the pool's thread-local destructor has run.
pub fn with_thread_pool<R>(f: impl FnOnce(&mut ThreadPool) -> R) -> Result<R, AllocError> {
    THREAD_POOL
        .try_with(|pool| f(&mut pool.borrow_mut()))
        .map_err(|_| AllocError::PoolUnavailable)
}

/// Snapshot of the calling thread's pool counters.
pub fn thread_pool_stats() -> Option<PoolStats> {
    with_thread_pool(|pool| pool.stats()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    type Pool = SlabPool;

    #[test]
    fn class_index_rounds_up() {
        assert_eq!(Pool::class_index(0), Some(0));
        assert_eq!(Pool::class_index(1), Some(0));
        assert_eq!(Pool::class_index(8), Some(0));
        assert_eq!(Pool::class_index(16), Some(0));
        assert_eq!(Pool::class_index(17), Some(1));
        assert_eq!(Pool::class_index(32), Some(1));
        assert_eq!(Pool::class_index(33), Some(2));
        assert_eq!(Pool::class_index(100), Some(3));
        assert_eq!(Pool::class_index(512), Some(5));
        assert_eq!(Pool::class_index(513), None);
        assert_eq!(Pool::MAX_SIZE, 512);
    }

    #[test]
    fn chunk_size_is_smallest_boundary() {
        let boundaries: Vec<usize> = (0..6).map(|c| 16 << c).collect();
        let mut last = 0;
        for size in 0..=Pool::MAX_SIZE {
            let chunk = Pool::chunk_size_for(size).unwrap();
            assert!(chunk >= size);
            assert!(chunk >= last, "mapping must be monotonic");
            let smallest = *boundaries.iter().find(|&&b| b >= size).unwrap();
            assert_eq!(chunk, smallest, "size {size}");
            last = chunk;
        }
        assert_eq!(Pool::chunk_size_for(Pool::MAX_SIZE + 1), None);
    }

    #[test]
    fn custom_geometry() {
        type Big = SlabPool<4096, 32, 4>;
        assert_eq!(Big::MAX_SIZE, 256);
        assert_eq!(Big::class_index(33), Some(1));
        assert_eq!(Big::chunk_size_for(200), Some(256));

        let mut pool = Big::new();
        let ptr = pool.allocate(40);
        assert_eq!(ptr.as_ptr() as usize % 4096, 0);
        unsafe { pool.deallocate(ptr, 40) };
        assert_eq!(pool.trim(), 1);
    }

    #[test]
    fn first_chunk_sits_at_page_base() {
        let mut pool = Pool::new();
        let first = pool.allocate(100);
        let second = pool.allocate(100);
        assert_eq!(first.as_ptr() as usize % 1024, 0);
        assert_eq!(second.as_ptr() as usize, first.as_ptr() as usize + 128);
        unsafe {
            pool.deallocate(second, 100);
            pool.deallocate(first, 100);
        }
    }

    #[test]
    fn one_page_serves_a_whole_class() {
        let mut pool = Pool::new();
        let ptrs: Vec<_> = (0..5).map(|_| pool.allocate(8)).collect();
        assert_eq!(pool.stats().pages_allocated, 1);

        for _ in 0..1000 {
            let ptr = pool.allocate(8);
            unsafe { pool.deallocate(ptr, 8) };
        }
        assert_eq!(pool.stats().pages_allocated, 1);

        // a 1024 byte page holds 64 chunks of 16 bytes
        let more: Vec<_> = (0..59).map(|_| pool.allocate(8)).collect();
        assert_eq!(pool.stats().pages_allocated, 1);
        assert_eq!(pool.stats().chunks_in_use, 64);

        let overflow = pool.allocate(8);
        assert_eq!(pool.stats().pages_allocated, 2);

        unsafe {
            pool.deallocate(overflow, 8);
            for ptr in ptrs.into_iter().chain(more) {
                pool.deallocate(ptr, 8);
            }
        }
        assert_eq!(pool.stats().chunks_in_use, 0);
    }

    #[test]
    fn no_double_issuance() {
        let mut pool = Pool::new();
        let ptrs: Vec<_> = (0..200).map(|_| pool.allocate(48)).collect();
        let distinct: HashSet<usize> = ptrs.iter().map(|p| p.as_ptr() as usize).collect();
        assert_eq!(distinct.len(), ptrs.len());

        unsafe {
            for (i, ptr) in ptrs.iter().enumerate() {
                ptr::write_bytes(ptr.as_ptr(), i as u8, 64);
            }
            for (i, ptr) in ptrs.iter().enumerate() {
                let chunk = std::slice::from_raw_parts(ptr.as_ptr(), 64);
                assert!(chunk.iter().all(|&b| b == i as u8), "chunk {i} overlaps");
            }
            for ptr in ptrs {
                pool.deallocate(ptr, 48);
            }
        }
    }

    #[test]
    fn freed_chunk_is_reused_without_disturbing_others() {
        let mut pool = Pool::new();
        let keep: Vec<_> = (0..10).map(|_| pool.allocate(24)).collect();
        unsafe {
            for (i, ptr) in keep.iter().enumerate() {
                ptr::write_bytes(ptr.as_ptr(), 0xA0 + i as u8, 32);
            }

            let a = pool.allocate(24);
            pool.deallocate(a, 24);
            let b = pool.allocate(24);
            assert_eq!(a, b);
            pool.deallocate(b, 24);

            let fresh: Vec<_> = (0..10).map(|_| pool.allocate(24)).collect();
            let taken: HashSet<usize> = keep.iter().map(|p| p.as_ptr() as usize).collect();
            assert!(fresh.iter().all(|p| !taken.contains(&(p.as_ptr() as usize))));

            for (i, ptr) in keep.iter().enumerate() {
                let chunk = std::slice::from_raw_parts(ptr.as_ptr(), 32);
                assert!(chunk.iter().all(|&b| b == 0xA0 + i as u8));
            }
            for ptr in keep.into_iter().chain(fresh) {
                pool.deallocate(ptr, 24);
            }
        }
    }

    #[test]
    fn oversized_requests_take_the_heap() {
        let mut pool = Pool::new();
        let ptr = pool.allocate(4096);
        assert_eq!(ptr.as_ptr() as usize % Pool::LARGE_ALIGN, 0);
        assert_eq!(pool.stats().pages_allocated, 0);
        assert_eq!(pool.stats().large_in_use, 1);
        unsafe { pool.deallocate(ptr, 4096) };
        assert_eq!(pool.stats().large_in_use, 0);
    }

    #[test]
    fn reallocate_within_class_is_noop() {
        let mut pool = Pool::new();
        let ptr = pool.allocate(40);
        let same = unsafe { pool.reallocate(ptr, 40, 64) };
        assert_eq!(ptr, same);
        unsafe { pool.deallocate(same, 64) };
    }

    #[test]
    fn reallocate_across_paths_copies_prefix() {
        let mut pool = Pool::new();
        unsafe {
            let ptr = pool.allocate(16);
            for i in 0..16 {
                ptr.as_ptr().add(i).write(i as u8);
            }

            // small -> small
            let ptr = pool.reallocate(ptr, 16, 200);
            // small -> large
            let ptr = pool.reallocate(ptr, 200, 2048);
            assert_eq!(pool.stats().large_in_use, 1);
            assert_eq!(pool.stats().chunks_in_use, 0);
            // large -> large
            let ptr = pool.reallocate(ptr, 2048, 8192);
            // large -> small
            let ptr = pool.reallocate(ptr, 8192, 8);
            assert_eq!(pool.stats().large_in_use, 0);
            assert_eq!(pool.stats().chunks_in_use, 1);

            for i in 0..8 {
                assert_eq!(*ptr.as_ptr().add(i), i as u8);
            }
            pool.deallocate(ptr, 8);
        }
    }

    #[test]
    fn trim_releases_only_fully_free_pages() {
        let mut pool = Pool::new();
        let base = pool.allocate(16);
        let other = pool.allocate(16);
        let wide = pool.allocate(300);
        assert_eq!(pool.stats().pages_live, 2);

        unsafe { pool.deallocate(base, 16) };
        // the base chunk is back but `other` still lives on that page
        assert_eq!(pool.trim(), 0);

        unsafe { pool.deallocate(other, 16) };
        assert_eq!(pool.trim(), 1);
        assert_eq!(pool.stats().pages_live, 1);
        assert_eq!(pool.stats().pages_released, 1);

        // the class-0 free list must not point into the released page anymore
        let again = pool.allocate(16);
        assert_eq!(pool.stats().pages_allocated, 3);
        unsafe {
            pool.deallocate(again, 16);
            pool.deallocate(wide, 300);
        }
        assert_eq!(pool.trim(), 2);
        assert_eq!(pool.stats().pages_live, 0);
    }

    #[test]
    fn trim_keeps_free_chunks_of_busy_pages() {
        let mut pool = Pool::new();
        let held = pool.allocate(64);
        let a = pool.allocate(64);
        let b = pool.allocate(64);
        unsafe {
            pool.deallocate(a, 64);
            pool.deallocate(b, 64);
        }
        assert_eq!(pool.trim(), 0);

        // 16 chunks of 64 bytes per page, one is held
        let reused: Vec<_> = (0..15).map(|_| pool.allocate(64)).collect();
        assert_eq!(pool.stats().pages_allocated, 1);
        unsafe {
            for ptr in reused {
                pool.deallocate(ptr, 64);
            }
            pool.deallocate(held, 64);
        }
    }

    #[test]
    fn display_shows_geometry() {
        let mut pool = Pool::new();
        let ptr = pool.allocate(64);
        let shown = pool.to_string();
        assert!(shown.starts_with("SlabPool { page: 1024, classes: 16..=512,"));
        assert!(shown.contains("chunks_in_use: 1"));
        unsafe { pool.deallocate(ptr, 64) };
    }

    #[test]
    fn teardown_with_outstanding_chunks() {
        let mut pool = Pool::new();
        let _leaked = pool.allocate(32);
        let freed = pool.allocate(32);
        unsafe { pool.deallocate(freed, 32) };
        drop(pool);
    }

    #[test]
    fn thread_pools_are_independent() {
        let outer = std::thread::spawn(|| {
            let ptr = with_thread_pool(|pool| pool.allocate(16)).unwrap();
            let inner = std::thread::spawn(|| {
                let stats = thread_pool_stats().unwrap();
                assert_eq!(stats.pages_allocated, 0);
                assert_eq!(stats.chunks_in_use, 0);
            });
            inner.join().unwrap();

            let stats = thread_pool_stats().unwrap();
            assert_eq!(stats.pages_allocated, 1);
            assert_eq!(stats.chunks_in_use, 1);
            with_thread_pool(|pool| unsafe { pool.deallocate(ptr, 16) }).unwrap();
        });
        outer.join().unwrap();
    }
}
