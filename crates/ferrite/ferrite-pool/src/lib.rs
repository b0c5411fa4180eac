//! `ferrite-pool`: lock-free fixed-block allocator over a single arena.
//!
//! The pool carves one contiguous, cache-line-aligned allocation into
//! equal blocks and threads a free list through them. Each free block's
//! first four bytes hold the index of the next free block; the list head
//! lives in a single `AtomicU64` packing `{tag: u32, index: u32}`.
//!
//! # ABA protection
//!
//! A plain CAS on a head pointer is vulnerable to ABA: pop A, another
//! thread pops A and B and pushes A back, our stale `next` now points at
//! the freed B. Portable Rust has no double-width CAS, so instead of a
//! tagged 128-bit pointer the head packs a 32-bit block *index* with a
//! 32-bit generation tag bumped on every successful push and pop — the
//! same protection in a single-width word.
//!
//! Allocation and deallocation are O(1), never touch the system allocator,
//! and never block. `alloc` returns `None` on exhaustion; the pool does
//! not grow.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Cache line size the arena and every block are aligned to.
pub const CACHE_LINE_BYTES: usize = 64;

pub const DEFAULT_BLOCK_BYTES: usize = 4096;
pub const DEFAULT_NUM_BLOCKS: usize = 1024;

/// Sentinel index meaning "no block" (end of free list / empty pool).
const NULL_INDEX: u32 = u32::MAX;

#[inline(always)]
fn pack(tag: u32, index: u32) -> u64 {
    ((tag as u64) << 32) | index as u64
}

#[inline(always)]
fn head_index(head: u64) -> u32 {
    head as u32
}

#[inline(always)]
fn head_tag(head: u64) -> u32 {
    (head >> 32) as u32
}

/// Lock-free fixed-block allocator.
pub struct BlockPool {
    arena: NonNull<u8>,
    layout: Layout,
    block_bytes: usize,
    num_blocks: usize,
    /// Packed {tag, index} of the free-list head.
    head: AtomicU64,
    allocated: AtomicUsize,
}

// The arena pointer is only reached through the atomic free-list
// protocol; blocks handed out are exclusively owned by the caller until
// freed.
unsafe impl Send for BlockPool {}
unsafe impl Sync for BlockPool {}

impl BlockPool {
    /// Build a pool of `num_blocks` blocks of at least `block_bytes` each.
    ///
    /// The block size is rounded up to a cache-line multiple so adjacent
    /// blocks never share a line. A block must at minimum hold the 4-byte
    /// free-list link.
    ///
    /// # Panics
    /// Panics if `num_blocks` is 0 or does not fit the 32-bit index space.
    pub fn new(block_bytes: usize, num_blocks: usize) -> Self {
        assert!(num_blocks > 0, "pool must hold at least one block");
        assert!(
            num_blocks < NULL_INDEX as usize,
            "block count must fit the u32 index space"
        );

        let block_bytes = block_bytes
            .max(std::mem::size_of::<u32>())
            .next_multiple_of(CACHE_LINE_BYTES);

        let layout = Layout::from_size_align(block_bytes * num_blocks, CACHE_LINE_BYTES)
            .expect("arena layout");
        // SAFETY: layout has non-zero size (num_blocks > 0, block_bytes >= 64).
        let raw = unsafe { alloc_zeroed(layout) };
        let arena = NonNull::new(raw).expect("arena allocation failed");

        let pool = Self {
            arena,
            layout,
            block_bytes,
            num_blocks,
            head: AtomicU64::new(pack(0, NULL_INDEX)),
            allocated: AtomicUsize::new(0),
        };
        pool.thread_free_list();
        pool
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_BLOCK_BYTES, DEFAULT_NUM_BLOCKS)
    }

    #[inline]
    fn block_ptr(&self, index: u32) -> *mut u8 {
        debug_assert!((index as usize) < self.num_blocks);
        // SAFETY: index is in range, so the offset stays inside the arena.
        unsafe { self.arena.as_ptr().add(index as usize * self.block_bytes) }
    }

    /// The free-list link stored in a block's first four bytes.
    #[inline]
    fn link(&self, index: u32) -> &AtomicU32 {
        // SAFETY: the arena is cache-line aligned and block_bytes is a
        // multiple of 64, so every block start is aligned for AtomicU32.
        // The link word is only touched while the block is on the free
        // list (or being pushed onto it).
        unsafe { &*(self.block_ptr(index) as *const AtomicU32) }
    }

    /// Chain every block onto the free list: 0 -> 1 -> ... -> NULL.
    fn thread_free_list(&self) {
        for i in 0..self.num_blocks as u32 {
            let next = if (i as usize) + 1 < self.num_blocks {
                i + 1
            } else {
                NULL_INDEX
            };
            self.link(i).store(next, Ordering::Relaxed);
        }
        let tag = head_tag(self.head.load(Ordering::Relaxed));
        self.head
            .store(pack(tag.wrapping_add(1), 0), Ordering::Release);
    }

    /// Pop a block off the free list.
    ///
    /// Returns `None` when the pool is exhausted. The returned pointer is
    /// valid for `block_bytes()` bytes until passed back to [`free`].
    ///
    /// [`free`]: BlockPool::free
    pub fn alloc(&self) -> Option<NonNull<u8>> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let index = head_index(head);
            if index == NULL_INDEX {
                return None;
            }
            let next = self.link(index).load(Ordering::Acquire);
            let new_head = pack(head_tag(head).wrapping_add(1), next);
            match self
                .head
                .compare_exchange_weak(head, new_head, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.allocated.fetch_add(1, Ordering::Relaxed);
                    // SAFETY: block_ptr never returns null inside the arena.
                    return Some(unsafe { NonNull::new_unchecked(self.block_ptr(index)) });
                }
                Err(current) => head = current,
            }
        }
    }

    /// Push a block back onto the free list.
    ///
    /// Pointers that do not lie on a block boundary inside the arena are
    /// ignored, mirroring the defensive range check of a C allocator.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`alloc`] on this pool and must
    /// not be used (or freed again) after this call.
    ///
    /// [`alloc`]: BlockPool::alloc
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let base = self.arena.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        if addr < base || addr >= base + self.block_bytes * self.num_blocks {
            return;
        }
        let offset = addr - base;
        if offset % self.block_bytes != 0 {
            return;
        }
        let index = (offset / self.block_bytes) as u32;

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            self.link(index).store(head_index(head), Ordering::Relaxed);
            let new_head = pack(head_tag(head).wrapping_add(1), index);
            match self
                .head
                .compare_exchange_weak(head, new_head, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
        self.allocated.fetch_sub(1, Ordering::Relaxed);
    }

    /// Return every block to the free list.
    ///
    /// Takes `&mut self`: callers must guarantee no block is still in use.
    pub fn reset(&mut self) {
        self.allocated.store(0, Ordering::Relaxed);
        self.thread_free_list();
    }

    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn available(&self) -> usize {
        self.num_blocks - self.allocated()
    }

    pub fn block_bytes(&self) -> usize {
        self.block_bytes
    }

    pub fn capacity(&self) -> usize {
        self.num_blocks
    }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        // SAFETY: arena was allocated with exactly this layout in new().
        unsafe { dealloc(self.arena.as_ptr(), self.layout) };
    }
}
