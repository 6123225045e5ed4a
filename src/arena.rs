//! Per-direction handler allocator.
//!
//! Every in-flight I/O continuation needs a small, short-lived allocation.
//! `HandlerArena` serves those from a single fixed slot owned by the
//! connection, so the steady-state relay path never touches the global
//! heap: each direction has exactly one continuation outstanding at a time,
//! and its storage is recycled in place. Requests that do not fit, or that
//! arrive while the slot is handed out, fall through to the global heap.
//!
//! `TaskBox` is the consumer side: a future whose storage is drawn from an
//! arena and returned on drop, carrying a keep-alive guard so the arena's
//! owner outlives the storage it handed out.

use std::alloc::{self, Layout};
use std::cell::UnsafeCell;
use std::future::Future;
use std::pin::Pin;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

/// Capacity of the in-place slot, in bytes.
///
/// Large enough for a relay pipeline continuation with headroom; anything
/// bigger is an outlier and goes to the heap.
pub const HANDLER_ARENA_CAPACITY: usize = 1024;

/// Strictest alignment the slot can satisfy.
const ARENA_ALIGN: usize = 16;

#[repr(align(16))]
struct Storage([u8; HANDLER_ARENA_CAPACITY]);

/// Single-slot scratch arena for I/O continuations.
///
/// Allocation succeeds from the slot iff the request fits and the slot is
/// free; otherwise it falls through to the global heap. Deallocation
/// distinguishes the two by pointer identity. Allocation never fails.
pub struct HandlerArena {
    storage: UnsafeCell<Storage>,
    in_use: AtomicBool,
}

// SAFETY: the storage cell is only ever reachable through the pointer
// returned by `allocate`, and the `in_use` flag hands the slot to at most
// one caller at a time (acquire/release pairing in allocate/deallocate).
unsafe impl Send for HandlerArena {}
unsafe impl Sync for HandlerArena {}

impl HandlerArena {
    pub fn new() -> Self {
        Self {
            storage: UnsafeCell::new(Storage([0; HANDLER_ARENA_CAPACITY])),
            in_use: AtomicBool::new(false),
        }
    }

    fn slot_ptr(&self) -> *mut u8 {
        self.storage.get().cast::<u8>()
    }

    /// Hands out the slot if `layout` fits and the slot is free, otherwise
    /// a fresh heap allocation. Aborts (like the global allocator) if the
    /// heap itself is exhausted.
    pub fn allocate(&self, layout: Layout) -> NonNull<u8> {
        if layout.size() <= HANDLER_ARENA_CAPACITY
            && layout.align() <= ARENA_ALIGN
            && !self.in_use.swap(true, Ordering::Acquire)
        {
            // SAFETY: the cell pointer is non-null and now exclusively ours.
            return unsafe { NonNull::new_unchecked(self.slot_ptr()) };
        }
        let raw = if layout.size() == 0 {
            // Dangling but well-aligned; never dereferenced.
            layout.align() as *mut u8
        } else {
            // SAFETY: layout has non-zero size.
            unsafe { alloc::alloc(layout) }
        };
        match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        }
    }

    /// Returns storage obtained from [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must come from a prior `allocate(layout)` on this arena with
    /// the same `layout`, and must not be used afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if ptr.as_ptr() == self.slot_ptr() {
            self.in_use.store(false, Ordering::Release);
        } else if layout.size() != 0 {
            // SAFETY: heap pointer from `alloc::alloc` with this layout.
            unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }

    /// Whether the slot is currently handed out.
    pub fn is_busy(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }
}

impl Default for HandlerArena {
    fn default() -> Self {
        Self::new()
    }
}

/// A future stored in arena memory, recycled on drop.
///
/// The guard `G` keeps whatever owns the arena alive for as long as the
/// storage is outstanding; it is released only after the future has been
/// destroyed and its storage returned.
pub struct TaskBox<F, G> {
    future: NonNull<F>,
    arena: NonNull<HandlerArena>,
    _keepalive: G,
}

// SAFETY: the arena is Sync and the future pointer is uniquely owned by
// this box, so the box may move between threads whenever its contents can.
unsafe impl<F: Send, G: Send> Send for TaskBox<F, G> {}

impl<F: Future, G> TaskBox<F, G> {
    /// Moves `future` into storage drawn from `arena`.
    ///
    /// # Safety
    ///
    /// `keepalive` must keep `arena` (and its backing storage) alive for
    /// the whole lifetime of the returned box.
    pub unsafe fn new(arena: &HandlerArena, keepalive: G, future: F) -> Self {
        let layout = Layout::new::<F>();
        let ptr = arena.allocate(layout).cast::<F>();
        // SAFETY: `allocate` returned writable storage for `layout`.
        unsafe { ptr.as_ptr().write(future) };
        Self {
            future: ptr,
            arena: NonNull::from(arena),
            _keepalive: keepalive,
        }
    }
}

impl<F: Future, G> Future for TaskBox<F, G> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: the future lives at a stable address (arena slot or heap)
        // until dropped; moving the box never moves it.
        let this = unsafe { self.get_unchecked_mut() };
        unsafe { Pin::new_unchecked(&mut *this.future.as_ptr()).poll(cx) }
    }
}

impl<F, G> Drop for TaskBox<F, G> {
    fn drop(&mut self) {
        let layout = Layout::new::<F>();
        // SAFETY: the pointer holds an initialized `F` from `new`. The
        // keep-alive guard is still held here, so the arena is valid while
        // the storage is returned; the guard itself drops last.
        unsafe {
            ptr::drop_in_place(self.future.as_ptr());
            self.arena
                .as_ref()
                .deallocate(self.future.cast::<u8>(), layout);
        }
    }
}
