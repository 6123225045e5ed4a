//! Batch-allocated connection slots with joint ownership.
//!
//! Connections are constructed in place inside a contiguous block of
//! uninitialized slots (a slab). Every live connection holds a
//! [`SlabShare`] into its slab; the block's backing memory is freed only
//! when the last share is gone, so connection memory is guaranteed to
//! outlive the last in-flight continuation that references it. Each accept
//! loop owns a [`SlabPool`] cursor that hands out the current block's slots
//! in order and rolls over to a fresh block when one fills up.
//!
//! Slots are handed out once and never reused within a block; slots that
//! were never emplaced are never dropped.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Slot<T> {
    refs: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// A contiguous block of slots, jointly owned by the shares into it and by
/// the pool cursor that is still filling it.
struct Slab<T> {
    slots: Box<[Slot<T>]>,
}

// SAFETY: a slot's value is written exactly once (by `SlabPool::emplace`,
// before any share exists), read only through shares while `refs > 0`, and
// dropped exactly once by the final share. The per-slot atomic count is the
// synchronization point, as in `Arc`.
unsafe impl<T: Send + Sync> Send for Slab<T> {}
unsafe impl<T: Send + Sync> Sync for Slab<T> {}

impl<T> Slab<T> {
    fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot {
                refs: AtomicUsize::new(0),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            });
        }
        Self {
            slots: slots.into_boxed_slice(),
        }
    }
}

// No `Drop` for `Slab`: an initialized slot always has a share, and the
// share holds the `Arc<Slab>`, so by the time the block is freed every
// emplaced value has already been destroyed by its final share. Slots that
// were never emplaced are `MaybeUninit` and must not be dropped.

/// Jointly-owning handle to one emplaced value in a slab.
///
/// Cloning is cheap (one relaxed increment plus an `Arc` bump). Dropping
/// the last share destroys the value in place; the block itself is freed
/// when no share or pool cursor references it any longer.
pub struct SlabShare<T> {
    slab: Arc<Slab<T>>,
    index: usize,
}

// SAFETY: same bounds as `Arc<T>` — shares hand out `&T` from any thread,
// and the final share may run `T`'s destructor on any thread.
unsafe impl<T: Send + Sync> Send for SlabShare<T> {}
unsafe impl<T: Send + Sync> Sync for SlabShare<T> {}

impl<T> SlabShare<T> {
    fn slot(&self) -> &Slot<T> {
        &self.slab.slots[self.index]
    }
}

impl<T> Deref for SlabShare<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: a share only exists for an emplaced slot, and the value
        // stays initialized until the last share drops.
        unsafe { (*self.slot().value.get()).assume_init_ref() }
    }
}

impl<T> Clone for SlabShare<T> {
    fn clone(&self) -> Self {
        self.slot().refs.fetch_add(1, Ordering::Relaxed);
        Self {
            slab: self.slab.clone(),
            index: self.index,
        }
    }
}

impl<T> Drop for SlabShare<T> {
    fn drop(&mut self) {
        if self.slot().refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            // SAFETY: we are the last share; the value is initialized and
            // nothing can reach it after this point. The `Arc` we still
            // hold keeps the block alive through the destructor call.
            unsafe { (&mut *self.slot().value.get()).assume_init_drop() };
        }
    }
}

/// Per-accept-loop cursor over the current slab.
///
/// Holding the pool keeps the current block alive across accepts even
/// before any connection occupies it.
pub struct SlabPool<T> {
    slab: Arc<Slab<T>>,
    cursor: usize,
    capacity: usize,
}

impl<T> SlabPool<T> {
    /// Creates a pool whose blocks hold `capacity` slots each.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "slab capacity must be non-zero");
        Self {
            slab: Arc::new(Slab::new(capacity)),
            cursor: 0,
            capacity,
        }
    }

    /// Constructs `value` in the current slot and returns the first share
    /// to it. Rolls over to a fresh block once the current one is full.
    pub fn emplace(&mut self, value: T) -> SlabShare<T> {
        let index = self.cursor;
        let slot = &self.slab.slots[index];
        // SAFETY: cursor slots are handed out exactly once, so this slot is
        // still uninitialized and unreferenced.
        unsafe { (*slot.value.get()).write(value) };
        slot.refs.store(1, Ordering::Release);
        let share = SlabShare {
            slab: self.slab.clone(),
            index,
        };

        self.cursor += 1;
        if self.cursor == self.capacity {
            self.slab = Arc::new(Slab::new(self.capacity));
            self.cursor = 0;
        }
        share
    }

    #[cfg(test)]
    fn current_block(&self) -> std::sync::Weak<Slab<T>> {
        Arc::downgrade(&self.slab)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Counts drops so tests can assert exactly-once destruction.
    struct Tracked {
        drops: Arc<AtomicUsize>,
        tag: usize,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn emplace_and_deref() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut pool = SlabPool::new(4);

        let share = pool.emplace(Tracked {
            drops: drops.clone(),
            tag: 7,
        });
        assert_eq!(share.tag, 7);
        assert_eq!(share.clone().tag, 7);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn value_dropped_exactly_once_by_last_share() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut pool = SlabPool::new(2);

        let share = pool.emplace(Tracked {
            drops: drops.clone(),
            tag: 0,
        });
        let clones: Vec<_> = (0..8).map(|_| share.clone()).collect();
        drop(share);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(clones);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn uninitialized_slots_are_never_dropped() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut pool = SlabPool::new(8);

        // Occupy one slot of eight, then tear everything down.
        let share = pool.emplace(Tracked {
            drops: drops.clone(),
            tag: 1,
        });
        drop(pool);
        drop(share);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn block_released_only_after_last_share_and_cursor() {
        let mut pool = SlabPool::new(2);
        let block = pool.current_block();

        let a = pool.emplace(1u32);
        let b = pool.emplace(2u32); // fills the block; pool rolls over

        // The cursor moved on, but the shares still pin the old block.
        assert!(block.upgrade().is_some());
        drop(a);
        assert!(block.upgrade().is_some());
        drop(b);
        assert!(block.upgrade().is_none());
    }

    #[test]
    fn cursor_rolls_over_to_fresh_blocks() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut pool = SlabPool::new(2);

        let shares: Vec<_> = (0..10)
            .map(|tag| {
                pool.emplace(Tracked {
                    drops: drops.clone(),
                    tag,
                })
            })
            .collect();
        for (tag, share) in shares.iter().enumerate() {
            assert_eq!(share.tag, tag);
        }
        drop(shares);
        assert_eq!(drops.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn shares_drop_cleanly_across_threads() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut pool = SlabPool::new(4);

        let share = pool.emplace(Tracked {
            drops: drops.clone(),
            tag: 0,
        });
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let share = share.clone();
                std::thread::spawn(move || {
                    assert_eq!(share.tag, 0);
                })
            })
            .collect();
        drop(share);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
