//! Lock-free object pool.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};

struct Slot<T> {
    sequence: AtomicUsize,
    entry: UnsafeCell<*mut T>,
}

/// A bounded multi-producer multi-consumer ring of recycled allocations.
///
/// [`allocate`](Self::allocate) pops a recycled allocation and re-initializes it, falling back
/// to the global allocator when the ring is empty; [`release`](Self::release) drops the
/// contents in place and pushes the allocation back, deallocating when the ring is full. The
/// ring itself never blocks: each slot carries a sequence number that tells producers and
/// consumers apart without locking.
pub struct Pool<T> {
    slots: Box<[Slot<T>]>,
    mask: usize,
    /// Dequeue position.
    head: AtomicUsize,
    /// Enqueue position.
    tail: AtomicUsize,
}

// Only raw allocations of `T` travel through the ring.
unsafe impl<T: Send> Send for Pool<T> {}
unsafe impl<T: Send> Sync for Pool<T> {}

impl<T> Pool<T> {
    /// Creates a pool retaining up to `capacity` allocations, rounded up to a power of two.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbtree::pool::Pool;
    ///
    /// let pool: Pool<usize> = Pool::with_capacity(61);
    /// assert_eq!(pool.capacity(), 64);
    /// ```
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let slots = (0..capacity)
            .map(|index| Slot {
                sequence: AtomicUsize::new(index),
                entry: UnsafeCell::new(ptr::null_mut()),
            })
            .collect();
        Self {
            slots,
            mask: capacity - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// The number of allocations the pool can retain.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Takes a recycled allocation and moves `value` into it, or allocates anew.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbtree::pool::Pool;
    ///
    /// let pool: Pool<usize> = Pool::with_capacity(4);
    /// let boxed = pool.allocate(7);
    /// assert_eq!(*boxed, 7);
    /// pool.release(boxed);
    /// ```
    #[must_use]
    pub fn allocate(&self, value: T) -> Box<T> {
        if let Some(recycled) = self.pop() {
            unsafe {
                recycled.write(value);
                Box::from_raw(recycled)
            }
        } else {
            Box::new(value)
        }
    }

    /// Drops the contents of `boxed` and recycles its allocation.
    pub fn release(&self, boxed: Box<T>) {
        let raw = Box::into_raw(boxed);
        unsafe {
            ptr::drop_in_place(raw);
        }
        if !self.push(raw) {
            // The ring is full; give the allocation back to the allocator.
            unsafe {
                drop(Box::from_raw(raw.cast::<MaybeUninit<T>>()));
            }
        }
    }

    fn push(&self, entry: *mut T) -> bool {
        let mut pos = self.tail.load(Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let sequence = slot.sequence.load(Acquire);
            let diff = sequence.wrapping_sub(pos) as isize;
            if diff == 0 {
                match self
                    .tail
                    .compare_exchange_weak(pos, pos.wrapping_add(1), Relaxed, Relaxed)
                {
                    Ok(_) => {
                        unsafe {
                            *slot.entry.get() = entry;
                        }
                        slot.sequence.store(pos.wrapping_add(1), Release);
                        return true;
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                return false;
            } else {
                pos = self.tail.load(Relaxed);
            }
        }
    }

    fn pop(&self) -> Option<*mut T> {
        let mut pos = self.head.load(Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let sequence = slot.sequence.load(Acquire);
            let diff = sequence.wrapping_sub(pos.wrapping_add(1)) as isize;
            if diff == 0 {
                match self
                    .head
                    .compare_exchange_weak(pos, pos.wrapping_add(1), Relaxed, Relaxed)
                {
                    Ok(_) => {
                        let entry = unsafe { *slot.entry.get() };
                        slot.sequence
                            .store(pos.wrapping_add(self.mask + 1), Release);
                        return Some(entry);
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.head.load(Relaxed);
            }
        }
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        while let Some(recycled) = self.pop() {
            unsafe {
                drop(Box::from_raw(recycled.cast::<MaybeUninit<T>>()));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn allocation_is_recycled() {
        let pool: Pool<usize> = Pool::with_capacity(4);
        let first = pool.allocate(1);
        let address = std::ptr::addr_of!(*first) as usize;
        pool.release(first);
        let second = pool.allocate(2);
        assert_eq!(std::ptr::addr_of!(*second) as usize, address);
        assert_eq!(*second, 2);
        pool.release(second);
    }

    #[test]
    fn release_drops_contents_exactly_once() {
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Relaxed);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let pool: Pool<Tracked> = Pool::with_capacity(2);
        for _ in 0..8 {
            pool.release(pool.allocate(Tracked(drops.clone())));
        }
        assert_eq!(drops.load(Relaxed), 8);
        drop(pool);
        assert_eq!(drops.load(Relaxed), 8);
    }

    #[test]
    fn concurrent_allocate_release() {
        let pool: Arc<Pool<u64>> = Arc::new(Pool::with_capacity(16));
        let num_threads = 4;
        let barrier = Arc::new(Barrier::new(num_threads));
        let mut handles = Vec::new();
        for thread_id in 0..num_threads {
            let pool = pool.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                for i in 0..4096_u64 {
                    let boxed = pool.allocate(thread_id as u64 * 4096 + i);
                    assert_eq!(*boxed, thread_id as u64 * 4096 + i);
                    pool.release(boxed);
                }
            }));
        }
        for handle in handles {
            assert!(handle.join().is_ok());
        }
    }
}
