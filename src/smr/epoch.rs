//! Epoch bookkeeping shared by the RCU flavors.

use super::tag;
use super::Retired;
use crate::exit_guard::ExitGuard;

use std::cell::{Cell, UnsafeCell};
use std::mem::take;
use std::ptr;
use std::sync::atomic::fence;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release, SeqCst};
use std::sync::atomic::{AtomicPtr, AtomicU8};
use std::thread;

/// The cadence of an epoch advance attempt on section exit.
const CADENCE: usize = 256;

/// Bits of the announcement byte representing an epoch.
const EPOCH_BITS: u8 = (1_u8 << 2) - 1;

/// A bit field representing a thread state where the thread has no open read-section.
const INACTIVE: u8 = 1_u8 << 2;

/// A bit field representing a thread state where the thread has been terminated.
const INVALID: u8 = 1_u8 << 3;

/// A grace-period domain: a global epoch in `{0, 1, 2}` and a registry of per-thread states.
///
/// Each RCU flavor owns one `static` domain; thread states are registered lazily and unlinked
/// by the next registry scan after their thread terminates.
pub(super) struct EpochDomain {
    /// The global epoch. A difference between a thread announcement and the global epoch is
    /// treated as an epoch change by that thread.
    epoch: AtomicU8,

    /// Registry of [`ThreadState`] instances; the lowest pointer bit is the scan lock.
    anchor: AtomicPtr<ThreadState>,
}

/// Per-thread participation record in an [`EpochDomain`].
///
/// Only the announcement is read by other threads; the remaining fields are owned by the
/// registered thread, or by the scan-lock holder once the state is marked [`INVALID`].
pub(super) struct ThreadState {
    announcement: AtomicU8,
    next_epoch_update: Cell<usize>,
    num_sections: Cell<usize>,
    num_deferred: Cell<usize>,
    previous: UnsafeCell<Vec<Retired>>,
    current: UnsafeCell<Vec<Retired>>,
    next: UnsafeCell<Vec<Retired>>,
    next_state: Cell<*mut ThreadState>,
}

impl ThreadState {
    fn new() -> Self {
        Self {
            announcement: AtomicU8::new(INACTIVE),
            next_epoch_update: Cell::new(CADENCE),
            num_sections: Cell::new(0),
            num_deferred: Cell::new(0),
            previous: UnsafeCell::new(Vec::new()),
            current: UnsafeCell::new(Vec::new()),
            next: UnsafeCell::new(Vec::new()),
            next_state: Cell::new(ptr::null_mut()),
        }
    }

    /// Returns `true` if the thread has an open read-section.
    pub(super) fn in_section(&self) -> bool {
        self.num_sections.get() > 0
    }

    /// Marks the state as belonging to a terminated thread; the record and any garbage left in
    /// its buckets are reclaimed by the next registry scan.
    pub(super) fn invalidate(&self) {
        self.announcement.fetch_or(INVALID, Relaxed);
    }

    /// Acknowledges a new global epoch by rotating the three garbage buckets and disposing of
    /// the oldest one.
    fn epoch_updated(&self) {
        debug_assert_eq!(self.announcement.load(Relaxed) & INACTIVE, 0);

        let disposable = {
            let next = unsafe { &mut *self.next.get() };
            let oldest = take(next);
            *next = take(unsafe { &mut *self.previous.get() });
            *unsafe { &mut *self.previous.get() } = take(unsafe { &mut *self.current.get() });
            oldest
        };
        self.num_deferred
            .set(self.num_deferred.get() - disposable.len());
        drop(disposable);
    }
}

impl EpochDomain {
    pub(super) const fn new() -> Self {
        Self {
            epoch: AtomicU8::new(0),
            anchor: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Registers a new [`ThreadState`] with the domain.
    pub(super) fn register(&'static self) -> *mut ThreadState {
        let ptr = Box::into_raw(Box::new(ThreadState::new()));
        let mut current = self.anchor.load(Relaxed);
        loop {
            unsafe {
                (*ptr).next_state.set(tag::untag(current));
            }
            // The scan lock bit is kept intact.
            let new = tag::with_tag(ptr, tag::tag(current));
            match self.anchor.compare_exchange(current, new, Release, Relaxed) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        ptr
    }

    /// Acknowledges a new read-section being opened.
    #[inline]
    pub(super) fn enter(&'static self, state: &ThreadState) {
        state.num_sections.set(state.num_sections.get() + 1);
        if state.num_sections.get() == 1 {
            let known_epoch = state.announcement.load(Relaxed) & EPOCH_BITS;
            let new_epoch = self.epoch.load(Relaxed);
            state.announcement.store(new_epoch, Relaxed);

            // Every load inside the section must be ordered after the announcement store,
            // or a concurrent scan could advance past a section it never saw.
            fence(SeqCst);

            if known_epoch != new_epoch {
                state.epoch_updated();
            }
        }
    }

    /// Acknowledges a read-section being dropped.
    #[inline]
    pub(super) fn exit(&'static self, state: &ThreadState) {
        debug_assert_eq!(state.announcement.load(Relaxed) & INACTIVE, 0);

        if state.num_sections.get() == 1 {
            if state.next_epoch_update.get() == 0 {
                state.next_epoch_update.set(CADENCE);
                if state.num_deferred.get() != 0 && tag::tag(self.anchor.load(Relaxed)) == 0 {
                    self.try_advance(state);
                }
            } else {
                state
                    .next_epoch_update
                    .set(state.next_epoch_update.get() - 1);
            }

            // The section's loads must complete before the inactive bit becomes visible.
            fence(Release);
            state.announcement.fetch_or(INACTIVE, Relaxed);
        }
        state.num_sections.set(state.num_sections.get() - 1);
    }

    /// Buffers garbage in the current-epoch bucket. Requires an open read-section.
    pub(super) fn defer(&'static self, state: &ThreadState, garbage: Retired) {
        debug_assert!(state.num_sections.get() > 0);

        unsafe { &mut *state.current.get() }.push(garbage);
        state.num_deferred.set(state.num_deferred.get() + 1);
    }

    /// Advances the global epoch `generations` times, blocking until other threads cooperate,
    /// then rotates once more so the calling thread observes the final epoch.
    ///
    /// Calling this inside an open read-section on the same thread would deadlock, hence the
    /// debug assertion.
    pub(super) fn advance(&'static self, state: &ThreadState, generations: usize) {
        debug_assert_eq!(state.num_sections.get(), 0);

        for _ in 0..generations {
            self.enter(state);
            let observed = self.epoch.load(Relaxed);
            while self.epoch.load(Relaxed) == observed {
                if !self.try_advance(state) {
                    thread::yield_now();
                }
            }
            self.exit(state);
        }
        self.enter(state);
        self.exit(state);
    }

    /// Tries to scan the registry and update the global epoch; returns `true` if the epoch
    /// was advanced by the calling thread.
    fn try_advance(&'static self, state: &ThreadState) -> bool {
        debug_assert_eq!(state.announcement.load(Relaxed) & INACTIVE, 0);

        // The anchor's tag bit serializes registry scans; losing the race means another
        // thread is already advancing.
        let Ok(locked) = self.anchor.fetch_update(Acquire, Acquire, |p| {
            if tag::tag(p) == 1 {
                None
            } else {
                Some(tag::with_tag(p, 1))
            }
        }) else {
            return false;
        };
        let _lock = ExitGuard::new(&self.anchor, |anchor| {
            // Drops the scan lock on every exit path.
            while anchor
                .fetch_update(Release, Relaxed, |p| {
                    debug_assert_eq!(tag::tag(p), 1);
                    Some(tag::untag(p))
                })
                .is_err()
            {}
        });

        let known_epoch = state.announcement.load(Relaxed);
        let mut advance = true;
        let mut prev_ptr: *mut ThreadState = ptr::null_mut();
        let mut state_ptr = tag::untag(locked);
        while let Some(other) = unsafe { state_ptr.as_ref() } {
            if !ptr::eq(state, other) {
                let announcement = other.announcement.load(Acquire);
                if (announcement & INACTIVE) == 0 && announcement != known_epoch {
                    // An active section still announces the previous epoch.
                    advance = false;
                    break;
                } else if (announcement & INVALID) != 0 {
                    // The thread state is obsolete; unlink it and defer its disposal.
                    let next = other.next_state.get();
                    let unlinked = if let Some(prev) = unsafe { prev_ptr.as_ref() } {
                        prev.next_state.set(next);
                        true
                    } else {
                        self.anchor
                            .fetch_update(Release, Relaxed, |p| {
                                debug_assert_eq!(tag::tag(p), 1);
                                if ptr::eq(tag::untag(p), state_ptr) {
                                    Some(tag::with_tag(next, 1))
                                } else {
                                    None
                                }
                            })
                            .is_ok()
                    };
                    if unlinked {
                        let dead = state_ptr;
                        state_ptr = next;
                        self.defer(state, unsafe { Retired::from_raw(dead, drop) });
                        continue;
                    }
                }
            }
            prev_ptr = state_ptr;
            state_ptr = other.next_state.get();
        }
        if advance {
            // Every announcement was seen at the current epoch; the bump must not be
            // reordered before those reads.
            fence(SeqCst);
            let next_epoch = match known_epoch {
                0 => 1,
                1 => 2,
                _ => 0,
            };
            self.epoch.store(next_epoch, Relaxed);
            state.announcement.store(next_epoch, Relaxed);
            state.epoch_updated();
        }
        advance
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    static DOMAIN: EpochDomain = EpochDomain::new();

    #[test]
    fn deferred_garbage_survives_two_epochs() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let state_ptr = DOMAIN.register();
        let state = unsafe { &*state_ptr };

        DOMAIN.enter(state);
        let observer = disposed.clone();
        DOMAIN.defer(
            state,
            unsafe {
                Retired::from_raw(Box::into_raw(Box::new(0_u8)), move |_| {
                    observer.fetch_add(1, Relaxed);
                })
            },
        );
        DOMAIN.exit(state);
        assert_eq!(disposed.load(Relaxed), 0);

        DOMAIN.advance(state, 3);
        assert_eq!(disposed.load(Relaxed), 1);
    }
}
