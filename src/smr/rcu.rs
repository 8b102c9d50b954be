//! Epoch-based reclamation strategies.

use super::epoch::{EpochDomain, ThreadState};
use super::{Rcu, Reclaimer, Retired, Section, SECTION_SLOTS};

use std::ptr::null_mut;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicPtr, AtomicUsize};
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

/// Thread-local participation handle in one flavor's [`EpochDomain`].
struct RcuLocal {
    domain: &'static EpochDomain,
    state: *mut ThreadState,
}

impl RcuLocal {
    fn register(domain: &'static EpochDomain) -> Self {
        Self {
            domain,
            state: domain.register(),
        }
    }

    fn state(&self) -> &ThreadState {
        unsafe { &*self.state }
    }
}

impl Drop for RcuLocal {
    fn drop(&mut self) {
        self.state().invalidate();
    }
}

/// An RCU read-section.
///
/// Every pointer loaded through the section stays valid until the section is dropped; the
/// guard-slot operations are free. Sections may nest, and stay on the thread that opened them.
pub struct RcuSection {
    domain: &'static EpochDomain,
    state: *mut ThreadState,
}

impl RcuSection {
    fn open(local: &RcuLocal) -> Self {
        local.domain.enter(local.state());
        Self {
            domain: local.domain,
            state: local.state,
        }
    }
}

impl Section for RcuSection {
    #[inline]
    fn protect<T>(&self, index: usize, src: &AtomicPtr<T>) -> *mut T {
        debug_assert!(index < SECTION_SLOTS);
        src.load(Acquire)
    }

    #[inline]
    fn protect_addr<T>(&self, index: usize, _ptr: *mut T) {
        debug_assert!(index < SECTION_SLOTS);
    }

    #[inline]
    fn copy(&self, from: usize, to: usize) {
        debug_assert!(from < SECTION_SLOTS && to < SECTION_SLOTS);
    }

    #[inline]
    fn clear(&self, index: usize) {
        debug_assert!(index < SECTION_SLOTS);
    }
}

impl Drop for RcuSection {
    #[inline]
    fn drop(&mut self) {
        self.domain.exit(unsafe { &*self.state });
    }
}

/// Synchronous grace-period strategy: `retire` outside a read-section blocks until a full
/// grace period has elapsed and disposes of the garbage before returning.
///
/// When `retire` is reached while the calling thread still has a read-section open, waiting
/// for the grace period would deadlock, so the garbage is buffered and disposed of on a later
/// epoch change instead.
pub struct InstantRcu;

static INSTANT_DOMAIN: EpochDomain = EpochDomain::new();
thread_local! {
    static INSTANT_LOCAL: RcuLocal = RcuLocal::register(&INSTANT_DOMAIN);
}

impl Reclaimer for InstantRcu {
    type Section = RcuSection;

    #[inline]
    fn section() -> RcuSection {
        INSTANT_LOCAL.with(RcuSection::open)
    }

    fn retire(garbage: Retired) {
        INSTANT_LOCAL.with(|local| {
            let state = local.state();
            if state.in_section() {
                local.domain.defer(state, garbage);
            } else {
                local.domain.advance(state, 2);
                drop(garbage);
            }
        });
    }

    fn quiesce() {
        INSTANT_LOCAL.with(|local| local.domain.advance(local.state(), 3));
    }
}

impl Rcu for InstantRcu {}

/// Buffering grace-period strategy: garbage is kept in per-thread per-epoch buckets and
/// disposed of two epoch advances later. The default strategy.
pub struct BufferedRcu;

static BUFFERED_DOMAIN: EpochDomain = EpochDomain::new();
thread_local! {
    static BUFFERED_LOCAL: RcuLocal = RcuLocal::register(&BUFFERED_DOMAIN);
}

impl Reclaimer for BufferedRcu {
    type Section = RcuSection;

    #[inline]
    fn section() -> RcuSection {
        BUFFERED_LOCAL.with(RcuSection::open)
    }

    #[inline]
    fn retire(garbage: Retired) {
        BUFFERED_LOCAL.with(|local| {
            let state = local.state();
            if state.in_section() {
                local.domain.defer(state, garbage);
            } else {
                local.domain.enter(state);
                local.domain.defer(state, garbage);
                local.domain.exit(state);
            }
        });
    }

    fn quiesce() {
        BUFFERED_LOCAL.with(|local| local.domain.advance(local.state(), 3));
    }
}

impl Rcu for BufferedRcu {}

/// Off-loading grace-period strategy: retired garbage is pushed onto a global backlog, and a
/// lazily spawned background thread waits out grace periods and disposes of batches.
pub struct ThreadedRcu;

static THREADED_DOMAIN: EpochDomain = EpochDomain::new();
thread_local! {
    static THREADED_LOCAL: RcuLocal = RcuLocal::register(&THREADED_DOMAIN);
}

struct BacklogNode {
    garbage: Retired,
    next: *mut BacklogNode,
}

/// Intrusive stack of garbage awaiting the background worker.
static BACKLOG: AtomicPtr<BacklogNode> = AtomicPtr::new(null_mut());

/// The number of backlog entries not yet disposed of.
static PENDING: AtomicUsize = AtomicUsize::new(0);

static WORKER: OnceLock<Option<thread::Thread>> = OnceLock::new();

/// Spawns the disposer thread on first use; `None` if the spawn failed.
fn worker() -> &'static Option<thread::Thread> {
    WORKER.get_or_init(|| {
        thread::Builder::new()
            .name("nbtree-rcu-disposer".into())
            .spawn(|| {
                THREADED_LOCAL.with(|local| loop {
                    let mut head = BACKLOG.swap(null_mut(), Acquire);
                    if head.is_null() {
                        thread::park_timeout(Duration::from_millis(10));
                        continue;
                    }
                    local.domain.advance(local.state(), 2);
                    let mut num_disposed = 0;
                    while let Some(node) = unsafe { head.as_mut() } {
                        let next = node.next;
                        drop(unsafe { Box::from_raw(head) });
                        head = next;
                        num_disposed += 1;
                    }
                    PENDING.fetch_sub(num_disposed, Release);
                })
            })
            .ok()
            .map(|handle| handle.thread().clone())
    })
}

impl Reclaimer for ThreadedRcu {
    type Section = RcuSection;

    #[inline]
    fn section() -> RcuSection {
        THREADED_LOCAL.with(RcuSection::open)
    }

    fn retire(garbage: Retired) {
        if let Some(disposer) = worker() {
            PENDING.fetch_add(1, Relaxed);
            let node = Box::into_raw(Box::new(BacklogNode {
                garbage,
                next: null_mut(),
            }));
            let mut head = BACKLOG.load(Relaxed);
            loop {
                unsafe {
                    (*node).next = head;
                }
                match BACKLOG.compare_exchange(head, node, Release, Relaxed) {
                    Ok(_) => break,
                    Err(actual) => head = actual,
                }
            }
            disposer.unpark();
        } else {
            // No worker available; fall back to buffering on the calling thread.
            THREADED_LOCAL.with(|local| {
                let state = local.state();
                if state.in_section() {
                    local.domain.defer(state, garbage);
                } else {
                    local.domain.enter(state);
                    local.domain.defer(state, garbage);
                    local.domain.exit(state);
                }
            });
        }
    }

    fn quiesce() {
        THREADED_LOCAL.with(|local| local.domain.advance(local.state(), 3));
        if let Some(disposer) = WORKER.get().and_then(Option::as_ref) {
            while PENDING.load(Acquire) != 0 {
                disposer.unpark();
                thread::yield_now();
            }
        }
    }
}

impl Rcu for ThreadedRcu {}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn tracked(counter: &Arc<AtomicUsize>) -> Retired {
        let observer = counter.clone();
        unsafe {
            Retired::from_raw(Box::into_raw(Box::new(0_u64)), move |_| {
                observer.fetch_add(1, Relaxed);
            })
        }
    }

    #[test]
    fn instant_rcu_disposes_synchronously() {
        let disposed = Arc::new(AtomicUsize::new(0));
        InstantRcu::retire(tracked(&disposed));
        assert_eq!(disposed.load(Relaxed), 1);
    }

    #[test]
    fn buffered_rcu_disposes_on_quiesce() {
        let disposed = Arc::new(AtomicUsize::new(0));
        {
            let _section = BufferedRcu::section();
            BufferedRcu::retire(tracked(&disposed));
        }
        BufferedRcu::quiesce();
        assert_eq!(disposed.load(Relaxed), 1);
    }

    #[test]
    fn threaded_rcu_drains_the_backlog() {
        let disposed = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            ThreadedRcu::retire(tracked(&disposed));
        }
        ThreadedRcu::quiesce();
        assert_eq!(disposed.load(Relaxed), 16);
    }

    #[test]
    fn sections_nest() {
        let outer = BufferedRcu::section();
        {
            let _inner = BufferedRcu::section();
        }
        drop(outer);
    }
}
