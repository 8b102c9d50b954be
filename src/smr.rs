//! Safe memory reclamation.
//!
//! Readers of a lock-free structure traverse nodes that a concurrent writer may unlink at any
//! moment. A [`Reclaimer`] decides when an unlinked node has become unreachable from every
//! thread and only then runs its disposer. Two families are provided: hazard pointers
//! ([`HazardPointer`], [`ShardedHazardPointer`]) where readers publish the exact addresses they
//! dereference, and epoch-based RCU ([`InstantRcu`], [`BufferedRcu`], [`ThreadedRcu`]) where a
//! read-section blankets everything loaded inside it.

mod epoch;
mod hazard;
mod rcu;
pub(crate) mod tag;

pub use hazard::{HazardPointer, HazardSection, ShardedHazardPointer};
pub use rcu::{BufferedRcu, InstantRcu, RcuSection, ThreadedRcu};

use std::sync::atomic::AtomicPtr;

/// The number of guard slots a [`Section`] provides.
pub const SECTION_SLOTS: usize = 8;

/// An allocation handed over to a [`Reclaimer`], disposed of after the grace period.
///
/// A [`Retired`] owns the allocation: dropping it runs the dispose closure immediately, so it
/// must only be dropped once the reclaimer has proved the allocation unreachable.
pub struct Retired {
    addr: *mut u8,
    dispose: Option<Box<dyn FnOnce()>>,
}

// The dispose closure is only invoked once, by whichever thread ends the grace period; the
// constructors require the closure itself to be `Send`.
unsafe impl Send for Retired {}

impl Retired {
    /// Retires a boxed instance; disposal drops the box.
    #[inline]
    #[must_use]
    pub fn new<T: Send + 'static>(boxed: Box<T>) -> Self {
        let ptr = Box::into_raw(boxed);
        Self {
            addr: ptr.cast(),
            dispose: Some(Box::new(move || unsafe {
                drop(Box::from_raw(ptr));
            })),
        }
    }

    /// Retires a raw allocation with a custom dispose step.
    ///
    /// # Safety
    ///
    /// `ptr` must own the allocation, and no thread may create a new reference to it after the
    /// current grace period ends.
    #[inline]
    #[must_use]
    pub unsafe fn from_raw<T, F>(ptr: *mut T, dispose: F) -> Self
    where
        T: 'static,
        F: FnOnce(Box<T>) + Send + 'static,
    {
        Self {
            addr: ptr.cast(),
            dispose: Some(Box::new(move || dispose(Box::from_raw(ptr)))),
        }
    }

    /// The address of the retired allocation, compared against published hazard slots.
    #[inline]
    pub(crate) fn address(&self) -> usize {
        self.addr as usize
    }
}

impl Drop for Retired {
    #[inline]
    fn drop(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

/// A reclamation strategy.
///
/// The type is zero-sized; all state lives in per-thread records registered with a global
/// domain. Every strategy provides the same three capabilities: opening a [`Section`],
/// [`retire`](Self::retire)-ing unlinked allocations, and [`quiesce`](Self::quiesce)-ing until
/// everything previously retired by the calling thread has been disposed of.
pub trait Reclaimer: 'static {
    /// The per-thread protection scope.
    type Section: Section;

    /// Opens a protection scope on the current thread. Sections may nest.
    fn section() -> Self::Section;

    /// Hands an unlinked allocation over for deferred disposal.
    fn retire(garbage: Retired);

    /// Blocks until all garbage retired by the calling thread has been disposed of.
    ///
    /// Must not be called inside an open [`Section`] on the same thread.
    fn quiesce();
}

/// A protection scope with [`SECTION_SLOTS`] guard slots.
///
/// Hazard pointers publish the address written into a slot; RCU sections protect everything
/// loaded while the section is open, and the slot operations are free.
pub trait Section {
    /// Loads a pointer from `src` and protects it in slot `index`.
    ///
    /// The returned pointer is safe to dereference (tag bits aside) until the slot is
    /// overwritten or the section is dropped.
    fn protect<T>(&self, index: usize, src: &AtomicPtr<T>) -> *mut T;

    /// Publishes a known address in slot `index` without re-reading it.
    ///
    /// The caller must re-validate that the address is still reachable after publication
    /// before dereferencing it.
    fn protect_addr<T>(&self, index: usize, ptr: *mut T);

    /// Copies the protection of slot `from` into slot `to`.
    fn copy(&self, from: usize, to: usize);

    /// Clears slot `index`.
    fn clear(&self, index: usize);
}

/// Marker for reclaimers whose [`Section`] protects every pointer loaded through it for the
/// whole section lifetime, which makes borrowing out of the structure sound.
pub trait Rcu: Reclaimer {}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
    use std::sync::Arc;

    #[test]
    fn retired_disposes_once_on_drop() {
        let counter = Arc::new(AtomicUsize::new(0));
        let observer = counter.clone();
        let retired = Retired::new(Box::new(observer));
        assert_ne!(retired.address(), 0);
        drop(retired);
        assert_eq!(Arc::strong_count(&counter), 1);

        let flagged = counter.clone();
        let retired = unsafe {
            Retired::from_raw(Box::into_raw(Box::new(7_u64)), move |boxed| {
                flagged.fetch_add(*boxed as usize, Relaxed);
            })
        };
        drop(retired);
        assert_eq!(counter.load(Relaxed), 7);
    }
}
