//! Hazard-pointer reclamation.

use super::tag;
use super::{Reclaimer, Retired, Section, SECTION_SLOTS};

use std::array;
use std::cell::RefCell;
use std::mem::take;
use std::ptr::null_mut;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release, SeqCst};
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU8, AtomicUsize};
use std::sync::Mutex;
use std::thread;

/// The number of sections a thread may hold open at once.
const SLOT_BLOCKS: usize = 8;

/// Published slots per thread record: one block of [`SECTION_SLOTS`] per section.
const RECORD_SLOTS: usize = SLOT_BLOCKS * SECTION_SLOTS;

/// Retired entries accumulated thread-locally before a scan.
const RETIRE_THRESHOLD: usize = 64;

/// A per-thread block of published hazard slots.
///
/// Records are pushed onto a registry shard once and reused across threads: a terminating
/// thread clears its slots and drops ownership instead of unlinking the record.
struct HazardRecord {
    slots: [AtomicUsize; RECORD_SLOTS],
    /// Bit per slot block leased to a live section; touched only by the owning thread.
    lease_mask: AtomicU8,
    owned: AtomicBool,
    next: AtomicPtr<HazardRecord>,
}

impl HazardRecord {
    fn new() -> Self {
        Self {
            slots: array::from_fn(|_| AtomicUsize::new(0)),
            lease_mask: AtomicU8::new(0),
            owned: AtomicBool::new(true),
            next: AtomicPtr::new(null_mut()),
        }
    }
}

struct Shard {
    head: AtomicPtr<HazardRecord>,
    /// Garbage left behind by terminated threads, adopted by the next scanning thread.
    orphans: Mutex<Vec<Retired>>,
}

/// A process-wide hazard-pointer domain, partitioned into `SHARDS` registry shards to spread
/// registration and orphan contention.
struct HazardDomain<const SHARDS: usize> {
    shards: [Shard; SHARDS],
    registrations: AtomicUsize,
}

impl<const SHARDS: usize> HazardDomain<SHARDS> {
    const fn new() -> Self {
        const SHARD: Shard = Shard {
            head: AtomicPtr::new(null_mut()),
            orphans: Mutex::new(Vec::new()),
        };
        Self {
            shards: [SHARD; SHARDS],
            registrations: AtomicUsize::new(0),
        }
    }

    /// Claims a dormant record in the assigned shard, or links a new one.
    fn register(&'static self) -> (usize, *mut HazardRecord) {
        let shard_index = self.registrations.fetch_add(1, Relaxed) % SHARDS;
        let shard = &self.shards[shard_index];
        let mut record_ptr = shard.head.load(Acquire);
        while let Some(record) = unsafe { record_ptr.as_ref() } {
            if record
                .owned
                .compare_exchange(false, true, Acquire, Relaxed)
                .is_ok()
            {
                return (shard_index, record_ptr);
            }
            record_ptr = record.next.load(Acquire);
        }
        let ptr = Box::into_raw(Box::new(HazardRecord::new()));
        let mut head = shard.head.load(Relaxed);
        loop {
            unsafe { &*ptr }.next.store(head, Relaxed);
            match shard.head.compare_exchange(head, ptr, Release, Relaxed) {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
        (shard_index, ptr)
    }

    /// Snapshots every published slot in the domain, sorted for binary search.
    fn collect_hazards(&self) -> Vec<usize> {
        fence(SeqCst);
        let mut hazards = Vec::with_capacity(RECORD_SLOTS);
        for shard in &self.shards {
            let mut record_ptr = shard.head.load(Acquire);
            while let Some(record) = unsafe { record_ptr.as_ref() } {
                for slot in &record.slots {
                    let address = slot.load(SeqCst);
                    if address != 0 {
                        hazards.push(address);
                    }
                }
                record_ptr = record.next.load(Acquire);
            }
        }
        hazards.sort_unstable();
        hazards
    }

    /// Moves a shard's orphaned garbage into `retired`.
    fn adopt_orphans(&self, shard_index: usize, retired: &mut Vec<Retired>) {
        if let Ok(mut orphans) = self.shards[shard_index].orphans.lock() {
            retired.append(&mut orphans);
        }
    }

    /// Parks garbage that outlived its thread.
    fn orphan(&self, shard_index: usize, mut garbage: Vec<Retired>) {
        if let Ok(mut orphans) = self.shards[shard_index].orphans.lock() {
            orphans.append(&mut garbage);
        }
    }
}

/// Thread-local handle on a [`HazardDomain`].
struct HpLocal<const SHARDS: usize> {
    domain: &'static HazardDomain<SHARDS>,
    record: *mut HazardRecord,
    shard: usize,
    retired: RefCell<Vec<Retired>>,
}

impl<const SHARDS: usize> HpLocal<SHARDS> {
    fn register(domain: &'static HazardDomain<SHARDS>) -> Self {
        let (shard, record) = domain.register();
        Self {
            domain,
            record,
            shard,
            retired: RefCell::new(Vec::new()),
        }
    }

    /// Leases the next free slot block to a new section.
    fn section(&self) -> HazardSection {
        let record = unsafe { &*self.record };
        let mask = record.lease_mask.load(Relaxed);
        let block = (!mask).trailing_zeros() as usize;
        assert!(
            block < SLOT_BLOCKS,
            "a thread cannot hold more than {SLOT_BLOCKS} sections at once",
        );
        record.lease_mask.store(mask | (1 << block), Relaxed);
        HazardSection {
            record: self.record,
            base: block * SECTION_SLOTS,
        }
    }

    fn retire(&self, garbage: Retired) {
        let mut retired = self.retired.borrow_mut();
        retired.push(garbage);
        if retired.len() >= RETIRE_THRESHOLD {
            self.domain.adopt_orphans(self.shard, &mut retired);
            Self::scan(self.domain, &mut retired);
        }
    }

    fn quiesce(&self) {
        let mut retired = self.retired.borrow_mut();
        loop {
            for shard_index in 0..SHARDS {
                self.domain.adopt_orphans(shard_index, &mut retired);
            }
            Self::scan(self.domain, &mut retired);
            if retired.is_empty() {
                return;
            }
            thread::yield_now();
        }
    }

    /// Disposes of every retired entry whose address is not published anywhere.
    fn scan(domain: &HazardDomain<SHARDS>, retired: &mut Vec<Retired>) {
        let hazards = domain.collect_hazards();
        retired.retain(|garbage| hazards.binary_search(&garbage.address()).is_ok());
    }
}

impl<const SHARDS: usize> Drop for HpLocal<SHARDS> {
    fn drop(&mut self) {
        let mut retired = take(self.retired.get_mut());
        self.domain.adopt_orphans(self.shard, &mut retired);
        Self::scan(self.domain, &mut retired);
        if !retired.is_empty() {
            self.domain.orphan(self.shard, retired);
        }
        let record = unsafe { &*self.record };
        for slot in &record.slots {
            slot.store(0, Relaxed);
        }
        record.lease_mask.store(0, Relaxed);
        record.owned.store(false, Release);
    }
}

/// A hazard-pointer section: a leased block of [`SECTION_SLOTS`] published slots.
///
/// Only addresses published through [`protect`](Section::protect) or
/// [`protect_addr`](Section::protect_addr) are shielded from disposal; everything else may be
/// reclaimed at any time.
pub struct HazardSection {
    record: *mut HazardRecord,
    base: usize,
}

impl HazardSection {
    fn slot(&self, index: usize) -> &AtomicUsize {
        debug_assert!(index < SECTION_SLOTS);
        unsafe { &(*self.record).slots[self.base + index] }
    }
}

impl Section for HazardSection {
    fn protect<T>(&self, index: usize, src: &AtomicPtr<T>) -> *mut T {
        let slot = self.slot(index);
        let mut ptr = src.load(Acquire);
        loop {
            slot.store(tag::untag(ptr) as usize, SeqCst);
            let verified = src.load(SeqCst);
            if verified == ptr {
                return ptr;
            }
            ptr = verified;
        }
    }

    #[inline]
    fn protect_addr<T>(&self, index: usize, ptr: *mut T) {
        self.slot(index).store(tag::untag(ptr) as usize, SeqCst);
    }

    #[inline]
    fn copy(&self, from: usize, to: usize) {
        let address = self.slot(from).load(Relaxed);
        self.slot(to).store(address, SeqCst);
    }

    #[inline]
    fn clear(&self, index: usize) {
        self.slot(index).store(0, Release);
    }
}

impl Drop for HazardSection {
    fn drop(&mut self) {
        let record = unsafe { &*self.record };
        for index in 0..SECTION_SLOTS {
            record.slots[self.base + index].store(0, Release);
        }
        let block = self.base / SECTION_SLOTS;
        let mask = record.lease_mask.load(Relaxed);
        record.lease_mask.store(mask & !(1 << block), Relaxed);
    }
}

/// Hazard-pointer reclamation with a single registry shard.
pub struct HazardPointer;

static HP_DOMAIN: HazardDomain<1> = HazardDomain::new();
thread_local! {
    static HP_LOCAL: HpLocal<1> = HpLocal::register(&HP_DOMAIN);
}

impl Reclaimer for HazardPointer {
    type Section = HazardSection;

    #[inline]
    fn section() -> HazardSection {
        HP_LOCAL.with(HpLocal::section)
    }

    #[inline]
    fn retire(garbage: Retired) {
        HP_LOCAL.with(|local| local.retire(garbage));
    }

    fn quiesce() {
        HP_LOCAL.with(HpLocal::quiesce);
    }
}

/// Hazard-pointer reclamation with the registry and orphan lists partitioned into eight
/// shards, for workloads with many short-lived threads.
pub struct ShardedHazardPointer;

static SHARDED_HP_DOMAIN: HazardDomain<8> = HazardDomain::new();
thread_local! {
    static SHARDED_HP_LOCAL: HpLocal<8> = HpLocal::register(&SHARDED_HP_DOMAIN);
}

impl Reclaimer for ShardedHazardPointer {
    type Section = HazardSection;

    #[inline]
    fn section() -> HazardSection {
        SHARDED_HP_LOCAL.with(HpLocal::section)
    }

    #[inline]
    fn retire(garbage: Retired) {
        SHARDED_HP_LOCAL.with(|local| local.retire(garbage));
    }

    fn quiesce() {
        SHARDED_HP_LOCAL.with(HpLocal::quiesce);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn tracked(counter: &Arc<AtomicUsize>) -> (*mut u64, Retired) {
        let observer = counter.clone();
        let ptr = Box::into_raw(Box::new(11_u64));
        let retired = unsafe {
            Retired::from_raw(ptr, move |_| {
                observer.fetch_add(1, Relaxed);
            })
        };
        (ptr, retired)
    }

    #[test]
    fn published_slot_delays_disposal() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let (ptr, retired) = tracked(&disposed);
        let section = HazardPointer::section();
        let src = AtomicPtr::new(ptr);
        assert_eq!(section.protect(0, &src), ptr);

        HazardPointer::retire(retired);
        HP_LOCAL.with(|local| {
            let mut retired = local.retired.borrow_mut();
            HpLocal::scan(local.domain, &mut retired);
        });
        assert_eq!(disposed.load(Relaxed), 0);

        drop(section);
        HazardPointer::quiesce();
        assert_eq!(disposed.load(Relaxed), 1);
    }

    #[test]
    fn sections_lease_distinct_blocks() {
        let first = ShardedHazardPointer::section();
        let second = ShardedHazardPointer::section();
        assert_ne!(first.base, second.base);
        drop(first);
        let third = ShardedHazardPointer::section();
        assert_eq!(third.base, 0);
        drop(second);
        drop(third);
    }

    #[test]
    fn protect_rereads_until_stable() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let (ptr, retired) = tracked(&disposed);
        let section = HazardPointer::section();
        let src = AtomicPtr::new(ptr);
        let protected = section.protect(3, &src);
        section.copy(3, 4);
        section.clear(3);
        // Slot 4 still shields the allocation.
        assert_eq!(protected, ptr);
        HazardPointer::retire(retired);
        drop(section);
        HazardPointer::quiesce();
        assert_eq!(disposed.load(Relaxed), 1);
    }
}
