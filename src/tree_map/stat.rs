//! Internal event statistics and item counting policies.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;

/// Observer of internal [`TreeMap`](super::TreeMap) events.
///
/// Every hook has an empty default body, so a policy only overrides what it records.
pub trait Stat: Default + Send + Sync + 'static {
    fn on_insert_success(&self) {}
    fn on_insert_failed(&self) {}
    fn on_insert_retry(&self) {}
    fn on_update_existing(&self) {}
    fn on_update_new(&self) {}
    fn on_update_retry(&self) {}
    fn on_remove_success(&self) {}
    fn on_remove_failed(&self) {}
    fn on_remove_retry(&self) {}
    fn on_find_success(&self) {}
    fn on_find_failed(&self) {}
    fn on_extract_min_success(&self) {}
    fn on_extract_min_failed(&self) {}
    fn on_extract_max_success(&self) {}
    fn on_extract_max_failed(&self) {}
    fn on_search_retry(&self) {}
    fn on_help_insert(&self) {}
    fn on_help_delete(&self) {}
    fn on_help_mark(&self) {}
    fn on_internal_node_created(&self) {}
    fn on_internal_node_disposed(&self) {}
    fn on_update_desc_created(&self) {}
    fn on_update_desc_disposed(&self) {}
}

/// Statistics policy that records nothing.
#[derive(Debug, Default)]
pub struct NoStat;

impl Stat for NoStat {}

/// Statistics policy backed by relaxed atomic counters.
#[derive(Debug, Default)]
pub struct EventStat {
    insert_success: AtomicUsize,
    insert_failed: AtomicUsize,
    insert_retry: AtomicUsize,
    update_existing: AtomicUsize,
    update_new: AtomicUsize,
    update_retry: AtomicUsize,
    remove_success: AtomicUsize,
    remove_failed: AtomicUsize,
    remove_retry: AtomicUsize,
    find_success: AtomicUsize,
    find_failed: AtomicUsize,
    extract_min_success: AtomicUsize,
    extract_min_failed: AtomicUsize,
    extract_max_success: AtomicUsize,
    extract_max_failed: AtomicUsize,
    search_retry: AtomicUsize,
    help_insert: AtomicUsize,
    help_delete: AtomicUsize,
    help_mark: AtomicUsize,
    internal_node_created: AtomicUsize,
    internal_node_disposed: AtomicUsize,
    update_desc_created: AtomicUsize,
    update_desc_disposed: AtomicUsize,
}

macro_rules! counters {
    ($(($hook:ident, $getter:ident, $field:ident),)*) => {
        impl Stat for EventStat {
            $(
                #[inline]
                fn $hook(&self) {
                    self.$field.fetch_add(1, Relaxed);
                }
            )*
        }

        impl EventStat {
            $(
                #[must_use]
                pub fn $getter(&self) -> usize {
                    self.$field.load(Relaxed)
                }
            )*
        }
    };
}

counters!(
    (on_insert_success, insert_success, insert_success),
    (on_insert_failed, insert_failed, insert_failed),
    (on_insert_retry, insert_retry, insert_retry),
    (on_update_existing, update_existing, update_existing),
    (on_update_new, update_new, update_new),
    (on_update_retry, update_retry, update_retry),
    (on_remove_success, remove_success, remove_success),
    (on_remove_failed, remove_failed, remove_failed),
    (on_remove_retry, remove_retry, remove_retry),
    (on_find_success, find_success, find_success),
    (on_find_failed, find_failed, find_failed),
    (on_extract_min_success, extract_min_success, extract_min_success),
    (on_extract_min_failed, extract_min_failed, extract_min_failed),
    (on_extract_max_success, extract_max_success, extract_max_success),
    (on_extract_max_failed, extract_max_failed, extract_max_failed),
    (on_search_retry, search_retry, search_retry),
    (on_help_insert, help_insert, help_insert),
    (on_help_delete, help_delete, help_delete),
    (on_help_mark, help_mark, help_mark),
    (on_internal_node_created, internal_node_created, internal_node_created),
    (on_internal_node_disposed, internal_node_disposed, internal_node_disposed),
    (on_update_desc_created, update_desc_created, update_desc_created),
    (on_update_desc_disposed, update_desc_disposed, update_desc_disposed),
);

/// Item counting policy.
pub trait ItemCount: Default + Send + Sync + 'static {
    fn inc(&self);
    fn dec(&self);
    fn get(&self) -> usize;
}

/// Exact atomic item counter.
#[derive(Debug, Default)]
pub struct ExactCounter(AtomicUsize);

impl ItemCount for ExactCounter {
    #[inline]
    fn inc(&self) {
        self.0.fetch_add(1, Relaxed);
    }

    #[inline]
    fn dec(&self) {
        self.0.fetch_sub(1, Relaxed);
    }

    #[inline]
    fn get(&self) -> usize {
        self.0.load(Relaxed)
    }
}

/// Item counting policy that counts nothing; `len()` is always zero.
#[derive(Debug, Default)]
pub struct NoCounter;

impl ItemCount for NoCounter {
    #[inline]
    fn inc(&self) {}

    #[inline]
    fn dec(&self) {}

    #[inline]
    fn get(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn event_stat_counts() {
        let stat = EventStat::default();
        stat.on_insert_success();
        stat.on_insert_success();
        stat.on_help_delete();
        assert_eq!(stat.insert_success(), 2);
        assert_eq!(stat.help_delete(), 1);
        assert_eq!(stat.remove_success(), 0);
    }

    #[test]
    fn counters() {
        let exact = ExactCounter::default();
        exact.inc();
        exact.inc();
        exact.dec();
        assert_eq!(exact.get(), 1);

        let none = NoCounter;
        none.inc();
        assert_eq!(none.get(), 0);
    }
}
