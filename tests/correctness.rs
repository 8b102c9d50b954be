#[cfg(test)]
mod tree_map_test {
    use proptest::prelude::*;
    use proptest::strategy::{Strategy, ValueTree};
    use proptest::test_runner::TestRunner;
    use rand::seq::SliceRandom;

    use nbtree::smr::{
        BufferedRcu, HazardPointer, InstantRcu, Reclaimer, ShardedHazardPointer, ThreadedRcu,
    };
    use nbtree::stat::{EventStat, ExactCounter, NoCounter};
    use nbtree::TreeMap;

    use std::collections::BTreeSet;
    use std::sync::atomic::Ordering::Relaxed;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;

    proptest! {
        #[test]
        fn basic(key in 0u64..10) {
            let treemap: TreeMap<u64, u32> = TreeMap::new();
            assert!(treemap.is_empty());

            assert!(treemap.insert(key, 0).is_ok());
            assert_eq!(treemap.insert(key, 1), Err((key, 1)));
            assert_eq!(treemap.read(&key, |_, v| *v), Some(0));
            assert!(treemap.contains(&key));
            assert!(!treemap.contains(&(key + 1)));

            assert_eq!(
                treemap.update(key + 1, || 10, |_, _, _| (), false),
                (false, false)
            );
            assert_eq!(
                treemap.update(key + 1, || 10, |inserted, _, _| assert!(inserted), true),
                (true, true)
            );
            assert_eq!(treemap.len(), 2);

            let mut removed = 0;
            assert!(treemap.remove_with(&key, |_, v| removed = *v));
            assert_eq!(removed, 0);
            assert!(!treemap.remove(&key));
            assert!(treemap.remove(&(key + 1)));
            assert!(treemap.is_empty());
        }
    }

    #[test]
    fn string_key() {
        let treemap: TreeMap<String, u32> = TreeMap::new();
        let mut checker = BTreeSet::new();
        let mut runner = TestRunner::default();
        let test_size = 4096;
        for i in 0..test_size {
            let prop_str = "[a-z]{1,16}".new_tree(&mut runner).unwrap();
            let str_val = prop_str.current();
            if treemap.insert(str_val.clone(), i).is_ok() {
                checker.insert((str_val, i));
            }
        }
        assert_eq!(treemap.len(), checker.len());
        for (key, value) in checker {
            // Lookup through the borrowed key form.
            assert_eq!(treemap.read(key.as_str(), |_, v| *v), Some(value));
            assert!(treemap.remove(key.as_str()));
        }
        assert!(treemap.is_empty());
    }

    fn disjoint_churn<R: Reclaimer>() {
        let num_threads = 4;
        let workload = 1024_u64;
        let treemap: Arc<TreeMap<u64, u64, R, ExactCounter, EventStat>> =
            Arc::new(TreeMap::new());
        let barrier = Arc::new(Barrier::new(num_threads));
        let mut handles = Vec::new();
        for thread_id in 0..num_threads as u64 {
            let treemap = treemap.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                let base = thread_id * workload;
                for key in base..base + workload {
                    assert!(treemap.insert(key, key.wrapping_mul(3)).is_ok());
                }
                for key in base..base + workload {
                    assert_eq!(treemap.read(&key, |_, v| *v), Some(key.wrapping_mul(3)));
                }
                for key in (base..base + workload).step_by(2) {
                    assert!(treemap.remove(&key));
                }
                treemap.force_dispose();
            }));
        }
        for handle in handles {
            assert!(handle.join().is_ok());
        }
        assert_eq!(treemap.len(), num_threads * workload as usize / 2);
        for key in (1..num_threads as u64 * workload).step_by(2) {
            assert!(treemap.contains(&key));
        }
        let stat = treemap.statistics();
        assert_eq!(stat.internal_node_created(), stat.internal_node_disposed() + treemap.len());
        assert_eq!(stat.update_desc_created(), stat.update_desc_disposed());
    }

    #[test]
    fn disjoint_churn_hp() {
        disjoint_churn::<HazardPointer>();
    }

    #[test]
    fn disjoint_churn_sharded_hp() {
        disjoint_churn::<ShardedHazardPointer>();
    }

    #[test]
    fn disjoint_churn_instant_rcu() {
        disjoint_churn::<InstantRcu>();
    }

    #[test]
    fn disjoint_churn_buffered_rcu() {
        disjoint_churn::<BufferedRcu>();
    }

    #[test]
    fn disjoint_churn_threaded_rcu() {
        disjoint_churn::<ThreadedRcu>();
    }

    fn contended_single_key<R: Reclaimer>() {
        let num_threads = 4;
        let rounds = 2048;
        let treemap: Arc<TreeMap<u64, u64, R, NoCounter>> = Arc::new(TreeMap::new());
        let barrier = Arc::new(Barrier::new(num_threads));
        let successes = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for thread_id in 0..num_threads as u64 {
            let treemap = treemap.clone();
            let barrier = barrier.clone();
            let successes = successes.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                for _ in 0..rounds {
                    if treemap.insert(7, thread_id).is_ok() {
                        successes.fetch_add(1, Relaxed);
                    }
                    if treemap.remove(&7) {
                        successes.fetch_add(1, Relaxed);
                    }
                }
            }));
        }
        for handle in handles {
            assert!(handle.join().is_ok());
        }
        // Every successful insert is paired with exactly one successful removal.
        if treemap.contains(&7) {
            assert!(treemap.remove(&7));
            successes.fetch_add(1, Relaxed);
        }
        assert_eq!(successes.load(Relaxed) % 2, 0);
        assert!(treemap.is_empty());
    }

    #[test]
    fn contended_single_key_hp() {
        contended_single_key::<HazardPointer>();
    }

    #[test]
    fn contended_single_key_buffered_rcu() {
        contended_single_key::<BufferedRcu>();
    }

    #[test]
    fn mixed_insert_remove_stays_consistent() {
        let num_threads = 4;
        let workload = 2048_u64;
        let treemap: Arc<TreeMap<u64, u64>> = Arc::new(TreeMap::new());
        let barrier = Arc::new(Barrier::new(num_threads));
        let mut handles = Vec::new();
        for thread_id in 0..num_threads as u64 {
            let treemap = treemap.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                for key in 0..workload {
                    if (key + thread_id) % 2 == 0 {
                        let _ = treemap.insert(key, thread_id);
                    } else {
                        let _ = treemap.remove(&key);
                    }
                }
            }));
        }
        for handle in handles {
            assert!(handle.join().is_ok());
        }
        let Ok(mut treemap) = Arc::try_unwrap(treemap) else {
            panic!("all threads joined");
        };
        assert!(treemap.check_consistency(|depth, violation| {
            panic!("{violation:?} at depth {depth}");
        }));
        // Entries that survived must be readable.
        let mut observed = 0;
        for key in 0..workload {
            if treemap.contains(&key) {
                observed += 1;
            }
        }
        assert_eq!(observed, treemap.len());
    }

    #[test]
    fn concurrent_extract_min_partitions_the_map() {
        let num_threads = 4;
        let workload = 4096_u64;
        let treemap: Arc<TreeMap<u64, u64, HazardPointer>> = Arc::new(TreeMap::new());
        for key in 0..workload {
            assert!(treemap.insert(key, key).is_ok());
        }
        let barrier = Arc::new(Barrier::new(num_threads));
        let extracted = Arc::new(Mutex::new(BTreeSet::new()));
        let mut handles = Vec::new();
        for _ in 0..num_threads {
            let treemap = treemap.clone();
            let barrier = barrier.clone();
            let extracted = extracted.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                let mut keys = Vec::new();
                let mut last: Option<u64> = None;
                while let Some(entry) = treemap.extract_min() {
                    let key = *entry.key();
                    // Each thread observes its own extractions in ascending order.
                    assert!(last.map_or(true, |previous| previous < key));
                    last = Some(key);
                    keys.push(key);
                    drop(entry);
                }
                let mut set = extracted.lock().unwrap();
                for key in keys {
                    // No entry is extracted twice.
                    assert!(set.insert(key));
                }
            }));
        }
        for handle in handles {
            assert!(handle.join().is_ok());
        }
        assert!(treemap.is_empty());
        assert_eq!(extracted.lock().unwrap().len(), workload as usize);
    }

    #[test]
    fn extract_handle_outlives_removal() {
        let treemap: TreeMap<u64, String, HazardPointer> = TreeMap::new();
        assert!(treemap.insert(1, "one".to_string()).is_ok());
        let extracted = treemap.extract(&1).unwrap();
        assert!(!treemap.contains(&1));
        // The same key can be reinserted while the handle pins the old entry.
        assert!(treemap.insert(1, "uno".to_string()).is_ok());
        assert_eq!(extracted.value(), "one");
        assert_eq!(*extracted, "one");
        drop(extracted);
        assert_eq!(treemap.read(&1, |_, v| v.clone()), Some("uno".to_string()));
    }

    #[test]
    fn peek_borrows_through_the_section() {
        let treemap: TreeMap<u64, u64, BufferedRcu> = TreeMap::new();
        for key in 0..64 {
            assert!(treemap.insert(key, key + 100).is_ok());
        }
        let section = BufferedRcu::section();
        let first = treemap.peek(&3, &section);
        let second = treemap.peek(&4, &section);
        assert_eq!(first, Some((&3, &103)));
        assert_eq!(second, Some((&4, &104)));
        assert_eq!(treemap.peek(&64, &section), None);
        drop(section);
    }

    #[test]
    fn shuffled_inserts_drain_in_key_order() {
        let workload = 1024_u64;
        let mut keys: Vec<u64> = (0..workload).collect();
        keys.shuffle(&mut rand::rng());
        let treemap: TreeMap<u64, u64> = TreeMap::new();
        for &key in &keys {
            assert!(treemap.insert(key, key.wrapping_mul(7)).is_ok());
        }
        // Insertion order must not leak into the extraction order.
        let mut expected = 0;
        while let Some(entry) = treemap.extract_min() {
            assert_eq!(*entry.key(), expected);
            assert_eq!(*entry.value(), expected.wrapping_mul(7));
            expected += 1;
        }
        assert_eq!(expected, workload);
    }

    #[test]
    fn extract_max_drains_in_descending_order() {
        let treemap: TreeMap<u64, u64, ThreadedRcu> = TreeMap::new();
        for key in 0..512 {
            assert!(treemap.insert(key, key).is_ok());
        }
        let mut expected = 511;
        while let Some(entry) = treemap.extract_max() {
            assert_eq!(*entry.key(), expected);
            expected = expected.wrapping_sub(1);
        }
        assert!(treemap.is_empty());
        assert_eq!(expected, u64::MAX);
    }

    #[test]
    fn clear_under_concurrent_inserts() {
        let treemap: Arc<TreeMap<u64, u64>> = Arc::new(TreeMap::new());
        let barrier = Arc::new(Barrier::new(2));
        let inserter = {
            let treemap = treemap.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for key in 0..4096_u64 {
                    let _ = treemap.insert(key, key);
                }
            })
        };
        barrier.wait();
        for _ in 0..16 {
            treemap.clear();
        }
        assert!(inserter.join().is_ok());
        treemap.clear();
        assert!(treemap.is_empty());
        assert_eq!(treemap.len(), 0);
    }
}
