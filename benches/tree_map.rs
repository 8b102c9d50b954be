use criterion::{criterion_group, criterion_main, Criterion};

use nbtree::smr::{BufferedRcu, HazardPointer};
use nbtree::TreeMap;

fn read_hp(c: &mut Criterion) {
    let treemap: TreeMap<usize, usize, HazardPointer> = TreeMap::new();
    assert!(treemap.insert(1, 1).is_ok());
    c.bench_function("TreeMap<HazardPointer>: read", |b| {
        b.iter(|| {
            treemap.read(&1, |_, v| assert_eq!(*v, 1));
        })
    });
}

fn read_rcu(c: &mut Criterion) {
    let treemap: TreeMap<usize, usize, BufferedRcu> = TreeMap::new();
    assert!(treemap.insert(1, 1).is_ok());
    c.bench_function("TreeMap<BufferedRcu>: read", |b| {
        b.iter(|| {
            treemap.read(&1, |_, v| assert_eq!(*v, 1));
        })
    });
}

fn insert_remove(c: &mut Criterion) {
    let treemap: TreeMap<usize, usize, BufferedRcu> = TreeMap::new();
    let mut key = 0;
    c.bench_function("TreeMap<BufferedRcu>: insert-remove", |b| {
        b.iter(|| {
            key += 1;
            assert!(treemap.insert(key, key).is_ok());
            assert!(treemap.remove(&key));
        })
    });
}

criterion_group!(tree_map, read_hp, read_rcu, insert_remove);
criterion_main!(tree_map);
