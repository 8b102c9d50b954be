//! [`TreeMap`] is a lock-free concurrent ordered map.

mod desc;
mod node;
pub mod stat;

use self::desc::{DeleteInfo, InsertInfo, OpInfo, UpdateDesc, CLEAN, DFLAG, IFLAG, MARK};
use self::node::{cmp_key, Bound, InternalNode, LeafNode, Node};
use self::stat::{ExactCounter, ItemCount, NoStat, Stat};
use crate::pool::Pool;
use crate::smr::{tag, BufferedRcu, Rcu, Reclaimer, Retired, Section};

use equivalent::Comparable;

use std::cmp::Ordering::{Equal, Greater, Less};
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::null_mut;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release, SeqCst};
use std::sync::Arc;
use std::thread;

/// Guard slot layout of a [`Section`] during tree operations.
const GUARD_GRANDPARENT: usize = 0;
const GUARD_PARENT: usize = 1;
const GUARD_LEAF: usize = 2;
const GUARD_UPD_GRANDPARENT: usize = 3;
const GUARD_UPD_PARENT: usize = 4;
const GUARD_DESC: usize = 5;
const GUARD_SIBLING: usize = 6;
const GUARD_EXTRA: usize = 7;

/// Scalable concurrent ordered map based on a leaf-oriented binary search tree.
///
/// [`TreeMap`] never blocks: every structural change publishes an update descriptor before it
/// takes effect, and any thread observing a half-done change finishes it instead of waiting.
/// Memory is reclaimed through the pluggable `R` strategy; unlinked nodes and descriptors are
/// recycled through lock-free pools once their grace period has elapsed.
///
/// Routing keys are compared through [`Comparable`], so any borrowed form of the key type can
/// be used for lookups and removals.
///
/// ### Locking behavior
///
/// All operations are lock-free; an interrupted thread cannot prevent others from making
/// progress, though it can force them onto retry paths.
///
/// ### Unwind safety
///
/// [`TreeMap`] is impervious to out-of-memory errors on retry paths, but a panicking
/// user-supplied closure can leave a read-section open on the current thread.
pub struct TreeMap<K, V, R = BufferedRcu, C = ExactCounter, S = NoStat>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Send + Sync,
    R: Reclaimer,
    C: ItemCount,
    S: Stat,
{
    /// The root internal node, keyed with the second infinity sentinel.
    root: Box<Node<K, V>>,
    sentinel1: Box<Node<K, V>>,
    sentinel2: Box<Node<K, V>>,
    /// Recycled node allocations; shared with retire closures so disposal may outlive `self`.
    node_pool: Arc<Pool<Node<K, V>>>,
    desc_pool: Arc<Pool<UpdateDesc<K, V>>>,
    count: C,
    stat: S,
    reclaimer: PhantomData<fn() -> R>,
}

/// The outcome of a traversal: the located leaf, its parent and grandparent, and the update
/// field values observed while passing through them.
struct SearchResult<K, V> {
    grandparent: *mut Node<K, V>,
    parent: *mut Node<K, V>,
    leaf: *mut Node<K, V>,
    upd_grandparent: *mut UpdateDesc<K, V>,
    upd_parent: *mut UpdateDesc<K, V>,
    right_parent: bool,
    right_leaf: bool,
}

impl<K, V> SearchResult<K, V> {
    fn empty() -> Self {
        Self {
            grandparent: null_mut(),
            parent: null_mut(),
            leaf: null_mut(),
            upd_grandparent: null_mut(),
            upd_parent: null_mut(),
            right_parent: false,
            right_leaf: false,
        }
    }
}

/// An entry removed from a [`TreeMap`], still readable through the section it owns.
///
/// The underlying leaf is not disposed of while the handle is alive. The handle stays on the
/// thread that produced it.
pub struct Extracted<K, V, R: Reclaimer> {
    leaf: *mut Node<K, V>,
    _section: R::Section,
}

impl<K, V, R: Reclaimer> Extracted<K, V, R> {
    /// Returns the key of the extracted entry.
    #[must_use]
    pub fn key(&self) -> &K {
        match unsafe { &*self.leaf } {
            Node::Leaf(LeafNode {
                key: Bound::Finite(key),
                ..
            }) => key,
            _ => unreachable!(),
        }
    }

    /// Returns the value of the extracted entry.
    #[must_use]
    pub fn value(&self) -> &V {
        match unsafe { &*self.leaf } {
            Node::Leaf(LeafNode {
                value: Some(value), ..
            }) => value,
            _ => unreachable!(),
        }
    }
}

impl<K, V, R: Reclaimer> Deref for Extracted<K, V, R> {
    type Target = V;

    fn deref(&self) -> &V {
        self.value()
    }
}

/// An ordering violation found by [`TreeMap::check_consistency`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConsistencyViolation {
    /// A left child does not order strictly below its parent's routing key.
    LeftSubtreeOrder,
    /// A right child orders below its parent's routing key.
    RightSubtreeOrder,
}

impl<K, V, R, C, S> TreeMap<K, V, R, C, S>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Send + Sync,
    R: Reclaimer,
    C: ItemCount,
    S: Stat,
{
    /// Creates an empty [`TreeMap`] with default pool capacities.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbtree::TreeMap;
    ///
    /// let treemap: TreeMap<u64, u32> = TreeMap::new();
    /// assert!(treemap.is_empty());
    /// ```
    #[must_use]
    pub fn new() -> Self {
        Self::with_pool_capacity(256, 256)
    }

    /// Creates an empty [`TreeMap`] retaining up to the given numbers of recycled node and
    /// descriptor allocations.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbtree::TreeMap;
    ///
    /// let treemap: TreeMap<u64, u32> = TreeMap::with_pool_capacity(1024, 128);
    /// assert!(treemap.is_empty());
    /// ```
    #[must_use]
    pub fn with_pool_capacity(node_capacity: usize, desc_capacity: usize) -> Self {
        let sentinel1 = Box::new(Node::Leaf(LeafNode::sentinel(Bound::PosInf1)));
        let sentinel2 = Box::new(Node::Leaf(LeafNode::sentinel(Bound::PosInf2)));
        let root_internal: InternalNode<K, V> = InternalNode::new(Bound::PosInf2);
        root_internal
            .left
            .store((&*sentinel1 as *const Node<K, V>).cast_mut(), Relaxed);
        root_internal
            .right
            .store((&*sentinel2 as *const Node<K, V>).cast_mut(), Relaxed);
        Self {
            root: Box::new(Node::Internal(root_internal)),
            sentinel1,
            sentinel2,
            node_pool: Arc::new(Pool::with_capacity(node_capacity)),
            desc_pool: Arc::new(Pool::with_capacity(desc_capacity)),
            count: C::default(),
            stat: S::default(),
            reclaimer: PhantomData,
        }
    }

    /// Inserts a key-value pair.
    ///
    /// Returns an error along with the supplied key-value pair if the key exists.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbtree::TreeMap;
    ///
    /// let treemap: TreeMap<u64, u32> = TreeMap::new();
    ///
    /// assert!(treemap.insert(1, 10).is_ok());
    /// assert_eq!(treemap.insert(1, 11), Err((1, 11)));
    /// ```
    #[inline]
    pub fn insert(&self, key: K, value: V) -> Result<(), (K, V)> {
        self.insert_with(key, value, |_, _| ())
    }

    /// Inserts a key-value pair and passes the linked entry to `f` before returning.
    ///
    /// The closure observes the entry while it is protected, so a concurrent removal cannot
    /// invalidate the references.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbtree::TreeMap;
    ///
    /// let treemap: TreeMap<u64, u32> = TreeMap::new();
    ///
    /// let mut inserted = 0;
    /// assert!(treemap.insert_with(1, 10, |_, v| inserted = *v).is_ok());
    /// assert_eq!(inserted, 10);
    /// ```
    pub fn insert_with<F: FnOnce(&K, &V)>(&self, key: K, value: V, f: F) -> Result<(), (K, V)> {
        let section = R::section();
        let mut result = SearchResult::empty();
        let mut f = Some(f);
        let new_leaf = self.alloc_leaf(key, value);
        let mut new_internal: *mut Node<K, V> = null_mut();
        loop {
            let key_ref = match unsafe { &*new_leaf }.key() {
                Bound::Finite(key) => key,
                _ => unreachable!(),
            };
            if self.search(key_ref, &section, &mut result) {
                self.stat.on_insert_failed();
                if !new_internal.is_null() {
                    self.release_node(new_internal);
                }
                let node = unsafe { Box::from_raw(new_leaf) };
                let Node::Leaf(leaf) = *node else { unreachable!() };
                let (Bound::Finite(key), Some(value)) = (leaf.key, leaf.value) else {
                    unreachable!()
                };
                return Err((key, value));
            }
            if tag::tag(result.upd_parent) == CLEAN {
                if new_internal.is_null() {
                    new_internal = self.alloc_internal();
                }
                // The new leaf is visible to removers the instant it is linked; shield it
                // for the functor before committing.
                section.protect_addr(GUARD_EXTRA, new_leaf);
                if self.try_insert(new_leaf, new_internal, &result, &section) {
                    if let Some(f) = f.take() {
                        if let Node::Leaf(LeafNode {
                            key: Bound::Finite(key),
                            value: Some(value),
                            ..
                        }) = unsafe { &*new_leaf }
                        {
                            f(key, value);
                        }
                    }
                    section.clear(GUARD_EXTRA);
                    self.count.inc();
                    self.stat.on_insert_success();
                    return Ok(());
                }
                section.clear(GUARD_EXTRA);
            } else {
                self.help(result.upd_parent);
            }
            self.stat.on_insert_retry();
            thread::yield_now();
        }
    }

    /// Updates the entry for `key`, or inserts `make_value()` when absent and `allow_insert`
    /// is set.
    ///
    /// `f` observes the affected entry; its first argument is `true` when the entry was newly
    /// inserted. Returns `(updated_or_inserted, inserted)`.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbtree::TreeMap;
    /// use std::sync::atomic::AtomicU32;
    /// use std::sync::atomic::Ordering::Relaxed;
    ///
    /// let treemap: TreeMap<u64, AtomicU32> = TreeMap::new();
    ///
    /// assert_eq!(
    ///     treemap.update(1, || AtomicU32::new(1), |_, _, _| (), true),
    ///     (true, true)
    /// );
    /// assert_eq!(
    ///     treemap.update(1, || AtomicU32::new(1), |_, _, v| { v.fetch_add(1, Relaxed); }, true),
    ///     (true, false)
    /// );
    /// assert_eq!(treemap.read(&1, |_, v| v.load(Relaxed)), Some(2));
    /// assert_eq!(treemap.update(2, || AtomicU32::new(9), |_, _, _| (), false), (false, false));
    /// ```
    pub fn update<M, F>(&self, key: K, make_value: M, f: F, allow_insert: bool) -> (bool, bool)
    where
        M: FnOnce() -> V,
        F: FnOnce(bool, &K, &V),
    {
        let section = R::section();
        let mut result = SearchResult::empty();
        let mut f = Some(f);
        let mut key_holder = Some(key);
        let mut make_value = Some(make_value);
        let mut new_leaf: *mut Node<K, V> = null_mut();
        let mut new_internal: *mut Node<K, V> = null_mut();
        loop {
            let found = if let Some(key) = key_holder.as_ref() {
                self.search(key, &section, &mut result)
            } else {
                let key_ref = match unsafe { &*new_leaf }.key() {
                    Bound::Finite(key) => key,
                    _ => unreachable!(),
                };
                self.search(key_ref, &section, &mut result)
            };
            if found {
                if !new_leaf.is_null() {
                    self.release_node(new_leaf);
                }
                if !new_internal.is_null() {
                    self.release_node(new_internal);
                }
                if let Some(f) = f.take() {
                    if let Node::Leaf(LeafNode {
                        key: Bound::Finite(key),
                        value: Some(value),
                        ..
                    }) = unsafe { &*result.leaf }
                    {
                        f(false, key, value);
                    }
                }
                self.stat.on_update_existing();
                return (true, false);
            }
            if !allow_insert {
                debug_assert!(new_leaf.is_null());
                return (false, false);
            }
            if tag::tag(result.upd_parent) == CLEAN {
                if new_leaf.is_null() {
                    let (Some(key), Some(make_value)) = (key_holder.take(), make_value.take())
                    else {
                        unreachable!()
                    };
                    new_leaf = self.alloc_leaf(key, make_value());
                }
                if new_internal.is_null() {
                    new_internal = self.alloc_internal();
                }
                section.protect_addr(GUARD_EXTRA, new_leaf);
                if self.try_insert(new_leaf, new_internal, &result, &section) {
                    if let Some(f) = f.take() {
                        if let Node::Leaf(LeafNode {
                            key: Bound::Finite(key),
                            value: Some(value),
                            ..
                        }) = unsafe { &*new_leaf }
                        {
                            f(true, key, value);
                        }
                    }
                    section.clear(GUARD_EXTRA);
                    self.count.inc();
                    self.stat.on_update_new();
                    return (true, true);
                }
                section.clear(GUARD_EXTRA);
            } else {
                self.help(result.upd_parent);
            }
            self.stat.on_update_retry();
            thread::yield_now();
        }
    }

    /// Removes the entry for `key`; returns `true` if the entry existed.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbtree::TreeMap;
    ///
    /// let treemap: TreeMap<u64, u32> = TreeMap::new();
    ///
    /// assert!(!treemap.remove(&1));
    /// assert!(treemap.insert(1, 10).is_ok());
    /// assert!(treemap.remove(&1));
    /// assert!(treemap.is_empty());
    /// ```
    #[inline]
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        Q: Comparable<K> + ?Sized,
    {
        self.remove_entry(key, None::<fn(&K, &V)>)
    }

    /// Removes the entry for `key`, passing the removed entry to `f`.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbtree::TreeMap;
    ///
    /// let treemap: TreeMap<u64, u32> = TreeMap::new();
    ///
    /// assert!(treemap.insert(1, 10).is_ok());
    /// let mut removed = 0;
    /// assert!(treemap.remove_with(&1, |_, v| removed = *v));
    /// assert_eq!(removed, 10);
    /// ```
    #[inline]
    pub fn remove_with<Q, F>(&self, key: &Q, f: F) -> bool
    where
        Q: Comparable<K> + ?Sized,
        F: FnOnce(&K, &V),
    {
        self.remove_entry(key, Some(f))
    }

    /// Removes the entry for `key` and returns a handle to it.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbtree::TreeMap;
    ///
    /// let treemap: TreeMap<u64, u32> = TreeMap::new();
    ///
    /// assert!(treemap.insert(1, 10).is_ok());
    /// let extracted = treemap.extract(&1).unwrap();
    /// assert_eq!((extracted.key(), extracted.value()), (&1, &10));
    /// assert!(!treemap.contains(&1));
    /// ```
    pub fn extract<Q>(&self, key: &Q) -> Option<Extracted<K, V, R>>
    where
        Q: Comparable<K> + ?Sized,
    {
        let section = R::section();
        let mut result = SearchResult::empty();
        let mut desc: *mut UpdateDesc<K, V> = null_mut();
        loop {
            if !self.search(key, &section, &mut result) {
                if !desc.is_null() {
                    self.release_desc(desc);
                }
                self.stat.on_remove_failed();
                return None;
            }
            if self.try_remove(&result, &mut desc, &section) {
                break;
            }
            self.stat.on_remove_retry();
            thread::yield_now();
        }
        self.count.dec();
        self.stat.on_remove_success();
        Some(Extracted {
            leaf: result.leaf,
            _section: section,
        })
    }

    /// Removes the entry with the least key and returns a handle to it.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbtree::TreeMap;
    ///
    /// let treemap: TreeMap<u64, u32> = TreeMap::new();
    ///
    /// assert!(treemap.extract_min().is_none());
    /// assert!(treemap.insert(2, 20).is_ok());
    /// assert!(treemap.insert(1, 10).is_ok());
    /// assert_eq!(treemap.extract_min().unwrap().key(), &1);
    /// ```
    pub fn extract_min(&self) -> Option<Extracted<K, V, R>> {
        let section = R::section();
        let mut result = SearchResult::empty();
        let mut desc: *mut UpdateDesc<K, V> = null_mut();
        loop {
            if !self.search_edge(false, &section, &mut result) {
                if !desc.is_null() {
                    self.release_desc(desc);
                }
                self.stat.on_extract_min_failed();
                return None;
            }
            if self.try_remove(&result, &mut desc, &section) {
                break;
            }
            self.stat.on_remove_retry();
            thread::yield_now();
        }
        self.count.dec();
        self.stat.on_extract_min_success();
        Some(Extracted {
            leaf: result.leaf,
            _section: section,
        })
    }

    /// Removes the entry with the greatest key and returns a handle to it.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbtree::TreeMap;
    ///
    /// let treemap: TreeMap<u64, u32> = TreeMap::new();
    ///
    /// assert!(treemap.insert(2, 20).is_ok());
    /// assert!(treemap.insert(3, 30).is_ok());
    /// assert_eq!(treemap.extract_max().unwrap().key(), &3);
    /// assert_eq!(treemap.len(), 1);
    /// ```
    pub fn extract_max(&self) -> Option<Extracted<K, V, R>> {
        let section = R::section();
        let mut result = SearchResult::empty();
        let mut desc: *mut UpdateDesc<K, V> = null_mut();
        loop {
            if !self.search_edge(true, &section, &mut result) {
                if !desc.is_null() {
                    self.release_desc(desc);
                }
                self.stat.on_extract_max_failed();
                return None;
            }
            if self.try_remove(&result, &mut desc, &section) {
                break;
            }
            self.stat.on_remove_retry();
            thread::yield_now();
        }
        self.count.dec();
        self.stat.on_extract_max_success();
        Some(Extracted {
            leaf: result.leaf,
            _section: section,
        })
    }

    /// Reads the entry for `key` through the supplied closure.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbtree::TreeMap;
    ///
    /// let treemap: TreeMap<u64, u32> = TreeMap::new();
    ///
    /// assert!(treemap.insert(1, 10).is_ok());
    /// assert_eq!(treemap.read(&1, |_, v| *v), Some(10));
    /// assert_eq!(treemap.read(&2, |_, v| *v), None);
    /// ```
    #[must_use]
    pub fn read<Q, T, F>(&self, key: &Q, f: F) -> Option<T>
    where
        Q: Comparable<K> + ?Sized,
        F: FnOnce(&K, &V) -> T,
    {
        let section = R::section();
        let mut result = SearchResult::empty();
        if self.search(key, &section, &mut result) {
            self.stat.on_find_success();
            if let Node::Leaf(LeafNode {
                key: Bound::Finite(key),
                value: Some(value),
                ..
            }) = unsafe { &*result.leaf }
            {
                return Some(f(key, value));
            }
        } else {
            self.stat.on_find_failed();
        }
        None
    }

    /// Returns `true` if the map contains an entry for `key`.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbtree::TreeMap;
    ///
    /// let treemap: TreeMap<u64, u32> = TreeMap::new();
    ///
    /// assert!(!treemap.contains(&1));
    /// assert!(treemap.insert(1, 10).is_ok());
    /// assert!(treemap.contains(&1));
    /// ```
    #[must_use]
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        Q: Comparable<K> + ?Sized,
    {
        self.read(key, |_, _| ()).is_some()
    }

    /// Returns references to the entry for `key`, bound to the supplied read-section.
    ///
    /// Only available with RCU strategies: the section blankets every node loaded inside it,
    /// which is what makes handing out plain references sound.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbtree::smr::{BufferedRcu, Reclaimer};
    /// use nbtree::TreeMap;
    ///
    /// let treemap: TreeMap<u64, u32> = TreeMap::new();
    ///
    /// assert!(treemap.insert(1, 10).is_ok());
    /// let section = BufferedRcu::section();
    /// assert_eq!(treemap.peek(&1, &section), Some((&1, &10)));
    /// ```
    #[must_use]
    pub fn peek<'s, Q>(&self, key: &Q, section: &'s R::Section) -> Option<(&'s K, &'s V)>
    where
        R: Rcu,
        Q: Comparable<K> + ?Sized,
    {
        let mut result = SearchResult::empty();
        if self.search(key, section, &mut result) {
            self.stat.on_find_success();
            let leaf: &'s Node<K, V> = unsafe { &*result.leaf };
            if let Node::Leaf(LeafNode {
                key: Bound::Finite(key),
                value: Some(value),
                ..
            }) = leaf
            {
                return Some((key, value));
            }
        } else {
            self.stat.on_find_failed();
        }
        None
    }

    /// Removes every entry.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbtree::TreeMap;
    ///
    /// let treemap: TreeMap<u64, u32> = TreeMap::new();
    ///
    /// assert!(treemap.insert(1, 10).is_ok());
    /// assert!(treemap.insert(2, 20).is_ok());
    /// treemap.clear();
    /// assert!(treemap.is_empty());
    /// ```
    pub fn clear(&self) {
        while self.extract_min().is_some() {}
    }

    /// Returns the number of entries.
    ///
    /// Always zero under the [`NoCounter`](stat::NoCounter) policy.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbtree::TreeMap;
    ///
    /// let treemap: TreeMap<u64, u32> = TreeMap::new();
    ///
    /// assert!(treemap.insert(1, 10).is_ok());
    /// assert_eq!(treemap.len(), 1);
    /// ```
    #[must_use]
    pub fn len(&self) -> usize {
        self.count.get()
    }

    /// Returns `true` if the map holds no entries, independently of the counting policy.
    ///
    /// The empty shape is unique, so this is a single pointer comparison against the first
    /// sentinel leaf.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        std::ptr::eq(
            self.root_internal().left.load(Acquire),
            &*self.sentinel1 as *const Node<K, V>,
        )
    }

    /// Returns the statistics recorded by the `S` policy.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbtree::stat::{EventStat, ExactCounter};
    /// use nbtree::smr::BufferedRcu;
    /// use nbtree::TreeMap;
    ///
    /// let treemap: TreeMap<u64, u32, BufferedRcu, ExactCounter, EventStat> = TreeMap::new();
    ///
    /// assert!(treemap.insert(1, 10).is_ok());
    /// assert_eq!(treemap.statistics().insert_success(), 1);
    /// ```
    #[must_use]
    pub fn statistics(&self) -> &S {
        &self.stat
    }

    /// Blocks until everything this thread retired has been disposed of.
    ///
    /// Must not be called while the calling thread holds an [`Extracted`] handle produced by
    /// a hazard-pointer flavored map.
    pub fn force_dispose(&self) {
        R::quiesce();
    }

    /// Verifies the ordering invariants of the tree, reporting each violation with its depth.
    ///
    /// Requires exclusive access: the check is only meaningful on a quiescent tree.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbtree::TreeMap;
    ///
    /// let mut treemap: TreeMap<u64, u32> = TreeMap::new();
    ///
    /// for k in 0..64 {
    ///     assert!(treemap.insert(k, 0).is_ok());
    /// }
    /// assert!(treemap.check_consistency(|depth, violation| {
    ///     eprintln!("{violation:?} at depth {depth}");
    /// }));
    /// ```
    pub fn check_consistency<F>(&mut self, mut report: F) -> bool
    where
        F: FnMut(usize, ConsistencyViolation),
    {
        let root = self.root_ptr();
        self.check_subtree(root, 0, &mut report)
    }

    /// Returns the number of internal levels; zero when empty.
    ///
    /// Requires exclusive access.
    #[must_use]
    pub fn depth(&mut self) -> usize {
        Self::subtree_depth(self.root_internal().left.load(Relaxed))
    }

    fn check_subtree<F>(&self, node: *mut Node<K, V>, depth: usize, report: &mut F) -> bool
    where
        F: FnMut(usize, ConsistencyViolation),
    {
        let Some(internal) = unsafe { &*node }.internal() else {
            return true;
        };
        let left = internal.left.load(Relaxed);
        let right = internal.right.load(Relaxed);
        let mut consistent = true;
        if unsafe { &*left }.key().cmp_bound(&internal.key) != Less {
            report(depth, ConsistencyViolation::LeftSubtreeOrder);
            consistent = false;
        }
        if internal.key.cmp_bound(unsafe { &*right }.key()) == Greater {
            report(depth, ConsistencyViolation::RightSubtreeOrder);
            consistent = false;
        }
        consistent &= self.check_subtree(left, depth + 1, report);
        consistent &= self.check_subtree(right, depth + 1, report);
        consistent
    }

    fn subtree_depth(node: *mut Node<K, V>) -> usize {
        let Some(internal) = unsafe { &*node }.internal() else {
            return 0;
        };
        let left = Self::subtree_depth(internal.left.load(Relaxed));
        let right = Self::subtree_depth(internal.right.load(Relaxed));
        1 + left.max(right)
    }

    fn root_internal(&self) -> &InternalNode<K, V> {
        match self.root.as_ref() {
            Node::Internal(internal) => internal,
            Node::Leaf(_) => unreachable!(),
        }
    }

    fn root_ptr(&self) -> *mut Node<K, V> {
        (&*self.root as *const Node<K, V>).cast_mut()
    }

    /// Locates the leaf for `key`; `true` if its key matches exactly.
    ///
    /// On return, the leaf, its parent, and its grandparent are protected by the section.
    fn search<Q>(&self, key: &Q, section: &R::Section, result: &mut SearchResult<K, V>) -> bool
    where
        Q: Comparable<K> + ?Sized,
    {
        'retry: loop {
            let mut grandparent: *mut Node<K, V> = null_mut();
            let mut parent: *mut Node<K, V> = null_mut();
            let mut upd_grandparent: *mut UpdateDesc<K, V> = null_mut();
            let mut upd_parent: *mut UpdateDesc<K, V> = null_mut();
            let mut right_parent = false;
            let mut right_leaf = false;
            let mut current = self.root_ptr();
            while let Some(internal) = unsafe { &*current }.internal() {
                section.copy(GUARD_PARENT, GUARD_GRANDPARENT);
                grandparent = parent;
                section.copy(GUARD_LEAF, GUARD_PARENT);
                parent = current;
                right_parent = right_leaf;
                section.copy(GUARD_UPD_PARENT, GUARD_UPD_GRANDPARENT);
                upd_grandparent = upd_parent;
                upd_parent = section.protect(GUARD_UPD_PARENT, &internal.update);
                match tag::tag(upd_parent) {
                    DFLAG => {
                        // Finish the delete that holds this node, then start over.
                        self.help_delete(tag::untag(upd_parent), section, false);
                        self.stat.on_help_delete();
                        self.stat.on_search_retry();
                        continue 'retry;
                    }
                    MARK => {
                        // The node is being spliced out; the flagged grandparent is found
                        // and helped on the next pass.
                        self.stat.on_search_retry();
                        continue 'retry;
                    }
                    _ => (),
                }
                right_leaf = cmp_key(key, &internal.key) != Less;
                let Some(child) = Self::protect_child(section, internal, right_leaf, upd_parent)
                else {
                    self.stat.on_search_retry();
                    continue 'retry;
                };
                current = child;
            }
            *result = SearchResult {
                grandparent,
                parent,
                leaf: current,
                upd_grandparent,
                upd_parent,
                right_parent,
                right_leaf,
            };
            return cmp_key(key, unsafe { &*current }.key()) == Equal;
        }
    }

    /// Locates the leftmost (`right == false`) or rightmost finite leaf; `false` when empty.
    fn search_edge(
        &self,
        right: bool,
        section: &R::Section,
        result: &mut SearchResult<K, V>,
    ) -> bool {
        'retry: loop {
            let mut grandparent: *mut Node<K, V> = null_mut();
            let mut parent: *mut Node<K, V> = null_mut();
            let mut upd_grandparent: *mut UpdateDesc<K, V> = null_mut();
            let mut upd_parent: *mut UpdateDesc<K, V> = null_mut();
            let mut right_parent = false;
            let mut right_leaf = false;
            let mut current = self.root_ptr();
            while let Some(internal) = unsafe { &*current }.internal() {
                section.copy(GUARD_PARENT, GUARD_GRANDPARENT);
                grandparent = parent;
                section.copy(GUARD_LEAF, GUARD_PARENT);
                parent = current;
                right_parent = right_leaf;
                section.copy(GUARD_UPD_PARENT, GUARD_UPD_GRANDPARENT);
                upd_grandparent = upd_parent;
                upd_parent = section.protect(GUARD_UPD_PARENT, &internal.update);
                match tag::tag(upd_parent) {
                    DFLAG => {
                        self.help_delete(tag::untag(upd_parent), section, false);
                        self.stat.on_help_delete();
                        self.stat.on_search_retry();
                        continue 'retry;
                    }
                    MARK => {
                        self.stat.on_search_retry();
                        continue 'retry;
                    }
                    _ => (),
                }
                // The greatest finite key lives left of every infinite routing key.
                right_leaf = right && !internal.key.is_infinite();
                let Some(child) = Self::protect_child(section, internal, right_leaf, upd_parent)
                else {
                    self.stat.on_search_retry();
                    continue 'retry;
                };
                current = child;
            }
            *result = SearchResult {
                grandparent,
                parent,
                leaf: current,
                upd_grandparent,
                upd_parent,
                right_parent,
                right_leaf,
            };
            return !unsafe { &*current }.key().is_infinite();
        }
    }

    /// Protects a child pointer; fails if the parent was modified in the meantime.
    fn protect_child(
        section: &R::Section,
        parent: &InternalNode<K, V>,
        right: bool,
        expected: *mut UpdateDesc<K, V>,
    ) -> Option<*mut Node<K, V>> {
        let child = section.protect(GUARD_LEAF, parent.child(right));
        if parent.update.load(Acquire) != expected {
            return None;
        }
        (!child.is_null()).then_some(child)
    }

    /// Finishes an insert observed through a flagged update field.
    fn help(&self, upd: *mut UpdateDesc<K, V>) {
        if tag::tag(upd) == IFLAG {
            self.help_insert(tag::untag(upd));
            self.stat.on_help_insert();
        }
    }

    /// Swings the parent's child pointer to the pre-built subtree and unflags the parent.
    /// Idempotent; the initiator and any number of helpers may race through it.
    fn help_insert(&self, desc: *mut UpdateDesc<K, V>) {
        let OpInfo::Insert(info) = &unsafe { &*desc }.op else {
            return;
        };
        let Some(parent) = unsafe { &*info.parent }.internal() else {
            return;
        };
        let _ = parent.child(info.right_leaf).compare_exchange(
            info.leaf,
            info.new_internal,
            AcqRel,
            Relaxed,
        );
        let _ = parent.update.compare_exchange(
            tag::with_tag(desc, IFLAG),
            parent.next_clean(),
            AcqRel,
            Relaxed,
        );
    }

    /// Drives a delete whose descriptor holds the grandparent's update field.
    ///
    /// Returns `true` when the delete completed, `false` when it backtracked; the return
    /// value is only meaningful for the initiating thread.
    fn help_delete(&self, desc: *mut UpdateDesc<K, V>, section: &R::Section, initiator: bool) -> bool {
        let OpInfo::Delete(info) = &unsafe { &*desc }.op else {
            return false;
        };
        // The caller protects the descriptor and holds the grandparent in a slot that the
        // stores below may overwrite; pin it first, then publish the remaining
        // descriptor-referenced nodes and re-validate the flag: retirement strictly
        // follows the unflag, so a still-flagged field proves they are live.
        section.protect_addr(GUARD_GRANDPARENT, info.grandparent);
        section.protect_addr(GUARD_EXTRA, info.parent);
        section.protect_addr(GUARD_LEAF, info.leaf);
        let Some(grandparent) = unsafe { &*info.grandparent }.internal() else {
            return false;
        };
        let dflag = tag::with_tag(desc, DFLAG);
        if grandparent.update.load(SeqCst) != dflag {
            section.clear(GUARD_EXTRA);
            // Completed or backtracked by another thread; the initiator held the leaf
            // protected throughout, so its removal mark tells the two apart.
            return initiator
                && unsafe { &*info.leaf }
                    .leaf()
                    .is_some_and(|leaf| leaf.removed.load(Acquire));
        }
        let Some(parent) = unsafe { &*info.parent }.internal() else {
            return false;
        };
        let mark = tag::with_tag(desc, MARK);
        match parent
            .update
            .compare_exchange(info.parent_update, mark, AcqRel, Acquire)
        {
            Ok(_) => {
                // This thread won the marking step and owns the retirement of everything
                // the delete unlinks.
                if let Some(leaf) = unsafe { &*info.leaf }.leaf() {
                    leaf.removed.store(true, Release);
                }
                self.help_marked(desc, section);
                self.retire_node(info.parent);
                self.retire_node(info.leaf);
                self.retire_desc(desc);
                section.clear(GUARD_EXTRA);
                true
            }
            Err(observed) if observed == mark => {
                self.help_marked(desc, section);
                self.stat.on_help_mark();
                section.clear(GUARD_EXTRA);
                true
            }
            Err(_) => {
                // The parent moved first; undo the grandparent flag. Whoever wins the
                // unflag owns the descriptor.
                if grandparent
                    .update
                    .compare_exchange(dflag, grandparent.next_clean(), AcqRel, Relaxed)
                    .is_ok()
                {
                    self.retire_desc(desc);
                }
                section.clear(GUARD_EXTRA);
                false
            }
        }
    }

    /// Splices the marked parent out of the grandparent and unflags the grandparent.
    fn help_marked(&self, desc: *mut UpdateDesc<K, V>, section: &R::Section) {
        let OpInfo::Delete(info) = &unsafe { &*desc }.op else {
            return;
        };
        let (Some(grandparent), Some(parent)) = (
            unsafe { &*info.grandparent }.internal(),
            unsafe { &*info.parent }.internal(),
        ) else {
            return;
        };
        let sibling = section.protect(GUARD_SIBLING, parent.child(!info.right_leaf));
        let _ = grandparent.child(info.right_parent).compare_exchange(
            info.parent,
            sibling,
            AcqRel,
            Relaxed,
        );
        let _ = grandparent.update.compare_exchange(
            tag::with_tag(desc, DFLAG),
            grandparent.next_clean(),
            AcqRel,
            Relaxed,
        );
        section.clear(GUARD_SIBLING);
    }

    /// One insert attempt: arrange the replacement subtree, then race for the parent's
    /// update field.
    fn try_insert(
        &self,
        new_leaf: *mut Node<K, V>,
        new_internal: *mut Node<K, V>,
        result: &SearchResult<K, V>,
        section: &R::Section,
    ) -> bool {
        debug_assert_eq!(tag::tag(result.upd_parent), CLEAN);

        let Some(parent) = unsafe { &*result.parent }.internal() else {
            return false;
        };
        if parent.child(result.right_leaf).load(Acquire) != result.leaf {
            return false;
        }
        let leaf_key = unsafe { &*result.leaf }.key();
        let new_key = unsafe { &*new_leaf }.key();
        // The replacement internal node routes on the greater of the two leaf keys and is
        // still private here.
        {
            let Node::Internal(internal) = (unsafe { &mut *new_internal }) else {
                return false;
            };
            match new_key.cmp_bound(leaf_key) {
                Less => {
                    internal.key = if result.grandparent.is_null() {
                        Bound::PosInf1
                    } else {
                        leaf_key.clone()
                    };
                    internal.left.store(new_leaf, Relaxed);
                    internal.right.store(result.leaf, Relaxed);
                }
                _ => {
                    debug_assert_ne!(new_key.cmp_bound(leaf_key), Equal);
                    internal.key = new_key.clone();
                    internal.left.store(result.leaf, Relaxed);
                    internal.right.store(new_leaf, Relaxed);
                }
            }
        }
        let desc = self.alloc_desc(OpInfo::Insert(InsertInfo {
            parent: result.parent,
            new_internal,
            leaf: result.leaf,
            right_leaf: result.right_leaf,
        }));
        section.protect_addr(GUARD_DESC, desc);
        let iflag = tag::with_tag(desc, IFLAG);
        match parent
            .update
            .compare_exchange(result.upd_parent, iflag, AcqRel, Acquire)
        {
            Ok(_) => {
                self.help_insert(desc);
                self.retire_desc(desc);
                section.clear(GUARD_DESC);
                true
            }
            Err(_) => {
                section.clear(GUARD_DESC);
                self.release_desc(desc);
                false
            }
        }
    }

    /// One delete attempt: help whatever is in the way, re-check the links, then race for
    /// the grandparent's update field. `desc` is reused across attempts and consumed once
    /// the descriptor has been published.
    fn try_remove(
        &self,
        result: &SearchResult<K, V>,
        desc: &mut *mut UpdateDesc<K, V>,
        section: &R::Section,
    ) -> bool {
        if tag::tag(result.upd_grandparent) != CLEAN {
            self.help(result.upd_grandparent);
            return false;
        }
        if tag::tag(result.upd_parent) != CLEAN {
            self.help(result.upd_parent);
            return false;
        }
        debug_assert!(!result.grandparent.is_null());
        let Some(grandparent) = unsafe { &*result.grandparent }.internal() else {
            return false;
        };
        let Some(parent) = unsafe { &*result.parent }.internal() else {
            return false;
        };
        if grandparent.child(result.right_parent).load(Acquire) != result.parent
            || parent.child(result.right_leaf).load(Acquire) != result.leaf
        {
            return false;
        }
        let info = DeleteInfo {
            grandparent: result.grandparent,
            parent: result.parent,
            leaf: result.leaf,
            parent_update: result.upd_parent,
            right_parent: result.right_parent,
            right_leaf: result.right_leaf,
        };
        if desc.is_null() {
            *desc = self.alloc_desc(OpInfo::Delete(info));
        } else {
            unsafe {
                (**desc).op = OpInfo::Delete(info);
            }
        }
        section.protect_addr(GUARD_DESC, *desc);
        let dflag = tag::with_tag(*desc, DFLAG);
        if grandparent
            .update
            .compare_exchange(result.upd_grandparent, dflag, AcqRel, Acquire)
            .is_ok()
        {
            // Published: the descriptor now belongs to the operation, win or backtrack.
            let done = self.help_delete(*desc, section, true);
            *desc = null_mut();
            section.clear(GUARD_DESC);
            done
        } else {
            section.clear(GUARD_DESC);
            false
        }
    }

    fn remove_entry<Q, F>(&self, key: &Q, f: Option<F>) -> bool
    where
        Q: Comparable<K> + ?Sized,
        F: FnOnce(&K, &V),
    {
        let section = R::section();
        let mut result = SearchResult::empty();
        let mut desc: *mut UpdateDesc<K, V> = null_mut();
        loop {
            if !self.search(key, &section, &mut result) {
                if !desc.is_null() {
                    self.release_desc(desc);
                }
                self.stat.on_remove_failed();
                return false;
            }
            if self.try_remove(&result, &mut desc, &section) {
                break;
            }
            self.stat.on_remove_retry();
            thread::yield_now();
        }
        if let Some(f) = f {
            // The leaf stays protected by the section until the operation returns.
            if let Node::Leaf(LeafNode {
                key: Bound::Finite(key),
                value: Some(value),
                ..
            }) = unsafe { &*result.leaf }
            {
                f(key, value);
            }
        }
        self.count.dec();
        self.stat.on_remove_success();
        true
    }

    fn alloc_leaf(&self, key: K, value: V) -> *mut Node<K, V> {
        Box::into_raw(self.node_pool.allocate(Node::Leaf(LeafNode::new(key, value))))
    }

    fn alloc_internal(&self) -> *mut Node<K, V> {
        self.stat.on_internal_node_created();
        Box::into_raw(
            self.node_pool
                .allocate(Node::Internal(InternalNode::new(Bound::PosInf1))),
        )
    }

    fn alloc_desc(&self, op: OpInfo<K, V>) -> *mut UpdateDesc<K, V> {
        self.stat.on_update_desc_created();
        Box::into_raw(self.desc_pool.allocate(UpdateDesc { op }))
    }

    /// Recycles a node that was never linked into the tree.
    fn release_node(&self, node: *mut Node<K, V>) {
        if unsafe { &*node }.is_internal() {
            self.stat.on_internal_node_disposed();
        }
        self.node_pool.release(unsafe { Box::from_raw(node) });
    }

    /// Recycles a descriptor that was never published.
    fn release_desc(&self, desc: *mut UpdateDesc<K, V>) {
        self.stat.on_update_desc_disposed();
        self.desc_pool.release(unsafe { Box::from_raw(desc) });
    }

    /// Hands an unlinked node to the reclaimer; it returns to the pool after the grace
    /// period.
    fn retire_node(&self, node: *mut Node<K, V>) {
        if unsafe { &*node }.is_internal() {
            self.stat.on_internal_node_disposed();
        }
        let pool = Arc::clone(&self.node_pool);
        R::retire(unsafe { Retired::from_raw(node, move |boxed| pool.release(boxed)) });
    }

    fn retire_desc(&self, desc: *mut UpdateDesc<K, V>) {
        self.stat.on_update_desc_disposed();
        let pool = Arc::clone(&self.desc_pool);
        R::retire(unsafe { Retired::from_raw(desc, move |boxed| pool.release(boxed)) });
    }
}

impl<K, V, R, C, S> Default for TreeMap<K, V, R, C, S>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Send + Sync,
    R: Reclaimer,
    C: ItemCount,
    S: Stat,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, R, C, S> Drop for TreeMap<K, V, R, C, S>
where
    K: 'static + Clone + Ord + Send + Sync,
    V: 'static + Send + Sync,
    R: Reclaimer,
    C: ItemCount,
    S: Stat,
{
    fn drop(&mut self) {
        // Exclusive access: unlink leftmost entries without descriptors or retirement.
        loop {
            let mut grandparent: *mut Node<K, V> = null_mut();
            let mut parent: *mut Node<K, V> = null_mut();
            let mut current = self.root_ptr();
            while let Some(internal) = unsafe { &*current }.internal() {
                grandparent = parent;
                parent = current;
                current = internal.left.load(Relaxed);
            }
            if unsafe { &*current }.key().is_infinite() {
                break;
            }
            let (Some(grandparent_ref), Some(parent_ref)) = (
                unsafe { &*grandparent }.internal(),
                unsafe { &*parent }.internal(),
            ) else {
                break;
            };
            grandparent_ref
                .left
                .store(parent_ref.right.load(Relaxed), Relaxed);
            self.stat.on_internal_node_disposed();
            drop(unsafe { Box::from_raw(current) });
            drop(unsafe { Box::from_raw(parent) });
        }
        debug_assert!(std::ptr::eq(
            self.root_internal().left.load(Relaxed),
            &*self.sentinel1 as *const Node<K, V>,
        ));
        debug_assert!(std::ptr::eq(
            self.root_internal().right.load(Relaxed),
            &*self.sentinel2 as *const Node<K, V>,
        ));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::smr::HazardPointer;
    use crate::tree_map::stat::EventStat;

    #[test]
    fn auto_traits() {
        static_assertions::assert_impl_all!(TreeMap<u64, String>: Send, Sync);
        // Extracted handles own a section and stay on the producing thread.
        static_assertions::assert_not_impl_any!(Extracted<u64, String, HazardPointer>: Send);
    }

    #[test]
    fn insert_read_remove() {
        let treemap: TreeMap<u64, u32> = TreeMap::new();
        for k in 0..256 {
            assert!(treemap.insert(k, (k * 2) as u32).is_ok());
        }
        assert_eq!(treemap.len(), 256);
        for k in 0..256 {
            assert_eq!(treemap.read(&k, |_, v| *v), Some((k * 2) as u32));
        }
        for k in (0..256).step_by(2) {
            assert!(treemap.remove(&k));
        }
        assert_eq!(treemap.len(), 128);
        assert!(!treemap.contains(&0));
        assert!(treemap.contains(&1));
    }

    #[test]
    fn duplicate_insert_returns_ownership() {
        let treemap: TreeMap<String, String> = TreeMap::new();
        assert!(treemap
            .insert("a".to_string(), "first".to_string())
            .is_ok());
        let Err((key, value)) = treemap.insert("a".to_string(), "second".to_string()) else {
            panic!("duplicate insert must fail");
        };
        assert_eq!((key.as_str(), value.as_str()), ("a", "second"));
        // Heterogeneous lookup through `Comparable`.
        assert_eq!(treemap.read("a", |_, v| v.clone()), Some("first".to_string()));
        assert!(treemap.remove("a"));
    }

    #[test]
    fn extract_orders() {
        let treemap: TreeMap<u64, u32, HazardPointer> = TreeMap::new();
        for k in [5_u64, 1, 9, 3, 7] {
            assert!(treemap.insert(k, 0).is_ok());
        }
        assert_eq!(treemap.extract_min().unwrap().key(), &1);
        assert_eq!(treemap.extract_max().unwrap().key(), &9);
        let extracted = treemap.extract(&5).unwrap();
        assert_eq!(*extracted.value(), 0);
        drop(extracted);
        assert_eq!(treemap.len(), 2);
    }

    #[test]
    fn consistency_after_churn() {
        let mut treemap: TreeMap<u64, u64> = TreeMap::new();
        for k in 0..512 {
            assert!(treemap.insert(k, k).is_ok());
        }
        for k in (0..512).step_by(3) {
            assert!(treemap.remove(&k));
        }
        assert!(treemap.check_consistency(|depth, violation| {
            panic!("{violation:?} at depth {depth}");
        }));
        assert!(treemap.depth() >= 1);
    }

    #[test]
    fn allocation_balance() {
        let treemap: TreeMap<u64, u64, BufferedRcu, ExactCounter, EventStat> = TreeMap::new();
        for k in 0..128 {
            assert!(treemap.insert(k, k).is_ok());
        }
        treemap.clear();
        assert!(treemap.is_empty());
        treemap.force_dispose();
        let stat = treemap.statistics();
        assert_eq!(stat.internal_node_created(), stat.internal_node_disposed());
        assert_eq!(stat.update_desc_created(), stat.update_desc_disposed());
    }
}
