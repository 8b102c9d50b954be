//! Tree nodes.

use super::desc::UpdateDesc;
use equivalent::Comparable;

use std::cmp::Ordering;
use std::ptr::null_mut;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize};

/// A routing key: either a finite key or one of the two positive-infinity sentinels.
///
/// `PosInf1 < PosInf2`, and every finite key orders below both, which pins the empty-tree
/// shape: the root routes on `PosInf2` and its children are the two sentinel leaves.
#[derive(Clone, Debug)]
pub(super) enum Bound<K> {
    Finite(K),
    PosInf1,
    PosInf2,
}

impl<K> Bound<K> {
    pub(super) fn is_infinite(&self) -> bool {
        !matches!(self, Self::Finite(_))
    }

}

impl<K: Ord> Bound<K> {
    pub(super) fn cmp_bound(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Finite(left), Self::Finite(right)) => left.cmp(right),
            (Self::Finite(_), _) | (Self::PosInf1, Self::PosInf2) => Ordering::Less,
            (_, Self::Finite(_)) | (Self::PosInf2, Self::PosInf1) => Ordering::Greater,
            _ => Ordering::Equal,
        }
    }
}

/// Compares a query key against a routing key; infinite keys order above every query.
pub(super) fn cmp_key<Q, K>(query: &Q, bound: &Bound<K>) -> Ordering
where
    Q: Comparable<K> + ?Sized,
{
    match bound {
        Bound::Finite(key) => query.compare(key),
        _ => Ordering::Less,
    }
}

/// A tree node: internal nodes route, leaves carry the entries.
pub(super) enum Node<K, V> {
    Internal(InternalNode<K, V>),
    Leaf(LeafNode<K, V>),
}

impl<K, V> Node<K, V> {
    pub(super) fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }

    pub(super) fn internal(&self) -> Option<&InternalNode<K, V>> {
        match self {
            Self::Internal(internal) => Some(internal),
            Self::Leaf(_) => None,
        }
    }

    pub(super) fn leaf(&self) -> Option<&LeafNode<K, V>> {
        match self {
            Self::Internal(_) => None,
            Self::Leaf(leaf) => Some(leaf),
        }
    }

    pub(super) fn key(&self) -> &Bound<K> {
        match self {
            Self::Internal(internal) => &internal.key,
            Self::Leaf(leaf) => &leaf.key,
        }
    }
}

/// A leaf node holding one entry; sentinel leaves hold no value.
pub(super) struct LeafNode<K, V> {
    pub(super) key: Bound<K>,
    pub(super) value: Option<V>,
    /// Set by the thread that wins the delete marking step, before the leaf is unlinked.
    pub(super) removed: AtomicBool,
}

impl<K, V> LeafNode<K, V> {
    pub(super) fn new(key: K, value: V) -> Self {
        Self {
            key: Bound::Finite(key),
            value: Some(value),
            removed: AtomicBool::new(false),
        }
    }

    pub(super) fn sentinel(key: Bound<K>) -> Self {
        debug_assert!(key.is_infinite());
        Self {
            key,
            value: None,
            removed: AtomicBool::new(false),
        }
    }
}

/// An internal node: a routing key, two children, and the update field coordinating
/// concurrent modifications beneath it.
pub(super) struct InternalNode<K, V> {
    pub(super) key: Bound<K>,
    pub(super) left: AtomicPtr<Node<K, V>>,
    pub(super) right: AtomicPtr<Node<K, V>>,
    /// Tagged pointer: either a flagged [`UpdateDesc`] or a clean cookie value.
    pub(super) update: AtomicPtr<UpdateDesc<K, V>>,
    /// Counter feeding [`next_clean`](Self::next_clean).
    clean_cookie: AtomicUsize,
}

impl<K, V> InternalNode<K, V> {
    pub(super) fn new(key: Bound<K>) -> Self {
        Self {
            key,
            left: AtomicPtr::new(null_mut()),
            right: AtomicPtr::new(null_mut()),
            update: AtomicPtr::new(null_mut()),
            clean_cookie: AtomicUsize::new(0),
        }
    }

    pub(super) fn child(&self, right: bool) -> &AtomicPtr<Node<K, V>> {
        if right {
            &self.right
        } else {
            &self.left
        }
    }

    /// A fresh clean value for the update field.
    ///
    /// Unflagging stores a never-repeating low-range fake pointer instead of null, so a CAS
    /// expecting a stale clean value fails even if a recycled descriptor lands at the same
    /// address (the ABA guard on the update field).
    pub(super) fn next_clean(&self) -> *mut UpdateDesc<K, V> {
        (((self.clean_cookie.fetch_add(1, Relaxed) + 1) << 2) & 0xFFFF) as *mut UpdateDesc<K, V>
    }
}
