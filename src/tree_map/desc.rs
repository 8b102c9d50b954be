//! Update descriptors.
//!
//! Every structural change publishes an [`UpdateDesc`] by flagging an internal node's update
//! field with one of the tags below; any thread observing a flag can finish the operation
//! from the descriptor alone.

use super::node::Node;

/// No operation in flight; the untagged bits are a clean cookie, not a pointer.
pub(super) const CLEAN: usize = 0;

/// A delete holds the grandparent; the descriptor carries a [`DeleteInfo`].
pub(super) const DFLAG: usize = 1;

/// An insert holds the parent; the descriptor carries an [`InsertInfo`].
pub(super) const IFLAG: usize = 2;

/// The parent of a leaf being deleted is marked for splicing; terminal until unlinked.
pub(super) const MARK: usize = 3;

pub(super) struct UpdateDesc<K, V> {
    pub(super) op: OpInfo<K, V>,
}

// Descriptors carry raw node pointers but own nothing; they travel between threads inside the
// descriptor pool and retire closures.
unsafe impl<K: Send, V: Send> Send for UpdateDesc<K, V> {}

pub(super) enum OpInfo<K, V> {
    Insert(InsertInfo<K, V>),
    Delete(DeleteInfo<K, V>),
}

/// Everything needed to finish an insert: swap `leaf` under `parent` for the pre-built
/// `new_internal` subtree, then unflag `parent`.
pub(super) struct InsertInfo<K, V> {
    pub(super) parent: *mut Node<K, V>,
    pub(super) new_internal: *mut Node<K, V>,
    pub(super) leaf: *mut Node<K, V>,
    pub(super) right_leaf: bool,
}

/// Everything needed to finish a delete: mark `parent` (expecting the clean value observed
/// during the search), splice the sibling into `grandparent`, then unflag `grandparent`.
pub(super) struct DeleteInfo<K, V> {
    pub(super) grandparent: *mut Node<K, V>,
    pub(super) parent: *mut Node<K, V>,
    pub(super) leaf: *mut Node<K, V>,
    /// The clean value the parent's update field held when the delete was prepared.
    pub(super) parent_update: *mut UpdateDesc<K, V>,
    pub(super) right_parent: bool,
    pub(super) right_leaf: bool,
}
