//! Lock-free ordered map built on pluggable safe memory reclamation.
//!
//! # nbtree::TreeMap
//! A concurrent ordered map based on a leaf-oriented binary search tree where interrupted
//! structural changes are finished cooperatively by other threads.
//!
//! # nbtree::smr
//! The reclamation strategies backing it: hazard pointers and three RCU grace-period flavors.
//!
//! # nbtree::pool
//! A lock-free bounded pool recycling node and descriptor allocations.

mod exit_guard;

pub mod pool;
pub mod smr;

mod tree_map;

pub use tree_map::stat;
pub use tree_map::{ConsistencyViolation, Extracted, TreeMap};
