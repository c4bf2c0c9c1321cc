//! Persistent collections for Trellis
//!
//! This crate provides the immutable, structurally-shared data structures
//! used by the resolution caches in `trellis-di`. The central type is
//! [`ImmutableHashTree`], a persistent AVL tree keyed by hash code. Every
//! mutation returns a new tree root that shares all unmodified subtrees
//! with its predecessor, so readers holding an old root never observe a
//! partially updated structure.
//!
//! ## Usage
//!
//! ```rust
//! use trellis_collections::ImmutableHashTree;
//!
//! let empty: ImmutableHashTree<&str, i32> = ImmutableHashTree::new();
//! let one = empty.add("a", 1);
//! let two = one.add("b", 2);
//!
//! assert_eq!(two.search(&"a"), Some(&1));
//! assert_eq!(two.search(&"b"), Some(&2));
//! // The original trees are untouched.
//! assert!(empty.search(&"a").is_none());
//! assert!(one.search(&"b").is_none());
//! ```

mod tree;

pub use tree::ImmutableHashTree;
