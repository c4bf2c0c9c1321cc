//! Persistent AVL tree keyed by hash code
//!
//! Entries whose keys hash to the same value are kept in a side list on
//! the owning node, so hash collisions degrade to a short linear scan
//! instead of corrupting the tree shape. The balance factor of every node
//! stays within `{-1, 0, 1}`.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A persistent hash tree mapping keys to values.
///
/// `add` returns a new tree; the receiver is never modified. Lookups take
/// `&self` and never allocate or block, which makes a tree behind an
/// atomically swapped `Arc` a lock-free read path.
pub struct ImmutableHashTree<K, V> {
    root: Option<Arc<Node<K, V>>>,
    len: usize,
}

struct Node<K, V> {
    hash: u64,
    key: K,
    value: V,
    /// Entries with the same hash but a different key.
    duplicates: Vec<(K, V)>,
    height: u8,
    left: Option<Arc<Node<K, V>>>,
    right: Option<Arc<Node<K, V>>>,
}

impl<K, V> Clone for ImmutableHashTree<K, V> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            len: self.len,
        }
    }
}

impl<K, V> Default for ImmutableHashTree<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

fn hash_of<K: Hash>(key: &K) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

fn height<K, V>(node: &Option<Arc<Node<K, V>>>) -> u8 {
    node.as_ref().map_or(0, |n| n.height)
}

impl<K, V> ImmutableHashTree<K, V> {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self { root: None, len: 0 }
    }

    /// Number of entries in the tree.
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` if the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<K, V> ImmutableHashTree<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Return a new tree containing `(key, value)`.
    ///
    /// An existing entry with an equal key is replaced. All subtrees not
    /// on the insertion path are shared with `self`.
    pub fn add(&self, key: K, value: V) -> Self {
        let hash = hash_of(&key);
        let (root, replaced) = insert(&self.root, hash, key, value);
        Self {
            root: Some(root),
            len: if replaced { self.len } else { self.len + 1 },
        }
    }

    /// Look up the value stored for `key`.
    pub fn search(&self, key: &K) -> Option<&V> {
        let hash = hash_of(key);
        let mut current = self.root.as_deref();
        while let Some(node) = current {
            if hash == node.hash {
                if node.key == *key {
                    return Some(&node.value);
                }
                return node
                    .duplicates
                    .iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v);
            }
            current = if hash < node.hash {
                node.left.as_deref()
            } else {
                node.right.as_deref()
            };
        }
        None
    }

    /// Visit every entry. Order is unspecified.
    pub fn for_each<F: FnMut(&K, &V)>(&self, mut f: F) {
        fn walk<K, V, F: FnMut(&K, &V)>(node: &Option<Arc<Node<K, V>>>, f: &mut F) {
            if let Some(n) = node {
                walk(&n.left, f);
                f(&n.key, &n.value);
                for (k, v) in &n.duplicates {
                    f(k, v);
                }
                walk(&n.right, f);
            }
        }
        walk(&self.root, &mut f);
    }

    #[cfg(test)]
    fn assert_balanced(&self) {
        fn check<K, V>(node: &Option<Arc<Node<K, V>>>) -> u8 {
            match node {
                None => 0,
                Some(n) => {
                    let lh = check(&n.left) as i16;
                    let rh = check(&n.right) as i16;
                    assert!((lh - rh).abs() <= 1, "balance factor out of range");
                    assert_eq!(n.height as i16, 1 + lh.max(rh));
                    n.height
                }
            }
        }
        check(&self.root);
    }
}

/// Insert on a persistent path, returning the new subtree root and whether
/// an existing entry was replaced.
fn insert<K, V>(
    node: &Option<Arc<Node<K, V>>>,
    hash: u64,
    key: K,
    value: V,
) -> (Arc<Node<K, V>>, bool)
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    let node = match node {
        None => {
            return (
                Arc::new(Node {
                    hash,
                    key,
                    value,
                    duplicates: Vec::new(),
                    height: 1,
                    left: None,
                    right: None,
                }),
                false,
            )
        }
        Some(n) => n,
    };

    if hash == node.hash {
        // Same hash slot: replace or extend the duplicate list. Height and
        // shape are unchanged, so no rebalancing is needed.
        let mut duplicates = node.duplicates.clone();
        let replaced;
        let (key, value) = if node.key == key {
            replaced = true;
            (key, value)
        } else if let Some(slot) = duplicates.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
            replaced = true;
            (node.key.clone(), node.value.clone())
        } else {
            duplicates.push((key, value));
            replaced = false;
            (node.key.clone(), node.value.clone())
        };
        return (
            Arc::new(Node {
                hash,
                key,
                value,
                duplicates,
                height: node.height,
                left: node.left.clone(),
                right: node.right.clone(),
            }),
            replaced,
        );
    }

    let (left, right, replaced) = if hash < node.hash {
        let (new_left, replaced) = insert(&node.left, hash, key, value);
        (Some(new_left), node.right.clone(), replaced)
    } else {
        let (new_right, replaced) = insert(&node.right, hash, key, value);
        (node.left.clone(), Some(new_right), replaced)
    };

    (
        balance(
            node.hash,
            node.key.clone(),
            node.value.clone(),
            node.duplicates.clone(),
            left,
            right,
        ),
        replaced,
    )
}

fn make_node<K, V>(
    hash: u64,
    key: K,
    value: V,
    duplicates: Vec<(K, V)>,
    left: Option<Arc<Node<K, V>>>,
    right: Option<Arc<Node<K, V>>>,
) -> Arc<Node<K, V>> {
    let height = 1 + height(&left).max(height(&right));
    Arc::new(Node {
        hash,
        key,
        value,
        duplicates,
        height,
        left,
        right,
    })
}

/// Rebuild a node and restore the AVL invariant with at most two rotations.
fn balance<K, V>(
    hash: u64,
    key: K,
    value: V,
    duplicates: Vec<(K, V)>,
    left: Option<Arc<Node<K, V>>>,
    right: Option<Arc<Node<K, V>>>,
) -> Arc<Node<K, V>>
where
    K: Clone,
    V: Clone,
{
    let lh = height(&left) as i16;
    let rh = height(&right) as i16;

    if lh - rh > 1 {
        if let Some(l) = &left {
            return rotate_right(hash, key, value, duplicates, l, right);
        }
    } else if rh - lh > 1 {
        if let Some(r) = &right {
            return rotate_left(hash, key, value, duplicates, left, r);
        }
    }
    make_node(hash, key, value, duplicates, left, right)
}

/// Right rotation of a left-heavy node, with a pre-rotation of the left
/// child for the left-right shape.
fn rotate_right<K, V>(
    hash: u64,
    key: K,
    value: V,
    duplicates: Vec<(K, V)>,
    l: &Arc<Node<K, V>>,
    right: Option<Arc<Node<K, V>>>,
) -> Arc<Node<K, V>>
where
    K: Clone,
    V: Clone,
{
    if height(&l.right) > height(&l.left) {
        if let Some(lr) = &l.right {
            let new_left = make_node(
                l.hash,
                l.key.clone(),
                l.value.clone(),
                l.duplicates.clone(),
                l.left.clone(),
                lr.left.clone(),
            );
            let new_right = make_node(hash, key, value, duplicates, lr.right.clone(), right);
            return make_node(
                lr.hash,
                lr.key.clone(),
                lr.value.clone(),
                lr.duplicates.clone(),
                Some(new_left),
                Some(new_right),
            );
        }
    }
    let new_right = make_node(hash, key, value, duplicates, l.right.clone(), right);
    make_node(
        l.hash,
        l.key.clone(),
        l.value.clone(),
        l.duplicates.clone(),
        l.left.clone(),
        Some(new_right),
    )
}

/// Left rotation of a right-heavy node, mirror of [`rotate_right`].
fn rotate_left<K, V>(
    hash: u64,
    key: K,
    value: V,
    duplicates: Vec<(K, V)>,
    left: Option<Arc<Node<K, V>>>,
    r: &Arc<Node<K, V>>,
) -> Arc<Node<K, V>>
where
    K: Clone,
    V: Clone,
{
    if height(&r.left) > height(&r.right) {
        if let Some(rl) = &r.left {
            let new_left = make_node(hash, key, value, duplicates, left, rl.left.clone());
            let new_right = make_node(
                r.hash,
                r.key.clone(),
                r.value.clone(),
                r.duplicates.clone(),
                rl.right.clone(),
                r.right.clone(),
            );
            return make_node(
                rl.hash,
                rl.key.clone(),
                rl.value.clone(),
                rl.duplicates.clone(),
                Some(new_left),
                Some(new_right),
            );
        }
    }
    let new_left = make_node(hash, key, value, duplicates, left, r.left.clone());
    make_node(
        r.hash,
        r.key.clone(),
        r.value.clone(),
        r.duplicates.clone(),
        Some(new_left),
        r.right.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_tree_search() {
        let tree: ImmutableHashTree<u32, u32> = ImmutableHashTree::new();
        assert!(tree.is_empty());
        assert_eq!(tree.search(&1), None);
    }

    #[test]
    fn test_add_and_search() {
        let mut tree = ImmutableHashTree::new();
        for i in 0..100u32 {
            tree = tree.add(i, i * 10);
        }
        assert_eq!(tree.len(), 100);
        for i in 0..100u32 {
            assert_eq!(tree.search(&i), Some(&(i * 10)));
        }
        tree.assert_balanced();
    }

    #[test]
    fn test_replace_existing_key() {
        let tree = ImmutableHashTree::new().add("a", 1).add("a", 2);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.search(&"a"), Some(&2));
    }

    #[test]
    fn test_persistence_across_versions() {
        let v1 = ImmutableHashTree::new().add("a", 1);
        let v2 = v1.add("b", 2);
        let v3 = v2.add("a", 99);

        assert_eq!(v1.search(&"b"), None);
        assert_eq!(v2.search(&"a"), Some(&1));
        assert_eq!(v3.search(&"a"), Some(&99));
        assert_eq!(v3.search(&"b"), Some(&2));
    }

    /// Key type whose hash always collides.
    #[derive(Clone, PartialEq, Eq)]
    struct Colliding(u32);

    impl Hash for Colliding {
        fn hash<H: Hasher>(&self, state: &mut H) {
            0u64.hash(state);
        }
    }

    #[test]
    fn test_hash_collisions_use_duplicate_list() {
        let mut tree = ImmutableHashTree::new();
        for i in 0..10u32 {
            tree = tree.add(Colliding(i), i);
        }
        assert_eq!(tree.len(), 10);
        for i in 0..10u32 {
            assert_eq!(tree.search(&Colliding(i)), Some(&i));
        }
        // Replacement inside the duplicate list.
        let tree = tree.add(Colliding(7), 70);
        assert_eq!(tree.len(), 10);
        assert_eq!(tree.search(&Colliding(7)), Some(&70));
    }

    #[test]
    fn test_for_each_visits_all_entries() {
        let mut tree = ImmutableHashTree::new();
        for i in 0..50u32 {
            tree = tree.add(i, ());
        }
        let mut seen = Vec::new();
        tree.for_each(|k, _| seen.push(*k));
        seen.sort_unstable();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_monotonic_insertion_stays_balanced() {
        // Hash order is effectively random, but balance must hold for any
        // insertion sequence.
        let mut tree = ImmutableHashTree::new();
        for i in 0..1000u32 {
            tree = tree.add(i, i);
            tree.assert_balanced();
        }
    }
}
