//! Property-based tests for the persistent hash tree

use std::collections::HashMap;

use proptest::prelude::*;
use trellis_collections::ImmutableHashTree;

proptest! {
    /// The tree must agree with a HashMap model under arbitrary insertion
    /// sequences, including key replacement.
    #[test]
    fn test_tree_matches_hashmap_model(entries in prop::collection::vec((0u16..500, any::<u32>()), 0..300)) {
        let mut tree = ImmutableHashTree::new();
        let mut model = HashMap::new();

        for (key, value) in entries {
            tree = tree.add(key, value);
            model.insert(key, value);
        }

        prop_assert_eq!(tree.len(), model.len());
        for (key, value) in &model {
            prop_assert_eq!(tree.search(key), Some(value));
        }
    }

    /// Older roots must keep serving their own snapshot after later adds.
    #[test]
    fn test_snapshots_are_immutable(keys in prop::collection::vec(0u16..200, 1..100)) {
        let mut versions = vec![ImmutableHashTree::new()];
        for (i, key) in keys.iter().enumerate() {
            let next = versions.last().unwrap().add(*key, i);
            versions.push(next);
        }

        // Version v contains exactly the first v insertions.
        for (v, tree) in versions.iter().enumerate() {
            let mut model = HashMap::new();
            for (i, key) in keys.iter().take(v).enumerate() {
                model.insert(*key, i);
            }
            prop_assert_eq!(tree.len(), model.len());
            for (key, value) in &model {
                prop_assert_eq!(tree.search(key), Some(value));
            }
        }
    }

    /// Lookups for absent keys return None regardless of tree contents.
    #[test]
    fn test_absent_keys(present in prop::collection::vec(0u16..100, 0..50), probe in 100u16..200) {
        let mut tree = ImmutableHashTree::new();
        for key in &present {
            tree = tree.add(*key, ());
        }
        prop_assert_eq!(tree.search(&probe), None);
    }
}
