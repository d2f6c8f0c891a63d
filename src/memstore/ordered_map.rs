//! In-memory reference implementation of [`crate::external::OrderedMap`],
//! backed by `std::collections::BTreeMap`. This is test/demo scaffolding
//! standing in for a real persistent B+-tree (component C1 is explicitly
//! out of scope for this crate) — production callers should supply their
//! own implementation backed by a real ordered store.

use std::collections::BTreeMap;

use crate::external::{OrderedMap, ProbeOp};

#[derive(Debug, Default, Clone)]
pub struct BTreeOrderedMap<K: Ord + Clone, V: Clone> {
    tree: BTreeMap<K, V>,
}

impl<K: Ord + Clone, V: Clone> BTreeOrderedMap<K, V> {
    pub fn new() -> Self {
        Self {
            tree: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.tree.iter()
    }
}

impl<K: Ord + Clone, V: Clone> OrderedMap for BTreeOrderedMap<K, V> {
    type Key = K;
    type Value = V;
    /// The cursor is simply the key it points to: cheap to clone and
    /// trivially serializable, which is exactly the property the
    /// aggregator's anchors rely on.
    type Cursor = K;

    fn probe(&self, op: ProbeOp<Self::Key>) -> Option<Self::Cursor> {
        match op {
            ProbeOp::First => self.tree.keys().next().cloned(),
            ProbeOp::Eq(k) => self.tree.get_key_value(&k).map(|(k, _)| k.clone()),
            ProbeOp::Le(k) => self
                .tree
                .range(..=k)
                .next_back()
                .map(|(k, _)| k.clone()),
            ProbeOp::Ge(k) => self.tree.range(k..).next().map(|(k, _)| k.clone()),
        }
    }

    fn fetch(&self, cursor: &Self::Cursor) -> Option<(Self::Key, Self::Value)> {
        self.tree
            .get_key_value(cursor)
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    fn next(&self, cursor: &Self::Cursor) -> Option<Self::Cursor> {
        use std::ops::Bound::Excluded;
        self.tree
            .range((Excluded(cursor.clone()), std::ops::Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone())
    }

    fn delete(&mut self, cursor: &Self::Cursor) -> bool {
        self.tree.remove(cursor).is_some()
    }

    fn update(&mut self, key: Self::Key, value: Self::Value) {
        self.tree.insert(key, value);
    }

    fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}
