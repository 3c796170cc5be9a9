//! Copy-on-first-write map with rollback.

use std::collections::BTreeMap;

/// A map that can record before-images of every entry it changes.
///
/// While a shadow is active the first mutation of a key saves its previous
/// value (or its absence). `rollback` restores those images, `commit` drops
/// them. A construction shadows every metadata file so that an abort before
/// any I/O leaves them exactly as they were.
#[derive(Debug, Clone)]
pub(crate) struct ShadowMap<K: Ord + Clone, V: Clone> {
    live: BTreeMap<K, V>,
    before: Option<BTreeMap<K, Option<V>>>,
}

impl<K: Ord + Clone, V: Clone> Default for ShadowMap<K, V> {
    fn default() -> Self {
        Self {
            live: BTreeMap::new(),
            before: None,
        }
    }
}

impl<K: Ord + Clone, V: Clone> ShadowMap<K, V> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn save(&mut self, key: &K) {
        let Self { live, before } = self;
        if let Some(before) = before {
            if !before.contains_key(key) {
                before.insert(key.clone(), live.get(key).cloned());
            }
        }
    }

    pub(crate) fn get(&self, key: &K) -> Option<&V> {
        self.live.get(key)
    }

    pub(crate) fn contains_key(&self, key: &K) -> bool {
        self.live.contains_key(key)
    }

    pub(crate) fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if self.live.contains_key(key) {
            self.save(key);
        }
        self.live.get_mut(key)
    }

    pub(crate) fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.save(&key);
        self.live.insert(key, value)
    }

    pub(crate) fn remove(&mut self, key: &K) -> Option<V> {
        if self.live.contains_key(key) {
            self.save(key);
        }
        self.live.remove(key)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.live.iter()
    }

    pub(crate) fn keys(&self) -> impl DoubleEndedIterator<Item = &K> {
        self.live.keys()
    }

    pub(crate) fn len(&self) -> usize {
        self.live.len()
    }

    #[cfg(test)]
    pub(crate) fn is_shadowing(&self) -> bool {
        self.before.is_some()
    }

    /// Starts recording before-images. A shadow already in progress is kept.
    pub(crate) fn begin(&mut self) {
        if self.before.is_none() {
            self.before = Some(BTreeMap::new());
        }
    }

    /// Forgets the before-images, keeping every change. Returns the keys
    /// that were touched.
    pub(crate) fn commit(&mut self) -> Vec<K> {
        self.before
            .take()
            .map(|before| before.into_keys().collect())
            .unwrap_or_default()
    }

    /// Restores every entry changed since `begin`.
    pub(crate) fn rollback(&mut self) {
        if let Some(before) = self.before.take() {
            for (key, value) in before {
                match value {
                    Some(value) => {
                        self.live.insert(key, value);
                    }
                    None => {
                        self.live.remove(&key);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_restores_first_image() {
        let mut map = ShadowMap::new();
        map.insert(1, "a");
        map.insert(2, "b");

        map.begin();
        *map.get_mut(&1).unwrap() = "x";
        *map.get_mut(&1).unwrap() = "y";
        map.remove(&2);
        map.insert(3, "c");
        assert!(map.is_shadowing());
        map.rollback();

        assert_eq!(map.get(&1), Some(&"a"));
        assert_eq!(map.get(&2), Some(&"b"));
        assert!(!map.contains_key(&3));
        assert!(!map.is_shadowing());
    }

    #[test]
    fn commit_keeps_changes() {
        let mut map = ShadowMap::new();
        map.begin();
        map.insert(1u64, 10u32);
        map.commit();
        map.rollback();
        assert_eq!(map.get(&1), Some(&10));
        assert_eq!(map.len(), 1);
        assert_eq!(map.keys().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn mutations_without_shadow_are_not_recorded() {
        let mut map = ShadowMap::new();
        map.insert(1, 1);
        map.begin();
        map.rollback();
        map.insert(1, 2);
        map.rollback();
        assert_eq!(map.get(&1), Some(&2));
    }
}
