//! Two-level associative container keyed by `(key, sub_key)`.
//!
//! Used for schema-qualified lookups (`schema -> table -> value`) everywhere a
//! table reference is the key.

use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct MultiMap<K, S, V> {
    map: BTreeMap<K, BTreeMap<S, V>>,
}

impl<K: Ord, S: Ord, V> Default for MultiMap<K, S, V> {
    fn default() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }
}

impl<K: Ord, S: Ord, V> MultiMap<K, S, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: K, sub_key: S, value: V) -> Option<V> {
        self.map.entry(key).or_default().insert(sub_key, value)
    }

    /// Inserts only when nothing is stored under `(key, sub_key)` yet and
    /// returns the stored value either way.
    pub fn get_or_insert_with(&mut self, key: K, sub_key: S, value: impl FnOnce() -> V) -> &mut V {
        self.map.entry(key).or_default().entry(sub_key).or_insert_with(value)
    }

    pub fn get<Q, R>(&self, key: &Q, sub_key: &R) -> Option<&V>
    where
        K: std::borrow::Borrow<Q>,
        S: std::borrow::Borrow<R>,
        Q: Ord + ?Sized,
        R: Ord + ?Sized,
    {
        self.map.get(key)?.get(sub_key)
    }

    pub fn get_mut<Q, R>(&mut self, key: &Q, sub_key: &R) -> Option<&mut V>
    where
        K: std::borrow::Borrow<Q>,
        S: std::borrow::Borrow<R>,
        Q: Ord + ?Sized,
        R: Ord + ?Sized,
    {
        self.map.get_mut(key)?.get_mut(sub_key)
    }

    pub fn contains<Q, R>(&self, key: &Q, sub_key: &R) -> bool
    where
        K: std::borrow::Borrow<Q>,
        S: std::borrow::Borrow<R>,
        Q: Ord + ?Sized,
        R: Ord + ?Sized,
    {
        self.get(key, sub_key).is_some()
    }

    pub fn remove<Q, R>(&mut self, key: &Q, sub_key: &R) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        S: std::borrow::Borrow<R>,
        Q: Ord + ?Sized,
        R: Ord + ?Sized,
    {
        let sub_map = self.map.get_mut(key)?;
        let value = sub_map.remove(sub_key);
        if sub_map.is_empty() {
            self.map.remove(key);
        }
        value
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Sub-maps grouped by first-level key.
    pub fn groups(&self) -> impl Iterator<Item = (&K, &BTreeMap<S, V>)> {
        self.map.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = (&K, &S)> {
        self.iter().map(|(key, sub_key, _)| (key, sub_key))
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.map.values().flat_map(BTreeMap::values)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &S, &V)> {
        self.map
            .iter()
            .flat_map(|(key, sub_map)| {
                sub_map
                    .iter()
                    .map(move |(sub_key, value)| (key, sub_key, value))
            })
    }
}

impl<K: Ord, S: Ord, V> FromIterator<(K, S, V)> for MultiMap<K, S, V> {
    fn from_iter<I: IntoIterator<Item = (K, S, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (key, sub_key, value) in iter {
            map.insert(key, sub_key, value);
        }
        map
    }
}
