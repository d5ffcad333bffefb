// Id-addressed record store with a secondary key index and use marks

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

pub(super) struct Arena<K, T> {
    items: HashMap<i64, (K, T)>,
    index: HashMap<K, i64>,
    /// Ids used since the last sweep
    marked: HashSet<i64>,
}

impl<K: Hash + Eq + Clone, T> Arena<K, T> {
    pub fn new() -> Self {
        Self {
            items: HashMap::new(),
            index: HashMap::new(),
            marked: HashSet::new(),
        }
    }

    pub fn get(&mut self, id: i64) -> Option<&T> {
        let (_, item) = self.items.get(&id)?;
        self.marked.insert(id);
        Some(item)
    }

    pub fn get_by_key(&mut self, key: &K) -> Option<&T> {
        let id = *self.index.get(key)?;
        self.get(id)
    }

    /// Store `item` under `id` and `key`, replacing whatever either of them pointed to.
    pub fn insert(&mut self, id: i64, key: K, item: T) {
        if let Some((old_key, _)) = self.items.remove(&id) {
            self.index.remove(&old_key);
        }
        if let Some(old_id) = self.index.remove(&key) {
            self.items.remove(&old_id);
            self.marked.remove(&old_id);
        }
        self.index.insert(key.clone(), id);
        self.items.insert(id, (key, item));
        self.marked.insert(id);
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.items.values().map(|(_, item)| item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.index.clear();
        self.marked.clear();
    }

    /// Drop every record that was neither used since the last sweep nor kept by `keep`.
    /// Returns how many were dropped.
    pub fn sweep(&mut self, keep: impl Fn(i64) -> bool) -> usize {
        let doomed: Vec<i64> = self
            .items
            .keys()
            .copied()
            .filter(|id| !self.marked.contains(id) && !keep(*id))
            .collect();
        for id in &doomed {
            if let Some((key, _)) = self.items.remove(id) {
                self.index.remove(&key);
            }
        }
        self.marked.clear();
        doomed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_moved_to_new_id_drops_stale_record() {
        let mut arena: Arena<String, &str> = Arena::new();
        arena.insert(1, "u1".to_string(), "old");
        arena.insert(2, "u1".to_string(), "new");

        assert_eq!(arena.len(), 1);
        assert_eq!(arena.get(1), None);
        assert_eq!(arena.get_by_key(&"u1".to_string()), Some(&"new"));

        // Sweeping must not take the live key mapping with it
        arena.sweep(|_| false);
        arena.sweep(|id| id == 2);
        assert_eq!(arena.get_by_key(&"u1".to_string()), Some(&"new"));
    }

    #[test]
    fn test_id_rekeyed_drops_old_key() {
        let mut arena: Arena<String, &str> = Arena::new();
        arena.insert(1, "a".to_string(), "first");
        arena.insert(1, "b".to_string(), "second");

        assert_eq!(arena.len(), 1);
        assert_eq!(arena.get_by_key(&"a".to_string()), None);
        assert_eq!(arena.get_by_key(&"b".to_string()), Some(&"second"));
    }
}
