use std::{
    any::Any,
    fmt::{self, Debug, Formatter},
};

/**
An ordered key/value store for request-scoped data.

Unlike a type-map, entries are keyed by string and iteration follows
insertion order, which keeps middleware communication deterministic and
iteration cheap. The backing vec is truncated in place between requests
so reuse does not reallocate.
*/
#[derive(Default)]
pub struct Store {
    entries: Vec<Entry>,
}

struct Entry {
    key: String,
    value: Box<dyn Any + Send + Sync>,
}

impl Debug for Store {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.entries.iter().map(|entry| &entry.key))
            .finish()
    }
}

impl Store {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of entries currently stored.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove all entries, retaining the allocation for reuse.
    pub fn reset(&mut self) {
        self.entries.truncate(0);
    }

    /// Set `key` to `value`, replacing any existing entry with the
    /// same key in place.
    pub fn set(&mut self, key: impl Into<String>, value: impl Any + Send + Sync) {
        let key = key.into();
        match self.entries.iter_mut().find(|entry| entry.key == key) {
            Some(entry) => entry.value = Box::new(value),
            None => self.entries.push(Entry {
                key,
                value: Box::new(value),
            }),
        }
    }

    /// Get a reference to the value stored at `key`, if it exists and
    /// has type `T`.
    pub fn get<T: 'static>(&self, key: &str) -> Option<&T> {
        self.entries
            .iter()
            .find(|entry| entry.key == key)
            .and_then(|entry| entry.value.downcast_ref())
    }

    /// Get a mutable reference to the value stored at `key`.
    pub fn get_mut<T: 'static>(&mut self, key: &str) -> Option<&mut T> {
        self.entries
            .iter_mut()
            .find(|entry| entry.key == key)
            .and_then(|entry| entry.value.downcast_mut())
    }

    /// Convenience accessor for string values.
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.get::<String>(key).map(String::as_str)
    }

    /// Convenience accessor for integer values.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get::<i64>(key).copied()
    }

    /// Remove the entry at `key`, reporting whether one existed.
    pub fn remove(&mut self, key: &str) -> bool {
        match self.entries.iter().position(|entry| entry.key == key) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Whether an entry exists at `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|entry| entry.key == key)
    }

    /// Visit every entry in insertion order.
    pub fn visit(&self, mut visitor: impl FnMut(&str, &(dyn Any + Send + Sync))) {
        for entry in &self.entries {
            visitor(&entry.key, entry.value.as_ref());
        }
    }

    /// The keys currently present, in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.key.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_replace() {
        let mut store = Store::new();
        store.set("a", String::from("first"));
        store.set("b", 5i64);
        assert_eq!(store.get_string("a"), Some("first"));
        assert_eq!(store.get_i64("b"), Some(5));

        store.set("a", String::from("second"));
        assert_eq!(store.get_string("a"), Some("second"));
        assert_eq!(store.len(), 2);

        assert!(store.remove("a"));
        assert!(!store.remove("a"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn reset_retains_capacity() {
        let mut store = Store::new();
        for i in 0..32 {
            store.set(format!("key-{i}"), i);
        }
        store.reset();
        assert!(store.is_empty());
        assert!(store.entries.capacity() >= 32);
    }

    #[test]
    fn wrong_type_is_none() {
        let mut store = Store::new();
        store.set("a", 5i64);
        assert!(store.get::<String>("a").is_none());
    }
}
