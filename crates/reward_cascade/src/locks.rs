use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, LockResult, Mutex, MutexGuard};

/// A table of independent mutexes, one per key, created on first use and
/// dropped once no caller holds or waits on it.
///
/// Holders of different keys never wait on each other; the table mutex is
/// only held while looking up or pruning the entry.
#[derive(Debug)]
pub(crate) struct KeyedLocks<K> {
    entries: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn with_lock<R>(&self, key: &K, f: impl FnOnce() -> R) -> R {
        let entry = {
            let mut entries = recover(self.entries.lock());
            Arc::clone(
                entries
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let out = {
            let _guard = recover(entry.lock());
            f()
        };

        // Every clone of the entry is taken under the table mutex, so a count
        // of two (table + ours) means nobody else is waiting on this key.
        let mut entries = recover(self.entries.lock());
        if Arc::strong_count(&entry) == 2 {
            entries.remove(key);
        }
        out
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        recover(self.entries.lock()).len()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

fn recover<'a, T>(result: LockResult<MutexGuard<'a, T>>) -> MutexGuard<'a, T> {
    result.unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::KeyedLocks;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn same_key_sections_never_overlap() {
        let locks = Arc::new(KeyedLocks::<String>::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    for _ in 0..50 {
                        locks.with_lock(&"c-1".to_string(), || {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            inside.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn released_keys_are_pruned() {
        let locks = KeyedLocks::<String>::new();
        for index in 0..100 {
            locks.with_lock(&format!("c-{index}"), || ());
        }
        assert_eq!(locks.len(), 0);

        let inner = locks.with_lock(&"c-1".to_string(), || {
            locks.with_lock(&"c-2".to_string(), || locks.len())
        });
        assert_eq!(inner, 2);
        assert_eq!(locks.len(), 0);
    }

    #[test]
    fn different_keys_can_nest() {
        let locks = KeyedLocks::<u64>::new();
        let value = locks.with_lock(&1, || locks.with_lock(&2, || 7));
        assert_eq!(value, 7);
    }
}
