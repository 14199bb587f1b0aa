//! Copy-on-write process table.
//!
//! Readers take a snapshot of the whole map and never wait on writers beyond the
//! pointer swap. Writers serialise on their own mutex, publish a new map and bump the
//! epoch. Replaced snapshots are remembered weakly; removal waits until none of
//! them has a reader left, so no reader can still see the removed entry.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

/// A snapshot of the table as of one epoch.
#[derive(Debug)]
pub struct ReadGuard<K, V> {
    snapshot: Arc<HashMap<K, V>>,
    epoch: u64,
}

impl<K, V> ReadGuard<K, V> {
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl<K, V> Deref for ReadGuard<K, V> {
    type Target = HashMap<K, V>;

    fn deref(&self) -> &Self::Target {
        &self.snapshot
    }
}

#[derive(Debug)]
pub struct ProcessTable<K, V> {
    current: RwLock<(Arc<HashMap<K, V>>, u64)>,
    /// Serialises writers; holds the replaced snapshots that may still have readers.
    writer: Mutex<Vec<Weak<HashMap<K, V>>>>,
    epoch: AtomicU64,
}

impl<K, V> Default for ProcessTable<K, V> {
    fn default() -> Self {
        Self {
            current: RwLock::new((Arc::new(HashMap::new()), 0)),
            writer: Mutex::new(Vec::new()),
            epoch: AtomicU64::new(0),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> ProcessTable<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of published updates.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn read(&self) -> ReadGuard<K, V> {
        let current = self.current.read();
        ReadGuard {
            snapshot: current.0.clone(),
            epoch: current.1,
        }
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        self.read().get(key).cloned()
    }

    /// First value matching `pred`.
    pub fn find(&self, mut pred: impl FnMut(&V) -> bool) -> Option<V> {
        self.read().values().find(|v| pred(v)).cloned()
    }

    /// Returns the value under `key`, creating it with `make` if absent. The flag is
    /// true when `make` ran.
    ///
    /// # Errors
    /// Whatever `make` returns; the table is left unchanged.
    pub fn get_or_try_insert_with<E>(&self, key: K, make: impl FnOnce() -> Result<V, E>) -> Result<(V, bool), E> {
        let mut retired = self.writer.lock();
        if let Some(existing) = self.current.read().0.get(&key) {
            return Ok((existing.clone(), false));
        }
        let value = make()?;
        self.publish(&mut retired, |map| {
            map.insert(key, value.clone());
        });
        Ok((value, true))
    }

    /// Unpublishes `key` and waits out the readers that could still observe it.
    ///
    /// Must not be called while the calling thread holds a `ReadGuard` of this table.
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut retired = self.writer.lock();
        if !self.current.read().0.contains_key(key) {
            return None;
        }
        let mut removed = None;
        self.publish(&mut retired, |map| removed = map.remove(key));
        Self::synchronize(&mut retired);
        removed
    }

    /// Swaps in an edited copy of the map and retires the previous snapshot.
    fn publish(&self, retired: &mut Vec<Weak<HashMap<K, V>>>, edit: impl FnOnce(&mut HashMap<K, V>)) {
        let mut next = (*self.current.read().0).clone();
        edit(&mut next);
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let old = std::mem::replace(&mut *self.current.write(), (Arc::new(next), epoch)).0;
        retired.retain(|w| w.strong_count() > 0);
        retired.push(Arc::downgrade(&old));
    }

    /// Waits until no retired snapshot has a reader left.
    fn synchronize(retired: &mut Vec<Weak<HashMap<K, V>>>) {
        loop {
            retired.retain(|w| w.strong_count() > 0);
            if retired.is_empty() {
                return;
            }
            std::thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn snapshots_are_stable_across_updates() {
        let table: ProcessTable<u32, &'static str> = ProcessTable::new();
        table.get_or_try_insert_with(1, || Ok::<_, ()>("one")).unwrap();

        let guard = table.read();
        table.get_or_try_insert_with(2, || Ok::<_, ()>("two")).unwrap();

        assert_eq!(guard.len(), 1);
        assert_eq!(guard.epoch(), 1);
        assert_eq!(table.read().len(), 2);
        assert_eq!(table.epoch(), 2);
    }

    #[test]
    fn existing_entries_are_not_rebuilt() {
        let table: ProcessTable<u32, u32> = ProcessTable::new();
        assert_eq!(table.get_or_try_insert_with(7, || Ok::<_, ()>(70)), Ok((70, true)));
        assert_eq!(table.get_or_try_insert_with(7, || Err(())), Ok((70, false)));
        assert_eq!(table.get_or_try_insert_with(8, || Err(())), Err(()));
        assert_eq!(table.epoch(), 1);
    }

    #[test]
    fn removal_waits_for_older_readers() {
        let table: Arc<ProcessTable<u32, u32>> = Arc::new(ProcessTable::new());
        table.get_or_try_insert_with(1, || Ok::<_, ()>(10)).unwrap();

        let guard = table.read();
        let removed = Arc::new(AtomicBool::new(false));
        let remover = {
            let table = table.clone();
            let removed = removed.clone();
            std::thread::spawn(move || {
                assert_eq!(table.remove(&1), Some(10));
                removed.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!removed.load(Ordering::SeqCst));
        assert_eq!(guard.get(&1), Some(&10));
        assert_eq!(table.get(&1), None);

        drop(guard);
        remover.join().unwrap();
        assert!(removed.load(Ordering::SeqCst));
    }

    #[test]
    fn removal_waits_for_readers_behind_a_later_insert() {
        let table: Arc<ProcessTable<u32, u32>> = Arc::new(ProcessTable::new());
        table.get_or_try_insert_with(1, || Ok::<_, ()>(10)).unwrap();

        let guard = table.read();
        table.get_or_try_insert_with(2, || Ok::<_, ()>(20)).unwrap();
        let removed = Arc::new(AtomicBool::new(false));
        let remover = {
            let table = table.clone();
            let removed = removed.clone();
            std::thread::spawn(move || {
                assert_eq!(table.remove(&1), Some(10));
                removed.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!removed.load(Ordering::SeqCst));
        assert_eq!(guard.epoch(), 1);
        assert_eq!(guard.get(&1), Some(&10));

        drop(guard);
        remover.join().unwrap();
        assert!(removed.load(Ordering::SeqCst));
        assert_eq!(table.get(&2), Some(20));
    }

    #[test]
    fn removing_a_missing_key_does_not_wait() {
        let table: ProcessTable<u32, u32> = ProcessTable::new();
        let _guard = table.read();
        assert_eq!(table.remove(&3), None);
    }
}
