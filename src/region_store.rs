//! Per-thread stores of defined regions.
//!
//! Every thread that defines a region gets a store and a dense thread index,
//! assigned in order of first definition. The index is what reports print in
//! the `thread` column.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use anyhow::Result;

use crate::error::EmaError;
use crate::region::Region;

pub const THREAD_LIMIT: usize = 1024;

/// Regions of one thread, in definition order.
#[derive(Debug, Default)]
pub struct RegionStore {
    regions: Vec<Region>,
    index: HashMap<String, usize>,
}

impl RegionStore {
    /// Insert `region`, or return the region already stored under its key.
    pub fn insert(&mut self, region: Region) -> Region {
        let key = region.with_data(|data| data.key());
        if let Some(&idx) = self.index.get(&key) {
            return self.regions[idx].clone();
        }
        self.index.insert(key, self.regions.len());
        self.regions.push(region.clone());
        region
    }

    pub fn get(&self, key: &str) -> Option<&Region> {
        self.index.get(key).map(|&idx| &self.regions[idx])
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }
}

#[derive(Debug, Default)]
pub struct RegionStores {
    stores: Mutex<Vec<(ThreadId, RegionStore)>>,
}

impl RegionStores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `region` in the calling thread's store.
    pub fn define(&self, region: Region) -> Result<Region> {
        let id = thread::current().id();
        let mut stores = self.lock();
        let idx = match stores.iter().position(|(tid, _)| *tid == id) {
            Some(idx) => idx,
            None => {
                if stores.len() >= THREAD_LIMIT {
                    return Err(EmaError::ThreadLimit {
                        limit: THREAD_LIMIT,
                    }
                    .into());
                }
                tracing::debug!("Thread {:?} gets region store {}", id, stores.len());
                stores.push((id, RegionStore::default()));
                stores.len() - 1
            }
        };
        Ok(stores[idx].1.insert(region))
    }

    /// Index of the calling thread, if it has defined a region.
    pub fn current_thread_index(&self) -> Option<usize> {
        let id = thread::current().id();
        self.lock().iter().position(|(tid, _)| *tid == id)
    }

    pub fn thread_count(&self) -> usize {
        self.lock().len()
    }

    /// Visit every region as `(thread index, region)`, by thread index and
    /// then definition order. Stops at the first error.
    pub fn try_for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(usize, &Region) -> Result<()>,
    {
        let stores = self.lock();
        for (thread_idx, (_, store)) in stores.iter().enumerate() {
            for region in store.iter() {
                f(thread_idx, region)?;
            }
        }
        Ok(())
    }

    /// Drop all stores. Outstanding region handles stay usable but are no
    /// longer reported.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(ThreadId, RegionStore)>> {
        self.stores
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::region::CodeLocation;

    fn region(idf: &str, line: u32) -> Region {
        Region::new(idf, CodeLocation::new("lib.rs", line, "tests"), Vec::new())
    }

    #[test]
    fn test_define_same_key_returns_existing() {
        let stores = RegionStores::new();
        let first = stores.define(region("r", 1)).unwrap();
        let second = stores.define(region("r", 1)).unwrap();
        assert!(first.ptr_eq(&second));

        let other_line = stores.define(region("r", 2)).unwrap();
        assert!(!first.ptr_eq(&other_line));

        let mut count = 0;
        stores
            .try_for_each(|_, _| {
                count += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_definition_order() {
        let stores = RegionStores::new();
        for idf in ["c", "a", "b"] {
            stores.define(region(idf, 1)).unwrap();
        }
        let mut seen = Vec::new();
        stores
            .try_for_each(|thread_idx, r| {
                seen.push((thread_idx, r.idf()));
                Ok(())
            })
            .unwrap();
        assert_eq!(
            seen,
            vec![
                (0, "c".to_string()),
                (0, "a".to_string()),
                (0, "b".to_string())
            ]
        );
    }

    #[test]
    fn test_threads_get_dense_indices() {
        let stores = Arc::new(RegionStores::new());
        assert_eq!(stores.current_thread_index(), None);
        stores.define(region("main", 1)).unwrap();
        assert_eq!(stores.current_thread_index(), Some(0));

        for i in 0..3 {
            let stores = stores.clone();
            thread::spawn(move || {
                stores.define(region("worker", 1)).unwrap();
                assert_eq!(stores.current_thread_index(), Some(i + 1));
            })
            .join()
            .unwrap();
        }
        assert_eq!(stores.thread_count(), 4);
    }

    #[test]
    fn test_thread_limit() {
        let stores = Arc::new(RegionStores::new());
        {
            let mut inner = stores.lock();
            for _ in 0..THREAD_LIMIT {
                // Ids of finished threads are never reused.
                let id = thread::spawn(|| thread::current().id()).join().unwrap();
                inner.push((id, RegionStore::default()));
            }
        }
        let err = stores.define(region("r", 1)).unwrap_err();
        assert_eq!(
            err.downcast_ref::<EmaError>(),
            Some(&EmaError::ThreadLimit {
                limit: THREAD_LIMIT
            })
        );
    }

    #[test]
    fn test_clear() {
        let stores = RegionStores::new();
        stores.define(region("r", 1)).unwrap();
        stores.clear();
        assert_eq!(stores.thread_count(), 0);
    }

    #[test]
    fn test_store_lookup() {
        let mut store = RegionStore::default();
        assert!(store.is_empty());
        store.insert(region("r", 7));
        assert_eq!(store.len(), 1);
        assert!(store.get("lib.rs:7(tests:r)").is_some());
        assert!(store.get("lib.rs:8(tests:r)").is_none());
    }
}
