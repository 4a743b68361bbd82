use herald_core::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct StoreData {
    entries: HashMap<String, String>,
    unavailable: bool,
    full: bool,
}

/// An in-memory shared store.
///
/// Clones share the same entries. Failures can be injected to exercise the "store unusable"
/// paths: [`set_unavailable`](Self::set_unavailable) fails every operation and
/// [`set_full`](Self::set_full) rejects writes with [`StoreError::QuotaExceeded`].
#[derive(Clone, Debug, Default)]
pub struct InMemorySharedStore(Arc<Mutex<StoreData>>);

impl InMemorySharedStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        log::debug!("Creating a new InMemorySharedStore");
        Self::default()
    }

    fn data(&self) -> MutexGuard<'_, StoreData> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every operation fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.data().unavailable = unavailable;
    }

    /// Makes writes fail with [`StoreError::QuotaExceeded`].
    pub fn set_full(&self, full: bool) {
        self.data().full = full;
    }

    /// The stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data().entries.keys().cloned().collect();
        keys.sort();
        keys
    }
}

fn check_available(data: &StoreData) -> Result<(), StoreError> {
    if data.unavailable {
        return Err(StoreError::Unavailable("store disabled".to_string()));
    }
    Ok(())
}

impl SharedStore for InMemorySharedStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let data = self.data();
        check_available(&data)?;
        Ok(data.entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut data = self.data();
        check_available(&data)?;
        if data.full {
            return Err(StoreError::QuotaExceeded);
        }
        data.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut data = self.data();
        check_available(&data)?;
        data.entries.remove(key);
        Ok(())
    }
}
