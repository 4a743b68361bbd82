//! Cross-tab leader lease on top of a [`SharedStore`].
//!
//! The store has no compare-and-swap, so this is a lease rather than a mutex: a record older
//! than the expiry window may be stolen by anyone, and a live holder keeps it fresh by
//! rewriting it more often than it expires. Two tabs stealing the same expired record at the
//! same instant will both believe they lead until the next heartbeat notices; that window is
//! accepted.

use crate::clock::Clock;
use crate::store::{SharedStore, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// The value stored under a lock key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    /// The tab holding the lease.
    pub owner_id: String,
    /// When the holder last wrote the record, in milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl LockRecord {
    /// Returns true if the record has not been refreshed within `expiry`.
    pub fn is_expired(&self, now_millis: i64, expiry: Duration) -> bool {
        now_millis.saturating_sub(self.timestamp) > expiry.as_millis() as i64
    }
}

/// A lease held by one tab, identified by `owner_id`.
#[derive(Clone)]
pub struct LeaderLock {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    owner_id: String,
    expiry: Duration,
}

impl std::fmt::Debug for LeaderLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderLock")
            .field("owner_id", &self.owner_id)
            .field("expiry", &self.expiry)
            .finish()
    }
}

impl LeaderLock {
    /// Creates a lease handle for `owner_id`.
    pub fn new(
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        owner_id: impl Into<String>,
        expiry: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            owner_id: owner_id.into(),
            expiry,
        }
    }

    /// The identifier written into records this handle owns.
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Reads the current record for `key`. Unparseable records read as absent.
    pub fn holder(&self, key: &str) -> Result<Option<LockRecord>, StoreError> {
        let raw = self.store.get(key)?;
        Ok(raw.and_then(|raw| match serde_json::from_str::<LockRecord>(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                log::warn!("Ignoring unreadable lock record under '{}': {}", key, e);
                None
            }
        }))
    }

    /// Returns true if `record` belongs to another tab and has not expired.
    pub fn is_held_by_other(&self, record: &LockRecord) -> bool {
        record.owner_id != self.owner_id
            && !record.is_expired(self.clock.now_millis(), self.expiry)
    }

    /// Attempts to take the lease for `key`.
    ///
    /// Succeeds when no record exists, when the record has expired (stealing it), or when this
    /// tab already owns it. If the store cannot be read or written the lease is assumed granted.
    pub fn try_acquire(&self, key: &str) -> bool {
        let current = match self.holder(key) {
            Ok(current) => current,
            Err(e) => {
                log::warn!(
                    "Lock store unreadable for '{}', assuming leadership: {}",
                    key,
                    e
                );
                return true;
            }
        };

        match current {
            Some(record)
                if record.owner_id == self.owner_id
                    && !record.is_expired(self.clock.now_millis(), self.expiry) =>
            {
                true
            }
            Some(record) if self.is_held_by_other(&record) => {
                log::debug!("Lock '{}' is held by tab {}", key, record.owner_id);
                false
            }
            previous => {
                match previous {
                    Some(record) if record.owner_id == self.owner_id => {
                        log::debug!("Renewing own expired lock '{}'", key);
                    }
                    Some(record) => log::info!(
                        "Stealing expired lock '{}' from tab {}",
                        key,
                        record.owner_id
                    ),
                    None => {}
                }
                if let Err(e) = self.write(key) {
                    log::warn!(
                        "Failed to write lock '{}', assuming leadership: {}",
                        key,
                        e
                    );
                }
                true
            }
        }
    }

    /// Overwrites the record for `key` with a fresh timestamp owned by this tab.
    pub fn refresh(&self, key: &str) -> Result<(), StoreError> {
        self.write(key)
    }

    /// Deletes the record for `key` if this tab owns it. Returns true if a record was removed.
    pub fn release(&self, key: &str) -> bool {
        match self.holder(key) {
            Ok(Some(record)) if record.owner_id == self.owner_id => match self.store.remove(key) {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("Failed to release lock '{}': {}", key, e);
                    false
                }
            },
            Ok(_) => false,
            Err(e) => {
                log::warn!("Lock store unreadable while releasing '{}': {}", key, e);
                false
            }
        }
    }

    fn write(&self, key: &str) -> Result<(), StoreError> {
        let record = LockRecord {
            owner_id: self.owner_id.clone(),
            timestamp: self.clock.now_millis(),
        };
        // Serializing two plain fields cannot fail.
        let value = serde_json::to_string(&record).unwrap_or_default();
        self.store.set(key, &value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

    #[derive(Default)]
    struct TestStore {
        data: Mutex<HashMap<String, String>>,
        broken: AtomicBool,
    }

    impl SharedStore for TestStore {
        fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("blocked".to_string()));
            }
            Ok(self.data.lock().unwrap().get(key).cloned())
        }
        fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(StoreError::QuotaExceeded);
            }
            self.data
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
            Ok(())
        }
        fn remove(&self, key: &str) -> Result<(), StoreError> {
            self.data.lock().unwrap().remove(key);
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestClock(AtomicI64);

    impl TestClock {
        fn advance(&self, by: Duration) {
            self.0.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
        }
    }

    impl Clock for TestClock {
        fn now_millis(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    const EXPIRY: Duration = Duration::from_secs(5);

    fn locks() -> (Arc<TestStore>, Arc<TestClock>, LeaderLock, LeaderLock) {
        let store = Arc::new(TestStore::default());
        let clock = Arc::new(TestClock::default());
        let a = LeaderLock::new(store.clone(), clock.clone(), "tab-a", EXPIRY);
        let b = LeaderLock::new(store.clone(), clock.clone(), "tab-b", EXPIRY);
        (store, clock, a, b)
    }

    #[test]
    fn first_acquirer_wins() {
        let (_, _, a, b) = locks();
        assert!(a.try_acquire("k"));
        assert!(!b.try_acquire("k"));
        assert_eq!(a.holder("k").unwrap().unwrap().owner_id, "tab-a");
    }

    #[test]
    fn owner_can_reacquire() {
        let (_, _, a, _) = locks();
        assert!(a.try_acquire("k"));
        assert!(a.try_acquire("k"));
    }

    #[test]
    fn owner_rewrites_its_own_expired_record() {
        let (_, clock, a, b) = locks();
        assert!(a.try_acquire("k"));
        clock.advance(Duration::from_secs(60));

        assert!(a.try_acquire("k"));
        let record = a.holder("k").unwrap().unwrap();
        assert_eq!(record.timestamp, 60_000);
        assert!(!record.is_expired(clock.now_millis(), EXPIRY));
        assert!(!b.try_acquire("k"));
    }

    #[test]
    fn expired_lock_is_stolen() {
        let (_, clock, a, b) = locks();
        assert!(a.try_acquire("k"));
        clock.advance(Duration::from_millis(5_001));
        assert!(b.try_acquire("k"));
        assert_eq!(b.holder("k").unwrap().unwrap().owner_id, "tab-b");
        assert!(!a.try_acquire("k"));
    }

    #[test]
    fn lock_at_exact_expiry_is_still_held() {
        let (_, clock, a, b) = locks();
        assert!(a.try_acquire("k"));
        clock.advance(EXPIRY);
        assert!(!b.try_acquire("k"));
    }

    #[test]
    fn refresh_keeps_the_lease_alive() {
        let (_, clock, a, b) = locks();
        assert!(a.try_acquire("k"));
        for _ in 0..5 {
            clock.advance(Duration::from_secs(3));
            a.refresh("k").unwrap();
            assert!(!b.try_acquire("k"));
        }
    }

    #[test]
    fn release_only_removes_own_record() {
        let (store, _, a, b) = locks();
        assert!(a.try_acquire("k"));
        assert!(!b.release("k"));
        assert!(store.data.lock().unwrap().contains_key("k"));
        assert!(a.release("k"));
        assert!(!a.release("k"));
        assert!(b.try_acquire("k"));
    }

    #[test]
    fn unreadable_record_counts_as_absent() {
        let (store, _, a, _) = locks();
        store
            .data
            .lock()
            .unwrap()
            .insert("k".to_string(), "{garbage".to_string());
        assert!(a.try_acquire("k"));
        assert_eq!(a.holder("k").unwrap().unwrap().owner_id, "tab-a");
    }

    #[test]
    fn store_failure_assumes_leadership() {
        let (store, _, a, b) = locks();
        assert!(a.try_acquire("k"));
        store.broken.store(true, Ordering::SeqCst);
        assert!(b.try_acquire("k"));
    }
}
