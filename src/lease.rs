use crate::clock::Clock;
use crate::db::{keys, KvStore, KvStoreExt};
use crate::errors::AppResult;
use crate::models::Lease;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct LeaseLock {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    timeout_ms: i64,
}

impl LeaseLock {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            store,
            clock,
            timeout_ms: i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX),
        }
    }

    /// Returns true only if a re-read after writing shows `context_id` as owner.
    /// Storage failures count as not acquired.
    pub fn acquire(&self, context_id: &str) -> bool {
        match self.try_acquire(context_id) {
            Ok(acquired) => {
                tracing::debug!(context_id = %context_id, acquired, "lease acquire attempt");
                acquired
            }
            Err(error) => {
                tracing::warn!(context_id = %context_id, error = %error, "lease acquire failed");
                false
            }
        }
    }

    fn try_acquire(&self, context_id: &str) -> AppResult<bool> {
        let now = self.clock.now_ms();
        let observed = self.store.get(keys::LEASE)?;
        if let Some(raw) = observed.as_deref() {
            match serde_json::from_str::<Lease>(raw) {
                Ok(current) => {
                    let expired = now.saturating_sub(current.timestamp) > self.timeout_ms;
                    if current.owner_id != context_id && !expired {
                        return Ok(false);
                    }
                    if expired && current.owner_id != context_id {
                        tracing::info!(
                            context_id = %context_id,
                            previous_owner = %current.owner_id,
                            "reclaiming expired lease"
                        );
                    }
                }
                Err(error) => {
                    tracing::warn!(error = %error, "overwriting unreadable lease slot");
                }
            }
        }

        let lease = serde_json::to_string(&Lease {
            owner_id: context_id.to_string(),
            timestamp: now,
        })?;
        if !self
            .store
            .compare_and_swap(keys::LEASE, observed.as_deref(), &lease)?
        {
            return Ok(false);
        }

        Ok(self
            .current()?
            .map(|lease| lease.owner_id == context_id)
            .unwrap_or(false))
    }

    pub fn release(&self, context_id: &str) {
        let result = self.current().and_then(|current| match current {
            Some(lease) if lease.owner_id == context_id => self.store.remove(keys::LEASE),
            _ => Ok(()),
        });
        if let Err(error) = result {
            tracing::warn!(context_id = %context_id, error = %error, "lease release failed");
        }
    }

    pub fn current(&self) -> AppResult<Option<Lease>> {
        self.store.get_json::<Lease>(keys::LEASE)
    }

    pub fn guard(&self, context_id: &str) -> Option<LeaseGuard> {
        if self.acquire(context_id) {
            Some(LeaseGuard {
                lock: self.clone(),
                context_id: context_id.to_string(),
            })
        } else {
            None
        }
    }
}

pub struct LeaseGuard {
    lock: LeaseLock,
    context_id: String,
}

impl LeaseGuard {
    pub fn context_id(&self) -> &str {
        &self.context_id
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.lock.release(&self.context_id);
    }
}

#[cfg(test)]
mod tests {
    use super::LeaseLock;
    use crate::clock::ManualClock;
    use crate::db::{keys, KvStore, MemoryStore};
    use crate::errors::{AppError, AppResult};
    use std::sync::Arc;
    use std::time::Duration;

    fn lock(store: Arc<dyn KvStore>, clock: &Arc<ManualClock>) -> LeaseLock {
        LeaseLock::new(store, clock.clone(), Duration::from_secs(5))
    }

    #[test]
    fn second_owner_is_refused_until_release() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(10_000));
        let lease = lock(store, &clock);

        assert!(lease.acquire("a"));
        assert!(!lease.acquire("b"));
        assert!(lease.acquire("a"), "re-entrant for the owner");

        lease.release("a");
        assert!(lease.acquire("b"));
    }

    #[test]
    fn release_by_non_owner_is_a_noop() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let lease = lock(store, &clock);

        assert!(lease.acquire("a"));
        lease.release("b");
        assert_eq!(lease.current().expect("read").map(|l| l.owner_id), Some("a".to_string()));
    }

    #[test]
    fn expired_lease_can_be_reclaimed_by_anyone() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let lease = lock(store, &clock);

        assert!(lease.acquire("dead"));
        clock.advance(5_000);
        assert!(!lease.acquire("b"), "exactly at the timeout the lease is still live");
        clock.advance(1);
        assert!(lease.acquire("b"));

        lease.release("dead");
        assert_eq!(lease.current().expect("read").map(|l| l.owner_id), Some("b".to_string()));
    }

    #[test]
    fn guard_releases_on_drop() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let lease = lock(store, &clock);

        {
            let guard = lease.guard("a").expect("guard");
            assert_eq!(guard.context_id(), "a");
            assert!(lease.guard("b").is_none());
        }
        assert!(lease.current().expect("read").is_none());
    }

    struct RacingStore {
        inner: MemoryStore,
    }

    impl KvStore for RacingStore {
        fn get(&self, key: &str) -> AppResult<Option<String>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> AppResult<()> {
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> AppResult<()> {
            self.inner.remove(key)
        }

        fn keys_with_prefix(&self, prefix: &str) -> AppResult<Vec<String>> {
            self.inner.keys_with_prefix(prefix)
        }

        fn compare_and_swap(&self, key: &str, expected: Option<&str>, value: &str) -> AppResult<bool> {
            let swapped = self.inner.compare_and_swap(key, expected, value)?;
            if key == keys::LEASE {
                self.inner
                    .set(key, r#"{"ownerId":"rival","timestamp":0}"#)?;
            }
            Ok(swapped)
        }
    }

    #[test]
    fn lost_write_race_is_not_acquisition() {
        let store: Arc<dyn KvStore> = Arc::new(RacingStore {
            inner: MemoryStore::new(),
        });
        let clock = Arc::new(ManualClock::new(0));
        assert!(!lock(store, &clock).acquire("me"));
    }

    struct BrokenStore;

    impl KvStore for BrokenStore {
        fn get(&self, _key: &str) -> AppResult<Option<String>> {
            Err(AppError::Io("disk gone".to_string()))
        }

        fn set(&self, _key: &str, _value: &str) -> AppResult<()> {
            Err(AppError::Io("disk gone".to_string()))
        }

        fn remove(&self, _key: &str) -> AppResult<()> {
            Err(AppError::Io("disk gone".to_string()))
        }

        fn keys_with_prefix(&self, _prefix: &str) -> AppResult<Vec<String>> {
            Err(AppError::Io("disk gone".to_string()))
        }

        fn compare_and_swap(&self, _key: &str, _expected: Option<&str>, _value: &str) -> AppResult<bool> {
            Err(AppError::Io("disk gone".to_string()))
        }
    }

    #[test]
    fn io_errors_mean_not_acquired_and_release_swallows() {
        let clock = Arc::new(ManualClock::new(0));
        let lease = lock(Arc::new(BrokenStore), &clock);
        assert!(!lease.acquire("a"));
        lease.release("a");
    }

    #[test]
    fn concurrent_acquirers_see_exactly_one_winner() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let lease = lock(store, &clock);

        let winners = std::thread::scope(|scope| {
            let handles = (0..8)
                .map(|index| {
                    let lease = lease.clone();
                    scope.spawn(move || lease.acquire(&format!("ctx-{}", index)))
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("join"))
                .filter(|won| *won)
                .count()
        });
        assert_eq!(winners, 1);
    }
}
