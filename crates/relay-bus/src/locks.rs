use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

use relay_store::leases::LeaseRepo;
use relay_store::Database;

use crate::error::LockError;

const LEASE_RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Produces a mutual-exclusion handle per `(namespace, key)`.
///
/// The variant is chosen once at construction and is invisible to call
/// sites: in-process keyed mutexes for single-process deployments, or
/// expiring leases in the shared database when independent processes can
/// race on the same resource. Lease TTL equals the acquire timeout, so a
/// crashed holder self-releases instead of deadlocking other callers.
pub struct LockFactory {
    mode: Mode,
}

enum Mode {
    InProcess {
        slots: DashMap<(String, String), Arc<Mutex<()>>>,
    },
    Lease {
        leases: Arc<LeaseRepo>,
        holder_prefix: String,
    },
}

impl LockFactory {
    /// Locks scoped to this process only. No expiry needed — the holder
    /// and the process share a fate.
    pub fn in_process() -> Self {
        Self {
            mode: Mode::InProcess {
                slots: DashMap::new(),
            },
        }
    }

    /// Cross-process locks backed by lease rows in the shared database.
    /// `holder_prefix` identifies this process in lease ownership (e.g. a
    /// hostname:pid string).
    pub fn distributed(db: Database, holder_prefix: impl Into<String>) -> Self {
        Self {
            mode: Mode::Lease {
                leases: Arc::new(LeaseRepo::new(db)),
                holder_prefix: holder_prefix.into(),
            },
        }
    }

    /// Acquire the lock for `(namespace, key)`, waiting up to `timeout`.
    ///
    /// The returned handle releases on drop on every exit path. In
    /// distributed mode `timeout` is also the lease TTL.
    pub async fn acquire(
        &self,
        namespace: &str,
        key: &str,
        timeout: Duration,
    ) -> Result<LockHandle, LockError> {
        match &self.mode {
            Mode::InProcess { slots } => {
                let slot = slots
                    .entry((namespace.to_string(), key.to_string()))
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .clone();

                let guard = tokio::time::timeout(timeout, slot.lock_owned())
                    .await
                    .map_err(|_| LockError::Timeout {
                        namespace: namespace.to_string(),
                        key: key.to_string(),
                    })?;

                Ok(LockHandle {
                    inner: Some(HandleInner::InProcess(guard)),
                })
            }
            Mode::Lease {
                leases,
                holder_prefix,
            } => {
                // Unique per handle so release only ever affects this
                // acquisition.
                let holder = format!("{holder_prefix}:{}", Uuid::now_v7());
                let deadline = tokio::time::Instant::now() + timeout;

                loop {
                    if leases.try_acquire(namespace, key, &holder, timeout)? {
                        debug!(namespace, key, holder, "lease acquired");
                        return Ok(LockHandle {
                            inner: Some(HandleInner::Lease {
                                leases: Arc::clone(leases),
                                namespace: namespace.to_string(),
                                key: key.to_string(),
                                holder,
                            }),
                        });
                    }
                    if tokio::time::Instant::now() + LEASE_RETRY_INTERVAL > deadline {
                        return Err(LockError::Timeout {
                            namespace: namespace.to_string(),
                            key: key.to_string(),
                        });
                    }
                    tokio::time::sleep(LEASE_RETRY_INTERVAL).await;
                }
            }
        }
    }
}

enum HandleInner {
    InProcess(OwnedMutexGuard<()>),
    Lease {
        leases: Arc<LeaseRepo>,
        namespace: String,
        key: String,
        holder: String,
    },
}

/// Scoped ownership of one `(namespace, key)` lock. Dropping the handle
/// releases it.
pub struct LockHandle {
    inner: Option<HandleInner>,
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Some(HandleInner::Lease {
            leases,
            namespace,
            key,
            holder,
        }) = self.inner.take()
        {
            if let Err(e) = leases.release(&namespace, &key, &holder) {
                tracing::warn!(namespace, key, error = %e, "failed to release lease");
            }
        }
        // The in-process guard releases when it drops.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WAIT: Duration = Duration::from_millis(500);

    #[tokio::test]
    async fn in_process_lock_excludes_same_key() {
        let factory = Arc::new(LockFactory::in_process());
        let counter = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let factory = Arc::clone(&factory);
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                let _lock = factory.acquire("runs", "sess_1", WAIT).await.unwrap();
                let before = counter.fetch_add(1, Ordering::SeqCst);
                // Nobody else should enter the critical section
                tokio::time::sleep(Duration::from_millis(5)).await;
                assert_eq!(counter.load(Ordering::SeqCst), before + 1);
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn in_process_different_keys_do_not_block() {
        let factory = LockFactory::in_process();
        let _a = factory.acquire("runs", "sess_1", WAIT).await.unwrap();
        // Different key and different namespace both acquire immediately
        let _b = factory.acquire("runs", "sess_2", WAIT).await.unwrap();
        let _c = factory.acquire("reaper", "sess_1", WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn in_process_acquire_times_out_while_held() {
        let factory = LockFactory::in_process();
        let _held = factory.acquire("runs", "sess_1", WAIT).await.unwrap();

        let result = factory
            .acquire("runs", "sess_1", Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(LockError::Timeout { .. })));
    }

    #[tokio::test]
    async fn in_process_release_on_drop() {
        let factory = LockFactory::in_process();
        {
            let _lock = factory.acquire("runs", "sess_1", WAIT).await.unwrap();
        }
        let _again = factory.acquire("runs", "sess_1", WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn lease_lock_excludes_same_key() {
        let db = Database::in_memory().unwrap();
        let factory = LockFactory::distributed(db, "proc_a");

        let _held = factory.acquire("runs", "sess_1", WAIT).await.unwrap();
        let result = factory
            .acquire("runs", "sess_1", Duration::from_millis(80))
            .await;
        assert!(matches!(result, Err(LockError::Timeout { .. })));
    }

    #[tokio::test]
    async fn lease_lock_release_on_drop() {
        let db = Database::in_memory().unwrap();
        let factory = LockFactory::distributed(db.clone(), "proc_a");
        {
            let _lock = factory.acquire("runs", "sess_1", WAIT).await.unwrap();
            let repo = LeaseRepo::new(db.clone());
            assert!(repo.holder("runs", "sess_1").unwrap().is_some());
        }
        let repo = LeaseRepo::new(db);
        assert!(repo.holder("runs", "sess_1").unwrap().is_none());
    }

    #[tokio::test]
    async fn lease_lock_spans_factories_sharing_a_database() {
        // Two factories over the same database model two processes.
        let db = Database::in_memory().unwrap();
        let factory_a = LockFactory::distributed(db.clone(), "proc_a");
        let factory_b = LockFactory::distributed(db, "proc_b");

        let held = factory_a.acquire("runs", "sess_1", WAIT).await.unwrap();
        let result = factory_b
            .acquire("runs", "sess_1", Duration::from_millis(80))
            .await;
        assert!(matches!(result, Err(LockError::Timeout { .. })));

        drop(held);
        let _now_ok = factory_b.acquire("runs", "sess_1", WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let db = Database::in_memory().unwrap();
        let repo = LeaseRepo::new(db.clone());
        // A dead process left an expired lease behind
        assert!(repo
            .try_acquire("runs", "sess_1", "proc_dead", Duration::from_millis(0))
            .unwrap());

        let factory = LockFactory::distributed(db, "proc_b");
        let _lock = factory.acquire("runs", "sess_1", WAIT).await.unwrap();
    }
}
