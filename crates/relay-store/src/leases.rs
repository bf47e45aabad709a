use std::time::Duration;

use chrono::Utc;
use tracing::instrument;

use crate::database::Database;
use crate::error::StoreError;

/// Expiring `(namespace, key)` leases in the shared database.
///
/// Backs the distributed lock variant: a lease that is past its expiry is
/// up for takeover, so a crashed holder cannot deadlock other processes.
pub struct LeaseRepo {
    db: Database,
}

impl LeaseRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Try to take the lease. Succeeds when the slot is free, expired, or
    /// already held by this holder (re-acquire extends the expiry).
    #[instrument(skip(self), fields(namespace, key, holder))]
    pub fn try_acquire(
        &self,
        namespace: &str,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let expires_at = (now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| StoreError::Database(format!("lease ttl: {e}")))?)
        .to_rfc3339();
        let now = now.to_rfc3339();

        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT INTO leases (namespace, key, holder, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(namespace, key) DO UPDATE
                 SET holder = excluded.holder, expires_at = excluded.expires_at
                 WHERE leases.expires_at < ?5 OR leases.holder = excluded.holder",
                rusqlite::params![namespace, key, holder, expires_at, now],
            )?;
            Ok(changed > 0)
        })
    }

    /// Release the lease if this holder still owns it.
    #[instrument(skip(self), fields(namespace, key, holder))]
    pub fn release(&self, namespace: &str, key: &str, holder: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "DELETE FROM leases WHERE namespace = ?1 AND key = ?2 AND holder = ?3",
                rusqlite::params![namespace, key, holder],
            )?;
            Ok(changed > 0)
        })
    }

    /// Current holder of a lease slot, if any (expired leases included —
    /// expiry is enforced at acquire time).
    pub fn holder(&self, namespace: &str, key: &str) -> Result<Option<String>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT holder FROM leases WHERE namespace = ?1 AND key = ?2")?;
            let mut rows = stmt.query(rusqlite::params![namespace, key])?;
            match rows.next()? {
                Some(row) => Ok(Some(row.get(0)?)),
                None => Ok(None),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    #[test]
    fn acquire_free_lease() {
        let db = Database::in_memory().unwrap();
        let repo = LeaseRepo::new(db);
        assert!(repo.try_acquire("runs", "sess_1", "proc_a", TTL).unwrap());
        assert_eq!(repo.holder("runs", "sess_1").unwrap().as_deref(), Some("proc_a"));
    }

    #[test]
    fn held_lease_blocks_other_holders() {
        let db = Database::in_memory().unwrap();
        let repo = LeaseRepo::new(db);
        assert!(repo.try_acquire("runs", "sess_1", "proc_a", TTL).unwrap());
        assert!(!repo.try_acquire("runs", "sess_1", "proc_b", TTL).unwrap());
        assert_eq!(repo.holder("runs", "sess_1").unwrap().as_deref(), Some("proc_a"));
    }

    #[test]
    fn same_holder_reacquires() {
        let db = Database::in_memory().unwrap();
        let repo = LeaseRepo::new(db);
        assert!(repo.try_acquire("runs", "sess_1", "proc_a", TTL).unwrap());
        assert!(repo.try_acquire("runs", "sess_1", "proc_a", TTL).unwrap());
    }

    #[test]
    fn different_keys_are_independent() {
        let db = Database::in_memory().unwrap();
        let repo = LeaseRepo::new(db);
        assert!(repo.try_acquire("runs", "sess_1", "proc_a", TTL).unwrap());
        assert!(repo.try_acquire("runs", "sess_2", "proc_b", TTL).unwrap());
    }

    #[test]
    fn namespaces_do_not_collide() {
        let db = Database::in_memory().unwrap();
        let repo = LeaseRepo::new(db);
        assert!(repo.try_acquire("runs", "key", "proc_a", TTL).unwrap());
        assert!(repo.try_acquire("reaper", "key", "proc_b", TTL).unwrap());
    }

    #[test]
    fn expired_lease_can_be_taken_over() {
        let db = Database::in_memory().unwrap();
        let repo = LeaseRepo::new(db);
        assert!(repo
            .try_acquire("runs", "sess_1", "proc_dead", Duration::from_millis(0))
            .unwrap());

        // TTL of zero means the lease is expired immediately
        assert!(repo.try_acquire("runs", "sess_1", "proc_b", TTL).unwrap());
        assert_eq!(repo.holder("runs", "sess_1").unwrap().as_deref(), Some("proc_b"));
    }

    #[test]
    fn release_requires_ownership() {
        let db = Database::in_memory().unwrap();
        let repo = LeaseRepo::new(db);
        assert!(repo.try_acquire("runs", "sess_1", "proc_a", TTL).unwrap());

        assert!(!repo.release("runs", "sess_1", "proc_b").unwrap());
        assert_eq!(repo.holder("runs", "sess_1").unwrap().as_deref(), Some("proc_a"));

        assert!(repo.release("runs", "sess_1", "proc_a").unwrap());
        assert!(repo.holder("runs", "sess_1").unwrap().is_none());
    }

    #[test]
    fn released_lease_is_reacquirable() {
        let db = Database::in_memory().unwrap();
        let repo = LeaseRepo::new(db);
        assert!(repo.try_acquire("runs", "sess_1", "proc_a", TTL).unwrap());
        assert!(repo.release("runs", "sess_1", "proc_a").unwrap());
        assert!(repo.try_acquire("runs", "sess_1", "proc_b", TTL).unwrap());
    }
}
