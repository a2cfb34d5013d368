//! Singleton coordinator lock.
//!
//! Exactly one row (`id = 1`) names the live coordinator and when it last
//! proved it was alive. Acquisition is a single upsert that only overwrites
//! a stale heartbeat, so two processes racing for the lock cannot both win.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension};

use super::Store;
use crate::error::{FarmError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub address: String,
    pub heartbeat: DateTime<Utc>,
}

impl Store {
    /// Take the coordinator lock for `address`.
    ///
    /// Succeeds when no holder exists, when the holder's heartbeat is older
    /// than `stale_after`, or when `address` already holds it. Otherwise
    /// fails with [`FarmError::LockBusy`] naming the live holder.
    pub fn acquire_lock(&self, address: &str, stale_after: Duration) -> Result<()> {
        self.acquire_lock_at(address, Utc::now().timestamp_millis(), stale_after)
    }

    pub(crate) fn acquire_lock_at(
        &self,
        address: &str,
        now_ms: i64,
        stale_after: Duration,
    ) -> Result<()> {
        let cutoff = now_ms - stale_after.as_millis() as i64;
        let changed = self.conn()?.execute(
            "INSERT INTO coordinator_lock (id, address, heartbeat_time) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE
                SET address = excluded.address, heartbeat_time = excluded.heartbeat_time
                WHERE coordinator_lock.heartbeat_time < ?3
                   OR coordinator_lock.address = excluded.address",
            params![address, now_ms, cutoff],
        )?;

        if changed == 0 {
            let holder = self
                .lock_holder()?
                .map(|h| h.address)
                .unwrap_or_default();
            return Err(FarmError::LockBusy(holder));
        }

        tracing::info!(address, "Coordinator lock acquired");
        Ok(())
    }

    /// Refresh the heartbeat. Fails with [`FarmError::LockLost`] if another
    /// process has taken the lock since.
    pub fn maintain_lock(&self, address: &str) -> Result<()> {
        self.maintain_lock_at(address, Utc::now().timestamp_millis())
    }

    pub(crate) fn maintain_lock_at(&self, address: &str, now_ms: i64) -> Result<()> {
        let changed = self.conn()?.execute(
            "UPDATE coordinator_lock SET heartbeat_time = ?2 WHERE id = 1 AND address = ?1",
            params![address, now_ms],
        )?;
        if changed == 0 {
            return Err(FarmError::LockLost(address.to_string()));
        }
        tracing::trace!(address, "Coordinator lock heartbeat");
        Ok(())
    }

    /// Drop the lock if `address` holds it. Returns whether a row was removed.
    pub fn release_lock(&self, address: &str) -> Result<bool> {
        let changed = self.conn()?.execute(
            "DELETE FROM coordinator_lock WHERE id = 1 AND address = ?1",
            params![address],
        )?;
        if changed > 0 {
            tracing::info!(address, "Coordinator lock released");
        }
        Ok(changed > 0)
    }

    pub fn lock_holder(&self) -> Result<Option<LockHolder>> {
        let row: Option<(String, i64)> = self
            .conn()?
            .query_row(
                "SELECT address, heartbeat_time FROM coordinator_lock WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(row.and_then(|(address, ms)| {
            Utc.timestamp_millis_opt(ms)
                .single()
                .map(|heartbeat| LockHolder { address, heartbeat })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STALE: Duration = Duration::from_secs(15);

    #[test]
    fn first_acquire_succeeds() {
        let store = Store::open_in_memory().unwrap();
        store.acquire_lock_at("10.0.0.1:9440", 1_000, STALE).unwrap();
        let holder = store.lock_holder().unwrap().unwrap();
        assert_eq!(holder.address, "10.0.0.1:9440");
        assert_eq!(holder.heartbeat.timestamp_millis(), 1_000);
    }

    #[test]
    fn second_acquire_fails_while_fresh() {
        let store = Store::open_in_memory().unwrap();
        store.acquire_lock_at("a:1", 1_000, STALE).unwrap();

        let err = store.acquire_lock_at("b:1", 5_000, STALE).unwrap_err();
        assert!(matches!(err, FarmError::LockBusy(ref h) if h == "a:1"));
        assert_eq!(store.lock_holder().unwrap().unwrap().address, "a:1");
    }

    #[test]
    fn stale_lock_can_be_taken_over() {
        let store = Store::open_in_memory().unwrap();
        store.acquire_lock_at("a:1", 1_000, STALE).unwrap();
        store.acquire_lock_at("b:1", 1_000 + 15_001, STALE).unwrap();
        assert_eq!(store.lock_holder().unwrap().unwrap().address, "b:1");
    }

    #[test]
    fn heartbeat_keeps_lock_fresh() {
        let store = Store::open_in_memory().unwrap();
        store.acquire_lock_at("a:1", 1_000, STALE).unwrap();
        store.maintain_lock_at("a:1", 14_000).unwrap();
        // Would be stale against the original heartbeat, not the refreshed one.
        assert!(store.acquire_lock_at("b:1", 20_000, STALE).is_err());
    }

    #[test]
    fn maintain_fails_after_takeover() {
        let store = Store::open_in_memory().unwrap();
        store.acquire_lock_at("a:1", 1_000, STALE).unwrap();
        store.acquire_lock_at("b:1", 60_000, STALE).unwrap();
        assert!(matches!(
            store.maintain_lock_at("a:1", 60_001),
            Err(FarmError::LockLost(_))
        ));
    }

    #[test]
    fn holder_may_reacquire() {
        let store = Store::open_in_memory().unwrap();
        store.acquire_lock_at("a:1", 1_000, STALE).unwrap();
        store.acquire_lock_at("a:1", 2_000, STALE).unwrap();
    }

    #[test]
    fn release_only_by_holder() {
        let store = Store::open_in_memory().unwrap();
        store.acquire_lock_at("a:1", 1_000, STALE).unwrap();
        assert!(!store.release_lock("b:1").unwrap());
        assert!(store.release_lock("a:1").unwrap());
        assert!(store.lock_holder().unwrap().is_none());
        store.acquire_lock_at("b:1", 1_001, STALE).unwrap();
    }
}
