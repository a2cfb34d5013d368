//! Role negotiation.
//!
//! Exactly one process coordinates: the one holding the store's lock row.
//! Everyone else finds the holder's address and dials it. A last-known
//! server address is health-checked first so that nodes without store
//! access (or with a stale lock view) can still join a live coordinator.

use tokio_util::sync::CancellationToken;

use crate::config::FarmConfig;
use crate::error::{FarmError, Result};
use crate::net::health::health_check;
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// This process holds the coordinator lock.
    Server,
    /// Dial the coordinator at `address`.
    Client { address: String },
}

/// Decide this process's role, retrying with a fixed backoff until one is
/// found or `token` is cancelled.
///
/// Only a `server_eligible` node with a store may take the lock; consoles
/// and store-less workers just look for the holder.
pub async fn negotiate(
    config: &FarmConfig,
    store: Option<&Store>,
    server_eligible: bool,
    token: &CancellationToken,
) -> Result<Role> {
    let timing = &config.timing;
    loop {
        if token.is_cancelled() {
            return Err(FarmError::Cancelled);
        }

        if let Some(address) = &config.last_known_server {
            if health_check(address, timing.health_check_timeout()).await {
                tracing::info!(address = %address, "Last known coordinator is alive");
                return Ok(Role::Client {
                    address: address.clone(),
                });
            }
        }

        if let Some(store) = store {
            match find_or_take(config, store, server_eligible).await {
                Ok(Some(role)) => return Ok(role),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "Election attempt failed"),
            }
        }

        tracing::debug!(backoff_ms = timing.reconnect_backoff_ms, "No coordinator found, backing off");
        tokio::select! {
            _ = token.cancelled() => return Err(FarmError::Cancelled),
            _ = tokio::time::sleep(timing.reconnect_backoff()) => {}
        }
    }
}

async fn find_or_take(config: &FarmConfig, store: &Store, server_eligible: bool) -> Result<Option<Role>> {
    let timing = &config.timing;
    let holder = if server_eligible {
        match store.acquire_lock(&config.advertise_addr, timing.lock_stale_after()) {
            Ok(()) => return Ok(Some(Role::Server)),
            Err(FarmError::LockBusy(holder)) => Some(holder),
            Err(e) => return Err(e),
        }
    } else {
        store.lock_holder()?.map(|h| h.address)
    };

    let Some(address) = holder.filter(|a| !a.is_empty()) else {
        return Ok(None);
    };
    if health_check(&address, timing.health_check_timeout()).await {
        tracing::info!(address = %address, "Coordinator lock is held, joining holder");
        return Ok(Some(Role::Client { address }));
    }
    tracing::info!(address = %address, "Lock holder unreachable, waiting for its heartbeat to go stale");
    Ok(None)
}
