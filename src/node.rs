use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::FarmConfig;
use crate::coordinator::Coordinator;
use crate::error::{FarmError, Result};
use crate::net::election::{negotiate, Role};
use crate::store::Store;
use crate::worker::{self, AdapterSet, WorkerState};

/// A farm machine. Every node runs the same loop: find out whether it holds
/// the coordinator lock, then either coordinate or work for whoever does.
pub struct Node {
    pub config: FarmConfig,
    store: Option<Store>,
    adapters: AdapterSet,
}

impl Node {
    /// Open the shared store when one is configured. A node without a
    /// store can only ever be a worker.
    pub fn new(config: FarmConfig, adapters: AdapterSet) -> Result<Self> {
        let store = config.db_path.as_deref().map(Store::open).transpose()?;
        Ok(Self {
            config,
            store,
            adapters,
        })
    }

    /// Run until `token` is cancelled.
    ///
    /// As a worker, a lost or refused connection sends the node back to
    /// election after the reconnect backoff; the coordinator may have moved.
    /// Running the coordinator is terminal: its supervisor's outcome is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordinator fails or the listen address
    /// cannot be bound.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let state = Arc::new(RwLock::new(WorkerState::default()));
        let handlers = Arc::new(worker::handler_table(&self.adapters));
        let mut config = self.config.clone();

        tracing::info!(
            name = %config.name,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr,
            has_store = self.store.is_some(),
            adapters = ?self.adapters.keys().collect::<Vec<_>>(),
            "Starting framefarm node"
        );

        loop {
            let role = match negotiate(&config, self.store.as_ref(), true, &token).await {
                Ok(role) => role,
                Err(FarmError::Cancelled) => return Ok(()),
                Err(e) => return Err(e),
            };

            match role {
                Role::Server => {
                    let Some(store) = self.store.clone() else {
                        return Err(FarmError::Internal("won election without a store".into()));
                    };
                    let listener = TcpListener::bind(config.listen_addr).await?;
                    let coordinator = Coordinator::new(config.clone(), store)?;
                    return coordinator.run(listener, token).await;
                }
                Role::Client { address } => {
                    let result = worker::run_session(&config, &address, &state, &handlers, &token).await;
                    if token.is_cancelled() {
                        return Ok(());
                    }
                    match result {
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            tracing::warn!(address = %address, error = %e, "Session ended, reconnecting");
                        }
                    }
                    config.last_known_server = Some(address);
                    tokio::select! {
                        _ = token.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(config.timing.reconnect_backoff()) => {}
                    }
                }
            }
        }
    }
}
