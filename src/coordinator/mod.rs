//! The Server role.
//!
//! Owns the scheduler and the client/console registry, serves the session
//! endpoint and runs the coordinator's supervised loops.

mod handlers;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::FarmConfig;
use crate::error::Result;
use crate::events::{self, EventSender, FarmEvent};
use crate::ingest::Ingestor;
use crate::net::dispatch::{Call, HandlerRegistry};
use crate::net::handshake::{Identity, PeerKind};
use crate::net::registry::{Outbox, Registry};
use crate::net::server;
use crate::protocol::{Classifier, Envelope, Message, Target};
use crate::scheduler::{ClientStatus, Scheduler, Status};
use crate::store::Store;
use crate::supervisor::Supervisor;

#[derive(Clone)]
pub struct Coordinator {
    pub config: Arc<FarmConfig>,
    pub store: Store,
    pub scheduler: Arc<Mutex<Scheduler>>,
    pub registry: Arc<RwLock<Registry>>,
    pub events: EventSender,
    client_handlers: Arc<HandlerRegistry<Coordinator>>,
    console_handlers: Arc<HandlerRegistry<Coordinator>>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("name", &self.config.name)
            .field("store", &self.store)
            .finish()
    }
}

impl Coordinator {
    /// Load the scheduler from `store`. The coordinator lock must already
    /// be held when this coordinator is run.
    pub fn new(config: FarmConfig, store: Store) -> Result<Self> {
        let (scheduler, in_progress) = Scheduler::load(store.clone())?;
        if !in_progress.is_empty() {
            tracing::info!(
                count = in_progress.len(),
                "In-progress allocations found, waiting for their workers to reconnect"
            );
        }
        Ok(Self {
            config: Arc::new(config),
            store,
            scheduler: Arc::new(Mutex::new(scheduler)),
            registry: Arc::new(RwLock::new(Registry::new())),
            events: events::channel(),
            client_handlers: Arc::new(handlers::client_table()),
            console_handlers: Arc::new(handlers::console_table()),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn handlers_for(&self, kind: PeerKind) -> &HandlerRegistry<Coordinator> {
        match kind {
            PeerKind::Client => &self.client_handlers,
            PeerKind::Console => &self.console_handlers,
        }
    }

    /// Run every coordinator operation until `token` is cancelled or one of
    /// them fails. The coordinator lock is released on the way out.
    pub async fn run(self, listener: TcpListener, token: CancellationToken) -> Result<()> {
        let mut supervisor = Supervisor::new(&token);
        let ops = supervisor.token();

        supervisor.create(
            "serve",
            server::serve(listener, self.clone(), ops.clone()),
        );
        supervisor.create("schedule", self.clone().schedule_loop(ops.clone()));
        supervisor.create(
            "ingest",
            Ingestor::new(
                self.config.drop_dir.clone(),
                self.config.timing.ingest_interval(),
                self.store.clone(),
                self.scheduler.clone(),
                self.events.clone(),
            )
            .run(ops.clone()),
        );
        supervisor.create("lock_heartbeat", self.clone().lock_heartbeat(ops.clone()));
        supervisor.create(
            "notifier",
            self.clone().notify_consoles(self.events.subscribe(), ops.clone()),
        );
        supervisor.create("orphan_sweep", self.clone().orphan_sweep(ops));

        tracing::info!(name = %self.config.name, address = %self.config.advertise_addr, "Coordinator running");
        let result = supervisor.run().await;

        match self.store.release_lock(&self.config.advertise_addr) {
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to release coordinator lock"),
        }
        result
    }

    async fn schedule_loop(self, token: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.timing.schedule_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.schedule_once().await {
                tracing::error!(error = %e, "Scheduling pass failed");
            }
        }
    }

    /// Offer work to every idle client once. Returns how many allocations
    /// were issued.
    pub async fn schedule_once(&self) -> Result<usize> {
        let (idle, connected) = {
            let registry = self.registry.read().await;
            (registry.idle_clients(), registry.connected_clients())
        };

        let mut issued = 0;
        for name in idle {
            let Some(assignment) = self.scheduler.lock().await.issue_task(&name, &connected)? else {
                continue;
            };

            let delivered = {
                let mut registry = self.registry.write().await;
                if let Some(record) = registry.client_mut(&name) {
                    record.status = ClientStatus::Working;
                    record.job = Some(assignment.job_id);
                    record.allocation = Some(assignment.allocation_id);
                    record.task = None;
                }
                registry.send_to_client(&name, assignment.message.into())
            };

            if !delivered {
                tracing::warn!(computer = %name, allocation_id = assignment.allocation_id, "Client gone, allocation returned");
                let reset = self
                    .scheduler
                    .lock()
                    .await
                    .reset_allocation(assignment.allocation_id)?;
                events::publish_all(&self.events, assignment.transitions);
                events::publish_all(&self.events, reset);
                continue;
            }

            events::publish_all(&self.events, assignment.transitions);
            events::publish(
                &self.events,
                FarmEvent::ClientStatus {
                    name,
                    status: ClientStatus::Working,
                },
            );
            issued += 1;
        }
        Ok(issued)
    }

    /// Keep the lock row fresh. Losing the lock is fatal to this process.
    async fn lock_heartbeat(self, token: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.timing.lock_heartbeat_interval());
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            self.store.maintain_lock(&self.config.advertise_addr)?;
        }
    }

    async fn notify_consoles(
        self,
        mut rx: broadcast::Receiver<FarmEvent>,
        token: CancellationToken,
    ) -> Result<()> {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                event = rx.recv() => event,
            };
            match event {
                Ok(event) => {
                    let message = event.to_message(&self.config.name);
                    self.registry.read().await.broadcast_consoles(&message);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Console notifier lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }

    /// Once workers have had time to reconnect, return allocations still
    /// held by absent computers to the queue.
    async fn orphan_sweep(self, token: CancellationToken) -> Result<()> {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = tokio::time::sleep(self.config.timing.orphan_grace()) => {}
        }
        let connected = self.registry.read().await.connected_clients();
        let orphans = self.scheduler.lock().await.reset_orphans(&connected)?;
        for allocation_id in orphans {
            events::publish(
                &self.events,
                FarmEvent::AllocationUpdated {
                    allocation_id,
                    status: Status::Pending,
                },
            );
        }
        Ok(())
    }

    /// Bind an upgraded session to its reservation and announce it.
    pub async fn peer_connected(&self, identity: &Identity, session: Uuid, outbox: Outbox) {
        let attached = self
            .registry
            .write()
            .await
            .attach(identity.kind, &identity.name, session, outbox);
        if !attached {
            tracing::warn!(name = %identity.name, "Session has no reservation");
            return;
        }

        match identity.kind {
            PeerKind::Client => {
                self.restore_client(&identity.name).await;
                tracing::info!(name = %identity.name, "Client connected");
                events::publish(
                    &self.events,
                    FarmEvent::ClientConnected {
                        name: identity.name.clone(),
                    },
                );
            }
            PeerKind::Console => {
                tracing::info!(name = %identity.name, "Console connected");
            }
        }
    }

    /// A reconnecting worker claims to be working. Keep that only if the
    /// allocation is still active and still recorded against it.
    async fn restore_client(&self, name: &str) {
        let allocation = match self.registry.read().await.client(name) {
            Some(record) if record.status == ClientStatus::Working => record.allocation,
            _ => return,
        };
        let still_ours = match allocation {
            Some(id) => self
                .scheduler
                .lock()
                .await
                .tree()
                .allocation(id)
                .is_some_and(|a| a.computer.as_deref() == Some(name)),
            None => false,
        };
        if !still_ours {
            if let Some(record) = self.registry.write().await.client_mut(name) {
                tracing::info!(name, allocation = ?allocation, "Allocation no longer held, client reset to idle");
                record.set_idle();
            }
        }
    }

    pub async fn peer_disconnected(&self, identity: &Identity, session: Uuid) {
        let removed = self
            .registry
            .write()
            .await
            .remove(identity.kind, &identity.name, session);
        if !removed {
            return;
        }
        tracing::info!(name = %identity.name, kind = %identity.kind, "Peer disconnected");
        let name = identity.name.clone();
        let event = match identity.kind {
            PeerKind::Client => FarmEvent::ClientDisconnected { name },
            PeerKind::Console => FarmEvent::ConsoleDisconnected { name },
        };
        events::publish(&self.events, event);
    }

    /// Handle one frame from an authenticated peer. Nothing here closes the
    /// connection: bad input is logged and reported to consoles.
    pub async fn handle_frame(&self, peer: &Identity, bytes: &[u8]) {
        let message = match Message::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(from = %peer.name, error = %e, "Dropping undecodable message");
                return;
            }
        };

        match message {
            Message::Function(call) if call.target == Target::Server => {
                let mut call = Call::from(call);
                call.sender = peer.name.clone();
                let function = call.function.clone();
                let result = match self.handlers_for(peer.kind).dispatch(self.clone(), call) {
                    Ok(future) => future.await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    tracing::warn!(from = %peer.name, function = %function, error = %e, "Call failed");
                    self.report(&peer.name, format!("{function}: {e}"));
                }
            }
            Message::Function(call) => {
                tracing::warn!(from = %peer.name, role = %call.target, function = %call.function, "Dropping call not addressed to the coordinator");
            }
            Message::Relay(envelope) => self.relay(peer, envelope).await,
            Message::Error(envelope) if envelope.target == Target::Console => {
                self.registry
                    .read()
                    .await
                    .broadcast_consoles(&Message::Error(envelope));
            }
            Message::Error(envelope) => {
                tracing::warn!(from = %peer.name, error = %envelope.data, "Error from peer");
            }
            Message::HealthCheck(_) => {
                let target = match peer.kind {
                    PeerKind::Client => Target::Client,
                    PeerKind::Console => Target::Console,
                };
                let reply = Message::health_check(target, self.config.name.clone());
                let registry = self.registry.read().await;
                match peer.kind {
                    PeerKind::Client => registry.send_to_client(&peer.name, reply),
                    PeerKind::Console => registry.send_to_console(&peer.name, reply),
                };
            }
        }
    }

    async fn relay(&self, peer: &Identity, envelope: Envelope) {
        let classifier = envelope.data.get("classifier").and_then(|v| v.as_str());
        let inner = envelope.data.get("message").cloned();
        let (Some(classifier), Some(inner)) = (classifier, inner) else {
            self.report(&peer.name, "relay: missing classifier or message".into());
            return;
        };

        let parsed = Classifier::parse(classifier)
            .and_then(|c| Ok((c, Message::from_value(inner)?)));
        match parsed {
            Ok((classifier, message)) => {
                let delivered = self.registry.read().await.relay(&classifier, &message);
                tracing::info!(from = %peer.name, count = delivered.len(), "Relayed message");
            }
            Err(e) => self.report(&peer.name, format!("relay: {e}")),
        }
    }

    fn report(&self, source: &str, message: String) {
        events::publish(
            &self.events,
            FarmEvent::Error {
                source: source.to_string(),
                message,
            },
        );
    }
}
