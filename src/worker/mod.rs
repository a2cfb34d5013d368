//! Worker role: receives allocations from the coordinator and renders them.
//!
//! # Components
//!
//! - [`RenderAdapter`]: one implementation per job type; the coordinator
//!   invokes the adapter whose `kind` matches the job's `Type`
//! - [`ShellAdapter`]: runs a shell command per frame
//! - [`TaskReporter`]: task and allocation outcomes back to the coordinator
//! - [`ProgressFlusher`]: coalesced progress updates
//!
//! # Execution Flow
//!
//! 1. The coordinator calls `<job type>` on the worker with the allocation
//! 2. The matching adapter runs; it starts and settles every task through
//!    the reporter
//! 3. An adapter error fails the whole allocation
//!
//! A dropped connection aborts the running allocation. The worker then
//! reconnects as idle and the coordinator hands the allocation back to it.

pub mod adapter;
pub mod executor;
pub mod progress;

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;

pub use adapter::{AllocationPayload, RenderAdapter, TaskReporter};
pub use executor::ShellAdapter;
pub use progress::ProgressFlusher;

use crate::config::FarmConfig;
use crate::error::{FarmError, Result};
use crate::net::dispatch::{Call, HandlerRegistry};
use crate::net::handshake::Identity;
use crate::net::registry::Outbox;
use crate::net::session::{dial, Session};
use crate::protocol::{FunctionMessage, Target};
use crate::scheduler::ClientStatus;

/// What this worker is doing. Survives reconnects and is announced in the
/// handshake so the coordinator can restore its record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerState {
    pub status: ClientStatus,
    pub job: Option<i64>,
    pub allocation: Option<i64>,
    pub task: Option<i64>,
}

impl Default for WorkerState {
    fn default() -> Self {
        Self {
            status: ClientStatus::Idle,
            job: None,
            allocation: None,
            task: None,
        }
    }
}

impl WorkerState {
    fn begin(&mut self, job: i64, allocation: i64) {
        if self.status != ClientStatus::Stopped {
            self.status = ClientStatus::Working;
        }
        self.job = Some(job);
        self.allocation = Some(allocation);
        self.task = None;
    }

    /// Clear the allocation. Returns whether the worker is paused.
    fn finish(&mut self) -> bool {
        self.job = None;
        self.allocation = None;
        self.task = None;
        if self.status == ClientStatus::Working {
            self.status = ClientStatus::Idle;
        }
        self.status == ClientStatus::Stopped
    }

    pub fn identity(&self, name: &str, secret: &str) -> Identity {
        Identity::client(name, secret).with_state(self.status, self.job, self.allocation, self.task)
    }
}

pub type AdapterSet = BTreeMap<String, Arc<dyn RenderAdapter>>;

/// Adapters available when none are configured explicitly.
pub fn default_adapters() -> AdapterSet {
    let shell: Arc<dyn RenderAdapter> = Arc::new(ShellAdapter::default());
    AdapterSet::from([(shell.kind().to_string(), shell)])
}

/// Handler context for one worker session.
#[derive(Clone)]
pub struct Worker {
    name: String,
    state: Arc<RwLock<WorkerState>>,
    outbox: Outbox,
    progress: watch::Sender<f64>,
}

impl Worker {
    fn reporter(&self) -> TaskReporter {
        TaskReporter::new(
            self.name.clone(),
            self.outbox.clone(),
            self.progress.clone(),
            self.state.clone(),
        )
    }

    fn announce(&self, status: ClientStatus) -> Result<()> {
        let message = FunctionMessage::new(Target::Server, self.name.clone(), "set_status")
            .kwarg("status", status.as_str());
        self.outbox
            .send(message.into())
            .map_err(|_| FarmError::Connection("session closed".into()))
    }
}

/// Functions the coordinator (or a console, through a relay) may call on a
/// worker: one per adapter, plus `set_status`.
pub fn handler_table(adapters: &AdapterSet) -> HandlerRegistry<Worker> {
    let mut table = HandlerRegistry::new(Target::Client).register("set_status", set_status);
    for (kind, adapter) in adapters {
        let adapter = adapter.clone();
        table = table.register(kind, move |worker: Worker, call: Call| {
            render_allocation(worker, adapter.clone(), call)
        });
    }
    table
}

async fn render_allocation(worker: Worker, adapter: Arc<dyn RenderAdapter>, call: Call) -> Result<()> {
    let payload = AllocationPayload::from_call(&call)?;
    let allocation = payload.allocation;
    worker.state.write().await.begin(payload.job, allocation);
    worker.progress.send_replace(0.0);
    tracing::info!(
        job_id = payload.job,
        allocation_id = allocation,
        kind = adapter.kind(),
        frames = payload.tasks.len(),
        "Allocation received"
    );

    let reporter = worker.reporter();
    let result = adapter.render(payload, reporter.clone()).await;
    if let Err(e) = &result {
        tracing::warn!(allocation_id = allocation, error = %e, "Adapter failed");
        if let Err(report) = reporter.fail_allocation(allocation, &e.to_string()).await {
            tracing::warn!(allocation_id = allocation, error = %report, "Could not report failure");
        }
    }

    if worker.state.write().await.finish() {
        worker.announce(ClientStatus::Stopped)?;
    }
    result
}

/// Pause (`stopped`) or resume (`idle`) this worker.
async fn set_status(worker: Worker, call: Call) -> Result<()> {
    let requested: String = call.arg(0, "status")?;
    let requested: ClientStatus = requested
        .parse()
        .map_err(|_| FarmError::bad_arguments("set_status", format!("unknown status `{requested}`")))?;

    let announced = {
        let mut state = worker.state.write().await;
        state.status = match requested {
            ClientStatus::Stopped => ClientStatus::Stopped,
            _ if state.allocation.is_some() => ClientStatus::Working,
            _ => ClientStatus::Idle,
        };
        state.status
    };
    tracing::info!(from = %call.sender, status = %announced, "Status changed");
    worker.announce(announced)
}

/// Run one worker session against the coordinator at `address`.
///
/// Returns `Ok` when `token` is cancelled and an error when the connection
/// fails or drops; the caller decides whether to reconnect.
pub async fn run_session(
    config: &FarmConfig,
    address: &str,
    state: &Arc<RwLock<WorkerState>>,
    handlers: &Arc<HandlerRegistry<Worker>>,
    token: &CancellationToken,
) -> Result<()> {
    let identity = state.read().await.identity(&config.name, &config.secret);
    let ws = dial(address, &identity, config.timing.connect_timeout()).await?;

    let (outbox, outgoing) = mpsc::unbounded_channel();
    let (progress, progress_rx) = watch::channel(0.0);
    let worker = Worker {
        name: config.name.clone(),
        state: state.clone(),
        outbox: outbox.clone(),
        progress,
    };

    let session_token = token.child_token();
    let flusher = ProgressFlusher::new(config.name.clone(), config.timing.progress_flush_interval());
    let flush = tokio::spawn({
        let token = session_token.clone();
        async move { flusher.run(progress_rx, outbox, token).await }
    });

    let session = Session {
        name: config.name.clone(),
        handlers: handlers.clone(),
        ctx: worker,
    };
    let result = session.run(ws, outgoing, session_token.clone()).await;

    session_token.cancel();
    if let Err(e) = flush.await {
        tracing::warn!(error = %e, "Progress flusher did not stop cleanly");
    }

    // The session aborted any running allocation.
    let mut state = state.write().await;
    if state.allocation.is_some() {
        tracing::warn!(allocation_id = ?state.allocation, "Allocation abandoned with the session");
        state.finish();
    }
    result
}
