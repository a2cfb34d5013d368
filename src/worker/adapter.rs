use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{watch, RwLock};

use super::WorkerState;
use crate::error::{FarmError, Result};
use crate::net::dispatch::Call;
use crate::net::registry::Outbox;
use crate::protocol::{FunctionMessage, Target};

/// An allocation as delivered to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationPayload {
    pub job: i64,
    pub allocation: i64,
    pub kind: String,
    /// `(task id, frame)` pairs in frame order
    pub tasks: Vec<(i64, i64)>,
    pub environment: Map<String, Value>,
    pub parameters: Map<String, Value>,
}

impl AllocationPayload {
    pub fn from_call(call: &Call) -> Result<Self> {
        let raw_tasks: Map<String, Value> = call.arg(3, "tasks")?;
        let mut tasks = raw_tasks
            .into_iter()
            .map(|(id, frame)| {
                let id = id.parse::<i64>().ok();
                match (id, frame.as_i64()) {
                    (Some(id), Some(frame)) => Ok((id, frame)),
                    _ => Err(FarmError::bad_arguments(&call.function, "tasks must map task ids to frames")),
                }
            })
            .collect::<Result<Vec<_>>>()?;
        tasks.sort_by_key(|&(id, frame)| (frame, id));

        Ok(Self {
            job: call.arg(0, "job")?,
            allocation: call.arg(1, "allocation")?,
            kind: call.arg(2, "type")?,
            tasks,
            environment: call.opt_arg(4, "environment")?.unwrap_or_default(),
            parameters: call.opt_arg(5, "parameters")?.unwrap_or_default(),
        })
    }
}

/// Reports task outcomes back to the coordinator.
///
/// An adapter calls `start_task` and then exactly one of `finish_task` or
/// `fail_task` for every task it was given, or one of the allocation-level
/// calls to settle all of them at once.
#[derive(Debug, Clone)]
pub struct TaskReporter {
    name: String,
    outbox: Outbox,
    progress: watch::Sender<f64>,
    state: Arc<RwLock<WorkerState>>,
}

impl TaskReporter {
    pub(crate) fn new(
        name: String,
        outbox: Outbox,
        progress: watch::Sender<f64>,
        state: Arc<RwLock<WorkerState>>,
    ) -> Self {
        Self {
            name,
            outbox,
            progress,
            state,
        }
    }

    fn send(&self, function: &str, build: impl FnOnce(FunctionMessage) -> FunctionMessage) -> Result<()> {
        let message = build(FunctionMessage::new(Target::Server, self.name.clone(), function));
        self.outbox
            .send(message.into())
            .map_err(|_| FarmError::Connection("session closed".into()))
    }

    pub async fn start_task(&self, task: i64) -> Result<()> {
        self.state.write().await.task = Some(task);
        self.send("start_task", |m| m.kwarg("task", task))
    }

    pub async fn finish_task(&self, task: i64) -> Result<()> {
        self.state.write().await.task = None;
        self.send("finish_task", |m| m.kwarg("task", task))
    }

    pub async fn fail_task(&self, task: i64, reason: &str) -> Result<()> {
        self.state.write().await.task = None;
        self.send("fail_task", |m| m.kwarg("task", task).kwarg("reason", reason))
    }

    pub async fn finish_allocation(&self, allocation: i64) -> Result<()> {
        self.state.write().await.task = None;
        self.send("finish_allocation", |m| m.kwarg("allocation", allocation))
    }

    pub async fn fail_allocation(&self, allocation: i64, reason: &str) -> Result<()> {
        self.state.write().await.task = None;
        self.send("fail_allocation", |m| {
            m.kwarg("allocation", allocation).kwarg("reason", reason)
        })
    }

    /// Record progress in percent. Only the latest value is sent, on the
    /// next flush.
    pub fn progress(&self, percent: f64) {
        self.progress.send_replace(percent.clamp(0.0, 100.0));
    }
}

/// Executes allocations of one job type.
#[async_trait]
pub trait RenderAdapter: Send + Sync {
    /// Job type this adapter handles; also the function name the
    /// coordinator calls on the worker.
    fn kind(&self) -> &str;

    async fn render(&self, payload: AllocationPayload, reporter: TaskReporter) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_orders_tasks_by_frame() {
        let call: Call = FunctionMessage::new(Target::Client, "server", "shell")
            .kwarg("job", 1)
            .kwarg("allocation", 2)
            .kwarg("type", "shell")
            .kwarg("tasks", json!({"12": 3, "10": 1, "11": 2}))
            .kwarg("parameters", json!({"command": "echo {frame}"}))
            .into();
        let payload = AllocationPayload::from_call(&call).unwrap();
        assert_eq!(payload.tasks, vec![(10, 1), (11, 2), (12, 3)]);
        assert_eq!(payload.parameters["command"], "echo {frame}");
        assert!(payload.environment.is_empty());
    }

    #[test]
    fn payload_rejects_bad_tasks() {
        let call: Call = FunctionMessage::new(Target::Client, "server", "shell")
            .kwarg("job", 1)
            .kwarg("allocation", 2)
            .kwarg("type", "shell")
            .kwarg("tasks", json!({"ten": 1}))
            .into();
        assert!(matches!(
            AllocationPayload::from_call(&call),
            Err(FarmError::BadArguments { .. })
        ));
    }

    #[tokio::test]
    async fn reporter_sends_server_calls() {
        let (outbox, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let (progress, progress_rx) = watch::channel(0.0);
        let state = Arc::new(RwLock::new(WorkerState::default()));
        let reporter = TaskReporter::new("render01".into(), outbox, progress, state.clone());

        reporter.start_task(5).await.unwrap();
        assert_eq!(state.read().await.task, Some(5));
        reporter.fail_task(5, "license").await.unwrap();
        reporter.progress(140.0);
        assert_eq!(*progress_rx.borrow(), 100.0);

        let crate::protocol::Message::Function(start) = rx.recv().await.unwrap() else {
            panic!("expected a call");
        };
        assert_eq!(start.function, "start_task");
        assert_eq!(start.target, Target::Server);
        let crate::protocol::Message::Function(fail) = rx.recv().await.unwrap() else {
            panic!("expected a call");
        };
        assert_eq!(fail.kwargs["reason"], "license");
        assert_eq!(state.read().await.task, None);
    }
}
