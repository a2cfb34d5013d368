//! Coordinator state-change notifications.
//!
//! The coordinator publishes every change on a broadcast channel. Consoles
//! receive them as function messages through the notifier loop.

use tokio::sync::broadcast;

use crate::protocol::{FunctionMessage, Message, Target};
use crate::scheduler::{ClientStatus, Status, Transition};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum FarmEvent {
    ClientConnected { name: String },
    ClientDisconnected { name: String },
    ConsoleDisconnected { name: String },
    ClientStatus { name: String, status: ClientStatus },
    JobAdmitted { job_id: i64, name: String },
    JobUpdated { job_id: i64, status: Status },
    AllocationUpdated { allocation_id: i64, status: Status },
    TaskUpdated { task_id: i64, status: Status },
    Progress { name: String, allocation: Option<i64>, progress: f64 },
    Error { source: String, message: String },
}

impl From<Transition> for FarmEvent {
    fn from(transition: Transition) -> Self {
        match transition {
            Transition::Job { id, status } => FarmEvent::JobUpdated { job_id: id, status },
            Transition::Allocation { id, status } => FarmEvent::AllocationUpdated {
                allocation_id: id,
                status,
            },
            Transition::Task { id, status } => FarmEvent::TaskUpdated { task_id: id, status },
        }
    }
}

impl FarmEvent {
    /// Name of the console handler this event is delivered to.
    pub fn function(&self) -> &'static str {
        match self {
            FarmEvent::ClientConnected { .. } => "client_connected",
            FarmEvent::ClientDisconnected { .. } => "client_disconnected",
            FarmEvent::ConsoleDisconnected { .. } => "console_disconnected",
            FarmEvent::ClientStatus { .. } => "client_status",
            FarmEvent::JobAdmitted { .. } => "job_admitted",
            FarmEvent::JobUpdated { .. } => "job_updated",
            FarmEvent::AllocationUpdated { .. } => "allocation_updated",
            FarmEvent::TaskUpdated { .. } => "task_updated",
            FarmEvent::Progress { .. } => "progress",
            FarmEvent::Error { .. } => "error",
        }
    }

    pub fn to_message(&self, sender: &str) -> Message {
        let call = FunctionMessage::new(Target::Console, sender, self.function());
        let call = match self {
            FarmEvent::ClientConnected { name }
            | FarmEvent::ClientDisconnected { name }
            | FarmEvent::ConsoleDisconnected { name } => call.kwarg("name", name.clone()),
            FarmEvent::ClientStatus { name, status } => call
                .kwarg("name", name.clone())
                .kwarg("status", status.as_str()),
            FarmEvent::JobAdmitted { job_id, name } => {
                call.kwarg("job", *job_id).kwarg("name", name.clone())
            }
            FarmEvent::JobUpdated { job_id, status } => {
                call.kwarg("job", *job_id).kwarg("status", status.as_str())
            }
            FarmEvent::AllocationUpdated {
                allocation_id,
                status,
            } => call
                .kwarg("allocation", *allocation_id)
                .kwarg("status", status.as_str()),
            FarmEvent::TaskUpdated { task_id, status } => {
                call.kwarg("task", *task_id).kwarg("status", status.as_str())
            }
            FarmEvent::Progress {
                name,
                allocation,
                progress,
            } => call
                .kwarg("name", name.clone())
                .kwarg("allocation", *allocation)
                .kwarg("progress", *progress),
            FarmEvent::Error { source, message } => {
                return Message::error(Target::Console, source.clone(), message.clone());
            }
        };
        call.into()
    }
}

pub type EventSender = broadcast::Sender<FarmEvent>;

pub fn channel() -> EventSender {
    broadcast::channel(CHANNEL_CAPACITY).0
}

/// Publish, ignoring the case where nobody is listening.
pub fn publish(events: &EventSender, event: FarmEvent) {
    let _ = events.send(event);
}

pub fn publish_all(events: &EventSender, transitions: impl IntoIterator<Item = Transition>) {
    for transition in transitions {
        publish(events, transition.into());
    }
}
