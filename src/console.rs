//! Console role: an operator's view into the farm.
//!
//! A console connects like a worker but never receives work. It can ask the
//! coordinator for client and job listings, retry failed allocations, and
//! pause or resume workers by relaying `set_status` to them. Every state
//! change the coordinator publishes is printed as it arrives.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::FarmConfig;
use crate::error::{FarmError, Result};
use crate::net::dispatch::{Call, HandlerRegistry};
use crate::net::election::{negotiate, Role};
use crate::net::handshake::Identity;
use crate::net::session::{dial, Session};
use crate::protocol::{Classifier, FunctionMessage, Message, Target};
use crate::scheduler::ClientStatus;
use crate::store::Store;

/// What the console asks of the coordinator after connecting.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Print notifications until interrupted.
    Watch,
    Clients,
    Jobs,
    Retry { allocation: i64 },
    /// Relay `set_status` to every worker matching `classifier`.
    SetStatus { classifier: String, status: ClientStatus },
}

impl Command {
    /// Messages to send for this command, and how many listing replies to
    /// wait for before disconnecting. `None` means never disconnect.
    pub fn messages(&self, name: &str) -> Result<(Vec<Message>, Option<usize>)> {
        let call = |function: &str| FunctionMessage::new(Target::Server, name, function);
        Ok(match self {
            Command::Watch => (Vec::new(), None),
            Command::Clients => (vec![call("list_clients").into()], Some(1)),
            Command::Jobs => (vec![call("list_jobs").into()], Some(1)),
            Command::Retry { allocation } => (
                vec![
                    call("retry_allocation").kwarg("allocation", *allocation).into(),
                    call("list_jobs").into(),
                ],
                Some(1),
            ),
            Command::SetStatus { classifier, status } => {
                Classifier::parse(classifier)?;
                let inner: Message = FunctionMessage::new(Target::Client, name, "set_status")
                    .kwarg("status", status.as_str())
                    .into();
                (
                    vec![Message::relay(name, classifier, &inner), call("list_clients").into()],
                    Some(1),
                )
            }
        })
    }
}

/// Handler context for a console session.
#[derive(Clone)]
pub struct Console {
    json: bool,
    replies: mpsc::UnboundedSender<()>,
}

impl Console {
    pub fn new(json: bool, replies: mpsc::UnboundedSender<()>) -> Self {
        Self { json, replies }
    }
}

const NOTIFICATIONS: [&str; 9] = [
    "client_connected",
    "client_disconnected",
    "console_disconnected",
    "client_status",
    "job_admitted",
    "job_updated",
    "allocation_updated",
    "task_updated",
    "progress",
];

pub fn handler_table() -> HandlerRegistry<Console> {
    let mut table = HandlerRegistry::new(Target::Console)
        .register("clients", print_clients)
        .register("jobs", print_jobs);
    for function in NOTIFICATIONS {
        table = table.register(function, print_notification);
    }
    table
}

fn field(map: &Map<String, Value>, key: &str) -> String {
    match map.get(key) {
        None | Some(Value::Null) => "-".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

async fn print_notification(console: Console, call: Call) -> Result<()> {
    if console.json {
        let line = serde_json::json!({ "event": call.function, "data": call.kwargs });
        println!("{line}");
        return Ok(());
    }
    let mut keys: Vec<&String> = call.kwargs.keys().collect();
    keys.sort();
    let fields: Vec<String> = keys
        .into_iter()
        .map(|key| format!("{key}={}", field(&call.kwargs, key)))
        .collect();
    println!("[{}] {}", call.function, fields.join(" "));
    Ok(())
}

async fn print_clients(console: Console, call: Call) -> Result<()> {
    let clients: Vec<Map<String, Value>> = call.arg(0, "clients")?;
    if console.json {
        println!("{}", serde_json::to_string_pretty(&clients)?);
    } else if clients.is_empty() {
        println!("No clients connected.");
    } else {
        println!("{:<20} {:<10} {:<12} {:<12} TASK", "NAME", "STATUS", "JOB", "ALLOCATION");
        println!("{}", "-".repeat(66));
        for client in &clients {
            println!(
                "{:<20} {:<10} {:<12} {:<12} {}",
                field(client, "name"),
                field(client, "status"),
                field(client, "job"),
                field(client, "allocation"),
                field(client, "task"),
            );
        }
    }
    let _ = console.replies.send(());
    Ok(())
}

async fn print_jobs(console: Console, call: Call) -> Result<()> {
    let jobs: Vec<Map<String, Value>> = call.arg(0, "jobs")?;
    if console.json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
    } else if jobs.is_empty() {
        println!("No jobs found.");
    } else {
        println!("{:<20} {:<24} {:<11} {:<10} {:<8} FRAMES", "ID", "NAME", "STATUS", "TYPE", "ALLOCS");
        println!("{}", "-".repeat(86));
        for job in &jobs {
            let failed = job.get("has_failures").and_then(Value::as_bool) == Some(true);
            println!(
                "{:<20} {:<24} {:<11} {:<10} {:<8} {}{}",
                field(job, "id"),
                field(job, "name"),
                field(job, "status"),
                field(job, "type"),
                field(job, "allocations"),
                field(job, "range"),
                if failed { " (failures)" } else { "" },
            );
        }
    }
    let _ = console.replies.send(());
    Ok(())
}

/// Find the coordinator, run `command` against it and return.
///
/// `Watch` only returns on cancellation. Other commands return once their
/// listing has been printed. A refused or dropped connection is retried
/// after the reconnect backoff, going back to election each time; the
/// command's messages are sent again on the new session.
pub async fn run(
    config: &FarmConfig,
    store: Option<&Store>,
    command: Command,
    json: bool,
    token: &CancellationToken,
) -> Result<()> {
    let (messages, expected) = command.messages(&config.name)?;
    let mut config = config.clone();

    loop {
        let address = match negotiate(&config, store, false, token).await {
            Ok(Role::Client { address }) => address,
            Ok(Role::Server) => {
                return Err(FarmError::Internal("console cannot coordinate".into()));
            }
            Err(FarmError::Cancelled) => return Ok(()),
            Err(e) => return Err(e),
        };

        let result = attempt(&config, &address, messages.clone(), expected, json, token).await;
        if token.is_cancelled() {
            return Ok(());
        }
        match result {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(address = %address, error = %e, "Console session ended, reconnecting");
            }
        }

        config.last_known_server = Some(address);
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = tokio::time::sleep(config.timing.reconnect_backoff()) => {}
        }
    }
}

/// One console session: `Ok` once `expected` replies arrived or `token` is
/// cancelled, `Err` when the connection is refused or lost first.
async fn attempt(
    config: &FarmConfig,
    address: &str,
    messages: Vec<Message>,
    mut expected: Option<usize>,
    json: bool,
    token: &CancellationToken,
) -> Result<()> {
    let identity = Identity::console(config.name.clone(), &config.secret);
    let ws = dial(address, &identity, config.timing.connect_timeout()).await?;

    let (outbox, outgoing) = mpsc::unbounded_channel();
    for message in messages {
        outbox
            .send(message)
            .map_err(|_| FarmError::Connection("session closed".into()))?;
    }

    let (replies, mut replied) = mpsc::unbounded_channel();
    let session = Session {
        name: config.name.clone(),
        handlers: Arc::new(handler_table()),
        ctx: Console::new(json, replies),
    };

    let session_token = token.child_token();
    let mut session = tokio::spawn(session.run(ws, outgoing, session_token.clone()));
    let mut finished = None;
    while let Some(remaining) = expected {
        if remaining == 0 {
            break;
        }
        tokio::select! {
            _ = session_token.cancelled() => break,
            joined = &mut session => {
                finished = Some(joined);
                break;
            }
            reply = replied.recv() => match reply {
                Some(()) => expected = Some(remaining - 1),
                None => break,
            },
        }
    }

    let joined = match finished {
        Some(joined) => joined,
        None => {
            if expected.is_some() {
                session_token.cancel();
            }
            session.await
        }
    };
    // Keep the sender alive until the session is done with it.
    drop(outbox);
    joined.map_err(|e| FarmError::Internal(format!("console session: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_also_lists_jobs() {
        let (messages, expected) = Command::Retry { allocation: 12 }
            .messages("desk01")
            .unwrap();
        assert_eq!(expected, Some(1));
        let Message::Function(retry) = &messages[0] else {
            panic!("expected a call");
        };
        assert_eq!(retry.function, "retry_allocation");
        assert_eq!(retry.kwargs["allocation"], 12);
        assert!(matches!(&messages[1], Message::Function(c) if c.function == "list_jobs"));
    }

    #[test]
    fn pause_relays_to_classifier() {
        let (messages, _) = Command::SetStatus {
            classifier: "render*".into(),
            status: ClientStatus::Stopped,
        }
        .messages("desk01")
        .unwrap();
        let Message::Relay(relay) = &messages[0] else {
            panic!("expected a relay");
        };
        assert_eq!(relay.data["classifier"], "render*");
        assert_eq!(relay.data["message"]["function"], "set_status");
    }

    #[test]
    fn bad_classifier_is_rejected_locally() {
        let command = Command::SetStatus {
            classifier: "render[".into(),
            status: ClientStatus::Idle,
        };
        assert!(command.messages("desk01").is_err());
    }

    #[test]
    fn watch_never_finishes_on_its_own() {
        assert_eq!(Command::Watch.messages("desk01").unwrap(), (Vec::new(), None));
    }

    #[test]
    fn every_event_has_a_handler() {
        let table = handler_table();
        for function in ["client_connected", "client_disconnected", "console_disconnected", "progress"] {
            assert!(table.contains(function), "{function} not handled");
        }
    }

    #[tokio::test]
    async fn listing_counts_as_reply() {
        let (replies, mut replied) = mpsc::unbounded_channel();
        let console = Console::new(true, replies);
        let call: Call = FunctionMessage::new(Target::Console, "server", "jobs")
            .kwarg("jobs", serde_json::json!([{"id": 1, "name": "render_001"}]))
            .into();
        handler_table().dispatch(console, call).unwrap().await.unwrap();
        assert_eq!(replied.recv().await, Some(()));
    }
}
