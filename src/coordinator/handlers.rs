//! Functions workers and consoles may call on the coordinator.

use serde_json::{json, Value};

use super::Coordinator;
use crate::error::{FarmError, Result};
use crate::events::{self, FarmEvent};
use crate::net::dispatch::{Call, HandlerRegistry};
use crate::protocol::{FunctionMessage, Target};
use crate::scheduler::{ClientStatus, Scheduler, Transition};

pub(super) fn client_table() -> HandlerRegistry<Coordinator> {
    HandlerRegistry::new(Target::Server)
        .register("start_task", start_task)
        .register("finish_task", finish_task)
        .register("fail_task", fail_task)
        .register("finish_allocation", finish_allocation)
        .register("fail_allocation", fail_allocation)
        .register("progress", progress)
        .register("set_status", set_status)
}

pub(super) fn console_table() -> HandlerRegistry<Coordinator> {
    HandlerRegistry::new(Target::Server)
        .register("list_clients", list_clients)
        .register("list_jobs", list_jobs)
        .register("retry_allocation", retry_allocation)
}

/// Whether `sender` holds the allocation. Work that was reset or reissued
/// can no longer be settled by its previous computer. Ids the index no
/// longer has are left to the scheduler to judge.
fn holds(scheduler: &Scheduler, allocation_id: i64, sender: &str, function: &str) -> bool {
    let Some(allocation) = scheduler.tree().allocation(allocation_id) else {
        return true;
    };
    if allocation.computer.as_deref() == Some(sender) {
        return true;
    }
    tracing::warn!(
        function,
        allocation_id,
        sender,
        computer = allocation.computer.as_deref().unwrap_or("-"),
        "Dropping call from a computer that does not hold the allocation"
    );
    false
}

fn holds_task(scheduler: &Scheduler, task_id: i64, sender: &str, function: &str) -> bool {
    match scheduler.tree().task(task_id) {
        Some(task) => holds(scheduler, task.allocation_id, sender, function),
        None => true,
    }
}

async fn start_task(coordinator: Coordinator, call: Call) -> Result<()> {
    let task_id: i64 = call.arg(0, "task")?;
    let transitions = {
        let mut scheduler = coordinator.scheduler.lock().await;
        if !holds_task(&scheduler, task_id, &call.sender, "start_task") {
            return Ok(());
        }
        scheduler.start_task(task_id, &call.sender)?
    };
    if let Some(record) = coordinator.registry.write().await.client_mut(&call.sender) {
        record.task = Some(task_id);
    }
    events::publish_all(&coordinator.events, transitions);
    Ok(())
}

async fn finish_task(coordinator: Coordinator, call: Call) -> Result<()> {
    let task_id: i64 = call.arg(0, "task")?;
    let transitions = {
        let mut scheduler = coordinator.scheduler.lock().await;
        if !holds_task(&scheduler, task_id, &call.sender, "finish_task") {
            return Ok(());
        }
        scheduler.finish_task(task_id)?
    };
    settle(&coordinator, &call.sender, transitions).await;
    Ok(())
}

async fn fail_task(coordinator: Coordinator, call: Call) -> Result<()> {
    let task_id: i64 = call.arg(0, "task")?;
    let reason: String = call.opt_arg(1, "reason")?.unwrap_or_default();
    let transitions = {
        let mut scheduler = coordinator.scheduler.lock().await;
        if !holds_task(&scheduler, task_id, &call.sender, "fail_task") {
            return Ok(());
        }
        scheduler.fail_task(task_id, &reason)?
    };
    settle(&coordinator, &call.sender, transitions).await;
    Ok(())
}

async fn finish_allocation(coordinator: Coordinator, call: Call) -> Result<()> {
    let allocation_id: i64 = call.arg(0, "allocation")?;
    let transitions = {
        let mut scheduler = coordinator.scheduler.lock().await;
        if !holds(&scheduler, allocation_id, &call.sender, "finish_allocation") {
            return Ok(());
        }
        scheduler.finish_allocation(allocation_id)?
    };
    settle(&coordinator, &call.sender, transitions).await;
    Ok(())
}

async fn fail_allocation(coordinator: Coordinator, call: Call) -> Result<()> {
    let allocation_id: i64 = call.arg(0, "allocation")?;
    let reason: String = call.opt_arg(1, "reason")?.unwrap_or_default();
    let transitions = {
        let mut scheduler = coordinator.scheduler.lock().await;
        if !holds(&scheduler, allocation_id, &call.sender, "fail_allocation") {
            return Ok(());
        }
        scheduler.fail_allocation(allocation_id, &reason)?
    };
    settle(&coordinator, &call.sender, transitions).await;
    Ok(())
}

/// Publish the transitions, and put the sender back in the idle pool once
/// the allocation it was working on has ended.
async fn settle(coordinator: &Coordinator, sender: &str, transitions: Vec<Transition>) {
    let ended: Vec<i64> = transitions
        .iter()
        .filter_map(|t| match t {
            Transition::Allocation { id, status } if !status.is_active() => Some(*id),
            _ => None,
        })
        .collect();
    events::publish_all(&coordinator.events, transitions);

    let mut registry = coordinator.registry.write().await;
    let Some(record) = registry.client_mut(sender) else {
        return;
    };
    if record.allocation.is_some_and(|a| ended.contains(&a)) {
        record.set_idle();
        events::publish(
            &coordinator.events,
            FarmEvent::ClientStatus {
                name: sender.to_string(),
                status: ClientStatus::Idle,
            },
        );
    }
}

async fn progress(coordinator: Coordinator, call: Call) -> Result<()> {
    let progress: f64 = call.arg(0, "progress")?;
    let allocation = coordinator
        .registry
        .read()
        .await
        .client(&call.sender)
        .and_then(|r| r.allocation);
    events::publish(
        &coordinator.events,
        FarmEvent::Progress {
            name: call.sender,
            allocation,
            progress,
        },
    );
    Ok(())
}

/// A worker pausing (`stopped`) or announcing it is free (`idle`).
async fn set_status(coordinator: Coordinator, call: Call) -> Result<()> {
    let status: String = call.arg(0, "status")?;
    let status: ClientStatus = status
        .parse()
        .map_err(|_| FarmError::bad_arguments("set_status", format!("unknown status `{status}`")))?;

    let mut registry = coordinator.registry.write().await;
    let record = registry
        .client_mut(&call.sender)
        .ok_or_else(|| FarmError::bad_arguments("set_status", "caller is not a client"))?;
    if status == ClientStatus::Idle {
        record.set_idle();
    } else {
        record.status = status;
    }
    tracing::info!(name = %call.sender, %status, "Client status changed");
    events::publish(
        &coordinator.events,
        FarmEvent::ClientStatus {
            name: call.sender,
            status,
        },
    );
    Ok(())
}

async fn list_clients(coordinator: Coordinator, call: Call) -> Result<()> {
    let registry = coordinator.registry.read().await;
    let clients: Vec<Value> = registry.clients().map(|r| r.summary()).collect();
    let reply = FunctionMessage::new(Target::Console, coordinator.name(), "clients")
        .kwarg("clients", clients);
    registry.send_to_console(&call.sender, reply.into());
    Ok(())
}

async fn list_jobs(coordinator: Coordinator, call: Call) -> Result<()> {
    let jobs: Vec<Value> = coordinator
        .store
        .all_jobs()?
        .into_iter()
        .map(|job| {
            json!({
                "id": job.id,
                "name": job.name,
                "status": job.status.as_str(),
                "purpose": job.purpose.as_str(),
                "type": job.kind,
                "range": job.range,
                "allocations": job.allocation_ids.len(),
                "has_failures": job.has_failures(),
            })
        })
        .collect();
    let reply =
        FunctionMessage::new(Target::Console, coordinator.name(), "jobs").kwarg("jobs", jobs);
    coordinator
        .registry
        .read()
        .await
        .send_to_console(&call.sender, reply.into());
    Ok(())
}

async fn retry_allocation(coordinator: Coordinator, call: Call) -> Result<()> {
    let allocation_id: i64 = call.arg(0, "allocation")?;
    let transitions = coordinator
        .scheduler
        .lock()
        .await
        .retry_allocation(allocation_id)?;
    tracing::info!(allocation_id, console = %call.sender, "Retry requested");
    events::publish_all(&coordinator.events, transitions);
    Ok(())
}
