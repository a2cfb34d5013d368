//! End-to-end tests: a live coordinator, shell workers and raw console
//! sessions.


use std::collections::HashSet;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use framefarm::console::{self, Command};
use framefarm::net::handshake::Identity;
use framefarm::protocol::{FunctionMessage, Message, Target};
use framefarm::scheduler::{ClientStatus, FrameRange, Job, Scheduler, Status};
use framefarm::store::Store;
use test_harness::{
    assert_eventually, recv, recv_call, send, shell_descriptor, TestFarm, SECRET,
};

const SETTLE: Duration = Duration::from_secs(10);

async fn job_is(farm: &TestFarm, job_id: i64, status: Status) -> bool {
    farm.store()
        .get_job(job_id)
        .map(|j| j.status == status)
        .unwrap_or(false)
}

#[tokio::test]
async fn test_worker_renders_dropped_job() {
    let mut farm = TestFarm::start().await;
    farm.spawn_worker("render01");
    farm.drop_descriptor("001.json", &shell_descriptor("render_001", 1, "1-6", 2, "true"));

    assert_eventually(
        || job_is(&farm, 1, Status::Done),
        SETTLE,
        "job should finish",
    )
    .await;

    for allocation in farm.store().allocations_for_job(1).unwrap() {
        assert_eq!(allocation.status, Status::Done);
        assert_eq!(allocation.computer.as_deref(), Some("render01"));
        for task in farm.store().tasks_for_allocation(allocation.id).unwrap() {
            assert_eq!(task.status, Status::Done);
        }
    }

    let registry = farm.coordinator.registry.clone();
    assert_eventually(
        || async {
            registry
                .read()
                .await
                .client("render01")
                .is_some_and(|r| r.status == ClientStatus::Idle && r.allocation.is_none())
        },
        SETTLE,
        "worker should be idle again",
    )
    .await;

    farm.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_work_spreads_over_workers() {
    let mut farm = TestFarm::start().await;
    farm.spawn_worker("render01");
    farm.spawn_worker("render02");
    farm.drop_descriptor(
        "001.json",
        &shell_descriptor("render_001", 1, "1-8", 2, "sleep 0.2"),
    );

    assert_eventually(
        || job_is(&farm, 1, Status::Done),
        SETTLE,
        "job should finish",
    )
    .await;

    let computers: HashSet<String> = farm
        .store()
        .allocations_for_job(1)
        .unwrap()
        .into_iter()
        .filter_map(|a| a.computer)
        .collect();
    assert_eq!(computers.len(), 2, "both workers should have rendered");

    farm.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_frame_then_console_retry() {
    let mut farm = TestFarm::start().await;
    let marker = farm.dir.path().join("license-ok");
    let command = format!("test -f {} || test {{frame}} -ne 3", marker.display());
    farm.spawn_worker("render01");
    farm.drop_descriptor("001.json", &shell_descriptor("render_001", 1, "1-4", 2, &command));

    assert_eventually(
        || job_is(&farm, 1, Status::Failed),
        SETTLE,
        "job should fail on frame 3",
    )
    .await;
    let allocations = farm.store().allocations_for_job(1).unwrap();
    assert_eq!(allocations[0].status, Status::Done);
    assert_eq!(allocations[1].status, Status::Failed);
    assert!(farm.store().get_job(1).unwrap().has_failures());

    std::fs::write(&marker, b"").unwrap();
    let mut console = farm.connect(&Identity::console("desk01", SECRET)).await.unwrap();
    send(
        &mut console,
        FunctionMessage::new(Target::Server, "desk01", "retry_allocation")
            .kwarg("allocation", allocations[1].id),
    )
    .await;

    assert_eventually(
        || job_is(&farm, 1, Status::Done),
        SETTLE,
        "retried job should finish",
    )
    .await;
    assert_eq!(
        farm.store().get_allocation(allocations[1].id).unwrap().info,
        None
    );

    farm.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_console_sees_events_and_listings() {
    let mut farm = TestFarm::start().await;
    let mut console = farm.connect(&Identity::console("desk01", SECRET)).await.unwrap();
    // A reply means the coordinator has attached this console.
    send(
        &mut console,
        FunctionMessage::new(Target::Server, "desk01", "list_clients"),
    )
    .await;
    assert!(recv_call(&mut console, "clients", SETTLE).await.is_some());

    farm.spawn_worker("render01");
    let connected = recv_call(&mut console, "client_connected", SETTLE).await;
    assert!(matches!(connected, Some(Message::Function(ref c)) if c.kwargs["name"] == "render01"));

    farm.drop_descriptor("001.json", &shell_descriptor("render_001", 7, "1-2", 2, "true"));
    let admitted = recv_call(&mut console, "job_admitted", SETTLE).await;
    assert!(matches!(admitted, Some(Message::Function(ref c)) if c.kwargs["job"] == 7));

    assert_eventually(
        || job_is(&farm, 7, Status::Done),
        SETTLE,
        "job should finish",
    )
    .await;

    send(
        &mut console,
        FunctionMessage::new(Target::Server, "desk01", "list_jobs"),
    )
    .await;
    let Some(Message::Function(jobs)) = recv_call(&mut console, "jobs", SETTLE).await else {
        panic!("expected a job listing");
    };
    let listed = jobs.kwargs["jobs"].as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["status"], "done");

    send(
        &mut console,
        FunctionMessage::new(Target::Server, "desk01", "list_clients"),
    )
    .await;
    let Some(Message::Function(clients)) = recv_call(&mut console, "clients", SETTLE).await else {
        panic!("expected a client listing");
    };
    assert_eq!(clients.kwargs["clients"][0]["name"], "render01");

    farm.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_function_is_reported_to_consoles() {
    let farm = TestFarm::start().await;
    let mut console = farm.connect(&Identity::console("desk01", SECRET)).await.unwrap();

    send(
        &mut console,
        FunctionMessage::new(Target::Server, "desk01", "explode"),
    )
    .await;

    let deadline = tokio::time::Instant::now() + SETTLE;
    let error = loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match recv(&mut console, remaining).await {
            Some(Message::Error(envelope)) => break envelope,
            Some(_) => continue,
            None => panic!("expected an error report"),
        }
    };
    assert_eq!(error.name, "desk01");
    assert!(error.data["error"].as_str().unwrap().contains("explode"));

    farm.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_relay_pauses_and_resumes_workers() {
    let mut farm = TestFarm::start().await;
    farm.spawn_worker("render01");
    let registry = farm.coordinator.registry.clone();
    assert_eventually(
        || async { registry.read().await.client("render01").is_some() },
        SETTLE,
        "worker should connect",
    )
    .await;

    let mut console = farm.connect(&Identity::console("desk01", SECRET)).await.unwrap();
    let pause: Message = FunctionMessage::new(Target::Client, "desk01", "set_status")
        .kwarg("status", "stopped")
        .into();
    send(&mut console, Message::relay("desk01", "render[01-04]", &pause)).await;
    assert_eventually(
        || async {
            registry
                .read()
                .await
                .client("render01")
                .is_some_and(|r| r.status == ClientStatus::Stopped)
        },
        SETTLE,
        "worker should report stopped",
    )
    .await;

    farm.drop_descriptor("001.json", &shell_descriptor("render_001", 1, "1-2", 2, "true"));
    let store = farm.store().clone();
    assert_eventually(
        || async { store.get_job(1).is_ok() },
        SETTLE,
        "job should be admitted",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(job_is(&farm, 1, Status::Pending).await, "paused worker got work");

    let resume: Message = FunctionMessage::new(Target::Client, "desk01", "set_status")
        .kwarg("status", "idle")
        .into();
    send(&mut console, Message::relay("desk01", "render*", &resume)).await;
    assert_eventually(
        || job_is(&farm, 1, Status::Done),
        SETTLE,
        "resumed worker should render",
    )
    .await;

    farm.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_orphaned_allocation_is_reissued_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let orphan = {
        let store = Store::open(dir.path().join("farm.db")).unwrap();
        let job = Job::new(1, "render_001", "shell", &FrameRange::parse("1-2").unwrap())
            .with_allocation_size(2)
            .with_parameter("command", "true");
        store.add_job(&job).unwrap();
        let mut scheduler = Scheduler::new(store);
        scheduler.sync_job(1).unwrap();
        let ghost: HashSet<String> = ["ghost".to_string()].into();
        scheduler.issue_task("ghost", &ghost).unwrap().unwrap().allocation_id
    };

    let mut farm = TestFarm::start_in(dir).await;
    farm.spawn_worker("render01");

    assert_eventually(
        || job_is(&farm, 1, Status::Done),
        SETTLE,
        "orphaned allocation should be reset and rendered",
    )
    .await;
    assert_eq!(
        farm.store().get_allocation(orphan).unwrap().computer.as_deref(),
        Some("render01")
    );

    farm.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_console_commands_return_after_listing() {
    let mut farm = TestFarm::start().await;
    farm.spawn_worker("render01");
    let registry = farm.coordinator.registry.clone();
    assert_eventually(
        || async { registry.read().await.client("render01").is_some() },
        SETTLE,
        "worker should connect",
    )
    .await;

    let config = farm.worker_config("desk01");
    let token = CancellationToken::new();
    tokio::time::timeout(SETTLE, console::run(&config, None, Command::Jobs, true, &token))
        .await
        .expect("listing should end the console")
        .unwrap();

    let pause = Command::SetStatus {
        classifier: "render*".into(),
        status: ClientStatus::Stopped,
    };
    tokio::time::timeout(SETTLE, console::run(&config, None, pause, false, &token))
        .await
        .expect("pause should end the console")
        .unwrap();
    assert_eventually(
        || async {
            registry
                .read()
                .await
                .client("render01")
                .is_some_and(|r| r.status == ClientStatus::Stopped)
        },
        SETTLE,
        "relayed pause should reach the worker",
    )
    .await;

    farm.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_watching_console_follows_coordinator_restart() {
    let farm = TestFarm::start().await;
    let config = farm.worker_config("desk01");
    let token = CancellationToken::new();
    let watch = tokio::spawn({
        let token = token.clone();
        async move { console::run(&config, None, Command::Watch, true, &token).await }
    });

    let registry = farm.coordinator.registry.clone();
    assert_eventually(
        || async { registry.read().await.console_names() == ["desk01"] },
        SETTLE,
        "console should attach",
    )
    .await;

    let farm = farm.restart().await;
    assert!(!watch.is_finished(), "console gave up on a lost coordinator");

    let registry = farm.coordinator.registry.clone();
    assert_eventually(
        || async { registry.read().await.console_names() == ["desk01"] },
        SETTLE,
        "console should reattach to the new coordinator",
    )
    .await;

    token.cancel();
    watch.await.unwrap().unwrap();
    farm.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_one_shot_console_retries_refused_handshake() {
    let farm = TestFarm::start().await;
    let holder = farm.connect(&Identity::console("desk01", SECRET)).await.unwrap();

    let config = farm.worker_config("desk01");
    let token = CancellationToken::new();
    let jobs = tokio::spawn({
        let token = token.clone();
        async move { console::run(&config, None, Command::Jobs, true, &token).await }
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!jobs.is_finished(), "duplicate name should be retried");

    drop(holder);
    tokio::time::timeout(SETTLE, jobs)
        .await
        .expect("listing should arrive once the name is free")
        .unwrap()
        .unwrap();

    farm.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_console_disconnect_is_announced() {
    let farm = TestFarm::start().await;
    let mut desk = farm.connect(&Identity::console("desk01", SECRET)).await.unwrap();
    let other = farm.connect(&Identity::console("desk02", SECRET)).await.unwrap();
    let registry = farm.coordinator.registry.clone();
    assert_eventually(
        || async { registry.read().await.console_names().len() == 2 },
        SETTLE,
        "both consoles should attach",
    )
    .await;

    drop(other);
    let left = recv_call(&mut desk, "console_disconnected", SETTLE).await;
    assert!(matches!(left, Some(Message::Function(ref c)) if c.kwargs["name"] == "desk02"));
    assert_eq!(registry.read().await.console_names(), ["desk01"]);

    farm.shutdown().await.unwrap();
}
