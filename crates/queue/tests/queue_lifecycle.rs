//! End-to-end queue scenarios driven through the public API with the
//! in-memory executor, host and probe.

use encode_queue::testing::{FixedLiveness, MockExecutor, MockProbe, RecordingHost};
use encode_queue::{
    BatteryStatus, EncodeOutcome, HealthSettings, Job, JobId, JobQueue, JobStatus,
    OrchestratorSettings, PauseReason, QueueEvent, QueueOrchestrator, QueueState, SnapshotStore,
    SystemHealthMonitor,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

struct Rig {
    queue: Arc<JobQueue>,
    executor: Arc<MockExecutor>,
    probe: Arc<MockProbe>,
    orchestrator: QueueOrchestrator,
    events: broadcast::Receiver<QueueEvent>,
}

fn rig_with_queue(queue: Arc<JobQueue>) -> Rig {
    let executor = Arc::new(MockExecutor::new());
    let probe = Arc::new(MockProbe::new());
    let orchestrator = QueueOrchestrator::new(
        queue.clone(),
        executor.clone(),
        Arc::new(RecordingHost::new()),
        probe.clone(),
        OrchestratorSettings::default(),
    );
    let events = orchestrator.subscribe();
    Rig {
        queue,
        executor,
        probe,
        orchestrator,
        events,
    }
}

fn rig() -> Rig {
    rig_with_queue(Arc::new(JobQueue::new()))
}

fn submit(queue: &JobQueue, name: &str) -> JobId {
    let job = Job::new(
        format!("/media/in/{}.mkv", name),
        format!("/media/out/{}.mp4", name),
        json!({"preset": "Fast 1080p30"}),
    );
    let id = job.id.clone();
    queue.submit(job).unwrap();
    id
}

async fn next_matching<F: Fn(&QueueEvent) -> bool>(
    rx: &mut broadcast::Receiver<QueueEvent>,
    pred: F,
) -> QueueEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("queue event expected")
            .expect("event channel open");
        if pred(&event) {
            return event;
        }
    }
}

async fn started(rx: &mut broadcast::Receiver<QueueEvent>) -> JobId {
    match next_matching(rx, |e| matches!(e, QueueEvent::JobStarted(_))).await {
        QueueEvent::JobStarted(job) => job.id,
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn failed_job_pauses_queue_until_manual_resume() {
    let mut rig = rig();
    let a = submit(&rig.queue, "a");
    let b = submit(&rig.queue, "b");
    let c = submit(&rig.queue, "c");

    rig.orchestrator.start().await.unwrap();
    assert_eq!(started(&mut rig.events).await, a);
    rig.executor.complete(EncodeOutcome::Success);

    assert_eq!(started(&mut rig.events).await, b);
    rig.executor
        .complete(EncodeOutcome::Failed("encoder exited with code 3".into()));

    let paused = next_matching(&mut rig.events, |e| matches!(e, QueueEvent::QueuePaused(_))).await;
    assert_eq!(paused, QueueEvent::QueuePaused(PauseReason::JobError));
    assert_eq!(rig.queue.get(&a).unwrap().status, JobStatus::Completed);
    assert_eq!(rig.queue.get(&b).unwrap().status, JobStatus::Error);
    assert_eq!(rig.queue.get(&c).unwrap().status, JobStatus::Waiting);

    // The failed job stays failed; resuming moves on to the next one.
    rig.orchestrator.start().await.unwrap();
    assert_eq!(started(&mut rig.events).await, c);
    rig.executor.complete(EncodeOutcome::Success);
    next_matching(&mut rig.events, |e| matches!(e, QueueEvent::QueueCompleted)).await;

    // Resetting the failed job lets a fresh run retry it.
    rig.queue.reset_job_status_to_waiting(&b).unwrap();
    rig.orchestrator.start().await.unwrap();
    assert_eq!(started(&mut rig.events).await, b);
    rig.executor.complete(EncodeOutcome::Success);
    next_matching(&mut rig.events, |e| matches!(e, QueueEvent::QueueCompleted)).await;
    assert_eq!(rig.executor.started_jobs(), vec![a, b.clone(), c, b]);
}

#[tokio::test]
async fn crash_recovery_restores_unfinished_jobs() {
    let temp = TempDir::new().unwrap();

    // A previous instance that died mid-encode.
    let crashed = Arc::new(SnapshotStore::with_identity(
        temp.path(),
        1000,
        Arc::new(FixedLiveness::default()),
    ));
    let old_queue = JobQueue::with_snapshots(crashed.clone());
    let done = submit(&old_queue, "done");
    let running = submit(&old_queue, "running");
    let waiting = submit(&old_queue, "waiting");
    old_queue.set_status(&done, JobStatus::Completed, None).unwrap();
    let admitted = old_queue.next_job_for_processing().unwrap();
    assert_eq!(admitted.id, running);
    assert!(crashed.own_path().exists());
    drop(old_queue);

    let store = Arc::new(SnapshotStore::with_identity(
        temp.path(),
        2000,
        Arc::new(FixedLiveness::default()),
    ));
    let queue = Arc::new(JobQueue::with_snapshots(store.clone()));
    assert_eq!(store.recover_into(&queue), 2);

    assert!(!crashed.own_path().exists());
    assert!(queue.get(&done).is_none());
    assert_eq!(queue.get(&running).unwrap().status, JobStatus::Waiting);
    assert_eq!(queue.get(&waiting).unwrap().status, JobStatus::Waiting);
    assert!(store.own_path().exists());

    // Recovered jobs run in their original order.
    let mut rig = rig_with_queue(queue);
    rig.orchestrator.start().await.unwrap();
    assert_eq!(started(&mut rig.events).await, running);
}

#[tokio::test]
async fn snapshot_of_live_instance_is_left_alone() {
    let temp = TempDir::new().unwrap();
    let other = Arc::new(SnapshotStore::with_identity(
        temp.path(),
        1000,
        Arc::new(FixedLiveness::default()),
    ));
    let other_queue = JobQueue::with_snapshots(other.clone());
    submit(&other_queue, "a");

    let store = SnapshotStore::with_identity(
        temp.path(),
        2000,
        Arc::new(FixedLiveness::new(vec![1000])),
    );
    let queue = JobQueue::new();
    assert_eq!(store.recover_into(&queue), 0);
    assert!(queue.is_empty());
    assert!(other.own_path().exists());
}

#[tokio::test]
async fn low_battery_pauses_and_ac_power_resumes() {
    let mut rig = rig();
    let a = submit(&rig.queue, "a");
    let b = submit(&rig.queue, "b");
    let monitor = SystemHealthMonitor::new(
        rig.orchestrator.clone(),
        rig.probe.clone(),
        HealthSettings::default(),
    );

    rig.orchestrator.start().await.unwrap();
    assert_eq!(started(&mut rig.events).await, a);

    rig.probe.set_battery(Some(BatteryStatus {
        on_battery: true,
        percent: 10,
    }));
    monitor.check_once().await;
    assert_eq!(rig.orchestrator.pause_reason(), Some(PauseReason::LowBattery));

    // The running job finishes but nothing new is admitted.
    rig.executor.complete(EncodeOutcome::Success);
    next_matching(&mut rig.events, |e| matches!(e, QueueEvent::JobCompleted { .. })).await;
    assert_eq!(rig.queue.get(&b).unwrap().status, JobStatus::Waiting);

    rig.probe.set_battery(Some(BatteryStatus {
        on_battery: false,
        percent: 12,
    }));
    monitor.check_once().await;
    assert_eq!(started(&mut rig.events).await, b);
    assert_eq!(rig.orchestrator.state(), QueueState::Processing);
}

#[tokio::test]
async fn low_disk_pauses_without_automatic_resume() {
    let mut rig = rig();
    let a = submit(&rig.queue, "a");
    let b = submit(&rig.queue, "b");
    let monitor = SystemHealthMonitor::new(
        rig.orchestrator.clone(),
        rig.probe.clone(),
        HealthSettings::default(),
    );

    rig.orchestrator.start().await.unwrap();
    assert_eq!(started(&mut rig.events).await, a);

    rig.probe.set_free_space("/media/out", 64 * 1024 * 1024);
    monitor.check_once().await;
    assert_eq!(rig.orchestrator.pause_reason(), Some(PauseReason::LowDisk));

    rig.executor.complete(EncodeOutcome::Success);
    next_matching(&mut rig.events, |e| matches!(e, QueueEvent::JobCompleted { .. })).await;

    rig.probe.set_free_space("/media/out", 500 * 1024 * 1024 * 1024);
    monitor.check_once().await;
    assert!(!monitor.paused_for_storage());
    assert_eq!(rig.orchestrator.pause_reason(), Some(PauseReason::LowDisk));
    assert_eq!(rig.queue.get(&b).unwrap().status, JobStatus::Waiting);

    rig.orchestrator.start().await.unwrap();
    assert_eq!(started(&mut rig.events).await, b);
}

#[tokio::test]
async fn reordering_changes_processing_order() {
    let mut rig = rig();
    let a = submit(&rig.queue, "a");
    let b = submit(&rig.queue, "b");
    let c = submit(&rig.queue, "c");

    rig.queue.move_up(2);
    rig.queue.move_down(0);
    rig.queue.move_up(0);
    rig.queue.move_down(2);
    let order: Vec<JobId> = rig.queue.jobs().into_iter().map(|j| j.id).collect();
    assert_eq!(order, vec![c.clone(), a.clone(), b.clone()]);

    rig.orchestrator.start().await.unwrap();
    for expected in [&c, &a, &b] {
        assert_eq!(&started(&mut rig.events).await, expected);
        rig.executor.complete(EncodeOutcome::Success);
    }
    next_matching(&mut rig.events, |e| matches!(e, QueueEvent::QueueCompleted)).await;
}

#[tokio::test]
async fn stop_is_idempotent() {
    let mut rig = rig();
    let a = submit(&rig.queue, "a");
    submit(&rig.queue, "b");

    // Nothing running yet.
    rig.orchestrator.stop().await;
    assert_eq!(rig.orchestrator.state(), QueueState::Idle);

    rig.orchestrator.start().await.unwrap();
    assert_eq!(started(&mut rig.events).await, a);

    rig.orchestrator.stop().await;
    rig.orchestrator.stop().await;

    let completed =
        next_matching(&mut rig.events, |e| matches!(e, QueueEvent::JobCompleted { .. })).await;
    assert!(matches!(
        completed,
        QueueEvent::JobCompleted { success: false, error: Some(ref e), .. } if e == "stopped"
    ));

    // Exactly one completion for the stopped job.
    let extra = tokio::time::timeout(Duration::from_millis(200), async {
        next_matching(&mut rig.events, |e| matches!(e, QueueEvent::JobCompleted { .. })).await
    })
    .await;
    assert!(extra.is_err());
    assert_eq!(rig.executor.started_jobs().len(), 1);
    assert_eq!(rig.orchestrator.pause_reason(), Some(PauseReason::Manual));
}

#[test]
fn duplicate_destinations_are_rejected() {
    let queue = JobQueue::new();
    queue
        .submit(Job::new("/in/a.mkv", "/media/out/movie.mp4", json!(null)))
        .unwrap();

    let duplicate = Job::new("/in/b.mkv", "/media/out/./x/../movie.mp4", json!(null));
    assert!(queue.submit(duplicate).is_err());
    assert!(queue.check_for_destination_duplicate(&PathBuf::from("/media/out/movie.mp4")));
    assert!(!queue.check_for_destination_duplicate(&PathBuf::from("/media/out/Movie.mp4")));
    assert_eq!(queue.len(), 1);
}
