//! Dispatcher behavior: dispatch order, conflict exclusion, crash recovery
//! and the cooperative lifecycle, all against the memory store.

mod common;

use arbiter_server::dispatcher::Dispatcher;
use arbiter_server::jobs::{ConflictFilter, JobStatus, JobType, NewJob};
use arbiter_server::store::Store;
use tokio::sync::{mpsc, oneshot};

use common::{wait_for_jobs, Fixture, T0};

fn dispatcher_of(fx: &Fixture) -> Dispatcher {
    Dispatcher::new(fx.store_dyn(), fx.files.clone(), fx.config.clone())
}

/// Runs the dispatcher in the background; the returned sender stops it.
fn spawn_dispatcher(
    fx: &Fixture,
) -> (
    tokio::task::JoinHandle<anyhow::Result<()>>,
    mpsc::UnboundedSender<()>,
    oneshot::Sender<()>,
) {
    let dispatcher = dispatcher_of(fx);
    let (notify_tx, notify_rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        dispatcher
            .run(notify_rx, async move {
                let _ = stop_rx.await;
            })
            .await
    });
    (handle, notify_tx, stop_tx)
}

#[tokio::test]
async fn pending_jobs_dispatch_by_priority_then_id() {
    let fx = Fixture::new();
    let low = fx.enqueue(NewJob::new(JobType::EditProblem, T0).aux(1).priority(1)).await;
    let high = fx.enqueue(NewJob::new(JobType::EditProblem, T0).aux(2).priority(9)).await;
    let mid_a = fx.enqueue(NewJob::new(JobType::EditProblem, T0).aux(3).priority(5)).await;
    let mid_b = fx.enqueue(NewJob::new(JobType::EditProblem, T0).aux(4).priority(5)).await;

    let filter = ConflictFilter::default();
    let mut order = Vec::new();
    for _ in 0..4 {
        let job = fx
            .store
            .next_pending_job(&filter.snapshot())
            .await
            .unwrap()
            .expect("a pending job");
        fx.store.set_job_in_progress(job.id).await.unwrap();
        order.push(job.id);
    }
    // Priority wins; equal priorities dispatch in id order.
    assert_eq!(order, vec![high.id, mid_a.id, mid_b.id, low.id]);
    assert!(mid_a.id < mid_b.id);
}

#[tokio::test]
async fn conflicting_delete_jobs_run_one_after_another() {
    let fx = Fixture::new();
    fx.problem_with_package(7).await;
    let first = fx.enqueue(NewJob::new(JobType::DeleteProblem, T0).aux(7)).await;
    let second = fx.enqueue(NewJob::new(JobType::DeleteProblem, T0).aux(7)).await;
    assert_eq!(first.priority, second.priority);

    let (handle, notify_tx, stop_tx) = spawn_dispatcher(&fx);
    notify_tx.send(()).unwrap();

    wait_for_jobs(&fx.store, "all jobs to reach a terminal state", |jobs| {
        jobs.iter().all(|j| j.status.is_terminal())
    })
    .await;

    // Lower id ran first and deleted the problem; the second then failed.
    let first = fx.store.job(first.id).await.unwrap().unwrap();
    let second = fx.store.job(second.id).await.unwrap().unwrap();
    assert_eq!(first.status, JobStatus::Done);
    assert_eq!(second.status, JobStatus::Failed);
    assert!(second.log.contains("Problem does not exist"));
    assert!(!fx.store.problem_exists(7).await);

    // The package file got a deletion job, which also completed.
    let file_jobs = fx.store.jobs_of_type(JobType::DeleteInternalFile).await;
    assert_eq!(file_jobs.len(), 1);
    assert!(file_jobs.iter().all(|j| j.status == JobStatus::Done));

    drop(stop_tx);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn crash_recovery_resets_in_progress_jobs() {
    let fx = Fixture::new();
    let a = fx.enqueue(NewJob::new(JobType::EditProblem, T0).aux(1)).await;
    let b = fx.enqueue(NewJob::new(JobType::EditProblem, T0).aux(2)).await;
    fx.store.force_job_status(a.id, JobStatus::InProgress).await;
    fx.store.force_job_status(b.id, JobStatus::InProgress).await;

    let reset = fx.store.reset_in_progress_jobs().await.unwrap();
    assert_eq!(reset, 2);
    for id in [a.id, b.id] {
        let job = fx.store.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }

    // Normal dispatch resumes: the dispatcher picks them up and (for the
    // unimplemented EDIT_PROBLEM) cancels them.
    fx.store.force_job_status(a.id, JobStatus::InProgress).await;
    fx.store.force_job_status(b.id, JobStatus::InProgress).await;
    let (handle, notify_tx, stop_tx) = spawn_dispatcher(&fx);
    notify_tx.send(()).unwrap();
    wait_for_jobs(&fx.store, "recovered jobs to be dispatched and cancelled", |jobs| {
        jobs.iter().all(|j| j.status == JobStatus::Cancelled)
    })
    .await;
    drop(stop_tx);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn non_conflicting_jobs_run_concurrently_within_the_pool() {
    let fx = Fixture::new();
    // Two independent internal-file deletions; nothing blocks them.
    let f1 = fx.store.seed_internal_file(T0).await;
    let f2 = fx.store.seed_internal_file(T0).await;
    fx.enqueue(NewJob::new(JobType::DeleteInternalFile, T0).aux(f1)).await;
    fx.enqueue(NewJob::new(JobType::DeleteInternalFile, T0).aux(f2)).await;

    let (handle, notify_tx, stop_tx) = spawn_dispatcher(&fx);
    notify_tx.send(()).unwrap();
    wait_for_jobs(&fx.store, "both deletions to finish", |jobs| {
        jobs.iter()
            .filter(|j| j.kind == JobType::DeleteInternalFile)
            .all(|j| j.status == JobStatus::Done)
    })
    .await;
    assert!(!fx.store.internal_file_exists(f1).await);
    assert!(!fx.store.internal_file_exists(f2).await);
    drop(stop_tx);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_without_work_is_clean() {
    let fx = Fixture::new();
    let (handle, _notify_tx, stop_tx) = spawn_dispatcher(&fx);
    drop(stop_tx);
    handle.await.unwrap().unwrap();
}
