//! Job queue lifecycle: enqueue ordering, queued cancellation, and signaling
//! cancellation into a job that is actively running.

use panoptikon_engine::jobs::{CancellationToken, JobKind, JobManager, QueuedJobStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

#[test]
fn queue_status_lists_queued_jobs_in_fifo_order() {
    let manager = JobManager::new();
    manager.enqueue(JobKind::DataExtraction, serde_json::json!({"n": 1}));
    manager.enqueue(JobKind::FolderRescan, serde_json::json!({"n": 2}));

    let status = manager.queue_status();
    assert_eq!(status.len(), 2);
    assert_eq!(status[0].status, QueuedJobStatus::Queued);
    assert_eq!(status[0].job.metadata["n"], 1);
    assert_eq!(status[1].job.metadata["n"], 2);
}

#[test]
fn cancel_queued_only_removes_named_ids_and_preserves_order() {
    let manager = JobManager::new();
    let a = manager.enqueue(JobKind::DataExtraction, serde_json::json!({"n": 1}));
    let b = manager.enqueue(JobKind::DataExtraction, serde_json::json!({"n": 2}));
    let c = manager.enqueue(JobKind::DataExtraction, serde_json::json!({"n": 3}));

    let removed = manager.cancel_queued(&[b]);
    assert_eq!(removed, 1);

    let remaining: Vec<i64> = manager
        .queue_status()
        .into_iter()
        .map(|e| e.job.queue_id)
        .collect();
    assert_eq!(remaining, vec![a, c]);
}

#[test]
fn cancel_running_on_an_idle_manager_is_a_no_op() {
    let manager = JobManager::new();
    assert_eq!(manager.cancel_running(), None);
}

#[tokio::test]
async fn cancel_running_signals_the_token_threaded_into_the_job_body() {
    let manager = JobManager::new();
    let queue_id = manager.enqueue(JobKind::DataExtraction, serde_json::json!({}));

    // Synchronizes the test with the exact moment the consumer has started
    // running the job, so `cancel_running` is guaranteed to target it rather
    // than racing a job that is still queued.
    let (started_tx, mut started_rx) = mpsc::channel::<()>(1);
    let observed_cancelled = Arc::new(Mutex::new(false));
    let observed_clone = observed_cancelled.clone();

    let manager_clone = manager.clone();
    let handle = tokio::spawn(async move {
        manager_clone
            .run_consumer(|_job, token: CancellationToken| {
                let started_tx = started_tx.clone();
                let observed = observed_clone.clone();
                async move {
                    started_tx.send(()).await.ok();
                    // Poll for a bounded time rather than sleeping a fixed
                    // duration, so this isn't flaky under CI scheduling jitter.
                    for _ in 0..200 {
                        if token.is_cancelled() {
                            *observed.lock().await = true;
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    Ok(())
                }
            })
            .await;
    });

    started_rx.recv().await.expect("consumer should signal job start");
    let cancelled_id = manager.cancel_running();
    assert_eq!(cancelled_id, Some(queue_id));

    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.abort();
    assert!(*observed_cancelled.lock().await);
}

#[tokio::test]
async fn queue_status_reports_running_job_ahead_of_queued_ones() {
    let manager = JobManager::new();
    manager.enqueue(JobKind::DataExtraction, serde_json::json!({"n": 1}));

    let (started_tx, mut started_rx) = mpsc::channel::<()>(1);
    let (release_tx, release_rx) = mpsc::channel::<()>(1);
    let release_rx = Arc::new(Mutex::new(release_rx));

    let manager_clone = manager.clone();
    let handle = tokio::spawn(async move {
        manager_clone
            .run_consumer(|_job, _token| {
                let started_tx = started_tx.clone();
                let release_rx = release_rx.clone();
                async move {
                    started_tx.send(()).await.ok();
                    release_rx.lock().await.recv().await;
                    Ok(())
                }
            })
            .await;
    });

    started_rx.recv().await.expect("first job should start running");
    manager.enqueue(JobKind::FolderRescan, serde_json::json!({"n": 2}));

    let status = manager.queue_status();
    assert_eq!(status[0].status, QueuedJobStatus::Running);
    assert_eq!(status[0].job.metadata["n"], 1);
    assert_eq!(status[1].status, QueuedJobStatus::Queued);
    assert_eq!(status[1].job.metadata["n"], 2);

    release_tx.send(()).await.ok();
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.abort();
}
