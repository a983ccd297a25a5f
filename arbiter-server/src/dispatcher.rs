//! The job dispatcher.
//!
//! One dispatcher task owns the idle-worker queue and the conflict filter;
//! N worker tasks each block on a single-slot task channel. On any wakeup
//! (notify file touched, worker finished, startup) the dispatcher claims
//! head-of-queue pending jobs — `priority DESC, id ASC`, excluding jobs the
//! conflict filter blocks — while idle workers remain. A claimed job's
//! conflict rule enters the filter before the status flips to IN_PROGRESS,
//! and the owning worker removes it when the job reaches a terminal state.
//!
//! Shutdown is cooperative: the task channels close, workers finish their
//! current job and drain.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::config::RuntimeConfig;
use crate::files::FileStore;
use crate::handlers::{self, HandlerCtx, HandlerOutcome};
use crate::jobs::{ConflictFilter, JobRow, JobStatus};
use crate::logger::JobLog;
use crate::store::Store;

pub struct Dispatcher {
    store: Arc<dyn Store>,
    files: Arc<FileStore>,
    config: Arc<RuntimeConfig>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        files: Arc<FileStore>,
        config: Arc<RuntimeConfig>,
    ) -> Dispatcher {
        Dispatcher {
            store,
            files,
            config,
        }
    }

    /// Runs until `shutdown` resolves. `notify_rx` delivers notify-file
    /// wakeups; worker completions wake the loop internally.
    pub async fn run(
        &self,
        mut notify_rx: mpsc::UnboundedReceiver<()>,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<()> {
        let workers = self.config.job_server_workers;

        // Restart jobs that were left in progress by a previous instance.
        let reset = self
            .store
            .reset_in_progress_jobs()
            .await
            .context("failed to reset in-progress jobs")?;
        if reset > 0 {
            info!(count = reset, "reset in-progress jobs back to pending");
        }

        let filter = Arc::new(Mutex::new(ConflictFilter::default()));
        let (idle_tx, mut idle_rx) = mpsc::unbounded_channel::<usize>();
        let mut task_txs = Vec::with_capacity(workers);
        let mut worker_set = JoinSet::new();

        for worker_idx in 0..workers {
            let (task_tx, mut task_rx) = mpsc::channel::<JobRow>(1);
            task_txs.push(task_tx);
            let store = self.store.clone();
            let files = self.files.clone();
            let config = self.config.clone();
            let filter = filter.clone();
            let idle_tx = idle_tx.clone();
            worker_set.spawn(async move {
                while let Some(job) = task_rx.recv().await {
                    let job_id = job.id;
                    process_job(&store, &files, &config, job).await;
                    filter
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove_in_progress_job(job_id);
                    if idle_tx.send(worker_idx).is_err() {
                        break;
                    }
                }
            });
        }
        drop(idle_tx);

        let mut idle: VecDeque<usize> = (0..workers).collect();
        let mut notify_open = true;
        tokio::pin!(shutdown);

        loop {
            // Hand out runnable jobs while there is someone to run them.
            while !idle.is_empty() {
                let snapshot = filter.lock().unwrap_or_else(|e| e.into_inner()).snapshot();
                let Some(job) = self.store.next_pending_job(&snapshot).await? else {
                    break;
                };
                debug!(job_id = job.id, kind = ?job.kind, "claiming job");
                filter
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .add_in_progress_job(&job);
                self.store.set_job_in_progress(job.id).await?;
                let worker_idx = idle.pop_front().expect("idle is non-empty");
                if task_txs[worker_idx].send(job).await.is_err() {
                    error!(worker_idx, "worker task channel closed unexpectedly");
                }
            }

            tokio::select! {
                _ = &mut shutdown => break,
                recv = idle_rx.recv() => match recv {
                    Some(worker_idx) => idle.push_back(worker_idx),
                    None => break,
                },
                recv = notify_rx.recv(), if notify_open => {
                    if recv.is_none() {
                        notify_open = false;
                    }
                }
            }
        }

        info!("shutting down: waiting for the workers to finish processing jobs...");
        drop(task_txs);
        while worker_set.join_next().await.is_some() {}
        Ok(())
    }
}

/// Runs one handler with the panic fence around it: a panic or an error
/// marks the job FAILED with the message appended to its log. This is the
/// only place handler panics are caught.
async fn process_job(
    store: &Arc<dyn Store>,
    files: &Arc<FileStore>,
    config: &Arc<RuntimeConfig>,
    job: JobRow,
) {
    info!(job_id = job.id, kind = ?job.kind, "processing job");
    let log = JobLog::new();
    let ctx = HandlerCtx {
        store: store.clone(),
        files: files.clone(),
        config: config.clone(),
        log: log.clone(),
    };

    let outcome = std::panic::AssertUnwindSafe(handlers::run_handler(&ctx, &job))
        .catch_unwind()
        .await;

    let (status, line) = match outcome {
        Ok(Ok(HandlerOutcome::Finished)) => {
            debug!(job_id = job.id, "job finished");
            return;
        }
        Ok(Ok(HandlerOutcome::Cancelled(reason))) => (JobStatus::Cancelled, reason),
        Ok(Ok(HandlerOutcome::Failed(reason))) => (JobStatus::Failed, reason),
        Ok(Err(e)) => (JobStatus::Failed, format!("Caught exception: {e:#}")),
        Err(panic) => (JobStatus::Failed, format!("Caught panic: {}", panic_text(&panic))),
    };
    log.line(&line);
    if let Err(e) = store.finish_job(job.id, status, &log.snapshot()).await {
        error!(job_id = job.id, "failed to record the job outcome: {e:#}");
    }
}

fn panic_text(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
