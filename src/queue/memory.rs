//! In-memory queue: a bounded channel with FIFO, serial delivery.

use std::future::Future;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{HandlerError, Queue, QueueError};
use crate::models::job::QueuedJob;

/// Producer handle for the in-memory backing.
#[derive(Clone)]
pub struct MemoryQueue {
    tx: mpsc::Sender<QueuedJob>,
}

impl MemoryQueue {
    /// Create the queue with a bounded capacity; `enqueue` blocks when the
    /// channel is full. The receiver is handed to [`wait`].
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<QueuedJob>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(&self, job: QueuedJob) -> Result<(), QueueError> {
        self.tx.send(job).await.map_err(|_| QueueError::Closed)
    }
}

/// Drive the worker loop until cancellation.
///
/// Jobs are delivered serially in FIFO order. On cancellation the loop
/// stops pulling; an in-flight handler finishes before the returned handle
/// resolves, so awaiting it is the shutdown barrier.
pub fn wait<F, Fut>(
    mut rx: mpsc::Receiver<QueuedJob>,
    cancel: CancellationToken,
    handler: F,
) -> JoinHandle<()>
where
    F: Fn(QueuedJob) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    tokio::spawn(async move {
        loop {
            let job = tokio::select! {
                _ = cancel.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            // The handler is not raced against the token: in-flight work
            // is allowed to finish.
            if let Err(e) = handler(job).await {
                tracing::error!(error = %e, "job handler failed");
            }
        }
        tracing::info!("memory queue worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use uuid::Uuid;

    use super::*;
    use crate::models::job::Job;

    fn job(n: i64) -> QueuedJob {
        QueuedJob {
            analysis_id: Uuid::new_v4(),
            repo: "owner/demo".to_string(),
            head_sha: "abc".to_string(),
            job: Job::Push {
                base_url: "u".to_string(),
                base_ref: format!("sha{n}~1"),
                head_url: "u".to_string(),
                head_ref: format!("sha{n}"),
                installation_id: 1,
                repo_id: n,
            },
        }
    }

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let (queue, rx) = MemoryQueue::new(10);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        let recorder = seen.clone();
        let worker = wait(rx, cancel.clone(), move |job| {
            let recorder = recorder.clone();
            async move {
                recorder.lock().unwrap().push(job.job.repo_id());
                Ok(())
            }
        });

        for n in 1..=3 {
            queue.enqueue(job(n)).await.unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        worker.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn handler_error_does_not_kill_the_loop() {
        let (queue, rx) = MemoryQueue::new(10);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        let recorder = seen.clone();
        let worker = wait(rx, cancel.clone(), move |job| {
            let recorder = recorder.clone();
            async move {
                recorder.lock().unwrap().push(job.job.repo_id());
                if job.job.repo_id() == 1 {
                    Err("boom".into())
                } else {
                    Ok(())
                }
            }
        });

        queue.enqueue(job(1)).await.unwrap();
        queue.enqueue(job(2)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        worker.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn cancellation_stops_intake_but_finishes_in_flight_work() {
        let (queue, rx) = MemoryQueue::new(10);
        let finished = Arc::new(Mutex::new(false));
        let cancel = CancellationToken::new();

        let flag = finished.clone();
        let worker = wait(rx, cancel.clone(), move |_job| {
            let flag = flag.clone();
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                *flag.lock().unwrap() = true;
                Ok(())
            }
        });

        queue.enqueue(job(1)).await.unwrap();
        // Give the worker time to pick the job up, then cancel mid-handler.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();
        worker.await.unwrap();

        assert!(*finished.lock().unwrap(), "in-flight handler must finish");
    }

    #[tokio::test]
    async fn enqueue_after_worker_drop_reports_closed() {
        let (queue, rx) = MemoryQueue::new(1);
        drop(rx);
        let err = queue.enqueue(job(1)).await.unwrap_err();
        assert!(matches!(err, QueueError::Closed));
    }
}
