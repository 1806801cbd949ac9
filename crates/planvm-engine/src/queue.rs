//! Worker pool: tasks are independent units of work drawn from a queue.
//!
//! Each worker acquires the task's advisory lock before executing; a task
//! already held by another worker is re-queued after a short delay. Within
//! one task execution stays single-threaded and sequential.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use planvm_core::store::StoreError;

use crate::engine::{Engine, EngineError};

const REQUEUE_DELAY: Duration = Duration::from_millis(250);

/// Handle for submitting tasks and cancelling running ones.
pub struct WorkerPool {
    sender: mpsc::UnboundedSender<Uuid>,
    cancellations: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `worker_count` workers executing tasks against the engine.
    pub fn spawn(engine: Arc<Engine>, worker_count: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel::<Uuid>();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let cancellations: Arc<Mutex<HashMap<Uuid, CancellationToken>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        let mut workers = Vec::with_capacity(worker_count.max(1));
        for worker_id in 0..worker_count.max(1) {
            let engine = engine.clone();
            let receiver = receiver.clone();
            let sender = sender.clone();
            let cancellations = cancellations.clone();
            let shutdown = shutdown.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let task_id = {
                        let mut receiver = receiver.lock().await;
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            task_id = receiver.recv() => match task_id {
                                Some(task_id) => task_id,
                                None => break,
                            },
                        }
                    };

                    let cancel = {
                        let mut map = cancellations
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                        map.entry(task_id).or_insert_with(CancellationToken::new).clone()
                    };

                    tracing::info!(worker_id, task_id = %task_id, "worker picked up task");
                    match engine.execute_task(task_id, cancel).await {
                        Ok(outcome) => {
                            tracing::info!(
                                worker_id,
                                task_id = %task_id,
                                status = ?outcome.status,
                                "task finished"
                            );
                        }
                        Err(EngineError::Store(StoreError::Locked(_))) => {
                            // Another worker holds the task; try again later.
                            tracing::debug!(worker_id, task_id = %task_id, "task locked, re-queueing");
                            tokio::time::sleep(REQUEUE_DELAY).await;
                            let _ = sender.send(task_id);
                            continue;
                        }
                        Err(e) => {
                            tracing::error!(worker_id, task_id = %task_id, error = %e, "task execution failed");
                        }
                    }
                    cancellations
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .remove(&task_id);
                }
            }));
        }

        Self {
            sender,
            cancellations,
            shutdown,
            workers,
        }
    }

    /// Enqueue a task for execution.
    pub fn submit(&self, task_id: Uuid) -> Result<(), EngineError> {
        self.sender
            .send(task_id)
            .map_err(|_| EngineError::Store(StoreError::Internal("worker pool is shut down".to_string())))
    }

    /// Signal cancellation for a task. The worker polls the signal before
    /// each instruction dispatch.
    pub fn cancel(&self, task_id: Uuid) {
        let mut map = self
            .cancellations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(task_id)
            .or_insert_with(CancellationToken::new)
            .cancel();
    }

    /// Stop all workers after their current task.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}
