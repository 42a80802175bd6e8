use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ConfigError, ExecutorError, ProcessError};
use crate::metrics_consts::EXECUTOR_QUEUE_SATURATED_TOTAL;
use crate::process::{FilterMapOutcome, ProcessChain};
use crate::subscriber::SubscriberRecord;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed number of workers draining one bounded queue. With a single worker,
/// jobs run strictly in submission order.
pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, workers: usize, queue_size: usize) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::channel::<Job>(queue_size.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..workers)
            .map(|worker_id| {
                let rx = rx.clone();
                let pool = name.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        let Some(job) = job else {
                            debug!(pool = %pool, worker_id, "Worker queue closed, exiting");
                            break;
                        };
                        if let Err(e) = tokio::task::spawn_blocking(job).await {
                            warn!(pool = %pool, worker_id, error = ?e, "Worker job panicked");
                        }
                    }
                })
            })
            .collect();

        Self {
            name,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn sender(&self) -> Option<mpsc::Sender<Job>> {
        match self.sender.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Queue a job, waiting for capacity when the queue is full.
    pub async fn submit(&self, job: Job) -> Result<(), ExecutorError> {
        let sender = self
            .sender()
            .ok_or_else(|| ExecutorError::PoolClosed(self.name.clone()))?;

        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(job)) => {
                metrics::counter!(EXECUTOR_QUEUE_SATURATED_TOTAL, "pool" => self.name.clone())
                    .increment(1);
                sender
                    .send(job)
                    .await
                    .map_err(|_| ExecutorError::PoolClosed(self.name.clone()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(ExecutorError::PoolClosed(self.name.clone()))
            }
        }
    }

    /// Stop accepting jobs, let workers drain what is queued, and wait for
    /// them. Workers still running after `timeout` are aborted.
    pub async fn shutdown(&self, timeout: Duration) {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);

        let workers: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };

        let aborts: Vec<_> = workers.iter().map(|w| w.abort_handle()).collect();
        if tokio::time::timeout(timeout, futures::future::join_all(workers))
            .await
            .is_err()
        {
            warn!(
                pool = %self.name,
                timeout_ms = timeout.as_millis() as u64,
                "Worker pool did not drain in time, abandoning remaining workers"
            );
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

/// Pending filter/map result. Resolves to `ProcessError::Canceled` when the
/// task was canceled or its pool went away before it ran.
pub struct TaskHandle {
    rx: oneshot::Receiver<Result<FilterMapOutcome, ProcessError>>,
    cancel: CancellationToken,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Future for TaskHandle {
    type Output = Result<FilterMapOutcome, ProcessError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(ProcessError::Canceled)))
    }
}

/// Shared pool for order-insensitive subscribers plus single-worker isolated
/// pools for sequence subscribers, picked by `crc32(key) mod count`.
pub struct FilterMapExecutor {
    chain: Arc<ProcessChain>,
    shared: WorkerPool,
    isolated: Vec<WorkerPool>,
    batch_cancel: Mutex<CancellationToken>,
}

pub struct ExecutorSettings {
    pub shared_pool_size: usize,
    pub shared_queue_size: usize,
    pub isolated_pool_count: usize,
    pub isolated_queue_size: usize,
}

impl FilterMapExecutor {
    pub fn new(chain: Arc<ProcessChain>, settings: &ExecutorSettings) -> Result<Self, ConfigError> {
        if settings.shared_pool_size == 0 {
            return Err(ConfigError::ZeroSize {
                field: "shared_executor_pool_size",
            });
        }
        if settings.isolated_pool_count == 0 {
            return Err(ConfigError::ZeroSize {
                field: "sequence_executor_count",
            });
        }

        let shared = WorkerPool::new(
            "shared",
            settings.shared_pool_size,
            settings.shared_queue_size,
        );
        let isolated = (0..settings.isolated_pool_count)
            .map(|i| WorkerPool::new(format!("sequence-{i}"), 1, settings.isolated_queue_size))
            .collect();

        Ok(Self {
            chain,
            shared,
            isolated,
            batch_cancel: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn chain(&self) -> &Arc<ProcessChain> {
        &self.chain
    }

    pub fn isolated_pool_index(&self, key: &[u8]) -> usize {
        crc32fast::hash(key) as usize % self.isolated.len()
    }

    fn pool_for(&self, record: &SubscriberRecord) -> &WorkerPool {
        if record.subscriber.is_sequence() {
            &self.isolated[self.isolated_pool_index(record.record.key_bytes())]
        } else {
            &self.shared
        }
    }

    fn batch_token(&self) -> CancellationToken {
        match self.batch_cancel.lock() {
            Ok(guard) => guard.child_token(),
            Err(poisoned) => poisoned.into_inner().child_token(),
        }
    }

    /// Cancel every task submitted so far that has not started running.
    pub fn cancel_all(&self) {
        let replaced = match self.batch_cancel.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        replaced.cancel();
    }

    pub async fn submit(&self, record: SubscriberRecord) -> Result<TaskHandle, ExecutorError> {
        let (tx, rx) = oneshot::channel();
        let cancel = self.batch_token();
        let chain = self.chain.clone();
        let job_cancel = cancel.clone();
        let pool = self.pool_for(&record);

        let job: Job = Box::new(move || {
            let result = if job_cancel.is_cancelled() {
                Err(ProcessError::Canceled)
            } else {
                chain.process(&record)
            };
            // receiver dropped means the dispatcher stopped caring
            let _unused = tx.send(result);
        });

        pool.submit(job).await?;
        Ok(TaskHandle { rx, cancel })
    }

    /// Pools drain side by side, so the whole shutdown is bounded by one
    /// `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        futures::future::join_all(
            std::iter::once(&self.shared)
                .chain(&self.isolated)
                .map(|pool| pool.shutdown(timeout)),
        )
        .await;
    }
}
