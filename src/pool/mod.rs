//! A fixed-size pool of async workers draining a bounded task queue.
//!
//! The queue holds at most as many pending tasks as there are workers, so a
//! submitter that outpaces the workers is held back in [`Pool::add`].
//! Completion of the pool answers "is all work done", not "did all work
//! succeed": task outcomes are reported out of band, through [`crate::metrics::Results`].

use async_channel::Sender;
use futures::{future::BoxFuture, Future, FutureExt};

use crate::runtime::{JoinError, JoinHandle, NoRuntimeError, Runtime};

mod worker;

use worker::Worker;

pub type WorkerId = usize;

/// One unit of work: a closure producing the future that performs one transfer.
pub struct Task(Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>);

impl Task {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self(Box::new(move || f().boxed()))
    }

    pub(crate) fn run(self) -> BoxFuture<'static, ()> {
        (self.0)()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Task")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("the pool needs at least one worker")]
    NoWorkers,
    #[error(transparent)]
    NoRuntime(#[from] NoRuntimeError),
    /// The cancellation signal fired before the task was enqueued
    #[error("the submission is cancelled")]
    Cancelled,
    /// Every worker is gone, nothing would run the task
    #[error("the task queue is closed")]
    Closed,
    #[error("failed to join worker: {0}")]
    Join(#[from] JoinError),
}

/// The worker pool.
///
/// It is single-shot: [`Pool::wait`] consumes it, so no task can be added
/// once draining has started.
pub struct Pool {
    queue: Sender<Task>,
    workers: Vec<JoinHandle<()>>,
}

impl Pool {
    /// Spawn `workers` workers on the runtime of the current context.
    pub fn new(workers: usize) -> Result<Self, PoolError> {
        if workers == 0 {
            return Err(PoolError::NoWorkers);
        }
        Self::with_runtime(workers, &Runtime::current()?)
    }

    /// Spawn `workers` workers on the given runtime.
    pub fn with_runtime(workers: usize, rt: &Runtime) -> Result<Self, PoolError> {
        if workers == 0 {
            return Err(PoolError::NoWorkers);
        }
        log::info!("initializing pool with [{}] workers", workers);
        let (tx, rx) = async_channel::bounded(workers);
        let handles = (1..=workers)
            .map(|id| rt.spawn(Worker::new(id, rx.clone()).run()))
            .collect();
        Ok(Self {
            queue: tx,
            workers: handles,
        })
    }

    /// the number of workers, which is also the queue capacity
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Add a task to the queue.
    ///
    /// Waits while the queue is full. If `cancelled` resolves first, the task
    /// is dropped without running and [`PoolError::Cancelled`] is returned.
    /// A free slot wins over a cancellation that is ready at the same time.
    pub async fn add<C>(&self, cancelled: C, task: Task) -> Result<(), PoolError>
    where
        C: Future<Output = ()>,
    {
        let send = self.queue.send(task).fuse();
        let cancelled = cancelled.fuse();
        futures::pin_mut!(send, cancelled);
        futures::select_biased! {
            res = send => res.map_err(|_| PoolError::Closed),
            _ = cancelled => Err(PoolError::Cancelled),
        }
    }

    /// Close the queue and wait until every worker has drained it and exited.
    /// Task failures don't surface here.
    pub async fn wait(self) -> Result<(), PoolError> {
        self.queue.close();
        for handle in self.workers {
            handle.join().await?;
        }
        log::info!("pool drained");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{MetricRecord, Results};
    use pretty_assertions::assert_eq;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };
    use test_log::test;
    use tokio::time::{sleep, timeout};
    use tokio_util::sync::CancellationToken;

    fn never() -> futures::future::Pending<()> {
        futures::future::pending()
    }

    #[test(tokio::test)]
    async fn test_zero_workers_rejected() {
        assert!(matches!(Pool::new(0), Err(PoolError::NoWorkers)));
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_every_task_runs_once() {
        for (workers, tasks) in [(1, 10), (3, 10), (10, 10), (4, 100)] {
            let pool = Pool::new(workers).unwrap();
            let results = Arc::new(Results::new());
            for i in 0..tasks {
                let results = results.clone();
                pool.add(
                    never(),
                    Task::new(move || async move {
                        sleep(Duration::from_millis(1)).await;
                        results.push(MetricRecord::prototype(i, format!("key-{i}")));
                    }),
                )
                .await
                .unwrap();
            }
            pool.wait().await.unwrap();
            let indices: Vec<_> = results.sorted_by_index().iter().map(|r| r.index).collect();
            assert_eq!(indices, (0..tasks).collect::<Vec<_>>());
        }
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_concurrency_is_bounded() {
        let pool = Pool::new(3).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let running = running.clone();
            let peak = peak.clone();
            pool.add(
                never(),
                Task::new(move || async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();
        }
        pool.wait().await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    /// a single worker busy on a gated task, with one more task queued
    async fn saturated_pool(gate: Arc<tokio::sync::Notify>) -> Pool {
        let pool = Pool::new(1).unwrap();
        pool.add(
            never(),
            Task::new(move || async move {
                gate.notified().await;
            }),
        )
        .await
        .unwrap();
        pool.add(never(), Task::new(|| async {})).await.unwrap();
        pool
    }

    #[test(tokio::test)]
    async fn test_add_blocks_when_full() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let pool = saturated_pool(gate.clone()).await;
        let ran = Arc::new(AtomicUsize::new(0));

        let flag = ran.clone();
        let blocked = timeout(
            Duration::from_millis(50),
            pool.add(
                never(),
                Task::new(move || async move {
                    flag.fetch_add(1, Ordering::SeqCst);
                }),
            ),
        )
        .await;
        assert!(blocked.is_err(), "add should wait for a free slot");

        gate.notify_one();
        let flag = ran.clone();
        timeout(
            Duration::from_secs(5),
            pool.add(
                never(),
                Task::new(move || async move {
                    flag.fetch_add(1, Ordering::SeqCst);
                }),
            ),
        )
        .await
        .expect("add should unblock once the worker frees a slot")
        .unwrap();
        pool.wait().await.unwrap();
        // the timed out submission was dropped with its future
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test(tokio::test)]
    async fn test_cancelled_add_does_not_enqueue() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let pool = saturated_pool(gate.clone()).await;
        let ran = Arc::new(AtomicUsize::new(0));

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let flag = ran.clone();
        let res = pool
            .add(
                token.cancelled(),
                Task::new(move || async move {
                    flag.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await;
        assert!(matches!(res, Err(PoolError::Cancelled)));

        gate.notify_one();
        pool.wait().await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test(tokio::test)]
    async fn test_already_cancelled_with_free_slot_still_enqueues() {
        let pool = Pool::new(2).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();
        pool.add(
            token.cancelled(),
            Task::new(move || async move {
                flag.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();
        pool.wait().await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test(tokio::test)]
    async fn test_wait_succeeds_despite_panics() {
        let pool = Pool::new(2).unwrap();
        let results = Arc::new(Results::new());
        for i in 0..4 {
            let results = results.clone();
            pool.add(
                never(),
                Task::new(move || async move {
                    if i == 1 {
                        panic!("task {} failed", i);
                    }
                    results.push(MetricRecord::prototype(i, "k"));
                }),
            )
            .await
            .unwrap();
        }
        pool.wait().await.unwrap();
        assert_eq!(results.len(), 3);
    }

    #[test(tokio::test)]
    async fn test_wait_on_idle_pool() {
        let pool = Pool::new(4).unwrap();
        assert_eq!(pool.size(), 4);
        pool.wait().await.unwrap();
    }
}
