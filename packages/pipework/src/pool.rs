//! Thread pools that run boxed tasks, and the fan-out/fan-in primitive built on them.

use std::num::NonZero;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error};

use crate::{BoxError, Cancellation, InvokeError, PoolError, SetupError, format_panic_payload};

/// A unit of work submitted to a [`TaskPool`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// One of the sub-tasks submitted together through [`invoke_all()`].
pub type SubTask<V> = Box<dyn FnOnce() -> Result<V, BoxError> + Send + 'static>;

/// Boxes a closure as a [`SubTask`].
///
/// Going through this function lets the compiler infer the closure's error type, so `?` and
/// `.into()` work inside the closure without annotations.
pub fn sub_task<V, F>(task: F) -> SubTask<V>
where
    F: FnOnce() -> Result<V, BoxError> + Send + 'static,
{
    Box::new(task)
}

/// Executes tasks on threads it manages.
///
/// Pools are shared between components via `Arc`. A pool may drop a task without running it
/// (for example when it is shut down with tasks still queued). Callers that wait for a task to
/// report back must treat the task being dropped as a possible outcome.
pub trait TaskPool: Send + Sync {
    /// Submits a task for execution.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] if the pool no longer accepts tasks.
    fn execute(&self, task: Task) -> Result<(), PoolError>;
}

impl<P> TaskPool for Arc<P>
where
    P: TaskPool + ?Sized,
{
    fn execute(&self, task: Task) -> Result<(), PoolError> {
        (**self).execute(task)
    }
}

/// Runs every sub-task on `pool` and waits for all of them to finish.
///
/// The results are returned in the order the sub-tasks were given. If any sub-task fails, the
/// call still waits for every sub-task and then returns the failure of the one with the lowest
/// index. A panic in a sub-task counts as a failure.
///
/// # Errors
///
/// * [`InvokeError::Cancelled`] if `cancellation` is raised while waiting. Sub-tasks already
///   submitted keep running and their results are discarded.
/// * [`InvokeError::Failed`] or [`InvokeError::Panicked`] for the lowest-index failing sub-task.
/// * [`InvokeError::Rejected`] if the pool refused a sub-task.
/// * [`InvokeError::Abandoned`] if the pool dropped a sub-task without running it.
///
/// # Example
///
/// ```rust
/// use pipework::{Cancellation, FixedThreadPool, invoke_all, sub_task};
///
/// let pool = FixedThreadPool::builder().build().unwrap();
///
/// let tasks = (1..=3_u32)
///     .map(|value| sub_task(move || Ok(value * 10)))
///     .collect();
///
/// let results = invoke_all(&pool, tasks, &Cancellation::never()).unwrap();
/// assert_eq!(results, vec![10, 20, 30]);
/// ```
pub fn invoke_all<V>(
    pool: &dyn TaskPool,
    tasks: Vec<SubTask<V>>,
    cancellation: &Cancellation,
) -> Result<Vec<V>, InvokeError>
where
    V: Send + 'static,
{
    let task_count = tasks.len();

    // Sized to hold every result so a sub-task never blocks on reporting, even after the
    // caller has stopped listening.
    let (result_tx, result_rx) = channel::bounded(task_count);

    for (index, task) in tasks.into_iter().enumerate() {
        let result_tx = result_tx.clone();

        pool.execute(Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(task));

            // The caller may have given up waiting.
            _ = result_tx.send((index, result));
        }))?;
    }

    drop(result_tx);

    collect_results(&result_rx, task_count, cancellation)
}

type SubTaskResult<V> = (usize, thread::Result<Result<V, BoxError>>);

fn collect_results<V>(
    result_rx: &Receiver<SubTaskResult<V>>,
    task_count: usize,
    cancellation: &Cancellation,
) -> Result<Vec<V>, InvokeError> {
    let mut slots: Vec<Option<V>> = std::iter::repeat_with(|| None).take(task_count).collect();
    let mut first_failure: Option<(usize, InvokeError)> = None;

    for _ in 0..task_count {
        let (index, result) = select! {
            recv(result_rx) -> message => {
                message.map_err(|_disconnected| InvokeError::Abandoned)?
            }
            recv(cancellation.observer()) -> _ => return Err(InvokeError::Cancelled),
        };

        let failure = match result {
            Ok(Ok(value)) => {
                if let Some(slot) = slots.get_mut(index) {
                    *slot = Some(value);
                }
                continue;
            }
            Ok(Err(source)) => InvokeError::Failed { index, source },
            Err(payload) => InvokeError::Panicked {
                index,
                message: format_panic_payload(&*payload),
            },
        };

        if first_failure
            .as_ref()
            .is_none_or(|(first_index, _)| index < *first_index)
        {
            first_failure = Some((index, failure));
        }
    }

    if let Some((_, failure)) = first_failure {
        return Err(failure);
    }

    slots
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or(InvokeError::Abandoned)
}

/// A pool with a fixed number of named threads fed from one shared unbounded queue.
///
/// A task that panics is logged and does not take its thread down. Shutting the pool down
/// closes the queue. Tasks already queued still run, then the threads exit.
///
/// Dropping the pool shuts it down and waits for the threads to exit.
#[derive(Debug)]
pub struct FixedThreadPool {
    name_prefix: String,
    thread_count: NonZero<usize>,
    task_tx: RwLock<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl FixedThreadPool {
    /// Creates a builder for a pool.
    #[must_use]
    pub fn builder() -> FixedThreadPoolBuilder {
        FixedThreadPoolBuilder::new()
    }

    /// The number of threads in the pool.
    #[must_use]
    pub fn thread_count(&self) -> NonZero<usize> {
        self.thread_count
    }

    /// The prefix of the names of the pool's threads.
    #[must_use]
    pub fn name_prefix(&self) -> &str {
        &self.name_prefix
    }

    /// Whether the pool still accepts tasks.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.task_tx.read().is_some()
    }

    /// Stops accepting tasks, lets the threads finish the tasks already queued and waits for
    /// them to exit.
    ///
    /// When called from one of the pool's own threads, that thread is not waited for.
    #[cfg_attr(test, mutants::skip)] // Impractical to test that threads stop.
    pub fn shutdown(&self) {
        if self.task_tx.write().take().is_some() {
            debug!(pool = %self.name_prefix, "thread pool shutting down");
        }

        let current = thread::current().id();
        let workers = std::mem::take(&mut *self.workers.lock());

        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }

            // Tasks cannot panic the worker itself, so a failed join means the thread was
            // torn down from outside. Nothing is left to clean up in that case.
            _ = worker.join();
        }
    }
}

impl TaskPool for FixedThreadPool {
    fn execute(&self, task: Task) -> Result<(), PoolError> {
        let task_tx = self.task_tx.read();

        task_tx
            .as_ref()
            .ok_or(PoolError::Closed)?
            .send(task)
            .map_err(|_| PoolError::Closed)
    }
}

impl Drop for FixedThreadPool {
    #[cfg_attr(test, mutants::skip)] // Impractical to test that stuff stops happening.
    fn drop(&mut self) {
        if thread::panicking() {
            // Waiting for threads while unwinding risks hiding the original panic.
            return;
        }

        self.shutdown();
    }
}

/// Builder for a [`FixedThreadPool`].
#[derive(Debug)]
pub struct FixedThreadPoolBuilder {
    thread_count: NonZero<usize>,
    name_prefix: String,
}

impl FixedThreadPoolBuilder {
    fn new() -> Self {
        Self {
            thread_count: thread::available_parallelism().unwrap_or(NonZero::<usize>::MIN),
            name_prefix: "pipework-pool".to_string(),
        }
    }

    /// Sets the number of threads. Defaults to the available parallelism of the system.
    #[must_use]
    pub fn thread_count(mut self, thread_count: NonZero<usize>) -> Self {
        self.thread_count = thread_count;
        self
    }

    /// Sets the prefix of thread names. Threads are named `{prefix}-{index}`.
    #[must_use]
    pub fn name_prefix(mut self, name_prefix: impl Into<String>) -> Self {
        self.name_prefix = name_prefix.into();
        self
    }

    /// Starts the pool's threads.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::ThreadSpawn`] if a thread could not be started. Threads that were
    /// already started are stopped again before returning.
    pub fn build(self) -> Result<FixedThreadPool, SetupError> {
        let (task_tx, task_rx) = channel::unbounded::<Task>();

        let pool = FixedThreadPool {
            name_prefix: self.name_prefix,
            thread_count: self.thread_count,
            task_tx: RwLock::new(Some(task_tx)),
            workers: Mutex::new(Vec::with_capacity(self.thread_count.get())),
        };

        for index in 0..self.thread_count.get() {
            let name = format!("{}-{index}", pool.name_prefix);
            let task_rx = task_rx.clone();

            // On failure, dropping `pool` joins the threads started so far.
            let worker = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_entrypoint(&task_rx))
                .map_err(|source| SetupError::ThreadSpawn { name, source })?;

            pool.workers.lock().push(worker);
        }

        debug!(
            pool = %pool.name_prefix,
            threads = pool.thread_count.get(),
            "thread pool started"
        );

        Ok(pool)
    }
}

#[cfg_attr(test, mutants::skip)] // Mutations here hang the pool rather than fail a test.
fn worker_entrypoint(task_rx: &Receiver<Task>) {
    while let Ok(task) = task_rx.recv() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            error!(
                thread = thread::current().name().unwrap_or_default(),
                panic = %format_panic_payload(&*payload),
                "task panicked on pool thread"
            );
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::CancellationSource;

    assert_impl_all!(FixedThreadPool: TaskPool, Send, Sync);
    assert_impl_all!(Arc<dyn TaskPool>: TaskPool);

    fn pool(threads: usize) -> FixedThreadPool {
        FixedThreadPool::builder()
            .thread_count(NonZero::new(threads).unwrap())
            .name_prefix("test-pool")
            .build()
            .unwrap()
    }

    /// A pool that throws every task away without running it.
    struct DiscardingPool;

    impl TaskPool for DiscardingPool {
        fn execute(&self, task: Task) -> Result<(), PoolError> {
            drop(task);
            Ok(())
        }
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn executes_tasks_on_named_threads() {
        testing::with_watchdog(|| {
            let pool = pool(2);
            let (name_tx, name_rx) = channel::unbounded();

            for _ in 0..4 {
                let name_tx = name_tx.clone();
                pool.execute(Box::new(move || {
                    let name = thread::current().name().map(str::to_string);
                    name_tx.send(name).unwrap();
                }))
                .unwrap();
            }

            for _ in 0..4 {
                let name = name_rx.recv().unwrap().unwrap();
                assert!(name.starts_with("test-pool-"), "{name}");
            }
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn panicking_task_does_not_kill_worker() {
        testing::with_watchdog(|| {
            let pool = pool(1);
            let (done_tx, done_rx) = channel::bounded(1);

            pool.execute(Box::new(|| panic!("task exploded"))).unwrap();
            pool.execute(Box::new(move || done_tx.send(()).unwrap()))
                .unwrap();

            done_rx.recv().unwrap();
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn shutdown_runs_queued_tasks_then_rejects() {
        testing::with_watchdog(|| {
            let pool = pool(1);
            let executed = Arc::new(AtomicUsize::new(0));

            for _ in 0..10 {
                let executed = Arc::clone(&executed);
                pool.execute(Box::new(move || {
                    executed.fetch_add(1, Ordering::Relaxed);
                }))
                .unwrap();
            }

            pool.shutdown();

            assert_eq!(executed.load(Ordering::Relaxed), 10);
            assert!(!pool.is_open());
            assert_eq!(pool.execute(Box::new(|| {})), Err(PoolError::Closed));
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn invoke_all_returns_results_in_task_order() {
        testing::with_watchdog(|| {
            let pool = pool(3);

            let tasks = (0..8_u64)
                .map(|index| {
                    sub_task(move || {
                        // Later tasks finish first.
                        thread::sleep(Duration::from_millis(8 - index));
                        Ok(index * 2)
                    })
                })
                .collect();

            let results = invoke_all(&pool, tasks, &Cancellation::never()).unwrap();

            assert_eq!(results, (0..8).map(|index| index * 2).collect::<Vec<_>>());
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn invoke_all_reports_lowest_index_failure_after_all_complete() {
        testing::with_watchdog(|| {
            let pool = pool(4);
            let completed = Arc::new(AtomicUsize::new(0));

            let tasks = (0..4_usize)
                .map(|index| {
                    let completed = Arc::clone(&completed);
                    sub_task(move || {
                        completed.fetch_add(1, Ordering::SeqCst);
                        match index {
                            1 => Err("second failed".into()),
                            3 => panic!("fourth panicked"),
                            _ => Ok(()),
                        }
                    })
                })
                .collect();

            let error = invoke_all(&pool, tasks, &Cancellation::never()).unwrap_err();

            assert!(matches!(error, InvokeError::Failed { index: 1, .. }), "{error:?}");
            assert_eq!(completed.load(Ordering::SeqCst), 4);
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn invoke_all_reports_panic() {
        testing::with_watchdog(|| {
            let pool = pool(1);
            let tasks: Vec<SubTask<()>> = vec![sub_task(|| panic!("only task panicked"))];

            let error = invoke_all(&pool, tasks, &Cancellation::never()).unwrap_err();

            match error {
                InvokeError::Panicked { index, message } => {
                    assert_eq!(index, 0);
                    assert_eq!(message, "only task panicked");
                }
                other => panic!("unexpected error: {other:?}"),
            }
        });
    }

    #[test]
    fn invoke_all_with_no_tasks_is_empty() {
        let results = invoke_all::<u8>(&DiscardingPool, Vec::new(), &Cancellation::never());

        assert!(results.unwrap().is_empty());
    }

    #[test]
    fn invoke_all_detects_dropped_tasks() {
        let tasks: Vec<SubTask<u8>> = vec![sub_task(|| Ok(1))];

        let error = invoke_all(&DiscardingPool, tasks, &Cancellation::never()).unwrap_err();

        assert!(matches!(error, InvokeError::Abandoned));
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn invoke_all_on_closed_pool_is_rejected() {
        testing::with_watchdog(|| {
            let pool = pool(1);
            pool.shutdown();

            let tasks: Vec<SubTask<u8>> = vec![sub_task(|| Ok(1))];
            let error = invoke_all(&pool, tasks, &Cancellation::never()).unwrap_err();

            assert!(matches!(error, InvokeError::Rejected(PoolError::Closed)));
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn invoke_all_wait_is_cancellable() {
        testing::with_watchdog(|| {
            let pool = Arc::new(pool(1));
            let source = CancellationSource::new();
            let (release_tx, release_rx) = channel::bounded::<()>(0);

            let tasks: Vec<SubTask<()>> = vec![sub_task(move || {
                _ = release_rx.recv();
                Ok(())
            })];

            let waiter = thread::spawn({
                let pool = Arc::clone(&pool);
                let cancellation = source.cancellation();
                move || invoke_all(&pool, tasks, &cancellation)
            });

            thread::sleep(Duration::from_millis(20));
            source.cancel();

            assert!(matches!(waiter.join().unwrap(), Err(InvokeError::Cancelled)));

            // Unblocks the sub-task so the pool can shut down.
            drop(release_tx);
        });
    }
}
