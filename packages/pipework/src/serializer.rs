//! Serial thread confinement: one worker thread owns the state, callers submit tasks to it.

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};
use tracing::{debug, trace};

use crate::queue::{self, PutError};
use crate::{
    BoxError, Cancellation, QueueKind, Reservation, ServiceError, SetupError, TaskError,
    TerminableUnit, TerminationToken, UnitError, format_panic_payload,
};

/// Processes the tasks of a [`Serializer`] with exclusive access to the confined state.
///
/// The processor lives on the serializer's worker thread and is only ever called from there,
/// one task at a time, which is why it receives `&mut self` and needs no synchronization.
///
/// Any `FnMut(T) -> Result<V, BoxError>` closure is a processor; the closure's captures are the
/// confined state.
pub trait TaskProcessor<T, V>: Send + 'static {
    /// Processes one task.
    ///
    /// # Errors
    ///
    /// The error is delivered to the submitter through its [`ResultHandle`] as
    /// [`TaskError::Failed`].
    fn process(&mut self, task: T) -> Result<V, BoxError>;
}

impl<F, T, V> TaskProcessor<T, V> for F
where
    F: FnMut(T) -> Result<V, BoxError> + Send + 'static,
{
    fn process(&mut self, task: T) -> Result<V, BoxError> {
        self(task)
    }
}

struct Envelope<T, V> {
    task: T,
    reply: oneshot::Sender<Result<V, TaskError>>,
    reservation: Reservation,
}

/// Serializes the requests of any number of callers onto one dedicated worker thread.
///
/// Callers submit parameters through [`service()`][Self::service]. A factory turns them into a
/// task, which is queued for the worker, and the caller immediately receives a
/// [`ResultHandle`] for the outcome. The worker executes the tasks one at a time, strictly in the
/// order they were queued, against state that only it can access.
///
/// Shutting down stops the intake of new tasks and lets the worker execute every task that was
/// already accepted before it exits.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
///
/// use pipework::{BoxError, Serializer};
///
/// // The running total is confined to the worker thread.
/// let mut total = 0_u64;
/// let accumulator = Serializer::builder(
///     |amount: u64| amount,
///     move |amount: u64| -> Result<u64, BoxError> {
///         total += amount;
///         Ok(total)
///     },
/// )
/// .name("accumulator")
/// .build();
///
/// accumulator.init().unwrap();
///
/// let first = accumulator.service(5).unwrap();
/// let second = accumulator.service(7).unwrap();
///
/// assert_eq!(first.wait().unwrap(), 5);
/// assert_eq!(second.wait().unwrap(), 12);
///
/// assert!(accumulator.shutdown(Duration::from_secs(5)));
/// ```
pub struct Serializer<P, T, V> {
    make_task: Box<dyn Fn(P) -> T + Send + Sync>,
    token: Arc<TerminationToken>,
    task_tx: Sender<Envelope<T, V>>,
    worker: TerminableUnit,
}

impl<P, T, V> fmt::Debug for Serializer<P, T, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Serializer")
            .field("token", &self.token)
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}

impl<P, T, V> Serializer<P, T, V>
where
    T: Send + 'static,
    V: Send + 'static,
{
    /// Creates a builder for a serializer that turns parameters into tasks with `make_task` and
    /// executes the tasks with `processor`.
    #[must_use]
    pub fn builder<M, R>(make_task: M, processor: R) -> SerializerBuilder<P, T, V>
    where
        M: Fn(P) -> T + Send + Sync + 'static,
        R: TaskProcessor<T, V>,
    {
        SerializerBuilder {
            make_task: Box::new(make_task),
            processor: Box::new(processor),
            queue: QueueKind::Unbounded,
            name: None,
        }
    }

    /// Starts the worker thread. Starting a started serializer does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::ThreadSpawn`] if the worker thread could not be started.
    pub fn init(&self) -> Result<(), SetupError> {
        self.worker.start()
    }

    /// Submits a task built from `params` and returns a handle for its result.
    ///
    /// With a bounded or rendezvous queue this blocks while the queue has no room. Use
    /// [`service_cancellable()`][Self::service_cancellable] to make that wait cancellable.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::ShutDown`] if the serializer is shutting down.
    pub fn service(&self, params: P) -> Result<ResultHandle<V>, ServiceError> {
        self.service_cancellable(params, &Cancellation::never())
    }

    /// Submits a task built from `params`, giving up if `cancellation` is raised while waiting
    /// for room in the queue.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::ShutDown`] if the serializer is shutting down and
    /// [`ServiceError::Cancelled`] if the wait for room in the queue was cancelled.
    pub fn service_cancellable(
        &self,
        params: P,
        cancellation: &Cancellation,
    ) -> Result<ResultHandle<V>, ServiceError> {
        if cancellation.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }

        let reservation = self.token.reserve();

        if self.token.is_shutdown_requested() {
            return Err(ServiceError::ShutDown);
        }

        let (reply, result_rx) = oneshot::channel();
        let envelope = Envelope {
            task: (self.make_task)(params),
            reply,
            reservation,
        };

        match queue::put(&self.task_tx, envelope, cancellation) {
            Ok(()) => Ok(ResultHandle { result_rx }),
            Err(PutError::Cancelled) => Err(ServiceError::Cancelled),
            Err(PutError::Closed(_)) => Err(ServiceError::ShutDown),
        }
    }

    /// Stops accepting tasks and waits up to `timeout` for the worker to execute the tasks it
    /// already accepted and exit.
    ///
    /// If the serializer was never initialized there is no worker to execute the accepted tasks.
    /// They are dropped instead and their handles resolve to [`TaskError::Abandoned`].
    ///
    /// Returns `true` if the worker exited in time.
    #[must_use]
    pub fn shutdown(&self, timeout: Duration) -> bool {
        debug!(
            worker = self.worker.name(),
            outstanding = self.token.reservations(),
            "serializer shutting down"
        );

        self.worker.terminate();

        if self.worker.discard_unstarted() {
            debug!(
                worker = self.worker.name(),
                "serializer never started, queued tasks abandoned"
            );
        }

        self.worker.join(timeout)
    }

    /// The termination token of the worker.
    #[must_use]
    pub fn token(&self) -> &Arc<TerminationToken> {
        &self.token
    }

    /// The name of the worker thread.
    #[must_use]
    pub fn name(&self) -> &str {
        self.worker.name()
    }
}

/// Builder for a [`Serializer`].
pub struct SerializerBuilder<P, T, V> {
    make_task: Box<dyn Fn(P) -> T + Send + Sync>,
    processor: Box<dyn TaskProcessor<T, V>>,
    queue: QueueKind,
    name: Option<String>,
}

impl<P, T, V> fmt::Debug for SerializerBuilder<P, T, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializerBuilder")
            .field("queue", &self.queue)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<P, T, V> SerializerBuilder<P, T, V>
where
    T: Send + 'static,
    V: Send + 'static,
{
    /// Sets the kind of queue in front of the worker. Defaults to an unbounded queue, so that
    /// [`Serializer::service()`] never blocks.
    #[must_use]
    pub fn queue(mut self, queue: QueueKind) -> Self {
        self.queue = queue;
        self
    }

    /// Sets the name of the worker thread.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Creates the serializer. Its worker is started by [`Serializer::init()`].
    #[must_use]
    pub fn build(self) -> Serializer<P, T, V> {
        let token = Arc::new(TerminationToken::new());
        let (task_tx, task_rx) = self.queue.channel();

        let mut worker = TerminableUnit::builder(
            Arc::clone(&token),
            worker_body(task_rx, self.processor),
        );

        if let Some(name) = self.name {
            worker = worker.name(name);
        }

        Serializer {
            make_task: self.make_task,
            token,
            task_tx,
            worker: worker.build(),
        }
    }
}

fn worker_body<T, V>(
    task_rx: Receiver<Envelope<T, V>>,
    mut processor: Box<dyn TaskProcessor<T, V>>,
) -> impl FnMut(&Cancellation) -> Result<(), UnitError> + Send + 'static
where
    T: Send + 'static,
    V: Send + 'static,
{
    move |cancellation: &Cancellation| {
        let Some(envelope) = queue::take(&task_rx, cancellation)? else {
            return Err(UnitError::Exhausted);
        };

        let Envelope {
            task,
            reply,
            reservation,
        } = envelope;

        let result = match panic::catch_unwind(AssertUnwindSafe(|| processor.process(task))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(TaskError::Failed(error)),
            Err(payload) => Err(TaskError::Panicked(format_panic_payload(&*payload))),
        };

        trace!(succeeded = result.is_ok(), "serialized task executed");

        // The submitter may have dropped its handle.
        _ = reply.send(result);

        // Released only once the result is available, so a completed shutdown implies every
        // accepted task has its result delivered.
        drop(reservation);

        Ok(())
    }
}

/// The eventual result of a task submitted to a [`Serializer`].
///
/// The result can be waited for synchronously through [`wait()`][Self::wait] and friends, or
/// asynchronously by awaiting the handle.
pub struct ResultHandle<V> {
    result_rx: oneshot::Receiver<Result<V, TaskError>>,
}

impl<V> fmt::Debug for ResultHandle<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultHandle").finish_non_exhaustive()
    }
}

impl<V> ResultHandle<V> {
    /// Blocks until the task has been executed and returns its result.
    ///
    /// # Errors
    ///
    /// Returns the [`TaskError`] describing why the task produced no value.
    pub fn wait(self) -> Result<V, TaskError> {
        self.result_rx.recv().unwrap_or(Err(TaskError::Abandoned))
    }

    /// Blocks for up to `timeout` for the result.
    ///
    /// Returns `None` if the result is not available within the timeout. A result is returned
    /// at most once; later calls report [`TaskError::Abandoned`].
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<V, TaskError>> {
        match self.result_rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(oneshot::RecvTimeoutError::Timeout) => None,
            Err(oneshot::RecvTimeoutError::Disconnected) => Some(Err(TaskError::Abandoned)),
        }
    }

    /// Returns the result if it is already available, without blocking.
    ///
    /// A result is returned at most once; later calls report [`TaskError::Abandoned`].
    #[must_use]
    pub fn try_get(&self) -> Option<Result<V, TaskError>> {
        match self.result_rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::TryRecvError::Empty) => None,
            Err(oneshot::TryRecvError::Disconnected) => Some(Err(TaskError::Abandoned)),
        }
    }
}

impl<V> Future for ResultHandle<V> {
    type Output = Result<V, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.result_rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(TaskError::Abandoned)))
    }
}
