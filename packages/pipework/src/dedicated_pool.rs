use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::num::NonZero;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender};
use tracing::{debug, trace, warn};

use crate::context::ContextSlot;
use crate::queue::{self, PutError};
use crate::{
    Cancellation, Cancelled, Lifecycle, Pipe, PipeContext, QueueKind, Reservation, SetupError,
    Stage, StageError, TerminableUnit, TerminationToken, UnitError, format_panic_payload,
};

/// One input on its way to a worker, together with the reservation that keeps shutdown from
/// completing until a worker has processed it.
struct Dispatch<In> {
    input: In,
    _reservation: Reservation,
}

/// A stage decorated with its own fixed set of worker threads fed through a queue.
///
/// [`process()`][Stage::process] reserves one unit of work and puts the input on the queue.
/// With a rendezvous queue (the default) the caller blocks until a worker is ready to take the
/// input, which bounds the work in flight to one input per worker. Each worker takes inputs
/// from the queue and runs the delegate on them until the pipe is shut down.
///
/// The workers are [`TerminableUnit`]s sharing one termination token. Shutting the pipe down
/// lets the workers finish every input already accepted, then stops them.
///
/// Completion order across inputs does not follow submission order when there is more than one
/// worker.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use pipework::{
///     Cancellation, DedicatedPoolPipe, Lifecycle, LoggingContext, PipeContext, Stage,
///     TransformPipe,
/// };
///
/// let upper = DedicatedPoolPipe::builder(TransformPipe::new("upper", |text: &String| {
///     Ok(Some(text.to_uppercase()))
/// }))
/// .worker_count(2)
/// .build()
/// .unwrap();
///
/// let context: Arc<dyn PipeContext> = Arc::new(LoggingContext::new());
/// upper.init(&context).unwrap();
///
/// upper.process("hello".to_string(), &Cancellation::never()).unwrap();
/// upper.shutdown(Duration::from_secs(5));
///
/// assert_eq!(upper.token().reservations(), 0);
/// ```
pub struct DedicatedPoolPipe<In, S> {
    delegate: Arc<S>,
    token: Arc<TerminationToken>,
    context: Arc<ContextSlot>,
    input_tx: Sender<Dispatch<In>>,
    workers: Vec<TerminableUnit>,
}

impl<In, S> fmt::Debug for DedicatedPoolPipe<In, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedicatedPoolPipe")
            .field("delegate", &type_name::<S>())
            .field("token", &self.token)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl<In, S> DedicatedPoolPipe<In, S>
where
    In: Send + 'static,
    S: Stage<In> + 'static,
{
    /// Creates a builder that decorates `delegate`.
    #[must_use]
    pub fn builder(delegate: S) -> DedicatedPoolPipeBuilder<In, S> {
        DedicatedPoolPipeBuilder {
            delegate,
            worker_count: 1,
            queue: QueueKind::default(),
            name: None,
            _input: PhantomData,
        }
    }

    /// The decorated stage.
    #[must_use]
    pub fn delegate(&self) -> &S {
        &self.delegate
    }

    /// The termination token shared by the workers.
    #[must_use]
    pub fn token(&self) -> &Arc<TerminationToken> {
        &self.token
    }

    /// The number of workers.
    #[must_use]
    pub fn worker_count(&self) -> NonZero<usize> {
        NonZero::new(self.workers.len()).unwrap_or(NonZero::<usize>::MIN)
    }

    fn reject(&self, input: In, message: &str) {
        self.context
            .report(StageError::new(self.delegate.name(), message).with_input(input));
    }
}

impl<In, S> Lifecycle for DedicatedPoolPipe<In, S>
where
    In: Send + 'static,
    S: Stage<In> + 'static,
{
    fn name(&self) -> &str {
        self.delegate.name()
    }

    /// Initializes the delegate, then starts the workers.
    fn init(&self, context: &Arc<dyn PipeContext>) -> Result<(), SetupError> {
        self.context.set(context);
        self.delegate.init(context)?;

        for worker in &self.workers {
            if let Err(error) = worker.start() {
                // Stops the workers that did start. They have no work to drain yet.
                self.token.request_shutdown();
                return Err(error);
            }
        }

        debug!(
            stage = self.delegate.name(),
            workers = self.workers.len(),
            "dedicated workers started"
        );

        Ok(())
    }

    /// Asks every worker to stop once the inputs already accepted are processed, waits for
    /// them within `timeout` overall, then shuts the delegate down with whatever time is left.
    fn shutdown(&self, timeout: Duration) {
        let started = Instant::now();

        for worker in &self.workers {
            worker.terminate();
        }

        for worker in &self.workers {
            let remaining = timeout.saturating_sub(started.elapsed());

            if !worker.join(remaining) {
                warn!(
                    worker = worker.name(),
                    outstanding = self.token.reservations(),
                    ?timeout,
                    "dedicated worker did not stop before the timeout"
                );
            }
        }

        self.delegate.shutdown(timeout.saturating_sub(started.elapsed()));
    }
}

impl<In, S> Stage<In> for DedicatedPoolPipe<In, S>
where
    In: Send + 'static,
    S: Stage<In> + 'static,
{
    /// Hands the input to a worker, blocking while the queue has no room for it.
    fn process(&self, input: In, cancellation: &Cancellation) -> Result<(), Cancelled> {
        cancellation.check()?;

        // Reserve before checking the flag: a shutdown that misses this reservation is
        // guaranteed to be seen by the check below.
        let reservation = self.token.reserve();

        if self.token.is_shutdown_requested() {
            drop(reservation);
            self.reject(input, "input rejected because the stage is shutting down");
            return Ok(());
        }

        let dispatch = Dispatch {
            input,
            _reservation: reservation,
        };

        match queue::put(&self.input_tx, dispatch, cancellation) {
            Ok(()) => Ok(()),
            Err(PutError::Cancelled) => Err(Cancelled),
            Err(PutError::Closed(dispatch)) => {
                let Dispatch { input, .. } = dispatch;
                self.reject(input, "input rejected because every worker has exited");
                Ok(())
            }
        }
    }
}

impl<In, Out, S> Pipe<In, Out> for DedicatedPoolPipe<In, S>
where
    In: Send + 'static,
    S: Pipe<In, Out> + 'static,
{
    fn set_next(&self, next: Arc<dyn Stage<Out>>) {
        self.delegate.set_next(next);
    }
}

/// Builder for a [`DedicatedPoolPipe`].
pub struct DedicatedPoolPipeBuilder<In, S> {
    delegate: S,
    worker_count: usize,
    queue: QueueKind,
    name: Option<String>,
    _input: PhantomData<fn(In)>,
}

impl<In, S> fmt::Debug for DedicatedPoolPipeBuilder<In, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedicatedPoolPipeBuilder")
            .field("delegate", &type_name::<S>())
            .field("worker_count", &self.worker_count)
            .field("queue", &self.queue)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<In, S> DedicatedPoolPipeBuilder<In, S>
where
    In: Send + 'static,
    S: Stage<In> + 'static,
{
    /// Sets the number of workers. Defaults to 1. Zero is rejected by [`build()`][Self::build].
    #[must_use]
    pub fn worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Sets the kind of queue between callers and workers. Defaults to a rendezvous queue.
    #[must_use]
    pub fn queue(mut self, queue: QueueKind) -> Self {
        self.queue = queue;
        self
    }

    /// Sets the prefix of worker thread names. Workers are named `{name}-worker-{index}`.
    /// Defaults to the name of the delegate.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Creates the pipe. Its workers are started by [`Lifecycle::init()`].
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::WorkerCountZero`] if the worker count is zero.
    pub fn build(self) -> Result<DedicatedPoolPipe<In, S>, SetupError> {
        if self.worker_count == 0 {
            return Err(SetupError::WorkerCountZero);
        }

        let delegate = Arc::new(self.delegate);
        let token = Arc::new(TerminationToken::new());
        let context = Arc::new(ContextSlot::default());
        let (input_tx, input_rx) = self.queue.channel::<Dispatch<In>>();

        let name = self.name.unwrap_or_else(|| delegate.name().to_string());

        let workers = (0..self.worker_count)
            .map(|index| {
                TerminableUnit::builder(
                    Arc::clone(&token),
                    worker_body(input_rx.clone(), Arc::clone(&delegate), Arc::clone(&context)),
                )
                .name(format!("{name}-worker-{index}"))
                .build()
            })
            .collect();

        Ok(DedicatedPoolPipe {
            delegate,
            token,
            context,
            input_tx,
            workers,
        })
    }
}

fn worker_body<In, S>(
    input_rx: Receiver<Dispatch<In>>,
    delegate: Arc<S>,
    context: Arc<ContextSlot>,
) -> impl FnMut(&Cancellation) -> Result<(), UnitError> + Send + 'static
where
    In: Send + 'static,
    S: Stage<In> + 'static,
{
    move |cancellation: &Cancellation| {
        let Some(Dispatch {
            input,
            _reservation,
        }) = queue::take(&input_rx, cancellation)?
        else {
            return Err(UnitError::Exhausted);
        };

        trace!(stage = delegate.name(), "input dispatched to worker");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            delegate.process(input, cancellation)
        }));

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(Cancelled)) => Err(UnitError::Cancelled),
            Err(payload) => {
                context.report(StageError::new(
                    delegate.name(),
                    format!("stage panicked: {}", format_panic_payload(&*payload)),
                ));
                Ok(())
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use crossbeam::channel;
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{CancellationSource, CollectingContext, TransformPipe};

    const TIMEOUT: Duration = Duration::from_secs(5);

    assert_impl_all!(
        DedicatedPoolPipe<u32, TransformPipe<u32, u32>>: Send, Sync, Pipe<u32, u32>
    );

    fn collecting_context() -> (Arc<CollectingContext>, Arc<dyn PipeContext>) {
        let errors = Arc::new(CollectingContext::new());
        let context: Arc<dyn PipeContext> = Arc::<CollectingContext>::clone(&errors);
        (errors, context)
    }

    fn counting_stage(counter: &Arc<AtomicUsize>) -> TransformPipe<u32, ()> {
        let counter = Arc::clone(counter);
        TransformPipe::new("count", move |_: &u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
    }

    #[test]
    fn zero_workers_is_a_setup_error() {
        let counter = Arc::new(AtomicUsize::new(0));

        let result = DedicatedPoolPipe::builder(counting_stage(&counter))
            .worker_count(0)
            .build();

        assert!(matches!(result, Err(SetupError::WorkerCountZero)));
    }

    #[test]
    fn workers_are_named_after_the_pipe() {
        let counter = Arc::new(AtomicUsize::new(0));

        let pipe = DedicatedPoolPipe::builder(counting_stage(&counter))
            .worker_count(3)
            .name("counter")
            .build()
            .unwrap();

        assert_eq!(pipe.worker_count().get(), 3);
        assert_eq!(pipe.workers[2].name(), "counter-worker-2");
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn processes_every_accepted_input_before_shutdown_returns() {
        testing::with_watchdog(|| {
            let counter = Arc::new(AtomicUsize::new(0));
            let pipe = DedicatedPoolPipe::builder(counting_stage(&counter))
                .worker_count(3)
                .queue(QueueKind::Bounded(NonZero::new(4).unwrap()))
                .build()
                .unwrap();
            let (errors, context) = collecting_context();
            pipe.init(&context).unwrap();

            for value in 0..50 {
                pipe.process(value, &Cancellation::never()).unwrap();
            }

            pipe.shutdown(TIMEOUT);

            assert_eq!(counter.load(Ordering::SeqCst), 50);
            assert_eq!(pipe.token().reservations(), 0);
            assert!(pipe.workers.iter().all(TerminableUnit::is_terminated));
            assert!(errors.is_empty());
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn input_after_shutdown_is_rejected() {
        testing::with_watchdog(|| {
            let counter = Arc::new(AtomicUsize::new(0));
            let pipe = DedicatedPoolPipe::builder(counting_stage(&counter))
                .build()
                .unwrap();
            let (errors, context) = collecting_context();
            pipe.init(&context).unwrap();

            pipe.shutdown(TIMEOUT);
            pipe.process(9, &Cancellation::never()).unwrap();

            let errors = errors.take();
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].input::<u32>(), Some(&9));
            assert_eq!(counter.load(Ordering::SeqCst), 0);
            assert_eq!(pipe.token().reservations(), 0);
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn blocked_producer_is_woken_by_cancellation() {
        testing::with_watchdog(|| {
            let (release_tx, release_rx) = channel::bounded::<()>(0);
            let pipe = Arc::new(
                DedicatedPoolPipe::builder(TransformPipe::new("blocking", move |_: &u32| {
                    _ = release_rx.recv();
                    Ok(None::<()>)
                }))
                .build()
                .unwrap(),
            );
            let (_, context) = collecting_context();
            pipe.init(&context).unwrap();

            // Occupies the only worker.
            pipe.process(1, &Cancellation::never()).unwrap();

            let source = CancellationSource::new();
            let producer = thread::spawn({
                let pipe = Arc::clone(&pipe);
                let cancellation = source.cancellation();
                move || pipe.process(2, &cancellation)
            });

            thread::sleep(Duration::from_millis(20));
            source.cancel();

            assert_eq!(producer.join().unwrap(), Err(Cancelled));

            drop(release_tx);
            pipe.shutdown(TIMEOUT);
            assert_eq!(pipe.token().reservations(), 0);
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn panicking_delegate_is_reported_and_worker_survives() {
        testing::with_watchdog(|| {
            let counter = Arc::new(AtomicUsize::new(0));
            let stage = TransformPipe::<u32, ()>::new("fragile", {
                let counter = Arc::clone(&counter);
                move |value: &u32| {
                    assert_ne!(*value, 0, "zero is fatal");
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }
            });
            let pipe = DedicatedPoolPipe::builder(stage).build().unwrap();
            let (errors, context) = collecting_context();
            pipe.init(&context).unwrap();

            pipe.process(0, &Cancellation::never()).unwrap();
            pipe.process(1, &Cancellation::never()).unwrap();
            pipe.shutdown(TIMEOUT);

            let errors = errors.take();
            assert_eq!(errors.len(), 1);
            assert!(errors[0].message().contains("zero is fatal"));
            assert_eq!(counter.load(Ordering::SeqCst), 1);
            assert_eq!(pipe.token().reservations(), 0);
        });
    }
}
