use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::context::ContextSlot;
use crate::{
    Cancellation, Cancelled, Lifecycle, Pipe, PipeContext, SetupError, Stage, StageError,
    TaskPool, TerminationToken, format_panic_payload,
};

/// A thread pool together with the termination token shared by every stage decorated onto it.
///
/// Create one `SharedPool` per pool and decorate every stage that should run on that pool
/// through it. All such stages then drain together: a shutdown of any of them waits for the work
/// accepted by all of them, including outputs that work forwards from one of them to another.
/// Once that work has drained, all of them reject new input.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use pipework::{
///     Cancellation, FixedThreadPool, Lifecycle, LoggingContext, PipeContext, SharedPool, Stage,
///     TransformPipe,
/// };
///
/// let pool = SharedPool::new(Arc::new(FixedThreadPool::builder().build().unwrap()));
///
/// let print = pool.decorate(TransformPipe::new("print", |line: &String| {
///     println!("{line}");
///     Ok(None::<()>)
/// }));
///
/// let context: Arc<dyn PipeContext> = Arc::new(LoggingContext::new());
/// print.init(&context).unwrap();
///
/// print.process("hello".to_string(), &Cancellation::never()).unwrap();
/// print.shutdown(Duration::from_secs(5));
///
/// assert_eq!(pool.token().reservations(), 0);
/// ```
#[derive(Clone)]
pub struct SharedPool {
    pool: Arc<dyn TaskPool>,
    token: Arc<TerminationToken>,
}

impl fmt::Debug for SharedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedPool")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl SharedPool {
    /// Pairs `pool` with a fresh termination token.
    #[must_use]
    pub fn new(pool: Arc<dyn TaskPool>) -> Self {
        Self {
            pool,
            token: Arc::new(TerminationToken::new()),
        }
    }

    /// The termination token shared by every stage decorated onto this pool.
    #[must_use]
    pub fn token(&self) -> &Arc<TerminationToken> {
        &self.token
    }

    /// The pool the decorated stages run on.
    #[must_use]
    pub fn pool(&self) -> &Arc<dyn TaskPool> {
        &self.pool
    }

    /// Decorates `delegate` so that every input is processed asynchronously on this pool.
    #[must_use]
    pub fn decorate<In, S>(&self, delegate: S) -> SharedPoolPipe<In, S>
    where
        In: Send + 'static,
        S: Stage<In> + 'static,
    {
        SharedPoolPipe {
            delegate: Arc::new(delegate),
            shared: self.clone(),
            context: Arc::new(ContextSlot::default()),
            _input: PhantomData,
        }
    }
}

/// A stage decorated to process every input asynchronously on a [`SharedPool`].
///
/// [`process()`][Stage::process] reserves one unit of work on the pool's token, submits the
/// delegate's processing as a pool task and returns without waiting for it. The task releases
/// the reservation when it finishes, however it finishes.
///
/// Completion order across inputs does not follow submission order.
///
/// A delegate that panics, and an input that cannot be submitted because the pool's work has
/// drained after shutdown or the pool is closed, are reported as [`StageError`]s to the context this stage was
/// initialized with. The delegate is run without a cancellation signal of its own, as there
/// is no caller left waiting for it.
pub struct SharedPoolPipe<In, S> {
    delegate: Arc<S>,
    shared: SharedPool,
    context: Arc<ContextSlot>,
    _input: PhantomData<fn(In)>,
}

impl<In, S> fmt::Debug for SharedPoolPipe<In, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedPoolPipe")
            .field("delegate", &type_name::<S>())
            .field("shared", &self.shared)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl<In, S> SharedPoolPipe<In, S>
where
    In: Send + 'static,
    S: Stage<In> + 'static,
{
    /// The decorated stage.
    #[must_use]
    pub fn delegate(&self) -> &S {
        &self.delegate
    }

    /// The pool this stage runs on.
    #[must_use]
    pub fn shared_pool(&self) -> &SharedPool {
        &self.shared
    }

    fn reject(&self, input: In, message: &str) {
        self.context
            .report(StageError::new(self.delegate.name(), message).with_input(input));
    }
}

impl<In, S> Lifecycle for SharedPoolPipe<In, S>
where
    In: Send + 'static,
    S: Stage<In> + 'static,
{
    fn name(&self) -> &str {
        self.delegate.name()
    }

    fn init(&self, context: &Arc<dyn PipeContext>) -> Result<(), SetupError> {
        self.context.set(context);
        self.delegate.init(context)
    }

    /// Requests shutdown of every stage on the pool, waits up to `timeout` for their work to
    /// drain, then shuts the delegate down with whatever time is left.
    ///
    /// Until the drain, the stages keep accepting input, including outputs that work already
    /// running on the pool forwards between them. Once drained, every stage on the pool rejects
    /// new input to the context.
    fn shutdown(&self, timeout: Duration) {
        let started = Instant::now();
        let token = &self.shared.token;
        token.request_shutdown();

        if token.reservations() > 0 {
            debug!(
                stage = self.delegate.name(),
                outstanding = token.reservations(),
                "waiting for shared pool work to drain"
            );

            if !token.wait_drained(timeout) {
                warn!(
                    stage = self.delegate.name(),
                    outstanding = token.reservations(),
                    ?timeout,
                    "shared pool work did not drain before the timeout"
                );
            }
        }

        self.delegate.shutdown(timeout.saturating_sub(started.elapsed()));
    }
}

impl<In, S> Stage<In> for SharedPoolPipe<In, S>
where
    In: Send + 'static,
    S: Stage<In> + 'static,
{
    fn process(&self, input: In, cancellation: &Cancellation) -> Result<(), Cancelled> {
        cancellation.check()?;

        // Reserve before checking: while this reservation is held the token cannot drain, so
        // a drain that has not happened yet cannot happen until this input is done. Intake stays
        // open after shutdown is requested so that tasks already running on the pool can still
        // forward outputs to sibling stages on the same pool.
        let reservation = self.shared.token.reserve();

        if self.shared.token.is_drained() {
            drop(reservation);
            self.reject(input, "input rejected because the stage is shut down");
            return Ok(());
        }

        // The task takes the input out of the slot. If the pool refuses the task, the input is
        // still in the slot and goes into the error record.
        let slot = Arc::new(Mutex::new(Some(input)));
        let delegate = Arc::clone(&self.delegate);
        let context = Arc::clone(&self.context);

        let submitted = self.shared.pool.execute(Box::new({
            let slot = Arc::clone(&slot);
            move || {
                let _reservation = reservation;

                let Some(input) = slot.lock().take() else {
                    return;
                };

                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    delegate.process(input, &Cancellation::never())
                }));

                if let Err(payload) = outcome {
                    context.report(StageError::new(
                        delegate.name(),
                        format!("stage panicked: {}", format_panic_payload(&*payload)),
                    ));
                }
            }
        }));

        if let Err(error) = submitted {
            let mut record = StageError::new(self.delegate.name(), "pool refused the task")
                .with_cause(error);

            if let Some(input) = slot.lock().take() {
                record = record.with_input(input);
            }

            self.context.report(record);
        }

        Ok(())
    }
}

impl<In, Out, S> Pipe<In, Out> for SharedPoolPipe<In, S>
where
    In: Send + 'static,
    S: Pipe<In, Out> + 'static,
{
    fn set_next(&self, next: Arc<dyn Stage<Out>>) {
        self.delegate.set_next(next);
    }
}
