//! Error sinks shared by the stages of a chain.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::error;

use crate::StageError;

/// The environment shared by the stages of one chain. Its only duty is receiving stage errors.
///
/// [`handle_error()`][Self::handle_error] is invoked synchronously on whichever thread detected
/// the error: the caller's thread for inline stages, a pool thread or a dedicated worker thread
/// for decorated stages. It must not block for long, as that stalls the thread that called it.
///
/// Any `Fn(StageError)` closure is a context.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use pipework::{PipeContext, StageError};
///
/// let context: Arc<dyn PipeContext> = Arc::new(|error: StageError| {
///     eprintln!("{error}");
/// });
///
/// context.handle_error(StageError::new("demo", "something went wrong"));
/// ```
pub trait PipeContext: Send + Sync {
    /// Receives an error raised by one of the stages.
    fn handle_error(&self, error: StageError);
}

impl<F> PipeContext for F
where
    F: Fn(StageError) + Send + Sync,
{
    fn handle_error(&self, error: StageError) {
        self(error);
    }
}

/// A context that emits every stage error as a `tracing` error event.
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct LoggingContext;

impl LoggingContext {
    /// Creates the context.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl PipeContext for LoggingContext {
    fn handle_error(&self, error: StageError) {
        match error.cause() {
            Some(cause) => error!(
                stage = error.stage(),
                message = error.message(),
                cause = %cause,
                "stage failed"
            ),
            None => error!(stage = error.stage(), message = error.message(), "stage failed"),
        }
    }
}

/// A context that keeps every stage error for later inspection.
#[derive(Debug, Default)]
pub struct CollectingContext {
    errors: Mutex<Vec<StageError>>,
}

impl CollectingContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of errors received so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.lock().len()
    }

    /// Whether no errors have been received.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.lock().is_empty()
    }

    /// Removes and returns every error received so far, oldest first.
    #[must_use]
    pub fn take(&self) -> Vec<StageError> {
        std::mem::take(&mut *self.errors.lock())
    }
}

impl PipeContext for CollectingContext {
    fn handle_error(&self, error: StageError) {
        self.errors.lock().push(error);
    }
}

/// Holds the context a stage was initialized with, for stages and decorators that report
/// errors from more than one thread.
#[derive(Default)]
pub(crate) struct ContextSlot {
    context: RwLock<Option<Arc<dyn PipeContext>>>,
}

impl fmt::Debug for ContextSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextSlot")
            .field("initialized", &self.context.read().is_some())
            .finish()
    }
}

impl ContextSlot {
    pub(crate) fn set(&self, context: &Arc<dyn PipeContext>) {
        *self.context.write() = Some(Arc::clone(context));
    }

    /// Delivers the error to the context. Before initialization there is nowhere to deliver it,
    /// so it is logged instead of being lost.
    pub(crate) fn report(&self, error: StageError) {
        // Clone out of the lock so the sink does not run while the lock is held.
        let context = self.context.read().clone();

        match context {
            Some(context) => context.handle_error(error),
            None => error!(
                stage = error.stage(),
                error = %error,
                "stage error raised before the stage was initialized with a context"
            ),
        }
    }
}
