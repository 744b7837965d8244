use std::any::Any;
use std::error::Error as StdError;
use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Boxed, thread-safe error used as the cause of failures raised by user-supplied code.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// A failure raised while a stage was processing one input.
///
/// Stage errors are never returned to the caller of [`Stage::process()`][crate::Stage::process].
/// They are delivered to the [`PipeContext`][crate::PipeContext] that the stage was initialized
/// with, on whichever thread detected the failure.
///
/// The record is immutable once built. It carries the name of the stage that failed, the input
/// it was processing (when the input was still available at the time of the failure), a
/// human-readable message and an optional underlying cause.
#[derive(Debug, Error)]
#[error("stage '{stage}' failed: {message}")]
pub struct StageError {
    stage: Arc<str>,
    input: Option<Box<dyn Any + Send>>,
    message: String,
    #[source]
    cause: Option<BoxError>,
}

impl StageError {
    /// Creates a stage error without an input or cause attached.
    #[must_use]
    pub fn new(stage: impl Into<Arc<str>>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            input: None,
            message: message.into(),
            cause: None,
        }
    }

    /// Attaches the input that was being processed when the failure occurred.
    #[must_use]
    pub fn with_input<T>(mut self, input: T) -> Self
    where
        T: Send + 'static,
    {
        self.input = Some(Box::new(input));
        self
    }

    /// Attaches the underlying cause of the failure.
    #[must_use]
    pub fn with_cause(mut self, cause: impl Into<BoxError>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Name of the stage that raised the error.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Human-readable description of the failure.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the offending input is attached to the error.
    #[must_use]
    pub fn has_input(&self) -> bool {
        self.input.is_some()
    }

    /// The offending input, if one is attached and it is of type `T`.
    #[must_use]
    pub fn input<T>(&self) -> Option<&T>
    where
        T: 'static,
    {
        self.input.as_ref()?.downcast_ref::<T>()
    }

    /// Takes ownership of the offending input.
    ///
    /// # Errors
    ///
    /// Returns the error unchanged if no input is attached or the input is not of type `T`.
    pub fn into_input<T>(mut self) -> Result<T, Self>
    where
        T: 'static,
    {
        match self.input.take().map(|input| input.downcast::<T>()) {
            Some(Ok(input)) => Ok(*input),
            Some(Err(input)) => {
                self.input = Some(input);
                Err(self)
            }
            None => Err(self),
        }
    }

    /// The underlying cause of the failure, if any.
    #[must_use]
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.cause.as_deref()
    }
}

/// A blocking operation observed that its cancellation signal was raised.
///
/// Cancellation is a request to stop, not a data error. It is returned by value to the caller
/// of the blocking operation and is never reported to an error sink.
#[derive(Clone, Copy, Debug, Default, Eq, Error, PartialEq)]
#[error("operation was cancelled")]
pub struct Cancelled;

/// Errors that occur while constructing or starting a component.
///
/// These are always raised at setup time, never while inputs are being processed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SetupError {
    /// A dedicated worker pool was configured with zero workers.
    #[error("worker count must be positive")]
    WorkerCountZero,

    /// The operating system refused to start a thread.
    #[error("failed to spawn thread '{name}'")]
    ThreadSpawn {
        /// Name of the thread that could not be started.
        name: String,

        /// The error reported by the operating system.
        #[source]
        source: io::Error,
    },
}

/// Errors returned when submitting work to a [`TaskPool`][crate::TaskPool].
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[non_exhaustive]
pub enum PoolError {
    /// The pool has been shut down and no longer accepts tasks.
    #[error("thread pool is closed")]
    Closed,
}

/// Errors returned by [`invoke_all()`][crate::invoke_all].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InvokeError {
    /// The waiting caller was cancelled before every sub-task completed.
    #[error("waiting for sub-tasks was cancelled")]
    Cancelled,

    /// A sub-task returned an error. When several fail, the one with the lowest index is kept.
    #[error("sub-task {index} failed")]
    Failed {
        /// Position of the sub-task in the submitted list.
        index: usize,

        /// The error returned by the sub-task.
        #[source]
        source: BoxError,
    },

    /// A sub-task panicked.
    #[error("sub-task {index} panicked: {message}")]
    Panicked {
        /// Position of the sub-task in the submitted list.
        index: usize,

        /// The panic message, if it could be extracted from the payload.
        message: String,
    },

    /// The pool refused to accept a sub-task.
    #[error("sub-task was rejected by the thread pool")]
    Rejected(#[from] PoolError),

    /// The pool dropped a sub-task without executing it.
    #[error("sub-task was dropped by the thread pool without being executed")]
    Abandoned,
}

/// The failure delivered through a serializer [`ResultHandle`][crate::ResultHandle].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TaskError {
    /// The task processor returned an error.
    #[error("task processing failed")]
    Failed(#[source] BoxError),

    /// The task processor panicked.
    #[error("task processor panicked: {0}")]
    Panicked(String),

    /// The worker exited before it got to process the task.
    #[error("task was abandoned before it was processed")]
    Abandoned,
}

/// Errors returned when submitting a task to a [`Serializer`][crate::Serializer].
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[non_exhaustive]
pub enum ServiceError {
    /// The serializer has been shut down and no longer accepts tasks.
    #[error("serializer is shut down")]
    ShutDown,

    /// The caller was cancelled while waiting for queue capacity.
    #[error("submission was cancelled")]
    Cancelled,
}

/// The ways one iteration of a [`TerminableUnit`][crate::TerminableUnit] loop can end the loop.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UnitError {
    /// The unit observed its cancellation signal. This is a clean exit.
    #[error("unit was cancelled")]
    Cancelled,

    /// The source of work for the unit is closed and no more work will arrive. This is a clean
    /// exit.
    #[error("unit has no more work to do")]
    Exhausted,

    /// The iteration failed. The error is handed to the unit's cleanup hook.
    #[error(transparent)]
    Failed(BoxError),
}

impl From<Cancelled> for UnitError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn format_panic_payload(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
