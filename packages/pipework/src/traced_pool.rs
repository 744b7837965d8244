use std::backtrace::Backtrace;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use tracing::error;

use crate::{PoolError, Task, TaskPool, format_panic_payload};

/// Decorates a [`TaskPool`] so that a panicking task can be traced back to its submitter.
///
/// When a task is submitted, the name of the submitting thread and a backtrace of the
/// submission are captured. If the task later panics on a pool thread, both are logged together
/// with the panic message, after which the panic continues into the underlying pool.
///
/// Backtrace capture follows the usual `RUST_BACKTRACE` / `RUST_LIB_BACKTRACE` settings, so
/// with both unset only the submitting thread name is recorded.
#[derive(Debug)]
pub struct TracedPool<P> {
    inner: P,
}

impl<P> TracedPool<P>
where
    P: TaskPool,
{
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: P) -> Self {
        Self { inner }
    }

    /// The decorated pool.
    #[must_use]
    pub fn inner(&self) -> &P {
        &self.inner
    }

    /// Unwraps the decorated pool.
    #[must_use]
    pub fn into_inner(self) -> P {
        self.inner
    }
}

impl<P> TaskPool for TracedPool<P>
where
    P: TaskPool,
{
    fn execute(&self, task: Task) -> Result<(), PoolError> {
        let submitter = thread::current().name().unwrap_or("<unnamed>").to_string();
        let submitted_at = Backtrace::capture();

        self.inner.execute(Box::new(move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                error!(
                    submitter = %submitter,
                    panic = %format_panic_payload(&*payload),
                    submitted_at = %submitted_at,
                    "task submitted from another thread panicked"
                );

                panic::resume_unwind(payload);
            }
        }))
    }
}
