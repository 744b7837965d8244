use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::trace;

use crate::context::ContextSlot;
use crate::{Cancellation, Cancelled, PipeContext, SetupError, StageError};

/// Lifecycle shared by every stage of a chain.
///
/// A chain is initialized once before the first input arrives and shut down once after the last
/// input has been submitted. Stages that own threads start them in [`init()`][Self::init] and
/// stop them in [`shutdown()`][Self::shutdown].
pub trait Lifecycle: Send + Sync {
    /// Name used in error records and log events. Defaults to the type name.
    fn name(&self) -> &str {
        type_name::<Self>()
    }

    /// Prepares the stage for processing and hands it the error sink of the chain.
    ///
    /// # Errors
    ///
    /// Returns a [`SetupError`] if a resource the stage depends on (typically a thread) could
    /// not be set up.
    fn init(&self, context: &Arc<dyn PipeContext>) -> Result<(), SetupError> {
        _ = context;
        Ok(())
    }

    /// Stops the stage, waiting up to `timeout` for work it has already accepted to complete.
    ///
    /// Inputs submitted after shutdown has started are rejected and reported to the error sink.
    fn shutdown(&self, timeout: Duration) {
        _ = timeout;
    }
}

/// A consumer of inputs of type `In`.
///
/// Processing failures are not returned to the caller. They are reported to the
/// [`PipeContext`] the stage was initialized with. The only failure visible to the caller is
/// cancellation of a blocking hand-off, which is returned by value.
pub trait Stage<In>: Lifecycle {
    /// Processes one input.
    ///
    /// Depending on the stage, the input is processed inline on the calling thread or handed
    /// over to other threads, in which case this may block until a thread is ready to take it.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] if the caller's cancellation signal was raised while this call was
    /// blocked. The input is dropped in that case.
    fn process(&self, input: In, cancellation: &Cancellation) -> Result<(), Cancelled>;
}

/// A stage that produces outputs of type `Out` and forwards them to the next stage.
///
/// A pipe with no next stage drops its outputs. Links are set while the chain is being
/// assembled, before it is initialized.
pub trait Pipe<In, Out>: Stage<In> {
    /// Sets the stage that receives the outputs of this pipe.
    fn set_next(&self, next: Arc<dyn Stage<Out>>);
}

/// The state every pipe implementation carries: its name, its link to the next stage and the
/// context it reports errors to.
pub(crate) struct PipeCore<Out> {
    name: Arc<str>,
    next: RwLock<Option<Arc<dyn Stage<Out>>>>,
    context: ContextSlot,
}

impl<Out> fmt::Debug for PipeCore<Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeCore")
            .field("name", &self.name)
            .field("linked", &self.next.read().is_some())
            .field("context", &self.context)
            .finish()
    }
}

impl<Out> PipeCore<Out> {
    pub(crate) fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            next: RwLock::new(None),
            context: ContextSlot::default(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> &Arc<str> {
        &self.name
    }

    pub(crate) fn set_next(&self, next: Arc<dyn Stage<Out>>) {
        *self.next.write() = Some(next);
    }

    pub(crate) fn init(&self, context: &Arc<dyn PipeContext>) {
        self.context.set(context);
    }

    pub(crate) fn report(&self, error: StageError) {
        self.context.report(error);
    }

    /// Hands an output to the next stage. Absent outputs and unlinked pipes forward nothing.
    pub(crate) fn forward(
        &self,
        output: Option<Out>,
        cancellation: &Cancellation,
    ) -> Result<(), Cancelled> {
        let Some(output) = output else {
            return Ok(());
        };

        // Clone the link out of the lock so a slow next stage does not hold it.
        let next = self.next.read().clone();

        match next {
            Some(next) => next.process(output, cancellation),
            None => {
                trace!(stage = %self.name, "no next stage linked, output dropped");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::CollectingContext;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u32>>,
    }

    impl Lifecycle for Recorder {}

    impl Stage<u32> for Recorder {
        fn process(&self, input: u32, cancellation: &Cancellation) -> Result<(), Cancelled> {
            cancellation.check()?;
            self.seen.lock().push(input);
            Ok(())
        }
    }

    #[test]
    fn default_name_is_type_name() {
        let recorder = Recorder::default();

        assert!(recorder.name().ends_with("Recorder"));
    }

    #[test]
    fn forward_delivers_present_outputs_only() {
        let core = PipeCore::<u32>::new("core");
        let recorder = Arc::new(Recorder::default());
        core.set_next(Arc::<Recorder>::clone(&recorder));

        core.forward(Some(1), &Cancellation::never()).unwrap();
        core.forward(None, &Cancellation::never()).unwrap();
        core.forward(Some(2), &Cancellation::never()).unwrap();

        assert_eq!(*recorder.seen.lock(), vec![1, 2]);
    }

    #[test]
    fn forward_without_next_drops_output() {
        let core = PipeCore::<u32>::new("tail");

        assert_eq!(core.forward(Some(1), &Cancellation::never()), Ok(()));
    }

    #[test]
    fn report_reaches_initialized_context() {
        let core = PipeCore::<u32>::new("reporting");
        let collector = Arc::new(CollectingContext::new());
        let context: Arc<dyn PipeContext> = Arc::<CollectingContext>::clone(&collector);
        core.init(&context);

        core.report(StageError::new(Arc::clone(core.shared_name()), "oops"));

        assert_eq!(collector.take()[0].stage(), "reporting");
    }
}
