use std::fmt;
use std::sync::Arc;

use crate::stage::PipeCore;
use crate::{
    BoxError, Cancellation, Cancelled, Lifecycle, Pipe, PipeContext, SetupError, Stage, StageError,
};

type TransformFn<In, Out> = dyn Fn(&In) -> Result<Option<Out>, BoxError> + Send + Sync;

/// A pipe that maps each input to zero or one outputs on the calling thread.
///
/// The transformation borrows the input so that, if it fails, the input can be attached to the
/// [`StageError`] reported to the chain's context. A transformation that returns `Ok(None)`
/// filters the input out.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use pipework::{Cancellation, CollectingContext, Lifecycle, PipeContext, Stage, TransformPipe};
///
/// let parse = TransformPipe::new("parse", |text: &String| Ok(Some(text.parse::<u32>()?)));
///
/// let errors = Arc::new(CollectingContext::new());
/// let context: Arc<dyn PipeContext> = Arc::<CollectingContext>::clone(&errors);
/// parse.init(&context).unwrap();
///
/// parse.process("12".to_string(), &Cancellation::never()).unwrap();
/// parse.process("x".to_string(), &Cancellation::never()).unwrap();
///
/// let errors = errors.take();
/// assert_eq!(errors.len(), 1);
/// assert_eq!(errors[0].input::<String>().map(String::as_str), Some("x"));
/// ```
pub struct TransformPipe<In, Out> {
    core: PipeCore<Out>,
    transform: Box<TransformFn<In, Out>>,
}

impl<In, Out> fmt::Debug for TransformPipe<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformPipe")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl<In, Out> TransformPipe<In, Out>
where
    In: Send + 'static,
    Out: 'static,
{
    /// Creates a pipe named `name` that applies `transform` to every input.
    #[must_use]
    pub fn new<F>(name: impl Into<Arc<str>>, transform: F) -> Self
    where
        F: Fn(&In) -> Result<Option<Out>, BoxError> + Send + Sync + 'static,
    {
        Self {
            core: PipeCore::new(name),
            transform: Box::new(transform),
        }
    }
}

impl<In, Out> Lifecycle for TransformPipe<In, Out>
where
    In: Send + 'static,
    Out: 'static,
{
    fn name(&self) -> &str {
        self.core.name()
    }

    fn init(&self, context: &Arc<dyn PipeContext>) -> Result<(), SetupError> {
        self.core.init(context);
        Ok(())
    }
}

impl<In, Out> Stage<In> for TransformPipe<In, Out>
where
    In: Send + 'static,
    Out: 'static,
{
    fn process(&self, input: In, cancellation: &Cancellation) -> Result<(), Cancelled> {
        match (self.transform)(&input) {
            Ok(output) => self.core.forward(output, cancellation),
            Err(cause) => {
                self.core.report(
                    StageError::new(Arc::clone(self.core.shared_name()), "transformation failed")
                        .with_input(input)
                        .with_cause(cause),
                );
                Ok(())
            }
        }
    }
}

impl<In, Out> Pipe<In, Out> for TransformPipe<In, Out>
where
    In: Send + 'static,
    Out: 'static,
{
    fn set_next(&self, next: Arc<dyn Stage<Out>>) {
        self.core.set_next(next);
    }
}
