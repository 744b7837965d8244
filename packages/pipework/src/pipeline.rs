use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::{Cancellation, Cancelled, Lifecycle, Pipe, PipeContext, SetupError, Stage};

type LinkFn<Out> = dyn Fn(Arc<dyn Stage<Out>>) + Send + Sync;

/// A chain of pipes that acts as one pipe.
///
/// Inputs enter the first pipe, each pipe forwards its outputs to the one added after it, and
/// the outputs of the last pipe go to whatever stage is linked to the pipeline itself.
///
/// Initializing the pipeline initializes every pipe with the same context. Shutting it down
/// shuts the pipes down in the order they were added, so upstream pipes have drained into
/// downstream ones before those are shut down.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use pipework::{Cancellation, Lifecycle, LoggingContext, PipeContext, Pipeline, Stage, TransformPipe};
///
/// let pipeline = Pipeline::builder(TransformPipe::new("parse", |text: &String| {
///     Ok(Some(text.trim().parse::<i64>()?))
/// }))
/// .then(TransformPipe::new("negate", |value: &i64| Ok(Some(-value))))
/// .then(TransformPipe::new("print", |value: &i64| {
///     println!("{value}");
///     Ok(None::<()>)
/// }))
/// .build();
///
/// let context: Arc<dyn PipeContext> = Arc::new(LoggingContext::new());
/// pipeline.init(&context).unwrap();
///
/// pipeline.process(" 42 ".to_string(), &Cancellation::never()).unwrap();
/// pipeline.shutdown(Duration::from_secs(1));
/// ```
pub struct Pipeline<In, Out> {
    name: Arc<str>,
    head: Arc<dyn Stage<In>>,
    link_tail: Box<LinkFn<Out>>,
    stages: Vec<Arc<dyn Lifecycle>>,
}

impl<In, Out> fmt::Debug for Pipeline<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field(
                "stages",
                &self.stages.iter().map(|stage| stage.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl<In, Out> Pipeline<In, Out>
where
    In: 'static,
    Out: 'static,
{
    /// Starts a pipeline with `first` as its first pipe.
    #[must_use]
    pub fn builder<P>(first: P) -> PipelineBuilder<In, Out>
    where
        P: Pipe<In, Out> + 'static,
    {
        let first = Arc::new(first);
        let head: Arc<dyn Stage<In>> = Arc::<P>::clone(&first);
        let tail: Arc<dyn Pipe<In, Out>> = Arc::<P>::clone(&first);
        let stage: Arc<dyn Lifecycle> = first;

        PipelineBuilder {
            name: None,
            head,
            link_tail: link_to(tail),
            stages: vec![stage],
        }
    }

    /// The number of pipes in the pipeline.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Always `false`; a pipeline has at least one pipe.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

fn link_to<In, Out>(pipe: Arc<dyn Pipe<In, Out>>) -> Box<LinkFn<Out>>
where
    In: 'static,
    Out: 'static,
{
    Box::new(move |next| pipe.set_next(next))
}

/// Builder for a [`Pipeline`]. `Out` is the output type of the pipe added last.
pub struct PipelineBuilder<In, Out> {
    name: Option<Arc<str>>,
    head: Arc<dyn Stage<In>>,
    link_tail: Box<LinkFn<Out>>,
    stages: Vec<Arc<dyn Lifecycle>>,
}

impl<In, Out> fmt::Debug for PipelineBuilder<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("name", &self.name)
            .field("stages", &self.stages.len())
            .finish_non_exhaustive()
    }
}

impl<In, Out> PipelineBuilder<In, Out>
where
    In: 'static,
    Out: 'static,
{
    /// Appends `next`, which receives the outputs of the pipe added before it.
    #[must_use]
    pub fn then<P, Next>(mut self, next: P) -> PipelineBuilder<In, Next>
    where
        P: Pipe<Out, Next> + 'static,
        Next: 'static,
    {
        let next = Arc::new(next);
        let linked: Arc<dyn Stage<Out>> = Arc::<P>::clone(&next);
        let stage: Arc<dyn Lifecycle> = Arc::<P>::clone(&next);
        let tail: Arc<dyn Pipe<Out, Next>> = next;

        (self.link_tail)(linked);
        self.stages.push(stage);

        PipelineBuilder {
            name: self.name,
            head: self.head,
            link_tail: link_to(tail),
            stages: self.stages,
        }
    }

    /// Sets the name of the pipeline. Defaults to the names of its pipes joined by `" -> "`.
    #[must_use]
    pub fn name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Finishes the pipeline.
    #[must_use]
    pub fn build(self) -> Pipeline<In, Out> {
        let name = self.name.unwrap_or_else(|| {
            self.stages
                .iter()
                .map(|stage| stage.name())
                .collect::<Vec<_>>()
                .join(" -> ")
                .into()
        });

        Pipeline {
            name,
            head: self.head,
            link_tail: self.link_tail,
            stages: self.stages,
        }
    }
}

impl<In, Out> Lifecycle for Pipeline<In, Out>
where
    In: 'static,
    Out: 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self, context: &Arc<dyn PipeContext>) -> Result<(), SetupError> {
        for stage in &self.stages {
            stage.init(context)?;
        }

        debug!(pipeline = %self.name, stages = self.stages.len(), "pipeline initialized");
        Ok(())
    }

    fn shutdown(&self, timeout: Duration) {
        let started = Instant::now();

        for stage in &self.stages {
            stage.shutdown(timeout.saturating_sub(started.elapsed()));
        }

        debug!(pipeline = %self.name, elapsed = ?started.elapsed(), "pipeline shut down");
    }
}

impl<In, Out> Stage<In> for Pipeline<In, Out>
where
    In: 'static,
    Out: 'static,
{
    fn process(&self, input: In, cancellation: &Cancellation) -> Result<(), Cancelled> {
        self.head.process(input, cancellation)
    }
}

impl<In, Out> Pipe<In, Out> for Pipeline<In, Out>
where
    In: 'static,
    Out: 'static,
{
    fn set_next(&self, next: Arc<dyn Stage<Out>>) {
        (self.link_tail)(next);
    }
}
