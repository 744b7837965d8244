use std::fmt;
use std::sync::Arc;

use crate::stage::PipeCore;
use crate::{
    BoxError, Cancellation, Cancelled, InvokeError, Lifecycle, Pipe, PipeContext, SetupError, Stage,
    StageError, SubTask, TaskPool, invoke_all,
};

type BuildFn<In, V> = dyn Fn(&In) -> Result<Vec<SubTask<V>>, BoxError> + Send + Sync;
type CombineFn<V, Out> = dyn Fn(Vec<V>) -> Result<Option<Out>, BoxError> + Send + Sync;

/// A pipe that splits each input into sub-tasks, runs them concurrently on a pool and combines
/// their results into one output.
///
/// The calling thread blocks until every sub-task has finished. The combine step is only
/// reached when every sub-task succeeded, and it then receives every result in the order the
/// sub-tasks were built. If building the sub-tasks, running any of them or combining the results
/// fails, the input fails as a whole: a [`StageError`] carrying the input is reported to the
/// chain's context and nothing is forwarded.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use pipework::{Cancellation, FixedThreadPool, ParallelPipe, Stage, sub_task};
///
/// let pool = Arc::new(FixedThreadPool::builder().build().unwrap());
///
/// // Sums the squares of a batch of numbers, one sub-task per number.
/// let squares = ParallelPipe::new(
///     "sum-of-squares",
///     pool,
///     |numbers: &Vec<u64>| {
///         Ok(numbers
///             .iter()
///             .map(|&n| sub_task(move || Ok(n * n)))
///             .collect())
///     },
///     |squares: Vec<u64>| Ok(Some(squares.into_iter().sum::<u64>())),
/// );
///
/// squares.process(vec![1, 2, 3], &Cancellation::never()).unwrap();
/// ```
pub struct ParallelPipe<In, Out, V> {
    core: PipeCore<Out>,
    pool: Arc<dyn TaskPool>,
    build_tasks: Box<BuildFn<In, V>>,
    combine: Box<CombineFn<V, Out>>,
}

impl<In, Out, V> fmt::Debug for ParallelPipe<In, Out, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelPipe")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl<In, Out, V> ParallelPipe<In, Out, V>
where
    In: Send + 'static,
    Out: 'static,
    V: Send + 'static,
{
    /// Creates a pipe named `name` that runs the sub-tasks returned by `build_tasks` on `pool`
    /// and turns their results into an output with `combine`.
    #[must_use]
    pub fn new<B, C>(
        name: impl Into<Arc<str>>,
        pool: Arc<dyn TaskPool>,
        build_tasks: B,
        combine: C,
    ) -> Self
    where
        B: Fn(&In) -> Result<Vec<SubTask<V>>, BoxError> + Send + Sync + 'static,
        C: Fn(Vec<V>) -> Result<Option<Out>, BoxError> + Send + Sync + 'static,
    {
        Self {
            core: PipeCore::new(name),
            pool,
            build_tasks: Box::new(build_tasks),
            combine: Box::new(combine),
        }
    }

    fn fail(&self, input: In, message: &str, cause: impl Into<BoxError>) {
        self.core.report(
            StageError::new(Arc::clone(self.core.shared_name()), message)
                .with_input(input)
                .with_cause(cause),
        );
    }
}

impl<In, Out, V> Lifecycle for ParallelPipe<In, Out, V>
where
    In: Send + 'static,
    Out: 'static,
    V: Send + 'static,
{
    fn name(&self) -> &str {
        self.core.name()
    }

    fn init(&self, context: &Arc<dyn PipeContext>) -> Result<(), SetupError> {
        self.core.init(context);
        Ok(())
    }
}

impl<In, Out, V> Stage<In> for ParallelPipe<In, Out, V>
where
    In: Send + 'static,
    Out: 'static,
    V: Send + 'static,
{
    fn process(&self, input: In, cancellation: &Cancellation) -> Result<(), Cancelled> {
        let tasks = match (self.build_tasks)(&input) {
            Ok(tasks) => tasks,
            Err(cause) => {
                self.fail(input, "building sub-tasks failed", cause);
                return Ok(());
            }
        };

        let results = match invoke_all(&*self.pool, tasks, cancellation) {
            Ok(results) => results,
            Err(InvokeError::Cancelled) => return Err(Cancelled),
            Err(error) => {
                self.fail(input, "sub-task execution failed", error);
                return Ok(());
            }
        };

        match (self.combine)(results) {
            Ok(output) => self.core.forward(output, cancellation),
            Err(cause) => {
                self.fail(input, "combining sub-task results failed", cause);
                Ok(())
            }
        }
    }
}

impl<In, Out, V> Pipe<In, Out> for ParallelPipe<In, Out, V>
where
    In: Send + 'static,
    Out: 'static,
    V: Send + 'static,
{
    fn set_next(&self, next: Arc<dyn Stage<Out>>) {
        self.core.set_next(next);
    }
}
