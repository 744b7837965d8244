#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Multi-stage processing pipelines with race-free coordinated shutdown.
//!
//! A pipeline is a chain of [`Stage`]s. Each stage receives inputs from its predecessor through
//! [`Stage::process()`] and, if it is also a [`Pipe`], forwards zero or one output per input to
//! the stage linked after it. Failures do not travel along the chain. They are reported as
//! [`StageError`]s to the [`PipeContext`] the chain was initialized with, and the input that
//! failed travels with the error.
//!
//! # Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use pipework::{
//!     Cancellation, CollectingContext, DedicatedPoolPipe, FixedThreadPool, Lifecycle,
//!     PipeContext, Pipeline, SharedPool, Stage, TransformPipe,
//! };
//!
//! let pool = Arc::new(FixedThreadPool::builder().build().unwrap());
//! let shared = SharedPool::new(pool);
//!
//! let pipeline = Pipeline::builder(TransformPipe::new("parse", |line: &String| {
//!     Ok(Some(line.parse::<u64>()?))
//! }))
//! // Squaring runs asynchronously on the shared pool.
//! .then(shared.decorate(TransformPipe::new("square", |n: &u64| Ok(Some(n * n)))))
//! // Printing runs on two dedicated worker threads.
//! .then(
//!     DedicatedPoolPipe::builder(TransformPipe::new("print", |n: &u64| {
//!         println!("{n}");
//!         Ok(None::<()>)
//!     }))
//!     .worker_count(2)
//!     .build()
//!     .unwrap(),
//! )
//! .build();
//!
//! let errors = Arc::new(CollectingContext::new());
//! let context: Arc<dyn PipeContext> = Arc::<CollectingContext>::clone(&errors);
//! pipeline.init(&context).unwrap();
//!
//! for line in ["1", "2", "three"] {
//!     pipeline.process(line.to_string(), &Cancellation::never()).unwrap();
//! }
//!
//! pipeline.shutdown(Duration::from_secs(5));
//!
//! // "three" failed to parse and was reported together with the input.
//! assert_eq!(errors.len(), 1);
//! ```
//!
//! # Stages
//!
//! - [`TransformPipe`] turns each input into at most one output with a closure.
//! - [`ParallelPipe`] splits each input into sub-tasks, runs them on a [`TaskPool`] and
//!   combines the results.
//! - [`SharedPoolPipe`] (created through [`SharedPool::decorate()`]) processes every input of
//!   the decorated stage asynchronously on a pool shared with other stages.
//! - [`DedicatedPoolPipe`] processes the inputs of the decorated stage on worker threads it
//!   owns, fed through a queue.
//! - [`Pipeline`] chains pipes into one pipe.
//!
//! [`Serializer`] stands apart from the chain: it funnels requests from any number of threads
//! through one worker thread, in submission order, and hands each caller a [`ResultHandle`].
//!
//! # Shutdown
//!
//! Every asynchronous stage is guarded by a [`TerminationToken`]. Callers take a
//! [`Reservation`] before they check whether shutdown has been requested, and the reservation
//! travels with the work item until it is done. Shutdown is only complete once shutdown has been
//! requested and no reservation is outstanding, so an input can never be accepted and then lost
//! during shutdown. It is either rejected to the context or fully processed.
//!
//! Worker threads are [`TerminableUnit`]s registered with the token. When the token drains, all
//! of them are told to terminate, and blocked workers are woken through their [`Cancellation`].

mod cancellation;
mod context;
mod dedicated_pool;
mod error;
mod parallel;
mod pipeline;
mod pool;
mod queue;
mod serializer;
mod shared_pool;
mod stage;
mod termination;
mod traced_pool;
mod transform;
mod unit;

pub use cancellation::*;
pub use context::*;
pub use dedicated_pool::*;
pub(crate) use error::format_panic_payload;
pub use error::*;
pub use parallel::*;
pub use pipeline::*;
pub use pool::*;
pub use queue::QueueKind;
pub use serializer::*;
pub use shared_pool::*;
pub use stage::*;
pub use termination::*;
pub use traced_pool::*;
pub use transform::*;
pub use unit::*;
