//! Counts the words in lines of text with a pipeline that feeds a serializer.

use std::sync::Arc;
use std::time::Duration;

use pipework::{
    BoxError, Cancellation, DedicatedPoolPipe, FixedThreadPool, Lifecycle, LoggingContext,
    PipeContext, Pipeline, Serializer, SharedPool, Stage, TransformPipe,
};

fn main() {
    tracing_subscriber::fmt().with_thread_names(true).init();

    // Word totals are confined to the serializer's worker thread.
    let mut total_words = 0_usize;
    let totals = Arc::new(
        Serializer::builder(
            |words: usize| words,
            move |words: usize| -> Result<usize, BoxError> {
                total_words += words;
                Ok(total_words)
            },
        )
        .name("totals")
        .build(),
    );
    totals.init().unwrap();

    let pool = Arc::new(FixedThreadPool::builder().build().unwrap());
    let shared = SharedPool::new(pool);

    let pipeline = Pipeline::builder(TransformPipe::new("trim", |line: &String| {
        let line = line.trim();
        Ok((!line.is_empty()).then(|| line.to_string()))
    }))
    .then(shared.decorate(TransformPipe::new("count", |line: &String| {
        Ok(Some(line.split_whitespace().count()))
    })))
    .then(
        DedicatedPoolPipe::builder(TransformPipe::new("report", {
            let totals = Arc::clone(&totals);
            move |words: &usize| {
                let running = totals.service(*words)?.wait()?;
                println!("{words} words, {running} so far");
                Ok(None::<()>)
            }
        }))
        .worker_count(1)
        .build()
        .unwrap(),
    )
    .build();

    let context: Arc<dyn PipeContext> = Arc::new(LoggingContext::new());
    pipeline.init(&context).unwrap();

    for line in [
        "the quick brown fox",
        "   ",
        "jumps over",
        "the lazy dog",
    ] {
        pipeline
            .process(line.to_string(), &Cancellation::never())
            .unwrap();
    }

    pipeline.shutdown(Duration::from_secs(5));

    let total = totals.service(0).unwrap().wait().unwrap();
    println!("{total} words in total");

    assert!(totals.shutdown(Duration::from_secs(5)));
}
