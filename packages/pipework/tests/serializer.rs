//! Integration tests for the serializer.
//!
//! These tests use real threads and are ignored under Miri.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pipework::{BoxError, QueueKind, Serializer, ServiceError, TaskError};
use testing::with_watchdog;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const PER_CALLER: usize = 100;

fn init_logging() {
    drop(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_thread_names(true)
            .try_init(),
    );
}

/// A serializer whose confined state is a log of `(caller, sequence)` entries. Each task
/// returns the position at which its entry was appended.
fn logging_serializer(queue: QueueKind) -> Serializer<(usize, usize), (usize, usize), usize> {
    let mut log = Vec::new();

    Serializer::builder(
        |entry: (usize, usize)| entry,
        move |entry: (usize, usize)| -> Result<usize, BoxError> {
            log.push(entry);
            Ok(log.len() - 1)
        },
    )
    .queue(queue)
    .name("log-writer")
    .build()
}

#[cfg_attr(miri, ignore)]
#[test]
fn concurrent_callers_are_served_in_submission_order() {
    with_watchdog(|| {
        init_logging();

        let serializer = Arc::new(logging_serializer(QueueKind::Unbounded));
        serializer.init().unwrap();

        let callers: Vec<_> = (0..2)
            .map(|caller| {
                let serializer = Arc::clone(&serializer);
                thread::spawn(move || {
                    let handles: Vec<_> = (0..PER_CALLER)
                        .map(|sequence| serializer.service((caller, sequence)).unwrap())
                        .collect();

                    handles
                        .into_iter()
                        .map(|handle| handle.wait().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all_positions = Vec::new();

        for caller in callers {
            let positions = caller.join().unwrap();

            // Each caller's tasks were executed in the order that caller submitted them.
            assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
            all_positions.extend(positions);
        }

        all_positions.sort_unstable();
        assert_eq!(all_positions, (0..2 * PER_CALLER).collect::<Vec<_>>());

        assert!(serializer.shutdown(SHUTDOWN_TIMEOUT));
        assert_eq!(serializer.token().reservations(), 0);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn accepted_tasks_complete_and_later_ones_are_refused() {
    with_watchdog(|| {
        init_logging();

        let serializer = logging_serializer(QueueKind::Bounded(8.try_into().unwrap()));
        serializer.init().unwrap();

        let handles: Vec<_> = (0..8)
            .map(|sequence| serializer.service((0, sequence)).unwrap())
            .collect();

        assert!(serializer.shutdown(SHUTDOWN_TIMEOUT));

        for (expected, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.wait().unwrap(), expected);
        }

        assert!(matches!(
            serializer.service((0, 99)),
            Err(ServiceError::ShutDown)
        ));
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn failing_task_does_not_stop_the_worker() {
    with_watchdog(|| {
        init_logging();

        let serializer = Serializer::builder(
            |divisor: u32| divisor,
            |divisor: u32| -> Result<u32, BoxError> {
                100_u32
                    .checked_div(divisor)
                    .ok_or_else(|| "division by zero".into())
            },
        )
        .build();
        serializer.init().unwrap();

        let failed = serializer.service(0).unwrap();
        let succeeded = serializer.service(5).unwrap();

        assert!(matches!(failed.wait(), Err(TaskError::Failed(_))));
        assert_eq!(succeeded.wait().unwrap(), 20);

        assert!(serializer.shutdown(SHUTDOWN_TIMEOUT));
    });
}
