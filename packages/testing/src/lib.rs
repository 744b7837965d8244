#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for tests, benchmarks and examples in the pipework workspace.

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// How long [`with_watchdog()`] lets a test run before failing it.
///
/// Miri is dramatically slower at thread synchronization, so it gets a longer allowance.
#[must_use]
pub fn watchdog_timeout() -> Duration {
    if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    }
}

/// Runs a test on a separate thread and fails it if it does not finish in time.
///
/// Tests of threaded code tend to fail by hanging rather than by panicking. Wrapping them in
/// the watchdog turns a hang into a test failure after [`watchdog_timeout()`].
///
/// When the `MUTATION_TESTING` environment variable is set to "1", the watchdog is disabled and
/// the test runs directly on the calling thread, so that mutation testing can detect mutations
/// that make the code hang.
///
/// # Panics
///
/// Panics if the test exceeds the timeout, and re-raises any panic of the test itself.
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// let answer = with_watchdog(|| 6 * 7);
///
/// assert_eq!(answer, 42);
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let (result_tx, result_rx) = mpsc::channel();

    let test_thread = thread::spawn(move || {
        // If the receiver is gone, the watchdog has already failed the test.
        drop(result_tx.send(test_fn()));
    });

    match result_rx.recv_timeout(watchdog_timeout()) {
        Ok(result) => {
            test_thread.join().expect("test thread sent its result, so it cannot have panicked");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("test exceeded the {:?} watchdog timeout", watchdog_timeout());
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_thread.join() {
            Ok(()) => panic!("test thread exited without sending a result"),
            Err(payload) => std::panic::resume_unwind(payload),
        },
    }
}

/// Polls `condition` until it returns `true` or `timeout` elapses.
///
/// Returns the final value of the condition. Use this for state that converges asynchronously
/// and offers nothing to block on.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
///
/// use testing::wait_until;
///
/// assert!(wait_until(Duration::from_secs(1), || true));
/// ```
#[cfg_attr(test, mutants::skip)] // Mutations only change how long a passing test waits.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    const POLL_INTERVAL: Duration = Duration::from_millis(1);

    let started = Instant::now();

    loop {
        if condition() {
            return true;
        }

        if started.elapsed() >= timeout {
            return condition();
        }

        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn watchdog_returns_test_result() {
        assert_eq!(with_watchdog(|| "hello world"), "hello world");
    }

    #[test]
    #[should_panic(expected = "inner failure")]
    fn watchdog_propagates_test_panic() {
        with_watchdog(|| panic!("inner failure"));
    }

    #[test]
    fn wait_until_sees_condition_become_true() {
        let polls = Arc::new(AtomicUsize::new(0));

        let satisfied = wait_until(Duration::from_secs(5), {
            let polls = Arc::clone(&polls);
            move || polls.fetch_add(1, Ordering::Relaxed) >= 3
        });

        assert!(satisfied);
        assert!(polls.load(Ordering::Relaxed) >= 4);
    }

    #[test]
    fn wait_until_gives_up_after_timeout() {
        assert!(!wait_until(Duration::from_millis(5), || false));
    }
}
