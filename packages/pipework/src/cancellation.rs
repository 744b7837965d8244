//! Explicit cancellation signals observed by blocking operations.
//!
//! Nothing in this crate relies on ambient thread state to stop a blocked thread. Instead, every
//! blocking operation receives a [`Cancellation`] by reference and waits on it together with the
//! operation itself, so raising the signal wakes the blocked call immediately.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::Cancelled;

#[derive(Debug)]
struct SignalState {
    raised: AtomicBool,

    // Nothing is ever sent. Dropping the sender disconnects every receiver, which is what wakes
    // up blocked waiters.
    trigger: Mutex<Option<Sender<Infallible>>>,
}

/// The owning side of a cancellation signal.
///
/// Whoever holds the source may raise the signal. Any number of [`Cancellation`] observers can be
/// obtained from it and handed to the code that may block.
///
/// # Example
///
/// ```rust
/// use pipework::CancellationSource;
///
/// let source = CancellationSource::new();
/// let cancellation = source.cancellation();
///
/// assert!(cancellation.check().is_ok());
/// source.cancel();
/// assert!(cancellation.check().is_err());
/// ```
#[derive(Debug)]
pub struct CancellationSource {
    state: Arc<SignalState>,
    observer: Receiver<Infallible>,
}

impl CancellationSource {
    /// Creates a signal that has not been raised.
    #[must_use]
    pub fn new() -> Self {
        let (trigger, observer) = channel::bounded(0);

        Self {
            state: Arc::new(SignalState {
                raised: AtomicBool::new(false),
                trigger: Mutex::new(Some(trigger)),
            }),
            observer,
        }
    }

    /// Returns an observer of this signal.
    #[must_use]
    pub fn cancellation(&self) -> Cancellation {
        Cancellation {
            state: Some(Arc::clone(&self.state)),
            observer: self.observer.clone(),
        }
    }

    /// Raises the signal, waking every operation blocked on an observer.
    ///
    /// Returns `true` if this call raised the signal and `false` if it was already raised.
    pub fn cancel(&self) -> bool {
        // Release pairs with the Acquire in `is_cancelled()` so that an observer who sees the
        // flag also sees everything the canceller did before cancelling.
        if self.state.raised.swap(true, Ordering::AcqRel) {
            return false;
        }

        drop(self.state.trigger.lock().take());
        true
    }

    /// Whether the signal has been raised.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.raised.load(Ordering::Acquire)
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

/// An observer of a cancellation signal.
///
/// Observers are cheap to clone and are passed by reference into every operation that may
/// block, such as [`Stage::process()`][crate::Stage::process].
#[derive(Clone, Debug)]
pub struct Cancellation {
    state: Option<Arc<SignalState>>,
    observer: Receiver<Infallible>,
}

impl Cancellation {
    /// Returns an observer of a signal that is never raised.
    #[must_use]
    pub fn never() -> Self {
        Self {
            state: None,
            observer: channel::never(),
        }
    }

    /// Whether the signal has been raised.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|state| state.raised.load(Ordering::Acquire))
    }

    /// Returns `Err(Cancelled)` if the signal has been raised.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] if the signal has been raised.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleeps for up to `timeout`, returning early if the signal is raised.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] if the signal was raised before the timeout elapsed.
    pub fn sleep(&self, timeout: Duration) -> Result<(), Cancelled> {
        match self.observer.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => Ok(()),
            Err(RecvTimeoutError::Disconnected) => Err(Cancelled),
            Ok(never) => match never {},
        }
    }

    /// The channel that disconnects when the signal is raised, for use in `select!`.
    pub(crate) fn observer(&self) -> &Receiver<Infallible> {
        &self.observer
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::never()
    }
}
