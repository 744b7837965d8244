//! Cooperative worker loops that stop through the two-phase termination protocol.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::termination::UnitControl;
use crate::{
    BoxError, Cancellation, SetupError, TerminationToken, UnitError, UnitId, format_panic_payload,
};

type LoopBody = Box<dyn FnMut(&Cancellation) -> Result<(), UnitError> + Send + 'static>;
type CleanupHook = Box<dyn FnOnce(Option<BoxError>) + Send + 'static>;

struct Routine {
    body: LoopBody,
    cleanup: Option<CleanupHook>,
}

/// A dedicated thread running a loop body until its termination token says to stop.
///
/// The loop is a small state machine. Before every iteration the unit checks whether shutdown
/// is complete on its token (shutdown requested and no reservations outstanding) or whether its
/// own cancellation signal was raised. If so, it exits. Otherwise it runs the body once. The
/// body receives the unit's cancellation signal and is expected to pass it to every blocking
/// call it makes.
///
/// When the loop exits, the cleanup hook runs (receiving the failure, if the loop ended because
/// the body failed or panicked), the unit unregisters from its token and every other unit on
/// the same token is asked to terminate. The failure value itself is not propagated to the
/// other units, only the request to stop.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use pipework::{TerminableUnit, TerminationToken, UnitError};
///
/// let token = Arc::new(TerminationToken::new());
///
/// let unit = TerminableUnit::builder(Arc::clone(&token), |cancellation| {
///     // One unit of work, then a cancellable pause.
///     cancellation.sleep(Duration::from_millis(1))?;
///     Ok::<(), UnitError>(())
/// })
/// .name("ticker")
/// .build();
///
/// unit.start().unwrap();
/// assert!(unit.terminate_and_join(Duration::from_secs(5)));
/// ```
pub struct TerminableUnit {
    control: Arc<UnitControl>,
    token: Arc<TerminationToken>,
    routine: Mutex<Option<Routine>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for TerminableUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminableUnit")
            .field("id", &self.control.id())
            .field("name", &self.control.name())
            .field("started", &self.routine.lock().is_none())
            .field("terminated", &self.control.has_exited())
            .finish_non_exhaustive()
    }
}

impl TerminableUnit {
    /// Creates a builder for a unit that cooperates on `token` and runs `body` in a loop.
    #[must_use]
    pub fn builder<F>(token: Arc<TerminationToken>, body: F) -> TerminableUnitBuilder
    where
        F: FnMut(&Cancellation) -> Result<(), UnitError> + Send + 'static,
    {
        TerminableUnitBuilder {
            token,
            name: None,
            body: Box::new(body),
            cleanup: None,
        }
    }

    /// The identifier of the unit in its token's registry.
    #[must_use]
    pub fn id(&self) -> UnitId {
        self.control.id()
    }

    /// The name of the unit, which is also the name of its thread.
    #[must_use]
    pub fn name(&self) -> &str {
        self.control.name()
    }

    /// The termination token the unit cooperates on.
    #[must_use]
    pub fn token(&self) -> &Arc<TerminationToken> {
        &self.token
    }

    /// Spawns the thread running the loop. Starting an already started unit does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::ThreadSpawn`] if the operating system refuses to start the thread.
    pub fn start(&self) -> Result<(), SetupError> {
        let mut routine_slot = self.routine.lock();

        let Some(routine) = routine_slot.take() else {
            return Ok(());
        };

        let control = Arc::clone(&self.control);
        let token = Arc::clone(&self.token);

        let handle = thread::Builder::new()
            .name(self.control.name().to_string())
            .spawn(move || run(&control, &token, routine))
            .map_err(|source| SetupError::ThreadSpawn {
                name: self.control.name().to_string(),
                source,
            })?;

        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// Asks the unit to stop.
    ///
    /// This requests shutdown on the shared token. If no work is outstanding the unit is woken
    /// up immediately, otherwise it stops once the last reservation on the token is released.
    /// Only the first request for a unit has any effect; later ones return `false`.
    pub fn terminate(&self) -> bool {
        self.control.request_terminate(&self.token)
    }

    /// Whether termination of this unit has been requested, by its owner or by a sibling.
    #[must_use]
    pub fn is_terminate_requested(&self) -> bool {
        self.control.is_terminate_requested()
    }

    /// Whether the loop has exited and the cleanup hook has run.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.control.has_exited()
    }

    /// Waits up to `timeout` for the loop to exit.
    ///
    /// Returns `true` if the loop has exited (or was never started) and `false` if the timeout
    /// elapsed first.
    ///
    /// # Panics
    ///
    /// Re-raises a panic from the unit's cleanup hook.
    #[must_use]
    pub fn join(&self, timeout: Duration) -> bool {
        if self.routine.lock().is_some() {
            return true;
        }

        if !self.control.wait_exited(timeout) {
            return false;
        }

        let handle = self.thread.lock().take();

        if let Some(Err(payload)) = handle.map(JoinHandle::join) {
            panic::resume_unwind(payload);
        }

        true
    }

    /// Asks the unit to stop and waits up to `timeout` for it to exit.
    #[must_use]
    pub fn terminate_and_join(&self, timeout: Duration) -> bool {
        self.terminate();
        self.join(timeout)
    }

    /// Drops the loop body of a unit that was never started, along with everything the body
    /// owns, runs the cleanup hook and records the unit as exited. A later `start()` does
    /// nothing.
    ///
    /// Returns `false` if the unit had already been started.
    pub(crate) fn discard_unstarted(&self) -> bool {
        let Some(Routine { body, cleanup }) = self.routine.lock().take() else {
            return false;
        };

        drop(body);

        let _notify = scopeguard::guard((), |()| {
            self.control.mark_exited();
            self.token.unit_terminated(self.control.id());
            debug!(
                unit = %self.control.id(),
                name = self.control.name(),
                "unstarted unit discarded"
            );
        });

        if let Some(cleanup) = cleanup {
            cleanup(None);
        }

        true
    }
}

/// Builder for a [`TerminableUnit`].
#[derive(derive_more::Debug)]
pub struct TerminableUnitBuilder {
    token: Arc<TerminationToken>,
    name: Option<String>,
    #[debug(ignore)]
    body: LoopBody,
    #[debug(ignore)]
    cleanup: Option<CleanupHook>,
}

impl TerminableUnitBuilder {
    /// Sets the name of the unit and its thread. Defaults to a name derived from the unit id.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets a hook that runs on the unit's thread after the loop exits. For a unit that is shut
    /// down without ever being started, it runs on the thread doing the shutdown.
    ///
    /// The hook receives the failure that ended the loop, or `None` if the loop ended because
    /// of shutdown, cancellation or exhaustion of its work source.
    #[must_use]
    pub fn on_cleanup<F>(mut self, cleanup: F) -> Self
    where
        F: FnOnce(Option<BoxError>) + Send + 'static,
    {
        self.cleanup = Some(Box::new(cleanup));
        self
    }

    /// Registers the unit on its token. The unit does not run until started.
    #[must_use]
    pub fn build(self) -> TerminableUnit {
        let control = self.token.register(self.name);

        TerminableUnit {
            control,
            token: self.token,
            routine: Mutex::new(Some(Routine {
                body: self.body,
                cleanup: self.cleanup,
            })),
            thread: Mutex::new(None),
        }
    }
}

#[cfg_attr(test, mutants::skip)] // Mutations here hang the test threads rather than fail them.
fn run(control: &UnitControl, token: &TerminationToken, routine: Routine) {
    let Routine { mut body, cleanup } = routine;
    let cancellation = control.cancellation();

    debug!(unit = %control.id(), name = control.name(), "unit started");

    let failure = loop {
        if token.is_shutdown_complete() || cancellation.is_cancelled() {
            break None;
        }

        match panic::catch_unwind(AssertUnwindSafe(|| body(&cancellation))) {
            Ok(Ok(())) => {}
            Ok(Err(UnitError::Cancelled | UnitError::Exhausted)) => break None,
            Ok(Err(UnitError::Failed(failure))) => break Some(failure),
            Err(payload) => {
                break Some(
                    format!("unit body panicked: {}", format_panic_payload(&*payload)).into(),
                );
            }
        }
    };

    // The token must learn about the exit even if the cleanup hook panics, otherwise sibling
    // units would never be asked to stop and joiners would wait forever.
    let _notify = scopeguard::guard((), |()| {
        control.mark_exited();
        token.unit_terminated(control.id());
        debug!(unit = %control.id(), name = control.name(), "unit terminated");
    });

    if let Some(failure) = &failure {
        error!(
            unit = %control.id(),
            name = control.name(),
            error = %failure,
            "unit loop exited with a failure"
        );
    }

    if let Some(cleanup) = cleanup {
        cleanup(failure);
    }
}
