//! The two-phase termination protocol shared by every component that owns threads.
//!
//! A [`TerminationToken`] combines three things:
//!
//! 1. A monotonic "shutdown requested" flag.
//! 2. A count of reservations, each representing one unit of accepted-but-not-yet-completed
//!    work. Reservations are taken through [`TerminationToken::reserve()`] and released when the
//!    returned [`Reservation`] guard is dropped, so a release can never be skipped.
//! 3. A registry of the terminable units cooperating on the token.
//!
//! Shutdown is complete once the flag is set and no reservations remain. Whichever party
//! observes that state first (the shutdown request itself or the last release) signals the
//! drain exactly once and cancels every registered unit that is blocked waiting for work.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rsevents::{Awaitable, EventState, ManualResetEvent};
use tracing::{debug, trace};

use crate::{Cancellation, CancellationSource};

/// Identifies one terminable unit registered on a [`TerminationToken`].
#[derive(Clone, Copy, Debug, derive_more::Display, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[display("unit-{_0}")]
pub struct UnitId(u64);

/// Shared shutdown signal, in-flight work counter and registry of cooperating units.
///
/// A token is shared (via `Arc`) by every component that must drain together: all the workers
/// of one dedicated worker pool, or all the stages decorated onto one shared thread pool.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use pipework::TerminationToken;
///
/// let token = Arc::new(TerminationToken::new());
///
/// let reservation = token.reserve();
/// token.request_shutdown();
///
/// // Work is still outstanding, so shutdown is not complete yet.
/// assert!(!token.is_shutdown_complete());
///
/// drop(reservation);
///
/// assert!(token.is_shutdown_complete());
/// assert!(token.wait_drained(Duration::ZERO));
/// ```
pub struct TerminationToken {
    shutdown_requested: AtomicBool,
    reservations: AtomicUsize,

    drained: AtomicBool,
    drained_event: ManualResetEvent,
    drain_signals: AtomicUsize,

    units: Mutex<Vec<RegisteredUnit>>,
    next_unit_id: AtomicU64,
}

impl fmt::Debug for TerminationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminationToken")
            .field("shutdown_requested", &self.is_shutdown_requested())
            .field("reservations", &self.reservations())
            .field("drained", &self.drained.load(Ordering::Relaxed))
            .field("registered_units", &self.units.lock().len())
            .finish_non_exhaustive()
    }
}

impl TerminationToken {
    /// Creates a token with no reservations and no shutdown requested.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shutdown_requested: AtomicBool::new(false),
            reservations: AtomicUsize::new(0),
            drained: AtomicBool::new(false),
            drained_event: ManualResetEvent::new(EventState::Unset),
            drain_signals: AtomicUsize::new(0),
            units: Mutex::new(Vec::new()),
            next_unit_id: AtomicU64::new(0),
        }
    }

    /// Whether shutdown has been requested. Once set, this never resets.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// The number of reservations currently held.
    #[must_use]
    pub fn reservations(&self) -> usize {
        self.reservations.load(Ordering::SeqCst)
    }

    /// Whether shutdown has been requested and every reservation has been released.
    #[must_use]
    pub fn is_shutdown_complete(&self) -> bool {
        self.is_shutdown_requested() && self.reservations() == 0
    }

    /// Whether the drain has been signaled: shutdown was requested and, at some point after
    /// that, no reservations were held.
    ///
    /// Unlike [`is_shutdown_complete()`][Self::is_shutdown_complete], this never resets. Work
    /// that is already in flight may still reserve and forward to other components on the same
    /// token until the drain is signaled.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::SeqCst)
    }

    /// Reserves one unit of work.
    ///
    /// The reservation is released when the returned guard is dropped, including when the
    /// work fails or panics.
    pub fn reserve(self: &Arc<Self>) -> Reservation {
        let outstanding = self
            .reservations
            .fetch_add(1, Ordering::SeqCst)
            .wrapping_add(1);

        trace!(outstanding, "reserved");

        Reservation {
            token: Arc::clone(self),
        }
    }

    /// Requests shutdown.
    ///
    /// If no reservations are held at this instant, the drain is signaled immediately and every
    /// registered unit is cancelled. Otherwise the release of the last reservation does that.
    ///
    /// Calling this more than once has no additional effect.
    pub fn request_shutdown(&self) {
        // The flag store and the counter load below are SeqCst, as are the decrement and the
        // flag load in `release()`. Whichever side runs second is guaranteed to see the other
        // side's write, so the drain cannot be missed by both.
        if !self.shutdown_requested.swap(true, Ordering::SeqCst) {
            debug!(outstanding = self.reservations(), "shutdown requested");
        }

        if self.reservations.load(Ordering::SeqCst) == 0 {
            self.signal_drained();
        }
    }

    /// Waits until shutdown has been requested and every reservation released.
    ///
    /// Returns `false` if the timeout elapsed first.
    #[must_use]
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        if self.drained.load(Ordering::Acquire) {
            return true;
        }

        self.drained_event.wait_for(timeout)
    }

    fn release(&self) {
        let previous = self.reservations.fetch_sub(1, Ordering::SeqCst);
        debug_assert_ne!(previous, 0, "reservation released without being reserved");

        trace!(outstanding = previous.wrapping_sub(1), "released");

        if previous == 1 && self.shutdown_requested.load(Ordering::SeqCst) {
            self.signal_drained();
        }
    }

    fn signal_drained(&self) {
        if self
            .drained
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.drain_signals.fetch_add(1, Ordering::Relaxed);
            debug!("all reservations released after shutdown request");
            self.drained_event.set();
        }

        for unit in self.live_units() {
            unit.cancel();
        }
    }

    /// Registers a new cooperating unit and returns its control block.
    ///
    /// The registry only keeps a weak reference. The caller owns the control block. Unnamed
    /// units are named after their id.
    pub(crate) fn register(&self, name: Option<String>) -> Arc<UnitControl> {
        let id = UnitId(self.next_unit_id.fetch_add(1, Ordering::Relaxed));
        let name = name.unwrap_or_else(|| format!("pipework-{id}"));
        let control = Arc::new(UnitControl::new(id, name));

        self.units.lock().push(RegisteredUnit {
            id,
            control: Arc::downgrade(&control),
        });

        control
    }

    /// Called by a unit whose loop has exited. Unregisters it and asks every other live unit on
    /// the token to terminate.
    pub(crate) fn unit_terminated(&self, id: UnitId) {
        let siblings = {
            let mut units = self.units.lock();
            units.retain(|unit| unit.id != id);
            Self::upgrade_pruning_stale(&mut units)
        };

        for sibling in siblings {
            if sibling.request_terminate(self) {
                debug!(unit = %sibling.id(), exited = %id, "terminating sibling of exited unit");
            }
        }
    }

    fn live_units(&self) -> Vec<Arc<UnitControl>> {
        Self::upgrade_pruning_stale(&mut self.units.lock())
    }

    // A unit that was dropped without ever being started never unregisters itself. Its entry
    // is dead and is skipped and removed here.
    fn upgrade_pruning_stale(units: &mut Vec<RegisteredUnit>) -> Vec<Arc<UnitControl>> {
        let mut live = Vec::with_capacity(units.len());

        units.retain(|unit| {
            unit.control.upgrade().is_some_and(|control| {
                live.push(control);
                true
            })
        });

        live
    }

    #[cfg(test)]
    pub(crate) fn registered_units(&self) -> usize {
        self.units.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn drain_signal_count(&self) -> usize {
        self.drain_signals.load(Ordering::Relaxed)
    }
}

impl Default for TerminationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// One reserved unit of work on a [`TerminationToken`].
///
/// Dropping the reservation releases it. Reservations can be moved across threads together with
/// the work they represent, so the thread that completes the work is the one that releases it.
#[derive(Debug)]
#[must_use = "dropping a reservation releases it immediately"]
pub struct Reservation {
    token: Arc<TerminationToken>,
}

impl Reservation {
    /// Releases the reservation. Equivalent to dropping it.
    pub fn release(self) {
        drop(self);
    }

    /// The token the reservation was taken on.
    #[must_use]
    pub fn token(&self) -> &Arc<TerminationToken> {
        &self.token
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.token.release();
    }
}

#[derive(Debug)]
struct RegisteredUnit {
    id: UnitId,
    control: Weak<UnitControl>,
}

/// Per-unit state shared between a unit's owner, its thread and the token registry.
#[derive(derive_more::Debug)]
pub(crate) struct UnitControl {
    id: UnitId,
    name: String,
    cancellation: CancellationSource,

    terminate_requested: AtomicBool,
    terminate_requests: AtomicUsize,

    exited: AtomicBool,
    #[debug(ignore)]
    exited_event: ManualResetEvent,
}

impl UnitControl {
    fn new(id: UnitId, name: String) -> Self {
        Self {
            id,
            name,
            cancellation: CancellationSource::new(),
            terminate_requested: AtomicBool::new(false),
            terminate_requests: AtomicUsize::new(0),
            exited: AtomicBool::new(false),
            exited_event: ManualResetEvent::new(EventState::Unset),
        }
    }

    pub(crate) fn id(&self) -> UnitId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn cancellation(&self) -> Cancellation {
        self.cancellation.cancellation()
    }

    fn cancel(&self) {
        if self.cancellation.cancel() {
            trace!(unit = %self.id, name = %self.name, "cancelled");
        }
    }

    /// Asks the unit to terminate. Only the first request has any effect.
    ///
    /// Returns `true` if this was the first request.
    pub(crate) fn request_terminate(&self, token: &TerminationToken) -> bool {
        if self.terminate_requested.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.terminate_requests.fetch_add(1, Ordering::Relaxed);
        token.request_shutdown();
        true
    }

    pub(crate) fn is_terminate_requested(&self) -> bool {
        self.terminate_requested.load(Ordering::Acquire)
    }

    pub(crate) fn mark_exited(&self) {
        self.exited.store(true, Ordering::Release);
        self.exited_event.set();
    }

    pub(crate) fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub(crate) fn wait_exited(&self, timeout: Duration) -> bool {
        self.has_exited() || self.exited_event.wait_for(timeout)
    }

    #[cfg(test)]
    pub(crate) fn terminate_requests(&self) -> usize {
        self.terminate_requests.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(TerminationToken: Send, Sync);
    assert_impl_all!(Reservation: Send, Sync);

    #[test]
    fn reservation_guard_releases_on_drop() {
        let token = Arc::new(TerminationToken::new());

        let first = token.reserve();
        let second = token.reserve();
        assert_eq!(token.reservations(), 2);

        drop(first);
        assert_eq!(token.reservations(), 1);

        second.release();
        assert_eq!(token.reservations(), 0);
    }

    #[test]
    fn shutdown_without_reservations_drains_immediately() {
        let token = Arc::new(TerminationToken::new());

        token.request_shutdown();

        assert!(token.is_shutdown_requested());
        assert!(token.is_shutdown_complete());
        assert!(token.wait_drained(Duration::ZERO));
        assert_eq!(token.drain_signal_count(), 1);
    }

    #[test]
    fn shutdown_with_reservations_is_deferred_until_last_release() {
        let token = Arc::new(TerminationToken::new());
        let first = token.reserve();
        let second = token.reserve();

        token.request_shutdown();
        assert!(!token.is_shutdown_complete());
        assert!(!token.wait_drained(Duration::ZERO));

        drop(first);
        assert!(!token.wait_drained(Duration::ZERO));

        drop(second);
        assert!(token.is_shutdown_complete());
        assert!(token.wait_drained(Duration::ZERO));
        assert_eq!(token.drain_signal_count(), 1);
    }

    #[test]
    fn repeated_shutdown_requests_drain_once() {
        let token = Arc::new(TerminationToken::new());

        token.request_shutdown();
        token.request_shutdown();
        drop(token.reserve());

        assert_eq!(token.drain_signal_count(), 1);
    }

    #[test]
    fn drain_cancels_registered_units() {
        let token = Arc::new(TerminationToken::new());
        let first = token.register(Some("first".to_string()));
        let second = token.register(Some("second".to_string()));
        let reservation = token.reserve();

        token.request_shutdown();
        assert!(!first.cancellation().is_cancelled());

        drop(reservation);
        assert!(first.cancellation().is_cancelled());
        assert!(second.cancellation().is_cancelled());
    }

    #[test]
    fn exiting_unit_terminates_every_sibling_exactly_once() {
        let token = Arc::new(TerminationToken::new());
        let units: Vec<_> = (0..4)
            .map(|index| token.register(Some(format!("unit-{index}"))))
            .collect();

        token.unit_terminated(units[0].id());
        token.unit_terminated(units[1].id());
        token.unit_terminated(units[2].id());

        assert_eq!(units[0].terminate_requests(), 0);
        for unit in &units[1..] {
            assert_eq!(unit.terminate_requests(), 1);
        }
        assert_eq!(token.registered_units(), 1);
    }

    #[test]
    fn stale_registry_entries_are_skipped() {
        let token = Arc::new(TerminationToken::new());
        let exiting = token.register(Some("exiting".to_string()));
        let dropped = token.register(None);
        let survivor = token.register(Some("survivor".to_string()));
        drop(dropped);

        token.unit_terminated(exiting.id());

        assert_eq!(survivor.terminate_requests(), 1);
        assert_eq!(token.registered_units(), 1);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn concurrent_reservations_balance_and_drain_once() {
        const THREADS: usize = 8;
        const ITERATIONS: usize = 1_000;

        let token = Arc::new(TerminationToken::new());
        let anchor = token.reserve();

        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let token = Arc::clone(&token);
                thread::spawn(move || {
                    for _ in 0..ITERATIONS {
                        let reservation = token.reserve();
                        assert!(token.reservations() >= 1);
                        drop(reservation);
                    }
                })
            })
            .collect();

        token.request_shutdown();
        drop(anchor);

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(token.reservations(), 0);
        assert!(token.wait_drained(Duration::ZERO));
        assert_eq!(token.drain_signal_count(), 1);
    }
}
