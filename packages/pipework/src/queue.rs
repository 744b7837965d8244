//! Work queues with cancellable blocking put and take.

use std::num::NonZero;

use crossbeam::channel::{self, Receiver, SendError, Sender, TrySendError};
use crossbeam::select;

use crate::{Cancellation, Cancelled};

/// The kind of queue placed in front of a dedicated worker.
///
/// The queue kind governs backpressure:
///
/// * [`Rendezvous`][Self::Rendezvous] blocks a producer until a consumer is ready to take the
///   item. At most one item per worker is ever in flight.
/// * [`Bounded`][Self::Bounded] blocks a producer once the queue holds the given number of items.
/// * [`Unbounded`][Self::Unbounded] never blocks a producer but places no limit on the memory
///   consumed by queued items.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum QueueKind {
    /// Zero-capacity hand-off queue.
    #[default]
    Rendezvous,

    /// Queue holding at most the given number of items.
    Bounded(NonZero<usize>),

    /// Queue without a capacity limit.
    Unbounded,
}

impl QueueKind {
    pub(crate) fn channel<T>(self) -> (Sender<T>, Receiver<T>) {
        match self {
            Self::Rendezvous => channel::bounded(0),
            Self::Bounded(capacity) => channel::bounded(capacity.get()),
            Self::Unbounded => channel::unbounded(),
        }
    }
}

#[derive(Debug)]
pub(crate) enum PutError<T> {
    Cancelled,

    /// Every consumer is gone. The item is handed back.
    Closed(T),
}

/// Places an item on the queue, blocking while the queue has no capacity.
pub(crate) fn put<T>(
    sender: &Sender<T>,
    item: T,
    cancellation: &Cancellation,
) -> Result<(), PutError<T>> {
    if cancellation.is_cancelled() {
        return Err(PutError::Cancelled);
    }

    let item = match sender.try_send(item) {
        Ok(()) => return Ok(()),
        Err(TrySendError::Disconnected(item)) => return Err(PutError::Closed(item)),
        Err(TrySendError::Full(item)) => item,
    };

    select! {
        send(sender, item) -> result => result.map_err(|SendError(item)| PutError::Closed(item)),
        recv(cancellation.observer()) -> _ => Err(PutError::Cancelled),
    }
}

/// Takes the next item from the queue, blocking while the queue is empty.
///
/// Returns `Ok(None)` once every producer is gone and the queue is drained.
pub(crate) fn take<T>(
    receiver: &Receiver<T>,
    cancellation: &Cancellation,
) -> Result<Option<T>, Cancelled> {
    cancellation.check()?;

    select! {
        recv(receiver) -> item => Ok(item.ok()),
        recv(cancellation.observer()) -> _ => Err(Cancelled),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::CancellationSource;

    #[test]
    fn default_is_rendezvous() {
        assert_eq!(QueueKind::default(), QueueKind::Rendezvous);
    }

    #[test]
    fn bounded_queue_accepts_up_to_capacity() {
        let (sender, receiver) = QueueKind::Bounded(NonZero::new(2).unwrap()).channel::<u32>();

        assert!(sender.try_send(1).is_ok());
        assert!(sender.try_send(2).is_ok());
        assert!(sender.try_send(3).is_err());
        assert_eq!(receiver.len(), 2);
    }

    #[test]
    fn put_then_take_delivers_item() {
        let (sender, receiver) = QueueKind::Unbounded.channel::<u32>();
        let cancellation = Cancellation::never();

        put(&sender, 5, &cancellation).unwrap();

        assert_eq!(take(&receiver, &cancellation).unwrap(), Some(5));
    }

    #[test]
    fn put_to_closed_queue_returns_item() {
        let (sender, receiver) = QueueKind::Unbounded.channel::<u32>();
        drop(receiver);

        let result = put(&sender, 9, &Cancellation::never());

        assert!(matches!(result, Err(PutError::Closed(9))));
    }

    #[test]
    fn take_from_closed_queue_returns_none() {
        let (sender, receiver) = QueueKind::Unbounded.channel::<u32>();
        drop(sender);

        assert_eq!(take(&receiver, &Cancellation::never()).unwrap(), None);
    }

    #[test]
    fn take_with_raised_signal_is_cancelled() {
        let (_sender, receiver) = QueueKind::Unbounded.channel::<u32>();
        let source = CancellationSource::new();
        source.cancel();

        assert_eq!(take(&receiver, &source.cancellation()), Err(Cancelled));
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn blocked_rendezvous_put_is_woken_by_cancel() {
        let (sender, _receiver) = QueueKind::Rendezvous.channel::<u32>();
        let source = CancellationSource::new();
        let cancellation = source.cancellation();

        let producer = thread::spawn(move || put(&sender, 1, &cancellation));

        thread::sleep(Duration::from_millis(20));
        source.cancel();

        assert!(matches!(producer.join().unwrap(), Err(PutError::Cancelled)));
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn blocked_take_is_woken_by_cancel() {
        let (_sender, receiver) = QueueKind::Rendezvous.channel::<u32>();
        let source = CancellationSource::new();
        let cancellation = source.cancellation();

        let consumer = thread::spawn(move || take(&receiver, &cancellation));

        thread::sleep(Duration::from_millis(20));
        source.cancel();

        assert_eq!(consumer.join().unwrap(), Err(Cancelled));
    }
}
