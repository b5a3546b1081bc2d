//! Bounded outbound queue with an idempotent close.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Bounded FIFO feeding one writer task.
///
/// Enqueueing never blocks. When [`try_send`](Self::try_send) returns `false`
/// the caller decides what happens to the connection; the queue itself only
/// reports. Closing drops the sender so the writer drains what is left and
/// then sees the end of the stream.
#[derive(Debug)]
pub struct OutboundQueue<T> {
    sender: Mutex<Option<mpsc::Sender<T>>>,
    closed: AtomicBool,
}

impl<T> OutboundQueue<T> {
    /// Create a queue and the receiver its writer task consumes.
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender: Mutex::new(Some(tx)),
                closed: AtomicBool::new(false),
            },
            rx,
        )
    }

    /// Enqueue without waiting. Returns `false` if the queue is full or closed.
    pub fn try_send(&self, item: T) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match self.sender.lock().as_ref() {
            Some(tx) => tx.try_send(item).is_ok(),
            None => false,
        }
    }

    /// Close the queue. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.sender.lock().take();
        true
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of items waiting for the writer.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.sender
            .lock()
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let (queue, mut rx) = OutboundQueue::bounded(4);
        assert!(queue.try_send(1));
        assert!(queue.try_send(2));
        assert!(queue.try_send(3));
        assert_eq!(queue.pending(), 3);

        assert_eq!(rx.try_recv().unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap(), 2);
        assert_eq!(rx.try_recv().unwrap(), 3);
    }

    #[test]
    fn test_full_queue_rejects() {
        let (queue, mut rx) = OutboundQueue::bounded(2);
        assert!(queue.try_send("a"));
        assert!(queue.try_send("b"));
        assert!(!queue.try_send("c"));

        rx.try_recv().unwrap();
        assert!(queue.try_send("c"));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (queue, _rx) = OutboundQueue::<u8>::bounded(2);
        assert!(queue.close());
        assert!(!queue.close());
        assert!(!queue.close());
        assert!(queue.is_closed());
        assert!(!queue.try_send(1));
    }

    #[tokio::test]
    async fn test_close_lets_writer_drain() {
        let (queue, mut rx) = OutboundQueue::bounded(4);
        queue.try_send("first");
        queue.try_send("second");
        queue.close();

        assert_eq!(rx.recv().await, Some("first"));
        assert_eq!(rx.recv().await, Some("second"));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_dropped_receiver() {
        let (queue, rx) = OutboundQueue::bounded(4);
        drop(rx);
        assert!(!queue.try_send(1));
        assert!(!queue.is_closed());
    }
}
