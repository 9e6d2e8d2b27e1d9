//! Bounded single-producer/single-consumer queue with drop-oldest
//! overwrite and a wake-on-close sentinel.
//!
//! The producer is the path's stream dispatcher and must never block; the
//! consumer is a reader pipeline's pump loop, which blocks on `pull` until
//! an item arrives or the buffer is closed.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

pub struct RingBuffer<T> {
    queue: ArrayQueue<T>,
    notify: Notify,
    closed: AtomicBool,
}

impl<T> RingBuffer<T> {
    /// `capacity` should be a power of two if the caller relies on index
    /// masking elsewhere; `ArrayQueue` itself accepts any non-zero size.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Never blocks. When full, drops the oldest entry to make room.
    pub fn push(&self, item: T) {
        if let Err(item) = self.queue.push(item) {
            let _ = self.queue.pop();
            // The slot we just freed can race with another producer only if
            // this buffer is used MPSC, which it isn't; push back is safe.
            let _ = self.queue.push(item);
        }
        self.notify.notify_one();
    }

    /// Blocks until an item is available or the buffer closes. Returns
    /// `None` after closure, once per waiter, matching `Pull() -> (_, false)`.
    pub async fn pull(&self) -> Option<T> {
        loop {
            if let Some(item) = self.queue.pop() {
                return Some(item);
            }
            if self.closed.load(Ordering::Acquire) {
                return self.queue.pop();
            }
            let notified = self.notify.notified();
            // Re-check between registering interest and awaiting it to
            // avoid missing a push/close that happened concurrently.
            if let Some(item) = self.queue.pop() {
                return Some(item);
            }
            if self.closed.load(Ordering::Acquire) {
                return self.queue.pop();
            }
            notified.await;
        }
    }

    /// Idempotent; wakes every pending and future waiter.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn push_overwrites_oldest_when_full() {
        let buf = RingBuffer::new(2);
        buf.push(1);
        buf.push(2);
        buf.push(3);
        assert_eq!(buf.queue.pop(), Some(2));
        assert_eq!(buf.queue.pop(), Some(3));
        assert_eq!(buf.queue.pop(), None);
    }

    #[tokio::test]
    async fn pull_blocks_until_pushed() {
        let buf = Arc::new(RingBuffer::new(4));
        let buf2 = buf.clone();
        let handle = tokio::spawn(async move { buf2.pull().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        buf.push(42);

        assert_eq!(handle.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn close_wakes_waiter_with_none() {
        let buf = Arc::new(RingBuffer::<u32>::new(4));
        let buf2 = buf.clone();
        let handle = tokio::spawn(async move { buf2.pull().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        buf.close();

        assert_eq!(handle.await.unwrap(), None);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let buf = RingBuffer::<u32>::new(4);
        buf.close();
        buf.close();
        assert!(buf.is_closed());
        assert_eq!(buf.pull().await, None);
    }
}
