//! Bounded multi-producer/multi-consumer queue connecting pipeline stages.
//!
//! Every stage writes into exactly one [`Queue`] and the next stage's worker
//! pool reads from it. Closing is not exposed publicly: a queue is closed by
//! the [`CloseGuard`](crate::counter::CloseGuard) of its last writer, so
//! readers see end-of-stream only after every writer has exited.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_core::Stream;
use tokio::sync::Notify;

use crate::error::{Error, Result, SendError, TrySendError};

struct State<T> {
    buffer: VecDeque<T>,
    closed: bool,
}

struct Shared<T> {
    name: String,
    capacity: usize,
    state: Mutex<State<T>>,
    readable: Notify,
    writable: Notify,
    sent: AtomicU64,
    received: AtomicU64,
    close_attempts: AtomicUsize,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // Nothing panics while the lock is held, so a poisoned state is still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A bounded FIFO shared between a writer group and a reader group.
///
/// Cloning is cheap and yields another handle to the same queue.
pub struct Queue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.shared.name)
            .field("capacity", &self.shared.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> Queue<T> {
    /// Create a new queue holding at most `capacity` items
    pub fn new(name: impl Into<String>, capacity: usize) -> Result<Self> {
        let name = name.into();
        if capacity == 0 {
            return Err(Error::InvalidCapacity { queue: name });
        }

        Ok(Self {
            shared: Arc::new(Shared {
                name,
                capacity,
                state: Mutex::new(State {
                    buffer: VecDeque::with_capacity(capacity.min(1024)),
                    closed: false,
                }),
                readable: Notify::new(),
                writable: Notify::new(),
                sent: AtomicU64::new(0),
                received: AtomicU64::new(0),
                close_attempts: AtomicUsize::new(0),
            }),
        })
    }

    /// A write-end for this queue
    pub fn sender(&self) -> Sender<T> {
        Sender {
            queue: self.clone(),
        }
    }

    /// A read-end for this queue
    pub fn receiver(&self) -> Receiver<T> {
        Receiver {
            queue: self.clone(),
        }
    }

    /// The queue's name, used in logs and errors
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Maximum number of buffered items
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Number of currently buffered items
    pub fn len(&self) -> usize {
        self.shared.lock().buffer.len()
    }

    /// Whether no items are buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue has been closed to writers
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Total number of items accepted by the queue
    pub fn sent(&self) -> u64 {
        self.shared.sent.load(Ordering::Relaxed)
    }

    /// Total number of items handed to readers
    pub fn received(&self) -> u64 {
        self.shared.received.load(Ordering::Relaxed)
    }

    /// How many times closing was attempted, successful or not.
    ///
    /// A correctly wired pipeline closes each queue exactly once.
    pub fn close_count(&self) -> usize {
        self.shared.close_attempts.load(Ordering::SeqCst)
    }

    /// Close the queue. Buffered items stay readable; further sends fail.
    pub(crate) fn close(&self) -> Result<()> {
        self.shared.close_attempts.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(Error::QueueAlreadyClosed(self.shared.name.clone()));
            }
            state.closed = true;
        }

        self.shared.readable.notify_waiters();
        self.shared.writable.notify_waiters();
        tracing::debug!(queue = %self.shared.name, "queue closed");
        Ok(())
    }

    fn record_sent(&self) {
        self.shared.sent.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::counter!("flowweld_queue_sent_total", "queue" => self.shared.name.clone())
            .increment(1);
    }

    fn record_received(&self) {
        self.shared.received.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::counter!("flowweld_queue_received_total", "queue" => self.shared.name.clone())
            .increment(1);
    }
}

/// The write-end of a [`Queue`].
pub struct Sender<T> {
    queue: Queue<T>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Sender").field(&self.queue).finish()
    }
}

impl<T> Sender<T> {
    /// Send an item, waiting while the queue is full.
    ///
    /// Fails only once the queue has been closed, returning the item.
    pub async fn send(&self, item: T) -> std::result::Result<(), SendError<T>> {
        let shared = &self.queue.shared;
        loop {
            let notified = shared.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = shared.lock();
                if state.closed {
                    return Err(SendError(item));
                }
                if state.buffer.len() < shared.capacity {
                    state.buffer.push_back(item);
                    drop(state);
                    self.queue.record_sent();
                    shared.readable.notify_one();
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    /// Send an item without waiting
    pub fn try_send(&self, item: T) -> std::result::Result<(), TrySendError<T>> {
        let shared = &self.queue.shared;
        let mut state = shared.lock();
        if state.closed {
            return Err(TrySendError::Closed(item));
        }
        if state.buffer.len() >= shared.capacity {
            return Err(TrySendError::Full(item));
        }
        state.buffer.push_back(item);
        drop(state);
        self.queue.record_sent();
        shared.readable.notify_one();
        Ok(())
    }

    /// Whether the underlying queue has been closed
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// The underlying queue
    pub fn queue(&self) -> &Queue<T> {
        &self.queue
    }
}

/// The read-end of a [`Queue`].
///
/// Clones share the same queue, so a worker pool can drain it cooperatively.
pub struct Receiver<T> {
    queue: Queue<T>,
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Receiver").field(&self.queue).finish()
    }
}

impl<T> Receiver<T> {
    /// Receive the next item, waiting while the queue is empty but open.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<T> {
        let shared = &self.queue.shared;
        loop {
            let notified = shared.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = shared.lock();
                if let Some(item) = state.buffer.pop_front() {
                    drop(state);
                    self.queue.record_received();
                    shared.writable.notify_one();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Receive an item if one is buffered
    pub fn try_recv(&self) -> Option<T> {
        let shared = &self.queue.shared;
        let item = shared.lock().buffer.pop_front()?;
        self.queue.record_received();
        shared.writable.notify_one();
        Some(item)
    }

    /// Drain the queue until it is closed, collecting every item
    pub async fn collect(&self) -> Vec<T> {
        let mut items = Vec::new();
        while let Some(item) = self.recv().await {
            items.push(item);
        }
        items
    }

    /// Adapt this read-end into a [`Stream`] that ends when the queue is
    /// closed and drained
    pub fn into_stream(self) -> impl Stream<Item = T>
    where
        T: Send + 'static,
    {
        futures::stream::unfold(self, |rx| async move {
            let item = rx.recv().await?;
            Some((item, rx))
        })
    }

    /// Whether the underlying queue has been closed
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// The underlying queue
    pub fn queue(&self) -> &Queue<T> {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[test]
    fn test_zero_capacity_rejected() {
        let err = Queue::<i32>::new("empty", 0).unwrap_err();
        assert!(matches!(err, Error::InvalidCapacity { .. }));
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = Queue::new("fifo", 8).unwrap();
        let tx = queue.sender();
        let rx = queue.receiver();

        for i in 0..5 {
            tx.send(i).await.unwrap();
        }
        queue.close().unwrap();

        assert_eq!(rx.collect().await, vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.sent(), 5);
        assert_eq!(queue.received(), 5);
    }

    #[tokio::test]
    async fn test_send_after_close_returns_item() {
        let queue = Queue::new("closed", 2).unwrap();
        queue.close().unwrap();

        let err = queue.sender().send(7).await.unwrap_err();
        assert_eq!(err.into_inner(), 7);
        assert!(matches!(
            queue.sender().try_send(8),
            Err(TrySendError::Closed(8))
        ));
    }

    #[tokio::test]
    async fn test_second_close_is_rejected() {
        let queue = Queue::<u8>::new("twice", 1).unwrap();
        queue.close().unwrap();
        assert!(matches!(
            queue.close(),
            Err(Error::QueueAlreadyClosed(name)) if name == "twice"
        ));
        assert_eq!(queue.close_count(), 2);
    }

    #[tokio::test]
    async fn test_try_send_full() {
        let queue = Queue::new("full", 1).unwrap();
        let tx = queue.sender();
        tx.try_send(1).unwrap();
        assert!(matches!(tx.try_send(2), Err(TrySendError::Full(2))));
        assert_eq!(queue.receiver().try_recv(), Some(1));
        assert_eq!(queue.receiver().try_recv(), None);
    }

    #[tokio::test]
    async fn test_send_blocks_until_space() {
        let queue = Queue::new("backpressure", 1).unwrap();
        let tx = queue.sender();
        let rx = queue.receiver();
        tx.send(1).await.unwrap();

        let blocked = tokio::spawn({
            let tx = tx.clone();
            async move { tx.send(2).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        assert_eq!(rx.recv().await, Some(1));
        blocked.await.unwrap().unwrap();
        assert_eq!(rx.recv().await, Some(2));
    }

    #[test]
    fn test_pending_send_woken_by_recv() {
        let queue = Queue::new("poll", 1).unwrap();
        let tx = queue.sender();
        let rx = queue.receiver();
        tx.try_send(1).unwrap();

        let mut send = tokio_test::task::spawn(tx.send(2));
        tokio_test::assert_pending!(send.poll());

        assert_eq!(rx.try_recv(), Some(1));
        assert!(send.is_woken());
        tokio_test::assert_ready_ok!(send.poll());
        assert_eq!(rx.try_recv(), Some(2));
    }

    #[test]
    fn test_pending_recv_woken_by_close() {
        let queue = Queue::<u8>::new("poll-close", 1).unwrap();
        let rx = queue.receiver();

        let mut recv = tokio_test::task::spawn(rx.recv());
        tokio_test::assert_pending!(recv.poll());

        queue.close().unwrap();
        assert!(recv.is_woken());
        assert_eq!(tokio_test::assert_ready!(recv.poll()), None);
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_readers() {
        let queue = Queue::<i32>::new("wake", 4).unwrap();
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let rx = queue.receiver();
                tokio::spawn(async move { rx.recv().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close().unwrap();

        for reader in readers {
            assert_eq!(reader.await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_close_keeps_buffered_items() {
        let queue = Queue::new("drain", 4).unwrap();
        queue.sender().send("a").await.unwrap();
        queue.sender().send("b").await.unwrap();
        queue.close().unwrap();

        let items: Vec<_> = queue.receiver().into_stream().collect().await;
        assert_eq!(items, vec!["a", "b"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_writers_many_readers() {
        let queue = Queue::new("mpmc", 16).unwrap();

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let tx = queue.sender();
                tokio::spawn(async move {
                    for i in 0..250 {
                        tx.send(w * 1000 + i).await.unwrap();
                    }
                })
            })
            .collect();
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let rx = queue.receiver();
                tokio::spawn(async move { rx.collect().await })
            })
            .collect();

        for writer in writers {
            writer.await.unwrap();
        }
        queue.close().unwrap();

        let mut all = Vec::new();
        for reader in readers {
            all.extend(reader.await.unwrap());
        }
        all.sort();
        let mut expected: Vec<_> = (0..4)
            .flat_map(|w| (0..250).map(move |i| w * 1000 + i))
            .collect();
        expected.sort();
        assert_eq!(all, expected);
    }
}
