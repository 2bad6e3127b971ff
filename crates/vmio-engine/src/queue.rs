//! Closeable bounded queue
//!
//! A FIFO supporting cancellation: once closed, pending items are
//! dropped and both blocked producers and consumers fail with
//! [`Closed`]. This makes it easy to cancel a group of workers waiting
//! on the queue.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Returned when accessing a closed queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Closed;

impl std::fmt::Display for Closed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "queue is closed")
    }
}

impl std::error::Error for Closed {}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded multi-producer multi-consumer queue.
pub struct Queue<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    // Waiters for a free slot and for an available item.
    space: Notify,
    items: Notify,
}

impl<T> Queue<T> {
    /// Create a queue holding up to `capacity` items.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            space: Notify::new(),
            items: Notify::new(),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Add an item, waiting while the queue is full.
    pub async fn put(&self, item: T) -> Result<(), Closed> {
        let mut item = Some(item);
        loop {
            // Register for wakeups before checking state so a wakeup
            // between the check and the await is not lost.
            let notified = self.space.notified();
            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(Closed);
                }
                if state.items.len() < self.capacity {
                    state.items.push_back(item.take().expect("item consumed twice"));
                    drop(state);
                    self.items.notify_one();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Remove the oldest item, waiting while the queue is empty.
    pub async fn get(&self) -> Result<T, Closed> {
        loop {
            let notified = self.items.notified();
            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(Closed);
                }
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    self.space.notify_one();
                    return Ok(item);
                }
            }
            notified.await;
        }
    }

    /// Close the queue, dropping pending items and waking all blocked
    /// producers and consumers.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.items.clear();
        }
        self.space.notify_waiters();
        self.items.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = Queue::new(4);
        queue.put(1).await.unwrap();
        queue.put(2).await.unwrap();
        queue.put(3).await.unwrap();
        assert_eq!(queue.get().await, Ok(1));
        assert_eq!(queue.get().await, Ok(2));
        assert_eq!(queue.get().await, Ok(3));
    }

    #[tokio::test]
    async fn test_put_blocks_when_full() {
        let queue = Arc::new(Queue::new(1));
        queue.put(1).await.unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.put(2).await })
        };

        // The producer cannot finish until we make room.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!producer.is_finished());

        assert_eq!(queue.get().await, Ok(1));
        producer.await.unwrap().unwrap();
        assert_eq!(queue.get().await, Ok(2));
    }

    #[tokio::test]
    async fn test_close_wakes_consumers() {
        let queue = Arc::new(Queue::<i32>::new(1));

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { queue.get().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        for consumer in consumers {
            assert_eq!(consumer.await.unwrap(), Err(Closed));
        }
    }

    #[tokio::test]
    async fn test_close_wakes_producers() {
        let queue = Arc::new(Queue::new(1));
        queue.put(1).await.unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.put(2).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();
        assert_eq!(producer.await.unwrap(), Err(Closed));
    }

    #[tokio::test]
    async fn test_closed_queue_drops_items() {
        let queue = Queue::new(4);
        queue.put(1).await.unwrap();
        queue.close();
        assert!(queue.is_closed());
        assert_eq!(queue.get().await, Err(Closed));
        assert_eq!(queue.put(2).await, Err(Closed));
    }
}
