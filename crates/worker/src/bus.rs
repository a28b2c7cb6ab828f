//! Bounded drop-oldest handoff between pipeline stages.
//!
//! Single producer, single consumer. When the queue is full the oldest
//! unread entry is evicted before the new one goes in: the pipeline favors
//! recency over completeness, so a slow stage sees fresh frames, not a
//! growing backlog. `produced == delivered + dropped + depth` holds at
//! every instant.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

pub const DEFAULT_CAPACITY: usize = 4;

/// Raised on push after the consumer side has gone away.
#[derive(Debug, thiserror::Error)]
#[error("pipeline halted: bus consumer closed")]
pub struct PipelineHalted;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusCounters {
    pub produced: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub depth: usize,
}

struct BusState<T> {
    queue: VecDeque<T>,
    producer_closed: bool,
    consumer_closed: bool,
}

struct Shared<T> {
    state: Mutex<BusState<T>>,
    notify: Notify,
    capacity: usize,
    produced: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

pub struct BusSender<T> {
    shared: Arc<Shared<T>>,
}

pub struct BusReceiver<T> {
    shared: Arc<Shared<T>>,
}

/// Create a bus with the given capacity (clamped to >= 1).
pub fn bus<T>(capacity: usize) -> (BusSender<T>, BusReceiver<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(BusState {
            queue: VecDeque::new(),
            producer_closed: false,
            consumer_closed: false,
        }),
        notify: Notify::new(),
        capacity: capacity.max(1),
        produced: AtomicU64::new(0),
        delivered: AtomicU64::new(0),
        dropped: AtomicU64::new(0),
    });
    (
        BusSender {
            shared: Arc::clone(&shared),
        },
        BusReceiver { shared },
    )
}

impl<T> BusSender<T> {
    /// Enqueue an item, evicting the oldest unread one when full.
    /// Callable from sync contexts (GStreamer callbacks).
    pub fn push(&self, item: T) -> Result<(), PipelineHalted> {
        {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.consumer_closed {
                return Err(PipelineHalted);
            }
            if state.queue.len() == self.shared.capacity {
                state.queue.pop_front();
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
            state.queue.push_back(item);
            self.shared.produced.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    pub fn counters(&self) -> BusCounters {
        self.shared.counters()
    }
}

impl<T> Drop for BusSender<T> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        state.producer_closed = true;
        drop(state);
        // Wake a consumer parked in pop() so it observes end-of-stream
        self.shared.notify.notify_one();
    }
}

impl<T> BusReceiver<T> {
    /// Dequeue the next item in FIFO order.
    /// Returns None once the producer is gone and the queue is drained.
    pub async fn pop(&mut self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(item) = state.queue.pop_front() {
                    self.shared.delivered.fetch_add(1, Ordering::Relaxed);
                    return Some(item);
                }
                if state.producer_closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn counters(&self) -> BusCounters {
        self.shared.counters()
    }
}

impl<T> Drop for BusReceiver<T> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        state.consumer_closed = true;
        state.queue.clear();
    }
}

impl<T> Shared<T> {
    fn counters(&self) -> BusCounters {
        let depth = self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .queue
            .len();
        BusCounters {
            produced: self.produced.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            depth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_order_preserved() {
        let (tx, mut rx) = bus(4);
        for i in 0..3 {
            tx.push(i).unwrap();
        }
        assert_eq!(rx.pop().await, Some(0));
        assert_eq!(rx.pop().await, Some(1));
        assert_eq!(rx.pop().await, Some(2));
    }

    #[tokio::test]
    async fn full_bus_evicts_oldest() {
        let (tx, mut rx) = bus(2);
        tx.push(1).unwrap();
        tx.push(2).unwrap();
        tx.push(3).unwrap(); // evicts 1
        assert_eq!(rx.pop().await, Some(2));
        assert_eq!(rx.pop().await, Some(3));

        let c = tx.counters();
        assert_eq!(c.produced, 3);
        assert_eq!(c.delivered, 2);
        assert_eq!(c.dropped, 1);
        assert_eq!(c.depth, 0);
    }

    #[tokio::test]
    async fn conservation_law_holds_mid_stream() {
        let (tx, mut rx) = bus(4);
        for i in 0..10 {
            tx.push(i).unwrap();
        }
        rx.pop().await.unwrap();
        rx.pop().await.unwrap();

        let c = tx.counters();
        assert_eq!(c.produced, c.delivered + c.dropped + c.depth as u64);
        assert_eq!(c.produced, 10);
        assert_eq!(c.delivered, 2);
        assert_eq!(c.dropped, 6);
        assert_eq!(c.depth, 2);
    }

    #[tokio::test]
    async fn producer_close_signals_end_of_stream() {
        let (tx, mut rx) = bus(4);
        tx.push(7).unwrap();
        drop(tx);
        assert_eq!(rx.pop().await, Some(7));
        assert_eq!(rx.pop().await, None);
    }

    #[tokio::test]
    async fn consumer_close_halts_producer() {
        let (tx, rx) = bus(4);
        tx.push(1).unwrap();
        drop(rx);
        assert!(tx.push(2).is_err());
        assert!(tx.push(3).is_err());
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let (tx, mut rx) = bus::<u32>(2);
        let waiter = tokio::spawn(async move { rx.pop().await });
        // Give the waiter a chance to park first
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        tx.push(42).unwrap();
        assert_eq!(waiter.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn capacity_one_fast_producer() {
        // Producer twice as fast as the consumer: delivered equals the
        // consumer's pull count, dropped equals produced - delivered - depth.
        let (tx, mut rx) = bus(1);
        let mut pulled = Vec::new();
        for i in 0..20 {
            tx.push(i).unwrap();
            tx.push(100 + i).unwrap();
            pulled.push(rx.pop().await.unwrap());
        }
        let c = tx.counters();
        assert_eq!(c.produced, 40);
        assert_eq!(c.delivered, pulled.len() as u64);
        assert_eq!(c.dropped, c.produced - c.delivered - c.depth as u64);
    }
}
