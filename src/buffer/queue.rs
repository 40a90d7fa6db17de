use parking_lot::Mutex;
use prometheus::IntCounter;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue is closed")]
    Closed,
    #[error("Queue is full")]
    Full,
}

/// What a full queue does with a new item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Suspend the producer until there is room.
    #[default]
    Block,
    /// Discard the incoming item.
    DropNewest,
    /// Evict the oldest queued item to make room.
    DropOldest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,
    DroppedNewest,
    DroppedOldest,
}

impl PushOutcome {
    pub fn dropped(self) -> bool {
        !matches!(self, PushOutcome::Enqueued)
    }
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    policy: BackpressurePolicy,
    readable: Notify,
    writable: Notify,
    senders: AtomicUsize,
    drops: IntCounter,
}

impl<T> Shared<T> {
    fn close(&self) {
        self.state.lock().closed = true;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }
}

/// Bounded multi-producer, single-consumer queue.
///
/// Every item discarded by a drop policy increments `drops`.
pub fn bounded<T>(
    capacity: usize,
    policy: BackpressurePolicy,
    drops: IntCounter,
) -> (QueueSender<T>, QueueReceiver<T>) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            items: VecDeque::with_capacity(capacity.min(4096)),
            closed: false,
        }),
        capacity,
        policy,
        readable: Notify::new(),
        writable: Notify::new(),
        senders: AtomicUsize::new(1),
        drops,
    });

    (
        QueueSender {
            shared: shared.clone(),
        },
        QueueReceiver { shared },
    )
}

pub struct QueueSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> QueueSender<T> {
    pub async fn send(&self, item: T) -> Result<PushOutcome, QueueError> {
        loop {
            let writable = self.shared.writable.notified();
            {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return Err(QueueError::Closed);
                }
                if state.items.len() < self.shared.capacity {
                    state.items.push_back(item);
                    drop(state);
                    self.shared.readable.notify_one();
                    return Ok(PushOutcome::Enqueued);
                }
                match self.shared.policy {
                    BackpressurePolicy::Block => {}
                    BackpressurePolicy::DropNewest => {
                        drop(state);
                        self.shared.drops.inc();
                        return Ok(PushOutcome::DroppedNewest);
                    }
                    BackpressurePolicy::DropOldest => {
                        state.items.pop_front();
                        state.items.push_back(item);
                        drop(state);
                        self.shared.drops.inc();
                        self.shared.readable.notify_one();
                        return Ok(PushOutcome::DroppedOldest);
                    }
                }
            }
            writable.await;
        }
    }

    /// Non-blocking send. Under `Block` a full queue yields `QueueError::Full`
    /// and the item is handed back to nobody, so callers should count it.
    pub fn try_send(&self, item: T) -> Result<PushOutcome, QueueError> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        if state.items.len() < self.shared.capacity {
            state.items.push_back(item);
            drop(state);
            self.shared.readable.notify_one();
            return Ok(PushOutcome::Enqueued);
        }
        match self.shared.policy {
            BackpressurePolicy::Block => Err(QueueError::Full),
            BackpressurePolicy::DropNewest => {
                drop(state);
                self.shared.drops.inc();
                Ok(PushOutcome::DroppedNewest)
            }
            BackpressurePolicy::DropOldest => {
                state.items.pop_front();
                state.items.push_back(item);
                drop(state);
                self.shared.drops.inc();
                self.shared.readable.notify_one();
                Ok(PushOutcome::DroppedOldest)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::Relaxed);
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for QueueSender<T> {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.close();
        }
    }
}

pub struct QueueReceiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> QueueReceiver<T> {
    /// Waits for the next item. Returns `None` once the queue is closed and
    /// every buffered item has been taken.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let readable = self.shared.readable.notified();
            {
                let mut state = self.shared.state.lock();
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    self.shared.writable.notify_one();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            readable.await;
        }
    }

    pub fn try_recv(&mut self) -> Option<T> {
        let item = self.shared.state.lock().items.pop_front();
        if item.is_some() {
            self.shared.writable.notify_one();
        }
        item
    }

    /// Stops accepting new items; already buffered items stay readable.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for QueueReceiver<T> {
    fn drop(&mut self) {
        self.shared.close();
    }
}
