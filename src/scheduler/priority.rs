//! Request prioritization with FIFO ordering inside each level.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};

/// Priority level for scheduled requests. Lower value = served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
    Background = 4,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl Priority {
    pub fn name(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
            Self::Background => "background",
        }
    }
}

impl From<u8> for Priority {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Critical,
            1 => Self::High,
            2 => Self::Normal,
            3 => Self::Low,
            _ => Self::Background,
        }
    }
}

/// Item with priority and enqueue sequence for heap ordering.
#[derive(Debug)]
struct PrioritizedItem<T> {
    priority: Priority,
    sequence: u64,
    item: T,
}

impl<T> PartialEq for PrioritizedItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl<T> Eq for PrioritizedItem<T> {}

impl<T> PartialOrd for PrioritizedItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for PrioritizedItem<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: invert so the lowest (priority, sequence) pops first.
        match (other.priority as u8).cmp(&(self.priority as u8)) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            ord => ord,
        }
    }
}

/// Plain (non-async) priority queue. FIFO within a level via a
/// monotonic enqueue sequence.
pub struct PriorityQueue<T> {
    heap: BinaryHeap<PrioritizedItem<T>>,
    next_sequence: u64,
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_sequence: 0,
        }
    }

    pub fn push(&mut self, item: T, priority: Priority) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(PrioritizedItem { priority, sequence, item });
    }

    pub fn pop(&mut self) -> Option<T> {
        self.heap.pop().map(|p| p.item)
    }

    pub fn peek_priority(&self) -> Option<Priority> {
        self.heap.peek().map(|p| p.priority)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("priority queue is empty")]
    Empty,
}

/// Counters exposed by [`AsyncPriorityQueue::metrics`].
#[derive(Debug, Clone, Serialize)]
pub struct QueueMetrics {
    pub current_size: usize,
    pub max_size: Option<usize>,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub priority_counts: HashMap<&'static str, u64>,
}

struct QueueState<T> {
    queue: PriorityQueue<T>,
    total_enqueued: u64,
    total_dequeued: u64,
    priority_counts: HashMap<&'static str, u64>,
}

/// Async priority queue used for admission control.
///
/// `put` blocks when the queue is bounded and full; `get` blocks when
/// empty. Both are cancel-safe suspension points for shutdown.
pub struct AsyncPriorityQueue<T> {
    state: Mutex<QueueState<T>>,
    max_size: Option<usize>,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> AsyncPriorityQueue<T> {
    /// Unbounded queue.
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// Bounded queue; `put` awaits space once `max_size` items queue up.
    pub fn bounded(max_size: usize) -> Self {
        Self::with_capacity(Some(max_size))
    }

    fn with_capacity(max_size: Option<usize>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: PriorityQueue::new(),
                total_enqueued: 0,
                total_dequeued: 0,
                priority_counts: HashMap::new(),
            }),
            max_size,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Enqueue an item, waiting for space if the queue is bounded and full.
    pub async fn put(&self, item: T, priority: Priority) {
        let mut item = Some(item);
        loop {
            let notified = self.not_full.notified();
            {
                let mut state = self.state.lock().await;
                let full = self
                    .max_size
                    .map(|max| state.queue.len() >= max)
                    .unwrap_or(false);
                if !full {
                    let item = item.take().expect("put item consumed twice");
                    state.queue.push(item, priority);
                    state.total_enqueued += 1;
                    *state.priority_counts.entry(priority.name()).or_insert(0) += 1;
                    drop(state);
                    self.not_empty.notify_one();
                    return;
                }
            }
            notified.await;
        }
    }

    /// Dequeue the highest-priority item, waiting while empty.
    pub async fn get(&self) -> T {
        loop {
            let notified = self.not_empty.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(item) = state.queue.pop() {
                    state.total_dequeued += 1;
                    drop(state);
                    self.not_full.notify_one();
                    return item;
                }
            }
            notified.await;
        }
    }

    /// Dequeue without waiting. The pop happens under the same lock as
    /// the emptiness check, so an observed-nonempty-then-emptied race
    /// surfaces as `Err(Empty)`, never a panic.
    pub async fn try_get(&self) -> Result<T, QueueError> {
        let mut state = self.state.lock().await;
        match state.queue.pop() {
            Some(item) => {
                state.total_dequeued += 1;
                drop(state);
                self.not_full.notify_one();
                Ok(item)
            }
            None => Err(QueueError::Empty),
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.queue.is_empty()
    }

    /// Priority of the next item without removing it.
    pub async fn peek_priority(&self) -> Option<Priority> {
        self.state.lock().await.queue.peek_priority()
    }

    /// Drop all queued items.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.queue.clear();
        drop(state);
        self.not_full.notify_waiters();
    }

    pub async fn metrics(&self) -> QueueMetrics {
        let state = self.state.lock().await;
        QueueMetrics {
            current_size: state.queue.len(),
            max_size: self.max_size,
            total_enqueued: state.total_enqueued,
            total_dequeued: state.total_dequeued,
            priority_counts: state.priority_counts.clone(),
        }
    }
}

impl<T> Default for AsyncPriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
