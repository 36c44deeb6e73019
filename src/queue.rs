//! FIFO queue of requests awaiting concurrency budget.

use std::collections::VecDeque;
use std::time::Instant;

use tokio::sync::oneshot;

use crate::error::CallResult;
use crate::key::DedupKey;
use crate::transport::HttpRequest;

/// A request parked until budget frees up.
pub(crate) struct QueuedCall {
    pub waiter_id: u64,
    pub key: Option<DedupKey>,
    pub request: HttpRequest,
    pub tx: oneshot::Sender<CallResult>,
    pub enqueued_at: Instant,
}

/// Rejection when the queue is at capacity.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QueueFull {
    pub current: usize,
    pub max: usize,
}

/// Bounded FIFO across all dedup keys. Promotion order is strict arrival
/// order; a caller that gives up is removed in place.
pub(crate) struct PendingQueue {
    calls: VecDeque<QueuedCall>,
    max_pending: usize,
}

impl PendingQueue {
    pub fn new(max_pending: usize) -> Self {
        Self { calls: VecDeque::new(), max_pending }
    }

    /// Append a call. Returns the new depth, or rejects at capacity.
    pub fn push(&mut self, call: QueuedCall) -> Result<usize, QueueFull> {
        if self.calls.len() >= self.max_pending {
            return Err(QueueFull { current: self.calls.len(), max: self.max_pending });
        }
        self.calls.push_back(call);
        Ok(self.calls.len())
    }

    /// The longest-waiting call, left in place.
    pub fn peek(&self) -> Option<&QueuedCall> {
        self.calls.front()
    }

    /// Remove and return the longest-waiting call.
    pub fn pop(&mut self) -> Option<QueuedCall> {
        self.calls.pop_front()
    }

    /// Remove a parked call by waiter id, preserving order of the rest.
    pub fn remove(&mut self, waiter_id: u64) -> Option<QueuedCall> {
        let idx = self.calls.iter().position(|c| c.waiter_id == waiter_id)?;
        self.calls.remove(idx)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::HttpMethod;

    fn queued(waiter_id: u64) -> QueuedCall {
        let (tx, _rx) = oneshot::channel();
        QueuedCall {
            waiter_id,
            key: None,
            request: HttpRequest::new(HttpMethod::Get, "https://example.com"),
            tx,
            enqueued_at: Instant::now(),
        }
    }

    #[test]
    fn pops_in_arrival_order() {
        let mut queue = PendingQueue::new(8);
        for id in 1..=3 {
            queue.push(queued(id)).unwrap();
        }
        assert_eq!(queue.peek().unwrap().waiter_id, 1);
        assert_eq!(queue.pop().unwrap().waiter_id, 1);
        assert_eq!(queue.pop().unwrap().waiter_id, 2);
        assert_eq!(queue.pop().unwrap().waiter_id, 3);
        assert!(queue.peek().is_none());
        assert!(queue.pop().is_none());
    }

    #[test]
    fn rejects_at_capacity() {
        let mut queue = PendingQueue::new(2);
        queue.push(queued(1)).unwrap();
        queue.push(queued(2)).unwrap();
        let full = queue.push(queued(3)).unwrap_err();
        assert_eq!(full.current, 2);
        assert_eq!(full.max, 2);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn removes_by_waiter_id_preserving_order() {
        let mut queue = PendingQueue::new(8);
        for id in 1..=3 {
            queue.push(queued(id)).unwrap();
        }
        assert!(queue.remove(2).is_some());
        assert!(queue.remove(2).is_none());
        assert_eq!(queue.pop().unwrap().waiter_id, 1);
        assert_eq!(queue.pop().unwrap().waiter_id, 3);
        assert_eq!(queue.len(), 0);
    }
}
