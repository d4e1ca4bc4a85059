//! Bounded lease queue of ready nodes

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::node::Node;

/// FIFO of running nodes with blocking pop and push
///
/// Safe for any number of concurrent callers. Nodes are shared, not moved:
/// the pool keeps its own `Arc` for shutdown.
#[derive(Debug)]
pub struct LeaseQueue {
    items: Mutex<VecDeque<Arc<Node>>>,
    capacity: AtomicUsize,
    readable: Notify,
    writable: Notify,
}

impl LeaseQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity: AtomicUsize::new(capacity.max(1)),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Wait until a node is available and remove it
    pub async fn pop(&self) -> Arc<Node> {
        loop {
            let notified = self.readable.notified();
            if let Some(node) = self.try_pop() {
                return node;
            }
            notified.await;
        }
    }

    pub fn try_pop(&self) -> Option<Arc<Node>> {
        let node = self.items.lock().pop_front();
        if node.is_some() {
            self.writable.notify_one();
        }
        node
    }

    /// Wait for a free slot and append the node
    pub async fn push(&self, node: Arc<Node>) {
        let mut node = node;
        loop {
            let notified = self.writable.notified();
            match self.try_push(node) {
                Ok(()) => return,
                Err(rejected) => node = rejected,
            }
            notified.await;
        }
    }

    /// Append without waiting; hands the node back when full
    pub fn try_push(&self, node: Arc<Node>) -> Result<(), Arc<Node>> {
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity() {
                return Err(node);
            }
            items.push_back(node);
        }
        self.readable.notify_one();
        Ok(())
    }

    /// Return a leased node regardless of capacity
    ///
    /// The slot was freed when the node was popped, so this only overshoots
    /// when callers `push` nodes they never leased.
    pub(crate) fn push_returned(&self, node: Arc<Node>) {
        self.items.lock().push_back(node);
        self.readable.notify_one();
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    /// Resize; queued nodes are kept even past the new bound
    pub(crate) fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity.max(1), Ordering::SeqCst);
        self.writable.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn node(port: u16) -> Arc<Node> {
        Arc::new(Node::parse(&format!("trojan://pw@example.com:{}", port)).unwrap())
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = LeaseQueue::new(4);
        queue.push(node(1)).await;
        queue.push(node(2)).await;

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().await.port(), 1);
        assert_eq!(queue.pop().await.port(), 2);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(LeaseQueue::new(1));

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await.port() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.push(node(7)).await;
        assert_eq!(waiter.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_push_waits_for_free_slot() {
        let queue = Arc::new(LeaseQueue::new(1));
        queue.push(node(1)).await;
        assert!(queue.try_push(node(2)).is_err());

        let pusher = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(node(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pusher.is_finished());

        assert_eq!(queue.pop().await.port(), 1);
        pusher.await.unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_set_capacity_releases_blocked_push() {
        let queue = Arc::new(LeaseQueue::new(1));
        queue.push(node(1)).await;

        let pusher = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(node(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.set_capacity(2);
        tokio::time::timeout(Duration::from_secs(1), pusher)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.capacity(), 2);
    }
}
