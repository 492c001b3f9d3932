//! Unbounded FIFO of pending operations

use super::PendingOperation;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

/// Operation queue shared by producers and the processor
#[derive(Default)]
pub struct OperationQueue {
    items: Mutex<VecDeque<Box<dyn PendingOperation>>>,
    available: Condvar,
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("len", &self.len())
            .finish()
    }
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation.
    ///
    /// A removal first discards every queued operation made obsolete by it.
    pub fn enqueue(&self, operation: Box<dyn PendingOperation>) {
        let mut items = self.items.lock();
        if let Some(resource) = operation.removed_resource() {
            let before = items.len();
            items.retain(|queued| !queued.should_drop_on_resource_removal(resource));
            let dropped = before - items.len();
            if dropped > 0 {
                debug!(resource, dropped, "Dropped operations for removed resource");
            }
        }
        items.push_back(operation);
        self.available.notify_one();
    }

    /// Next operation, waiting up to `timeout`; `None` on expiry
    pub fn dequeue(&self, timeout: Duration) -> Option<Box<dyn PendingOperation>> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();
        loop {
            if let Some(operation) = items.pop_front() {
                return Some(operation);
            }
            if self.available.wait_until(&mut items, deadline).timed_out() {
                return items.pop_front();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use std::sync::Arc;

    struct Named {
        name: &'static str,
        resource: &'static str,
        removes: bool,
    }

    impl PendingOperation for Named {
        fn kind(&self) -> &'static str {
            self.name
        }

        fn execute(self: Box<Self>) -> Result<()> {
            Ok(())
        }

        fn should_drop_on_resource_removal(&self, resource: &str) -> bool {
            !self.removes && self.resource == resource
        }

        fn removed_resource(&self) -> Option<&str> {
            self.removes.then_some(self.resource)
        }
    }

    fn op(name: &'static str, resource: &'static str) -> Box<dyn PendingOperation> {
        Box::new(Named {
            name,
            resource,
            removes: false,
        })
    }

    #[test]
    fn test_fifo_order() {
        let queue = OperationQueue::new();
        queue.enqueue(op("a", "x"));
        queue.enqueue(op("b", "y"));
        queue.enqueue(op("c", "z"));
        assert_eq!(queue.len(), 3);

        let order: Vec<&str> = std::iter::from_fn(|| queue.dequeue(Duration::ZERO))
            .map(|o| o.kind())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_dequeue_times_out() {
        let queue = OperationQueue::new();
        let start = Instant::now();
        assert!(queue.dequeue(Duration::from_millis(50)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(OperationQueue::new());
        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                queue.enqueue(op("late", "x"));
            })
        };
        let got = queue.dequeue(Duration::from_secs(5));
        assert_eq!(got.map(|o| o.kind()), Some("late"));
        producer.join().ok();
    }

    #[test]
    fn test_removal_drops_obsolete_operations() {
        let queue = OperationQueue::new();
        queue.enqueue(op("index-a", "a.dart"));
        queue.enqueue(op("index-b", "b.dart"));
        queue.enqueue(op("index-a-again", "a.dart"));
        queue.enqueue(Box::new(Named {
            name: "remove-a",
            resource: "a.dart",
            removes: true,
        }));

        let order: Vec<&str> = std::iter::from_fn(|| queue.dequeue(Duration::ZERO))
            .map(|o| o.kind())
            .collect();
        assert_eq!(order, vec!["index-b", "remove-a"]);
    }
}
