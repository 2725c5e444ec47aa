//! Completion delivery targets
//!
//! Callback-style reads hand their result to a [`CompletionTarget`], which
//! decides where the callback runs: a runtime's blocking pool, the thread
//! that finished the work, or a queue drained by the caller's own thread.

use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// A callback ready to run
pub type Completion = Box<dyn FnOnce() + Send + 'static>;

/// Where completion callbacks run
pub trait CompletionTarget: Send + Sync + 'static {
    fn deliver(&self, completion: Completion);
}

/// Runs callbacks on the runtime's blocking pool
impl CompletionTarget for Handle {
    fn deliver(&self, completion: Completion) {
        self.spawn_blocking(completion);
    }
}

/// Runs callbacks on whichever thread finished the operation
#[derive(Debug, Clone, Copy, Default)]
pub struct Inline;

impl CompletionTarget for Inline {
    fn deliver(&self, completion: Completion) {
        completion();
    }
}

/// Sending half of a [`CompletionQueue`]
#[derive(Clone)]
pub struct QueueTarget {
    tx: mpsc::UnboundedSender<Completion>,
}

impl CompletionTarget for QueueTarget {
    fn deliver(&self, completion: Completion) {
        // A dropped queue means nobody is left to run the callback
        let _ = self.tx.send(completion);
    }
}

/// Callbacks parked until the owning thread runs them
pub struct CompletionQueue {
    rx: mpsc::UnboundedReceiver<Completion>,
}

impl CompletionQueue {
    pub fn new() -> (QueueTarget, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (QueueTarget { tx }, Self { rx })
    }

    /// Run every callback already queued; returns how many ran
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(completion) = self.rx.try_recv() {
            completion();
            ran += 1;
        }
        ran
    }

    /// Wait for the next callback and run it; false once every target is gone
    pub async fn run_next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(completion) => {
                completion();
                true
            }
            None => false,
        }
    }

    /// Blocking variant of [`run_next`](Self::run_next) for non-async threads
    pub fn run_next_blocking(&mut self) -> bool {
        match self.rx.blocking_recv() {
            Some(completion) => {
                completion();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_inline_runs_immediately() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);

        Inline.deliver(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_queue_runs_on_owner_thread() {
        let (target, mut queue) = CompletionQueue::new();
        let owner = thread::current().id();
        let ran_on = Arc::new(parking_lot::Mutex::new(None));

        let r = Arc::clone(&ran_on);
        thread::spawn(move || {
            target.deliver(Box::new(move || {
                *r.lock() = Some(thread::current().id());
            }));
        })
        .join()
        .unwrap();

        assert!(ran_on.lock().is_none(), "nothing runs until drained");
        assert_eq!(queue.run_pending(), 1);
        assert_eq!(*ran_on.lock(), Some(owner));
    }

    #[test]
    fn test_queue_reports_closed() {
        let (target, mut queue) = CompletionQueue::new();
        drop(target);

        assert!(!queue.run_next_blocking());
    }

    #[tokio::test]
    async fn test_handle_target() {
        let (tx, rx) = tokio::sync::oneshot::channel();

        Handle::current().deliver(Box::new(move || {
            let _ = tx.send(42);
        }));

        assert_eq!(rx.await.unwrap(), 42);
    }
}
