//! Rate-limited task queue
//!
//! A FIFO drained by a fixed-interval timer: at most one task *starts* per
//! tick, which bounds the start rate without bounding concurrent in-flight
//! work. Used to protect third-party hosts (avatar retrieval) from bursty
//! request patterns.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Default drain interval: 5 task starts per second
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The caller's cancellation signal fired before the task was dequeued
    #[error("task cancelled before start")]
    Cancelled,
    /// The queue was shut down before the task could run
    #[error("queue shut down")]
    ShutDown,
}

/// A queued unit of work. Invoked with `true` if the item was cancelled
/// while still queued (reject without running), `false` to start it.
type QueuedJob = Box<dyn FnOnce(bool) + Send>;

struct QueueItem {
    job: QueuedJob,
    cancel: CancellationToken,
}

/// Fixed-interval FIFO dispatcher
pub struct RateLimitedQueue {
    queue: Mutex<VecDeque<QueueItem>>,
    interval: Duration,
    shutdown: CancellationToken,
}

impl RateLimitedQueue {
    /// Create the queue and start its drain task
    pub fn start(interval: Duration) -> Arc<Self> {
        let queue = Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            interval,
            shutdown: CancellationToken::new(),
        });

        let drain = queue.clone();
        tokio::spawn(async move { drain.drain_loop().await });

        queue
    }

    /// Stop the drain task. Queued items are rejected on the next tick.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Enqueue a task, returning its deferred outcome.
    ///
    /// If `cancel` fires before the task is dequeued the outcome rejects
    /// with [`QueueError::Cancelled`]; once started, cancellation is the
    /// task's own responsibility (it observes the same token).
    pub fn enqueue<F, T>(
        &self,
        cancel: CancellationToken,
        task: F,
    ) -> oneshot::Receiver<Result<T, QueueError>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        let job: QueuedJob = Box::new(move |cancelled| {
            if cancelled {
                let _ = tx.send(Err(QueueError::Cancelled));
                return;
            }
            tokio::spawn(async move {
                let _ = tx.send(Ok(task.await));
            });
        });

        let mut queue = match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.push_back(QueueItem { job, cancel });
        drop(queue);

        rx
    }

    /// Enqueue and await the outcome in one call
    pub async fn run<F, T>(&self, cancel: CancellationToken, task: F) -> Result<T, QueueError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue(cancel, task)
            .await
            .unwrap_or(Err(QueueError::ShutDown))
    }

    /// Queued (not yet started) item count
    pub fn depth(&self) -> usize {
        match self.queue.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    async fn drain_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tick.tick() => self.drain_one(),
            }
        }

        // Reject whatever is still queued
        let remaining: Vec<QueueItem> = {
            let mut queue = match self.queue.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            queue.drain(..).collect()
        };
        for item in remaining {
            (item.job)(true);
        }
    }

    /// Pop and start at most one task. Items cancelled while queued are
    /// removed and rejected without consuming the tick's start budget.
    fn drain_one(&self) {
        let mut rejected = Vec::new();
        let next = {
            let mut queue = match self.queue.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            loop {
                match queue.pop_front() {
                    Some(item) if item.cancel.is_cancelled() => rejected.push(item),
                    other => break other,
                }
            }
        };

        for item in rejected {
            (item.job)(true);
        }
        if let Some(item) = next {
            (item.job)(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn starts_are_spaced_by_at_least_the_interval() {
        let interval = Duration::from_millis(50);
        let queue = RateLimitedQueue::start(interval);

        let starts = Arc::new(Mutex::new(Vec::<Instant>::new()));
        let mut outcomes = Vec::new();

        for _ in 0..3 {
            let starts = starts.clone();
            outcomes.push(queue.enqueue(CancellationToken::new(), async move {
                starts.lock().unwrap().push(Instant::now());
            }));
        }

        for rx in outcomes {
            rx.await.unwrap().unwrap();
        }

        let starts = starts.lock().unwrap();
        assert_eq!(starts.len(), 3);
        for pair in starts.windows(2) {
            let gap = pair[1].duration_since(pair[0]);
            // Small tolerance for timer scheduling jitter
            assert!(gap >= Duration::from_millis(45), "gap was {:?}", gap);
        }

        queue.shutdown();
    }

    #[tokio::test]
    async fn cancel_before_dequeue_rejects_without_running() {
        // Long interval so the first tick fires immediately and the queued
        // items sit waiting long enough to be cancelled.
        let queue = RateLimitedQueue::start(Duration::from_millis(100));

        let first = queue.enqueue(CancellationToken::new(), async { 1 });

        let cancel = CancellationToken::new();
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        let second = queue.enqueue(cancel.clone(), async move {
            *flag.lock().unwrap() = true;
        });

        cancel.cancel();

        assert_eq!(first.await.unwrap(), Ok(1));
        assert_eq!(second.await.unwrap(), Err(QueueError::Cancelled));
        assert!(!*ran.lock().unwrap());

        queue.shutdown();
    }

    #[tokio::test]
    async fn shutdown_rejects_queued_items() {
        let queue = RateLimitedQueue::start(Duration::from_secs(60));
        // May or may not be consumed by the immediate first tick
        let _first = queue.enqueue(CancellationToken::new(), async {});

        tokio::time::sleep(Duration::from_millis(20)).await;
        let waiting = queue.enqueue(CancellationToken::new(), async {});
        queue.shutdown();

        let outcome = waiting.await.unwrap();
        assert!(matches!(outcome, Err(QueueError::Cancelled)));
    }
}
