//! In-memory delay queue feeding the fleet's workers.
//!
//! Holds every task that still owes a terminal result. Tasks waiting out a
//! retry backoff sit here with a future `ready_at` instead of occupying a
//! worker, so a backed-off task never blocks an execution slot. The queue is
//! drained once every task has reported, which is the workers' signal to
//! stop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::task::{Attempt, Task};

/// A task together with its position in the retry cycle.
pub struct QueuedTask {
    /// The task itself.
    pub task: Task,
    /// 1-based index the next attempt will run under.
    pub next_index: u32,
    /// Earliest moment the task may be dequeued again.
    pub ready_at: Instant,
    /// Attempts already made, oldest first.
    pub attempts: Vec<Attempt>,
}

impl QueuedTask {
    fn new(task: Task) -> Self {
        Self {
            task,
            next_index: 1,
            ready_at: Instant::now(),
            attempts: Vec::new(),
        }
    }

    /// How many attempts have already finished.
    pub fn completed_attempts(&self) -> u32 {
        self.attempts.len() as u32
    }
}

/// Shared queue of tasks awaiting their next attempt.
pub struct TaskQueue {
    inner: Mutex<VecDeque<QueuedTask>>,
    outstanding: AtomicUsize,
    wakeup: Notify,
}

impl TaskQueue {
    /// Builds a queue holding all submitted tasks, every one immediately
    /// ready.
    pub fn new(tasks: Vec<Task>) -> Self {
        let outstanding = AtomicUsize::new(tasks.len());
        let inner = tasks.into_iter().map(QueuedTask::new).collect();
        Self {
            inner: Mutex::new(inner),
            outstanding,
            wakeup: Notify::new(),
        }
    }

    /// Pops the next task whose backoff has elapsed, waiting up to `wait`.
    ///
    /// Returns `None` on timeout or once the queue is drained; callers tell
    /// the two apart through [`is_drained`](Self::is_drained).
    pub async fn dequeue(&self, wait: Duration) -> Option<QueuedTask> {
        let deadline = Instant::now() + wait;
        loop {
            if self.is_drained() {
                return None;
            }

            let earliest = {
                let mut queue = self.inner.lock().await;
                let now = Instant::now();
                if let Some(pos) = queue.iter().position(|item| item.ready_at <= now) {
                    return queue.remove(pos);
                }
                queue.iter().map(|item| item.ready_at).min()
            };

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let wake_at = earliest.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = self.wakeup.notified() => {}
            }
        }
    }

    /// Puts a task back to become ready at its `ready_at`.
    pub async fn requeue(&self, item: QueuedTask) {
        self.inner.lock().await.push_back(item);
        self.wakeup.notify_waiters();
    }

    /// Records that one task reached its terminal result.
    pub fn task_done(&self) {
        // The last decrement wakes idle dequeuers so they observe the drain.
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.wakeup.notify_waiters();
    }

    /// Whether every submitted task has reported a terminal result.
    pub fn is_drained(&self) -> bool {
        self.outstanding.load(Ordering::SeqCst) == 0
    }

    /// Number of tasks still owing a terminal result.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Empties the queue, returning everything still waiting.
    pub async fn drain(&self) -> Vec<QueuedTask> {
        let mut queue = self.inner.lock().await;
        queue.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::AgentConfig;

    fn task(name: &str) -> Task {
        Task::new(name, AgentConfig::new("bench/agent:1", vec!["/run".into()]))
    }

    #[tokio::test]
    async fn test_dequeue_pops_in_submission_order() {
        let first = task("suite/one");
        let second = task("suite/two");
        let ids = [first.id, second.id];
        let queue = TaskQueue::new(vec![first, second]);

        let a = queue.dequeue(Duration::from_secs(1)).await.expect("first");
        let b = queue.dequeue(Duration::from_secs(1)).await.expect("second");
        assert_eq!([a.task.id, b.task.id], ids);
        assert_eq!(queue.outstanding(), 2);
    }

    #[tokio::test]
    async fn test_dequeue_honors_backoff_delay() {
        let queue = TaskQueue::new(vec![task("suite/case")]);
        let mut item = queue.dequeue(Duration::from_secs(1)).await.expect("item");

        item.next_index = 2;
        item.ready_at = Instant::now() + Duration::from_millis(150);
        queue.requeue(item).await;

        assert!(
            queue.dequeue(Duration::from_millis(20)).await.is_none(),
            "task should still be backing off"
        );

        let started = Instant::now();
        let item = queue.dequeue(Duration::from_secs(2)).await.expect("item");
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(item.next_index, 2);
    }

    #[tokio::test]
    async fn test_drained_queue_stops_waiting() {
        let queue = TaskQueue::new(vec![task("suite/case")]);
        let item = queue.dequeue(Duration::from_secs(1)).await.expect("item");
        drop(item);
        queue.task_done();

        assert!(queue.is_drained());
        let started = Instant::now();
        assert!(queue.dequeue(Duration::from_secs(5)).await.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_requeue_wakes_a_waiting_dequeuer() {
        let queue = std::sync::Arc::new(TaskQueue::new(vec![task("suite/case")]));
        let item = queue.dequeue(Duration::from_secs(1)).await.expect("item");

        let q = std::sync::Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            q.requeue(item).await;
        });

        let started = Instant::now();
        let item = queue.dequeue(Duration::from_secs(5)).await;
        assert!(item.is_some());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_drain_returns_leftovers() {
        let queue = TaskQueue::new(vec![task("suite/one"), task("suite/two")]);
        let leftovers = queue.drain().await;
        assert_eq!(leftovers.len(), 2);
        assert!(queue.dequeue(Duration::from_millis(10)).await.is_none());
    }
}
