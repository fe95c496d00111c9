//! Bounded worker pool shared by every channel of a bus.
//!
//! Work is submitted on behalf of a subscriber and lands in that subscriber's
//! lane. A lane is drained by a single task, so one subscriber sees its work
//! in submission order across every channel of the bus, while different
//! subscribers run concurrently. Each unit of work holds a permit while it
//! runs, so at most `capacity` handlers execute at any instant. Closing the
//! pool closes the semaphore: queued and future work is dropped.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use crate::error::{OrchestrationError, Result};
use crate::event::ComponentTag;

#[derive(Default)]
struct LaneState {
    queue: VecDeque<BoxFuture<'static, ()>>,
    draining: bool,
}

/// FIFO of work for one subscriber.
#[derive(Default)]
struct Lane {
    state: Mutex<LaneState>,
}

impl Lane {
    fn lock(&self) -> MutexGuard<'_, LaneState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded pool executing handler dispatches.
#[derive(Clone)]
pub struct WorkerPool {
    /// Permits limiting concurrently running handlers.
    permits: Arc<Semaphore>,
    /// Number of permits the pool was built with.
    capacity: usize,
    lanes: Arc<Mutex<HashMap<ComponentTag, Arc<Lane>>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Creates a pool running at most `size` handlers concurrently.
    ///
    /// # Errors
    /// Returns `OrchestrationError::InvalidPoolSize` if `size` is zero or
    /// exceeds what a semaphore can hold.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 || size > Semaphore::MAX_PERMITS {
            return Err(OrchestrationError::InvalidPoolSize(size));
        }
        Ok(Self {
            permits: Arc::new(Semaphore::new(size)),
            capacity: size,
            lanes: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Queues one unit of work in the lane of `subscriber`.
    ///
    /// Work for the same subscriber runs one at a time in submission order.
    /// Returns `false` if the work was dropped because the pool is closed or
    /// there is no runtime to run it on.
    pub fn submit<F>(&self, subscriber: ComponentTag, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            debug!(%subscriber, "Worker pool closed, dropping dispatch");
            return false;
        }

        let Ok(runtime) = Handle::try_current() else {
            warn!(%subscriber, "No async runtime available, dropping dispatch");
            return false;
        };

        let lane = self.lane(subscriber);
        let start = {
            let mut state = lane.lock();
            state.queue.push_back(work.boxed());
            !std::mem::replace(&mut state.draining, true)
        };

        if start {
            let pool = self.clone();
            runtime.spawn(async move { pool.drain(subscriber, lane).await });
        }
        true
    }

    async fn drain(self, subscriber: ComponentTag, lane: Arc<Lane>) {
        loop {
            let work = {
                let mut state = lane.lock();
                match state.queue.pop_front() {
                    Some(work) => work,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };

            let Ok(_permit) = self.permits.acquire().await else {
                let mut state = lane.lock();
                debug!(%subscriber, dropped = state.queue.len() + 1, "Worker pool closed while queued");
                state.queue.clear();
                state.draining = false;
                return;
            };

            // A panic must not stall the rest of the lane.
            if AssertUnwindSafe(work).catch_unwind().await.is_err() {
                error!(%subscriber, "Queued work panicked");
            }
        }
    }

    fn lane(&self, subscriber: ComponentTag) -> Arc<Lane> {
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(lanes.entry(subscriber).or_default())
    }

    /// Closes the pool. Idempotent.
    pub fn close(&self) {
        if !self.permits.is_closed() {
            debug!(capacity = self.capacity, "Closing worker pool");
        }
        self.permits.close();
    }

    /// Whether the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Maximum number of concurrently running handlers.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    const TAGS: [ComponentTag; 4] =
        [ComponentTag::Ui, ComponentTag::Llm, ComponentTag::ToolManager, ComponentTag::ToolExecutor];

    fn explode() {
        panic!("lane bug");
    }

    #[test]
    fn test_zero_size_is_rejected() {
        assert!(matches!(WorkerPool::new(0), Err(OrchestrationError::InvalidPoolSize(0))));
    }

    #[tokio::test]
    async fn test_submit_runs_work() {
        let pool = WorkerPool::new(2).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(pool.submit(ComponentTag::Ui, async move {
            let _ = tx.send(42);
        }));
        let value = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(value, Some(42));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new(1).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        for tag in TAGS {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let tx = tx.clone();
            pool.submit(tag, async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                let _ = tx.send(());
            });
        }

        for _ in TAGS {
            timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_one_subscriber_sees_submission_order() {
        let pool = WorkerPool::new(4).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for i in 0..500 {
            let tx = tx.clone();
            pool.submit(ComponentTag::Ui, async move {
                if i % 7 == 0 {
                    tokio::task::yield_now().await;
                }
                let _ = tx.send(i);
            });
        }

        let mut seen = Vec::with_capacity(500);
        for _ in 0..500 {
            seen.push(timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap());
        }
        assert_eq!(seen, (0..500).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_panic_does_not_stall_lane() {
        let pool = WorkerPool::new(1).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        pool.submit(ComponentTag::Llm, async { explode() });
        pool.submit(ComponentTag::Llm, async move {
            let _ = tx.send("after");
        });
        assert_eq!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap(), Some("after"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_drops_work() {
        let pool = WorkerPool::new(1).unwrap();
        pool.close();
        pool.close();
        assert!(pool.is_closed());
        assert!(!pool.submit(ComponentTag::Ui, async {}));
    }

    #[test]
    fn test_submit_without_runtime_is_dropped() {
        let pool = WorkerPool::new(1).unwrap();
        assert!(!pool.submit(ComponentTag::Ui, async {}));
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.capacity(), 1);
    }
}
